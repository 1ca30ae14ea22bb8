//! Single-pass tokenizer for tag expressions.

use std::fmt;

/// Kind of a lexical token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Tag,
    And,
    Or,
    Not,
    Open,
    Close,
    End,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TokenKind::Tag => "tag",
            TokenKind::And => "'&'",
            TokenKind::Or => "'|'",
            TokenKind::Not => "'!'",
            TokenKind::Open => "'('",
            TokenKind::Close => "')'",
            TokenKind::End => "end of input",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Tag name; empty for symbols.
    pub text: String,
    /// Character offset of the token's first character.
    pub position: usize,
}

impl Token {
    fn symbol(kind: TokenKind, position: usize) -> Self {
        Self { kind, text: String::new(), position }
    }
}

fn symbol_kind(c: char) -> Option<TokenKind> {
    match c {
        '&' => Some(TokenKind::And),
        '|' => Some(TokenKind::Or),
        '!' => Some(TokenKind::Not),
        '(' => Some(TokenKind::Open),
        ')' => Some(TokenKind::Close),
        _ => None,
    }
}

/// Split `input` into tokens, always terminated by a single `End` token.
///
/// Symbols are single-character tokens even when glued to a tag; whitespace
/// only separates. There is no escaping.
pub(crate) fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut start = 0;
    let mut length = 0;

    for (position, c) in input.chars().enumerate() {
        length = position + 1;
        let symbol = symbol_kind(c);
        if c.is_whitespace() || symbol.is_some() {
            if !current.is_empty() {
                tokens.push(Token { kind: TokenKind::Tag, text: std::mem::take(&mut current), position: start });
            }
            if let Some(kind) = symbol {
                tokens.push(Token::symbol(kind, position));
            }
        } else {
            if current.is_empty() {
                start = position;
            }
            current.push(c);
        }
    }
    if !current.is_empty() {
        tokens.push(Token { kind: TokenKind::Tag, text: current, position: start });
    }
    tokens.push(Token::symbol(TokenKind::End, length));
    tokens
}
