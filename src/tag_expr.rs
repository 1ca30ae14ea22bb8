//! Boolean expressions over opaque string tags.
//!
//! ```text
//! expr := term (OP term)*
//! term := TAG | '!' (TAG | '(' expr ')') | '(' expr ')'
//! OP   := '&' | '|'
//! ```
//!
//! `&` and `|` share one precedence level and fold left to right, so
//! `a | b & c` reads as `(a | b) & c`. Existing rule sets depend on this;
//! use brackets where conventional precedence is intended. `!` negates
//! exactly one tag or bracketed group.
//!
//! ```rust
//! use std::collections::HashSet;
//! use tallygate::tag_expr::Term;
//!
//! let term: Term = "(mail | calendar) & !guest".parse().unwrap();
//! let tags: HashSet<String> = ["mail".to_string()].into_iter().collect();
//! assert!(term.matches(&tags));
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::hash::BuildHasher;
use std::str::FromStr;

mod lexer;

pub use lexer::TokenKind;
use lexer::{tokenize, Token};

/// Bracket nesting beyond this depth is rejected instead of recursing further.
pub const MAX_NESTING: usize = 128;

/// Errors raised while parsing a tag expression.
///
/// A rule that fails to parse is a configuration mistake; callers are expected
/// to reject it when the configuration is loaded.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty tag expression")]
    Empty,
    #[error("expected {} but found {found} at position {position}", one_of(.expected))]
    Unexpected { expected: Vec<TokenKind>, found: TokenKind, position: usize },
    #[error("brackets nested deeper than {} at position {position}", MAX_NESTING)]
    TooDeep { position: usize },
}

fn one_of(expected: &[TokenKind]) -> String {
    match expected {
        [] => "nothing".to_string(),
        [only] => only.to_string(),
        [init @ .., last] => {
            let head: Vec<String> = init.iter().map(ToString::to_string).collect();
            format!("{} or {}", head.join(", "), last)
        }
    }
}

/// Anything that can answer "does this subject carry tag X".
pub trait TagSet {
    fn contains_tag(&self, tag: &str) -> bool;
}

impl<S: BuildHasher> TagSet for HashSet<String, S> {
    fn contains_tag(&self, tag: &str) -> bool {
        self.contains(tag)
    }
}

impl<S: BuildHasher> TagSet for HashSet<&str, S> {
    fn contains_tag(&self, tag: &str) -> bool {
        self.contains(tag)
    }
}

impl TagSet for BTreeSet<String> {
    fn contains_tag(&self, tag: &str) -> bool {
        self.contains(tag)
    }
}

impl TagSet for [&str] {
    fn contains_tag(&self, tag: &str) -> bool {
        self.iter().any(|t| *t == tag)
    }
}

impl<const N: usize> TagSet for [&str; N] {
    fn contains_tag(&self, tag: &str) -> bool {
        self.as_slice().contains_tag(tag)
    }
}

impl TagSet for [String] {
    fn contains_tag(&self, tag: &str) -> bool {
        self.iter().any(|t| t == tag)
    }
}

impl TagSet for Vec<String> {
    fn contains_tag(&self, tag: &str) -> bool {
        self.as_slice().contains_tag(tag)
    }
}

impl<T: TagSet + ?Sized> TagSet for &T {
    fn contains_tag(&self, tag: &str) -> bool {
        (**self).contains_tag(tag)
    }
}

/// A node of a parsed expression. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    HasTag(String),
    And(Box<Term>, Box<Term>),
    Or(Box<Term>, Box<Term>),
    Negation(Box<Term>),
}

impl Term {
    pub fn tag(name: impl Into<String>) -> Self {
        Term::HasTag(name.into())
    }

    pub fn and(left: Term, right: Term) -> Self {
        Term::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Term, right: Term) -> Self {
        Term::Or(Box::new(left), Box::new(right))
    }

    pub fn negate(term: Term) -> Self {
        Term::Negation(Box::new(term))
    }

    /// Evaluate against a tag set.
    pub fn matches<T: TagSet + ?Sized>(&self, tags: &T) -> bool {
        match self {
            Term::HasTag(name) => tags.contains_tag(name),
            Term::And(left, right) => left.matches(tags) && right.matches(tags),
            Term::Or(left, right) => left.matches(tags) || right.matches(tags),
            Term::Negation(inner) => !inner.matches(tags),
        }
    }

    /// Every tag name the expression refers to.
    pub fn tags(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_tags(&mut out);
        out
    }

    fn collect_tags<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Term::HasTag(name) => {
                out.insert(name.as_str());
            }
            Term::And(left, right) | Term::Or(left, right) => {
                left.collect_tags(out);
                right.collect_tags(out);
            }
            Term::Negation(inner) => inner.collect_tags(out),
        }
    }
}

/// Renders every binary node in brackets, so the output re-parses to an
/// equal tree as long as tag names are valid tags.
impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::HasTag(name) => f.write_str(name),
            Term::And(left, right) => write!(f, "({} & {})", left, right),
            Term::Or(left, right) => write!(f, "({} | {})", left, right),
            Term::Negation(inner) => match inner.as_ref() {
                Term::Negation(_) => write!(f, "!({})", inner),
                _ => write!(f, "!{}", inner),
            },
        }
    }
}

impl FromStr for Term {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)?.ok_or(ParseError::Empty)
    }
}

/// Parse an expression. Empty or whitespace-only input yields `Ok(None)`.
pub fn parse(input: &str) -> Result<Option<Term>, ParseError> {
    let mut parser = Parser { tokens: tokenize(input), pos: 0, depth: 0 };
    if parser.peek().kind == TokenKind::End {
        return Ok(None);
    }
    let term = parser.expr()?;
    parser.expect(TokenKind::End, &[TokenKind::And, TokenKind::Or, TokenKind::End])?;
    Ok(Some(term))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize always ends with End, and End is never consumed
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::End {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind, expected: &[TokenKind]) -> Result<Token, ParseError> {
        let token = self.next();
        if token.kind == kind {
            Ok(token)
        } else {
            Err(unexpected(expected, &token))
        }
    }

    fn expr(&mut self) -> Result<Term, ParseError> {
        let mut left = self.term()?;
        loop {
            match self.peek().kind {
                TokenKind::And => {
                    self.next();
                    left = Term::and(left, self.term()?);
                }
                TokenKind::Or => {
                    self.next();
                    left = Term::or(left, self.term()?);
                }
                _ => return Ok(left),
            }
        }
    }

    fn term(&mut self) -> Result<Term, ParseError> {
        let token = self.next();
        match token.kind {
            TokenKind::Tag => Ok(Term::HasTag(token.text)),
            TokenKind::Not => Ok(Term::negate(self.tag_or_bracket()?)),
            TokenKind::Open => self.bracket(&token),
            _ => Err(unexpected(&[TokenKind::Tag, TokenKind::Not, TokenKind::Open], &token)),
        }
    }

    fn tag_or_bracket(&mut self) -> Result<Term, ParseError> {
        let token = self.next();
        match token.kind {
            TokenKind::Tag => Ok(Term::HasTag(token.text)),
            TokenKind::Open => self.bracket(&token),
            _ => Err(unexpected(&[TokenKind::Tag, TokenKind::Open], &token)),
        }
    }

    /// Rest of a bracketed group whose `(` was just consumed.
    fn bracket(&mut self, open: &Token) -> Result<Term, ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(ParseError::TooDeep { position: open.position });
        }
        self.depth += 1;
        let inner = self.expr()?;
        self.expect(TokenKind::Close, &[TokenKind::And, TokenKind::Or, TokenKind::Close])?;
        self.depth -= 1;
        Ok(inner)
    }
}

fn unexpected(expected: &[TokenKind], found: &Token) -> ParseError {
    ParseError::Unexpected { expected: expected.to_vec(), found: found.kind, position: found.position }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> Term {
        s.parse().unwrap()
    }

    #[test]
    fn binary_operators_fold_left() {
        assert_eq!(t("a | b & c"), Term::and(Term::or(Term::tag("a"), Term::tag("b")), Term::tag("c")));
        assert_eq!(
            t("a & b & c"),
            Term::and(Term::and(Term::tag("a"), Term::tag("b")), Term::tag("c"))
        );
    }

    #[test]
    fn negation_binds_to_one_operand() {
        assert_eq!(t("!a & b"), Term::and(Term::negate(Term::tag("a")), Term::tag("b")));
        assert_eq!(
            t("!(a | b) & c"),
            Term::and(Term::negate(Term::or(Term::tag("a"), Term::tag("b"))), Term::tag("c"))
        );
    }

    #[test]
    fn empty_input_is_none() {
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("   ").unwrap(), None);
        assert_eq!("".parse::<Term>(), Err(ParseError::Empty));
    }

    #[test]
    fn errors_name_expected_and_found() {
        assert_eq!(
            parse("(a & b").unwrap_err(),
            ParseError::Unexpected {
                expected: vec![TokenKind::And, TokenKind::Or, TokenKind::Close],
                found: TokenKind::End,
                position: 6,
            }
        );
        assert_eq!(
            parse("a )").unwrap_err(),
            ParseError::Unexpected {
                expected: vec![TokenKind::And, TokenKind::Or, TokenKind::End],
                found: TokenKind::Close,
                position: 2,
            }
        );
        assert_eq!(
            parse("!!a").unwrap_err(),
            ParseError::Unexpected {
                expected: vec![TokenKind::Tag, TokenKind::Open],
                found: TokenKind::Not,
                position: 1,
            }
        );
        let msg = parse("a &").unwrap_err().to_string();
        assert_eq!(msg, "expected tag, '!' or '(' but found end of input at position 3");
    }

    #[test]
    fn adjacent_tags_without_operator_are_rejected() {
        assert!(matches!(
            parse("a b"),
            Err(ParseError::Unexpected { found: TokenKind::Tag, position: 2, .. })
        ));
    }

    #[test]
    fn nesting_is_bounded() {
        let deep = format!("{}a{}", "(".repeat(MAX_NESTING + 1), ")".repeat(MAX_NESTING + 1));
        assert_eq!(parse(&deep), Err(ParseError::TooDeep { position: MAX_NESTING }));
        let ok = format!("{}a{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert_eq!(parse(&ok).unwrap(), Some(Term::tag("a")));
    }

    #[test]
    fn display_reparses_to_same_tree() {
        for src in ["a", "a | b & c", "!a & b", "(a | b) & !c", "!(x & !y) | z"] {
            let term = t(src);
            assert_eq!(t(&term.to_string()), term, "round trip of {src}");
        }
        let double = Term::negate(Term::negate(Term::tag("a")));
        assert_eq!(double.to_string(), "!(!a)");
        assert_eq!(t(&double.to_string()), double);
    }

    #[test]
    fn tags_lists_every_reference_once() {
        let term = t("a & (b | !a) & c");
        assert_eq!(term.tags().into_iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }
}
