use std::collections::{BTreeSet, HashSet};

use tallygate::tag_expr::{parse, ParseError, TokenKind};
use tallygate::Term;

fn term(src: &str) -> Term {
    src.parse().unwrap_or_else(|e| panic!("{src}: {e}"))
}

fn set(tags: &[&str]) -> HashSet<String> {
    tags.iter().map(|t| t.to_string()).collect()
}

#[test]
fn single_tag_matches_only_itself() {
    let t = term("a");
    assert!(t.matches(&set(&["a"])));
    assert!(!t.matches(&set(&["b"])));
    assert!(!t.matches(&set(&[])));
}

#[test]
fn mixed_operators_fold_left_without_precedence() {
    // (a | b) & c, not a | (b & c)
    let t = term("a | b & c");
    assert!(!t.matches(&set(&["b"])));
    assert!(!t.matches(&set(&["a"])));
    assert!(t.matches(&set(&["a", "c"])));

    // (a & b) | c
    let t = term("a & b | c");
    assert!(t.matches(&set(&["c"])));
}

#[test]
fn negation_applies_to_the_next_operand_only() {
    let t = term("!a & b");
    assert!(t.matches(&set(&["b"])));
    assert!(!t.matches(&set(&["a", "b"])));
    assert!(!t.matches(&set(&[])));
}

#[test]
fn grouping_overrides_the_fold() {
    let t = term("(a | b) & !c");
    assert!(t.matches(&set(&["a"])));
    assert!(!t.matches(&set(&["a", "c"])));
    assert!(t.matches(&set(&["b"])));

    let t = term("a | (b & c)");
    assert!(t.matches(&set(&["a"])));
    assert!(!t.matches(&set(&["b"])));
}

#[test]
fn symbols_need_no_surrounding_whitespace() {
    assert_eq!(term("a&!(b|c)"), term("a & !(b | c)"));
}

#[test]
fn works_with_other_tag_set_shapes() {
    let t = term("mail & !guest");
    let btree: BTreeSet<String> = ["mail".to_string()].into_iter().collect();
    let borrowed: HashSet<&str> = ["mail", "guest"].into_iter().collect();
    let owned = vec!["mail".to_string()];

    assert!(t.matches(&btree));
    assert!(!t.matches(&borrowed));
    assert!(t.matches(&owned));
    assert!(t.matches(&["mail", "drive"]));
    assert!(t.matches(&["mail"][..]));
}

#[test]
fn evaluation_is_repeatable_across_threads() {
    let t = std::sync::Arc::new(term("(x | y) & !z"));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let t = t.clone();
            std::thread::spawn(move || (0..100).all(|_| t.matches(&["x"]) && !t.matches(&["x", "z"])))
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }
}

#[test]
fn malformed_input_reports_expected_and_found() {
    match parse("a & (b | )") {
        Err(ParseError::Unexpected { expected, found, position }) => {
            assert_eq!(expected, vec![TokenKind::Tag, TokenKind::Not, TokenKind::Open]);
            assert_eq!(found, TokenKind::Close);
            assert_eq!(position, 9);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(parse(")").is_err());
    assert!(parse("a &&b").is_err());
    assert!(parse("!").is_err());
}

#[test]
fn blank_input_has_no_term() {
    assert_eq!(parse(" \t\n").unwrap(), None);
}
