//! Structural parser: source text in, `SourceUnit` out.
//!
//! Uses tree-sitter for the structural tree. Parsers are expensive to
//! create but reusable, so each thread keeps one pre-configured Python
//! parser in thread-local storage.

use crate::rules::{Finding, Severity, Span, SYNTAX_ERROR_RULE};
use std::cell::RefCell;
use tree_sitter::{Node, Parser, Tree};
use uuid::Uuid;

thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // Ignore error here - will be caught at parse time if language fails
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });
}

/// An immutable snippet under analysis: the original text plus its derived
/// structural tree. Patches never mutate a unit; they produce new ones.
#[derive(Debug)]
pub struct SourceUnit {
    /// Analysis session identifier this unit belongs to.
    pub id: Uuid,
    pub text: String,
    /// None when the text did not parse cleanly; the syntax finding below
    /// carries the location instead.
    tree: Option<Tree>,
    syntax_error: Option<Finding>,
}

impl SourceUnit {
    /// Parse source text into a unit. Never fails: invalid syntax yields a
    /// unit with no tree and a single `syntax-error` finding locating the
    /// first parse error.
    pub fn parse(text: &str) -> SourceUnit {
        let parsed = PYTHON_PARSER.with(|p| p.borrow_mut().parse(text, None));

        let Some(tree) = parsed else {
            // The parser itself refused to run (no language set). Treat it
            // like an unlocatable syntax failure rather than aborting.
            return SourceUnit {
                id: Uuid::new_v4(),
                text: text.to_string(),
                tree: None,
                syntax_error: Some(syntax_finding(
                    Span::point(1, 1),
                    "source could not be parsed".to_string(),
                )),
            };
        };

        let syntax_error = first_parse_error(&tree.root_node(), text);
        let tree = if syntax_error.is_none() {
            Some(tree)
        } else {
            None
        };

        SourceUnit {
            id: Uuid::new_v4(),
            text: text.to_string(),
            tree,
            syntax_error,
        }
    }

    /// The structural tree, when the unit parsed cleanly.
    pub fn tree(&self) -> Option<&Tree> {
        self.tree.as_ref()
    }

    /// The syntax finding, when it did not.
    pub fn syntax_error(&self) -> Option<&Finding> {
        self.syntax_error.as_ref()
    }

    pub fn is_parsed(&self) -> bool {
        self.tree.is_some()
    }
}

fn syntax_finding(span: Span, message: String) -> Finding {
    Finding::new(SYNTAX_ERROR_RULE, Severity::Error, span, message)
}

/// Locate the first ERROR or MISSING node in document order.
fn first_parse_error(root: &Node, text: &str) -> Option<Finding> {
    if !root.has_error() {
        return None;
    }

    let mut cursor = root.walk();
    loop {
        let node = cursor.node();

        if node.is_missing() {
            return Some(syntax_finding(
                Span::from_node(&node),
                format!("syntax error: missing '{}'", node.kind()),
            ));
        }
        if node.is_error() {
            let snippet = crate::util::truncate(
                text[node.start_byte()..node.end_byte()].trim(),
                40,
            );
            let message = if snippet.is_empty() {
                "syntax error".to_string()
            } else {
                format!("syntax error near '{}'", snippet)
            };
            return Some(syntax_finding(Span::from_node(&node), message));
        }

        // Only descend into subtrees that actually contain the error.
        if node.has_error() && cursor.goto_first_child() {
            continue;
        }

        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                return Some(syntax_finding(
                    Span::point(1, 1),
                    "syntax error".to_string(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_source_has_tree() {
        let unit = SourceUnit::parse("def f():\n    return 1\n");
        assert!(unit.is_parsed());
        assert!(unit.syntax_error().is_none());
    }

    #[test]
    fn test_unclosed_paren_reports_location() {
        let unit = SourceUnit::parse("for i in range(10): print(i\n");
        assert!(!unit.is_parsed());
        let finding = unit.syntax_error().expect("syntax finding");
        assert_eq!(finding.rule_id, SYNTAX_ERROR_RULE);
        assert_eq!(finding.severity, Severity::Error);
        assert_eq!(finding.span.start_line, 1);
    }

    #[test]
    fn test_units_get_distinct_ids() {
        let a = SourceUnit::parse("x = 1\n");
        let b = SourceUnit::parse("x = 1\n");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_empty_source_parses() {
        let unit = SourceUnit::parse("");
        assert!(unit.is_parsed());
    }
}
