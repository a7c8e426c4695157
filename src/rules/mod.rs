//! Rule engine: deterministic defect detection over the structural tree.
//!
//! Rules are independent predicates registered into an ordered collection
//! at session start. Each rule walks the full tree and may emit zero or
//! more findings; none of them knows the others exist, so adding a rule
//! never touches an existing one. Output ordering is deterministic: source
//! location, then severity (error first), then registration order.

pub mod builtin;

use crate::source::SourceUnit;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use tracing::warn;
use uuid::Uuid;

/// Rule id attached to the parser's syntax finding.
pub const SYNTAX_ERROR_RULE: &str = "syntax-error";

/// Rule id for findings derived from a sandbox run rather than the tree.
pub const RUNTIME_ERROR_RULE: &str = "runtime-error";

/// Rule id for the diagnostic emitted when a rule itself faults.
pub const RULE_INTERNAL_ERROR: &str = "rule-internal-error";

/// Finding severity. Ordering is `Info < Warning < Error` so sorting by
/// `Reverse(severity)` puts errors first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// A line/column range in the analyzed source. Lines and columns are
/// 1-based, matching what editors and tracebacks show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start_line: usize,
    pub start_col: usize,
    pub end_line: usize,
    pub end_col: usize,
}

impl Span {
    pub fn point(line: usize, col: usize) -> Self {
        Self {
            start_line: line,
            start_col: col,
            end_line: line,
            end_col: col,
        }
    }

    pub fn from_node(node: &tree_sitter::Node) -> Self {
        Self {
            start_line: node.start_position().row + 1,
            start_col: node.start_position().column + 1,
            end_line: node.end_position().row + 1,
            end_col: node.end_position().column + 1,
        }
    }
}

/// One detected issue: located, classified, and read-only after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub rule_id: String,
    pub severity: Severity,
    pub span: Span,
    pub message: String,
    /// Rule-provided extras (rewrite hints, counts). Null when unused.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Finding {
    pub fn new(rule_id: &str, severity: Severity, span: Span, message: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id: rule_id.to_string(),
            severity,
            span,
            message,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_meta(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// One-line description used in reports and inference prompts.
    pub fn describe(&self) -> String {
        format!(
            "[{}] {} (line {}): {}",
            self.severity.label(),
            self.rule_id,
            self.span.start_line,
            self.message
        )
    }
}

/// A single detection rule. Implementations walk the tree and emit
/// findings; optionally they declare a deterministic rewrite for the
/// findings they produced.
pub trait Rule: Send + Sync {
    fn id(&self) -> &'static str;

    /// Inspect the unit and emit findings. An `Err` here is the rule
    /// faulting internally, not a defect in the source; the registry
    /// converts it into a diagnostic finding and keeps going.
    fn check(&self, unit: &SourceUnit) -> anyhow::Result<Vec<Finding>>;

    /// Deterministic fix for one of this rule's findings, as a full
    /// replacement source text. None when the rule has no known rewrite.
    fn rewrite(&self, _unit: &SourceUnit, _finding: &Finding) -> Option<String> {
        None
    }
}

/// Ordered, open-for-extension collection of rules.
pub struct RuleRegistry {
    rules: Vec<Box<dyn Rule>>,
}

impl RuleRegistry {
    /// An empty registry. Mostly useful in tests.
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// The standard rule set, in a fixed registration order.
    pub fn with_builtin_rules() -> Self {
        let mut registry = Self::new();
        for rule in builtin::all() {
            registry.register(rule);
        }
        registry
    }

    pub fn register(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run every rule against the unit. Deterministic and idempotent for
    /// identical input.
    ///
    /// A syntax finding short-circuits the static rules: nothing else can
    /// be said about a tree that does not exist.
    pub fn analyze(&self, unit: &SourceUnit) -> Vec<Finding> {
        if let Some(syntax) = unit.syntax_error() {
            return vec![syntax.clone()];
        }

        let mut findings = Vec::new();
        for rule in &self.rules {
            match rule.check(unit) {
                Ok(mut emitted) => findings.append(&mut emitted),
                Err(err) => {
                    warn!(rule = rule.id(), error = %err, "rule faulted during analysis");
                    findings.push(Finding::new(
                        RULE_INTERNAL_ERROR,
                        Severity::Info,
                        Span::point(1, 1),
                        format!("rule '{}' failed internally: {}", rule.id(), err),
                    ));
                }
            }
        }

        // Stable sort: rules ran in registration order, so location and
        // severity ties keep that order.
        findings.sort_by_key(|f| {
            (
                f.span.start_line,
                f.span.start_col,
                Reverse(f.severity),
            )
        });
        findings
    }

    /// Apply the deterministic rewrite declared by the rule that produced
    /// `finding`, if there is one.
    pub fn rewrite(&self, unit: &SourceUnit, finding: &Finding) -> Option<String> {
        self.rules
            .iter()
            .find(|r| r.id() == finding.rule_id)
            .and_then(|r| r.rewrite(unit, finding))
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::with_builtin_rules()
    }
}

/// Findings worth acting on: warnings and errors. Info findings are
/// reported but never drive the fix loop.
pub fn count_actionable(findings: &[Finding]) -> usize {
    findings
        .iter()
        .filter(|f| f.severity >= Severity::Warning)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FaultyRule;

    impl Rule for FaultyRule {
        fn id(&self) -> &'static str {
            "faulty"
        }

        fn check(&self, _unit: &SourceUnit) -> anyhow::Result<Vec<Finding>> {
            anyhow::bail!("boom")
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_faulty_rule_becomes_diagnostic_finding() {
        let mut registry = RuleRegistry::new();
        registry.register(Box::new(FaultyRule));

        let unit = SourceUnit::parse("x = 1\n");
        let findings = registry.analyze(&unit);

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id, RULE_INTERNAL_ERROR);
        assert!(findings[0].message.contains("faulty"));
    }

    #[test]
    fn test_syntax_error_short_circuits_rules() {
        let mut registry = RuleRegistry::new();
        registry.register(Box::new(FaultyRule));

        let unit = SourceUnit::parse("def f(:\n");
        let findings = registry.analyze(&unit);

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id, SYNTAX_ERROR_RULE);
    }

    #[test]
    fn test_analyze_is_deterministic() {
        let registry = RuleRegistry::with_builtin_rules();
        let source = "import os\ntry:\n    x = unknown_thing\nexcept:\n    pass\n";
        let unit = SourceUnit::parse(source);

        let first = registry.analyze(&unit);
        let second = registry.analyze(&unit);

        let ids: Vec<_> = first.iter().map(|f| (&f.rule_id, f.span)).collect();
        let ids2: Vec<_> = second.iter().map(|f| (&f.rule_id, f.span)).collect();
        assert_eq!(ids, ids2);
    }

    #[test]
    fn test_count_actionable_skips_info() {
        let findings = vec![
            Finding::new("a", Severity::Info, Span::point(1, 1), "i".into()),
            Finding::new("b", Severity::Warning, Span::point(2, 1), "w".into()),
            Finding::new("c", Severity::Error, Span::point(3, 1), "e".into()),
        ];
        assert_eq!(count_actionable(&findings), 2);
    }
}
