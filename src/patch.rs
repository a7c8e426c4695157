//! Patch synthesizer: findings in, candidates out.
//!
//! Two sources of candidates, in trust order. A rule that declares a
//! deterministic rewrite yields exactly one high-confidence candidate; the
//! local model, when enabled, contributes one more. The rule path never
//! depends on the model path succeeding.

use crate::llm::parse::extract_code_block;
use crate::llm::prompts::build_fix_prompt;
use crate::llm::InferenceClient;
use crate::rules::{Finding, RuleRegistry};
use crate::source::SourceUnit;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Where a candidate came from. Provenance decides its trust tier:
/// rule-derived rewrites are never discarded for "unsafety", while model
/// output is always sandbox-verified before acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// The unmodified input, as run during initial validation.
    Original,
    /// Deterministic rewrite declared by the rule that found the issue.
    Rule,
    /// Extracted from a local inference response.
    Model,
}

impl Provenance {
    pub fn label(&self) -> &'static str {
        match self {
            Provenance::Original => "original",
            Provenance::Rule => "rule",
            Provenance::Model => "model",
        }
    }
}

/// One proposed replacement source text. Candidates are independently
/// executable and never mutate each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub source: String,
    pub provenance: Provenance,
    /// The finding this candidate tries to resolve; None for the original.
    pub finding_id: Option<Uuid>,
    /// Position in the session's generation sequence.
    pub generation: usize,
}

impl Candidate {
    pub fn original(source: &str) -> Self {
        Self {
            source: source.to_string(),
            provenance: Provenance::Original,
            finding_id: None,
            generation: 0,
        }
    }
}

/// Produce candidates for one finding.
///
/// Candidates come back in evaluation order: the rule rewrite first (cheap,
/// trustworthy), then the model's attempt. Any inference failure degrades
/// to "no model candidate" - the session keeps whatever the rules gave it.
pub async fn synthesize(
    unit: &SourceUnit,
    finding: &Finding,
    registry: &RuleRegistry,
    client: Option<&InferenceClient>,
    prior_error: Option<&str>,
    next_generation: usize,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let mut generation = next_generation;

    if let Some(rewritten) = registry.rewrite(unit, finding) {
        debug!(rule = %finding.rule_id, "deterministic rewrite produced a candidate");
        candidates.push(Candidate {
            source: rewritten,
            provenance: Provenance::Rule,
            finding_id: Some(finding.id),
            generation,
        });
        generation += 1;
    }

    if let Some(client) = client {
        let prompt = build_fix_prompt(&unit.text, &finding.describe(), prior_error);
        match client.generate(&prompt).await {
            Ok(response) => match extract_code_block(&response) {
                Some(source) => {
                    debug!(rule = %finding.rule_id, "model produced a candidate");
                    candidates.push(Candidate {
                        source,
                        provenance: Provenance::Model,
                        finding_id: Some(finding.id),
                        generation,
                    });
                }
                None => {
                    warn!(rule = %finding.rule_id, "model response had no code block; no model candidate");
                }
            },
            Err(err) => {
                warn!(rule = %finding.rule_id, error = %err, "inference unavailable; no model candidate");
            }
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleRegistry;

    #[tokio::test]
    async fn test_rule_rewrite_yields_one_rule_candidate() {
        let registry = RuleRegistry::with_builtin_rules();
        let unit = SourceUnit::parse("try:\n    x = 1\nexcept:\n    pass\n");
        let findings = registry.analyze(&unit);
        let finding = findings
            .iter()
            .find(|f| f.rule_id == "bare-except")
            .expect("bare-except finding");

        let candidates = synthesize(&unit, finding, &registry, None, None, 1).await;

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].provenance, Provenance::Rule);
        assert_eq!(candidates[0].finding_id, Some(finding.id));
        assert_eq!(candidates[0].generation, 1);
        assert!(candidates[0].source.contains("except Exception:"));
    }

    #[tokio::test]
    async fn test_no_rewrite_and_no_client_yields_nothing() {
        let registry = RuleRegistry::with_builtin_rules();
        let unit = SourceUnit::parse("while True:\n    x = 1\n");
        let findings = registry.analyze(&unit);
        let finding = findings
            .iter()
            .find(|f| f.rule_id == "unbounded-loop")
            .expect("unbounded-loop finding");

        let candidates = synthesize(&unit, finding, &registry, None, None, 1).await;
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_original_candidate_shape() {
        let candidate = Candidate::original("x = 1\n");
        assert_eq!(candidate.provenance, Provenance::Original);
        assert_eq!(candidate.generation, 0);
        assert!(candidate.finding_id.is_none());
    }
}
