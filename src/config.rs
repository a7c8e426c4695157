//! Session configuration for codefix
//!
//! A TOML key-value document read once at session start; there is no
//! runtime reconfiguration. The shell decides where the document lives
//! (a `settings.toml` next to the binary, typically) and hands the core
//! either a path or the raw text.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration. Every field has a default, so an empty document
/// (or a missing file handled by the shell) yields a working session with
/// inference disabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub inference: InferenceConfig,
    pub sandbox: SandboxConfig,
    pub verify: VerifyConfig,
}

/// Local inference collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// When false, only rule-derived candidates are synthesized.
    pub enabled: bool,
    /// Base URL of the locally-bound endpoint.
    pub endpoint: String,
    /// Model name passed through to the endpoint.
    pub model: String,
    /// Hard per-request timeout. There is deliberately no "wait forever".
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://127.0.0.1:11434".to_string(),
            model: "qwen2.5-coder:0.5b".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Sandbox executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter used to run candidates.
    pub python: String,
    /// Wall-clock ceiling for one candidate execution.
    pub timeout_secs: u64,
    /// Cap on captured stdout/stderr, counted in characters from the end.
    pub output_tail_chars: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            timeout_secs: 5,
            output_tail_chars: 8_000,
        }
    }
}

/// Verification controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Maximum analyze-synthesize-execute rounds before giving up.
    pub max_attempts: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl Config {
    /// Parse a configuration document. Unknown keys are ignored so a shell
    /// can keep its own settings in the same file.
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("failed to parse configuration document")
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox.timeout_secs)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert!(!config.inference.enabled);
        assert_eq!(config.sandbox.timeout_secs, 5);
        assert_eq!(config.verify.max_attempts, 3);
    }

    #[test]
    fn test_partial_document_keeps_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [inference]
            enabled = true
            model = "qwen2.5-coder:7b"

            [sandbox]
            timeout_secs = 10
            "#,
        )
        .unwrap();
        assert!(config.inference.enabled);
        assert_eq!(config.inference.model, "qwen2.5-coder:7b");
        assert_eq!(config.inference.timeout_secs, 60);
        assert_eq!(config.sandbox.timeout_secs, 10);
        assert_eq!(config.sandbox.python, "python3");
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let config = Config::from_toml_str(
            r#"
            theme = "dark"

            [ui]
            logo = true
            "#,
        )
        .unwrap();
        assert!(!config.inference.enabled);
    }

    #[test]
    fn test_load_reads_a_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[verify]\nmax_attempts = 7\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.verify.max_attempts, 7);

        assert!(Config::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_timeouts_never_default_to_forever() {
        let config = Config::default();
        assert!(config.sandbox_timeout() > Duration::ZERO);
        assert!(config.inference_timeout() > Duration::ZERO);
    }
}
