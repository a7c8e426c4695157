//! codefix library crate
//!
//! Implements the analysis-patch-verification loop: parse a Python snippet
//! into a structural tree, flag defects with deterministic rules, synthesize
//! candidate fixes (rule rewrites or a local model), execute candidates in a
//! resource-bounded sandbox, and decide acceptance. The external shell (UI,
//! clipboard importer, file loader) supplies source text and configuration
//! and renders the outcome; nothing in here draws a screen or writes a file
//! outside its own sandbox scratch space.

pub mod config;
pub mod error;
pub mod llm;
pub mod patch;
pub mod rules;
pub mod sandbox;
pub mod source;
pub mod util;
pub mod verify;

pub use config::Config;
pub use error::SessionError;
pub use patch::{Candidate, Provenance};
pub use rules::{Finding, Rule, RuleRegistry, Severity};
pub use sandbox::ExecutionResult;
pub use source::SourceUnit;
pub use util::CancelToken;
pub use verify::{Session, TerminalReason, VerificationOutcome};
