//! Error taxonomy for the verification loop.
//!
//! Almost every failure in the loop is data, not an error: unparseable
//! source becomes a syntax finding, a faulting rule becomes a diagnostic
//! finding, a dead inference endpoint means fewer candidates, and a timed
//! out or crashed candidate is a recorded attempt. The only condition that
//! aborts a whole session is the host being unable to run a child process
//! at all.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal, session-level failures. Everything recoverable lives in the data
/// model (`Finding`, `ExecutionResult`, `TerminalReason`) instead.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The sandbox could not spawn its child process. This is host resource
    /// exhaustion (or a missing interpreter), distinct from any per-candidate
    /// failure.
    #[error("failed to spawn sandbox process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The sandbox scratch directory could not be created or written.
    #[error("failed to prepare sandbox scratch '{path}': {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure modes of the local inference collaborator. These never escape the
/// synthesizer: each one degrades to "no model candidate produced".
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference endpoint unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    #[error("inference request timed out")]
    Timeout,

    #[error("inference endpoint returned HTTP {0}")]
    Http(u16),

    #[error("inference response was malformed: {0}")]
    Malformed(String),

    #[error("inference response contained no fenced code block")]
    NoCodeBlock,
}

impl InferenceError {
    pub fn from_request_error(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            InferenceError::Timeout
        } else {
            InferenceError::Unreachable(err)
        }
    }
}
