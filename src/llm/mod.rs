//! Local inference collaborator.
//!
//! A thin, failure-tolerant wrapper around a locally-bound model endpoint.
//! The synthesizer asks it for one rewrite at a time; everything that can
//! go wrong here (endpoint down, timeout, garbage response) degrades to
//! "no model candidate produced" and never aborts a session.

pub mod client;
pub mod parse;
pub mod prompts;

pub use client::InferenceClient;
