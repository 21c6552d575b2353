//! Core domain types for crewtrace.
//!
//! This crate provides the records shared across the workspace:
//!
//! - [`Step`]: one agent's (or sub-call's) execution record within a run
//! - [`Run`]: the aggregate view over all steps of a run
//! - [`CoordinationFailure`]: an anomaly found by the detector
//!
//! # Example
//!
//! ```rust
//! use crewtrace_core::{SpanType, Status, Step};
//!
//! let mut step = Step::new("step-1", "run-1", "collector");
//! step.status = Status::Success;
//! step.span_type = SpanType::Root;
//!
//! assert!(step.is_terminal());
//! assert!(step.parent_ref.is_none());
//! ```

mod failure;
mod run;
mod step;

pub use failure::{CoordinationFailure, FailureType, Severity};
pub use run::Run;
pub use step::{SpanType, Status, Step, TokenUsage};

use thiserror::Error;

/// Errors raised when decoding closed enumerations from text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Status string outside {running, success, error}.
    #[error("unknown status '{0}'")]
    UnknownStatus(String),

    /// Span type string outside the known set.
    #[error("unknown span type '{0}'")]
    UnknownSpanType(String),
}
