//! Trace reconstruction and coordination analysis for crewtrace.
//!
//! Both halves are pure functions of a snapshot of a run's steps:
//!
//! - [`Forest::build`] turns flat steps into one or more span trees
//! - [`Detector::analyze`] runs the coordination analyzers over one tree
//!
//! # Example
//!
//! ```rust
//! use crewtrace_config::DetectorPolicy;
//! use crewtrace_core::{Status, Step};
//! use crewtrace_engine::{Detector, Forest};
//!
//! let mut root = Step::new("a", "run-1", "collector");
//! root.status = Status::Success;
//! let mut child = Step::new("b", "run-1", "writer");
//! child.parent_ref = Some("collector".into());
//! child.status = Status::Success;
//!
//! let forest = Forest::build(&[root, child]);
//! let trace = forest.primary().unwrap();
//! assert_eq!(trace.len(), 2);
//!
//! let report = Detector::new(DetectorPolicy::default()).analyze(trace);
//! assert_eq!(report.summary.health_score, 100);
//! ```

pub mod detector;
pub mod tree;

pub use detector::{
    health_score, step_flags, Analyzer, AnalyzerError, CoordinationReport, Detector, HealthSummary,
};
pub use tree::{Forest, SpanNode, Trace, TraceIssue};
