//! Step storage, ingestion and run aggregation for crewtrace.
//!
//! Events flow through [`StepEvent::validate`] into an [`Ingestor`], which
//! merges them into the [`StepStore`] under a per-run lock and recomputes the
//! run aggregate.

pub mod aggregate;
pub mod event;
pub mod ingest;
pub mod merge;
mod store;

pub use event::{StepEvent, StepUpdate, ValidationError};
pub use ingest::{IngestError, IngestOutcome, Ingestor};
pub use merge::{MergeOutcome, StatusChange};
pub use store::{RunQuery, StepStore, StoreError};
