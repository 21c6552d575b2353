//! Business logic shared by the handlers.

pub mod analysis;
pub mod ingest;
pub mod replay;
