//! paperwatch - incremental PDF ingestion against a reference library.
//!
//! The [`ingest`] module holds the engine: change detection, directory
//! skip stamps, attachment resolution, and the durable retry queue. State
//! lives in [`paperwatch_db`].

pub mod ingest;

pub use ingest::{
    AttachmentResolver, IngestError, IngestEvent, Ingestor, PaperwatchConfig, Resolution,
    ResolvedItem, ScanSummary,
};
