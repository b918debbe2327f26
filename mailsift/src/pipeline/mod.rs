//! Ingestion pipeline.
//!
//! The driver in [`ingest`] is the only writer of records, results and the
//! watermark during a run; the pool in [`worker_pool`] only calls the
//! analyzer.

pub mod cursor;
pub mod ingest;
pub mod progress;
pub mod result_sink;
pub mod worker_pool;

pub use cursor::{CandidatePlan, CursorStore, ListingMode};
pub use ingest::{IngestionPipeline, PipelineConfig, RunOptions, RunOutcome, identity_key};
pub use progress::{Emitter, RunState, RunStatus};
pub use result_sink::{ApplyOutcome, ResultSink};
pub use worker_pool::{AnalysisWorkerPool, WorkerPoolConfig};
