//! Batch orchestration: one pipeline per (backend, source) pair, a bounded
//! worker pool per chunk, durable progress between chunks.
//!
//! # Flow
//!
//! 1. Backends are paired with id sources by the pairing policy.
//! 2. Every backend's health is probed; one failure aborts the whole batch.
//! 3. Pipelines run concurrently under the pipeline ceiling. Inside a
//!    pipeline, chunks are strictly sequential; items inside a chunk run
//!    on the bounded worker pool.
//! 4. Progress is checkpointed after every chunk, so an interrupted run
//!    resumes at the first unfinished chunk.

mod context;
mod orchestrator;
mod worker_pool;

pub use context::{AppContext, BackendSelector, RunOptions};
pub use orchestrator::{BatchSummary, Orchestrator, PipelineSummary};
pub use worker_pool::{process_chunk, ChunkOutcome};
