//! annoflow: batch document annotation across rate-governed LLM backends.
//!
//! Splits large annotation jobs into chunks, distributes them across
//! configured backends with per-backend rate limits, circuit breaking and
//! retries, recovers structured annotations from messy model replies, and
//! checkpoints progress so interrupted batches resume at the first
//! unfinished chunk.

pub mod annotator;
pub mod breaker;
pub mod cli;
pub mod config;
pub mod error;
pub mod parser;
pub mod pipeline;
pub mod progress;
pub mod ratelimit;
pub mod service;
pub mod source;
pub mod storage;

pub use error::{ConfigError, PipelineError, ProgressError, ServiceError, SourceError};
pub use parser::ParseError;
