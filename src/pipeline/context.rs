//! Shared run context and the orchestrator entry contract.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::annotator::RetryPolicy;
use crate::breaker::BreakerRegistry;
use crate::config::AppConfig;
use crate::service::ServiceRegistry;
use crate::source::SourceSelector;
use crate::storage::{DocumentStore, ResultSink};

/// Which configured backends a run targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSelector {
    /// One backend by identifier.
    One(String),
    /// Every configured backend.
    All,
}

/// Everything a batch run needs, passed explicitly instead of living in
/// process globals. Tests build one with mock members.
pub struct AppContext {
    pub config: AppConfig,
    pub registry: ServiceRegistry,
    pub breakers: BreakerRegistry,
    pub documents: Arc<dyn DocumentStore>,
    pub sink: Arc<dyn ResultSink>,
    /// Opaque taxonomy block inserted into every prompt.
    pub taxonomy: String,
    pub retry: RetryPolicy,
    /// Set to request a graceful stop; checked between chunks.
    pub cancel: Arc<AtomicBool>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        registry: ServiceRegistry,
        documents: Arc<dyn DocumentStore>,
        sink: Arc<dyn ResultSink>,
        taxonomy: impl Into<String>,
    ) -> Self {
        Self {
            config,
            registry,
            breakers: BreakerRegistry::new(),
            documents,
            sink,
            taxonomy: taxonomy.into(),
            retry: RetryPolicy::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Orchestrator entry contract for one batch run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub backends: BackendSelector,
    pub source: SourceSelector,
    /// Item ids per chunk.
    pub chunk_size: usize,
    /// Re-annotate items that already hold a completed record.
    pub force_rerun: bool,
    /// Discard saved progress and start from chunk zero.
    pub fresh_start: bool,
    /// Concurrent items per chunk.
    pub max_workers: usize,
    /// Concurrent pipelines across the batch.
    pub max_pipelines: usize,
}

impl RunOptions {
    pub fn new(backends: BackendSelector, source: SourceSelector) -> Self {
        Self {
            backends,
            source,
            chunk_size: 1000,
            force_rerun: false,
            fresh_start: false,
            max_workers: 8,
            max_pipelines: 2,
        }
    }
}
