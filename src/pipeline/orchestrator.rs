//! Batch orchestrator: pairs backends with sources, gates on backend
//! health, and drives the per-pipeline chunk loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::annotator::{Annotator, PromptBuilder};
use crate::error::PipelineError;
use crate::pipeline::context::{AppContext, BackendSelector, RunOptions};
use crate::pipeline::worker_pool::process_chunk;
use crate::progress::ProgressStore;
use crate::service::{AnnotationService, ServiceDescriptor};
use crate::source::{pair_backends_with_sources, ChunkReader};

/// Outcome of one (backend, source) pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub backend: String,
    pub source: PathBuf,
    /// Last chunk index already completed when the pipeline started, -1 for
    /// a fresh run.
    pub resumed_from_chunk: i64,
    pub chunks_completed: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub duration_secs: f64,
    /// The pipeline stopped early on a cancellation request; progress for
    /// the finished chunks is saved.
    pub cancelled: bool,
}

/// Aggregate outcome of a batch run.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub pipelines: Vec<PipelineSummary>,
    /// Pipelines that aborted with an error, as (backend, description).
    pub errors: Vec<(String, String)>,
}

impl BatchSummary {
    pub fn total_processed(&self) -> u64 {
        self.pipelines.iter().map(|p| p.processed).sum()
    }

    pub fn total_succeeded(&self) -> u64 {
        self.pipelines.iter().map(|p| p.succeeded).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.pipelines.iter().map(|p| p.failed).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && !self.pipelines.iter().any(|p| p.cancelled)
    }
}

/// Runs batches against a prepared [`AppContext`].
pub struct Orchestrator {
    ctx: Arc<AppContext>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Runs one batch to completion (or cancellation).
    ///
    /// Fails fast on configuration, pairing, or health problems; once
    /// pipelines are running, a failing pipeline is recorded in the summary
    /// while its siblings continue.
    pub async fn run(&self, options: RunOptions) -> Result<BatchSummary, PipelineError> {
        let backend_ids = match &options.backends {
            BackendSelector::One(id) => {
                self.ctx.config.backend(id)?;
                vec![id.clone()]
            }
            BackendSelector::All => self.ctx.config.backend_ids(),
        };

        let pairs = pair_backends_with_sources(&backend_ids, &options.source)?;
        info!(
            pipelines = pairs.len(),
            source = %options.source.describe(),
            "Batch prepared"
        );

        let services = self.build_services(&backend_ids)?;
        self.health_gate(&services).await?;

        let semaphore = Arc::new(Semaphore::new(options.max_pipelines.max(1)));
        let mut handles = Vec::with_capacity(pairs.len());
        for (backend_id, source_path) in pairs {
            let service = Arc::clone(&services[&backend_id]);
            let breaker = self
                .ctx
                .breakers
                .get_or_create(&backend_id, &service.descriptor().breaker_config);
            let annotator = Arc::new(Annotator::new(
                service,
                breaker,
                self.ctx.retry.clone(),
                PromptBuilder::new(&self.ctx.taxonomy),
            ));
            let ctx = Arc::clone(&self.ctx);
            let options = options.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                // Never closed, so acquisition cannot fail.
                let _slot = semaphore.acquire_owned().await.ok();
                let result =
                    run_pipeline(ctx, annotator, &backend_id, &source_path, &options).await;
                (backend_id, result)
            }));
        }

        let mut summary = BatchSummary::default();
        for handle in handles {
            let (backend_id, result) = handle.await?;
            match result {
                Ok(pipeline) => summary.pipelines.push(pipeline),
                Err(e) => {
                    error!(backend = %backend_id, error = %e, "Pipeline aborted");
                    summary.errors.push((backend_id, e.to_string()));
                }
            }
        }

        info!(
            processed = summary.total_processed(),
            succeeded = summary.total_succeeded(),
            failed = summary.total_failed(),
            pipeline_errors = summary.errors.len(),
            "Batch finished"
        );
        Ok(summary)
    }

    /// Builds one adapter per distinct backend. An unconstructible backend
    /// (unknown family, missing credentials) fails the batch before any
    /// pipeline starts.
    fn build_services(
        &self,
        backend_ids: &[String],
    ) -> Result<HashMap<String, Arc<dyn AnnotationService>>, PipelineError> {
        let mut services = HashMap::with_capacity(backend_ids.len());
        for id in backend_ids {
            if services.contains_key(id) {
                continue;
            }
            let config = self.ctx.config.backend(id)?;
            let descriptor = ServiceDescriptor::from_config(id, config, None);
            let service = self.ctx.registry.build(descriptor)?;
            services.insert(id.clone(), service);
        }
        Ok(services)
    }

    /// Probes every backend before starting. A single failing backend
    /// aborts the whole batch: running half a batch against a dead backend
    /// wastes the healthy backends' quota on work that must be repeated.
    async fn health_gate(
        &self,
        services: &HashMap<String, Arc<dyn AnnotationService>>,
    ) -> Result<(), PipelineError> {
        for (id, service) in services {
            let (healthy, detail) = service.health_check().await;
            if !healthy {
                return Err(PipelineError::HealthCheck {
                    backend: id.clone(),
                    detail,
                });
            }
            info!(backend = %id, "Health check passed");
        }
        Ok(())
    }
}

/// One pipeline: sequential chunks from one source against one backend,
/// checkpointed after every chunk.
async fn run_pipeline(
    ctx: Arc<AppContext>,
    annotator: Arc<Annotator>,
    backend_id: &str,
    source_path: &std::path::Path,
    options: &RunOptions,
) -> Result<PipelineSummary, PipelineError> {
    let store = ProgressStore::new(&ctx.config.state_dir, backend_id, source_path)?;
    if options.fresh_start {
        store.clear();
    }
    let mut state = store.load();
    let resumed_from_chunk = state.last_completed_chunk_index;
    if resumed_from_chunk >= 0 {
        info!(
            backend = %backend_id,
            source = %source_path.display(),
            last_completed_chunk = resumed_from_chunk,
            "Resuming from saved progress"
        );
    }

    let mut summary = PipelineSummary {
        backend: backend_id.to_string(),
        source: source_path.to_path_buf(),
        resumed_from_chunk,
        chunks_completed: 0,
        processed: 0,
        succeeded: 0,
        failed: 0,
        skipped: 0,
        duration_secs: 0.0,
        cancelled: false,
    };

    let reader = ChunkReader::open(source_path, options.chunk_size)?;
    let mut saw_chunk = false;
    for chunk in reader {
        let chunk = chunk?;
        saw_chunk = true;

        if ctx.cancel.load(Ordering::SeqCst) {
            info!(
                backend = %backend_id,
                next_chunk = chunk.index,
                "Cancellation requested, stopping before next chunk"
            );
            summary.cancelled = true;
            break;
        }
        if state.is_chunk_done(chunk.index) {
            debug!(backend = %backend_id, chunk = chunk.index, "Chunk already completed, skipping");
            continue;
        }

        let chunk_started = Instant::now();
        let items = ctx.documents.fetch(&chunk.ids)?;
        debug!(
            backend = %backend_id,
            chunk = chunk.index,
            ids = chunk.len(),
            items = items.len(),
            "Processing chunk"
        );
        let outcome = process_chunk(
            Arc::clone(&annotator),
            Arc::clone(&ctx.sink),
            items,
            options.max_workers,
            options.force_rerun,
        )
        .await;

        state.last_completed_chunk_index = chunk.index as i64;
        state.total_processed_count += outcome.processed;
        state.total_success_count += outcome.succeeded;
        state.total_failed_count += outcome.failed;
        state.total_duration_so_far += chunk_started.elapsed().as_secs_f64();
        store.save(&state)?;

        summary.chunks_completed += 1;
        summary.processed += outcome.processed;
        summary.succeeded += outcome.succeeded;
        summary.failed += outcome.failed;
        summary.skipped += outcome.skipped;
        summary.duration_secs += chunk_started.elapsed().as_secs_f64();
    }

    if !saw_chunk {
        warn!(
            backend = %backend_id,
            source = %source_path.display(),
            "Source yielded no ids, nothing to do"
        );
    }

    if !summary.cancelled {
        // A fully processed source invalidates the checkpoint; the next run
        // starts from scratch instead of resuming past the end.
        store.clear();
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::service::ServiceRegistry;
    use crate::source::SourceSelector;
    use crate::storage::{JsonDocumentStore, MemorySink, WorkItem};
    use std::io::Write;

    fn write_ids(dir: &std::path::Path, name: &str, ids: std::ops::RangeInclusive<i64>) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).expect("create");
        for id in ids {
            writeln!(file, "{id}").expect("write");
        }
        path
    }

    fn dry_run_config(state_dir: &std::path::Path) -> AppConfig {
        let yaml = format!(
            "state_dir: {}\nbackends:\n  rehearsal:\n    family: dry-run\n",
            state_dir.display()
        );
        let config: AppConfig = serde_yaml::from_str(&yaml).expect("yaml");
        config
    }

    fn work_items(ids: std::ops::RangeInclusive<i64>) -> Vec<WorkItem> {
        ids.map(|id| WorkItem {
            id,
            title: format!("doc-{id}"),
            author: String::new(),
            units: vec![format!("only unit of {id}")],
        })
        .collect()
    }

    fn context(state_dir: &std::path::Path, sink: Arc<MemorySink>, n: i64) -> AppContext {
        AppContext::new(
            dry_run_config(state_dir),
            ServiceRegistry::with_builtins(),
            Arc::new(JsonDocumentStore::from_items(work_items(1..=n))),
            sink,
            "labels: calm | neutral",
        )
    }

    #[tokio::test]
    async fn test_single_backend_single_source_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = write_ids(dir.path(), "ids.txt", 1..=25);
        let sink = Arc::new(MemorySink::new());
        let orchestrator = Orchestrator::new(context(dir.path(), sink.clone(), 25));

        let mut options = RunOptions::new(
            BackendSelector::One("rehearsal".to_string()),
            SourceSelector::File(source),
        );
        options.chunk_size = 10;
        options.max_workers = 4;

        let summary = orchestrator.run(options).await.expect("run");
        assert!(summary.is_clean());
        assert_eq!(summary.pipelines.len(), 1);
        assert_eq!(summary.total_processed(), 25);
        assert_eq!(summary.total_succeeded(), 25);
        assert_eq!(summary.pipelines[0].chunks_completed, 3);
        assert_eq!(sink.len(), 25);
        // Completed run leaves no checkpoint behind.
        let leftover_state = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("state_"));
        assert!(!leftover_state);
    }

    #[tokio::test]
    async fn test_unknown_backend_fails_before_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = write_ids(dir.path(), "ids.txt", 1..=5);
        let sink = Arc::new(MemorySink::new());
        let orchestrator = Orchestrator::new(context(dir.path(), sink, 5));

        let options = RunOptions::new(
            BackendSelector::One("missing".to_string()),
            SourceSelector::File(source),
        );
        let err = orchestrator.run(options).await.expect_err("must fail");
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[tokio::test]
    async fn test_cancellation_preserves_progress() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = write_ids(dir.path(), "ids.txt", 1..=30);
        let sink = Arc::new(MemorySink::new());
        let ctx = context(dir.path(), sink, 30);
        let cancel = Arc::clone(&ctx.cancel);
        // Cancel before the run: the first chunk check stops the pipeline.
        cancel.store(true, Ordering::SeqCst);
        let orchestrator = Orchestrator::new(ctx);

        let mut options = RunOptions::new(
            BackendSelector::One("rehearsal".to_string()),
            SourceSelector::File(source),
        );
        options.chunk_size = 10;

        let summary = orchestrator.run(options).await.expect("run");
        assert!(summary.pipelines[0].cancelled);
        assert!(!summary.is_clean());
        assert_eq!(summary.total_processed(), 0);
    }

    #[tokio::test]
    async fn test_completed_chunks_are_skipped_on_resume() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = write_ids(dir.path(), "ids.txt", 1..=20);
        let sink = Arc::new(MemorySink::new());
        let ctx = context(dir.path(), sink.clone(), 20);

        // Seed a checkpoint claiming chunk 0 is done.
        let store = ProgressStore::new(
            &ctx.config.state_dir,
            "rehearsal",
            &source,
        )
        .expect("store");
        let mut state = crate::progress::ProgressState::default();
        state.last_completed_chunk_index = 0;
        state.total_processed_count = 10;
        state.total_success_count = 10;
        store.save(&state).expect("save");

        let orchestrator = Orchestrator::new(ctx);
        let mut options = RunOptions::new(
            BackendSelector::One("rehearsal".to_string()),
            SourceSelector::File(source),
        );
        options.chunk_size = 10;

        let summary = orchestrator.run(options).await.expect("run");
        assert_eq!(summary.pipelines[0].resumed_from_chunk, 0);
        // Only the second chunk ran.
        assert_eq!(summary.total_processed(), 10);
        assert_eq!(sink.len(), 10);
        assert!(sink.records().iter().all(|r| r.item_id > 10));
    }

    #[tokio::test]
    async fn test_empty_source_is_a_clean_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("empty.txt");
        std::fs::write(&source, "").expect("write");
        let sink = Arc::new(MemorySink::new());
        let orchestrator = Orchestrator::new(context(dir.path(), sink, 1));

        let options = RunOptions::new(
            BackendSelector::One("rehearsal".to_string()),
            SourceSelector::File(source),
        );
        let summary = orchestrator.run(options).await.expect("run");
        assert!(summary.is_clean());
        assert_eq!(summary.total_processed(), 0);
    }
}
