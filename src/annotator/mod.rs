//! Per-item annotation: prompt building, governed retries, and consistency
//! checking.
//!
//! The annotator never returns an error to its caller. Every item produces a
//! record, completed or failed, so one poisoned document cannot take down a
//! chunk. The circuit breaker is consulted per attempt and records only the
//! remote call's outcome; a consistency mismatch after a successful call is
//! an item failure, not backend misbehavior.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::error::ServiceError;
use crate::parser::AnnotationUnit;
use crate::service::{AnnotationService, PromptPair};
use crate::storage::{AnnotationRecord, AnnotationStatus, WorkItem};

/// Retry tuning for transient service failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), with up to 20% jitter.
    fn delay_for(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff.powi(retry as i32 - 1);
        let jitter = 1.0 + rand::thread_rng().gen_range(-0.2..0.2);
        Duration::from_secs_f64((base * jitter).max(0.0))
    }
}

/// Renders work items into prompt pairs around an opaque taxonomy block.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    taxonomy: String,
}

impl PromptBuilder {
    pub fn new(taxonomy: impl Into<String>) -> Self {
        Self {
            taxonomy: taxonomy.into(),
        }
    }

    /// Builds the prompt for one item. Sub-units are numbered `S1..Sn` and
    /// the reply must echo those ids.
    pub fn build(&self, item: &WorkItem) -> PromptPair {
        let system = format!(
            "You are an expert document annotator. Annotate every sub-unit of \
             the document using the taxonomy below. Reply with a JSON array; one \
             object per sub-unit with fields \"id\", \"primary\" and \"secondary\" \
             (a possibly empty list). Use exactly the sub-unit ids given.\n\n\
             Taxonomy:\n{}",
            self.taxonomy
        );
        let mut user = String::new();
        if !item.title.is_empty() {
            user.push_str(&format!("Title: {}\n", item.title));
        }
        if !item.author.is_empty() {
            user.push_str(&format!("Author: {}\n", item.author));
        }
        user.push('\n');
        for (i, unit) in item.units.iter().enumerate() {
            user.push_str(&format!("S{}: {}\n", i + 1, unit));
        }
        PromptPair { system, user }
    }
}

/// Expected sub-unit ids for an item with `count` units.
pub fn expected_unit_ids(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("S{i}")).collect()
}

/// Result of comparing returned unit ids against the expected set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsistencyReport {
    /// Expected ids absent from the reply, sorted.
    pub missing: Vec<String>,
    /// Reply ids not in the expected set, sorted.
    pub extra: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

/// Compares the reply's unit ids against `S1..Sn` for an item with
/// `unit_count` sub-units. Duplicates in the reply count as extras.
pub fn check_consistency(unit_count: usize, units: &[AnnotationUnit]) -> ConsistencyReport {
    let expected = expected_unit_ids(unit_count);
    let mut seen: Vec<&str> = Vec::with_capacity(units.len());
    let mut extra: Vec<String> = Vec::new();
    for unit in units {
        if !expected.iter().any(|id| id == &unit.id) || seen.contains(&unit.id.as_str()) {
            extra.push(unit.id.clone());
        } else {
            seen.push(&unit.id);
        }
    }
    let mut missing: Vec<String> = expected
        .iter()
        .filter(|id| !seen.contains(&id.as_str()))
        .cloned()
        .collect();
    missing.sort();
    extra.sort();
    ConsistencyReport { missing, extra }
}

/// Annotates single items against one backend.
pub struct Annotator {
    service: Arc<dyn AnnotationService>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    prompts: PromptBuilder,
}

impl Annotator {
    pub fn new(
        service: Arc<dyn AnnotationService>,
        breaker: Arc<CircuitBreaker>,
        policy: RetryPolicy,
        prompts: PromptBuilder,
    ) -> Self {
        Self {
            service,
            breaker,
            policy,
            prompts,
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.service.descriptor().backend_id
    }

    /// Annotates one item. Always returns a record; failures are folded into
    /// a failed record with the terminal error message.
    pub async fn annotate(&self, item: &WorkItem) -> AnnotationRecord {
        let backend = self.backend_id().to_string();
        if item.units.is_empty() {
            return AnnotationRecord::new(
                item.id,
                &backend,
                AnnotationStatus::Failed,
                None,
                Some("item has no sub-units".to_string()),
            );
        }

        let prompt = self.prompts.build(item);
        match self.call_with_retry(item.id, &prompt).await {
            Ok(units) => self.finish(item, &backend, units),
            Err(e) => {
                warn!(item_id = item.id, backend = %backend, error = %e, "Item failed");
                AnnotationRecord::new(
                    item.id,
                    &backend,
                    AnnotationStatus::Failed,
                    None,
                    Some(e.to_string()),
                )
            }
        }
    }

    /// The governed remote call: breaker gate per attempt, retries limited
    /// to transient errors, exponential backoff with jitter between tries.
    async fn call_with_retry(
        &self,
        item_id: i64,
        prompt: &PromptPair,
    ) -> Result<Vec<AnnotationUnit>, ServiceError> {
        let mut last_error: Option<ServiceError> = None;

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                let delay = self.policy.delay_for(attempt - 1);
                debug!(
                    item_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }

            if let Err(remaining) = self.breaker.try_acquire() {
                return Err(ServiceError::BreakerOpen {
                    backend: self.backend_id().to_string(),
                    reason: format!("retry in {}s", remaining.as_secs()),
                });
            }

            match self.service.annotate(prompt).await {
                Ok(units) => {
                    self.breaker.record_success();
                    return Ok(units);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    if !e.is_transient() {
                        return Err(e);
                    }
                    warn!(
                        item_id,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        error = %e,
                        "Transient failure"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ServiceError::RequestFailed("retries exhausted with no captured error".to_string())
        }))
    }

    /// Consistency check and record shaping after a successful call.
    fn finish(
        &self,
        item: &WorkItem,
        backend: &str,
        units: Vec<AnnotationUnit>,
    ) -> AnnotationRecord {
        let report = check_consistency(item.units.len(), &units);
        if !report.is_consistent() {
            warn!(
                item_id = item.id,
                backend,
                missing = ?report.missing,
                extra = ?report.extra,
                "Annotation ids inconsistent with item sub-units"
            );
            return AnnotationRecord::new(
                item.id,
                backend,
                AnnotationStatus::Failed,
                None,
                Some(format!(
                    "inconsistent annotation ids: missing [{}], extra [{}]",
                    report.missing.join(", "),
                    report.extra.join(", ")
                )),
            );
        }

        match serde_json::to_string(&units) {
            Ok(payload) => AnnotationRecord::new(
                item.id,
                backend,
                AnnotationStatus::Completed,
                Some(payload),
                None,
            ),
            Err(e) => AnnotationRecord::new(
                item.id,
                backend,
                AnnotationStatus::Failed,
                None,
                Some(format!("could not serialize annotations: {e}")),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::service::ServiceDescriptor;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedService {
        descriptor: ServiceDescriptor,
        failures_before_success: u32,
        error_factory: fn() -> ServiceError,
        calls: AtomicU32,
    }

    impl ScriptedService {
        fn new(failures_before_success: u32, error_factory: fn() -> ServiceError) -> Self {
            Self {
                descriptor: ServiceDescriptor {
                    backend_id: "scripted".to_string(),
                    family: "mock".to_string(),
                    model: String::new(),
                    api_key: None,
                    base_url: None,
                    temperature: 0.0,
                    max_tokens: 16,
                    timeout: Duration::from_secs(1),
                    request_delay: Duration::ZERO,
                    breaker_config: BreakerConfig::default(),
                    rate: None,
                    validator: None,
                    verbose_wire_log: false,
                    fail_fraction: 0.0,
                },
                failures_before_success,
                error_factory,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl AnnotationService for ScriptedService {
        async fn annotate(
            &self,
            prompt: &PromptPair,
        ) -> Result<Vec<AnnotationUnit>, ServiceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err((self.error_factory)());
            }
            // Echo one unit per S-line, as a well-behaved backend would.
            Ok(prompt
                .user
                .lines()
                .filter_map(|line| line.split(':').next())
                .filter(|head| head.starts_with('S'))
                .map(|id| AnnotationUnit {
                    id: id.to_string(),
                    primary: "joy".to_string(),
                    secondary: Vec::new(),
                })
                .collect())
        }

        async fn health_check(&self) -> (bool, String) {
            (true, String::new())
        }

        fn descriptor(&self) -> &ServiceDescriptor {
            &self.descriptor
        }
    }

    fn item() -> WorkItem {
        WorkItem {
            id: 7,
            title: "Evening".to_string(),
            author: "anon".to_string(),
            units: vec!["line one".to_string(), "line two".to_string()],
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            backoff: 1.0,
        }
    }

    fn annotator(service: Arc<ScriptedService>, policy: RetryPolicy) -> Annotator {
        let breaker = Arc::new(CircuitBreaker::new("scripted", &BreakerConfig::default()));
        Annotator::new(service, breaker, policy, PromptBuilder::new("taxonomy"))
    }

    #[tokio::test]
    async fn test_success_produces_completed_record() {
        let service = Arc::new(ScriptedService::new(0, || {
            ServiceError::Timeout("t".into())
        }));
        let record = annotator(Arc::clone(&service), fast_policy(3))
            .annotate(&item())
            .await;
        assert_eq!(record.status, AnnotationStatus::Completed);
        let units: Vec<AnnotationUnit> =
            serde_json::from_str(record.payload.as_deref().expect("payload")).expect("json");
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, "S1");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let service = Arc::new(ScriptedService::new(2, || {
            ServiceError::RateLimited("slow down".into())
        }));
        let record = annotator(Arc::clone(&service), fast_policy(3))
            .annotate(&item())
            .await;
        assert_eq!(record.status, AnnotationStatus::Completed);
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_yields_failed_record() {
        let service = Arc::new(ScriptedService::new(10, || {
            ServiceError::Timeout("timeout".into())
        }));
        let record = annotator(Arc::clone(&service), fast_policy(2))
            .annotate(&item())
            .await;
        assert_eq!(record.status, AnnotationStatus::Failed);
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        assert!(record.error_message.expect("message").contains("timed out"));
    }

    #[tokio::test]
    async fn test_non_transient_error_fails_immediately() {
        let service = Arc::new(ScriptedService::new(10, || ServiceError::Api {
            code: 401,
            message: "bad key".into(),
        }));
        let record = annotator(Arc::clone(&service), fast_policy(5))
            .annotate(&item())
            .await;
        assert_eq!(record.status, AnnotationStatus::Failed);
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits() {
        let service = Arc::new(ScriptedService::new(0, || {
            ServiceError::Timeout("t".into())
        }));
        let breaker = Arc::new(CircuitBreaker::new(
            "scripted",
            &BreakerConfig {
                fail_max: 1,
                reset_timeout_secs: 600,
            },
        ));
        breaker.record_failure();
        let annotator = Annotator::new(
            service.clone(),
            breaker,
            fast_policy(3),
            PromptBuilder::new("taxonomy"),
        );
        let record = annotator.annotate(&item()).await;
        assert_eq!(record.status, AnnotationStatus::Failed);
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
        assert!(record
            .error_message
            .expect("message")
            .contains("Circuit breaker open"));
    }

    #[tokio::test]
    async fn test_empty_item_fails_without_calling_backend() {
        let service = Arc::new(ScriptedService::new(0, || {
            ServiceError::Timeout("t".into())
        }));
        let mut empty = item();
        empty.units.clear();
        let record = annotator(Arc::clone(&service), fast_policy(3))
            .annotate(&empty)
            .await;
        assert_eq!(record.status, AnnotationStatus::Failed);
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_consistency_check_reports_sorted_lists() {
        let units = vec![
            AnnotationUnit {
                id: "S3".into(),
                primary: "p".into(),
                secondary: vec![],
            },
            AnnotationUnit {
                id: "S9".into(),
                primary: "p".into(),
                secondary: vec![],
            },
        ];
        let report = check_consistency(3, &units);
        assert_eq!(report.missing, vec!["S1", "S2"]);
        assert_eq!(report.extra, vec!["S9"]);
        assert!(!report.is_consistent());
    }

    #[test]
    fn test_consistency_duplicates_count_as_extra() {
        let units = vec![
            AnnotationUnit {
                id: "S1".into(),
                primary: "p".into(),
                secondary: vec![],
            },
            AnnotationUnit {
                id: "S1".into(),
                primary: "p".into(),
                secondary: vec![],
            },
        ];
        let report = check_consistency(1, &units);
        assert_eq!(report.extra, vec!["S1"]);
        assert!(report.missing.is_empty());
    }

    #[test]
    fn test_prompt_builder_numbers_units() {
        let prompt = PromptBuilder::new("joy | sorrow").build(&item());
        assert!(prompt.system.contains("joy | sorrow"));
        assert!(prompt.user.contains("Title: Evening"));
        assert!(prompt.user.contains("S1: line one"));
        assert!(prompt.user.contains("S2: line two"));
    }

    #[test]
    fn test_expected_unit_ids() {
        assert_eq!(expected_unit_ids(3), vec!["S1", "S2", "S3"]);
        assert!(expected_unit_ids(0).is_empty());
    }
}
