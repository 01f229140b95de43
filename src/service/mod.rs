//! Remote annotation service adapters.
//!
//! An [`AnnotationService`] turns a built prompt into validated annotation
//! units by calling one remote backend family. Adapters are constructed
//! through the [`ServiceRegistry`], which maps a family string to a
//! constructor; new families (including test mocks) are installed by
//! registering a constructor, never by editing a match statement.

pub mod dry_run;
pub mod gemini;
pub mod openai;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::breaker::BreakerConfig;
use crate::config::BackendConfig;
use crate::error::ServiceError;
use crate::parser::{parse_annotations_with, AnnotationUnit, CustomValidator};
use crate::ratelimit::{CompositeController, RatePermit};

pub use dry_run::DryRunService;
pub use gemini::GeminiService;
pub use openai::OpenAiCompatService;

/// System and user halves of one annotation prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    pub system: String,
    pub user: String,
}

/// Stream of raw content fragments from a streaming annotation call.
pub type ContentStream = Pin<Box<dyn Stream<Item = Result<String, ServiceError>> + Send>>;

/// Everything an adapter needs to talk to one configured backend.
///
/// Built by the registry from the backend's configuration entry; the rate
/// controller is shared by every caller of the same backend.
#[derive(Clone)]
pub struct ServiceDescriptor {
    pub backend_id: String,
    pub family: String,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub request_delay: Duration,
    pub breaker_config: BreakerConfig,
    pub rate: Option<Arc<CompositeController>>,
    pub validator: Option<Arc<dyn CustomValidator>>,
    pub verbose_wire_log: bool,
    pub fail_fraction: f64,
}

impl ServiceDescriptor {
    /// Builds the descriptor for `backend_id` from its configuration entry,
    /// wiring a rate controller when any limit is set.
    pub fn from_config(
        backend_id: &str,
        config: &BackendConfig,
        validator: Option<Arc<dyn CustomValidator>>,
    ) -> Self {
        let rate = config
            .rate
            .is_active()
            .then(|| Arc::new(CompositeController::new(backend_id, &config.rate)));
        Self {
            backend_id: backend_id.to_string(),
            family: config.family.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
            request_delay: Duration::from_millis(config.request_delay_ms),
            breaker_config: config.breaker.clone(),
            rate,
            validator,
            verbose_wire_log: config.verbose_wire_log,
            fail_fraction: config.fail_fraction.unwrap_or(0.0),
        }
    }

    /// Pauses for the configured inter-request delay, then waits out every
    /// rate limit. The returned permit holds the concurrency slot.
    pub async fn throttle(&self) -> Option<RatePermit> {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
        match &self.rate {
            Some(controller) => Some(controller.acquire().await),
            None => None,
        }
    }

    /// Required api key, or a configuration error naming the backend.
    pub fn require_api_key(&self) -> Result<&str, ServiceError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ServiceError::Config(format!(
                    "backend '{}' has no api_key configured",
                    self.backend_id
                ))
            })
    }

    /// Api key with the middle elided, safe for logs.
    pub fn api_key_masked(&self) -> String {
        match self.api_key.as_deref() {
            None => "<none>".to_string(),
            Some(key) if key.len() <= 8 => "*".repeat(key.len()),
            Some(key) => format!("{}...{}", &key[..4], &key[key.len() - 4..]),
        }
    }

    /// Runs the recovery parser plus the optional custom validation pass
    /// over raw response content.
    pub fn recover_units(&self, content: &str) -> Result<Vec<AnnotationUnit>, ServiceError> {
        let validator = self.validator.as_deref();
        Ok(parse_annotations_with(content, validator)?)
    }
}

/// One remote annotation backend.
///
/// `annotate` performs a single call with no retry of its own; retry and
/// breaker policy live in the annotator so every family is governed the
/// same way.
#[async_trait]
pub trait AnnotationService: Send + Sync {
    /// Sends one prompt and returns validated annotation units.
    async fn annotate(&self, prompt: &PromptPair) -> Result<Vec<AnnotationUnit>, ServiceError>;

    /// Cheap reachability probe. Returns pass/fail plus operator detail.
    async fn health_check(&self) -> (bool, String);

    /// Streaming variant yielding raw content fragments. Families without
    /// wire streaming report [`ServiceError::StreamingUnsupported`].
    async fn annotate_stream(&self, _prompt: &PromptPair) -> Result<ContentStream, ServiceError> {
        Err(ServiceError::StreamingUnsupported(
            self.descriptor().family.clone(),
        ))
    }

    fn descriptor(&self) -> &ServiceDescriptor;
}

/// Constructor installed in the registry for one family.
pub type ServiceCtor =
    Arc<dyn Fn(ServiceDescriptor) -> Result<Arc<dyn AnnotationService>, ServiceError> + Send + Sync>;

/// Maps family strings to adapter constructors.
pub struct ServiceRegistry {
    ctors: HashMap<String, ServiceCtor>,
}

impl ServiceRegistry {
    /// Empty registry, for tests that install only their own families.
    pub fn empty() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// Registry with the built-in families installed.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("openai-compat", |desc| {
            Ok(Arc::new(OpenAiCompatService::new(desc)?) as Arc<dyn AnnotationService>)
        });
        registry.register("gemini", |desc| {
            Ok(Arc::new(GeminiService::new(desc)?) as Arc<dyn AnnotationService>)
        });
        registry.register("dry-run", |desc| {
            Ok(Arc::new(DryRunService::new(desc)) as Arc<dyn AnnotationService>)
        });
        registry
    }

    /// Installs or replaces the constructor for `family`.
    pub fn register<F>(&mut self, family: &str, ctor: F)
    where
        F: Fn(ServiceDescriptor) -> Result<Arc<dyn AnnotationService>, ServiceError>
            + Send
            + Sync
            + 'static,
    {
        self.ctors.insert(family.to_string(), Arc::new(ctor));
    }

    /// Registered family names, sorted for stable error messages.
    pub fn families(&self) -> Vec<String> {
        let mut families: Vec<String> = self.ctors.keys().cloned().collect();
        families.sort();
        families
    }

    /// Constructs the adapter described by `descriptor`.
    pub fn build(
        &self,
        descriptor: ServiceDescriptor,
    ) -> Result<Arc<dyn AnnotationService>, ServiceError> {
        let ctor = self.ctors.get(&descriptor.family).ok_or_else(|| {
            ServiceError::Config(format!(
                "no adapter registered for family '{}' (known: {})",
                descriptor.family,
                self.families().join(", ")
            ))
        })?;
        ctor(descriptor)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(family: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            backend_id: "test".to_string(),
            family: family.to_string(),
            model: "m".to_string(),
            api_key: Some("sk-aaaabbbbccccdddd".to_string()),
            base_url: None,
            temperature: 0.1,
            max_tokens: 256,
            timeout: Duration::from_secs(5),
            request_delay: Duration::ZERO,
            breaker_config: BreakerConfig::default(),
            rate: None,
            validator: None,
            verbose_wire_log: false,
            fail_fraction: 0.0,
        }
    }

    #[test]
    fn test_builtin_families() {
        let registry = ServiceRegistry::with_builtins();
        assert_eq!(registry.families(), vec!["dry-run", "gemini", "openai-compat"]);
    }

    #[test]
    fn test_build_unknown_family_fails() {
        let registry = ServiceRegistry::empty();
        let err = registry
            .build(descriptor("nope"))
            .map(|_| ())
            .expect_err("must fail");
        assert!(matches!(err, ServiceError::Config(_)));
    }

    #[test]
    fn test_build_builtin_adapters() {
        let registry = ServiceRegistry::with_builtins();
        for family in ["openai-compat", "gemini", "dry-run"] {
            let service = registry.build(descriptor(family)).expect(family);
            assert_eq!(service.descriptor().family, family);
        }
    }

    #[test]
    fn test_missing_api_key_rejected_at_construction() {
        let registry = ServiceRegistry::with_builtins();
        let mut desc = descriptor("openai-compat");
        desc.api_key = None;
        let err = registry.build(desc).map(|_| ()).expect_err("must fail");
        assert!(matches!(err, ServiceError::Config(_)));
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn test_api_key_masking() {
        let desc = descriptor("dry-run");
        let masked = desc.api_key_masked();
        assert_eq!(masked, "sk-a...dddd");

        let mut short = descriptor("dry-run");
        short.api_key = Some("tiny".to_string());
        assert_eq!(short.api_key_masked(), "****");

        let mut none = descriptor("dry-run");
        none.api_key = None;
        assert_eq!(none.api_key_masked(), "<none>");
    }

    #[tokio::test]
    async fn test_default_stream_is_unsupported() {
        let registry = ServiceRegistry::with_builtins();
        let service = registry.build(descriptor("dry-run")).expect("build");
        let prompt = PromptPair {
            system: "s".to_string(),
            user: "u".to_string(),
        };
        let err = service
            .annotate_stream(&prompt)
            .await
            .map(|_| ())
            .expect_err("dry-run has no streaming");
        assert!(matches!(err, ServiceError::StreamingUnsupported(_)));
    }

    #[test]
    fn test_registry_register_replaces() {
        let mut registry = ServiceRegistry::empty();
        registry.register("dry-run", |desc| {
            Ok(Arc::new(DryRunService::new(desc)) as Arc<dyn AnnotationService>)
        });
        assert_eq!(registry.families(), vec!["dry-run"]);
    }
}
