//! Offline annotation family for rehearsal runs.
//!
//! Produces synthetic annotations from the prompt itself, honoring the
//! backend's throttle settings, so a full batch can be exercised end to end
//! with no credentials and no network. A configured failure fraction injects
//! transient errors to rehearse the retry and breaker paths.

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use tracing::debug;

use crate::error::ServiceError;
use crate::parser::AnnotationUnit;
use crate::service::{AnnotationService, PromptPair, ServiceDescriptor};

pub struct DryRunService {
    descriptor: ServiceDescriptor,
    unit_line: Regex,
}

impl DryRunService {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        debug!(
            backend = %descriptor.backend_id,
            fail_fraction = descriptor.fail_fraction,
            "Dry-run adapter ready"
        );
        Self {
            descriptor,
            // Matches the "S<n>: <text>" lines the prompt builder emits.
            unit_line: Regex::new(r"(?m)^(S\d+):").expect("valid regex literal"),
        }
    }
}

#[async_trait]
impl AnnotationService for DryRunService {
    async fn annotate(&self, prompt: &PromptPair) -> Result<Vec<AnnotationUnit>, ServiceError> {
        let _permit = self.descriptor.throttle().await;

        if self.descriptor.fail_fraction > 0.0 {
            let roll: f64 = rand::thread_rng().gen();
            if roll < self.descriptor.fail_fraction {
                return Err(ServiceError::Api {
                    code: 503,
                    message: "simulated transient failure".to_string(),
                });
            }
        }

        let units: Vec<AnnotationUnit> = self
            .unit_line
            .captures_iter(&prompt.user)
            .map(|caps| AnnotationUnit {
                id: caps[1].to_string(),
                primary: "neutral".to_string(),
                secondary: Vec::new(),
            })
            .collect();
        if units.is_empty() {
            return Err(ServiceError::Config(
                "prompt contains no recognizable sub-unit lines".to_string(),
            ));
        }
        Ok(units)
    }

    async fn health_check(&self) -> (bool, String) {
        (true, "dry-run backend is always reachable".to_string())
    }

    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use std::time::Duration;

    fn descriptor(fail_fraction: f64) -> ServiceDescriptor {
        ServiceDescriptor {
            backend_id: "rehearsal".to_string(),
            family: "dry-run".to_string(),
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
            fail_fraction,
        }
    }

    fn prompt() -> PromptPair {
        PromptPair {
            system: "annotate".to_string(),
            user: "S1: the river bends\nS2: toward an empty field".to_string(),
        }
    }

    #[tokio::test]
    async fn test_units_mirror_prompt_lines() {
        let service = DryRunService::new(descriptor(0.0));
        let units = service.annotate(&prompt()).await.expect("annotate");
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, "S1");
        assert_eq!(units[1].id, "S2");
        assert_eq!(units[0].primary, "neutral");
    }

    #[tokio::test]
    async fn test_always_fails_at_fraction_one() {
        let service = DryRunService::new(descriptor(1.0));
        let err = service.annotate(&prompt()).await.expect_err("must fail");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_prompt_without_units_is_config_error() {
        let service = DryRunService::new(descriptor(0.0));
        let bare = PromptPair {
            system: String::new(),
            user: "nothing structured".to_string(),
        };
        let err = service.annotate(&bare).await.expect_err("must fail");
        assert!(matches!(err, ServiceError::Config(_)));
    }

    #[tokio::test]
    async fn test_health_check_passes() {
        let service = DryRunService::new(descriptor(0.0));
        let (ok, _) = service.health_check().await;
        assert!(ok);
    }
}
