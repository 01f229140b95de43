//! Backend configuration loading and validation.
//!
//! Configuration is a YAML file with one entry per backend identifier plus a
//! few run-wide settings. Everything that can be checked without a network
//! call is validated at load time so a bad entry fails the run before any
//! pipeline starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::breaker::BreakerConfig;
use crate::error::ConfigError;
use crate::ratelimit::RateLimitConfig;

fn default_state_dir() -> PathBuf {
    PathBuf::from(".annoflow_state")
}

fn default_temperature() -> f64 {
    0.1
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout_secs() -> u64 {
    120
}

/// Top-level run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Backends keyed by identifier. Ordered map so iteration is stable.
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
    /// Directory holding progress state files.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

/// Configuration for one annotation backend.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Adapter family, e.g. `openai-compat` or `gemini`.
    pub family: String,
    /// Model name sent on the wire.
    #[serde(default)]
    pub model: String,
    /// API credential. `${VAR}` resolves from the environment at load time.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Override of the family's default endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-request HTTP timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Fixed pause inserted before each request, in milliseconds.
    #[serde(default)]
    pub request_delay_ms: u64,
    #[serde(default)]
    pub rate: RateLimitConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Log full request and response bodies at DEBUG. Secrets stay masked.
    #[serde(default)]
    pub verbose_wire_log: bool,
    /// Simulated failure fraction, honored by the dry-run family only.
    #[serde(default)]
    pub fail_fraction: Option<f64>,
}

impl AppConfig {
    /// Loads and validates configuration from a YAML file.
    ///
    /// `known_families` are the adapter families registered with the service
    /// registry; any backend naming another family is rejected.
    pub fn load(path: &Path, known_families: &[String]) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        let mut config: AppConfig = serde_yaml::from_str(&text)?;
        config.resolve_env();
        config.validate(known_families)?;
        info!(
            path = %path.display(),
            backends = config.backends.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Resolves `${VAR}` references in api keys from the environment. An
    /// unset variable leaves the key absent so validation reports it.
    fn resolve_env(&mut self) {
        for backend in self.backends.values_mut() {
            if let Some(key) = &backend.api_key {
                if let Some(var) = key.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
                    backend.api_key = std::env::var(var).ok().filter(|v| !v.is_empty());
                }
            }
        }
    }

    /// Validates every backend entry. Run-wide errors (no backends at all)
    /// are reported first.
    pub fn validate(&self, known_families: &[String]) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        for (id, backend) in &self.backends {
            backend.validate(id, known_families)?;
        }
        Ok(())
    }

    /// Looks up one backend by identifier.
    pub fn backend(&self, id: &str) -> Result<&BackendConfig, ConfigError> {
        self.backends
            .get(id)
            .ok_or_else(|| ConfigError::BackendNotConfigured(id.to_string()))
    }

    /// All configured backend identifiers, in stable order.
    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}

impl BackendConfig {
    fn validate(&self, id: &str, known_families: &[String]) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidBackend {
            backend: id.to_string(),
            message: message.to_string(),
        };

        if self.family.trim().is_empty() {
            return Err(invalid("family must not be empty"));
        }
        if !known_families.iter().any(|f| f == &self.family) {
            return Err(ConfigError::UnknownFamily {
                backend: id.to_string(),
                family: self.family.clone(),
                known: known_families.join(", "),
            });
        }
        if self.rate.qps.is_some() && self.rate.rpm.is_some() {
            return Err(invalid(
                "qps and rpm are mutually exclusive rate limits; configure one",
            ));
        }
        if let Some(qps) = self.rate.qps {
            if qps <= 0.0 {
                return Err(invalid("qps must be positive"));
            }
        }
        if self.rate.rpm == Some(0) {
            return Err(invalid("rpm must be positive"));
        }
        if self.rate.max_concurrent == Some(0) {
            return Err(invalid("max_concurrent must be positive"));
        }
        if self.timeout_secs == 0 {
            return Err(invalid("timeout_secs must be positive"));
        }
        if let Some(fraction) = self.fail_fraction {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(invalid("fail_fraction must be within [0, 1]"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn families() -> Vec<String> {
        vec!["openai-compat".to_string(), "gemini".to_string()]
    }

    fn load_yaml(yaml: &str) -> Result<AppConfig, ConfigError> {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(yaml.as_bytes()).expect("write");
        AppConfig::load(file.path(), &families())
    }

    #[test]
    fn test_minimal_valid_config() {
        let config = load_yaml(
            r#"
backends:
  deepseek:
    family: openai-compat
    model: deepseek-chat
    api_key: sk-test
"#,
        )
        .expect("load");
        let backend = config.backend("deepseek").expect("backend");
        assert_eq!(backend.family, "openai-compat");
        assert_eq!(backend.temperature, 0.1);
        assert_eq!(backend.max_tokens, 4096);
        assert_eq!(backend.timeout_secs, 120);
        assert_eq!(config.state_dir, PathBuf::from(".annoflow_state"));
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/config.yaml"), &families())
            .expect_err("must fail");
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_no_backends_rejected() {
        let err = load_yaml("backends: {}\n").expect_err("must fail");
        assert!(matches!(err, ConfigError::NoBackends));
    }

    #[test]
    fn test_unknown_family_rejected() {
        let err = load_yaml(
            r#"
backends:
  mystery:
    family: quantum
"#,
        )
        .expect_err("must fail");
        match err {
            ConfigError::UnknownFamily {
                backend,
                family,
                known,
            } => {
                assert_eq!(backend, "mystery");
                assert_eq!(family, "quantum");
                assert!(known.contains("openai-compat"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_qps_and_rpm_together_rejected() {
        let err = load_yaml(
            r#"
backends:
  b:
    family: gemini
    rate:
      qps: 2.0
      rpm: 60
"#,
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_zero_limits_rejected() {
        for rate in ["qps: 0.0", "rpm: 0", "max_concurrent: 0"] {
            let yaml = format!(
                "backends:\n  b:\n    family: gemini\n    rate:\n      {rate}\n"
            );
            assert!(load_yaml(&yaml).is_err(), "{rate} should be rejected");
        }
    }

    #[test]
    fn test_fail_fraction_bounds() {
        let err = load_yaml(
            r#"
backends:
  b:
    family: gemini
    fail_fraction: 1.5
"#,
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("fail_fraction"));
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("ANNOFLOW_TEST_KEY_A", "resolved-secret");
        let config = load_yaml(
            r#"
backends:
  b:
    family: gemini
    api_key: ${ANNOFLOW_TEST_KEY_A}
"#,
        )
        .expect("load");
        assert_eq!(
            config.backend("b").expect("backend").api_key.as_deref(),
            Some("resolved-secret")
        );
    }

    #[test]
    fn test_env_expansion_unset_leaves_none() {
        std::env::remove_var("ANNOFLOW_TEST_KEY_B");
        let config = load_yaml(
            r#"
backends:
  b:
    family: gemini
    api_key: ${ANNOFLOW_TEST_KEY_B}
"#,
        )
        .expect("load");
        assert_eq!(config.backend("b").expect("backend").api_key, None);
    }

    #[test]
    fn test_backend_not_configured() {
        let config = load_yaml(
            r#"
backends:
  b:
    family: gemini
"#,
        )
        .expect("load");
        let err = config.backend("missing").expect_err("must fail");
        assert!(matches!(err, ConfigError::BackendNotConfigured(_)));
    }

    #[test]
    fn test_breaker_and_rate_settings_parse() {
        let config = load_yaml(
            r#"
state_dir: /tmp/anno-state
backends:
  fast:
    family: openai-compat
    api_key: k
    rate:
      qps: 5.0
      max_concurrent: 8
      strategy: leaky_bucket
    breaker:
      fail_max: 3
      reset_timeout_secs: 30
    request_delay_ms: 250
"#,
        )
        .expect("load");
        let backend = config.backend("fast").expect("backend");
        assert_eq!(backend.rate.qps, Some(5.0));
        assert_eq!(backend.rate.max_concurrent, Some(8));
        assert_eq!(backend.breaker.fail_max, 3);
        assert_eq!(backend.request_delay_ms, 250);
        assert_eq!(config.state_dir, PathBuf::from("/tmp/anno-state"));
    }
}
