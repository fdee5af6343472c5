use crate::capabilities::{ValidatedUrl, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS};
use crate::queue::{DEFAULT_MAX_ENTRIES, DEFAULT_QUEUE_KEY};
use crate::resync::{ClearPolicy, FailurePolicy, ResyncOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONNECTIVITY_BUFFER: usize = 16;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("could not parse configuration: {0}")]
    Parse(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Settings handed to the core by the shell at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub api_base_url: String,
    pub request_timeout_ms: u64,
    pub queue_key: String,
    pub max_queued_reports: usize,
    pub clear_policy: ClearPolicy,
    pub failure_policy: FailurePolicy,
    pub connectivity_buffer: usize,
    pub send_idempotency_key: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            request_timeout_ms: DEFAULT_TIMEOUT_MS,
            queue_key: DEFAULT_QUEUE_KEY.to_string(),
            max_queued_reports: DEFAULT_MAX_ENTRIES,
            clear_policy: ClearPolicy::default(),
            failure_policy: FailurePolicy::default(),
            connectivity_buffer: DEFAULT_CONNECTIVITY_BUFFER,
            send_idempotency_key: true,
        }
    }
}

impl CoreConfig {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    /// Parses and validates a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "api_base_url",
                reason: "is required".into(),
            });
        }
        self.base_url()?;

        if self.request_timeout_ms == 0 || self.request_timeout_ms > MAX_TIMEOUT_MS {
            return Err(ConfigError::Invalid {
                field: "request_timeout_ms",
                reason: format!("must be between 1 and {MAX_TIMEOUT_MS}"),
            });
        }
        if self.queue_key.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "queue_key",
                reason: "must not be empty".into(),
            });
        }
        if self.max_queued_reports == 0 {
            return Err(ConfigError::Invalid {
                field: "max_queued_reports",
                reason: "must be > 0".into(),
            });
        }
        if self.connectivity_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "connectivity_buffer",
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<ValidatedUrl, ConfigError> {
        ValidatedUrl::new(self.api_base_url.clone()).map_err(|e| ConfigError::Invalid {
            field: "api_base_url",
            reason: e.to_string(),
        })
    }

    pub fn resync_options(&self) -> ResyncOptions {
        ResyncOptions {
            clear_policy: self.clear_policy,
            failure_policy: self.failure_policy,
            send_idempotency_key: self.send_idempotency_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::new("https://api.fishguard.example");
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.queue_key, "pending-reports");
        assert_eq!(config.max_queued_reports, 500);
        assert_eq!(config.clear_policy, ClearPolicy::AllOrNothing);
        assert_eq!(config.failure_policy, FailurePolicy::Stop);
        assert!(config.send_idempotency_key);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = CoreConfig::from_json(
            r#"{ "api_base_url": "https://api.fishguard.example", "clear_policy": "per_entry" }"#,
        )
        .unwrap();
        assert_eq!(config.clear_policy, ClearPolicy::PerEntry);
        assert_eq!(config.connectivity_buffer, DEFAULT_CONNECTIVITY_BUFFER);
        assert_eq!(config.resync_options().clear_policy, ClearPolicy::PerEntry);
    }

    #[test]
    fn test_missing_base_url_rejected() {
        let err = CoreConfig::from_json("{}").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "api_base_url",
                ..
            }
        ));
    }

    #[test]
    fn test_bad_values_rejected() {
        let mut config = CoreConfig::new("ftp://nope");
        assert!(config.validate().is_err());

        config.api_base_url = "https://api.fishguard.example".into();
        config.request_timeout_ms = MAX_TIMEOUT_MS + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "request_timeout_ms",
                ..
            })
        ));

        config.request_timeout_ms = 1_000;
        config.max_queued_reports = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            CoreConfig::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            CoreConfig::from_json(r#"{ "clear_policy": "sometimes" }"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
