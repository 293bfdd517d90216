//! Fleet configuration and repository manifest.
//!
//! A [`FleetConfig`] is built once per process, validated, and shared
//! read-only (behind `Arc`) by the coordinator, controllers and executor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{Category, ConfigError, ModelConfig, RepositoryDescriptor};

pub const MIN_CHUNK_SIZE: usize = 1;
pub const MAX_CHUNK_SIZE: usize = 20;
pub const DEFAULT_CHUNK_SIZE: usize = 8;

pub const MIN_SLEEP_HOURS: f64 = 0.01;
pub const MAX_SLEEP_HOURS: f64 = 168.0;
pub const DEFAULT_SLEEP_HOURS: f64 = 6.0;

pub const DEFAULT_CACHE_TTL_DAYS: i64 = 30;

/// Timeout, retry and exponential backoff for one kind of external call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (>= 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Limit for a single attempt; exceeding it is a retryable failure.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn analysis() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(15 * 60),
        }
    }

    pub fn clone_ops() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5 * 60),
        }
    }

    pub fn persistence() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
        }
    }

    /// No backoff delay; for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            call_timeout: Duration::from_secs(30),
        }
    }

    /// Delay before attempt `attempt + 1`, given that `attempt` just failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }
}

/// What to do when the cache backend is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    /// Proceed without cache reads or writes.
    FailOpen,
    /// Abort the repository.
    FailClosed,
}

/// Immutable per-process configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub chunk_size: usize,
    pub sleep_interval: Duration,
    /// Bypass the cache for every repo, first pass only.
    pub force: bool,
    /// Re-execute a single step for every repo, first pass only.
    pub force_step: Option<String>,
    pub model: ModelConfig,
    /// Category applied to every repo, ahead of declared categories.
    pub category_override: Option<String>,
    pub cache_ttl: chrono::Duration,
    pub cache_policy: CachePolicy,
    pub analysis_retry: RetryPolicy,
    pub clone_retry: RetryPolicy,
    pub persistence_retry: RetryPolicy,
    /// Directory of `<template>.md` files overlaying the built-in templates.
    pub templates_dir: Option<PathBuf>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            sleep_interval: Duration::from_secs_f64(DEFAULT_SLEEP_HOURS * 3600.0),
            force: false,
            force_step: None,
            model: ModelConfig::default(),
            category_override: None,
            cache_ttl: chrono::Duration::days(DEFAULT_CACHE_TTL_DAYS),
            cache_policy: CachePolicy::FailClosed,
            analysis_retry: RetryPolicy::analysis(),
            clone_retry: RetryPolicy::clone_ops(),
            persistence_retry: RetryPolicy::persistence(),
            templates_dir: None,
        }
    }
}

impl FleetConfig {
    /// Convert an hours value to a sleep interval, enforcing its range.
    pub fn sleep_hours(hours: f64) -> Result<Duration, ConfigError> {
        if !hours.is_finite() || !(MIN_SLEEP_HOURS..=MAX_SLEEP_HOURS).contains(&hours) {
            return Err(ConfigError::OutOfRange {
                field: "sleep_hours",
                value: hours.to_string(),
                min: MIN_SLEEP_HOURS.to_string(),
                max: MAX_SLEEP_HOURS.to_string(),
            });
        }
        Ok(Duration::from_secs_f64(hours * 3600.0))
    }

    /// Check every field. Step names are checked against the registry later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(ConfigError::OutOfRange {
                field: "chunk_size",
                value: self.chunk_size.to_string(),
                min: MIN_CHUNK_SIZE.to_string(),
                max: MAX_CHUNK_SIZE.to_string(),
            });
        }

        let hours = self.sleep_interval.as_secs_f64() / 3600.0;
        // tolerate float noise from the hours -> Duration conversion
        if hours + 1e-9 < MIN_SLEEP_HOURS || hours - 1e-9 > MAX_SLEEP_HOURS {
            return Err(ConfigError::OutOfRange {
                field: "sleep_interval",
                value: format!("{hours}h"),
                min: MIN_SLEEP_HOURS.to_string(),
                max: MAX_SLEEP_HOURS.to_string(),
            });
        }

        if self.model.model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "model",
                reason: "must not be empty".into(),
            });
        }
        if !(ModelConfig::MIN_MAX_TOKENS..=ModelConfig::MAX_MAX_TOKENS)
            .contains(&self.model.max_tokens)
        {
            return Err(ConfigError::OutOfRange {
                field: "max_tokens",
                value: self.model.max_tokens.to_string(),
                min: ModelConfig::MIN_MAX_TOKENS.to_string(),
                max: ModelConfig::MAX_MAX_TOKENS.to_string(),
            });
        }

        if let Some(name) = &self.category_override {
            Category::parse(name)?;
        }

        if self.cache_ttl <= chrono::Duration::zero() {
            return Err(ConfigError::Invalid {
                field: "cache_ttl",
                reason: "must be positive".into(),
            });
        }

        for (field, policy) in [
            ("analysis_retry", &self.analysis_retry),
            ("clone_retry", &self.clone_retry),
            ("persistence_retry", &self.persistence_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "max_attempts must be at least 1".into(),
                });
            }
        }
        Ok(())
    }
}

/// One entry of the repository manifest file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: Option<String>,
    #[serde(rename = "type", default)]
    pub category: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

/// Repository manifest: `{"repositories": {"<name>": {"url", "type", "branch"}}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetManifest {
    pub repositories: BTreeMap<String, ManifestEntry>,
}

impl FleetManifest {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Malformed {
            what: "repository manifest".into(),
            reason: e.to_string(),
        })
    }

    /// Descriptors in name order; entries without a url are skipped.
    pub fn descriptors(&self) -> Vec<RepositoryDescriptor> {
        self.repositories
            .iter()
            .filter_map(|(name, entry)| match entry.url.as_deref().map(str::trim) {
                Some(url) if !url.is_empty() => {
                    let mut d = RepositoryDescriptor::new(name.clone(), url);
                    d.category = entry.category.clone();
                    if let Some(branch) = &entry.branch {
                        d.branch = branch.clone();
                    }
                    Some(d)
                }
                _ => {
                    warn!(repo = %name, "manifest entry has no url, skipping");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = FleetConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.chunk_size, 8);
        assert_eq!(cfg.cache_ttl, chrono::Duration::days(30));
        assert_eq!(cfg.model.max_tokens, 6000);
    }

    #[test]
    fn chunk_size_bounds() {
        let mut cfg = FleetConfig::default();
        cfg.chunk_size = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "chunk_size", .. })
        ));
        cfg.chunk_size = 21;
        assert!(cfg.validate().is_err());
        cfg.chunk_size = 20;
        cfg.validate().unwrap();
    }

    #[test]
    fn sleep_hours_bounds() {
        assert!(FleetConfig::sleep_hours(0.001).is_err());
        assert!(FleetConfig::sleep_hours(169.0).is_err());
        assert!(FleetConfig::sleep_hours(f64::NAN).is_err());
        assert_eq!(
            FleetConfig::sleep_hours(0.5).unwrap(),
            Duration::from_secs(1800)
        );
    }

    #[test]
    fn bad_override_and_tokens_rejected() {
        let mut cfg = FleetConfig::default();
        cfg.category_override = Some("mainframe".into());
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnknownCategory { .. })
        ));

        let mut cfg = FleetConfig::default();
        cfg.model.max_tokens = 50;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            call_timeout: Duration::from_secs(1),
        };
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(400));
        assert_eq!(p.delay_after(4), Duration::from_millis(500));
    }

    #[test]
    fn manifest_skips_entries_without_url() {
        let raw = r#"{
            "repositories": {
                "is-odd": {"url": "https://github.com/jonschlinkert/is-odd"},
                "api": {"url": "https://github.com/acme/api", "type": "backend", "branch": "develop"},
                "ghost": {"type": "frontend"},
                "blank": {"url": "  "}
            }
        }"#;
        let manifest = FleetManifest::parse(raw).unwrap();
        let descriptors = manifest.descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].name, "api");
        assert_eq!(descriptors[0].category.as_deref(), Some("backend"));
        assert_eq!(descriptors[0].branch, "develop");
        assert_eq!(descriptors[1].name, "is-odd");
        assert_eq!(descriptors[1].branch, "main");
    }

    #[test]
    fn malformed_manifest_is_config_error() {
        assert!(matches!(
            FleetManifest::parse("{not json"),
            Err(ConfigError::Malformed { .. })
        ));
    }
}
