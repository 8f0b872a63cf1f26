//! Runtime configuration: parsing, defaults, environment overrides, validation.
//!
//! Everything lives in one TOML file; every section and field is optional and
//! falls back to [`XrefConfig::default`]. Unknown keys are rejected so typos do
//! not silently fall back to defaults.
//!
//! ```toml
//! [database]
//! url = "/var/lib/product_xref/xref.db"
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//!
//! [resolver]
//! fetch_timeout_ms = 10000
//! stale_after_hours = 24
//!
//! [mapping]
//! auto_approve_threshold = 0.95
//!
//! [quality]
//! failed_pct = 5.0
//! staleness_hours = 48.0
//!
//! [name_source.marketplace]
//! base_url = "https://catalog.example.com/api/v1"
//! token_env = "MARKETPLACE_API_TOKEN"
//! ```
//!
//! Entrypoints: [`load_config_str`], [`load_config_path`]. Both apply
//! `DATABASE_URL` and `PRODUCT_XREF_FETCH_TIMEOUT_MS` from the environment and
//! then run [`validate_config`].

use std::{path::Path, time::Duration};

use indexmap::IndexMap;
use name_source::http::HttpSourceConfig;
use serde::{Deserialize, Serialize};
use shared_utils::env::{EnvError, get_env_var_opt, parse_env_var};

use crate::{ledger::SourceKind, quality::QualityThresholds, retry::RetryPolicy};

/// Environment variable that overrides `database.url`.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
/// Environment variable that overrides `resolver.fetch_timeout_ms`.
pub const FETCH_TIMEOUT_ENV: &str = "PRODUCT_XREF_FETCH_TIMEOUT_MS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config TOML")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct XrefConfig {
    pub database: DatabaseCfg,
    pub retry: RetryCfg,
    pub resolver: ResolverCfg,
    pub mapping: MappingCfg,
    pub quality: QualityThresholds,
    /// Live name source per feed.
    pub name_source: IndexMap<SourceKind, NameSourceCfg>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseCfg {
    /// SQLite path, optionally prefixed with `sqlite://`.
    pub url: String,
}

impl Default for DatabaseCfg {
    fn default() -> Self {
        Self {
            url: "product_xref.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryCfg {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverCfg {
    /// Upper bound for one live fetch.
    pub fetch_timeout_ms: u64,
    /// `cache clear-stale` default age.
    pub stale_after_hours: u32,
}

impl Default for ResolverCfg {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 10_000,
            stale_after_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MappingCfg {
    /// Minimum confidence for `pending -> auto`.
    pub auto_approve_threshold: f64,
}

impl Default for MappingCfg {
    fn default() -> Self {
        Self {
            auto_approve_threshold: 0.95,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NameSourceCfg {
    pub base_url: String,
    /// Env var holding the bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_source_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_source_timeout_ms() -> u64 {
    5_000
}

impl XrefConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.resolver.fetch_timeout_ms)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.resolver.stale_after_hours))
    }

    pub fn http_source(&self, kind: SourceKind) -> Option<HttpSourceConfig> {
        self.name_source.get(&kind).map(|c| HttpSourceConfig {
            base_url: c.base_url.clone(),
            token_env: c.token_env.clone(),
            timeout: Duration::from_millis(c.timeout_ms),
        })
    }
}

/// Parse, apply environment overrides, validate.
pub fn load_config_str(s: &str) -> Result<XrefConfig, ConfigError> {
    let mut cfg: XrefConfig = toml::from_str(s)?;
    apply_env_overrides(&mut cfg)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn load_config_path(path: impl AsRef<Path>) -> Result<XrefConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_config_str(&raw)
}

/// Environment values win over the file when set and not blank.
pub fn apply_env_overrides(cfg: &mut XrefConfig) -> Result<(), ConfigError> {
    if let Some(url) = get_env_var_opt(DATABASE_URL_ENV) {
        cfg.database.url = url;
    }
    if let Some(ms) = parse_env_var::<u64>(FETCH_TIMEOUT_ENV)? {
        cfg.resolver.fetch_timeout_ms = ms;
    }
    Ok(())
}

pub fn validate_config(cfg: &XrefConfig) -> Result<(), ConfigError> {
    let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

    if cfg.database.url.trim().is_empty() {
        return invalid("database.url must not be empty".into());
    }
    if cfg.retry.max_retries == 0 {
        return invalid("retry.max_retries must be at least 1".into());
    }
    if cfg.retry.base_delay_ms > cfg.retry.max_delay_ms {
        return invalid(format!(
            "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
            cfg.retry.base_delay_ms, cfg.retry.max_delay_ms
        ));
    }
    if cfg.resolver.fetch_timeout_ms == 0 {
        return invalid("resolver.fetch_timeout_ms must be positive".into());
    }
    let t = cfg.mapping.auto_approve_threshold;
    if !(0.0..=1.0).contains(&t) {
        return invalid(format!("mapping.auto_approve_threshold {t} is outside [0, 1]"));
    }

    let q = &cfg.quality;
    for (name, v) in [
        ("quality.failed_pct", q.failed_pct),
        ("quality.pending_pct", q.pending_pct),
        ("quality.real_name_pct", q.real_name_pct),
    ] {
        if !(0.0..=100.0).contains(&v) {
            return invalid(format!("{name} {v} is outside [0, 100]"));
        }
    }
    if !(q.staleness_hours.is_finite() && q.staleness_hours > 0.0) {
        return invalid("quality.staleness_hours must be positive".into());
    }
    if q.hourly_errors < 0 || q.duplicate_groups < 0 || q.orphaned_mappings < 0 {
        return invalid("quality count thresholds must not be negative".into());
    }

    for (kind, src) in &cfg.name_source {
        if src.base_url.trim().is_empty() {
            return invalid(format!("name_source.{kind}.base_url must not be empty"));
        }
        if src.timeout_ms == 0 {
            return invalid(format!("name_source.{kind}.timeout_ms must be positive"));
        }
    }
    Ok(())
}
