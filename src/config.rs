//! Static gateway configuration: rate-limit rules, service registry and timeouts.
//!
//! Everything here is loaded once at process start. Durations are written with an
//! explicit unit suffix in JSON (`window_secs`, `store_timeout_ms`, ...).
//!
//! ```rust
//! use tollgate::config::GatewayConfig;
//!
//! let config = GatewayConfig::from_json_str(r#"{
//!     "rules": [
//!         { "id": "ml", "scope": "per_user", "limit": 3, "window_secs": 60,
//!           "tier": "authenticated", "paths": ["/ml/predict/*"] }
//!     ],
//!     "services": { "ml": ["http://ml-1:8000", "http://ml-2:8000"] }
//! }"#).unwrap();
//! assert_eq!(config.rules.len(), 1);
//! assert_eq!(config.forward_timeout.as_secs(), 30);
//! ```

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// What a rule counts requests by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    PerIp,
    PerUser,
    PerApiKey,
    Global,
}

impl ScopeKind {
    /// Short label used inside counter keys.
    pub fn key_label(self) -> &'static str {
        match self {
            ScopeKind::PerIp => "ip",
            ScopeKind::PerUser => "user",
            ScopeKind::PerApiKey => "key",
            ScopeKind::Global => "global",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScopeKind::PerIp => "per_ip",
            ScopeKind::PerUser => "per_user",
            ScopeKind::PerApiKey => "per_api_key",
            ScopeKind::Global => "global",
        })
    }
}

/// Caller access tier, resolved by the identity collaborator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AccessTier {
    #[default]
    Public,
    Authenticated,
    Premium,
    Admin,
}

impl fmt::Display for AccessTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessTier::Public => "public",
            AccessTier::Authenticated => "authenticated",
            AccessTier::Premium => "premium",
            AccessTier::Admin => "admin",
        })
    }
}

impl FromStr for AccessTier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(AccessTier::Public),
            "authenticated" => Ok(AccessTier::Authenticated),
            "premium" => Ok(AccessTier::Premium),
            "admin" => Ok(AccessTier::Admin),
            other => Err(ConfigError::UnknownTier(other.to_string())),
        }
    }
}

/// A single quota rule. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    id: String,
    scope: ScopeKind,
    limit: u64,
    #[serde(rename = "window_secs", with = "secs")]
    window: Duration,
    #[serde(default)]
    tier: AccessTier,
    #[serde(default = "match_everything")]
    paths: Vec<String>,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn match_everything() -> Vec<String> {
    vec!["*".to_string()]
}

fn enabled_by_default() -> bool {
    true
}

impl RateLimitRule {
    /// Rule for the `public` tier matching every path. Refine with the builder methods.
    pub fn new(id: impl Into<String>, scope: ScopeKind, limit: u64, window: Duration) -> Self {
        Self {
            id: id.into(),
            scope,
            limit,
            window,
            tier: AccessTier::Public,
            paths: match_everything(),
            enabled: true,
        }
    }

    pub fn for_tier(mut self, tier: AccessTier) -> Self {
        self.tier = tier;
        self
    }

    /// Replace the path patterns. A pattern matches any path starting with its
    /// text minus the `*` wildcards; `"*"` matches everything.
    pub fn with_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scope(&self) -> ScopeKind {
        self.scope
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn tier(&self) -> AccessTier {
        self.tier
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check the rule is usable. Invalid rules are skipped when a rule set is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidRule {
            id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.limit == 0 {
            return Err(invalid("limit must be > 0"));
        }
        if self.window.as_millis() == 0 {
            return Err(invalid("window must be > 0"));
        }
        if self.paths.is_empty() {
            return Err(invalid("at least one path pattern is required"));
        }
        if self.paths.iter().any(|p| p.is_empty()) {
            return Err(invalid("path patterns must not be empty"));
        }
        Ok(())
    }
}

/// Health checker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    #[serde(rename = "interval_secs", with = "secs")]
    pub interval: Duration,
    #[serde(rename = "probe_timeout_ms", with = "millis")]
    pub probe_timeout: Duration,
    pub path: String,
}

impl HealthCheckConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroTimeout { name: "health.interval" });
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout { name: "health.probe_timeout" });
        }
        if !self.path.starts_with('/') {
            return Err(ConfigError::InvalidHealthPath(self.path.clone()));
        }
        Ok(())
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEALTH_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            path: DEFAULT_HEALTH_PATH.to_string(),
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Entries that fail to parse are skipped with a warning.
    #[serde(deserialize_with = "skip_malformed_rules")]
    pub rules: Vec<RateLimitRule>,
    /// Service name to ordered backend addresses.
    pub services: BTreeMap<String, Vec<String>>,
    #[serde(rename = "store_timeout_ms", with = "millis")]
    pub store_timeout: Duration,
    #[serde(rename = "forward_timeout_ms", with = "millis")]
    pub forward_timeout: Duration,
    pub health: HealthCheckConfig,
    pub breaker: CircuitBreakerConfig,
}

fn skip_malformed_rules<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<RateLimitRule>, D::Error> {
    let entries = Vec::<serde_json::Value>::deserialize(d)?;
    let rules = entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let id = entry.get("id").and_then(serde_json::Value::as_str).unwrap_or("").to_string();
            match serde_json::from_value::<RateLimitRule>(entry) {
                Ok(rule) => Some(rule),
                Err(err) => {
                    warn!(target: "tollgate::config", index, rule = %id, error = %err, "malformed rule skipped");
                    None
                }
            }
        })
        .collect();
    Ok(rules)
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            services: BTreeMap::new(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
            health: HealthCheckConfig::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::from_json_str(&raw)
    }

    pub fn with_rule(mut self, rule: RateLimitRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_service<I, A>(mut self, name: impl Into<String>, backends: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.services.insert(name.into(), backends.into_iter().map(Into::into).collect());
        self
    }

    /// Validate timeouts. Rules are not checked here: a bad rule is skipped, not fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("store_timeout", self.store_timeout),
            ("forward_timeout", self.forward_timeout),
        ];
        for (name, value) in checks {
            if value.is_zero() {
                return Err(ConfigError::ZeroTimeout { name });
            }
        }
        self.health.validate()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("rule '{id}' is invalid: {reason}")]
    InvalidRule { id: String, reason: String },
    #[error("{name} must be > 0")]
    ZeroTimeout { name: &'static str },
    #[error("health path must start with '/' (got '{0}')")]
    InvalidHealthPath(String),
    #[error("unknown access tier '{0}'")]
    UnknownTier(String),
    #[error(transparent)]
    Breaker(#[from] CircuitBreakerError),
}

pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(crate::clock::duration_to_millis(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
