//! Startup configuration for the limiter.
//!
//! Everything configurable is collected into one [LimiterConfig] value,
//! deserialized from TOML and validated eagerly: a malformed policy, CIDR
//! range, or threshold is a [ConfigError] at process start, never a surprise
//! at request time.

use crate::health::HealthGateConfig;
use crate::identity::TrustedProxies;
use crate::policy::{Policy, PolicyCatalog, RoutePattern, Scope};
use actix_web::http::Method;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Fatal configuration defects, surfaced at startup only.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse limiter configuration: {0}")]
    Parse(
        #[source]
        #[from]
        toml::de::Error,
    ),
    #[error("policy name must not be empty")]
    EmptyPolicyName,
    #[error("duplicate policy name: {0:?}")]
    DuplicatePolicy(String),
    #[error("policy {policy:?}: window must be greater than zero")]
    ZeroWindow { policy: String },
    #[error("policy {policy:?}: max_requests must be greater than zero")]
    ZeroQuota { policy: String },
    #[error("policy {policy:?}: at least one route matcher is required")]
    NoRoutes { policy: String },
    #[error("policy {policy:?}: invalid route pattern {pattern:?}")]
    InvalidRoutePattern { policy: String, pattern: String },
    #[error("policy {policy:?}: invalid HTTP method {method:?}")]
    InvalidMethod { policy: String, method: String },
    #[error("invalid trusted proxy entry {entry:?} (expected an IP address or CIDR range)")]
    InvalidTrustedProxy { entry: String },
    #[error("health gate failure_threshold must be greater than zero")]
    ZeroFailureThreshold,
    #[error("health gate probe_interval must be greater than zero")]
    ZeroProbeInterval,
    #[error("store timeout_ms must be greater than zero")]
    ZeroStoreTimeout,
    #[error("failed to connect to the distributed store: {0}")]
    StoreConnection(#[source] redis::RedisError),
}

/// Declarative definition of one [Policy].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub name: String,
    pub window_ms: u64,
    pub max_requests: u64,
    pub scope: Scope,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub path: String,
    /// Empty means all methods.
    #[serde(default)]
    pub methods: Vec<String>,
}

/// Connection parameters for the distributed store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Redis connection URL; absent means no distributed tier.
    pub url: Option<String>,
    /// Namespace prefix applied to every rate limit key.
    pub key_prefix: Option<String>,
    /// Hard timeout for the single Redis round-trip per request.
    pub timeout_ms: u64,
    /// Sweep interval for the in-memory fallback store; zero disables the
    /// sweep.
    pub gc_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: None,
            timeout_ms: 50,
            gc_interval_secs: crate::store::memory::DEFAULT_GC_INTERVAL_SECONDS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Consecutive failures before the distributed store is suspected down.
    pub failure_threshold: u32,
    /// Failures only count as consecutive within this span.
    pub failure_window_ms: u64,
    /// While suspected, one in this many requests probes the store.
    pub probe_interval: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        let defaults = HealthGateConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            failure_window_ms: defaults.failure_window.as_millis() as u64,
            probe_interval: defaults.probe_interval,
        }
    }
}

/// The complete, immutable configuration surface of the limiter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimiterConfig {
    /// Routes excluded from all policies (exact, or prefix when ending in `*`).
    pub exempt: Vec<String>,
    /// Proxies whose forwarded-for headers may be trusted.
    pub trusted_proxies: Vec<String>,
    #[serde(rename = "policy")]
    pub policies: Vec<PolicyConfig>,
    pub store: StoreConfig,
    pub health: HealthConfig,
}

impl LimiterConfig {
    /// Parses and validates a TOML document in one step.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: LimiterConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every part of the configuration, returning the first defect.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.catalog()?;
        self.trusted_proxies()?;
        self.health_gate()?;
        if self.store.timeout_ms == 0 {
            return Err(ConfigError::ZeroStoreTimeout);
        }
        Ok(())
    }

    /// Builds the validated policy catalog.
    pub fn catalog(&self) -> Result<PolicyCatalog, ConfigError> {
        let mut policies = Vec::with_capacity(self.policies.len());
        for policy in &self.policies {
            policies.push(build_policy(policy)?);
        }
        PolicyCatalog::new(policies, self.exempt.clone())
    }

    /// Builds the validated trusted proxy set.
    pub fn trusted_proxies(&self) -> Result<TrustedProxies, ConfigError> {
        TrustedProxies::new(&self.trusted_proxies)
    }

    /// Builds the validated health gate thresholds.
    pub fn health_gate(&self) -> Result<HealthGateConfig, ConfigError> {
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        if self.health.probe_interval == 0 {
            return Err(ConfigError::ZeroProbeInterval);
        }
        Ok(HealthGateConfig {
            failure_threshold: self.health.failure_threshold,
            failure_window: Duration::from_millis(self.health.failure_window_ms),
            probe_interval: self.health.probe_interval,
        })
    }

    /// The hard timeout for distributed store calls.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    /// The sweep interval for the in-memory fallback store, if enabled.
    pub fn gc_interval(&self) -> Option<Duration> {
        (self.store.gc_interval_secs > 0).then(|| Duration::from_secs(self.store.gc_interval_secs))
    }
}

fn build_policy(config: &PolicyConfig) -> Result<Policy, ConfigError> {
    let mut routes = Vec::with_capacity(config.routes.len());
    for route in &config.routes {
        let mut methods = Vec::with_capacity(route.methods.len());
        for method in &route.methods {
            let parsed = Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(
                |_| ConfigError::InvalidMethod {
                    policy: config.name.clone(),
                    method: method.clone(),
                },
            )?;
            methods.push(parsed);
        }
        let pattern = RoutePattern::new(&route.path, methods).map_err(|_| {
            ConfigError::InvalidRoutePattern {
                policy: config.name.clone(),
                pattern: route.path.clone(),
            }
        })?;
        routes.push(pattern);
    }
    Policy::new(
        config.name.clone(),
        config.scope,
        Duration::from_millis(config.window_ms),
        config.max_requests,
        routes,
    )
}
