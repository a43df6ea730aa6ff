//! The orchestrating service: policy, identity, stores, and degradation.
//!
//! [RateLimiterService::check] always returns a well-formed [Decision];
//! store outages, identity ambiguity, and denials are all absorbed here.
//! Configuration defects never reach this module; they fail at startup.

use crate::config::{ConfigError, LimiterConfig};
use crate::health::{HealthGate, HealthGateConfig};
use crate::identity::{identity_for, ip_identity, IdentityError, TrustedProxies};
use crate::policy::{Policy, PolicyCatalog, RouteMatch};
use crate::store::{epoch_ms, InMemoryStore, RedisWindowStore, WindowStore, WindowUsage};
use actix_web::http::Method;
use redis::aio::ConnectionManager;
use std::net::IpAddr;
use std::sync::Arc;

/// The request facts the limiter needs, supplied by the middleware.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub path: String,
    /// The directly connected peer.
    pub peer: Option<IpAddr>,
    /// Raw forwarded-for header chain, if any.
    pub forwarded_for: Option<String>,
    /// User id resolved by the host's authentication layer.
    pub user_id: Option<String>,
}

/// Which tier produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// The route is exempt (or matches no policy); no quota applies.
    Exempt,
    Distributed,
    Local,
    /// Both stores were unusable; the request was allowed unconditionally.
    FailOpen,
}

/// The limiter's answer for one request. Transient, never persisted.
#[derive(Debug, Clone)]
pub struct Decision {
    allowed: bool,
    limit: u64,
    remaining: u64,
    reset_ms: u64,
    retry_after: Option<u64>,
    source: DecisionSource,
}

impl Decision {
    fn from_usage(usage: WindowUsage, source: DecisionSource) -> Self {
        let retry_after = if usage.allowed {
            None
        } else {
            // Point the client at the earliest admitting instant, not at the
            // full reset, which may be much later.
            let target = usage.retry_at_ms.unwrap_or(usage.reset_ms);
            let millis = target.saturating_sub(epoch_ms());
            Some(millis.div_ceil(1000).max(1))
        };
        Self {
            allowed: usage.allowed,
            limit: usage.limit,
            remaining: usage.remaining,
            reset_ms: usage.reset_ms,
            retry_after,
            source,
        }
    }

    fn unlimited(source: DecisionSource) -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_ms: 0,
            retry_after: None,
            source,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn is_denied(&self) -> bool {
        !self.allowed
    }

    /// Value for the `x-ratelimit-limit` header.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Value for the `x-ratelimit-remaining` header.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Value for the `x-ratelimit-reset` header (epoch seconds, rounded
    /// upwards, at which both buckets have expired and the quota is
    /// guaranteed fresh).
    pub fn reset_epoch_seconds(&self) -> u64 {
        self.reset_ms.div_ceil(1000)
    }

    /// Value for the `retry-after` header; present only on denials.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.retry_after
    }

    pub fn source(&self) -> DecisionSource {
        self.source
    }

    /// Whether a quota was actually evaluated (and headers are meaningful).
    pub fn has_quota(&self) -> bool {
        matches!(
            self.source,
            DecisionSource::Distributed | DecisionSource::Local
        )
    }
}

struct Inner {
    catalog: PolicyCatalog,
    proxies: TrustedProxies,
    distributed: Option<Arc<dyn WindowStore>>,
    local: Arc<dyn WindowStore>,
    health: HealthGate,
}

/// The rate limiter itself; cheap to clone and share across workers.
#[derive(Clone)]
pub struct RateLimiterService {
    inner: Arc<Inner>,
}

impl RateLimiterService {
    pub fn builder(catalog: PolicyCatalog) -> RateLimiterServiceBuilder {
        RateLimiterServiceBuilder {
            catalog,
            proxies: TrustedProxies::default(),
            distributed: None,
            local: None,
            health: HealthGateConfig::default(),
        }
    }

    /// Builds the whole service from a [LimiterConfig]: catalog, trusted
    /// proxies, health thresholds, a local store sweeping at the configured
    /// interval, and, when a store URL is present, a connected Redis tier
    /// with the configured key prefix and call timeout.
    pub async fn from_config(config: &LimiterConfig) -> Result<Self, ConfigError> {
        let local = InMemoryStore::builder()
            .with_gc_interval(config.gc_interval())
            .build();
        let mut builder = Self::builder(config.catalog()?)
            .trusted_proxies(config.trusted_proxies()?)
            .health_gate(config.health_gate()?)
            .local_store(local);
        if let Some(url) = &config.store.url {
            let client = redis::Client::open(url.as_str()).map_err(ConfigError::StoreConnection)?;
            let connection = ConnectionManager::new(client)
                .await
                .map_err(ConfigError::StoreConnection)?;
            let store = RedisWindowStore::builder(connection)
                .key_prefix(config.store.key_prefix.as_deref())
                .call_timeout(config.store_timeout())
                .build();
            builder = builder.distributed_store(store);
        }
        Ok(builder.build())
    }

    /// Decides whether a request may proceed.
    ///
    /// Degradation order: distributed store (unless the health gate is
    /// holding it back), then the local store, then fail open. A denial is a
    /// normal outcome, not an error; this method never fails.
    pub async fn check(&self, request: &RequestInfo) -> Decision {
        let inner = &self.inner;
        let policy = match inner.catalog.route_match(&request.path, &request.method) {
            RouteMatch::Exempt => return Decision::unlimited(DecisionSource::Exempt),
            RouteMatch::Unmatched => {
                log::debug!("no policy matches {}, leaving it unlimited", request.path);
                return Decision::unlimited(DecisionSource::Exempt);
            }
            RouteMatch::Limited(policy) => policy,
        };
        let key = self.subject_key(request, policy);

        if let Some(distributed) = &inner.distributed {
            if inner.health.should_attempt() {
                match distributed
                    .increment_and_check(&key, policy.window(), policy.max_requests())
                    .await
                {
                    Ok(usage) => {
                        inner.health.record_success();
                        return Decision::from_usage(usage, DecisionSource::Distributed);
                    }
                    Err(e) => {
                        inner.health.record_failure();
                        log::warn!(
                            "distributed store unavailable for policy {}: {e}, \
                             falling back to the local store",
                            policy.name()
                        );
                    }
                }
            }
        }

        match inner
            .local
            .increment_and_check(&key, policy.window(), policy.max_requests())
            .await
        {
            Ok(usage) => Decision::from_usage(usage, DecisionSource::Local),
            Err(e) => {
                log::error!(
                    "no usable rate limit store for policy {}: {e}, failing open",
                    policy.name()
                );
                Decision::unlimited(DecisionSource::FailOpen)
            }
        }
    }

    fn subject_key(&self, request: &RequestInfo, policy: &Policy) -> String {
        let identity = match identity_for(request, policy.scope(), &self.inner.proxies) {
            Ok(identity) => identity,
            Err(IdentityError::NoAuthenticatedUser) => {
                // Unauthenticated traffic under a per-user policy is counted
                // per-ip instead; it is never silently exempted.
                log::debug!(
                    "policy {} requires an authenticated user, counting request per-ip",
                    policy.name()
                );
                format!("ip:{}", ip_identity(request, &self.inner.proxies))
            }
        };
        format!("{}:{}", policy.name(), identity)
    }
}

pub struct RateLimiterServiceBuilder {
    catalog: PolicyCatalog,
    proxies: TrustedProxies,
    distributed: Option<Arc<dyn WindowStore>>,
    local: Option<Arc<dyn WindowStore>>,
    health: HealthGateConfig,
}

impl RateLimiterServiceBuilder {
    /// Proxies whose forwarded-for headers may be believed.
    pub fn trusted_proxies(mut self, proxies: TrustedProxies) -> Self {
        self.proxies = proxies;
        self
    }

    /// The shared cross-instance store; without one, only the local tier
    /// enforces.
    pub fn distributed_store(mut self, store: impl WindowStore + 'static) -> Self {
        self.distributed = Some(Arc::new(store));
        self
    }

    /// Override the in-process fallback store (defaults to a fresh
    /// [InMemoryStore]).
    pub fn local_store(mut self, store: impl WindowStore + 'static) -> Self {
        self.local = Some(Arc::new(store));
        self
    }

    pub fn health_gate(mut self, config: HealthGateConfig) -> Self {
        self.health = config;
        self
    }

    pub fn build(self) -> RateLimiterService {
        let local = self
            .local
            .unwrap_or_else(|| Arc::new(InMemoryStore::builder().build()));
        RateLimiterService {
            inner: Arc::new(Inner {
                catalog: self.catalog,
                proxies: self.proxies,
                distributed: self.distributed,
                local,
                health: HealthGate::new(self.health),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterConfig;
    use crate::store::StoreError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// A distributed store that always times out, counting the attempts.
    #[derive(Default)]
    struct DeadStore {
        calls: AtomicU64,
    }

    #[async_trait]
    impl WindowStore for DeadStore {
        async fn increment_and_check(
            &self,
            _key: &str,
            _window: Duration,
            _max_requests: u64,
        ) -> Result<WindowUsage, StoreError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(StoreError::Timeout(Duration::from_millis(50)))
        }

        async fn remove_key(&self, _key: &str, _window: Duration) -> Result<(), StoreError> {
            Ok(())
        }
    }

    /// A local tier that always fails, to force the fail-open path.
    struct BrokenStore;

    #[async_trait]
    impl WindowStore for BrokenStore {
        async fn increment_and_check(
            &self,
            _key: &str,
            _window: Duration,
            _max_requests: u64,
        ) -> Result<WindowUsage, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(1)))
        }

        async fn remove_key(&self, _key: &str, _window: Duration) -> Result<(), StoreError> {
            Ok(())
        }
    }

    const CONFIG: &str = r#"
        exempt = ["/api/webhooks/stripe"]

        [[policy]]
        name = "login"
        window_ms = 900000
        max_requests = 5
        scope = "per-ip"
        routes = [{ path = "/api/auth/login", methods = ["POST"] }]

        [[policy]]
        name = "account"
        window_ms = 60000
        max_requests = 2
        scope = "per-user"
        routes = [{ path = "/api/account/:section" }]

        [[policy]]
        name = "general"
        window_ms = 60000
        max_requests = 100
        scope = "per-ip"
        routes = [{ path = "*" }]
    "#;

    fn catalog() -> PolicyCatalog {
        LimiterConfig::from_toml_str(CONFIG).unwrap().catalog().unwrap()
    }

    fn local_only() -> RateLimiterService {
        RateLimiterService::builder(catalog()).build()
    }

    fn request(method: Method, path: &str, ip: &str, user: Option<&str>) -> RequestInfo {
        RequestInfo {
            method,
            path: path.to_owned(),
            peer: Some(ip.parse().unwrap()),
            forwarded_for: None,
            user_id: user.map(ToOwned::to_owned),
        }
    }

    #[actix_web::test]
    async fn test_login_scenario() {
        let service = local_only();
        let req = request(Method::POST, "/api/auth/login", "1.2.3.4", None);
        for remaining in (0..5).rev() {
            let decision = service.check(&req).await;
            assert!(decision.is_allowed());
            assert_eq!(decision.limit(), 5);
            assert_eq!(decision.remaining(), remaining);
        }
        let decision = service.check(&req).await;
        assert!(decision.is_denied());
        assert_eq!(decision.remaining(), 0);
        // Six attempts keep a third of their weight into the next bucket, so
        // the honest retry hint can run up to a third past the window.
        let retry = decision.retry_after_seconds().unwrap();
        assert!(retry > 0 && retry <= 1200);
    }

    #[actix_web::test]
    async fn test_identities_are_independent() {
        let service = local_only();
        let first = request(Method::POST, "/api/auth/login", "1.2.3.4", None);
        let second = request(Method::POST, "/api/auth/login", "5.6.7.8", None);
        for _ in 0..5 {
            assert!(service.check(&first).await.is_allowed());
        }
        assert!(service.check(&first).await.is_denied());
        // The other IP still has its full quota.
        let decision = service.check(&second).await;
        assert!(decision.is_allowed());
        assert_eq!(decision.remaining(), 4);
    }

    #[actix_web::test]
    async fn test_exempt_route_is_unbounded() {
        let service = local_only();
        let req = request(Method::POST, "/api/webhooks/stripe", "1.2.3.4", None);
        for _ in 0..1000 {
            let decision = service.check(&req).await;
            assert!(decision.is_allowed());
            assert_eq!(decision.source(), DecisionSource::Exempt);
            assert!(!decision.has_quota());
        }
    }

    #[actix_web::test]
    async fn test_dead_distributed_store_falls_back_and_still_enforces() {
        let service = RateLimiterService::builder(catalog())
            .distributed_store(DeadStore::default())
            .build();
        let req = request(Method::POST, "/api/auth/login", "1.2.3.4", None);
        for _ in 0..5 {
            let decision = service.check(&req).await;
            assert!(decision.is_allowed());
            assert_eq!(decision.source(), DecisionSource::Local);
        }
        // The quota is still enforced by the local tier, not failed open.
        let decision = service.check(&req).await;
        assert!(decision.is_denied());
        assert_eq!(decision.source(), DecisionSource::Local);
    }

    #[actix_web::test]
    async fn test_health_gate_stops_hammering_a_dead_store() {
        let dead = Arc::new(DeadStore::default());
        let service = RateLimiterService::builder(catalog())
            .distributed_store(SharedStore(dead.clone()))
            .health_gate(HealthGateConfig {
                failure_threshold: 3,
                failure_window: Duration::from_secs(60),
                probe_interval: 10,
            })
            .build();
        let req = request(Method::GET, "/api/vehicles", "1.2.3.4", None);
        for _ in 0..30 {
            assert!(service.check(&req).await.is_allowed());
        }
        // 3 failures to trip the gate, then only one probe in ten: the dead
        // store must see far fewer than all 30 requests.
        let calls = dead.calls.load(Ordering::Relaxed);
        assert!(calls >= 3, "gate needs failures to trip, saw {calls}");
        assert!(calls <= 6, "suspected store was called {calls} times");
    }

    /// Wraps a shared store so tests can keep a handle to it.
    struct SharedStore(Arc<DeadStore>);

    #[async_trait]
    impl WindowStore for SharedStore {
        async fn increment_and_check(
            &self,
            key: &str,
            window: Duration,
            max_requests: u64,
        ) -> Result<WindowUsage, StoreError> {
            self.0.increment_and_check(key, window, max_requests).await
        }

        async fn remove_key(&self, key: &str, window: Duration) -> Result<(), StoreError> {
            self.0.remove_key(key, window).await
        }
    }

    #[actix_web::test]
    async fn test_fail_open_only_when_both_tiers_are_unusable() {
        let service = RateLimiterService::builder(catalog())
            .distributed_store(DeadStore::default())
            .local_store(BrokenStore)
            .build();
        let req = request(Method::POST, "/api/auth/login", "1.2.3.4", None);
        for _ in 0..10 {
            let decision = service.check(&req).await;
            assert!(decision.is_allowed());
            assert_eq!(decision.source(), DecisionSource::FailOpen);
            assert!(!decision.has_quota());
        }
    }

    #[actix_web::test]
    async fn test_per_user_scope_counts_users_separately() {
        let service = local_only();
        let alice = request(Method::GET, "/api/account/billing", "1.2.3.4", Some("alice"));
        let bob = request(Method::GET, "/api/account/billing", "1.2.3.4", Some("bob"));
        assert!(service.check(&alice).await.is_allowed());
        assert!(service.check(&alice).await.is_allowed());
        assert!(service.check(&alice).await.is_denied());
        // Same IP, different user: separate counter.
        assert!(service.check(&bob).await.is_allowed());
    }

    #[actix_web::test]
    async fn test_unauthenticated_traffic_counts_per_ip() {
        let service = local_only();
        let anonymous = request(Method::GET, "/api/account/billing", "9.9.9.9", None);
        assert!(service.check(&anonymous).await.is_allowed());
        assert!(service.check(&anonymous).await.is_allowed());
        // Still enforced, under the IP identity rather than exempted.
        assert!(service.check(&anonymous).await.is_denied());
    }

    #[actix_web::test]
    async fn test_from_config_without_store_url_enforces_locally() {
        let config = LimiterConfig::from_toml_str(CONFIG).unwrap();
        let service = RateLimiterService::from_config(&config).await.unwrap();
        let req = request(Method::POST, "/api/auth/login", "1.2.3.4", None);
        for _ in 0..5 {
            let decision = service.check(&req).await;
            assert!(decision.is_allowed());
            assert_eq!(decision.source(), DecisionSource::Local);
        }
        assert!(service.check(&req).await.is_denied());
    }

    #[actix_web::test]
    async fn test_from_config_rejects_a_malformed_store_url() {
        let config = LimiterConfig::from_toml_str("[store]\nurl = \"not-a-redis-url\"\n").unwrap();
        let result = RateLimiterService::from_config(&config).await;
        assert!(matches!(result, Err(ConfigError::StoreConnection(_))));
    }

    #[actix_web::test]
    async fn test_unmatched_route_without_catch_all() {
        let config = r#"
            [[policy]]
            name = "login"
            window_ms = 60000
            max_requests = 1
            scope = "per-ip"
            routes = [{ path = "/api/auth/login" }]
        "#;
        let catalog = LimiterConfig::from_toml_str(config)
            .unwrap()
            .catalog()
            .unwrap();
        let service = RateLimiterService::builder(catalog).build();
        let req = request(Method::GET, "/api/unlisted", "1.2.3.4", None);
        let decision = service.check(&req).await;
        assert!(decision.is_allowed());
        assert!(!decision.has_quota());
    }
}
