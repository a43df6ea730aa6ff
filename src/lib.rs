//! Tiered rate limiting middleware for actix-web.
//!
//! Requests are matched against a catalog of named policies (each with a
//! rolling window, a quota, and an identity scope), counted with a weighted
//! sliding-window algorithm in a shared Redis store, and automatically fall
//! back to an in-process store when Redis is slow or unreachable. A
//! [HealthGate](health::HealthGate) keeps a struggling Redis off the hot path
//! while still probing for recovery.
//!
//! ```no_run
//! use actix_resilient_rate_limit::{config::LimiterConfig, RateLimiter, RateLimiterService};
//! use actix_web::{App, HttpServer};
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let config = LimiterConfig::from_toml_str(
//!         r#"
//!         exempt = ["/api/webhooks/stripe"]
//!
//!         [store]
//!         url = "redis://127.0.0.1/"
//!         key_prefix = "rl:"
//!
//!         [[policy]]
//!         name = "general"
//!         window_ms = 60000
//!         max_requests = 100
//!         scope = "per-ip"
//!         routes = [{ path = "*" }]
//!     "#,
//!     )
//!     .expect("invalid rate limit configuration");
//!     let service = RateLimiterService::from_config(&config)
//!         .await
//!         .expect("failed to build the rate limiter");
//!     HttpServer::new(move || {
//!         App::new().wrap(RateLimiter::builder(service.clone()).build())
//!     })
//!     .bind(("127.0.0.1", 8080))?
//!     .run()
//!     .await
//! }
//! ```

pub mod config;
pub mod health;
pub mod identity;
mod middleware;
pub mod policy;
pub mod service;
pub mod store;

pub use middleware::builder::RateLimiterBuilder;
pub use middleware::{AuthenticatedUser, RateLimiter};
pub use service::{Decision, DecisionSource, RateLimiterService, RequestInfo};
