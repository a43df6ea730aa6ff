//! Rate limit policies and the catalog that matches them to routes.
//!
//! A [Policy] binds a rolling window and quota to a set of route patterns and
//! an identity [Scope]. The [PolicyCatalog] holds every policy plus an
//! exemption list and resolves an inbound `(path, method)` pair to either an
//! exemption or the single most specific matching policy.

use crate::config::ConfigError;
use actix_web::http::Method;
use serde::Deserialize;
use std::time::Duration;

/// The dimension along which a policy tracks quotas independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    /// One counter per client IP (IPv6 grouped per /64).
    PerIp,
    /// One counter per authenticated user id.
    PerUser,
    /// One counter per client IP and request path combination.
    PerIpAndPath,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param,
}

/// A single path pattern plus the HTTP methods it applies to.
///
/// Patterns are `/`-separated with `:name` segments matching any single
/// segment, or the lone string `*` matching every route (catch-all).
/// An empty method list matches all methods.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    raw: String,
    // None means the `*` catch-all.
    segments: Option<Vec<Segment>>,
    methods: Vec<Method>,
}

impl RoutePattern {
    pub fn new(pattern: &str, methods: Vec<Method>) -> Result<Self, InvalidPattern> {
        if pattern == "*" {
            return Ok(Self {
                raw: pattern.to_owned(),
                segments: None,
                methods,
            });
        }
        if !pattern.starts_with('/') || pattern.contains("//") {
            return Err(InvalidPattern);
        }
        let segments = pattern
            .split('/')
            .skip(1)
            .map(|s| {
                if s.is_empty() {
                    Err(InvalidPattern)
                } else if let Some(stripped) = s.strip_prefix(':') {
                    if stripped.is_empty() {
                        Err(InvalidPattern)
                    } else {
                        Ok(Segment::Param)
                    }
                } else {
                    Ok(Segment::Literal(s.to_owned()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            raw: pattern.to_owned(),
            segments: Some(segments),
            methods,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.raw
    }

    /// Returns a specificity score when the pattern matches.
    ///
    /// Literal segments outrank `:param` segments, which outrank the `*`
    /// catch-all (score 0), so `/api/auth/login` beats `/api/auth/:action`
    /// beats `*` for the same request.
    fn specificity(&self, path: &str, method: &Method) -> Option<u32> {
        if !self.methods.is_empty() && !self.methods.contains(method) {
            return None;
        }
        let segments = match &self.segments {
            None => return Some(0),
            Some(segments) => segments,
        };
        let path = path.strip_prefix('/')?;
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != segments.len() {
            return None;
        }
        let mut score = 1;
        for (segment, part) in segments.iter().zip(&parts) {
            match segment {
                Segment::Literal(lit) => {
                    if lit != part {
                        return None;
                    }
                    score += 2;
                }
                Segment::Param => {
                    if part.is_empty() {
                        return None;
                    }
                    score += 1;
                }
            }
        }
        Some(score)
    }
}

/// Marker error for a malformed route pattern; the caller attaches context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidPattern;

/// An immutable rate limit policy, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Policy {
    name: String,
    scope: Scope,
    window: Duration,
    max_requests: u64,
    routes: Vec<RoutePattern>,
}

impl Policy {
    pub fn new(
        name: impl Into<String>,
        scope: Scope,
        window: Duration,
        max_requests: u64,
        routes: Vec<RoutePattern>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::EmptyPolicyName);
        }
        if window.is_zero() {
            return Err(ConfigError::ZeroWindow { policy: name });
        }
        if max_requests == 0 {
            return Err(ConfigError::ZeroQuota { policy: name });
        }
        if routes.is_empty() {
            return Err(ConfigError::NoRoutes { policy: name });
        }
        Ok(Self {
            name,
            scope,
            window,
            max_requests,
            routes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// The rolling window duration.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// The total requests allowed within the window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    fn specificity(&self, path: &str, method: &Method) -> Option<u32> {
        self.routes
            .iter()
            .filter_map(|r| r.specificity(path, method))
            .max()
    }
}

/// Result of matching a request against the catalog.
#[derive(Debug, Clone, Copy)]
pub enum RouteMatch<'a> {
    /// The route is explicitly excluded from all policies.
    Exempt,
    /// The most specific matching policy.
    Limited(&'a Policy),
    /// No policy matched and no catch-all is declared.
    Unmatched,
}

/// The full set of policies and exemptions for a process.
///
/// Built once at startup and never mutated; matching is deterministic and
/// independent of declaration order except as an explicit tie-breaker.
#[derive(Debug, Clone)]
pub struct PolicyCatalog {
    policies: Vec<Policy>,
    exemptions: Vec<String>,
}

impl PolicyCatalog {
    /// Exemption entries are exact paths, or prefixes when ending in `*`.
    pub fn new(policies: Vec<Policy>, exemptions: Vec<String>) -> Result<Self, ConfigError> {
        for (i, policy) in policies.iter().enumerate() {
            if policies[..i].iter().any(|p| p.name == policy.name) {
                return Err(ConfigError::DuplicatePolicy(policy.name.clone()));
            }
        }
        Ok(Self {
            policies,
            exemptions,
        })
    }

    fn is_exempt(&self, path: &str) -> bool {
        self.exemptions.iter().any(|e| {
            if let Some(prefix) = e.strip_suffix('*') {
                path.starts_with(prefix)
            } else {
                path == e
            }
        })
    }

    /// Resolves a request to an exemption or the most specific policy.
    ///
    /// Exemptions short-circuit all policy evaluation. Among matching
    /// policies the highest specificity wins; ties go to the earliest
    /// declared policy.
    pub fn route_match(&self, path: &str, method: &Method) -> RouteMatch<'_> {
        if self.is_exempt(path) {
            return RouteMatch::Exempt;
        }
        let mut best: Option<(u32, &Policy)> = None;
        for policy in &self.policies {
            if let Some(score) = policy.specificity(path, method) {
                match best {
                    Some((top, _)) if top >= score => {}
                    _ => best = Some((score, policy)),
                }
            }
        }
        match best {
            Some((_, policy)) => RouteMatch::Limited(policy),
            None => RouteMatch::Unmatched,
        }
    }
}
