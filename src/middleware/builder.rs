use crate::middleware::{DeniedResponse, RateLimiter, UserIdFn};
use crate::service::{Decision, RateLimiterService};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use std::rc::Rc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

/// Sets the quota headers from a decision:
///
/// - `x-ratelimit-limit`
/// - `x-ratelimit-remaining`
/// - `x-ratelimit-reset` (epoch seconds at which the window clears)
pub(crate) fn apply_quota_headers(map: &mut HeaderMap, decision: &Decision) {
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit()));
    map.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(decision.remaining()),
    );
    map.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(decision.reset_epoch_seconds()),
    );
}

pub struct RateLimiterBuilder {
    limiter: RateLimiterService,
    denied_response: Rc<DeniedResponse>,
    user_id_fn: Option<Rc<UserIdFn>>,
}

impl RateLimiterBuilder {
    pub(super) fn new(limiter: RateLimiterService) -> Self {
        Self {
            limiter,
            denied_response: Rc::new(default_denied_response),
            user_id_fn: None,
        }
    }

    /// In the event that the request is denied, configure the [HttpResponse]
    /// returned.
    ///
    /// Defaults to an empty 429 carrying `retry-after` and the
    /// `x-ratelimit-*` headers with `remaining` at zero.
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&Decision) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    /// Override how the authenticated user id is read from a request.
    ///
    /// By default the [AuthenticatedUser](crate::AuthenticatedUser) request
    /// extension is consulted.
    pub fn user_id_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Option<String> + 'static,
    {
        self.user_id_fn = Some(Rc::new(f));
        self
    }

    pub fn build(self) -> RateLimiter {
        RateLimiter {
            limiter: self.limiter,
            denied_response: self.denied_response,
            user_id_fn: self.user_id_fn,
        }
    }
}

fn default_denied_response(decision: &Decision) -> HttpResponse {
    let mut response = HttpResponse::TooManyRequests().finish();
    let map = response.headers_mut();
    apply_quota_headers(map, decision);
    if let Some(seconds) = decision.retry_after_seconds() {
        map.insert(RETRY_AFTER, HeaderValue::from(seconds));
    }
    response
}
