pub mod builder;

use crate::service::{Decision, RateLimiterService, RequestInfo};
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{HttpMessage, HttpResponse};
use futures::future::{ok, LocalBoxFuture, Ready};
use std::cell::RefCell;
use std::rc::Rc;

type DeniedResponse = dyn Fn(&Decision) -> HttpResponse;
type UserIdFn = dyn Fn(&ServiceRequest) -> Option<String>;

/// Request extension carrying the authenticated user id.
///
/// The host's authentication layer inserts this ahead of the limiter; per-user
/// policies read it. A custom extractor can be supplied instead via
/// [RateLimiterBuilder::user_id_fn](builder::RateLimiterBuilder::user_id_fn).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Rate limit middleware.
pub struct RateLimiter {
    limiter: RateLimiterService,
    denied_response: Rc<DeniedResponse>,
    user_id_fn: Option<Rc<UserIdFn>>,
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            denied_response: self.denied_response.clone(),
            user_id_fn: self.user_id_fn.clone(),
        }
    }
}

impl RateLimiter {
    /// # Arguments
    ///
    /// * `limiter`: The decision service the middleware consults; build it
    ///   once and share a clone per worker.
    pub fn builder(limiter: RateLimiterService) -> builder::RateLimiterBuilder {
        builder::RateLimiterBuilder::new(limiter)
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimiter
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimiterMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimiterMiddleware {
            service: Rc::new(RefCell::new(service)),
            limiter: self.limiter.clone(),
            denied_response: self.denied_response.clone(),
            user_id_fn: self.user_id_fn.clone(),
        })
    }
}

pub struct RateLimiterMiddleware<S> {
    service: Rc<RefCell<S>>,
    limiter: RateLimiterService,
    denied_response: Rc<DeniedResponse>,
    user_id_fn: Option<Rc<UserIdFn>>,
}

impl<S, B> Service<ServiceRequest> for RateLimiterMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let limiter = self.limiter.clone();
        let denied_response = self.denied_response.clone();
        let user_id_fn = self.user_id_fn.clone();

        Box::pin(async move {
            let info = request_info(&req, user_id_fn.as_deref());
            let decision = limiter.check(&info).await;

            if decision.is_denied() {
                let response: HttpResponse = (denied_response)(&decision);
                return Ok(req.into_response(response).map_into_right_body());
            }

            let mut service_response = service.call(req).await?;
            if decision.has_quota() {
                builder::apply_quota_headers(service_response.headers_mut(), &decision);
            }
            Ok(service_response.map_into_left_body())
        })
    }
}

fn request_info(req: &ServiceRequest, user_id_fn: Option<&UserIdFn>) -> RequestInfo {
    let user_id = match user_id_fn {
        Some(f) => f(req),
        None => req
            .extensions()
            .get::<AuthenticatedUser>()
            .map(|user| user.0.clone()),
    };
    RequestInfo {
        method: req.method().clone(),
        path: req.path().to_owned(),
        peer: req.peer_addr().map(|addr| addr.ip()),
        forwarded_for: req
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned),
        user_id,
    }
}
