//! Error taxonomy (spec.md §7), modeled on the teacher's `error.rs`:
//! a small `ErrorKind` for metrics/telemetry labeling, and a
//! `ReportableError`/`UserFacingError` trait pair so every error knows
//! both how to be counted and how much of itself is safe to show a
//! caller.

use std::fmt;

use gateway_util::ApiError;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    NotFound,
    RateLimited,
    UpstreamMisconfigured,
    UpstreamUnreachable,
    UpstreamTimeout,
    Internal,
}

impl ErrorKind {
    pub fn to_metric_label(self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "notfound",
            ErrorKind::RateLimited => "ratelimited",
            ErrorKind::UpstreamMisconfigured => "upstream_misconfigured",
            ErrorKind::UpstreamUnreachable => "upstream_unreachable",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

pub trait ReportableError: fmt::Display {
    fn get_error_kind(&self) -> ErrorKind;
}

/// Marks errors that may be safely shown to a client. Mirrors the
/// teacher's trait of the same name: the default passes the message
/// through, but types whose `Display` leaks internals should override it.
pub trait UserFacingError: ReportableError {
    fn to_string_client(&self) -> String {
        self.to_string()
    }
}

/// The gateway's single error type for the request pipeline
/// (`KeyDirectory` → `BotClassifier` → `Limiter` → `ProxyEngine`).
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication failed")]
    Unauthenticated,

    #[error("key is not authorized for this service")]
    ForbiddenScope,

    #[error("request blocked: automated traffic detected")]
    ForbiddenBot,

    #[error("unknown service {0}")]
    ServiceNotFound(i64),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("service target_url is misconfigured: {0}")]
    UpstreamMisconfigured(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream did not respond in time")]
    UpstreamTimeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The status code this error maps to, independent of constructing a
    /// full `ApiError` — used by `ProxyEngine` to pick the response
    /// status that also gets committed into `RequestHash.response_status`
    /// (spec.md §4.6 step 11, §8 scenario 7).
    pub fn http_status(&self) -> u16 {
        match self.get_error_kind() {
            ErrorKind::Unauthenticated => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::RateLimited => 429,
            ErrorKind::UpstreamMisconfigured | ErrorKind::Internal => 500,
            ErrorKind::UpstreamUnreachable => 502,
            ErrorKind::UpstreamTimeout => 504,
        }
    }
}

impl ReportableError for GatewayError {
    fn get_error_kind(&self) -> ErrorKind {
        match self {
            GatewayError::Unauthenticated => ErrorKind::Unauthenticated,
            GatewayError::ForbiddenScope | GatewayError::ForbiddenBot => ErrorKind::Forbidden,
            GatewayError::ServiceNotFound(_) => ErrorKind::NotFound,
            GatewayError::RateLimited => ErrorKind::RateLimited,
            GatewayError::UpstreamMisconfigured(_) => ErrorKind::UpstreamMisconfigured,
            GatewayError::UpstreamUnreachable(_) => ErrorKind::UpstreamUnreachable,
            GatewayError::UpstreamTimeout => ErrorKind::UpstreamTimeout,
            GatewayError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl UserFacingError for GatewayError {
    fn to_string_client(&self) -> String {
        match self {
            GatewayError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        let msg = e.to_string_client();
        match e {
            GatewayError::Unauthenticated => ApiError::Unauthenticated(msg),
            GatewayError::ForbiddenScope | GatewayError::ForbiddenBot => ApiError::Forbidden(msg),
            GatewayError::ServiceNotFound(_) => ApiError::NotFound(msg),
            GatewayError::RateLimited => ApiError::RateLimited(msg),
            GatewayError::UpstreamMisconfigured(_) => ApiError::Internal(msg),
            GatewayError::UpstreamUnreachable(_) => ApiError::BadGateway(msg),
            GatewayError::UpstreamTimeout => ApiError::GatewayTimeout(msg),
            GatewayError::Internal(_) => ApiError::Internal(msg),
        }
    }
}
