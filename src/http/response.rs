//! Rate limit headers and the rejection response.

use axum::{
    http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::ratelimit::{Decision, Rejection};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Writes rate limit metadata onto responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseDecorator;

impl ResponseDecorator {
    /// Set `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
    ///
    /// `Retry-After` is left to [`rejection_response`]: a decision that was
    /// over the limit but let through (observe mode) must not carry it.
    pub fn decorate(headers: &mut HeaderMap, decision: &Decision) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
        headers.insert(
            X_RATELIMIT_RESET,
            HeaderValue::from(decision.reset_at_epoch_secs),
        );
    }
}

/// JSON body sent with a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub success: bool,
    pub message: String,
    pub retry_after: u64,
}

pub fn rejection_body(rejection: &Rejection) -> RejectionBody {
    RejectionBody {
        success: false,
        message: rejection.message.clone(),
        retry_after: rejection.decision.retry_after_secs,
    }
}

/// Build the short-circuit response for a rejected request.
pub fn rejection_response(rejection: &Rejection) -> Response {
    let status =
        StatusCode::from_u16(rejection.status_code).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
    let mut response = (status, Json(rejection_body(rejection))).into_response();
    let headers = response.headers_mut();
    ResponseDecorator::decorate(headers, &rejection.decision);
    headers.insert(
        RETRY_AFTER,
        HeaderValue::from(rejection.decision.retry_after_secs),
    );
    response
}
