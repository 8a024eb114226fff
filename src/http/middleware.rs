//! Axum middleware that runs every request through the admission pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use tracing::trace;

use super::response::{rejection_response, ResponseDecorator};
use crate::ratelimit::{Admission, Identity, PolicyRegistry, RequestContext, Role};

/// Build the pipeline's view of an axum request.
///
/// The client address comes from [`ConnectInfo`], the identity from an
/// [`Identity`] extension left by an earlier auth layer.
pub fn request_context(request: &Request) -> RequestContext {
    let mut ctx = RequestContext::new(request.uri().path());

    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        ctx = ctx.with_client_addr(addr.ip());
    }
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            ctx = ctx.with_header(name.as_str(), value);
        }
    }
    if let Some(identity) = request.extensions().get::<Identity>() {
        ctx = ctx.with_identity(identity.clone());
    }
    ctx
}

/// Admission middleware, for use with `axum::middleware::from_fn_with_state`.
///
/// Rejected requests never reach the handler. Admitted requests are settled
/// with the handler's status once it responds.
pub async fn admission(
    State(registry): State<Arc<PolicyRegistry>>,
    request: Request,
    next: Next,
) -> Response {
    let ctx = request_context(&request);
    let Admission {
        decision,
        rejection,
        completion,
    } = registry.admit(&ctx).await;

    if let Some(rejection) = rejection {
        drop(completion);
        return rejection_response(&rejection);
    }

    let mut response = next.run(request).await;
    let status = response.status().as_u16();
    trace!(path = %ctx.path, status, "Settling admitted request");
    completion.complete(status);

    if let Some(decision) = decision {
        ResponseDecorator::decorate(response.headers_mut(), &decision);
    }
    response
}

/// Attach an [`Identity`] from the `x-user-id` and `x-user-role` headers.
///
/// Stands in for a real authentication layer in the bundled server. An
/// unknown role is treated as anonymous.
pub async fn identity_from_headers(mut request: Request, next: Next) -> Response {
    let headers = request.headers();
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let role = headers
        .get("x-user-role")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Role>().ok())
        .unwrap_or_default();

    if let Some(user_id) = user_id {
        request.extensions_mut().insert(Identity::new(user_id, role));
    }
    next.run(request).await
}
