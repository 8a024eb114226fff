//! HTTP adapter: axum middleware and server around the [`PolicyRegistry`].
//!
//! [`PolicyRegistry`]: crate::ratelimit::PolicyRegistry

pub mod middleware;
pub mod response;
pub mod server;

pub use middleware::{admission, identity_from_headers, request_context};
pub use response::{rejection_body, rejection_response, RejectionBody, ResponseDecorator};
pub use server::HttpServer;
