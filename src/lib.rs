//! Floodgate - Admission Control for HTTP Services
//!
//! This crate implements per-key fixed-window rate limiting. Named policies
//! share one in-memory window store, are evaluated in registration order for
//! every request whose path they cover, and report their decision through
//! standard `X-RateLimit-*` headers. Speed limiters slow callers down before
//! the hard limits reject them.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod sleeper;
