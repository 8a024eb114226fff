//! Request context and caller-key extraction.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller role used by role-based policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Anonymous,
    Basic,
    Premium,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anonymous => "anonymous",
            Role::Basic => "basic",
            Role::Premium => "premium",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anonymous" | "" => Ok(Role::Anonymous),
            "basic" | "user" => Ok(Role::Basic),
            "premium" => Ok(Role::Premium),
            "admin" => Ok(Role::Admin),
            other => Err(KeyError::Failed(format!("unknown role '{other}'"))),
        }
    }
}

/// Authenticated caller, attached to the request by an upstream auth stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<String>,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: Some(user_id.into()),
            role,
        }
    }
}

/// What the pipeline knows about an inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Peer address
    pub client_addr: Option<IpAddr>,
    /// Request path, used for policy scoping
    pub path: String,
    /// Header values keyed by lowercase header name
    pub headers: HashMap<String, String>,
    /// Authenticated caller, if any
    pub identity: Option<Identity>,
}

impl RequestContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_client_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The caller's role; anonymous when no identity is attached.
    pub fn role(&self) -> Role {
        self.identity.as_ref().map(|i| i.role).unwrap_or_default()
    }
}

/// Why a caller key could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("request has no client address")]
    MissingClientAddress,

    #[error("request is missing header '{0}'")]
    MissingHeader(String),

    #[error("extracted key is empty")]
    Empty,

    #[error("key extraction failed: {0}")]
    Failed(String),
}

/// Maps a request to the caller key a policy counts against.
pub trait KeyExtractor: Send + Sync + fmt::Debug {
    fn extract(&self, ctx: &RequestContext) -> Result<String, KeyError>;
}

/// Built-in key strategies selectable from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Peer IP address
    #[default]
    ClientAddress,
    /// Value of a request header, such as an API key
    Header { name: String },
    /// Authenticated user id, falling back to the peer address for anonymous
    /// callers. The role itself only drives the limit, so a role change keeps
    /// the caller's counter.
    Role,
}

fn client_address(ctx: &RequestContext) -> Result<String, KeyError> {
    ctx.client_addr
        .map(|addr| addr.to_string())
        .ok_or(KeyError::MissingClientAddress)
}

impl KeyExtractor for KeyStrategy {
    fn extract(&self, ctx: &RequestContext) -> Result<String, KeyError> {
        match self {
            KeyStrategy::ClientAddress => client_address(ctx),
            KeyStrategy::Header { name } => match ctx.header(name).map(str::trim) {
                Some("") => Err(KeyError::Empty),
                Some(value) => Ok(value.to_string()),
                None => Err(KeyError::MissingHeader(name.clone())),
            },
            KeyStrategy::Role => match ctx.identity.as_ref().and_then(|i| i.user_id.as_deref()) {
                Some(user) if !user.is_empty() => Ok(format!("user:{user}")),
                _ => client_address(ctx),
            },
        }
    }
}

/// Adapter turning a closure into a [`KeyExtractor`].
pub struct FnExtractor<F>(F);

/// Build a key extractor from a closure.
pub fn from_fn<F>(f: F) -> FnExtractor<F>
where
    F: Fn(&RequestContext) -> Result<String, KeyError> + Send + Sync,
{
    FnExtractor(f)
}

impl<F> fmt::Debug for FnExtractor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnExtractor")
    }
}

impl<F> KeyExtractor for FnExtractor<F>
where
    F: Fn(&RequestContext) -> Result<String, KeyError> + Send + Sync,
{
    fn extract(&self, ctx: &RequestContext) -> Result<String, KeyError> {
        (self.0)(ctx)
    }
}
