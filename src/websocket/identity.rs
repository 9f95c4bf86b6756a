//! Identity Resolution
//!
//! Authentication happens upstream; by the time a WebSocket upgrade reaches
//! this service the caller's identity, if any, has been resolved. A resolver
//! turns the upgrade request into zero or one [`UserId`].

use async_trait::async_trait;
use axum::http::HeaderMap;

use super::error::HandshakeError;
use super::messages::UserId;

/// Resolves the identity of a connecting client
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `Ok(None)` admits the connection anonymously; `Err` rejects it
    async fn resolve(&self, headers: &HeaderMap) -> Result<Option<UserId>, HandshakeError>;
}

/// Reads a numeric user id from a header set by the authentication gateway
#[derive(Debug, Clone)]
pub struct TrustedHeaderResolver {
    header: String,
}

impl TrustedHeaderResolver {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }

    pub fn header(&self) -> &str {
        &self.header
    }
}

impl Default for TrustedHeaderResolver {
    fn default() -> Self {
        Self::new("x-user-id")
    }
}

#[async_trait]
impl IdentityResolver for TrustedHeaderResolver {
    async fn resolve(&self, headers: &HeaderMap) -> Result<Option<UserId>, HandshakeError> {
        let Some(value) = headers.get(self.header.as_str()) else {
            return Ok(None);
        };

        let invalid = || HandshakeError::InvalidIdentity {
            header: self.header.clone(),
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        };

        let text = value.to_str().map_err(|_| invalid())?.trim();
        if text.is_empty() {
            return Ok(None);
        }
        text.parse::<u64>().map(|id| Some(UserId(id))).map_err(|_| invalid())
    }
}
