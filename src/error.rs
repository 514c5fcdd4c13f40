use std::fmt;
use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::wire::ErrorEnvelope;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum SpfyError {
    /// The client has no session; nothing was sent.
    #[error("not authenticated")]
    AuthRequired,
    /// Stored credentials are past their expiry.
    #[error("access token expired")]
    TokenExpired,
    /// Obtaining or refreshing credentials failed.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// HTTP 429 or 5xx. `retry_after` is the server's `Retry-After` hint.
    #[error("rate limited (http {status}), retry after {retry_after:?}")]
    RateLimited { status: u16, retry_after: Duration },
    /// HTTP 403.
    #[error("forbidden: {0}")]
    Forbidden(Box<ErrorResponse>),
    /// The target device kept answering 202 until the busy retries ran out.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(Box<ErrorResponse>),
    /// Any other non-success HTTP status.
    #[error("api error: {0}")]
    Api(Box<ErrorResponse>),
    /// Network or request execution error from `reqwest`.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    /// Response decoding or protocol-shape validation error.
    #[error("decode error: {0}")]
    Decode(String),
    /// The ETag cache backend failed or returned an unreadable entry.
    #[error("cache error: {0}")]
    Cache(String),
    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// The client that produced a result has been dropped.
    #[error("issuing client is no longer alive")]
    ClientDropped,
}

/// Coarse classification of [`SpfyError`], recorded by the retry state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AuthRequired,
    TokenExpired,
    Auth,
    RateLimited,
    Forbidden,
    DeviceUnavailable,
    Api,
    Transport,
    Decode,
    Cache,
    Config,
    ClientDropped,
}

impl SpfyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthRequired => ErrorKind::AuthRequired,
            Self::TokenExpired => ErrorKind::TokenExpired,
            Self::Auth(_) => ErrorKind::Auth,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Self::Api(_) => ErrorKind::Api,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Cache(_) => ErrorKind::Cache,
            Self::Config(_) => ErrorKind::Config,
            Self::ClientDropped => ErrorKind::ClientDropped,
        }
    }

    /// Response metadata for errors produced from an HTTP reply.
    pub fn response(&self) -> Option<&ErrorResponse> {
        match self {
            Self::Forbidden(response) | Self::DeviceUnavailable(response) | Self::Api(response) => {
                Some(response)
            }
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { status, .. } => Some(*status),
            other => other.response().map(|response| response.status),
        }
    }
}

/// Metadata of a failed HTTP exchange.
#[derive(Clone, Debug)]
pub struct ErrorResponse {
    pub status: u16,
    pub url: String,
    pub headers: HeaderMap,
    /// Raw response body, possibly empty.
    pub body: String,
}

impl ErrorResponse {
    /// The upstream `{"error": {"message": ...}}` text, if the body carries one.
    pub fn message(&self) -> Option<String> {
        let trimmed = self.body.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return None;
        }
        serde_json::from_str::<ErrorEnvelope>(trimmed)
            .ok()
            .map(|envelope| envelope.error.message)
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(message) => write!(f, "http {} at {}: {}", self.status, self.url, message),
            None => write!(f, "http {} at {}", self.status, self.url),
        }
    }
}
