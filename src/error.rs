//! Crate-level error types.
//!
//! [`QuotelineError`] unifies every error source (configuration, WebSocket,
//! JSON, backend replies) behind a single enum so callers can match on the
//! variant they care about while still using the `?` operator for easy
//! propagation.
//!
//! Retry decisions are made once, here: [`QuotelineError::transient_kind`]
//! maps an error onto the small closed set of [`TransientKind`]s that the
//! request correlator knows how to wait out.

use std::time::Duration;

use crate::models::ApiError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QuotelineError>;

/// Top-level error type returned by all public APIs.
#[derive(Debug, thiserror::Error)]
pub enum QuotelineError {
    /// Configuration values were missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A WebSocket operation (connect, send, receive) failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An inbound frame could not be interpreted.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The backend answered a request with an `error` object.
    #[error("api error {0}")]
    Api(ApiError),

    /// No open connection was available to carry the request.
    #[error("connection is not open")]
    NotConnected,

    /// The connection dropped while a reply was outstanding.
    #[error("connection closed before a reply arrived")]
    ConnectionClosed,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A retryable failure kept recurring until the retry budget ran out.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<QuotelineError>,
    },

    /// The manager's feed channel was already taken by another registry.
    #[error("stream feed already claimed by another registry")]
    FeedClaimed,
}

/// Failure categories the correlator may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientKind {
    /// The transport is not (yet) open. Always retried.
    NotReady,
    /// The backend still holds a subscription for the same stream.
    AlreadySubscribed,
    /// The backend throttled the request.
    RateLimit,
}

impl QuotelineError {
    /// Classifies this error as transient, or `None` when it is fatal for
    /// the request that produced it.
    pub fn transient_kind(&self) -> Option<TransientKind> {
        match self {
            Self::NotConnected | Self::ConnectionClosed | Self::WebSocket(_) => {
                Some(TransientKind::NotReady)
            }
            Self::Api(error) => error.kind.transient_kind(),
            _ => None,
        }
    }

    /// Returns the backend error carried by this error, if any.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Api(error) => Some(error),
            Self::RetriesExhausted { last, .. } => last.api_error(),
            _ => None,
        }
    }
}
