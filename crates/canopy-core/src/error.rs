//! Error types for the canopy overlay engine

use thiserror::Error;

/// Top-level error type aggregating every component's failure modes
#[derive(Debug, Error)]
pub enum CanopyError {
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),

    #[error("join/attach error: {0}")]
    Join(#[from] JoinError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors related to peer identity parsing
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid peer id: {0}")]
    InvalidFormat(String),

    #[error("empty peer id")]
    Empty,
}

/// Errors surfaced by a [`crate::transport::Transport`] implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("peer not connected: {0}")]
    PeerNotConnected(String),

    #[error("metadata rejected: {0}")]
    MetadataRejected(String),

    #[error("encode error: {0}")]
    Encode(#[from] postcard::Error),
}

/// Errors related to routing and forwarding
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no route available to {0}")]
    NoRoute(String),

    #[error("destination unroutable and no parent fallback")]
    Unroutable,

    #[error("message envelope malformed: {0}")]
    MalformedEnvelope(String),
}

/// Errors related to the replication engine (RAIN/GAME_EVENT caches)
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("event cache is empty")]
    CacheEmpty,

    #[error("stale sequence: got {got}, already at {have}")]
    StaleSequence { got: u64, have: u64 },
}

/// Errors related to join/attach negotiation
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("secret mismatch")]
    SecretMismatch,

    #[error("game id mismatch")]
    GameIdMismatch,

    #[error("host has no spare capacity")]
    HostFull,

    #[error("max attach attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),

    #[error("max redirect depth ({0}) exceeded")]
    MaxRedirectDepthExceeded(u32),

    #[error("no seeds remaining and host unreachable")]
    NoSeedsRemaining,
}

/// Errors in validating an [`crate::config::OverlayConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be in {range}, got {value}")]
    OutOfRange {
        field: &'static str,
        range: &'static str,
        value: String,
    },
}

/// Errors surfaced to the application by pending futures (`waitForAck`, `requestPayload`)
#[derive(Debug, Error)]
pub enum PendingError {
    #[error("timed out waiting for reply")]
    TimedOut,

    #[error("peer closed before reply arrived")]
    Closing,
}

/// Result alias for canopy operations
pub type CanopyResult<T> = Result<T, CanopyError>;
