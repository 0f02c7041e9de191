//! Aggregating error type for the peer-facing API surface (§6.3)

use thiserror::Error;

use canopy_core::error::{PendingError, RoutingError, TransportError};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Pending(#[from] PendingError),

    #[error("postcard encode/decode error: {0}")]
    Codec(#[from] postcard::Error),
}

pub type PeerResult<T> = Result<T, PeerError>;
