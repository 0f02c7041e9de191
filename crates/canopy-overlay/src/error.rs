//! Aggregating error type for the overlay control plane (§4.9)
//!
//! Composes `canopy-core`'s per-concern enums plus the two failure modes
//! specific to this crate (join negotiation, recovery) the way
//! `IndrasError` aggregates `IdentityError`/`RoutingError`/`TransportError`.

use thiserror::Error;

use canopy_core::error::{JoinError, PendingError, RoutingError, TransportError};

/// Aggregating error type for the overlay control plane
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Pending(#[from] PendingError),
}

pub type OverlayResult<T> = Result<T, OverlayError>;
