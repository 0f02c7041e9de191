//! # canopy-core
//!
//! Core types, traits, and errors shared by every crate in the canopy
//! overlay protocol engine: the message envelope and wire kinds, peer/game
//! identifiers, the [`Transport`] abstraction (with an in-process
//! [`MockTransport`] for tests), and runtime configuration.

pub mod config;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod rate_limit;
pub mod transport;

pub use config::OverlayConfig;
pub use dedup::DedupSet;
pub use envelope::{AppPayload, ChildStatus, DescendantInfo, Envelope, MessageBody, PeerState, SeqEvent, PROTOCOL_VERSION};
pub use error::{CanopyError, CanopyResult, IdentityError, JoinError, ReplicationError, RoutingError, TransportError};
pub use ids::{Destination, GameId, MsgId, PeerId, Secret, HOST_SENTINEL};
pub use rate_limit::RateLimiter;
pub use transport::{ConnectionMetadata, ConnectionRole, MockNetwork, MockTransport, Transport, TransportEvent};
