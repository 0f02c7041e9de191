//! Opaque identifiers used throughout the overlay
//!
//! Unlike a generic `PeerIdentity` trait keyed to a swappable cryptographic
//! scheme, the overlay only ever carries opaque strings handed to it by the
//! embedding application (see the bootstrap rendezvous boundary in the top
//! level docs). These newtypes exist so the rest of the crate can't
//! accidentally swap a [`GameId`] for a [`PeerId`] at a call site.

use std::fmt;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// Sentinel destination meaning "route upward until the Host processes it"
pub const HOST_SENTINEL: &str = "HOST";

macro_rules! opaque_string_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
        pub struct $name(String);

        impl $name {
            /// Build a new identifier, rejecting an empty string
            pub fn new(value: impl Into<String>) -> Result<Self, IdentityError> {
                let value = value.into();
                if value.is_empty() {
                    return Err(IdentityError::Empty);
                }
                Ok(Self(value))
            }

            /// Borrow the underlying string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

opaque_string_id!(PeerId, "Opaque identifier of a peer in the transport");
opaque_string_id!(GameId, "Opaque identifier of the game/session the overlay serves");
opaque_string_id!(Secret, "Shared secret exchanged out-of-band at bootstrap");

/// Unique identifier per message, fresh on every send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub struct MsgId(uuid::Uuid);

impl MsgId {
    /// Generate a fresh random message id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

/// The final recipient of a message: a concrete peer, the Host sentinel, or
/// absent (link-local, never forwarded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    Peer(PeerId),
    Host,
}

impl Destination {
    pub fn is_host(&self) -> bool {
        matches!(self, Destination::Host)
    }

    pub fn as_peer(&self) -> Option<&PeerId> {
        match self {
            Destination::Peer(p) => Some(p),
            Destination::Host => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Peer(p) => write!(f, "{p}"),
            Destination::Host => write!(f, "{HOST_SENTINEL}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_peer_id() {
        assert!(PeerId::new("").is_err());
        assert!(PeerId::new("p1").is_ok());
    }

    #[test]
    fn msg_ids_are_unique() {
        assert_ne!(MsgId::generate(), MsgId::generate());
    }

    #[test]
    fn destination_display() {
        let p = PeerId::new("c1").unwrap();
        assert_eq!(Destination::Peer(p).to_string(), "c1");
        assert_eq!(Destination::Host.to_string(), "HOST");
    }
}
