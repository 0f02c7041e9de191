//! Wire message envelope and the closed set of message kinds
//!
//! Every message on the wire is an [`Envelope`] wrapping one [`MessageBody`]
//! variant. `MessageBody` is a closed tagged union (postcard encodes the enum
//! discriminant as the `t` tag) — callers match exhaustively, so a new kind
//! is a compile error everywhere it isn't yet handled.

use serde::{Deserialize, Serialize};

use crate::ids::{Destination, GameId, MsgId, PeerId};

/// Current wire protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// A peer's reported liveness state in a `SUBTREE_STATUS` report
///
/// Only [`PeerState::Ok`] is ever constructed by this implementation's
/// Topology Aggregator (see the Open Question record in DESIGN.md); the
/// richer variants are part of the wire contract for a reporting feature
/// this crate does not implement, and are kept so a future reporter and
/// older/newer peers agree on the encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Ok,
    Suspect,
    Partitioned,
    Offline,
}

/// One entry in a `SUBTREE_STATUS.descendants` list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescendantInfo {
    pub id: PeerId,
    pub hops: u32,
    pub free_slots: u32,
}

/// One entry in a `SUBTREE_STATUS.children` list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildStatus {
    pub id: PeerId,
    pub state: PeerState,
    pub last_rain_seq: u64,
    pub free_slots: u32,
}

/// Opaque application payload: the engine transports `{type, data}` without
/// interpreting it (see top-level scope notes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppPayload {
    pub kind: String,
    pub data: Vec<u8>,
}

impl AppPayload {
    pub fn new(kind: impl Into<String>, data: Vec<u8>) -> Self {
        Self { kind: kind.into(), data }
    }
}

/// One cached `{seq, event}` pair as carried in a `STATE` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqEvent {
    pub seq: u64,
    pub event: AppPayload,
}

/// The closed set of message kinds (§6.1). The enum discriminant is the wire
/// `t` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageBody {
    JoinRequest {
        secret: crate::ids::Secret,
    },
    JoinAccept {
        player_id: PeerId,
        payload: Vec<u8>,
        seeds: Vec<PeerId>,
        keep_alive: bool,
        rain_seq: u64,
        game_seq: u64,
    },
    JoinReject {
        reason: String,
    },
    AttachRequest {
        depth: u32,
    },
    AttachAccept {
        parent_id: PeerId,
        level: u32,
        cousin_candidates: Vec<PeerId>,
        children_max: u32,
        children_used: u32,
    },
    AttachReject {
        reason: String,
        redirect: Vec<PeerId>,
        depth_hint: u32,
    },
    Rain {
        rain_seq: u64,
    },
    ReqState {
        from_rain_seq: u64,
        from_game_seq: u64,
    },
    State {
        latest_rain_seq: u64,
        latest_game_seq: u64,
        events: Vec<SeqEvent>,
        min_game_seq_available: u64,
        truncated: bool,
    },
    ReqCousins {
        requester_depth: u32,
        desired_count: u32,
    },
    Cousins {
        candidates: Vec<PeerId>,
    },
    SubtreeStatus {
        last_rain_seq: u64,
        state: PeerState,
        children: Vec<ChildStatus>,
        subtree_count: u64,
        descendants: Vec<DescendantInfo>,
        free_slots: u32,
    },
    RebindRequest {
        last_rain_seq: u64,
        last_game_seq: u64,
        subtree_count: u64,
        reason: String,
    },
    RebindAssign {
        new_parent_candidates: Vec<PeerId>,
    },
    GameEvent {
        game_seq: u64,
        event: AppPayload,
    },
    GameCmd {
        cmd: AppPayload,
    },
    GameAck {
        ok: bool,
    },
    ReqPayload {
        payload_type: String,
    },
    Payload {
        payload_type: String,
        data: Vec<u8>,
    },
    Ping,
    Pong,
    Ack,
}

impl MessageBody {
    /// Short name for the kind, used in logging (never part of the wire
    /// format itself — the enum discriminant already is).
    pub fn kind_name(&self) -> &'static str {
        match self {
            MessageBody::JoinRequest { .. } => "JOIN_REQUEST",
            MessageBody::JoinAccept { .. } => "JOIN_ACCEPT",
            MessageBody::JoinReject { .. } => "JOIN_REJECT",
            MessageBody::AttachRequest { .. } => "ATTACH_REQUEST",
            MessageBody::AttachAccept { .. } => "ATTACH_ACCEPT",
            MessageBody::AttachReject { .. } => "ATTACH_REJECT",
            MessageBody::Rain { .. } => "RAIN",
            MessageBody::ReqState { .. } => "REQ_STATE",
            MessageBody::State { .. } => "STATE",
            MessageBody::ReqCousins { .. } => "REQ_COUSINS",
            MessageBody::Cousins { .. } => "COUSINS",
            MessageBody::SubtreeStatus { .. } => "SUBTREE_STATUS",
            MessageBody::RebindRequest { .. } => "REBIND_REQUEST",
            MessageBody::RebindAssign { .. } => "REBIND_ASSIGN",
            MessageBody::GameEvent { .. } => "GAME_EVENT",
            MessageBody::GameCmd { .. } => "GAME_CMD",
            MessageBody::GameAck { .. } => "GAME_ACK",
            MessageBody::ReqPayload { .. } => "REQ_PAYLOAD",
            MessageBody::Payload { .. } => "PAYLOAD",
            MessageBody::Ping => "PING",
            MessageBody::Pong => "PONG",
            MessageBody::Ack => "ACK",
        }
    }

    /// Whether this kind is ever allowed to travel over a cousin connection:
    /// only REQ_STATE/STATE, plus the bare control messages needed to drive
    /// the reply path. Cousin links never carry RAIN or GAME_EVENT.
    pub fn allowed_on_cousin_link(&self) -> bool {
        matches!(
            self,
            MessageBody::ReqState { .. } | MessageBody::State { .. } | MessageBody::Ack
        )
    }
}

/// Every message is this envelope plus a type-specific body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    pub game_id: GameId,
    pub src: PeerId,
    pub msg_id: MsgId,
    pub reply_to: Option<MsgId>,
    /// Trace-only, append-on-forward. Never consulted for routing decisions
    /// except by reply builders constructing a reverse route.
    pub path: Vec<PeerId>,
    /// Explicit routing vector: `[hop0, hop1, .., dest]`.
    pub route: Option<Vec<PeerId>>,
    pub dest: Option<Destination>,
    pub ack: bool,
    pub body: MessageBody,
}

impl Envelope {
    pub fn new(game_id: GameId, src: PeerId, body: MessageBody) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            game_id,
            src,
            msg_id: MsgId::generate(),
            reply_to: None,
            path: Vec::new(),
            route: None,
            dest: None,
            ack: false,
            body,
        }
    }

    pub fn with_dest(mut self, dest: Destination) -> Self {
        self.dest = Some(dest);
        self
    }

    pub fn with_route(mut self, route: Vec<PeerId>) -> Self {
        self.route = Some(route);
        self
    }

    pub fn with_reply_to(mut self, reply_to: MsgId) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn requesting_ack(mut self) -> Self {
        self.ack = true;
        self
    }

    /// Append `hop` to the trace path unless it is already the last entry
    /// (idempotent append-on-forward, per §4.3 path augmentation).
    pub fn append_hop(&mut self, hop: PeerId) {
        if self.path.last() != Some(&hop) {
            self.path.push(hop);
        }
    }

    /// Build the reverse-path route a reply should carry, per §4.3 "reply
    /// paths": `[self, reverse(incoming.path)]`.
    pub fn reverse_route(&self, replying_as: PeerId) -> Vec<PeerId> {
        let mut route = vec![replying_as];
        route.extend(self.path.iter().rev().cloned());
        route
    }

    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> PeerId {
        PeerId::new(s).unwrap()
    }

    #[test]
    fn append_hop_is_idempotent_on_repeat() {
        let mut env = Envelope::new(GameId::new("g").unwrap(), pid("a"), MessageBody::Ping);
        env.append_hop(pid("a"));
        env.append_hop(pid("a"));
        assert_eq!(env.path, vec![pid("a")]);
    }

    #[test]
    fn reverse_route_prefixes_self_then_reversed_path() {
        let mut env = Envelope::new(GameId::new("g").unwrap(), pid("leaf"), MessageBody::Ping);
        env.append_hop(pid("a"));
        env.append_hop(pid("b"));
        let route = env.reverse_route(pid("responder"));
        assert_eq!(route, vec![pid("responder"), pid("b"), pid("a")]);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let env = Envelope::new(
            GameId::new("g").unwrap(),
            pid("a"),
            MessageBody::Rain { rain_seq: 42 },
        );
        let bytes = env.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert!(matches!(decoded.body, MessageBody::Rain { rain_seq: 42 }));
    }

    #[test]
    fn cousin_link_allows_only_state_traffic() {
        assert!(MessageBody::ReqState { from_rain_seq: 0, from_game_seq: 0 }.allowed_on_cousin_link());
        assert!(!MessageBody::Rain { rain_seq: 1 }.allowed_on_cousin_link());
        assert!(!MessageBody::GameEvent {
            game_seq: 1,
            event: AppPayload::new("t", vec![])
        }
        .allowed_on_cousin_link());
    }
}
