//! Host-side peer core (§3 "Host state (singleton)", §4 component design)
//!
//! [`HostCore`] is a pure state machine: every inbound envelope or timer
//! firing is translated into a list of [`Outbound`] sends (and, where the
//! application needs to observe something, a [`HostEvent`]). No I/O happens
//! here — [`crate::handle::HostHandle`]'s background loop is the only place
//! touching a [`canopy_core::Transport`]. This split keeps the protocol
//! logic deterministically testable against a plain `Vec<Outbound>`
//! assertion, without a live network.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashSet;
use rand::Rng;

use canopy_core::error::RoutingError;
use canopy_core::{
    AppPayload, DedupSet, Destination, Envelope, GameId, MessageBody, MsgId, OverlayConfig, PeerId, RateLimiter,
    Secret,
};
use canopy_overlay::{build_state_response, host_has_spare_capacity, host_seed_list};
use canopy_replication::{HostReplicationState, PendingRegistry};
use canopy_routing::HostTopology;

use crate::outbound::Outbound;

/// Something the embedding application may want to observe. The Host peer
/// loop bubbles these up to the [`crate::handle::OverlayHandle`]; routing,
/// dedup, and topology bookkeeping never reach the application (§7
/// "User-visible behavior").
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// A `GAME_CMD` arrived from a Node (§4.4 "GAME_CMD").
    GameCmdReceived { from: PeerId, cmd: AppPayload },
    /// A direct child's connection closed; it and everything routed through
    /// it has been evicted from the topology.
    ChildLost { peer: PeerId },
}

/// Everything [`HostCore::handle_inbound`] and the timer-firing methods
/// produce: sends to issue, plus events for the application.
#[derive(Debug, Clone, Default)]
pub struct HostEffects {
    pub outbound: Vec<Outbound>,
    pub events: Vec<HostEvent>,
    /// Peers whose connection the driving loop should close after the given
    /// grace period (§4.1 bootstrap, `keepAlive=false`).
    pub close_after: Vec<(PeerId, std::time::Duration)>,
}

impl HostEffects {
    fn sends(outbound: Vec<Outbound>) -> Self {
        Self { outbound, events: Vec::new(), close_after: Vec::new() }
    }

    fn none() -> Self {
        Self::default()
    }
}

pub struct HostCore {
    config: OverlayConfig,
    host_id: PeerId,
    game_id: GameId,
    secret: Secret,
    children: DashSet<PeerId>,
    topology: HostTopology,
    replication: HostReplicationState,
    dedup: DedupSet,
    rate_limiter: RateLimiter,
    pending_acks: PendingRegistry<bool>,
    qr_seq: AtomicU64,
}

impl HostCore {
    pub fn new(host_id: PeerId, game_id: GameId, secret: Secret, config: OverlayConfig) -> Self {
        let dedup = DedupSet::new(config.dedup_cache_size, config.dedup_eviction_fraction);
        let rate_limiter = RateLimiter::new(config.rate_limit_window, config.rate_limit_max_attempts);
        let replication = HostReplicationState::new(config.host_cache_size);
        let pending_acks = PendingRegistry::new(config.ack_timeout);
        Self {
            config,
            host_id,
            game_id,
            secret,
            children: DashSet::new(),
            topology: HostTopology::new(),
            replication,
            dedup,
            rate_limiter,
            pending_acks,
            qr_seq: AtomicU64::new(0),
        }
    }

    pub fn host_id(&self) -> &PeerId {
        &self.host_id
    }

    pub fn children(&self) -> Vec<PeerId> {
        self.children.iter().map(|e| e.clone()).collect()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Register a pending ACK before sending; returns the future the
    /// application awaits (§6.3 `sendToPeer(.., ack=true)`).
    pub fn wait_for_ack(&self, msg_id: MsgId) -> impl std::future::Future<Output = Result<bool, canopy_core::error::PendingError>> {
        self.pending_acks.register(msg_id)
    }

    fn envelope(&self, body: MessageBody) -> Envelope {
        Envelope::new(self.game_id.clone(), self.host_id.clone(), body)
    }

    /// Build a reply that retraces the request's path back to its origin
    /// (§4.3 "Reply paths").
    fn reply_to(&self, incoming: &Envelope, body: MessageBody) -> Envelope {
        let mut env = self.envelope(body);
        env.reply_to = Some(incoming.msg_id);
        env.dest = Some(Destination::Peer(incoming.src.clone()));
        env.route = Some(incoming.reverse_route(self.host_id.clone()));
        env
    }

    /// Handle one inbound envelope arriving on the connection to `from` (a
    /// direct child — the Host has no parent and no cousins). Applies dedup
    /// and `gameId` drop rules before dispatch (§4.3).
    pub fn handle_inbound(&self, from: PeerId, mut env: Envelope, rng: &mut impl Rng) -> HostEffects {
        if env.game_id != self.game_id {
            tracing::debug!(%from, "dropping envelope: gameId mismatch");
            return HostEffects::none();
        }
        if self.dedup.check_and_insert(env.msg_id) {
            tracing::debug!(%from, msg_id = %env.msg_id, "dropping duplicate message");
            return HostEffects::none();
        }
        env.append_hop(self.host_id.clone());

        match env.body.clone() {
            MessageBody::JoinRequest { secret } => self.handle_join_request(from, secret, rng),
            MessageBody::SubtreeStatus { free_slots, descendants, .. } => {
                self.handle_subtree_status(from, free_slots, descendants)
            }
            MessageBody::GameCmd { cmd } => self.handle_game_cmd(from, cmd, &env),
            MessageBody::RebindRequest { reason, .. } => self.handle_rebind_request(from, &env, reason, rng),
            MessageBody::ReqState { from_rain_seq: _, from_game_seq } => self.handle_req_state(&env, from_game_seq),
            // Host has no parent, so it's always the end of a strict-forward
            // chain (§4.6): reply with an empty candidate list rather than
            // forwarding further.
            MessageBody::ReqCousins { .. } => {
                let reply = self.reply_to(&env, MessageBody::Cousins { candidates: Vec::new() });
                HostEffects::sends(vec![Outbound::new(from, reply)])
            }
            MessageBody::Ping => HostEffects::sends(vec![Outbound::new(from, self.reply_to(&env, MessageBody::Pong))]),
            MessageBody::Ack => {
                if let Some(acked) = env.reply_to {
                    self.pending_acks.resolve(&acked, true);
                }
                HostEffects::none()
            }
            other => {
                tracing::debug!(kind = other.kind_name(), "host has no handler for this kind, dropping");
                HostEffects::none()
            }
        }
    }

    fn handle_join_request(&self, from: PeerId, secret: Secret, rng: &mut impl Rng) -> HostEffects {
        if secret != self.secret {
            let reject = self.envelope(MessageBody::JoinReject { reason: "secret mismatch".into() });
            return HostEffects::sends(vec![Outbound::new(from, reject)]);
        }
        if !self.rate_limiter.check_and_record(&from) {
            tracing::warn!(%from, "join request rate-limited");
            return HostEffects::none();
        }

        let keep_alive = host_has_spare_capacity(self.children.len(), self.config.max_host_children);
        let direct_children = self.children();
        let seeds = host_seed_list(
            &self.topology,
            &direct_children,
            self.config.seed_list_min,
            self.config.seed_list_max,
            rng,
        );

        if keep_alive {
            self.children.insert(from.clone());
        }

        let accept = self.envelope(MessageBody::JoinAccept {
            player_id: from.clone(),
            payload: Vec::new(),
            seeds,
            keep_alive,
            rain_seq: self.replication.rain_seq(),
            game_seq: self.replication.game_seq(),
        });
        let mut effects = HostEffects::sends(vec![Outbound::new(from.clone(), accept)]);
        if !keep_alive {
            effects.close_after.push((from, self.config.join_reject_grace));
        }
        effects
    }

    fn handle_subtree_status(&self, from: PeerId, free_slots: u32, descendants: Vec<canopy_core::DescendantInfo>) -> HostEffects {
        self.children.insert(from.clone());
        self.topology.apply_subtree_status(&from, free_slots, &descendants);
        HostEffects::none()
    }

    fn handle_game_cmd(&self, from: PeerId, cmd: AppPayload, env: &Envelope) -> HostEffects {
        let mut effects = HostEffects {
            outbound: Vec::new(),
            events: vec![HostEvent::GameCmdReceived { from: from.clone(), cmd }],
            ..Default::default()
        };
        if env.ack {
            effects.outbound.push(Outbound::new(from, self.reply_to(env, MessageBody::Ack)));
        }
        effects
    }

    fn handle_rebind_request(&self, from: PeerId, env: &Envelope, reason: String, rng: &mut impl Rng) -> HostEffects {
        tracing::warn!(%from, %reason, "node requested rebind");
        let direct_children: Vec<PeerId> = self.children().into_iter().filter(|c| c != &from).collect();
        let candidates = host_seed_list(
            &self.topology,
            &direct_children,
            self.config.seed_list_min,
            self.config.seed_list_max,
            rng,
        );
        let assign = self.reply_to(env, MessageBody::RebindAssign { new_parent_candidates: candidates });
        HostEffects::sends(vec![Outbound::new(from, assign)])
    }

    fn handle_req_state(&self, env: &Envelope, from_game_seq: u64) -> HostEffects {
        let body = build_state_response(
            self.replication.cache(),
            from_game_seq,
            self.replication.rain_seq(),
            self.replication.game_seq(),
        );
        let reply = self.reply_to(env, body);
        HostEffects::sends(vec![Outbound::new(env.src.clone(), reply)])
    }

    /// 1 Hz `RAIN` broadcast to every direct child (§4.4, §5 timers).
    pub fn on_rain_tick(&self) -> HostEffects {
        let seq = self.replication.next_rain_seq();
        let body = MessageBody::Rain { rain_seq: seq };
        let outbound = self
            .children()
            .into_iter()
            .map(|child| Outbound::new(child.clone(), self.envelope(body.clone())))
            .collect();
        HostEffects::sends(outbound)
    }

    /// `broadcastGameEvent(type, data)` (§6.3): assign `gameSeq`, cache, fan
    /// out to every direct child (each rebroadcasts further down its own
    /// subtree).
    pub fn broadcast_game_event(&self, payload: AppPayload) -> (u64, HostEffects) {
        let (seq, event) = self.replication.emit_game_event(payload);
        let body = MessageBody::GameEvent { game_seq: seq, event };
        let outbound = self
            .children()
            .into_iter()
            .map(|child| Outbound::new(child.clone(), self.envelope(body.clone())))
            .collect();
        (seq, HostEffects::sends(outbound))
    }

    /// `sendToPeer(peerId, type, data, ack?)` (§6.3): routed unicast.
    /// Returns the envelope's `msgId` (register [`HostCore::wait_for_ack`]
    /// with it *before* sending if `ack` is set) plus the single send to
    /// issue on the connection toward `dest`'s next hop.
    pub fn send_to_peer(&self, dest: PeerId, payload: AppPayload, ack: bool) -> Result<(MsgId, Outbound), RoutingError> {
        let next_hop = if self.children.contains(&dest) {
            dest.clone()
        } else {
            self.topology
                .entry(&dest)
                .map(|e| e.next_hop)
                .ok_or_else(|| RoutingError::NoRoute(dest.to_string()))?
        };
        let (seq, event) = self.replication.emit_game_event(payload);
        let mut env = self.envelope(MessageBody::GameEvent { game_seq: seq, event });
        env.dest = Some(Destination::Peer(dest.clone()));
        env.route = Some(canopy_routing::host_initial_route(&self.host_id, &next_hop));
        if ack {
            env = env.requesting_ack();
        }
        Ok((env.msg_id, Outbound::new(next_hop, env)))
    }

    /// Called when a direct child's transport connection closes (§4.2
    /// "Evict entries whose nextHop connection closes").
    pub fn on_child_closed(&self, child: &PeerId) -> HostEffects {
        self.children.remove(child);
        self.topology.evict_next_hop(child);
        HostEffects { outbound: Vec::new(), events: vec![HostEvent::ChildLost { peer: child.clone() }], ..Default::default() }
    }

    /// Background rate-limiter sweep (§4.8, every 30s).
    pub fn sweep_rate_limiter(&self) {
        self.rate_limiter.sweep();
    }

    /// Connection-string/QR payload fields (§6.3), minus the transport's
    /// own bootstrap detail (address, relay URL, etc.) which is the
    /// embedding application's concern.
    pub fn next_qr_seq(&self) -> u64 {
        self.qr_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn rain_seq(&self) -> u64 {
        self.replication.rain_seq()
    }

    pub fn game_seq(&self) -> u64 {
        self.replication.game_seq()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::DescendantInfo;

    fn pid(s: &str) -> PeerId {
        PeerId::new(s).unwrap()
    }

    fn host() -> HostCore {
        HostCore::new(pid("host"), GameId::new("g").unwrap(), Secret::new("s").unwrap(), OverlayConfig::default())
    }

    fn join_env(secret: &str) -> Envelope {
        Envelope::new(
            GameId::new("g").unwrap(),
            pid("p1"),
            MessageBody::JoinRequest { secret: Secret::new(secret).unwrap() },
        )
    }

    #[test]
    fn join_request_with_correct_secret_is_accepted_with_capacity() {
        let host = host();
        let mut rng = rand::rng();
        let effects = host.handle_inbound(pid("p1"), join_env("s"), &mut rng);
        match &effects.outbound[0].envelope.body {
            MessageBody::JoinAccept { keep_alive, .. } => assert!(keep_alive),
            other => panic!("expected JoinAccept, got {other:?}"),
        }
        assert_eq!(host.children(), vec![pid("p1")]);
    }

    #[test]
    fn sixth_join_request_gets_keep_alive_false() {
        let host = host();
        let mut rng = rand::rng();
        for i in 0..5 {
            let p = pid(&format!("c{i}"));
            host.handle_inbound(
                p.clone(),
                Envelope::new(GameId::new("g").unwrap(), p, MessageBody::JoinRequest { secret: Secret::new("s").unwrap() }),
                &mut rng,
            );
        }
        assert_eq!(host.children().len(), 5);
        let effects = host.handle_inbound(pid("p6"), join_env("s"), &mut rng);
        match &effects.outbound[0].envelope.body {
            MessageBody::JoinAccept { keep_alive, seeds, .. } => {
                assert!(!keep_alive);
                assert!(seeds.len() >= 5, "seeds should be 5..10");
            }
            other => panic!("expected JoinAccept, got {other:?}"),
        }
        assert_eq!(effects.close_after, vec![(pid("p6"), host.config.join_reject_grace)]);
        assert!(!host.children().contains(&pid("p6")));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let host = host();
        let mut rng = rand::rng();
        let effects = host.handle_inbound(pid("p1"), join_env("wrong"), &mut rng);
        assert!(matches!(effects.outbound[0].envelope.body, MessageBody::JoinReject { .. }));
        assert!(host.children().is_empty());
    }

    #[test]
    fn duplicate_msg_id_is_dropped() {
        let host = host();
        let mut rng = rand::rng();
        let env = join_env("s");
        let first = host.handle_inbound(pid("p1"), env.clone(), &mut rng);
        assert!(!first.outbound.is_empty());
        let second = host.handle_inbound(pid("p1"), env, &mut rng);
        assert!(second.outbound.is_empty());
    }

    #[test]
    fn rain_tick_broadcasts_to_all_children_with_increasing_seq() {
        let host = host();
        let mut rng = rand::rng();
        host.handle_inbound(pid("c1"), join_env("s"), &mut rng);
        let effects = host.on_rain_tick();
        assert_eq!(effects.outbound.len(), 1);
        assert!(matches!(effects.outbound[0].envelope.body, MessageBody::Rain { rain_seq: 1 }));
    }

    #[test]
    fn broadcast_game_event_fans_out_to_children() {
        let host = host();
        let mut rng = rand::rng();
        for name in ["c1", "c2"] {
            let p = pid(name);
            host.handle_inbound(
                p.clone(),
                Envelope::new(GameId::new("g").unwrap(), p, MessageBody::JoinRequest { secret: Secret::new("s").unwrap() }),
                &mut rng,
            );
        }
        let (seq, effects) = host.broadcast_game_event(AppPayload::new("E", vec![1]));
        assert_eq!(seq, 1);
        assert_eq!(effects.outbound.len(), 2);
    }

    #[test]
    fn send_to_peer_routes_through_descendant_next_hop() {
        let host = host();
        host.topology.apply_subtree_status(
            &pid("c1"),
            3,
            &[DescendantInfo { id: pid("l"), hops: 1, free_slots: 2 }],
        );
        let (_, outbound) = host.send_to_peer(pid("l"), AppPayload::new("T", vec![]), true).unwrap();
        assert_eq!(outbound.to, pid("c1"));
        assert_eq!(outbound.envelope.route, Some(vec![pid("host"), pid("c1")]));
        assert!(outbound.envelope.ack);
    }

    #[test]
    fn child_close_evicts_topology_entries() {
        let host = host();
        host.topology.apply_subtree_status(
            &pid("c1"),
            3,
            &[DescendantInfo { id: pid("l"), hops: 1, free_slots: 2 }],
        );
        let mut rng = rand::rng();
        host.handle_inbound(
            pid("c1"),
            Envelope::new(GameId::new("g").unwrap(), pid("c1"), MessageBody::JoinRequest { secret: Secret::new("s").unwrap() }),
            &mut rng,
        );
        let effects = host.on_child_closed(&pid("c1"));
        assert!(matches!(effects.events[0], HostEvent::ChildLost { .. }));
        assert!(host.topology.entry(&pid("l")).is_none());
    }
}
