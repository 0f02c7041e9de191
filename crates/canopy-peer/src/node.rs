//! Node-side peer core (§3 "Node state (per-node)", §4 component design)
//!
//! [`NodeCore`] bundles every per-node component — the Router
//! (`canopy-routing`), the Topology Aggregator, the state machine, the
//! cousin manager, the join/attach negotiator, and the replication engine —
//! behind the same pure "envelope/tick in, [`Outbound`]s and [`NodeEvent`]s
//! out" shape as [`crate::host::HostCore`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use dashmap::DashSet;
use rand::Rng;

use canopy_core::error::RoutingError;
use canopy_core::{
    AppPayload, ChildStatus, DedupSet, Destination, Envelope, GameId, MessageBody, MsgId, OverlayConfig, PeerId,
    PeerState, RateLimiter, Secret,
};
use canopy_overlay::{
    apply_state_response, build_rebind_request, build_req_state, build_state_response, find_cousin_candidates,
    node_has_spare_capacity, redirect_candidates, HostFallbackPacer, JoinAttachState, NodeState, NodeStateMachine,
    TickOutcome,
};
use canopy_replication::{NodeReplicationState, PendingRegistry};
use canopy_routing::{decide_route, IncomingLink, NodeTopology, RouteDecision};

use crate::outbound::Outbound;

/// Something the embedding application, or the driving loop's connection
/// manager, may need to act on as a result of handling an envelope or tick.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Attach (bootstrap `JOIN_ACCEPT` or `ATTACH_ACCEPT`) succeeded.
    Attached { parent: PeerId, depth: u32 },
    /// The current attach attempt was rejected outright (bad secret, or
    /// `attachAttempts`/`redirectDepth` exhausted) — the application should
    /// stop trying or re-authenticate directly with the Host.
    AttachFailed { reason: String },
    /// The driving loop should connect to `candidates` and attempt
    /// `ATTACH_REQUEST` against the next one (§4.1 redirect/seed retry).
    TryNextCandidates { candidates: Vec<PeerId> },
    /// The driving loop should open direct connections to `candidates` as
    /// cousin links (§4.6), up to `cousinCap`.
    ConnectCousins { candidates: Vec<PeerId> },
    /// A `GAME_EVENT` (fresh or repaired via `STATE`) reached the
    /// application (§6.3 `onGameEventReceived`).
    GameEventReceived { game_seq: u64, event: AppPayload },
    /// A `REQ_PAYLOAD` arrived for `payload_type`; the application must
    /// answer with [`NodeCore::respond_payload`] using `request_msg_id`.
    PayloadRequested { from: PeerId, payload_type: String, request_msg_id: MsgId },
    /// The parent connection closed.
    ParentLost,
    /// A direct child's connection closed.
    ChildLost { peer: PeerId },
}

#[derive(Debug, Clone, Default)]
pub struct NodeEffects {
    pub outbound: Vec<Outbound>,
    pub events: Vec<NodeEvent>,
}

impl NodeEffects {
    fn sends(outbound: Vec<Outbound>) -> Self {
        Self { outbound, events: Vec::new() }
    }

    fn none() -> Self {
        Self::default()
    }

    fn event(event: NodeEvent) -> Self {
        Self { outbound: Vec::new(), events: vec![event] }
    }
}

pub struct NodeCore {
    config: OverlayConfig,
    own_id: PeerId,
    game_id: GameId,
    secret: Secret,
    /// The Host this node originally bootstrapped against — the fallback
    /// attach target when no cousin is reachable after a parent crash
    /// (§4.7 "Crash of a parent").
    host_id: PeerId,

    parent: RwLock<Option<PeerId>>,
    depth: AtomicU32,

    children: DashSet<PeerId>,
    cousins: DashSet<PeerId>,
    topology: NodeTopology,
    replication: NodeReplicationState,

    state_machine: Mutex<NodeStateMachine>,
    join_state: Mutex<JoinAttachState>,
    host_fallback_pacer: Mutex<HostFallbackPacer>,

    dedup: DedupSet,
    rate_limiter: RateLimiter,
    pending_acks: PendingRegistry<bool>,
    pending_payloads: PendingRegistry<Vec<u8>>,
    pending_pings: PendingRegistry<()>,
}

impl NodeCore {
    pub fn new(own_id: PeerId, game_id: GameId, secret: Secret, config: OverlayConfig, host_id: PeerId) -> Self {
        let state_machine = NodeStateMachine::new(
            config.stall_threshold,
            config.patch_to_rebind_threshold,
            config.rebind_jitter_max,
        );
        let join_state = JoinAttachState::new(
            config.max_attach_attempts,
            config.max_redirect_depth,
            config.attach_backoff_base,
            config.attach_backoff_cap,
        );
        let host_fallback_pacer = HostFallbackPacer::new(config.req_state_host_fallback_interval);
        let replication = NodeReplicationState::new(config.node_cache_size);
        let dedup = DedupSet::new(config.dedup_cache_size, config.dedup_eviction_fraction);
        let rate_limiter = RateLimiter::new(config.rate_limit_window, config.rate_limit_max_attempts);
        let pending_acks = PendingRegistry::new(config.ack_timeout);
        let pending_payloads = PendingRegistry::new(config.ack_timeout);
        let pending_pings = PendingRegistry::new(config.ping_timeout);

        Self {
            config,
            own_id,
            game_id,
            secret,
            host_id,
            parent: RwLock::new(None),
            depth: AtomicU32::new(0),
            children: DashSet::new(),
            cousins: DashSet::new(),
            topology: NodeTopology::new(),
            replication,
            state_machine: Mutex::new(state_machine),
            join_state: Mutex::new(join_state),
            host_fallback_pacer: Mutex::new(host_fallback_pacer),
            dedup,
            rate_limiter,
            pending_acks,
            pending_payloads,
            pending_pings,
        }
    }

    pub fn own_id(&self) -> &PeerId {
        &self.own_id
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    pub fn parent(&self) -> Option<PeerId> {
        self.parent.read().expect("parent lock poisoned").clone()
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn children(&self) -> Vec<PeerId> {
        self.children.iter().map(|e| e.clone()).collect()
    }

    pub fn cousins(&self) -> Vec<PeerId> {
        self.cousins.iter().map(|e| e.clone()).collect()
    }

    pub fn is_attached(&self) -> bool {
        self.state_machine.lock().expect("state machine lock poisoned").is_attached()
    }

    pub fn state(&self) -> NodeState {
        self.state_machine.lock().expect("state machine lock poisoned").state()
    }

    pub fn rain_seq(&self) -> u64 {
        self.replication.rain_seq()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn wait_for_ack(&self, msg_id: MsgId) -> impl std::future::Future<Output = Result<bool, canopy_core::error::PendingError>> {
        self.pending_acks.register(msg_id)
    }

    pub fn wait_for_payload(&self, msg_id: MsgId) -> impl std::future::Future<Output = Result<Vec<u8>, canopy_core::error::PendingError>> {
        self.pending_payloads.register(msg_id)
    }

    pub fn wait_for_pong(&self, msg_id: MsgId) -> impl std::future::Future<Output = Result<(), canopy_core::error::PendingError>> {
        self.pending_pings.register(msg_id)
    }

    fn envelope(&self, body: MessageBody) -> Envelope {
        Envelope::new(self.game_id.clone(), self.own_id.clone(), body)
    }

    fn reply_to(&self, incoming: &Envelope, body: MessageBody) -> Envelope {
        let mut env = self.envelope(body);
        env.reply_to = Some(incoming.msg_id);
        env.dest = Some(Destination::Peer(incoming.src.clone()));
        env.route = Some(incoming.reverse_route(self.own_id.clone()));
        env
    }

    /// `JOIN_REQUEST` sent directly to the Host on first bootstrap (§4.1).
    pub fn build_join_request(&self) -> Envelope {
        self.envelope(MessageBody::JoinRequest { secret: self.secret.clone() })
    }

    /// `ATTACH_REQUEST` sent directly to a candidate parent (§4.1).
    pub fn build_attach_request(&self) -> Envelope {
        self.envelope(MessageBody::AttachRequest { depth: self.depth() })
    }

    /// Pick the next candidate to try and record the attempt (§4.1 join
    /// robustness): returns the backoff to wait plus the peer to dial, or
    /// `None` once attempts/redirects are exhausted.
    pub fn next_attach_candidate(&self, rng: &mut impl Rng) -> Option<(PeerId, std::time::Duration)> {
        let mut join_state = self.join_state.lock().expect("join state lock poisoned");
        let peer = join_state.take_random_seed(rng)?;
        let backoff = join_state.record_attempt().ok()?;
        Some((peer, backoff))
    }

    pub fn set_attach_seeds(&self, seeds: Vec<PeerId>) {
        self.join_state.lock().expect("join state lock poisoned").set_seeds(seeds);
    }

    /// Handle one inbound envelope. `from` is the directly-connected peer it
    /// arrived on; `link` says which kind of link that is (needed by the
    /// Router to apply cousin/parent/child forwarding rules).
    pub fn handle_inbound(&self, from: PeerId, link: IncomingLink, mut env: Envelope, rng: &mut impl Rng) -> NodeEffects {
        if env.game_id != self.game_id {
            tracing::debug!(%from, "dropping envelope: gameId mismatch");
            return NodeEffects::none();
        }
        if self.dedup.check_and_insert(env.msg_id) {
            tracing::debug!(%from, msg_id = %env.msg_id, "dropping duplicate message");
            return NodeEffects::none();
        }

        let parent = self.parent();
        let owned_children = self.children();
        match decide_route(&env, &self.own_id, link, &self.topology, parent.as_ref(), &owned_children) {
            RouteDecision::Drop(reason) => {
                tracing::debug!(%from, ?reason, "router dropped envelope");
                NodeEffects::none()
            }
            RouteDecision::ForwardTo(next_hop) => {
                env.append_hop(self.own_id.clone());
                NodeEffects::sends(vec![Outbound::new(next_hop, env)])
            }
            RouteDecision::ProcessLocally => {
                env.append_hop(self.own_id.clone());
                // §3 envelope: any message carrying `ack` must be answered
                // with an `ACK{replyTo=msgId}` regardless of its kind. Built
                // before the move into `dispatch_local` so the reply still
                // retraces the request's incoming path.
                let ack_reply =
                    env.ack.then(|| Outbound::new(from.clone(), self.reply_to(&env, MessageBody::Ack)));
                let mut effects = self.dispatch_local(from, link, env, rng);
                effects.outbound.extend(ack_reply);
                effects
            }
        }
    }

    fn dispatch_local(&self, from: PeerId, link: IncomingLink, env: Envelope, rng: &mut impl Rng) -> NodeEffects {
        match env.body.clone() {
            MessageBody::JoinAccept { seeds, keep_alive, rain_seq, game_seq, .. } => {
                if keep_alive {
                    self.on_attached(from.clone(), 1, rain_seq, game_seq);
                    self.join_state.lock().expect("join state lock poisoned").reset();
                    NodeEffects::event(NodeEvent::Attached { parent: from, depth: 1 })
                } else {
                    // Host only kept the connection open long enough to hand
                    // out seeds; it closes its side after a short grace, so
                    // this was never a real attach.
                    let mut join_state = self.join_state.lock().expect("join state lock poisoned");
                    join_state.reset();
                    join_state.set_seeds(seeds.clone());
                    drop(join_state);
                    NodeEffects::event(NodeEvent::TryNextCandidates { candidates: seeds })
                }
            }
            MessageBody::JoinReject { reason } => NodeEffects::event(NodeEvent::AttachFailed { reason }),
            MessageBody::AttachAccept { parent_id, level, cousin_candidates, .. } => {
                self.on_attached(parent_id.clone(), level, self.replication.rain_seq(), self.replication.last_game_seq());
                self.join_state.lock().expect("join state lock poisoned").reset();
                let mut effects = NodeEffects::event(NodeEvent::Attached { parent: parent_id, depth: level });
                if !cousin_candidates.is_empty() {
                    effects.events.push(NodeEvent::ConnectCousins { candidates: cousin_candidates });
                }
                effects
            }
            MessageBody::AttachReject { reason: _, redirect, depth_hint: _ } => {
                let mut join_state = self.join_state.lock().expect("join state lock poisoned");
                if let Err(e) = join_state.record_redirect() {
                    return NodeEffects::event(NodeEvent::AttachFailed { reason: e.to_string() });
                }
                join_state.set_seeds(redirect.clone());
                NodeEffects::event(NodeEvent::TryNextCandidates { candidates: redirect })
            }
            MessageBody::AttachRequest { depth } => self.handle_attach_request(from, depth, rng),
            MessageBody::Rain { rain_seq } => self.handle_rain(link, rain_seq),
            MessageBody::GameEvent { game_seq, event } => self.handle_game_event(link, game_seq, event),
            MessageBody::GameCmd { .. } => {
                tracing::debug!("GAME_CMD reached a node locally; it should only ever terminate at the Host");
                NodeEffects::none()
            }
            MessageBody::SubtreeStatus { free_slots, descendants, .. } => {
                self.topology.record_child_status(from, free_slots, descendants);
                NodeEffects::none()
            }
            MessageBody::ReqState { from_rain_seq: _, from_game_seq } => {
                let body = build_state_response(
                    self.replication.cache(),
                    from_game_seq,
                    self.replication.rain_seq(),
                    self.replication.last_game_seq(),
                );
                NodeEffects::sends(vec![Outbound::new(from.clone(), self.reply_to(&env, body))])
            }
            MessageBody::State { latest_rain_seq, latest_game_seq, events, .. } => {
                let outcome = apply_state_response(&self.replication, &events, latest_game_seq, latest_rain_seq);
                let mut effects = NodeEffects::default();
                for (seq, event) in &outcome.newly_repaired {
                    effects.events.push(NodeEvent::GameEventReceived { game_seq: *seq, event: event.clone() });
                    for child in self.children() {
                        effects.outbound.push(Outbound::new(
                            child,
                            self.envelope(MessageBody::GameEvent { game_seq: *seq, event: event.clone() }),
                        ));
                    }
                }
                if let Some(new_rain) = outcome.rain_advanced_to {
                    self.state_machine.lock().expect("state machine lock poisoned").on_fresh_parent_rain();
                    for child in self.children() {
                        effects.outbound.push(
                            Outbound::new(child, self.envelope(MessageBody::Rain { rain_seq: new_rain })),
                        );
                    }
                }
                effects
            }
            MessageBody::RebindAssign { new_parent_candidates } => {
                self.join_state.lock().expect("join state lock poisoned").set_seeds(new_parent_candidates.clone());
                NodeEffects::event(NodeEvent::TryNextCandidates { candidates: new_parent_candidates })
            }
            MessageBody::RebindRequest { .. } => {
                tracing::debug!("REBIND_REQUEST reached a node locally; it should only ever terminate at the Host");
                NodeEffects::none()
            }
            MessageBody::ReqCousins { requester_depth, desired_count } => {
                let candidates = find_cousin_candidates(
                    &self.topology,
                    self.depth(),
                    requester_depth,
                    &from,
                    desired_count as usize,
                    rng,
                );
                if candidates.is_empty() {
                    if let Some(parent) = self.parent() {
                        // Strict-forward (§4.6): relay upward unanswered, preserving
                        // the accumulated `path` so the eventual COUSINS reply can
                        // retrace every hop back to the original requester.
                        return NodeEffects::sends(vec![Outbound::new(parent, env)]);
                    }
                }
                NodeEffects::sends(vec![Outbound::new(from.clone(), self.reply_to(&env, MessageBody::Cousins { candidates }))])
            }
            MessageBody::Cousins { candidates } => NodeEffects::event(NodeEvent::ConnectCousins { candidates }),
            MessageBody::Ping => NodeEffects::sends(vec![Outbound::new(from.clone(), self.reply_to(&env, MessageBody::Pong))]),
            MessageBody::Pong => {
                if let Some(acked) = env.reply_to {
                    self.pending_pings.resolve(&acked, ());
                }
                NodeEffects::none()
            }
            MessageBody::Ack => {
                if let Some(acked) = env.reply_to {
                    self.pending_acks.resolve(&acked, true);
                }
                NodeEffects::none()
            }
            MessageBody::ReqPayload { payload_type } => NodeEffects::event(NodeEvent::PayloadRequested {
                from: from.clone(),
                payload_type,
                request_msg_id: env.msg_id,
            }),
            MessageBody::Payload { data, .. } => {
                if let Some(requested) = env.reply_to {
                    self.pending_payloads.resolve(&requested, data);
                }
                NodeEffects::none()
            }
            MessageBody::GameAck { .. } => NodeEffects::none(),
        }
    }

    fn on_attached(&self, parent: PeerId, depth: u32, rain_seq: u64, game_seq: u64) {
        *self.parent.write().expect("parent lock poisoned") = Some(parent);
        self.depth.store(depth, Ordering::SeqCst);
        self.replication.advance_rain_seq_to(rain_seq);
        self.replication.fast_forward_game_seq(game_seq);
        self.state_machine.lock().expect("state machine lock poisoned").mark_attached();
    }

    fn handle_attach_request(&self, from: PeerId, _requester_depth: u32, rng: &mut impl Rng) -> NodeEffects {
        if !self.rate_limiter.check_and_record(&from) {
            tracing::warn!(%from, "attach request rate-limited");
            return NodeEffects::none();
        }
        if !node_has_spare_capacity(self.children.len(), self.config.max_node_children) {
            let redirect = redirect_candidates(&self.topology, self.config.redirect_list_cap, rng);
            let reject = self.envelope(MessageBody::AttachReject {
                reason: "no spare capacity".into(),
                redirect,
                depth_hint: self.depth() + 1,
            });
            return NodeEffects::sends(vec![Outbound::new(from, reject)]);
        }

        self.children.insert(from.clone());
        let own_depth = self.depth();
        let cousin_candidates =
            find_cousin_candidates(&self.topology, own_depth, own_depth + 1, &from, self.config.cousin_cap, rng);
        let accept = self.envelope(MessageBody::AttachAccept {
            parent_id: self.own_id.clone(),
            level: own_depth + 1,
            cousin_candidates,
            children_max: self.config.max_node_children as u32,
            children_used: self.children.len() as u32,
        });
        let mut outbound = vec![Outbound::new(from, accept)];
        outbound.extend(self.subtree_status_to_parent());
        NodeEffects::sends(outbound)
    }

    /// Build an immediate `SUBTREE_STATUS` send to the current parent, if
    /// attached (§4.2 "immediately on child join/leave", in addition to the
    /// periodic report the driving loop issues every `subtreeStatusInterval`).
    fn subtree_status_to_parent(&self) -> Option<Outbound> {
        let parent = self.parent()?;
        let body = self.build_subtree_status();
        Some(Outbound::new(parent, self.envelope(body)))
    }

    fn handle_rain(&self, link: IncomingLink, rain_seq: u64) -> NodeEffects {
        if link != IncomingLink::Parent {
            return NodeEffects::none();
        }
        if !self.replication.try_accept_parent_rain(rain_seq) {
            return NodeEffects::none();
        }
        self.state_machine.lock().expect("state machine lock poisoned").on_fresh_parent_rain();
        let body = MessageBody::Rain { rain_seq };
        let outbound = self
            .children()
            .into_iter()
            .map(|child| Outbound::new(child, self.envelope(body.clone())))
            .collect();
        NodeEffects::sends(outbound)
    }

    fn handle_game_event(&self, link: IncomingLink, game_seq: u64, event: AppPayload) -> NodeEffects {
        if link != IncomingLink::Parent {
            return NodeEffects::none();
        }
        if !self.replication.try_accept_game_event(game_seq, event.clone()) {
            return NodeEffects::none();
        }
        let body = MessageBody::GameEvent { game_seq, event: event.clone() };
        let outbound = self
            .children()
            .into_iter()
            .map(|child| Outbound::new(child, self.envelope(body.clone())))
            .collect();
        NodeEffects { outbound, events: vec![NodeEvent::GameEventReceived { game_seq, event }] }
    }

    /// 1s state-machine tick (§4.5): may trigger `REQ_STATE` (to a cousin,
    /// or the paced Host fallback) or `REBIND_REQUEST` (to the current
    /// parent, which forwards it upward the ordinary way).
    pub fn on_tick(&self, rng: &mut impl Rng) -> NodeEffects {
        let outcome = self.state_machine.lock().expect("state machine lock poisoned").tick(rng);
        match outcome {
            TickOutcome::NoAction => NodeEffects::none(),
            TickOutcome::SendReqStateNow => {
                let body = build_req_state(self.replication.rain_seq(), self.replication.last_game_seq());
                let target = self.cousins().into_iter().next();
                let outbound = match target {
                    Some(cousin) => Some(Outbound::new(cousin, self.envelope(body))),
                    None => {
                        let mut pacer = self.host_fallback_pacer.lock().expect("pacer lock poisoned");
                        if pacer.try_use() {
                            self.parent().map(|parent| {
                                let mut env = self.envelope(body);
                                env.dest = Some(Destination::Host);
                                Outbound::new(parent, env)
                            })
                        } else {
                            None
                        }
                    }
                };
                self.state_machine.lock().expect("state machine lock poisoned").record_req_state_sent();
                match outbound {
                    Some(o) => NodeEffects::sends(vec![o]),
                    None => NodeEffects::none(),
                }
            }
            TickOutcome::SendRebindRequest => {
                let subtree_count = 1 + self.children.len() as u64
                    + self.children().iter().map(|c| self.topology.child_descendants(c).len() as u64).sum::<u64>();
                let body = build_rebind_request(
                    self.replication.rain_seq(),
                    self.replication.last_game_seq(),
                    subtree_count,
                    "parent unresponsive past patch threshold",
                );
                match self.parent() {
                    Some(parent) => {
                        let mut env = self.envelope(body);
                        env.dest = Some(Destination::Host);
                        NodeEffects::sends(vec![Outbound::new(parent, env)])
                    }
                    None => NodeEffects::none(),
                }
            }
        }
    }

    /// Called when the parent connection closes: bypasses the patch/rebind
    /// escalation entirely and schedules an immediate attach retry (§4.7
    /// "Crash of a parent") against a cousin if one is reachable, falling
    /// back to the original bootstrap Host otherwise.
    pub fn on_parent_closed(&self) -> NodeEffects {
        *self.parent.write().expect("parent lock poisoned") = None;
        self.state_machine.lock().expect("state machine lock poisoned").mark_parent_lost();

        let candidates = {
            let cousins = self.cousins();
            if cousins.is_empty() { vec![self.host_id.clone()] } else { cousins }
        };
        let mut join_state = self.join_state.lock().expect("join state lock poisoned");
        join_state.reset();
        join_state.set_seeds(candidates.clone());
        drop(join_state);

        NodeEffects { outbound: Vec::new(), events: vec![NodeEvent::ParentLost, NodeEvent::TryNextCandidates { candidates }] }
    }

    pub fn on_child_closed(&self, child: &PeerId) -> NodeEffects {
        self.children.remove(child);
        self.topology.remove_child(child);
        self.state_machine
            .lock()
            .expect("state machine lock poisoned")
            .on_parent_link_closed_while_rebinding();
        let mut effects = NodeEffects::event(NodeEvent::ChildLost { peer: child.clone() });
        effects.outbound.extend(self.subtree_status_to_parent());
        effects
    }

    /// Register a newly connected cousin link, respecting `cousinCap`.
    /// Returns `false` if the cap is already reached.
    pub fn add_cousin(&self, peer: PeerId) -> bool {
        if self.cousins.len() >= self.config.cousin_cap {
            return false;
        }
        self.cousins.insert(peer);
        true
    }

    pub fn remove_cousin(&self, peer: &PeerId) {
        self.cousins.remove(peer);
    }

    /// Periodic `SUBTREE_STATUS` report to the parent (§4.2, every
    /// `subtreeStatusInterval`).
    pub fn build_subtree_status(&self) -> MessageBody {
        let free_slots = self.config.max_node_children.saturating_sub(self.children.len()) as u32;
        let children: Vec<(PeerId, ChildStatus)> = self
            .children()
            .into_iter()
            .map(|c| {
                let status = ChildStatus {
                    id: c.clone(),
                    state: PeerState::Ok,
                    last_rain_seq: self.replication.rain_seq(),
                    free_slots: self.topology.child_free_slots(&c).unwrap_or(0),
                };
                (c, status)
            })
            .collect();
        self.topology.build_subtree_status(self.replication.rain_seq(), free_slots, &children)
    }

    /// `sendGameEvent`/`sendToPeer` equivalent for a Node that is not the
    /// source of truth for `gameSeq`: Nodes never originate `GAME_EVENT`,
    /// only the Host does. A Node's `sendToPeer` is routed via `GAME_CMD`
    /// upward toward the Host instead.
    pub fn send_game_cmd(&self, cmd: AppPayload, ack: bool) -> Result<(MsgId, Outbound), RoutingError> {
        let parent = self.parent().ok_or_else(|| RoutingError::NoRoute("no parent attached".into()))?;
        let mut env = self.envelope(MessageBody::GameCmd { cmd });
        env.dest = Some(Destination::Host);
        if ack {
            env = env.requesting_ack();
        }
        Ok((env.msg_id, Outbound::new(parent, env)))
    }

    pub fn request_payload(&self, target: PeerId, payload_type: String) -> (MsgId, Outbound) {
        let mut env = self.envelope(MessageBody::ReqPayload { payload_type });
        env.dest = Some(Destination::Peer(target.clone()));
        let route_via = self.children().into_iter().find(|c| c == &target).unwrap_or(target);
        (env.msg_id, Outbound::new(route_via, env))
    }

    pub fn respond_payload(&self, request: &Envelope, payload_type: String, data: Vec<u8>) -> Outbound {
        let reply = self.reply_to(request, MessageBody::Payload { payload_type, data });
        Outbound::new(request.src.clone(), reply)
    }

    pub fn ping_host(&self) -> Outbound {
        let mut env = self.envelope(MessageBody::Ping);
        env.dest = Some(Destination::Host);
        let next_hop = self.parent().unwrap_or_else(|| self.own_id.clone());
        Outbound::new(next_hop, env)
    }

    pub fn sweep_rate_limiter(&self) {
        self.rate_limiter.sweep();
    }

    pub fn connection_string_fields(&self) -> (PeerId, GameId) {
        (self.own_id.clone(), self.game_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::DescendantInfo;

    fn pid(s: &str) -> PeerId {
        PeerId::new(s).unwrap()
    }

    fn node() -> NodeCore {
        NodeCore::new(
            pid("me"),
            GameId::new("g").unwrap(),
            Secret::new("s").unwrap(),
            OverlayConfig::default(),
            pid("host"),
        )
    }

    #[test]
    fn join_accept_attaches_at_depth_one() {
        let n = node();
        let env = Envelope::new(
            GameId::new("g").unwrap(),
            pid("host"),
            MessageBody::JoinAccept {
                player_id: pid("me"),
                payload: vec![],
                seeds: vec![],
                keep_alive: true,
                rain_seq: 3,
                game_seq: 7,
            },
        );
        let mut rng = rand::rng();
        let effects = n.handle_inbound(pid("host"), IncomingLink::Parent, env, &mut rng);
        assert!(n.is_attached());
        assert_eq!(n.depth(), 1);
        assert_eq!(n.parent(), Some(pid("host")));
        assert!(matches!(effects.events[0], NodeEvent::Attached { .. }));
        assert_eq!(n.replication.rain_seq(), 3);
    }

    #[test]
    fn join_accept_with_keep_alive_false_is_not_a_real_attach() {
        let n = node();
        let env = Envelope::new(
            GameId::new("g").unwrap(),
            pid("host"),
            MessageBody::JoinAccept {
                player_id: pid("me"),
                payload: vec![],
                seeds: vec![pid("seed1"), pid("seed2")],
                keep_alive: false,
                rain_seq: 3,
                game_seq: 7,
            },
        );
        let mut rng = rand::rng();
        let effects = n.handle_inbound(pid("host"), IncomingLink::Parent, env, &mut rng);
        assert!(!n.is_attached());
        assert_eq!(n.parent(), None);
        match &effects.events[0] {
            NodeEvent::TryNextCandidates { candidates } => {
                assert_eq!(candidates, &vec![pid("seed1"), pid("seed2")]);
            }
            other => panic!("expected TryNextCandidates, got {other:?}"),
        }
    }

    #[test]
    fn attach_accept_attaches_at_reported_level_and_requests_cousins() {
        let n = node();
        let env = Envelope::new(
            GameId::new("g").unwrap(),
            pid("parent"),
            MessageBody::AttachAccept {
                parent_id: pid("parent"),
                level: 3,
                cousin_candidates: vec![pid("cousin1")],
                children_max: 3,
                children_used: 1,
            },
        );
        let mut rng = rand::rng();
        let effects = n.handle_inbound(pid("parent"), IncomingLink::Parent, env, &mut rng);
        assert_eq!(n.depth(), 3);
        assert!(effects.events.iter().any(|e| matches!(e, NodeEvent::ConnectCousins { .. })));
    }

    #[test]
    fn attach_request_rejected_past_capacity_includes_redirect() {
        let n = node();
        let mut rng = rand::rng();
        for i in 0..3 {
            let p = pid(&format!("c{i}"));
            let env = Envelope::new(GameId::new("g").unwrap(), p.clone(), MessageBody::AttachRequest { depth: 5 });
            n.handle_inbound(p, IncomingLink::Child, env, &mut rng);
        }
        assert_eq!(n.children().len(), 3);
        let env = Envelope::new(GameId::new("g").unwrap(), pid("c4"), MessageBody::AttachRequest { depth: 5 });
        let effects = n.handle_inbound(pid("c4"), IncomingLink::Child, env, &mut rng);
        assert!(matches!(effects.outbound[0].envelope.body, MessageBody::AttachReject { .. }));
    }

    #[test]
    fn rain_from_parent_advances_and_rebroadcasts_to_children() {
        let n = node();
        n.on_attached(pid("parent"), 1, 0, 0);
        n.children.insert(pid("child1"));
        let env = Envelope::new(GameId::new("g").unwrap(), pid("parent"), MessageBody::Rain { rain_seq: 5 });
        let effects = n.handle_inbound(pid("parent"), IncomingLink::Parent, env, &mut rand::rng());
        assert_eq!(effects.outbound.len(), 1);
        assert_eq!(effects.outbound[0].to, pid("child1"));
        assert_eq!(n.state(), NodeState::Normal);
    }

    #[test]
    fn stale_rain_is_not_rebroadcast() {
        let n = node();
        n.on_attached(pid("parent"), 1, 10, 0);
        let env = Envelope::new(GameId::new("g").unwrap(), pid("parent"), MessageBody::Rain { rain_seq: 5 });
        let effects = n.handle_inbound(pid("parent"), IncomingLink::Parent, env, &mut rand::rng());
        assert!(effects.outbound.is_empty());
    }

    #[test]
    fn game_event_from_parent_is_cached_and_forwarded() {
        let n = node();
        n.on_attached(pid("parent"), 1, 0, 0);
        n.children.insert(pid("child1"));
        let env = Envelope::new(
            GameId::new("g").unwrap(),
            pid("parent"),
            MessageBody::GameEvent { game_seq: 1, event: AppPayload::new("T", vec![9]) },
        );
        let effects = n.handle_inbound(pid("parent"), IncomingLink::Parent, env, &mut rand::rng());
        assert_eq!(effects.outbound.len(), 1);
        assert!(effects.events.iter().any(|e| matches!(e, NodeEvent::GameEventReceived { game_seq: 1, .. })));
    }

    #[test]
    fn req_state_from_cousin_is_answered_locally() {
        let n = node();
        n.on_attached(pid("parent"), 1, 0, 0);
        n.replication.try_accept_game_event(1, AppPayload::new("T", vec![1]));
        let env = Envelope::new(
            GameId::new("g").unwrap(),
            pid("cousin1"),
            MessageBody::ReqState { from_rain_seq: 0, from_game_seq: 0 },
        );
        let effects = n.handle_inbound(pid("cousin1"), IncomingLink::Cousin, env, &mut rand::rng());
        assert!(matches!(effects.outbound[0].envelope.body, MessageBody::State { .. }));
    }

    #[test]
    fn non_state_traffic_on_cousin_link_is_dropped() {
        let n = node();
        n.on_attached(pid("parent"), 1, 0, 0);
        let mut env = Envelope::new(GameId::new("g").unwrap(), pid("cousin1"), MessageBody::Rain { rain_seq: 9 });
        env.dest = Some(Destination::Peer(pid("someone")));
        let effects = n.handle_inbound(pid("cousin1"), IncomingLink::Cousin, env, &mut rand::rng());
        assert!(effects.outbound.is_empty());
        assert!(effects.events.is_empty());
    }

    #[test]
    fn state_response_repairs_gap_and_rebroadcasts() {
        let n = node();
        n.on_attached(pid("parent"), 1, 0, 0);
        n.children.insert(pid("child1"));
        let events = vec![
            canopy_core::SeqEvent { seq: 1, event: AppPayload::new("T", vec![1]) },
            canopy_core::SeqEvent { seq: 2, event: AppPayload::new("T", vec![2]) },
        ];
        let env = Envelope::new(
            GameId::new("g").unwrap(),
            pid("cousin1"),
            MessageBody::State { latest_rain_seq: 9, latest_game_seq: 2, events, min_game_seq_available: 1, truncated: false },
        );
        let effects = n.handle_inbound(pid("cousin1"), IncomingLink::Cousin, env, &mut rand::rng());
        assert_eq!(effects.events.iter().filter(|e| matches!(e, NodeEvent::GameEventReceived { .. })).count(), 2);
        assert_eq!(n.state(), NodeState::Normal);
    }

    #[test]
    fn parent_closed_bypasses_escalation_straight_to_waiting() {
        let n = node();
        n.on_attached(pid("parent"), 1, 0, 0);
        let effects = n.on_parent_closed();
        assert_eq!(n.state(), NodeState::WaitingForHost);
        assert!(matches!(effects.events[0], NodeEvent::ParentLost));
    }

    #[test]
    fn parent_closed_retries_against_cousin_when_one_is_known() {
        let n = node();
        n.on_attached(pid("parent"), 2, 0, 0);
        n.add_cousin(pid("cousin1"));
        let effects = n.on_parent_closed();
        match effects.events.iter().find(|e| matches!(e, NodeEvent::TryNextCandidates { .. })).unwrap() {
            NodeEvent::TryNextCandidates { candidates } => assert_eq!(candidates, &vec![pid("cousin1")]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn parent_closed_falls_back_to_bootstrap_host_without_cousins() {
        let n = node();
        n.on_attached(pid("parent"), 2, 0, 0);
        let effects = n.on_parent_closed();
        match effects.events.iter().find(|e| matches!(e, NodeEvent::TryNextCandidates { .. })).unwrap() {
            NodeEvent::TryNextCandidates { candidates } => assert_eq!(candidates, &vec![pid("host")]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn cousin_cap_is_enforced() {
        let n = node();
        assert!(n.add_cousin(pid("a")));
        assert!(n.add_cousin(pid("b")));
        assert!(!n.add_cousin(pid("c")), "cousin_cap defaults to 2");
    }

    #[test]
    fn subtree_status_reports_children_and_descendants() {
        let n = node();
        n.children.insert(pid("c1"));
        n.topology.record_child_status(pid("c1"), 2, vec![DescendantInfo { id: pid("gc1"), hops: 1, free_slots: 1 }]);
        let body = n.build_subtree_status();
        match body {
            MessageBody::SubtreeStatus { subtree_count, descendants, .. } => {
                assert_eq!(subtree_count, 3);
                assert_eq!(descendants.len(), 2);
            }
            _ => panic!("expected SubtreeStatus"),
        }
    }
}
