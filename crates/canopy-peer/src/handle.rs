//! Application-facing handles (§6.3) wrapping a [`HostCore`]/[`NodeCore`]
//! plus the background event-loop task that is the only thing in this crate
//! allowed to touch a [`Transport`].
//!
//! Protocol plumbing (attach retries, cousin dialing, ack/pong/payload
//! resolution) is handled inside the loop and never reaches the
//! application. What does reach it is folded into [`OverlayEvent`] and
//! delivered over a `tokio::sync::broadcast` channel, the same shape the
//! teacher's node-level interface exposes its received events through. A
//! second, `watch`-backed channel of [`HostSnapshot`]/[`NodeSnapshot`] gives
//! callers a synchronously-readable "current state" alongside the event
//! stream (`subscribe()`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use canopy_core::error::PendingError;
use canopy_core::{
    AppPayload, ConnectionMetadata, ConnectionRole, Envelope, GameId, MsgId, OverlayConfig, PeerId, Secret, Transport,
    TransportEvent,
};
use canopy_overlay::NodeState;
use canopy_routing::IncomingLink;

use crate::error::PeerResult;
use crate::host::{HostCore, HostEvent};
use crate::node::{NodeCore, NodeEvent};
use crate::outbound::Outbound;

/// Everything the embedding application can observe, Host or Node side
/// (§6.3 `onGameEventReceived` and friends).
#[derive(Debug, Clone)]
pub enum OverlayEvent {
    /// A `GAME_EVENT` (fresh or repaired via `STATE`) reached this peer.
    GameEvent { game_seq: u64, event: AppPayload },
    /// Host-only: a `GAME_CMD` arrived from a Node.
    GameCmd { from: PeerId, cmd: AppPayload },
    /// Node-only: attach finished.
    Attached { parent: PeerId, depth: u32 },
    /// Node-only: attach failed permanently (bad secret, attempts/redirects
    /// exhausted).
    AttachFailed { reason: String },
    /// Node-only: a `REQ_PAYLOAD` arrived; answer with
    /// [`NodeHandle::respond_payload`] using `request_msg_id`.
    PayloadRequested { from: PeerId, payload_type: String, request_msg_id: MsgId },
    /// Node-only: the parent link closed.
    ParentLost,
    /// A direct child's link closed.
    ChildLost { peer: PeerId },
}

/// Host-side state snapshot exposed via [`HostHandle::subscribe`] (§6.3):
/// current children, RAIN and game sequence counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSnapshot {
    pub children: Vec<PeerId>,
    pub rain_seq: u64,
    pub game_seq: u64,
}

impl HostSnapshot {
    fn capture(core: &HostCore) -> Self {
        Self { children: core.children(), rain_seq: core.rain_seq(), game_seq: core.game_seq() }
    }
}

/// Node-side state snapshot exposed via [`NodeHandle::subscribe`] (§6.3):
/// current parent, children, depth, RAIN sequence, and the node state
/// machine's reported state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub parent: Option<PeerId>,
    pub children: Vec<PeerId>,
    pub depth: u32,
    pub rain_seq: u64,
    pub state: NodeState,
    pub attached: bool,
}

impl NodeSnapshot {
    fn capture(core: &NodeCore) -> Self {
        Self {
            parent: core.parent(),
            children: core.children(),
            depth: core.depth(),
            rain_seq: core.rain_seq(),
            state: core.state(),
            attached: core.is_attached(),
        }
    }
}

async fn send_outbound<T: Transport>(transport: &T, outbound: Outbound) {
    match outbound.envelope.encode() {
        Ok(bytes) => {
            if let Err(err) = transport.send(&outbound.to, bytes).await {
                tracing::warn!(peer = %outbound.to, %err, "send failed");
            }
        }
        Err(err) => tracing::warn!(%err, "failed to encode outbound envelope"),
    }
}

async fn send_many<T: Transport>(transport: &T, outbound: Vec<Outbound>) {
    for o in outbound {
        send_outbound(transport, o).await;
    }
}

/// Close `peer` after `grace` without blocking the caller (§4.1 bootstrap,
/// `keepAlive=false`).
fn spawn_grace_close<T: Transport + 'static>(transport: Arc<T>, peer: PeerId, grace: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if let Err(err) = transport.close(&peer).await {
            tracing::debug!(%peer, %err, "grace-period close failed");
        }
    });
}

fn emit(tx: &broadcast::Sender<OverlayEvent>, event: OverlayEvent) {
    // No receivers yet (or all dropped) is a normal, expected state; the
    // application may simply not have subscribed.
    let _ = tx.send(event);
}

/// Host-side peer: owns a [`HostCore`] and a background loop driving a
/// [`Transport`] (§3 "Host state (singleton)").
pub struct HostHandle<T: Transport + 'static> {
    core: Arc<HostCore>,
    transport: Arc<T>,
    events_tx: broadcast::Sender<OverlayEvent>,
    snapshot_tx: watch::Sender<HostSnapshot>,
    driver: JoinHandle<()>,
    running: Arc<AtomicBool>,
}

impl<T: Transport + 'static> HostHandle<T> {
    pub fn spawn(transport: Arc<T>, host_id: PeerId, game_id: GameId, secret: Secret, config: OverlayConfig) -> Self {
        let core = Arc::new(HostCore::new(host_id, game_id, secret, config.clone()));
        let (events_tx, _) = broadcast::channel(256);
        let (snapshot_tx, _) = watch::channel(HostSnapshot::capture(&core));
        let running = Arc::new(AtomicBool::new(true));

        let driver = tokio::spawn(host_loop(
            Arc::clone(&core),
            Arc::clone(&transport),
            events_tx.clone(),
            snapshot_tx.clone(),
            config,
            Arc::clone(&running),
        ));

        Self { core, transport, events_tx, snapshot_tx, driver, running }
    }

    pub fn events(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events_tx.subscribe()
    }

    /// Subscribe/observe hook (§6.3): await changes or read the latest
    /// snapshot synchronously via `watch::Receiver::borrow`.
    pub fn subscribe(&self) -> watch::Receiver<HostSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn host_id(&self) -> &PeerId {
        self.core.host_id()
    }

    pub fn children(&self) -> Vec<PeerId> {
        self.core.children()
    }

    /// `broadcastGameEvent(type, data)` (§6.3).
    pub async fn broadcast_game_event(&self, payload: AppPayload) -> u64 {
        let (seq, effects) = self.core.broadcast_game_event(payload);
        send_many(self.transport.as_ref(), effects.outbound).await;
        let fresh = HostSnapshot::capture(&self.core);
        self.snapshot_tx.send_if_modified(|s| {
            let changed = *s != fresh;
            *s = fresh.clone();
            changed
        });
        seq
    }

    /// `sendToPeer(peerId, type, data, ack?)` (§6.3): routed unicast to any
    /// descendant, awaiting the `ACK` if requested.
    pub async fn send_to_peer(&self, dest: PeerId, payload: AppPayload, ack: bool) -> PeerResult<()> {
        let (msg_id, outbound) = self.core.send_to_peer(dest, payload, ack)?;
        let wait = ack.then(|| self.core.wait_for_ack(msg_id));
        send_outbound(self.transport.as_ref(), outbound).await;
        if let Some(wait) = wait {
            wait.await?;
        }
        Ok(())
    }

    pub fn next_qr_seq(&self) -> u64 {
        self.core.next_qr_seq()
    }
}

impl<T: Transport + 'static> Drop for HostHandle<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.driver.abort();
    }
}

fn refresh_host_snapshot(tx: &watch::Sender<HostSnapshot>, core: &HostCore) {
    let fresh = HostSnapshot::capture(core);
    tx.send_if_modified(|s| {
        let changed = *s != fresh;
        *s = fresh.clone();
        changed
    });
}

async fn host_loop<T: Transport + 'static>(
    core: Arc<HostCore>,
    transport: Arc<T>,
    events_tx: broadcast::Sender<OverlayEvent>,
    snapshot_tx: watch::Sender<HostSnapshot>,
    config: OverlayConfig,
    running: Arc<AtomicBool>,
) {
    let mut rain_tick = tokio::time::interval(config.rain_interval);
    let mut sweep_tick = tokio::time::interval(config.rate_limit_sweep_interval);

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            event = transport.next_event() => {
                match event {
                    Ok((from, TransportEvent::Data(bytes))) => {
                        let env = match Envelope::decode(&bytes) {
                            Ok(env) => env,
                            Err(err) => { tracing::warn!(%from, %err, "dropping malformed envelope"); continue; }
                        };
                        let mut rng = rand::rng();
                        let effects = core.handle_inbound(from, env, &mut rng);
                        send_many(transport.as_ref(), effects.outbound).await;
                        for e in effects.events {
                            if let HostEvent::GameCmdReceived { from, cmd } = e {
                                emit(&events_tx, OverlayEvent::GameCmd { from, cmd });
                            }
                        }
                        for (peer, grace) in effects.close_after {
                            spawn_grace_close(Arc::clone(&transport), peer, grace);
                        }
                        refresh_host_snapshot(&snapshot_tx, core.as_ref());
                    }
                    Ok((_from, TransportEvent::Open(_))) => {}
                    Ok((from, TransportEvent::Closed)) => {
                        let effects = core.on_child_closed(&from);
                        for e in effects.events {
                            if let HostEvent::ChildLost { peer } = e {
                                emit(&events_tx, OverlayEvent::ChildLost { peer });
                            }
                        }
                        refresh_host_snapshot(&snapshot_tx, core.as_ref());
                    }
                    Ok((from, TransportEvent::Error(err))) => {
                        tracing::warn!(%from, %err, "transport error");
                    }
                    Err(err) => {
                        tracing::error!(%err, "transport closed, host loop exiting");
                        break;
                    }
                }
            }
            _ = rain_tick.tick() => {
                let effects = core.on_rain_tick();
                send_many(transport.as_ref(), effects.outbound).await;
                refresh_host_snapshot(&snapshot_tx, core.as_ref());
            }
            _ = sweep_tick.tick() => {
                core.sweep_rate_limiter();
            }
        }
    }
}

/// Node-side peer: owns a [`NodeCore`], the connection-role bookkeeping the
/// Router needs (§4.3), and a background loop driving a [`Transport`].
pub struct NodeHandle<T: Transport + 'static> {
    core: Arc<NodeCore>,
    transport: Arc<T>,
    events_tx: broadcast::Sender<OverlayEvent>,
    snapshot_tx: watch::Sender<NodeSnapshot>,
    driver: JoinHandle<()>,
    running: Arc<AtomicBool>,
}

impl<T: Transport + 'static> NodeHandle<T> {
    /// Bootstrap straight to the Host (§4.1 first attach).
    pub async fn bootstrap(
        transport: Arc<T>,
        own_id: PeerId,
        game_id: GameId,
        secret: Secret,
        config: OverlayConfig,
        host_id: PeerId,
    ) -> PeerResult<Self> {
        let core = Arc::new(NodeCore::new(own_id, game_id.clone(), secret.clone(), config.clone(), host_id.clone()));
        let link_roles: Arc<DashMap<PeerId, IncomingLink>> = Arc::new(DashMap::new());
        let expected_parent: Arc<Mutex<Option<PeerId>>> = Arc::new(Mutex::new(Some(host_id.clone())));

        transport
            .connect(host_id.clone(), ConnectionMetadata { game_id, secret, role: ConnectionRole::Standard })
            .await?;
        link_roles.insert(host_id.clone(), IncomingLink::Parent);
        send_outbound(transport.as_ref(), Outbound::new(host_id, core.build_join_request())).await;

        let (events_tx, _) = broadcast::channel(256);
        let (snapshot_tx, _) = watch::channel(NodeSnapshot::capture(&core));
        let running = Arc::new(AtomicBool::new(true));
        let driver = tokio::spawn(node_loop(
            Arc::clone(&core),
            Arc::clone(&transport),
            events_tx.clone(),
            snapshot_tx.clone(),
            config,
            link_roles,
            expected_parent,
            Arc::clone(&running),
        ));

        Ok(Self { core, transport, events_tx, snapshot_tx, driver, running })
    }

    pub fn events(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events_tx.subscribe()
    }

    /// Subscribe/observe hook (§6.3): await changes or read the latest
    /// snapshot synchronously via `watch::Receiver::borrow`.
    pub fn subscribe(&self) -> watch::Receiver<NodeSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn own_id(&self) -> &PeerId {
        self.core.own_id()
    }

    pub fn is_attached(&self) -> bool {
        self.core.is_attached()
    }

    pub fn depth(&self) -> u32 {
        self.core.depth()
    }

    /// `sendGameEvent`/`sendToPeer` equivalent for a Node: routed upward as
    /// `GAME_CMD`, since a Node never originates `GAME_EVENT`.
    pub async fn send_game_cmd(&self, cmd: AppPayload, ack: bool) -> PeerResult<()> {
        let (msg_id, outbound) = self.core.send_game_cmd(cmd, ack)?;
        let wait = ack.then(|| self.core.wait_for_ack(msg_id));
        send_outbound(self.transport.as_ref(), outbound).await;
        if let Some(wait) = wait {
            wait.await?;
        }
        Ok(())
    }

    /// `requestPayload(peerId, type)` (§6.3): resolves once the peer answers
    /// with `PAYLOAD`, or on timeout.
    pub async fn request_payload(&self, target: PeerId, payload_type: String) -> PeerResult<Vec<u8>> {
        let (msg_id, outbound) = self.core.request_payload(target, payload_type);
        let wait = self.core.wait_for_payload(msg_id);
        send_outbound(self.transport.as_ref(), outbound).await;
        Ok(wait.await?)
    }

    pub async fn respond_payload(&self, request: &Envelope, payload_type: String, data: Vec<u8>) {
        send_outbound(self.transport.as_ref(), self.core.respond_payload(request, payload_type, data)).await;
    }

    /// `pingHost()` (§6.3): resolves on `PONG`, or on timeout.
    pub async fn ping_host(&self) -> Result<(), PendingError> {
        let outbound = self.core.ping_host();
        let msg_id = outbound.envelope.msg_id;
        let wait = self.core.wait_for_pong(msg_id);
        send_outbound(self.transport.as_ref(), outbound).await;
        wait.await
    }

    pub fn connection_string_fields(&self) -> (PeerId, GameId) {
        self.core.connection_string_fields()
    }
}

impl<T: Transport + 'static> Drop for NodeHandle<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.driver.abort();
    }
}

fn classify_link(from: &PeerId, metadata: &ConnectionMetadata, expected_parent: &Mutex<Option<PeerId>>) -> IncomingLink {
    if metadata.role == ConnectionRole::Cousin {
        return IncomingLink::Cousin;
    }
    if expected_parent.lock().expect("expected_parent lock poisoned").as_ref() == Some(from) {
        IncomingLink::Parent
    } else {
        IncomingLink::Child
    }
}

/// Dial the next attach candidate after a backoff, retrying
/// [`NodeEvent::TryNextCandidates`] until seeds are exhausted (§4.1 join
/// robustness). Runs as its own task so the backoff sleep never blocks the
/// main event loop.
fn spawn_attach_attempt<T: Transport + 'static>(
    core: Arc<NodeCore>,
    transport: Arc<T>,
    events_tx: broadcast::Sender<OverlayEvent>,
    link_roles: Arc<DashMap<PeerId, IncomingLink>>,
    expected_parent: Arc<Mutex<Option<PeerId>>>,
) {
    tokio::spawn(async move {
        let mut rng = rand::rng();
        let Some((candidate, backoff)) = core.next_attach_candidate(&mut rng) else {
            emit(&events_tx, OverlayEvent::AttachFailed { reason: "no attach candidates remaining".into() });
            return;
        };
        tokio::time::sleep(backoff).await;

        let (_, game_id) = core.connection_string_fields();
        *expected_parent.lock().expect("expected_parent lock poisoned") = Some(candidate.clone());
        let meta = ConnectionMetadata { game_id, secret: core.secret().clone(), role: ConnectionRole::Standard };
        if let Err(err) = transport.connect(candidate.clone(), meta).await {
            tracing::warn!(%candidate, %err, "failed to dial attach candidate");
            return;
        }
        link_roles.insert(candidate.clone(), IncomingLink::Parent);
        send_outbound(transport.as_ref(), Outbound::new(candidate, core.build_attach_request())).await;
    });
}

async fn connect_cousins<T: Transport>(
    core: &NodeCore,
    transport: &T,
    candidates: Vec<PeerId>,
    link_roles: &DashMap<PeerId, IncomingLink>,
) {
    let (_, game_id) = core.connection_string_fields();
    for candidate in candidates {
        if !core.add_cousin(candidate.clone()) {
            break;
        }
        let meta = ConnectionMetadata { game_id: game_id.clone(), secret: core.secret().clone(), role: ConnectionRole::Cousin };
        if let Err(err) = transport.connect(candidate.clone(), meta).await {
            tracing::warn!(%candidate, %err, "failed to dial cousin");
            core.remove_cousin(&candidate);
            continue;
        }
        link_roles.insert(candidate, IncomingLink::Cousin);
    }
}

fn refresh_node_snapshot(tx: &watch::Sender<NodeSnapshot>, core: &NodeCore) {
    let fresh = NodeSnapshot::capture(core);
    tx.send_if_modified(|s| {
        let changed = *s != fresh;
        *s = fresh.clone();
        changed
    });
}

#[allow(clippy::too_many_arguments)]
async fn node_loop<T: Transport + 'static>(
    core: Arc<NodeCore>,
    transport: Arc<T>,
    events_tx: broadcast::Sender<OverlayEvent>,
    snapshot_tx: watch::Sender<NodeSnapshot>,
    config: OverlayConfig,
    link_roles: Arc<DashMap<PeerId, IncomingLink>>,
    expected_parent: Arc<Mutex<Option<PeerId>>>,
    running: Arc<AtomicBool>,
) {
    let mut node_tick = tokio::time::interval(Duration::from_secs(1));
    let mut subtree_tick = tokio::time::interval(config.subtree_status_interval);
    let mut sweep_tick = tokio::time::interval(config.rate_limit_sweep_interval);

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            event = transport.next_event() => {
                match event {
                    Ok((from, TransportEvent::Open(metadata))) => {
                        let link = classify_link(&from, &metadata, &expected_parent);
                        link_roles.insert(from, link);
                    }
                    Ok((from, TransportEvent::Data(bytes))) => {
                        let env = match Envelope::decode(&bytes) {
                            Ok(env) => env,
                            Err(err) => { tracing::warn!(%from, %err, "dropping malformed envelope"); continue; }
                        };
                        let link = link_roles.get(&from).map(|e| *e).unwrap_or(IncomingLink::Child);
                        let mut rng = rand::rng();
                        let effects = core.handle_inbound(from, link, env, &mut rng);
                        send_many(transport.as_ref(), effects.outbound).await;
                        for e in effects.events {
                            match e {
                                NodeEvent::Attached { parent, depth } => {
                                    *expected_parent.lock().expect("expected_parent lock poisoned") = None;
                                    emit(&events_tx, OverlayEvent::Attached { parent, depth });
                                }
                                NodeEvent::AttachFailed { reason } => {
                                    emit(&events_tx, OverlayEvent::AttachFailed { reason });
                                }
                                NodeEvent::TryNextCandidates { candidates } => {
                                    core.set_attach_seeds(candidates);
                                    spawn_attach_attempt(
                                        Arc::clone(&core),
                                        Arc::clone(&transport),
                                        events_tx.clone(),
                                        Arc::clone(&link_roles),
                                        Arc::clone(&expected_parent),
                                    );
                                }
                                NodeEvent::ConnectCousins { candidates } => {
                                    connect_cousins(core.as_ref(), transport.as_ref(), candidates, &link_roles).await;
                                }
                                NodeEvent::GameEventReceived { game_seq, event } => {
                                    emit(&events_tx, OverlayEvent::GameEvent { game_seq, event });
                                }
                                NodeEvent::PayloadRequested { from, payload_type, request_msg_id } => {
                                    emit(&events_tx, OverlayEvent::PayloadRequested { from, payload_type, request_msg_id });
                                }
                                NodeEvent::ParentLost => {
                                    emit(&events_tx, OverlayEvent::ParentLost);
                                }
                                NodeEvent::ChildLost { peer } => {
                                    link_roles.remove(&peer);
                                    emit(&events_tx, OverlayEvent::ChildLost { peer });
                                }
                            }
                        }
                        refresh_node_snapshot(&snapshot_tx, core.as_ref());
                    }
                    Ok((from, TransportEvent::Closed)) => {
                        link_roles.remove(&from);
                        let is_parent = core.parent().as_ref() == Some(&from);
                        let effects = if is_parent { core.on_parent_closed() } else { core.on_child_closed(&from) };
                        send_many(transport.as_ref(), effects.outbound).await;
                        for e in effects.events {
                            match e {
                                NodeEvent::ParentLost => emit(&events_tx, OverlayEvent::ParentLost),
                                NodeEvent::ChildLost { peer } => emit(&events_tx, OverlayEvent::ChildLost { peer }),
                                NodeEvent::TryNextCandidates { candidates } => {
                                    core.set_attach_seeds(candidates);
                                    spawn_attach_attempt(
                                        Arc::clone(&core),
                                        Arc::clone(&transport),
                                        events_tx.clone(),
                                        Arc::clone(&link_roles),
                                        Arc::clone(&expected_parent),
                                    );
                                }
                                _ => {}
                            }
                        }
                        refresh_node_snapshot(&snapshot_tx, core.as_ref());
                    }
                    Ok((from, TransportEvent::Error(err))) => {
                        tracing::warn!(%from, %err, "transport error");
                    }
                    Err(err) => {
                        tracing::error!(%err, "transport closed, node loop exiting");
                        break;
                    }
                }
            }
            _ = node_tick.tick() => {
                let mut rng = rand::rng();
                let effects = core.on_tick(&mut rng);
                send_many(transport.as_ref(), effects.outbound).await;
                refresh_node_snapshot(&snapshot_tx, core.as_ref());
            }
            _ = subtree_tick.tick() => {
                if let Some(parent) = core.parent() {
                    let body = core.build_subtree_status();
                    let env = Envelope::new(core.connection_string_fields().1, core.own_id().clone(), body);
                    send_outbound(transport.as_ref(), Outbound::new(parent, env)).await;
                }
            }
            _ = sweep_tick.tick() => {
                core.sweep_rate_limiter();
            }
        }
    }
}
