//! # Gossip
//!
//! Two layers:
//!
//! - [`ChannelConnection`]: a signed connection with an idle/active mode.
//!   While idle it sends a one-byte heartbeat frame on a fixed interval and
//!   discards everything it reads; while active it delivers application
//!   frames. Heartbeat and empty frames are never delivered.
//! - [`Gossip`]: fans every member's inbound frames into one deduplicated
//!   stream and broadcasts to all members (optionally skipping one).
//!
//! ## Architecture
//!
//! `Gossip` follows the handle/actor split: the handle is cheap to clone and
//! sends typed commands; the actor owns the member map and the seen set.
//! Each member has its own fan-in task feeding the actor. A panic in a
//! fan-in task is logged and ends only that task.
//!
//! A slow consumer of the message stream never stalls commands: the actor
//! stops pulling inbound messages until the output queue has room, and keeps
//! answering broadcasts meanwhile.
//!
//! ## Deduplication
//!
//! Messages are identified by their BLAKE3 content hash. The seen set is an
//! LRU window of [`GossipConfig::dedup_window`] hashes; a message whose hash
//! has aged out of the window is delivered again. Broadcast payloads are
//! recorded as seen so a peer echoing them back is not delivered.
//!
//! The payload `[255]` is reserved for heartbeats and is never delivered.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::committee::PeerIdentity;
use crate::conn::SignedConnection;
use crate::error::{Error, Result};
use crate::identity::{content_hash, ContentHash, Identity};

// ============================================================================
// Constants and Configuration
// ============================================================================

/// Reserved single-byte heartbeat frame.
pub const HEARTBEAT: u8 = 255;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of content hashes remembered for deduplication.
/// SECURITY: bounds memory regardless of how many distinct messages peers send.
pub const DEFAULT_DEDUP_WINDOW: usize = 65_536;

/// Default per-connection and gossip output queue depth.
pub const DEFAULT_QUEUE_LEN: usize = 1024;

const COMMAND_CHANNEL_SIZE: usize = 256;

#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// Period between heartbeats while a connection is idle.
    pub heartbeat_interval: Duration,
    /// Number of content hashes remembered for deduplication.
    pub dedup_window: usize,
    /// Depth of each delivery queue.
    pub queue_len: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            queue_len: DEFAULT_QUEUE_LEN,
        }
    }
}

fn is_heartbeat(frame: &[u8]) -> bool {
    frame.is_empty() || frame == [HEARTBEAT]
}

// ============================================================================
// ChannelConnection
// ============================================================================

struct ChannelState {
    active: AtomicBool,
    live: AtomicBool,
    closed: CancellationToken,
}

impl ChannelState {
    fn mark_dead(&self, peer: &Identity, reason: &str) {
        if self.live.swap(false, Ordering::AcqRel) {
            debug!(peer = %peer.short(), reason, "channel connection died");
        }
        self.closed.cancel();
    }
}

/// Signed connection with idle/active delivery and idle heartbeats.
///
/// Starts idle.
pub struct ChannelConnection {
    conn: Arc<SignedConnection>,
    state: Arc<ChannelState>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl ChannelConnection {
    pub fn new(conn: SignedConnection) -> Self {
        Self::with_config(conn, &GossipConfig::default())
    }

    pub fn with_config(conn: SignedConnection, config: &GossipConfig) -> Self {
        let conn = Arc::new(conn);
        let state = Arc::new(ChannelState {
            active: AtomicBool::new(false),
            live: AtomicBool::new(conn.is_live()),
            closed: CancellationToken::new(),
        });
        let (tx, rx) = mpsc::channel(config.queue_len.max(1));

        tokio::spawn(read_loop(conn.clone(), state.clone(), tx));
        tokio::spawn(heartbeat_loop(
            conn.clone(),
            state.clone(),
            config.heartbeat_interval,
        ));

        Self {
            conn,
            state,
            inbound: Mutex::new(rx),
        }
    }

    /// Start delivering inbound frames; heartbeats stop.
    pub fn activate(&self) {
        self.state.active.store(true, Ordering::Release);
    }

    /// Stop delivering inbound frames; heartbeats resume.
    pub fn sleep(&self) {
        self.state.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.state.live.load(Ordering::Acquire) && self.conn.is_live()
    }

    pub fn remote_identity(&self) -> Identity {
        self.conn.remote_identity()
    }

    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_live() {
            return Err(Error::NotLive);
        }
        let result = self.conn.send(data).await;
        if let Err(e) = &result
            && e.is_fatal()
        {
            self.state.mark_dead(&self.remote_identity(), "send failed");
        }
        result
    }

    /// Next delivered frame, or `None` once the connection is dead.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.inbound.lock().await.recv().await
    }

    pub async fn shutdown(&self) {
        self.state.mark_dead(&self.remote_identity(), "shutdown");
        self.conn.shutdown().await;
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        self.state.closed.cancel();
    }
}

impl PeerIdentity for ChannelConnection {
    fn peer_identity(&self) -> Identity {
        self.remote_identity()
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("remote", &self.remote_identity())
            .field("active", &self.is_active())
            .field("live", &self.is_live())
            .finish()
    }
}

async fn read_loop(conn: Arc<SignedConnection>, state: Arc<ChannelState>, tx: mpsc::Sender<Vec<u8>>) {
    let peer = conn.remote_identity();
    loop {
        let frame = tokio::select! {
            _ = state.closed.cancelled() => break,
            frame = conn.read() => frame,
        };
        match frame {
            Ok(frame) if is_heartbeat(&frame) => {
                trace!(peer = %peer.short(), "heartbeat");
            }
            Ok(frame) => {
                if !state.active.load(Ordering::Acquire) {
                    trace!(peer = %peer.short(), len = frame.len(), "idle, discarding frame");
                    continue;
                }
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                state.mark_dead(&peer, "read failed");
                debug!(peer = %peer.short(), error = %e, "channel read loop ending");
                conn.shutdown().await;
                break;
            }
        }
    }
}

async fn heartbeat_loop(conn: Arc<SignedConnection>, state: Arc<ChannelState>, period: Duration) {
    let peer = conn.remote_identity();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = state.closed.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !state.live.load(Ordering::Acquire) {
            break;
        }
        if state.active.load(Ordering::Acquire) {
            continue;
        }
        if let Err(e) = conn.send(&[HEARTBEAT]).await {
            debug!(peer = %peer.short(), error = %e, "heartbeat failed");
            state.mark_dead(&peer, "heartbeat failed");
            conn.shutdown().await;
            break;
        }
    }
}

// ============================================================================
// Gossip Handle
// ============================================================================

/// A deduplicated message received from a committee member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GossipMessage {
    pub from: Identity,
    pub data: Vec<u8>,
}

enum Command {
    /// Record the payload as seen and return the broadcast targets.
    PrepareBroadcast {
        hash: ContentHash,
        except: Option<Identity>,
        reply: oneshot::Sender<Vec<Arc<ChannelConnection>>>,
    },
    Release(oneshot::Sender<Vec<Arc<ChannelConnection>>>),
    ReleaseIdentity(Identity, oneshot::Sender<Option<Arc<ChannelConnection>>>),
    Members(oneshot::Sender<Vec<Identity>>),
    Liveness(oneshot::Sender<Vec<(Identity, bool)>>),
    Quit,
}

#[derive(Clone)]
pub struct Gossip {
    cmd_tx: mpsc::Sender<Command>,
}

impl Gossip {
    /// Activate every member and start fanning their frames into the
    /// returned receiver.
    pub fn new(
        members: impl IntoIterator<Item = ChannelConnection>,
    ) -> (Self, mpsc::Receiver<GossipMessage>) {
        Self::with_config(members, &GossipConfig::default())
    }

    pub fn with_config(
        members: impl IntoIterator<Item = ChannelConnection>,
        config: &GossipConfig,
    ) -> (Self, mpsc::Receiver<GossipMessage>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (msg_tx, msg_rx) = mpsc::channel(config.queue_len.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_len.max(1));

        let window = NonZeroUsize::new(config.dedup_window).unwrap_or(NonZeroUsize::MIN);
        let mut actor = GossipActor {
            members: HashMap::new(),
            fan_in: HashMap::new(),
            seen: LruCache::new(window),
            out: msg_tx,
            inbound_tx,
        };
        for member in members {
            actor.add_member(member);
        }
        tokio::spawn(actor.run(cmd_rx, inbound_rx));

        (Self { cmd_tx }, msg_rx)
    }

    /// Send `data` to every member. Returns how many accepted it.
    pub async fn broadcast(&self, data: &[u8]) -> Result<usize> {
        self.broadcast_to(data, None).await
    }

    /// Send `data` to every member except `except` (typically the origin).
    pub async fn broadcast_except(&self, data: &[u8], except: Identity) -> Result<usize> {
        self.broadcast_to(data, Some(except)).await
    }

    async fn broadcast_to(&self, data: &[u8], except: Option<Identity>) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::PrepareBroadcast {
                hash: content_hash(data),
                except,
                reply,
            })
            .await
            .map_err(|_| Error::NotLive)?;
        let targets = rx.await.map_err(|_| Error::NotLive)?;

        let payload: Arc<[u8]> = Arc::from(data);
        let mut sends = JoinSet::new();
        for target in targets {
            let payload = payload.clone();
            sends.spawn(async move {
                match target.send(&payload).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(peer = %target.remote_identity().short(), error = %e, "gossip send failed");
                        false
                    }
                }
            });
        }

        let mut delivered = 0;
        while let Some(joined) = sends.join_next().await {
            if matches!(joined, Ok(true)) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Stop every fan-in task and hand the members back, put to sleep.
    pub async fn release(&self) -> Vec<Arc<ChannelConnection>> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Release(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop one member's fan-in task and hand it back, put to sleep.
    pub async fn release_identity(&self, identity: Identity) -> Option<Arc<ChannelConnection>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ReleaseIdentity(identity, tx))
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn members(&self) -> Vec<Identity> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Members(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Each member with whether its connection is still live.
    pub async fn liveness(&self) -> Vec<(Identity, bool)> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Liveness(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop gossiping and shut every member connection down.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Gossip Actor
// ============================================================================

struct GossipActor {
    members: HashMap<Identity, Arc<ChannelConnection>>,
    fan_in: HashMap<Identity, AbortHandle>,
    seen: LruCache<ContentHash, ()>,
    out: mpsc::Sender<GossipMessage>,
    inbound_tx: mpsc::Sender<GossipMessage>,
}

impl GossipActor {
    fn add_member(&mut self, member: ChannelConnection) {
        let identity = member.remote_identity();
        member.activate();
        let member = Arc::new(member);

        if let Some(handle) = self.fan_in.remove(&identity) {
            handle.abort();
        }
        if let Some(previous) = self.members.insert(identity, member.clone()) {
            warn!(peer = %identity.short(), "duplicate gossip member replaced");
            tokio::spawn(async move { previous.shutdown().await });
        }

        let task = tokio::spawn(fan_in(member, self.inbound_tx.clone()));
        self.fan_in.insert(identity, task.abort_handle());
        tokio::spawn(async move {
            if let Err(e) = task.await
                && e.is_panic()
            {
                warn!(peer = %identity.short(), "gossip fan-in task panicked");
            }
        });
    }

    fn release_member(&mut self, identity: &Identity) -> Option<Arc<ChannelConnection>> {
        if let Some(handle) = self.fan_in.remove(identity) {
            handle.abort();
        }
        let member = self.members.remove(identity)?;
        member.sleep();
        Some(member)
    }

    /// Returns the message if it has not been seen before.
    fn dedup(&mut self, message: GossipMessage) -> Option<GossipMessage> {
        let hash = content_hash(&message.data);
        if self.seen.put(hash, ()).is_some() {
            trace!(from = %message.from.short(), "duplicate gossip suppressed");
            return None;
        }
        Some(message)
    }

    async fn shutdown_members(&mut self) {
        for (_, handle) in self.fan_in.drain() {
            handle.abort();
        }
        for (_, member) in self.members.drain() {
            member.shutdown().await;
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut inbound_rx: mpsc::Receiver<GossipMessage>,
    ) {
        // At most one deduplicated message waits for the consumer. While it
        // waits, inbound is not polled, so backpressure reaches the fan-in
        // tasks and commands keep being served.
        let mut pending: Option<GossipMessage> = None;
        let out = self.out.clone();
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::PrepareBroadcast { hash, except, reply }) => {
                            self.seen.put(hash, ());
                            let targets = self
                                .members
                                .iter()
                                .filter(|(id, _)| Some(**id) != except)
                                .map(|(_, member)| member.clone())
                                .collect();
                            let _ = reply.send(targets);
                        }
                        Some(Command::Release(reply)) => {
                            let ids: Vec<Identity> = self.members.keys().copied().collect();
                            let released = ids
                                .iter()
                                .filter_map(|id| self.release_member(id))
                                .collect();
                            let _ = reply.send(released);
                        }
                        Some(Command::ReleaseIdentity(identity, reply)) => {
                            let _ = reply.send(self.release_member(&identity));
                        }
                        Some(Command::Members(reply)) => {
                            let _ = reply.send(self.members.keys().copied().collect());
                        }
                        Some(Command::Liveness(reply)) => {
                            let _ = reply.send(
                                self.members
                                    .iter()
                                    .map(|(id, member)| (*id, member.is_live()))
                                    .collect(),
                            );
                        }
                        Some(Command::Quit) => {
                            debug!("Gossip actor quitting");
                            self.shutdown_members().await;
                            break;
                        }
                        None => {
                            debug!("Gossip handle dropped, actor quitting");
                            self.shutdown_members().await;
                            break;
                        }
                    }
                }
                Some(message) = inbound_rx.recv(), if pending.is_none() => {
                    pending = self.dedup(message);
                }
                permit = out.reserve(), if pending.is_some() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(message) = pending.take() {
                                permit.send(message);
                            }
                        }
                        Err(_) => {
                            trace!("gossip receiver dropped");
                            pending = None;
                        }
                    }
                }
            }
        }
    }
}

async fn fan_in(member: Arc<ChannelConnection>, inbound: mpsc::Sender<GossipMessage>) {
    let from = member.remote_identity();
    while let Some(data) = member.recv().await {
        if inbound.send(GossipMessage { from, data }).await.is_err() {
            return;
        }
    }
    debug!(peer = %from.short(), "gossip member stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::connected_pair;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast() -> GossipConfig {
        GossipConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..GossipConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_emits_heartbeats() {
        let (local, remote) = connected_pair().await;
        let started = tokio::time::Instant::now();
        let _channel = ChannelConnection::new(local);

        let frame = timeout(2 * DEFAULT_HEARTBEAT_INTERVAL, remote.read())
            .await
            .expect("timeout")
            .expect("read");
        assert_eq!(frame, vec![HEARTBEAT]);
        assert!(started.elapsed() >= DEFAULT_HEARTBEAT_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn active_connection_stops_heartbeating() {
        let (local, remote) = connected_pair().await;
        let channel = ChannelConnection::new(local);
        channel.activate();

        assert!(
            timeout(3 * DEFAULT_HEARTBEAT_INTERVAL, remote.read()).await.is_err(),
            "active connections send no heartbeats"
        );
        channel.sleep();
        let frame = timeout(2 * DEFAULT_HEARTBEAT_INTERVAL, remote.read())
            .await
            .expect("timeout")
            .expect("read");
        assert_eq!(frame, vec![HEARTBEAT]);
    }

    #[tokio::test]
    async fn heartbeats_are_never_delivered() {
        let (a, b) = connected_pair().await;
        let idle = ChannelConnection::with_config(a, &fast());
        let active = ChannelConnection::with_config(b, &fast());
        active.activate();

        tokio::time::sleep(Duration::from_millis(120)).await;
        idle.send(b"hello").await.expect("send");

        let delivered = timeout(WAIT, active.recv()).await.expect("timeout");
        assert_eq!(delivered.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn sleeping_connection_discards_frames() {
        let (local, remote) = connected_pair().await;
        let channel = ChannelConnection::new(local);

        remote.send(b"dropped").await.expect("send");
        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.activate();
        remote.send(b"kept").await.expect("send");

        let delivered = timeout(WAIT, channel.recv()).await.expect("timeout");
        assert_eq!(delivered.as_deref(), Some(&b"kept"[..]));
    }

    #[tokio::test]
    async fn peer_shutdown_marks_channel_dead() {
        let (local, remote) = connected_pair().await;
        let channel = ChannelConnection::new(local);
        channel.activate();

        remote.shutdown().await;
        assert!(timeout(WAIT, channel.recv()).await.expect("timeout").is_none());
        assert!(!channel.is_live());
        assert!(matches!(channel.send(b"x").await, Err(Error::NotLive)));
    }

    /// Local gossip node with two members; returns the remote ends.
    async fn gossip_with_two_members()
    -> (Gossip, mpsc::Receiver<GossipMessage>, SignedConnection, SignedConnection) {
        let (l1, r1) = connected_pair().await;
        let (l2, r2) = connected_pair().await;
        let (gossip, rx) = Gossip::new([ChannelConnection::new(l1), ChannelConnection::new(l2)]);
        (gossip, rx, r1, r2)
    }

    #[tokio::test]
    async fn duplicate_content_is_delivered_once() {
        let (_gossip, mut rx, r1, r2) = gossip_with_two_members().await;

        r1.send(b"block-17").await.expect("send");
        let first = timeout(WAIT, rx.recv()).await.expect("timeout").expect("message");
        assert_eq!(first.data, b"block-17");
        assert_eq!(first.from, r1.local_identity());

        r2.send(b"block-17").await.expect("send");
        r2.send(b"block-18").await.expect("send");
        let next = timeout(WAIT, rx.recv()).await.expect("timeout").expect("message");
        assert_eq!(next.data, b"block-18");
        assert_eq!(next.from, r2.local_identity());
    }

    #[tokio::test]
    async fn broadcast_reaches_members_and_echo_is_suppressed() {
        let (gossip, mut rx, r1, r2) = gossip_with_two_members().await;

        assert_eq!(gossip.broadcast(b"vote").await.expect("broadcast"), 2);
        assert_eq!(timeout(WAIT, r1.read()).await.expect("timeout").expect("read"), b"vote");
        assert_eq!(timeout(WAIT, r2.read()).await.expect("timeout").expect("read"), b"vote");

        r1.send(b"vote").await.expect("echo");
        r1.send(b"fresh").await.expect("send");
        let next = timeout(WAIT, rx.recv()).await.expect("timeout").expect("message");
        assert_eq!(next.data, b"fresh");
    }

    #[tokio::test]
    async fn broadcast_except_skips_origin() {
        let (gossip, _rx, r1, r2) = gossip_with_two_members().await;

        let sent = gossip
            .broadcast_except(b"relay", r1.local_identity())
            .await
            .expect("broadcast");
        assert_eq!(sent, 1);
        assert_eq!(timeout(WAIT, r2.read()).await.expect("timeout").expect("read"), b"relay");

        assert!(
            timeout(Duration::from_millis(100), r1.read()).await.is_err(),
            "origin must not receive its own message"
        );
    }

    #[tokio::test]
    async fn broadcast_is_served_while_consumer_lags() {
        let config = GossipConfig {
            queue_len: 1,
            ..GossipConfig::default()
        };
        let (local, remote) = connected_pair().await;
        let (gossip, mut rx) = Gossip::with_config([ChannelConnection::new(local)], &config);

        for i in 0..4u8 {
            remote.send(&[b'm', i]).await.expect("send");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sent = timeout(WAIT, gossip.broadcast(b"relay"))
            .await
            .expect("broadcast blocked behind the output queue")
            .expect("broadcast");
        assert_eq!(sent, 1);
        assert_eq!(timeout(WAIT, remote.read()).await.expect("timeout").expect("read"), b"relay");

        for i in 0..4u8 {
            let message = timeout(WAIT, rx.recv()).await.expect("timeout").expect("message");
            assert_eq!(message.data, vec![b'm', i], "lagging messages are kept in order");
        }
    }

    #[tokio::test]
    async fn release_identity_returns_sleeping_member() {
        let (gossip, _rx, r1, r2) = gossip_with_two_members().await;

        let released = gossip
            .release_identity(r1.local_identity())
            .await
            .expect("member present");
        assert!(!released.is_active());
        assert!(released.is_live());
        assert_eq!(gossip.members().await, vec![r2.local_identity()]);
        assert_eq!(gossip.liveness().await, vec![(r2.local_identity(), true)]);
        assert!(gossip.release_identity(r1.local_identity()).await.is_none());

        let rest = gossip.release().await;
        assert_eq!(rest.len(), 1);
        assert!(gossip.members().await.is_empty());
    }

    #[tokio::test]
    async fn quit_shuts_members_down() {
        let (gossip, mut rx, r1, _r2) = gossip_with_two_members().await;

        gossip.quit().await;
        assert!(timeout(WAIT, r1.read()).await.expect("timeout").is_err());
        assert!(timeout(WAIT, rx.recv()).await.expect("timeout").is_none());
    }
}
