//! # Outbound Connection Pool
//!
//! [`CachedConnection`] decouples producers from the network: `send` only
//! appends to an unbounded in-memory cache, and a drain actor transmits the
//! cache in order once [`CachedConnection::ready`] has been called. Messages
//! queued before that point survive until the peer is ready.
//!
//! ## Drain Actor
//!
//! The actor sleeps on a capacity-2 wake queue. Each wake sends at most one
//! cached message; if more remain it posts exactly one further wake with
//! `try_send`, which never blocks because the wake it just consumed freed a
//! slot. A failed send marks the connection dead, shuts the transport down
//! and stops the actor. There is no retry.
//!
//! [`ConnectionPool`] maps identities to cached connections. It does no
//! locking of its own; mutating methods take `&mut self`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::committee::PeerIdentity;
use crate::conn::{encode_frame_len, SignedConnection};
use crate::error::{Error, Result};
use crate::identity::{Identity, SIGNATURE_SIZE};

/// Capacity of the drain actor's wake queue.
const WAKE_QUEUE_CAPACITY: usize = 2;

// ============================================================================
// CachedConnection
// ============================================================================

struct CacheState {
    cache: Mutex<VecDeque<Vec<u8>>>,
    ready: AtomicBool,
    live: AtomicBool,
    closed: CancellationToken,
}

impl CacheState {
    fn pending(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn pop(&self) -> Option<Vec<u8>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    fn mark_dead(&self) -> bool {
        self.closed.cancel();
        self.live.swap(false, Ordering::AcqRel)
    }
}

/// Signed connection behind an unbounded outbound cache.
pub struct CachedConnection {
    conn: Arc<SignedConnection>,
    state: Arc<CacheState>,
    wake_tx: mpsc::Sender<()>,
}

impl CachedConnection {
    pub fn new(conn: SignedConnection) -> Self {
        let conn = Arc::new(conn);
        let state = Arc::new(CacheState {
            cache: Mutex::new(VecDeque::new()),
            ready: AtomicBool::new(false),
            live: AtomicBool::new(conn.is_live()),
            closed: CancellationToken::new(),
        });
        let (wake_tx, wake_rx) = mpsc::channel(WAKE_QUEUE_CAPACITY);

        tokio::spawn(drain(conn.clone(), state.clone(), wake_tx.clone(), wake_rx));

        Self {
            conn,
            state,
            wake_tx,
        }
    }

    pub fn remote_identity(&self) -> Identity {
        self.conn.remote_identity()
    }

    /// Append `data` to the cache. Never waits on the network.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        encode_frame_len((data.len() + SIGNATURE_SIZE) as u64)?;
        if !self.is_live() {
            return Err(Error::NotLive);
        }
        self.state
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(data.to_vec());
        if self.is_ready() {
            self.wake();
        }
        Ok(())
    }

    /// Allow the drain actor to start transmitting.
    pub fn ready(&self) {
        if !self.state.ready.swap(true, Ordering::AcqRel) {
            trace!(peer = %self.remote_identity().short(), pending = self.pending(), "cached connection ready");
        }
        self.wake();
    }

    pub fn is_ready(&self) -> bool {
        self.state.ready.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.state.live.load(Ordering::Acquire)
    }

    /// Messages cached but not yet handed to the transport.
    pub fn pending(&self) -> usize {
        self.state.pending()
    }

    /// Stop the drain actor and close the transport. Cached messages are
    /// discarded.
    pub async fn shutdown(&self) {
        if self.state.mark_dead() {
            debug!(peer = %self.remote_identity().short(), pending = self.pending(), "cached connection shut down");
        }
        self.conn.shutdown().await;
    }

    fn wake(&self) {
        // A full queue already guarantees another drain pass.
        let _ = self.wake_tx.try_send(());
    }
}

impl Drop for CachedConnection {
    fn drop(&mut self) {
        self.state.closed.cancel();
    }
}

impl PeerIdentity for CachedConnection {
    fn peer_identity(&self) -> Identity {
        self.remote_identity()
    }
}

impl std::fmt::Debug for CachedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedConnection")
            .field("remote", &self.remote_identity())
            .field("ready", &self.is_ready())
            .field("live", &self.is_live())
            .field("pending", &self.pending())
            .finish()
    }
}

async fn drain(
    conn: Arc<SignedConnection>,
    state: Arc<CacheState>,
    wake_tx: mpsc::Sender<()>,
    mut wake_rx: mpsc::Receiver<()>,
) {
    let peer = conn.remote_identity();
    loop {
        tokio::select! {
            _ = state.closed.cancelled() => break,
            wake = wake_rx.recv() => {
                if wake.is_none() {
                    break;
                }
            }
        }
        if !state.ready.load(Ordering::Acquire) {
            continue;
        }
        let Some(message) = state.pop() else {
            continue;
        };

        if let Err(e) = conn.send(&message).await {
            debug!(peer = %peer.short(), error = %e, "cached send failed, dropping connection");
            state.mark_dead();
            conn.shutdown().await;
            break;
        }
        if state.pending() > 0 {
            let _ = wake_tx.try_send(());
        }
    }
    trace!(peer = %peer.short(), "drain actor quitting");
}

// ============================================================================
// ConnectionPool
// ============================================================================

/// Identity-keyed set of cached connections.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    peers: HashMap<Identity, CachedConnection>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `conn`, shutting down any previous entry for the same peer.
    pub async fn add(&mut self, conn: CachedConnection) {
        let identity = conn.remote_identity();
        if let Some(previous) = self.peers.insert(identity, conn) {
            debug!(peer = %identity.short(), "replacing pooled connection");
            previous.shutdown().await;
        }
    }

    pub fn get(&self, identity: &Identity) -> Option<&CachedConnection> {
        self.peers.get(identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.peers.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.peers.keys().copied().collect()
    }

    /// Remove and shut down the entry for `identity`. A no-op if absent.
    pub async fn drop_peer(&mut self, identity: &Identity) -> bool {
        match self.peers.remove(identity) {
            Some(conn) => {
                conn.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Remove every entry that is no longer live.
    pub async fn drop_dead(&mut self) -> Vec<Identity> {
        let dead: Vec<Identity> = self
            .peers
            .iter()
            .filter(|(_, conn)| !conn.is_live())
            .map(|(id, _)| *id)
            .collect();
        for identity in &dead {
            if let Some(conn) = self.peers.remove(identity) {
                conn.shutdown().await;
            }
        }
        if !dead.is_empty() {
            debug!(count = dead.len(), "dropped dead pooled connections");
        }
        dead
    }

    /// Queue `data` on every live entry. Returns how many accepted it.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        self.peers
            .values()
            .filter(|conn| conn.is_live())
            .filter(|conn| match conn.send(data) {
                Ok(()) => true,
                Err(e) => {
                    trace!(peer = %conn.remote_identity().short(), error = %e, "broadcast skipped peer");
                    false
                }
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{connected_pair, ConnectionConfig};
    use crate::identity::Keypair;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// A cached connection that believes it talks to `remote`.
    fn cached_to(remote: Identity) -> (CachedConnection, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1 << 16);
        let conn =
            SignedConnection::from_parts(ours, Keypair::generate(), remote, &ConnectionConfig::default());
        (CachedConnection::new(conn), theirs)
    }

    #[tokio::test]
    async fn messages_wait_for_ready_then_drain_in_order() {
        let (local, remote) = connected_pair().await;
        let cached = CachedConnection::new(local);

        cached.send(b"first").expect("cache");
        cached.send(b"second").expect("cache");
        cached.send(b"third").expect("cache");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cached.pending(), 3);
        assert!(!cached.is_ready());

        cached.ready();
        for expected in [&b"first"[..], b"second", b"third"] {
            let got = timeout(WAIT, remote.read()).await.expect("timeout").expect("read");
            assert_eq!(got, expected);
        }

        cached.send(b"after-ready").expect("cache");
        let got = timeout(WAIT, remote.read()).await.expect("timeout").expect("read");
        assert_eq!(got, b"after-ready");
    }

    #[tokio::test]
    async fn send_failure_marks_connection_dead() {
        let (local, remote) = connected_pair().await;
        let cached = CachedConnection::new(local);
        drop(remote);

        cached.ready();
        cached.send(b"into the void").expect("cache");

        timeout(WAIT, async {
            while cached.is_live() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection never died");
        assert!(matches!(cached.send(b"x"), Err(Error::NotLive)));
    }

    #[tokio::test]
    async fn pool_replaces_and_drops_idempotently() {
        let remote = Keypair::generate().identity();
        let (first, _first_peer) = cached_to(remote);
        let (second, _second_peer) = cached_to(remote);

        let mut pool = ConnectionPool::new();
        pool.add(first).await;
        pool.add(second).await;
        assert_eq!(pool.len(), 1);
        assert!(pool.get(&remote).expect("entry").is_live());

        assert!(pool.drop_peer(&remote).await);
        assert!(!pool.drop_peer(&remote).await);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn drop_dead_removes_only_dead_entries() {
        let alive_id = Keypair::generate().identity();
        let dead_id = Keypair::generate().identity();
        let (alive, _alive_peer) = cached_to(alive_id);
        let (dead, _dead_peer) = cached_to(dead_id);
        dead.shutdown().await;

        let mut pool = ConnectionPool::new();
        pool.add(alive).await;
        pool.add(dead).await;

        assert_eq!(pool.drop_dead().await, vec![dead_id]);
        assert_eq!(pool.identities(), vec![alive_id]);
        assert!(pool.drop_dead().await.is_empty());
    }

    #[tokio::test]
    async fn broadcast_counts_live_entries() {
        let (a, _a_peer) = cached_to(Keypair::generate().identity());
        let (b, _b_peer) = cached_to(Keypair::generate().identity());
        let (c, _c_peer) = cached_to(Keypair::generate().identity());
        c.shutdown().await;

        let mut pool = ConnectionPool::new();
        pool.add(a).await;
        pool.add(b).await;
        pool.add(c).await;

        assert_eq!(pool.broadcast(b"announce"), 2);
        for id in pool.identities() {
            let conn = pool.get(&id).expect("entry");
            if conn.is_live() {
                assert_eq!(conn.pending(), 1);
            }
        }
    }
}
