//! # Committee Assembly
//!
//! Brings a fixed, known set of peers to a fully-connected state: one live
//! signed connection to every other member, never two to the same identity.
//!
//! ## Algorithm
//!
//! 1. Members already covered by `existing` connections are kept as-is; every
//!    other member except ourselves is *remaining*.
//! 2. The listener is bound; inbound callers are admitted only if their
//!    claimed identity is one of the configured members.
//! 3. Every remaining member is dialed concurrently with a fixed retry
//!    budget. Members whose identity sorts below ours are dialed only after
//!    a grace period covering our peer's own dial budget, so in the normal
//!    case exactly one side dials.
//! 4. Each established connection, inbound or outbound, goes through one
//!    check-and-insert under the pool lock. The first connection for an
//!    identity wins; later ones are shut down.
//! 5. When nothing remains the listener closes and the pool is returned.
//!
//! Assembly has no deadline of its own. Callers bound it with the
//! cancellation token, which yields [`AssemblyStatus::Cancelled`] and the
//! peers connected so far.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::conn::{ConnectionConfig, SignedConnection};
use crate::identity::{Identity, Keypair};
use crate::transport::Listener;
use crate::validator::AllowList;

/// Default number of outbound dial attempts per member.
pub const DEFAULT_DIAL_RETRIES: u32 = 10;

/// Default pause between dial attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Anything held in a committee pool must expose the identity it talks to.
pub trait PeerIdentity: Send + 'static {
    fn peer_identity(&self) -> Identity;
}

impl PeerIdentity for SignedConnection {
    fn peer_identity(&self) -> Identity {
        self.remote_identity()
    }
}

impl PeerIdentity for Arc<SignedConnection> {
    fn peer_identity(&self) -> Identity {
        self.remote_identity()
    }
}

// ============================================================================
// Members and Configuration
// ============================================================================

/// A configured committee member: where to reach it and who it must be.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommitteeMember {
    pub addr: String,
    pub identity: Identity,
}

impl CommitteeMember {
    pub fn new(addr: impl Into<String>, identity: Identity) -> Self {
        Self {
            addr: addr.into(),
            identity,
        }
    }
}

impl fmt::Display for CommitteeMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.identity)
    }
}

/// Parses `ADDR/IDENTITY_HEX`, e.g. `10.0.0.2:7700/3b6a27bc...`.
impl FromStr for CommitteeMember {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, identity) = s
            .rsplit_once('/')
            .with_context(|| format!("member '{}' is not of the form ADDR/IDENTITY", s))?;
        if addr.is_empty() {
            anyhow::bail!("member '{}' has an empty address", s);
        }
        let identity = Identity::from_hex(identity)
            .with_context(|| format!("member '{}' has an invalid identity", s))?;
        Ok(Self::new(addr, identity))
    }
}

#[derive(Clone, Debug)]
pub struct CommitteeConfig {
    /// Address the assembly listener binds to.
    pub listen_addr: String,
    /// Outbound attempts per member before giving up on that direction.
    pub dial_retries: u32,
    /// Pause between outbound attempts.
    pub retry_delay: Duration,
    pub connection: ConnectionConfig,
}

impl CommitteeConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Self::default()
        }
    }

    /// How long a higher identity waits before dialing a lower one.
    fn tie_break_grace(&self) -> Duration {
        self.retry_delay.saturating_mul(self.dial_retries)
    }
}

impl Default for CommitteeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".to_string(),
            dial_retries: DEFAULT_DIAL_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            connection: ConnectionConfig::default(),
        }
    }
}

// ============================================================================
// Assembly Result
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssemblyStatus {
    /// Every member is connected.
    Complete,
    /// The cancellation token fired first.
    Cancelled,
    /// The listener could not be bound; only `existing` is returned.
    ListenFailed,
}

#[derive(Debug)]
pub struct Assembly<T> {
    pub status: AssemblyStatus,
    pub peers: Vec<T>,
    /// Members still unconnected when assembly ended.
    pub missing: Vec<Identity>,
}

impl<T> Assembly<T> {
    pub fn is_complete(&self) -> bool {
        self.status == AssemblyStatus::Complete
    }
}

// ============================================================================
// Shared Pool
// ============================================================================

struct Pool<T> {
    peers: HashMap<Identity, T>,
    remaining: HashSet<Identity>,
}

/// State shared by the accept loop and every dial / inbound task.
struct Shared<T, F> {
    pool: Mutex<Pool<T>>,
    make: F,
    keypair: Keypair,
    config: CommitteeConfig,
    /// Fires when nothing remains or the caller cancels.
    stop: CancellationToken,
}

impl<T, F> Shared<T, F>
where
    T: PeerIdentity,
    F: Fn(SignedConnection) -> T + Send + Sync + 'static,
{
    async fn is_connected(&self, identity: &Identity) -> bool {
        self.pool.lock().await.peers.contains_key(identity)
    }

    /// Check-and-insert. Returns whether `conn` was kept.
    async fn admit(&self, conn: SignedConnection, direction: &'static str) -> bool {
        let peer = conn.remote_identity();
        let mut pool = self.pool.lock().await;

        if pool.peers.contains_key(&peer) || !pool.remaining.remove(&peer) {
            drop(pool);
            debug!(peer = %peer.short(), direction, "discarding duplicate connection");
            conn.shutdown().await;
            return false;
        }

        pool.peers.insert(peer, (self.make)(conn));
        let left = pool.remaining.len();
        debug!(peer = %peer.short(), direction, remaining = left, "committee peer connected");
        if left == 0 {
            self.stop.cancel();
        }
        true
    }
}

// ============================================================================
// Assembly
// ============================================================================

/// Connect to every member not already covered by `existing`.
///
/// `members` may include our own identity; it is skipped. `make` wraps each
/// newly established connection into the caller's peer type.
pub async fn assemble<T, F>(
    members: &[CommitteeMember],
    existing: Vec<T>,
    make: F,
    keypair: &Keypair,
    config: &CommitteeConfig,
    cancel: CancellationToken,
) -> Assembly<T>
where
    T: PeerIdentity,
    F: Fn(SignedConnection) -> T + Send + Sync + 'static,
{
    let local = keypair.identity();

    let mut peers = HashMap::new();
    for peer in existing {
        peers.insert(peer.peer_identity(), peer);
    }
    let remaining_members: Vec<CommitteeMember> = members
        .iter()
        .filter(|m| m.identity != local && !peers.contains_key(&m.identity))
        .cloned()
        .collect();

    if remaining_members.is_empty() {
        debug!(peers = peers.len(), "committee already complete");
        return Assembly {
            status: AssemblyStatus::Complete,
            peers: peers.into_values().collect(),
            missing: Vec::new(),
        };
    }

    let listener = match Listener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(addr = %config.listen_addr, error = %e, "committee listener failed to bind");
            return Assembly {
                status: AssemblyStatus::ListenFailed,
                peers: peers.into_values().collect(),
                missing: remaining_members.iter().map(|m| m.identity).collect(),
            };
        }
    };
    info!(
        addr = ?listener.local_addr().ok(),
        remaining = remaining_members.len(),
        "assembling committee"
    );

    let validator = Arc::new(AllowList::from_identities(
        members.iter().map(|m| m.identity),
    ));
    let shared = Arc::new(Shared {
        pool: Mutex::new(Pool {
            peers,
            remaining: remaining_members.iter().map(|m| m.identity).collect(),
        }),
        make,
        keypair: keypair.clone(),
        config: config.clone(),
        stop: cancel.child_token(),
    });

    let mut tasks = JoinSet::new();
    for member in remaining_members {
        let grace = if member.identity < local {
            config.tie_break_grace()
        } else {
            Duration::ZERO
        };
        tasks.spawn(dial_member(shared.clone(), member, grace));
    }

    loop {
        tokio::select! {
            _ = shared.stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    trace!(%addr, "inbound committee connection");
                    let shared = shared.clone();
                    let validator = validator.clone();
                    tasks.spawn(async move {
                        match SignedConnection::accept_with(
                            stream,
                            &shared.keypair,
                            validator.as_ref(),
                            &shared.config.connection,
                        )
                        .await
                        {
                            Ok(conn) => {
                                shared.admit(conn, "inbound").await;
                            }
                            Err(e) => debug!(%addr, error = %e, "inbound handshake failed"),
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "committee accept failed");
                    tokio::time::sleep(config.retry_delay).await;
                }
            },
            Some(joined) = tasks.join_next() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    warn!(error = %e, "committee task panicked");
                }
            }
        }
    }

    drop(listener);
    tasks.shutdown().await;

    let mut pool = shared.pool.lock().await;
    let missing: Vec<Identity> = pool.remaining.drain().collect();
    let peers: Vec<T> = pool.peers.drain().map(|(_, peer)| peer).collect();
    let status = if missing.is_empty() {
        AssemblyStatus::Complete
    } else {
        AssemblyStatus::Cancelled
    };
    info!(?status, peers = peers.len(), missing = missing.len(), "committee assembly finished");

    Assembly {
        status,
        peers,
        missing,
    }
}

async fn dial_member<T, F>(shared: Arc<Shared<T, F>>, member: CommitteeMember, grace: Duration)
where
    T: PeerIdentity,
    F: Fn(SignedConnection) -> T + Send + Sync + 'static,
{
    if !grace.is_zero() {
        tokio::select! {
            _ = shared.stop.cancelled() => return,
            _ = tokio::time::sleep(grace) => {}
        }
    }

    let retries = shared.config.dial_retries;
    for attempt in 1..=retries {
        if shared.is_connected(&member.identity).await {
            trace!(peer = %member.identity.short(), "peer connected from the other side");
            return;
        }

        match SignedConnection::dial_with(
            &member.addr,
            &shared.keypair,
            member.identity,
            &shared.config.connection,
        )
        .await
        {
            Ok(conn) => {
                shared.admit(conn, "outbound").await;
                return;
            }
            Err(e) => {
                debug!(peer = %member.identity.short(), addr = %member.addr, attempt, error = %e, "dial failed");
            }
        }

        if attempt < retries {
            tokio::select! {
                _ = shared.stop.cancelled() => return,
                _ = tokio::time::sleep(shared.config.retry_delay) => {}
            }
        }
    }

    warn!(
        peer = %member.identity.short(),
        addr = %member.addr,
        retries,
        "dial retries exhausted; waiting for inbound connection"
    );
}
