//! # Peerlink - Authenticated Links for Consensus Committees
//!
//! Peerlink is the node-to-node layer of a network of cooperating consensus
//! peers whose addresses and identities are known in advance:
//!
//! - **Signed connections**: mutual challenge-response handshake, then every
//!   frame signed by the sender and verified by the receiver
//! - **Committee assembly**: concurrent dial/accept until every member holds
//!   exactly one live connection to every other member
//! - **Gossip**: heartbeating channel connections fanned into one
//!   content-deduplicated stream
//! - **Epoch channels**: many logical streams over one connection
//! - **Cached connections**: enqueue-only sends drained by a per-peer actor
//! - **Aggregator**: many provider connections merged into one queue
//!
//! ## Architecture
//!
//! Stateful components use the **Actor Pattern**: a public handle sends typed
//! commands over a channel to a private task that owns the state. The
//! committee pool is the one place guarded by an explicit lock, because its
//! writers (dial tasks and accept tasks) are genuinely independent.
//!
//! ## Security Model
//!
//! - Identity = Ed25519 public key; there is no other identity layer
//! - Links are signed, not encrypted
//! - Handshake failures report a single generic error
//! - Inbound peers are admitted only through a [`ConnectionValidator`]
//! - Every queue and cache that peers can grow is bounded, except the
//!   outbound cache of a [`CachedConnection`], which only local code fills
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Keypairs, identities, nonces, content hashes |
//! | `crypto` | Signature errors, constant-time comparison |
//! | `error` | Crate error type |
//! | `validator` | Connection validators and the allow-list |
//! | `transport` | Raw stream boundary and TCP helpers |
//! | `handshake` | Three-message mutual authentication |
//! | `conn` | Signed framing and liveness |
//! | `committee` | Committee assembly |
//! | `gossip` | Heartbeating channels and deduplicated broadcast |
//! | `epoch` | Epoch-multiplexed buffered channel |
//! | `pool` | Cached connections and the connection pool |
//! | `aggregator` | Provider fan-in |

mod aggregator;
mod committee;
mod conn;
mod crypto;
mod epoch;
mod error;
mod gossip;
mod handshake;
mod identity;
mod pool;
mod transport;
mod validator;

pub use aggregator::{Aggregator, AggregatorConfig, ProviderFrame, DEFAULT_OUTPUT_QUEUE};
pub use committee::{
    assemble, Assembly, AssemblyStatus, CommitteeConfig, CommitteeMember, PeerIdentity,
    DEFAULT_DIAL_RETRIES, DEFAULT_RETRY_DELAY,
};
pub use conn::{
    decode_frame_len, encode_frame_len, ConnectionConfig, SignedConnection,
    DEFAULT_HANDSHAKE_TIMEOUT, FRAME_LEN_SIZE, MAX_FRAME_LEN,
};
pub use crypto::{constant_time_eq, SignatureError};
pub use epoch::{EpochChannel, EpochConfig, DEFAULT_OUTBOUND_QUEUE, EPOCH_HEADER_LEN, SIDE_CHANNEL};
pub use error::{Error, Result};
pub use gossip::{
    ChannelConnection, Gossip, GossipConfig, GossipMessage, DEFAULT_DEDUP_WINDOW,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_QUEUE_LEN, HEARTBEAT,
};
pub use handshake::{HANDSHAKE_SIGNATURE_DOMAIN, MAX_HANDSHAKE_MESSAGE};
pub use identity::{
    content_hash, generate_nonce, ContentHash, Identity, Keypair, Nonce, HASH_SIZE,
    IDENTITY_SIZE, NONCE_SIZE, SIGNATURE_SIZE,
};
pub use pool::{CachedConnection, ConnectionPool};
pub use transport::{dial, BoxedStream, Listener, RawStream, DEFAULT_DIAL_TIMEOUT};
pub use validator::{AcceptAll, AllowList, ConnectionValidator, DEFAULT_ALLOW_LIST_CAPACITY};
