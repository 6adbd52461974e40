//! # Epoch-Multiplexed Buffered Channel
//!
//! Carries many independent logical streams ("epochs") over one signed
//! connection. Every payload is prefixed with its epoch:
//!
//! ```text
//! ┌────────────────────┬──────────────┐
//! │ epoch (8 bytes BE) │ data         │
//! └────────────────────┴──────────────┘
//! ```
//!
//! Epoch [`SIDE_CHANNEL`] (`0`) is reserved for out-of-band traffic.
//!
//! ## Architecture
//!
//! | Task | Owns |
//! |------|------|
//! | writer | the outbound half; drains the send queue |
//! | reader | the inbound half; forwards frames to the dispatcher |
//! | dispatcher | per-epoch queues and one waiting-reader slot per epoch |
//!
//! A frame arriving for an epoch with a waiting reader is handed to it
//! directly; otherwise it is queued. Readers on different epochs never block
//! each other. Any read or write failure, or a frame too short to carry an
//! epoch, shuts the whole channel down: every waiting reader is released
//! with `None` and later calls fail with [`Error::NotLive`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::committee::PeerIdentity;
use crate::conn::{encode_frame_len, SignedConnection};
use crate::error::{Error, Result};
use crate::identity::{Identity, SIGNATURE_SIZE};

/// Epoch used for out-of-band traffic.
pub const SIDE_CHANNEL: u64 = 0;

/// Size of the epoch prefix on every payload.
pub const EPOCH_HEADER_LEN: usize = 8;

pub const DEFAULT_OUTBOUND_QUEUE: usize = 1024;

const COMMAND_CHANNEL_SIZE: usize = 1024;

#[derive(Clone, Debug)]
pub struct EpochConfig {
    /// Frames that may wait for the writer before `send` suspends.
    pub outbound_queue: usize,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

type ReadReply = oneshot::Sender<Result<Option<Vec<u8>>>>;

enum Command {
    Frame(u64, Vec<u8>),
    Read { epoch: u64, reply: ReadReply },
    Release(u64),
    Shutdown,
}

// ============================================================================
// EpochChannel Handle
// ============================================================================

struct Inner {
    conn: Arc<SignedConnection>,
    cmd_tx: mpsc::Sender<Command>,
    closed: CancellationToken,
}

impl Inner {
    async fn shutdown(&self, reason: &str) {
        if !self.closed.is_cancelled() {
            debug!(peer = %self.conn.remote_identity().short(), reason, "epoch channel shutting down");
        }
        self.closed.cancel();
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        self.conn.shutdown().await;
    }
}

pub struct EpochChannel {
    inner: Arc<Inner>,
    out_tx: mpsc::Sender<Vec<u8>>,
}

impl EpochChannel {
    pub fn new(conn: SignedConnection) -> Self {
        Self::with_config(conn, &EpochConfig::default())
    }

    pub fn with_config(conn: SignedConnection, config: &EpochConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (out_tx, out_rx) = mpsc::channel(config.outbound_queue.max(1));

        let inner = Arc::new(Inner {
            conn: Arc::new(conn),
            cmd_tx,
            closed: CancellationToken::new(),
        });

        tokio::spawn(EpochDispatcher::default().run(cmd_rx));
        tokio::spawn(write_loop(inner.clone(), out_rx));
        tokio::spawn(read_loop(inner.clone()));

        Self { inner, out_tx }
    }

    pub fn remote_identity(&self) -> Identity {
        self.inner.conn.remote_identity()
    }

    pub fn is_live(&self) -> bool {
        !self.inner.closed.is_cancelled() && self.inner.conn.is_live()
    }

    /// Queue `data` for `epoch`. Returns once the frame is queued, not sent.
    pub async fn send(&self, epoch: u64, data: &[u8]) -> Result<()> {
        encode_frame_len((EPOCH_HEADER_LEN + data.len() + SIGNATURE_SIZE) as u64)?;
        if !self.is_live() {
            return Err(Error::NotLive);
        }

        let mut payload = Vec::with_capacity(EPOCH_HEADER_LEN + data.len());
        payload.extend_from_slice(&epoch.to_be_bytes());
        payload.extend_from_slice(data);
        self.out_tx.send(payload).await.map_err(|_| Error::NotLive)
    }

    pub async fn send_side(&self, data: &[u8]) -> Result<()> {
        self.send(SIDE_CHANNEL, data).await
    }

    /// Next frame for `epoch`, or `None` once the epoch is released or the
    /// channel shuts down.
    ///
    /// Only one reader may wait on an epoch at a time; a second concurrent
    /// reader gets [`Error::EpochBusy`].
    pub async fn read(&self, epoch: u64) -> Result<Option<Vec<u8>>> {
        if self.inner.closed.is_cancelled() {
            return Err(Error::NotLive);
        }
        let (reply, rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(Command::Read { epoch, reply })
            .await
            .map_err(|_| Error::NotLive)?;
        rx.await.map_err(|_| Error::NotLive)?
    }

    pub async fn read_side(&self) -> Result<Option<Vec<u8>>> {
        self.read(SIDE_CHANNEL).await
    }

    /// Drop everything buffered for `epoch`, wake its reader with `None` and
    /// forget the epoch.
    pub async fn release(&self, epoch: u64) {
        let _ = self.inner.cmd_tx.send(Command::Release(epoch)).await;
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown("shutdown requested").await;
    }
}

impl Drop for EpochChannel {
    fn drop(&mut self) {
        self.inner.closed.cancel();
    }
}

impl PeerIdentity for EpochChannel {
    fn peer_identity(&self) -> Identity {
        self.remote_identity()
    }
}

async fn write_loop(inner: Arc<Inner>, mut out_rx: mpsc::Receiver<Vec<u8>>) {
    loop {
        let payload = tokio::select! {
            _ = inner.closed.cancelled() => break,
            payload = out_rx.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        if let Err(e) = inner.conn.send(&payload).await {
            debug!(error = %e, "epoch channel write failed");
            inner.shutdown("write failed").await;
            break;
        }
    }
}

async fn read_loop(inner: Arc<Inner>) {
    loop {
        let frame = tokio::select! {
            _ = inner.closed.cancelled() => break,
            frame = inner.conn.read() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "epoch channel read failed");
                inner.shutdown("read failed").await;
                break;
            }
        };
        if frame.len() < EPOCH_HEADER_LEN {
            debug!(len = frame.len(), "frame too short to carry an epoch");
            inner.shutdown("short frame").await;
            break;
        }

        let mut header = [0u8; EPOCH_HEADER_LEN];
        header.copy_from_slice(&frame[..EPOCH_HEADER_LEN]);
        let epoch = u64::from_be_bytes(header);
        let data = frame[EPOCH_HEADER_LEN..].to_vec();
        if inner.cmd_tx.send(Command::Frame(epoch, data)).await.is_err() {
            break;
        }
    }
}

// ============================================================================
// Dispatcher Actor
// ============================================================================

#[derive(Default)]
struct EpochQueue {
    frames: VecDeque<Vec<u8>>,
    waiter: Option<ReadReply>,
}

#[derive(Default)]
struct EpochDispatcher {
    epochs: HashMap<u64, EpochQueue>,
}

impl EpochDispatcher {
    fn deliver(&mut self, epoch: u64, data: Vec<u8>) {
        let queue = self.epochs.entry(epoch).or_default();
        let data = match queue.waiter.take() {
            Some(waiter) => match waiter.send(Ok(Some(data))) {
                Ok(()) => return,
                // Reader went away; keep the frame for the next one.
                Err(Ok(Some(data))) => data,
                Err(_) => return,
            },
            None => data,
        };
        trace!(epoch, queued = queue.frames.len() + 1, "frame buffered");
        queue.frames.push_back(data);
    }

    fn read(&mut self, epoch: u64, reply: ReadReply) {
        let queue = self.epochs.entry(epoch).or_default();
        if let Some(frame) = queue.frames.pop_front() {
            let _ = reply.send(Ok(Some(frame)));
            return;
        }
        if let Some(waiter) = &queue.waiter
            && !waiter.is_closed()
        {
            let _ = reply.send(Err(Error::EpochBusy(epoch)));
            return;
        }
        queue.waiter = Some(reply);
    }

    fn release(&mut self, epoch: u64) {
        if let Some(queue) = self.epochs.remove(&epoch) {
            trace!(epoch, dropped = queue.frames.len(), "epoch released");
            if let Some(waiter) = queue.waiter {
                let _ = waiter.send(Ok(None));
            }
        }
    }

    fn release_all(&mut self) {
        let epochs: Vec<u64> = self.epochs.keys().copied().collect();
        for epoch in epochs {
            self.release(epoch);
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Frame(epoch, data) => self.deliver(epoch, data),
                Command::Read { epoch, reply } => self.read(epoch, reply),
                Command::Release(epoch) => self.release(epoch),
                Command::Shutdown => {
                    debug!("epoch dispatcher quitting");
                    self.release_all();
                    return;
                }
            }
        }
        debug!("epoch channel dropped, dispatcher quitting");
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::connected_pair;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn channel_pair() -> (EpochChannel, EpochChannel) {
        let (a, b) = connected_pair().await;
        (EpochChannel::new(a), EpochChannel::new(b))
    }

    #[tokio::test]
    async fn epochs_are_isolated_and_ordered() {
        let (left, right) = channel_pair().await;

        left.send(1, b"one-a").await.expect("send");
        left.send(2, b"two").await.expect("send");
        left.send(1, b"one-b").await.expect("send");

        assert_eq!(timeout(WAIT, right.read(2)).await.expect("timeout").expect("read"), Some(b"two".to_vec()));
        assert_eq!(timeout(WAIT, right.read(1)).await.expect("timeout").expect("read"), Some(b"one-a".to_vec()));
        assert_eq!(timeout(WAIT, right.read(1)).await.expect("timeout").expect("read"), Some(b"one-b".to_vec()));
    }

    #[tokio::test]
    async fn waiting_reader_gets_direct_handoff() {
        let (left, right) = channel_pair().await;
        let right = Arc::new(right);

        let waiting = {
            let right = right.clone();
            tokio::spawn(async move { right.read(9).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        left.send(9, b"late").await.expect("send");

        let got = timeout(WAIT, waiting).await.expect("timeout").expect("join");
        assert_eq!(got.expect("read"), Some(b"late".to_vec()));
    }

    #[tokio::test]
    async fn side_channel_is_epoch_zero() {
        let (left, right) = channel_pair().await;

        left.send_side(b"control").await.expect("send");
        assert_eq!(timeout(WAIT, right.read(SIDE_CHANNEL)).await.expect("timeout").expect("read"), Some(b"control".to_vec()));

        left.send(SIDE_CHANNEL, b"again").await.expect("send");
        assert_eq!(timeout(WAIT, right.read_side()).await.expect("timeout").expect("read"), Some(b"again".to_vec()));
    }

    #[tokio::test]
    async fn second_reader_on_same_epoch_is_busy() {
        let (_left, right) = channel_pair().await;
        let right = Arc::new(right);

        let _first = {
            let right = right.clone();
            tokio::spawn(async move { right.read(4).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(right.read(4).await, Err(Error::EpochBusy(4))));
    }

    #[tokio::test]
    async fn release_wakes_reader_and_drops_buffer() {
        let (left, right) = channel_pair().await;
        let right = Arc::new(right);

        let waiting = {
            let right = right.clone();
            tokio::spawn(async move { right.read(3).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        right.release(3).await;

        let got = timeout(WAIT, waiting).await.expect("timeout").expect("join");
        assert_eq!(got.expect("read"), None);

        left.send(5, b"stale").await.expect("send");
        left.send(6, b"marker").await.expect("send");
        assert_eq!(timeout(WAIT, right.read(6)).await.expect("timeout").expect("read"), Some(b"marker".to_vec()));
        right.release(5).await;
        left.send(5, b"fresh").await.expect("send");
        assert_eq!(timeout(WAIT, right.read(5)).await.expect("timeout").expect("read"), Some(b"fresh".to_vec()));
    }

    #[tokio::test]
    async fn short_frame_shuts_channel_down() {
        let (raw, conn) = connected_pair().await;
        let channel = Arc::new(EpochChannel::new(conn));

        let waiting = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.read(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        raw.send(&[1, 2, 3]).await.expect("send");

        let got = timeout(WAIT, waiting).await.expect("timeout").expect("join");
        assert_eq!(got.expect("released"), None);
        assert!(!channel.is_live());
        assert!(matches!(channel.read(1).await, Err(Error::NotLive)));
        assert!(matches!(channel.send(1, b"x").await, Err(Error::NotLive)));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_reaches_peer() {
        let (left, right) = channel_pair().await;
        let right = Arc::new(right);

        let waiting = {
            let right = right.clone();
            tokio::spawn(async move { right.read(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        left.shutdown().await;
        left.shutdown().await;
        assert!(!left.is_live());
        assert!(matches!(left.send(1, b"x").await, Err(Error::NotLive)));

        let got = timeout(WAIT, waiting).await.expect("timeout").expect("join");
        assert_eq!(got.expect("released"), None);
        assert!(!right.is_live());
    }
}
