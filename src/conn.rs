//! # Signed Connection
//!
//! A [`SignedConnection`] is a raw stream that has passed the handshake and
//! is bound to one verified remote [`Identity`]. Every frame it sends is
//! signed with the local key; every frame it reads is verified against the
//! remote identity before the payload is handed out.
//!
//! ## Wire Format
//!
//! ```text
//! ┌──────────────────┬───────────────────────┬──────────────────┐
//! │ length L (5B LE) │ payload (L − 64 B)    │ signature (64 B) │
//! └──────────────────┴───────────────────────┴──────────────────┘
//! ```
//!
//! `L` counts payload and signature and never exceeds [`MAX_FRAME_LEN`]
//! (`2^40 − 1`).
//!
//! ## Liveness
//!
//! Any read or write failure flips the connection to non-live *before* the
//! error is returned, and wakes every other in-flight operation with
//! [`Error::NotLive`]. [`SignedConnection::shutdown`] does the same and
//! closes the write side so the peer observes end-of-stream. A dead
//! connection never comes back.
//!
//! Reads and writes use separate locks, so one reader task and one writer
//! task can make progress at the same time. `read` is not cancel safe: if
//! its future is dropped mid-frame the stream is out of sync, which is why
//! every caller in this crate only abandons a read when it is also tearing
//! the connection down.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::handshake;
use crate::identity::{Identity, Keypair, SIGNATURE_SIZE};
use crate::transport::{self, BoxedStream, RawStream, DEFAULT_DIAL_TIMEOUT};
use crate::validator::ConnectionValidator;

// ============================================================================
// Framing Constants
// ============================================================================

/// Size of the frame length prefix.
pub const FRAME_LEN_SIZE: usize = 5;

/// Largest value the 5-byte length prefix may carry (payload + signature).
pub const MAX_FRAME_LEN: u64 = (1 << 40) - 1;

/// Default bound on the whole handshake exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Initial read buffer reservation. Frames larger than this grow the buffer
/// as bytes actually arrive rather than trusting the declared length.
const INITIAL_READ_CAPACITY: u64 = 64 * 1024;

/// Encode a signed length as the 5-byte little-endian prefix.
pub fn encode_frame_len(signed_len: u64) -> Result<[u8; FRAME_LEN_SIZE]> {
    if signed_len > MAX_FRAME_LEN {
        return Err(Error::MessageTooLarge {
            size: signed_len,
            max: MAX_FRAME_LEN,
        });
    }
    let bytes = signed_len.to_le_bytes();
    let mut out = [0u8; FRAME_LEN_SIZE];
    out.copy_from_slice(&bytes[..FRAME_LEN_SIZE]);
    Ok(out)
}

pub fn decode_frame_len(prefix: [u8; FRAME_LEN_SIZE]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..FRAME_LEN_SIZE].copy_from_slice(&prefix);
    u64::from_le_bytes(bytes)
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Bound on the three-message handshake.
    pub handshake_timeout: Duration,
    /// Bound on the outbound TCP connect.
    pub dial_timeout: Duration,
    /// Largest frame sent or accepted (payload + signature), capped at
    /// [`MAX_FRAME_LEN`].
    pub max_frame_len: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

// ============================================================================
// SignedConnection
// ============================================================================

pub struct SignedConnection {
    reader: Mutex<ReadHalf<BoxedStream>>,
    writer: Mutex<WriteHalf<BoxedStream>>,
    keypair: Keypair,
    local: Identity,
    remote: Identity,
    live: AtomicBool,
    closed: CancellationToken,
    max_frame_len: u64,
}

impl SignedConnection {
    /// Dial `addr` and authenticate the peer as `expected`.
    pub async fn dial(addr: &str, keypair: &Keypair, expected: Identity) -> Result<Self> {
        Self::dial_with(addr, keypair, expected, &ConnectionConfig::default()).await
    }

    pub async fn dial_with(
        addr: &str,
        keypair: &Keypair,
        expected: Identity,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        let stream = transport::dial(addr, config.dial_timeout).await?;
        Self::establish(stream, keypair, expected, config).await
    }

    /// Authenticate an inbound raw stream, admitting the caller only if
    /// `validator` accepts its claimed identity.
    pub async fn accept<S, V>(stream: S, keypair: &Keypair, validator: &V) -> Result<Self>
    where
        S: RawStream,
        V: ConnectionValidator + ?Sized,
    {
        Self::respond(stream, keypair, validator, &ConnectionConfig::default()).await
    }

    pub async fn accept_with<S, V>(
        stream: S,
        keypair: &Keypair,
        validator: &V,
        config: &ConnectionConfig,
    ) -> Result<Self>
    where
        S: RawStream,
        V: ConnectionValidator + ?Sized,
    {
        Self::respond(stream, keypair, validator, config).await
    }

    /// Run the caller side of the handshake over an already-open stream.
    pub async fn establish<S: RawStream>(
        mut stream: S,
        keypair: &Keypair,
        expected: Identity,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        let outcome = tokio::time::timeout(
            config.handshake_timeout,
            handshake::initiate(&mut stream, keypair, &expected),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                debug!(peer = %expected.short(), "outbound handshake complete");
                Ok(Self::from_parts(stream, keypair.clone(), expected, config))
            }
            Ok(Err(e)) => {
                let _ = stream.shutdown().await;
                Err(e)
            }
            Err(_) => {
                let _ = stream.shutdown().await;
                Err(handshake_timeout())
            }
        }
    }

    /// Run the callee side of the handshake over an already-open stream.
    pub async fn respond<S, V>(
        mut stream: S,
        keypair: &Keypair,
        validator: &V,
        config: &ConnectionConfig,
    ) -> Result<Self>
    where
        S: RawStream,
        V: ConnectionValidator + ?Sized,
    {
        let outcome = tokio::time::timeout(
            config.handshake_timeout,
            handshake::respond(&mut stream, keypair, validator),
        )
        .await;

        match outcome {
            Ok(Ok(remote)) => {
                debug!(peer = %remote.short(), "inbound handshake complete");
                Ok(Self::from_parts(stream, keypair.clone(), remote, config))
            }
            Ok(Err(e)) => {
                let _ = stream.shutdown().await;
                Err(e)
            }
            Err(_) => {
                let _ = stream.shutdown().await;
                Err(handshake_timeout())
            }
        }
    }

    pub(crate) fn from_parts<S: RawStream>(
        stream: S,
        keypair: Keypair,
        remote: Identity,
        config: &ConnectionConfig,
    ) -> Self {
        let boxed: BoxedStream = Box::new(stream);
        let (reader, writer) = tokio::io::split(boxed);
        let local = keypair.identity();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            keypair,
            local,
            remote,
            live: AtomicBool::new(true),
            closed: CancellationToken::new(),
            max_frame_len: config.max_frame_len,
        }
    }

    pub fn remote_identity(&self) -> Identity {
        self.remote
    }

    pub fn local_identity(&self) -> Identity {
        self.local
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Sign and write one frame.
    ///
    /// Oversized payloads are refused before any byte is written and leave
    /// the connection usable.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let signed_len = payload.len() as u64 + SIGNATURE_SIZE as u64;
        if signed_len > self.max_frame_len {
            return Err(Error::MessageTooLarge {
                size: signed_len,
                max: self.max_frame_len,
            });
        }
        let prefix = encode_frame_len(signed_len)?;
        if !self.is_live() {
            return Err(Error::NotLive);
        }

        let signature = self.keypair.sign(payload);
        let mut frame = Vec::with_capacity(FRAME_LEN_SIZE + payload.len() + SIGNATURE_SIZE);
        frame.extend_from_slice(&prefix);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&signature);

        let result = tokio::select! {
            r = async {
                let mut writer = self.writer.lock().await;
                writer.write_all(&frame).await?;
                writer.flush().await?;
                Ok::<(), Error>(())
            } => r,
            _ = self.closed.cancelled() => Err(Error::NotLive),
        };

        if let Err(e) = &result {
            self.mark_dead(e);
        } else {
            trace!(peer = %self.remote.short(), len = payload.len(), "frame sent");
        }
        result
    }

    /// Read one frame and return its verified payload.
    pub async fn read(&self) -> Result<Vec<u8>> {
        if !self.is_live() {
            return Err(Error::NotLive);
        }

        let result = tokio::select! {
            r = self.read_frame() => r,
            _ = self.closed.cancelled() => Err(Error::NotLive),
        };

        if let Err(e) = &result {
            self.mark_dead(e);
        }
        result
    }

    async fn read_frame(&self) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;

        let mut prefix = [0u8; FRAME_LEN_SIZE];
        reader.read_exact(&mut prefix).await?;
        let signed_len = decode_frame_len(prefix);
        if signed_len < SIGNATURE_SIZE as u64 {
            return Err(Error::Protocol("frame shorter than its signature"));
        }
        if signed_len > self.max_frame_len {
            return Err(Error::Protocol("frame exceeds maximum length"));
        }

        let mut frame = Vec::with_capacity(signed_len.min(INITIAL_READ_CAPACITY) as usize);
        let read = (&mut *reader).take(signed_len).read_to_end(&mut frame).await?;
        if read as u64 != signed_len {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "frame truncated",
            )));
        }

        let payload_len = frame.len() - SIGNATURE_SIZE;
        let (payload, signature) = frame.split_at(payload_len);
        self.remote
            .verify(payload, signature)
            .map_err(|_| Error::InvalidSignature)?;

        frame.truncate(payload_len);
        trace!(peer = %self.remote.short(), len = frame.len(), "frame received");
        Ok(frame)
    }

    /// Close the connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            debug!(peer = %self.remote.short(), "shutting down signed connection");
        }
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn mark_dead(&self, error: &Error) {
        if !error.is_fatal() {
            return;
        }
        if self.live.swap(false, Ordering::AcqRel) {
            debug!(peer = %self.remote.short(), error = %error, "signed connection died");
        }
        self.closed.cancel();
    }
}

fn handshake_timeout() -> Error {
    Error::Transport(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))
}

impl std::fmt::Debug for SignedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedConnection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

/// Two signed connections joined by an in-memory pipe, each bound to the
/// other's identity.
#[cfg(test)]
pub(crate) async fn connected_pair() -> (SignedConnection, SignedConnection) {
    use crate::validator::AcceptAll;

    let (a, b) = tokio::io::duplex(1 << 20);
    let left = Keypair::generate();
    let right = Keypair::generate();
    let right_id = right.identity();
    let config = ConnectionConfig::default();

    let (l, r) = tokio::join!(
        SignedConnection::establish(a, &left, right_id, &config),
        SignedConnection::respond(b, &right, &AcceptAll, &config),
    );
    (l.expect("left handshake"), r.expect("right handshake"))
}
