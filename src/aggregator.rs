//! # Provider Aggregator
//!
//! Dials any number of providers and merges everything they send into one
//! queue. Each provider has its own forwarding task; a provider whose read
//! fails is dropped without affecting the others. Frames from one provider
//! keep their order; frames from different providers interleave.
//!
//! The aggregator lives until its cancellation token fires (or
//! [`Aggregator::close`] is called). From then on every provider is shut
//! down, the output queue is closed and every call returns
//! [`Error::NotLive`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::committee::CommitteeMember;
use crate::conn::{ConnectionConfig, SignedConnection};
use crate::error::{Error, Result};
use crate::identity::{Identity, Keypair};

pub const DEFAULT_OUTPUT_QUEUE: usize = 1024;

const COMMAND_CHANNEL_SIZE: usize = 64;

#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    /// Frames buffered across all providers before forwarding tasks wait.
    pub output_queue: usize,
    pub connection: ConnectionConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            output_queue: DEFAULT_OUTPUT_QUEUE,
            connection: ConnectionConfig::default(),
        }
    }
}

/// One frame read from a provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderFrame {
    pub provider: Identity,
    pub data: Vec<u8>,
}

enum Command {
    Register {
        conn: SignedConnection,
        reply: oneshot::Sender<()>,
    },
    /// Sent by a forwarding task whose read failed.
    Failed { provider: Identity, generation: u64 },
    Close {
        provider: Identity,
        reply: oneshot::Sender<bool>,
    },
    CloseAll(oneshot::Sender<()>),
    Providers(oneshot::Sender<Vec<Identity>>),
}

// ============================================================================
// Aggregator Handle
// ============================================================================

pub struct Aggregator {
    cmd_tx: mpsc::Sender<Command>,
    output: Mutex<mpsc::Receiver<ProviderFrame>>,
    keypair: Keypair,
    config: AggregatorConfig,
    cancel: CancellationToken,
}

impl Aggregator {
    pub fn new(keypair: Keypair, cancel: CancellationToken) -> Self {
        Self::with_config(keypair, cancel, AggregatorConfig::default())
    }

    pub fn with_config(keypair: Keypair, cancel: CancellationToken, config: AggregatorConfig) -> Self {
        let cancel = cancel.child_token();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (out_tx, out_rx) = mpsc::channel(config.output_queue.max(1));

        let actor = AggregatorActor {
            providers: HashMap::new(),
            next_generation: 0,
            out_tx: Some(out_tx),
            cmd_tx: cmd_tx.downgrade(),
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));

        Self {
            cmd_tx,
            output: Mutex::new(out_rx),
            keypair,
            config,
            cancel,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Dial `member` and start forwarding its frames. A provider already
    /// registered under the same identity is replaced.
    pub async fn add_provider(&self, member: &CommitteeMember) -> Result<()> {
        if !self.is_live() {
            return Err(Error::NotLive);
        }
        let conn = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::NotLive),
            conn = SignedConnection::dial_with(
                &member.addr,
                &self.keypair,
                member.identity,
                &self.config.connection,
            ) => conn?,
        };

        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Register { conn, reply }).await.is_err() {
            return Err(Error::NotLive);
        }
        rx.await.map_err(|_| Error::NotLive)?;
        info!(provider = %member.identity.short(), addr = %member.addr, "provider added");
        Ok(())
    }

    /// Next frame from any provider.
    pub async fn read(&self) -> Result<ProviderFrame> {
        if !self.is_live() {
            return Err(Error::NotLive);
        }
        let mut output = self.output.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::NotLive),
            frame = output.recv() => frame.ok_or(Error::NotLive),
        }
    }

    /// Shut down and deregister one provider. Returns whether it was present.
    pub async fn close_provider(&self, provider: Identity) -> Result<bool> {
        self.request(|reply| Command::Close { provider, reply }).await
    }

    pub async fn close_all_providers(&self) -> Result<()> {
        self.request(Command::CloseAll).await
    }

    pub async fn providers(&self) -> Result<Vec<Identity>> {
        self.request(Command::Providers).await
    }

    /// Permanently stop the aggregator.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        if !self.is_live() {
            return Err(Error::NotLive);
        }
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(make(reply)).await.map_err(|_| Error::NotLive)?;
        rx.await.map_err(|_| Error::NotLive)
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Aggregator Actor
// ============================================================================

struct Provider {
    conn: Arc<SignedConnection>,
    forward: AbortHandle,
    generation: u64,
}

struct AggregatorActor {
    providers: HashMap<Identity, Provider>,
    next_generation: u64,
    /// Dropped on shutdown so readers observe the closed queue.
    out_tx: Option<mpsc::Sender<ProviderFrame>>,
    cmd_tx: mpsc::WeakSender<Command>,
    cancel: CancellationToken,
}

impl AggregatorActor {
    fn register(&mut self, conn: SignedConnection) {
        let Some(out_tx) = self.out_tx.clone() else {
            return;
        };
        let Some(cmd_tx) = self.cmd_tx.upgrade() else {
            return;
        };
        let provider = conn.remote_identity();
        let conn = Arc::new(conn);
        let generation = self.next_generation;
        self.next_generation += 1;

        let task = tokio::spawn(forward(
            conn.clone(),
            generation,
            out_tx,
            cmd_tx,
            self.cancel.clone(),
        ));
        let previous = self.providers.insert(
            provider,
            Provider {
                conn,
                forward: task.abort_handle(),
                generation,
            },
        );
        if let Some(previous) = previous {
            warn!(provider = %provider.short(), "provider re-added, replacing connection");
            close(previous);
        }
    }

    fn close_provider(&mut self, provider: &Identity) -> bool {
        match self.providers.remove(provider) {
            Some(entry) => {
                debug!(provider = %provider.short(), "closing provider");
                close(entry);
                true
            }
            None => false,
        }
    }

    fn close_all(&mut self) {
        for (_, entry) in self.providers.drain() {
            close(entry);
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(providers = self.providers.len(), "aggregator cancelled, actor quitting");
                    break;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Register { conn, reply }) => {
                        self.register(conn);
                        let _ = reply.send(());
                    }
                    Some(Command::Failed { provider, generation }) => {
                        if self
                            .providers
                            .get(&provider)
                            .is_some_and(|entry| entry.generation == generation)
                        {
                            self.close_provider(&provider);
                        }
                    }
                    Some(Command::Close { provider, reply }) => {
                        let _ = reply.send(self.close_provider(&provider));
                    }
                    Some(Command::CloseAll(reply)) => {
                        self.close_all();
                        let _ = reply.send(());
                    }
                    Some(Command::Providers(reply)) => {
                        let _ = reply.send(self.providers.keys().copied().collect());
                    }
                    None => {
                        debug!("aggregator handle dropped, actor quitting");
                        break;
                    }
                },
            }
        }
        self.close_all();
        self.out_tx = None;
    }
}

fn close(entry: Provider) {
    entry.forward.abort();
    tokio::spawn(async move { entry.conn.shutdown().await });
}

async fn forward(
    conn: Arc<SignedConnection>,
    generation: u64,
    out_tx: mpsc::Sender<ProviderFrame>,
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
) {
    let provider = conn.remote_identity();
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => return,
            data = conn.read() => data,
        };
        match data {
            Ok(data) => {
                if out_tx.send(ProviderFrame { provider, data }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(provider = %provider.short(), error = %e, "provider read failed, removing");
                let _ = cmd_tx.send(Command::Failed { provider, generation }).await;
                return;
            }
        }
    }
}
