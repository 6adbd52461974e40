use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use peerlink::{
    assemble, AssemblyStatus, ChannelConnection, CommitteeConfig, CommitteeMember, Gossip,
    GossipConfig, Keypair, SignedConnection, DEFAULT_DIAL_RETRIES,
};

#[derive(Parser, Debug)]
#[command(name = "peerlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address the committee listener binds to.
    #[arg(short, long, default_value = "0.0.0.0:7700")]
    listen: String,

    /// Hex-encoded Ed25519 secret key. A fresh key is generated if omitted.
    #[arg(short = 'k', long = "secret-key", value_name = "HEX")]
    secret_key: Option<String>,

    /// Committee member, repeatable. Our own entry may be included.
    #[arg(short = 'm', long = "member", value_name = "ADDR/IDENTITY")]
    members: Vec<CommitteeMember>,

    #[arg(long, default_value_t = DEFAULT_DIAL_RETRIES)]
    dial_retries: u32,

    #[arg(long, default_value = "500")]
    retry_delay_ms: u64,

    /// Give up on unreachable members after this many seconds.
    #[arg(long)]
    assembly_timeout_secs: Option<u64>,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = match &args.secret_key {
        Some(hex) => Keypair::from_secret_key_hex(hex).context("invalid --secret-key")?,
        None => {
            warn!("no --secret-key given, using an ephemeral identity");
            Keypair::generate()
        }
    };
    info!("Node identity: {}", keypair.identity());

    let config = CommitteeConfig {
        listen_addr: args.listen.clone(),
        dial_retries: args.dial_retries,
        retry_delay: Duration::from_millis(args.retry_delay_ms),
        ..CommitteeConfig::default()
    };

    let cancel = CancellationToken::new();
    if let Some(secs) = args.assembly_timeout_secs {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(secs)).await;
            cancel.cancel();
        });
    }

    let gossip_config = GossipConfig::default();
    let make = {
        let gossip_config = gossip_config.clone();
        move |conn: SignedConnection| ChannelConnection::with_config(conn, &gossip_config)
    };

    let assembly = tokio::select! {
        assembly = assemble(&args.members, Vec::new(), make, &keypair, &config, cancel.clone()) => assembly,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal during assembly, exiting");
            cancel.cancel();
            return Ok(());
        }
    };

    match assembly.status {
        AssemblyStatus::Complete => info!(peers = assembly.peers.len(), "committee assembled"),
        AssemblyStatus::Cancelled => warn!(
            peers = assembly.peers.len(),
            missing = assembly.missing.len(),
            "committee assembly timed out, continuing with partial committee"
        ),
        AssemblyStatus::ListenFailed => {
            anyhow::bail!("could not listen on {}", args.listen);
        }
    }

    let (gossip, mut messages) = Gossip::with_config(assembly.peers, &gossip_config);
    let mut relayed: u64 = 0;
    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            message = messages.recv() => {
                let Some(message) = message else {
                    warn!("gossip stream closed");
                    break;
                };
                match gossip.broadcast_except(&message.data, message.from).await {
                    Ok(sent) => {
                        relayed += 1;
                        info!(from = %message.from.short(), len = message.data.len(), sent, "relayed gossip message");
                    }
                    Err(e) => warn!(error = %e, "relay failed"),
                }
            }
            _ = interval.tick() => {
                let liveness = gossip.liveness().await;
                let live = liveness.iter().filter(|(_, live)| *live).count();
                for (peer, _) in liveness.iter().filter(|(_, live)| !*live) {
                    warn!(peer = %peer.short(), "committee member connection is dead");
                }
                info!(
                    members = liveness.len(),
                    live,
                    relayed,
                    "telemetry snapshot"
                );
            }
        }
    }

    gossip.quit().await;
    Ok(())
}
