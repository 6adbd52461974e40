//! Integration tests for gossip over an assembled committee.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use peerlink::{
    assemble, ChannelConnection, CommitteeConfig, CommitteeMember, Gossip, GossipConfig,
    GossipMessage, Keypair, SignedConnection,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(33000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_addr() -> String {
    format!("127.0.0.1:{}", next_port())
}

const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const SHORT_TIMEOUT: Duration = Duration::from_millis(300);

struct GossipNode {
    keypair: Keypair,
    gossip: Gossip,
    messages: mpsc::Receiver<GossipMessage>,
}

async fn gossip_committee(size: usize, config: GossipConfig) -> Vec<GossipNode> {
    let keypairs: Vec<Keypair> = (0..size).map(|_| Keypair::generate()).collect();
    let members: Vec<CommitteeMember> = keypairs
        .iter()
        .map(|k| CommitteeMember::new(test_addr(), k.identity()))
        .collect();

    let mut handles = Vec::new();
    for (keypair, member) in keypairs.iter().zip(&members) {
        let members = members.clone();
        let keypair = keypair.clone();
        let committee = CommitteeConfig {
            listen_addr: member.addr.clone(),
            dial_retries: 40,
            retry_delay: Duration::from_millis(50),
            ..CommitteeConfig::default()
        };
        let gossip_config = config.clone();
        handles.push(tokio::spawn(async move {
            let make = move |conn: SignedConnection| ChannelConnection::with_config(conn, &gossip_config);
            assemble(&members, Vec::new(), make, &keypair, &committee, CancellationToken::new()).await
        }));
    }

    let mut nodes = Vec::new();
    for (handle, keypair) in handles.into_iter().zip(keypairs) {
        let assembly = timeout(TEST_TIMEOUT, handle)
            .await
            .expect("assembly timed out")
            .expect("join");
        assert!(assembly.is_complete());
        let (gossip, messages) = Gossip::with_config(assembly.peers, &config);
        nodes.push(GossipNode {
            keypair,
            gossip,
            messages,
        });
    }
    nodes
}

async fn next_message(node: &mut GossipNode) -> GossipMessage {
    timeout(TEST_TIMEOUT, node.messages.recv())
        .await
        .expect("no gossip delivered")
        .expect("gossip stream closed")
}

#[tokio::test]
async fn broadcast_reaches_every_member() {
    let mut nodes = gossip_committee(3, GossipConfig::default()).await;
    let origin = nodes[0].keypair.identity();

    let sent = nodes[0].gossip.broadcast(b"proposal").await.expect("broadcast");
    assert_eq!(sent, 2);

    for node in nodes.iter_mut().skip(1) {
        let message = next_message(node).await;
        assert_eq!(message.from, origin);
        assert_eq!(message.data, b"proposal");
    }
}

#[tokio::test]
async fn relayed_duplicates_are_suppressed() {
    let mut nodes = gossip_committee(3, GossipConfig::default()).await;
    let origin = nodes[0].keypair.identity();

    nodes[0].gossip.broadcast(b"block").await.expect("broadcast");

    // Every receiver relays to everyone but the origin, like the binary does.
    for i in 1..3 {
        let message = next_message(&mut nodes[i]).await;
        assert_eq!(message.data, b"block");
        nodes[i]
            .gossip
            .broadcast_except(&message.data, message.from)
            .await
            .expect("relay");
    }

    nodes[0].gossip.broadcast(b"next").await.expect("broadcast");
    for i in 1..3 {
        let message = next_message(&mut nodes[i]).await;
        assert_eq!(message.data, b"next", "relayed copy must not be delivered twice");
        assert_eq!(message.from, origin);
    }

    assert!(
        timeout(SHORT_TIMEOUT, nodes[0].messages.recv()).await.is_err(),
        "origin must not receive its own broadcast back"
    );
}

#[tokio::test]
async fn heartbeats_keep_released_members_quiet() {
    let config = GossipConfig {
        heartbeat_interval: Duration::from_millis(25),
        ..GossipConfig::default()
    };
    let mut nodes = gossip_committee(2, config).await;
    let second = nodes[1].keypair.identity();

    // Releasing the member puts it back to idle, so it starts heartbeating.
    let released = nodes[0]
        .gossip
        .release_identity(second)
        .await
        .expect("member present");
    assert!(!released.is_active());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        timeout(SHORT_TIMEOUT, nodes[1].messages.recv()).await.is_err(),
        "heartbeats are never delivered as gossip"
    );
    assert!(released.is_live());

    released.send(b"direct").await.expect("send");
    let message = next_message(&mut nodes[1]).await;
    assert_eq!(message.data, b"direct");
}

#[tokio::test]
async fn quit_closes_member_links() {
    let nodes = gossip_committee(2, GossipConfig::default()).await;
    let first = nodes[0].keypair.identity();

    nodes[0].gossip.quit().await;

    timeout(TEST_TIMEOUT, async {
        loop {
            let liveness = nodes[1].gossip.liveness().await;
            if liveness == vec![(first, false)] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer never noticed the closed link");

    assert_eq!(nodes[1].gossip.broadcast(b"anyone?").await.expect("broadcast"), 0);
}
