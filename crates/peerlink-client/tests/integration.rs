//! Integration tests for the peerlink client
//!
//! Two nodes talk over loopback TCP; the directory is never contacted.

use peerlink_client::{ClientEvent, Config, EventReceiver, Node, SendOutcome, TransferFailure};
use peerlink_core::{Error, TransferState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn node_config(name: &str, dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.username = name.to_string();
    config.download_dir = dir.path().join(name).to_string_lossy().to_string();
    config.listen.host = "127.0.0.1".to_string();
    config.listen.port = 0;
    config.directory.url = "http://127.0.0.1:9".to_string();
    config.connection.handshake_timeout_secs = 5;
    config.connection.decision_timeout_secs = 5;
    config.connection.read_tick_ms = 100;
    config.transfer.pacing_ms = 0;
    config
}

/// Wait for the first event `pick` accepts, skipping the rest
async fn wait_for<T>(events: &mut EventReceiver, mut pick: impl FnMut(ClientEvent) -> Option<T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            if let Some(found) = pick(event) {
                return found;
            }
        }
        panic!("event channel closed");
    })
    .await
    .expect("timed out waiting for event")
}

struct Pair {
    alice: Arc<Node>,
    alice_events: EventReceiver,
    bob: Arc<Node>,
    bob_events: EventReceiver,
}

/// Start alice and bob and connect alice -> bob with bob accepting
async fn connected_pair(alice_config: Config, bob_config: Config) -> Pair {
    let (alice, alice_events) = Node::start(alice_config).await.unwrap();
    let (bob, mut bob_events) = Node::start(bob_config).await.unwrap();

    let addr = bob.local_addr().to_string();
    let initiator = alice.clone();
    let connect = tokio::spawn(async move { initiator.connect("bob", &addr).await });

    let decision = wait_for(&mut bob_events, |e| match e {
        ClientEvent::ConnectionRequested(decision) => Some(decision),
        _ => None,
    })
    .await;
    assert_eq!(decision.username, "alice");
    decision.accept();

    connect.await.unwrap().unwrap();
    wait_for(&mut bob_events, |e| match e {
        ClientEvent::PeerConnected { username, .. } if username == "alice" => Some(()),
        _ => None,
    })
    .await;

    Pair {
        alice,
        alice_events,
        bob,
        bob_events,
    }
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn files_in(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test]
async fn test_handshake_and_chat() {
    let dir = TempDir::new().unwrap();
    let mut pair = connected_pair(node_config("alice", &dir), node_config("bob", &dir)).await;

    assert!(pair.alice.is_connected("bob").await);
    let bob_peers = pair.bob.peers().await;
    assert_eq!(bob_peers.len(), 1);
    assert_eq!(bob_peers[0].username, "alice");

    pair.alice.send_text("bob", "hello bob").await.unwrap();
    let (from, content) = wait_for(&mut pair.bob_events, |e| match e {
        ClientEvent::TextReceived { from, content, .. } => Some((from, content)),
        _ => None,
    })
    .await;
    assert_eq!(from, "alice");
    assert_eq!(content, "hello bob");

    pair.bob.send_text("alice", "hi alice").await.unwrap();
    let content = wait_for(&mut pair.alice_events, |e| match e {
        ClientEvent::TextReceived { content, .. } => Some(content),
        _ => None,
    })
    .await;
    assert_eq!(content, "hi alice");

    pair.alice.shutdown().await;
    wait_for(&mut pair.bob_events, |e| match e {
        ClientEvent::PeerDisconnected { username } if username == "alice" => Some(()),
        _ => None,
    })
    .await;
    assert!(!pair.bob.is_connected("alice").await);
}

#[tokio::test]
async fn test_rejected_connection() {
    let dir = TempDir::new().unwrap();
    let (alice, _alice_events) = Node::start(node_config("alice", &dir)).await.unwrap();
    let (bob, mut bob_events) = Node::start(node_config("bob", &dir)).await.unwrap();

    let addr = bob.local_addr().to_string();
    let initiator = alice.clone();
    let connect = tokio::spawn(async move { initiator.connect("bob", &addr).await });

    let decision = wait_for(&mut bob_events, |e| match e {
        ClientEvent::ConnectionRequested(decision) => Some(decision),
        _ => None,
    })
    .await;
    decision.reject();

    let err = connect.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionRejected { .. }));
    assert!(alice.peers().await.is_empty());
    assert!(bob.peers().await.is_empty());
}

#[tokio::test]
async fn test_second_connection_under_same_name_is_refused() {
    let dir = TempDir::new().unwrap();
    let pair = connected_pair(node_config("alice", &dir), node_config("bob", &dir)).await;

    // Another process calling itself alice
    let (impostor, _events) = Node::start(node_config("alice", &dir)).await.unwrap();
    let err = impostor
        .connect("bob", &pair.bob.local_addr().to_string())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ConnectionRejected { .. }));
    assert_eq!(pair.bob.peers().await.len(), 1);
}

#[tokio::test]
async fn test_file_transfer_report_pdf() {
    let dir = TempDir::new().unwrap();
    let mut pair = connected_pair(node_config("alice", &dir), node_config("bob", &dir)).await;

    let data = sample(20000);
    let source = dir.path().join("report.pdf");
    std::fs::write(&source, &data).unwrap();

    let sender = pair.alice.clone();
    let send = tokio::spawn(async move { sender.send_file("bob", &source).await });

    let offered = wait_for(&mut pair.bob_events, |e| match e {
        ClientEvent::FileOffered { from, metadata } if from == "alice" => Some(metadata),
        _ => None,
    })
    .await;
    assert_eq!(offered.filename, "report.pdf");
    assert_eq!(offered.size, 20000);
    assert_eq!(offered.total_chunks, 3);
    assert_eq!(offered.extension, ".pdf");

    pair.bob.accept_file().await.unwrap();

    let (path, size, verified) = wait_for(&mut pair.bob_events, |e| match e {
        ClientEvent::FileReceived {
            path,
            size,
            verified,
            ..
        } => Some((path, size, verified)),
        _ => None,
    })
    .await;
    let expected: PathBuf = dir.path().join("bob").join("report.pdf");
    assert_eq!(path, expected);
    assert_eq!(size, 20000);
    assert!(verified);
    assert_eq!(std::fs::read(&path).unwrap(), data);

    let outcome = send.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        SendOutcome::Delivered {
            filename: "report.pdf".to_string(),
            chunks: 3
        }
    );
    wait_for(&mut pair.alice_events, |e| match e {
        ClientEvent::FileSent { filename, .. } => Some(filename),
        _ => None,
    })
    .await;

    assert_eq!(pair.alice.transfer_status().await.state, TransferState::Idle);
    assert_eq!(pair.bob.transfer_status().await.state, TransferState::Idle);
    assert_eq!(files_in(&dir.path().join("bob")), vec!["report.pdf".to_string()]);
}

#[tokio::test]
async fn test_rejected_file_offer() {
    let dir = TempDir::new().unwrap();
    let mut pair = connected_pair(node_config("alice", &dir), node_config("bob", &dir)).await;
    let source = dir.path().join("notes.txt");
    std::fs::write(&source, b"some notes").unwrap();

    let sender = pair.alice.clone();
    let send = tokio::spawn(async move { sender.send_file("bob", &source).await });

    wait_for(&mut pair.bob_events, |e| match e {
        ClientEvent::FileOffered { .. } => Some(()),
        _ => None,
    })
    .await;
    pair.bob.reject_file().await.unwrap();

    assert_eq!(send.await.unwrap().unwrap(), SendOutcome::Rejected);
    let reason = wait_for(&mut pair.alice_events, |e| match e {
        ClientEvent::TransferFailed { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, TransferFailure::Rejected);
    assert!(files_in(&dir.path().join("bob")).is_empty());
}

#[tokio::test]
async fn test_unanswered_offer_times_out() {
    let dir = TempDir::new().unwrap();
    let mut alice_config = node_config("alice", &dir);
    alice_config.transfer.confirm_timeout_secs = 1;
    let pair = connected_pair(alice_config, node_config("bob", &dir)).await;

    let source = dir.path().join("report.pdf");
    std::fs::write(&source, sample(20000)).unwrap();

    let outcome = pair.alice.send_file("bob", &source).await.unwrap();

    assert_eq!(outcome, SendOutcome::TimedOut);
    assert_eq!(pair.alice.transfer_status().await.state, TransferState::Idle);
    // Bob never answered and never saw a chunk
    assert!(pair.bob.pending_offer().await.is_some());
    assert_eq!(pair.bob.transfer_status().await.state, TransferState::Idle);
    assert!(files_in(&dir.path().join("bob")).is_empty());
}

#[tokio::test]
async fn test_disconnect_mid_transfer_discards_partial_file() {
    let dir = TempDir::new().unwrap();
    let mut alice_config = node_config("alice", &dir);
    alice_config.transfer.pacing_ms = 300;
    let mut bob_config = node_config("bob", &dir);
    bob_config.transfer.progress_every = 1;
    let mut pair = connected_pair(alice_config, bob_config).await;

    let source = dir.path().join("report.pdf");
    std::fs::write(&source, sample(20000)).unwrap();
    let sender = pair.alice.clone();
    let send = tokio::spawn(async move { sender.send_file("bob", &source).await });

    wait_for(&mut pair.bob_events, |e| match e {
        ClientEvent::FileOffered { .. } => Some(()),
        _ => None,
    })
    .await;
    pair.bob.accept_file().await.unwrap();

    wait_for(&mut pair.bob_events, |e| match e {
        ClientEvent::TransferProgress { chunks_done: 1, .. } => Some(()),
        _ => None,
    })
    .await;
    assert!(pair.bob.disconnect("alice").await);

    let reason = wait_for(&mut pair.bob_events, |e| match e {
        ClientEvent::TransferFailed { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, TransferFailure::PeerDisconnected);
    assert!(files_in(&dir.path().join("bob")).is_empty());
    assert_eq!(pair.bob.transfer_status().await.state, TransferState::Idle);

    let result = tokio::time::timeout(Duration::from_secs(10), send).await.unwrap().unwrap();
    assert!(result.is_err());
    assert_eq!(pair.alice.transfer_status().await.state, TransferState::Idle);
}
