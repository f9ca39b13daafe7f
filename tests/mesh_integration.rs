//! Two buses relaying over a real peer mesh.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use peerbus::bus::handler_fn;
use peerbus::transport::mesh::MeshConfig;
use peerbus::transport::{PeerMeshTransport, PEER_OFFLINE_EVENT, PEER_ONLINE_EVENT};
use peerbus::{Bus, Message};

const WAIT: Duration = Duration::from_secs(5);

struct Node {
    bus: Bus,
    transport: Arc<PeerMeshTransport>,
    received: mpsc::UnboundedReceiver<Message>,
}

/// Build a bus on a mesh transport, record everything it dispatches for the
/// given events, then start listening.
async fn node(root: &Path, events: &[&str]) -> Node {
    let transport = Arc::new(
        PeerMeshTransport::new(MeshConfig::with_root_dir(root))
            .await
            .unwrap(),
    );
    let bus = Bus::builder().transport(transport.clone()).build();

    let (tx, received) = mpsc::unbounded_channel();
    for event in events {
        let tx = tx.clone();
        bus.on(
            *event,
            handler_fn(move |msg: Arc<Message>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((*msg).clone());
                    Ok(())
                }
            }),
        )
        .unwrap();
    }

    transport.start().await.unwrap();
    Node {
        bus,
        transport,
        received,
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    timeout(WAIT, rx.recv())
        .await
        .expect("Timed out waiting for message")
        .expect("Handler channel closed")
}

#[tokio::test]
async fn test_two_buses_relay_over_mesh() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("mesh");
    let events = [PEER_ONLINE_EVENT, PEER_OFFLINE_EVENT, "ping"];

    let mut a = node(&root, &events).await;
    let mut b = node(&root, &events).await;

    let online = next(&mut a.received).await;
    assert_eq!(online.event, PEER_ONLINE_EVENT);
    assert_eq!(online.data, json!(b.transport.socket_path().to_string_lossy()));

    let online = next(&mut b.received).await;
    assert_eq!(online.event, PEER_ONLINE_EVENT);
    assert_eq!(online.data, json!(a.transport.socket_path().to_string_lossy()));

    let from_b = Message::new("ping", "b").with_header("header-one", "value");
    let report = b.bus.emit(from_b.clone()).await;
    assert!(report.is_success());
    // Local handler plus remote delivery.
    assert_eq!(next(&mut b.received).await, from_b);
    assert_eq!(next(&mut a.received).await, from_b);

    let from_a = Message::new("ping", json!({"name": "a"}));
    a.bus.emit(from_a.clone()).await;
    assert_eq!(next(&mut a.received).await, from_a);
    assert_eq!(next(&mut b.received).await, from_a);

    // Nothing was echoed back to its sender.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.received.try_recv().is_err());
    assert!(b.received.try_recv().is_err());

    a.bus.close().await.unwrap();

    let offline = next(&mut b.received).await;
    assert_eq!(offline.event, PEER_OFFLINE_EVENT);
    assert_eq!(offline.data, json!(a.transport.socket_path().to_string_lossy()));
    assert!(root.exists());

    b.bus.close().await.unwrap();
    assert!(!root.exists());
}

#[tokio::test]
async fn test_single_bus_mesh_cleans_up() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("mesh");

    let mut solo = node(&root, &["local"]).await;
    assert!(solo.transport.socket_path().exists());

    solo.bus.emit(Message::event("local")).await;
    assert_eq!(next(&mut solo.received).await, Message::event("local"));
    assert!(!solo.transport.has_peers().await);

    solo.bus.close().await.unwrap();
    assert!(!root.exists());
}
