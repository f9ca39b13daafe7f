use super::*;
use crate::id::SequentialIds;
use crate::transport::{MockTransport, PEER_OFFLINE_EVENT, PEER_ONLINE_EVENT};
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::timeout;

type Seen = Arc<Mutex<Vec<Message>>>;

/// Handler that records every message it receives.
fn recorder() -> (Seen, impl EventHandler) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = handler_fn(move |msg: Arc<Message>| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push((*msg).clone());
            Ok(())
        }
    });
    (seen, handler)
}

/// Handler that forwards every message to a channel.
fn notifier() -> (mpsc::UnboundedReceiver<Message>, impl EventHandler) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |msg: Arc<Message>| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((*msg).clone());
            Ok(())
        }
    });
    (rx, handler)
}

async fn always_fails(_msg: Arc<Message>) -> std::result::Result<(), HandlerError> {
    Err(HandlerError::failed("test failure"))
}

async fn always_panics(_msg: Arc<Message>) -> std::result::Result<(), HandlerError> {
    panic!("handler exploded")
}

fn seen(recorded: &Seen) -> Vec<Message> {
    recorded.lock().unwrap().clone()
}

fn mock_bus() -> (Bus, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let bus = Bus::builder().transport(transport.clone()).build();
    (bus, transport)
}

#[tokio::test]
async fn test_emit_invokes_every_matching_handler_once() {
    let bus = Bus::new();
    let (h1, handler1) = recorder();
    let (h2, handler2) = recorder();
    let (other, other_handler) = recorder();
    bus.on("test", handler1).unwrap();
    bus.on("test", handler2).unwrap();
    bus.on("other", other_handler).unwrap();

    let report = bus.emit(Message::new("test", "one")).await;

    assert_eq!(report.invoked, 2);
    assert!(report.is_success());
    assert_eq!(seen(&h1), vec![Message::new("test", "one")]);
    assert_eq!(seen(&h2), vec![Message::new("test", "one")]);
    assert!(seen(&other).is_empty());
}

#[tokio::test]
async fn test_emit_with_no_handlers_completes() {
    let bus = Bus::new();
    let report = bus.emit(Message::event("nobody")).await;
    assert_eq!(report, DispatchReport::default());
}

#[tokio::test]
async fn test_off_removes_only_that_handler() {
    let bus = Bus::new();
    let (h1, handler1) = recorder();
    let (h2, handler2) = recorder();
    let sub1 = bus.on("test", handler1).unwrap();
    bus.on("test", handler2).unwrap();

    sub1.off();
    let report = bus.emit(Message::event("test")).await;

    assert_eq!(report.invoked, 1);
    assert!(seen(&h1).is_empty());
    assert_eq!(seen(&h2).len(), 1);
}

#[tokio::test]
async fn test_off_is_idempotent() {
    let bus = Bus::new();
    let (_h, handler) = recorder();
    let sub = bus.on("test", handler).unwrap();

    sub.off();
    sub.off();

    assert_eq!(bus.handler_count(), 0);
}

#[tokio::test]
async fn test_off_after_bus_dropped_is_noop() {
    let bus = Bus::new();
    let (_h, handler) = recorder();
    let sub = bus.on("test", handler).unwrap();

    drop(bus);
    sub.off();
}

#[tokio::test]
async fn test_subscription_accessors() {
    let bus = Bus::builder()
        .id_generator(Arc::new(SequentialIds::new("h")))
        .build();
    let (_h1, handler1) = recorder();
    let (_h2, handler2) = recorder();

    let first = bus.on("test", handler1).unwrap();
    let second = bus.on("other", handler2).unwrap();

    assert_eq!(first.id(), "h-0");
    assert_eq!(first.pattern(), "test");
    assert_eq!(second.id(), "h-1");
    assert_eq!(bus.handler_count(), 2);
}

#[tokio::test]
async fn test_failing_handler_does_not_affect_siblings() {
    let bus = Bus::new();
    let (h, handler) = recorder();
    bus.on_fn("test", always_fails).unwrap();
    bus.on_fn("test", always_panics).unwrap();
    bus.on("test", handler).unwrap();

    let report = bus.emit(Message::event("test")).await;

    assert_eq!(report.invoked, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(seen(&h).len(), 1);
}

#[tokio::test]
async fn test_failing_handler_does_not_raise_to_caller() {
    let bus = Bus::new();
    bus.on_fn("test", always_fails).unwrap();

    let report = bus.emit(Message::event("test")).await;

    assert!(!report.is_success());
}

#[tokio::test]
async fn test_matcher_swap_changes_which_handlers_fire() {
    async fn count_for(bus: Bus) -> usize {
        let (h, handler) = recorder();
        bus.on("orders", handler).unwrap();
        bus.emit(Message::event("orders.created")).await;
        let n = seen(&h).len();
        n
    }

    assert_eq!(count_for(Bus::new()).await, 0);
    assert_eq!(
        count_for(Bus::builder().matcher(HierarchicalMatcher).build()).await,
        1
    );
}

#[tokio::test]
async fn test_concrete_two_handler_scenario() {
    let bus = Bus::new();
    let (h1, handler1) = recorder();
    let (h2, handler2) = recorder();
    let sub1 = bus.on("test", handler1).unwrap();
    bus.on("test", handler2).unwrap();

    let one = Message::new("test", "one").with_header("header-one", "value");
    let two = Message::new("test", "two");
    bus.emit(one.clone()).await;
    bus.emit(two.clone()).await;

    assert_eq!(seen(&h1), vec![one.clone(), two.clone()]);
    assert_eq!(seen(&h2), vec![one.clone(), two.clone()]);

    sub1.off();
    let three = Message::new("test", "three");
    bus.emit(three.clone()).await;

    assert_eq!(seen(&h1), vec![one.clone(), two.clone()]);
    assert_eq!(seen(&h2), vec![one, two, three]);
}

#[tokio::test]
async fn test_dropped_completion_still_dispatches() {
    let bus = Bus::new();
    let (mut rx, handler) = notifier();
    bus.on("test", handler).unwrap();

    drop(bus.emit(Message::new("test", json!({"n": 1}))));

    let received = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.data, json!({"n": 1}));
}

#[tokio::test]
async fn test_reserved_pattern_rejected() {
    let bus = Bus::new();
    let (_h, handler) = recorder();

    let result = bus.on(TRANSPORT_FORWARD_PATTERN, handler);

    assert!(matches!(result, Err(BusError::ReservedPattern(_))));
    assert_eq!(bus.handler_count(), 0);
}

#[tokio::test]
async fn test_reserved_event_not_emitted() {
    let (bus, transport) = mock_bus();

    let report = bus.emit(Message::event(TRANSPORT_FORWARD_PATTERN)).await;

    assert_eq!(report, DispatchReport::default());
    assert_eq!(transport.pushed_count(), 0);
}

#[tokio::test]
async fn test_local_control_events_not_emitted() {
    let (bus, transport) = mock_bus();
    let (h, handler) = recorder();
    bus.on(PEER_OFFLINE_EVENT, handler).unwrap();

    for event in [PEER_ONLINE_EVENT, PEER_OFFLINE_EVENT] {
        let report = bus
            .emit(Message::new(event, "/tmp/peerbus/live.sock"))
            .await;
        assert_eq!(report, DispatchReport::default());
    }

    assert_eq!(transport.pushed_count(), 0);
    assert!(seen(&h).is_empty());
}

#[tokio::test]
async fn test_inbound_control_events_reach_subscribers() {
    let (bus, transport) = mock_bus();
    let (mut rx, handler) = notifier();
    bus.on(PEER_OFFLINE_EVENT, handler).unwrap();

    let offline = Message::new(PEER_OFFLINE_EVENT, "/tmp/peerbus/gone.sock");
    assert!(transport.inject(offline.clone()).await);

    let received = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, offline);
    assert_eq!(transport.pushed_count(), 0);
}

#[tokio::test]
async fn test_build_subscribes_transport() {
    let (bus, transport) = mock_bus();

    assert!(bus.has_transport());
    assert!(transport.is_subscribed());
    assert_eq!(bus.handler_count(), 0);
}

#[tokio::test]
async fn test_local_emit_forwarded_to_transport() {
    let (bus, transport) = mock_bus();

    let sent = Message::new("unheard", "one").with_header("header-one", "value");
    let report = bus.emit(sent.clone()).await;

    assert_eq!(report.invoked, 1);
    assert_eq!(transport.take_pushed(), vec![sent]);
}

#[tokio::test]
async fn test_inbound_message_delivered_locally_not_echoed() {
    let (bus, transport) = mock_bus();
    let (mut rx, handler) = notifier();
    bus.on("remote", handler).unwrap();

    assert!(transport.inject(Message::new("remote", "hello")).await);

    let received = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, Message::new("remote", "hello"));
    assert_eq!(transport.pushed_count(), 0);
}

#[tokio::test]
async fn test_close_delegates_to_transport() {
    let (bus, transport) = mock_bus();

    bus.close().await.unwrap();

    assert_eq!(transport.close_calls(), 1);
}

#[tokio::test]
async fn test_close_propagates_transport_failure() {
    let (bus, transport) = mock_bus();
    transport.set_fail_on_close(true);

    let result = bus.close().await;

    assert!(matches!(result, Err(BusError::Transport(_))));
}

#[tokio::test]
async fn test_close_without_transport() {
    let bus = Bus::new();
    assert!(!bus.has_transport());
    assert!(bus.close().await.is_ok());
}

#[tokio::test]
async fn test_clones_share_registry() {
    let bus = Bus::new();
    let clone = bus.clone();
    let (h, handler) = recorder();
    clone.on("test", handler).unwrap();

    bus.emit(Message::event("test")).await;

    assert_eq!(seen(&h).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_register_and_emit() {
    let bus = Bus::new();

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let bus = bus.clone();
            tokio::spawn(async move {
                let (_h, handler) = recorder();
                let sub = bus.on("test", handler).unwrap();
                bus.emit(Message::new("test", i)).await;
                if i % 2 == 0 {
                    sub.off();
                }
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        task.unwrap();
    }

    assert_eq!(bus.handler_count(), 8);
}
