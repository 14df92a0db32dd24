//! Connection lifecycle tests against a scripted fake transport, driven
//! entirely on tokio's paused clock so backoff and heartbeat timing are
//! exact.

use deck_core::{Envelope, MessageKind, SubscribeScope, CLOSE_POLICY_VIOLATION};
use deck_sync::{
    CloseReason, Connector, LinkStatus, Socket, SocketEvent, SyncClient, SyncConfig,
    TransportError,
};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use url::Url;

enum Outcome {
    Accept(FakeSocket),
}

struct ScriptedConnector {
    connects: AtomicU32,
    script: Mutex<VecDeque<Outcome>>,
}

impl ScriptedConnector {
    /// Connect attempts consume the script in order; once it runs dry,
    /// every further attempt is refused.
    fn new(outcomes: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicU32::new(0),
            script: Mutex::new(outcomes.into()),
        })
    }

    fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, _url: &Url) -> BoxFuture<'static, Result<Box<dyn Socket>, TransportError>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().unwrap().pop_front();
        async move {
            match outcome {
                Some(Outcome::Accept(socket)) => Ok(Box::new(socket) as Box<dyn Socket>),
                None => Err(TransportError::Unavailable("scripted refusal".to_string())),
            }
        }
        .boxed()
    }
}

struct FakeSocket {
    events: mpsc::UnboundedReceiver<Result<SocketEvent, TransportError>>,
    sent: mpsc::UnboundedSender<String>,
}

impl Socket for FakeSocket {
    fn send(&mut self, text: String) -> BoxFuture<'_, Result<(), TransportError>> {
        let result = self
            .sent
            .send(text)
            .map_err(|_| TransportError::Unavailable("hub handle dropped".to_string()));
        async move { result }.boxed()
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<SocketEvent, TransportError>> {
        async move {
            match self.events.recv().await {
                Some(event) => event,
                None => Ok(SocketEvent::Closed(None)),
            }
        }
        .boxed()
    }

    fn close(&mut self, _code: u16) -> BoxFuture<'_, ()> {
        self.events.close();
        async move {}.boxed()
    }
}

/// Test-side handle to one fake socket.
struct HubHandle {
    events: mpsc::UnboundedSender<Result<SocketEvent, TransportError>>,
    sent: mpsc::UnboundedReceiver<String>,
}

impl HubHandle {
    fn send_frame(&self, text: &str) {
        let _ = self.events.send(Ok(SocketEvent::Frame(text.to_string())));
    }

    fn close(&self, reason: Option<(u16, &str)>) {
        let _ = self
            .events
            .send(Ok(SocketEvent::Closed(reason.map(|(code, reason)| {
                CloseReason {
                    code,
                    reason: reason.to_string(),
                }
            }))));
    }

    async fn next_sent(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(600), self.sent.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("socket dropped")
    }

    fn drain_sent(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(text) = self.sent.try_recv() {
            out.push(text);
        }
        out
    }
}

fn fake_pair() -> (FakeSocket, HubHandle) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    (
        FakeSocket {
            events: event_rx,
            sent: sent_tx,
        },
        HubHandle {
            events: event_tx,
            sent: sent_rx,
        },
    )
}

fn config(base_secs: u64, max_attempts: u32, heartbeat_secs: u64) -> SyncConfig {
    let mut config = SyncConfig::new(Url::parse("ws://hub.test/ws").expect("url"));
    config.client_id = Some("deck-test".to_string());
    config.reconnect_base_delay = Duration::from_secs(base_secs);
    config.max_reconnect_attempts = max_attempts;
    config.heartbeat_interval = Duration::from_secs(heartbeat_secs);
    config
}

/// Waits for a stable status. Transient states (Connecting) may be
/// overwritten before a receiver runs, so tests only wait for states that
/// persist across an await point.
async fn wait_for(status: &mut watch::Receiver<LinkStatus>, want: LinkStatus) {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            if *status.borrow_and_update() == want {
                return;
            }
            status.changed().await.expect("status channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
}

async fn wait_for_connects(connector: &ScriptedConnector, want: u32) {
    tokio::time::timeout(Duration::from_secs(600), async {
        while connector.connect_count() < want {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want} connect attempts"));
}

fn record_statuses(mut status: watch::Receiver<LinkStatus>) -> Arc<Mutex<Vec<LinkStatus>>> {
    let log = Arc::new(Mutex::new(vec![*status.borrow()]));
    let sink = log.clone();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            sink.lock().unwrap().push(*status.borrow_and_update());
        }
    });
    log
}

#[tokio::test(start_paused = true)]
async fn connect_while_open_is_a_no_op() {
    let (socket, _hub) = fake_pair();
    let connector = ScriptedConnector::new(vec![Outcome::Accept(socket)]);
    let client = SyncClient::new(config(5, 10, 30), connector.clone());
    let mut status = client.status();

    client.connect();
    wait_for(&mut status, LinkStatus::Open).await;

    client.connect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(connector.connect_count(), 1);
    assert!(client.is_open());
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_caps_and_then_exhausts() {
    let (socket, hub) = fake_pair();
    let connector = ScriptedConnector::new(vec![Outcome::Accept(socket)]);
    let client = SyncClient::new(config(1, 7, 3600), connector.clone());
    let mut status = client.status();

    client.connect();
    wait_for(&mut status, LinkStatus::Open).await;

    let started = Instant::now();
    hub.close(None);
    wait_for(&mut status, LinkStatus::Exhausted).await;

    // Delays 1+2+3+4+5 then capped 5+5 seconds, all failed.
    assert_eq!(started.elapsed(), Duration::from_secs(25));
    assert_eq!(connector.connect_count(), 8);

    // Exhaustion is terminal until the host intervenes.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.connect_count(), 8);
}

#[tokio::test(start_paused = true)]
async fn attempts_reset_after_a_successful_open() {
    let (first, hub_first) = fake_pair();
    let (second, hub_second) = fake_pair();
    // Script: open, then one refused retry, then open again. Connects
    // after that are refused, which is fine for the final observation.
    let connector = ScriptedConnector::new(vec![Outcome::Accept(first)]);
    let client = SyncClient::new(config(5, 10, 3600), connector.clone());
    let mut status = client.status();

    client.connect();
    wait_for(&mut status, LinkStatus::Open).await;

    hub_first.close(None);
    wait_for(&mut status, LinkStatus::Retrying { attempt: 1 }).await;
    // The first retry is refused (script is dry). While the second delay
    // is pending, hand the next attempt a fresh socket.
    wait_for(&mut status, LinkStatus::Retrying { attempt: 2 }).await;
    connector
        .script
        .lock()
        .unwrap()
        .push_back(Outcome::Accept(second));
    wait_for(&mut status, LinkStatus::Open).await;

    // A new failure starts counting from one again.
    hub_second.close(None);
    wait_for(&mut status, LinkStatus::Retrying { attempt: 1 }).await;

    client.disconnect();
    wait_for(&mut status, LinkStatus::Closed).await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_before_connect_changes_nothing() {
    let (socket, _hub) = fake_pair();
    let connector = ScriptedConnector::new(vec![Outcome::Accept(socket)]);
    let client = SyncClient::new(config(5, 10, 30), connector.clone());
    let mut status = client.status();

    client.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*status.borrow_and_update(), LinkStatus::Idle);
    assert_eq!(connector.connect_count(), 0);

    // The client is still usable afterwards.
    client.connect();
    wait_for(&mut status, LinkStatus::Open).await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_a_scheduled_reconnect() {
    let (socket, hub) = fake_pair();
    let connector = ScriptedConnector::new(vec![Outcome::Accept(socket)]);
    let client = SyncClient::new(config(5, 10, 3600), connector.clone());
    let mut status = client.status();

    client.connect();
    wait_for(&mut status, LinkStatus::Open).await;

    hub.close(None);
    wait_for(&mut status, LinkStatus::Retrying { attempt: 1 }).await;

    client.disconnect();
    wait_for(&mut status, LinkStatus::Closed).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn policy_violation_close_is_terminal() {
    let (socket, hub) = fake_pair();
    let connector = ScriptedConnector::new(vec![Outcome::Accept(socket)]);
    let hook_fired = Arc::new(AtomicBool::new(false));
    let fired = hook_fired.clone();
    let client = SyncClient::with_auth_hook(
        config(1, 10, 3600),
        connector.clone(),
        Some(Arc::new(move || {
            fired.store(true, Ordering::SeqCst);
        })),
    );
    let mut status = client.status();

    client.connect();
    wait_for(&mut status, LinkStatus::Open).await;

    hub.close(Some((CLOSE_POLICY_VIOLATION, "auth rejected")));
    wait_for(&mut status, LinkStatus::AuthRejected).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.connect_count(), 1);
    assert!(hook_fired.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn unauthorized_error_frame_is_terminal() {
    let (socket, hub) = fake_pair();
    let connector = ScriptedConnector::new(vec![Outcome::Accept(socket)]);
    let hook_fired = Arc::new(AtomicBool::new(false));
    let fired = hook_fired.clone();
    let client = SyncClient::with_auth_hook(
        config(1, 10, 3600),
        connector.clone(),
        Some(Arc::new(move || {
            fired.store(true, Ordering::SeqCst);
        })),
    );
    let mut status = client.status();
    let dispatched = Arc::new(AtomicUsize::new(0));
    let counter = dispatched.clone();
    let _wild = client.subscribe_fn("*", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    client.connect();
    wait_for(&mut status, LinkStatus::Open).await;

    hub.send_frame(r#"{"type": "error", "error": "unauthorized"}"#);
    wait_for(&mut status, LinkStatus::AuthRejected).await;

    assert!(hook_fired.load(Ordering::SeqCst));
    // The terminal error frame is not fanned out to subscribers.
    assert_eq!(dispatched.load(Ordering::SeqCst), 0);
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_connection_is_rebuilt_once_without_backoff() {
    let (first, mut hub_first) = fake_pair();
    let (second, _hub_second) = fake_pair();
    let connector =
        ScriptedConnector::new(vec![Outcome::Accept(first), Outcome::Accept(second)]);
    let client = SyncClient::new(config(5, 10, 30), connector.clone());
    let mut status = client.status();
    let statuses = record_statuses(client.status());

    client.connect();
    wait_for(&mut status, LinkStatus::Open).await;

    // No inbound traffic at all: heartbeats go out at 30 s and 60 s, the
    // 90 s tick crosses the 2x threshold and forces one rebuild.
    let started = Instant::now();
    wait_for_connects(&connector, 2).await;
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(90) && elapsed < Duration::from_secs(95),
        "stale rebuild at {elapsed:?}"
    );

    let sent = hub_first.drain_sent();
    let heartbeats = sent
        .iter()
        .filter(|frame| frame.contains("\"heartbeat\""))
        .count();
    assert_eq!(heartbeats, 2);

    // Immediate rebuild: the backoff path was never entered.
    assert!(!statuses
        .lock()
        .unwrap()
        .iter()
        .any(|status| matches!(status, LinkStatus::Retrying { .. })));
}

#[tokio::test(start_paused = true)]
async fn inbound_traffic_counts_as_liveness() {
    let (socket, hub) = fake_pair();
    let connector = ScriptedConnector::new(vec![Outcome::Accept(socket)]);
    let client = SyncClient::new(config(5, 10, 30), connector.clone());
    let mut status = client.status();

    client.connect();
    wait_for(&mut status, LinkStatus::Open).await;

    // Event frames every 25 s keep the link fresh across six heartbeat
    // intervals; nothing ever goes stale.
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(25)).await;
        hub.send_frame(r#"{"type": "event", "event": {"message": "tick"}}"#);
    }

    assert_eq!(connector.connect_count(), 1);
    assert!(client.is_open());
}

#[tokio::test(start_paused = true)]
async fn send_is_dropped_until_open_then_delivered() {
    let (socket, mut hub) = fake_pair();
    let connector = ScriptedConnector::new(vec![Outcome::Accept(socket)]);
    let client = SyncClient::new(config(5, 10, 3600), connector);
    let mut status = client.status();

    // Not connected: dropped with a warning, no error surfaced.
    client.send(&Envelope::subscribe_scope(&SubscribeScope::team("t1")));

    client.connect();
    wait_for(&mut status, LinkStatus::Open).await;

    client.send(&Envelope::subscribe_scope(&SubscribeScope::team("t1")));
    let frame = hub.next_sent().await;
    assert!(frame.contains("\"subscribe\""));
    assert!(frame.contains("\"teamId\":\"t1\""));
    // The pre-connect send never made it onto the wire.
    assert!(hub.drain_sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped_without_closing() {
    let (socket, hub) = fake_pair();
    let connector = ScriptedConnector::new(vec![Outcome::Accept(socket)]);
    let client = SyncClient::new(config(5, 10, 3600), connector.clone());
    let mut status = client.status();
    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    let _sub = client.subscribe_fn(MessageKind::AgentUpdate.as_str(), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    client.connect();
    wait_for(&mut status, LinkStatus::Open).await;

    hub.send_frame("{this is not json");
    hub.send_frame(r#"{"type": "agent_update", "agent": {"id": "a1"}}"#);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(updates.load(Ordering::SeqCst), 1);
    assert_eq!(connector.connect_count(), 1);
    assert!(client.is_open());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_frames_never_reach_wire_subscribers() {
    let (socket, hub) = fake_pair();
    let connector = ScriptedConnector::new(vec![Outcome::Accept(socket)]);
    let client = SyncClient::new(config(5, 10, 3600), connector);
    let mut status = client.status();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    let _specific = client.subscribe_fn("heartbeat", move |message| {
        sink.lock().unwrap().push(message.r#type.clone());
    });
    let sink = seen.clone();
    let _wild = client.subscribe_fn("*", move |message| {
        sink.lock().unwrap().push(message.r#type.clone());
    });

    client.connect();
    wait_for(&mut status, LinkStatus::Open).await;

    hub.send_frame(r#"{"type": "heartbeat", "timestamp": 1767225600000}"#);
    hub.send_frame(r#"{"type": "event", "event": {"message": "after"}}"#);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*seen.lock().unwrap(), vec!["event".to_string()]);
}
