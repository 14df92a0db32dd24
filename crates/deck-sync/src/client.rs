//! The sync client: one service object per process, owning the single hub
//! connection and the reconnect/heartbeat machinery around it.
//!
//! Construct it once at application start and hand it to whatever needs
//! it; there is no global accessor. The actual state machine runs on a
//! background task. `connect` is idempotent, `disconnect` always wins
//! (it cancels any pending retry and stops the heartbeat in the same
//! command), and `send` is fire-and-forget: while not open, outbound
//! messages are dropped with a warning, never queued.

use crate::router::{MessageHandler, MessageRouter, Subscription};
use crate::transport::{Connector, Socket, SocketEvent};
use deck_core::{Envelope, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Backoff grows linearly with the attempt number and caps at five times
/// the base delay.
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base * attempt.clamp(1, 5)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Hub WebSocket endpoint, externally configured.
    pub url: Url,
    /// Identifier echoed in outbound heartbeats, if any.
    pub client_id: Option<String>,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub heartbeat_interval: Duration,
}

impl SyncConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            client_id: None,
            auto_reconnect: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Connection status as published on the watch channel. `Exhausted` and
/// `AuthRejected` are explicit terminal states: the client goes idle and
/// stays there until the host calls `connect` again (or, for auth,
/// re-establishes a session first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    Connecting,
    Open,
    Retrying { attempt: u32 },
    Closed,
    Exhausted,
    AuthRejected,
}

impl LinkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkStatus::Exhausted | LinkStatus::AuthRejected)
    }
}

/// Side effect fired when the hub rejects the session (policy-violation
/// close or an unauthorized error frame). Hosts typically redirect to a
/// login surface here.
pub type AuthRejectedHook = Arc<dyn Fn() + Send + Sync>;

enum Command {
    Connect,
    Disconnect,
    Send(String),
}

/// The sync service. Dropping it aborts the background task.
pub struct SyncClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<LinkStatus>,
    router: MessageRouter,
    task: JoinHandle<()>,
}

impl SyncClient {
    /// Spawns the connection task. Requires a running tokio runtime.
    pub fn new(config: SyncConfig, connector: Arc<dyn Connector>) -> Self {
        Self::with_auth_hook(config, connector, None)
    }

    pub fn with_auth_hook(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        auth_hook: Option<AuthRejectedHook>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(LinkStatus::Idle);
        let router = MessageRouter::new();
        let runner = Runner {
            config,
            connector,
            router: router.clone(),
            status_tx,
            cmd_rx,
            auth_hook,
        };
        let task = tokio::spawn(runner.run());
        Self {
            cmd_tx,
            status_rx,
            router,
            task,
        }
    }

    /// Starts (or resumes) the connection. No-op while already connecting
    /// or open; while waiting out a backoff delay it retries immediately.
    pub fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect);
    }

    /// Tears the connection down: cancels any pending reconnect, stops
    /// the heartbeat and closes the socket with a normal-closure code.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    /// Serializes and writes `envelope` if the link is open; otherwise
    /// drops it with a warning. Best-effort, no delivery guarantee.
    pub fn send(&self, envelope: &Envelope) {
        if *self.status_rx.borrow() != LinkStatus::Open {
            warn!(kind = %envelope.r#type, "dropping outbound message: not connected");
            return;
        }
        match serde_json::to_string(envelope) {
            Ok(text) => {
                let _ = self.cmd_tx.send(Command::Send(text));
            }
            Err(err) => warn!(error = %err, "failed to serialize outbound message"),
        }
    }

    pub fn subscribe(&self, kind: &str, handler: MessageHandler) -> Subscription {
        self.router.subscribe(kind, handler)
    }

    pub fn subscribe_fn<F>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.router.subscribe_fn(kind, handler)
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Watch channel carrying every status transition, including the
    /// terminal ones. This replaces onConnect/onDisconnect callback pairs.
    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    pub fn is_open(&self) -> bool {
        *self.status_rx.borrow() == LinkStatus::Open
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// How one live session ended; decides what the outer loop does next.
enum SessionEnd {
    /// Host called disconnect; go idle.
    Intentional,
    /// Policy-violation close or unauthorized error frame; terminal.
    AuthRejected,
    /// No traffic within twice the heartbeat interval; rebuild the
    /// connection immediately, without consuming a backoff attempt.
    Stale,
    /// Server close or socket error; enter the backoff path.
    Lost,
    /// Command channel gone, client dropped.
    Shutdown,
}

enum RetryDecision {
    Retry,
    Park,
    Shutdown,
}

struct Runner {
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    router: MessageRouter,
    status_tx: watch::Sender<LinkStatus>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    auth_hook: Option<AuthRejectedHook>,
}

impl Runner {
    async fn run(mut self) {
        'idle: loop {
            // Parked: no socket, no timers. Only a connect command (or
            // client drop) gets us out.
            match self.cmd_rx.recv().await {
                None => return,
                Some(Command::Connect) => {}
                // Already parked; nothing to tear down and no status to
                // publish.
                Some(Command::Disconnect) => continue 'idle,
                Some(Command::Send(_)) => {
                    warn!("dropping outbound message: not connected");
                    continue 'idle;
                }
            }

            let mut attempts: u32 = 0;
            'session: loop {
                self.set_status(LinkStatus::Connecting);
                let socket = match self.connector.connect(&self.config.url).await {
                    Ok(socket) => socket,
                    Err(err) => {
                        warn!(error = %err, url = %self.config.url, "hub connect failed");
                        match self.retry_or_park(&mut attempts).await {
                            RetryDecision::Retry => continue 'session,
                            RetryDecision::Park => continue 'idle,
                            RetryDecision::Shutdown => return,
                        }
                    }
                };

                // Attempts reset exactly on the transition into Open.
                attempts = 0;
                info!(url = %self.config.url, "hub connection open");
                self.set_status(LinkStatus::Open);

                match self.drive(socket).await {
                    SessionEnd::Intentional => {
                        info!("hub connection closed by client");
                        self.set_status(LinkStatus::Closed);
                        continue 'idle;
                    }
                    SessionEnd::AuthRejected => {
                        warn!("hub rejected session authorization; not retrying");
                        self.set_status(LinkStatus::AuthRejected);
                        if let Some(hook) = &self.auth_hook {
                            hook();
                        }
                        continue 'idle;
                    }
                    SessionEnd::Stale => continue 'session,
                    SessionEnd::Lost => match self.retry_or_park(&mut attempts).await {
                        RetryDecision::Retry => continue 'session,
                        RetryDecision::Park => continue 'idle,
                        RetryDecision::Shutdown => return,
                    },
                    SessionEnd::Shutdown => return,
                }
            }
        }
    }

    /// Runs one open socket until it ends, multiplexing inbound frames,
    /// host commands and the heartbeat ticker.
    async fn drive(&mut self, mut socket: Box<dyn Socket>) -> SessionEnd {
        let interval = self.config.heartbeat_interval;
        let mut last_traffic = Instant::now();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

        loop {
            tokio::select! {
                event = socket.recv() => match event {
                    Ok(SocketEvent::Frame(text)) => {
                        last_traffic = Instant::now();
                        match serde_json::from_str::<Envelope>(&text) {
                            Ok(message) => {
                                if message.is_auth_error() {
                                    socket.close(CLOSE_NORMAL).await;
                                    return SessionEnd::AuthRejected;
                                }
                                self.router.dispatch(&message);
                            }
                            Err(err) => warn!(error = %err, "dropping malformed frame"),
                        }
                    }
                    Ok(SocketEvent::Traffic) => last_traffic = Instant::now(),
                    Ok(SocketEvent::Closed(reason)) => {
                        if reason.as_ref().map(|r| r.code) == Some(CLOSE_POLICY_VIOLATION) {
                            return SessionEnd::AuthRejected;
                        }
                        info!(?reason, "hub closed connection");
                        return SessionEnd::Lost;
                    }
                    Err(err) => {
                        warn!(error = %err, "socket error");
                        return SessionEnd::Lost;
                    }
                },
                command = self.cmd_rx.recv() => match command {
                    None => {
                        socket.close(CLOSE_NORMAL).await;
                        return SessionEnd::Shutdown;
                    }
                    Some(Command::Disconnect) => {
                        socket.close(CLOSE_NORMAL).await;
                        return SessionEnd::Intentional;
                    }
                    // connect() while open is a no-op.
                    Some(Command::Connect) => {}
                    Some(Command::Send(text)) => {
                        if let Err(err) = socket.send(text).await {
                            warn!(error = %err, "outbound send failed");
                            return SessionEnd::Lost;
                        }
                    }
                },
                _ = ticker.tick() => {
                    if last_traffic.elapsed() > interval * 2 {
                        warn!("no hub traffic within twice the heartbeat interval; rebuilding connection");
                        socket.close(CLOSE_NORMAL).await;
                        return SessionEnd::Stale;
                    }
                    let heartbeat = Envelope::heartbeat(self.config.client_id.as_deref());
                    match serde_json::to_string(&heartbeat) {
                        Ok(text) => {
                            if let Err(err) = socket.send(text).await {
                                warn!(error = %err, "heartbeat send failed");
                                return SessionEnd::Lost;
                            }
                        }
                        Err(err) => warn!(error = %err, "failed to serialize heartbeat"),
                    }
                },
            }
        }
    }

    /// Schedules the next reconnect, or parks the client when retries are
    /// disabled or exhausted. A disconnect command during the delay wins.
    async fn retry_or_park(&mut self, attempts: &mut u32) -> RetryDecision {
        if !self.config.auto_reconnect {
            self.set_status(LinkStatus::Closed);
            return RetryDecision::Park;
        }
        if *attempts >= self.config.max_reconnect_attempts {
            warn!(
                attempts = *attempts,
                "reconnect attempts exhausted; going idle"
            );
            self.set_status(LinkStatus::Exhausted);
            return RetryDecision::Park;
        }
        *attempts += 1;
        let delay = reconnect_delay(self.config.reconnect_base_delay, *attempts);
        debug!(attempt = *attempts, ?delay, "scheduling reconnect");
        self.set_status(LinkStatus::Retrying { attempt: *attempts });

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return RetryDecision::Retry,
                command = self.cmd_rx.recv() => match command {
                    None => return RetryDecision::Shutdown,
                    Some(Command::Disconnect) => {
                        self.set_status(LinkStatus::Closed);
                        return RetryDecision::Park;
                    }
                    // Explicit connect skips the rest of the delay.
                    Some(Command::Connect) => return RetryDecision::Retry,
                    Some(Command::Send(_)) => {
                        warn!("dropping outbound message: not connected");
                    }
                },
            }
        }
    }

    fn set_status(&self, status: LinkStatus) {
        self.status_tx.send_replace(status);
    }
}
