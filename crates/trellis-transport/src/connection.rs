//! Connection lifecycle: one socket per session, reconnecting with backoff.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -(unexpected close)-> Reconnecting -> Connecting ...
//! ```
//! `Disconnected` is only re-entered through [`ConnectionManager::disconnect`]
//! or when `max_retries` consecutive attempts fail.

use crate::error::{TransportError, TransportResult};
use crate::socket::{Connector, Socket, SocketFrame, TokenProvider};
use parking_lot::Mutex;
use rand::Rng;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Lifecycle and data events, in socket order
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Open,
    /// `manual` is set when the close came from [`ConnectionManager::disconnect`]
    Close {
        manual: bool,
        code: Option<u16>,
        reason: String,
    },
    Error(String),
    Message(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Upper bound of the uniform random delay added to each step
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_jitter: Duration::from_secs(1),
        }
    }
}

/// Doubling delay capped at `policy.max`, plus jitter
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: policy.base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.policy.max);
        self.current = next.min(self.policy.max);
        delay + self.jitter()
    }

    pub fn reset(&mut self) {
        self.current = self.policy.base;
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.policy.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server origin, e.g. `wss://collab.example.com`
    pub base_url: String,
    pub project_id: String,
    /// Deadline for a single attempt, token acquisition included
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Consecutive failed attempts before giving up; `None` retries forever
    pub max_retries: Option<u32>,
    /// How long a connection must stay open before the backoff resets
    pub stable_after: Duration,
}

impl ConnectionConfig {
    pub fn new(base_url: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            project_id: project_id.into(),
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            max_retries: Some(10),
            stable_after: Duration::from_secs(5),
        }
    }

    /// `<base>/ws/<projectId>?token=<credential>`
    pub fn url(&self, token: &str) -> String {
        format!(
            "{}/ws/{}?token={}",
            self.base_url.trim_end_matches('/'),
            encode_component(&self.project_id),
            encode_component(token)
        )
    }
}

/// Percent-encode everything outside the URI unreserved set
fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => {
                let _ = write!(out, "%{b:02X}");
            }
        }
    }
    out
}

/// Owns the session's socket.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    state: watch::Sender<ConnectionState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    #[cfg(feature = "metrics")]
    metrics: OnceLock<Arc<Metrics>>,
}

impl ConnectionManager {
    /// Create a manager and the receiver for its events.
    ///
    /// Nothing is dialed until [`connect`](Self::connect).
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Inner {
            config,
            connector,
            tokens,
            state,
            outgoing: Mutex::new(None),
            events,
            supervisor: Mutex::new(None),
            #[cfg(feature = "metrics")]
            metrics: OnceLock::new(),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    #[cfg(feature = "metrics")]
    pub fn set_metrics(&self, metrics: Arc<Metrics>) {
        let _ = self.inner.metrics.set(metrics);
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Start the connection and wait for the first attempt.
    ///
    /// Resolves once the socket opens; fails if that attempt fails or times
    /// out, in which case reconnecting continues in the background. Calling
    /// it while a connection is already managed waits for that one instead.
    pub async fn connect(&self) -> TransportResult<()> {
        let ready_rx = {
            let mut supervisor = self.inner.supervisor.lock();
            match supervisor.as_ref() {
                Some(handle) if !handle.is_finished() => None,
                _ => {
                    let (ready_tx, ready_rx) = oneshot::channel();
                    let inner = self.inner.clone();
                    *supervisor = Some(tokio::spawn(inner.supervise(ready_tx)));
                    Some(ready_rx)
                }
            }
        };

        match ready_rx {
            Some(rx) => rx.await.unwrap_or(Err(TransportError::ConnectionClosed)),
            None => {
                let mut state = self.subscribe_state();
                let reached = state
                    .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected))
                    .await
                    .map(|s| *s)
                    .unwrap_or(ConnectionState::Disconnected);
                if reached == ConnectionState::Connected {
                    Ok(())
                } else {
                    Err(TransportError::NotConnected)
                }
            }
        }
    }

    /// Close deliberately. Pending reconnects are cancelled and no new
    /// attempt is made until `connect` is called again.
    pub fn disconnect(&self) {
        if let Some(handle) = self.inner.supervisor.lock().take() {
            handle.abort();
        }
        self.inner.outgoing.lock().take();
        #[cfg(feature = "metrics")]
        if let Some(m) = self.inner.metrics.get() {
            m.connected.set(0);
        }

        let previous = self.inner.state.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            info!(project = %self.inner.config.project_id, "Disconnected");
            self.inner.emit(ConnectionEvent::Close {
                manual: true,
                code: Some(1000),
                reason: "Client disconnect".into(),
            });
        }
    }

    /// Hand one text frame to the socket. Never blocks; false when the
    /// socket is not open.
    pub fn send(&self, text: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let sent = self
            .inner
            .outgoing
            .lock()
            .as_ref()
            .map_or(false, |tx| tx.send(text.to_string()).is_ok());
        #[cfg(feature = "metrics")]
        if sent {
            if let Some(m) = self.inner.metrics.get() {
                m.frames_sent.inc();
            }
        }
        sent
    }
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn supervise(self: Arc<Self>, ready: oneshot::Sender<TransportResult<()>>) {
        let mut ready = Some(ready);
        let mut backoff = Backoff::new(self.config.backoff);
        let mut failures: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            match self.open_socket().await {
                Ok(socket) => {
                    self.run_socket(socket, &mut ready, &mut backoff, &mut failures)
                        .await;
                }
                Err(e) => {
                    warn!(project = %self.config.project_id, attempt = failures + 1, error = %e, "Connection attempt failed");
                    self.emit(ConnectionEvent::Error(e.to_string()));
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(e));
                    }
                }
            }

            failures += 1;
            if let Some(max) = self.config.max_retries {
                if failures > max {
                    let e = TransportError::RetriesExhausted(max);
                    error!(project = %self.config.project_id, "{e}");
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(ConnectionEvent::Error(e.to_string()));
                    return;
                }
            }

            let delay = backoff.next_delay();
            self.set_state(ConnectionState::Reconnecting);
            info!(
                project = %self.config.project_id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Reconnect scheduled"
            );
            #[cfg(feature = "metrics")]
            if let Some(m) = self.metrics.get() {
                m.reconnect_attempts.inc();
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn open_socket(&self) -> TransportResult<Socket> {
        let attempt = async {
            let token = self.tokens.token().await.map_err(|e| match e {
                TransportError::Token(_) => e,
                other => TransportError::Token(other.to_string()),
            })?;
            let url = self.config.url(&token);
            debug!(project = %self.config.project_id, "Dialing");
            self.connector.connect(&url).await
        };
        tokio::time::timeout(self.config.connect_timeout, attempt)
            .await
            .map_err(|_| TransportError::Timeout(self.config.connect_timeout))?
    }

    /// Pump one open socket until it closes
    async fn run_socket(
        &self,
        socket: Socket,
        ready: &mut Option<oneshot::Sender<TransportResult<()>>>,
        backoff: &mut Backoff,
        failures: &mut u32,
    ) {
        let (outgoing, mut incoming) = socket.into_parts();
        *self.outgoing.lock() = Some(outgoing);
        self.set_state(ConnectionState::Connected);
        info!(project = %self.config.project_id, "Connected");
        #[cfg(feature = "metrics")]
        if let Some(m) = self.metrics.get() {
            m.connected.set(1);
        }
        self.emit(ConnectionEvent::Open);
        if let Some(tx) = ready.take() {
            let _ = tx.send(Ok(()));
        }

        let stable = tokio::time::sleep(self.config.stable_after);
        tokio::pin!(stable);
        let mut is_stable = false;

        let (code, reason) = loop {
            tokio::select! {
                _ = &mut stable, if !is_stable => {
                    is_stable = true;
                    backoff.reset();
                    *failures = 0;
                    debug!(project = %self.config.project_id, "Connection stable, backoff reset");
                }
                frame = incoming.recv() => match frame {
                    Some(SocketFrame::Text(text)) => self.emit(ConnectionEvent::Message(text)),
                    Some(SocketFrame::Error(e)) => {
                        warn!(project = %self.config.project_id, error = %e, "Socket error");
                        self.emit(ConnectionEvent::Error(e));
                    }
                    Some(SocketFrame::Closed { code, reason }) => break (code, reason),
                    None => break (None, "socket dropped".to_string()),
                }
            }
        };

        self.outgoing.lock().take();
        self.set_state(ConnectionState::Reconnecting);
        #[cfg(feature = "metrics")]
        if let Some(m) = self.metrics.get() {
            m.connected.set(0);
        }
        warn!(project = %self.config.project_id, ?code, %reason, "Connection closed");
        self.emit(ConnectionEvent::Close {
            manual: false,
            code,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockListener};
    use crate::socket::StaticToken;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn config() -> ConnectionConfig {
        let mut config = ConnectionConfig::new("ws://collab.test/", "proj 1");
        config.backoff = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(4),
            max_jitter: Duration::ZERO,
        };
        config
    }

    fn manager(
        config: ConnectionConfig,
    ) -> (
        ConnectionManager,
        mpsc::UnboundedReceiver<ConnectionEvent>,
        MockConnector,
        MockListener,
    ) {
        let (connector, listener) = MockConnector::new();
        let (manager, events) = ConnectionManager::new(
            config,
            Arc::new(connector.clone()),
            Arc::new(StaticToken("s3cret/=".into())),
        );
        (manager, events, connector, listener)
    }

    struct CountingToken(AtomicU32);

    #[async_trait]
    impl TokenProvider for CountingToken {
        async fn token(&self) -> Result<String, TransportError> {
            Ok(format!("tok-{}", self.0.fetch_add(1, Ordering::SeqCst) + 1))
        }
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(config().backoff);
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 4, 4]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(100),
            max_jitter: Duration::from_millis(50),
        });
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_url_format() {
        assert_eq!(
            config().url("s3cret/="),
            "ws://collab.test/ws/proj%201?token=s3cret%2F%3D"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_open_and_send() {
        let (manager, mut events, _connector, mut listener) = manager(config());
        assert!(!manager.send("early"));

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(events.recv().await, Some(ConnectionEvent::Open));

        let mut server = listener.accept().await.unwrap();
        assert!(server.url().ends_with("?token=s3cret%2F%3D"));
        assert!(manager.send("hello"));
        assert_eq!(server.recv().await.as_deref(), Some("hello"));

        server.send("from server");
        assert_eq!(
            events.recv().await,
            Some(ConnectionEvent::Message("from server".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_then_background_retry() {
        let (manager, _events, connector, mut listener) = manager(config());
        connector.hang_next_connect();

        let started = Instant::now();
        let err = manager.connect().await.unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::from_secs(10)));
        assert!(started.elapsed() >= Duration::from_secs(10));

        // Reconnect continues after the first backoff step
        let _server = listener.accept().await.unwrap();
        assert_eq!(connector.attempts(), 2);
        let mut state = manager.subscribe_state();
        state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_reconnects_with_growing_backoff() {
        let (manager, mut events, _connector, mut listener) = manager(config());
        manager.connect().await.unwrap();

        let server = listener.accept().await.unwrap();
        let t0 = Instant::now();
        server.close(1006, "gone");
        let server = listener.accept().await.unwrap();
        let t1 = Instant::now();
        assert!(t1 - t0 >= Duration::from_secs(1) && t1 - t0 < Duration::from_secs(2));

        server.close(1006, "gone again");
        let server = listener.accept().await.unwrap();
        let t2 = Instant::now();
        assert!(t2 - t1 >= Duration::from_secs(2) && t2 - t1 < Duration::from_secs(3));

        // A connection that stays up resets the delay
        tokio::time::sleep(Duration::from_secs(6)).await;
        server.close(1006, "late drop");
        let _server = listener.accept().await.unwrap();
        let t3 = Instant::now() - Duration::from_secs(6);
        assert!(t3 - t2 >= Duration::from_secs(1) && t3 - t2 < Duration::from_secs(2));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&ConnectionEvent::Close {
            manual: false,
            code: Some(1006),
            reason: "gone".into()
        }));
        assert_eq!(seen.iter().filter(|e| **e == ConnectionEvent::Open).count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_requested_per_attempt() {
        let (connector, mut listener) = MockConnector::new();
        let (manager, _events) = ConnectionManager::new(
            config(),
            Arc::new(connector.clone()),
            Arc::new(CountingToken(AtomicU32::new(0))),
        );
        connector.fail_next_connect("refused");

        assert!(manager.connect().await.is_err());
        let _server = listener.accept().await.unwrap();

        let urls = connector.urls();
        assert!(urls[0].ends_with("token=tok-1"));
        assert!(urls[1].ends_with("token=tok-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_is_terminal() {
        let mut cfg = config();
        cfg.max_retries = Some(2);
        let (manager, _events, connector, _listener) = manager(cfg);
        for _ in 0..3 {
            connector.fail_next_connect("refused");
        }

        assert!(manager.connect().await.is_err());
        let mut state = manager.subscribe_state();
        state.wait_for(|s| *s == ConnectionState::Disconnected).await.unwrap();
        assert_eq!(connector.attempts(), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_disconnect_suppresses_reconnect() {
        let (manager, mut events, connector, mut listener) = manager(config());
        manager.connect().await.unwrap();
        let mut server = listener.accept().await.unwrap();
        assert_eq!(events.recv().await, Some(ConnectionEvent::Open));

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.send("after"));
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Close { manual: true, .. })
        ));
        assert_eq!(server.recv().await, None);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);

        // Idempotent
        manager.disconnect();
        assert!(events.try_recv().is_err());
    }
}
