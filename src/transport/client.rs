//! Persistent WebSocket connection with bounded reconnection.
//!
//! ```text
//! disconnected --connect--> connecting --open ok--> connected
//! connected --close/error--> reconnecting --delay--> connecting   (attempts left)
//! connected --close/error--> disconnected                         (no attempts left)
//! connecting --open fails--> reconnecting                         (attempts left)
//! connecting --open fails--> failed                               (no attempts left)
//! any --disconnect()--> disconnected
//! ```

use crate::audio::capture_loop::FrameSink;
use crate::defaults;
use crate::error::{Result, VoicelinkError};
use crate::session::events::ConnectionState;
use crate::transport::protocol::{self, ControlMessage, PendingConnection};
use crate::transport::reconnect::{ReconnectPolicy, ReconnectTracker};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Method whose receipt ends the session and disables reconnection.
pub const METHOD_SESSION_ENDED: &str = "onsessionended";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub reconnect: ReconnectPolicy,
    /// Send a ping every N audio frames; 0 disables it.
    pub ping_interval_frames: u64,
    pub outbound_queue_frames: usize,
    pub connect_timeout: Duration,
    /// How long `disconnect` waits for the connection task to finish.
    pub join_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            ping_interval_frames: defaults::PING_INTERVAL_FRAMES,
            outbound_queue_frames: defaults::OUTBOUND_QUEUE_FRAMES,
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            join_timeout: Duration::from_millis(defaults::JOIN_TIMEOUT_MS),
        }
    }
}

/// Everything the transport reports upward, in socket order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged {
        state: ConnectionState,
        reason: Option<String>,
    },
    /// Server audio to play.
    Audio(Vec<u8>),
    Control(ControlMessage),
    Error {
        code: String,
        message: String,
        is_fatal: bool,
    },
}

/// Counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub pings_sent: u64,
    pub reconnect_attempts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    pings_sent: AtomicU64,
    reconnect_attempts: AtomicU64,
}

struct Shared {
    config: TransportConfig,
    pending: PendingConnection,
    state: Mutex<ConnectionState>,
    auto_reconnect: AtomicBool,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

/// How one open connection ended.
enum Closed {
    Shutdown,
    Dropped { reason: String },
}

/// Handle to the connection task. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    /// Start connecting in the background. Must be called inside a Tokio
    /// runtime.
    ///
    /// `pending` is replayed verbatim in the `initiate` message of every
    /// (re)connection.
    pub fn connect(
        pending: PendingConnection,
        config: TransportConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            auto_reconnect: AtomicBool::new(config.reconnect.enabled),
            config,
            pending,
            state: Mutex::new(ConnectionState::Disconnected),
            outbound: Mutex::new(None),
            events: events_tx,
            shutdown: shutdown_tx,
            task: Mutex::new(None),
            counters: Counters::default(),
        });

        tracing::info!(endpoint = %shared.pending.endpoint, "connecting to voice server");
        let task = tokio::spawn(Arc::clone(&shared).run(shutdown_rx));
        *lock(&shared.task) = Some(task);

        (Self { shared }, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.pending.endpoint
    }

    pub fn auto_reconnect(&self) -> bool {
        self.shared.auto_reconnect.load(Ordering::Acquire)
    }

    /// Stop reconnecting after the current connection ends.
    pub fn disable_auto_reconnect(&self) {
        self.shared.auto_reconnect.store(false, Ordering::Release);
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.shared.counters;
        TransportStats {
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            pings_sent: c.pings_sent.load(Ordering::Relaxed),
            reconnect_attempts: c.reconnect_attempts.load(Ordering::Relaxed),
        }
    }

    /// Queue a custom control message `{"method": method, "data"?: data}`.
    pub fn send_event(&self, method: &str, data: Option<Value>) -> Result<()> {
        if !self.is_connected() {
            return Err(VoicelinkError::NotConnected);
        }
        let text = ControlMessage::new(method, data).to_json()?;
        self.shared.try_send(Message::Text(text.into()))
    }

    /// Signal the connection task to close without waiting for it.
    pub fn shutdown(&self) {
        self.disable_auto_reconnect();
        self.shared.shutdown.send_replace(true);
    }

    /// Close the connection and stop reconnecting. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        self.shutdown();

        let task = lock(&self.shared.task).take();
        if let Some(mut task) = task {
            match tokio::time::timeout(self.shared.config.join_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "connection task failed"),
                Err(_) => {
                    tracing::warn!("connection task did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        self.shared.clear_outbound();
        self.shared
            .set_state(ConnectionState::Disconnected, Some("disconnected by client".to_string()));
    }
}

impl FrameSink for Transport {
    /// Fire-and-forget: frames are dropped unless connected with queue room.
    fn send_audio(&self, frame: &[u8]) {
        let counters = &self.shared.counters;
        if !self.is_connected() {
            counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let outbound = lock(&self.shared.outbound);
        let Some(tx) = outbound.as_ref() else {
            counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if tx.try_send(Message::Binary(frame.to_vec().into())).is_err() {
            counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let sent = counters.frames_sent.fetch_add(1, Ordering::Relaxed) + 1;
        let interval = self.shared.config.ping_interval_frames;
        if interval > 0 && sent % interval == 0 {
            match ControlMessage::ping().to_json() {
                Ok(text) => {
                    if tx.try_send(Message::Text(text.into())).is_ok() {
                        counters.pings_sent.fetch_add(1, Ordering::Relaxed);
                    } else {
                        tracing::debug!("outbound queue full, skipping ping");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode ping"),
            }
        }
    }
}

impl Shared {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tracker = ReconnectTracker::new(self.config.reconnect);

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting, None);

            let attempt = tokio::time::timeout(
                self.config.connect_timeout,
                connect_async(self.pending.endpoint.as_str()),
            );
            let opened = tokio::select! {
                _ = shutdown.changed() => break,
                result = attempt => result,
            };

            let reason = match opened {
                Ok(Ok((ws, _response))) => {
                    tracker.on_open();
                    tracing::info!(endpoint = %self.pending.endpoint, "connected");
                    match self.drive(ws, &mut shutdown).await {
                        Closed::Shutdown => break,
                        Closed::Dropped { reason } => {
                            if let Some(delay) = self.next_retry(&mut tracker) {
                                tracing::info!(%reason, attempt = tracker.attempts(), "connection lost, reconnecting");
                                self.set_state(ConnectionState::Reconnecting, Some(reason));
                                if self.sleep_or_shutdown(delay, &mut shutdown).await {
                                    break;
                                }
                                continue;
                            }
                            tracing::info!(%reason, "connection closed");
                            self.set_state(ConnectionState::Disconnected, Some(reason));
                            break;
                        }
                    }
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "timed out after {} ms",
                    self.config.connect_timeout.as_millis()
                ),
            };

            // Open failed.
            let error = VoicelinkError::ConnectionFailed {
                endpoint: self.pending.endpoint.clone(),
                message: reason.clone(),
            };
            tracing::warn!(error = %error, "connection attempt failed");
            self.emit_error(&error, true);

            match self.next_retry(&mut tracker) {
                Some(delay) => {
                    self.set_state(ConnectionState::Reconnecting, Some(reason));
                    if self.sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                }
                None => {
                    self.set_state(ConnectionState::Failed, Some(reason));
                    break;
                }
            }
        }

        self.clear_outbound();
        tracing::debug!("connection task exited");
    }

    /// Pump one open connection until it closes or shutdown is requested.
    async fn drive(&self, ws: WsStream, shutdown: &mut watch::Receiver<bool>) -> Closed {
        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::channel(self.config.outbound_queue_frames.max(1));
        *lock(&self.outbound) = Some(tx);
        self.set_state(ConnectionState::Connected, None);

        match self.pending.initiate_message().and_then(|m| m.to_json()) {
            Ok(text) => {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    self.clear_outbound();
                    return Closed::Dropped {
                        reason: format!("failed to send initiate: {}", e),
                    };
                }
            }
            Err(e) => self.emit_error(&e, false),
        }

        let closed = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        tracing::debug!(error = %e, "failed to send close frame");
                    }
                    break Closed::Shutdown;
                }
                outgoing = rx.recv() => {
                    let Some(message) = outgoing else {
                        break Closed::Dropped { reason: "outbound queue closed".to_string() };
                    };
                    if let Err(e) = write.send(message).await {
                        let error = VoicelinkError::SendFailed { message: e.to_string() };
                        tracing::warn!(error = %error, "send failed");
                        self.emit_error(&error, false);
                        break Closed::Dropped { reason: e.to_string() };
                    }
                }
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        // PCM16 frames always carry whole samples.
                        if bytes.len() % 2 != 0 {
                            tracing::warn!(len = bytes.len(), "dropping odd-length audio frame");
                        } else {
                            self.emit(TransportEvent::Audio(bytes.to_vec()));
                        }
                    }
                    Some(Ok(Message::Text(text))) => self.dispatch_text(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "server closed the connection".to_string());
                        break Closed::Dropped { reason };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let error = VoicelinkError::ConnectionFailed {
                            endpoint: self.pending.endpoint.clone(),
                            message: e.to_string(),
                        };
                        tracing::warn!(error = %error, "socket error");
                        self.emit_error(&error, false);
                        break Closed::Dropped { reason: e.to_string() };
                    }
                    None => break Closed::Dropped { reason: "connection closed".to_string() },
                },
            }
        };

        self.clear_outbound();
        closed
    }

    fn dispatch_text(&self, text: &str) {
        match protocol::parse_inbound(text) {
            Ok(Some(message)) => {
                if message.method == METHOD_SESSION_ENDED {
                    self.auto_reconnect.store(false, Ordering::Release);
                }
                self.emit(TransportEvent::Control(message));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "dropping inbound message"),
        }
    }

    fn next_retry(&self, tracker: &mut ReconnectTracker) -> Option<Duration> {
        if !self.auto_reconnect.load(Ordering::Acquire) {
            return None;
        }
        let delay = tracker.next_delay()?;
        self.counters
            .reconnect_attempts
            .fetch_add(1, Ordering::Relaxed);
        Some(delay)
    }

    /// Returns true if shutdown was requested during the delay.
    async fn sleep_or_shutdown(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = shutdown.changed() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    fn try_send(&self, message: Message) -> Result<()> {
        let outbound = lock(&self.outbound);
        let tx = outbound.as_ref().ok_or(VoicelinkError::NotConnected)?;
        tx.try_send(message)
            .map_err(|e| VoicelinkError::SendFailed {
                message: e.to_string(),
            })
    }

    fn clear_outbound(&self) {
        *lock(&self.outbound) = None;
    }

    /// Record a transition; repeated states are not re-reported.
    fn set_state(&self, state: ConnectionState, reason: Option<String>) {
        {
            let mut current = lock(&self.state);
            if *current == state {
                return;
            }
            *current = state;
        }
        tracing::debug!(?state, ?reason, "connection state changed");
        self.emit(TransportEvent::StateChanged { state, reason });
    }

    fn emit_error(&self, error: &VoicelinkError, is_fatal: bool) {
        self.emit(TransportEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
            is_fatal,
        });
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("transport event receiver dropped");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
