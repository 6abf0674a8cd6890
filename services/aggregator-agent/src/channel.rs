//! Live update channel - push-based desired state from the control plane.
//!
//! One session per connect cycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (Listening || Keepalive) -> Disconnected
//! ```
//!
//! - The listener reads frames under a rolling deadline extended by every
//!   pong, and applies decoded updates to the desired config.
//! - The keepalive sends a ping every period and tears the session down if
//!   the write fails.
//! - The outer loop polls the connection slot and reconnects once it is
//!   empty; dial failures are retried after a fixed delay.
//!
//! Everything stops on the shutdown signal.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::desired::{ConfigUpdateMessage, DesiredConfig, UpdateSource};
use crate::error::ChannelError;
use crate::sync::{AGGREGATOR_NAME_HEADER, AUTH_KEY_HEADER};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;
type SharedSink = Arc<AsyncMutex<WsSink>>;

/// Path of the update endpoint on the control-plane host.
pub const UPDATES_PATH: &str = "/sync/ws/updates";

// =============================================================================
// Connection Slot
// =============================================================================

/// Lock-guarded slot holding the live connection, if any.
///
/// Each stored handle is tagged with a session id; [`ConnectionSlot::clear`]
/// only empties the slot for the matching session, so a task from an old
/// session can never drop a newer connection.
pub struct ConnectionSlot<H> {
    inner: RwLock<Option<(u64, H)>>,
}

impl<H: Clone> ConnectionSlot<H> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// Install a handle if the slot is empty. Returns false if occupied.
    pub fn try_set(&self, session: u64, handle: H) -> bool {
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some((session, handle));
        true
    }

    /// Current session and handle.
    pub fn get(&self) -> Option<(u64, H)> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Empty the slot if it still holds `session`. Returns whether it did.
    pub fn clear(&self, session: u64) -> bool {
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some((current, _)) if *current == session => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl<H: Clone> Default for ConnectionSlot<H> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Settings and State
// =============================================================================

/// Timing for the live update channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSettings {
    /// Ping period.
    pub keepalive_period: Duration,

    /// Read deadline, extended by every pong.
    pub read_timeout: Duration,

    /// Deadline for ping and close writes.
    pub write_timeout: Duration,

    /// Deadline for the connect handshake.
    pub dial_timeout: Duration,

    /// How often the outer loop checks for a dropped connection.
    pub poll_interval: Duration,

    /// Wait after a failed dial.
    pub reconnect_delay: Duration,
}

impl ChannelSettings {
    pub fn with_keepalive(keepalive_period: Duration) -> Self {
        Self {
            keepalive_period,
            ..Self::default()
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            keepalive_period: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and streaming.
    Connected,
}

// =============================================================================
// Live Update Channel
// =============================================================================

/// Persistent connection to the control plane's update endpoint.
pub struct LiveUpdateChannel {
    desired: Arc<DesiredConfig>,
    settings: ChannelSettings,
    url: String,
    slot: Arc<ConnectionSlot<SharedSink>>,
    state: watch::Sender<ConnectionState>,
    next_session: AtomicU64,
}

impl LiveUpdateChannel {
    pub fn new(desired: Arc<DesiredConfig>, settings: ChannelSettings) -> Self {
        let scheme = if desired.skip_verify_tls() { "ws" } else { "wss" };
        let url = format!("{scheme}://{}{UPDATES_PATH}", desired.endpoints().live_update_host);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            desired,
            settings,
            url,
            slot: Arc::new(ConnectionSlot::new()),
            state,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.slot.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Connect, listen and reconnect until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(url = %self.url, "Starting live update channel");

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.state.send_replace(ConnectionState::Connecting);
            info!(url = %self.url, "Connecting to live update channel");

            let stream = match self.dial().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(url = %self.url, error = %e, "Failed to connect to live update channel");
                    self.state.send_replace(ConnectionState::Disconnected);
                    if wait_or_shutdown(&mut shutdown, self.settings.reconnect_delay).await {
                        break;
                    }
                    continue;
                }
            };

            let session = self.next_session.fetch_add(1, Ordering::Relaxed);
            let (sink, source) = stream.split();
            let sink: SharedSink = Arc::new(AsyncMutex::new(sink));

            if !self.slot.try_set(session, Arc::clone(&sink)) {
                // Only this loop installs sessions, and only after observing an empty slot.
                error!(session, "Connection slot occupied, dropping new connection");
                close_sink(&sink, self.settings.write_timeout).await;
                if wait_or_shutdown(&mut shutdown, self.settings.reconnect_delay).await {
                    break;
                }
                continue;
            }

            self.state.send_replace(ConnectionState::Connected);
            info!(session, "Connected to live update channel");

            let keepalive = tokio::spawn(keepalive_loop(
                Arc::clone(&self.slot),
                session,
                self.settings,
                shutdown.clone(),
            ));
            let listener = tokio::spawn(listen_loop(
                source,
                Arc::clone(&self.slot),
                session,
                Arc::clone(&self.desired),
                self.settings.read_timeout,
                shutdown.clone(),
            ));

            let stopping = self.wait_for_disconnect(&mut shutdown).await;

            self.slot.clear(session);
            close_sink(&sink, self.settings.write_timeout).await;
            keepalive.abort();
            listener.abort();
            let _ = keepalive.await;
            let _ = listener.await;
            self.state.send_replace(ConnectionState::Disconnected);

            if stopping {
                break;
            }
            warn!(session, "Live update channel disconnected, reconnecting");
        }

        self.state.send_replace(ConnectionState::Disconnected);
        info!("Live update channel stopped");
    }

    /// Poll the slot until it empties. Returns true on shutdown.
    async fn wait_for_disconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut poll = tokio::time::interval_at(
            Instant::now() + self.settings.poll_interval,
            self.settings.poll_interval,
        );
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if !self.slot.is_connected() {
                        return false;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return true;
                    }
                }
            }
        }
    }

    async fn dial(&self) -> Result<WsStream, ChannelError> {
        let identity = self.desired.identity();
        let mut request = self.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            AUTH_KEY_HEADER,
            HeaderValue::from_str(&identity.auth_secret).map_err(|e| ChannelError::Request(e.to_string()))?,
        );
        headers.insert(
            AGGREGATOR_NAME_HEADER,
            HeaderValue::from_str(&identity.name).map_err(|e| ChannelError::Request(e.to_string()))?,
        );

        let (stream, response) =
            tokio::time::timeout(self.settings.dial_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| ChannelError::DialTimeout)??;
        debug!(status = %response.status(), "Upgrade accepted");
        Ok(stream)
    }
}

/// Sleep for `delay` unless shutdown arrives first. Returns true on shutdown.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

async fn close_sink<S>(sink: &Arc<AsyncMutex<S>>, write_timeout: Duration)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let mut sink = sink.lock().await;
    match tokio::time::timeout(write_timeout, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Close failed"),
        Err(_) => debug!("Close timed out"),
    }
}

async fn keepalive_loop<S>(
    slot: Arc<ConnectionSlot<Arc<AsyncMutex<S>>>>,
    session: u64,
    settings: ChannelSettings,
    mut shutdown: watch::Receiver<bool>,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    debug!(session, period_ms = settings.keepalive_period.as_millis() as u64, "Starting keepalive");
    let mut ticker = tokio::time::interval_at(
        Instant::now() + settings.keepalive_period,
        settings.keepalive_period,
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let sink = match slot.get() {
            Some((current, sink)) if current == session => sink,
            _ => {
                debug!(session, "Session gone, stopping keepalive");
                break;
            }
        };

        let sent = {
            let mut sink = sink.lock().await;
            tokio::time::timeout(settings.write_timeout, sink.send(Message::Ping(Default::default()))).await
        };

        let failure = match sent {
            Ok(Ok(())) => {
                debug!(session, "Sent ping");
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "write deadline exceeded".to_string(),
        };

        warn!(session, error = %failure, "Failed to send ping, closing connection");
        close_sink(&sink, settings.write_timeout).await;
        slot.clear(session);
        break;
    }
}

async fn listen_loop(
    mut source: WsSource,
    slot: Arc<ConnectionSlot<SharedSink>>,
    session: u64,
    desired: Arc<DesiredConfig>,
    read_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(session, "Listening for updates");
    let mut deadline = Instant::now() + read_timeout;

    loop {
        let frame = tokio::select! {
            frame = tokio::time::timeout_at(deadline, source.next()) => frame,
            _ = shutdown.changed() => break,
        };

        let message = match frame {
            Err(_) => {
                error!(session, "Read timeout");
                break;
            }
            Ok(None) => {
                error!(session, "EOF received");
                break;
            }
            Ok(Some(Err(e))) => {
                error!(session, error = %e, "Read error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Pong(_) => {
                debug!(session, "Received pong");
                deadline = Instant::now() + read_timeout;
            }
            Message::Text(text) => apply_payload(&desired, text.as_bytes()),
            Message::Binary(data) => apply_payload(&desired, &data),
            Message::Close(frame) => {
                error!(session, frame = ?frame, "Close received");
                break;
            }
            Message::Ping(_) | Message::Frame(_) => {}
        }
    }

    slot.clear(session);
}

/// Decode one update frame and apply it. Malformed frames are dropped.
fn apply_payload(desired: &DesiredConfig, payload: &[u8]) {
    match serde_json::from_slice::<ConfigUpdateMessage>(payload) {
        Ok(update) => desired.apply(&update, UpdateSource::LiveChannel),
        Err(e) => error!(
            payload = %String::from_utf8_lossy(payload),
            error = %e,
            "Failed to decode update"
        ),
    }
}
