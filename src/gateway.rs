//! Gateway (WebSocket) transport for the Discord API.
//!
//! This module owns the WebSocket connection lifecycle:
//!   - connect → receive HELLO → send IDENTIFY
//!   - background heartbeat task
//!   - sequence number + session_id tracking
//!   - RESUME when Discord asks for a reconnect
//!   - gateway send rate limiting (120 events / 60s)
//!
//! The rest of the codebase consumes a stream of [`GatewayEvent`] values and
//! sends outbound payloads through a [`GatewaySender`] without ever touching
//! `tokio_tungstenite` directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::events::GatewayEvent;
use crate::types::{GatewayPayload, Intents};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// Discord allows at most 120 gateway sends per 60 seconds.
const SEND_BUDGET_MAX: u32 = 120;
const SEND_BUDGET_WINDOW: Duration = Duration::from_secs(60);

const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Shared WebSocket plumbing (also used by the voice gateway)
// ---------------------------------------------------------------------------

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, WsMessage>;
pub(crate) type WsSource = SplitStream<WsStream>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("gateway protocol error: {0}")]
    Protocol(String),

    #[error("serialisation error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("gateway connection is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Gateway send rate limiter
// ---------------------------------------------------------------------------

/// Simple sliding-window rate limiter for outbound gateway messages.
pub(crate) struct SendRateLimiter {
    timestamps: Vec<Instant>,
    budget: u32,
    window: Duration,
}

impl SendRateLimiter {
    pub(crate) fn new(budget: u32, window: Duration) -> Self {
        Self {
            timestamps: Vec::with_capacity(budget as usize),
            budget,
            window,
        }
    }

    /// How long the caller should wait before sending, or `None` if it can
    /// send immediately. Does **not** record the send.
    pub(crate) fn delay(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut in_window = self
            .timestamps
            .iter()
            .filter(|&&t| now.duration_since(t) < self.window);

        if (in_window.clone().count() as u32) < self.budget {
            return None;
        }

        // At capacity: wait until the oldest send leaves the window.
        let oldest = in_window.next().copied()?;
        let expires_at = oldest + self.window;
        (expires_at > now).then(|| expires_at - now)
    }

    /// Record a send at the current instant and prune old entries.
    pub(crate) fn record(&mut self) {
        let now = Instant::now();
        self.timestamps
            .retain(|&t| now.duration_since(t) < self.window);
        self.timestamps.push(now);
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Options for connecting to the Discord gateway.
#[derive(Clone)]
pub struct GatewayConfig {
    pub token: String,
    pub intents: Intents,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Internal session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct SessionState {
    session_id: Option<String>,
    resume_gateway_url: Option<String>,
    sequence: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

enum Outbound {
    Payload(serde_json::Value),
    Close,
}

/// Cheap, cloneable handle for sending payloads on the gateway.
#[derive(Clone)]
pub struct GatewaySender {
    tx: mpsc::Sender<Outbound>,
}

impl GatewaySender {
    /// Queue a raw payload. It is rate-limited by the driver.
    pub async fn send(&self, payload: serde_json::Value) -> Result<(), GatewayError> {
        self.tx
            .send(Outbound::Payload(payload))
            .await
            .map_err(|_| GatewayError::Closed)
    }

    /// Join, move or (with `channel_id = None`) leave a voice channel.
    pub async fn update_voice_state(
        &self,
        guild_id: &str,
        channel_id: Option<&str>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), GatewayError> {
        self.send(voice_state_update(guild_id, channel_id, self_mute, self_deaf))
            .await
    }

    /// Ask the driver to close the connection with a normal close frame.
    pub async fn close(&self) -> Result<(), GatewayError> {
        self.tx
            .send(Outbound::Close)
            .await
            .map_err(|_| GatewayError::Closed)
    }
}

/// Build an op 4 VOICE_STATE_UPDATE payload.
pub(crate) fn voice_state_update(
    guild_id: &str,
    channel_id: Option<&str>,
    self_mute: bool,
    self_deaf: bool,
) -> serde_json::Value {
    json!({
        "op": 4,
        "d": {
            "guild_id": guild_id,
            "channel_id": channel_id,
            "self_mute": self_mute,
            "self_deaf": self_deaf,
        }
    })
}

/// A live gateway connection.
pub struct GatewayHandle {
    pub sender: GatewaySender,
    /// Receive typed events. Ends when the connection is gone for good.
    pub events: mpsc::Receiver<GatewayEvent>,
    /// Handle to the background driver task.
    pub driver_handle: tokio::task::JoinHandle<()>,
}

impl GatewayHandle {
    /// Another sender for the same connection.
    pub fn sender(&self) -> GatewaySender {
        self.sender.clone()
    }

    /// Close the connection and wait for the driver to finish.
    pub async fn shutdown(self) {
        if self.sender.close().await.is_err() {
            debug!("gateway driver already stopped");
        }
        if let Err(e) = self.driver_handle.await {
            warn!(error = %e, "gateway driver task failed");
        }
    }
}

/// Connect to the Discord gateway, returning a [`GatewayHandle`].
///
/// The first connection (HELLO + IDENTIFY) happens before this returns, so a
/// bad token or unreachable gateway is reported to the caller. Afterwards a
/// background task keeps the session alive.
pub async fn connect(config: GatewayConfig) -> Result<GatewayHandle, GatewayError> {
    let (event_tx, event_rx) = mpsc::channel::<GatewayEvent>(256);
    let (send_tx, send_rx) = mpsc::channel::<Outbound>(64);

    let session = Arc::new(Mutex::new(SessionState::default()));
    let conn = open_session(&config, &session).await?;

    let driver_handle = tokio::spawn(gateway_driver(config, session, conn, event_tx, send_rx));

    Ok(GatewayHandle {
        sender: GatewaySender { tx: send_tx },
        events: event_rx,
        driver_handle,
    })
}

// ---------------------------------------------------------------------------
// Connection setup
// ---------------------------------------------------------------------------

struct Connection {
    write: Arc<Mutex<WsSink>>,
    read: WsSource,
    rate_limiter: Arc<Mutex<SendRateLimiter>>,
    heartbeat_interval: u64,
}

/// Connect, read HELLO, and send IDENTIFY (or RESUME if we have a session).
async fn open_session(
    config: &GatewayConfig,
    session: &Arc<Mutex<SessionState>>,
) -> Result<Connection, GatewayError> {
    let (url, resume) = {
        let s = session.lock().await;
        let resume = match (&s.session_id, s.sequence) {
            (Some(id), Some(seq)) => Some((id.clone(), seq)),
            _ => None,
        };
        let url = s
            .resume_gateway_url
            .clone()
            .filter(|_| resume.is_some())
            .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string());
        (with_query(url), resume)
    };

    info!(url = %url, "connecting to Discord gateway");
    let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    info!("WebSocket connected");

    let (ws_write, mut ws_read) = ws_stream.split();
    let write = Arc::new(Mutex::new(ws_write));
    let rate_limiter = Arc::new(Mutex::new(SendRateLimiter::new(
        SEND_BUDGET_MAX,
        SEND_BUDGET_WINDOW,
    )));

    let heartbeat_interval = read_hello(&mut ws_read).await?;
    info!(interval_ms = heartbeat_interval, "received HELLO");

    let first = match resume {
        Some((session_id, seq)) => json!({
            "op": 6,
            "d": {
                "token": config.token,
                "session_id": session_id,
                "seq": seq,
            }
        }),
        None => json!({
            "op": 2,
            "d": {
                "token": config.token,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "golly",
                    "device": "golly"
                },
                "intents": config.intents.bits(),
            }
        }),
    };
    rate_limited_send(&write, &rate_limiter, &first).await?;
    info!(resume = first["op"] == 6, "sent IDENTIFY/RESUME");

    Ok(Connection {
        write,
        read: ws_read,
        rate_limiter,
        heartbeat_interval,
    })
}

/// Append query params if the URL doesn't already carry them.
fn with_query(url: String) -> String {
    if url.contains("v=10") {
        url
    } else if url.contains('?') {
        format!("{}&v=10&encoding=json", url)
    } else {
        format!("{}/?v=10&encoding=json", url.trim_end_matches('/'))
    }
}

// ---------------------------------------------------------------------------
// The driver loop (runs in a spawned task)
// ---------------------------------------------------------------------------

async fn gateway_driver(
    config: GatewayConfig,
    session: Arc<Mutex<SessionState>>,
    mut conn: Connection,
    event_tx: mpsc::Sender<GatewayEvent>,
    mut send_rx: mpsc::Receiver<Outbound>,
) {
    loop {
        let heartbeat_handle = spawn_heartbeat(&conn, &session);

        let reason = read_loop(&mut conn, &event_tx, &session, &mut send_rx).await;

        heartbeat_handle.abort();

        match reason {
            DisconnectReason::ShouldResume => {
                info!("resuming gateway session");
                match open_session(&config, &session).await {
                    Ok(next) => conn = next,
                    Err(e) => {
                        error!(error = %e, "failed to resume gateway session");
                        return;
                    }
                }
            }
            DisconnectReason::ShouldReidentify => {
                info!("session invalidated, re-identifying");
                {
                    let mut s = session.lock().await;
                    s.session_id = None;
                    s.sequence = None;
                }
                match open_session(&config, &session).await {
                    Ok(next) => conn = next,
                    Err(e) => {
                        error!(error = %e, "failed to re-identify");
                        return;
                    }
                }
            }
            DisconnectReason::Fatal => {
                error!("fatal gateway error, shutting down");
                return;
            }
            DisconnectReason::Closed => {
                info!("gateway closed");
                return;
            }
        }
    }
}

fn spawn_heartbeat(
    conn: &Connection,
    session: &Arc<Mutex<SessionState>>,
) -> tokio::task::JoinHandle<()> {
    let write = Arc::clone(&conn.write);
    let limiter = Arc::clone(&conn.rate_limiter);
    let session = Arc::clone(session);
    let interval_ms = conn.heartbeat_interval;

    tokio::spawn(async move {
        // First heartbeat after `interval * jitter`, jitter ∈ [0, 1).
        let jitter = rand::random::<f64>();
        tokio::time::sleep(Duration::from_millis((interval_ms as f64 * jitter) as u64)).await;

        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            interval.tick().await;
            let seq = session.lock().await.sequence;
            let heartbeat = json!({"op": 1, "d": seq});
            if let Err(e) = rate_limited_send(&write, &limiter, &heartbeat).await {
                warn!(error = %e, "heartbeat send failed, stopping heartbeat task");
                return;
            }
            debug!(seq = ?seq, "sent heartbeat");
        }
    })
}

// ---------------------------------------------------------------------------
// Disconnect reason
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum DisconnectReason {
    ShouldResume,
    ShouldReidentify,
    Fatal,
    Closed,
}

/// Map a server close code to what we should do next.
fn classify_close(code: u16) -> DisconnectReason {
    match code {
        4004 => {
            error!("authentication failed (close 4004)");
            DisconnectReason::Fatal
        }
        4010..=4014 => {
            error!(code, "unrecoverable gateway close");
            DisconnectReason::Fatal
        }
        4007 | 4009 => DisconnectReason::ShouldReidentify,
        _ => DisconnectReason::ShouldResume,
    }
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

async fn read_loop(
    conn: &mut Connection,
    event_tx: &mpsc::Sender<GatewayEvent>,
    session: &Arc<Mutex<SessionState>>,
    send_rx: &mut mpsc::Receiver<Outbound>,
) -> DisconnectReason {
    loop {
        tokio::select! {
            biased;

            outbound = send_rx.recv() => match outbound {
                Some(Outbound::Payload(payload)) => {
                    if let Err(e) = rate_limited_send(&conn.write, &conn.rate_limiter, &payload).await {
                        warn!(error = %e, "failed to send payload on gateway");
                    }
                }
                Some(Outbound::Close) | None => {
                    let mut w = conn.write.lock().await;
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "shutting down".into(),
                    };
                    if let Err(e) = w.send(WsMessage::Close(Some(frame))).await {
                        debug!(error = %e, "close frame not delivered");
                    }
                    return DisconnectReason::Closed;
                }
            },

            msg = conn.read.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket read error");
                        return DisconnectReason::ShouldResume;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        return DisconnectReason::ShouldResume;
                    }
                };

                match msg {
                    WsMessage::Text(text) => {
                        let payload: GatewayPayload = match serde_json::from_str(&text) {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(error = %e, "failed to parse gateway payload");
                                continue;
                            }
                        };

                        if let Some(s) = payload.s {
                            session.lock().await.sequence = Some(s);
                        }

                        let event = GatewayEvent::from_payload(payload);

                        match &event {
                            GatewayEvent::Ready(ready) => {
                                let mut sess = session.lock().await;
                                sess.session_id = Some(ready.session_id.clone());
                                sess.resume_gateway_url = Some(ready.resume_gateway_url.clone());
                                info!(
                                    session_id = %ready.session_id,
                                    user = %ready.user.username,
                                    "gateway READY"
                                );
                            }

                            GatewayEvent::HeartbeatRequest => {
                                let seq = session.lock().await.sequence;
                                let heartbeat = json!({"op": 1, "d": seq});
                                if let Err(e) = rate_limited_send(&conn.write, &conn.rate_limiter, &heartbeat).await {
                                    warn!(error = %e, "failed to send requested heartbeat");
                                }
                                continue;
                            }

                            GatewayEvent::HeartbeatAck => {
                                debug!("heartbeat acknowledged");
                                continue;
                            }

                            GatewayEvent::Reconnect => {
                                info!("gateway requested reconnect (op 7)");
                                return DisconnectReason::ShouldResume;
                            }

                            GatewayEvent::InvalidSession(resumable) => {
                                warn!(resumable, "session invalidated (op 9)");
                                return if *resumable {
                                    DisconnectReason::ShouldResume
                                } else {
                                    DisconnectReason::ShouldReidentify
                                };
                            }

                            _ => {}
                        }

                        if event_tx.send(event).await.is_err() {
                            info!("event channel closed by consumer");
                            return DisconnectReason::Closed;
                        }
                    }

                    WsMessage::Close(frame) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        warn!(close_code = ?code, "WebSocket closed by server");
                        return code.map(classify_close).unwrap_or(DisconnectReason::ShouldResume);
                    }

                    // Ping/Pong/Binary: ignore.
                    _ => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Read the HELLO payload and return the heartbeat interval in ms.
async fn read_hello(stream: &mut WsSource) -> Result<u64, GatewayError> {
    let msg = tokio::time::timeout(HELLO_TIMEOUT, stream.next())
        .await
        .map_err(|_| GatewayError::Timeout("HELLO"))?
        .ok_or(GatewayError::Closed)??;

    let text = match msg {
        WsMessage::Text(t) => t,
        other => {
            return Err(GatewayError::Protocol(format!(
                "expected text message for HELLO, got {:?}",
                other
            )))
        }
    };

    let payload: GatewayPayload = serde_json::from_str(&text)?;
    hello_interval(&payload)
}

/// Heartbeat interval from a HELLO payload. Zero is rejected, since the
/// heartbeat timer cannot run with a zero period.
fn hello_interval(payload: &GatewayPayload) -> Result<u64, GatewayError> {
    if payload.op != 10 {
        return Err(GatewayError::Protocol(format!(
            "expected op 10 (HELLO), got op {}",
            payload.op
        )));
    }

    match payload
        .d
        .as_ref()
        .and_then(|d| d.get("heartbeat_interval"))
        .and_then(|v| v.as_u64())
    {
        Some(0) => Err(GatewayError::Protocol("HELLO heartbeat_interval is 0".to_string())),
        Some(interval) => Ok(interval),
        None => Err(GatewayError::Protocol("HELLO missing heartbeat_interval".to_string())),
    }
}

/// Send a JSON payload on the WebSocket, respecting the send rate limiter.
pub(crate) async fn rate_limited_send(
    ws_write: &Arc<Mutex<WsSink>>,
    rate_limiter: &Arc<Mutex<SendRateLimiter>>,
    payload: &serde_json::Value,
) -> Result<(), GatewayError> {
    loop {
        let delay = rate_limiter.lock().await.delay();
        match delay {
            Some(d) => {
                debug!(
                    delay_ms = d.as_millis() as u64,
                    "gateway send rate-limited, waiting"
                );
                tokio::time::sleep(d).await;
            }
            None => break,
        }
    }
    rate_limiter.lock().await.record();

    let text = serde_json::to_string(payload)?;
    ws_write.lock().await.send(WsMessage::Text(text)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
