//! Discord voice transport.
//!
//! [`DiscordVoice`] implements [`VoiceTransport`] on top of the main gateway:
//! joining sends a VOICE_STATE_UPDATE, then waits for Discord to answer with
//! our own VOICE_STATE_UPDATE (session id) and a VOICE_SERVER_UPDATE
//! (endpoint and token). The bot's event loop feeds both into
//! [`DiscordVoice::on_voice_state`] / [`DiscordVoice::on_server_update`].
//!
//! Once both arrive the connection itself is handed to a songbird
//! [`Driver`].

pub mod clip;

use std::collections::{HashMap, HashSet};
use std::num::NonZeroU64;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use songbird::driver::Driver;
use songbird::error::ConnectionError;
use songbird::input::Input;
use songbird::tracks::ControlError;
use songbird::{Event, EventContext, EventHandler, TrackEvent};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use crate::gateway::{GatewayError, GatewaySender};
use crate::playback::{Destination, VoiceSession, VoiceTransport};
use crate::sound::Frame;
use crate::types::{Snowflake, VoiceServerUpdate, VoiceState};

/// How long Discord gets to hand us a voice server after we ask to join.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("bot user is not known yet (no READY received)")]
    NotReady,

    #[error("already connected to voice in guild {guild_id}")]
    Busy { guild_id: Snowflake },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("main gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("voice connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("voice track error: {0}")]
    Control(#[from] ControlError),

    #[error("voice protocol error: {0}")]
    Protocol(String),

    #[error("voice connection is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Connection info
// ---------------------------------------------------------------------------

/// Everything the main gateway tells us about a voice server.
#[derive(Clone)]
pub struct ConnectionInfo {
    pub endpoint: String,
    pub guild_id: Snowflake,
    pub user_id: Snowflake,
    pub session_id: String,
    pub token: String,
}

impl ConnectionInfo {
    /// The same details in songbird's terms, for a join of `channel_id`.
    ///
    /// songbird builds the `wss://` URL itself, so a scheme on the endpoint
    /// is stripped.
    pub fn to_songbird(&self, channel_id: &str) -> Result<songbird::ConnectionInfo, VoiceError> {
        let endpoint = self
            .endpoint
            .trim_start_matches("wss://")
            .trim_end_matches('/')
            .to_string();
        if endpoint.is_empty() {
            return Err(VoiceError::Protocol("voice server has no endpoint".to_string()));
        }
        Ok(songbird::ConnectionInfo {
            channel_id: Some(snowflake("channel", channel_id)?.into()),
            endpoint,
            guild_id: snowflake("guild", &self.guild_id)?.into(),
            session_id: self.session_id.clone(),
            token: self.token.clone(),
            user_id: snowflake("user", &self.user_id)?.into(),
        })
    }
}

impl std::fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("endpoint", &self.endpoint)
            .field("guild_id", &self.guild_id)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

fn snowflake(kind: &str, id: &str) -> Result<NonZeroU64, VoiceError> {
    id.parse()
        .map_err(|_| VoiceError::Protocol(format!("invalid {kind} id {id:?}")))
}

// ---------------------------------------------------------------------------
// Pending joins
// ---------------------------------------------------------------------------

struct PendingJoin {
    user_id: Snowflake,
    session_id: Option<String>,
    server: Option<VoiceServerUpdate>,
    tx: oneshot::Sender<ConnectionInfo>,
}

/// Joins waiting for Discord's two voice events, keyed by guild.
#[derive(Default)]
struct PendingJoins {
    by_guild: HashMap<Snowflake, PendingJoin>,
}

impl PendingJoins {
    fn register(&mut self, guild_id: &str, user_id: &str) -> oneshot::Receiver<ConnectionInfo> {
        let (tx, rx) = oneshot::channel();
        self.by_guild.insert(
            guild_id.to_string(),
            PendingJoin {
                user_id: user_id.to_string(),
                session_id: None,
                server: None,
                tx,
            },
        );
        rx
    }

    fn cancel(&mut self, guild_id: &str) {
        self.by_guild.remove(guild_id);
    }

    fn voice_state(&mut self, state: &VoiceState) {
        let Some(guild_id) = state.guild_id.as_deref() else {
            return;
        };
        let Some(pending) = self.by_guild.get_mut(guild_id) else {
            return;
        };
        if pending.user_id != state.user_id {
            return;
        }
        pending.session_id = Some(state.session_id.clone());
        self.try_complete(guild_id);
    }

    fn server_update(&mut self, update: &VoiceServerUpdate) {
        let Some(pending) = self.by_guild.get_mut(&update.guild_id) else {
            return;
        };
        if update.endpoint.is_none() {
            debug!(guild_id = %update.guild_id, "voice server not allocated yet");
            return;
        }
        pending.server = Some(update.clone());
        self.try_complete(&update.guild_id);
    }

    fn try_complete(&mut self, guild_id: &str) {
        let ready = self
            .by_guild
            .get(guild_id)
            .is_some_and(|p| p.session_id.is_some() && p.server.is_some());
        if !ready {
            return;
        }
        let Some(PendingJoin {
            user_id,
            session_id: Some(session_id),
            server: Some(server),
            tx,
        }) = self.by_guild.remove(guild_id)
        else {
            return;
        };
        let info = ConnectionInfo {
            endpoint: server.endpoint.unwrap_or_default(),
            guild_id: guild_id.to_string(),
            user_id,
            session_id,
            token: server.token,
        };
        if tx.send(info).is_err() {
            debug!(guild_id, "voice join was abandoned before the server arrived");
        }
    }
}

// ---------------------------------------------------------------------------
// Guild lease
// ---------------------------------------------------------------------------

/// Marks a guild as having an active voice connection until dropped.
struct GuildLease {
    guild_id: Snowflake,
    active: Arc<Mutex<HashSet<Snowflake>>>,
}

impl GuildLease {
    fn acquire(active: &Arc<Mutex<HashSet<Snowflake>>>, guild_id: &str) -> Option<Self> {
        let inserted = lock(active).insert(guild_id.to_string());
        inserted.then(|| Self {
            guild_id: guild_id.to_string(),
            active: Arc::clone(active),
        })
    }
}

impl Drop for GuildLease {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.guild_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// DiscordVoice
// ---------------------------------------------------------------------------

/// Voice transport backed by the bot's gateway connection.
pub struct DiscordVoice {
    gateway: GatewaySender,
    user_id: OnceLock<Snowflake>,
    pending: Mutex<PendingJoins>,
    active: Arc<Mutex<HashSet<Snowflake>>>,
    join_timeout: Duration,
}

impl DiscordVoice {
    pub fn new(gateway: GatewaySender) -> Self {
        Self {
            gateway,
            user_id: OnceLock::new(),
            pending: Mutex::new(PendingJoins::default()),
            active: Arc::new(Mutex::new(HashSet::new())),
            join_timeout: JOIN_TIMEOUT,
        }
    }

    /// Record the bot's own user id from READY. Later calls are ignored.
    pub fn set_user_id(&self, user_id: &str) {
        if self.user_id.set(user_id.to_string()).is_err() {
            debug!("bot user id already known");
        }
    }

    pub fn on_voice_state(&self, state: &VoiceState) {
        lock(&self.pending).voice_state(state);
    }

    pub fn on_server_update(&self, update: &VoiceServerUpdate) {
        lock(&self.pending).server_update(update);
    }

    async fn leave(&self, guild_id: &str) {
        if let Err(e) = self.gateway.update_voice_state(guild_id, None, false, true).await {
            warn!(guild_id, error = %e, "failed to leave voice channel");
        }
    }
}

#[async_trait]
impl VoiceTransport for DiscordVoice {
    async fn join(&self, destination: &Destination) -> Result<Box<dyn VoiceSession>, VoiceError> {
        let user_id = self.user_id.get().ok_or(VoiceError::NotReady)?;
        let guild_id = destination.guild_id.as_str();
        let lease = GuildLease::acquire(&self.active, guild_id).ok_or_else(|| VoiceError::Busy {
            guild_id: guild_id.to_string(),
        })?;

        let rx = lock(&self.pending).register(guild_id, user_id);
        if let Err(e) = self
            .gateway
            .update_voice_state(guild_id, Some(destination.channel_id.as_str()), false, true)
            .await
        {
            lock(&self.pending).cancel(guild_id);
            return Err(e.into());
        }

        let info = match tokio::time::timeout(self.join_timeout, rx).await {
            Ok(Ok(info)) => info,
            Ok(Err(_)) => {
                lock(&self.pending).cancel(guild_id);
                return Err(VoiceError::Closed);
            }
            Err(_) => {
                lock(&self.pending).cancel(guild_id);
                self.leave(guild_id).await;
                return Err(VoiceError::Timeout("voice server update"));
            }
        };

        debug!(info = ?info, "voice server assigned");
        match connect(&info, &destination.channel_id).await {
            Ok(driver) => {
                info!(guild_id, channel_id = %destination.channel_id, "voice connected");
                Ok(Box::new(DiscordVoiceSession {
                    driver,
                    gateway: self.gateway.clone(),
                    guild_id: guild_id.to_string(),
                    buffered: Vec::new(),
                    _lease: lease,
                }))
            }
            Err(e) => {
                self.leave(guild_id).await;
                Err(e)
            }
        }
    }
}

async fn connect(info: &ConnectionInfo, channel_id: &str) -> Result<Driver, VoiceError> {
    let songbird_info = info.to_songbird(channel_id)?;
    let mut driver = Driver::new(songbird::Config::default());
    driver.connect(songbird_info).await?;
    Ok(driver)
}

impl std::fmt::Debug for DiscordVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordVoice")
            .field("user_id", &self.user_id.get())
            .field("active", &lock(&self.active).len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A joined voice channel.
///
/// Frames written while speaking are held until speaking stops, then played
/// as one track; `set_speaking(false)` returns once that track has ended.
struct DiscordVoiceSession {
    driver: Driver,
    gateway: GatewaySender,
    guild_id: Snowflake,
    buffered: Vec<Frame>,
    _lease: GuildLease,
}

impl DiscordVoiceSession {
    async fn play_buffered(&mut self) -> Result<(), VoiceError> {
        let frames = std::mem::take(&mut self.buffered);
        if frames.is_empty() {
            return Ok(());
        }
        let container = clip::dca1(&frames)?;
        let finished = Arc::new(Notify::new());

        let track = self.driver.play_only_input(Input::from(container));
        track.add_event(Event::Track(TrackEvent::End), TrackFinished(Arc::clone(&finished)))?;
        track.add_event(Event::Track(TrackEvent::Error), TrackFinished(Arc::clone(&finished)))?;
        debug!(guild_id = %self.guild_id, frames = frames.len(), "playing clip");

        if tokio::time::timeout(clip::playback_budget(frames.len()), finished.notified())
            .await
            .is_err()
        {
            if let Err(e) = track.stop() {
                debug!(error = %e, "stuck track already gone");
            }
            return Err(VoiceError::Timeout("clip playback"));
        }
        Ok(())
    }
}

#[async_trait]
impl VoiceSession for DiscordVoiceSession {
    async fn set_speaking(&mut self, speaking: bool) -> Result<(), VoiceError> {
        if speaking {
            self.buffered.clear();
            Ok(())
        } else {
            self.play_buffered().await
        }
    }

    async fn write(&mut self, frame: &Frame) -> Result<(), VoiceError> {
        self.buffered.push(frame.clone());
        Ok(())
    }

    async fn disconnect(self: Box<Self>) -> Result<(), VoiceError> {
        let DiscordVoiceSession {
            mut driver,
            gateway,
            guild_id,
            buffered: _,
            _lease,
        } = *self;
        driver.leave();
        let left = gateway.update_voice_state(&guild_id, None, false, true).await;
        info!(guild_id = %guild_id, "voice session closed");
        left?;
        Ok(())
    }
}

/// Wakes the session when its track ends or fails.
struct TrackFinished(Arc<Notify>);

#[async_trait]
impl EventHandler for TrackFinished {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        self.0.notify_one();
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
