//! Process supervisor: shared bot state, the gateway event loop, and
//! startup/shutdown ordering.
//!
//! Startup loads the sound before touching the network so a missing or
//! corrupt container fails fast. Each message and interaction is handled
//! on its own task; READY is handled inline because a failed command
//! registration stops the bot.

use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::cache::SessionCache;
use crate::config::Config;
use crate::error::Result;
use crate::events::GatewayEvent;
use crate::gateway::{self, GatewayConfig, GatewaySender};
use crate::handlers;
use crate::http::DiscordHttpClient;
use crate::random::Randomizer;
use crate::sound::FrameSequence;
use crate::types::{ApplicationCommand, Intents, Snowflake};
use crate::voice::DiscordVoice;
use crate::weather::WeatherClient;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Who we are, learned from READY.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Snowflake,
    pub application_id: Snowflake,
}

/// Everything handlers need, shared across tasks behind an `Arc`.
pub struct Bot {
    pub http: DiscordHttpClient,
    pub weather: WeatherClient,
    pub cache: SessionCache,
    pub voice: DiscordVoice,
    pub rng: Randomizer,
    pub sound: FrameSequence,
    /// Guild commands are registered in; empty for global.
    pub command_guild: String,
    identity: OnceLock<Identity>,
    /// Commands created this run, deleted again on shutdown.
    registered: Mutex<Vec<ApplicationCommand>>,
}

impl Bot {
    pub fn new(config: &Config, sound: FrameSequence, gateway: GatewaySender) -> Self {
        Self {
            http: DiscordHttpClient::new(&config.token),
            weather: WeatherClient::new(&config.weather_api_key, config.units, &config.lang),
            cache: SessionCache::new(),
            voice: DiscordVoice::new(gateway),
            rng: Randomizer::from_entropy(),
            sound,
            command_guild: config.guild_id.clone(),
            identity: OnceLock::new(),
            registered: Mutex::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    /// Record our identity. Returns `false` if it was already known (a
    /// re-identify after the first READY).
    pub fn set_identity(&self, identity: Identity) -> bool {
        self.voice.set_user_id(&identity.user_id);
        self.identity.set(identity).is_ok()
    }

    pub async fn remember_command(&self, command: ApplicationCommand) {
        self.registered.lock().await.push(command);
    }

    /// Delete every command this run registered. Failures are logged and
    /// the rest are still attempted.
    pub async fn deregister_commands(&self) {
        let Some(identity) = self.identity() else {
            return;
        };
        let commands = std::mem::take(&mut *self.registered.lock().await);
        for command in commands {
            let Some(id) = command.id.as_deref() else {
                continue;
            };
            match self
                .http
                .delete_command(&identity.application_id, &self.command_guild, id)
                .await
            {
                Ok(()) => info!(command = %command.name, "removed slash command"),
                Err(e) => error!(command = %command.name, error = %e, "failed to remove slash command"),
            }
        }
    }

    /// Route one gateway event. Only a failed READY is an error.
    async fn dispatch(self: &Arc<Self>, event: GatewayEvent) -> Result<()> {
        match event {
            GatewayEvent::Ready(ready) => handlers::on_ready(self, ready).await?,

            GatewayEvent::GuildCreate(guild) => self.cache.insert_guild(&guild),

            GatewayEvent::VoiceStateUpdate(state) => {
                self.cache.update_voice_state(&state);
                self.voice.on_voice_state(&state);
            }

            GatewayEvent::VoiceServerUpdate(update) => self.voice.on_server_update(&update),

            GatewayEvent::MessageCreate(msg) => {
                let bot = Arc::clone(self);
                tokio::spawn(async move {
                    let message_id = msg.id.clone();
                    if let Err(e) = handlers::on_message(&bot, msg).await {
                        error!(message_id = %message_id, error = %e, "failed to handle message");
                    }
                });
            }

            GatewayEvent::InteractionCreate(interaction) => {
                let bot = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = handlers::on_interaction(&bot, &interaction).await {
                        error!(interaction_id = %interaction.id, error = %e, "failed to handle interaction");
                    }
                });
            }

            GatewayEvent::Unknown {
                event_name: Some(name),
                ..
            } => trace!(event = %name, "unhandled gateway event"),

            // Heartbeats, reconnects and invalid sessions are handled by the
            // gateway driver.
            _ => {}
        }
        Ok(())
    }
}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot")
            .field("identity", &self.identity.get())
            .field("command_guild", &self.command_guild)
            .field("sound_frames", &self.sound.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Gateway intents
// ---------------------------------------------------------------------------

fn gateway_intents() -> Intents {
    Intents::GUILDS
        | Intents::GUILD_MEMBERS
        | Intents::GUILD_VOICE_STATES
        | Intents::GUILD_PRESENCES
        | Intents::GUILD_MESSAGES
        | Intents::MESSAGE_CONTENT
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the bot until a shutdown signal arrives or the gateway gives up.
pub async fn run(config: Config) -> Result<()> {
    let sound = FrameSequence::load(&config.sound)?;
    info!(
        path = %config.sound.display(),
        frames = sound.len(),
        bytes = sound.total_bytes(),
        "sound loaded"
    );

    let mut gw = gateway::connect(GatewayConfig {
        token: config.token.clone(),
        intents: gateway_intents(),
    })
    .await?;
    info!("gateway connected, entering event loop");

    let bot = Arc::new(Bot::new(&config, sound, gw.sender()));
    let outcome = tokio::select! {
        outcome = event_loop(&bot, &mut gw.events) => outcome,
        () = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    if config.remove_commands {
        info!("removing slash commands");
        bot.deregister_commands().await;
    }
    gw.shutdown().await;
    info!("bot stopped");
    outcome
}

async fn event_loop(bot: &Arc<Bot>, events: &mut mpsc::Receiver<GatewayEvent>) -> Result<()> {
    while let Some(event) = events.recv().await {
        bot.dispatch(event).await?;
    }
    warn!("event stream ended, bot shutting down");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                debug!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
