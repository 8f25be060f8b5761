//! Event handlers for the Discord bot.
//!
//! Deciding what to do with a message ([`plan_message`]) is kept apart from
//! doing it ([`on_message`]) so routing can be tested without a network.

use tracing::{debug, info, warn};

use crate::bot::{Bot, Identity};
use crate::cache::SessionCache;
use crate::commands::{self, classify, Command, Trigger};
use crate::error::Result;
use crate::playback::{self, Destination, PlaybackTiming};
use crate::random::{self, Randomizer};
use crate::types::*;
use crate::weather::{self, WeatherError};

/// Reply to `!weather` with no place.
pub const WEATHER_USAGE: &str = "Usage: !weather <city>";

// ---------------------------------------------------------------------------
// READY handler
// ---------------------------------------------------------------------------

/// Store our identity and register the slash commands (once per run).
///
/// A registration failure is returned to the supervisor, which stops the bot.
pub async fn on_ready(bot: &Bot, ready: ReadyEvent) -> Result<()> {
    info!(user = %ready.user.tag(), guilds = ready.guilds.len(), "bot is ready!");

    let first_ready = bot.set_identity(Identity {
        user_id: ready.user.id.clone(),
        application_id: ready.application.id.clone(),
    });
    if !first_ready {
        debug!("READY after re-identify, commands already registered");
        return Ok(());
    }

    let scope = if bot.command_guild.is_empty() {
        "global"
    } else {
        bot.command_guild.as_str()
    };
    for command in commands::slash_commands() {
        let created = bot
            .http
            .create_command(&ready.application.id, &bot.command_guild, &command)
            .await?;
        info!(command = %created.name, scope, "registered slash command");
        bot.remember_command(created).await;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MESSAGE_CREATE handler
// ---------------------------------------------------------------------------

/// What a message asks the bot to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Reply(String),
    Weather { place: String },
    Horn(Destination),
}

/// Route a message to an [`Action`], or `None` if the bot should stay quiet.
pub fn plan_message(
    msg: &Message,
    own_user_id: Option<&str>,
    rng: &Randomizer,
    cache: &SessionCache,
) -> Option<Action> {
    if msg.author.bot || own_user_id == Some(msg.author.id.as_str()) {
        return None;
    }

    let command = match classify(&msg.content)? {
        Trigger::Greeting => Command::Greet,
        Trigger::Command(command) => command,
    };

    let action = match command {
        Command::Ping => Action::Reply("pong!".to_string()),
        Command::Greet => Action::Reply(random::greeting(rng, &msg.author.mention())),
        Command::CoinFlip => Action::Reply(random::coin_flip(rng)),
        Command::Weather { location: None } => Action::Reply(WEATHER_USAGE.to_string()),
        Command::Weather {
            location: Some(place),
        } => Action::Weather { place },
        Command::Horn => match cache.voice_channel_of(
            msg.guild_id.as_deref(),
            &msg.channel_id,
            &msg.author.id,
        ) {
            Some(destination) => Action::Horn(destination),
            None => {
                debug!(
                    channel_id = %msg.channel_id,
                    user_id = %msg.author.id,
                    "horn requested outside a voice channel"
                );
                return None;
            }
        },
    };
    Some(action)
}

/// Handle one message end to end. Runs on its own task.
pub async fn on_message(bot: &Bot, msg: Message) -> Result<()> {
    let own_id = bot.identity().map(|i| i.user_id.as_str());
    let Some(action) = plan_message(&msg, own_id, &bot.rng, &bot.cache) else {
        return Ok(());
    };
    info!(
        message_id = %msg.id,
        author = %msg.author.tag(),
        channel_id = %msg.channel_id,
        action = ?action,
        "handling message"
    );

    match action {
        Action::Reply(text) => {
            bot.http.send_message(&msg.channel_id, &text).await?;
        }

        Action::Weather { place } => {
            let text = match bot.weather.current_by_name(&place).await {
                Ok(current) => weather::format_report(&current, bot.weather.units()),
                Err(e) => {
                    warn!(place = %place, error = %e, "weather lookup failed");
                    weather_failure_reply(&place, &e)
                }
            };
            bot.http.send_message(&msg.channel_id, &text).await?;
        }

        Action::Horn(destination) => {
            playback::play(&bot.voice, &destination, &bot.sound, PlaybackTiming::default())
                .await?;
        }
    }
    Ok(())
}

/// One-line reply for a failed weather lookup.
pub fn weather_failure_reply(place: &str, error: &WeatherError) -> String {
    match error {
        WeatherError::NotFound { .. } => format!("I couldn't find the weather for {}.", place),
        WeatherError::Api { .. } | WeatherError::Transport(_) => {
            "The weather service isn't answering right now, try again later.".to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// INTERACTION_CREATE handler
// ---------------------------------------------------------------------------

/// Answer slash commands. Only `/time` is registered.
pub async fn on_interaction(bot: &Bot, interaction: &Interaction) -> Result<()> {
    let Some(response) = interaction_response(interaction, chrono::Utc::now().timestamp()) else {
        debug!(
            interaction_id = %interaction.id,
            kind = ?interaction.kind,
            command = ?interaction.command_name(),
            "ignoring interaction"
        );
        return Ok(());
    };
    info!(
        interaction_id = %interaction.id,
        user = %interaction.author().map(User::tag).unwrap_or_default(),
        kind = ?response.kind,
        "answering interaction"
    );
    bot.http
        .create_interaction_response(&interaction.id, &interaction.token, &response)
        .await?;
    Ok(())
}

/// The response for an interaction received at `now` (unix seconds).
pub fn interaction_response(interaction: &Interaction, now: i64) -> Option<InteractionResponse> {
    match interaction.kind {
        InteractionType::Ping => Some(InteractionResponse {
            kind: InteractionCallbackType::Pong,
            data: None,
        }),
        InteractionType::ApplicationCommand if interaction.command_name() == Some("time") => {
            Some(InteractionResponse {
                kind: InteractionCallbackType::ChannelMessageWithSource,
                data: Some(InteractionCallbackData {
                    content: Some(commands::time_reply(now)),
                    flags: Some(MessageFlags::EPHEMERAL.bits()),
                }),
            })
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
