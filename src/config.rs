//! Command-line flags and environment.
//!
//! Every flag has an environment fallback; `.env` is loaded first by
//! [`Config::load`]. The two secrets are only read from the environment.

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use thiserror::Error;

use crate::weather::WeatherUnits;

pub const TOKEN_ENV: &str = "DISCORD_TOKEN";
pub const WEATHER_KEY_ENV: &str = "OPENWEATHER_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    MissingEnv(&'static str),
}

/// Raw command line.
#[derive(Debug, Clone, Parser)]
#[command(name = "golly", version, about = "A small Discord bot that greets, flips coins, plays an airhorn and reads the weather")]
pub struct Args {
    /// Guild to register slash commands in; empty registers them globally.
    #[arg(long, env = "GOLLY_GUILD", default_value = "")]
    pub guild: String,

    /// Remove registered slash commands on shutdown.
    #[arg(
        long = "rmcmd",
        env = "GOLLY_REMOVE_COMMANDS",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub remove_commands: bool,

    /// Frame container played by `!horn`.
    #[arg(long, env = "GOLLY_SOUND", default_value = "airhorn.dca")]
    pub sound: PathBuf,

    /// Weather units: f, c or k.
    #[arg(long, env = "GOLLY_UNITS", default_value = "f")]
    pub units: WeatherUnits,

    /// Weather description language.
    #[arg(long, env = "GOLLY_LANG", default_value = "en")]
    pub lang: String,

    #[arg(long, env = TOKEN_ENV, hide_env_values = true, hide = true)]
    pub token: Option<String>,

    #[arg(long, env = WEATHER_KEY_ENV, hide_env_values = true, hide = true)]
    pub weather_api_key: Option<String>,
}

/// Validated runtime configuration.
#[derive(Clone)]
pub struct Config {
    pub token: String,
    pub weather_api_key: String,
    /// Empty means global command registration.
    pub guild_id: String,
    pub remove_commands: bool,
    pub sound: PathBuf,
    pub units: WeatherUnits,
    pub lang: String,
}

impl Config {
    /// Load `.env`, parse the process arguments and validate them.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let token = non_empty(args.token).ok_or(ConfigError::MissingEnv(TOKEN_ENV))?;
        let weather_api_key =
            non_empty(args.weather_api_key).ok_or(ConfigError::MissingEnv(WEATHER_KEY_ENV))?;
        Ok(Self {
            token,
            weather_api_key,
            guild_id: args.guild.trim().to_string(),
            remove_commands: args.remove_commands,
            sound: args.sound,
            units: args.units,
            lang: args.lang,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("token", &"<redacted>")
            .field("weather_api_key", &"<redacted>")
            .field("guild_id", &self.guild_id)
            .field("remove_commands", &self.remove_commands)
            .field("sound", &self.sound)
            .field("units", &self.units)
            .field("lang", &self.lang)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
