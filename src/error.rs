//! Crate-wide error type.

use thiserror::Error;

use crate::config::ConfigError;
use crate::gateway::GatewayError;
use crate::http::HttpError;
use crate::sound::SoundError;
use crate::voice::VoiceError;
use crate::weather::WeatherError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("sound: {0}")]
    Sound(#[from] SoundError),

    #[error("gateway: {0}")]
    Gateway(#[from] GatewayError),

    #[error("discord API: {0}")]
    Http(#[from] HttpError),

    #[error("voice: {0}")]
    Voice(#[from] VoiceError),

    #[error("weather: {0}")]
    Weather(#[from] WeatherError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
