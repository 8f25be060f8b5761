//! OpenWeatherMap current-conditions client.

use std::fmt::Write as _;
use std::str::FromStr;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const BASE_URL: &str = "https://api.openweathermap.org/data/2.5";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("no weather found for {place:?}")]
    NotFound { place: String },

    #[error("weather API returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The request URL carries the API key, so it is stripped before
    /// the error is built.
    #[error("weather request failed: {0}")]
    Transport(reqwest::Error),
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

/// Temperature scale for requests and the formatted report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeatherUnits {
    #[default]
    Fahrenheit,
    Celsius,
    Kelvin,
}

impl WeatherUnits {
    /// Value of the `units` query parameter.
    fn query(self) -> &'static str {
        match self {
            WeatherUnits::Fahrenheit => "imperial",
            WeatherUnits::Celsius => "metric",
            WeatherUnits::Kelvin => "standard",
        }
    }

    pub fn temperature_suffix(self) -> &'static str {
        match self {
            WeatherUnits::Fahrenheit => "°F",
            WeatherUnits::Celsius => "°C",
            WeatherUnits::Kelvin => "K",
        }
    }

    pub fn speed_suffix(self) -> &'static str {
        match self {
            WeatherUnits::Fahrenheit => "mph",
            WeatherUnits::Celsius | WeatherUnits::Kelvin => "m/s",
        }
    }
}

impl FromStr for WeatherUnits {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f" | "fahrenheit" | "imperial" => Ok(WeatherUnits::Fahrenheit),
            "c" | "celsius" | "metric" => Ok(WeatherUnits::Celsius),
            "k" | "kelvin" | "standard" => Ok(WeatherUnits::Kelvin),
            other => Err(format!("unknown units {other:?}, expected f, c or k")),
        }
    }
}

// ---------------------------------------------------------------------------
// Response model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CurrentWeather {
    pub name: Option<String>,
    pub main: MainConditions,
    #[serde(default)]
    pub wind: Wind,
    #[serde(default)]
    pub weather: Vec<Condition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MainConditions {
    pub temp: f64,
    pub feels_like: f64,
    pub temp_min: f64,
    pub temp_max: f64,
    pub humidity: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Wind {
    #[serde(default)]
    pub speed: f64,
}

/// One `(category, description)` pair, e.g. `("Clouds", "broken clouds")`.
#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
    pub main: String,
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WeatherClient {
    client: reqwest::Client,
    api_key: String,
    units: WeatherUnits,
    lang: String,
    base_url: String,
}

impl WeatherClient {
    pub fn new(api_key: impl Into<String>, units: WeatherUnits, lang: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            units,
            lang: lang.into(),
            base_url: BASE_URL.to_string(),
        }
    }

    /// Point the client at another API root.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn units(&self) -> WeatherUnits {
        self.units
    }

    /// Current conditions for a place name ("London", "Paris,FR").
    pub async fn current_by_name(&self, place: &str) -> Result<CurrentWeather, WeatherError> {
        let url = format!("{}/weather", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(url)
            .query(&[
                ("q", place),
                ("units", self.units.query()),
                ("lang", self.lang.as_str()),
                ("appid", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| WeatherError::Transport(e.without_url()))?;

        let status = resp.status();
        debug!(place, status = status.as_u16(), "weather lookup");

        if status == StatusCode::NOT_FOUND {
            return Err(WeatherError::NotFound {
                place: place.to_string(),
            });
        }
        if !status.is_success() {
            let message = resp
                .json::<ApiError>()
                .await
                .map(|e| e.message)
                .unwrap_or_default();
            return Err(WeatherError::Api {
                status: status.as_u16(),
                message,
            });
        }

        resp.json::<CurrentWeather>()
            .await
            .map_err(|e| WeatherError::Transport(e.without_url()))
    }
}

impl std::fmt::Debug for WeatherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherClient")
            .field("api_key", &"<redacted>")
            .field("units", &self.units)
            .field("lang", &self.lang)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Render the multi-line weather reply.
pub fn format_report(weather: &CurrentWeather, units: WeatherUnits) -> String {
    let t = units.temperature_suffix();
    let m = &weather.main;
    let mut out = format!(
        "Feels Like: {:.2}{t}\n\
         Temperature: {:.2}{t}\n\
         Min Temperature: {:.2}{t}\n\
         Max Temperature: {:.2}{t}\n\
         Humidity: {}%\n\
         Wind speed: {:.2}{}\n",
        m.feels_like,
        m.temp,
        m.temp_min,
        m.temp_max,
        m.humidity,
        weather.wind.speed,
        units.speed_suffix(),
    );
    for c in &weather.weather {
        let _ = writeln!(out, "{}: {}", c.main, c.description);
    }
    out
}

/// Lowercase, then capitalise the first letter of every word.
///
/// Word boundaries are any character other than an ASCII letter, digit or
/// underscore, so `"o'HARE"` becomes `"O'Hare"`.
pub fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut at_boundary = true;
    for ch in text.chars() {
        if at_boundary {
            out.extend(ch.to_uppercase());
        } else {
            out.extend(ch.to_lowercase());
        }
        at_boundary = !(ch.is_alphanumeric() || ch == '_');
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
