//! HTTP client for the Discord REST API.
//!
//! All outbound REST calls go through [`DiscordHttpClient`] so that auth
//! headers and error mapping live in one place. `reqwest` is an
//! implementation detail; swapping HTTP backends only requires touching
//! this module.

use reqwest::{Method, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::*;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const BASE_URL: &str = "https://discord.com/api/v10";
const USER_AGENT: &str = concat!(
    "DiscordBot (https://github.com/golly-bot/golly, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HttpError {
    /// Non-success status from Discord.
    #[error("Discord API error {status} on {route}: {body}")]
    Api {
        status: u16,
        body: String,
        route: String,
    },

    /// Discord rejected the call with 429. Not retried.
    #[error("rate-limited on {route}, retry after {retry_after:.2}s")]
    RateLimited { route: String, retry_after: f64 },

    /// Transport / network error.
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Body of a 429 response.
#[derive(Debug, serde::Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

// ---------------------------------------------------------------------------
// DiscordHttpClient
// ---------------------------------------------------------------------------

/// A thin HTTP client for the Discord REST API.
///
/// Cheap to clone (`reqwest::Client` is an `Arc` internally).
#[derive(Clone)]
pub struct DiscordHttpClient {
    token: String,
    client: reqwest::Client,
    base_url: String,
}

impl DiscordHttpClient {
    /// Create a new client with the given bot token.
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(token, BASE_URL)
    }

    /// Create a client that talks to a different API root.
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    // ------------------------------------------------------------------
    // Low-level: the single request method everything funnels through
    // ------------------------------------------------------------------

    /// Send a request to `{base_url}/{path}`.
    ///
    /// `route` is a template like `POST /channels/{channel_id}/messages`,
    /// used in logs and errors.
    ///
    /// Returns the raw response body on success.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        route: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Vec<u8>, HttpError> {
        let mut req = self
            .client
            .request(method, self.url(path))
            .header("authorization", format!("Bot {}", self.token))
            .header("user-agent", USER_AGENT);
        if let Some(json) = body {
            req = req.json(json);
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let header = resp
                .headers()
                .get("x-ratelimit-reset-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<f64>().ok());
            let retry_after = match header {
                Some(seconds) => seconds,
                None => resp
                    .json::<RateLimitBody>()
                    .await
                    .map(|b| b.retry_after)
                    .unwrap_or(1.0),
            };
            warn!(route, retry_after_s = retry_after, "rate-limited by Discord");
            return Err(HttpError::RateLimited {
                route: route.to_string(),
                retry_after,
            });
        }

        let bytes = resp.bytes().await?;
        if status.is_success() {
            debug!(route, status = status.as_u16(), "request ok");
            return Ok(bytes.to_vec());
        }

        Err(HttpError::Api {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&bytes).to_string(),
            route: route.to_string(),
        })
    }

    /// Like [`request`](Self::request) but deserialises the response body as JSON.
    pub async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        route: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, HttpError> {
        let bytes = self.request(method, path, route, body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Send a simple text message to a channel.
    pub async fn send_message(&self, channel_id: &str, content: &str) -> Result<Message, HttpError> {
        let msg = CreateMessage::new().content(content);
        let path = format!("channels/{}/messages", channel_id);
        let body = serde_json::to_value(&msg)?;
        self.request_json(
            Method::POST,
            &path,
            "POST /channels/{channel_id}/messages",
            Some(&body),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Interactions
    // ------------------------------------------------------------------

    /// Respond to an interaction (initial response).
    pub async fn create_interaction_response(
        &self,
        interaction_id: &str,
        interaction_token: &str,
        response: &InteractionResponse,
    ) -> Result<(), HttpError> {
        let path = format!(
            "interactions/{}/{}/callback",
            interaction_id, interaction_token
        );
        let body = serde_json::to_value(response)?;
        // Discord returns 204 No Content on success, so the body is not parsed.
        self.request(
            Method::POST,
            &path,
            "POST /interactions/{id}/{token}/callback",
            Some(&body),
        )
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Slash command registration
    // ------------------------------------------------------------------

    /// Create one application command. An empty `guild_id` registers it
    /// globally, otherwise only in that guild.
    pub async fn create_command(
        &self,
        application_id: &str,
        guild_id: &str,
        command: &ApplicationCommand,
    ) -> Result<ApplicationCommand, HttpError> {
        let (path, route) = commands_path(application_id, guild_id);
        let body = serde_json::to_value(command)?;
        self.request_json(Method::POST, &path, &format!("POST {}", route), Some(&body))
            .await
    }

    /// Delete one application command, using the same scoping rule as
    /// [`create_command`](Self::create_command).
    pub async fn delete_command(
        &self,
        application_id: &str,
        guild_id: &str,
        command_id: &str,
    ) -> Result<(), HttpError> {
        let (path, route) = commands_path(application_id, guild_id);
        self.request(
            Method::DELETE,
            &format!("{}/{}", path, command_id),
            &format!("DELETE {}/{{command_id}}", route),
            None,
        )
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for DiscordHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordHttpClient")
            .field("token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Path and route template for the command collection of an application,
/// global when `guild_id` is empty.
fn commands_path(application_id: &str, guild_id: &str) -> (String, &'static str) {
    if guild_id.is_empty() {
        (
            format!("applications/{}/commands", application_id),
            "/applications/{application_id}/commands",
        )
    } else {
        (
            format!("applications/{}/guilds/{}/commands", application_id, guild_id),
            "/applications/{application_id}/guilds/{guild_id}/commands",
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_guild_means_global_commands() {
        let (path, route) = commands_path("app", "");
        assert_eq!(path, "applications/app/commands");
        assert!(!route.contains("guilds"));
    }

    #[test]
    fn guild_scoped_commands() {
        let (path, _) = commands_path("app", "123");
        assert_eq!(path, "applications/app/guilds/123/commands");
    }

    #[test]
    fn url_joins_without_double_slash() {
        let client = DiscordHttpClient::with_base_url("t", "http://localhost:1234/api/");
        assert_eq!(
            client.url("/channels/1/messages"),
            "http://localhost:1234/api/channels/1/messages"
        );
    }

    #[test]
    fn debug_redacts_token() {
        let client = DiscordHttpClient::new("very-secret");
        let dbg = format!("{:?}", client);
        assert!(!dbg.contains("very-secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn user_agent_follows_discord_format() {
        assert!(USER_AGENT.starts_with("DiscordBot ("));
        assert!(USER_AGENT.ends_with(')'));
    }

    #[test]
    fn api_error_display_names_route() {
        let err = HttpError::Api {
            status: 403,
            body: "Missing Access".to_string(),
            route: "POST /channels/{channel_id}/messages".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Discord API error 403 on POST /channels/{channel_id}/messages: Missing Access"
        );
    }

    // -- request() against a stub server ---------------------------------

    use crate::testing::{StubResponse, StubServer};

    #[tokio::test]
    async fn send_message_posts_with_bot_auth() {
        let server = StubServer::start(StubResponse::new(
            200,
            r#"{"id":"m1","channel_id":"c1","author":{"id":"golly","username":"golly","bot":true},"content":"pong!"}"#,
        ))
        .await;
        let client = DiscordHttpClient::with_base_url("tok", &server.url);

        let sent = client.send_message("c1", "pong!").await.unwrap();
        assert_eq!(sent.id, "m1");
        assert_eq!(sent.content, "pong!");

        let requests = server.requests();
        let head = requests[0].to_ascii_lowercase();
        assert!(head.starts_with("post /channels/c1/messages "), "{head}");
        assert!(head.contains("authorization: bot tok"), "{head}");
    }

    #[tokio::test]
    async fn too_many_requests_uses_reset_header() {
        let server = StubServer::start(
            StubResponse::new(429, r#"{"retry_after":9.0,"global":false}"#)
                .header("x-ratelimit-reset-after", "2.5"),
        )
        .await;
        let client = DiscordHttpClient::with_base_url("tok", &server.url);

        let err = client.send_message("c1", "hi").await.unwrap_err();
        match err {
            HttpError::RateLimited { route, retry_after } => {
                assert_eq!(route, "POST /channels/{channel_id}/messages");
                assert_eq!(retry_after, 2.5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn too_many_requests_falls_back_to_body() {
        let server =
            StubServer::start(StubResponse::new(429, r#"{"retry_after":0.75,"global":true}"#))
                .await;
        let client = DiscordHttpClient::with_base_url("tok", &server.url);

        let err = client.delete_command("app", "", "cmd").await.unwrap_err();
        assert!(
            matches!(err, HttpError::RateLimited { retry_after, .. } if retry_after == 0.75),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn other_failures_become_api_errors() {
        let server =
            StubServer::start(StubResponse::new(403, r#"{"message":"Missing Access","code":50001}"#))
                .await;
        let client = DiscordHttpClient::with_base_url("tok", &server.url);

        let command = ApplicationCommand::chat_input("time", "return current time.");
        let err = client.create_command("app", "g1", &command).await.unwrap_err();
        match err {
            HttpError::Api { status, body, route } => {
                assert_eq!(status, 403);
                assert!(body.contains("Missing Access"));
                assert_eq!(route, "POST /applications/{application_id}/guilds/{guild_id}/commands");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(server.requests()[0].starts_with("POST /applications/app/guilds/g1/commands "));
    }
}
