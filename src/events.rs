//! Typed gateway events.
//!
//! The gateway module deserialises dispatch payloads into this enum so the
//! rest of the bot can pattern-match on strongly-typed data instead of raw
//! `(op, t, serde_json::Value)` tuples.

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::types::*;

// ---------------------------------------------------------------------------
// The top-level event enum
// ---------------------------------------------------------------------------

/// A fully-parsed event coming off the Discord gateway.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Identified successfully; the bot is ready.
    Ready(ReadyEvent),

    /// Full guild object lazily sent after READY.
    GuildCreate(Guild),

    /// A message was created in a channel we can see.
    MessageCreate(Message),

    /// An interaction was created (slash command).
    InteractionCreate(Interaction),

    /// Someone joined, left or moved between voice channels.
    VoiceStateUpdate(VoiceState),

    /// Voice server credentials for a guild we asked to join.
    VoiceServerUpdate(VoiceServerUpdate),

    /// Heartbeat ACK from the gateway (op 11).
    HeartbeatAck,

    /// The gateway is asking us to heartbeat immediately (op 1).
    HeartbeatRequest,

    /// Gateway told us to reconnect (op 7).
    Reconnect,

    /// Session has been invalidated (op 9). The inner bool indicates whether
    /// the session is resumable.
    InvalidSession(bool),

    /// An event we received but don't have a typed variant for.
    Unknown {
        event_name: Option<String>,
        op: u8,
    },
}

// ---------------------------------------------------------------------------
// Parsing from a raw GatewayPayload
// ---------------------------------------------------------------------------

impl GatewayEvent {
    /// Convert a raw [`GatewayPayload`] into a typed event.
    ///
    /// This never fails: unrecognised or malformed events become
    /// [`GatewayEvent::Unknown`].
    pub fn from_payload(payload: GatewayPayload) -> Self {
        match payload.op {
            0 => Self::parse_dispatch(payload.t, payload.d),
            1 => GatewayEvent::HeartbeatRequest,
            7 => GatewayEvent::Reconnect,
            9 => {
                let resumable = payload
                    .d
                    .as_ref()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                GatewayEvent::InvalidSession(resumable)
            }
            11 => GatewayEvent::HeartbeatAck,
            op => GatewayEvent::Unknown {
                event_name: payload.t,
                op,
            },
        }
    }

    /// Parse an op-0 DISPATCH event by its `t` name.
    fn parse_dispatch(event_name: Option<String>, data: Option<serde_json::Value>) -> Self {
        let Some(name) = event_name else {
            return GatewayEvent::Unknown {
                event_name: None,
                op: 0,
            };
        };
        let Some(d) = data else {
            return GatewayEvent::Unknown {
                event_name: Some(name),
                op: 0,
            };
        };

        match name.as_str() {
            "READY" => typed(&name, d, GatewayEvent::Ready),
            "GUILD_CREATE" => typed(&name, d, GatewayEvent::GuildCreate),
            "MESSAGE_CREATE" => typed(&name, d, GatewayEvent::MessageCreate),
            "INTERACTION_CREATE" => typed(&name, d, GatewayEvent::InteractionCreate),
            "VOICE_STATE_UPDATE" => typed(&name, d, GatewayEvent::VoiceStateUpdate),
            "VOICE_SERVER_UPDATE" => typed(&name, d, GatewayEvent::VoiceServerUpdate),
            _ => GatewayEvent::Unknown {
                event_name: Some(name),
                op: 0,
            },
        }
    }
}

fn typed<T: DeserializeOwned>(
    name: &str,
    data: serde_json::Value,
    wrap: impl FnOnce(T) -> GatewayEvent,
) -> GatewayEvent {
    match serde_json::from_value::<T>(data) {
        Ok(value) => wrap(value),
        Err(e) => {
            warn!(event = name, error = %e, "failed to parse dispatch payload");
            GatewayEvent::Unknown {
                event_name: Some(name.to_string()),
                op: 0,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
