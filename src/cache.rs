//! In-memory view of the guild state the horn command needs: which guild a
//! channel belongs to, and which voice channel each member is sitting in.
//!
//! Fed from GUILD_CREATE and VOICE_STATE_UPDATE; lost on restart.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, trace};

use crate::playback::Destination;
use crate::types::{Guild, Snowflake, VoiceState};

#[derive(Debug, Default)]
struct Inner {
    /// Channel id → guild id.
    channel_guild: HashMap<Snowflake, Snowflake>,
    /// Guild id → (user id → voice channel id).
    voice: HashMap<Snowflake, HashMap<Snowflake, Snowflake>>,
}

/// Shared, thread-safe guild cache.
#[derive(Debug, Default)]
pub struct SessionCache {
    inner: RwLock<Inner>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything we know about a guild with the GUILD_CREATE snapshot.
    pub fn insert_guild(&self, guild: &Guild) {
        let mut inner = self.write();
        for channel in &guild.channels {
            inner
                .channel_guild
                .insert(channel.id.clone(), guild.id.clone());
        }
        let members = guild
            .voice_states
            .iter()
            .filter_map(|vs| Some((vs.user_id.clone(), vs.channel_id.clone()?)))
            .collect::<HashMap<_, _>>();
        debug!(
            guild_id = %guild.id,
            channels = guild.channels.len(),
            in_voice = members.len(),
            "cached guild"
        );
        inner.voice.insert(guild.id.clone(), members);
    }

    /// Track a member joining, moving or leaving voice.
    pub fn update_voice_state(&self, state: &VoiceState) {
        let Some(guild_id) = state.guild_id.as_ref() else {
            return;
        };
        let mut inner = self.write();
        let members = inner.voice.entry(guild_id.clone()).or_default();
        match &state.channel_id {
            Some(channel_id) => {
                trace!(guild_id = %guild_id, user_id = %state.user_id, channel_id = %channel_id, "voice join/move");
                members.insert(state.user_id.clone(), channel_id.clone());
            }
            None => {
                trace!(guild_id = %guild_id, user_id = %state.user_id, "voice leave");
                members.remove(&state.user_id);
            }
        }
    }

    /// The voice channel `user_id` is in.
    ///
    /// The guild comes from the message itself when Discord sent one; the
    /// channel map only covers channels that existed at GUILD_CREATE, so
    /// threads and later channels resolve through `guild_id`.
    pub fn voice_channel_of(
        &self,
        guild_id: Option<&str>,
        text_channel_id: &str,
        user_id: &str,
    ) -> Option<Destination> {
        let inner = self.read();
        let guild_id = match guild_id {
            Some(guild_id) => guild_id,
            None => inner.channel_guild.get(text_channel_id)?.as_str(),
        };
        let channel_id = inner.voice.get(guild_id)?.get(user_id)?;
        Some(Destination {
            guild_id: guild_id.to_string(),
            channel_id: channel_id.clone(),
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guild() -> Guild {
        serde_json::from_value(json!({
            "id": "g1",
            "name": "Test Server",
            "channels": [
                { "id": "text", "type": 0, "name": "general" },
                { "id": "voice", "type": 2, "name": "Lounge" }
            ],
            "voice_states": [
                { "channel_id": "voice", "user_id": "alice", "session_id": "s" }
            ]
        }))
        .expect("valid guild JSON")
    }

    fn voice_state(user: &str, channel: Option<&str>) -> VoiceState {
        VoiceState {
            guild_id: Some("g1".to_string()),
            channel_id: channel.map(str::to_string),
            user_id: user.to_string(),
            session_id: "s".to_string(),
        }
    }

    #[test]
    fn finds_member_from_guild_create() {
        let cache = SessionCache::new();
        cache.insert_guild(&guild());
        assert_eq!(
            cache.voice_channel_of(None, "text", "alice"),
            Some(Destination {
                guild_id: "g1".to_string(),
                channel_id: "voice".to_string(),
            })
        );
    }

    #[test]
    fn unknown_channel_or_user_is_none() {
        let cache = SessionCache::new();
        cache.insert_guild(&guild());
        assert!(cache.voice_channel_of(None, "elsewhere", "alice").is_none());
        assert!(cache.voice_channel_of(None, "text", "bob").is_none());
        assert!(cache.voice_channel_of(Some("g2"), "text", "alice").is_none());
    }

    #[test]
    fn message_guild_covers_channels_missing_from_the_snapshot() {
        let cache = SessionCache::new();
        cache.insert_guild(&guild());
        assert_eq!(
            cache.voice_channel_of(Some("g1"), "thread-42", "alice"),
            Some(Destination {
                guild_id: "g1".to_string(),
                channel_id: "voice".to_string(),
            })
        );
    }

    #[test]
    fn voice_updates_move_and_remove_members() {
        let cache = SessionCache::new();
        cache.insert_guild(&guild());

        cache.update_voice_state(&voice_state("bob", Some("voice")));
        assert!(cache.voice_channel_of(Some("g1"), "text", "bob").is_some());

        cache.update_voice_state(&voice_state("alice", None));
        assert!(cache.voice_channel_of(Some("g1"), "text", "alice").is_none());
    }

    #[test]
    fn voice_update_without_guild_is_ignored() {
        let cache = SessionCache::new();
        let mut state = voice_state("bob", Some("voice"));
        state.guild_id = None;
        cache.update_voice_state(&state);
        assert!(cache.read().voice.is_empty());
    }
}
