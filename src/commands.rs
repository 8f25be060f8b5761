//! Prefix command parsing.
//!
//! `!ping`, `!greet`, `!coinflip`, `!horn` and `!weather <place>` become a
//! [`Command`]; anything else is ignored.

use crate::types::ApplicationCommand;
use crate::weather::title_case;

/// Prefix every text command starts with.
pub const PREFIX: &str = "!";

/// Phrase that triggers a greeting without the prefix.
pub const WAKE_PHRASE: &str = "hi golly";

/// A recognised text command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Greet,
    CoinFlip,
    Horn,
    /// `location` is `None` when the user gave no place.
    Weather { location: Option<String> },
}

impl Command {
    /// Parse a prefixed message. The keyword is matched case-insensitively.
    pub fn parse(content: &str) -> Option<Command> {
        let rest = content.strip_prefix(PREFIX)?;
        let (keyword, args) = match rest.split_once(' ') {
            Some((keyword, args)) => (keyword, Some(args)),
            None => (rest, None),
        };

        match keyword.to_lowercase().as_str() {
            "ping" => Some(Command::Ping),
            "greet" => Some(Command::Greet),
            "coinflip" => Some(Command::CoinFlip),
            "horn" => Some(Command::Horn),
            "weather" => Some(Command::Weather {
                location: args
                    .map(str::trim)
                    .filter(|place| !place.is_empty())
                    .map(title_case),
            }),
            _ => None,
        }
    }
}

/// What an incoming text message asks of the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Command(Command),
    /// Unprefixed message containing the wake phrase.
    Greeting,
}

/// Classify a message. Prefixed messages are only ever commands.
pub fn classify(content: &str) -> Option<Trigger> {
    if content.starts_with(PREFIX) {
        Command::parse(content).map(Trigger::Command)
    } else if content.to_lowercase().contains(WAKE_PHRASE) {
        Some(Trigger::Greeting)
    } else {
        None
    }
}

/// Slash commands registered at startup.
pub fn slash_commands() -> Vec<ApplicationCommand> {
    vec![ApplicationCommand::chat_input("time", "return current time.")]
}

/// Reply for `/time`: Discord renders `<t:UNIX>` in the reader's timezone.
pub fn time_reply(unix_seconds: i64) -> String {
    format!("<t:{}>", unix_seconds)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Command::parse() --------------------------------------------------

    #[test]
    fn parses_simple_commands() {
        assert_eq!(Command::parse("!ping"), Some(Command::Ping));
        assert_eq!(Command::parse("!greet"), Some(Command::Greet));
        assert_eq!(Command::parse("!coinflip"), Some(Command::CoinFlip));
        assert_eq!(Command::parse("!horn"), Some(Command::Horn));
    }

    #[test]
    fn keyword_is_case_insensitive() {
        assert_eq!(Command::parse("!PING"), Some(Command::Ping));
        assert_eq!(Command::parse("!CoinFlip now"), Some(Command::CoinFlip));
    }

    #[test]
    fn weather_location_is_title_cased() {
        assert_eq!(
            Command::parse("!weather new YORK"),
            Some(Command::Weather {
                location: Some("New York".to_string())
            })
        );
    }

    #[test]
    fn weather_without_location() {
        assert_eq!(
            Command::parse("!weather"),
            Some(Command::Weather { location: None })
        );
        assert_eq!(
            Command::parse("!weather   "),
            Some(Command::Weather { location: None })
        );
    }

    #[test]
    fn unknown_or_unprefixed_is_ignored() {
        assert_eq!(Command::parse("!dance"), None);
        assert_eq!(Command::parse("ping"), None);
        assert_eq!(Command::parse("!"), None);
        assert_eq!(Command::parse(" !ping"), None);
    }

    // -- classify() --------------------------------------------------------

    #[test]
    fn wake_phrase_triggers_greeting() {
        assert_eq!(classify("well HI GOLLY there"), Some(Trigger::Greeting));
        assert_eq!(classify("hello world"), None);
    }

    #[test]
    fn prefixed_messages_never_greet() {
        assert_eq!(classify("!nope hi golly"), None);
        assert_eq!(classify("!ping"), Some(Trigger::Command(Command::Ping)));
    }

    // -- slash commands ----------------------------------------------------

    #[test]
    fn registers_time_command() {
        let cmds = slash_commands();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].name, "time");
        assert!(!cmds[0].description.is_empty());
    }

    #[test]
    fn time_reply_uses_discord_timestamp_markup() {
        assert_eq!(time_reply(1_700_000_000), "<t:1700000000>");
    }
}
