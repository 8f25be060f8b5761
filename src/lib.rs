//! golly: a small Discord bot.
//!
//! Replies to a handful of `!` commands, greets people who say "hi golly",
//! reads the weather, answers `/time`, and plays a pre-encoded opus clip
//! (a `.dca` frame container) into the caller's voice channel.
//!
//! [`bot::run`] wires everything together; the binary only parses config
//! and sets up logging.

pub mod bot;
pub mod cache;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod http;
pub mod playback;
pub mod random;
pub mod sound;
pub mod types;
pub mod voice;
pub mod weather;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
