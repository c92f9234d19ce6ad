//! `vault-discord`: Discord implementation of the vault [`Platform`] trait.
//!
//! Contexts are guilds, subjects are guild members, privileges are roles and
//! notices are channel messages. Only the REST client is used; the engine
//! never needs the gateway socket.
//!
//! [`Platform`]: vault_core::Platform

pub mod error;
pub mod platform;

pub use error::DiscordError;
pub use platform::DiscordPlatform;
