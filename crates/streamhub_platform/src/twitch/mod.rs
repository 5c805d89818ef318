#![forbid(unsafe_code)]

pub mod commands;
mod config;
pub mod connection;
pub mod directory;
pub mod eventsub;
pub mod helix;
pub mod irc;
pub mod polling;
pub mod pubsub;
pub mod rate_limit;
pub mod router;
mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ChannelConfig, DEFAULT_CLIENT_ID, REQUIRED_SCOPES, TwitchConfig};
pub use connection::{BoxFuture, WsConnector, WsStream};
pub use helix::{HelixApi, HelixClient, HelixError};
pub use service::TwitchService;
