#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::connection::WsConnector;
use super::polling::PollIntervals;
use crate::SecretString;

pub const DEFAULT_CLIENT_ID: &str = "23vjr9ec2cwoddv2fc3xfbx9nxv8vi";

/// Scopes the integration expects on the channel token. Missing ones produce a one-shot notice.
pub const REQUIRED_SCOPES: &[&str] = &[
	"bits:read",
	"channel:manage:broadcast",
	"channel:manage:polls",
	"channel:manage:predictions",
	"channel:manage:redemptions",
	"channel:moderate",
	"channel:read:hype_train",
	"channel:read:polls",
	"channel:read:predictions",
	"channel:read:redemptions",
	"channel:read:subscriptions",
	"chat:edit",
	"chat:read",
	"moderator:read:followers",
];

/// Persisted channel entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
	pub name: String,
	#[serde(default)]
	pub can_send_messages: bool,
}

impl ChannelConfig {
	pub fn new(name: impl Into<String>, can_send_messages: bool) -> Self {
		Self {
			name: name.into(),
			can_send_messages,
		}
	}
}

/// Twitch integration configuration.
#[derive(Clone)]
pub struct TwitchConfig {
	pub client_id: String,
	/// IRC token (`oauth:` prefix optional).
	pub chat_token: SecretString,
	/// Token for PubSub/EventSub/Helix. Falls back to `chat_token`.
	pub channel_token: Option<SecretString>,
	pub channels: Vec<ChannelConfig>,

	pub irc_ws_url: String,
	pub pubsub_ws_url: String,
	pub eventsub_ws_url: String,
	pub helix_base_url: String,
	pub validate_url: String,
	pub helix_timeout: Duration,

	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub irc_ping_interval: Duration,
	pub pubsub_ping_interval: Duration,
	/// Added on top of the EventSub session keepalive before the watchdog fires.
	pub eventsub_keepalive_grace: Duration,

	pub send_tick: Duration,
	pub rate_limit_window: Duration,
	pub rate_limit_max_sends: usize,

	pub stream_poll: PollIntervals,
	pub poll_poll: PollIntervals,
	pub prediction_poll: PollIntervals,
	pub hype_train_poll: PollIntervals,

	pub observer_capacity: usize,
	pub ws_connector: Option<WsConnector>,
}

impl TwitchConfig {
	pub fn new(client_id: impl Into<String>, chat_token: SecretString) -> Self {
		Self {
			client_id: client_id.into(),
			chat_token,
			channel_token: None,
			channels: Vec::new(),
			irc_ws_url: "wss://irc-ws.chat.twitch.tv:443".to_string(),
			pubsub_ws_url: "wss://pubsub-edge.twitch.tv:443".to_string(),
			eventsub_ws_url: "wss://eventsub.wss.twitch.tv/ws".to_string(),
			helix_base_url: "https://api.twitch.tv".to_string(),
			validate_url: "https://id.twitch.tv/oauth2/validate".to_string(),
			helix_timeout: Duration::from_secs(10),
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			irc_ping_interval: Duration::from_secs(60),
			pubsub_ping_interval: Duration::from_secs(60),
			eventsub_keepalive_grace: Duration::from_secs(5),
			send_tick: Duration::from_millis(100),
			rate_limit_window: Duration::from_secs(30),
			rate_limit_max_sends: 20,
			stream_poll: PollIntervals::fixed(Duration::from_secs(5)),
			poll_poll: PollIntervals::new(Duration::from_secs(2), Duration::from_secs(10)),
			prediction_poll: PollIntervals::new(Duration::from_secs(2), Duration::from_secs(10)),
			hype_train_poll: PollIntervals::new(Duration::from_secs(2), Duration::from_secs(10)),
			observer_capacity: 256,
			ws_connector: None,
		}
	}

	/// Token used for everything but IRC.
	pub fn effective_channel_token(&self) -> &SecretString {
		match &self.channel_token {
			Some(t) if !t.is_empty() => t,
			_ => &self.chat_token,
		}
	}
}

impl fmt::Debug for TwitchConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TwitchConfig")
			.field("client_id", &self.client_id)
			.field("chat_token", &self.chat_token)
			.field("channel_token", &self.channel_token)
			.field("channels", &self.channels)
			.field("irc_ws_url", &self.irc_ws_url)
			.field("pubsub_ws_url", &self.pubsub_ws_url)
			.field("eventsub_ws_url", &self.eventsub_ws_url)
			.field("helix_base_url", &self.helix_base_url)
			.field("reconnect_min_delay", &self.reconnect_min_delay)
			.field("reconnect_max_delay", &self.reconnect_max_delay)
			.field("rate_limit_window", &self.rate_limit_window)
			.field("rate_limit_max_sends", &self.rate_limit_max_sends)
			.field("ws_connector", &self.ws_connector.is_some())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn debug_redacts_tokens() {
		let mut cfg = TwitchConfig::new(DEFAULT_CLIENT_ID, SecretString::new("oauth:chat-secret"));
		cfg.channel_token = Some(SecretString::new("chan-secret"));
		let shown = format!("{cfg:?}");
		assert!(!shown.contains("chat-secret"));
		assert!(!shown.contains("chan-secret"));
		assert!(shown.contains(DEFAULT_CLIENT_ID));
	}

	#[test]
	fn blank_channel_token_falls_back_to_chat() {
		let mut cfg = TwitchConfig::new("id", SecretString::new("chat"));
		cfg.channel_token = Some(SecretString::new("  "));
		assert_eq!(cfg.effective_channel_token().expose(), "chat");
	}
}
