#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inbound/outbound transports of the Twitch integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
	Irc,
	PubSub,
	EventSub,
	Helix,
}

impl Transport {
	pub const ALL: [Transport; 4] = [Transport::Irc, Transport::PubSub, Transport::EventSub, Transport::Helix];

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Transport::Irc => "irc",
			Transport::PubSub => "pubsub",
			Transport::EventSub => "eventsub",
			Transport::Helix => "helix",
		}
	}

	pub const fn index(self) -> usize {
		match self {
			Transport::Irc => 0,
			Transport::PubSub => 1,
			Transport::EventSub => 2,
			Transport::Helix => 3,
		}
	}
}

impl fmt::Display for Transport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown transport: {0}")]
	UnknownTransport(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for Transport {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"irc" | "chat" => Ok(Transport::Irc),
			"pubsub" | "pub_sub" => Ok(Transport::PubSub),
			"eventsub" | "event_sub" => Ok(Transport::EventSub),
			"helix" | "rest" => Ok(Transport::Helix),
			other => Err(ParseIdError::UnknownTransport(other.to_string())),
		}
	}
}

/// Twitch room (broadcaster user) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Chat channel login, normalized to lowercase without the leading `#`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
	pub fn new(name: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let name = name.as_ref().trim();
		let name = name.strip_prefix('#').unwrap_or(name);
		if name.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
			return Err(ParseIdError::InvalidFormat(format!("channel name contains whitespace: {name:?}")));
		}
		Ok(Self(name.to_ascii_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// IRC form (`#name`).
	pub fn irc(&self) -> String {
		format!("#{}", self.0)
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelName::new(s)
	}
}

impl TryFrom<String> for ChannelName {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		ChannelName::new(value)
	}
}

impl From<ChannelName> for String {
	fn from(value: ChannelName) -> Self {
		value.0
	}
}

/// Why a channel is joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelOrigin {
	/// Part of the persisted channel list.
	Configured,

	/// Joined on behalf of a collaborator; never touches PubSub/EventSub.
	Temporary { group: String, prefix: String },
}

impl ChannelOrigin {
	pub fn is_temporary(&self) -> bool {
		matches!(self, ChannelOrigin::Temporary { .. })
	}

	pub fn group(&self) -> Option<&str> {
		match self {
			ChannelOrigin::Configured => None,
			ChannelOrigin::Temporary { group, .. } => Some(group),
		}
	}
}

/// Capabilities every joined room exposes.
pub trait ChatRoom {
	fn name(&self) -> &ChannelName;

	/// Known once ROOMSTATE has been seen.
	fn room_id(&self) -> Option<RoomId>;

	fn can_send(&self) -> bool;

	fn is_temporary(&self) -> bool;
}
