#![forbid(unsafe_code)]

pub mod observers;
pub mod twitch;

use std::fmt;

use serde::{Deserialize, Serialize};
use streamhub_domain::{ChannelName, ChannelOrigin, ChatRoom, RoomId, Transport};
use uuid::Uuid;

pub use twitch::helix::models::{HypeTrain, Poll, Prediction, Stream};

/// Wrapper that redacts in logs.
#[derive(Clone, Default)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}

	/// Token without the IRC-style `oauth:` prefix.
	pub fn bare_token(&self) -> &str {
		let t = self.0.trim();
		t.strip_prefix("oauth:").unwrap_or(t)
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Liveness as reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
	Open,
	Closed,
	Error(String),
}

/// Resolved user identity attached to domain events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
	pub id: Option<String>,
	pub login: String,
	pub display: String,

	#[serde(default)]
	pub painted: Option<String>,
}

/// Point-in-time view of a joined channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
	pub name: ChannelName,
	pub room_id: Option<RoomId>,
	pub origin: ChannelOrigin,
	pub can_send: bool,
	pub live: bool,
	pub viewers: u64,
}

impl ChatRoom for ChannelInfo {
	fn name(&self) -> &ChannelName {
		&self.name
	}

	fn room_id(&self) -> Option<RoomId> {
		self.room_id.clone()
	}

	fn can_send(&self) -> bool {
		self.can_send
	}

	fn is_temporary(&self) -> bool {
		self.origin.is_temporary()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatMessageKind {
	Privmsg,
	UserNotice { msg_id: Option<String> },
	Notice,
}

/// Chat line as seen by consumers; text enrichment happens downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
	pub channel: ChannelInfo,
	pub author: Option<UserRef>,
	pub text: String,
	pub message_id: Option<String>,
	pub kind: ChatMessageKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
	pub user: UserRef,
	/// `Prime`, `1000`, `2000` or `3000`.
	pub plan: String,
	pub is_gift: bool,
	pub recipient_display_name: Option<String>,
	pub purchased_months: u32,
	pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheerEvent {
	pub user: UserRef,
	pub bits: u64,
	pub is_anonymous: bool,
	pub message: Option<String>,
}

/// Channel-points reward redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
	pub user: UserRef,
	pub reward_id: String,
	pub transaction_id: String,
	pub title: String,
	pub cost: u64,
	pub prompt: Option<String>,
	pub user_input: Option<String>,
	pub image_url: Option<String>,
	pub background_color: Option<String>,
}

/// Normalized, deduplicated event delivered to observers.
#[derive(Debug, Clone)]
pub enum DomainEvent {
	Connection {
		transport: Transport,
		state: ConnectionState,
	},

	/// One-shot user-visible notice (missing scope, bad token, ...).
	SystemNotice {
		text: String,
	},

	/// Chat accepted the login.
	LoggedIn {
		login: String,
	},

	Joined {
		channel: ChannelInfo,
	},
	Left {
		channel: ChannelInfo,
	},
	RoomStateUpdated {
		channel: ChannelInfo,
	},

	ChatMessage(Box<ChatMessage>),

	ChatCleared {
		channel: ChannelInfo,
		target_user_id: Option<String>,
	},
	MessageCleared {
		channel: ChannelInfo,
		message_id: String,
	},

	LiveStatus {
		channel: ChannelInfo,
		live: bool,
		viewers: u64,
	},

	Follow {
		channel: ChannelInfo,
		user: UserRef,
		origin: Transport,
	},
	Subscription {
		channel: ChannelInfo,
		subscription: SubscriptionEvent,
	},
	Cheer {
		channel: ChannelInfo,
		cheer: CheerEvent,
	},
	Redemption {
		channel: ChannelInfo,
		redemption: Box<Redemption>,
	},
	Raid {
		channel: ChannelInfo,
		raider: UserRef,
		viewers: u64,
	},

	PollChanged {
		broadcaster_id: RoomId,
		poll: Option<Box<Poll>>,
	},
	PredictionChanged {
		broadcaster_id: RoomId,
		prediction: Option<Box<Prediction>>,
	},
	HypeTrainChanged {
		broadcaster_id: RoomId,
		hype_train: Option<Box<HypeTrain>>,
	},
}

impl DomainEvent {
	/// Metric/log label.
	pub fn kind(&self) -> &'static str {
		match self {
			Self::Connection { .. } => "connection",
			Self::SystemNotice { .. } => "system_notice",
			Self::LoggedIn { .. } => "logged_in",
			Self::Joined { .. } => "joined",
			Self::Left { .. } => "left",
			Self::RoomStateUpdated { .. } => "room_state",
			Self::ChatMessage(_) => "chat_message",
			Self::ChatCleared { .. } => "chat_cleared",
			Self::MessageCleared { .. } => "message_cleared",
			Self::LiveStatus { .. } => "live_status",
			Self::Follow { .. } => "follow",
			Self::Subscription { .. } => "subscription",
			Self::Cheer { .. } => "cheer",
			Self::Redemption { .. } => "redemption",
			Self::Raid { .. } => "raid",
			Self::PollChanged { .. } => "poll",
			Self::PredictionChanged { .. } => "prediction",
			Self::HypeTrainChanged { .. } => "hype_train",
		}
	}

	/// Channel the event is attached to, if any.
	pub fn channel(&self) -> Option<&ChannelInfo> {
		match self {
			Self::Joined { channel }
			| Self::Left { channel }
			| Self::RoomStateUpdated { channel }
			| Self::ChatCleared { channel, .. }
			| Self::MessageCleared { channel, .. }
			| Self::LiveStatus { channel, .. }
			| Self::Follow { channel, .. }
			| Self::Subscription { channel, .. }
			| Self::Cheer { channel, .. }
			| Self::Redemption { channel, .. }
			| Self::Raid { channel, .. } => Some(channel),
			Self::ChatMessage(m) => Some(&m.channel),
			Self::Connection { .. }
			| Self::SystemNotice { .. }
			| Self::LoggedIn { .. }
			| Self::PollChanged { .. }
			| Self::PredictionChanged { .. }
			| Self::HypeTrainChanged { .. } => None,
		}
	}
}

/// Build a connection status event.
pub fn connection_status(transport: Transport, state: ConnectionState) -> DomainEvent {
	DomainEvent::Connection { transport, state }
}

/// Build a user-visible notice.
pub fn system_notice(text: impl Into<String>) -> DomainEvent {
	DomainEvent::SystemNotice { text: text.into() }
}

/// Generate an opaque nonce for outbound frames.
pub fn new_nonce() -> String {
	Uuid::new_v4().to_string()
}
