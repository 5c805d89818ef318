#![forbid(unsafe_code)]

//! EventSub websocket message schema.

mod registry;

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use streamhub_domain::RoomId;

pub use registry::{Subscription, SubscriptionRegistry};

use super::router::{Identity, InboundEvent, RoomRef};

pub const CHANNEL_FOLLOW: &str = "channel.follow";
pub const CHANNEL_FOLLOW_VERSION: &str = "2";

#[derive(Debug, Deserialize)]
struct MetadataPeek {
	metadata: MetadataPeekInner,
}

#[derive(Debug, Deserialize)]
struct MetadataPeekInner {
	message_type: String,
	#[serde(default)]
	subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionMessage {
	payload: SessionPayload,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
	session: Session,
}

#[derive(Debug, Deserialize)]
struct Session {
	id: String,
	#[serde(default)]
	keepalive_timeout_seconds: Option<u64>,
	#[serde(default)]
	reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Notification<TEvent> {
	payload: NotificationPayload<TEvent>,
}

#[derive(Debug, Deserialize)]
struct NotificationPayload<TEvent> {
	event: TEvent,
}

#[derive(Debug, Deserialize)]
struct Revocation {
	payload: RevocationPayload,
}

#[derive(Debug, Deserialize)]
struct RevocationPayload {
	subscription: RevokedSubscription,
}

#[derive(Debug, Deserialize)]
struct RevokedSubscription {
	id: String,
	#[serde(default)]
	status: String,
	#[serde(rename = "type", default)]
	kind: String,
}

#[derive(Debug, Deserialize)]
struct ChannelFollowEvent {
	#[serde(default)]
	user_id: String,
	#[serde(default)]
	user_login: String,
	#[serde(default)]
	user_name: String,
	#[serde(default)]
	broadcaster_user_id: String,
}

#[derive(Debug, Clone)]
pub enum EventSubFrame {
	Welcome {
		session_id: String,
		keepalive: Option<Duration>,
	},
	Keepalive,
	Reconnect {
		url: String,
	},
	/// `event` is `None` for subscription types we do not route.
	Notification {
		subscription_type: String,
		event: Option<InboundEvent>,
	},
	Revocation {
		subscription_id: String,
		subscription_type: String,
		status: String,
	},
	Other(String),
}

fn decode_follow(raw: &str) -> anyhow::Result<InboundEvent> {
	let n: Notification<ChannelFollowEvent> = serde_json::from_str(raw).context("parse channel.follow notification")?;
	let ev = n.payload.event;
	if [&ev.user_id, &ev.user_login, &ev.user_name, &ev.broadcaster_user_id]
		.iter()
		.any(|s| s.trim().is_empty())
	{
		anyhow::bail!("channel.follow notification with missing identity fields");
	}

	Ok(InboundEvent::Follow {
		room: RoomRef::Id(RoomId::new(ev.broadcaster_user_id).context("channel.follow broadcaster id")?),
		user: Identity::new(Some(ev.user_id), ev.user_login, Some(ev.user_name)),
	})
}

pub fn decode_frame(raw: &str) -> anyhow::Result<EventSubFrame> {
	let peek: MetadataPeek = serde_json::from_str(raw).context("parse eventsub metadata")?;

	match peek.metadata.message_type.as_str() {
		"session_welcome" => {
			let m: SessionMessage = serde_json::from_str(raw).context("parse session_welcome")?;
			Ok(EventSubFrame::Welcome {
				session_id: m.payload.session.id,
				keepalive: m.payload.session.keepalive_timeout_seconds.map(Duration::from_secs),
			})
		}
		"session_keepalive" => Ok(EventSubFrame::Keepalive),
		"session_reconnect" => {
			let m: SessionMessage = serde_json::from_str(raw).context("parse session_reconnect")?;
			let url = m
				.payload
				.session
				.reconnect_url
				.filter(|u| !u.is_empty())
				.context("session_reconnect without reconnect_url")?;
			Ok(EventSubFrame::Reconnect { url })
		}
		"notification" => {
			let subscription_type = peek.metadata.subscription_type.unwrap_or_default();
			let event = match subscription_type.as_str() {
				CHANNEL_FOLLOW => Some(decode_follow(raw)?),
				_ => None,
			};
			Ok(EventSubFrame::Notification {
				subscription_type,
				event,
			})
		}
		"revocation" => {
			let r: Revocation = serde_json::from_str(raw).context("parse revocation")?;
			Ok(EventSubFrame::Revocation {
				subscription_id: r.payload.subscription.id,
				subscription_type: r.payload.subscription.kind,
				status: r.payload.subscription.status,
			})
		}
		other => Ok(EventSubFrame::Other(other.to_string())),
	}
}
