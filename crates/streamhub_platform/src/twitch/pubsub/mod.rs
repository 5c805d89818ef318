#![forbid(unsafe_code)]

//! PubSub frame schema and per-topic payload decoding.

mod topics;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use streamhub_domain::{ChannelName, RoomId};

pub use topics::{TopicRegistry, wire_topic};

use super::router::{Identity, InboundEvent, RoomRef};
use crate::{Redemption, SubscriptionEvent, UserRef};

pub const TOPIC_SUBSCRIBE: &str = "channel-subscribe-events-v1";
pub const TOPIC_BITS: &str = "channel-bits-events-v2";
pub const TOPIC_POINTS: &str = "channel-points-channel-v1";
pub const TOPIC_VIDEO_PLAYBACK: &str = "video-playback";
pub const TOPIC_FOLLOWING: &str = "following";

/// Topics held for every configured (non-temporary) channel.
pub const CHANNEL_TOPICS: &[&str] = &[TOPIC_SUBSCRIBE, TOPIC_BITS, TOPIC_POINTS, TOPIC_VIDEO_PLAYBACK, TOPIC_FOLLOWING];

pub const ANONYMOUS_CHEERER: &str = "AnAnonymousCheerer";

#[derive(Debug, Serialize)]
struct PubSubRequest<'a> {
	#[serde(rename = "type")]
	kind: &'static str,
	nonce: String,
	data: PubSubRequestData<'a>,
}

#[derive(Debug, Serialize)]
struct PubSubRequestData<'a> {
	topics: &'a [String],
	#[serde(skip_serializing_if = "Option::is_none")]
	auth_token: Option<&'a str>,
}

fn request_frame(kind: &'static str, topics: &[String], auth_token: Option<&str>) -> anyhow::Result<String> {
	let req = PubSubRequest {
		kind,
		nonce: crate::new_nonce(),
		data: PubSubRequestData {
			topics,
			auth_token: auth_token.map(|t| t.strip_prefix("oauth:").unwrap_or(t)).filter(|t| !t.is_empty()),
		},
	};
	serde_json::to_string(&req).with_context(|| format!("serialize pubsub {kind}"))
}

pub fn listen_frame(topics: &[String], auth_token: Option<&str>) -> anyhow::Result<String> {
	request_frame("LISTEN", topics, auth_token)
}

pub fn unlisten_frame(topics: &[String], auth_token: Option<&str>) -> anyhow::Result<String> {
	request_frame("UNLISTEN", topics, auth_token)
}

pub fn ping_frame() -> &'static str {
	r#"{"type":"PING"}"#
}

#[derive(Debug, Deserialize)]
struct PubSubPeek {
	#[serde(rename = "type")]
	kind: String,
}

#[derive(Debug, Deserialize)]
struct PubSubResponse {
	#[serde(default)]
	nonce: Option<String>,
	#[serde(default)]
	error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PubSubMessage {
	data: PubSubMessageData,
}

#[derive(Debug, Deserialize)]
struct PubSubMessageData {
	topic: String,
	/// JSON document encoded as a string.
	message: String,
}

/// Top-level inbound PubSub frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubFrame {
	Response { nonce: Option<String>, error: Option<String> },
	Message { topic: String, message: String },
	Pong,
	Reconnect,
	Other(String),
}

pub fn decode_frame(raw: &str) -> anyhow::Result<PubSubFrame> {
	let peek: PubSubPeek = serde_json::from_str(raw).context("parse pubsub frame type")?;
	match peek.kind.to_ascii_uppercase().as_str() {
		"RESPONSE" => {
			let r: PubSubResponse = serde_json::from_str(raw).context("parse pubsub RESPONSE")?;
			Ok(PubSubFrame::Response {
				nonce: r.nonce,
				error: r.error.filter(|e| !e.is_empty()),
			})
		}
		"MESSAGE" => {
			let m: PubSubMessage = serde_json::from_str(raw).context("parse pubsub MESSAGE")?;
			Ok(PubSubFrame::Message {
				topic: m.data.topic,
				message: m.data.message,
			})
		}
		"PONG" => Ok(PubSubFrame::Pong),
		"RECONNECT" => Ok(PubSubFrame::Reconnect),
		_ => Ok(PubSubFrame::Other(peek.kind)),
	}
}

#[derive(Debug, Deserialize)]
struct BitsMessage {
	data: BitsData,
	#[serde(default)]
	is_anonymous: bool,
}

#[derive(Debug, Deserialize)]
struct BitsData {
	#[serde(default)]
	user_id: Option<String>,
	#[serde(default)]
	user_name: Option<String>,
	channel_id: String,
	#[serde(default)]
	chat_message: Option<String>,
	bits_used: u64,
}

#[derive(Debug, Deserialize)]
struct SubscribeMessage {
	#[serde(default)]
	user_id: Option<String>,
	#[serde(default)]
	user_name: Option<String>,
	#[serde(default)]
	display_name: Option<String>,
	channel_id: String,
	sub_plan: String,
	#[serde(default)]
	is_gift: bool,
	#[serde(default)]
	recipient_display_name: Option<String>,
	#[serde(default)]
	multi_month_duration: Option<u32>,
	#[serde(default)]
	sub_message: Option<SubMessageBody>,
}

#[derive(Debug, Deserialize)]
struct SubMessageBody {
	#[serde(default)]
	message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PointsMessage {
	#[serde(rename = "type")]
	kind: String,
	data: PointsData,
}

#[derive(Debug, Deserialize)]
struct PointsData {
	redemption: PointsRedemption,
}

#[derive(Debug, Deserialize)]
struct PointsRedemption {
	id: String,
	user: PointsUser,
	channel_id: String,
	reward: PointsReward,
	#[serde(default)]
	user_input: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PointsUser {
	id: String,
	login: String,
	#[serde(default)]
	display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PointsReward {
	id: String,
	title: String,
	cost: u64,
	#[serde(default)]
	prompt: Option<String>,
	#[serde(default)]
	image: Option<PointsImage>,
	#[serde(default)]
	default_image: Option<PointsImage>,
	#[serde(default)]
	background_color: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PointsImage {
	#[serde(default)]
	url_4x: Option<String>,
	#[serde(default)]
	url_2x: Option<String>,
	#[serde(default)]
	url_1x: Option<String>,
}

impl PointsImage {
	fn best(self) -> Option<String> {
		self.url_4x.or(self.url_2x).or(self.url_1x)
	}
}

#[derive(Debug, Deserialize)]
struct FollowingMessage {
	#[serde(default)]
	display_name: Option<String>,
	username: String,
	user_id: String,
}

#[derive(Debug, Deserialize)]
struct VideoPlaybackMessage {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	viewers: Option<u64>,
}

fn non_empty(s: Option<String>) -> Option<String> {
	s.filter(|v| !v.trim().is_empty())
}

fn room(id: &str) -> anyhow::Result<RoomRef> {
	Ok(RoomRef::Id(RoomId::new(id).context("pubsub payload has empty channel id")?))
}

/// Decode a `MESSAGE` payload by topic prefix. `Ok(None)` means the topic is ignored.
pub fn decode_topic_message(topic: &str, message: &str) -> anyhow::Result<Option<InboundEvent>> {
	let (prefix, key) = topic.split_once('.').unwrap_or((topic, ""));

	match prefix {
		TOPIC_BITS => {
			let m: BitsMessage = serde_json::from_str(message).context("parse channel-bits-events-v2 message")?;
			let identity = if m.is_anonymous {
				Identity::new(None, ANONYMOUS_CHEERER, Some(ANONYMOUS_CHEERER))
			} else {
				let login = non_empty(m.data.user_name).context("cheer without user_name")?;
				Identity::new(non_empty(m.data.user_id), login, None::<String>)
			};
			Ok(Some(InboundEvent::Cheer {
				room: room(&m.data.channel_id)?,
				user: identity,
				is_anonymous: m.is_anonymous,
				bits: m.data.bits_used,
				message: non_empty(m.data.chat_message),
			}))
		}

		TOPIC_SUBSCRIBE => {
			let m: SubscribeMessage = serde_json::from_str(message).context("parse channel-subscribe-events-v1 message")?;
			let login = non_empty(m.user_name).context("subscription without user_name")?;
			let identity = Identity::new(non_empty(m.user_id), login, non_empty(m.display_name));
			Ok(Some(InboundEvent::Subscription {
				room: room(&m.channel_id)?,
				user: identity,
				detail: SubscriptionDetail {
					plan: m.sub_plan,
					is_gift: m.is_gift,
					recipient_display_name: non_empty(m.recipient_display_name),
					purchased_months: m.multi_month_duration.unwrap_or(1).max(1),
					message: m.sub_message.and_then(|b| non_empty(b.message)),
				},
			}))
		}

		TOPIC_POINTS => {
			let m: PointsMessage = serde_json::from_str(message).context("parse channel-points-channel-v1 message")?;
			if m.kind != "reward-redeemed" {
				return Ok(None);
			}
			let r = m.data.redemption;
			let identity = Identity::new(Some(r.user.id), r.user.login, non_empty(r.user.display_name));
			let image_url = r
				.reward
				.image
				.and_then(PointsImage::best)
				.or_else(|| r.reward.default_image.and_then(PointsImage::best));
			Ok(Some(InboundEvent::Redemption {
				room: room(&r.channel_id)?,
				user: identity,
				detail: RedemptionDetail {
					reward_id: r.reward.id,
					transaction_id: r.id,
					title: r.reward.title,
					cost: r.reward.cost,
					prompt: non_empty(r.reward.prompt),
					user_input: non_empty(r.user_input),
					image_url,
					background_color: non_empty(r.reward.background_color),
				},
			}))
		}

		TOPIC_FOLLOWING => {
			let m: FollowingMessage = serde_json::from_str(message).context("parse following message")?;
			if m.username.trim().is_empty() || m.user_id.trim().is_empty() {
				anyhow::bail!("following message without user identity");
			}
			Ok(Some(InboundEvent::Follow {
				room: room(key)?,
				user: Identity::new(Some(m.user_id), m.username, non_empty(m.display_name)),
			}))
		}

		TOPIC_VIDEO_PLAYBACK => {
			let m: VideoPlaybackMessage = serde_json::from_str(message).context("parse video-playback message")?;
			let name = ChannelName::new(key).context("video-playback topic without channel name")?;
			Ok(Some(InboundEvent::VideoPlayback {
				channel: name,
				kind: m.kind,
				viewers: m.viewers,
			}))
		}

		_ => Ok(None),
	}
}

/// Subscription fields before identity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDetail {
	pub plan: String,
	pub is_gift: bool,
	pub recipient_display_name: Option<String>,
	pub purchased_months: u32,
	pub message: Option<String>,
}

impl SubscriptionDetail {
	pub(crate) fn into_event(self, user: UserRef) -> SubscriptionEvent {
		SubscriptionEvent {
			user,
			plan: self.plan,
			is_gift: self.is_gift,
			recipient_display_name: self.recipient_display_name,
			purchased_months: self.purchased_months,
			message: self.message,
		}
	}
}

/// Redemption fields before identity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionDetail {
	pub reward_id: String,
	pub transaction_id: String,
	pub title: String,
	pub cost: u64,
	pub prompt: Option<String>,
	pub user_input: Option<String>,
	pub image_url: Option<String>,
	pub background_color: Option<String>,
}

impl RedemptionDetail {
	pub(crate) fn into_redemption(self, user: UserRef) -> Redemption {
		Redemption {
			user,
			reward_id: self.reward_id,
			transaction_id: self.transaction_id,
			title: self.title,
			cost: self.cost,
			prompt: self.prompt,
			user_input: self.user_input,
			image_url: self.image_url,
			background_color: self.background_color,
		}
	}
}

#[cfg(test)]
mod tests;
