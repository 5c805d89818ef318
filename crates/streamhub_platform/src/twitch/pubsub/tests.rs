#![forbid(unsafe_code)]

use proptest::prelude::*;

use super::*;

fn mk_room(id: &str) -> RoomId {
	RoomId::new(id).expect("room id")
}

fn mk_name(s: &str) -> ChannelName {
	ChannelName::new(s).expect("channel name")
}

fn decode(topic: &str, message: &str) -> InboundEvent {
	decode_topic_message(topic, message)
		.expect("decode")
		.expect("routed topic")
}

#[test]
fn listen_strips_oauth_prefix_and_carries_nonce() {
	let topics = vec!["channel-bits-events-v2.123".to_string(), "video-playback.foo".to_string()];
	let frame: serde_json::Value =
		serde_json::from_str(&listen_frame(&topics, Some("oauth:abc")).expect("frame")).expect("json");

	assert_eq!(frame["type"], "LISTEN");
	assert_eq!(frame["data"]["auth_token"], "abc");
	assert_eq!(frame["data"]["topics"][1], "video-playback.foo");
	assert!(frame["nonce"].as_str().is_some_and(|n| !n.is_empty()));

	let anonymous: serde_json::Value =
		serde_json::from_str(&unlisten_frame(&topics, None).expect("frame")).expect("json");
	assert_eq!(anonymous["type"], "UNLISTEN");
	assert!(anonymous["data"].get("auth_token").is_none());
}

#[test]
fn decodes_envelopes() {
	assert_eq!(
		decode_frame(r#"{"type":"RESPONSE","nonce":"n1","error":""}"#).expect("response"),
		PubSubFrame::Response {
			nonce: Some("n1".to_string()),
			error: None,
		}
	);
	assert_eq!(
		decode_frame(r#"{"type":"RESPONSE","nonce":"n2","error":"ERR_BADAUTH"}"#).expect("response"),
		PubSubFrame::Response {
			nonce: Some("n2".to_string()),
			error: Some("ERR_BADAUTH".to_string()),
		}
	);
	assert_eq!(decode_frame(r#"{"type":"PONG"}"#).expect("pong"), PubSubFrame::Pong);
	assert_eq!(decode_frame(r#"{"type":"RECONNECT"}"#).expect("reconnect"), PubSubFrame::Reconnect);
	assert!(decode_frame(r#"{"nope":1}"#).is_err());

	let message = decode_frame(r#"{"type":"MESSAGE","data":{"topic":"following.1","message":"{\"username\":\"a\"}"}}"#)
		.expect("message");
	assert_eq!(
		message,
		PubSubFrame::Message {
			topic: "following.1".to_string(),
			message: r#"{"username":"a"}"#.to_string(),
		}
	);
}

#[test]
fn decodes_cheer() {
	let raw = r#"{"data":{"user_name":"cheerer","channel_name":"foo","user_id":"5","channel_id":"123","chat_message":"cheer50 nice","bits_used":50,"total_bits_used":500,"context":"cheer"},"version":"1.0","message_type":"bits_event","is_anonymous":false}"#;
	match decode("channel-bits-events-v2.123", raw) {
		InboundEvent::Cheer {
			room,
			user,
			is_anonymous,
			bits,
			message,
		} => {
			assert_eq!(room, RoomRef::Id(mk_room("123")));
			assert_eq!(user.login, "cheerer");
			assert_eq!(user.id.as_deref(), Some("5"));
			assert!(!is_anonymous);
			assert_eq!(bits, 50);
			assert_eq!(message.as_deref(), Some("cheer50 nice"));
		}
		other => panic!("expected cheer, got: {other:?}"),
	}
}

#[test]
fn anonymous_cheer_has_no_identity() {
	let raw = r#"{"data":{"channel_id":"123","bits_used":10,"chat_message":""},"is_anonymous":true}"#;
	match decode("channel-bits-events-v2.123", raw) {
		InboundEvent::Cheer {
			user,
			is_anonymous,
			message,
			..
		} => {
			assert!(is_anonymous);
			assert_eq!(user.login, ANONYMOUS_CHEERER);
			assert_eq!(user.id, None);
			assert_eq!(message, None);
		}
		other => panic!("expected cheer, got: {other:?}"),
	}

	let named_without_login = r#"{"data":{"channel_id":"123","bits_used":10},"is_anonymous":false}"#;
	assert!(decode_topic_message("channel-bits-events-v2.123", named_without_login).is_err());
}

#[test]
fn subscription_months_are_at_least_one() {
	let raw = |months: &str| {
		format!(
			r#"{{"user_name":"subber","display_name":"Subber","user_id":"8","channel_id":"123","sub_plan":"1000","is_gift":false,"sub_message":{{"message":"hi there","emotes":null}}{months}}}"#
		)
	};

	for (suffix, expected) in [("", 1), (r#","multi_month_duration":0"#, 1), (r#","multi_month_duration":6"#, 6)] {
		match decode("channel-subscribe-events-v1.123", &raw(suffix)) {
			InboundEvent::Subscription { user, detail, .. } => {
				assert_eq!(detail.purchased_months, expected, "suffix {suffix:?}");
				assert_eq!(detail.plan, "1000");
				assert_eq!(detail.message.as_deref(), Some("hi there"));
				assert_eq!(user.display.as_deref(), Some("Subber"));
			}
			other => panic!("expected subscription, got: {other:?}"),
		}
	}
}

#[test]
fn gift_subscription_carries_recipient() {
	let raw = r#"{"user_name":"gifter","user_id":"9","channel_id":"123","sub_plan":"2000","is_gift":true,"recipient_display_name":"Lucky"}"#;
	match decode("channel-subscribe-events-v1.123", raw) {
		InboundEvent::Subscription { detail, .. } => {
			assert!(detail.is_gift);
			assert_eq!(detail.recipient_display_name.as_deref(), Some("Lucky"));
			assert_eq!(detail.message, None);
		}
		other => panic!("expected subscription, got: {other:?}"),
	}
}

const REDEEMED: &str = r##"{"type":"reward-redeemed","data":{"timestamp":"2024-05-01T12:00:00Z","redemption":{"id":"tx-1","user":{"id":"11","login":"fan","display_name":"Fan"},"channel_id":"123","redeemed_at":"2024-05-01T12:00:00Z","reward":{"id":"rw-1","channel_id":"123","title":"Hydrate","prompt":"drink water","cost":500,"image":null,"default_image":{"url_1x":"https://img/1.png","url_2x":"https://img/2.png","url_4x":"https://img/4.png"},"background_color":"#00C7AC"},"user_input":"","status":"UNFULFILLED"}}}"##;

#[test]
fn decodes_redemption() {
	match decode("channel-points-channel-v1.123", REDEEMED) {
		InboundEvent::Redemption { room, user, detail } => {
			assert_eq!(room, RoomRef::Id(mk_room("123")));
			assert_eq!(user.login, "fan");
			assert_eq!(detail.transaction_id, "tx-1");
			assert_eq!(detail.reward_id, "rw-1");
			assert_eq!(detail.cost, 500);
			assert_eq!(detail.prompt.as_deref(), Some("drink water"));
			assert_eq!(detail.user_input, None);
			assert_eq!(detail.image_url.as_deref(), Some("https://img/4.png"));
			assert_eq!(detail.background_color.as_deref(), Some("#00C7AC"));
		}
		other => panic!("expected redemption, got: {other:?}"),
	}
}

#[test]
fn points_ignore_other_message_types() {
	let updated = REDEEMED.replacen("reward-redeemed", "redemption-status-update", 1);
	assert!(
		decode_topic_message("channel-points-channel-v1.123", &updated)
			.expect("decode")
			.is_none()
	);
}

#[test]
fn following_and_playback_take_key_from_topic() {
	match decode(
		"following.123",
		r#"{"display_name":"Viewer","username":"viewer","user_id":"42"}"#,
	) {
		InboundEvent::Follow { room, user } => {
			assert_eq!(room, RoomRef::Id(mk_room("123")));
			assert_eq!(user.id.as_deref(), Some("42"));
		}
		other => panic!("expected follow, got: {other:?}"),
	}
	assert!(decode_topic_message("following.123", r#"{"username":"","user_id":"42"}"#).is_err());

	match decode(
		"video-playback.Foo",
		r#"{"type":"viewcount","server_time":1714564800.1,"viewers":31}"#,
	) {
		InboundEvent::VideoPlayback { channel, kind, viewers } => {
			assert_eq!(channel, mk_name("foo"));
			assert_eq!(kind, "viewcount");
			assert_eq!(viewers, Some(31));
		}
		other => panic!("expected playback, got: {other:?}"),
	}
}

#[test]
fn unknown_topics_and_bad_payloads() {
	assert!(decode_topic_message("whispers.123", "{}").expect("decode").is_none());
	assert!(decode_topic_message("channel-bits-events-v2.123", "not json").is_err());
}

#[test]
fn resubscribe_batch_includes_every_room() {
	let registry = TopicRegistry::new();
	let added = registry.subscribe(&mk_room("123"), &mk_name("foo"), CHANNEL_TOPICS);
	assert_eq!(added.len(), CHANNEL_TOPICS.len());
	registry.subscribe(&mk_room("456"), &mk_name("bar"), &[TOPIC_VIDEO_PLAYBACK, TOPIC_BITS]);

	let all = registry.all_wire_topics();
	assert_eq!(all.len(), CHANNEL_TOPICS.len() + 2);
	for expected in [
		"video-playback.foo",
		"video-playback.bar",
		"channel-bits-events-v2.456",
		"channel-points-channel-v1.123",
		"following.123",
	] {
		assert!(all.iter().any(|t| t == expected), "missing {expected}");
	}

	assert_eq!(registry.unsubscribe(&mk_room("456")).len(), 2);
	assert!(registry.unsubscribe(&mk_room("456")).is_empty());
	assert_eq!(registry.topics_for(&mk_room("123")).len(), CHANNEL_TOPICS.len());

	registry.clear();
	assert!(registry.is_empty());
}

proptest! {
	#[test]
	fn subscribing_is_idempotent(picks in proptest::collection::vec(0usize..5, 0..20)) {
		let registry = TopicRegistry::new();
		let room = mk_room("123");
		let name = mk_name("foo");

		let mut added_total = 0;
		for p in &picks {
			added_total += registry.subscribe(&room, &name, &[CHANNEL_TOPICS[*p]]).len();
		}
		let mut distinct = picks.clone();
		distinct.sort_unstable();
		distinct.dedup();

		prop_assert_eq!(added_total, distinct.len());
		prop_assert_eq!(registry.topics_for(&room).len(), distinct.len());
		prop_assert!(registry.subscribe(&room, &name, CHANNEL_TOPICS).len() == CHANNEL_TOPICS.len() - distinct.len());
	}
}
