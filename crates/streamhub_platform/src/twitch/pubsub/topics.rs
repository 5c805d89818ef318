#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use parking_lot::Mutex;
use streamhub_domain::{ChannelName, RoomId};

use super::TOPIC_VIDEO_PLAYBACK;

/// Wire topic for a room. `video-playback` is keyed by channel name, everything else by room id.
pub fn wire_topic(topic: &str, room_id: &RoomId, channel: &ChannelName) -> String {
	if topic == TOPIC_VIDEO_PLAYBACK {
		format!("{topic}.{channel}")
	} else {
		format!("{topic}.{room_id}")
	}
}

#[derive(Debug)]
struct RoomTopics {
	channel: ChannelName,
	topics: Vec<String>,
}

impl RoomTopics {
	fn wire(&self, room_id: &RoomId) -> Vec<String> {
		self.topics.iter().map(|t| wire_topic(t, room_id, &self.channel)).collect()
	}
}

/// Topics held per room; replayed as one batch whenever PubSub reconnects.
#[derive(Debug, Default)]
pub struct TopicRegistry {
	rooms: Mutex<BTreeMap<RoomId, RoomTopics>>,
}

impl TopicRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Add topics for a room; returns the wire topics that were not held yet.
	pub fn subscribe(&self, room_id: &RoomId, channel: &ChannelName, topics: &[&str]) -> Vec<String> {
		let mut rooms = self.rooms.lock();
		let entry = rooms.entry(room_id.clone()).or_insert_with(|| RoomTopics {
			channel: channel.clone(),
			topics: Vec::new(),
		});
		entry.channel = channel.clone();

		let mut added = Vec::new();
		for topic in topics {
			if entry.topics.iter().any(|t| t == topic) {
				continue;
			}
			entry.topics.push((*topic).to_string());
			added.push(wire_topic(topic, room_id, channel));
		}
		added
	}

	/// Drop every topic of a room; returns what should be UNLISTENed.
	pub fn unsubscribe(&self, room_id: &RoomId) -> Vec<String> {
		self.rooms
			.lock()
			.remove(room_id)
			.map(|r| r.wire(room_id))
			.unwrap_or_default()
	}

	/// Every held wire topic across all rooms.
	pub fn all_wire_topics(&self) -> Vec<String> {
		self.rooms.lock().iter().flat_map(|(id, r)| r.wire(id)).collect()
	}

	pub fn topics_for(&self, room_id: &RoomId) -> Vec<String> {
		self.rooms.lock().get(room_id).map(|r| r.wire(room_id)).unwrap_or_default()
	}

	pub fn clear(&self) {
		self.rooms.lock().clear();
	}

	pub fn is_empty(&self) -> bool {
		self.rooms.lock().values().all(|r| r.topics.is_empty())
	}
}
