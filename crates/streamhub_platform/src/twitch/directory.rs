#![forbid(unsafe_code)]

//! Identity and joined-channel caches shared by every transport handler.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use streamhub_domain::{ChannelName, ChannelOrigin, ChatRoom, RoomId};

use crate::{ChannelInfo, UserRef};

/// Cached identity keyed by login. The follow flag lives for the process only.
#[derive(Debug)]
pub struct User {
	login: String,
	id: RwLock<Option<String>>,
	display: RwLock<String>,
	painted: RwLock<Option<String>>,
	has_followed: AtomicBool,
}

impl User {
	pub(crate) fn new(id: Option<String>, login: String, display: Option<String>) -> Self {
		let display = display.unwrap_or_else(|| login.clone());
		Self {
			login,
			id: RwLock::new(id),
			display: RwLock::new(display),
			painted: RwLock::new(None),
			has_followed: AtomicBool::new(false),
		}
	}

	pub fn login(&self) -> &str {
		&self.login
	}

	pub fn id(&self) -> Option<String> {
		self.id.read().clone()
	}

	pub fn display_name(&self) -> String {
		self.display.read().clone()
	}

	pub fn painted_name(&self) -> Option<String> {
		self.painted.read().clone()
	}

	/// Decorated name supplied by the enrichment layer.
	pub fn set_painted_name(&self, painted: Option<String>) {
		*self.painted.write() = painted;
	}

	pub fn has_followed(&self) -> bool {
		self.has_followed.load(Ordering::SeqCst)
	}

	/// Returns true exactly once per user.
	pub fn mark_followed(&self) -> bool {
		!self.has_followed.swap(true, Ordering::SeqCst)
	}

	fn enrich(&self, id: Option<&str>, display: Option<&str>) {
		if let Some(id) = id.filter(|s| !s.trim().is_empty()) {
			let mut cur = self.id.write();
			if cur.as_deref() != Some(id) {
				*cur = Some(id.to_string());
			}
		}
		if let Some(display) = display.filter(|s| !s.trim().is_empty()) {
			let mut cur = self.display.write();
			if cur.as_str() != display {
				*cur = display.to_string();
			}
		}
	}

	pub fn to_ref(&self) -> UserRef {
		UserRef {
			id: self.id(),
			login: self.login.clone(),
			display: self.display_name(),
			painted: self.painted_name(),
		}
	}
}

#[derive(Debug, Default)]
pub struct UserDirectory {
	by_login: RwLock<HashMap<String, Arc<User>>>,
}

impl UserDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert-if-absent by login; richer data fills in what an existing entry lacks.
	pub fn resolve(&self, id: Option<&str>, login: &str, display: Option<&str>) -> Option<Arc<User>> {
		let key = login.trim().to_ascii_lowercase();
		if key.is_empty() {
			return None;
		}

		if let Some(user) = self.by_login.read().get(&key) {
			user.enrich(id, display);
			return Some(user.clone());
		}

		let mut map = self.by_login.write();
		let user = map
			.entry(key.clone())
			.or_insert_with(|| {
				Arc::new(User::new(
					id.filter(|s| !s.trim().is_empty()).map(str::to_string),
					key,
					display.filter(|s| !s.trim().is_empty()).map(str::to_string),
				))
			})
			.clone();
		drop(map);
		user.enrich(id, display);
		Some(user)
	}

	pub fn get(&self, login: &str) -> Option<Arc<User>> {
		self.by_login.read().get(&login.trim().to_ascii_lowercase()).cloned()
	}

	pub fn len(&self) -> usize {
		self.by_login.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// A joined chat room.
#[derive(Debug)]
pub struct Channel {
	name: ChannelName,
	origin: ChannelOrigin,
	room_id: RwLock<Option<RoomId>>,
	can_send: AtomicBool,
	live: AtomicBool,
	viewers: AtomicU64,
	followers: Mutex<HashSet<String>>,
}

impl Channel {
	fn new(name: ChannelName, origin: ChannelOrigin, can_send: bool) -> Self {
		Self {
			name,
			origin,
			room_id: RwLock::new(None),
			can_send: AtomicBool::new(can_send),
			live: AtomicBool::new(false),
			viewers: AtomicU64::new(0),
			followers: Mutex::new(HashSet::new()),
		}
	}

	pub fn origin(&self) -> &ChannelOrigin {
		&self.origin
	}

	pub fn set_can_send(&self, can_send: bool) {
		self.can_send.store(can_send, Ordering::SeqCst);
	}

	pub fn is_live(&self) -> bool {
		self.live.load(Ordering::SeqCst)
	}

	pub fn viewers(&self) -> u64 {
		self.viewers.load(Ordering::SeqCst)
	}

	pub fn set_live(&self, live: bool, viewers: u64) {
		self.live.store(live, Ordering::SeqCst);
		self.viewers.store(viewers, Ordering::SeqCst);
	}

	/// Record a follower in the per-channel cache; false if already known.
	pub fn note_follower(&self, login: &str) -> bool {
		self.followers.lock().insert(login.to_ascii_lowercase())
	}

	pub fn is_follower(&self, login: &str) -> bool {
		self.followers.lock().contains(&login.to_ascii_lowercase())
	}

	pub fn info(&self) -> ChannelInfo {
		ChannelInfo {
			name: self.name.clone(),
			room_id: self.room_id(),
			origin: self.origin.clone(),
			can_send: ChatRoom::can_send(self),
			live: self.is_live(),
			viewers: self.viewers(),
		}
	}
}

impl ChatRoom for Channel {
	fn name(&self) -> &ChannelName {
		&self.name
	}

	fn room_id(&self) -> Option<RoomId> {
		self.room_id.read().clone()
	}

	fn can_send(&self) -> bool {
		self.can_send.load(Ordering::SeqCst)
	}

	fn is_temporary(&self) -> bool {
		self.origin.is_temporary()
	}
}

#[derive(Debug, Default)]
pub struct ChannelDirectory {
	by_name: RwLock<HashMap<ChannelName, Arc<Channel>>>,
}

impl ChannelDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the channel and whether it was newly inserted.
	pub fn insert_if_absent(&self, name: ChannelName, origin: ChannelOrigin, can_send: bool) -> (Arc<Channel>, bool) {
		let mut map = self.by_name.write();
		if let Some(existing) = map.get(&name) {
			return (existing.clone(), false);
		}
		let channel = Arc::new(Channel::new(name.clone(), origin, can_send));
		map.insert(name, channel.clone());
		(channel, true)
	}

	pub fn get_by_name(&self, name: &ChannelName) -> Option<Arc<Channel>> {
		self.by_name.read().get(name).cloned()
	}

	pub fn get_by_room_id(&self, room_id: &RoomId) -> Option<Arc<Channel>> {
		self.by_name
			.read()
			.values()
			.find(|c| c.room_id.read().as_ref() == Some(room_id))
			.cloned()
	}

	pub fn set_room_id(&self, name: &ChannelName, room_id: RoomId) -> Option<Arc<Channel>> {
		let channel = self.get_by_name(name)?;
		*channel.room_id.write() = Some(room_id);
		Some(channel)
	}

	pub fn remove(&self, name: &ChannelName) -> Option<Arc<Channel>> {
		self.by_name.write().remove(name)
	}

	pub fn drain(&self) -> Vec<Arc<Channel>> {
		let mut map = self.by_name.write();
		let mut out: Vec<Arc<Channel>> = map.drain().map(|(_, c)| c).collect();
		out.sort_by(|a, b| a.name.cmp(&b.name));
		out
	}

	pub fn joined(&self) -> Vec<Arc<Channel>> {
		let mut out: Vec<Arc<Channel>> = self.by_name.read().values().cloned().collect();
		out.sort_by(|a, b| a.name.cmp(&b.name));
		out
	}

	pub fn len(&self) -> usize {
		self.by_name.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
