#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use streamhub_domain::RoomId;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CHANNEL_FOLLOW, CHANNEL_FOLLOW_VERSION};
use crate::twitch::helix::models::SubscriptionRequest;
use crate::twitch::helix::{HelixApi, HelixError};

/// A wanted subscription and, while a session holds it, its server id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
	pub room_id: RoomId,
	pub request: SubscriptionRequest,
	pub id: Option<String>,
}

#[derive(Debug, Default)]
struct State {
	session_id: Option<String>,
	by_room: BTreeMap<RoomId, Vec<Subscription>>,
}

enum Reconciled {
	Adopted(String),
	Cleared,
	Failed,
}

/// Wanted subscriptions per room, issued against whichever session is live.
pub struct SubscriptionRegistry {
	api: Arc<dyn HelixApi>,
	state: Mutex<State>,
}

impl SubscriptionRegistry {
	pub fn new(api: Arc<dyn HelixApi>) -> Self {
		Self {
			api,
			state: Mutex::new(State::default()),
		}
	}

	/// Stores the subscription unless `(room, type)` is already held; returns whether it was added.
	pub async fn add_subscription(&self, room_id: RoomId, request: SubscriptionRequest) -> bool {
		let mut state = self.state.lock().await;
		let session_id = state.session_id.clone();

		let subs = state.by_room.entry(room_id.clone()).or_default();
		if subs.iter().any(|s| s.request.kind == request.kind) {
			debug!(room_id = %room_id, kind = %request.kind, "subscription already held");
			return false;
		}

		let id = match session_id {
			Some(session_id) => self.create(&session_id, &room_id, &request).await,
			None => None,
		};
		subs.push(Subscription { room_id, request, id });
		true
	}

	pub async fn subscribe_channel_follow(&self, room_id: RoomId, moderator_user_id: &str) -> bool {
		let request = SubscriptionRequest {
			kind: CHANNEL_FOLLOW.to_string(),
			version: CHANNEL_FOLLOW_VERSION.to_string(),
			condition: BTreeMap::from([
				("broadcaster_user_id".to_string(), room_id.as_str().to_string()),
				("moderator_user_id".to_string(), moderator_user_id.to_string()),
			]),
		};
		self.add_subscription(room_id, request).await
	}

	/// Deletes what the live session holds for the room. Without a session nothing happens.
	pub async fn unsubscribe_all(&self, room_id: &RoomId) -> usize {
		let mut state = self.state.lock().await;
		if state.session_id.is_none() {
			return 0;
		}
		let Some(subs) = state.by_room.remove(room_id) else {
			return 0;
		};

		let mut deleted = 0;
		for sub in subs {
			let Some(id) = sub.id else { continue };
			match self.api.delete_subscription(&id).await {
				Ok(()) => deleted += 1,
				Err(e) => warn!(room_id = %room_id, kind = %sub.request.kind, error = %e, "delete subscription failed"),
			}
		}
		deleted
	}

	/// Replays every held subscription against a new session. Repeating the current id is a no-op.
	pub async fn on_session_established(&self, session_id: String) -> usize {
		let mut state = self.state.lock().await;
		if state.session_id.as_deref() == Some(session_id.as_str()) {
			debug!(session_id = %session_id, "session unchanged; no replay");
			return 0;
		}
		state.session_id = Some(session_id.clone());

		let mut replayed = 0;
		for subs in state.by_room.values_mut() {
			for sub in subs.iter_mut() {
				sub.id = self.create(&session_id, &sub.room_id, &sub.request).await;
				replayed += 1;
			}
		}
		info!(session_id = %session_id, replayed, "eventsub subscriptions replayed");
		replayed
	}

	/// Server ids are not portable across sessions.
	pub async fn on_session_lost(&self) {
		let mut state = self.state.lock().await;
		state.session_id = None;
		for sub in state.by_room.values_mut().flatten() {
			sub.id = None;
		}
	}

	/// Drop a revoked id; the entry stays wanted.
	pub async fn forget_subscription_id(&self, subscription_id: &str) -> bool {
		let mut state = self.state.lock().await;
		for sub in state.by_room.values_mut().flatten() {
			if sub.id.as_deref() == Some(subscription_id) {
				sub.id = None;
				return true;
			}
		}
		false
	}

	pub async fn session_id(&self) -> Option<String> {
		self.state.lock().await.session_id.clone()
	}

	pub async fn snapshot(&self) -> Vec<Subscription> {
		self.state.lock().await.by_room.values().flatten().cloned().collect()
	}

	pub async fn subscriptions_for(&self, room_id: &RoomId) -> Vec<Subscription> {
		self.state.lock().await.by_room.get(room_id).cloned().unwrap_or_default()
	}

	pub async fn clear(&self) {
		*self.state.lock().await = State::default();
	}

	async fn create(&self, session_id: &str, room_id: &RoomId, request: &SubscriptionRequest) -> Option<String> {
		for attempt in 0..2 {
			match self.api.create_subscription(session_id, request).await {
				Ok(id) => {
					debug!(room_id = %room_id, kind = %request.kind, id = %id, "subscription created");
					return Some(id);
				}
				Err(HelixError::SubscriptionConflict(_)) if attempt == 0 => match self.reconcile(session_id, request).await {
					Reconciled::Adopted(id) => return Some(id),
					Reconciled::Cleared => continue,
					Reconciled::Failed => return None,
				},
				Err(e) => {
					warn!(room_id = %room_id, kind = %request.kind, error = %e, "create subscription failed");
					return None;
				}
			}
		}
		None
	}

	async fn reconcile(&self, session_id: &str, request: &SubscriptionRequest) -> Reconciled {
		let existing = match self.api.list_subscriptions(&request.kind).await {
			Ok(list) => list,
			Err(e) => {
				warn!(kind = %request.kind, error = %e, "list subscriptions for reconcile failed");
				return Reconciled::Failed;
			}
		};

		let matching: Vec<_> = existing
			.into_iter()
			.filter(|s| s.matches_condition(&request.condition))
			.collect();
		if matching.is_empty() {
			warn!(kind = %request.kind, "conflict without a matching subscription to reconcile");
			return Reconciled::Failed;
		}

		if let Some(own) = matching.iter().find(|s| s.session_id() == Some(session_id)) {
			return Reconciled::Adopted(own.id.clone());
		}

		for stale in matching {
			if let Err(e) = self.api.delete_subscription(&stale.id).await {
				warn!(kind = %request.kind, id = %stale.id, error = %e, "delete stale subscription failed");
			}
		}
		Reconciled::Cleared
	}
}
