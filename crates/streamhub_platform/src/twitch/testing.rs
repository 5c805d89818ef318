#![forbid(unsafe_code)]

//! In-memory `HelixApi` used by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::helix::models::{
	BanRequest, BanResult, Clip, CreateMarkerRequest, CreatePollRequest, CreatePredictionRequest, CustomReward,
	EndPollRequest, EndPredictionRequest, HelixUser, Marker, PollChoice, PredictionOutcome, SubscriptionData,
	SubscriptionRequest, SubscriptionTransport, TokenValidation,
};
use super::helix::{HelixApi, HelixError};
use crate::{HypeTrain, Poll, Prediction, SecretString, Stream};

/// Scripted responses; the last one repeats once the script runs out.
pub(crate) struct Script<T: Clone> {
	queue: Mutex<VecDeque<Result<Option<T>, HelixError>>>,
	last: Mutex<Result<Option<T>, HelixError>>,
}

impl<T: Clone> Default for Script<T> {
	fn default() -> Self {
		Self {
			queue: Mutex::new(VecDeque::new()),
			last: Mutex::new(Ok(None)),
		}
	}
}

impl<T: Clone> Script<T> {
	pub(crate) fn push(&self, r: Result<Option<T>, HelixError>) {
		self.queue.lock().push_back(r);
	}

	fn next(&self) -> Result<Option<T>, HelixError> {
		match self.queue.lock().pop_front() {
			Some(r) => {
				*self.last.lock() = r.clone();
				r
			}
			None => self.last.lock().clone(),
		}
	}
}

#[derive(Default)]
pub(crate) struct FakeHelix {
	pub(crate) calls: Mutex<Vec<String>>,
	pub(crate) validation: Mutex<Option<TokenValidation>>,
	pub(crate) users: Mutex<HashMap<String, HelixUser>>,

	pub(crate) streams: Script<Stream>,
	pub(crate) polls: Script<Poll>,
	pub(crate) predictions: Script<Prediction>,
	pub(crate) hype_trains: Script<HypeTrain>,

	next_sub_id: AtomicU64,
	/// `(session_id, request, assigned id)` per successful create.
	pub(crate) created: Mutex<Vec<(String, SubscriptionRequest, String)>>,
	pub(crate) deleted: Mutex<Vec<String>>,
	/// Subscription types whose next create answers 409.
	pub(crate) conflict_once: Mutex<HashSet<String>>,
	/// What the list endpoint reports.
	pub(crate) existing: Mutex<Vec<SubscriptionData>>,

	/// Answer for the next mutation call, consumed once.
	pub(crate) mutation_error: Mutex<Option<HelixError>>,
	pub(crate) bans: Mutex<Vec<BanRequest>>,
	pub(crate) rewards: Mutex<HashMap<String, CustomReward>>,
	pub(crate) tokens: Mutex<Vec<String>>,
}

impl FakeHelix {
	pub(crate) fn with_token_user(user_id: &str, login: &str, scopes: &[&str]) -> Self {
		let fake = Self::default();
		*fake.validation.lock() = Some(TokenValidation {
			client_id: "cid".to_string(),
			login: login.to_string(),
			user_id: user_id.to_string(),
			expires_in: 3600,
			scopes: scopes.iter().map(|s| s.to_string()).collect(),
		});
		fake
	}

	fn record(&self, call: String) {
		self.calls.lock().push(call);
	}

	pub(crate) fn count(&self, prefix: &str) -> usize {
		self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
	}

	fn mutation(&self, call: String) -> Result<(), HelixError> {
		self.record(call);
		match self.mutation_error.lock().take() {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}

	pub(crate) fn existing_subscription(id: &str, req: &SubscriptionRequest, session_id: &str) -> SubscriptionData {
		SubscriptionData {
			id: id.to_string(),
			status: "enabled".to_string(),
			kind: req.kind.clone(),
			version: req.version.clone(),
			condition: req
				.condition
				.iter()
				.map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
				.collect(),
			transport: Some(SubscriptionTransport {
				method: "websocket".to_string(),
				session_id: Some(session_id.to_string()),
			}),
		}
	}
}

#[async_trait]
impl HelixApi for FakeHelix {
	async fn validate_token(&self) -> Result<TokenValidation, HelixError> {
		self.record("validate".to_string());
		self.validation
			.lock()
			.clone()
			.ok_or_else(|| HelixError::AuthorizationFailed("invalid access token".to_string()))
	}

	async fn get_user_by_login(&self, login: &str) -> Result<Option<HelixUser>, HelixError> {
		self.record(format!("user_by_login {login}"));
		if login.trim().is_empty() {
			return Err(HelixError::InvalidRequest("empty user login".to_string()));
		}
		Ok(self.users.lock().get(&login.to_ascii_lowercase()).cloned())
	}

	async fn get_user_by_id(&self, user_id: &str) -> Result<Option<HelixUser>, HelixError> {
		self.record(format!("user_by_id {user_id}"));
		Ok(self.users.lock().values().find(|u| u.id == user_id).cloned())
	}

	async fn get_stream(&self, user_id: &str) -> Result<Option<Stream>, HelixError> {
		self.record(format!("stream {user_id}"));
		self.streams.next()
	}

	async fn get_last_poll(&self, broadcaster_id: &str) -> Result<Option<Poll>, HelixError> {
		self.record(format!("poll {broadcaster_id}"));
		self.polls.next()
	}

	async fn get_last_prediction(&self, broadcaster_id: &str) -> Result<Option<Prediction>, HelixError> {
		self.record(format!("prediction {broadcaster_id}"));
		self.predictions.next()
	}

	async fn get_last_hype_train(&self, broadcaster_id: &str) -> Result<Option<HypeTrain>, HelixError> {
		self.record(format!("hype_train {broadcaster_id}"));
		self.hype_trains.next()
	}

	async fn create_subscription(&self, session_id: &str, req: &SubscriptionRequest) -> Result<String, HelixError> {
		self.record(format!("create {} {session_id}", req.kind));
		if self.conflict_once.lock().remove(&req.kind) {
			return Err(HelixError::SubscriptionConflict(format!("type={} already exists", req.kind)));
		}
		let id = format!("sub-{}", self.next_sub_id.fetch_add(1, Ordering::SeqCst) + 1);
		self.created
			.lock()
			.push((session_id.to_string(), req.clone(), id.clone()));
		Ok(id)
	}

	async fn list_subscriptions(&self, kind: &str) -> Result<Vec<SubscriptionData>, HelixError> {
		self.record(format!("list {kind}"));
		Ok(self
			.existing
			.lock()
			.iter()
			.filter(|s| s.kind == kind)
			.cloned()
			.collect())
	}

	async fn delete_subscription(&self, subscription_id: &str) -> Result<(), HelixError> {
		self.record(format!("delete {subscription_id}"));
		self.deleted.lock().push(subscription_id.to_string());
		self.existing.lock().retain(|s| s.id != subscription_id);
		Ok(())
	}

	fn set_token(&self, token: SecretString) {
		self.record("set_token".to_string());
		self.tokens.lock().push(token.bare_token().to_string());
	}

	async fn ban_user(&self, broadcaster_id: &str, moderator_id: &str, mut req: BanRequest) -> Result<BanResult, HelixError> {
		req.validate()?;
		let duration = req.duration.map_or_else(|| "-".to_string(), |d| d.to_string());
		self.mutation(format!("ban {broadcaster_id} {} {duration}", req.user_id))?;
		let result = BanResult {
			broadcaster_id: broadcaster_id.to_string(),
			moderator_id: moderator_id.to_string(),
			user_id: req.user_id.clone(),
			created_at: None,
			end_time: None,
		};
		self.bans.lock().push(req);
		Ok(result)
	}

	async fn unban_user(&self, broadcaster_id: &str, _moderator_id: &str, user_id: &str) -> Result<(), HelixError> {
		if user_id.trim().is_empty() {
			return Err(HelixError::InvalidRequest("missing user_id".to_string()));
		}
		self.mutation(format!("unban {broadcaster_id} {user_id}"))
	}

	async fn create_poll(&self, mut req: CreatePollRequest) -> Result<Poll, HelixError> {
		req.validate()?;
		self.mutation(format!("create_poll {}", req.broadcaster_id))?;
		Ok(Poll {
			id: "poll-1".to_string(),
			broadcaster_id: req.broadcaster_id,
			title: req.title,
			choices: Some(
				req.choices
					.into_iter()
					.enumerate()
					.map(|(i, c)| PollChoice {
						id: format!("choice-{}", i + 1),
						title: c.title,
						votes: 0,
						channel_points_votes: 0,
					})
					.collect(),
			),
			status: "ACTIVE".to_string(),
			duration: Some(u64::from(req.duration)),
			started_at: None,
			ended_at: None,
		})
	}

	async fn end_poll(&self, req: EndPollRequest) -> Result<Poll, HelixError> {
		req.validate()?;
		self.mutation(format!("end_poll {}", req.id))?;
		Ok(Poll {
			id: req.id,
			broadcaster_id: req.broadcaster_id,
			title: String::new(),
			choices: None,
			status: format!("{:?}", req.status).to_ascii_uppercase(),
			duration: None,
			started_at: None,
			ended_at: None,
		})
	}

	async fn create_prediction(&self, mut req: CreatePredictionRequest) -> Result<Prediction, HelixError> {
		req.validate()?;
		self.mutation(format!("create_prediction {}", req.broadcaster_id))?;
		Ok(Prediction {
			id: "prediction-1".to_string(),
			broadcaster_id: req.broadcaster_id,
			title: req.title,
			winning_outcome_id: None,
			outcomes: Some(
				req.outcomes
					.into_iter()
					.enumerate()
					.map(|(i, o)| PredictionOutcome {
						id: format!("outcome-{}", i + 1),
						title: o.title,
						users: 0,
						channel_points: 0,
						color: String::new(),
					})
					.collect(),
			),
			status: "ACTIVE".to_string(),
			created_at: None,
			ended_at: None,
		})
	}

	async fn end_prediction(&self, req: EndPredictionRequest) -> Result<Prediction, HelixError> {
		req.validate()?;
		self.mutation(format!("end_prediction {}", req.id))?;
		Ok(Prediction {
			id: req.id,
			broadcaster_id: req.broadcaster_id,
			title: String::new(),
			winning_outcome_id: req.winning_outcome_id,
			outcomes: None,
			status: format!("{:?}", req.status).to_ascii_uppercase(),
			created_at: None,
			ended_at: None,
		})
	}

	async fn create_marker(&self, mut req: CreateMarkerRequest) -> Result<Marker, HelixError> {
		req.validate()?;
		self.mutation(format!("marker {}", req.user_id))?;
		Ok(Marker {
			id: "marker-1".to_string(),
			created_at: None,
			description: req.description.unwrap_or_default(),
			position_seconds: 0,
		})
	}

	async fn create_clip(&self, broadcaster_id: &str, has_delay: bool) -> Result<Clip, HelixError> {
		self.mutation(format!("clip {broadcaster_id} {has_delay}"))?;
		Ok(Clip {
			id: "clip-1".to_string(),
			edit_url: "https://clips.twitch.tv/clip-1/edit".to_string(),
		})
	}

	async fn get_custom_reward(&self, broadcaster_id: &str, reward_id: &str) -> Result<Option<CustomReward>, HelixError> {
		self.record(format!("reward {broadcaster_id} {reward_id}"));
		Ok(self.rewards.lock().get(reward_id).cloned())
	}
}
