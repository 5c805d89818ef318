#![forbid(unsafe_code)]

//! Helix REST payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::HelixError;

#[derive(Debug, Deserialize)]
pub(crate) struct DataResponse<T> {
	pub(crate) data: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenValidation {
	pub client_id: String,
	pub login: String,
	pub user_id: String,
	pub expires_in: u64,
	#[serde(default)]
	pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HelixUser {
	pub id: String,
	pub login: String,
	#[serde(default)]
	pub display_name: Option<String>,
}

/// Live stream; absent from `/helix/streams` when offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
	pub id: String,
	pub user_id: String,
	#[serde(default)]
	pub user_login: String,
	#[serde(default)]
	pub user_name: String,
	#[serde(default)]
	pub game_name: String,
	#[serde(default)]
	pub title: String,
	/// `live` or empty on error.
	#[serde(rename = "type", default)]
	pub kind: String,
	pub viewer_count: u64,
	#[serde(default)]
	pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollChoice {
	pub id: String,
	#[serde(default)]
	pub title: String,
	#[serde(default)]
	pub votes: u64,
	#[serde(default)]
	pub channel_points_votes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
	pub id: String,
	#[serde(default)]
	pub broadcaster_id: String,
	#[serde(default)]
	pub title: String,
	#[serde(default)]
	pub choices: Option<Vec<PollChoice>>,
	/// ACTIVE, COMPLETED, TERMINATED, ARCHIVED, MODERATED, INVALID.
	pub status: String,
	#[serde(default)]
	pub duration: Option<u64>,
	#[serde(default)]
	pub started_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub ended_at: Option<DateTime<Utc>>,
}

impl Poll {
	pub fn total_votes(&self) -> u64 {
		self.choices.iter().flatten().map(|c| c.votes).sum()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionOutcome {
	pub id: String,
	#[serde(default)]
	pub title: String,
	#[serde(default)]
	pub users: u64,
	#[serde(default)]
	pub channel_points: u64,
	#[serde(default)]
	pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
	pub id: String,
	#[serde(default)]
	pub broadcaster_id: String,
	#[serde(default)]
	pub title: String,
	#[serde(default)]
	pub winning_outcome_id: Option<String>,
	#[serde(default)]
	pub outcomes: Option<Vec<PredictionOutcome>>,
	/// ACTIVE, RESOLVED, CANCELED, LOCKED.
	pub status: String,
	#[serde(default)]
	pub created_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub ended_at: Option<DateTime<Utc>>,
}

impl Prediction {
	pub fn total_channel_points(&self) -> u64 {
		self.outcomes.iter().flatten().map(|o| o.channel_points).sum()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HypeTrainData {
	#[serde(default)]
	pub id: String,
	#[serde(default)]
	pub broadcaster_id: String,
	#[serde(default)]
	pub level: u32,
	#[serde(default)]
	pub total: u64,
	#[serde(default)]
	pub goal: u64,
	#[serde(default)]
	pub started_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HypeTrain {
	pub id: String,
	#[serde(default)]
	pub event_type: String,
	#[serde(default)]
	pub event_timestamp: Option<DateTime<Utc>>,
	#[serde(default)]
	pub event_data: Option<HypeTrainData>,
}

impl HypeTrain {
	pub fn expires_at(&self) -> Option<DateTime<Utc>> {
		self.event_data.as_ref().and_then(|d| d.expires_at)
	}
}

/// A subscription to create: `(type, version, conditions)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
	pub kind: String,
	pub version: String,
	pub condition: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateSubscriptionBody<'a> {
	#[serde(rename = "type")]
	pub(crate) kind: &'a str,
	pub(crate) version: &'a str,
	pub(crate) condition: &'a BTreeMap<String, String>,
	pub(crate) transport: WebsocketTransport<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct WebsocketTransport<'a> {
	pub(crate) method: &'a str,
	pub(crate) session_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListSubscriptionsResponse {
	pub(crate) data: Vec<SubscriptionData>,
	#[serde(default)]
	pub(crate) pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Pagination {
	#[serde(default)]
	pub(crate) cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionData {
	pub id: String,
	#[serde(default)]
	pub status: String,
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub version: String,
	#[serde(default)]
	pub condition: BTreeMap<String, serde_json::Value>,
	#[serde(default)]
	pub transport: Option<SubscriptionTransport>,
}

impl SubscriptionData {
	/// All requested condition pairs are present with the same value.
	pub fn matches_condition(&self, wanted: &BTreeMap<String, String>) -> bool {
		wanted
			.iter()
			.all(|(k, v)| self.condition.get(k).and_then(|x| x.as_str()) == Some(v.as_str()))
	}

	pub fn session_id(&self) -> Option<&str> {
		self.transport.as_ref().and_then(|t| t.session_id.as_deref())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionTransport {
	#[serde(default)]
	pub method: String,
	#[serde(default)]
	pub session_id: Option<String>,
}

fn truncate_chars(s: &mut String, max: usize) {
	if let Some((idx, _)) = s.char_indices().nth(max) {
		s.truncate(idx);
	}
}

fn invalid(msg: &str) -> HelixError {
	HelixError::InvalidRequest(msg.to_string())
}

fn require(value: &str, msg: &str) -> Result<(), HelixError> {
	if value.trim().is_empty() {
		return Err(invalid(msg));
	}
	Ok(())
}

pub const BAN_MAX_DURATION_SECS: u32 = 1_209_600;

/// Ban when `duration` is `None`, timeout otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BanRequest {
	pub user_id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub duration: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
}

impl BanRequest {
	pub fn ban(user_id: impl Into<String>, reason: Option<String>) -> Self {
		Self {
			user_id: user_id.into(),
			duration: None,
			reason,
		}
	}

	pub fn timeout(user_id: impl Into<String>, seconds: u32, reason: Option<String>) -> Self {
		Self {
			user_id: user_id.into(),
			duration: Some(seconds),
			reason,
		}
	}

	/// Duration is clamped to 1..=14 days and the reason to 500 chars.
	pub fn validate(&mut self) -> Result<(), HelixError> {
		require(&self.user_id, "You need at least 1 user to ban.")?;
		if let Some(d) = self.duration.as_mut() {
			*d = (*d).clamp(1, BAN_MAX_DURATION_SECS);
		}
		if let Some(reason) = self.reason.as_mut() {
			truncate_chars(reason, 500);
		}
		Ok(())
	}
}

#[derive(Debug, Serialize)]
pub(crate) struct BanBody<'a> {
	pub(crate) data: &'a BanRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BanResult {
	#[serde(default)]
	pub broadcaster_id: String,
	#[serde(default)]
	pub moderator_id: String,
	pub user_id: String,
	#[serde(default)]
	pub created_at: Option<DateTime<Utc>>,
	/// `None` for a permanent ban.
	#[serde(default)]
	pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChoiceTitle {
	pub title: String,
}

impl ChoiceTitle {
	pub fn new(title: impl Into<String>) -> Self {
		Self { title: title.into() }
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatePollRequest {
	pub broadcaster_id: String,
	pub title: String,
	pub choices: Vec<ChoiceTitle>,
	/// Seconds, 15..=1800.
	pub duration: u32,
	pub channel_points_voting_enabled: bool,
	pub channel_points_per_vote: u32,
}

impl CreatePollRequest {
	pub fn new(broadcaster_id: impl Into<String>, title: impl Into<String>, choices: &[&str], duration: u32) -> Self {
		Self {
			broadcaster_id: broadcaster_id.into(),
			title: title.into(),
			choices: choices.iter().map(|c| ChoiceTitle::new(*c)).collect(),
			duration,
			channel_points_voting_enabled: false,
			channel_points_per_vote: 0,
		}
	}

	pub fn validate(&mut self) -> Result<(), HelixError> {
		require(&self.broadcaster_id, "Missing broadcaster_id.")?;
		require(&self.title, "Title must be between 1 and 60 characters.")?;
		truncate_chars(&mut self.title, 60);
		if !(2..=5).contains(&self.choices.len()) {
			return Err(invalid("You need between 2 and 5 choices."));
		}
		if self
			.choices
			.iter()
			.any(|c| c.title.trim().is_empty() || c.title.chars().count() > 25)
		{
			return Err(invalid("Choice.Title must be between 1 and 25 characters."));
		}
		self.duration = self.duration.clamp(15, 1800);
		self.channel_points_per_vote = self.channel_points_per_vote.min(10_000);
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollEndStatus {
	/// Ends the poll; results stay visible.
	Terminated,
	/// Ends the poll and hides it.
	Archived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndPollRequest {
	pub broadcaster_id: String,
	pub id: String,
	pub status: PollEndStatus,
}

impl EndPollRequest {
	pub fn validate(&self) -> Result<(), HelixError> {
		require(&self.broadcaster_id, "Missing broadcaster_id.")?;
		require(&self.id, "Missing poll ID.")
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatePredictionRequest {
	pub broadcaster_id: String,
	pub title: String,
	pub outcomes: Vec<ChoiceTitle>,
	/// Seconds, 15..=1800.
	pub prediction_window: u32,
}

impl CreatePredictionRequest {
	pub fn new(broadcaster_id: impl Into<String>, title: impl Into<String>, outcomes: &[&str], window: u32) -> Self {
		Self {
			broadcaster_id: broadcaster_id.into(),
			title: title.into(),
			outcomes: outcomes.iter().map(|o| ChoiceTitle::new(*o)).collect(),
			prediction_window: window,
		}
	}

	pub fn validate(&mut self) -> Result<(), HelixError> {
		require(&self.broadcaster_id, "Missing broadcaster_id.")?;
		require(&self.title, "Title must be between 1 and 45 characters.")?;
		truncate_chars(&mut self.title, 45);
		if !(2..=10).contains(&self.outcomes.len()) {
			return Err(invalid("You need between 2 and 10 outcomes."));
		}
		for outcome in &mut self.outcomes {
			require(&outcome.title, "Outcome.Title must be between 1 and 25 characters.")?;
			truncate_chars(&mut outcome.title, 25);
		}
		self.prediction_window = self.prediction_window.clamp(15, 1800);
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PredictionEndStatus {
	Resolved,
	Canceled,
	Locked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndPredictionRequest {
	pub broadcaster_id: String,
	pub id: String,
	pub status: PredictionEndStatus,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub winning_outcome_id: Option<String>,
}

impl EndPredictionRequest {
	pub fn validate(&self) -> Result<(), HelixError> {
		require(&self.broadcaster_id, "Missing broadcaster_id.")?;
		require(&self.id, "Missing prediction ID.")?;
		if self.status == PredictionEndStatus::Resolved
			&& self.winning_outcome_id.as_deref().is_none_or(|w| w.trim().is_empty())
		{
			return Err(invalid("A resolved prediction needs a winning outcome."));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateMarkerRequest {
	pub user_id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
}

impl CreateMarkerRequest {
	pub fn validate(&mut self) -> Result<(), HelixError> {
		require(&self.user_id, "Missing user_id.")?;
		if let Some(d) = self.description.as_mut() {
			truncate_chars(d, 140);
		}
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Marker {
	pub id: String,
	#[serde(default)]
	pub created_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub description: String,
	#[serde(default)]
	pub position_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Clip {
	pub id: String,
	#[serde(default)]
	pub edit_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RewardImage {
	#[serde(default)]
	pub url_1x: Option<String>,
	#[serde(default)]
	pub url_2x: Option<String>,
	#[serde(default)]
	pub url_4x: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CustomReward {
	pub id: String,
	#[serde(default)]
	pub broadcaster_id: String,
	#[serde(default)]
	pub title: String,
	#[serde(default)]
	pub prompt: String,
	#[serde(default)]
	pub cost: u64,
	#[serde(default)]
	pub background_color: String,
	#[serde(default)]
	pub is_enabled: bool,
	#[serde(default)]
	pub is_paused: bool,
	#[serde(default)]
	pub is_in_stock: bool,
	#[serde(default)]
	pub is_user_input_required: bool,
	#[serde(default)]
	pub image: Option<RewardImage>,
	#[serde(default)]
	pub default_image: Option<RewardImage>,
}

impl CustomReward {
	/// Largest custom image, else the default one.
	pub fn image_url(&self) -> Option<&str> {
		[&self.image, &self.default_image]
			.into_iter()
			.flatten()
			.find_map(|i| i.url_4x.as_deref().or(i.url_2x.as_deref()).or(i.url_1x.as_deref()))
	}
}
