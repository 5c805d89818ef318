#![forbid(unsafe_code)]

mod error;
pub mod models;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

pub use error::HelixError;
use models::{
	BanBody, BanRequest, BanResult, Clip, CreateMarkerRequest, CreatePollRequest, CreatePredictionRequest,
	CreateSubscriptionBody, CustomReward, DataResponse, EndPollRequest, EndPredictionRequest, HelixUser, HypeTrain,
	ListSubscriptionsResponse, Marker, Poll, Prediction, Stream, SubscriptionData, SubscriptionRequest, TokenValidation,
	WebsocketTransport,
};

use super::TwitchConfig;
use crate::SecretString;

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";
const STREAMS_PATH: &str = "/helix/streams";
const POLLS_PATH: &str = "/helix/polls";
const PREDICTIONS_PATH: &str = "/helix/predictions";
const HYPE_TRAIN_PATH: &str = "/helix/hypetrain/events";
const USERS_PATH: &str = "/helix/users";
const BANS_PATH: &str = "/helix/moderation/bans";
const MARKERS_PATH: &str = "/helix/streams/markers";
const CLIPS_PATH: &str = "/helix/clips";
const REWARDS_PATH: &str = "/helix/channel_points/custom_rewards";

pub const SCOPE_POLLS: &str = "channel:read:polls";
pub const SCOPE_PREDICTIONS: &str = "channel:read:predictions";
pub const SCOPE_HYPE_TRAIN: &str = "channel:read:hype_train";
pub const SCOPE_MANAGE_BANS: &str = "moderator:manage:banned_users";
pub const SCOPE_MANAGE_POLLS: &str = "channel:manage:polls";
pub const SCOPE_MANAGE_PREDICTIONS: &str = "channel:manage:predictions";
pub const SCOPE_MANAGE_BROADCAST: &str = "channel:manage:broadcast";
pub const SCOPE_CLIPS_EDIT: &str = "clips:edit";

/// REST surface used by the service, the subscription registry and the pollers.
#[async_trait]
pub trait HelixApi: Send + Sync {
	/// Validate the token; stores its scopes for later pre-checks.
	async fn validate_token(&self) -> Result<TokenValidation, HelixError>;

	async fn get_user_by_login(&self, login: &str) -> Result<Option<HelixUser>, HelixError>;

	async fn get_user_by_id(&self, user_id: &str) -> Result<Option<HelixUser>, HelixError>;

	/// `None` while offline.
	async fn get_stream(&self, user_id: &str) -> Result<Option<Stream>, HelixError>;

	async fn get_last_poll(&self, broadcaster_id: &str) -> Result<Option<Poll>, HelixError>;

	async fn get_last_prediction(&self, broadcaster_id: &str) -> Result<Option<Prediction>, HelixError>;

	async fn get_last_hype_train(&self, broadcaster_id: &str) -> Result<Option<HypeTrain>, HelixError>;

	/// Returns the server-assigned subscription id.
	async fn create_subscription(&self, session_id: &str, req: &SubscriptionRequest) -> Result<String, HelixError>;

	async fn list_subscriptions(&self, kind: &str) -> Result<Vec<SubscriptionData>, HelixError>;

	async fn delete_subscription(&self, subscription_id: &str) -> Result<(), HelixError>;

	/// Swap the bearer token. Cached scopes are dropped until the next validate.
	fn set_token(&self, token: SecretString);

	/// Permanent ban, or a timeout when `req.duration` is set.
	async fn ban_user(&self, broadcaster_id: &str, moderator_id: &str, req: BanRequest) -> Result<BanResult, HelixError>;

	/// Lifts a ban or a timeout.
	async fn unban_user(&self, broadcaster_id: &str, moderator_id: &str, user_id: &str) -> Result<(), HelixError>;

	async fn create_poll(&self, req: CreatePollRequest) -> Result<Poll, HelixError>;

	async fn end_poll(&self, req: EndPollRequest) -> Result<Poll, HelixError>;

	async fn create_prediction(&self, req: CreatePredictionRequest) -> Result<Prediction, HelixError>;

	async fn end_prediction(&self, req: EndPredictionRequest) -> Result<Prediction, HelixError>;

	/// Marker at the current position of `req.user_id`'s live stream.
	async fn create_marker(&self, req: CreateMarkerRequest) -> Result<Marker, HelixError>;

	async fn create_clip(&self, broadcaster_id: &str, has_delay: bool) -> Result<Clip, HelixError>;

	async fn get_custom_reward(&self, broadcaster_id: &str, reward_id: &str) -> Result<Option<CustomReward>, HelixError>;
}

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

fn network(label: &str, e: reqwest::Error) -> HelixError {
	HelixError::NetworkError(format!("{label}: {e}"))
}

async fn send_with_retry(req: reqwest::RequestBuilder, label: &str) -> Result<reqwest::Response, HelixError> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.map_err(|e| network(label, e))?;
	let status = resp.status();

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		debug!(label, delay_ms = delay.as_millis() as u64, "helix rate limited; retrying once");
		tokio::time::sleep(delay).await;
		return retry.send().await.map_err(|e| network(label, e));
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		return retry.send().await.map_err(|e| network(label, e));
	}

	Ok(resp)
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response, label: &str) -> Result<T, HelixError> {
	let status = resp.status();
	let body = resp.text().await.map_err(|e| network(label, e))?;

	if !status.is_success() {
		return Err(HelixError::from_status(status, label, &body));
	}

	serde_json::from_str(&body).map_err(|e| HelixError::InvalidResult(format!("{label}: {e}")))
}

fn first<T>(resp: DataResponse<T>) -> Option<T> {
	resp.data.into_iter().next()
}

fn first_or_empty<T>(resp: DataResponse<T>, label: &str) -> Result<T, HelixError> {
	first(resp).ok_or_else(|| HelixError::InvalidResult(format!("{label}: empty data")))
}

fn non_empty<'a>(value: &'a str, what: &str) -> Result<&'a str, HelixError> {
	let value = value.trim();
	if value.is_empty() {
		return Err(HelixError::InvalidRequest(format!("missing {what}")));
	}
	Ok(value)
}

async fn expect_empty(resp: reqwest::Response, label: &str) -> Result<(), HelixError> {
	let status = resp.status();
	if status.is_success() {
		return Ok(());
	}
	let body = resp.text().await.unwrap_or_default();
	Err(HelixError::from_status(status, label, &body))
}

pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	validate_url: Url,
	client_id: String,
	token: RwLock<SecretString>,
	scopes: RwLock<Vec<String>>,
}

impl HelixClient {
	pub fn new(base_url: Url, validate_url: Url, client_id: String, token: SecretString, timeout: Duration) -> anyhow::Result<Self> {
		use anyhow::Context;

		let http = reqwest::Client::builder()
			.user_agent(concat!("streamhub/", env!("CARGO_PKG_VERSION")))
			.timeout(timeout)
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			validate_url,
			client_id,
			token: RwLock::new(token),
			scopes: RwLock::new(Vec::new()),
		})
	}

	pub fn from_config(cfg: &TwitchConfig) -> anyhow::Result<Self> {
		use anyhow::Context;

		let base_url = Url::parse(&cfg.helix_base_url).context("parse helix base url")?;
		let validate_url = Url::parse(&cfg.validate_url).context("parse token validate url")?;
		Self::new(
			base_url,
			validate_url,
			cfg.client_id.clone(),
			cfg.effective_channel_token().clone(),
			cfg.helix_timeout,
		)
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		let bearer = format!("Bearer {}", self.token.read().bare_token());
		req.header("Client-Id", &self.client_id).header("Authorization", bearer)
	}

	fn url(&self, path_and_query: &str) -> Result<Url, HelixError> {
		self.base_url
			.join(path_and_query)
			.map_err(|e| HelixError::InvalidRequest(format!("join helix url {path_and_query}: {e}")))
	}

	pub fn has_scope(&self, scope: &str) -> bool {
		self.scopes.read().iter().any(|s| s.eq_ignore_ascii_case(scope))
	}

	fn require_scope(&self, scope: &str) -> Result<(), HelixError> {
		if self.has_scope(scope) {
			Ok(())
		} else {
			Err(HelixError::TokenMissingScope(scope.to_string()))
		}
	}

	async fn get<T: DeserializeOwned>(&self, path_and_query: &str, label: &'static str) -> Result<T, HelixError> {
		let url = self.url(path_and_query)?;
		let resp = send_with_retry(self.authed(self.http.get(url)), label).await?;
		read_json(resp, label).await
	}

	async fn get_user(&self, key: &str, value: &str) -> Result<Option<HelixUser>, HelixError> {
		if value.trim().is_empty() {
			return Err(HelixError::InvalidRequest(format!("empty user {key}")));
		}
		let path = format!("{USERS_PATH}?{key}={}", urlencoding::encode(value.trim()));
		let resp: DataResponse<HelixUser> = self.get(&path, "GET /helix/users").await?;
		Ok(first(resp))
	}

	/// POST/PATCH a JSON body and take the first `data` element.
	async fn send_json<B, T>(&self, method: Method, path_and_query: &str, body: &B, label: &'static str) -> Result<T, HelixError>
	where
		B: Serialize + Sync,
		T: DeserializeOwned,
	{
		let url = self.url(path_and_query)?;
		let resp = send_with_retry(self.authed(self.http.request(method, url)).json(body), label).await?;
		let data: DataResponse<T> = read_json(resp, label).await?;
		first_or_empty(data, label)
	}

	fn by_broadcaster(base: &str, broadcaster_id: &str) -> Result<String, HelixError> {
		if broadcaster_id.trim().is_empty() {
			return Err(HelixError::InvalidRequest(format!("{base}: empty broadcaster id")));
		}
		Ok(format!("{base}?broadcaster_id={}&first=1", urlencoding::encode(broadcaster_id)))
	}
}

#[async_trait]
impl HelixApi for HelixClient {
	async fn validate_token(&self) -> Result<TokenValidation, HelixError> {
		const LABEL: &str = "GET oauth2/validate";

		let auth = format!("OAuth {}", self.token.read().bare_token());
		let req = self.http.get(self.validate_url.clone()).header("Authorization", auth);
		let resp = req.send().await.map_err(|e| network(LABEL, e))?;
		let validation: TokenValidation = read_json(resp, LABEL).await?;

		*self.scopes.write() = validation.scopes.clone();
		Ok(validation)
	}

	async fn get_user_by_login(&self, login: &str) -> Result<Option<HelixUser>, HelixError> {
		self.get_user("login", &login.to_ascii_lowercase()).await
	}

	async fn get_user_by_id(&self, user_id: &str) -> Result<Option<HelixUser>, HelixError> {
		self.get_user("id", user_id).await
	}

	async fn get_stream(&self, user_id: &str) -> Result<Option<Stream>, HelixError> {
		if user_id.trim().is_empty() {
			return Err(HelixError::InvalidRequest("streams: empty user id".to_string()));
		}
		let path = format!("{STREAMS_PATH}?user_id={}&first=1", urlencoding::encode(user_id));
		let resp: DataResponse<Stream> = self.get(&path, "GET /helix/streams").await?;
		Ok(first(resp))
	}

	async fn get_last_poll(&self, broadcaster_id: &str) -> Result<Option<Poll>, HelixError> {
		self.require_scope(SCOPE_POLLS)?;
		let path = Self::by_broadcaster(POLLS_PATH, broadcaster_id)?;
		let resp: DataResponse<Poll> = self.get(&path, "GET /helix/polls").await?;
		Ok(first(resp))
	}

	async fn get_last_prediction(&self, broadcaster_id: &str) -> Result<Option<Prediction>, HelixError> {
		self.require_scope(SCOPE_PREDICTIONS)?;
		let path = Self::by_broadcaster(PREDICTIONS_PATH, broadcaster_id)?;
		let resp: DataResponse<Prediction> = self.get(&path, "GET /helix/predictions").await?;
		Ok(first(resp))
	}

	async fn get_last_hype_train(&self, broadcaster_id: &str) -> Result<Option<HypeTrain>, HelixError> {
		self.require_scope(SCOPE_HYPE_TRAIN)?;
		let path = Self::by_broadcaster(HYPE_TRAIN_PATH, broadcaster_id)?;
		let resp: DataResponse<HypeTrain> = self.get(&path, "GET /helix/hypetrain/events").await?;
		Ok(first(resp))
	}

	async fn create_subscription(&self, session_id: &str, req: &SubscriptionRequest) -> Result<String, HelixError> {
		const LABEL: &str = "POST /helix/eventsub/subscriptions";

		if session_id.is_empty() {
			return Err(HelixError::InvalidRequest("create subscription without session".to_string()));
		}

		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;
		let body = CreateSubscriptionBody {
			kind: &req.kind,
			version: &req.version,
			condition: &req.condition,
			transport: WebsocketTransport {
				method: "websocket",
				session_id,
			},
		};

		let resp = send_with_retry(self.authed(self.http.post(url)).json(&body), LABEL).await?;
		let created: DataResponse<SubscriptionData> = read_json(resp, LABEL).await?;
		first(created)
			.map(|s| s.id)
			.ok_or_else(|| HelixError::InvalidResult(format!("{LABEL}: empty data (type={})", req.kind)))
	}

	async fn list_subscriptions(&self, kind: &str) -> Result<Vec<SubscriptionData>, HelixError> {
		let mut out = Vec::new();
		let mut after: Option<String> = None;

		loop {
			let mut path = format!("{EVENTSUB_SUBSCRIPTIONS_PATH}?type={}", urlencoding::encode(kind));
			if let Some(after) = &after {
				path.push_str("&after=");
				path.push_str(&urlencoding::encode(after));
			}

			let page: ListSubscriptionsResponse = self.get(&path, "GET /helix/eventsub/subscriptions").await?;
			out.extend(page.data);

			after = page.pagination.and_then(|p| p.cursor).filter(|c| !c.is_empty());
			if after.is_none() {
				break;
			}
		}

		Ok(out)
	}

	async fn delete_subscription(&self, subscription_id: &str) -> Result<(), HelixError> {
		const LABEL: &str = "DELETE /helix/eventsub/subscriptions";

		let url = self.url(&format!(
			"{EVENTSUB_SUBSCRIPTIONS_PATH}?id={}",
			urlencoding::encode(subscription_id)
		))?;
		let resp = send_with_retry(self.authed(self.http.delete(url)), LABEL).await?;
		expect_empty(resp, LABEL).await
	}

	fn set_token(&self, token: SecretString) {
		*self.token.write() = token;
		self.scopes.write().clear();
	}

	async fn ban_user(&self, broadcaster_id: &str, moderator_id: &str, mut req: BanRequest) -> Result<BanResult, HelixError> {
		const LABEL: &str = "POST /helix/moderation/bans";

		req.validate()?;
		self.require_scope(SCOPE_MANAGE_BANS)?;
		let path = format!(
			"{BANS_PATH}?broadcaster_id={}&moderator_id={}",
			urlencoding::encode(non_empty(broadcaster_id, "broadcaster id")?),
			urlencoding::encode(non_empty(moderator_id, "moderator id")?),
		);
		self.send_json(Method::POST, &path, &BanBody { data: &req }, LABEL).await
	}

	async fn unban_user(&self, broadcaster_id: &str, moderator_id: &str, user_id: &str) -> Result<(), HelixError> {
		const LABEL: &str = "DELETE /helix/moderation/bans";

		let user_id = non_empty(user_id, "user_id")?;
		self.require_scope(SCOPE_MANAGE_BANS)?;
		let url = self.url(&format!(
			"{BANS_PATH}?broadcaster_id={}&moderator_id={}&user_id={}",
			urlencoding::encode(non_empty(broadcaster_id, "broadcaster id")?),
			urlencoding::encode(non_empty(moderator_id, "moderator id")?),
			urlencoding::encode(user_id),
		))?;
		let resp = send_with_retry(self.authed(self.http.delete(url)), LABEL).await?;
		expect_empty(resp, LABEL).await
	}

	async fn create_poll(&self, mut req: CreatePollRequest) -> Result<Poll, HelixError> {
		req.validate()?;
		self.require_scope(SCOPE_MANAGE_POLLS)?;
		self.send_json(Method::POST, POLLS_PATH, &req, "POST /helix/polls").await
	}

	async fn end_poll(&self, req: EndPollRequest) -> Result<Poll, HelixError> {
		req.validate()?;
		self.require_scope(SCOPE_MANAGE_POLLS)?;
		self.send_json(Method::PATCH, POLLS_PATH, &req, "PATCH /helix/polls").await
	}

	async fn create_prediction(&self, mut req: CreatePredictionRequest) -> Result<Prediction, HelixError> {
		req.validate()?;
		self.require_scope(SCOPE_MANAGE_PREDICTIONS)?;
		self.send_json(Method::POST, PREDICTIONS_PATH, &req, "POST /helix/predictions").await
	}

	async fn end_prediction(&self, req: EndPredictionRequest) -> Result<Prediction, HelixError> {
		req.validate()?;
		self.require_scope(SCOPE_MANAGE_PREDICTIONS)?;
		self.send_json(Method::PATCH, PREDICTIONS_PATH, &req, "PATCH /helix/predictions").await
	}

	async fn create_marker(&self, mut req: CreateMarkerRequest) -> Result<Marker, HelixError> {
		req.validate()?;
		self.require_scope(SCOPE_MANAGE_BROADCAST)?;
		self.send_json(Method::POST, MARKERS_PATH, &req, "POST /helix/streams/markers").await
	}

	async fn create_clip(&self, broadcaster_id: &str, has_delay: bool) -> Result<Clip, HelixError> {
		const LABEL: &str = "POST /helix/clips";

		let broadcaster_id = non_empty(broadcaster_id, "broadcaster id")?;
		self.require_scope(SCOPE_CLIPS_EDIT)?;
		let url = self.url(&format!(
			"{CLIPS_PATH}?broadcaster_id={}&has_delay={has_delay}",
			urlencoding::encode(broadcaster_id)
		))?;
		let resp = send_with_retry(self.authed(self.http.post(url)), LABEL).await?;
		let data: DataResponse<Clip> = read_json(resp, LABEL).await?;
		first_or_empty(data, LABEL)
	}

	async fn get_custom_reward(&self, broadcaster_id: &str, reward_id: &str) -> Result<Option<CustomReward>, HelixError> {
		let path = format!(
			"{REWARDS_PATH}?broadcaster_id={}&id={}",
			urlencoding::encode(non_empty(broadcaster_id, "broadcaster id")?),
			urlencoding::encode(non_empty(reward_id, "reward id")?),
		);
		let resp: DataResponse<CustomReward> = self.get(&path, "GET /helix/channel_points/custom_rewards").await?;
		Ok(first(resp))
	}
}
