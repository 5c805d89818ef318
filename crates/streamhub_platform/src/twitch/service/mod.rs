#![forbid(unsafe_code)]

//! Owner of every Twitch transport, cache and background loop.

mod handlers;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use streamhub_domain::{ChannelName, ChannelOrigin, ChatRoom, RoomId, Transport};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::commands::{self, Intercepted};
use super::config::{ChannelConfig, REQUIRED_SCOPES, TwitchConfig};
use super::connection::{ConnectionEvent, ConnectionManager, ConnectionSettings, HandshakeFn};
use super::directory::{Channel, ChannelDirectory, User, UserDirectory};
use super::eventsub::SubscriptionRegistry;
use super::helix::models::TokenValidation;
use super::helix::{HelixApi, HelixClient};
use super::polling::{PollingReconciler, ReconcilerIntervals};
use super::pubsub::{self, TopicRegistry};
use super::rate_limit::OutboundRateLimiter;
use super::router::DomainEventRouter;
use super::irc;
use crate::observers::ObserverRegistry;
use crate::{DomainEvent, SecretString, new_nonce, system_notice};

pub(crate) const NOTICE_TOKEN_INVALID: &str = "token invalid or expired";
pub(crate) const NOTICE_NO_CHANNELS: &str = "no channel configured";
pub(crate) const NOTICE_IRC_LOGIN_FAILED: &str = "chat login failed; check the chat token";

/// Identity learned from token validation and the IRC login.
#[derive(Debug, Default)]
pub(crate) struct Session {
	pub(crate) token_user_id: Option<String>,
	pub(crate) token_login: Option<String>,
	pub(crate) scopes: Vec<String>,
	/// Set once IRC answered `376`.
	pub(crate) irc_login: Option<String>,
	pub(crate) display_name: Option<String>,
}

/// Tokens in use; replaced by `update_credentials`.
#[derive(Debug, Clone)]
pub(crate) struct Credentials {
	pub(crate) chat: SecretString,
	/// PubSub, EventSub and Helix. Same as `chat` unless configured apart.
	pub(crate) channel: SecretString,
}

impl Credentials {
	fn new(chat: SecretString, channel: Option<SecretString>) -> Self {
		let channel = channel.filter(|c| !c.is_empty()).unwrap_or_else(|| chat.clone());
		Self { chat, channel }
	}

	fn same_as(&self, other: &Self) -> bool {
		self.chat.expose() == other.chat.expose() && self.channel.expose() == other.channel.expose()
	}
}

#[derive(Debug, Clone)]
pub(crate) struct TempChannel {
	pub(crate) group: String,
	pub(crate) prefix: String,
	pub(crate) can_send: bool,
}

pub(crate) struct Inner {
	pub(crate) cfg: TwitchConfig,
	pub(crate) helix: Arc<dyn HelixApi>,
	pub(crate) observers: Arc<ObserverRegistry>,
	pub(crate) router: Arc<DomainEventRouter>,
	pub(crate) users: Arc<UserDirectory>,
	pub(crate) channels: Arc<ChannelDirectory>,
	pub(crate) topics: Arc<TopicRegistry>,
	pub(crate) subscriptions: SubscriptionRegistry,

	pub(crate) irc: ConnectionManager,
	pub(crate) pubsub: ConnectionManager,
	pub(crate) eventsub: ConnectionManager,

	pub(crate) outbound: Mutex<OutboundRateLimiter>,
	pub(crate) credentials: Arc<RwLock<Credentials>>,
	pub(crate) session: Arc<RwLock<Session>>,
	pub(crate) configured: RwLock<Vec<ChannelConfig>>,
	pub(crate) temp_channels: Mutex<HashMap<ChannelName, TempChannel>>,
	notices: Mutex<HashSet<String>>,
	/// Set between `session_reconnect` and the next welcome.
	pub(crate) eventsub_migrating: AtomicBool,
}

impl Inner {
	/// Emit a notice at most once per distinct reason until a token validates again.
	pub(crate) fn notice_once(&self, reason: &str) -> bool {
		if !self.notices.lock().insert(reason.to_string()) {
			return false;
		}
		info!(reason, "system notice");
		self.router.publish(system_notice(reason));
		true
	}

	pub(crate) fn has_token_user(&self) -> bool {
		self.session.read().token_user_id.is_some()
	}

	pub(crate) fn channel_token(&self) -> SecretString {
		self.credentials.read().channel.clone()
	}

	pub(crate) fn configured_can_send(&self, name: &ChannelName) -> Option<bool> {
		self.configured
			.read()
			.iter()
			.find(|c| ChannelName::new(&c.name).is_ok_and(|n| &n == name))
			.map(|c| c.can_send_messages)
	}

	fn configured_names(&self) -> Vec<ChannelName> {
		let mut names: Vec<ChannelName> = self
			.configured
			.read()
			.iter()
			.filter_map(|c| match ChannelName::new(&c.name) {
				Ok(n) => Some(n),
				Err(e) => {
					warn!(channel = %c.name, error = %e, "ignoring invalid configured channel");
					None
				}
			})
			.collect();
		names.sort();
		names.dedup();
		names
	}

	fn on_token_valid(&self, v: &TokenValidation) {
		self.notices.lock().clear();
		{
			let mut session = self.session.write();
			session.token_user_id = Some(v.user_id.clone());
			session.token_login = Some(v.login.clone());
			session.scopes = v.scopes.clone();
		}
		self.users.resolve(Some(v.user_id.as_str()), &v.login, None);

		for scope in REQUIRED_SCOPES {
			if !v.scopes.iter().any(|s| s.eq_ignore_ascii_case(scope)) {
				self.notice_once(&format!("missing permission '{scope}' from token scopes"));
			}
		}
		info!(login = %v.login, user_id = %v.user_id, scopes = v.scopes.len(), "twitch token validated");
	}

	/// Raw IRC line outside the rate limiter.
	pub(crate) fn send_raw(&self, line: String) -> bool {
		self.irc.send_text(line)
	}

	/// Command answer, addressed to the token user.
	fn reply(&self, channel: &ChannelName, text: &str) {
		let text = match self.session.read().token_login.as_deref() {
			Some(login) => format!("@{login} {text}"),
			None => text.to_string(),
		};
		self.outbound.lock().enqueue(irc::privmsg(channel, &text, &new_nonce()));
	}
}

type HandlerHandle = JoinHandle<mpsc::UnboundedReceiver<ConnectionEvent>>;

struct Runtime {
	loops_shutdown: watch::Sender<bool>,
	handlers_shutdown: watch::Sender<bool>,
	send_loop: JoinHandle<()>,
	handlers: Vec<(Transport, HandlerHandle)>,
	reconciler: Option<PollingReconciler>,
}

/// Connection-event receivers waiting for the next `start()`.
#[derive(Default)]
struct Parked {
	receivers: HashMap<Transport, mpsc::UnboundedReceiver<ConnectionEvent>>,
}

pub struct TwitchService {
	inner: Arc<Inner>,
	runtime: tokio::sync::Mutex<Option<Runtime>>,
	parked: Mutex<Parked>,
}

fn parse_url(raw: &str, what: &str) -> anyhow::Result<Url> {
	Url::parse(raw).with_context(|| format!("parse {what} url '{raw}'"))
}

impl TwitchService {
	/// Build with the production Helix client.
	pub fn from_config(cfg: TwitchConfig) -> anyhow::Result<Self> {
		let helix: Arc<dyn HelixApi> = Arc::new(HelixClient::from_config(&cfg)?);
		Self::new(cfg, helix)
	}

	pub fn new(cfg: TwitchConfig, helix: Arc<dyn HelixApi>) -> anyhow::Result<Self> {
		let irc_url = parse_url(&cfg.irc_ws_url, "irc")?;
		let pubsub_url = parse_url(&cfg.pubsub_ws_url, "pubsub")?;
		let eventsub_url = parse_url(&cfg.eventsub_ws_url, "eventsub")?;

		let observers = Arc::new(ObserverRegistry::new(cfg.observer_capacity));
		let users = Arc::new(UserDirectory::new());
		let channels = Arc::new(ChannelDirectory::new());
		let router = Arc::new(DomainEventRouter::new(users.clone(), channels.clone(), observers.clone()));
		let topics = Arc::new(TopicRegistry::new());
		let session = Arc::new(RwLock::new(Session::default()));

		let settings = |url: Url, handshake: Option<HandshakeFn>| ConnectionSettings {
			url,
			reconnect_min_delay: cfg.reconnect_min_delay,
			reconnect_max_delay: cfg.reconnect_max_delay,
			idle_timeout: None,
			handshake,
			connector: cfg.ws_connector.clone(),
		};

		let credentials = Arc::new(RwLock::new(Credentials::new(
			cfg.chat_token.clone(),
			cfg.channel_token.clone(),
		)));

		let irc_handshake: HandshakeFn = {
			let credentials = credentials.clone();
			let session = session.clone();
			Arc::new(move || {
				let token = credentials.read().chat.clone();
				if token.is_empty() {
					return irc::handshake(None, &irc::anonymous_login());
				}
				let login = session.read().token_login.clone().unwrap_or_else(irc::anonymous_login);
				irc::handshake(Some(token.expose()), &login)
			})
		};

		let pubsub_handshake: HandshakeFn = {
			let credentials = credentials.clone();
			let topics = topics.clone();
			Arc::new(move || {
				let held = topics.all_wire_topics();
				if held.is_empty() {
					return Vec::new();
				}
				let token = credentials.read().channel.clone();
				match pubsub::listen_frame(&held, Some(token.bare_token())) {
					Ok(frame) => vec![frame],
					Err(e) => {
						warn!(error = %format!("{e:#}"), "building pubsub LISTEN replay failed");
						Vec::new()
					}
				}
			})
		};

		let (irc, irc_rx) = ConnectionManager::new(Transport::Irc, settings(irc_url, Some(irc_handshake)));
		let (pubsub, pubsub_rx) = ConnectionManager::new(Transport::PubSub, settings(pubsub_url, Some(pubsub_handshake)));
		let (eventsub, eventsub_rx) = ConnectionManager::new(Transport::EventSub, settings(eventsub_url, None));

		let outbound = OutboundRateLimiter::new(cfg.rate_limit_window, cfg.rate_limit_max_sends);
		let configured = cfg.channels.clone();

		let inner = Arc::new(Inner {
			helix: helix.clone(),
			observers,
			router,
			users,
			channels,
			topics,
			subscriptions: SubscriptionRegistry::new(helix),
			irc,
			pubsub,
			eventsub,
			outbound: Mutex::new(outbound),
			credentials,
			session,
			configured: RwLock::new(configured),
			temp_channels: Mutex::new(HashMap::new()),
			notices: Mutex::new(HashSet::new()),
			eventsub_migrating: AtomicBool::new(false),
			cfg,
		});

		let parked = Parked {
			receivers: HashMap::from([
				(Transport::Irc, irc_rx),
				(Transport::PubSub, pubsub_rx),
				(Transport::EventSub, eventsub_rx),
			]),
		};

		Ok(Self {
			inner,
			runtime: tokio::sync::Mutex::new(None),
			parked: Mutex::new(parked),
		})
	}

	pub fn observers(&self) -> &Arc<ObserverRegistry> {
		&self.inner.observers
	}

	pub fn users(&self) -> &Arc<UserDirectory> {
		&self.inner.users
	}

	pub fn channels(&self) -> &Arc<ChannelDirectory> {
		&self.inner.channels
	}

	pub async fn is_running(&self) -> bool {
		self.runtime.lock().await.is_some()
	}

	/// IRC login once the server accepted it.
	pub fn logged_in_as(&self) -> Option<String> {
		self.inner.session.read().irc_login.clone()
	}

	pub fn token_user_id(&self) -> Option<String> {
		self.inner.session.read().token_user_id.clone()
	}

	/// Start every loop and connect. Returns false when the token did not validate.
	pub async fn start(&self) -> bool {
		let mut runtime = self.runtime.lock().await;
		if let Some(rt) = runtime.as_ref() {
			debug!("twitch service already started");
			return rt.reconciler.is_some();
		}

		let (loops_shutdown, loops_rx) = watch::channel(false);
		let (handlers_shutdown, handlers_rx) = watch::channel(false);

		let mut handlers = Vec::new();
		{
			let mut parked = self.parked.lock();
			for transport in [Transport::Irc, Transport::PubSub, Transport::EventSub] {
				let Some(rx) = parked.receivers.remove(&transport) else {
					warn!(%transport, "connection events receiver missing; handler not started");
					continue;
				};
				let handle = tokio::spawn(handlers::run_handler(
					self.inner.clone(),
					transport,
					rx,
					handlers_rx.clone(),
				));
				handlers.push((transport, handle));
			}
		}

		let send_loop = tokio::spawn(handlers::send_loop(self.inner.clone(), loops_rx));

		let mut rt = Runtime {
			loops_shutdown,
			handlers_shutdown,
			send_loop,
			handlers,
			reconciler: None,
		};

		let validated = match self.inner.helix.validate_token().await {
			Ok(v) => {
				self.inner.on_token_valid(&v);
				true
			}
			Err(e) => {
				warn!(error = %e, "twitch token validation failed");
				self.inner.notice_once(NOTICE_TOKEN_INVALID);
				false
			}
		};

		if validated {
			self.inner.pubsub.connect();
			self.inner.irc.connect();
			self.inner.eventsub.connect();

			if let Some(user_id) = self.token_user_id()
				&& let Ok(room) = RoomId::new(user_id)
			{
				let cfg = &self.inner.cfg;
				rt.reconciler = Some(PollingReconciler::spawn(
					self.inner.helix.clone(),
					self.inner.router.clone(),
					room,
					ReconcilerIntervals {
						stream: cfg.stream_poll,
						poll: cfg.poll_poll,
						prediction: cfg.prediction_poll,
						hype_train: cfg.hype_train_poll,
					},
				));
			}
		}

		*runtime = Some(rt);
		validated
	}

	/// Ordered teardown; every joined channel is reported as left.
	pub async fn stop(&self) {
		let Some(rt) = self.runtime.lock().await.take() else {
			return;
		};
		let inner = &self.inner;

		let _ = rt.loops_shutdown.send(true);
		if let Err(e) = rt.send_loop.await {
			warn!(error = %e, "send loop join failed");
		}
		if let Some(reconciler) = rt.reconciler {
			reconciler.shutdown().await;
		}

		inner.pubsub.disconnect().await;
		inner.irc.disconnect().await;
		inner.eventsub.disconnect().await;

		let _ = rt.handlers_shutdown.send(true);
		{
			let mut returned = Vec::new();
			for (transport, handle) in rt.handlers {
				match handle.await {
					Ok(rx) => returned.push((transport, rx)),
					Err(e) => warn!(%transport, error = %e, "transport handler join failed"),
				}
			}
			let mut parked = self.parked.lock();
			for (transport, rx) in returned {
				parked.receivers.insert(transport, rx);
			}
		}

		inner.topics.clear();
		inner.subscriptions.clear().await;
		inner.outbound.lock().clear();

		for channel in inner.channels.drain() {
			channel.set_live(false, 0);
			let info = channel.info();
			inner.router.publish(DomainEvent::LiveStatus {
				channel: info.clone(),
				live: false,
				viewers: 0,
			});
			inner.router.publish(DomainEvent::Left { channel: info });
		}
		inner.temp_channels.lock().clear();

		*inner.session.write() = Session::default();
		info!("twitch service stopped");
	}

	/// Replace the tokens. A running service is stopped and started with them; returns true when that happened.
	pub async fn update_credentials(&self, chat_token: SecretString, channel_token: Option<SecretString>) -> bool {
		let next = Credentials::new(chat_token, channel_token);
		let unchanged = self.inner.credentials.read().same_as(&next);
		if unchanged {
			debug!("twitch credentials unchanged");
			return false;
		}

		let running = self.is_running().await;
		if running {
			self.stop().await;
		}
		self.inner.helix.set_token(next.channel.clone());
		*self.inner.credentials.write() = next;
		info!(restart = running, "twitch credentials updated");

		if running {
			self.start().await;
		}
		running
	}

	/// Queue a chat line. False when the channel is not joined, read-only, or IRC is not logged in.
	pub fn send_text_message(&self, channel: &str, text: &str) -> bool {
		let Ok(name) = ChannelName::new(channel) else {
			return false;
		};
		let Some(joined) = self.inner.channels.get_by_name(&name) else {
			debug!(channel = %name, "send rejected: channel not joined");
			return false;
		};
		if !joined.can_send() {
			debug!(channel = %name, "send rejected: channel is read-only");
			return false;
		}
		if self.inner.session.read().irc_login.is_none() {
			debug!(channel = %name, "send rejected: chat not logged in");
			return false;
		}
		if irc::sanitize_text(text).is_empty() {
			return false;
		}
		if let Some(intercepted) = commands::intercept(text.trim_start()) {
			return self.run_command(joined, intercepted);
		}

		self.inner.outbound.lock().enqueue(irc::privmsg(&name, text, &new_nonce()));
		true
	}

	fn run_command(&self, channel: Arc<Channel>, intercepted: Intercepted) -> bool {
		let cmd = match intercepted {
			Intercepted::Run(cmd) => cmd,
			Intercepted::Usage(usage) => {
				self.inner.reply(channel.name(), usage);
				return true;
			}
			Intercepted::Ignored => {
				debug!(channel = %channel.name(), "unknown slash command dropped");
				return true;
			}
		};
		let Ok(rt) = tokio::runtime::Handle::try_current() else {
			warn!(channel = %channel.name(), "moderation command outside a runtime dropped");
			return false;
		};

		let inner = self.inner.clone();
		rt.spawn(async move {
			let broadcaster_id = channel.room_id().map(RoomId::into_string).unwrap_or_default();
			let moderator_id = inner.session.read().token_user_id.clone().unwrap_or_default();
			let outcome = commands::execute(inner.helix.as_ref(), &broadcaster_id, &moderator_id, &cmd).await;

			inner.reply(channel.name(), &outcome.reply);
			if let Some(e) = outcome.error {
				inner.router.publish(system_notice(format!("Error: {e}")));
			}
		});
		true
	}

	pub fn join_channel(&self, channel: &str) -> bool {
		match ChannelName::new(channel) {
			Ok(name) => self.inner.send_raw(irc::join(&name)),
			Err(_) => false,
		}
	}

	pub fn part_channel(&self, channel: &str) -> bool {
		match ChannelName::new(channel) {
			Ok(name) => self.inner.send_raw(irc::part(&name)),
			Err(_) => false,
		}
	}

	/// Join a channel owned by a group; it never subscribes topics.
	pub fn join_temp_channel(&self, group: &str, channel: &str, prefix: &str, can_send: bool) -> bool {
		let Ok(name) = ChannelName::new(channel) else {
			return false;
		};
		if self.inner.configured_can_send(&name).is_some() {
			debug!(channel = %name, "temp join skipped: channel is configured");
			return false;
		}
		self.inner.temp_channels.lock().insert(
			name.clone(),
			TempChannel {
				group: group.to_string(),
				prefix: prefix.to_string(),
				can_send,
			},
		);
		self.inner.send_raw(irc::join(&name))
	}

	pub fn leave_temp_channel(&self, channel: &str) -> bool {
		let Ok(name) = ChannelName::new(channel) else {
			return false;
		};
		if !self.inner.temp_channels.lock().contains_key(&name) {
			return false;
		}
		self.inner.send_raw(irc::part(&name))
	}

	/// Part every temp channel of `group`; returns how many PARTs were sent.
	pub fn leave_all_temp_channels(&self, group: &str) -> usize {
		let names: Vec<ChannelName> = self
			.inner
			.temp_channels
			.lock()
			.iter()
			.filter(|(_, t)| t.group == group)
			.map(|(n, _)| n.clone())
			.collect();
		names
			.iter()
			.filter(|n| self.inner.send_raw(irc::part(n)))
			.count()
	}

	/// Reconcile joined channels with a new configured list.
	pub fn apply_channel_list(&self, list: Vec<ChannelConfig>) {
		*self.inner.configured.write() = list;
		let wanted = self.inner.configured_names();

		for channel in self.inner.channels.joined() {
			if channel.is_temporary() {
				continue;
			}
			match self.inner.configured_can_send(channel.name()) {
				Some(can_send) => channel.set_can_send(can_send),
				None => {
					self.inner.send_raw(irc::part(channel.name()));
				}
			}
		}

		for name in wanted {
			if self.inner.channels.get_by_name(&name).is_none() {
				self.inner.send_raw(irc::join(&name));
			}
		}
	}

	/// Cached user, filling the id from Helix when it is missing.
	pub async fn lookup_user(&self, login: &str) -> Option<Arc<User>> {
		let cached = self.inner.users.get(login);
		if let Some(user) = &cached
			&& user.id().is_some()
		{
			return cached;
		}

		match self.inner.helix.get_user_by_login(login).await {
			Ok(Some(u)) => self.inner.users.resolve(Some(u.id.as_str()), &u.login, u.display_name.as_deref()),
			Ok(None) => cached,
			Err(e) => {
				debug!(login, error = %e, "helix user lookup failed");
				cached
			}
		}
	}

	#[cfg(test)]
	pub(crate) fn inner(&self) -> &Arc<Inner> {
		&self.inner
	}
}

impl From<&TempChannel> for ChannelOrigin {
	fn from(t: &TempChannel) -> Self {
		ChannelOrigin::Temporary {
			group: t.group.clone(),
			prefix: t.prefix.clone(),
		}
	}
}
