#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::Ordering;

use streamhub_domain::{ChannelOrigin, ChatRoom, RoomId, Transport};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use url::Url;

use super::{Inner, NOTICE_IRC_LOGIN_FAILED, NOTICE_NO_CHANNELS};
use crate::twitch::connection::{Beat, ConnectionEvent, Heartbeat};
use crate::twitch::eventsub::{self, EventSubFrame};
use crate::twitch::irc::{self, IrcMessage};
use crate::twitch::pubsub::{self, CHANNEL_TOPICS, PubSubFrame};
use crate::twitch::rate_limit::drain_outbound_each;
use crate::twitch::router::{Identity, InboundEvent, RoomRef};
use crate::{ChatMessageKind, ConnectionState, DomainEvent, connection_status};

const LOGIN_FAILURES: &[&str] = &["Login authentication failed", "Improperly formatted auth", "Invalid NICK"];

fn frame_dropped(transport: Transport, err: &anyhow::Error) {
	metrics::counter!("streamhub_frames_dropped_total", "transport" => transport.as_str()).increment(1);
	warn!(%transport, error = %format!("{err:#}"), "undecodable frame dropped");
}

/// Consume one transport's connection events in order. The receiver is handed back on shutdown.
pub(super) async fn run_handler(
	inner: Arc<Inner>,
	transport: Transport,
	mut rx: mpsc::UnboundedReceiver<ConnectionEvent>,
	mut shutdown: watch::Receiver<bool>,
) -> mpsc::UnboundedReceiver<ConnectionEvent> {
	loop {
		tokio::select! {
			biased;

			changed = shutdown.changed() => {
				if changed.is_err() || *shutdown.borrow() {
					break;
				}
			}

			ev = rx.recv() => match ev {
				Some(ev) => handle(&inner, transport, ev).await,
				None => break,
			},
		}
	}

	while let Ok(ev) = rx.try_recv() {
		handle(&inner, transport, ev).await;
	}
	debug!(%transport, "transport handler stopped");
	rx
}

async fn handle(inner: &Inner, transport: Transport, ev: ConnectionEvent) {
	match ev {
		ConnectionEvent::Opened => {
			inner.router.publish(connection_status(transport, ConnectionState::Open));
		}
		ConnectionEvent::Frame(text) => match transport {
			Transport::Irc => {
				for line in irc::split_lines(&text) {
					on_irc_line(inner, line).await;
				}
			}
			Transport::PubSub => on_pubsub_frame(inner, &text),
			Transport::EventSub => on_eventsub_frame(inner, &text).await,
			Transport::Helix => {}
		},
		ConnectionEvent::Closed(reason) => {
			debug!(%transport, ?reason, "transport closed");
			on_transport_down(inner, transport, false).await;
			inner.router.publish(connection_status(transport, ConnectionState::Closed));
		}
		ConnectionEvent::Error(e) => {
			on_transport_down(inner, transport, true).await;
			inner.router.publish(connection_status(transport, ConnectionState::Error(e)));
		}
	}
}

async fn on_transport_down(inner: &Inner, transport: Transport, failed: bool) {
	match transport {
		Transport::Irc => {
			inner.session.write().irc_login = None;
		}
		Transport::EventSub => {
			// A migration closes the old socket; the session survives it.
			let migrating = inner.eventsub_migrating.load(Ordering::SeqCst);
			if failed {
				inner.eventsub_migrating.store(false, Ordering::SeqCst);
			}
			if failed || !migrating {
				inner.subscriptions.on_session_lost().await;
			}
		}
		Transport::PubSub | Transport::Helix => {}
	}
}

async fn on_irc_line(inner: &Inner, line: &str) {
	let msg = match IrcMessage::parse(line) {
		Ok(m) => m,
		Err(e) => {
			frame_dropped(Transport::Irc, &e);
			return;
		}
	};

	match msg.command() {
		"PING" => {
			inner.send_raw(irc::PONG.to_string());
		}
		"376" => on_logged_in(inner, &msg),
		"NOTICE" => on_notice(inner, &msg).await,
		"PRIVMSG" | "USERNOTICE" => on_chat(inner, &msg),
		"JOIN" => on_join(inner, &msg),
		"PART" => on_part(inner, &msg).await,
		"ROOMSTATE" => on_room_state(inner, &msg).await,
		"GLOBALUSERSTATE" => on_global_user_state(inner, &msg),
		"CLEARCHAT" => {
			let Some(name) = msg.channel() else { return };
			inner.router.dispatch(
				Transport::Irc,
				InboundEvent::ChatCleared {
					room: RoomRef::Name(name),
					target_user_id: msg.tag("target-user-id").map(|v| v.into_owned()),
				},
			);
		}
		"CLEARMSG" => {
			let Some(name) = msg.channel() else { return };
			let Some(message_id) = msg.tag("target-msg-id") else {
				debug!(channel = %name, "CLEARMSG without target id ignored");
				return;
			};
			inner.router.dispatch(
				Transport::Irc,
				InboundEvent::MessageCleared {
					room: RoomRef::Name(name),
					message_id: message_id.into_owned(),
				},
			);
		}
		"RECONNECT" => {
			info!("irc server requested reconnect");
			inner.irc.restart();
		}
		_ => {}
	}
}

fn is_own(inner: &Inner, msg: &IrcMessage<'_>) -> bool {
	let session = inner.session.read();
	match (msg.nick(), session.irc_login.as_deref()) {
		(Some(nick), Some(login)) => nick.eq_ignore_ascii_case(login),
		_ => false,
	}
}

fn on_logged_in(inner: &Inner, msg: &IrcMessage<'_>) {
	let Some(login) = msg.param(0).filter(|l| !l.is_empty()) else {
		return;
	};
	let login = login.to_ascii_lowercase();
	inner.session.write().irc_login = Some(login.clone());
	info!(%login, "irc logged in");
	inner.router.publish(DomainEvent::LoggedIn { login });

	let mut names = inner.configured_names();
	names.extend(inner.temp_channels.lock().keys().cloned());
	names.sort();
	names.dedup();

	if names.is_empty() {
		inner.notice_once(NOTICE_NO_CHANNELS);
		return;
	}
	for name in &names {
		inner.send_raw(irc::join(name));
	}
}

async fn on_notice(inner: &Inner, msg: &IrcMessage<'_>) {
	let text = msg.trailing().unwrap_or_default();
	if LOGIN_FAILURES.iter().any(|f| text.contains(f)) {
		warn!(notice = text, "irc login rejected");
		inner.notice_once(NOTICE_IRC_LOGIN_FAILED);
		inner.irc.disconnect().await;
		return;
	}

	let Some(name) = msg.channel() else {
		debug!(notice = text, "server notice without channel");
		return;
	};
	inner.router.dispatch(
		Transport::Irc,
		InboundEvent::Chat {
			room: RoomRef::Name(name),
			author: None,
			text: text.to_string(),
			message_id: None,
			kind: ChatMessageKind::Notice,
		},
	);
}

fn on_chat(inner: &Inner, msg: &IrcMessage<'_>) {
	let Some(name) = msg.channel() else { return };
	let tag = |key: &str| msg.tag(key).map(|v| v.into_owned());

	let (login, kind) = if msg.command() == "USERNOTICE" {
		(tag("login"), ChatMessageKind::UserNotice { msg_id: tag("msg-id") })
	} else {
		(msg.nick().map(str::to_string), ChatMessageKind::Privmsg)
	};
	let author = login.map(|login| Identity::new(tag("user-id"), login, tag("display-name")));

	let text = match msg.trailing() {
		Some(t) if msg.params().len() > 1 => t.to_string(),
		_ => tag("system-msg").unwrap_or_default(),
	};

	let is_raid = matches!(&kind, ChatMessageKind::UserNotice { msg_id: Some(id) } if id == "raid");
	inner.router.dispatch(
		Transport::Irc,
		InboundEvent::Chat {
			room: RoomRef::Name(name.clone()),
			author,
			text,
			message_id: tag("id"),
			kind,
		},
	);

	if is_raid && let Some(raider) = tag("msg-param-login") {
		let viewers = tag("msg-param-viewerCount")
			.and_then(|v| v.parse::<u64>().ok())
			.unwrap_or(0);
		inner.router.dispatch(
			Transport::Irc,
			InboundEvent::Raid {
				room: RoomRef::Name(name),
				raider: Identity::new(tag("user-id"), raider, tag("msg-param-displayName")),
				viewers,
			},
		);
	}
}

/// The server never echoes our own PRIVMSG; publish it once it left the queue.
fn echo_own_line(inner: &Inner, line: &str) {
	let Ok(msg) = IrcMessage::parse(line) else {
		return;
	};
	if msg.command() != "PRIVMSG" {
		return;
	}
	let Some(name) = msg.channel() else { return };

	let author = {
		let session = inner.session.read();
		session
			.irc_login
			.clone()
			.map(|login| Identity::new(session.token_user_id.clone(), login, session.display_name.clone()))
	};
	inner.router.dispatch(
		Transport::Irc,
		InboundEvent::Chat {
			room: RoomRef::Name(name),
			author,
			text: msg.trailing().unwrap_or_default().to_string(),
			message_id: msg.tag("client-nonce").map(|v| v.into_owned()),
			kind: ChatMessageKind::Privmsg,
		},
	);
}

fn on_join(inner: &Inner, msg: &IrcMessage<'_>) {
	if !is_own(inner, msg) {
		return;
	}
	let Some(name) = msg.channel() else { return };

	let temp = inner.temp_channels.lock().get(&name).cloned();
	let (origin, can_send) = match &temp {
		Some(t) => (ChannelOrigin::from(t), t.can_send),
		None => (ChannelOrigin::Configured, inner.configured_can_send(&name).unwrap_or(false)),
	};

	let (channel, inserted) = inner.channels.insert_if_absent(name, origin, can_send);
	if inserted {
		info!(channel = %channel.name(), temporary = channel.is_temporary(), "joined channel");
		inner.router.publish(DomainEvent::Joined { channel: channel.info() });
	}
}

async fn on_part(inner: &Inner, msg: &IrcMessage<'_>) {
	if !is_own(inner, msg) {
		return;
	}
	let Some(name) = msg.channel() else { return };
	inner.temp_channels.lock().remove(&name);
	let Some(channel) = inner.channels.remove(&name) else {
		return;
	};

	channel.set_live(false, 0);
	let info = channel.info();
	inner.router.publish(DomainEvent::LiveStatus {
		channel: info.clone(),
		live: false,
		viewers: 0,
	});
	inner.router.publish(DomainEvent::Left { channel: info });
	info!(channel = %name, "left channel");

	if channel.is_temporary() || !inner.has_token_user() {
		return;
	}
	let Some(room_id) = channel.room_id() else { return };

	let removed = inner.topics.unsubscribe(&room_id);
	if !removed.is_empty() && inner.pubsub.is_live() {
		match pubsub::unlisten_frame(&removed, Some(inner.channel_token().bare_token())) {
			Ok(frame) => {
				inner.pubsub.send_text(frame);
			}
			Err(e) => warn!(error = %format!("{e:#}"), "building pubsub UNLISTEN failed"),
		}
	}
	let deleted = inner.subscriptions.unsubscribe_all(&room_id).await;
	debug!(channel = %name, topics = removed.len(), deleted, "channel subscriptions released");
}

async fn on_room_state(inner: &Inner, msg: &IrcMessage<'_>) {
	let Some(name) = msg.channel() else { return };
	let Some(room_id) = msg.tag("room-id").and_then(|id| RoomId::new(id.into_owned()).ok()) else {
		return;
	};
	let Some(channel) = inner.channels.set_room_id(&name, room_id.clone()) else {
		debug!(channel = %name, "ROOMSTATE for channel not joined");
		return;
	};
	inner.router.publish(DomainEvent::RoomStateUpdated { channel: channel.info() });

	if channel.is_temporary() {
		return;
	}
	let Some(token_user_id) = inner.session.read().token_user_id.clone() else {
		return;
	};

	let added = inner.topics.subscribe(&room_id, &name, CHANNEL_TOPICS);
	if !added.is_empty() && inner.pubsub.is_live() {
		match pubsub::listen_frame(&added, Some(inner.channel_token().bare_token())) {
			Ok(frame) => {
				inner.pubsub.send_text(frame);
			}
			Err(e) => warn!(error = %format!("{e:#}"), "building pubsub LISTEN failed"),
		}
	}
	inner.subscriptions.subscribe_channel_follow(room_id, &token_user_id).await;
}

fn on_global_user_state(inner: &Inner, msg: &IrcMessage<'_>) {
	let id = msg.tag("user-id").map(|v| v.into_owned());
	let display = msg.tag("display-name").map(|v| v.into_owned());

	let login = {
		let mut session = inner.session.write();
		if display.is_some() {
			session.display_name = display.clone();
		}
		session.irc_login.clone().or_else(|| session.token_login.clone())
	};
	if let Some(login) = login {
		inner.users.resolve(id.as_deref(), &login, display.as_deref());
	}
}

fn on_pubsub_frame(inner: &Inner, raw: &str) {
	let frame = match pubsub::decode_frame(raw) {
		Ok(f) => f,
		Err(e) => {
			frame_dropped(Transport::PubSub, &e);
			return;
		}
	};

	match frame {
		PubSubFrame::Response { nonce, error: Some(error) } => {
			warn!(?nonce, %error, "pubsub request rejected");
		}
		PubSubFrame::Response { .. } | PubSubFrame::Pong => {}
		PubSubFrame::Message { topic, message } => match pubsub::decode_topic_message(&topic, &message) {
			Ok(Some(ev)) => {
				inner.router.dispatch(Transport::PubSub, ev);
			}
			Ok(None) => debug!(%topic, "pubsub message ignored"),
			Err(e) => frame_dropped(Transport::PubSub, &e),
		},
		PubSubFrame::Reconnect => {
			info!("pubsub server requested reconnect");
			inner.pubsub.restart();
		}
		PubSubFrame::Other(kind) => debug!(%kind, "unhandled pubsub frame"),
	}
}

async fn on_eventsub_frame(inner: &Inner, raw: &str) {
	let frame = match eventsub::decode_frame(raw) {
		Ok(f) => f,
		Err(e) => {
			frame_dropped(Transport::EventSub, &e);
			return;
		}
	};

	match frame {
		EventSubFrame::Welcome { session_id, keepalive } => {
			inner.eventsub_migrating.store(false, Ordering::SeqCst);
			inner
				.eventsub
				.set_idle_timeout(keepalive.map(|k| k + inner.cfg.eventsub_keepalive_grace));
			inner.subscriptions.on_session_established(session_id).await;
		}
		EventSubFrame::Keepalive => {}
		EventSubFrame::Reconnect { url } => match Url::parse(&url) {
			Ok(url) => {
				info!(%url, "eventsub session migrating");
				inner.eventsub_migrating.store(true, Ordering::SeqCst);
				inner.eventsub.reconnect_to(url);
			}
			Err(e) => warn!(%url, error = %e, "eventsub reconnect url rejected"),
		},
		EventSubFrame::Notification { subscription_type, event } => match event {
			Some(ev) => {
				inner.router.dispatch(Transport::EventSub, ev);
			}
			None => debug!(%subscription_type, "eventsub notification ignored"),
		},
		EventSubFrame::Revocation {
			subscription_id,
			subscription_type,
			status,
		} => {
			warn!(%subscription_id, %subscription_type, %status, "eventsub subscription revoked");
			inner.subscriptions.forget_subscription_id(&subscription_id).await;
		}
		EventSubFrame::Other(kind) => debug!(%kind, "unhandled eventsub frame"),
	}
}

/// Heartbeats and the rate-limited chat queue, on one fixed tick.
pub(super) async fn send_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
	let now = Instant::now();
	let mut irc_hb = Heartbeat::new(inner.cfg.irc_ping_interval, now);
	let mut pubsub_hb = Heartbeat::new(inner.cfg.pubsub_ping_interval, now);

	let mut tick = interval(inner.cfg.send_tick);
	tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			changed = shutdown.changed() => {
				if changed.is_err() || *shutdown.borrow() {
					break;
				}
			}
			_ = tick.tick() => {
				let now = Instant::now();
				if irc_hb.tick(now, &inner.irc, irc::PING) == Beat::ReconnectRequested {
					debug!("irc heartbeat failed; reconnect requested");
				}
				if pubsub_hb.tick(now, &inner.pubsub, pubsub::ping_frame()) == Beat::ReconnectRequested {
					debug!("pubsub heartbeat failed; reconnect requested");
				}
				let mut sent = Vec::new();
				drain_outbound_each(&mut inner.outbound.lock(), &inner.irc, now, |line| sent.push(line.to_string()));
				for line in &sent {
					echo_own_line(&inner, line);
				}
			}
		}
	}
	debug!("send loop stopped");
}
