#![forbid(unsafe_code)]

//! Single funnel from transport notifications to identity-resolved, deduplicated domain events.

use std::sync::Arc;

use parking_lot::Mutex;
use streamhub_domain::{ChannelName, RoomId, Transport};
use tracing::debug;

use super::directory::{Channel, ChannelDirectory, User, UserDirectory};
use super::polling::PolledUpdate;
use super::pubsub::{ANONYMOUS_CHEERER, RedemptionDetail, SubscriptionDetail};
use crate::observers::ObserverRegistry;
use crate::{ChatMessage, ChatMessageKind, CheerEvent, DomainEvent};

/// How an inbound event names its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomRef {
	Id(RoomId),
	Name(ChannelName),
}

/// Identity triple as delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
	pub id: Option<String>,
	pub login: String,
	pub display: Option<String>,
}

impl Identity {
	pub fn new(id: Option<String>, login: impl Into<String>, display: Option<impl Into<String>>) -> Self {
		Self {
			id: id.filter(|s| !s.trim().is_empty()),
			login: login.into(),
			display: display.map(Into::into).filter(|s: &String| !s.trim().is_empty()),
		}
	}
}

/// Raw notification, tagged by the caller with its origin transport.
#[derive(Debug, Clone)]
pub enum InboundEvent {
	Chat {
		room: RoomRef,
		author: Option<Identity>,
		text: String,
		message_id: Option<String>,
		kind: ChatMessageKind,
	},
	Follow {
		room: RoomRef,
		user: Identity,
	},
	Subscription {
		room: RoomRef,
		user: Identity,
		detail: SubscriptionDetail,
	},
	Cheer {
		room: RoomRef,
		user: Identity,
		is_anonymous: bool,
		bits: u64,
		message: Option<String>,
	},
	Redemption {
		room: RoomRef,
		user: Identity,
		detail: RedemptionDetail,
	},
	Raid {
		room: RoomRef,
		raider: Identity,
		viewers: u64,
	},
	VideoPlayback {
		channel: ChannelName,
		kind: String,
		viewers: Option<u64>,
	},
	ChatCleared {
		room: RoomRef,
		target_user_id: Option<String>,
	},
	MessageCleared {
		room: RoomRef,
		message_id: String,
	},
	Polled {
		broadcaster_id: RoomId,
		update: PolledUpdate,
	},
}

pub struct DomainEventRouter {
	users: Arc<UserDirectory>,
	channels: Arc<ChannelDirectory>,
	observers: Arc<ObserverRegistry>,
	anonymous: Arc<User>,
	ordering: [Mutex<()>; 4],
}

fn dropped(reason: &'static str, origin: Transport) {
	metrics::counter!("streamhub_events_dropped_total", "reason" => reason, "transport" => origin.as_str()).increment(1);
}

impl DomainEventRouter {
	pub fn new(users: Arc<UserDirectory>, channels: Arc<ChannelDirectory>, observers: Arc<ObserverRegistry>) -> Self {
		Self {
			users,
			channels,
			observers,
			anonymous: Arc::new(User::new(None, ANONYMOUS_CHEERER.to_string(), Some(ANONYMOUS_CHEERER.to_string()))),
			ordering: [Mutex::new(()), Mutex::new(()), Mutex::new(()), Mutex::new(())],
		}
	}

	pub fn users(&self) -> &Arc<UserDirectory> {
		&self.users
	}

	pub fn channels(&self) -> &Arc<ChannelDirectory> {
		&self.channels
	}

	/// Fixed identity used for anonymous cheers; never stored in the directory.
	pub fn anonymous_user(&self) -> &Arc<User> {
		&self.anonymous
	}

	/// Events that need no resolution (joins, notices, connection state).
	pub fn publish(&self, ev: DomainEvent) {
		metrics::counter!("streamhub_events_routed_total", "kind" => ev.kind()).increment(1);
		self.observers.publish(ev);
	}

	/// Route one event. Returns false when it was dropped.
	pub fn dispatch(&self, origin: Transport, ev: InboundEvent) -> bool {
		let _serial = self.ordering[origin.index()].lock();

		match self.resolve(origin, ev) {
			Some(out) => {
				self.publish(out);
				true
			}
			None => false,
		}
	}

	fn channel(&self, origin: Transport, room: &RoomRef) -> Option<Arc<Channel>> {
		let found = match room {
			RoomRef::Id(id) => self.channels.get_by_room_id(id),
			RoomRef::Name(name) => self.channels.get_by_name(name),
		};
		if found.is_none() {
			debug!(%origin, ?room, "event for unknown channel dropped");
			dropped("unknown_channel", origin);
		}
		found
	}

	fn user(&self, origin: Transport, who: &Identity) -> Option<Arc<User>> {
		let user = self.users.resolve(who.id.as_deref(), &who.login, who.display.as_deref());
		if user.is_none() {
			debug!(%origin, "event without login dropped");
			dropped("invalid_identity", origin);
		}
		user
	}

	fn resolve(&self, origin: Transport, ev: InboundEvent) -> Option<DomainEvent> {
		match ev {
			InboundEvent::Chat {
				room,
				author,
				text,
				message_id,
				kind,
			} => {
				let channel = self.channel(origin, &room)?;
				let author = match author {
					Some(a) => Some(self.user(origin, &a)?.to_ref()),
					None => None,
				};
				Some(DomainEvent::ChatMessage(Box::new(ChatMessage {
					channel: channel.info(),
					author,
					text,
					message_id,
					kind,
				})))
			}

			InboundEvent::Follow { room, user } => {
				let channel = self.channel(origin, &room)?;
				let user = self.user(origin, &user)?;
				channel.note_follower(user.login());
				if !user.mark_followed() {
					debug!(%origin, login = user.login(), "duplicate follow suppressed");
					dropped("duplicate_follow", origin);
					return None;
				}
				Some(DomainEvent::Follow {
					channel: channel.info(),
					user: user.to_ref(),
					origin,
				})
			}

			InboundEvent::Subscription { room, user, detail } => {
				let channel = self.channel(origin, &room)?;
				let user = self.user(origin, &user)?;
				Some(DomainEvent::Subscription {
					channel: channel.info(),
					subscription: detail.into_event(user.to_ref()),
				})
			}

			InboundEvent::Cheer {
				room,
				user,
				is_anonymous,
				bits,
				message,
			} => {
				let channel = self.channel(origin, &room)?;
				let user = if is_anonymous {
					self.anonymous.clone()
				} else {
					self.user(origin, &user)?
				};
				Some(DomainEvent::Cheer {
					channel: channel.info(),
					cheer: CheerEvent {
						user: user.to_ref(),
						bits,
						is_anonymous,
						message,
					},
				})
			}

			InboundEvent::Redemption { room, user, detail } => {
				let channel = self.channel(origin, &room)?;
				let user = self.user(origin, &user)?;
				Some(DomainEvent::Redemption {
					channel: channel.info(),
					redemption: Box::new(detail.into_redemption(user.to_ref())),
				})
			}

			InboundEvent::Raid { room, raider, viewers } => {
				let channel = self.channel(origin, &room)?;
				let raider = self.user(origin, &raider)?;
				Some(DomainEvent::Raid {
					channel: channel.info(),
					raider: raider.to_ref(),
					viewers,
				})
			}

			InboundEvent::VideoPlayback { channel, kind, viewers } => {
				let channel = self.channel(origin, &RoomRef::Name(channel))?;
				let viewers = viewers.unwrap_or(0);
				let live = kind == "stream-up" || viewers != 0;
				channel.set_live(live, viewers);
				Some(DomainEvent::LiveStatus {
					channel: channel.info(),
					live,
					viewers,
				})
			}

			InboundEvent::ChatCleared { room, target_user_id } => {
				let channel = self.channel(origin, &room)?;
				Some(DomainEvent::ChatCleared {
					channel: channel.info(),
					target_user_id,
				})
			}

			InboundEvent::MessageCleared { room, message_id } => {
				let channel = self.channel(origin, &room)?;
				Some(DomainEvent::MessageCleared {
					channel: channel.info(),
					message_id,
				})
			}

			InboundEvent::Polled { broadcaster_id, update } => match update {
				PolledUpdate::Stream(stream) => {
					let channel = self.channel(origin, &RoomRef::Id(broadcaster_id))?;
					let (live, viewers) = match &stream {
						Some(s) => (true, s.viewer_count),
						None => (false, 0),
					};
					channel.set_live(live, viewers);
					Some(DomainEvent::LiveStatus {
						channel: channel.info(),
						live,
						viewers,
					})
				}
				PolledUpdate::Poll(poll) => Some(DomainEvent::PollChanged {
					broadcaster_id,
					poll: poll.map(Box::new),
				}),
				PolledUpdate::Prediction(prediction) => Some(DomainEvent::PredictionChanged {
					broadcaster_id,
					prediction: prediction.map(Box::new),
				}),
				PolledUpdate::HypeTrain(hype_train) => Some(DomainEvent::HypeTrainChanged {
					broadcaster_id,
					hype_train: hype_train.map(Box::new),
				}),
			},
		}
	}
}
