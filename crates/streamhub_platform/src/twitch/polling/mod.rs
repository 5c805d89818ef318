#![forbid(unsafe_code)]

//! Adaptive Helix pollers for entities without push delivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use streamhub_domain::{RoomId, Transport};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::connection::BoxFuture;
use super::helix::{HelixApi, HelixError};
use super::router::{DomainEventRouter, InboundEvent};
use crate::{HypeTrain, Poll, Prediction, Stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
	pub active: Duration,
	pub idle: Duration,
}

impl PollIntervals {
	pub const fn new(active: Duration, idle: Duration) -> Self {
		Self { active, idle }
	}

	pub const fn fixed(every: Duration) -> Self {
		Self { active: every, idle: every }
	}
}

/// Latest snapshot of a polled entity, or `None` when it is absent.
#[derive(Debug, Clone, PartialEq)]
pub enum PolledUpdate {
	Stream(Option<Stream>),
	Poll(Option<Poll>),
	Prediction(Option<Prediction>),
	HypeTrain(Option<HypeTrain>),
}

pub trait PolledEntity: Sized + Clone + Send + Sync + 'static {
	type Key: PartialEq;

	const KIND: &'static str;

	/// Fields that count for change detection.
	fn significant(&self) -> Self::Key;

	/// Whether the short interval applies.
	fn is_active(&self, now: DateTime<Utc>) -> bool;

	fn fetch<'a>(api: &'a dyn HelixApi, broadcaster_id: &'a str) -> BoxFuture<'a, Result<Option<Self>, HelixError>>;

	fn into_update(snapshot: Option<Self>) -> PolledUpdate;
}

/// Presence changes always count; otherwise only significant fields are compared.
pub fn has_changed<T: PolledEntity>(prev: Option<&T>, next: Option<&T>) -> bool {
	match (prev, next) {
		(None, None) => false,
		(Some(a), Some(b)) => a.significant() != b.significant(),
		_ => true,
	}
}

impl PolledEntity for Stream {
	type Key = (String, u64, String);

	const KIND: &'static str = "stream";

	fn significant(&self) -> Self::Key {
		(self.id.clone(), self.viewer_count, self.kind.clone())
	}

	fn is_active(&self, _now: DateTime<Utc>) -> bool {
		true
	}

	fn fetch<'a>(api: &'a dyn HelixApi, broadcaster_id: &'a str) -> BoxFuture<'a, Result<Option<Self>, HelixError>> {
		api.get_stream(broadcaster_id)
	}

	fn into_update(snapshot: Option<Self>) -> PolledUpdate {
		PolledUpdate::Stream(snapshot)
	}
}

impl PolledEntity for Poll {
	/// Choices presence is part of the key so null vs present differs.
	type Key = (String, String, bool, u64);

	const KIND: &'static str = "poll";

	fn significant(&self) -> Self::Key {
		(self.id.clone(), self.status.clone(), self.choices.is_some(), self.total_votes())
	}

	fn is_active(&self, _now: DateTime<Utc>) -> bool {
		matches!(self.status.as_str(), "ACTIVE" | "COMPLETED" | "TERMINATED")
	}

	fn fetch<'a>(api: &'a dyn HelixApi, broadcaster_id: &'a str) -> BoxFuture<'a, Result<Option<Self>, HelixError>> {
		api.get_last_poll(broadcaster_id)
	}

	fn into_update(snapshot: Option<Self>) -> PolledUpdate {
		PolledUpdate::Poll(snapshot)
	}
}

impl PolledEntity for Prediction {
	type Key = (String, String, bool, u64);

	const KIND: &'static str = "prediction";

	fn significant(&self) -> Self::Key {
		(
			self.id.clone(),
			self.status.clone(),
			self.outcomes.is_some(),
			self.total_channel_points(),
		)
	}

	fn is_active(&self, _now: DateTime<Utc>) -> bool {
		self.status == "ACTIVE"
	}

	fn fetch<'a>(api: &'a dyn HelixApi, broadcaster_id: &'a str) -> BoxFuture<'a, Result<Option<Self>, HelixError>> {
		api.get_last_prediction(broadcaster_id)
	}

	fn into_update(snapshot: Option<Self>) -> PolledUpdate {
		PolledUpdate::Prediction(snapshot)
	}
}

impl PolledEntity for HypeTrain {
	type Key = (String, Option<(String, Option<DateTime<Utc>>, u32, u64)>);

	const KIND: &'static str = "hype_train";

	fn significant(&self) -> Self::Key {
		(
			self.id.clone(),
			self.event_data.as_ref().map(|d| (d.id.clone(), d.started_at, d.level, d.total)),
		)
	}

	fn is_active(&self, now: DateTime<Utc>) -> bool {
		self.expires_at().is_some_and(|at| at > now)
	}

	fn fetch<'a>(api: &'a dyn HelixApi, broadcaster_id: &'a str) -> BoxFuture<'a, Result<Option<Self>, HelixError>> {
		api.get_last_hype_train(broadcaster_id)
	}

	fn into_update(snapshot: Option<Self>) -> PolledUpdate {
		PolledUpdate::HypeTrain(snapshot)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
	Idle,
	Checking,
	Changed,
	Unchanged,
	Absent,
}

/// Per-kind snapshot state machine.
#[derive(Debug)]
pub struct Tracker<T: PolledEntity> {
	phase: PollPhase,
	snapshot: Option<T>,
	intervals: PollIntervals,
}

impl<T: PolledEntity> Tracker<T> {
	pub fn new(intervals: PollIntervals) -> Self {
		Self {
			phase: PollPhase::Idle,
			snapshot: None,
			intervals,
		}
	}

	pub fn phase(&self) -> PollPhase {
		self.phase
	}

	pub fn snapshot(&self) -> Option<&T> {
		self.snapshot.as_ref()
	}

	pub fn begin(&mut self) {
		self.phase = PollPhase::Checking;
	}

	/// Fold one fetch result in. `Some(snapshot)` means an update should fire.
	/// A failed fetch clears the snapshot; two absences in a row never fire.
	pub fn apply(&mut self, result: Result<Option<T>, HelixError>) -> Option<Option<T>> {
		match result {
			Err(_) => {
				self.snapshot = None;
				self.phase = PollPhase::Absent;
				None
			}
			Ok(next) => {
				if has_changed(self.snapshot.as_ref(), next.as_ref()) {
					self.snapshot = next.clone();
					self.phase = PollPhase::Changed;
					Some(next)
				} else {
					self.phase = PollPhase::Unchanged;
					None
				}
			}
		}
	}

	pub fn next_delay(&self, now: DateTime<Utc>) -> Duration {
		match &self.snapshot {
			Some(s) if s.is_active(now) => self.intervals.active,
			_ => self.intervals.idle,
		}
	}
}

async fn run_poller<T: PolledEntity>(
	api: Arc<dyn HelixApi>,
	router: Arc<DomainEventRouter>,
	broadcaster_id: RoomId,
	intervals: PollIntervals,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	let mut tracker = Tracker::<T>::new(intervals);

	loop {
		if *shutdown_rx.borrow() {
			break;
		}

		tracker.begin();
		let result = T::fetch(api.as_ref(), broadcaster_id.as_str()).await;
		if let Err(e) = &result {
			match e {
				HelixError::TokenMissingScope(_) => debug!(kind = T::KIND, error = %e, "poll skipped"),
				_ => warn!(kind = T::KIND, room_id = %broadcaster_id, error = %e, "poll failed"),
			}
		}

		if let Some(snapshot) = tracker.apply(result) {
			router.dispatch(
				Transport::Helix,
				InboundEvent::Polled {
					broadcaster_id: broadcaster_id.clone(),
					update: T::into_update(snapshot),
				},
			);
		}

		let delay = tracker.next_delay(Utc::now());
		tokio::select! {
			_ = shutdown_rx.changed() => {}
			_ = tokio::time::sleep(delay) => {}
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerIntervals {
	pub stream: PollIntervals,
	pub poll: PollIntervals,
	pub prediction: PollIntervals,
	pub hype_train: PollIntervals,
}

/// Owns one poll task per entity kind for the token's own channel.
pub struct PollingReconciler {
	tasks: Vec<JoinHandle<()>>,
	shutdown_tx: watch::Sender<bool>,
}

impl PollingReconciler {
	pub fn spawn(
		api: Arc<dyn HelixApi>,
		router: Arc<DomainEventRouter>,
		broadcaster_id: RoomId,
		intervals: ReconcilerIntervals,
	) -> Self {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let tasks = vec![
			tokio::spawn(run_poller::<Stream>(
				api.clone(),
				router.clone(),
				broadcaster_id.clone(),
				intervals.stream,
				shutdown_rx.clone(),
			)),
			tokio::spawn(run_poller::<Poll>(
				api.clone(),
				router.clone(),
				broadcaster_id.clone(),
				intervals.poll,
				shutdown_rx.clone(),
			)),
			tokio::spawn(run_poller::<Prediction>(
				api.clone(),
				router.clone(),
				broadcaster_id.clone(),
				intervals.prediction,
				shutdown_rx.clone(),
			)),
			tokio::spawn(run_poller::<HypeTrain>(
				api,
				router,
				broadcaster_id,
				intervals.hype_train,
				shutdown_rx,
			)),
		];

		Self { tasks, shutdown_tx }
	}

	pub async fn shutdown(self) {
		let _ = self.shutdown_tx.send(true);
		for task in self.tasks {
			let _ = task.await;
		}
	}
}
