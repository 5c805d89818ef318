#![forbid(unsafe_code)]

//! Fan-out of domain events to registered observers.
//!
//! Each observer owns a bounded queue. Publishing never waits: a full queue loses the
//! event for that observer only, and a closed queue unregisters the observer.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::DomainEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Slot {
	id: ObserverId,
	tx: mpsc::Sender<DomainEvent>,
}

pub struct ObserverRegistry {
	slots: Mutex<Vec<Slot>>,
	next_id: AtomicU64,
	capacity: usize,
}

impl ObserverRegistry {
	pub fn new(capacity: usize) -> Self {
		Self {
			slots: Mutex::new(Vec::new()),
			next_id: AtomicU64::new(1),
			capacity: capacity.max(1),
		}
	}

	/// Register a queue-backed observer. Delivery order follows registration order.
	pub fn register(&self) -> (ObserverId, mpsc::Receiver<DomainEvent>) {
		let (tx, rx) = mpsc::channel(self.capacity);
		let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
		self.slots.lock().push(Slot { id, tx });
		(id, rx)
	}

	/// Register a callback driven by its own task. Requires a tokio runtime.
	pub fn register_fn<F>(&self, mut f: F) -> ObserverId
	where
		F: FnMut(DomainEvent) + Send + 'static,
	{
		let (id, mut rx) = self.register();
		tokio::spawn(async move {
			while let Some(ev) = rx.recv().await {
				f(ev);
			}
		});
		id
	}

	pub fn unregister(&self, id: ObserverId) -> bool {
		let mut slots = self.slots.lock();
		let before = slots.len();
		slots.retain(|s| s.id != id);
		slots.len() != before
	}

	pub fn len(&self) -> usize {
		self.slots.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn publish(&self, ev: DomainEvent) {
		let kind = ev.kind();
		let mut slots = self.slots.lock();
		slots.retain(|slot| match slot.tx.try_send(ev.clone()) {
			Ok(()) => true,
			Err(TrySendError::Full(_)) => {
				metrics::counter!("streamhub_observer_dropped_total", "kind" => kind).increment(1);
				warn!(observer = slot.id.0, kind, "observer queue full; dropping event");
				true
			}
			Err(TrySendError::Closed(_)) => {
				debug!(observer = slot.id.0, "observer closed; unregistering");
				false
			}
		});
	}
}
