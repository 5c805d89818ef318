#![forbid(unsafe_code)]

//! Rolling-window limiter for outbound chat lines.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::connection::LineSink;

#[derive(Debug)]
pub struct OutboundRateLimiter {
	window: Duration,
	max_sends: usize,
	sent: VecDeque<Instant>,
	queue: VecDeque<String>,
}

impl OutboundRateLimiter {
	pub fn new(window: Duration, max_sends: usize) -> Self {
		Self {
			window,
			max_sends: max_sends.max(1),
			sent: VecDeque::new(),
			queue: VecDeque::new(),
		}
	}

	fn prune(&mut self, now: Instant) {
		while let Some(front) = self.sent.front()
			&& now.duration_since(*front) >= self.window
		{
			self.sent.pop_front();
		}
	}

	pub fn enqueue(&mut self, line: String) {
		self.queue.push_back(line);
	}

	/// Next line if the window has room; the send is recorded at `now`.
	pub fn pop_ready(&mut self, now: Instant) -> Option<String> {
		self.prune(now);
		if self.sent.len() >= self.max_sends {
			return None;
		}
		let line = self.queue.pop_front()?;
		self.sent.push_back(now);
		Some(line)
	}

	/// Put back a line whose send failed and release its slot.
	pub fn restore(&mut self, line: String) {
		self.sent.pop_back();
		self.queue.push_front(line);
	}

	/// Zero when a send is possible now.
	pub fn time_until_ready(&mut self, now: Instant) -> Duration {
		self.prune(now);
		if self.sent.len() < self.max_sends {
			return Duration::ZERO;
		}
		self.sent
			.front()
			.map(|oldest| (*oldest + self.window).saturating_duration_since(now))
			.unwrap_or(Duration::ZERO)
	}

	pub fn pending(&self) -> usize {
		self.queue.len()
	}

	pub fn sent_in_window(&mut self, now: Instant) -> usize {
		self.prune(now);
		self.sent.len()
	}

	/// Discard queued lines; send history is kept.
	pub fn clear(&mut self) {
		self.queue.clear();
	}
}

/// One send-loop drain pass. Returns the number of lines handed to the sink.
pub fn drain_outbound(limiter: &mut OutboundRateLimiter, sink: &dyn LineSink, now: Instant) -> usize {
	drain_outbound_each(limiter, sink, now, |_| {})
}

/// [`drain_outbound`], reporting each line the sink accepted.
pub fn drain_outbound_each(
	limiter: &mut OutboundRateLimiter,
	sink: &dyn LineSink,
	now: Instant,
	mut on_sent: impl FnMut(&str),
) -> usize {
	if limiter.pending() == 0 || !sink.is_live() {
		return 0;
	}

	let mut sent = 0;
	while let Some(line) = limiter.pop_ready(now) {
		if !sink.send_line(line.clone()) {
			limiter.restore(line);
			break;
		}
		on_sent(&line);
		sent += 1;
	}

	if sent > 0 {
		metrics::counter!("streamhub_outbound_sent_total").increment(sent as u64);
	}
	if limiter.pending() > 0 && sink.is_live() {
		metrics::counter!("streamhub_outbound_rate_limited_total").increment(1);
		debug!(
			pending = limiter.pending(),
			wait_ms = limiter.time_until_ready(now).as_millis() as u64,
			"outbound lines held by rate limit"
		);
	}
	sent
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicBool, Ordering};

	use parking_lot::Mutex;

	use super::*;

	#[derive(Default)]
	struct RecordingSink {
		live: AtomicBool,
		refuse: AtomicBool,
		sent: Mutex<Vec<String>>,
	}

	impl RecordingSink {
		fn live() -> Self {
			let s = Self::default();
			s.live.store(true, Ordering::SeqCst);
			s
		}
	}

	impl LineSink for RecordingSink {
		fn is_live(&self) -> bool {
			self.live.load(Ordering::SeqCst)
		}

		fn is_started(&self) -> bool {
			true
		}

		fn send_line(&self, line: String) -> bool {
			if self.refuse.load(Ordering::SeqCst) {
				return false;
			}
			self.sent.lock().push(line);
			true
		}

		fn request_reconnect(&self) {}
	}

	#[test]
	fn twenty_per_window_then_rollover() {
		let start = Instant::now();
		let mut limiter = OutboundRateLimiter::new(Duration::from_secs(30), 20);
		let sink = RecordingSink::live();

		for i in 0..25 {
			limiter.enqueue(format!("line {i}"));
		}

		assert_eq!(drain_outbound(&mut limiter, &sink, start), 20);
		assert_eq!(limiter.pending(), 5);

		for s in [1, 10, 29] {
			assert_eq!(drain_outbound(&mut limiter, &sink, start + Duration::from_secs(s)), 0);
		}
		assert_eq!(limiter.time_until_ready(start + Duration::from_secs(29)), Duration::from_secs(1));

		assert_eq!(drain_outbound(&mut limiter, &sink, start + Duration::from_secs(30)), 5);
		assert_eq!(limiter.pending(), 0);

		let sent = sink.sent.lock();
		assert_eq!(sent.len(), 25);
		assert_eq!(sent[0], "line 0");
		assert_eq!(sent[24], "line 24");
	}

	#[test]
	fn window_is_rolling() {
		let start = Instant::now();
		let mut limiter = OutboundRateLimiter::new(Duration::from_secs(30), 2);

		limiter.enqueue("a".to_string());
		limiter.enqueue("b".to_string());
		limiter.enqueue("c".to_string());

		assert_eq!(limiter.pop_ready(start).as_deref(), Some("a"));
		assert_eq!(limiter.pop_ready(start + Duration::from_secs(10)).as_deref(), Some("b"));
		assert_eq!(limiter.pop_ready(start + Duration::from_secs(20)), None);
		assert_eq!(limiter.pop_ready(start + Duration::from_secs(30)).as_deref(), Some("c"));
		assert_eq!(limiter.sent_in_window(start + Duration::from_secs(30)), 2);
	}

	#[test]
	fn nothing_leaves_while_sink_is_down() {
		let now = Instant::now();
		let mut limiter = OutboundRateLimiter::new(Duration::from_secs(30), 20);
		let sink = RecordingSink::default();

		limiter.enqueue("hello".to_string());
		assert_eq!(drain_outbound(&mut limiter, &sink, now), 0);
		assert_eq!(limiter.pending(), 1);
		assert_eq!(limiter.sent_in_window(now), 0);
	}

	#[test]
	fn refused_send_keeps_order_and_slot() {
		let now = Instant::now();
		let mut limiter = OutboundRateLimiter::new(Duration::from_secs(30), 20);
		let sink = RecordingSink::live();
		sink.refuse.store(true, Ordering::SeqCst);

		limiter.enqueue("first".to_string());
		limiter.enqueue("second".to_string());
		assert_eq!(drain_outbound(&mut limiter, &sink, now), 0);
		assert_eq!(limiter.pending(), 2);
		assert_eq!(limiter.sent_in_window(now), 0);

		sink.refuse.store(false, Ordering::SeqCst);
		assert_eq!(drain_outbound(&mut limiter, &sink, now), 2);
		assert_eq!(sink.sent.lock().as_slice(), ["first".to_string(), "second".to_string()]);
	}

	#[test]
	fn only_accepted_lines_are_reported() {
		let now = Instant::now();
		let mut limiter = OutboundRateLimiter::new(Duration::from_secs(30), 1);
		let sink = RecordingSink::live();
		limiter.enqueue("one".to_string());
		limiter.enqueue("two".to_string());

		let mut reported = Vec::new();
		assert_eq!(drain_outbound_each(&mut limiter, &sink, now, |l| reported.push(l.to_string())), 1);
		assert_eq!(reported, vec!["one".to_string()]);

		sink.refuse.store(true, Ordering::SeqCst);
		let later = now + Duration::from_secs(30);
		assert_eq!(drain_outbound_each(&mut limiter, &sink, later, |l| reported.push(l.to_string())), 0);
		assert_eq!(reported.len(), 1);
	}
}
