#![forbid(unsafe_code)]

//! One persistent websocket per transport, reconnected with backoff.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use streamhub_domain::Transport;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<WsStream>> + Send + Sync>;

/// Frames sent right after the socket opens, before anything queued by callers.
pub type HandshakeFn = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// What a connection reports to its transport handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
	Opened,
	Frame(String),
	Closed(Option<String>),
	Error(String),
}

pub(crate) fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}

async fn connect_ws(url: Url) -> anyhow::Result<WsStream> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.with_context(|| format!("connect_async to {url}"))?;
	Ok(ws)
}

pub fn default_connector() -> WsConnector {
	Arc::new(|url: Url| Box::pin(connect_ws(url)) as BoxFuture<'static, anyhow::Result<WsStream>>)
}

#[derive(Clone)]
pub struct ConnectionSettings {
	pub url: Url,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub idle_timeout: Option<Duration>,
	pub handshake: Option<HandshakeFn>,
	pub connector: Option<WsConnector>,
}

impl ConnectionSettings {
	pub fn new(url: Url) -> Self {
		Self {
			url,
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			idle_timeout: None,
			handshake: None,
			connector: None,
		}
	}
}

struct Shared {
	transport: Transport,
	live: AtomicBool,
	/// 0 = no watchdog.
	idle_timeout_ms: AtomicU64,
	wake: Notify,
	restart: Notify,
	redirect: Mutex<Option<Url>>,
	events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Shared {
	fn emit(&self, ev: ConnectionEvent) {
		if self.events.send(ev).is_err() {
			debug!(transport = %self.transport, "connection event receiver dropped");
		}
	}

	fn set_live(&self, live: bool) {
		self.live.store(live, Ordering::SeqCst);
		metrics::gauge!("streamhub_connection_open", "transport" => self.transport.as_str()).set(if live { 1.0 } else { 0.0 });
	}

	fn idle_timeout(&self) -> Option<Duration> {
		match self.idle_timeout_ms.load(Ordering::Relaxed) {
			0 => None,
			ms => Some(Duration::from_millis(ms)),
		}
	}
}

struct Running {
	shutdown: watch::Sender<bool>,
	outbound: mpsc::UnboundedSender<String>,
	handle: JoinHandle<()>,
}

pub struct ConnectionManager {
	shared: Arc<Shared>,
	settings: ConnectionSettings,
	running: Mutex<Option<Running>>,
}

impl ConnectionManager {
	pub fn new(transport: Transport, settings: ConnectionSettings) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
		let (events, events_rx) = mpsc::unbounded_channel();
		let idle_ms = settings.idle_timeout.map(|d| d.as_millis() as u64).unwrap_or(0);
		let shared = Arc::new(Shared {
			transport,
			live: AtomicBool::new(false),
			idle_timeout_ms: AtomicU64::new(idle_ms),
			wake: Notify::new(),
			restart: Notify::new(),
			redirect: Mutex::new(None),
			events,
		});

		(
			Self {
				shared,
				settings,
				running: Mutex::new(None),
			},
			events_rx,
		)
	}

	pub fn transport(&self) -> Transport {
		self.shared.transport
	}

	/// Start the connection task. No-op while one is already running.
	pub fn connect(&self) {
		let mut running = self.running.lock();
		if let Some(r) = running.as_ref()
			&& !r.handle.is_finished()
		{
			return;
		}

		let (shutdown, shutdown_rx) = watch::channel(false);
		let (outbound, outbound_rx) = mpsc::unbounded_channel();
		let handle = tokio::spawn(run(self.shared.clone(), self.settings.clone(), shutdown_rx, outbound_rx));
		*running = Some(Running {
			shutdown,
			outbound,
			handle,
		});
	}

	/// Close the socket and wait for the connection task to finish.
	pub async fn disconnect(&self) {
		let running = self.running.lock().take();
		let Some(running) = running else {
			return;
		};

		let _ = running.shutdown.send(true);
		if let Err(e) = running.handle.await {
			warn!(transport = %self.shared.transport, error = %e, "connection task join failed");
		}
		self.shared.live.store(false, Ordering::SeqCst);
		*self.shared.redirect.lock() = None;
	}

	pub fn is_live(&self) -> bool {
		self.shared.live.load(Ordering::SeqCst)
	}

	/// True while a connection task exists, even if the socket is down.
	pub fn is_started(&self) -> bool {
		self.running.lock().as_ref().is_some_and(|r| !r.handle.is_finished())
	}

	/// Queue one text frame. Refused while the socket is down.
	pub fn send_text(&self, line: impl Into<String>) -> bool {
		if !self.is_live() {
			debug!(transport = %self.shared.transport, "send refused: socket not connected");
			return false;
		}
		match self.running.lock().as_ref() {
			Some(r) => r.outbound.send(line.into()).is_ok(),
			None => false,
		}
	}

	/// Cut the current backoff wait short. A request made outside the wait skips the next one.
	pub fn request_reconnect(&self) {
		self.shared.wake.notify_one();
	}

	/// Drop a live socket and reconnect immediately.
	pub fn restart(&self) {
		if self.is_live() {
			self.shared.restart.notify_one();
		} else {
			self.shared.wake.notify_one();
		}
	}

	/// Reconnect once against `url`; later attempts use the configured endpoint again.
	pub fn reconnect_to(&self, url: Url) {
		*self.shared.redirect.lock() = Some(url);
		self.restart();
	}

	pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
		let ms = timeout.map(|d| d.as_millis().max(1) as u64).unwrap_or(0);
		self.shared.idle_timeout_ms.store(ms, Ordering::Relaxed);
	}
}

enum SessionEnd {
	Shutdown,
	Closed(Option<String>),
	Failed(String),
}

async fn run(
	shared: Arc<Shared>,
	settings: ConnectionSettings,
	mut shutdown_rx: watch::Receiver<bool>,
	mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
	let transport = shared.transport;
	let connector = settings.connector.clone().unwrap_or_else(default_connector);
	let mut attempt: u32 = 0;

	loop {
		if *shutdown_rx.borrow() {
			break;
		}

		if attempt > 0 {
			let delay = backoff_delay(attempt, settings.reconnect_min_delay, settings.reconnect_max_delay);
			debug!(%transport, attempt, ?delay, "reconnecting after backoff");
			tokio::select! {
				_ = sleep(delay) => {}
				_ = shared.wake.notified() => {
					debug!(%transport, "reconnect requested; skipping backoff");
				}
				_ = shutdown_rx.changed() => break,
			}
		}

		let url = shared.redirect.lock().take().unwrap_or_else(|| settings.url.clone());
		let connected = tokio::select! {
			r = (connector)(url.clone()) => r,
			_ = shutdown_rx.changed() => break,
		};

		let mut ws = match connected {
			Ok(ws) => ws,
			Err(e) => {
				attempt = attempt.saturating_add(1);
				warn!(%transport, %url, error = %format!("{e:#}"), "connect failed");
				shared.emit(ConnectionEvent::Error(format!("{e:#}")));
				continue;
			}
		};

		// frames queued against the previous socket are stale
		while outbound_rx.try_recv().is_ok() {}

		// live before the handshake is built so frames sent meanwhile queue behind it
		shared.set_live(true);
		let handshake = settings.handshake.as_ref().map(|h| h()).unwrap_or_default();
		let mut handshake_failed = None;
		for line in handshake {
			if let Err(e) = ws.send(Message::Text(line.into())).await {
				handshake_failed = Some(e.to_string());
				break;
			}
		}
		if let Some(err) = handshake_failed {
			shared.set_live(false);
			attempt = attempt.saturating_add(1);
			warn!(%transport, error = %err, "handshake send failed");
			shared.emit(ConnectionEvent::Error(err));
			continue;
		}

		attempt = 0;
		info!(%transport, %url, "connection open");
		shared.emit(ConnectionEvent::Opened);

		let end = session(&shared, &mut ws, &mut shutdown_rx, &mut outbound_rx).await;
		shared.set_live(false);

		match end {
			SessionEnd::Shutdown => {
				let _ = ws.close(None).await;
				info!(%transport, "connection closed on shutdown");
				shared.emit(ConnectionEvent::Closed(None));
				break;
			}
			SessionEnd::Closed(reason) => {
				info!(%transport, ?reason, "connection closed");
				shared.emit(ConnectionEvent::Closed(reason));
			}
			SessionEnd::Failed(err) => {
				warn!(%transport, error = %err, "connection failed");
				shared.emit(ConnectionEvent::Error(err));
			}
		}

		attempt = attempt.saturating_add(1);
	}

	shared.set_live(false);
}

async fn session(
	shared: &Shared,
	ws: &mut WsStream,
	shutdown_rx: &mut watch::Receiver<bool>,
	outbound_rx: &mut mpsc::UnboundedReceiver<String>,
) -> SessionEnd {
	let mut last_activity = Instant::now();

	loop {
		let idle = shared.idle_timeout();
		let deadline = last_activity + idle.unwrap_or(Duration::from_secs(3600));

		tokio::select! {
			_ = shutdown_rx.changed() => return SessionEnd::Shutdown,

			_ = shared.restart.notified() => {
				let _ = ws.close(None).await;
				return SessionEnd::Closed(Some("restart requested".to_string()));
			}

			line = outbound_rx.recv() => {
				let Some(line) = line else {
					return SessionEnd::Shutdown;
				};
				if let Err(e) = ws.send(Message::Text(line.into())).await {
					return SessionEnd::Failed(format!("ws send: {e}"));
				}
			}

			msg = ws.next() => {
				let Some(msg) = msg else {
					return SessionEnd::Closed(None);
				};

				match msg {
					Err(e) => return SessionEnd::Failed(format!("ws read: {e}")),
					Ok(Message::Text(t)) => {
						last_activity = Instant::now();
						shared.emit(ConnectionEvent::Frame(t.as_str().to_owned()));
					}
					Ok(Message::Ping(p)) => {
						last_activity = Instant::now();
						if let Err(e) = ws.send(Message::Pong(p)).await {
							return SessionEnd::Failed(format!("ws pong: {e}"));
						}
					}
					Ok(Message::Pong(_)) => {
						last_activity = Instant::now();
					}
					Ok(Message::Close(frame)) => {
						return SessionEnd::Closed(frame.map(|f| f.reason.as_str().to_owned()));
					}
					Ok(_) => {}
				}
			}

			_ = sleep_until(deadline), if idle.is_some() => {
				return SessionEnd::Failed(format!("no traffic within {idle:?}; watchdog triggered"));
			}
		}
	}
}

/// Outbound side of a connection as seen by the send loop.
pub trait LineSink: Send + Sync {
	fn is_live(&self) -> bool;
	fn is_started(&self) -> bool;
	fn send_line(&self, line: String) -> bool;
	fn request_reconnect(&self);
}

impl LineSink for ConnectionManager {
	fn is_live(&self) -> bool {
		ConnectionManager::is_live(self)
	}

	fn is_started(&self) -> bool {
		ConnectionManager::is_started(self)
	}

	fn send_line(&self, line: String) -> bool {
		self.send_text(line)
	}

	fn request_reconnect(&self) {
		ConnectionManager::request_reconnect(self)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
	NotDue,
	Sent,
	/// Connection was never started; nothing to keep alive.
	Idle,
	ReconnectRequested,
}

/// Application-level keepalive driven from the send loop.
#[derive(Debug)]
pub struct Heartbeat {
	interval: Duration,
	next_due: Instant,
}

impl Heartbeat {
	pub fn new(interval: Duration, now: Instant) -> Self {
		Self {
			interval,
			next_due: now + interval,
		}
	}

	pub fn tick(&mut self, now: Instant, sink: &dyn LineSink, line: &str) -> Beat {
		if now < self.next_due {
			return Beat::NotDue;
		}
		self.next_due = now + self.interval;

		if sink.is_live() && sink.send_line(line.to_string()) {
			return Beat::Sent;
		}
		if sink.is_started() {
			sink.request_reconnect();
			return Beat::ReconnectRequested;
		}
		Beat::Idle
	}
}

#[cfg(test)]
mod tests;
