#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use streamhub_domain::Transport;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use super::*;

async fn mk_listener() -> (TcpListener, Url) {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");
	let url = Url::parse(&format!("ws://{addr}")).expect("valid url");
	(listener, url)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
	let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
		.await
		.expect("accept in time")
		.expect("accept");
	tokio_tungstenite::accept_async(stream).await.expect("ws handshake")
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
	loop {
		let msg = timeout(Duration::from_secs(2), ws.next())
			.await
			.expect("frame in time")
			.expect("stream open")
			.expect("frame ok");
		if let Message::Text(t) = msg {
			return t.as_str().to_owned();
		}
	}
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
	timeout(Duration::from_secs(3), rx.recv())
		.await
		.expect("event in time")
		.expect("event channel open")
}

fn mk_settings(url: Url) -> ConnectionSettings {
	let mut settings = ConnectionSettings::new(url);
	settings.reconnect_min_delay = Duration::from_millis(10);
	settings.reconnect_max_delay = Duration::from_millis(50);
	settings
}

#[test]
fn backoff_grows_and_clamps() {
	let min = Duration::from_millis(500);
	let max = Duration::from_secs(30);
	assert_eq!(backoff_delay(0, min, max), min);
	assert_eq!(backoff_delay(1, min, max), Duration::from_secs(1));
	assert_eq!(backoff_delay(3, min, max), Duration::from_secs(4));
	assert_eq!(backoff_delay(10, min, max), max);
	assert_eq!(backoff_delay(u32::MAX, min, max), max);
}

#[tokio::test]
async fn handshake_precedes_queued_frames() {
	let (listener, url) = mk_listener().await;
	let mut settings = mk_settings(url);
	settings.handshake = Some(Arc::new(|| {
		vec![
			"PASS oauth:abc".to_string(),
			"NICK someone".to_string(),
			"CAP REQ :twitch.tv/tags".to_string(),
		]
	}));

	let (conn, mut events) = ConnectionManager::new(Transport::Irc, settings);
	conn.connect();
	let mut server = accept(&listener).await;

	assert_eq!(next_text(&mut server).await, "PASS oauth:abc");
	assert_eq!(next_text(&mut server).await, "NICK someone");
	assert_eq!(next_text(&mut server).await, "CAP REQ :twitch.tv/tags");
	assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);
	assert!(conn.is_live());

	assert!(conn.send_text("JOIN #foo"));
	assert_eq!(next_text(&mut server).await, "JOIN #foo");

	server.send(Message::Text("PING :tmi.twitch.tv".into())).await.expect("server send");
	assert_eq!(
		next_event(&mut events).await,
		ConnectionEvent::Frame("PING :tmi.twitch.tv".to_string())
	);

	conn.disconnect().await;
	assert!(!conn.is_live());
	assert!(!conn.is_started());
	assert_eq!(next_event(&mut events).await, ConnectionEvent::Closed(None));
}

#[tokio::test]
async fn reconnects_after_server_close() {
	let (listener, url) = mk_listener().await;
	let opens = Arc::new(AtomicUsize::new(0));
	let opens_in = opens.clone();
	let mut settings = mk_settings(url);
	settings.handshake = Some(Arc::new(move || {
		opens_in.fetch_add(1, Ordering::SeqCst);
		Vec::new()
	}));

	let (conn, mut events) = ConnectionManager::new(Transport::PubSub, settings);
	conn.connect();

	let mut first = accept(&listener).await;
	assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);
	first.close(None).await.expect("server close");

	match next_event(&mut events).await {
		ConnectionEvent::Closed(_) | ConnectionEvent::Error(_) => {}
		other => panic!("expected close, got: {other:?}"),
	}

	let _second = accept(&listener).await;
	assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);
	assert_eq!(opens.load(Ordering::SeqCst), 2);

	conn.disconnect().await;
}

#[tokio::test]
async fn connect_is_idempotent() {
	let (listener, url) = mk_listener().await;
	let (conn, mut events) = ConnectionManager::new(Transport::Irc, mk_settings(url));
	conn.connect();
	conn.connect();

	let _server = accept(&listener).await;
	assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);
	conn.connect();

	// no second socket is attempted
	let second = timeout(Duration::from_millis(200), listener.accept()).await;
	assert!(second.is_err());

	conn.disconnect().await;
}

#[tokio::test]
async fn idle_watchdog_reconnects() {
	let (listener, url) = mk_listener().await;
	let mut settings = mk_settings(url);
	settings.idle_timeout = Some(Duration::from_millis(100));

	let (conn, mut events) = ConnectionManager::new(Transport::EventSub, settings);
	conn.connect();

	let _silent = accept(&listener).await;
	assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);

	match next_event(&mut events).await {
		ConnectionEvent::Error(msg) => assert!(msg.contains("watchdog"), "unexpected error: {msg}"),
		other => panic!("expected watchdog error, got: {other:?}"),
	}

	let _second = accept(&listener).await;
	assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);
	conn.disconnect().await;
}

#[tokio::test]
async fn reconnect_to_targets_redirect_once() {
	let (primary, primary_url) = mk_listener().await;
	let (redirect, redirect_url) = mk_listener().await;

	let (conn, mut events) = ConnectionManager::new(Transport::EventSub, mk_settings(primary_url));
	conn.connect();
	let _p = accept(&primary).await;
	assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);

	conn.reconnect_to(redirect_url);
	assert_eq!(
		next_event(&mut events).await,
		ConnectionEvent::Closed(Some("restart requested".to_string()))
	);

	let mut r = accept(&redirect).await;
	assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);

	r.close(None).await.expect("close redirect");
	let _ = next_event(&mut events).await;

	// falls back to the configured endpoint
	let _p2 = accept(&primary).await;
	assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);
	conn.disconnect().await;
}

#[tokio::test]
async fn frames_sent_during_handshake_follow_it() {
	let (listener, url) = mk_listener().await;
	let slot: Arc<std::sync::OnceLock<Arc<ConnectionManager>>> = Arc::new(std::sync::OnceLock::new());

	let mut settings = mk_settings(url);
	let handshake_slot = slot.clone();
	settings.handshake = Some(Arc::new(move || {
		// a topic registered while the replay is being built
		if let Some(conn) = handshake_slot.get() {
			assert!(conn.send_text("LISTEN late"));
		}
		vec!["LISTEN replay".to_string()]
	}));

	let (conn, mut events) = ConnectionManager::new(Transport::PubSub, settings);
	let conn = Arc::new(conn);
	assert!(slot.set(conn.clone()).is_ok());
	conn.connect();

	let mut ws = accept(&listener).await;
	assert_eq!(next_text(&mut ws).await, "LISTEN replay");
	assert_eq!(next_text(&mut ws).await, "LISTEN late");
	assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);
	conn.disconnect().await;
}

#[tokio::test]
async fn reconnect_request_outside_backoff_is_kept() {
	let (listener, url) = mk_listener().await;
	drop(listener);

	let mut settings = mk_settings(url);
	settings.reconnect_min_delay = Duration::from_secs(30);
	settings.reconnect_max_delay = Duration::from_secs(60);
	let (conn, mut events) = ConnectionManager::new(Transport::Irc, settings);

	// requested before the task ever reaches its backoff wait
	conn.request_reconnect();
	conn.connect();

	assert!(matches!(next_event(&mut events).await, ConnectionEvent::Error(_)));
	assert!(matches!(next_event(&mut events).await, ConnectionEvent::Error(_)));
	assert!(
		timeout(Duration::from_millis(300), events.recv()).await.is_err(),
		"only one backoff wait is skipped"
	);
	conn.disconnect().await;
}

#[tokio::test]
async fn send_refused_while_down() {
	let (conn, _events) = ConnectionManager::new(
		Transport::Irc,
		mk_settings(Url::parse("ws://127.0.0.1:9").expect("url")),
	);
	assert!(!conn.send_text("PRIVMSG #foo :hi"));
	assert!(!conn.is_started());
}

#[derive(Default)]
struct FakeSink {
	live: AtomicBool,
	started: AtomicBool,
	sent: Mutex<Vec<String>>,
	reconnects: AtomicUsize,
}

impl LineSink for FakeSink {
	fn is_live(&self) -> bool {
		self.live.load(Ordering::SeqCst)
	}

	fn is_started(&self) -> bool {
		self.started.load(Ordering::SeqCst)
	}

	fn send_line(&self, line: String) -> bool {
		self.sent.lock().push(line);
		true
	}

	fn request_reconnect(&self) {
		self.reconnects.fetch_add(1, Ordering::SeqCst);
	}
}

#[test]
fn heartbeat_sends_when_due() {
	let now = Instant::now();
	let sink = FakeSink::default();
	sink.live.store(true, Ordering::SeqCst);
	sink.started.store(true, Ordering::SeqCst);

	let mut hb = Heartbeat::new(Duration::from_secs(60), now);
	assert_eq!(hb.tick(now, &sink, "PING"), Beat::NotDue);
	assert_eq!(hb.tick(now + Duration::from_secs(60), &sink, "PING"), Beat::Sent);
	assert_eq!(hb.tick(now + Duration::from_secs(61), &sink, "PING"), Beat::NotDue);
	assert_eq!(sink.sent.lock().as_slice(), ["PING".to_string()]);
}

#[test]
fn heartbeat_on_dead_socket_requests_reconnect() {
	let now = Instant::now();
	let sink = FakeSink::default();
	sink.started.store(true, Ordering::SeqCst);

	let mut hb = Heartbeat::new(Duration::from_secs(60), now);
	assert_eq!(
		hb.tick(now + Duration::from_secs(60), &sink, "PING"),
		Beat::ReconnectRequested
	);
	assert_eq!(sink.reconnects.load(Ordering::SeqCst), 1);
	assert!(sink.sent.lock().is_empty());
}

#[test]
fn heartbeat_ignores_unstarted_connection() {
	let now = Instant::now();
	let sink = FakeSink::default();
	let mut hb = Heartbeat::new(Duration::from_secs(1), now);
	assert_eq!(hb.tick(now + Duration::from_secs(1), &sink, "PING"), Beat::Idle);
	assert_eq!(sink.reconnects.load(Ordering::SeqCst), 0);
}
