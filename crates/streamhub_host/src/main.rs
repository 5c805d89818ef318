#![forbid(unsafe_code)]

mod config;

use std::path::PathBuf;

use anyhow::Context as _;
use streamhub_platform::twitch::TwitchService;
use streamhub_platform::{ConnectionState, DomainEvent};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: streamhub_host [--config path]\n\
\n\
Options:\n\
\t--config   Config file (default: ~/.streamhub/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG")
		.unwrap_or_else(|_| "info,streamhub_host=debug,streamhub_platform=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn log_event(ev: &DomainEvent) {
	match ev {
		DomainEvent::Connection { transport, state } => match state {
			ConnectionState::Open => info!(%transport, "connected"),
			ConnectionState::Closed => info!(%transport, "disconnected"),
			ConnectionState::Error(e) => warn!(%transport, error = %e, "connection error"),
		},
		DomainEvent::SystemNotice { text } => warn!(%text, "notice"),
		DomainEvent::LoggedIn { login } => info!(%login, "chat logged in"),
		DomainEvent::ChatMessage(m) => debug!(
			channel = %m.channel.name,
			author = m.author.as_ref().map(|a| a.display.as_str()).unwrap_or("-"),
			text = %m.text,
			"chat"
		),
		DomainEvent::LiveStatus { channel, live, viewers } => {
			info!(channel = %channel.name, live, viewers, "live status")
		}
		DomainEvent::Follow { channel, user, origin } => {
			info!(channel = %channel.name, user = %user.display, %origin, "follow")
		}
		DomainEvent::Cheer { channel, cheer } => {
			info!(channel = %channel.name, user = %cheer.user.display, bits = cheer.bits, "cheer")
		}
		DomainEvent::Raid { channel, raider, viewers } => {
			info!(channel = %channel.name, raider = %raider.display, viewers, "raid")
		}
		other => debug!(
			kind = other.kind(),
			channel = other.channel().map(|c| c.name.as_str()).unwrap_or("-"),
			"event"
		),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let host_cfg = crate::config::load_host_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded host config (toml + env overrides)");

	init_metrics(host_cfg.metrics_bind.as_deref());

	let twitch_cfg = host_cfg.twitch.to_twitch_config()?;
	let service = TwitchService::from_config(twitch_cfg).context("build twitch service")?;

	let (observer, mut events) = service.observers().register();
	let logger = tokio::spawn(async move {
		while let Some(ev) = events.recv().await {
			log_event(&ev);
		}
	});

	if service.start().await {
		info!(channels = host_cfg.twitch.channels.len(), "twitch service started");
	} else {
		warn!("twitch token rejected; waiting for shutdown");
	}

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutting down");

	service.stop().await;
	service.observers().unregister(observer);
	if let Err(e) = logger.await {
		warn!(error = %e, "event logger task failed");
	}

	Ok(())
}
