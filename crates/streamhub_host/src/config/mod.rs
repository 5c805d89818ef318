#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use streamhub_platform::SecretString;
use streamhub_platform::twitch::{ChannelConfig, DEFAULT_CLIENT_ID, TwitchConfig};
use tracing::{debug, info, warn};

/// Default config path: `~/.streamhub/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".streamhub").join("config.toml"))
}

/// Load the host config from TOML, then apply `STREAMHUB_*` env overrides.
pub fn load_host_config_from_path(path: &Path) -> anyhow::Result<HostConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = HostConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct HostConfig {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	pub twitch: TwitchSettings,
}

#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	pub client_id: Option<String>,
	/// IRC token; required.
	pub chat_token: Option<SecretString>,
	/// Token for PubSub/EventSub/Helix; falls back to `chat_token`.
	pub channel_token: Option<SecretString>,
	pub channels: Vec<ChannelConfig>,

	pub irc_ws_url: Option<String>,
	pub pubsub_ws_url: Option<String>,
	pub eventsub_ws_url: Option<String>,
	pub helix_base_url: Option<String>,

	pub reconnect_min_delay: Option<Duration>,
	pub reconnect_max_delay: Option<Duration>,

	pub rate_limit_max_sends: Option<usize>,
	pub observer_capacity: Option<usize>,
}

impl TwitchSettings {
	/// Resolve into the platform config; fails without a chat token.
	pub fn to_twitch_config(&self) -> anyhow::Result<TwitchConfig> {
		let chat_token = self
			.chat_token
			.clone()
			.ok_or_else(|| anyhow!("twitch.chat_token is required (or set STREAMHUB_TWITCH_CHAT_TOKEN)"))?;
		let client_id = self.client_id.clone().unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());

		let mut cfg = TwitchConfig::new(client_id, chat_token);
		cfg.channel_token = self.channel_token.clone();
		cfg.channels = self.channels.clone();

		if let Some(url) = self.irc_ws_url.clone() {
			cfg.irc_ws_url = url;
		}
		if let Some(url) = self.pubsub_ws_url.clone() {
			cfg.pubsub_ws_url = url;
		}
		if let Some(url) = self.eventsub_ws_url.clone() {
			cfg.eventsub_ws_url = url;
		}
		if let Some(url) = self.helix_base_url.clone() {
			cfg.helix_base_url = url;
		}
		if let Some(min) = self.reconnect_min_delay {
			cfg.reconnect_min_delay = min;
		}
		if let Some(max) = self.reconnect_max_delay {
			cfg.reconnect_max_delay = max;
		}
		if let Some(max) = self.rate_limit_max_sends {
			cfg.rate_limit_max_sends = max;
		}
		if let Some(capacity) = self.observer_capacity {
			cfg.observer_capacity = capacity;
		}
		Ok(cfg)
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	metrics_bind: Option<String>,

	#[serde(default)]
	twitch: FileTwitchSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	chat_token: Option<String>,
	channel_token: Option<String>,

	#[serde(default)]
	channels: Vec<FileChannel>,

	irc_ws_url: Option<String>,
	pubsub_ws_url: Option<String>,
	eventsub_ws_url: Option<String>,
	helix_base_url: Option<String>,

	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,

	rate_limit_max_sends: Option<usize>,
	observer_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileChannel {
	name: String,
	#[serde(default)]
	can_send_messages: bool,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl HostConfig {
	fn from_file(file: FileConfig) -> Self {
		let t = file.twitch;
		let channels = t
			.channels
			.into_iter()
			.filter(|c| !c.name.trim().is_empty())
			.map(|c| ChannelConfig::new(c.name.trim(), c.can_send_messages))
			.collect();

		Self {
			metrics_bind: non_empty(file.metrics_bind),
			twitch: TwitchSettings {
				client_id: non_empty(t.client_id),
				chat_token: non_empty(t.chat_token).map(SecretString::new),
				channel_token: non_empty(t.channel_token).map(SecretString::new),
				channels,
				irc_ws_url: non_empty(t.irc_ws_url),
				pubsub_ws_url: non_empty(t.pubsub_ws_url),
				eventsub_ws_url: non_empty(t.eventsub_ws_url),
				helix_base_url: non_empty(t.helix_base_url),
				reconnect_min_delay: t.reconnect_min_delay_ms.map(Duration::from_millis),
				reconnect_max_delay: t.reconnect_max_delay_ms.map(Duration::from_millis),
				rate_limit_max_sends: t.rate_limit_max_sends.filter(|v| *v > 0),
				observer_capacity: t.observer_capacity.filter(|v| *v > 0),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut HostConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| non_empty(env(key));

	if let Some(v) = var("STREAMHUB_METRICS_BIND") {
		cfg.metrics_bind = Some(v);
		info!("host config: metrics_bind overridden by env");
	}

	if let Some(v) = var("STREAMHUB_TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = var("STREAMHUB_TWITCH_CHAT_TOKEN") {
		cfg.twitch.chat_token = Some(SecretString::new(v));
		info!("twitch config: chat_token overridden by env");
	}

	if let Some(v) = var("STREAMHUB_TWITCH_CHANNEL_TOKEN") {
		cfg.twitch.channel_token = Some(SecretString::new(v));
		info!("twitch config: channel_token overridden by env");
	}

	if let Some(v) = var("STREAMHUB_TWITCH_CHANNELS") {
		let can_send = var("STREAMHUB_TWITCH_CHANNELS_CAN_SEND")
			.and_then(|v| parse_env_bool(&v))
			.unwrap_or(false);
		cfg.twitch.channels = v
			.split(',')
			.map(str::trim)
			.filter(|n| !n.is_empty())
			.map(|n| ChannelConfig::new(n, can_send))
			.collect();
		info!(
			channels = cfg.twitch.channels.len(),
			can_send, "twitch config: channels overridden by env"
		);
	}

	if let Some(v) = var("STREAMHUB_TWITCH_IRC_WS_URL") {
		cfg.twitch.irc_ws_url = Some(v);
		info!("twitch config: irc_ws_url overridden by env");
	}

	if let Some(v) = var("STREAMHUB_TWITCH_PUBSUB_WS_URL") {
		cfg.twitch.pubsub_ws_url = Some(v);
		info!("twitch config: pubsub_ws_url overridden by env");
	}

	if let Some(v) = var("STREAMHUB_TWITCH_EVENTSUB_WS_URL") {
		cfg.twitch.eventsub_ws_url = Some(v);
		info!("twitch config: eventsub_ws_url overridden by env");
	}

	if let Some(v) = var("STREAMHUB_TWITCH_HELIX_BASE_URL") {
		cfg.twitch.helix_base_url = Some(v);
		info!("twitch config: helix_base_url overridden by env");
	}

	if let Some(v) = var("STREAMHUB_TWITCH_RECONNECT_MIN_DELAY_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.twitch.reconnect_min_delay = Some(Duration::from_millis(ms));
		debug!("twitch config: reconnect_min_delay overridden by env");
	}

	if let Some(v) = var("STREAMHUB_TWITCH_RECONNECT_MAX_DELAY_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.twitch.reconnect_max_delay = Some(Duration::from_millis(ms));
		debug!("twitch config: reconnect_max_delay overridden by env");
	}

	if cfg.twitch.chat_token.is_none() {
		warn!("twitch config: no chat_token configured");
	}

	if let (Some(min), Some(max)) = (cfg.twitch.reconnect_min_delay, cfg.twitch.reconnect_max_delay)
		&& min > max
	{
		warn!(
			min_ms = min.as_millis() as u64,
			max_ms = max.as_millis() as u64,
			"twitch config: reconnect_min_delay > reconnect_max_delay; swapping"
		);
		cfg.twitch.reconnect_min_delay = Some(max);
		cfg.twitch.reconnect_max_delay = Some(min);
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_src: &str) -> HostConfig {
		HostConfig::from_file(toml::from_str(toml_src).expect("valid toml"))
	}

	#[test]
	fn file_values_are_normalized() {
		let cfg = parse(
			r#"
			metrics_bind = "  "

			[twitch]
			chat_token = "oauth:abc"
			channel_token = ""
			reconnect_min_delay_ms = 250

			[[twitch.channels]]
			name = " Foo "
			can_send_messages = true

			[[twitch.channels]]
			name = ""
			"#,
		);

		assert_eq!(cfg.metrics_bind, None);
		assert!(cfg.twitch.chat_token.is_some());
		assert!(cfg.twitch.channel_token.is_none());
		assert_eq!(cfg.twitch.channels, vec![ChannelConfig::new("Foo", true)]);
		assert_eq!(cfg.twitch.reconnect_min_delay, Some(Duration::from_millis(250)));
	}

	#[test]
	fn env_overrides_win_and_delays_are_ordered() {
		let mut cfg = parse("[twitch]\nchat_token = \"file\"\n");
		let env = HashMap::from([
			("STREAMHUB_TWITCH_CHAT_TOKEN", "env-token"),
			("STREAMHUB_TWITCH_CHANNELS", "foo, bar,,"),
			("STREAMHUB_TWITCH_CHANNELS_CAN_SEND", "yes"),
			("STREAMHUB_TWITCH_RECONNECT_MIN_DELAY_MS", "5000"),
			("STREAMHUB_TWITCH_RECONNECT_MAX_DELAY_MS", "100"),
		]);
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.twitch.chat_token.as_ref().map(SecretString::expose), Some("env-token"));
		assert_eq!(
			cfg.twitch.channels,
			vec![ChannelConfig::new("foo", true), ChannelConfig::new("bar", true)]
		);
		assert_eq!(cfg.twitch.reconnect_min_delay, Some(Duration::from_millis(100)));
		assert_eq!(cfg.twitch.reconnect_max_delay, Some(Duration::from_millis(5000)));
	}

	#[test]
	fn chat_token_is_required() {
		let err = HostConfig::default().twitch.to_twitch_config().expect_err("missing token");
		assert!(err.to_string().contains("chat_token"));

		let cfg = parse(
			r#"
			[twitch]
			chat_token = "abc"
			eventsub_ws_url = "ws://127.0.0.1:9/ws"
			"#,
		)
		.twitch
		.to_twitch_config()
		.expect("config");
		assert_eq!(cfg.client_id, DEFAULT_CLIENT_ID);
		assert_eq!(cfg.eventsub_ws_url, "ws://127.0.0.1:9/ws");
		assert_eq!(cfg.effective_channel_token().expose(), "abc");
	}

	#[test]
	fn env_bools() {
		assert_eq!(parse_env_bool(" ON "), Some(true));
		assert_eq!(parse_env_bool("0"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}
}
