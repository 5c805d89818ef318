#![forbid(unsafe_code)]

//! Twitch IRC line codec: tag/prefix/command/params splitting plus outbound builders.

use std::borrow::Cow;

use anyhow::bail;
use streamhub_domain::ChannelName;

pub const CAPABILITIES: &str = "twitch.tv/tags twitch.tv/commands twitch.tv/membership";
pub const PING: &str = "PING :tmi.twitch.tv";
pub const PONG: &str = "PONG :tmi.twitch.tv";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IrcMessage<'a> {
	raw: &'a str,
	tags: Option<&'a str>,
	prefix: Option<&'a str>,
	command: &'a str,
	params: Vec<&'a str>,
}

impl<'a> IrcMessage<'a> {
	pub fn parse(line: &'a str) -> anyhow::Result<Self> {
		let mut message = IrcMessage {
			raw: line,
			..Default::default()
		};
		let mut remainder = line.trim_end_matches(['\r', '\n']);

		if let Some(rest) = remainder.strip_prefix('@') {
			let Some((tags, rest)) = rest.split_once(' ') else {
				bail!("irc line has tags but no command: {line:?}");
			};
			message.tags = Some(tags);
			remainder = rest.trim_start();
		}

		if let Some(rest) = remainder.strip_prefix(':') {
			let Some((prefix, rest)) = rest.split_once(' ') else {
				bail!("irc line has prefix but no command: {line:?}");
			};
			message.prefix = Some(prefix);
			remainder = rest.trim_start();
		}

		let (middle, trailing) = match remainder.find(" :") {
			Some(idx) => (&remainder[..idx], Some(&remainder[idx + 2..])),
			None => (remainder, None),
		};

		let mut parts = middle.split(' ').filter(|s| !s.is_empty());
		let Some(command) = parts.next() else {
			bail!("irc line has no command: {line:?}");
		};
		message.command = command;
		message.params.extend(parts);
		if let Some(trailing) = trailing {
			message.params.push(trailing);
		}

		Ok(message)
	}

	pub fn raw(&self) -> &'a str {
		self.raw
	}

	pub fn command(&self) -> &'a str {
		self.command
	}

	pub fn prefix(&self) -> Option<&'a str> {
		self.prefix
	}

	pub fn params(&self) -> &[&'a str] {
		&self.params
	}

	pub fn param(&self, idx: usize) -> Option<&'a str> {
		self.params.get(idx).copied()
	}

	/// Last parameter, usually the `:` trailing text.
	pub fn trailing(&self) -> Option<&'a str> {
		self.params.last().copied()
	}

	/// Channel from the first `#`-prefixed parameter.
	pub fn channel(&self) -> Option<ChannelName> {
		self.params
			.iter()
			.find(|p| p.starts_with('#'))
			.and_then(|p| ChannelName::new(p).ok())
	}

	/// Login of the sender, taken from `nick!user@host`.
	pub fn nick(&self) -> Option<&'a str> {
		self.prefix
			.and_then(|p| p.split('!').next())
			.filter(|n| !n.is_empty() && !n.contains('.'))
	}

	/// Raw tag value; `Some("")` for a present but empty tag.
	pub fn tag_raw(&self, key: &str) -> Option<&'a str> {
		self.tags.and_then(|tags| {
			tags.split(';').find_map(|component| {
				let (k, v) = component.split_once('=').unwrap_or((component, ""));
				(k == key).then_some(v)
			})
		})
	}

	/// Unescaped tag value, empty values mapped to `None`.
	pub fn tag(&self, key: &str) -> Option<Cow<'a, str>> {
		self.tag_raw(key).filter(|v| !v.is_empty()).map(unescape_tag_value)
	}
}

fn unescape_tag_value(v: &str) -> Cow<'_, str> {
	if !v.contains('\\') {
		return Cow::Borrowed(v);
	}

	let mut out = String::with_capacity(v.len());
	let mut chars = v.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some(':') => out.push(';'),
			Some('s') => out.push(' '),
			Some('\\') => out.push('\\'),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			None => {}
		}
	}
	Cow::Owned(out)
}

/// Split one websocket frame into its IRC lines.
pub fn split_lines(frame: &str) -> impl Iterator<Item = &str> {
	frame.split(['\r', '\n']).map(str::trim).filter(|l| !l.is_empty())
}

/// Strip control characters so user text cannot inject extra IRC lines.
pub fn sanitize_text(text: &str) -> String {
	text.chars().filter(|c| !c.is_control()).collect::<String>().trim().to_string()
}

pub fn pass(token: &str) -> String {
	let token = token.trim();
	if token.starts_with("oauth:") {
		format!("PASS {token}")
	} else {
		format!("PASS oauth:{token}")
	}
}

pub fn nick(nick: &str) -> String {
	format!("NICK {}", nick.trim().to_ascii_lowercase())
}

pub fn cap_req() -> String {
	format!("CAP REQ :{CAPABILITIES}")
}

pub fn join(channel: &ChannelName) -> String {
	format!("JOIN {}", channel.irc())
}

pub fn part(channel: &ChannelName) -> String {
	format!("PART {}", channel.irc())
}

/// `PRIVMSG` tagged with a client nonce so the echo can be matched.
pub fn privmsg(channel: &ChannelName, text: &str, nonce: &str) -> String {
	format!("@client-nonce={nonce} PRIVMSG {} :{}", channel.irc(), sanitize_text(text))
}

/// Login sequence sent on open: `PASS` (when authenticated), `NICK`, `CAP REQ`.
pub fn handshake(token: Option<&str>, login: &str) -> Vec<String> {
	let mut lines = Vec::with_capacity(3);
	if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
		lines.push(pass(token));
	}
	lines.push(nick(login));
	lines.push(cap_req());
	lines
}

/// Read-only login used when no token is configured.
pub fn anonymous_login() -> String {
	let n = uuid::Uuid::new_v4().as_u128() % 90_000 + 10_000;
	format!("justinfan{n}")
}

#[cfg(test)]
mod tests;
