#![forbid(unsafe_code)]

//! Moderation slash commands typed into chat, carried out through Helix.

use tracing::debug;

use super::helix::models::BanRequest;
use super::helix::{HelixApi, HelixError};

/// Timeout applied when `/timeout` gives no positive duration.
pub const DEFAULT_TIMEOUT_SECS: u32 = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModCommand {
	Ban { login: String, reason: Option<String> },
	Unban { login: String },
	Timeout { login: String, seconds: u32, reason: Option<String> },
	Untimeout { login: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intercepted {
	Run(ModCommand),
	/// Arguments missing; carries the usage line.
	Usage(&'static str),
	/// Unknown slash command. Nothing is sent.
	Ignored,
}

fn rest(parts: &[&str]) -> Option<String> {
	(!parts.is_empty()).then(|| parts.join(" "))
}

/// `None` for plain chat lines.
pub fn intercept(text: &str) -> Option<Intercepted> {
	if !text.starts_with('/') {
		return None;
	}
	let parts: Vec<&str> = text.split_whitespace().collect();
	let (cmd, args) = parts.split_first()?;

	let parsed = match (*cmd, args) {
		("/ban", []) => Intercepted::Usage("Syntax is /ban [UserName] [Reason]"),
		("/ban", [login, reason @ ..]) => Intercepted::Run(ModCommand::Ban {
			login: login.to_string(),
			reason: rest(reason),
		}),
		("/unban", []) => Intercepted::Usage("Syntax is /unban [UserName]"),
		("/unban", [login, ..]) => Intercepted::Run(ModCommand::Unban {
			login: login.to_string(),
		}),
		("/timeout", []) => Intercepted::Usage("Syntax is /timeout [UserName] [Duration] [Reason]"),
		("/timeout", [login, tail @ ..]) => {
			let (seconds, reason) = match tail.split_first().map(|(d, r)| (d.parse::<i64>(), r)) {
				Some((Ok(d), reason)) => (d, reason),
				_ => (0, tail),
			};
			let seconds = u32::try_from(seconds).ok().filter(|s| *s > 0).unwrap_or(DEFAULT_TIMEOUT_SECS);
			Intercepted::Run(ModCommand::Timeout {
				login: login.to_string(),
				seconds,
				reason: rest(reason),
			})
		}
		("/untimeout", []) => Intercepted::Usage("Syntax is /untimeout [UserName]"),
		("/untimeout", [login, ..]) => Intercepted::Run(ModCommand::Untimeout {
			login: login.to_string(),
		}),
		_ => Intercepted::Ignored,
	};
	Some(parsed)
}

impl ModCommand {
	pub fn login(&self) -> &str {
		match self {
			Self::Ban { login, .. } | Self::Timeout { login, .. } => login,
			Self::Unban { login } | Self::Untimeout { login } => login,
		}
	}

	fn verb(&self) -> &'static str {
		match self {
			Self::Ban { .. } => "ban",
			Self::Unban { .. } => "unban",
			Self::Timeout { .. } => "timeout",
			Self::Untimeout { .. } => "untimeout",
		}
	}

	fn success(&self) -> String {
		let login = self.login();
		match self {
			Self::Ban { .. } => format!("Banned user {login}"),
			Self::Unban { .. } => format!("Unbanned user {login}"),
			Self::Timeout { seconds, .. } if *seconds > 60 => {
				format!("Timeout user {login} for {} minute(s)", seconds / 60)
			}
			Self::Timeout { seconds, .. } => format!("Timeout user {login} for {seconds} second(s)"),
			Self::Untimeout { .. } => format!("Untimeout user {login}"),
		}
	}
}

/// Chat reply plus the Helix failure behind it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
	pub reply: String,
	pub error: Option<HelixError>,
}

/// Resolve the target login and apply the command in `broadcaster_id`'s channel.
pub async fn execute(helix: &dyn HelixApi, broadcaster_id: &str, moderator_id: &str, cmd: &ModCommand) -> Outcome {
	let login = cmd.login();
	let user = match helix.get_user_by_login(login).await {
		Ok(Some(user)) => user,
		Ok(None) | Err(_) => {
			return Outcome {
				reply: format!("Failed to {} user {login}, user not found!", cmd.verb()),
				error: None,
			};
		}
	};

	let result = match cmd {
		ModCommand::Ban { reason, .. } => helix
			.ban_user(broadcaster_id, moderator_id, BanRequest::ban(&user.id, reason.clone()))
			.await
			.map(drop),
		ModCommand::Timeout { seconds, reason, .. } => helix
			.ban_user(
				broadcaster_id,
				moderator_id,
				BanRequest::timeout(&user.id, *seconds, reason.clone()),
			)
			.await
			.map(drop),
		ModCommand::Unban { .. } | ModCommand::Untimeout { .. } => {
			helix.unban_user(broadcaster_id, moderator_id, &user.id).await
		}
	};

	match result {
		Ok(()) => Outcome {
			reply: cmd.success(),
			error: None,
		},
		Err(e) => {
			debug!(command = cmd.verb(), login, error = %e, "moderation command failed");
			Outcome {
				reply: format!("Failed to {} user {login}", cmd.verb()),
				error: Some(e),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::twitch::helix::models::HelixUser;
	use crate::twitch::testing::FakeHelix;

	fn fake_with_target() -> FakeHelix {
		let fake = FakeHelix::with_token_user("999", "bot", &[]);
		fake.users.lock().insert(
			"troll".to_string(),
			HelixUser {
				id: "42".to_string(),
				login: "troll".to_string(),
				display_name: None,
			},
		);
		fake
	}

	fn run(text: &str) -> ModCommand {
		match intercept(text) {
			Some(Intercepted::Run(cmd)) => cmd,
			other => panic!("expected command for {text:?}, got: {other:?}"),
		}
	}

	#[test]
	fn plain_chat_is_not_intercepted() {
		assert_eq!(intercept("hello /ban troll"), None);
		assert_eq!(intercept(""), None);
	}

	#[test]
	fn missing_arguments_answer_usage() {
		assert_eq!(intercept("/ban"), Some(Intercepted::Usage("Syntax is /ban [UserName] [Reason]")));
		assert_eq!(
			intercept("/timeout   "),
			Some(Intercepted::Usage("Syntax is /timeout [UserName] [Duration] [Reason]"))
		);
		assert_eq!(intercept("/me waves"), Some(Intercepted::Ignored));
		assert_eq!(intercept("/"), Some(Intercepted::Ignored));
	}

	#[test]
	fn timeout_duration_and_reason() {
		assert_eq!(
			run("/timeout troll 30 stop  that"),
			ModCommand::Timeout {
				login: "troll".to_string(),
				seconds: 30,
				reason: Some("stop that".to_string()),
			}
		);
		assert_eq!(
			run("/timeout troll -5"),
			ModCommand::Timeout {
				login: "troll".to_string(),
				seconds: DEFAULT_TIMEOUT_SECS,
				reason: None,
			}
		);
		assert_eq!(
			run("/timeout troll spamming links"),
			ModCommand::Timeout {
				login: "troll".to_string(),
				seconds: DEFAULT_TIMEOUT_SECS,
				reason: Some("spamming links".to_string()),
			}
		);
		assert_eq!(
			run("/ban troll"),
			ModCommand::Ban {
				login: "troll".to_string(),
				reason: None,
			}
		);
	}

	#[tokio::test]
	async fn ban_resolves_login_then_bans() {
		let fake = fake_with_target();

		let out = execute(&fake, "123", "999", &run("/ban troll rude")).await;
		assert_eq!(out.reply, "Banned user troll");
		assert_eq!(out.error, None);
		assert_eq!(fake.count("user_by_login troll"), 1);
		assert_eq!(fake.count("ban 123 42 -"), 1);
		assert_eq!(fake.bans.lock()[0].reason.as_deref(), Some("rude"));
	}

	#[tokio::test]
	async fn timeout_reply_uses_minutes_or_seconds() {
		let fake = fake_with_target();

		let out = execute(&fake, "123", "999", &run("/timeout troll")).await;
		assert_eq!(out.reply, "Timeout user troll for 10 minute(s)");
		assert_eq!(fake.count("ban 123 42 600"), 1);

		let out = execute(&fake, "123", "999", &run("/timeout troll 45")).await;
		assert_eq!(out.reply, "Timeout user troll for 45 second(s)");

		let out = execute(&fake, "123", "999", &run("/untimeout troll")).await;
		assert_eq!(out.reply, "Untimeout user troll");
		assert_eq!(fake.count("unban 123 42"), 1);
	}

	#[tokio::test]
	async fn unknown_user_is_reported_without_mutation() {
		let fake = fake_with_target();

		let out = execute(&fake, "123", "999", &run("/unban ghost")).await;
		assert_eq!(out.reply, "Failed to unban user ghost, user not found!");
		assert_eq!(fake.count("unban"), 0);
	}

	#[tokio::test]
	async fn helix_failure_is_returned_with_reply() {
		let fake = fake_with_target();
		*fake.mutation_error.lock() = Some(HelixError::AuthorizationFailed("not a moderator".to_string()));

		let out = execute(&fake, "123", "999", &run("/ban troll")).await;
		assert_eq!(out.reply, "Failed to ban user troll");
		assert!(out.error.as_ref().is_some_and(HelixError::is_auth));
	}
}
