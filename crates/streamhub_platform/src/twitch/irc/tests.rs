#![forbid(unsafe_code)]

use streamhub_domain::ChannelName;

use super::*;

fn mk_channel(name: &str) -> ChannelName {
	ChannelName::new(name).expect("valid channel")
}

#[test]
fn parses_tagged_privmsg() {
	let line = "@badge-info=;color=#FF0000;display-name=Some\\sUser;id=abc-123;room-id=1337;user-id=42 :someuser!someuser@someuser.tmi.twitch.tv PRIVMSG #foo :hello there :)";
	let msg = IrcMessage::parse(line).expect("parse");

	assert_eq!(msg.command(), "PRIVMSG");
	assert_eq!(msg.nick(), Some("someuser"));
	assert_eq!(msg.channel(), Some(mk_channel("foo")));
	assert_eq!(msg.trailing(), Some("hello there :)"));
	assert_eq!(msg.tag("display-name").as_deref(), Some("Some User"));
	assert_eq!(msg.tag("room-id").as_deref(), Some("1337"));
	assert_eq!(msg.tag_raw("badge-info"), Some(""));
	assert_eq!(msg.tag("badge-info"), None);
	assert_eq!(msg.tag("missing"), None);
}

#[test]
fn parses_numeric_and_ping() {
	let msg = IrcMessage::parse(":tmi.twitch.tv 376 botname :>").expect("parse");
	assert_eq!(msg.command(), "376");
	assert_eq!(msg.param(0), Some("botname"));
	assert_eq!(msg.nick(), None);

	let ping = IrcMessage::parse("PING :tmi.twitch.tv").expect("parse");
	assert_eq!(ping.command(), "PING");
	assert_eq!(ping.trailing(), Some("tmi.twitch.tv"));
}

#[test]
fn parses_roomstate_without_trailing() {
	let msg = IrcMessage::parse("@emote-only=0;room-id=123;slow=0 :tmi.twitch.tv ROOMSTATE #foo").expect("parse");
	assert_eq!(msg.command(), "ROOMSTATE");
	assert_eq!(msg.channel(), Some(mk_channel("foo")));
	assert_eq!(msg.tag("room-id").as_deref(), Some("123"));
}

#[test]
fn unescapes_tag_values() {
	let msg = IrcMessage::parse("@system-msg=a\\sb\\:c\\\\d :tmi.twitch.tv USERNOTICE #foo").expect("parse");
	assert_eq!(msg.tag("system-msg").as_deref(), Some("a b;c\\d"));
}

#[test]
fn rejects_lines_without_command() {
	assert!(IrcMessage::parse("").is_err());
	assert!(IrcMessage::parse("@a=b").is_err());
	assert!(IrcMessage::parse(":prefix.only").is_err());
}

#[test]
fn splits_multi_line_frames() {
	let frame = "PING :tmi.twitch.tv\r\n:tmi.twitch.tv 376 me :>\r\n\r\n";
	let lines: Vec<&str> = split_lines(frame).collect();
	assert_eq!(lines, vec!["PING :tmi.twitch.tv", ":tmi.twitch.tv 376 me :>"]);
}

#[test]
fn handshake_order_and_pass_prefix() {
	assert_eq!(
		handshake(Some("abc"), "MyBot"),
		vec![
			"PASS oauth:abc".to_string(),
			"NICK mybot".to_string(),
			"CAP REQ :twitch.tv/tags twitch.tv/commands twitch.tv/membership".to_string(),
		]
	);
	assert_eq!(handshake(Some("oauth:abc"), "x")[0], "PASS oauth:abc");
	assert_eq!(handshake(None, "justinfan123").len(), 2);
	assert_eq!(handshake(Some("  "), "justinfan123")[0], "NICK justinfan123");
}

#[test]
fn privmsg_strips_control_characters() {
	let line = privmsg(&mk_channel("Foo"), "hi\r\nPRIVMSG #bar :pwned", "n1");
	assert_eq!(line, "@client-nonce=n1 PRIVMSG #foo :hiPRIVMSG #bar :pwned");
	assert!(!line.contains('\n'));
}

#[test]
fn join_part_builders() {
	let ch = mk_channel("#Foo");
	assert_eq!(join(&ch), "JOIN #foo");
	assert_eq!(part(&ch), "PART #foo");
}

#[test]
fn anonymous_login_shape() {
	let login = anonymous_login();
	assert!(login.starts_with("justinfan"));
	assert!(login["justinfan".len()..].parse::<u32>().is_ok());
}
