#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alertcast_domain::{AlertEvent, Platform, twitch_emote_url};
use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::{ChatReplier, ChatRoles, CommandDispatcher};
use crate::{AlertSink, SecretString};

pub const DEFAULT_CHAT_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

const RECONNECT_DELAY: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE: usize = 32;

type ChatWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct ChatConfig {
	pub bot_username: String,
	pub bot_token: SecretString,
	/// Channel to join, without the leading `#`.
	pub channel: String,
	pub url: String,
}

impl ChatConfig {
	pub fn new(bot_username: impl Into<String>, bot_token: SecretString, channel: impl Into<String>) -> Self {
		Self {
			bot_username: bot_username.into(),
			bot_token,
			channel: channel.into(),
			url: DEFAULT_CHAT_URL.to_string(),
		}
	}

	fn channel_name(&self) -> String {
		self.channel.trim().trim_start_matches('#').to_lowercase()
	}

	/// Lines sent right after the socket opens.
	fn login_lines(&self) -> Vec<String> {
		let token = self.bot_token.expose().trim();
		let token = token.strip_prefix("oauth:").unwrap_or(token);
		vec![
			"CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
			format!("PASS oauth:{token}"),
			format!("NICK {}", self.bot_username.trim().to_lowercase()),
			format!("JOIN #{}", self.channel_name()),
		]
	}
}

/// One parsed IRC line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrcMessage {
	pub tags: HashMap<String, String>,
	pub prefix: Option<String>,
	pub command: String,
	pub params: Vec<String>,
}

impl IrcMessage {
	pub fn tag(&self, key: &str) -> Option<&str> {
		self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
	}

	/// Nick from a `nick!user@host` prefix.
	pub fn nick(&self) -> Option<&str> {
		let prefix = self.prefix.as_deref()?;
		Some(prefix.split('!').next().unwrap_or(prefix)).filter(|n| !n.is_empty())
	}

	pub fn trailing(&self) -> Option<&str> {
		self.params.last().map(String::as_str)
	}
}

fn unescape_tag_value(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	let mut chars = raw.chars();
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
	out
}

/// Parse one IRC line (IRCv3 tags supported). Returns `None` for blank or
/// command-less lines.
pub fn parse_line(line: &str) -> Option<IrcMessage> {
	let mut rest = line.trim_end_matches(['\r', '\n']);
	let mut msg = IrcMessage::default();

	if let Some(after) = rest.strip_prefix('@') {
		let (tags, tail) = after.split_once(' ')?;
		for tag in tags.split(';').filter(|t| !t.is_empty()) {
			let (k, v) = tag.split_once('=').unwrap_or((tag, ""));
			msg.tags.insert(k.to_string(), unescape_tag_value(v));
		}
		rest = tail.trim_start();
	}

	if let Some(after) = rest.strip_prefix(':') {
		let (prefix, tail) = after.split_once(' ')?;
		msg.prefix = Some(prefix.to_string());
		rest = tail.trim_start();
	}

	let (head, trailing) = match rest.split_once(" :") {
		Some((h, t)) => (h, Some(t)),
		None => (rest, None),
	};
	let mut parts = head.split_whitespace();
	msg.command = parts.next()?.to_ascii_uppercase();
	msg.params = parts.map(str::to_string).collect();
	if let Some(t) = trailing {
		msg.params.push(t.to_string());
	}

	Some(msg)
}

/// Expand an `emotes` tag (`id:0-4,6-10/id2:12-15`) into one CDN URL per occurrence.
pub fn emote_urls(tag: &str) -> Vec<String> {
	let mut urls = Vec::new();
	for group in tag.split('/').filter(|g| !g.is_empty()) {
		let Some((id, ranges)) = group.split_once(':') else {
			continue;
		};
		if id.is_empty() {
			continue;
		}
		let occurrences = ranges.split(',').filter(|r| r.contains('-')).count();
		urls.extend(std::iter::repeat_n(twitch_emote_url(id), occurrences));
	}
	urls
}

/// Map the `badges` tag (`broadcaster/1,subscriber/12`) onto chat roles.
pub fn roles_from_badges(badges: &str) -> ChatRoles {
	let mut roles = ChatRoles::default();
	for badge in badges.split(',') {
		match badge.split('/').next().unwrap_or_default() {
			"broadcaster" => roles.broadcaster = true,
			"moderator" => roles.moderator = true,
			"vip" => roles.vip = true,
			"subscriber" | "founder" => roles.subscriber = true,
			_ => {}
		}
	}
	roles
}

/// Replies by queueing `PRIVMSG` lines onto the live connection.
struct IrcReplier {
	channel: String,
	outbound: mpsc::Sender<String>,
}

#[async_trait::async_trait]
impl ChatReplier for IrcReplier {
	async fn say(&self, text: &str) -> anyhow::Result<()> {
		let line = format!("PRIVMSG #{} :{}", self.channel, text.replace(['\r', '\n'], " "));
		match self.outbound.try_send(line) {
			Ok(()) => Ok(()),
			Err(mpsc::error::TrySendError::Full(_)) => {
				warn!(channel = %self.channel, "twitch chat reply queue full; reply dropped");
				metrics::counter!("alertcast_twitch_chat_replies_dropped_total").increment(1);
				Ok(())
			}
			Err(mpsc::error::TrySendError::Closed(_)) => anyhow::bail!("twitch chat connection closed"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
	Closed,
	ReconnectRequested,
}

/// What the session loop should do after one IRC line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LineAction {
	Send(String),
	Reconnect,
}

/// Twitch chat bot: joins one channel, feeds emote walls and commands.
pub struct TwitchChat {
	cfg: ChatConfig,
	sink: Arc<dyn AlertSink>,
	commands: Arc<CommandDispatcher>,
}

impl TwitchChat {
	pub fn new(cfg: ChatConfig, sink: Arc<dyn AlertSink>, commands: Arc<CommandDispatcher>) -> Self {
		Self { cfg, sink, commands }
	}

	/// Stay connected until `cancel` fires, reconnecting after every failure.
	pub async fn run(&self, cancel: CancellationToken) {
		let channel = self.cfg.channel_name();

		loop {
			if cancel.is_cancelled() {
				break;
			}

			info!(url = %self.cfg.url, %channel, "connecting to twitch chat");
			let reconnect_now = match self.session(&cancel).await {
				Ok(_) if cancel.is_cancelled() => break,
				Ok(SessionEnd::ReconnectRequested) => true,
				Ok(SessionEnd::Closed) => {
					warn!(%channel, "twitch chat connection closed");
					false
				}
				Err(e) => {
					warn!(%channel, error = ?e, "twitch chat connection failed");
					false
				}
			};

			metrics::counter!("alertcast_twitch_chat_reconnects_total").increment(1);
			if reconnect_now {
				continue;
			}
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = sleep(RECONNECT_DELAY) => {}
			}
		}

		info!(%channel, "twitch chat stopped");
	}

	async fn session(&self, cancel: &CancellationToken) -> anyhow::Result<SessionEnd> {
		let (mut ws, _resp): (ChatWs, _) = tokio_tungstenite::connect_async(self.cfg.url.as_str())
			.await
			.context("connect_async to twitch chat")?;

		for line in self.cfg.login_lines() {
			ws.send(Message::Text(line.into())).await.context("send login line")?;
		}

		let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
		let replier = IrcReplier {
			channel: self.cfg.channel_name(),
			outbound: out_tx,
		};

		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					let _ = ws.close(None).await;
					return Ok(SessionEnd::Closed);
				}
				Some(line) = out_rx.recv() => {
					ws.send(Message::Text(line.into())).await.context("send chat reply")?;
				}
				msg = ws.next() => {
					let Some(msg) = msg else {
						return Ok(SessionEnd::Closed);
					};
					match msg.context("twitch chat read")? {
						Message::Text(t) => {
							for line in t.as_str().split("\r\n").filter(|l| !l.is_empty()) {
								match self.handle_line(line, &replier).await {
									Some(LineAction::Send(reply)) => {
										ws.send(Message::Text(reply.into())).await.context("send pong")?;
									}
									Some(LineAction::Reconnect) => {
										let _ = ws.close(None).await;
										return Ok(SessionEnd::ReconnectRequested);
									}
									None => {}
								}
							}
						}
						Message::Ping(p) => {
							let _ = ws.send(Message::Pong(p)).await;
						}
						Message::Close(frame) => {
							debug!(?frame, "twitch chat websocket closed");
							return Ok(SessionEnd::Closed);
						}
						_ => {}
					}
				}
			}
		}
	}

	/// Handle one IRC line. Never waits on the outbound queue.
	async fn handle_line(&self, line: &str, replier: &IrcReplier) -> Option<LineAction> {
		let msg = parse_line(line)?;

		match msg.command.as_str() {
			"PING" => Some(LineAction::Send(format!(
				"PONG :{}",
				msg.trailing().unwrap_or("tmi.twitch.tv")
			))),
			"001" => {
				info!(channel = %replier.channel, "twitch chat authenticated");
				None
			}
			"JOIN" => {
				debug!(channel = %replier.channel, nick = ?msg.nick(), "joined twitch chat");
				None
			}
			"NOTICE" => {
				warn!(notice = ?msg.trailing(), "twitch chat notice");
				None
			}
			"RECONNECT" => {
				info!("twitch chat asked to reconnect");
				Some(LineAction::Reconnect)
			}
			"PRIVMSG" => {
				self.handle_privmsg(&msg, replier).await;
				None
			}
			_ => None,
		}
	}

	async fn handle_privmsg(&self, msg: &IrcMessage, replier: &IrcReplier) {
		let text = msg.trailing().unwrap_or_default();
		let author = msg.tag("display-name").or(msg.nick()).unwrap_or_default();

		if let Some(tag) = msg.tag("emotes") {
			let emotes = emote_urls(tag);
			if !emotes.is_empty() {
				debug!(author, count = emotes.len(), "twitch emote wall");
				self.sink.publish(AlertEvent::EmoteWall { emotes });
			}
		}

		let roles = roles_from_badges(msg.tag("badges").unwrap_or_default());
		self.commands
			.dispatch(Platform::Twitch, author, text, roles, Some(replier))
			.await;
	}
}
