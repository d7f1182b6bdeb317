#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use alertcast_domain::{AlertEvent, MediaKind, Platform, Tier};
use anyhow::Context;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{AlertSink, RateLimiter};


/// Prefix marking chat text as a command.
pub const COMMAND_PREFIX: char = '!';

/// Default per-command cooldown.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(15);

/// Reserved names that reply with the command list instead of playing media.
const LIST_COMMANDS: [&str; 2] = ["commands", "comandi"];

const EMPTY_LISTING: &str = "No active commands found.";

/// One media command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
	/// Path relative to the media root, `"<tier folder>/<file name>"`.
	pub filename: String,
	pub tier: Tier,
	pub media: MediaKind,
}

/// Lowercase command name → media command. Read-only after construction.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
	entries: BTreeMap<String, CommandEntry>,
}

impl CommandTable {
	pub fn empty() -> Self {
		Self::default()
	}

	/// Build the table from `root/{everyone,subscribers,vips}`.
	///
	/// Tiers are scanned in that order and files by name, so the first-wins
	/// rule for duplicate names is deterministic.
	pub fn scan(root: &Path) -> anyhow::Result<Self> {
		let mut table = Self::empty();

		if !root.is_dir() {
			warn!(path = %root.display(), "command media directory not found; no commands loaded");
			return Ok(table);
		}

		for tier in Tier::ALL {
			let folder = tier.folder();
			let dir = root.join(folder);
			if !dir.is_dir() {
				continue;
			}

			let read = match fs::read_dir(&dir) {
				Ok(read) => read,
				Err(e) => {
					warn!(path = %dir.display(), error = %e, "could not read command folder");
					continue;
				}
			};

			let mut names = Vec::new();
			for entry in read {
				let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
				if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
					continue;
				}
				if let Ok(name) = entry.file_name().into_string() {
					names.push(name);
				}
			}
			names.sort();

			for file_name in names {
				let path = Path::new(&file_name);
				let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
					continue;
				};
				let Ok(media) = MediaKind::from_extension(ext) else {
					continue;
				};
				let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
					continue;
				};

				let entry = CommandEntry {
					filename: format!("{folder}/{file_name}"),
					tier,
					media,
				};
				table.insert(stem, entry);
			}
		}

		info!(commands = table.len(), path = %root.display(), "command table loaded");
		Ok(table)
	}

	/// Insert unless the name is taken. Returns whether the entry was added.
	pub fn insert(&mut self, name: &str, entry: CommandEntry) -> bool {
		let name = name.trim().to_lowercase();
		if name.is_empty() {
			return false;
		}
		if let Some(existing) = self.entries.get(&name) {
			warn!(
				command = %name,
				kept = %existing.filename,
				skipped = %entry.filename,
				"duplicate command name; keeping the first"
			);
			return false;
		}
		self.entries.insert(name, entry);
		true
	}

	pub fn get(&self, name: &str) -> Option<&CommandEntry> {
		self.entries.get(name)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Chat-ready list of commands grouped by tier.
	pub fn listing(&self) -> String {
		let names_for = |tier: Tier| -> Vec<String> {
			self.entries
				.iter()
				.filter(|(_, e)| e.tier == tier)
				.map(|(name, _)| format!("{COMMAND_PREFIX}{name}"))
				.collect()
		};

		let mut out = names_for(Tier::Everyone).join(", ");
		for (tier, label) in [(Tier::Subscriber, "Subscribers"), (Tier::Vip, "Vips")] {
			let names = names_for(tier);
			if names.is_empty() {
				continue;
			}
			if !out.is_empty() {
				out.push_str(" / ");
			}
			out.push_str(label);
			out.push_str(": ");
			out.push_str(&names.join(", "));
		}

		if out.is_empty() {
			EMPTY_LISTING.to_string()
		} else {
			out
		}
	}
}

/// Platform-neutral role signals of a chat author.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChatRoles {
	pub broadcaster: bool,
	pub moderator: bool,
	pub vip: bool,
	pub subscriber: bool,
}

impl ChatRoles {
	/// Broadcaster and moderator satisfy every tier.
	pub fn satisfies(&self, tier: Tier) -> bool {
		if self.broadcaster || self.moderator {
			return true;
		}
		match tier {
			Tier::Everyone => true,
			Tier::Subscriber => self.subscriber,
			Tier::Vip => self.vip,
		}
	}
}

/// Sends text back to the chat a command came from.
#[async_trait::async_trait]
pub trait ChatReplier: Send + Sync {
	async fn say(&self, text: &str) -> anyhow::Result<()>;
}

/// Result of handing one chat message to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
	NotCommand,
	Unknown,
	Denied,
	CoolingDown,
	Fired(AlertEvent),
	Listed,
	ListSkipped,
}

/// Extract the lowercase command name from chat text, if it is a command.
pub fn parse_command(text: &str) -> Option<String> {
	let first = text.trim_start().split_whitespace().next()?;
	let name = first.strip_prefix(COMMAND_PREFIX)?;
	Some(name.to_lowercase())
}

/// Shared command logic for every chat source.
pub struct CommandDispatcher {
	table: Arc<CommandTable>,
	cooldown: Duration,
	ledger: Mutex<HashMap<String, Instant>>,
	sink: Arc<dyn AlertSink>,
	reply_limiter: RateLimiter,
}

impl CommandDispatcher {
	pub fn new(table: Arc<CommandTable>, sink: Arc<dyn AlertSink>, cooldown: Duration) -> Self {
		Self {
			table,
			cooldown,
			ledger: Mutex::new(HashMap::new()),
			sink,
			reply_limiter: RateLimiter::chat_default(),
		}
	}

	pub fn with_reply_limiter(mut self, limiter: RateLimiter) -> Self {
		self.reply_limiter = limiter;
		self
	}

	pub fn table(&self) -> &CommandTable {
		&self.table
	}

	/// Handle one chat message. `replier` is `None` for sources that cannot
	/// post back to chat.
	pub async fn dispatch(
		&self,
		platform: Platform,
		author: &str,
		text: &str,
		roles: ChatRoles,
		replier: Option<&dyn ChatReplier>,
	) -> Dispatch {
		let Some(name) = parse_command(text) else {
			return Dispatch::NotCommand;
		};

		if LIST_COMMANDS.contains(&name.as_str()) {
			return self.reply_with_listing(platform, replier).await;
		}

		let Some(entry) = self.table.get(&name) else {
			return Dispatch::Unknown;
		};

		if !roles.satisfies(entry.tier) {
			debug!(%platform, command = %name, author, tier = %entry.tier, "command denied");
			return Dispatch::Denied;
		}

		let event = AlertEvent::SoundCommand {
			filename: entry.filename.clone(),
			media_type: entry.media,
		};

		{
			let mut ledger = self.ledger.lock();
			let now = Instant::now();
			if let Some(last) = ledger.get(&name)
				&& now.duration_since(*last) < self.cooldown
			{
				info!(%platform, command = %name, author, "command on cooldown");
				metrics::counter!("alertcast_commands_cooldown_total").increment(1);
				return Dispatch::CoolingDown;
			}

			self.sink.publish(event.clone());
			ledger.insert(name.clone(), now);
		}

		info!(%platform, command = %name, author, "command triggered");
		metrics::counter!("alertcast_commands_dispatched_total").increment(1);
		Dispatch::Fired(event)
	}

	async fn reply_with_listing(&self, platform: Platform, replier: Option<&dyn ChatReplier>) -> Dispatch {
		let Some(replier) = replier else {
			debug!(%platform, "command list requested on a source without chat replies");
			return Dispatch::ListSkipped;
		};

		// Never wait here: chat sources call this from their read loop.
		if !self.reply_limiter.try_acquire() {
			debug!(%platform, "command list reply rate limited");
			metrics::counter!("alertcast_commands_list_skipped_total").increment(1);
			return Dispatch::ListSkipped;
		}

		if let Err(e) = replier.say(&self.table.listing()).await {
			warn!(%platform, error = %e, "failed to send command list");
		}
		Dispatch::Listed
	}
}
