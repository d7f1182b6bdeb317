#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alertcast_platform::SecretString;
use alertcast_platform::commands::DEFAULT_COOLDOWN;
use alertcast_platform::twitch::helix::{DEFAULT_HELIX_BASE_URL, DEFAULT_OAUTH_BASE_URL};
use alertcast_platform::youtube::{DEFAULT_API_BASE_URL, DEFAULT_POLL_INTERVAL_SECS};
use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";
pub const DEFAULT_TEST_BIND: &str = "127.0.0.1:8001";
pub const DEFAULT_WEBSOCKET_PATH: &str = "/ws";
pub const DEFAULT_MEDIA_DIR: &str = "static/sounds/commands";
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 256;

/// Default config path: `~/.alertcast/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".alertcast").join("config.toml"))
}

/// Load the server config from TOML and env overrides. A missing file yields defaults.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub hub: HubSettings,
	pub persistence: PersistenceSettings,
	pub twitch: TwitchSettings,
	pub youtube: YouTubeSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Public listener (overlay websocket, webhooks, health).
	pub bind: String,
	/// Private listener for `/test/alert`; `None` disables it.
	pub test_bind: Option<String>,
	/// Public base URL Twitch calls back on.
	pub base_url: Option<String>,
	pub websocket_path: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	pub media_dir: PathBuf,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			test_bind: Some(DEFAULT_TEST_BIND.to_string()),
			base_url: None,
			websocket_path: DEFAULT_WEBSOCKET_PATH.to_string(),
			metrics_bind: None,
			media_dir: PathBuf::from(DEFAULT_MEDIA_DIR),
		}
	}
}

#[derive(Debug, Clone)]
pub struct HubSettings {
	pub client_queue_capacity: usize,
}

impl Default for HubSettings {
	fn default() -> Self {
		Self {
			client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:). `None` keeps state in memory.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TwitchSettings {
	pub client_id: Option<String>,
	pub client_secret: Option<SecretString>,
	pub channel_name: Option<String>,
	pub user_access_token: Option<SecretString>,
	pub webhook_secret: Option<SecretString>,
	pub helix_base_url: String,
	pub oauth_base_url: String,
	pub chat: TwitchChatSettings,
}

impl Default for TwitchSettings {
	fn default() -> Self {
		Self {
			client_id: None,
			client_secret: None,
			channel_name: None,
			user_access_token: None,
			webhook_secret: None,
			helix_base_url: DEFAULT_HELIX_BASE_URL.to_string(),
			oauth_base_url: DEFAULT_OAUTH_BASE_URL.to_string(),
			chat: TwitchChatSettings::default(),
		}
	}
}

impl TwitchSettings {
	/// Whether EventSub management can run: app credentials plus a channel.
	pub fn is_configured(&self) -> bool {
		self.client_id.is_some() && self.client_secret.is_some() && self.channel_name.is_some()
	}
}

#[derive(Debug, Clone)]
pub struct TwitchChatSettings {
	pub bot_username: Option<String>,
	pub bot_token: Option<SecretString>,
	pub channel_to_join: Option<String>,
	pub command_cooldown: Duration,
}

impl Default for TwitchChatSettings {
	fn default() -> Self {
		Self {
			bot_username: None,
			bot_token: None,
			channel_to_join: None,
			command_cooldown: DEFAULT_COOLDOWN,
		}
	}
}

#[derive(Debug, Clone)]
pub struct YouTubeSettings {
	pub api_key: Option<SecretString>,
	pub channel_id: Option<String>,
	/// Raw configured value; the polling engine applies the valid range.
	pub polling_interval_secs: u64,
	pub api_base_url: String,
}

impl Default for YouTubeSettings {
	fn default() -> Self {
		Self {
			api_key: None,
			channel_id: None,
			polling_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
			api_base_url: DEFAULT_API_BASE_URL.to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	hub: FileHubSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	youtube: FileYouTubeSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	test_bind: Option<String>,
	base_url: Option<String>,
	websocket_path: Option<String>,
	metrics_bind: Option<String>,
	media_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHubSettings {
	client_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	channel_name: Option<String>,
	user_access_token: Option<String>,
	webhook_secret: Option<String>,
	helix_base_url: Option<String>,
	oauth_base_url: Option<String>,

	#[serde(default)]
	chat: FileTwitchChatSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchChatSettings {
	bot_username: Option<String>,
	bot_token: Option<String>,
	channel_to_join: Option<String>,
	command_cooldown_secs: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileYouTubeSettings {
	api_key: Option<String>,
	channel_id: Option<String>,
	polling_interval_secs: Option<u64>,
	api_base_url: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn secret(v: Option<String>) -> Option<SecretString> {
	non_empty(v).map(SecretString::new)
}

/// Cooldown in seconds; zero or negative means the default.
fn cooldown_from_secs(secs: Option<i64>) -> Duration {
	match secs {
		Some(s) if s > 0 => Duration::from_secs(s as u64),
		_ => DEFAULT_COOLDOWN,
	}
}

fn normalize_path(path: String) -> String {
	if path.starts_with('/') { path } else { format!("/{path}") }
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();

		// An explicitly empty test_bind disables the test listener.
		let test_bind = match file.server.test_bind {
			Some(v) if v.trim().is_empty() => None,
			Some(v) => Some(v.trim().to_string()),
			None => defaults.test_bind,
		};

		let server = ServerSettings {
			bind: non_empty(file.server.bind).unwrap_or(defaults.bind),
			test_bind,
			base_url: non_empty(file.server.base_url),
			websocket_path: non_empty(file.server.websocket_path)
				.map(normalize_path)
				.unwrap_or(defaults.websocket_path),
			metrics_bind: non_empty(file.server.metrics_bind),
			media_dir: non_empty(file.server.media_dir)
				.map(PathBuf::from)
				.unwrap_or(defaults.media_dir),
		};

		let hub = HubSettings {
			client_queue_capacity: file
				.hub
				.client_queue_capacity
				.filter(|c| *c > 0)
				.unwrap_or(DEFAULT_CLIENT_QUEUE_CAPACITY),
		};

		let twitch = TwitchSettings {
			client_id: non_empty(file.twitch.client_id),
			client_secret: secret(file.twitch.client_secret),
			channel_name: non_empty(file.twitch.channel_name),
			user_access_token: secret(file.twitch.user_access_token),
			webhook_secret: secret(file.twitch.webhook_secret),
			helix_base_url: non_empty(file.twitch.helix_base_url).unwrap_or_else(|| DEFAULT_HELIX_BASE_URL.to_string()),
			oauth_base_url: non_empty(file.twitch.oauth_base_url).unwrap_or_else(|| DEFAULT_OAUTH_BASE_URL.to_string()),
			chat: TwitchChatSettings {
				bot_username: non_empty(file.twitch.chat.bot_username),
				bot_token: secret(file.twitch.chat.bot_token),
				channel_to_join: non_empty(file.twitch.chat.channel_to_join),
				command_cooldown: cooldown_from_secs(file.twitch.chat.command_cooldown_secs),
			},
		};

		let youtube = YouTubeSettings {
			api_key: secret(file.youtube.api_key),
			channel_id: non_empty(file.youtube.channel_id),
			polling_interval_secs: file
				.youtube
				.polling_interval_secs
				.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
			api_base_url: non_empty(file.youtube.api_base_url).unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
		};

		Self {
			server,
			hub,
			persistence: PersistenceSettings {
				database_url: non_empty(file.persistence.database_url),
			},
			twitch,
			youtube,
		}
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

/// Apply `ALERTCAST_*` overrides. `lookup` is `std::env::var` outside tests.
fn apply_env_overrides(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("ALERTCAST_BIND") {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = lookup("ALERTCAST_TEST_BIND") {
		let v = v.trim().to_string();
		cfg.server.test_bind = (!v.is_empty()).then_some(v);
		info!("server config: test_bind overridden by env");
	}

	if let Some(v) = var("ALERTCAST_BASE_URL") {
		cfg.server.base_url = Some(v);
		info!("server config: base_url overridden by env");
	}

	if let Some(v) = var("ALERTCAST_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("ALERTCAST_MEDIA_DIR") {
		cfg.server.media_dir = PathBuf::from(v);
		info!("server config: media_dir overridden by env");
	}

	if let Some(v) = var("ALERTCAST_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = var("ALERTCAST_TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = var("ALERTCAST_TWITCH_CLIENT_SECRET") {
		cfg.twitch.client_secret = Some(SecretString::new(v));
		info!("twitch config: client_secret overridden by env");
	}

	if let Some(v) = var("ALERTCAST_TWITCH_CHANNEL_NAME") {
		cfg.twitch.channel_name = Some(v);
		info!("twitch config: channel_name overridden by env");
	}

	if let Some(v) = var("ALERTCAST_TWITCH_USER_ACCESS_TOKEN") {
		cfg.twitch.user_access_token = Some(SecretString::new(v));
		info!("twitch config: user_access_token overridden by env");
	}

	if let Some(v) = var("ALERTCAST_TWITCH_WEBHOOK_SECRET") {
		cfg.twitch.webhook_secret = Some(SecretString::new(v));
		info!("twitch config: webhook_secret overridden by env");
	}

	if let Some(v) = var("ALERTCAST_TWITCH_BOT_TOKEN") {
		cfg.twitch.chat.bot_token = Some(SecretString::new(v));
		info!("twitch chat config: bot_token overridden by env");
	}

	if let Some(v) = var("ALERTCAST_TWITCH_COMMAND_COOLDOWN_SECS")
		&& let Ok(secs) = v.parse::<i64>()
	{
		cfg.twitch.chat.command_cooldown = cooldown_from_secs(Some(secs));
		info!(secs, "twitch chat config: command_cooldown overridden by env");
	}

	if let Some(v) = var("ALERTCAST_YOUTUBE_API_KEY") {
		cfg.youtube.api_key = Some(SecretString::new(v));
		info!("youtube config: api_key overridden by env");
	}

	if let Some(v) = var("ALERTCAST_YOUTUBE_CHANNEL_ID") {
		cfg.youtube.channel_id = Some(v);
		info!("youtube config: channel_id overridden by env");
	}

	if let Some(v) = var("ALERTCAST_YOUTUBE_POLLING_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.youtube.polling_interval_secs = secs;
		info!(secs, "youtube config: polling_interval_secs overridden by env");
	}

	if cfg.twitch.is_configured() && cfg.twitch.webhook_secret.is_none() {
		warn!("twitch config: no webhook_secret; every webhook callback will be rejected");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_src: &str) -> ServerConfig {
		let file: FileConfig = toml::from_str(toml_src).unwrap();
		ServerConfig::from_file(file)
	}

	#[test]
	fn empty_file_gives_defaults() {
		let cfg = parse("");
		assert_eq!(cfg.server.bind, DEFAULT_BIND);
		assert_eq!(cfg.server.test_bind.as_deref(), Some(DEFAULT_TEST_BIND));
		assert_eq!(cfg.server.websocket_path, "/ws");
		assert_eq!(cfg.server.media_dir, PathBuf::from(DEFAULT_MEDIA_DIR));
		assert_eq!(cfg.hub.client_queue_capacity, 256);
		assert_eq!(cfg.twitch.chat.command_cooldown, Duration::from_secs(15));
		assert!(!cfg.twitch.is_configured());
		assert!(cfg.youtube.api_key.is_none());
	}

	#[test]
	fn file_values_are_trimmed_and_empties_dropped() {
		let cfg = parse(
			r#"
			[server]
			base_url = " https://alerts.example.com "
			websocket_path = "overlay"
			test_bind = ""

			[twitch]
			client_id = "cid"
			client_secret = "shh"
			channel_name = "dallas"
			user_access_token = ""

			[twitch.chat]
			command_cooldown_secs = -3

			[youtube]
			api_key = "k"
			channel_id = "UC1"
			polling_interval_secs = 90
			"#,
		);

		assert_eq!(cfg.server.base_url.as_deref(), Some("https://alerts.example.com"));
		assert_eq!(cfg.server.websocket_path, "/overlay");
		assert_eq!(cfg.server.test_bind, None);
		assert!(cfg.twitch.is_configured());
		assert!(cfg.twitch.user_access_token.is_none());
		assert_eq!(cfg.twitch.chat.command_cooldown, DEFAULT_COOLDOWN);
		assert_eq!(cfg.youtube.channel_id.as_deref(), Some("UC1"));
		assert_eq!(cfg.youtube.polling_interval_secs, 90);
	}

	#[test]
	fn env_overrides_win() {
		let env: HashMap<&str, &str> = HashMap::from([
			("ALERTCAST_BIND", "127.0.0.1:9000"),
			("ALERTCAST_DATABASE_URL", "sqlite://alertcast.db?mode=rwc"),
			("ALERTCAST_TWITCH_CLIENT_SECRET", "from-env"),
			("ALERTCAST_TWITCH_COMMAND_COOLDOWN_SECS", "30"),
			("ALERTCAST_TEST_BIND", " "),
			("ALERTCAST_YOUTUBE_API_KEY", ""),
		]);

		let mut cfg = parse("");
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.server.bind, "127.0.0.1:9000");
		assert_eq!(
			cfg.persistence.database_url.as_deref(),
			Some("sqlite://alertcast.db?mode=rwc")
		);
		assert_eq!(cfg.twitch.client_secret.as_ref().map(|s| s.expose()), Some("from-env"));
		assert_eq!(cfg.twitch.chat.command_cooldown, Duration::from_secs(30));
		assert_eq!(cfg.server.test_bind, None);
		assert!(cfg.youtube.api_key.is_none());
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("nope.toml");
		assert!(read_toml_if_exists(&path).unwrap().is_none());

		std::fs::write(&path, "[server]\nbind = 3").unwrap();
		assert!(read_toml_if_exists(&path).is_err());
	}
}
