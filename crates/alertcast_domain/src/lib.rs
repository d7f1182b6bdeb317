#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Twitch CDN template for emote images (scale 3.0, dark theme).
const TWITCH_EMOTE_URL_PREFIX: &str = "https://static-cdn.jtvnw.net/emoticons/v2/";
const TWITCH_EMOTE_URL_SUFFIX: &str = "/default/dark/3.0";

/// Ingestion sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
	Twitch,
	YouTube,
}

impl Platform {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::Twitch => "twitch",
			Platform::YouTube => "youtube",
		}
	}
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing domain values from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
	#[error("unknown tier: {0}")]
	UnknownTier(String),
	#[error("unsupported media extension: {0}")]
	UnsupportedMedia(String),
}

impl FromStr for Platform {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"twitch" => Ok(Platform::Twitch),
			"youtube" | "you_tube" | "yt" => Ok(Platform::YouTube),
			other => Err(ParseError::UnknownPlatform(other.to_string())),
		}
	}
}

/// Permission level a command requires.
///
/// Ordered from least to most privileged; `Everyone < Subscriber < Vip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
	Everyone,
	Subscriber,
	Vip,
}

impl Tier {
	/// All tiers, in scan order.
	pub const ALL: [Tier; 3] = [Tier::Everyone, Tier::Subscriber, Tier::Vip];

	pub const fn as_str(self) -> &'static str {
		match self {
			Tier::Everyone => "everyone",
			Tier::Subscriber => "subscriber",
			Tier::Vip => "vip",
		}
	}

	/// Directory name holding this tier's media files.
	pub const fn folder(self) -> &'static str {
		match self {
			Tier::Everyone => "everyone",
			Tier::Subscriber => "subscribers",
			Tier::Vip => "vips",
		}
	}
}

impl fmt::Display for Tier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Tier {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"everyone" => Ok(Tier::Everyone),
			"subscriber" | "subscribers" => Ok(Tier::Subscriber),
			"vip" | "vips" => Ok(Tier::Vip),
			other => Err(ParseError::UnknownTier(other.to_string())),
		}
	}
}

/// Kind of media a sound command plays on the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
	Audio,
	Video,
}

impl MediaKind {
	/// Classify a file extension (with or without the leading dot, any case).
	pub fn from_extension(ext: &str) -> Result<Self, ParseError> {
		let ext = ext.trim().trim_start_matches('.');
		if ext.is_empty() {
			return Err(ParseError::Empty);
		}

		match ext.to_ascii_lowercase().as_str() {
			"mp3" | "wav" | "ogg" => Ok(MediaKind::Audio),
			"mp4" | "webm" => Ok(MediaKind::Video),
			other => Err(ParseError::UnsupportedMedia(other.to_string())),
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			MediaKind::Audio => "audio",
			MediaKind::Video => "video",
		}
	}
}

impl fmt::Display for MediaKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Source-agnostic engagement event, serialized as the overlay wire payload.
///
/// The JSON form carries a `type` discriminator plus only the fields the
/// overlay renders. Values are immutable once built and have no identity
/// beyond their content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertEvent {
	TwitchFollow {
		user_name: String,
		channel_name: String,
	},
	TwitchSubscribe {
		user_name: String,
		tier: String,
		is_gift: bool,
	},
	TwitchResubscribe {
		user_name: String,
		tier: String,
		message: String,
		cumulative_months: u32,
		streak_months: u32,
	},
	TwitchGiftSub {
		gifter_name: String,
		total_gifts: u32,
		tier: String,
		is_anonymous: bool,
	},
	TwitchCheer {
		user_name: String,
		bits: u64,
		message: String,
		is_anonymous: bool,
	},
	TwitchRaid {
		raider_name: String,
		viewers: u64,
	},
	YoutubeSuperChat {
		user_name: String,
		amount_string: String,
		message: String,
		tier: u32,
	},
	YoutubeSuperSticker {
		user_name: String,
		amount_string: String,
		sticker_alt: String,
	},
	SoundCommand {
		filename: String,
		media_type: MediaKind,
	},
	EmoteWall {
		emotes: Vec<String>,
	},
}

impl AlertEvent {
	/// Wire discriminator (`type` field).
	pub const fn kind(&self) -> &'static str {
		match self {
			AlertEvent::TwitchFollow { .. } => "twitch_follow",
			AlertEvent::TwitchSubscribe { .. } => "twitch_subscribe",
			AlertEvent::TwitchResubscribe { .. } => "twitch_resubscribe",
			AlertEvent::TwitchGiftSub { .. } => "twitch_gift_sub",
			AlertEvent::TwitchCheer { .. } => "twitch_cheer",
			AlertEvent::TwitchRaid { .. } => "twitch_raid",
			AlertEvent::YoutubeSuperChat { .. } => "youtube_super_chat",
			AlertEvent::YoutubeSuperSticker { .. } => "youtube_super_sticker",
			AlertEvent::SoundCommand { .. } => "sound_command",
			AlertEvent::EmoteWall { .. } => "emote_wall",
		}
	}

	/// Source the event originated from, if it is tied to one.
	pub const fn platform(&self) -> Option<Platform> {
		match self {
			AlertEvent::TwitchFollow { .. }
			| AlertEvent::TwitchSubscribe { .. }
			| AlertEvent::TwitchResubscribe { .. }
			| AlertEvent::TwitchGiftSub { .. }
			| AlertEvent::TwitchCheer { .. }
			| AlertEvent::TwitchRaid { .. }
			| AlertEvent::EmoteWall { .. } => Some(Platform::Twitch),
			AlertEvent::YoutubeSuperChat { .. } | AlertEvent::YoutubeSuperSticker { .. } => Some(Platform::YouTube),
			AlertEvent::SoundCommand { .. } => None,
		}
	}
}

/// CDN URL for a Twitch emote id.
pub fn twitch_emote_url(emote_id: &str) -> String {
	format!("{TWITCH_EMOTE_URL_PREFIX}{emote_id}{TWITCH_EMOTE_URL_SUFFIX}")
}
