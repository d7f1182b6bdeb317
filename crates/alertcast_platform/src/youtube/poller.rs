#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use alertcast_domain::{AlertEvent, Platform};
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{LiveChatApi, LiveChatError, LiveChatMessage};
use crate::commands::{COMMAND_PREFIX, ChatRoles, CommandDispatcher, Dispatch};
use crate::{AlertSink, CredentialStore, PollingCursor, RateLimitError, RateLimiter};

pub const MIN_POLL_INTERVAL_SECS: u64 = 5;
pub const MAX_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

const SUPER_CHAT_EVENT: &str = "superChatEvent";
const SUPER_STICKER_EVENT: &str = "superStickerEvent";
const TEXT_MESSAGE_EVENT: &str = "textMessageEvent";

/// Polling period for a configured value; anything outside 5..=60 seconds
/// falls back to the default instead of being clamped.
pub fn poll_interval(secs: u64) -> Duration {
	if (MIN_POLL_INTERVAL_SECS..=MAX_POLL_INTERVAL_SECS).contains(&secs) {
		Duration::from_secs(secs)
	} else {
		Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)
	}
}

#[derive(Debug, Error)]
pub enum ResolveError {
	#[error("channel {0} has no live broadcast")]
	NotLive(String),
	#[error("live video {0} has no active chat")]
	NoActiveChat(String),
	#[error("youtube api: {0:#}")]
	Api(anyhow::Error),
	#[error("polling store: {0:#}")]
	Store(anyhow::Error),
	#[error(transparent)]
	Cancelled(#[from] RateLimitError),
}

#[derive(Debug, Error)]
pub enum PollError {
	#[error("no live chat session for channel {0}")]
	NoSession(String),
	#[error("live chat session ended ({0})")]
	SessionGone(String),
	#[error("fetch live chat messages: {0:#}")]
	Fetch(anyhow::Error),
	/// The page was fetched but its continuation token could not be saved; it
	/// was not processed.
	#[error("persist continuation token: {0:#}")]
	Persist(anyhow::Error),
	#[error("polling store: {0:#}")]
	Store(anyhow::Error),
	#[error(transparent)]
	Cancelled(#[from] RateLimitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
	Uninitialized,
	SessionActive,
	SessionExpired,
	Terminated,
}

/// What one successful `poll_once` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
	pub fetched: usize,
	pub published: usize,
	/// Commands that fired or produced a listing.
	pub commands: usize,
	pub next_page_token: Option<String>,
}

/// Polls one channel's live chat and forwards monetization events and
/// chat commands.
pub struct PollingEngine {
	channel_id: String,
	api: Arc<dyn LiveChatApi>,
	store: Arc<dyn CredentialStore>,
	sink: Arc<dyn AlertSink>,
	commands: Arc<CommandDispatcher>,
	limiter: Arc<RateLimiter>,
	interval: Duration,
	cancel: CancellationToken,
	state: Mutex<EngineState>,
}

impl PollingEngine {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		channel_id: impl Into<String>,
		api: Arc<dyn LiveChatApi>,
		store: Arc<dyn CredentialStore>,
		sink: Arc<dyn AlertSink>,
		commands: Arc<CommandDispatcher>,
		limiter: Arc<RateLimiter>,
		interval: Duration,
		cancel: CancellationToken,
	) -> Self {
		Self {
			channel_id: channel_id.into(),
			api,
			store,
			sink,
			commands,
			limiter,
			interval,
			cancel,
			state: Mutex::new(EngineState::Uninitialized),
		}
	}

	pub fn channel_id(&self) -> &str {
		&self.channel_id
	}

	pub fn state(&self) -> EngineState {
		*self.state.lock()
	}

	fn set_state(&self, next: EngineState) {
		let mut state = self.state.lock();
		if *state != next {
			debug!(channel_id = %self.channel_id, from = ?*state, to = ?next, "polling engine state change");
			*state = next;
		}
	}

	/// Find the channel's live chat and persist it as the cursor's session.
	///
	/// The stored continuation token survives when the chat is unchanged; a
	/// different chat starts from the top.
	pub async fn resolve_session(&self) -> Result<String, ResolveError> {
		self.limiter.acquire(&self.cancel).await?;
		let video_id = self
			.api
			.find_live_video(&self.channel_id)
			.await
			.map_err(ResolveError::Api)?
			.ok_or_else(|| ResolveError::NotLive(self.channel_id.clone()))?;

		self.limiter.acquire(&self.cancel).await?;
		let live_chat_id = self
			.api
			.active_live_chat_id(&video_id)
			.await
			.map_err(ResolveError::Api)?
			.ok_or_else(|| ResolveError::NoActiveChat(video_id.clone()))?;

		let previous = self
			.store
			.load_cursor(&self.channel_id)
			.await
			.map_err(ResolveError::Store)?;
		// Same chat after a restart: resume from the stored continuation token.
		let next_page_token = previous
			.filter(|c| c.live_chat_id.as_deref() == Some(live_chat_id.as_str()))
			.and_then(|c| c.next_page_token);
		let resumed = next_page_token.is_some();

		let cursor = PollingCursor {
			channel_id: self.channel_id.clone(),
			live_chat_id: Some(live_chat_id.clone()),
			next_page_token,
			updated_at: Utc::now(),
		};
		self.store.upsert_cursor(&cursor).await.map_err(ResolveError::Store)?;

		info!(channel_id = %self.channel_id, %video_id, %live_chat_id, resumed, "youtube live chat session resolved");
		self.set_state(EngineState::SessionActive);
		Ok(live_chat_id)
	}

	/// Fetch one page, persist its continuation token, then process its items.
	pub async fn poll_once(&self) -> Result<PollReport, PollError> {
		let cursor = self
			.store
			.load_cursor(&self.channel_id)
			.await
			.map_err(PollError::Store)?;
		let Some(mut cursor) = cursor.filter(|c| c.live_chat_id.is_some()) else {
			return Err(PollError::NoSession(self.channel_id.clone()));
		};
		let live_chat_id = cursor.live_chat_id.clone().unwrap_or_default();

		self.limiter.acquire(&self.cancel).await?;
		let page = match self
			.api
			.list_messages(&live_chat_id, cursor.next_page_token.as_deref())
			.await
		{
			Ok(page) => page,
			Err(LiveChatError::SessionGone { reason }) => return Err(PollError::SessionGone(reason)),
			Err(LiveChatError::Api(e)) => return Err(PollError::Fetch(e)),
		};

		if let Some(token) = page.next_page_token.as_ref().filter(|t| !t.is_empty()) {
			cursor.next_page_token = Some(token.clone());
		}
		cursor.updated_at = Utc::now();
		self.store.upsert_cursor(&cursor).await.map_err(PollError::Persist)?;

		let mut report = PollReport {
			fetched: page.items.len(),
			next_page_token: cursor.next_page_token.clone(),
			..Default::default()
		};

		for item in &page.items {
			if let Some(event) = monetization_event(item) {
				info!(channel_id = %self.channel_id, kind = event.kind(), author = %item.author_details.display_name, "youtube monetization event");
				self.sink.publish(event);
				report.published += 1;
				continue;
			}

			let Some(text) = command_text(item) else {
				continue;
			};
			let author = &item.author_details;
			let roles = ChatRoles {
				broadcaster: author.is_chat_owner,
				moderator: author.is_chat_moderator,
				vip: false,
				subscriber: author.is_chat_sponsor,
			};
			let outcome = self
				.commands
				.dispatch(Platform::YouTube, &author.display_name, text, roles, None)
				.await;
			if matches!(outcome, Dispatch::Fired(_) | Dispatch::Listed) {
				report.commands += 1;
			}
		}

		Ok(report)
	}

	/// Resolve the session, then poll on a fixed period until cancelled.
	///
	/// Errors only when the startup resolve fails; steady-state failures are
	/// logged and the next tick tries again.
	pub async fn run(&self) -> Result<(), ResolveError> {
		if let Err(e) = self.resolve_session().await {
			error!(channel_id = %self.channel_id, error = %e, "youtube live chat session could not be resolved; polling disabled");
			self.set_state(EngineState::Terminated);
			return Err(e);
		}

		let mut ticker = tokio::time::interval(self.interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		ticker.tick().await;

		info!(channel_id = %self.channel_id, interval_secs = self.interval.as_secs(), "youtube polling started");

		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => break,
				_ = ticker.tick() => {}
			}

			if self.state() == EngineState::SessionExpired {
				match self.resolve_session().await {
					Ok(_) => {}
					Err(ResolveError::Cancelled(_)) => break,
					Err(e) => {
						debug!(channel_id = %self.channel_id, error = %e, "youtube session still unavailable");
						continue;
					}
				}
			}

			match self.poll_once().await {
				Ok(report) => {
					metrics::counter!("alertcast_youtube_poll_cycles_ok_total").increment(1);
					debug!(
						channel_id = %self.channel_id,
						fetched = report.fetched,
						published = report.published,
						commands = report.commands,
						"youtube poll cycle"
					);
				}
				Err(PollError::Cancelled(_)) => break,
				Err(e @ (PollError::SessionGone(_) | PollError::NoSession(_))) => {
					metrics::counter!("alertcast_youtube_poll_cycles_failed_total").increment(1);
					warn!(channel_id = %self.channel_id, error = %e, "youtube live chat session expired");
					self.set_state(EngineState::SessionExpired);
				}
				Err(e) => {
					metrics::counter!("alertcast_youtube_poll_cycles_failed_total").increment(1);
					warn!(channel_id = %self.channel_id, error = %e, "youtube poll cycle failed");
				}
			}
		}

		info!(channel_id = %self.channel_id, "youtube polling stopped");
		self.set_state(EngineState::Terminated);
		Ok(())
	}
}

fn monetization_event(item: &LiveChatMessage) -> Option<AlertEvent> {
	let snippet = &item.snippet;
	let user_name = item.author_details.display_name.clone();

	match snippet.kind.as_str() {
		SUPER_CHAT_EVENT => {
			let details = snippet.super_chat_details.clone().unwrap_or_default();
			Some(AlertEvent::YoutubeSuperChat {
				user_name,
				amount_string: details.amount_display_string,
				message: details.user_comment,
				tier: details.tier,
			})
		}
		SUPER_STICKER_EVENT => {
			let details = snippet.super_sticker_details.clone().unwrap_or_default();
			Some(AlertEvent::YoutubeSuperSticker {
				user_name,
				amount_string: details.amount_display_string,
				sticker_alt: details
					.super_sticker_metadata
					.map(|m| m.alt_text)
					.unwrap_or_default(),
			})
		}
		_ => None,
	}
}

fn command_text(item: &LiveChatMessage) -> Option<&str> {
	if item.snippet.kind != TEXT_MESSAGE_EVENT {
		return None;
	}
	item.snippet
		.display_message
		.as_deref()
		.filter(|t| t.trim_start().starts_with(COMMAND_PREFIX))
}
