#![forbid(unsafe_code)]

pub mod commands;
pub mod rate_limit;
pub mod store;
pub mod twitch;
pub mod youtube;

use std::fmt;

use alertcast_domain::AlertEvent;
use serde::Deserialize;

pub use rate_limit::{RateLimitError, RateLimiter};
pub use store::{CredentialStore, Credentials, InMemoryStore, PollingCursor, SubscriptionRecord, SubscriptionStatus};

/// Destination for normalized events produced by the ingestion sources.
///
/// Implementations must not block: producers call this from request
/// handlers and polling loops.
pub trait AlertSink: Send + Sync {
	fn publish(&self, event: AlertEvent);
}

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

#[cfg(test)]
pub(crate) mod test_support {
	use parking_lot::Mutex;

	use super::*;

	/// Sink that records everything published to it.
	#[derive(Default)]
	pub(crate) struct RecordingSink {
		events: Mutex<Vec<AlertEvent>>,
	}

	impl RecordingSink {
		pub(crate) fn events(&self) -> Vec<AlertEvent> {
			self.events.lock().clone()
		}
	}

	impl AlertSink for RecordingSink {
		fn publish(&self, event: AlertEvent) {
			self.events.lock().push(event);
		}
	}
}
