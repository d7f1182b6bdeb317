#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::SecretString;

/// OAuth credentials for one account.
///
/// Only the refresh routine writes these; every other reader loads a fresh
/// copy from the store per use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
	pub user_id: String,
	pub access_token: SecretString,
	pub refresh_token: SecretString,
	pub expires_at: DateTime<Utc>,
}

impl Credentials {
	pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
		now >= self.expires_at
	}
}

/// Remote subscription lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionStatus {
	Enabled,
	Pending,
	Revoked,
}

impl SubscriptionStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			SubscriptionStatus::Enabled => "enabled",
			SubscriptionStatus::Pending => "webhook_callback_verification_pending",
			SubscriptionStatus::Revoked => "revoked",
		}
	}

	/// Map a remote status string. Anything that is neither enabled nor
	/// pending (failures, revocations, moderator removals) counts as revoked.
	pub fn from_remote(status: &str) -> Self {
		match status.trim() {
			"enabled" => SubscriptionStatus::Enabled,
			"webhook_callback_verification_pending" | "pending" => SubscriptionStatus::Pending,
			_ => SubscriptionStatus::Revoked,
		}
	}
}

impl fmt::Display for SubscriptionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Local record of a remote event subscription, keyed by `(user_id, event_type)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
	pub id: String,
	pub user_id: String,
	pub event_type: String,
	pub status: SubscriptionStatus,
	pub created_at: DateTime<Utc>,
}

/// Resumable polling position for one monitored channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingCursor {
	pub channel_id: String,
	pub live_chat_id: Option<String>,
	pub next_page_token: Option<String>,
	pub updated_at: DateTime<Utc>,
}

/// Persistence contract consumed by the ingestion sources.
///
/// Every write is a single-row upsert; implementations must make each one
/// atomic at the row level.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
	async fn load_credentials(&self, user_id: &str) -> anyhow::Result<Option<Credentials>>;

	async fn upsert_credentials(&self, creds: &Credentials) -> anyhow::Result<()>;

	async fn load_subscription(&self, user_id: &str, event_type: &str) -> anyhow::Result<Option<SubscriptionRecord>>;

	/// Insert or replace the record for `(user_id, event_type)`.
	async fn upsert_subscription(&self, record: &SubscriptionRecord) -> anyhow::Result<()>;

	/// Delete by remote subscription id. Returns whether a record existed.
	async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<bool>;

	async fn load_cursor(&self, channel_id: &str) -> anyhow::Result<Option<PollingCursor>>;

	async fn upsert_cursor(&self, cursor: &PollingCursor) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct Tables {
	credentials: HashMap<String, Credentials>,
	subscriptions: HashMap<(String, String), SubscriptionRecord>,
	cursors: HashMap<String, PollingCursor>,
}

/// Process-local store used when no database is configured, and by tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
	inner: Mutex<Tables>,
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of subscription records currently held.
	pub fn subscription_count(&self) -> usize {
		self.inner.lock().subscriptions.len()
	}
}

#[async_trait::async_trait]
impl CredentialStore for InMemoryStore {
	async fn load_credentials(&self, user_id: &str) -> anyhow::Result<Option<Credentials>> {
		Ok(self.inner.lock().credentials.get(user_id).cloned())
	}

	async fn upsert_credentials(&self, creds: &Credentials) -> anyhow::Result<()> {
		self.inner
			.lock()
			.credentials
			.insert(creds.user_id.clone(), creds.clone());
		Ok(())
	}

	async fn load_subscription(&self, user_id: &str, event_type: &str) -> anyhow::Result<Option<SubscriptionRecord>> {
		let key = (user_id.to_string(), event_type.to_string());
		Ok(self.inner.lock().subscriptions.get(&key).cloned())
	}

	async fn upsert_subscription(&self, record: &SubscriptionRecord) -> anyhow::Result<()> {
		let key = (record.user_id.clone(), record.event_type.clone());
		self.inner.lock().subscriptions.insert(key, record.clone());
		Ok(())
	}

	async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<bool> {
		let mut inner = self.inner.lock();
		let before = inner.subscriptions.len();
		inner.subscriptions.retain(|_, rec| rec.id != subscription_id);
		Ok(inner.subscriptions.len() != before)
	}

	async fn load_cursor(&self, channel_id: &str) -> anyhow::Result<Option<PollingCursor>> {
		Ok(self.inner.lock().cursors.get(channel_id).cloned())
	}

	async fn upsert_cursor(&self, cursor: &PollingCursor) -> anyhow::Result<()> {
		self.inner
			.lock()
			.cursors
			.insert(cursor.channel_id.clone(), cursor.clone());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(id: &str, event_type: &str) -> SubscriptionRecord {
		SubscriptionRecord {
			id: id.to_string(),
			user_id: "42".to_string(),
			event_type: event_type.to_string(),
			status: SubscriptionStatus::Enabled,
			created_at: Utc::now(),
		}
	}

	#[tokio::test]
	async fn subscription_upsert_keeps_one_record_per_pair() {
		let store = InMemoryStore::new();
		store.upsert_subscription(&record("a", "channel.cheer")).await.unwrap();
		store.upsert_subscription(&record("b", "channel.cheer")).await.unwrap();

		let got = store.load_subscription("42", "channel.cheer").await.unwrap().expect("record");
		assert_eq!(got.id, "b");
		assert_eq!(store.subscription_count(), 1);
	}

	#[tokio::test]
	async fn delete_by_remote_id() {
		let store = InMemoryStore::new();
		store.upsert_subscription(&record("a", "channel.cheer")).await.unwrap();
		store.upsert_subscription(&record("b", "channel.raid")).await.unwrap();

		assert!(store.delete_subscription("a").await.unwrap());
		assert!(!store.delete_subscription("a").await.unwrap());
		assert!(store.load_subscription("42", "channel.cheer").await.unwrap().is_none());
		assert!(store.load_subscription("42", "channel.raid").await.unwrap().is_some());
	}

	#[test]
	fn remote_status_mapping() {
		assert_eq!(SubscriptionStatus::from_remote("enabled"), SubscriptionStatus::Enabled);
		assert_eq!(
			SubscriptionStatus::from_remote("webhook_callback_verification_pending"),
			SubscriptionStatus::Pending
		);
		assert_eq!(
			SubscriptionStatus::from_remote("authorization_revoked"),
			SubscriptionStatus::Revoked
		);
	}
}
