#![forbid(unsafe_code)]

use alertcast_platform::{
	CredentialStore, Credentials, PollingCursor, SecretString, SubscriptionRecord, SubscriptionStatus,
};
use chrono::{DateTime, Utc};

use crate::server::store::SqlStore;

async fn store() -> SqlStore {
	SqlStore::connect("sqlite::memory:").await.expect("in-memory sqlite")
}

fn at(secs: i64) -> DateTime<Utc> {
	DateTime::from_timestamp(secs, 0).unwrap()
}

fn record(id: &str, status: SubscriptionStatus) -> SubscriptionRecord {
	SubscriptionRecord {
		id: id.to_string(),
		user_id: "141981764".to_string(),
		event_type: "channel.cheer".to_string(),
		status,
		created_at: at(1_760_000_000),
	}
}

#[tokio::test]
async fn credentials_are_overwritten_in_place() {
	let store = store().await;
	assert_eq!(store.backend_name(), "sqlite");
	assert!(store.load_credentials("141981764").await.unwrap().is_none());

	let mut creds = Credentials {
		user_id: "141981764".to_string(),
		access_token: SecretString::new("access-1"),
		refresh_token: SecretString::new("refresh-1"),
		expires_at: at(1_760_003_600),
	};
	store.upsert_credentials(&creds).await.unwrap();

	creds.access_token = SecretString::new("access-2");
	creds.expires_at = at(1_760_007_200);
	store.upsert_credentials(&creds).await.unwrap();

	assert_eq!(store.load_credentials("141981764").await.unwrap(), Some(creds));
}

#[tokio::test]
async fn one_subscription_record_per_user_and_type() {
	let store = store().await;

	store
		.upsert_subscription(&record("old-id", SubscriptionStatus::Pending))
		.await
		.unwrap();
	store
		.upsert_subscription(&record("new-id", SubscriptionStatus::Enabled))
		.await
		.unwrap();

	let loaded = store
		.load_subscription("141981764", "channel.cheer")
		.await
		.unwrap()
		.unwrap();
	assert_eq!(loaded, record("new-id", SubscriptionStatus::Enabled));

	assert!(!store.delete_subscription("old-id").await.unwrap());
	assert!(store.delete_subscription("new-id").await.unwrap());
	assert!(
		store
			.load_subscription("141981764", "channel.cheer")
			.await
			.unwrap()
			.is_none()
	);
}

#[tokio::test]
async fn cursor_keeps_nullable_columns() {
	let store = store().await;

	let mut cursor = PollingCursor {
		channel_id: "UCdallas".to_string(),
		live_chat_id: Some("chat-1".to_string()),
		next_page_token: None,
		updated_at: at(1_760_000_000),
	};
	store.upsert_cursor(&cursor).await.unwrap();
	assert_eq!(store.load_cursor("UCdallas").await.unwrap(), Some(cursor.clone()));

	cursor.next_page_token = Some("T2".to_string());
	cursor.updated_at = at(1_760_000_005);
	store.upsert_cursor(&cursor).await.unwrap();
	assert_eq!(store.load_cursor("UCdallas").await.unwrap(), Some(cursor));

	assert!(store.load_cursor("UCother").await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_scheme_is_rejected() {
	let err = SqlStore::connect("mysql://localhost/alertcast").await.err().unwrap();
	assert!(err.to_string().contains("unsupported database_url"));
}

#[tokio::test]
async fn file_database_survives_reconnect() {
	let dir = tempfile::tempdir().unwrap();
	let url = format!("sqlite://{}?mode=rwc", dir.path().join("alertcast.db").display());

	{
		let store = SqlStore::connect(&url).await.unwrap();
		store
			.upsert_subscription(&record("sub-1", SubscriptionStatus::Enabled))
			.await
			.unwrap();
	}

	let store = SqlStore::connect(&url).await.unwrap();
	assert!(
		store
			.load_subscription("141981764", "channel.cheer")
			.await
			.unwrap()
			.is_some()
	);
}
