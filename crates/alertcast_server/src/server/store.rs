#![forbid(unsafe_code)]

use alertcast_platform::{
	CredentialStore, Credentials, PollingCursor, SecretString, SubscriptionRecord, SubscriptionStatus,
};
use anyhow::{Context as _, anyhow};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;

/// SQL-backed credential, subscription and cursor store.
#[derive(Clone)]
pub struct SqlStore {
	backend: Backend,
}

#[derive(Clone)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

type CredentialRow = (String, String, String, i64);
type SubscriptionRow = (String, String, String, String, i64);
type CursorRow = (String, Option<String>, Option<String>, i64);

fn timestamp(secs: i64) -> anyhow::Result<DateTime<Utc>> {
	DateTime::from_timestamp(secs, 0).ok_or_else(|| anyhow!("timestamp out of range: {secs}"))
}

fn credentials_from_row((user_id, access_token, refresh_token, expires_at): CredentialRow) -> anyhow::Result<Credentials> {
	Ok(Credentials {
		user_id,
		access_token: SecretString::new(access_token),
		refresh_token: SecretString::new(refresh_token),
		expires_at: timestamp(expires_at)?,
	})
}

fn subscription_from_row((id, user_id, event_type, status, created_at): SubscriptionRow) -> anyhow::Result<SubscriptionRecord> {
	Ok(SubscriptionRecord {
		id,
		user_id,
		event_type,
		status: SubscriptionStatus::from_remote(&status),
		created_at: timestamp(created_at)?,
	})
}

fn cursor_from_row((channel_id, live_chat_id, next_page_token, updated_at): CursorRow) -> anyhow::Result<PollingCursor> {
	Ok(PollingCursor {
		channel_id,
		live_chat_id,
		next_page_token,
		updated_at: timestamp(updated_at)?,
	})
}

impl SqlStore {
	/// Connect by URL scheme and run the embedded migrations.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			// Each in-memory connection is its own database.
			let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
			let pool = SqlitePoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: Backend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: Backend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	pub fn backend_name(&self) -> &'static str {
		match &self.backend {
			Backend::Sqlite(_) => "sqlite",
			Backend::Postgres(_) => "postgres",
		}
	}
}

#[async_trait::async_trait]
impl CredentialStore for SqlStore {
	async fn load_credentials(&self, user_id: &str) -> anyhow::Result<Option<Credentials>> {
		let row: Option<CredentialRow> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(
				"SELECT user_id, access_token, refresh_token, expires_at FROM twitch_credentials WHERE user_id = ?",
			)
			.bind(user_id)
			.fetch_optional(pool)
			.await
			.context("select credentials (sqlite)")?,
			Backend::Postgres(pool) => sqlx::query_as(
				"SELECT user_id, access_token, refresh_token, expires_at FROM twitch_credentials WHERE user_id = $1",
			)
			.bind(user_id)
			.fetch_optional(pool)
			.await
			.context("select credentials (postgres)")?,
		};

		row.map(credentials_from_row).transpose()
	}

	async fn upsert_credentials(&self, creds: &Credentials) -> anyhow::Result<()> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO twitch_credentials (user_id, access_token, refresh_token, expires_at) VALUES (?, ?, ?, ?) \
					ON CONFLICT(user_id) DO UPDATE SET access_token = excluded.access_token, \
					refresh_token = excluded.refresh_token, expires_at = excluded.expires_at",
				)
				.bind(&creds.user_id)
				.bind(creds.access_token.expose())
				.bind(creds.refresh_token.expose())
				.bind(creds.expires_at.timestamp())
				.execute(pool)
				.await
				.context("upsert credentials (sqlite)")?;
			}
			Backend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO twitch_credentials (user_id, access_token, refresh_token, expires_at) VALUES ($1, $2, $3, $4) \
					ON CONFLICT(user_id) DO UPDATE SET access_token = excluded.access_token, \
					refresh_token = excluded.refresh_token, expires_at = excluded.expires_at",
				)
				.bind(&creds.user_id)
				.bind(creds.access_token.expose())
				.bind(creds.refresh_token.expose())
				.bind(creds.expires_at.timestamp())
				.execute(pool)
				.await
				.context("upsert credentials (postgres)")?;
			}
		}
		Ok(())
	}

	async fn load_subscription(&self, user_id: &str, event_type: &str) -> anyhow::Result<Option<SubscriptionRecord>> {
		let row: Option<SubscriptionRow> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, user_id, event_type, status, created_at FROM twitch_subscriptions \
				WHERE user_id = ? AND event_type = ?",
			)
			.bind(user_id)
			.bind(event_type)
			.fetch_optional(pool)
			.await
			.context("select subscription (sqlite)")?,
			Backend::Postgres(pool) => sqlx::query_as(
				"SELECT id, user_id, event_type, status, created_at FROM twitch_subscriptions \
				WHERE user_id = $1 AND event_type = $2",
			)
			.bind(user_id)
			.bind(event_type)
			.fetch_optional(pool)
			.await
			.context("select subscription (postgres)")?,
		};

		row.map(subscription_from_row).transpose()
	}

	async fn upsert_subscription(&self, record: &SubscriptionRecord) -> anyhow::Result<()> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO twitch_subscriptions (id, user_id, event_type, status, created_at) VALUES (?, ?, ?, ?, ?) \
					ON CONFLICT(user_id, event_type) DO UPDATE SET id = excluded.id, status = excluded.status, \
					created_at = excluded.created_at",
				)
				.bind(&record.id)
				.bind(&record.user_id)
				.bind(&record.event_type)
				.bind(record.status.as_str())
				.bind(record.created_at.timestamp())
				.execute(pool)
				.await
				.context("upsert subscription (sqlite)")?;
			}
			Backend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO twitch_subscriptions (id, user_id, event_type, status, created_at) VALUES ($1, $2, $3, $4, $5) \
					ON CONFLICT(user_id, event_type) DO UPDATE SET id = excluded.id, status = excluded.status, \
					created_at = excluded.created_at",
				)
				.bind(&record.id)
				.bind(&record.user_id)
				.bind(&record.event_type)
				.bind(record.status.as_str())
				.bind(record.created_at.timestamp())
				.execute(pool)
				.await
				.context("upsert subscription (postgres)")?;
			}
		}
		Ok(())
	}

	async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<bool> {
		let affected = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query("DELETE FROM twitch_subscriptions WHERE id = ?")
				.bind(subscription_id)
				.execute(pool)
				.await
				.context("delete subscription (sqlite)")?
				.rows_affected(),
			Backend::Postgres(pool) => sqlx::query("DELETE FROM twitch_subscriptions WHERE id = $1")
				.bind(subscription_id)
				.execute(pool)
				.await
				.context("delete subscription (postgres)")?
				.rows_affected(),
		};
		Ok(affected > 0)
	}

	async fn load_cursor(&self, channel_id: &str) -> anyhow::Result<Option<PollingCursor>> {
		let row: Option<CursorRow> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(
				"SELECT channel_id, live_chat_id, next_page_token, updated_at FROM youtube_state WHERE channel_id = ?",
			)
			.bind(channel_id)
			.fetch_optional(pool)
			.await
			.context("select cursor (sqlite)")?,
			Backend::Postgres(pool) => sqlx::query_as(
				"SELECT channel_id, live_chat_id, next_page_token, updated_at FROM youtube_state WHERE channel_id = $1",
			)
			.bind(channel_id)
			.fetch_optional(pool)
			.await
			.context("select cursor (postgres)")?,
		};

		row.map(cursor_from_row).transpose()
	}

	async fn upsert_cursor(&self, cursor: &PollingCursor) -> anyhow::Result<()> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO youtube_state (channel_id, live_chat_id, next_page_token, updated_at) VALUES (?, ?, ?, ?) \
					ON CONFLICT(channel_id) DO UPDATE SET live_chat_id = excluded.live_chat_id, \
					next_page_token = excluded.next_page_token, updated_at = excluded.updated_at",
				)
				.bind(&cursor.channel_id)
				.bind(cursor.live_chat_id.as_deref())
				.bind(cursor.next_page_token.as_deref())
				.bind(cursor.updated_at.timestamp())
				.execute(pool)
				.await
				.context("upsert cursor (sqlite)")?;
			}
			Backend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO youtube_state (channel_id, live_chat_id, next_page_token, updated_at) VALUES ($1, $2, $3, $4) \
					ON CONFLICT(channel_id) DO UPDATE SET live_chat_id = excluded.live_chat_id, \
					next_page_token = excluded.next_page_token, updated_at = excluded.updated_at",
				)
				.bind(&cursor.channel_id)
				.bind(cursor.live_chat_id.as_deref())
				.bind(cursor.next_page_token.as_deref())
				.bind(cursor.updated_at.timestamp())
				.execute(pool)
				.await
				.context("upsert cursor (postgres)")?;
			}
		}
		Ok(())
	}
}
