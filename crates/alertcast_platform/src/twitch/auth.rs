#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tracing::{info, warn};

use super::helix::EventSubApi;
use crate::{CredentialStore, Credentials, SecretString};

/// Token value shipped in sample configs; treated as "not configured".
pub const PLACEHOLDER_USER_TOKEN: &str = "il_token_lungo_che_hai_appena_copiato";

/// Lifetime assumed for a configured token whose expiry is unknown.
const UNKNOWN_TOKEN_TTL_SECS: u64 = 3600;

const MAX_TOKEN_TTL_SECS: u64 = 365 * 24 * 3600;

fn token_ttl(expires_in: u64) -> ChronoDuration {
	ChronoDuration::seconds(expires_in.min(MAX_TOKEN_TTL_SECS) as i64)
}

#[derive(Debug, Error)]
pub enum RefreshError {
	#[error("no stored credentials for user {0}")]
	MissingCredentials(String),
	#[error("refresh token is empty; re-authorize the account")]
	EmptyRefreshToken,
	#[error("token refresh rejected: {0:#}")]
	Remote(anyhow::Error),
	#[error("credential store: {0:#}")]
	Store(anyhow::Error),
}

/// The only writer of stored credentials.
pub struct TokenRefresher {
	api: Arc<dyn EventSubApi>,
	store: Arc<dyn CredentialStore>,
}

impl TokenRefresher {
	pub fn new(api: Arc<dyn EventSubApi>, store: Arc<dyn CredentialStore>) -> Self {
		Self { api, store }
	}

	/// Return usable credentials for `user_id`, exchanging the refresh token
	/// and persisting the result when the stored ones have expired.
	pub async fn refresh_if_expired(&self, user_id: &str) -> Result<Credentials, RefreshError> {
		let creds = self
			.store
			.load_credentials(user_id)
			.await
			.map_err(RefreshError::Store)?
			.ok_or_else(|| RefreshError::MissingCredentials(user_id.to_string()))?;

		let now = Utc::now();
		if !creds.is_expired_at(now) {
			return Ok(creds);
		}

		if creds.refresh_token.is_empty() {
			return Err(RefreshError::EmptyRefreshToken);
		}

		let grant = self
			.api
			.refresh_user_token(&creds.refresh_token)
			.await
			.map_err(RefreshError::Remote)?;

		let refreshed = Credentials {
			user_id: creds.user_id.clone(),
			access_token: SecretString::new(grant.access_token),
			refresh_token: grant
				.refresh_token
				.filter(|t| !t.trim().is_empty())
				.map(SecretString::new)
				.unwrap_or(creds.refresh_token),
			expires_at: now + token_ttl(grant.expires_in),
		};

		self.store
			.upsert_credentials(&refreshed)
			.await
			.map_err(RefreshError::Store)?;

		info!(user_id, expires_at = %refreshed.expires_at, "refreshed twitch user token");
		metrics::counter!("alertcast_twitch_token_refreshes_total").increment(1);
		Ok(refreshed)
	}
}

/// Outcome of one credential strategy.
#[derive(Debug)]
pub enum StrategyOutcome {
	Ready(Credentials),
	Declined(String),
}

/// One way of obtaining a user credential at startup.
#[async_trait::async_trait]
pub trait CredentialStrategy: Send + Sync {
	fn name(&self) -> &'static str;

	async fn attempt(&self, user_id: &str) -> StrategyOutcome;
}

/// Why a strategy declined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declined {
	pub strategy: &'static str,
	pub reason: String,
}

/// Evaluate `strategies` in order and return the first usable credential,
/// or every strategy's reason for declining.
pub async fn resolve_credential(
	strategies: &[Box<dyn CredentialStrategy>],
	user_id: &str,
) -> Result<Credentials, Vec<Declined>> {
	let mut declined = Vec::with_capacity(strategies.len());

	for strategy in strategies {
		match strategy.attempt(user_id).await {
			StrategyOutcome::Ready(creds) => {
				info!(user_id, strategy = strategy.name(), "twitch user credential ready");
				return Ok(creds);
			}
			StrategyOutcome::Declined(reason) => {
				info!(user_id, strategy = strategy.name(), %reason, "credential strategy declined");
				declined.push(Declined {
					strategy: strategy.name(),
					reason,
				});
			}
		}
	}

	Err(declined)
}

/// A stored credential that has not expired yet.
pub struct StoredCredential {
	store: Arc<dyn CredentialStore>,
}

impl StoredCredential {
	pub fn new(store: Arc<dyn CredentialStore>) -> Self {
		Self { store }
	}
}

#[async_trait::async_trait]
impl CredentialStrategy for StoredCredential {
	fn name(&self) -> &'static str {
		"stored"
	}

	async fn attempt(&self, user_id: &str) -> StrategyOutcome {
		match self.store.load_credentials(user_id).await {
			Ok(Some(creds)) if !creds.is_expired_at(Utc::now()) => StrategyOutcome::Ready(creds),
			Ok(Some(_)) => StrategyOutcome::Declined("stored credential expired".to_string()),
			Ok(None) => StrategyOutcome::Declined("no stored credential".to_string()),
			Err(e) => StrategyOutcome::Declined(format!("credential store: {e:#}")),
		}
	}
}

/// An expired stored credential exchanged through its refresh token.
pub struct RefreshedCredential {
	refresher: Arc<TokenRefresher>,
}

impl RefreshedCredential {
	pub fn new(refresher: Arc<TokenRefresher>) -> Self {
		Self { refresher }
	}
}

#[async_trait::async_trait]
impl CredentialStrategy for RefreshedCredential {
	fn name(&self) -> &'static str {
		"refreshed"
	}

	async fn attempt(&self, user_id: &str) -> StrategyOutcome {
		match self.refresher.refresh_if_expired(user_id).await {
			Ok(creds) => StrategyOutcome::Ready(creds),
			Err(e) => StrategyOutcome::Declined(e.to_string()),
		}
	}
}

/// Operator-supplied user token from config. Never refreshed or persisted.
pub struct ConfiguredToken {
	api: Arc<dyn EventSubApi>,
	token: SecretString,
}

impl ConfiguredToken {
	pub fn new(api: Arc<dyn EventSubApi>, token: SecretString) -> Self {
		Self { api, token }
	}
}

#[async_trait::async_trait]
impl CredentialStrategy for ConfiguredToken {
	fn name(&self) -> &'static str {
		"configured"
	}

	async fn attempt(&self, user_id: &str) -> StrategyOutcome {
		if self.token.is_empty() || self.token.expose().trim() == PLACEHOLDER_USER_TOKEN {
			return StrategyOutcome::Declined("user_access_token is missing or a placeholder".to_string());
		}

		let now = Utc::now();
		let creds = |expires_at: DateTime<Utc>| Credentials {
			user_id: user_id.to_string(),
			access_token: self.token.clone(),
			refresh_token: SecretString::default(),
			expires_at,
		};

		match self.api.validate_token(&self.token).await {
			Ok(Some(validation)) => {
				info!(user_id, login = %validation.login, "configured twitch token validated");
				let ttl = match validation.expires_in {
					0 => token_ttl(UNKNOWN_TOKEN_TTL_SECS),
					n => token_ttl(n),
				};
				StrategyOutcome::Ready(creds(now + ttl))
			}
			Ok(None) => StrategyOutcome::Declined("configured token is invalid or expired".to_string()),
			Err(e) => {
				warn!(user_id, error = %e, "could not validate configured twitch token; using it anyway");
				StrategyOutcome::Ready(creds(now + token_ttl(UNKNOWN_TOKEN_TTL_SECS)))
			}
		}
	}
}
