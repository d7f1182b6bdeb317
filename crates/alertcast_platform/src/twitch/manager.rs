#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use hyper::StatusCode;
use tracing::{debug, error, info, warn};
use url::Url;

use super::auth::{ConfiguredToken, CredentialStrategy, RefreshError, RefreshedCredential, StoredCredential, TokenRefresher, resolve_credential};
use super::eventsub::{self, Challenge, EventSubKind, Notification, Revocation};
use super::helix::{CreateSubscriptionError, EventSubApi, RemoteSubscription, SubscriptionRequest};
use super::webhook::{self, TYPE_NOTIFICATION, TYPE_REVOCATION, TYPE_VERIFICATION, WEBHOOK_PATH, WebhookReply, WebhookRequest};
use crate::{AlertSink, CredentialStore, Credentials, SecretString, SubscriptionRecord, SubscriptionStatus};

/// Base URL shipped in sample configs; treated as "not configured".
pub const PLACEHOLDER_BASE_URL: &str = "https://abcdef123.eu.ngrok.io";

/// Build the EventSub callback URL from the server's public base URL.
pub fn callback_url(base_url: &str) -> anyhow::Result<String> {
	let trimmed = base_url.trim().trim_end_matches('/');
	if trimmed.is_empty() || trimmed == PLACEHOLDER_BASE_URL {
		anyhow::bail!("server.base_url must be set to this server's public URL");
	}

	let url = Url::parse(trimmed).context("parse server.base_url")?;
	if !matches!(url.scheme(), "http" | "https") {
		anyhow::bail!("server.base_url must be an http(s) URL, got scheme {}", url.scheme());
	}

	Ok(format!("{trimmed}{WEBHOOK_PATH}"))
}

#[derive(Debug, Clone, Default)]
pub struct EventSubSettings {
	/// Login of the primary monitored channel.
	pub channel_login: String,
	pub base_url: String,
	pub webhook_secret: SecretString,
	/// Operator-supplied fallback user token.
	pub user_access_token: SecretString,
}

/// How `ensure_subscribed` reached the desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ensured {
	AlreadyEnabled,
	Created { id: String },
	/// Creation conflicted and the existing remote subscription was adopted.
	Recovered { id: String },
}

#[derive(Debug, Default)]
pub struct StartupReport {
	pub user_id: String,
	pub credential: Option<Credentials>,
	pub ensured: Vec<(EventSubKind, Ensured)>,
	pub failed: Vec<EventSubKind>,
}

/// Keeps EventSub webhook subscriptions in sync and turns verified callbacks
/// into overlay events.
pub struct EventSubManager {
	api: Arc<dyn EventSubApi>,
	store: Arc<dyn CredentialStore>,
	sink: Arc<dyn AlertSink>,
	refresher: Arc<TokenRefresher>,
	settings: EventSubSettings,
}

impl EventSubManager {
	pub fn new(
		api: Arc<dyn EventSubApi>,
		store: Arc<dyn CredentialStore>,
		sink: Arc<dyn AlertSink>,
		settings: EventSubSettings,
	) -> Self {
		let refresher = Arc::new(TokenRefresher::new(api.clone(), store.clone()));
		Self {
			api,
			store,
			sink,
			refresher,
			settings,
		}
	}

	/// Credential strategies in evaluation order.
	fn strategies(&self) -> Vec<Box<dyn CredentialStrategy>> {
		vec![
			Box::new(StoredCredential::new(self.store.clone())),
			Box::new(RefreshedCredential::new(self.refresher.clone())),
			Box::new(ConfiguredToken::new(
				self.api.clone(),
				self.settings.user_access_token.clone(),
			)),
		]
	}

	/// App credential, primary account, user credential, then reconciliation
	/// of every subscription type.
	///
	/// Errors only when the primary account cannot be identified; a missing
	/// user credential or callback URL disables reconciliation and is reported.
	pub async fn start(&self) -> anyhow::Result<StartupReport> {
		self.api
			.authenticate_app()
			.await
			.context("obtain twitch app access token")?;
		info!("twitch app access token acquired");

		let login = self.settings.channel_login.trim();
		if login.is_empty() {
			anyhow::bail!("twitch.channel_name is empty; cannot identify the monitored account");
		}
		let user_id = self
			.api
			.user_id_by_login(login)
			.await
			.with_context(|| format!("resolve twitch user id for {login}"))?
			.with_context(|| format!("no twitch user named {login}"))?;
		info!(%user_id, login, "primary twitch account identified");

		let mut report = StartupReport {
			user_id: user_id.clone(),
			..Default::default()
		};

		match resolve_credential(&self.strategies(), &user_id).await {
			Ok(creds) => report.credential = Some(creds),
			Err(declined) => {
				for d in &declined {
					error!(%user_id, strategy = d.strategy, reason = %d.reason, "twitch credential unavailable");
				}
				error!(%user_id, "no usable twitch user credential; event subscriptions disabled");
				return Ok(report);
			}
		}

		if let Err(e) = callback_url(&self.settings.base_url) {
			error!(error = %e, "twitch event subscriptions disabled");
			return Ok(report);
		}

		for kind in EventSubKind::ALL {
			match self.ensure_subscribed(&user_id, kind).await {
				Ok(ensured) => report.ensured.push((kind, ensured)),
				Err(e) => {
					error!(%user_id, event_type = kind.as_helix_type(), error = ?e, "failed to ensure twitch subscription");
					report.failed.push(kind);
				}
			}
		}

		Ok(report)
	}

	/// Make sure one `(user, type)` subscription exists remotely and is recorded locally.
	pub async fn ensure_subscribed(&self, user_id: &str, kind: EventSubKind) -> anyhow::Result<Ensured> {
		let event_type = kind.as_helix_type();

		if let Some(existing) = self
			.store
			.load_subscription(user_id, event_type)
			.await
			.context("load subscription record")?
			&& existing.status == SubscriptionStatus::Enabled
		{
			debug!(user_id, event_type, id = %existing.id, "subscription already enabled");
			return Ok(Ensured::AlreadyEnabled);
		}

		let callback = callback_url(&self.settings.base_url)?;
		let req = SubscriptionRequest {
			kind,
			user_id,
			callback: &callback,
			secret: &self.settings.webhook_secret,
		};

		match self.api.create_subscription(&req).await {
			Ok(created) => {
				self.persist(user_id, kind, &created).await?;
				info!(user_id, event_type, id = %created.id, status = %created.status, "twitch subscription created");
				metrics::counter!("alertcast_twitch_subscriptions_created_total").increment(1);
				Ok(Ensured::Created { id: created.id })
			}
			Err(CreateSubscriptionError::Conflict) => {
				warn!(user_id, event_type, "subscription already exists remotely; reconciling");
				let remote = self
					.api
					.list_subscriptions(event_type)
					.await
					.context("list eventsub subscriptions for reconcile")?;

				let mut matching: Vec<RemoteSubscription> = remote
					.into_iter()
					.filter(|s| kind.matches(&s.condition, user_id))
					.collect();
				if matching.is_empty() {
					anyhow::bail!("create subscription conflict but no remote {event_type} subscription matches user {user_id}");
				}
				let pick = matching
					.iter()
					.position(|s| SubscriptionStatus::from_remote(&s.status) == SubscriptionStatus::Enabled)
					.unwrap_or(0);
				let existing = matching.swap_remove(pick);

				self.persist(user_id, kind, &existing).await?;
				info!(user_id, event_type, id = %existing.id, "adopted existing twitch subscription");
				metrics::counter!("alertcast_twitch_subscriptions_recovered_total").increment(1);
				Ok(Ensured::Recovered { id: existing.id })
			}
			Err(CreateSubscriptionError::Api(e)) => Err(e.context(format!("create {event_type} subscription"))),
		}
	}

	async fn persist(&self, user_id: &str, kind: EventSubKind, remote: &RemoteSubscription) -> anyhow::Result<()> {
		let record = SubscriptionRecord {
			id: remote.id.clone(),
			user_id: user_id.to_string(),
			event_type: kind.as_helix_type().to_string(),
			status: SubscriptionStatus::from_remote(&remote.status),
			created_at: remote.created_at().unwrap_or_else(Utc::now),
		};
		self.store
			.upsert_subscription(&record)
			.await
			.with_context(|| format!("save subscription {}", record.id))
	}

	/// Refresh the stored user credential when it has expired.
	pub async fn refresh_if_expired(&self, user_id: &str) -> Result<Credentials, RefreshError> {
		self.refresher.refresh_if_expired(user_id).await
	}

	/// Answer one EventSub callback. Never fails: every outcome maps to a reply.
	pub async fn handle_callback(&self, req: WebhookRequest) -> WebhookReply {
		metrics::counter!("alertcast_twitch_webhook_requests_total").increment(1);

		if !webhook::verify_signature(self.settings.webhook_secret.expose().as_bytes(), &req) {
			warn!(message_id = %req.message_id, "invalid twitch webhook signature");
			metrics::counter!("alertcast_twitch_webhook_signature_rejected_total").increment(1);
			return WebhookReply::new(StatusCode::UNAUTHORIZED, "Invalid Signature");
		}

		match req.message_type.as_str() {
			TYPE_VERIFICATION => match serde_json::from_slice::<Challenge>(&req.body) {
				Ok(v) => {
					info!("twitch webhook verification received; answering challenge");
					metrics::counter!("alertcast_twitch_webhook_challenges_total").increment(1);
					WebhookReply::new(StatusCode::OK, v.challenge)
				}
				Err(e) => {
					error!(error = %e, "failed to parse twitch webhook verification");
					WebhookReply::new(StatusCode::BAD_REQUEST, "Bad Request")
				}
			},
			TYPE_NOTIFICATION => {
				let notification = match serde_json::from_slice::<Notification>(&req.body) {
					Ok(n) => n,
					Err(e) => {
						error!(error = %e, "failed to parse twitch notification");
						return WebhookReply::new(StatusCode::BAD_REQUEST, "Bad Request");
					}
				};
				metrics::counter!("alertcast_twitch_webhook_notifications_total").increment(1);

				let event_type = notification.subscription.event_type.as_str();
				match eventsub::translate(event_type, &notification.event) {
					Ok(Some(alert)) => {
						info!(event_type, "twitch notification received");
						self.sink.publish(alert);
					}
					Ok(None) => warn!(event_type, "unhandled twitch notification type"),
					Err(e) => error!(event_type, error = ?e, "failed to translate twitch notification"),
				}
				WebhookReply::ok()
			}
			TYPE_REVOCATION => {
				metrics::counter!("alertcast_twitch_webhook_revocations_total").increment(1);
				match serde_json::from_slice::<Revocation>(&req.body) {
					Ok(r) => {
						let sub = r.subscription;
						warn!(id = %sub.id, event_type = %sub.event_type, status = %sub.status, "twitch subscription revoked");
						match self.store.delete_subscription(&sub.id).await {
							Ok(true) => {}
							Ok(false) => debug!(id = %sub.id, "revoked subscription had no local record"),
							Err(e) => error!(id = %sub.id, error = ?e, "failed to delete revoked subscription"),
						}
					}
					Err(e) => warn!(error = %e, "twitch revocation body could not be parsed"),
				}
				WebhookReply::ok()
			}
			other => {
				warn!(message_type = other, "unknown twitch webhook message type");
				WebhookReply::new(StatusCode::OK, "")
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn callback_url_rejects_placeholders() {
		assert_eq!(
			callback_url("https://alerts.example.com/").unwrap(),
			"https://alerts.example.com/webhooks/twitch"
		);
		assert!(callback_url("").is_err());
		assert!(callback_url(PLACEHOLDER_BASE_URL).is_err());
		assert!(callback_url("ftp://alerts.example.com").is_err());
		assert!(callback_url("not a url").is_err());
	}
}
