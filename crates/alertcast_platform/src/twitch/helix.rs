#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::eventsub::EventSubKind;
use crate::{RateLimiter, SecretString};

pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv";
pub const DEFAULT_OAUTH_BASE_URL: &str = "https://id.twitch.tv";

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";
const USERS_PATH: &str = "/helix/users";
const TOKEN_PATH: &str = "/oauth2/token";
const VALIDATE_PATH: &str = "/oauth2/validate";

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix auth failed (status={status}) body={body}");
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		debug!(?delay, label, "helix rate limited; retrying once");
		tokio::time::sleep(delay).await;
		return retry.send().await.with_context(|| format!("helix {label} retry send"));
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		return retry.send().await.with_context(|| format!("helix {label} retry send"));
	}

	Ok(resp)
}

/// A remote EventSub subscription as reported by Helix.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSubscription {
	pub id: String,
	pub status: String,
	#[serde(rename = "type")]
	pub event_type: String,
	#[serde(default)]
	pub version: String,
	#[serde(default)]
	pub condition: serde_json::Value,
	#[serde(default)]
	pub created_at: Option<String>,
}

impl RemoteSubscription {
	pub fn created_at(&self) -> Option<DateTime<Utc>> {
		let raw = self.created_at.as_deref()?;
		DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
	}
}

/// Result of an OAuth token exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
	pub access_token: String,
	#[serde(default)]
	pub refresh_token: Option<String>,
	#[serde(default)]
	pub expires_in: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenValidation {
	pub client_id: String,
	#[serde(default)]
	pub login: String,
	#[serde(default)]
	pub user_id: String,
	#[serde(default)]
	pub expires_in: u64,
	#[serde(default)]
	pub scopes: Vec<String>,
}

/// Desired webhook subscription for one account.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionRequest<'a> {
	pub kind: EventSubKind,
	pub user_id: &'a str,
	pub callback: &'a str,
	pub secret: &'a SecretString,
}

#[derive(Debug, Error)]
pub enum CreateSubscriptionError {
	/// Helix answered 409: a subscription with the same type and condition exists.
	#[error("subscription already exists")]
	Conflict,
	#[error(transparent)]
	Api(#[from] anyhow::Error),
}

/// Remote management calls the EventSub manager depends on.
#[async_trait::async_trait]
pub trait EventSubApi: Send + Sync {
	/// Obtain the app access token used for every management call.
	async fn authenticate_app(&self) -> anyhow::Result<()>;

	async fn user_id_by_login(&self, login: &str) -> anyhow::Result<Option<String>>;

	async fn create_subscription(&self, req: &SubscriptionRequest<'_>) -> Result<RemoteSubscription, CreateSubscriptionError>;

	/// All remote subscriptions of one type, following pagination to the end.
	async fn list_subscriptions(&self, event_type: &str) -> anyhow::Result<Vec<RemoteSubscription>>;

	async fn refresh_user_token(&self, refresh_token: &SecretString) -> anyhow::Result<TokenGrant>;

	/// `Ok(None)` when Twitch rejects the token; `Err` when it could not be asked.
	async fn validate_token(&self, access_token: &SecretString) -> anyhow::Result<Option<TokenValidation>>;
}

#[derive(Debug, Clone)]
pub struct HelixConfig {
	pub client_id: String,
	pub client_secret: SecretString,
	pub helix_base_url: String,
	pub oauth_base_url: String,
}

impl HelixConfig {
	pub fn new(client_id: impl Into<String>, client_secret: SecretString) -> Self {
		Self {
			client_id: client_id.into(),
			client_secret,
			helix_base_url: DEFAULT_HELIX_BASE_URL.to_string(),
			oauth_base_url: DEFAULT_OAUTH_BASE_URL.to_string(),
		}
	}
}

#[derive(Debug, Serialize)]
struct CreateSubscriptionBody<'a> {
	#[serde(rename = "type")]
	kind: &'static str,
	version: &'static str,
	condition: serde_json::Value,
	transport: WebhookTransport<'a>,
}

#[derive(Debug, Serialize)]
struct WebhookTransport<'a> {
	method: &'static str,
	callback: &'a str,
	secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubscriptionsPage {
	data: Vec<RemoteSubscription>,
	#[serde(default)]
	pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
	#[serde(default)]
	cursor: Option<String>,
}

/// Follow `pagination.cursor` until Helix returns no (or an empty) cursor.
async fn collect_pages<F, Fut>(mut fetch: F) -> anyhow::Result<Vec<RemoteSubscription>>
where
	F: FnMut(Option<String>) -> Fut,
	Fut: Future<Output = anyhow::Result<SubscriptionsPage>>,
{
	let mut out = Vec::new();
	let mut after: Option<String> = None;

	loop {
		let page = fetch(after.take()).await?;
		out.extend(page.data);

		match page.pagination.and_then(|p| p.cursor).filter(|c| !c.is_empty()) {
			Some(next) => after = Some(next),
			None => break,
		}
	}

	Ok(out)
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
	data: Vec<HelixUser>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
	id: String,
}

/// Helix + OAuth client authenticated with an app access token.
pub struct HelixClient {
	http: reqwest::Client,
	helix_base: Url,
	oauth_base: Url,
	client_id: String,
	client_secret: SecretString,
	app_token: RwLock<Option<SecretString>>,
	limiter: RateLimiter,
	cancel: CancellationToken,
}

impl HelixClient {
	pub fn new(cfg: HelixConfig, cancel: CancellationToken) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("alertcast/0.x (eventsub-webhook)")
			.timeout(Duration::from_secs(15))
			.build()
			.context("build reqwest client")?;

		let helix_base = Url::parse(&cfg.helix_base_url).context("parse helix base url")?;
		let oauth_base = Url::parse(&cfg.oauth_base_url).context("parse oauth base url")?;

		Ok(Self {
			http,
			helix_base,
			oauth_base,
			client_id: cfg.client_id,
			client_secret: cfg.client_secret,
			app_token: RwLock::new(None),
			limiter: RateLimiter::api_default(),
			cancel,
		})
	}

	fn helix_url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.helix_base.join(path_and_query).context("join helix url")
	}

	fn oauth_url(&self, path: &str) -> anyhow::Result<Url> {
		self.oauth_base.join(path).context("join oauth url")
	}

	async fn throttle(&self) -> anyhow::Result<()> {
		self.limiter.acquire(&self.cancel).await.context("helix rate limiter")
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> anyhow::Result<reqwest::RequestBuilder> {
		let token = self
			.app_token
			.read()
			.clone()
			.context("helix app access token not acquired")?;
		Ok(req
			.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", token.expose())))
	}

	async fn list_page(&self, event_type: &str, after: Option<&str>) -> anyhow::Result<SubscriptionsPage> {
		let mut path = format!(
			"{base}?type={ty}",
			base = EVENTSUB_SUBSCRIPTIONS_PATH,
			ty = urlencoding::encode(event_type)
		);
		if let Some(after) = after {
			path.push_str("&after=");
			path.push_str(&urlencoding::encode(after));
		}
		let url = self.helix_url(&path)?;

		self.throttle().await?;
		let resp = send_with_retry(self.authed(self.http.get(url))?, "GET /helix/eventsub/subscriptions")
			.await
			.context("helix GET /helix/eventsub/subscriptions send")?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.context("helix GET /helix/eventsub/subscriptions read body")?;

		if !status.is_success() {
			anyhow::bail!("helix list subscriptions failed: status={status} body={body}");
		}

		serde_json::from_str(&body).context("helix list subscriptions parse json")
	}
}

#[async_trait::async_trait]
impl EventSubApi for HelixClient {
	async fn authenticate_app(&self) -> anyhow::Result<()> {
		let url = self.oauth_url(TOKEN_PATH)?;

		self.throttle().await?;
		let resp = self
			.http
			.post(url)
			.form(&[
				("client_id", self.client_id.as_str()),
				("client_secret", self.client_secret.expose()),
				("grant_type", "client_credentials"),
			])
			.send()
			.await
			.context("twitch app token request")?;

		let status = resp.status();
		let body = resp.text().await.context("twitch app token read body")?;
		if !status.is_success() {
			anyhow::bail!("twitch app token failed: status={status} body={body}");
		}

		let grant: TokenGrant = serde_json::from_str(&body).context("twitch app token parse json")?;
		*self.app_token.write() = Some(SecretString::new(grant.access_token));
		Ok(())
	}

	async fn user_id_by_login(&self, login: &str) -> anyhow::Result<Option<String>> {
		let url = self.helix_url(&format!("{USERS_PATH}?login={}", urlencoding::encode(login)))?;

		self.throttle().await?;
		let resp = send_with_retry(self.authed(self.http.get(url))?, "GET /helix/users")
			.await
			.context("helix GET /helix/users send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/users read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/users failed: status={status} body={body}");
		}

		let parsed: UsersResponse = serde_json::from_str(&body).context("helix users parse json")?;
		Ok(parsed.data.into_iter().next().map(|u| u.id))
	}

	async fn create_subscription(&self, req: &SubscriptionRequest<'_>) -> Result<RemoteSubscription, CreateSubscriptionError> {
		let kind = req.kind.as_helix_type();
		let url = self.helix_url(EVENTSUB_SUBSCRIPTIONS_PATH)?;

		let body = CreateSubscriptionBody {
			kind,
			version: req.kind.version(),
			condition: req.kind.condition(req.user_id),
			transport: WebhookTransport {
				method: "webhook",
				callback: req.callback,
				secret: req.secret.expose(),
			},
		};

		self.throttle().await?;
		let resp = send_with_retry(
			self.authed(self.http.post(url))?.json(&body),
			"POST /helix/eventsub/subscriptions",
		)
		.await
		.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} send (type={kind})"))?;

		let status = resp.status();
		let text = resp
			.text()
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} read body (type={kind})"))?;

		if status == StatusCode::CONFLICT {
			return Err(CreateSubscriptionError::Conflict);
		}
		if !status.is_success() {
			return Err(anyhow::anyhow!("helix create subscription failed (type={kind}): status={status} body={text}").into());
		}

		let page: SubscriptionsPage = serde_json::from_str(&text)
			.with_context(|| format!("helix create subscription parse json (type={kind})"))?;
		let created = page
			.data
			.into_iter()
			.next()
			.context("helix create subscription returned empty data")?;
		Ok(created)
	}

	async fn list_subscriptions(&self, event_type: &str) -> anyhow::Result<Vec<RemoteSubscription>> {
		collect_pages(|after| async move { self.list_page(event_type, after.as_deref()).await }).await
	}

	async fn refresh_user_token(&self, refresh_token: &SecretString) -> anyhow::Result<TokenGrant> {
		let url = self.oauth_url(TOKEN_PATH)?;

		self.throttle().await?;
		let resp = self
			.http
			.post(url)
			.form(&[
				("grant_type", "refresh_token"),
				("client_id", self.client_id.as_str()),
				("client_secret", self.client_secret.expose()),
				("refresh_token", refresh_token.expose()),
			])
			.send()
			.await
			.context("twitch refresh token request")?;

		let status = resp.status();
		let body = resp.text().await.context("twitch refresh token read body")?;

		if !status.is_success() {
			anyhow::bail!("twitch refresh token failed: status={status} body={body}");
		}

		serde_json::from_str(&body).context("twitch refresh token parse json")
	}

	async fn validate_token(&self, access_token: &SecretString) -> anyhow::Result<Option<TokenValidation>> {
		let url = self.oauth_url(VALIDATE_PATH)?;

		self.throttle().await?;
		let resp = self
			.http
			.get(url)
			.header("Authorization", format!("OAuth {}", access_token.expose()))
			.send()
			.await
			.context("twitch validate token request")?;

		let status = resp.status();
		let body = resp.text().await.context("twitch validate token read body")?;

		if status == StatusCode::UNAUTHORIZED {
			return Ok(None);
		}
		if !status.is_success() {
			anyhow::bail!("twitch validate token failed: status={status} body={body}");
		}

		serde_json::from_str(&body)
			.map(Some)
			.context("twitch validate token parse json")
	}
}
