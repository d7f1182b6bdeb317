#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::SecretString;

pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/youtube/v3/";

/// Upper bound YouTube accepts for `maxResults` on live chat messages.
const MESSAGES_PAGE_SIZE: &str = "200";

/// Error reasons meaning the live chat is over for good.
const SESSION_GONE_REASONS: [&str; 3] = ["liveChatEnded", "liveChatNotFound", "liveChatDisabled"];

#[derive(Debug, Error)]
pub enum LiveChatError {
	/// The live chat this session pointed at no longer exists.
	#[error("live chat session is gone ({reason})")]
	SessionGone { reason: String },
	#[error(transparent)]
	Api(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorDetails {
	#[serde(default)]
	pub channel_id: String,
	#[serde(default)]
	pub display_name: String,
	#[serde(default)]
	pub is_chat_owner: bool,
	#[serde(default)]
	pub is_chat_moderator: bool,
	#[serde(default)]
	pub is_chat_sponsor: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuperChatDetails {
	#[serde(default)]
	pub amount_display_string: String,
	#[serde(default)]
	pub user_comment: String,
	#[serde(default)]
	pub tier: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuperStickerMetadata {
	#[serde(default)]
	pub alt_text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuperStickerDetails {
	#[serde(default)]
	pub amount_display_string: String,
	#[serde(default)]
	pub super_sticker_metadata: Option<SuperStickerMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSnippet {
	#[serde(rename = "type", default)]
	pub kind: String,
	#[serde(default)]
	pub display_message: Option<String>,
	#[serde(default)]
	pub super_chat_details: Option<SuperChatDetails>,
	#[serde(default)]
	pub super_sticker_details: Option<SuperStickerDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatMessage {
	#[serde(default)]
	pub id: String,
	#[serde(default)]
	pub snippet: MessageSnippet,
	#[serde(default)]
	pub author_details: AuthorDetails,
}

/// One page of `liveChatMessages.list`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatPage {
	#[serde(default)]
	pub next_page_token: Option<String>,
	#[serde(default)]
	pub polling_interval_millis: Option<u64>,
	#[serde(default)]
	pub items: Vec<LiveChatMessage>,
}

/// YouTube Data API calls the polling engine depends on.
#[async_trait::async_trait]
pub trait LiveChatApi: Send + Sync {
	/// Video id of the channel's current live broadcast, if any.
	async fn find_live_video(&self, channel_id: &str) -> anyhow::Result<Option<String>>;

	/// `activeLiveChatId` of a live video, if its chat is enabled.
	async fn active_live_chat_id(&self, video_id: &str) -> anyhow::Result<Option<String>>;

	/// Fetch a page of chat messages. `page_token` is omitted on the first fetch.
	async fn list_messages(&self, live_chat_id: &str, page_token: Option<&str>) -> Result<LiveChatPage, LiveChatError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
	#[serde(default)]
	items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
	id: SearchItemId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
	#[serde(default)]
	video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideosResponse {
	#[serde(default)]
	items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
	#[serde(default)]
	live_streaming_details: Option<LiveStreamingDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveStreamingDetails {
	#[serde(default)]
	active_live_chat_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
	error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
	#[serde(default)]
	errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorItem {
	#[serde(default)]
	reason: String,
}

/// The error reason when a failed response says the live chat is gone.
fn session_gone_reason(status: StatusCode, body: &str) -> Option<String> {
	if status != StatusCode::FORBIDDEN && status != StatusCode::NOT_FOUND {
		return None;
	}
	let envelope: ApiErrorEnvelope = serde_json::from_str(body).ok()?;
	envelope
		.error
		.errors
		.into_iter()
		.map(|e| e.reason)
		.find(|r| SESSION_GONE_REASONS.contains(&r.as_str()))
}

/// API-key authenticated YouTube Data API v3 client.
pub struct YouTubeClient {
	http: reqwest::Client,
	base_url: Url,
	api_key: SecretString,
}

impl YouTubeClient {
	pub fn new(base_url: &str, api_key: SecretString) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("alertcast/0.x (youtube-livechat)")
			.timeout(Duration::from_secs(15))
			.build()
			.context("build reqwest client")?;

		let mut base = base_url.trim().to_string();
		if !base.ends_with('/') {
			base.push('/');
		}
		let base_url = Url::parse(&base).context("parse youtube api base url")?;

		Ok(Self { http, base_url, api_key })
	}

	fn endpoint(&self, resource: &str, params: &[(&str, &str)]) -> anyhow::Result<Url> {
		let mut url = self.base_url.join(resource).context("join youtube url")?;
		{
			let mut q = url.query_pairs_mut();
			for (k, v) in params {
				q.append_pair(k, v);
			}
			q.append_pair("key", self.api_key.expose());
		}
		Ok(url)
	}

	async fn get(&self, url: Url, label: &'static str) -> anyhow::Result<(StatusCode, String)> {
		let resp = self
			.http
			.get(url)
			.send()
			.await
			.with_context(|| format!("youtube {label} send"))?;
		let status = resp.status();
		let body = resp.text().await.with_context(|| format!("youtube {label} read body"))?;
		Ok((status, body))
	}
}

#[async_trait::async_trait]
impl LiveChatApi for YouTubeClient {
	async fn find_live_video(&self, channel_id: &str) -> anyhow::Result<Option<String>> {
		let url = self.endpoint(
			"search",
			&[
				("part", "id"),
				("channelId", channel_id),
				("eventType", "live"),
				("type", "video"),
				("maxResults", "1"),
			],
		)?;

		let (status, body) = self.get(url, "search").await?;
		if !status.is_success() {
			anyhow::bail!("youtube search failed: status={status} body={body}");
		}

		let parsed: SearchResponse = serde_json::from_str(&body).context("youtube search parse json")?;
		Ok(parsed.items.into_iter().find_map(|i| i.id.video_id))
	}

	async fn active_live_chat_id(&self, video_id: &str) -> anyhow::Result<Option<String>> {
		let url = self.endpoint("videos", &[("part", "liveStreamingDetails"), ("id", video_id)])?;

		let (status, body) = self.get(url, "videos").await?;
		if !status.is_success() {
			anyhow::bail!("youtube videos failed: status={status} body={body}");
		}

		let parsed: VideosResponse = serde_json::from_str(&body).context("youtube videos parse json")?;
		Ok(parsed
			.items
			.into_iter()
			.next()
			.and_then(|v| v.live_streaming_details)
			.and_then(|d| d.active_live_chat_id)
			.filter(|id| !id.is_empty()))
	}

	async fn list_messages(&self, live_chat_id: &str, page_token: Option<&str>) -> Result<LiveChatPage, LiveChatError> {
		let mut params = vec![
			("liveChatId", live_chat_id),
			("part", "snippet,authorDetails"),
			("maxResults", MESSAGES_PAGE_SIZE),
		];
		if let Some(token) = page_token {
			params.push(("pageToken", token));
		}
		let url = self.endpoint("liveChat/messages", &params)?;

		let (status, body) = self.get(url, "liveChat/messages").await?;
		if let Some(reason) = session_gone_reason(status, &body) {
			return Err(LiveChatError::SessionGone { reason });
		}
		if !status.is_success() {
			return Err(anyhow::anyhow!("youtube liveChat/messages failed: status={status} body={body}").into());
		}

		let page = serde_json::from_str(&body).context("youtube liveChat/messages parse json")?;
		Ok(page)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn chat_ended_is_session_gone() {
		let body = r#"{"error":{"code":403,"message":"The live chat is no longer live.",
			"errors":[{"message":"The live chat is no longer live.","domain":"youtube.liveChat","reason":"liveChatEnded"}]}}"#;
		assert_eq!(session_gone_reason(StatusCode::FORBIDDEN, body).as_deref(), Some("liveChatEnded"));
	}

	#[test]
	fn quota_errors_stay_retryable() {
		let body = r#"{"error":{"code":403,"errors":[{"domain":"youtube.quota","reason":"quotaExceeded"}]}}"#;
		assert_eq!(session_gone_reason(StatusCode::FORBIDDEN, body), None);

		let gone = r#"{"error":{"errors":[{"reason":"liveChatNotFound"}]}}"#;
		assert_eq!(session_gone_reason(StatusCode::INTERNAL_SERVER_ERROR, gone), None);
		assert_eq!(session_gone_reason(StatusCode::NOT_FOUND, gone).as_deref(), Some("liveChatNotFound"));
	}

	#[test]
	fn page_parses_super_chat_and_authors() {
		let raw = r#"{
			"kind": "youtube#liveChatMessageListResponse",
			"nextPageToken": "T2",
			"pollingIntervalMillis": 5000,
			"items": [{
				"id": "m1",
				"snippet": {
					"type": "superChatEvent",
					"displayMessage": "€5.00 from Bo: hi",
					"superChatDetails": {"amountMicros": "5000000", "currency": "EUR",
						"amountDisplayString": "€5.00", "userComment": "hi", "tier": 2}
				},
				"authorDetails": {"channelId": "UC1", "displayName": "Bo", "isChatSponsor": true}
			}]
		}"#;

		let page: LiveChatPage = serde_json::from_str(raw).unwrap();
		assert_eq!(page.next_page_token.as_deref(), Some("T2"));
		let item = &page.items[0];
		let sc = item.snippet.super_chat_details.as_ref().unwrap();
		assert_eq!(sc.amount_display_string, "€5.00");
		assert_eq!(sc.tier, 2);
		assert!(item.author_details.is_chat_sponsor);
		assert!(!item.author_details.is_chat_owner);
	}

	#[test]
	fn endpoint_carries_params_and_key() {
		let client = YouTubeClient::new("https://yt.example.com/youtube/v3", SecretString::new("k3y")).unwrap();
		let url = client
			.endpoint("liveChat/messages", &[("liveChatId", "abc"), ("pageToken", "T 1")])
			.unwrap();
		assert_eq!(url.path(), "/youtube/v3/liveChat/messages");
		let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
		assert!(pairs.contains(&("liveChatId".to_string(), "abc".to_string())));
		assert!(pairs.contains(&("pageToken".to_string(), "T 1".to_string())));
		assert!(pairs.contains(&("key".to_string(), "k3y".to_string())));
	}
}
