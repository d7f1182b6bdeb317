#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use alertcast_domain::{AlertEvent, MediaKind, Tier};
use alertcast_platform::commands::{CommandDispatcher, CommandEntry, CommandTable, DEFAULT_COOLDOWN};
use alertcast_platform::youtube::{
	EngineState, LiveChatApi, LiveChatError, LiveChatPage, PollError, PollingEngine, ResolveError,
};
use alertcast_platform::{
	AlertSink, CredentialStore, Credentials, InMemoryStore, PollingCursor, RateLimiter, SubscriptionRecord,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

const CHANNEL: &str = "UCdallas";

#[derive(Default)]
struct Sink {
	events: Mutex<Vec<AlertEvent>>,
}

impl AlertSink for Sink {
	fn publish(&self, event: AlertEvent) {
		self.events.lock().push(event);
	}
}

#[derive(Default)]
struct FakeLiveChat {
	live_video: Mutex<Option<String>>,
	pages: Mutex<VecDeque<Result<LiveChatPage, LiveChatError>>>,
	requested_tokens: Mutex<Vec<Option<String>>>,
}

impl FakeLiveChat {
	fn live() -> Self {
		let fake = Self::default();
		*fake.live_video.lock() = Some("vid-1".to_string());
		fake
	}

	fn push_page(&self, raw: serde_json::Value) {
		let page = serde_json::from_value(raw).unwrap();
		self.pages.lock().push_back(Ok(page));
	}

	fn push_err(&self, err: LiveChatError) {
		self.pages.lock().push_back(Err(err));
	}
}

#[async_trait::async_trait]
impl LiveChatApi for FakeLiveChat {
	async fn find_live_video(&self, _channel_id: &str) -> anyhow::Result<Option<String>> {
		Ok(self.live_video.lock().clone())
	}

	async fn active_live_chat_id(&self, video_id: &str) -> anyhow::Result<Option<String>> {
		Ok(Some(format!("chat-{video_id}")))
	}

	async fn list_messages(&self, _live_chat_id: &str, page_token: Option<&str>) -> Result<LiveChatPage, LiveChatError> {
		self.requested_tokens.lock().push(page_token.map(str::to_string));
		self.pages
			.lock()
			.pop_front()
			.unwrap_or_else(|| Ok(LiveChatPage::default()))
	}
}

/// In-memory store whose cursor writes can be made to fail.
#[derive(Default)]
struct FlakyStore {
	inner: InMemoryStore,
	fail_cursor_writes: AtomicBool,
}

#[async_trait::async_trait]
impl CredentialStore for FlakyStore {
	async fn load_credentials(&self, user_id: &str) -> anyhow::Result<Option<Credentials>> {
		self.inner.load_credentials(user_id).await
	}

	async fn upsert_credentials(&self, creds: &Credentials) -> anyhow::Result<()> {
		self.inner.upsert_credentials(creds).await
	}

	async fn load_subscription(&self, user_id: &str, event_type: &str) -> anyhow::Result<Option<SubscriptionRecord>> {
		self.inner.load_subscription(user_id, event_type).await
	}

	async fn upsert_subscription(&self, record: &SubscriptionRecord) -> anyhow::Result<()> {
		self.inner.upsert_subscription(record).await
	}

	async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<bool> {
		self.inner.delete_subscription(subscription_id).await
	}

	async fn load_cursor(&self, channel_id: &str) -> anyhow::Result<Option<PollingCursor>> {
		self.inner.load_cursor(channel_id).await
	}

	async fn upsert_cursor(&self, cursor: &PollingCursor) -> anyhow::Result<()> {
		if self.fail_cursor_writes.load(Ordering::SeqCst) {
			anyhow::bail!("database is locked");
		}
		self.inner.upsert_cursor(cursor).await
	}
}

struct Harness {
	api: Arc<FakeLiveChat>,
	store: Arc<FlakyStore>,
	sink: Arc<Sink>,
	cancel: CancellationToken,
	engine: PollingEngine,
}

fn harness(api: FakeLiveChat) -> Harness {
	let api = Arc::new(api);
	let store = Arc::new(FlakyStore::default());
	let sink = Arc::new(Sink::default());
	let cancel = CancellationToken::new();
	let engine = engine(&api, &store, &sink, &cancel);

	Harness {
		api,
		store,
		sink,
		cancel,
		engine,
	}
}

/// A fresh engine over existing collaborators, as after a process restart.
fn engine(api: &Arc<FakeLiveChat>, store: &Arc<FlakyStore>, sink: &Arc<Sink>, cancel: &CancellationToken) -> PollingEngine {
	let mut table = CommandTable::empty();
	table.insert(
		"test",
		CommandEntry {
			filename: "everyone/test.mp3".to_string(),
			tier: Tier::Everyone,
			media: MediaKind::Audio,
		},
	);
	let commands = Arc::new(CommandDispatcher::new(
		Arc::new(table),
		sink.clone(),
		DEFAULT_COOLDOWN,
	));

	PollingEngine::new(
		CHANNEL,
		api.clone(),
		store.clone(),
		sink.clone(),
		commands,
		Arc::new(RateLimiter::new(1000.0, 100)),
		Duration::from_secs(5),
		cancel.clone(),
	)
}

async fn cursor(store: &FlakyStore) -> PollingCursor {
	store.load_cursor(CHANNEL).await.unwrap().unwrap()
}

fn super_chat_page(token: &str, amount: &str) -> serde_json::Value {
	serde_json::json!({
		"nextPageToken": token,
		"pollingIntervalMillis": 5000,
		"items": [{
			"id": "sc-1",
			"snippet": {
				"type": "superChatEvent",
				"superChatDetails": {"amountDisplayString": amount, "userComment": "ciao", "tier": 2}
			},
			"authorDetails": {"displayName": "Bo"}
		}]
	})
}

#[tokio::test]
async fn resolve_persists_session_without_token() {
	let h = harness(FakeLiveChat::live());

	let chat_id = h.engine.resolve_session().await.unwrap();
	assert_eq!(chat_id, "chat-vid-1");
	assert_eq!(h.engine.state(), EngineState::SessionActive);

	let c = cursor(&h.store).await;
	assert_eq!(c.live_chat_id.as_deref(), Some("chat-vid-1"));
	assert_eq!(c.next_page_token, None);
}

#[tokio::test]
async fn resolve_when_offline_is_not_live() {
	let h = harness(FakeLiveChat::default());
	assert!(matches!(h.engine.resolve_session().await, Err(ResolveError::NotLive(_))));
	assert!(h.store.load_cursor(CHANNEL).await.unwrap().is_none());
}

#[tokio::test]
async fn poll_without_session_fails() {
	let h = harness(FakeLiveChat::live());
	assert!(matches!(h.engine.poll_once().await, Err(PollError::NoSession(_))));
}

#[tokio::test]
async fn super_chat_page_persists_token_and_broadcasts_once() {
	let h = harness(FakeLiveChat::live());
	h.engine.resolve_session().await.unwrap();
	h.api.push_page(super_chat_page("T2", "€5.00"));

	let report = h.engine.poll_once().await.unwrap();
	assert_eq!(report.fetched, 1);
	assert_eq!(report.published, 1);

	assert_eq!(cursor(&h.store).await.next_page_token.as_deref(), Some("T2"));
	assert_eq!(
		h.sink.events.lock().clone(),
		vec![AlertEvent::YoutubeSuperChat {
			user_name: "Bo".to_string(),
			amount_string: "€5.00".to_string(),
			message: "ciao".to_string(),
			tier: 2,
		}]
	);
}

#[tokio::test]
async fn each_fetch_resumes_from_the_previous_token() {
	let h = harness(FakeLiveChat::live());
	h.engine.resolve_session().await.unwrap();
	h.api.push_page(serde_json::json!({"nextPageToken": "T1", "items": []}));
	h.api.push_page(serde_json::json!({"nextPageToken": "T2", "items": []}));
	h.api.push_page(serde_json::json!({"items": []}));

	h.engine.poll_once().await.unwrap();
	h.engine.poll_once().await.unwrap();
	h.engine.poll_once().await.unwrap();

	assert_eq!(
		h.api.requested_tokens.lock().clone(),
		vec![None, Some("T1".to_string()), Some("T2".to_string())]
	);
	assert_eq!(cursor(&h.store).await.next_page_token.as_deref(), Some("T2"));
}

#[tokio::test]
async fn restart_on_same_chat_resumes_from_stored_token() {
	let h = harness(FakeLiveChat::live());
	h.engine.resolve_session().await.unwrap();
	h.api.push_page(super_chat_page("T2", "€5.00"));
	h.engine.poll_once().await.unwrap();

	let restarted = engine(&h.api, &h.store, &h.sink, &h.cancel);
	restarted.resolve_session().await.unwrap();
	assert_eq!(cursor(&h.store).await.next_page_token.as_deref(), Some("T2"));

	h.api.push_page(serde_json::json!({"items": []}));
	restarted.poll_once().await.unwrap();

	assert_eq!(
		h.api.requested_tokens.lock().clone(),
		vec![None, Some("T2".to_string())]
	);
	assert_eq!(cursor(&h.store).await.next_page_token.as_deref(), Some("T2"));
	assert_eq!(h.sink.events.lock().len(), 1);
}

#[tokio::test]
async fn new_chat_starts_without_the_old_token() {
	let h = harness(FakeLiveChat::live());
	h.engine.resolve_session().await.unwrap();
	h.api.push_page(super_chat_page("T2", "€5.00"));
	h.engine.poll_once().await.unwrap();

	*h.api.live_video.lock() = Some("vid-2".to_string());
	let chat_id = h.engine.resolve_session().await.unwrap();
	assert_eq!(chat_id, "chat-vid-2");

	let c = cursor(&h.store).await;
	assert_eq!(c.live_chat_id.as_deref(), Some("chat-vid-2"));
	assert_eq!(c.next_page_token, None);
}

#[tokio::test]
async fn persist_failure_skips_processing() {
	let h = harness(FakeLiveChat::live());
	h.engine.resolve_session().await.unwrap();
	h.api.push_page(super_chat_page("T2", "$1.00"));
	h.store.fail_cursor_writes.store(true, Ordering::SeqCst);

	assert!(matches!(h.engine.poll_once().await, Err(PollError::Persist(_))));
	assert!(h.sink.events.lock().is_empty());
	assert_eq!(cursor(&h.store).await.next_page_token, None);
}

#[tokio::test]
async fn commands_map_roles_and_ignore_plain_text() {
	let h = harness(FakeLiveChat::live());
	h.engine.resolve_session().await.unwrap();
	h.api.push_page(serde_json::json!({
		"nextPageToken": "T9",
		"items": [
			{"snippet": {"type": "textMessageEvent", "displayMessage": "hello"}, "authorDetails": {"displayName": "A"}},
			{"snippet": {"type": "textMessageEvent", "displayMessage": "!test"}, "authorDetails": {"displayName": "B"}},
			{"snippet": {"type": "textMessageEvent", "displayMessage": "!nope"}, "authorDetails": {"displayName": "D"}},
			{"snippet": {"type": "textMessageEvent", "displayMessage": "!test"}, "authorDetails": {"displayName": "E"}},
			{"snippet": {"type": "superStickerEvent",
				"superStickerDetails": {"amountDisplayString": "$2.00", "superStickerMetadata": {"altText": "Yay"}}},
				"authorDetails": {"displayName": "C"}}
		]
	}));

	let report = h.engine.poll_once().await.unwrap();
	assert_eq!(report.commands, 1);
	assert_eq!(report.published, 1);

	let events = h.sink.events.lock().clone();
	assert_eq!(
		events,
		vec![
			AlertEvent::SoundCommand {
				filename: "everyone/test.mp3".to_string(),
				media_type: MediaKind::Audio,
			},
			AlertEvent::YoutubeSuperSticker {
				user_name: "C".to_string(),
				amount_string: "$2.00".to_string(),
				sticker_alt: "Yay".to_string(),
			},
		]
	);
}

#[tokio::test]
async fn session_gone_is_reported() {
	let h = harness(FakeLiveChat::live());
	h.engine.resolve_session().await.unwrap();
	h.api.push_err(LiveChatError::SessionGone {
		reason: "liveChatEnded".to_string(),
	});

	assert!(matches!(h.engine.poll_once().await, Err(PollError::SessionGone(_))));
}

#[tokio::test]
async fn run_terminates_when_startup_resolve_fails() {
	let h = harness(FakeLiveChat::default());

	let res = tokio::time::timeout(Duration::from_secs(5), h.engine.run()).await.unwrap();
	assert!(res.is_err());
	assert_eq!(h.engine.state(), EngineState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn run_re_resolves_after_session_ends() {
	let api = FakeLiveChat::live();
	api.push_page(serde_json::json!({"nextPageToken": "T1", "items": []}));
	api.push_err(LiveChatError::SessionGone {
		reason: "liveChatEnded".to_string(),
	});
	api.push_page(super_chat_page("N1", "€3.00"));
	let h = Arc::new(harness(api));

	let task = tokio::spawn({
		let h = h.clone();
		async move { h.engine.run().await }
	});

	// Tick 1 polls, tick 2 sees the session end, tick 3 re-resolves and polls.
	for _ in 0..3 {
		tokio::time::sleep(Duration::from_secs(5)).await;
		tokio::task::yield_now().await;
	}
	tokio::time::sleep(Duration::from_millis(10)).await;

	assert_eq!(h.sink.events.lock().len(), 1);
	assert_eq!(cursor(&h.store).await.next_page_token.as_deref(), Some("N1"));
	assert_eq!(h.engine.state(), EngineState::SessionActive);

	h.cancel.cancel();
	task.await.unwrap().unwrap();
	assert_eq!(h.engine.state(), EngineState::Terminated);
}

