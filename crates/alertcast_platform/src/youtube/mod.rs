#![forbid(unsafe_code)]

pub mod client;
pub mod poller;

pub use client::{
	AuthorDetails, DEFAULT_API_BASE_URL, LiveChatApi, LiveChatError, LiveChatMessage, LiveChatPage, MessageSnippet,
	SuperChatDetails, SuperStickerDetails, SuperStickerMetadata, YouTubeClient,
};
pub use poller::{
	DEFAULT_POLL_INTERVAL_SECS, EngineState, PollError, PollReport, PollingEngine, ResolveError, poll_interval,
};
