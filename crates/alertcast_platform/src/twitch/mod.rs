#![forbid(unsafe_code)]

pub mod auth;
pub mod chat;
pub mod eventsub;
pub mod helix;
mod manager;
pub mod webhook;

pub use auth::{ConfiguredToken, CredentialStrategy, Declined, RefreshError, RefreshedCredential, StoredCredential, StrategyOutcome, TokenRefresher, resolve_credential};
pub use chat::{ChatConfig, TwitchChat};
pub use eventsub::EventSubKind;
pub use helix::{CreateSubscriptionError, EventSubApi, HelixClient, HelixConfig, RemoteSubscription, SubscriptionRequest, TokenGrant, TokenValidation};
pub use manager::{EventSubManager, EventSubSettings, Ensured, StartupReport, callback_url};
pub use webhook::{WebhookReply, WebhookRequest};
