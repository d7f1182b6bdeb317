#![forbid(unsafe_code)]

use bytes::Bytes;
use hmac::{Hmac, Mac};
use hyper::{HeaderMap, StatusCode};
use sha2::Sha256;

/// Callback path registered with Twitch, relative to the public base URL.
pub const WEBHOOK_PATH: &str = "/webhooks/twitch";

pub const MESSAGE_ID_HEADER: &str = "Twitch-Eventsub-Message-Id";
pub const MESSAGE_TIMESTAMP_HEADER: &str = "Twitch-Eventsub-Message-Timestamp";
pub const MESSAGE_SIGNATURE_HEADER: &str = "Twitch-Eventsub-Message-Signature";
pub const MESSAGE_TYPE_HEADER: &str = "Twitch-Eventsub-Message-Type";

pub const TYPE_VERIFICATION: &str = "webhook_callback_verification";
pub const TYPE_NOTIFICATION: &str = "notification";
pub const TYPE_REVOCATION: &str = "revocation";

const SIGNATURE_PREFIX: &str = "sha256=";

/// One inbound EventSub callback, fully read.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
	pub message_id: String,
	pub timestamp: String,
	pub signature: String,
	pub message_type: String,
	pub body: Bytes,
}

impl WebhookRequest {
	pub fn from_headers(headers: &HeaderMap, body: Bytes) -> Self {
		let header = |name: &str| {
			headers
				.get(name)
				.and_then(|v| v.to_str().ok())
				.unwrap_or_default()
				.to_string()
		};

		Self {
			message_id: header(MESSAGE_ID_HEADER),
			timestamp: header(MESSAGE_TIMESTAMP_HEADER),
			signature: header(MESSAGE_SIGNATURE_HEADER),
			message_type: header(MESSAGE_TYPE_HEADER),
			body,
		}
	}
}

/// Plain-text reply to an EventSub callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookReply {
	pub status: StatusCode,
	pub body: String,
}

impl WebhookReply {
	pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
		Self {
			status,
			body: body.into(),
		}
	}

	pub fn ok() -> Self {
		Self::new(StatusCode::OK, "OK")
	}
}

fn mac_for(secret: &[u8], message_id: &str, timestamp: &str, body: &[u8]) -> Option<Hmac<Sha256>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).ok()?;
	mac.update(message_id.as_bytes());
	mac.update(timestamp.as_bytes());
	mac.update(body);
	Some(mac)
}

/// `sha256=<hex>` signature Twitch attaches to a callback.
pub fn sign(secret: &[u8], message_id: &str, timestamp: &str, body: &[u8]) -> String {
	let digest = mac_for(secret, message_id, timestamp, body)
		.map(|mac| mac.finalize().into_bytes().to_vec())
		.unwrap_or_default();
	format!("{SIGNATURE_PREFIX}{}", hex::encode(digest))
}

/// Constant-time check of a callback signature. An empty secret never verifies.
pub fn verify_signature(secret: &[u8], req: &WebhookRequest) -> bool {
	if secret.is_empty() {
		return false;
	}

	let Some(hex_sig) = req.signature.strip_prefix(SIGNATURE_PREFIX) else {
		return false;
	};
	let Ok(provided) = hex::decode(hex_sig.trim()) else {
		return false;
	};
	let Some(mac) = mac_for(secret, &req.message_id, &req.timestamp, &req.body) else {
		return false;
	};

	mac.verify_slice(&provided).is_ok()
}
