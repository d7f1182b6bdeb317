#![forbid(unsafe_code)]

use alertcast_domain::AlertEvent;
use anyhow::Context;
use serde::Deserialize;
use serde_json::json;

/// EventSub subscription types the manager keeps wired up for the primary account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSubKind {
	Follow,
	Raid,
	Subscribe,
	SubscriptionGift,
	SubscriptionMessage,
	Cheer,
}

impl EventSubKind {
	/// Reconciliation order at startup.
	pub const ALL: [EventSubKind; 6] = [
		EventSubKind::Follow,
		EventSubKind::Raid,
		EventSubKind::Subscribe,
		EventSubKind::SubscriptionGift,
		EventSubKind::SubscriptionMessage,
		EventSubKind::Cheer,
	];

	pub const fn as_helix_type(self) -> &'static str {
		match self {
			Self::Follow => "channel.follow",
			Self::Raid => "channel.raid",
			Self::Subscribe => "channel.subscribe",
			Self::SubscriptionGift => "channel.subscription.gift",
			Self::SubscriptionMessage => "channel.subscription.message",
			Self::Cheer => "channel.cheer",
		}
	}

	pub const fn version(self) -> &'static str {
		match self {
			Self::Follow => "2",
			_ => "1",
		}
	}

	pub fn from_helix_type(s: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|k| k.as_helix_type() == s)
	}

	/// Subscription condition for `user_id`.
	///
	/// Follow v2 also needs a moderator id (the broadcaster moderates their own
	/// channel); raid targets the receiving channel instead of the sender.
	pub fn condition(self, user_id: &str) -> serde_json::Value {
		match self {
			Self::Follow => json!({
				"broadcaster_user_id": user_id,
				"moderator_user_id": user_id,
			}),
			Self::Raid => json!({ "to_broadcaster_user_id": user_id }),
			_ => json!({ "broadcaster_user_id": user_id }),
		}
	}

	/// Whether a remote subscription's condition targets `user_id`.
	pub fn matches(self, condition: &serde_json::Value, user_id: &str) -> bool {
		match self {
			Self::Raid => condition_value(condition, "to_broadcaster_user_id") == user_id,
			_ => condition_value(condition, "broadcaster_user_id") == user_id,
		}
	}
}

fn condition_value<'a>(condition: &'a serde_json::Value, key: &str) -> &'a str {
	condition.get(key).and_then(|v| v.as_str()).unwrap_or_default()
}

/// `webhook_callback_verification` body.
#[derive(Debug, Deserialize)]
pub struct Challenge {
	pub challenge: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionInfo {
	#[serde(default)]
	pub id: String,
	#[serde(rename = "type", default)]
	pub event_type: String,
	#[serde(default)]
	pub status: String,
}

/// `notification` body: subscription metadata plus the raw event.
#[derive(Debug, Deserialize)]
pub struct Notification {
	pub subscription: SubscriptionInfo,
	#[serde(default)]
	pub event: serde_json::Value,
}

/// `revocation` body.
#[derive(Debug, Deserialize)]
pub struct Revocation {
	pub subscription: SubscriptionInfo,
}

#[derive(Debug, Deserialize)]
struct FollowEvent {
	#[serde(default)]
	user_name: Option<String>,
	#[serde(default)]
	broadcaster_user_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscribeEvent {
	#[serde(default)]
	user_name: Option<String>,
	#[serde(default)]
	tier: Option<String>,
	#[serde(default)]
	is_gift: bool,
}

#[derive(Debug, Default, Deserialize)]
struct SubscriptionMessageText {
	#[serde(default)]
	text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionMessageEvent {
	#[serde(default)]
	user_name: Option<String>,
	#[serde(default)]
	tier: Option<String>,
	#[serde(default)]
	message: Option<SubscriptionMessageText>,
	#[serde(default)]
	cumulative_months: Option<u32>,
	#[serde(default)]
	streak_months: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionGiftEvent {
	#[serde(default)]
	user_name: Option<String>,
	#[serde(default)]
	total: Option<u32>,
	#[serde(default)]
	tier: Option<String>,
	#[serde(default)]
	is_anonymous: bool,
}

#[derive(Debug, Deserialize)]
struct CheerEvent {
	#[serde(default)]
	is_anonymous: bool,
	#[serde(default)]
	user_name: Option<String>,
	#[serde(default)]
	message: Option<String>,
	#[serde(default)]
	bits: u64,
}

#[derive(Debug, Deserialize)]
struct RaidEvent {
	#[serde(default)]
	from_broadcaster_user_name: Option<String>,
	#[serde(default)]
	viewers: u64,
}

fn parse<T: serde::de::DeserializeOwned>(event: &serde_json::Value, kind: EventSubKind) -> anyhow::Result<T> {
	T::deserialize(event).with_context(|| format!("parse {} event", kind.as_helix_type()))
}

/// Translate a notification into an overlay event.
///
/// Returns `Ok(None)` for subscription types this service does not render.
pub fn translate(event_type: &str, event: &serde_json::Value) -> anyhow::Result<Option<AlertEvent>> {
	let Some(kind) = EventSubKind::from_helix_type(event_type) else {
		return Ok(None);
	};

	let alert = match kind {
		EventSubKind::Follow => {
			let e: FollowEvent = parse(event, kind)?;
			AlertEvent::TwitchFollow {
				user_name: e.user_name.unwrap_or_default(),
				channel_name: e.broadcaster_user_name.unwrap_or_default(),
			}
		}
		EventSubKind::Subscribe => {
			let e: SubscribeEvent = parse(event, kind)?;
			AlertEvent::TwitchSubscribe {
				user_name: e.user_name.unwrap_or_default(),
				tier: e.tier.unwrap_or_default(),
				is_gift: e.is_gift,
			}
		}
		EventSubKind::SubscriptionMessage => {
			let e: SubscriptionMessageEvent = parse(event, kind)?;
			AlertEvent::TwitchResubscribe {
				user_name: e.user_name.unwrap_or_default(),
				tier: e.tier.unwrap_or_default(),
				message: e.message.and_then(|m| m.text).unwrap_or_default(),
				cumulative_months: e.cumulative_months.unwrap_or_default(),
				streak_months: e.streak_months.unwrap_or_default(),
			}
		}
		EventSubKind::SubscriptionGift => {
			let e: SubscriptionGiftEvent = parse(event, kind)?;
			AlertEvent::TwitchGiftSub {
				gifter_name: e.user_name.unwrap_or_default(),
				total_gifts: e.total.unwrap_or_default(),
				tier: e.tier.unwrap_or_default(),
				is_anonymous: e.is_anonymous,
			}
		}
		EventSubKind::Cheer => {
			let e: CheerEvent = parse(event, kind)?;
			AlertEvent::TwitchCheer {
				user_name: e.user_name.unwrap_or_default(),
				bits: e.bits,
				message: e.message.unwrap_or_default(),
				is_anonymous: e.is_anonymous,
			}
		}
		EventSubKind::Raid => {
			let e: RaidEvent = parse(event, kind)?;
			AlertEvent::TwitchRaid {
				raider_name: e.from_broadcaster_user_name.unwrap_or_default(),
				viewers: e.viewers,
			}
		}
	};

	Ok(Some(alert))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cheer_without_optional_fields() {
		let event = json!({"user_name": "Ada", "bits": 500, "message": "gg"});
		let got = translate("channel.cheer", &event).unwrap();
		assert_eq!(
			got,
			Some(AlertEvent::TwitchCheer {
				user_name: "Ada".to_string(),
				bits: 500,
				message: "gg".to_string(),
				is_anonymous: false,
			})
		);
	}

	#[test]
	fn anonymous_gift_has_empty_gifter() {
		let event = json!({
			"user_id": null,
			"user_name": null,
			"broadcaster_user_id": "1337",
			"total": 5,
			"tier": "1000",
			"cumulative_total": null,
			"is_anonymous": true
		});
		let got = translate("channel.subscription.gift", &event).unwrap();
		assert_eq!(
			got,
			Some(AlertEvent::TwitchGiftSub {
				gifter_name: String::new(),
				total_gifts: 5,
				tier: "1000".to_string(),
				is_anonymous: true,
			})
		);
	}

	#[test]
	fn resubscribe_reads_nested_message_and_null_streak() {
		let event = json!({
			"user_name": "Cooler_User",
			"tier": "2000",
			"message": {"text": "Love the stream! FevziGG", "emotes": []},
			"cumulative_months": 15,
			"streak_months": null,
			"duration_months": 6
		});
		let got = translate("channel.subscription.message", &event).unwrap().unwrap();
		assert_eq!(
			got,
			AlertEvent::TwitchResubscribe {
				user_name: "Cooler_User".to_string(),
				tier: "2000".to_string(),
				message: "Love the stream! FevziGG".to_string(),
				cumulative_months: 15,
				streak_months: 0,
			}
		);
	}

	#[test]
	fn raid_uses_sender_name() {
		let event = json!({
			"from_broadcaster_user_name": "Raider",
			"to_broadcaster_user_id": "1337",
			"viewers": 42
		});
		assert_eq!(
			translate("channel.raid", &event).unwrap(),
			Some(AlertEvent::TwitchRaid {
				raider_name: "Raider".to_string(),
				viewers: 42,
			})
		);
	}

	#[test]
	fn unknown_type_is_not_an_error() {
		assert_eq!(translate("channel.ban", &json!({})).unwrap(), None);
	}

	#[test]
	fn malformed_event_is_an_error() {
		assert!(translate("channel.cheer", &json!({"bits": "lots"})).is_err());
	}

	#[test]
	fn raid_condition_matches_target_not_sender() {
		let cond = json!({"from_broadcaster_user_id": "42", "to_broadcaster_user_id": "1337"});
		assert!(EventSubKind::Raid.matches(&cond, "1337"));
		assert!(!EventSubKind::Raid.matches(&cond, "42"));
		assert!(!EventSubKind::Cheer.matches(&cond, "1337"));

		assert_eq!(EventSubKind::Raid.condition("1337")["to_broadcaster_user_id"], "1337");
		assert_eq!(EventSubKind::from_helix_type("channel.subscription.gift"), Some(EventSubKind::SubscriptionGift));
	}
}
