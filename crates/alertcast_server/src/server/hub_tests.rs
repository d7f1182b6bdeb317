#![forbid(unsafe_code)]

use std::time::Duration;

use alertcast_domain::AlertEvent;
use alertcast_platform::AlertSink;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::server::hub::{HubConfig, HubHandle, Payload, spawn_hub};

fn hub(capacity: usize) -> HubHandle {
	spawn_hub(
		HubConfig {
			client_queue_capacity: capacity,
		},
		CancellationToken::new(),
	)
}

fn payload(n: usize) -> Payload {
	Payload::from(format!("{{\"n\":{n}}}"))
}

#[tokio::test]
async fn saturated_client_is_evicted_without_stalling_others() {
	let hub = hub(2);

	let (_stalled_id, mut stalled) = hub.register();
	let (_a_id, mut a) = hub.register();
	let (_b_id, mut b) = hub.register();

	// Healthy clients drain between broadcasts; the stalled one never reads.
	for n in 0..5 {
		hub.broadcast(payload(n));
		for rx in [&mut a, &mut b] {
			let got = timeout(Duration::from_millis(250), rx.recv())
				.await
				.expect("healthy client should receive within timeout")
				.expect("queue open");
			assert_eq!(got, payload(n));
		}
	}

	assert_eq!(hub.client_count().await, 2);

	// The stalled client keeps what fit, then observes closure.
	assert_eq!(stalled.recv().await, Some(payload(0)));
	assert_eq!(stalled.recv().await, Some(payload(1)));
	assert_eq!(stalled.recv().await, None);
}

#[tokio::test]
async fn unregister_twice_is_a_no_op() {
	let hub = hub(8);

	let (id, mut rx) = hub.register();
	let (_other_id, _other) = hub.register();
	assert_eq!(hub.client_count().await, 2);

	hub.unregister(id);
	hub.unregister(id);
	assert_eq!(hub.client_count().await, 1);

	let closed = timeout(Duration::from_millis(250), rx.recv()).await.expect("closure observed");
	assert!(closed.is_none());
}

#[tokio::test]
async fn clients_do_not_see_earlier_broadcasts() {
	let hub = hub(8);

	hub.broadcast(payload(1));
	let (_id, mut rx) = hub.register();
	hub.broadcast(payload(2));

	let got = timeout(Duration::from_millis(250), rx.recv()).await.unwrap().unwrap();
	assert_eq!(got, payload(2));

	let nothing_more = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(nothing_more.is_err());
}

#[tokio::test]
async fn broadcasts_arrive_in_call_order() {
	let hub = hub(64);
	let (_id, mut rx) = hub.register();

	for n in 0..20 {
		hub.broadcast(payload(n));
	}

	for n in 0..20 {
		let got = timeout(Duration::from_millis(250), rx.recv()).await.unwrap().unwrap();
		assert_eq!(got, payload(n));
	}
}

#[tokio::test]
async fn published_events_are_serialized_as_json() {
	let hub = hub(8);
	let (_id, mut rx) = hub.register();

	hub.publish(AlertEvent::TwitchRaid {
		raider_name: "Ada".to_string(),
		viewers: 42,
	});

	let got = timeout(Duration::from_millis(250), rx.recv()).await.unwrap().unwrap();
	let value: serde_json::Value = serde_json::from_str(got.as_str()).unwrap();
	assert_eq!(
		value,
		serde_json::json!({"type": "twitch_raid", "raider_name": "Ada", "viewers": 42})
	);
}

#[tokio::test]
async fn cancellation_closes_every_queue() {
	let cancel = CancellationToken::new();
	let hub = spawn_hub(HubConfig::default(), cancel.clone());
	let (_id, mut rx) = hub.register();
	assert_eq!(hub.client_count().await, 1);

	cancel.cancel();

	let closed = timeout(Duration::from_millis(250), rx.recv()).await.unwrap();
	assert!(closed.is_none());
}
