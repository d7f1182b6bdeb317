#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use alertcast_domain::AlertEvent;
use alertcast_platform::AlertSink;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One serialized overlay event. Cheap to clone across clients.
pub type Payload = Utf8Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "client-{}", self.0)
	}
}

#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Outbound queue depth per display client; a full queue evicts the client.
	pub client_queue_capacity: usize,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			client_queue_capacity: 256,
		}
	}
}

enum HubCommand {
	Register { id: ClientId, tx: mpsc::Sender<Payload> },
	Unregister(ClientId),
	Broadcast(Payload),
	Count(oneshot::Sender<usize>),
}

/// Handle to the hub control loop. Every mutation of the client set is a
/// message to that loop, so commands take effect in the order they were sent.
#[derive(Clone)]
pub struct HubHandle {
	tx: mpsc::UnboundedSender<HubCommand>,
	next_id: Arc<AtomicU64>,
	capacity: usize,
}

impl HubHandle {
	/// Add a client. It only sees payloads broadcast after this call.
	pub fn register(&self) -> (ClientId, mpsc::Receiver<Payload>) {
		let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
		let (tx, rx) = mpsc::channel(self.capacity);
		self.send(HubCommand::Register { id, tx });
		(id, rx)
	}

	/// Remove a client and close its queue. Unknown ids are ignored.
	pub fn unregister(&self, id: ClientId) {
		self.send(HubCommand::Unregister(id));
	}

	pub fn broadcast(&self, payload: Payload) {
		self.send(HubCommand::Broadcast(payload));
	}

	/// Number of registered clients once every earlier command has been applied.
	pub async fn client_count(&self) -> usize {
		let (tx, rx) = oneshot::channel();
		self.send(HubCommand::Count(tx));
		rx.await.unwrap_or(0)
	}

	fn send(&self, cmd: HubCommand) {
		if self.tx.send(cmd).is_err() {
			debug!("hub stopped; command dropped");
		}
	}
}

impl AlertSink for HubHandle {
	fn publish(&self, event: AlertEvent) {
		match serde_json::to_string(&event) {
			Ok(json) => self.broadcast(Payload::from(json)),
			Err(e) => error!(error = %e, "failed to serialize overlay event"),
		}
	}
}

/// Start the hub control loop. It exits on cancellation or once every handle is dropped.
pub fn spawn_hub(cfg: HubConfig, cancel: CancellationToken) -> HubHandle {
	let (tx, rx) = mpsc::unbounded_channel();
	let handle = HubHandle {
		tx,
		next_id: Arc::new(AtomicU64::new(1)),
		capacity: cfg.client_queue_capacity.max(1),
	};

	tokio::spawn(run_hub(rx, cancel));

	handle
}

async fn run_hub(mut rx: mpsc::UnboundedReceiver<HubCommand>, cancel: CancellationToken) {
	let mut clients: HashMap<ClientId, mpsc::Sender<Payload>> = HashMap::new();

	loop {
		let cmd = tokio::select! {
			_ = cancel.cancelled() => break,
			cmd = rx.recv() => match cmd {
				Some(cmd) => cmd,
				None => break,
			},
		};

		match cmd {
			HubCommand::Register { id, tx } => {
				clients.insert(id, tx);
				metrics::counter!("alertcast_hub_registrations_total").increment(1);
				info!(client = %id, clients = clients.len(), "display client registered");
			}
			HubCommand::Unregister(id) => {
				if clients.remove(&id).is_some() {
					info!(client = %id, clients = clients.len(), "display client unregistered");
				}
			}
			HubCommand::Broadcast(payload) => {
				metrics::counter!("alertcast_hub_broadcasts_total").increment(1);
				deliver(&mut clients, payload);
			}
			HubCommand::Count(reply) => {
				let _ = reply.send(clients.len());
			}
		}
	}

	debug!(clients = clients.len(), "hub control loop stopped");
}

fn deliver(clients: &mut HashMap<ClientId, mpsc::Sender<Payload>>, payload: Payload) {
	clients.retain(|id, tx| match tx.try_send(payload.clone()) {
		Ok(()) => true,
		Err(mpsc::error::TrySendError::Full(_)) => {
			metrics::counter!("alertcast_hub_evictions_total").increment(1);
			warn!(client = %id, "display client queue full; evicting");
			false
		}
		Err(mpsc::error::TrySendError::Closed(_)) => {
			debug!(client = %id, "display client queue closed; removing");
			false
		}
	});
}
