#![forbid(unsafe_code)]

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, timeout, timeout_at};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::server::hub::{ClientId, HubHandle, Payload};

/// Keepalive and write deadlines for one overlay connection.
#[derive(Debug, Clone, Copy)]
pub struct DisplaySettings {
	pub ping_period: Duration,
	/// Close when no pong arrives within this window.
	pub pong_wait: Duration,
	pub write_timeout: Duration,
}

impl Default for DisplaySettings {
	fn default() -> Self {
		Self {
			ping_period: Duration::from_secs(54),
			pong_wait: Duration::from_secs(60),
			write_timeout: Duration::from_secs(10),
		}
	}
}

/// Bridge one upgraded websocket to the hub until either side gives up.
pub async fn serve<S>(ws: WebSocketStream<S>, hub: HubHandle, settings: DisplaySettings)
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let (id, queue) = hub.register();
	let (sink, stream) = ws.split();

	let reason = tokio::select! {
		reason = write_loop(id, sink, queue, settings) => reason,
		reason = read_loop(stream, settings) => reason,
	};

	hub.unregister(id);
	metrics::counter!("alertcast_display_disconnects_total").increment(1);
	info!(client = %id, reason, "display client disconnected");
}

async fn write_loop<W>(id: ClientId, mut sink: W, mut queue: mpsc::Receiver<Payload>, settings: DisplaySettings) -> &'static str
where
	W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
	let mut ping = interval_at(Instant::now() + settings.ping_period, settings.ping_period);

	loop {
		tokio::select! {
			next = queue.recv() => {
				let Some(first) = next else {
					// Evicted or unregistered by the hub.
					let _ = timeout(settings.write_timeout, sink.send(Message::Close(None))).await;
					return "queue closed";
				};

				// Everything already queued goes out with a single flush.
				let batch = async {
					sink.feed(Message::Text(first)).await?;
					let mut sent = 1usize;
					while let Ok(more) = queue.try_recv() {
						sink.feed(Message::Text(more)).await?;
						sent += 1;
					}
					sink.flush().await?;
					Ok::<_, tokio_tungstenite::tungstenite::Error>(sent)
				};

				match timeout(settings.write_timeout, batch).await {
					Ok(Ok(sent)) => {
						if sent > 1 {
							debug!(client = %id, sent, "coalesced overlay writes");
						}
					}
					Ok(Err(e)) => {
						debug!(client = %id, error = %e, "overlay write failed");
						return "write error";
					}
					Err(_) => return "write timeout",
				}
			}
			_ = ping.tick() => {
				match timeout(settings.write_timeout, sink.send(Message::Ping(Bytes::new()))).await {
					Ok(Ok(())) => {}
					Ok(Err(e)) => {
						debug!(client = %id, error = %e, "overlay ping failed");
						return "write error";
					}
					Err(_) => return "write timeout",
				}
			}
		}
	}
}

async fn read_loop<R>(mut stream: R, settings: DisplaySettings) -> &'static str
where
	R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
	let mut deadline = Instant::now() + settings.pong_wait;

	loop {
		match timeout_at(deadline, stream.next()).await {
			Err(_) => return "pong timeout",
			Ok(None) => return "peer closed",
			Ok(Some(Err(_))) => return "read error",
			Ok(Some(Ok(Message::Close(_)))) => return "peer closed",
			Ok(Some(Ok(Message::Pong(_)))) => deadline = Instant::now() + settings.pong_wait,
			// Overlays are not expected to send anything else.
			Ok(Some(Ok(_))) => {}
		}
	}
}
