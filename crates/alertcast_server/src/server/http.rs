#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::sync::Arc;

use alertcast_platform::twitch::EventSubManager;
use alertcast_platform::twitch::webhook::{WEBHOOK_PATH, WebhookRequest};
use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::header::{CONNECTION, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::display::{self, DisplaySettings};
use crate::server::health::{HealthState, health_response};
use crate::server::hub::{HubHandle, Payload};

pub const TEST_ALERT_PATH: &str = "/test/alert";

/// Webhook and test bodies are small JSON documents.
const MAX_BODY_BYTES: usize = 1024 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared state for the public listener.
#[derive(Clone)]
pub struct AppState {
	pub hub: HubHandle,
	pub health: HealthState,
	/// `None` when Twitch is not configured.
	pub webhook: Option<Arc<EventSubManager>>,
	pub websocket_path: Arc<str>,
	pub display: DisplaySettings,
}

pub async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
	TcpListener::bind(addr)
		.await
		.with_context(|| format!("bind http listener on {addr}"))
}

/// Overlay websocket, Twitch webhooks and health checks.
pub fn spawn_public_server(listener: TcpListener, state: AppState, cancel: CancellationToken) {
	tokio::spawn(async move {
		loop {
			let stream = tokio::select! {
				_ = cancel.cancelled() => break,
				accepted = listener.accept() => match accepted {
					Ok((stream, _addr)) => stream,
					Err(e) => {
						warn!(error = %e, "public listener accept failed");
						continue;
					}
				},
			};

			let io = TokioIo::new(stream);
			let state = state.clone();
			tokio::spawn(async move {
				let service = service_fn(move |req| route_public(req, state.clone()));
				if let Err(err) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
					debug!(error = %err, "public connection error");
				}
			});
		}
		info!("public listener stopped");
	});
}

/// Loopback-only listener for manually triggered alerts.
pub fn spawn_test_server(listener: TcpListener, hub: HubHandle, cancel: CancellationToken) {
	tokio::spawn(async move {
		loop {
			let stream = tokio::select! {
				_ = cancel.cancelled() => break,
				accepted = listener.accept() => match accepted {
					Ok((stream, _addr)) => stream,
					Err(e) => {
						warn!(error = %e, "test listener accept failed");
						continue;
					}
				},
			};

			let io = TokioIo::new(stream);
			let hub = hub.clone();
			tokio::spawn(async move {
				let service = service_fn(move |req| route_test(req, hub.clone()));
				if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
					debug!(error = %err, "test connection error");
				}
			});
		}
		info!("test listener stopped");
	});
}

pub(crate) async fn route_public<B>(req: Request<B>, state: AppState) -> Result<Response<Full<Bytes>>, Infallible>
where
	B: Body + Send + 'static,
	B::Error: Into<BoxError>,
{
	let path = req.uri().path().to_string();

	if path == *state.websocket_path {
		return Ok(upgrade_display(req, &state));
	}

	if path == WEBHOOK_PATH {
		return Ok(twitch_webhook(req, &state).await);
	}

	if let Some(resp) = health_response(&path, &state.health) {
		if req.method() != Method::GET {
			return Ok(text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"));
		}
		return Ok(resp);
	}

	Ok(text(StatusCode::NOT_FOUND, "Not found"))
}

fn upgrade_display<B>(mut req: Request<B>, state: &AppState) -> Response<Full<Bytes>> {
	if req.method() != Method::GET {
		return text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
	}

	let wants_websocket = req
		.headers()
		.get(UPGRADE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
	let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY).cloned() else {
		return text(StatusCode::BAD_REQUEST, "Expected websocket upgrade");
	};
	if !wants_websocket {
		return text(StatusCode::BAD_REQUEST, "Expected websocket upgrade");
	}

	let accept = derive_accept_key(key.as_bytes());
	let on_upgrade = hyper::upgrade::on(&mut req);
	let hub = state.hub.clone();
	let settings = state.display;

	tokio::spawn(async move {
		match on_upgrade.await {
			Ok(upgraded) => {
				let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
				display::serve(ws, hub, settings).await;
			}
			Err(e) => warn!(error = %e, "websocket upgrade failed"),
		}
	});

	let mut resp = Response::builder()
		.status(StatusCode::SWITCHING_PROTOCOLS)
		.header(UPGRADE, HeaderValue::from_static("websocket"))
		.header(CONNECTION, HeaderValue::from_static("Upgrade"))
		.body(Full::new(Bytes::new()))
		.unwrap();
	if let Ok(v) = HeaderValue::from_str(&accept) {
		resp.headers_mut().insert(SEC_WEBSOCKET_ACCEPT, v);
	}
	resp
}

async fn twitch_webhook<B>(req: Request<B>, state: &AppState) -> Response<Full<Bytes>>
where
	B: Body,
	B::Error: Into<BoxError>,
{
	if req.method() != Method::POST {
		return text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
	}

	let Some(manager) = state.webhook.clone() else {
		return text(StatusCode::SERVICE_UNAVAILABLE, "Twitch integration not configured");
	};

	let (parts, body) = req.into_parts();
	let body = match read_body(body).await {
		Ok(b) => b,
		Err(e) => {
			warn!(error = %e, "failed to read twitch webhook body");
			return text(StatusCode::BAD_REQUEST, "Unreadable body");
		}
	};

	let reply = manager
		.handle_callback(WebhookRequest::from_headers(&parts.headers, body))
		.await;
	text(reply.status, reply.body)
}

pub(crate) async fn route_test<B>(req: Request<B>, hub: HubHandle) -> Result<Response<Full<Bytes>>, Infallible>
where
	B: Body,
	B::Error: Into<BoxError>,
{
	if req.uri().path() != TEST_ALERT_PATH {
		return Ok(text(StatusCode::NOT_FOUND, "Not found"));
	}
	if req.method() != Method::POST {
		return Ok(text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"));
	}

	let body = match read_body(req.into_body()).await {
		Ok(b) => b,
		Err(e) => {
			debug!(error = %e, "failed to read test alert body");
			return Ok(text(StatusCode::BAD_REQUEST, "Invalid JSON"));
		}
	};

	let is_object = serde_json::from_slice::<serde_json::Value>(&body).is_ok_and(|v| v.is_object());
	let Ok(json) = String::from_utf8(body.to_vec()) else {
		return Ok(text(StatusCode::BAD_REQUEST, "Invalid JSON"));
	};
	if !is_object {
		return Ok(text(StatusCode::BAD_REQUEST, "Invalid JSON"));
	}

	hub.broadcast(Payload::from(json));
	metrics::counter!("alertcast_test_alerts_total").increment(1);
	info!("test alert broadcast");

	Ok(text(StatusCode::OK, "Test alert sent"))
}

async fn read_body<B>(body: B) -> Result<Bytes, BoxError>
where
	B: Body,
	B::Error: Into<BoxError>,
{
	Ok(Limited::new(body, MAX_BODY_BYTES).collect().await?.to_bytes())
}

fn text(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.header("content-type", "text/plain; charset=utf-8")
		.body(Full::new(Bytes::from(body.into())))
		.unwrap()
}
