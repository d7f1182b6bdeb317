#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Flip once startup wiring is done.
	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// `/health` and `/readyz`; `None` for any other path.
pub fn health_response(path: &str, state: &HealthState) -> Option<Response<Full<Bytes>>> {
	match path {
		"/health" => Some(
			Response::builder()
				.status(StatusCode::OK)
				.body(Full::new(Bytes::from_static(b"OK")))
				.unwrap(),
		),
		"/readyz" => {
			let (status, body): (StatusCode, &'static [u8]) = if state.is_ready() {
				(StatusCode::OK, b"ready")
			} else {
				(StatusCode::SERVICE_UNAVAILABLE, b"not-ready")
			};
			Some(
				Response::builder()
					.status(status)
					.body(Full::new(Bytes::from_static(body)))
					.unwrap(),
			)
		}
		_ => None,
	}
}
