#![forbid(unsafe_code)]

use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
	#[error("rate limiter wait cancelled")]
	Cancelled,
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn refill(&mut self, now: Instant) {
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
	}

	/// Take a token, or report how long until one is available.
	fn take(&mut self, now: Instant) -> Result<(), Duration> {
		self.refill(now);
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			return Ok(());
		}
		let missing = 1.0 - self.tokens;
		Err(Duration::from_secs_f64(missing / self.refill_per_sec))
	}
}

/// Token-bucket admission control shared by outbound API calls and chat replies.
///
/// `acquire` never drops work: it waits until a token is free or the
/// cancellation token fires.
#[derive(Debug)]
pub struct RateLimiter {
	bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
	/// `refill_per_sec` tokens per second, holding at most `burst` tokens.
	/// The bucket starts full. Zero values are raised to the smallest usable bucket.
	pub fn new(refill_per_sec: f64, burst: u32) -> Self {
		let capacity = burst.max(1) as f64;
		let refill_per_sec = if refill_per_sec.is_finite() && refill_per_sec > 0.0 {
			refill_per_sec
		} else {
			1.0
		};
		Self {
			bucket: Mutex::new(TokenBucket {
				capacity,
				tokens: capacity,
				refill_per_sec,
				last: Instant::now(),
			}),
		}
	}

	/// Outbound chat replies: 1 message per second, burst of 5.
	pub fn chat_default() -> Self {
		Self::new(1.0, 5)
	}

	/// Outbound platform API calls.
	pub fn api_default() -> Self {
		Self::new(5.0, 10)
	}

	/// Take a token if one is available right now.
	pub fn try_acquire(&self) -> bool {
		self.bucket.lock().take(Instant::now()).is_ok()
	}

	/// Wait for a token. Returns `Cancelled` if `cancel` fires first.
	pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), RateLimitError> {
		loop {
			if cancel.is_cancelled() {
				return Err(RateLimitError::Cancelled);
			}

			let taken = self.bucket.lock().take(Instant::now());
			let wait = match taken {
				Ok(()) => return Ok(()),
				Err(wait) => wait,
			};

			tokio::select! {
				_ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
				_ = tokio::time::sleep(wait) => {}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[test]
	fn burst_is_available_immediately_then_exhausted() {
		let limiter = RateLimiter::new(1.0, 3);
		assert!(limiter.try_acquire());
		assert!(limiter.try_acquire());
		assert!(limiter.try_acquire());
		assert!(!limiter.try_acquire(), "fourth token should not be available yet");
	}

	#[tokio::test]
	async fn acquire_waits_for_refill() {
		let limiter = RateLimiter::new(20.0, 1);
		let cancel = CancellationToken::new();

		limiter.acquire(&cancel).await.expect("first token");
		let started = std::time::Instant::now();
		limiter.acquire(&cancel).await.expect("second token after refill");
		assert!(
			started.elapsed() >= Duration::from_millis(30),
			"expected to wait for refill, waited {:?}",
			started.elapsed()
		);
	}

	#[tokio::test]
	async fn acquire_returns_cancelled_when_token_fires() {
		let limiter = RateLimiter::new(0.01, 1);
		let cancel = CancellationToken::new();
		limiter.acquire(&cancel).await.expect("burst token");

		let waiter = {
			let cancel = cancel.clone();
			tokio::spawn(async move { limiter.acquire(&cancel).await })
		};
		tokio::time::sleep(Duration::from_millis(20)).await;
		cancel.cancel();

		let res = tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.expect("acquire should return promptly after cancel")
			.expect("task join");
		assert_eq!(res, Err(RateLimitError::Cancelled));
	}
}
