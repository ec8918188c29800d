use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::http::{HeaderValue, StatusCode, x_headers};
use crate::llm::LLMRequest;
use crate::proxy::{ProxyError, ProxyResponse};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RateLimitType {
	/// Each request consumes one token.
	#[default]
	#[serde(alias = "requests")]
	RequestsPerUnit,
	/// LLM requests consume their token usage; the estimate is trued up when
	/// the response usage is known.
	#[serde(alias = "tokens")]
	TokensPerUnit,
}

/// An in-process token bucket.
///
/// The grant path is a compare-and-swap loop over a packed (fill epoch,
/// tokens) pair so concurrent requests never over-admit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimit {
	pub max_tokens: u64,
	pub tokens_per_fill: u64,
	#[serde(with = "crate::serdes::serde_dur")]
	pub fill_interval: Duration,
	#[serde(default, rename = "type")]
	pub limit_type: RateLimitType,
	#[serde(skip, default)]
	state: Arc<BucketState>,
}

#[derive(Debug)]
struct BucketState {
	tokens: AtomicU64,
	last_fill_ms: AtomicU64,
	/// Post-response corrections that could not be taken from the bucket
	/// immediately (it was already empty).
	debt: AtomicI64,
	initialized: AtomicU64,
}

impl Default for BucketState {
	fn default() -> Self {
		BucketState {
			tokens: AtomicU64::new(0),
			last_fill_ms: AtomicU64::new(0),
			debt: AtomicI64::new(0),
			initialized: AtomicU64::new(0),
		}
	}
}

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn now_ms() -> u64 {
	EPOCH.elapsed().as_millis() as u64
}

impl RateLimit {
	pub fn check_request(&self) -> Result<(), ProxyResponse> {
		if self.limit_type != RateLimitType::RequestsPerUnit {
			return Ok(());
		}
		self.try_consume(1)
	}

	pub fn check_llm_request(&self, llm: &LLMRequest) -> Result<(), ProxyResponse> {
		if self.limit_type != RateLimitType::TokensPerUnit {
			return Ok(());
		}
		// Charge what we know now; the response side trues it up.
		self.try_consume(llm.input_tokens.unwrap_or(0))
	}

	/// Apply the post-response correction: positive removes tokens that the
	/// request side under-counted, negative returns over-counted tokens.
	pub fn amend_tokens(&self, delta: i64) {
		if self.limit_type != RateLimitType::TokensPerUnit || delta == 0 {
			return;
		}
		self.state.debt.fetch_add(delta, Ordering::Relaxed);
	}

	fn try_consume(&self, cost: u64) -> Result<(), ProxyResponse> {
		self.refill();
		self.settle_debt();
		let state = &self.state;
		let mut current = state.tokens.load(Ordering::Acquire);
		loop {
			if current < cost {
				return Err(self.limited());
			}
			match state.tokens.compare_exchange_weak(
				current,
				current - cost,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				Ok(_) => return Ok(()),
				Err(observed) => current = observed,
			}
		}
	}

	fn refill(&self) {
		let state = &self.state;
		let now = now_ms();
		if state
			.initialized
			.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
		{
			state.tokens.store(self.max_tokens, Ordering::Release);
			state.last_fill_ms.store(now, Ordering::Release);
			return;
		}
		let interval_ms = self.fill_interval.as_millis().max(1) as u64;
		let last = state.last_fill_ms.load(Ordering::Acquire);
		let elapsed = now.saturating_sub(last);
		if elapsed < interval_ms {
			return;
		}
		let fills = elapsed / interval_ms;
		// One winner advances the clock and adds the tokens.
		if state
			.last_fill_ms
			.compare_exchange(last, last + fills * interval_ms, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
		{
			let add = fills.saturating_mul(self.tokens_per_fill);
			let mut current = state.tokens.load(Ordering::Acquire);
			loop {
				let next = current.saturating_add(add).min(self.max_tokens);
				match state.tokens.compare_exchange_weak(
					current,
					next,
					Ordering::AcqRel,
					Ordering::Acquire,
				) {
					Ok(_) => return,
					Err(observed) => current = observed,
				}
			}
		}
	}

	fn settle_debt(&self) {
		let state = &self.state;
		let debt = state.debt.swap(0, Ordering::AcqRel);
		if debt == 0 {
			return;
		}
		let mut current = state.tokens.load(Ordering::Acquire);
		loop {
			let next = if debt > 0 {
				current.saturating_sub(debt as u64)
			} else {
				current
					.saturating_add(debt.unsigned_abs())
					.min(self.max_tokens)
			};
			match state.tokens.compare_exchange_weak(
				current,
				next,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				Ok(_) => return,
				Err(observed) => current = observed,
			}
		}
	}

	fn limited(&self) -> ProxyResponse {
		let mut resp = ProxyError::RateLimitExceeded.into_response();
		let headers = resp.headers_mut();
		if let Ok(v) = HeaderValue::from_str(&self.max_tokens.to_string()) {
			headers.insert(x_headers::X_RATELIMIT_LIMIT, v);
		}
		headers.insert(
			x_headers::X_RATELIMIT_REMAINING,
			HeaderValue::from_static("0"),
		);
		if let Ok(v) = HeaderValue::from_str(&self.fill_interval.as_secs().to_string()) {
			headers.insert(x_headers::X_RATELIMIT_RESET, v);
		}
		debug_assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
		ProxyResponse::DirectResponse(Box::new(resp))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn limit(max: u64, per_fill: u64, interval: Duration) -> RateLimit {
		RateLimit {
			max_tokens: max,
			tokens_per_fill: per_fill,
			fill_interval: interval,
			limit_type: RateLimitType::RequestsPerUnit,
			state: Default::default(),
		}
	}

	#[test]
	fn burst_then_reject() {
		let rl = limit(2, 2, Duration::from_secs(60));
		assert!(rl.check_request().is_ok());
		assert!(rl.check_request().is_ok());
		assert!(rl.check_request().is_err());
	}

	#[test]
	fn refills_after_interval() {
		let rl = limit(1, 1, Duration::from_millis(20));
		assert!(rl.check_request().is_ok());
		assert!(rl.check_request().is_err());
		std::thread::sleep(Duration::from_millis(30));
		assert!(rl.check_request().is_ok());
	}

	#[test]
	fn token_type_ignores_plain_requests() {
		let rl = RateLimit {
			limit_type: RateLimitType::TokensPerUnit,
			..limit(1, 1, Duration::from_secs(60))
		};
		for _ in 0..10 {
			assert!(rl.check_request().is_ok());
		}
	}

	#[test]
	fn amend_collects_debt() {
		let rl = RateLimit {
			limit_type: RateLimitType::TokensPerUnit,
			..limit(100, 100, Duration::from_secs(60))
		};
		let req = LLMRequest {
			input_tokens: Some(40),
			..LLMRequest::test_default()
		};
		assert!(rl.check_llm_request(&req).is_ok());
		// Response reported 80 more tokens than charged.
		rl.amend_tokens(80);
		let big = LLMRequest {
			input_tokens: Some(50),
			..LLMRequest::test_default()
		};
		// 100 - 40 - 80 leaves nothing for a 50 token request.
		assert!(rl.check_llm_request(&big).is_err());
	}
}
