//! Sliding-window rate limiting.
//!
//! Sixty-second sliding window per composite key. In the KV store the
//! window is a sorted set of request timestamps: expired members are
//! removed by score, the cardinality is compared against the limit, and an
//! admitted request appends its own timestamp. Without a KV store a
//! mutex-guarded in-process map of timestamps is used (per-process only).
//! KV errors fail open.
//!
//! Timestamps are wall-clock UNIX time; clock skew between processes can
//! produce short-lived double admits. A monotonic server-side timestamp
//! would be stricter, but wall clock is what the window is defined over.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng as _;

use crate::kv::Kv;

/// Namespace for window keys in the KV store.
const KEY_PREFIX: &str = "ratelimit:gateway:";

/// Window length in seconds.
const WINDOW_SECONDS: f64 = 60.0;

/// Limits requests per minute per composite key.
pub struct RateLimiter
{
	kv: Kv,
	fallback: Mutex<HashMap<String, Vec<f64>>>,

	/// Kill switch: when false, every check passes.
	enabled: bool,
}

impl RateLimiter
{
	/// Creates a limiter.
	pub fn new(kv: Kv, enabled: bool) -> Self
	{
		Self { kv, fallback: Mutex::new(HashMap::new()), enabled }
	}

	/// Whether a request under this key is admitted (and, if so, records
	/// it in the window).
	///
	/// A non-positive limit means unlimited.
	pub async fn check(&self, key: &str, limit: i32) -> bool
	{
		if !self.enabled || limit <= 0 || key.is_empty() {
			return true;
		}

		let limit = limit.max(1) as u64;

		if self.kv.is_available() {
			self.check_kv(key, limit).await
		} else {
			self.check_in_memory(key, limit, unix_now())
		}
	}

	/// KV-backed sliding window over a sorted set.
	async fn check_kv(&self, key: &str, limit: u64) -> bool
	{
		let key = format!("{KEY_PREFIX}{key}");
		let now = unix_now();
		let cutoff = now - WINDOW_SECONDS;

		let admitted = async {
			self.kv.zrembyscore(&key, 0.0, cutoff).await?;

			if self.kv.zcard(&key).await? >= limit {
				return Ok(false);
			}

			// Random member so two requests in the same instant both count.
			let member = format!("{now}-{:08x}", rand::thread_rng().r#gen::<u32>());

			self.kv.zadd(&key, &member, now).await?;
			self.kv.expire(&key, WINDOW_SECONDS as i64 + 1).await?;

			Ok::<_, crate::kv::KvError>(true)
		}
		.await;

		match admitted {
			Ok(admitted) => admitted,
			Err(error) => {
				tracing::debug!(%error, "rate-limit window unavailable; admitting");
				true
			}
		}
	}

	/// In-process sliding window for KV-less deployments.
	fn check_in_memory(&self, key: &str, limit: u64, now: f64) -> bool
	{
		let cutoff = now - WINDOW_SECONDS;
		let mut windows = self.fallback.lock();
		let window = windows.entry(key.to_owned()).or_default();

		window.retain(|&timestamp| timestamp > cutoff);

		if window.len() as u64 >= limit {
			return false;
		}

		window.push(now);
		true
	}
}

impl std::fmt::Debug for RateLimiter
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_struct("RateLimiter").field("enabled", &self.enabled).finish_non_exhaustive()
	}
}

/// Picks the effective limit and composite window key for a request.
///
/// The endpoint's limit wins over the client's, which wins over the global
/// default. Returns `None` when no positive limit applies.
pub fn effective_limit(
	endpoint_id: uuid::Uuid,
	endpoint_limit: Option<i32>,
	client_limit: Option<i32>,
	default_limit: u32,
	client_key: &str,
) -> Option<(i32, String)>
{
	if let Some(limit) = endpoint_limit.filter(|&limit| limit > 0) {
		return Some((limit, format!("api:{endpoint_id}:{client_key}")));
	}

	if let Some(limit) = client_limit.filter(|&limit| limit > 0) {
		return Some((limit, format!("client:{client_key}")));
	}

	if default_limit > 0 {
		return Some((default_limit as i32, format!("client:{client_key}")));
	}

	None
}

/// Wall-clock UNIX time as seconds.
fn unix_now() -> f64
{
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|elapsed| elapsed.as_secs_f64())
		.unwrap_or_default()
}

#[cfg(test)]
mod tests
{
	use super::*;

	fn limiter() -> RateLimiter
	{
		RateLimiter::new(Kv::disabled(), true)
	}

	#[tokio::test]
	async fn disabled_limiter_always_admits()
	{
		let limiter = RateLimiter::new(Kv::disabled(), false);

		for _ in 0..100 {
			assert!(limiter.check("k", 1).await);
		}
	}

	#[tokio::test]
	async fn non_positive_limit_means_unlimited()
	{
		let limiter = limiter();

		assert!(limiter.check("k", 0).await);
		assert!(limiter.check("k", -5).await);
	}

	#[test]
	fn window_admits_up_to_limit()
	{
		let limiter = limiter();

		assert!(limiter.check_in_memory("k", 3, 100.0));
		assert!(limiter.check_in_memory("k", 3, 100.1));
		assert!(limiter.check_in_memory("k", 3, 100.2));
		assert!(!limiter.check_in_memory("k", 3, 100.3));
	}

	#[test]
	fn window_slides()
	{
		let limiter = limiter();

		// Perfectly spaced at the limit rate: everything is admitted.
		for i in 0..10 {
			assert!(limiter.check_in_memory("k", 3, 100.0 + 20.0 * f64::from(i)));
		}

		// One extra request inside a window is the one that gets rejected.
		assert!(limiter.check_in_memory("fresh", 3, 100.0));
		assert!(limiter.check_in_memory("fresh", 3, 110.0));
		assert!(limiter.check_in_memory("fresh", 3, 120.0));
		assert!(!limiter.check_in_memory("fresh", 3, 130.0));

		// Once the first timestamp ages out, capacity returns.
		assert!(limiter.check_in_memory("fresh", 3, 161.0));
	}

	#[test]
	fn windows_are_per_key()
	{
		let limiter = limiter();

		assert!(limiter.check_in_memory("a", 1, 100.0));
		assert!(limiter.check_in_memory("b", 1, 100.0));
		assert!(!limiter.check_in_memory("a", 1, 100.5));
	}

	#[test]
	fn effective_limit_prefers_endpoint()
	{
		let endpoint_id = uuid::Uuid::new_v4();

		let (limit, key) =
			effective_limit(endpoint_id, Some(3), Some(10), 100, "acme").unwrap();

		assert_eq!(limit, 3);
		assert_eq!(key, format!("api:{endpoint_id}:acme"));
	}

	#[test]
	fn effective_limit_falls_back_to_client_then_default()
	{
		let endpoint_id = uuid::Uuid::new_v4();

		let (limit, key) = effective_limit(endpoint_id, None, Some(10), 100, "acme").unwrap();

		assert_eq!((limit, key.as_str()), (10, "client:acme"));

		let (limit, key) = effective_limit(endpoint_id, Some(0), None, 100, "acme").unwrap();

		assert_eq!((limit, key.as_str()), (100, "client:acme"));

		assert!(effective_limit(endpoint_id, None, None, 0, "acme").is_none());
	}
}
