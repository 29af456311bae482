//! Per-client concurrency slots.
//!
//! Each admitted request holds one slot for its client key (`client_id` or
//! `ip:<ip>`) until it finishes. Slots live in the shared KV store as a
//! counter with a short TTL, so slots leaked by a crashed process time out
//! on their own. Without a KV store a mutex-guarded in-process map is used
//! instead (per-process only; other processes then enforce their own
//! budgets). KV errors fail open.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::kv::Kv;

/// Namespace for slot counters in the KV store.
const KEY_PREFIX: &str = "concurrent:gateway:";

/// Counter TTL so stale slots are released if a process dies mid-request.
const KEY_TTL_SECONDS: i64 = 300;

/// The outcome of a slot acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission
{
	/// The request may proceed. `counted` records whether a counter was
	/// actually incremented; [`ConcurrencyLimiter::release`] must only be
	/// called when it was, which keeps the net counter change at zero.
	Admitted
	{
		counted: bool,
	},

	/// The client has too many requests in flight.
	Denied,
}

impl Admission
{
	/// Whether the request may proceed.
	pub fn is_admitted(self) -> bool
	{
		matches!(self, Self::Admitted { .. })
	}
}

/// Limits how many requests a client may have in flight at once.
pub struct ConcurrencyLimiter
{
	kv: Kv,
	fallback: Mutex<HashMap<String, u32>>,
	global_limit: u32,
}

impl ConcurrencyLimiter
{
	/// Creates a limiter with the global per-client default (0 = no limit).
	pub fn new(kv: Kv, global_limit: u32) -> Self
	{
		Self { kv, fallback: Mutex::new(HashMap::new()), global_limit }
	}

	/// Tries to take one slot for the client.
	///
	/// The effective limit is the per-client override when it is positive,
	/// otherwise the global default; a non-positive effective limit means
	/// unlimited.
	pub async fn acquire(&self, client_key: &str, override_limit: Option<i32>) -> Admission
	{
		let limit = override_limit
			.filter(|&limit| limit > 0)
			.map_or(self.global_limit, |limit| limit as u32);

		if limit == 0 || client_key.is_empty() {
			return Admission::Admitted { counted: false };
		}

		if self.kv.is_available() {
			self.acquire_kv(client_key, limit).await
		} else {
			self.acquire_in_memory(client_key, limit)
		}
	}

	/// Returns a slot taken by [`acquire`].
	///
	/// [`acquire`]: Self::acquire
	pub async fn release(&self, client_key: &str)
	{
		if self.kv.is_available() {
			let key = format!("{KEY_PREFIX}{client_key}");

			if let Err(error) = self.kv.decr(&key, 1).await {
				tracing::debug!(%error, "failed to release concurrency slot");
			}

			return;
		}

		let mut slots = self.fallback.lock();

		match slots.get_mut(client_key) {
			Some(count) if *count > 1 => *count -= 1,
			Some(_) => {
				slots.remove(client_key);
			}
			None => {}
		}
	}

	/// KV-backed acquisition: INCR, bounce back over the limit.
	async fn acquire_kv(&self, client_key: &str, limit: u32) -> Admission
	{
		let key = format!("{KEY_PREFIX}{client_key}");

		let count = match self.kv.incr(&key, 1).await {
			Ok(count) => count,
			Err(error) => {
				tracing::debug!(%error, "concurrency counter unavailable; admitting");
				return Admission::Admitted { counted: false };
			}
		};

		if count == 1 {
			if let Err(error) = self.kv.expire(&key, KEY_TTL_SECONDS).await {
				tracing::debug!(%error, "failed to set concurrency counter ttl");
			}
		}

		if count > i64::from(limit) {
			if let Err(error) = self.kv.decr(&key, 1).await {
				tracing::debug!(%error, "failed to undo concurrency increment");
			}

			return Admission::Denied;
		}

		Admission::Admitted { counted: true }
	}

	/// In-process acquisition for KV-less deployments.
	fn acquire_in_memory(&self, client_key: &str, limit: u32) -> Admission
	{
		let mut slots = self.fallback.lock();
		let count = slots.entry(client_key.to_owned()).or_insert(0);

		if *count >= limit {
			return Admission::Denied;
		}

		*count += 1;

		Admission::Admitted { counted: true }
	}
}

impl std::fmt::Debug for ConcurrencyLimiter
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_struct("ConcurrencyLimiter")
			.field("global_limit", &self.global_limit)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	fn limiter(global_limit: u32) -> ConcurrencyLimiter
	{
		ConcurrencyLimiter::new(Kv::disabled(), global_limit)
	}

	#[tokio::test]
	async fn no_limit_admits_without_counting()
	{
		let limiter = limiter(0);

		assert_eq!(
			limiter.acquire("acme", None).await,
			Admission::Admitted { counted: false },
		);
	}

	#[tokio::test]
	async fn limit_is_enforced()
	{
		let limiter = limiter(2);

		assert!(limiter.acquire("acme", None).await.is_admitted());
		assert!(limiter.acquire("acme", None).await.is_admitted());
		assert_eq!(limiter.acquire("acme", None).await, Admission::Denied);
	}

	#[tokio::test]
	async fn release_frees_a_slot()
	{
		let limiter = limiter(1);

		assert!(limiter.acquire("acme", None).await.is_admitted());
		assert_eq!(limiter.acquire("acme", None).await, Admission::Denied);

		limiter.release("acme").await;

		assert!(limiter.acquire("acme", None).await.is_admitted());
	}

	#[tokio::test]
	async fn override_beats_global()
	{
		let limiter = limiter(5);

		assert!(limiter.acquire("acme", Some(1)).await.is_admitted());
		assert_eq!(limiter.acquire("acme", Some(1)).await, Admission::Denied);
	}

	#[tokio::test]
	async fn non_positive_override_falls_back_to_global()
	{
		let limiter = limiter(1);

		assert!(limiter.acquire("acme", Some(0)).await.is_admitted());
		assert_eq!(limiter.acquire("acme", Some(-3)).await, Admission::Denied);
	}

	#[tokio::test]
	async fn clients_do_not_share_slots()
	{
		let limiter = limiter(1);

		assert!(limiter.acquire("acme", None).await.is_admitted());
		assert!(limiter.acquire("ip:192.0.2.1", None).await.is_admitted());
	}

	#[tokio::test]
	async fn slot_conservation()
	{
		let limiter = limiter(4);

		for _ in 0..16 {
			let admission = limiter.acquire("acme", None).await;

			if let Admission::Admitted { counted: true } = admission {
				limiter.release("acme").await;
			}
		}

		assert!(limiter.fallback.lock().get("acme").is_none());
	}
}
