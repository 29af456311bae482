//! Facade to the shared key-value store.
//!
//! The gateway uses a Redis-compatible KV service for the shared config-cache
//! tier, the rate-limit sliding windows, and the concurrency counters. All
//! access goes through [`Kv`] so there is exactly one connection manager per
//! process, and so callers can degrade gracefully: when the store is disabled
//! or unreachable, [`Kv::is_available()`] is `false` and callers fall back to
//! their in-memory implementations.

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use thiserror::Error;

use crate::runtime::Config;

/// The errors that can occur when talking to the KV store.
///
/// Callers on the admission path treat all of these as "fail open".
#[derive(Debug, Error)]
pub enum KvError
{
	/// The store is disabled or was unreachable at startup.
	#[error("kv store is not available")]
	Unavailable,

	/// A command failed at runtime.
	#[error(transparent)]
	Command(#[from] redis::RedisError),
}

/// Shared handle to the KV store.
///
/// Cheap to clone. Constructed once at startup; a failed initial connection
/// yields a permanently-degraded handle rather than an error, matching the
/// fail-open posture of everything built on top.
#[derive(Clone)]
pub struct Kv
{
	inner: Option<ConnectionManager>,
}

impl Kv
{
	/// Connects to the configured KV store.
	///
	/// Returns a degraded (no-op) handle when caching is disabled, no URL is
	/// configured, or the store cannot be reached.
	pub async fn connect(config: &Config) -> Self
	{
		if !config.cache_enabled() {
			tracing::debug!("kv store disabled by configuration");
			return Self { inner: None };
		}

		let Some(url) = config.redis_url() else {
			tracing::debug!("no kv store url configured");
			return Self { inner: None };
		};

		let manager = async {
			let client = redis::Client::open(url.as_str())?;
			let mut manager = ConnectionManager::new(client).await?;

			redis::cmd("PING").query_async::<()>(&mut manager).await?;

			Ok::<_, redis::RedisError>(manager)
		}
		.await;

		match manager {
			Ok(manager) => Self { inner: Some(manager) },
			Err(error) => {
				tracing::warn!(%error, "kv store unreachable; using in-memory fallbacks");
				Self { inner: None }
			}
		}
	}

	/// Creates a handle that is permanently degraded.
	///
	/// Useful for tests and for running without a KV service.
	pub fn disabled() -> Self
	{
		Self { inner: None }
	}

	/// Whether the store was reachable at startup.
	pub fn is_available(&self) -> bool
	{
		self.inner.is_some()
	}

	/// Clones the underlying connection manager, if available.
	fn connection(&self) -> Result<ConnectionManager, KvError>
	{
		self.inner.clone().ok_or(KvError::Unavailable)
	}

	/// Verifies the store still responds.
	pub async fn ping(&self) -> bool
	{
		let Ok(mut conn) = self.connection() else {
			return false;
		};

		redis::cmd("PING").query_async::<()>(&mut conn).await.is_ok()
	}

	/// Reads a string value.
	pub async fn get(&self, key: &str) -> Result<Option<String>, KvError>
	{
		let mut conn = self.connection()?;

		Ok(conn.get(key).await?)
	}

	/// Writes a string value with a TTL in seconds.
	pub async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), KvError>
	{
		let mut conn = self.connection()?;

		Ok(conn.set_ex(key, value, ttl_seconds).await?)
	}

	/// Deletes a key.
	pub async fn del(&self, key: &str) -> Result<(), KvError>
	{
		let mut conn = self.connection()?;

		Ok(conn.del(key).await?)
	}

	/// Whether a key exists.
	pub async fn exists(&self, key: &str) -> Result<bool, KvError>
	{
		let mut conn = self.connection()?;

		Ok(conn.exists(key).await?)
	}

	/// Atomically increments a counter, returning the new value.
	pub async fn incr(&self, key: &str, delta: i64) -> Result<i64, KvError>
	{
		let mut conn = self.connection()?;

		Ok(conn.incr(key, delta).await?)
	}

	/// Atomically decrements a counter, returning the new value.
	pub async fn decr(&self, key: &str, delta: i64) -> Result<i64, KvError>
	{
		let mut conn = self.connection()?;

		Ok(conn.decr(key, delta).await?)
	}

	/// Sets a TTL on an existing key.
	pub async fn expire(&self, key: &str, ttl_seconds: i64) -> Result<(), KvError>
	{
		let mut conn = self.connection()?;

		Ok(conn.expire(key, ttl_seconds).await?)
	}

	/// Removes sorted-set members with scores in `[min, max]`.
	pub async fn zrembyscore(&self, key: &str, min: f64, max: f64) -> Result<(), KvError>
	{
		let mut conn = self.connection()?;

		Ok(conn.zrembyscore(key, min, max).await?)
	}

	/// Returns the cardinality of a sorted set.
	pub async fn zcard(&self, key: &str) -> Result<u64, KvError>
	{
		let mut conn = self.connection()?;

		Ok(conn.zcard(key).await?)
	}

	/// Adds a member to a sorted set.
	pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError>
	{
		let mut conn = self.connection()?;

		Ok(conn.zadd(key, member, score).await?)
	}
}

impl std::fmt::Debug for Kv
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_struct("Kv").field("available", &self.is_available()).finish()
	}
}
