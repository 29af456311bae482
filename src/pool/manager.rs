//! The per-datasource connection pool.
//!
//! The pool is a cache, not a semaphore: an empty pool simply opens a fresh
//! connection, and there is no cap on concurrent opens. Only idle
//! connections are pooled, bounded per datasource by the configured size.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

use super::connect::{self, ExternalConnection};
use super::error::PoolError;
use crate::crypto::Keyring;
use crate::database::Datasource;
use crate::runtime::Config;

/// Connections idle for longer than this must pass a liveness probe before
/// being handed out again.
const PING_IDLE_THRESHOLD: Duration = Duration::from_secs(30);

/// One idle connection waiting in the pool.
///
/// Age eviction keys off `created_at`; the liveness probe keys off
/// `last_used`.
struct Entry
{
	conn: ExternalConnection,
	created_at: Instant,
	last_used: Instant,
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStats
{
	/// Number of datasources with at least one idle connection.
	pub datasources: usize,

	/// Total idle connections across all datasources.
	pub idle_connections: usize,
}

/// Per-datasource pool of idle external connections.
///
/// Process-wide: construct once at startup, pass through the application
/// state, dispose on shutdown.
pub struct Manager
{
	pools: Mutex<HashMap<Uuid, VecDeque<Entry>>>,
	keyring: Keyring,
	max_idle: usize,
	max_age: Duration,
	connect_timeout: Duration,
	statement_timeout: Option<Duration>,
}

impl Manager
{
	/// Creates a pool manager with the configured knobs.
	pub fn new(config: &Config, keyring: Keyring) -> Self
	{
		Self {
			pools: Mutex::new(HashMap::new()),
			keyring,
			max_idle: config.pool_size(),
			max_age: config.pool_max_age(),
			connect_timeout: config.connect_timeout(),
			statement_timeout: config.statement_timeout(),
		}
	}

	/// Returns the configured per-statement timeout.
	pub fn statement_timeout(&self) -> Option<Duration>
	{
		self.statement_timeout
	}

	/// Returns a healthy connection for the datasource, reusing an idle one
	/// when possible.
	#[tracing::instrument(level = "debug", skip_all, fields(datasource.id = %datasource.id), err(level = "debug"))]
	pub async fn acquire(&self, datasource: &Datasource) -> Result<ExternalConnection, PoolError>
	{
		while let Some(entry) = self.pop(datasource.id).await {
			if entry.created_at.elapsed() > self.max_age {
				entry.conn.close().await;
				continue;
			}

			let mut conn = entry.conn;

			if entry.last_used.elapsed() > PING_IDLE_THRESHOLD && conn.ping().await.is_err() {
				conn.close().await;
				continue;
			}

			if conn.rollback().await.is_err() {
				conn.close().await;
				continue;
			}

			return Ok(conn);
		}

		self.open(datasource).await
	}

	/// Opens a fresh connection, bypassing the idle pool.
	pub async fn open(&self, datasource: &Datasource) -> Result<ExternalConnection, PoolError>
	{
		connect::connect(datasource, &self.keyring, self.connect_timeout).await
	}

	/// Returns a connection to the pool, or closes it if the pool is full.
	pub async fn release(&self, mut conn: ExternalConnection, datasource_id: Uuid)
	{
		if conn.rollback().await.is_err() {
			conn.close().await;
			return;
		}

		let rejected = {
			let mut pools = self.pools.lock().await;
			let pool = pools.entry(datasource_id).or_default();

			if pool.len() < self.max_idle {
				let now = Instant::now();

				pool.push_back(Entry { conn, created_at: now, last_used: now });
				None
			} else {
				Some(conn)
			}
		};

		if let Some(conn) = rejected {
			conn.close().await;
		}
	}

	/// Drains and closes pooled connections.
	///
	/// `None` disposes every pool.
	pub async fn dispose(&self, datasource_id: Option<Uuid>)
	{
		let entries = {
			let mut pools = self.pools.lock().await;

			match datasource_id {
				Some(id) => pools.remove(&id).unwrap_or_default().into_iter().collect::<Vec<_>>(),
				None => pools.drain().flat_map(|(_, pool)| pool).collect(),
			}
		};

		for entry in entries {
			entry.conn.close().await;
		}
	}

	/// Returns pool statistics for monitoring.
	pub async fn stats(&self) -> PoolStats
	{
		let pools = self.pools.lock().await;

		PoolStats {
			datasources: pools.values().filter(|pool| !pool.is_empty()).count(),
			idle_connections: pools.values().map(VecDeque::len).sum(),
		}
	}

	/// Pops the oldest idle connection for a datasource.
	async fn pop(&self, datasource_id: Uuid) -> Option<Entry>
	{
		self.pools.lock().await.get_mut(&datasource_id)?.pop_front()
	}
}

impl std::fmt::Debug for Manager
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_struct("Manager")
			.field("max_idle", &self.max_idle)
			.field("max_age", &self.max_age)
			.field("connect_timeout", &self.connect_timeout)
			.field("statement_timeout", &self.statement_timeout)
			.finish_non_exhaustive()
	}
}
