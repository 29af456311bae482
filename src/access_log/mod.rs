//! Access-record persistence.
//!
//! One record per dispatched request. Writes are best-effort: a failure is
//! logged and swallowed, never surfaced to the request that produced the
//! record. The singleton `access_log_config` row selects the target: the
//! main store (default), an external datasource's `access_record` table, or
//! - for MySQL-wire datasources with the audit dialect enabled - a
//! dedicated audit table. External writes use their own cached connection,
//! never the request's session.

use std::time::Duration;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::crypto::Keyring;
use crate::database::{AccessRecord, Datasource, ProductKind, Store};
use crate::pool::{self, ExternalConnection};
use crate::runtime::Config;

/// Truncation limit for request bodies (text column, keep rows small).
const BODY_LIMIT: usize = 2 * 1024;

/// Truncation limit for headers/params JSON (wide text columns).
const HEADERS_LIMIT: usize = 64 * 1024;

/// Audit-dialect target table (separate DDL, canonical columns).
const AUDIT_TABLE: &str = "dbgate_audit_db__.access_record_tbl__";

/// Writes access records to the configured target.
pub struct Writer
{
	store: Store,
	keyring: Keyring,
	connect_timeout: Duration,

	/// Cached connection to the external log datasource, keyed by the
	/// datasource id it was opened for.
	cached: Mutex<Option<(Uuid, ExternalConnection)>>,
}

impl Writer
{
	/// Creates a writer over the main store.
	pub fn new(store: Store, keyring: Keyring, config: &Config) -> Self
	{
		Self { store, keyring, connect_timeout: config.connect_timeout(), cached: Mutex::new(None) }
	}

	/// Persists one access record. Never fails the caller.
	pub async fn write(&self, record: AccessRecord)
	{
		let record = truncate(record);

		if let Err(error) = self.write_routed(&record).await {
			tracing::warn!(
				target: "dbgate::audit_log",
				%error,
				record.path = %record.path,
				"failed to persist access record",
			);
		}
	}

	/// Drops the cached external connection.
	///
	/// Must be called when the configured storage datasource changes.
	pub async fn invalidate_cache(&self)
	{
		if let Some((_, conn)) = self.cached.lock().await.take() {
			conn.close().await;
		}
	}

	/// Routes the record to its configured target.
	async fn write_routed(&self, record: &AccessRecord) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
	{
		let config = match self.store.access_log_config().await {
			Ok(config) => config,
			Err(error) => {
				tracing::debug!(%error, "access log config unreadable; using main store");
				None
			}
		};

		let Some(config) = config else {
			return Ok(self.store.insert_access_record(record).await?);
		};

		let Some(datasource_id) = config.datasource_id else {
			return Ok(self.store.insert_access_record(record).await?);
		};

		let datasource = self.store.datasource(datasource_id).await?;

		let Some(datasource) = datasource.filter(|datasource| datasource.is_active) else {
			return Ok(self.store.insert_access_record(record).await?);
		};

		let audit = config.use_audit_dialect && datasource.kind == ProductKind::Mysql;

		if datasource.kind == ProductKind::Trino {
			tracing::debug!("trino is not a supported access-log target; using main store");

			return Ok(self.store.insert_access_record(record).await?);
		}

		self.write_external(&datasource, record, audit).await
	}

	/// Writes to the external datasource, reusing the cached connection and
	/// retrying once on a fresh one.
	async fn write_external(
		&self,
		datasource: &Datasource,
		record: &AccessRecord,
		audit: bool,
	) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
	{
		let mut cached = self.cached.lock().await;

		let conn = match cached.take() {
			Some((cached_for, conn)) if cached_for == datasource.id => Some(conn),
			Some((_, stale)) => {
				stale.close().await;
				None
			}
			None => None,
		};

		let mut conn = match conn {
			Some(conn) => conn,
			None => pool::connect(datasource, &self.keyring, self.connect_timeout).await?,
		};

		match insert_external(&mut conn, record, audit).await {
			Ok(()) => {
				*cached = Some((datasource.id, conn));
				Ok(())
			}
			Err(first_error) => {
				conn.close().await;

				// The cached connection may simply have gone stale; one
				// retry on a fresh connection.
				let mut fresh =
					pool::connect(datasource, &self.keyring, self.connect_timeout).await?;

				match insert_external(&mut fresh, record, audit).await {
					Ok(()) => {
						*cached = Some((datasource.id, fresh));
						Ok(())
					}
					Err(_) => {
						fresh.close().await;
						Err(first_error.into())
					}
				}
			}
		}
	}
}

impl std::fmt::Debug for Writer
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_tuple("Writer").finish_non_exhaustive()
	}
}

/// Applies the documented truncation limits.
fn truncate(mut record: AccessRecord) -> AccessRecord
{
	record.request_body = record.request_body.map(|body| truncate_to(body, BODY_LIMIT));
	record.request_headers =
		record.request_headers.map(|headers| truncate_to(headers, HEADERS_LIMIT));
	record.request_params =
		record.request_params.map(|params| truncate_to(params, HEADERS_LIMIT));
	record
}

/// Truncates on a char boundary, marking the cut.
fn truncate_to(text: String, limit: usize) -> String
{
	if text.len() <= limit {
		return text;
	}

	let mut cut = limit;

	while cut > 0 && !text.is_char_boundary(cut) {
		cut -= 1;
	}

	format!("{}...", &text[..cut])
}

/// Inserts into the external `access_record` table (or the audit table).
async fn insert_external(
	conn: &mut ExternalConnection,
	record: &AccessRecord,
	audit: bool,
) -> Result<(), pool::PoolError>
{
	let table = if audit { AUDIT_TABLE } else { "access_record" };

	match conn {
		ExternalConnection::Postgres(pg) => {
			let sql = format!(
				"INSERT INTO {table} (
				     id, api_assignment_id, app_client_id, ip_address, http_method, path,
				     status_code, request_body, request_headers, request_params, created_at,
				     duration_ms
				 )
				 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
			);

			sqlx::query(&sql)
				.bind(record.id)
				.bind(record.api_assignment_id)
				.bind(record.app_client_id)
				.bind(&record.ip_address)
				.bind(&record.http_method)
				.bind(&record.path)
				.bind(record.status_code)
				.bind(&record.request_body)
				.bind(&record.request_headers)
				.bind(&record.request_params)
				.bind(record.created_at)
				.bind(record.duration_ms)
				.execute(pg)
				.await
				.map(drop)
				.map_err(pool::PoolError::from_sqlx)
		}
		ExternalConnection::MySql(mysql) => {
			let sql = format!(
				"INSERT INTO {table} (
				     id, api_assignment_id, app_client_id, ip_address, http_method, path,
				     status_code, request_body, request_headers, request_params, created_at,
				     duration_ms
				 )
				 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
			);

			sqlx::query(&sql)
				.bind(record.id.to_string())
				.bind(record.api_assignment_id.map(|id| id.to_string()))
				.bind(record.app_client_id.map(|id| id.to_string()))
				.bind(&record.ip_address)
				.bind(&record.http_method)
				.bind(&record.path)
				.bind(record.status_code)
				.bind(&record.request_body)
				.bind(&record.request_headers)
				.bind(&record.request_params)
				.bind(record.created_at)
				.bind(record.duration_ms)
				.execute(mysql)
				.await
				.map(drop)
				.map_err(pool::PoolError::from_sqlx)
		}
		ExternalConnection::Trino(_) => {
			Err(pool::PoolError::Unsupported("trino is not an access-log target"))
		}
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn truncation_limits_are_applied()
	{
		let record = AccessRecord {
			id: Uuid::new_v4(),
			api_assignment_id: None,
			app_client_id: None,
			ip_address: String::from("192.0.2.1"),
			http_method: String::from("POST"),
			path: String::from("m/e"),
			status_code: 200,
			request_body: Some("x".repeat(10_000)),
			request_headers: Some("y".repeat(100_000)),
			request_params: Some(String::from("short")),
			created_at: time::OffsetDateTime::UNIX_EPOCH,
			duration_ms: Some(12),
		};

		let truncated = truncate(record);

		assert_eq!(truncated.request_body.as_ref().unwrap().len(), BODY_LIMIT + 3);
		assert_eq!(truncated.request_headers.as_ref().unwrap().len(), HEADERS_LIMIT + 3);
		assert_eq!(truncated.request_params.as_deref(), Some("short"));
	}

	#[test]
	fn truncation_respects_char_boundaries()
	{
		let long = "é".repeat(BODY_LIMIT);
		let truncated = truncate_to(long, BODY_LIMIT);

		assert!(truncated.len() <= BODY_LIMIT + 3);
		assert!(truncated.ends_with("..."));
	}
}
