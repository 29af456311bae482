//! Opening and driving native connections to external datasources.
//!
//! Postgres and MySQL connect over their wire protocols via sqlx; Trino
//! speaks its REST statement protocol (see [`trino`]). All three are unified
//! behind [`ExternalConnection`] so the pool manager and both engines can
//! treat them interchangeably.
//!
//! [`trino`]: crate::pool::trino

use std::time::Duration;

use serde_json::Value as JsonValue;
use sqlx::ConnectOptions;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Executor};

use super::error::PoolError;
use super::rows;
use super::trino::TrinoClient;
use crate::crypto::Keyring;
use crate::database::{Datasource, ProductKind};

/// An open connection to an external datasource.
#[derive(Debug)]
pub enum ExternalConnection
{
	Postgres(PgConnection),
	MySql(MySqlConnection),
	Trino(TrinoClient),
}

/// Opens a fresh connection to the given datasource.
///
/// The stored password is decrypted here and nowhere else; it never leaves
/// this function except inside the driver's own connect options.
#[tracing::instrument(level = "debug", skip_all, fields(datasource.id = %datasource.id, datasource.kind = datasource.kind.as_str()), err(level = "debug"))]
pub async fn connect(
	datasource: &Datasource,
	keyring: &Keyring,
	connect_timeout: Duration,
) -> Result<ExternalConnection, PoolError>
{
	let password = keyring.decrypt(&datasource.password)?;
	let port = u16::try_from(datasource.port)
		.map_err(|_| PoolError::Connection("datasource port out of range".into()))?;

	match datasource.kind {
		ProductKind::Postgres => {
			let options = PgConnectOptions::new()
				.host(&datasource.host)
				.port(port)
				.database(&datasource.database)
				.username(&datasource.username)
				.password(&password)
				.ssl_mode(if datasource.use_ssl { PgSslMode::Require } else { PgSslMode::Prefer });

			let connection = tokio::time::timeout(connect_timeout, options.connect())
				.await
				.map_err(|_| PoolError::Connection("connect timed out".into()))?
				.map_err(PoolError::from_sqlx)?;

			Ok(ExternalConnection::Postgres(connection))
		}
		ProductKind::Mysql => {
			let options = MySqlConnectOptions::new()
				.host(&datasource.host)
				.port(port)
				.database(&datasource.database)
				.username(&datasource.username)
				.password(&password)
				.ssl_mode(if datasource.use_ssl {
					MySqlSslMode::Required
				} else {
					MySqlSslMode::Preferred
				});

			let connection = tokio::time::timeout(connect_timeout, options.connect())
				.await
				.map_err(|_| PoolError::Connection("connect timed out".into()))?
				.map_err(PoolError::from_sqlx)?;

			Ok(ExternalConnection::MySql(connection))
		}
		ProductKind::Trino => {
			let password = if password.is_empty() { None } else { Some(password) };

			TrinoClient::new(
				&datasource.host,
				port,
				&datasource.database,
				&datasource.username,
				password,
				datasource.use_ssl,
				connect_timeout,
			)
			.map(ExternalConnection::Trino)
		}
	}
}

impl ExternalConnection
{
	/// Which backend product this connection talks to.
	pub fn kind(&self) -> ProductKind
	{
		match self {
			Self::Postgres(_) => ProductKind::Postgres,
			Self::MySql(_) => ProductKind::Mysql,
			Self::Trino(_) => ProductKind::Trino,
		}
	}

	/// Runs a trivial liveness probe.
	pub async fn ping(&mut self) -> Result<(), PoolError>
	{
		match self {
			Self::Postgres(conn) => conn.ping().await.map_err(PoolError::from_sqlx),
			Self::MySql(conn) => conn.ping().await.map_err(PoolError::from_sqlx),
			Self::Trino(client) => client.ping().await,
		}
	}

	/// Rolls back any uncommitted transaction state.
	///
	/// Outside an explicit transaction this is a no-op on the server side.
	pub async fn rollback(&mut self) -> Result<(), PoolError>
	{
		match self {
			Self::Postgres(conn) => {
				conn.execute("ROLLBACK").await.map(drop).map_err(PoolError::from_sqlx)
			}
			Self::MySql(conn) => {
				conn.execute("ROLLBACK").await.map(drop).map_err(PoolError::from_sqlx)
			}
			Self::Trino(_) => Ok(()),
		}
	}

	/// Opens an explicit transaction.
	pub async fn begin(&mut self) -> Result<(), PoolError>
	{
		match self {
			Self::Postgres(conn) => {
				conn.execute("BEGIN").await.map(drop).map_err(PoolError::from_sqlx)
			}
			Self::MySql(conn) => {
				conn.execute("BEGIN").await.map(drop).map_err(PoolError::from_sqlx)
			}
			Self::Trino(_) => Err(PoolError::Unsupported("trino does not support transactions")),
		}
	}

	/// Commits the current transaction.
	pub async fn commit(&mut self) -> Result<(), PoolError>
	{
		match self {
			Self::Postgres(conn) => {
				conn.execute("COMMIT").await.map(drop).map_err(PoolError::from_sqlx)
			}
			Self::MySql(conn) => {
				conn.execute("COMMIT").await.map(drop).map_err(PoolError::from_sqlx)
			}
			Self::Trino(_) => Err(PoolError::Unsupported("trino does not support transactions")),
		}
	}

	/// Closes the connection, flushing the driver's goodbye message.
	pub async fn close(self)
	{
		let result = match self {
			Self::Postgres(conn) => conn.close().await.map_err(PoolError::from_sqlx),
			Self::MySql(conn) => conn.close().await.map_err(PoolError::from_sqlx),
			Self::Trino(_) => Ok(()),
		};

		if let Err(error) = result {
			tracing::debug!(%error, "error closing external connection");
		}
	}

	/// Runs a result-producing statement and decodes the rows as JSON
	/// objects.
	pub async fn query(
		&mut self,
		sql: &str,
		statement_timeout: Option<Duration>,
	) -> Result<Vec<JsonValue>, PoolError>
	{
		self.apply_statement_timeout(statement_timeout).await;

		let result = match self {
			Self::Postgres(conn) => {
				sqlx::query(sql)
					.fetch_all(&mut *conn)
					.await
					.map(|sqlx_rows| {
						sqlx_rows
							.iter()
							.map(|row| JsonValue::Object(rows::pg_row_to_json(row)))
							.collect()
					})
					.map_err(PoolError::from_sqlx)
			}
			Self::MySql(conn) => {
				sqlx::query(sql)
					.fetch_all(&mut *conn)
					.await
					.map(|sqlx_rows| {
						sqlx_rows
							.iter()
							.map(|row| JsonValue::Object(rows::mysql_row_to_json(row)))
							.collect()
					})
					.map_err(PoolError::from_sqlx)
			}
			Self::Trino(client) => client.execute(sql).await.map(|output| output.rows),
		};

		self.reset_statement_timeout(statement_timeout).await;

		result
	}

	/// Runs a DML statement and returns the affected-row count.
	pub async fn execute(
		&mut self,
		sql: &str,
		statement_timeout: Option<Duration>,
	) -> Result<u64, PoolError>
	{
		self.apply_statement_timeout(statement_timeout).await;

		let result = match self {
			Self::Postgres(conn) => {
				sqlx::query(sql)
					.execute(&mut *conn)
					.await
					.map(|done| done.rows_affected())
					.map_err(PoolError::from_sqlx)
			}
			Self::MySql(conn) => {
				sqlx::query(sql)
					.execute(&mut *conn)
					.await
					.map(|done| done.rows_affected())
					.map_err(PoolError::from_sqlx)
			}
			Self::Trino(client) => {
				client
					.execute(sql)
					.await
					.map(|output| output.update_count.unwrap_or(0))
			}
		};

		self.reset_statement_timeout(statement_timeout).await;

		result
	}

	/// Runs a result-producing statement with bound parameters.
	///
	/// Scripts use driver placeholders (`$1…` for Postgres, `?` for MySQL).
	/// Trino's protocol has no parameter binding; scripts targeting it must
	/// interpolate via the SQL template filters instead.
	pub async fn query_with_params(
		&mut self,
		sql: &str,
		params: &[JsonValue],
		statement_timeout: Option<Duration>,
	) -> Result<Vec<JsonValue>, PoolError>
	{
		if params.is_empty() {
			return self.query(sql, statement_timeout).await;
		}

		self.apply_statement_timeout(statement_timeout).await;

		let result = match self {
			Self::Postgres(conn) => {
				let mut query = sqlx::query(sql);

				for param in params {
					query = bind_json_pg(query, param);
				}

				query
					.fetch_all(&mut *conn)
					.await
					.map(|sqlx_rows| {
						sqlx_rows
							.iter()
							.map(|row| JsonValue::Object(rows::pg_row_to_json(row)))
							.collect()
					})
					.map_err(PoolError::from_sqlx)
			}
			Self::MySql(conn) => {
				let mut query = sqlx::query(sql);

				for param in params {
					query = bind_json_mysql(query, param);
				}

				query
					.fetch_all(&mut *conn)
					.await
					.map(|sqlx_rows| {
						sqlx_rows
							.iter()
							.map(|row| JsonValue::Object(rows::mysql_row_to_json(row)))
							.collect()
					})
					.map_err(PoolError::from_sqlx)
			}
			Self::Trino(_) => {
				Err(PoolError::Unsupported("trino does not support bound parameters"))
			}
		};

		self.reset_statement_timeout(statement_timeout).await;

		result
	}

	/// Runs a DML statement with bound parameters.
	pub async fn execute_with_params(
		&mut self,
		sql: &str,
		params: &[JsonValue],
		statement_timeout: Option<Duration>,
	) -> Result<u64, PoolError>
	{
		if params.is_empty() {
			return self.execute(sql, statement_timeout).await;
		}

		self.apply_statement_timeout(statement_timeout).await;

		let result = match self {
			Self::Postgres(conn) => {
				let mut query = sqlx::query(sql);

				for param in params {
					query = bind_json_pg(query, param);
				}

				query
					.execute(&mut *conn)
					.await
					.map(|done| done.rows_affected())
					.map_err(PoolError::from_sqlx)
			}
			Self::MySql(conn) => {
				let mut query = sqlx::query(sql);

				for param in params {
					query = bind_json_mysql(query, param);
				}

				query
					.execute(&mut *conn)
					.await
					.map(|done| done.rows_affected())
					.map_err(PoolError::from_sqlx)
			}
			Self::Trino(_) => {
				Err(PoolError::Unsupported("trino does not support bound parameters"))
			}
		};

		self.reset_statement_timeout(statement_timeout).await;

		result
	}

	/// Applies the engine-specific session setting for the statement
	/// timeout.
	///
	/// Failures are logged, never propagated, so they cannot mask the error
	/// of the statement that follows.
	async fn apply_statement_timeout(&mut self, statement_timeout: Option<Duration>)
	{
		let Some(timeout) = statement_timeout else {
			return;
		};

		let millis = timeout.as_millis();
		let result = match self {
			Self::Postgres(conn) => {
				conn.execute(&*format!("SET statement_timeout = {millis}"))
					.await
					.map(drop)
					.map_err(PoolError::from_sqlx)
			}
			Self::MySql(conn) => {
				conn.execute(&*format!("SET SESSION max_execution_time = {millis}"))
					.await
					.map(drop)
					.map_err(PoolError::from_sqlx)
			}
			Self::Trino(client) => {
				client.set_session_property(format!(
					"query_max_execution_time={}s",
					timeout.as_secs().max(1),
				));

				Ok(())
			}
		};

		if let Err(error) = result {
			tracing::warn!(%error, "failed to apply statement timeout");
		}
	}

	/// Resets the statement-timeout session setting.
	///
	/// Failures are logged, never propagated.
	async fn reset_statement_timeout(&mut self, statement_timeout: Option<Duration>)
	{
		if statement_timeout.is_none() {
			return;
		}

		let result = match self {
			Self::Postgres(conn) => {
				conn.execute("SET statement_timeout = 0")
					.await
					.map(drop)
					.map_err(PoolError::from_sqlx)
			}
			Self::MySql(conn) => {
				conn.execute("SET SESSION max_execution_time = 0")
					.await
					.map(drop)
					.map_err(PoolError::from_sqlx)
			}
			Self::Trino(client) => {
				client.clear_session_properties();
				Ok(())
			}
		};

		if let Err(error) = result {
			tracing::warn!(%error, "failed to reset statement timeout");
		}
	}
}

/// Binds one JSON value to a Postgres query.
fn bind_json_pg<'q>(
	query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
	value: &JsonValue,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>
{
	match value {
		JsonValue::Null => query.bind(Option::<String>::None),
		JsonValue::Bool(flag) => query.bind(*flag),
		JsonValue::Number(number) => {
			if let Some(int) = number.as_i64() {
				query.bind(int)
			} else {
				query.bind(number.as_f64().unwrap_or_default())
			}
		}
		JsonValue::String(text) => query.bind(text.clone()),
		other => query.bind(other.clone()),
	}
}

/// Binds one JSON value to a MySQL query.
fn bind_json_mysql<'q>(
	query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
	value: &JsonValue,
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>
{
	match value {
		JsonValue::Null => query.bind(Option::<String>::None),
		JsonValue::Bool(flag) => query.bind(*flag),
		JsonValue::Number(number) => {
			if let Some(int) = number.as_i64() {
				query.bind(int)
			} else {
				query.bind(number.as_f64().unwrap_or_default())
			}
		}
		JsonValue::String(text) => query.bind(text.clone()),
		other => query.bind(other.clone()),
	}
}
