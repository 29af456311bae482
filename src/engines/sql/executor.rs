//! Execution of rendered SQL against a datasource.

use serde_json::Value as JsonValue;

use crate::database::Datasource;
use crate::pool::{Manager, PoolError};

/// The result of executing one statement.
#[derive(Debug)]
pub enum SqlOutput
{
	/// Rows from a select-like statement.
	Rows(Vec<JsonValue>),

	/// Affected-row count from DML.
	Affected(u64),
}

impl SqlOutput
{
	/// Converts to the raw `data` payload the runner wraps.
	pub fn into_data(self) -> JsonValue
	{
		match self {
			Self::Rows(rows) => JsonValue::Array(rows),
			Self::Affected(count) => JsonValue::from(count),
		}
	}
}

/// Whether a statement produces rows (`SELECT`/`WITH`) rather than an
/// affected-row count, ignoring leading whitespace and semicolons.
pub fn is_select_like(sql: &str) -> bool
{
	let trimmed = sql.trim_start_matches(|ch: char| ch.is_whitespace() || ch == ';');

	let Some(first_word) = trimmed.split_whitespace().next() else {
		// Treat an empty statement as a select so it yields no rows rather
		// than a bogus rowcount.
		return true;
	};

	first_word.eq_ignore_ascii_case("SELECT") || first_word.eq_ignore_ascii_case("WITH")
}

/// Runs final (already rendered) SQL against the datasource.
///
/// When `use_pool` is false the idle pool is bypassed: a fresh connection is
/// opened and closed afterwards, which some backends require for
/// per-request impersonation.
#[tracing::instrument(level = "debug", skip(manager, sql), fields(datasource.id = %datasource.id, use_pool), err(level = "debug"))]
pub async fn execute_sql(
	manager: &Manager,
	datasource: &Datasource,
	sql: &str,
	use_pool: bool,
) -> Result<SqlOutput, PoolError>
{
	let mut conn = if use_pool {
		manager.acquire(datasource).await?
	} else {
		manager.open(datasource).await?
	};

	let statement_timeout = manager.statement_timeout();
	let result = if is_select_like(sql) {
		conn.query(sql, statement_timeout).await.map(SqlOutput::Rows)
	} else {
		conn.execute(sql, statement_timeout).await.map(SqlOutput::Affected)
	};

	if use_pool {
		manager.release(conn, datasource.id).await;
	} else {
		conn.close().await;
	}

	result
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn select_detection()
	{
		assert!(is_select_like("SELECT 1"));
		assert!(is_select_like("  \n select * from t"));
		assert!(is_select_like(";;  WITH x AS (SELECT 1) SELECT * FROM x"));
		assert!(is_select_like(""));
		assert!(!is_select_like("INSERT INTO t VALUES (1)"));
		assert!(!is_select_like("  update t set a = 1"));
		assert!(!is_select_like("DELETE FROM t"));
	}
}
