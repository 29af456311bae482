//! The errors that can occur when talking to external datasources.

use thiserror::Error;

use crate::runtime;

/// Convenience type alias.
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The errors that can occur when connecting to or querying an external
/// datasource.
#[derive(Debug, Error)]
pub enum PoolError
{
	/// A connection could not be established (or was lost).
	#[error("connection failed: {0}")]
	Connection(BoxError),

	/// The statement exceeded the configured execution time budget.
	#[error("statement timed out")]
	StatementTimeout,

	/// The backend rejected or failed the statement.
	#[error("{0}")]
	Query(BoxError),

	/// A stored datasource password could not be decrypted.
	#[error(transparent)]
	Decrypt(#[from] crate::crypto::Error),

	/// The operation is not supported by this backend.
	#[error("{0}")]
	Unsupported(&'static str),
}

impl PoolError
{
	/// Classifies an error reported by sqlx.
	///
	/// Statement-timeout server errors (Postgres `57014`, MySQL `3024` /
	/// `1317`) become [`PoolError::StatementTimeout`]; transport problems
	/// become [`PoolError::Connection`]; everything else is a query error.
	pub(crate) fn from_sqlx(error: sqlx::Error) -> Self
	{
		if let sqlx::Error::Database(ref db_error) = error {
			if let Some(code) = db_error.code() {
				if matches!(&*code, "57014" | "3024" | "1317") {
					return Self::StatementTimeout;
				}
			}

			return Self::Query(error.into());
		}

		match error {
			sqlx::Error::Io(_)
			| sqlx::Error::Tls(_)
			| sqlx::Error::Protocol(_)
			| sqlx::Error::PoolTimedOut
			| sqlx::Error::PoolClosed
			| sqlx::Error::Configuration(_) => Self::Connection(error.into()),
			other => Self::Query(other.into()),
		}
	}
}

impl From<PoolError> for runtime::Error
{
	#[track_caller]
	fn from(value: PoolError) -> Self
	{
		match value {
			PoolError::Connection(reason) => runtime::Error::connection(reason),
			PoolError::StatementTimeout => {
				runtime::Error::timeout("SQL query timed out (statement_timeout)")
			}
			PoolError::Query(reason) => runtime::Error::backend_query(reason),
			PoolError::Decrypt(error) => runtime::Error::unhandled(error),
			PoolError::Unsupported(reason) => runtime::Error::backend_query(reason),
		}
	}
}
