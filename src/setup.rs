//! Errors that can occur while wiring the gateway together at startup.

use thiserror::Error;

/// The errors that can occur in [`crate::server()`].
#[derive(Debug, Error)]
pub enum Error
{
	/// The configuration store could not be reached.
	#[error("failed to connect to the configuration store: {0}")]
	ConnectDatabase(#[from] sqlx::Error),

	/// Outstanding migrations could not be applied.
	#[error("failed to run migrations: {0}")]
	Migrations(#[from] sqlx::migrate::MigrateError),
}
