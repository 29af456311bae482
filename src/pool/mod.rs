//! Connection management for external datasources.
//!
//! Every endpoint executes against a configured [`Datasource`]; this module
//! owns opening, pooling, probing, and disposing of those connections. See
//! [`Manager`] for the pooling rules.
//!
//! [`Datasource`]: crate::database::Datasource

pub use self::connect::{ExternalConnection, connect};
pub use self::error::PoolError;
pub use self::manager::{Manager, PoolStats};
pub use self::trino::TrinoClient;

mod connect;
mod error;
mod manager;
mod rows;
mod trino;
