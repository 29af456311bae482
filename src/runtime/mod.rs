//! Runtime concerns: configuration and the main error type.

pub mod config;
pub use config::Config;

pub mod error;
pub use error::{Error, Result};
