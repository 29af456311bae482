//! Endpoint execution engines.
//!
//! An endpoint executes with one of two engines: [`sql`] renders a template
//! to final SQL and runs it against the bound datasource; [`script`]
//! executes a sandboxed script with an injected context namespace. The
//! runner dispatches on [`EngineKind`].
//!
//! [`EngineKind`]: crate::database::EngineKind

pub mod script;
pub mod sql;
