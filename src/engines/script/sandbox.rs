//! Sandbox construction for the script engine.
//!
//! Scripts run in an embedded [rhai] engine. The sandbox properties the
//! gateway relies on:
//!
//! - the engine has no filesystem, process, or network primitives of its
//!   own; the only I/O a script can perform goes through the injected
//!   context objects (`db`, `http`, `cache`),
//! - `eval` and `import` are disabled, so scripts can neither compile
//!   further code at runtime nor pull modules (i.e. files) off the host,
//! - operation, depth, and size limits bound runaway scripts,
//! - the optional wall-clock timeout is enforced from the progress callback,
//!   checked between script operations (so it is soft by one operation's
//!   granularity, never bypassed).
//!
//! [rhai]: https://rhai.rs

use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine};
use thiserror::Error;

use crate::runtime;

/// Generous ceiling against runaway loops; real endpoint scripts sit far
/// below this.
const MAX_OPERATIONS: u64 = 50_000_000;

/// The errors that can occur when compiling or running a script.
#[derive(Debug, Error)]
pub enum ScriptError
{
	/// The script failed to parse.
	#[error("script compile failed: {0}")]
	Compile(String),

	/// The script raised at runtime.
	#[error("{0}")]
	Runtime(String),

	/// The script exceeded its wall-clock budget.
	#[error("script execution timed out after {0:?}")]
	Timeout(Duration),
}

impl From<ScriptError> for runtime::Error
{
	#[track_caller]
	fn from(value: ScriptError) -> Self
	{
		match value {
			ScriptError::Compile(message) => runtime::Error::compile_script(message),
			ScriptError::Runtime(message) => runtime::Error::script_runtime(message),
			ScriptError::Timeout(elapsed) => {
				runtime::Error::timeout(format!("script execution timed out after {elapsed:?}"))
			}
		}
	}
}

/// Builds a restricted engine.
///
/// A fresh engine per execution keeps the timeout clock and registered
/// context scoped to one request.
pub(crate) fn build_engine(timeout: Option<Duration>, extra_modules: &[String]) -> Engine
{
	let mut engine = Engine::new();

	engine.disable_symbol("eval");
	// Disabling `import` shuts off the module resolver entirely; scripts
	// must not be able to load (or even stat) files from the host.
	engine.disable_symbol("import");
	engine.set_max_operations(MAX_OPERATIONS);
	engine.set_max_call_levels(64);
	engine.set_max_expr_depths(64, 64);
	engine.set_max_string_size(4 * 1024 * 1024);
	engine.set_max_array_size(1_000_000);
	engine.set_max_map_size(1_000_000);

	if let Some(timeout) = timeout {
		let started = Instant::now();

		engine.on_progress(move |_| {
			(started.elapsed() > timeout).then(|| Dynamic::from("wall-clock timeout"))
		});
	}

	engine.register_fn("parse_json", parse_json);
	engine.register_fn("to_json", to_json);

	// Extra packages have to be compiled into the binary; names that are not
	// are skipped, matching the blunt-opt-in contract of the setting.
	for name in extra_modules {
		tracing::warn!(module = %name, "unknown extra script module; skipping");
	}

	engine
}

/// `parse_json(text)` - parses a JSON string into a script value.
fn parse_json(text: &str) -> Result<Dynamic, Box<rhai::EvalAltResult>>
{
	let value = serde_json::from_str::<serde_json::Value>(text)
		.map_err(|error| runtime_error(error.to_string()))?;

	rhai::serde::to_dynamic(&value).map_err(|error| runtime_error(error.to_string()))
}

/// `to_json(value)` - serializes a script value to a JSON string.
fn to_json(value: Dynamic) -> Result<String, Box<rhai::EvalAltResult>>
{
	let value = rhai::serde::from_dynamic::<serde_json::Value>(&value)
		.map_err(|error| runtime_error(error.to_string()))?;

	serde_json::to_string(&value).map_err(|error| runtime_error(error.to_string()))
}

/// Classifies an execution error.
pub(crate) fn classify(
	error: Box<rhai::EvalAltResult>,
	timeout: Option<Duration>,
) -> ScriptError
{
	if matches!(*error, rhai::EvalAltResult::ErrorTerminated(..)) {
		return ScriptError::Timeout(timeout.unwrap_or_default());
	}

	ScriptError::Runtime(error.to_string())
}

/// Raises a runtime error from inside a registered native function.
pub(crate) fn runtime_error(message: impl Into<String>) -> Box<rhai::EvalAltResult>
{
	Box::new(rhai::EvalAltResult::ErrorRuntime(
		Dynamic::from(message.into()),
		rhai::Position::NONE,
	))
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn json_helpers_round_trip()
	{
		let engine = build_engine(None, &[]);

		let out = engine
			.eval::<String>(r#"to_json(parse_json("{\"a\": [1, 2]}"))"#)
			.expect("json helpers should round-trip");

		assert_eq!(out, r#"{"a":[1,2]}"#);
	}

	#[test]
	fn operation_limit_terminates_runaway_loops()
	{
		let mut engine = build_engine(None, &[]);

		engine.set_max_operations(1_000);

		assert!(engine.run("let n = 0; while true { n += 1; }").is_err());
	}

	#[test]
	fn import_statements_do_not_compile()
	{
		let engine = build_engine(None, &[]);

		assert!(engine.compile(r#"import "/etc/passwd" as x;"#).is_err());
		assert!(engine.compile(r#"import "helpers" as h; h::f()"#).is_err());
	}
}
