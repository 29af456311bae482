//! Script execution protocols.
//!
//! Three kinds of scripts run through the sandbox:
//!
//! - **endpoint scripts** with the full context namespace; if the script
//!   defines `execute(params)` that function's return value is the result,
//!   otherwise the final value of the pre-seeded `result` envelope is,
//! - **parameter validators** defining `validate(value, params)`,
//! - **result transforms** defining `transform(result, params)` (or
//!   mutating `result` at the top level).

use std::time::Duration;

use rhai::{Dynamic, Scope};
use serde_json::Value as JsonValue;

use super::context::ScriptContext;
use super::sandbox::{self, ScriptError, build_engine, classify};

/// Runs an endpoint script with the full context namespace.
///
/// The pinned connection (and transaction, if still open) is always
/// released on exit, regardless of how execution ends.
pub fn execute_endpoint_script(
	script: &str,
	context: &ScriptContext,
	timeout: Option<Duration>,
	extra_modules: &[String],
) -> Result<JsonValue, ScriptError>
{
	let result = run_endpoint_script(script, context, timeout, extra_modules);

	context.release();
	result
}

#[allow(clippy::missing_docs_in_private_items)]
fn run_endpoint_script(
	script: &str,
	context: &ScriptContext,
	timeout: Option<Duration>,
	extra_modules: &[String],
) -> Result<JsonValue, ScriptError>
{
	let mut engine = build_engine(timeout, extra_modules);

	context.register(&mut engine);

	let ast = engine
		.compile(script)
		.map_err(|error| ScriptError::Compile(error.to_string()))?;

	let mut scope = Scope::new();

	scope.push_dynamic("result", initial_result_envelope());

	engine
		.run_ast_with_scope(&mut scope, &ast)
		.map_err(|error| classify(error, timeout))?;

	let value = if has_function(&ast, "execute") {
		engine
			.call_fn::<Dynamic>(&mut scope, &ast, "execute", (context.req_dynamic(),))
			.map_err(|error| classify(error, timeout))?
	} else {
		scope.get_value::<Dynamic>("result").unwrap_or(Dynamic::UNIT)
	};

	to_json(&value)
}

/// Runs a per-parameter validation script.
///
/// The script must define `validate(value, params)`; the returned boolean
/// is its verdict. Validators see only `value` and `params`, not the
/// context namespace.
pub fn run_validation_script(
	script: &str,
	value: &JsonValue,
	params: &JsonValue,
	timeout: Option<Duration>,
) -> Result<bool, ScriptError>
{
	let engine = build_engine(timeout, &[]);

	let ast = engine
		.compile(script)
		.map_err(|error| ScriptError::Compile(error.to_string()))?;

	if !has_function(&ast, "validate") {
		return Err(ScriptError::Runtime(String::from(
			"validation script must define validate(value, params)",
		)));
	}

	let mut scope = Scope::new();

	engine
		.run_ast_with_scope(&mut scope, &ast)
		.map_err(|error| classify(error, timeout))?;

	let value = rhai::serde::to_dynamic(value).unwrap_or(Dynamic::UNIT);
	let params = rhai::serde::to_dynamic(params).unwrap_or(Dynamic::UNIT);

	engine
		.call_fn::<Dynamic>(&mut scope, &ast, "validate", (value, params))
		.map(|verdict| is_truthy(&verdict))
		.map_err(|error| classify(error, timeout))
}

/// Truthiness for validator verdicts: unit, `false`, `0`, `0.0`, and empty
/// strings are falsy, everything else is truthy.
fn is_truthy(value: &Dynamic) -> bool
{
	if value.is_unit() {
		return false;
	}

	if let Ok(flag) = value.as_bool() {
		return flag;
	}

	if let Ok(int) = value.as_int() {
		return int != 0;
	}

	if let Ok(float) = value.as_float() {
		return float != 0.0;
	}

	if let Some(text) = value.read_lock::<rhai::ImmutableString>() {
		return !text.is_empty();
	}

	true
}

/// Runs a result-transform script.
///
/// If the script defines `transform(result, params)` its non-unit return
/// value replaces the result; otherwise the (possibly mutated) `result`
/// variable does. Transforms see only `result` and `params`.
pub fn run_transform_script(
	script: &str,
	result: &JsonValue,
	params: &JsonValue,
	timeout: Option<Duration>,
) -> Result<JsonValue, ScriptError>
{
	let engine = build_engine(timeout, &[]);

	let ast = engine
		.compile(script)
		.map_err(|error| ScriptError::Compile(error.to_string()))?;

	let result_dynamic = rhai::serde::to_dynamic(result).unwrap_or(Dynamic::UNIT);
	let params_dynamic = rhai::serde::to_dynamic(params).unwrap_or(Dynamic::UNIT);

	let mut scope = Scope::new();

	scope.push_dynamic("result", result_dynamic.clone());
	scope.push_constant_dynamic("params", params_dynamic.clone());

	engine
		.run_ast_with_scope(&mut scope, &ast)
		.map_err(|error| classify(error, timeout))?;

	if has_function(&ast, "transform") {
		let transformed = engine
			.call_fn::<Dynamic>(&mut scope, &ast, "transform", (result_dynamic, params_dynamic))
			.map_err(|error| classify(error, timeout))?;

		if !transformed.is_unit() {
			return to_json(&transformed);
		}
	}

	let value = scope.get_value::<Dynamic>("result").unwrap_or(Dynamic::UNIT);

	to_json(&value)
}

/// The pre-seeded `result` envelope scripts may mutate.
fn initial_result_envelope() -> Dynamic
{
	let envelope = serde_json::json!({
		"success": true,
		"message": null,
		"data": [],
	});

	rhai::serde::to_dynamic(&envelope).unwrap_or(Dynamic::UNIT)
}

/// Whether the compiled script defines a top-level function.
fn has_function(ast: &rhai::AST, name: &str) -> bool
{
	ast.iter_functions().any(|function| function.name == name)
}

/// Converts a script value back to JSON.
fn to_json(value: &Dynamic) -> Result<JsonValue, ScriptError>
{
	if value.is_unit() {
		return Ok(JsonValue::Null);
	}

	rhai::serde::from_dynamic::<JsonValue>(value)
		.map_err(|error| sandbox::ScriptError::Runtime(error.to_string()))
}

#[cfg(test)]
mod tests
{
	use serde_json::json;

	use super::*;

	#[test]
	fn execute_function_takes_precedence()
	{
		// Without context objects we only exercise the pure protocol here;
		// the full namespace is covered by the runner's integration tests.
		let engine = build_engine(None, &[]);
		let ast = engine.compile("fn execute(params) { params.x + 1 }").unwrap();

		assert!(has_function(&ast, "execute"));
	}

	#[test]
	fn validation_scripts_return_verdicts()
	{
		let script = "fn validate(value, params) { value > 0 }";

		assert!(run_validation_script(script, &json!(3), &json!({}), None).unwrap());
		assert!(!run_validation_script(script, &json!(-3), &json!({}), None).unwrap());
	}

	#[test]
	fn validation_script_without_validate_is_rejected()
	{
		let error = run_validation_script("let x = 1;", &json!(1), &json!({}), None)
			.expect_err("script without validate() must be rejected");

		assert!(matches!(error, ScriptError::Runtime(_)));
	}

	#[test]
	fn validation_script_can_read_params()
	{
		let script = r#"fn validate(value, params) { value < params.max }"#;
		let params = json!({ "max": 10 });

		assert!(run_validation_script(script, &json!(5), &params, None).unwrap());
		assert!(!run_validation_script(script, &json!(50), &params, None).unwrap());
	}

	#[test]
	fn transform_function_replaces_result()
	{
		let script = r#"
			fn transform(result, params) {
				result.data = [#{ "doubled": params.n * 2 }];
				result
			}
		"#;

		let out = run_transform_script(
			script,
			&json!({ "success": true, "message": null, "data": [] }),
			&json!({ "n": 21 }),
			None,
		)
		.unwrap();

		assert_eq!(out["data"][0]["doubled"], json!(42));
	}

	#[test]
	fn top_level_mutation_of_result_is_used()
	{
		let script = r#"result.data = [1, 2, 3];"#;

		let out = run_transform_script(
			script,
			&json!({ "success": true, "message": null, "data": [] }),
			&json!({}),
			None,
		)
		.unwrap();

		assert_eq!(out["data"], json!([1, 2, 3]));
	}

	#[test]
	fn compile_errors_are_reported_as_such()
	{
		let error = run_transform_script("fn transform(", &json!(null), &json!({}), None)
			.expect_err("unparsable script must fail to compile");

		assert!(matches!(error, ScriptError::Compile(_)));
	}

	#[test]
	fn wall_clock_timeout_terminates_scripts()
	{
		let script = "let n = 0; while true { n += 1; }";
		let error = run_transform_script(
			script,
			&json!(null),
			&json!({}),
			Some(Duration::from_millis(50)),
		)
		.expect_err("infinite loop must be terminated");

		assert!(matches!(error, ScriptError::Timeout(_)));
	}

	#[test]
	fn eval_is_disabled()
	{
		let engine = build_engine(None, &[]);

		assert!(engine.compile(r#"eval("1 + 1")"#).is_err());
	}
}
