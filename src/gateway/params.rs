//! Parameter binding, type coercion, and validation.
//!
//! Builds the `req` mapping passed to the engines from path variables, the
//! query string, the body, and headers; coerces values by the endpoint's
//! declared parameter schema; enforces required parameters; and runs the
//! per-parameter validation scripts.

use std::collections::HashMap;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use super::resolver::PathVariables;
use super::response::keys_to_snake;
use crate::engines::script;
use crate::runtime;

/// Where a declared parameter is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation
{
	Path,

	#[default]
	Query,

	Body,
	Header,
}

/// One declared parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec
{
	pub name: String,

	#[serde(default)]
	pub location: ParamLocation,

	#[serde(default)]
	pub data_type: Option<String>,

	#[serde(default, alias = "is_required")]
	pub required: bool,

	#[serde(default)]
	pub default_value: Option<JsonValue>,
}

impl ParamSpec
{
	/// Parses a stored schema, skipping malformed entries.
	pub fn parse_list(stored: Option<&JsonValue>) -> Vec<Self>
	{
		let Some(JsonValue::Array(entries)) = stored else {
			return Vec::new();
		};

		entries
			.iter()
			.filter_map(|entry| serde_json::from_value::<Self>(entry.clone()).ok())
			.filter(|spec| !spec.name.trim().is_empty())
			.collect()
	}
}

/// One per-parameter validation script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSpec
{
	pub name: String,

	#[serde(default, alias = "validation_script")]
	pub script: String,

	#[serde(default)]
	pub message_when_fail: Option<String>,
}

impl ValidatorSpec
{
	/// Parses stored validators, skipping malformed entries.
	pub fn parse_list(stored: Option<&JsonValue>) -> Vec<Self>
	{
		let Some(JsonValue::Array(entries)) = stored else {
			return Vec::new();
		};

		entries
			.iter()
			.filter_map(|entry| serde_json::from_value::<Self>(entry.clone()).ok())
			.filter(|spec| !spec.name.trim().is_empty())
			.collect()
	}
}

/// The bound request parameters plus the body copy kept for access logging.
#[derive(Debug)]
pub struct BoundParams
{
	pub params: JsonMap<String, JsonValue>,

	/// JSON-encoded body for the access record (truncated by the writer).
	pub body_for_log: Option<String>,
}

/// Merges path/query/body/header into the raw parameter map.
///
/// With a schema, each declared parameter is read from its declared
/// location only (headers case-insensitively); without one, body, query,
/// and path are merged with path winning. `?naming=camel` converts body and
/// query keys to snake_case first; path variables are never converted.
pub async fn bind(
	path_variables: &PathVariables,
	query_string: Option<&str>,
	headers: &HeaderMap,
	body: &[u8],
	schema: &[ParamSpec],
) -> BoundParams
{
	let mut query = parse_query(query_string);

	let camel_request = query
		.get("naming")
		.and_then(JsonValue::as_str)
		.is_some_and(|naming| naming.trim().eq_ignore_ascii_case("camel"));

	let mut body = parse_body(headers, body).await;

	if camel_request {
		body = match keys_to_snake(JsonValue::Object(body)) {
			JsonValue::Object(converted) => converted,
			_ => JsonMap::new(),
		};
		query = match keys_to_snake(JsonValue::Object(query)) {
			JsonValue::Object(converted) => converted,
			_ => JsonMap::new(),
		};
	}

	let body_for_log = if body.is_empty() {
		None
	} else {
		serde_json::to_string(&body).ok()
	};

	let mut params = JsonMap::new();

	if schema.is_empty() {
		// No schema: body -> query -> path, path wins.
		for (key, value) in &body {
			params.insert(key.clone(), value.clone());
		}

		for (key, value) in &query {
			params.insert(key.clone(), value.clone());
		}

		for (name, value) in path_variables {
			params.insert(name.clone(), JsonValue::String(value.clone()));
		}

		return BoundParams { params, body_for_log };
	}

	// Path variables are always included; everything else comes only from
	// its declared location.
	for (name, value) in path_variables {
		params.insert(name.clone(), JsonValue::String(value.clone()));
	}

	let headers_ci = headers
		.iter()
		.filter_map(|(name, value)| {
			value.to_str().ok().map(|value| (name.as_str().to_lowercase(), value.to_owned()))
		})
		.collect::<HashMap<String, String>>();

	for spec in schema {
		let name = spec.name.trim();

		match spec.location {
			ParamLocation::Header => {
				if let Some(value) = headers_ci.get(&name.to_lowercase()) {
					params.insert(name.to_owned(), JsonValue::String(value.clone()));
				}
			}
			ParamLocation::Body => {
				if let Some(value) = body.get(name) {
					params.insert(name.to_owned(), value.clone());
				}
			}
			ParamLocation::Query => {
				if let Some(value) = query.get(name) {
					params.insert(name.to_owned(), value.clone());
				}
			}
			// Path variables were already merged above.
			ParamLocation::Path => {}
		}
	}

	BoundParams { params, body_for_log }
}

/// Parses the query string into a string map.
fn parse_query(query_string: Option<&str>) -> JsonMap<String, JsonValue>
{
	let Some(query_string) = query_string else {
		return JsonMap::new();
	};

	serde_html_form::from_str::<Vec<(String, String)>>(query_string)
		.unwrap_or_default()
		.into_iter()
		.map(|(key, value)| (key, JsonValue::String(value)))
		.collect()
}

/// Reads the body by content type: JSON object, urlencoded form, or
/// multipart form fields. Anything else is treated as empty.
async fn parse_body(headers: &HeaderMap, body: &[u8]) -> JsonMap<String, JsonValue>
{
	let content_type = headers
		.get(axum::http::header::CONTENT_TYPE)
		.and_then(|value| value.to_str().ok())
		.unwrap_or_default();

	let Ok(mime_type) = content_type.parse::<mime::Mime>() else {
		return JsonMap::new();
	};

	match mime_type.essence_str() {
		"application/json" => {
			match serde_json::from_slice::<JsonValue>(body) {
				Ok(JsonValue::Object(object)) => object,
				_ => JsonMap::new(),
			}
		}
		"application/x-www-form-urlencoded" => {
			serde_html_form::from_bytes::<Vec<(String, String)>>(body)
				.unwrap_or_default()
				.into_iter()
				.map(|(key, value)| (key, JsonValue::String(value)))
				.collect()
		}
		"multipart/form-data" => parse_multipart(content_type, body).await,
		_ => JsonMap::new(),
	}
}

/// Collects text fields from a multipart body.
async fn parse_multipart(content_type: &str, body: &[u8]) -> JsonMap<String, JsonValue>
{
	let Ok(boundary) = multer::parse_boundary(content_type) else {
		return JsonMap::new();
	};

	let stream = futures_util::stream::once(async move {
		Ok::<_, std::convert::Infallible>(bytes::Bytes::copy_from_slice(body))
	});
	let mut multipart = multer::Multipart::new(stream, boundary);
	let mut fields = JsonMap::new();

	while let Ok(Some(field)) = multipart.next_field().await {
		let Some(name) = field.name().map(str::to_owned) else {
			continue;
		};

		if let Ok(text) = field.text().await {
			fields.insert(name, JsonValue::String(text));
		}
	}

	fields
}

/// Coerces parameters by their declared `data_type`, applying defaults for
/// missing/empty values. Parameters that stay missing with no default are
/// dropped; undeclared parameters pass through unchanged.
pub fn coerce(
	schema: &[ParamSpec],
	params: JsonMap<String, JsonValue>,
) -> runtime::Result<JsonMap<String, JsonValue>>
{
	let mut params = params;

	for spec in schema {
		let name = spec.name.trim();
		let data_type = spec
			.data_type
			.as_deref()
			.map(|data_type| data_type.trim().to_lowercase())
			.filter(|data_type| !data_type.is_empty())
			.unwrap_or_else(|| String::from("string"));

		let raw = params.get(name);
		let missing = matches!(raw, None | Some(JsonValue::Null))
			|| raw.and_then(JsonValue::as_str).is_some_and(str::is_empty);

		if missing {
			match &spec.default_value {
				Some(default) if !is_empty_default(default) => {
					let coerced =
						coerce_value(&data_type, default.clone()).map_err(|reason| {
							runtime::Error::bad_parameter(format!(
								"Parameter '{name}' default_value invalid: {reason}",
							))
						})?;

					params.insert(name.to_owned(), coerced);
				}
				_ => {
					params.remove(name);
				}
			}

			continue;
		}

		let Some(raw) = params.get(name).cloned() else {
			continue;
		};

		let coerced = coerce_value(&data_type, raw).map_err(|reason| {
			runtime::Error::bad_parameter(format!("Parameter '{name}' {reason}"))
		})?;

		params.insert(name.to_owned(), coerced);
	}

	Ok(params)
}

/// Whether a declared default counts as "no default".
fn is_empty_default(default: &JsonValue) -> bool
{
	matches!(default, JsonValue::Null) || default.as_str().is_some_and(str::is_empty)
}

/// Coerces one value to a declared type.
fn coerce_value(data_type: &str, value: JsonValue) -> Result<JsonValue, String>
{
	match data_type {
		"string" => coerce_string(value),
		"integer" | "int" => coerce_integer(value),
		"number" => coerce_number(value),
		"boolean" | "bool" => coerce_boolean(value),
		"array" => coerce_array(value),
		"object" | "obj" => coerce_object(value),
		_ => coerce_string(value),
	}
}

#[allow(clippy::missing_docs_in_private_items)]
fn coerce_string(value: JsonValue) -> Result<JsonValue, String>
{
	let text = match value {
		JsonValue::String(text) => text,
		JsonValue::Bool(flag) => flag.to_string(),
		JsonValue::Number(number) => number.to_string(),
		other => other.to_string(),
	};

	Ok(JsonValue::String(text.trim().to_owned()))
}

#[allow(clippy::missing_docs_in_private_items)]
fn coerce_integer(value: JsonValue) -> Result<JsonValue, String>
{
	match value {
		JsonValue::Bool(_) => Err(String::from("Boolean not allowed for integer")),
		JsonValue::Number(number) => {
			if let Some(int) = number.as_i64() {
				return Ok(JsonValue::from(int));
			}

			match number.as_f64() {
				Some(float) if float.fract() == 0.0 => Ok(JsonValue::from(float as i64)),
				_ => Err(format!("Expected integer, got float: {number}")),
			}
		}
		JsonValue::String(text) => {
			let trimmed = text.trim();

			if trimmed.is_empty() {
				return Err(String::from("Value is empty"));
			}

			if let Ok(int) = trimmed.parse::<i64>() {
				return Ok(JsonValue::from(int));
			}

			// Decimal strings like "42.0" still count when integral.
			match trimmed.parse::<f64>() {
				Ok(float) if float.fract() == 0.0 => Ok(JsonValue::from(float as i64)),
				Ok(_) => Err(format!("Expected integer, got: '{trimmed}'")),
				Err(_) => Err(format!("Invalid integer: '{trimmed}'")),
			}
		}
		_ => Err(String::from("Expected integer")),
	}
}

#[allow(clippy::missing_docs_in_private_items)]
fn coerce_number(value: JsonValue) -> Result<JsonValue, String>
{
	match value {
		JsonValue::Bool(_) => Err(String::from("Expected number")),
		JsonValue::Number(number) => {
			number
				.as_f64()
				.map(JsonValue::from)
				.ok_or_else(|| format!("Invalid number: {number}"))
		}
		JsonValue::String(text) => {
			let trimmed = text.trim();

			if trimmed.is_empty() {
				return Err(String::from("Value is empty"));
			}

			trimmed
				.parse::<f64>()
				.map(JsonValue::from)
				.map_err(|_| format!("Invalid number: '{trimmed}'"))
		}
		_ => Err(String::from("Expected number")),
	}
}

#[allow(clippy::missing_docs_in_private_items)]
fn coerce_boolean(value: JsonValue) -> Result<JsonValue, String>
{
	match value {
		JsonValue::Bool(flag) => Ok(JsonValue::Bool(flag)),
		JsonValue::Number(number) => {
			match number.as_i64() {
				Some(0) => Ok(JsonValue::Bool(false)),
				Some(1) => Ok(JsonValue::Bool(true)),
				_ => Err(format!("Expected boolean, got integer: {number}")),
			}
		}
		JsonValue::String(text) => {
			match text.trim().to_lowercase().as_str() {
				"true" | "1" | "yes" => Ok(JsonValue::Bool(true)),
				"false" | "0" | "no" => Ok(JsonValue::Bool(false)),
				other => Err(format!("Expected boolean (true/false, 1/0, yes/no), got: '{other}'")),
			}
		}
		_ => Err(String::from("Expected boolean")),
	}
}

#[allow(clippy::missing_docs_in_private_items)]
fn coerce_array(value: JsonValue) -> Result<JsonValue, String>
{
	match value {
		list @ JsonValue::Array(_) => Ok(list),
		JsonValue::String(text) => {
			let trimmed = text.trim();

			if trimmed.is_empty() {
				return Err(String::from("Value is empty"));
			}

			if trimmed.starts_with('[') {
				return match serde_json::from_str::<JsonValue>(trimmed) {
					Ok(list @ JsonValue::Array(_)) => Ok(list),
					Ok(_) => Err(String::from("JSON is not an array")),
					Err(error) => Err(format!("Invalid JSON array: {error}")),
				};
			}

			Ok(JsonValue::Array(
				trimmed
					.split(',')
					.map(str::trim)
					.filter(|element| !element.is_empty())
					.map(|element| JsonValue::String(element.to_owned()))
					.collect(),
			))
		}
		other => Err(format!("Expected array or JSON array string, got: {}", type_name(&other))),
	}
}

#[allow(clippy::missing_docs_in_private_items)]
fn coerce_object(value: JsonValue) -> Result<JsonValue, String>
{
	match value {
		object @ JsonValue::Object(_) => Ok(object),
		JsonValue::String(text) => {
			let trimmed = text.trim();

			if trimmed.is_empty() {
				return Err(String::from("Value is empty"));
			}

			match serde_json::from_str::<JsonValue>(trimmed) {
				Ok(object @ JsonValue::Object(_)) => Ok(object),
				Ok(_) => Err(String::from("JSON is not an object")),
				Err(error) => Err(format!("Invalid JSON object: {error}")),
			}
		}
		other => {
			Err(format!("Expected object or JSON object string, got: {}", type_name(&other)))
		}
	}
}

#[allow(clippy::missing_docs_in_private_items)]
fn type_name(value: &JsonValue) -> &'static str
{
	match value {
		JsonValue::Null => "null",
		JsonValue::Bool(_) => "boolean",
		JsonValue::Number(_) => "number",
		JsonValue::String(_) => "string",
		JsonValue::Array(_) => "array",
		JsonValue::Object(_) => "object",
	}
}

/// Enforces required parameters after coercion.
///
/// A declared required parameter that resolved to nothing, null, or an
/// empty string fails; all missing names are reported together.
pub fn check_required(
	schema: &[ParamSpec],
	params: &JsonMap<String, JsonValue>,
) -> runtime::Result<()>
{
	let missing = schema
		.iter()
		.filter(|spec| spec.required)
		.map(|spec| spec.name.trim())
		.filter(|name| {
			match params.get(*name) {
				None | Some(JsonValue::Null) => true,
				Some(JsonValue::String(text)) => text.is_empty(),
				Some(_) => false,
			}
		})
		.map(str::to_owned)
		.collect::<Vec<_>>();

	if missing.is_empty() {
		return Ok(());
	}

	Err(runtime::Error::missing_parameters(missing))
}

/// Runs the configured validation scripts.
///
/// Script macros are prepended so validators can use macro helpers. A falsy
/// verdict or a script failure rejects the request with the validator's
/// `message_when_fail`.
pub fn run_validators(
	validators: &[ValidatorSpec],
	params: &JsonMap<String, JsonValue>,
	script_macros: &[String],
	timeout: Option<std::time::Duration>,
) -> runtime::Result<()>
{
	if validators.is_empty() {
		return Ok(());
	}

	let params_value = JsonValue::Object(params.clone());

	for validator in validators {
		if validator.script.trim().is_empty() {
			continue;
		}

		let message = validator
			.message_when_fail
			.as_deref()
			.filter(|message| !message.trim().is_empty())
			.map_or_else(
				|| format!("Validation failed for param '{}'", validator.name),
				str::to_owned,
			);

		let script = if script_macros.is_empty() {
			validator.script.clone()
		} else {
			format!("{}\n\n{}", script_macros.join("\n\n"), validator.script)
		};

		let value = params.get(validator.name.trim()).cloned().unwrap_or(JsonValue::Null);

		match script::run_validation_script(&script, &value, &params_value, timeout) {
			Ok(true) => {}
			Ok(false) => return Err(runtime::Error::bad_parameter(message)),
			Err(error) => {
				return Err(runtime::Error::bad_parameter(format!("{message}. Error: {error}")));
			}
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests
{
	use serde_json::json;

	use super::*;

	fn spec(name: &str, data_type: &str, required: bool) -> ParamSpec
	{
		ParamSpec {
			name: name.to_owned(),
			location: ParamLocation::Query,
			data_type: Some(data_type.to_owned()),
			required,
			default_value: None,
		}
	}

	fn object(value: JsonValue) -> JsonMap<String, JsonValue>
	{
		match value {
			JsonValue::Object(object) => object,
			_ => panic!("expected object"),
		}
	}

	#[tokio::test]
	async fn schemaless_merge_prefers_path()
	{
		let mut path = PathVariables::new();

		path.insert(String::from("id"), String::from("7"));

		let headers = HeaderMap::new();
		let bound = bind(
			&path,
			Some("id=3&q=query"),
			&headers,
			br#"{"id": 1, "b": 2}"#,
			&[],
		)
		.await;

		// No JSON content type, so the body is ignored entirely.
		assert_eq!(bound.params.get("id"), Some(&json!("7")));
		assert_eq!(bound.params.get("q"), Some(&json!("query")));
		assert_eq!(bound.params.get("b"), None);
	}

	#[tokio::test]
	async fn schemaless_merge_includes_json_body()
	{
		let mut headers = HeaderMap::new();

		headers.insert(
			axum::http::header::CONTENT_TYPE,
			"application/json".parse().unwrap(),
		);

		let bound = bind(
			&PathVariables::new(),
			Some("q=1"),
			&headers,
			br#"{"b": 2, "q": "body-loses"}"#,
			&[],
		)
		.await;

		assert_eq!(bound.params.get("b"), Some(&json!(2)));
		assert_eq!(bound.params.get("q"), Some(&json!("1")));
		assert!(bound.body_for_log.is_some());
	}

	#[tokio::test]
	async fn schema_reads_declared_location_only()
	{
		let mut headers = HeaderMap::new();

		headers.insert(
			axum::http::header::CONTENT_TYPE,
			"application/json".parse().unwrap(),
		);
		headers.insert("X-Tenant", "acme".parse().unwrap());

		let schema = vec![
			ParamSpec {
				name: String::from("q"),
				location: ParamLocation::Query,
				data_type: None,
				required: false,
				default_value: None,
			},
			ParamSpec {
				name: String::from("b"),
				location: ParamLocation::Body,
				data_type: None,
				required: false,
				default_value: None,
			},
			ParamSpec {
				name: String::from("x-tenant"),
				location: ParamLocation::Header,
				data_type: None,
				required: false,
				default_value: None,
			},
			ParamSpec {
				name: String::from("sneaky"),
				location: ParamLocation::Body,
				data_type: None,
				required: false,
				default_value: None,
			},
		];

		let bound = bind(
			&PathVariables::new(),
			Some("q=from-query&sneaky=from-query"),
			&headers,
			br#"{"b": "from-body"}"#,
			&schema,
		)
		.await;

		assert_eq!(bound.params.get("q"), Some(&json!("from-query")));
		assert_eq!(bound.params.get("b"), Some(&json!("from-body")));
		assert_eq!(bound.params.get("x-tenant"), Some(&json!("acme")));

		// Declared as body, offered in query: not bound.
		assert_eq!(bound.params.get("sneaky"), None);
	}

	#[tokio::test]
	async fn camel_naming_converts_body_and_query()
	{
		let mut headers = HeaderMap::new();

		headers.insert(
			axum::http::header::CONTENT_TYPE,
			"application/json".parse().unwrap(),
		);

		let bound = bind(
			&PathVariables::new(),
			Some("naming=camel&pageSize=10"),
			&headers,
			br#"{"userId": 5}"#,
			&[],
		)
		.await;

		assert_eq!(bound.params.get("page_size"), Some(&json!("10")));
		assert_eq!(bound.params.get("user_id"), Some(&json!(5)));
	}

	#[tokio::test]
	async fn form_bodies_are_parsed()
	{
		let mut headers = HeaderMap::new();

		headers.insert(
			axum::http::header::CONTENT_TYPE,
			"application/x-www-form-urlencoded".parse().unwrap(),
		);

		let bound = bind(&PathVariables::new(), None, &headers, b"a=1&b=two", &[]).await;

		assert_eq!(bound.params.get("a"), Some(&json!("1")));
		assert_eq!(bound.params.get("b"), Some(&json!("two")));
	}

	#[test]
	fn coerce_integer_cases()
	{
		let schema = vec![spec("n", "integer", false)];

		let coerced = coerce(&schema, object(json!({ "n": "42" }))).unwrap();

		assert_eq!(coerced.get("n"), Some(&json!(42)));

		let coerced = coerce(&schema, object(json!({ "n": 7.0 }))).unwrap();

		assert_eq!(coerced.get("n"), Some(&json!(7)));

		assert!(coerce(&schema, object(json!({ "n": true }))).is_err());
		assert!(coerce(&schema, object(json!({ "n": 7.5 }))).is_err());
		assert!(coerce(&schema, object(json!({ "n": "x" }))).is_err());
	}

	#[test]
	fn coerce_boolean_cases()
	{
		let schema = vec![spec("b", "boolean", false)];

		for truthy in [json!(true), json!(1), json!("yes"), json!("TRUE")] {
			let coerced = coerce(&schema, object(json!({ "b": truthy }))).unwrap();

			assert_eq!(coerced.get("b"), Some(&json!(true)));
		}

		for falsy in [json!(false), json!(0), json!("no"), json!("0")] {
			let coerced = coerce(&schema, object(json!({ "b": falsy }))).unwrap();

			assert_eq!(coerced.get("b"), Some(&json!(false)));
		}

		assert!(coerce(&schema, object(json!({ "b": "maybe" }))).is_err());
		assert!(coerce(&schema, object(json!({ "b": 2 }))).is_err());
	}

	#[test]
	fn coerce_array_cases()
	{
		let schema = vec![spec("xs", "array", false)];

		let coerced = coerce(&schema, object(json!({ "xs": [1, 2] }))).unwrap();

		assert_eq!(coerced.get("xs"), Some(&json!([1, 2])));

		let coerced = coerce(&schema, object(json!({ "xs": "[1, 2]" }))).unwrap();

		assert_eq!(coerced.get("xs"), Some(&json!([1, 2])));

		let coerced = coerce(&schema, object(json!({ "xs": "a, b, , c" }))).unwrap();

		assert_eq!(coerced.get("xs"), Some(&json!(["a", "b", "c"])));

		assert!(coerce(&schema, object(json!({ "xs": "[oops" }))).is_err());
	}

	#[test]
	fn coerce_object_cases()
	{
		let schema = vec![spec("o", "object", false)];

		let coerced = coerce(&schema, object(json!({ "o": { "k": 1 } }))).unwrap();

		assert_eq!(coerced.get("o"), Some(&json!({ "k": 1 })));

		let coerced = coerce(&schema, object(json!({ "o": r#"{"k": 1}"# }))).unwrap();

		assert_eq!(coerced.get("o"), Some(&json!({ "k": 1 })));

		assert!(coerce(&schema, object(json!({ "o": "[1]" }))).is_err());
	}

	#[test]
	fn coerce_string_trims()
	{
		let schema = vec![spec("s", "string", false)];

		let coerced = coerce(&schema, object(json!({ "s": "  padded  " }))).unwrap();

		assert_eq!(coerced.get("s"), Some(&json!("padded")));
	}

	#[test]
	fn defaults_apply_to_missing_values()
	{
		let schema = vec![ParamSpec {
			name: String::from("limit"),
			location: ParamLocation::Query,
			data_type: Some(String::from("integer")),
			required: false,
			default_value: Some(json!("25")),
		}];

		let coerced = coerce(&schema, JsonMap::new()).unwrap();

		assert_eq!(coerced.get("limit"), Some(&json!(25)));

		let coerced = coerce(&schema, object(json!({ "limit": "" }))).unwrap();

		assert_eq!(coerced.get("limit"), Some(&json!(25)));

		let coerced = coerce(&schema, object(json!({ "limit": "7" }))).unwrap();

		assert_eq!(coerced.get("limit"), Some(&json!(7)));
	}

	#[test]
	fn missing_without_default_is_dropped()
	{
		let schema = vec![spec("q", "string", false)];

		let coerced = coerce(&schema, object(json!({ "q": "" }))).unwrap();

		assert!(!coerced.contains_key("q"));
	}

	#[test]
	fn required_check_lists_all_missing_names()
	{
		let schema = vec![spec("q", "string", true), spec("page", "integer", true)];

		let error = check_required(&schema, &JsonMap::new())
			.expect_err("missing required params must fail");

		assert_eq!(error.to_string(), "Missing required parameters: q, page");
	}

	#[test]
	fn required_check_passes_with_values()
	{
		let schema = vec![spec("q", "string", true)];
		let params = object(json!({ "q": "x" }));

		assert!(check_required(&schema, &params).is_ok());
	}

	#[test]
	fn validators_enforce_verdicts()
	{
		let validators = vec![ValidatorSpec {
			name: String::from("n"),
			script: String::from("fn validate(value, params) { value < 100 }"),
			message_when_fail: Some(String::from("n too large")),
		}];

		let params = object(json!({ "n": 5 }));

		assert!(run_validators(&validators, &params, &[], None).is_ok());

		let params = object(json!({ "n": 500 }));
		let error = run_validators(&validators, &params, &[], None)
			.expect_err("validator must reject");

		assert_eq!(error.to_string(), "n too large");
	}

	#[test]
	fn validator_macros_are_prepended()
	{
		let validators = vec![ValidatorSpec {
			name: String::from("n"),
			script: String::from("fn validate(value, params) { is_small(value) }"),
			message_when_fail: None,
		}];

		let macros = vec![String::from("fn is_small(x) { x < 10 }")];
		let params = object(json!({ "n": 5 }));

		assert!(run_validators(&validators, &params, &macros, None).is_ok());
	}

	#[test]
	fn parse_list_skips_malformed_entries()
	{
		let stored = json!([
			{ "name": "q", "location": "query", "data_type": "string", "is_required": true },
			"not-an-object",
			{ "location": "query" },
			{ "name": "  " },
		]);

		let specs = ParamSpec::parse_list(Some(&stored));

		assert_eq!(specs.len(), 1);
		assert_eq!(specs[0].name, "q");
		assert!(specs[0].required);
	}
}
