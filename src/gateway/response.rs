//! Response normalization and naming conversion.
//!
//! Every dispatched response uses the envelope
//! `{"success": bool, "message": string|null, "data": array, …extras}`.
//! This module normalizes the executor's raw output into that shape and
//! applies the optional snake-to-camel key conversion. JSON safety is
//! structural: row decoding already converted temporal/decimal/uuid/byte
//! values, so everything here is plain [`serde_json::Value`] tree surgery.

use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::database::EngineKind;

/// Requested key casing for the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Naming
{
	#[default]
	Snake,
	Camel,
}

impl Naming
{
	/// Parses the `?naming=` query value / `X-Response-Naming` header.
	pub fn parse(raw: &str) -> Self
	{
		if raw.trim().eq_ignore_ascii_case("camel") { Self::Camel } else { Self::Snake }
	}
}

/// camelCase -> snake_case, e.g. `userId` -> `user_id`.
pub fn camel_to_snake(key: &str) -> String
{
	let mut snake = String::with_capacity(key.len() + 4);

	for (index, ch) in key.chars().enumerate() {
		if ch.is_uppercase() && index != 0 {
			snake.push('_');
		}

		snake.extend(ch.to_lowercase());
	}

	snake
}

/// snake_case -> camelCase, e.g. `user_id` -> `userId`.
pub fn snake_to_camel(key: &str) -> String
{
	let mut parts = key.split('_');
	let mut camel = String::with_capacity(key.len());

	if let Some(first) = parts.next() {
		camel.push_str(&first.to_lowercase());
	}

	for part in parts {
		let mut chars = part.chars();

		if let Some(first) = chars.next() {
			camel.extend(first.to_uppercase());
			camel.push_str(chars.as_str());
		}
	}

	camel
}

/// Recursively converts mapping keys from camelCase to snake_case.
pub fn keys_to_snake(value: JsonValue) -> JsonValue
{
	convert_keys(value, &camel_to_snake)
}

/// Recursively converts mapping keys from snake_case to camelCase.
pub fn keys_to_camel(value: JsonValue) -> JsonValue
{
	convert_keys(value, &snake_to_camel)
}

#[allow(clippy::missing_docs_in_private_items)]
fn convert_keys(value: JsonValue, convert: &dyn Fn(&str) -> String) -> JsonValue
{
	match value {
		JsonValue::Object(object) => {
			JsonValue::Object(
				object
					.into_iter()
					.map(|(key, inner)| (convert(&key), convert_keys(inner, convert)))
					.collect(),
			)
		}
		JsonValue::Array(items) => {
			JsonValue::Array(items.into_iter().map(|item| convert_keys(item, convert)).collect())
		}
		other => other,
	}
}

/// Normalizes the runner's raw result into the response envelope.
///
/// SQL results arrive as `{"data": rows-or-rowcount}`; a single-element
/// outer list of lists is unwrapped and non-list data is coerced to a
/// single-element list. Script results that already carry the envelope
/// shape inside `data` are unwrapped; anything else is wrapped. Extras
/// added by a result transform are preserved.
pub fn normalize_result(result: JsonValue, engine: EngineKind) -> JsonValue
{
	match engine {
		EngineKind::Sql => normalize_sql_result(result),
		EngineKind::Script => normalize_script_result(result),
	}
}

#[allow(clippy::missing_docs_in_private_items)]
fn normalize_sql_result(result: JsonValue) -> JsonValue
{
	if let JsonValue::Object(mut object) = result {
		if let Some(data) = object.remove("data") {
			let data = match data {
				// Single result set [[row1, row2]] -> [row1, row2]; but do
				// not unwrap [row1] (already rows from a transform).
				JsonValue::Array(outer)
					if outer.len() == 1 && outer[0].is_array() =>
				{
					let mut outer = outer;
					outer.remove(0)
				}
				data @ JsonValue::Array(_) => data,
				JsonValue::Null => JsonValue::Array(Vec::new()),
				other => JsonValue::Array(vec![other]),
			};

			let mut envelope = envelope(true, JsonValue::Null, data);

			// Extras from a result transform (offset, limit, total, …).
			for (key, value) in object {
				if !matches!(key.as_str(), "success" | "message" | "data") {
					envelope.insert(key, value);
				}
			}

			return JsonValue::Object(envelope);
		}

		return JsonValue::Object(envelope(
			true,
			JsonValue::Null,
			JsonValue::Array(vec![JsonValue::Object(object)]),
		));
	}

	let data = match result {
		data @ JsonValue::Array(_) => data,
		JsonValue::Null => JsonValue::Array(Vec::new()),
		other => JsonValue::Array(vec![other]),
	};

	JsonValue::Object(envelope(true, JsonValue::Null, data))
}

#[allow(clippy::missing_docs_in_private_items)]
fn normalize_script_result(result: JsonValue) -> JsonValue
{
	if let JsonValue::Object(mut object) = result {
		if let Some(inner) = object.remove("data") {
			if is_envelope_shaped(&inner) {
				// The script's own envelope becomes the response envelope.
				let JsonValue::Object(mut inner) = inner else { unreachable!() };

				let data = inner.remove("data").unwrap_or(JsonValue::Null);

				inner.insert(String::from("data"), coerce_list(data));

				return JsonValue::Object(inner);
			}

			return JsonValue::Object(envelope(true, JsonValue::Null, coerce_list(inner)));
		}

		// A transform already produced the envelope shape.
		if object.contains_key("success") && object.contains_key("message") {
			let data = object.remove("data").unwrap_or(JsonValue::Null);

			object.insert(String::from("data"), coerce_list(data));

			return JsonValue::Object(object);
		}

		return JsonValue::Object(envelope(
			true,
			JsonValue::Null,
			JsonValue::Array(vec![JsonValue::Object(object)]),
		));
	}

	JsonValue::Object(envelope(true, JsonValue::Null, coerce_list(result)))
}

/// Whether a value carries the envelope keys.
fn is_envelope_shaped(value: &JsonValue) -> bool
{
	value.as_object().is_some_and(|object| {
		object.contains_key("success")
			&& object.contains_key("message")
			&& object.contains_key("data")
	})
}

/// Coerces a value to a list: lists stay, null becomes empty, anything else
/// wraps.
fn coerce_list(value: JsonValue) -> JsonValue
{
	match value {
		list @ JsonValue::Array(_) => list,
		JsonValue::Null => JsonValue::Array(Vec::new()),
		other => JsonValue::Array(vec![other]),
	}
}

/// Builds an envelope object.
pub fn envelope(success: bool, message: JsonValue, data: JsonValue) -> JsonMap<String, JsonValue>
{
	let mut object = JsonMap::with_capacity(3);

	object.insert(String::from("success"), JsonValue::Bool(success));
	object.insert(String::from("message"), message);
	object.insert(String::from("data"), coerce_list(data));
	object
}

/// Builds the error envelope for a failed dispatch.
pub fn error_envelope(message: &str) -> JsonValue
{
	JsonValue::Object(envelope(
		false,
		JsonValue::String(message.to_owned()),
		JsonValue::Array(Vec::new()),
	))
}

/// Applies the requested naming to a finished envelope.
pub fn apply_naming(value: JsonValue, naming: Naming) -> JsonValue
{
	match naming {
		Naming::Snake => value,
		Naming::Camel => keys_to_camel(value),
	}
}

#[cfg(test)]
mod tests
{
	use serde_json::json;

	use super::*;

	#[test]
	fn naming_round_trip()
	{
		let original = json!({
			"user_id": 1,
			"first_name": "a",
			"nested": [{ "created_at": "now", "plain": true }],
			"n": 2,
		});

		let there = keys_to_camel(original.clone());

		assert_eq!(there["userId"], json!(1));
		assert_eq!(there["nested"][0]["createdAt"], json!("now"));

		let back = keys_to_snake(there);

		assert_eq!(back, original);
	}

	#[test]
	fn camel_to_snake_examples()
	{
		assert_eq!(camel_to_snake("userId"), "user_id");
		assert_eq!(camel_to_snake("firstName"), "first_name");
		assert_eq!(camel_to_snake("plain"), "plain");
	}

	#[test]
	fn snake_to_camel_examples()
	{
		assert_eq!(snake_to_camel("user_id"), "userId");
		assert_eq!(snake_to_camel("first_name"), "firstName");
		assert_eq!(snake_to_camel("plain"), "plain");
	}

	#[test]
	fn sql_single_result_set_is_unwrapped()
	{
		let normalized = normalize_result(
			json!({ "data": [[{ "id": 1 }, { "id": 2 }]] }),
			EngineKind::Sql,
		);

		assert_eq!(
			normalized,
			json!({ "success": true, "message": null, "data": [{ "id": 1 }, { "id": 2 }] }),
		);
	}

	#[test]
	fn sql_row_list_is_not_double_unwrapped()
	{
		let normalized = normalize_result(json!({ "data": [{ "id": 1 }] }), EngineKind::Sql);

		assert_eq!(normalized["data"], json!([{ "id": 1 }]));
	}

	#[test]
	fn sql_rowcount_becomes_single_element_list()
	{
		let normalized = normalize_result(json!({ "data": 3 }), EngineKind::Sql);

		assert_eq!(normalized["data"], json!([3]));
	}

	#[test]
	fn sql_extras_are_preserved()
	{
		let normalized = normalize_result(
			json!({ "data": [{ "id": 1 }], "total": 10, "offset": 0 }),
			EngineKind::Sql,
		);

		assert_eq!(normalized["total"], json!(10));
		assert_eq!(normalized["offset"], json!(0));
		assert_eq!(normalized["success"], json!(true));
	}

	#[test]
	fn script_inner_envelope_is_unwrapped()
	{
		let normalized = normalize_result(
			json!({
				"data": { "success": false, "message": "nope", "data": { "id": 1 } },
			}),
			EngineKind::Script,
		);

		assert_eq!(
			normalized,
			json!({ "success": false, "message": "nope", "data": [{ "id": 1 }] }),
		);
	}

	#[test]
	fn script_raw_data_is_wrapped()
	{
		let normalized = normalize_result(json!({ "data": [1, 2] }), EngineKind::Script);

		assert_eq!(
			normalized,
			json!({ "success": true, "message": null, "data": [1, 2] }),
		);
	}

	#[test]
	fn envelope_data_is_always_a_list()
	{
		for engine in [EngineKind::Sql, EngineKind::Script] {
			for raw in [json!(null), json!({ "data": null }), json!({ "data": "x" })] {
				let normalized = normalize_result(raw, engine);

				assert!(normalized["data"].is_array(), "{engine:?}");
				assert!(normalized["success"].is_boolean());
			}
		}
	}

	#[test]
	fn transformed_envelope_passes_through()
	{
		let normalized = normalize_result(
			json!({ "success": true, "message": null, "data": 7, "extra": 1 }),
			EngineKind::Script,
		);

		assert_eq!(normalized["data"], json!([7]));
		assert_eq!(normalized["extra"], json!(1));
	}

	#[test]
	fn error_envelope_shape()
	{
		let envelope = error_envelope("Too Many Requests");

		assert_eq!(
			envelope,
			json!({ "success": false, "message": "Too Many Requests", "data": [] }),
		);
	}
}
