//! Decoding of driver rows into JSON objects.
//!
//! Endpoint queries are dynamic, so there is no compile-time row type to map
//! into; instead each row is walked column by column and decoded into a
//! [`serde_json::Value`] based on the database's reported type. Values that
//! JSON cannot represent directly are converted here once, so everything
//! downstream (transforms, the response formatter) operates on plain JSON:
//! dates and times become ISO strings, UUIDs become strings, decimals stay
//! integers when they are integer-valued, and byte arrays are decoded as
//! lossy UTF-8.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time};
use uuid::Uuid;

/// Decodes a Postgres row into a JSON object.
pub fn pg_row_to_json(row: &PgRow) -> JsonMap<String, JsonValue>
{
	let mut object = JsonMap::with_capacity(row.columns().len());

	for (index, column) in row.columns().iter().enumerate() {
		let value = match column.type_info().name() {
			"BOOL" => decode(row.try_get::<Option<bool>, _>(index)),
			"INT2" => decode(row.try_get::<Option<i16>, _>(index)),
			"INT4" => decode(row.try_get::<Option<i32>, _>(index)),
			"INT8" => decode(row.try_get::<Option<i64>, _>(index)),
			"FLOAT4" => decode(row.try_get::<Option<f32>, _>(index)),
			"FLOAT8" => decode(row.try_get::<Option<f64>, _>(index)),
			"NUMERIC" => decode_with(row.try_get::<Option<Decimal>, _>(index), decimal_to_json),
			"UUID" => {
				decode_with(row.try_get::<Option<Uuid>, _>(index), |id| {
					JsonValue::String(id.to_string())
				})
			}
			"DATE" => decode_with(row.try_get::<Option<Date>, _>(index), date_to_json),
			"TIME" => decode_with(row.try_get::<Option<Time>, _>(index), time_to_json),
			"TIMESTAMP" => {
				decode_with(row.try_get::<Option<PrimitiveDateTime>, _>(index), datetime_to_json)
			}
			"TIMESTAMPTZ" => decode_with(
				row.try_get::<Option<OffsetDateTime>, _>(index),
				offset_datetime_to_json,
			),
			"JSON" | "JSONB" => {
				decode(row.try_get::<Option<JsonValue>, _>(index))
			}
			"BYTEA" => {
				decode_with(row.try_get::<Option<Vec<u8>>, _>(index), |bytes| {
					JsonValue::String(String::from_utf8_lossy(&bytes).into_owned())
				})
			}
			_ => decode(row.try_get::<Option<String>, _>(index)),
		};

		object.insert(column.name().to_owned(), value);
	}

	object
}

/// Decodes a MySQL row into a JSON object.
pub fn mysql_row_to_json(row: &MySqlRow) -> JsonMap<String, JsonValue>
{
	let mut object = JsonMap::with_capacity(row.columns().len());

	for (index, column) in row.columns().iter().enumerate() {
		let type_name = column.type_info().name();
		let value = if type_name.contains("UNSIGNED") {
			decode(row.try_get::<Option<u64>, _>(index))
		} else {
			match type_name {
				"BOOLEAN" => decode(row.try_get::<Option<bool>, _>(index)),
				"TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
					decode(row.try_get::<Option<i64>, _>(index))
				}
				"FLOAT" => decode(row.try_get::<Option<f32>, _>(index)),
				"DOUBLE" => decode(row.try_get::<Option<f64>, _>(index)),
				"DECIMAL" => {
					decode_with(row.try_get::<Option<Decimal>, _>(index), decimal_to_json)
				}
				"DATE" => decode_with(row.try_get::<Option<Date>, _>(index), date_to_json),
				"TIME" => decode_with(row.try_get::<Option<Time>, _>(index), time_to_json),
				"DATETIME" => decode_with(
					row.try_get::<Option<PrimitiveDateTime>, _>(index),
					datetime_to_json,
				),
				"TIMESTAMP" => decode_with(
					row.try_get::<Option<OffsetDateTime>, _>(index),
					offset_datetime_to_json,
				),
				"JSON" => decode(row.try_get::<Option<JsonValue>, _>(index)),
				"TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => {
					decode_with(row.try_get::<Option<Vec<u8>>, _>(index), |bytes| {
						JsonValue::String(String::from_utf8_lossy(&bytes).into_owned())
					})
				}
				_ => decode(row.try_get::<Option<String>, _>(index)),
			}
		};

		object.insert(column.name().to_owned(), value);
	}

	object
}

/// Decodes an optional column value, mapping decode failures to `null`.
fn decode<T>(result: Result<Option<T>, sqlx::Error>) -> JsonValue
where
	JsonValue: From<T>,
{
	decode_with(result, JsonValue::from)
}

/// Decodes an optional column value with an explicit conversion.
fn decode_with<T>(
	result: Result<Option<T>, sqlx::Error>,
	convert: impl FnOnce(T) -> JsonValue,
) -> JsonValue
{
	match result {
		Ok(Some(value)) => convert(value),
		Ok(None) => JsonValue::Null,
		Err(error) => {
			tracing::warn!(%error, "failed to decode column value; substituting null");
			JsonValue::Null
		}
	}
}

/// Integer-valued decimals stay integers; everything else becomes a float.
fn decimal_to_json(decimal: Decimal) -> JsonValue
{
	if decimal.is_integer() {
		if let Some(int) = decimal.to_i64() {
			return JsonValue::from(int);
		}
	}

	decimal.to_f64().map_or(JsonValue::Null, JsonValue::from)
}

fn date_to_json(date: Date) -> JsonValue
{
	let format = format_description!("[year]-[month]-[day]");

	date.format(&format)
		.map_or(JsonValue::Null, JsonValue::String)
}

fn time_to_json(time: Time) -> JsonValue
{
	let format = format_description!("[hour]:[minute]:[second]");

	time.format(&format)
		.map_or(JsonValue::Null, JsonValue::String)
}

fn datetime_to_json(datetime: PrimitiveDateTime) -> JsonValue
{
	let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

	datetime
		.format(&format)
		.map_or(JsonValue::Null, JsonValue::String)
}

fn offset_datetime_to_json(datetime: OffsetDateTime) -> JsonValue
{
	datetime
		.format(&Rfc3339)
		.map_or(JsonValue::Null, JsonValue::String)
}
