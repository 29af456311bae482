//! SQL filters for the template engine.
//!
//! Every filter renders a value to a complete SQL literal, escaping as
//! needed, and handles null/undefined as the literal `NULL`. Filter outputs
//! are marked safe so the auto-escape formatter passes them through
//! unchanged.

use minijinja::value::{Value, ValueKind};

/// Registers all SQL filters on an environment.
pub(super) fn register(env: &mut minijinja::Environment<'_>)
{
	env.add_filter("sql_string", sql_string);
	env.add_filter("sql_int", sql_int);
	env.add_filter("sql_float", sql_float);
	env.add_filter("sql_bool", sql_bool);
	env.add_filter("sql_date", sql_date);
	env.add_filter("sql_datetime", sql_datetime);
	env.add_filter("in_list", in_list);
	env.add_filter("sql_like", sql_like);
	env.add_filter("sql_like_start", sql_like_start);
	env.add_filter("sql_like_end", sql_like_end);
	env.add_filter("json", json);
	env.add_filter("sql_where", sql_where);
}

/// The filter names the safety analyzer recognizes as explicit SQL escaping.
pub(crate) const SQL_FILTER_NAMES: &[&str] = &[
	"sql_string",
	"sql_int",
	"sql_float",
	"sql_bool",
	"sql_date",
	"sql_datetime",
	"in_list",
	"sql_like",
	"sql_like_start",
	"sql_like_end",
	"json",
];

/// Whether the value should render as the literal `NULL`.
fn is_nullish(value: &Value) -> bool
{
	matches!(value.kind(), ValueKind::None | ValueKind::Undefined)
}

/// Single-quote wraps a string, doubling embedded single quotes.
pub(crate) fn quote(raw: &str) -> String
{
	let mut quoted = String::with_capacity(raw.len() + 2);

	quoted.push('\'');

	for ch in raw.chars() {
		if ch == '\'' {
			quoted.push('\'');
		}

		quoted.push(ch);
	}

	quoted.push('\'');
	quoted
}

/// Escapes `\`, `%`, and `_` for use inside a LIKE pattern.
fn escape_like(raw: &str) -> String
{
	let mut escaped = String::with_capacity(raw.len());

	for ch in raw.chars() {
		match ch {
			'\\' => escaped.push_str("\\\\"),
			'%' => escaped.push_str("\\%"),
			'_' => escaped.push_str("\\_"),
			other => escaped.push(other),
		}
	}

	escaped
}

/// Marks a rendered literal as safe so the formatter emits it verbatim.
fn safe(literal: String) -> Value
{
	Value::from_safe_string(literal)
}

/// `{{ x | sql_string }}`: single-quoted, quote-escaped string.
fn sql_string(value: Value) -> Value
{
	if is_nullish(&value) {
		return safe(String::from("NULL"));
	}

	safe(quote(&stringify(&value)))
}

/// `{{ x | sql_int }}`: validated integer literal; invalid input renders
/// `NULL`.
fn sql_int(value: Value) -> Value
{
	if is_nullish(&value) {
		return safe(String::from("NULL"));
	}

	let literal = match value.kind() {
		ValueKind::Bool => Some(String::from(if value.is_true() { "1" } else { "0" })),
		ValueKind::Number => {
			i64::try_from(value.clone())
				.map(|int| int.to_string())
				.ok()
				.or_else(|| {
					// Truncate float inputs toward zero.
					f64::try_from(value.clone()).ok().map(|float| (float as i64).to_string())
				})
		}
		ValueKind::String => {
			value
				.as_str()
				.and_then(|raw| raw.trim().parse::<i64>().ok())
				.map(|int| int.to_string())
		}
		_ => None,
	};

	safe(literal.unwrap_or_else(|| String::from("NULL")))
}

/// `{{ x | sql_float }}`: validated float literal; invalid input renders
/// `NULL`.
fn sql_float(value: Value) -> Value
{
	if is_nullish(&value) {
		return safe(String::from("NULL"));
	}

	let literal = match value.kind() {
		ValueKind::Bool => Some(String::from(if value.is_true() { "1.0" } else { "0.0" })),
		ValueKind::Number => f64::try_from(value.clone()).ok().map(|float| float.to_string()),
		ValueKind::String => {
			value
				.as_str()
				.and_then(|raw| raw.trim().parse::<f64>().ok())
				.map(|float| float.to_string())
		}
		_ => None,
	};

	safe(literal.unwrap_or_else(|| String::from("NULL")))
}

/// `{{ x | sql_bool }}`: `TRUE`/`FALSE` from the value's truthiness.
fn sql_bool(value: Value) -> Value
{
	if is_nullish(&value) {
		return safe(String::from("NULL"));
	}

	safe(String::from(if value.is_true() { "TRUE" } else { "FALSE" }))
}

/// `{{ x | sql_date }}`: quoted ISO date, minimally validated as
/// `YYYY-MM-DD`.
fn sql_date(value: Value) -> Value
{
	if is_nullish(&value) {
		return safe(String::from("NULL"));
	}

	let raw = stringify(&value);
	let bytes = raw.as_bytes();

	if bytes.len() >= 10 && bytes[4] == b'-' && bytes[7] == b'-' {
		return safe(quote(&raw[..10]));
	}

	safe(String::from("NULL"))
}

/// `{{ x | sql_datetime }}`: quoted ISO datetime.
fn sql_datetime(value: Value) -> Value
{
	if is_nullish(&value) {
		return safe(String::from("NULL"));
	}

	if value.kind() == ValueKind::String {
		return safe(quote(&stringify(&value)));
	}

	safe(String::from("NULL"))
}

/// `{{ xs | in_list }}`: parenthesized comma-separated list with per-element
/// escaping. Empty or null renders a never-matching subquery so `IN` stays
/// syntactically valid.
fn in_list(value: Value) -> Value
{
	const EMPTY: &str = "(SELECT 1 WHERE 1=0)";

	if is_nullish(&value) {
		return safe(String::from(EMPTY));
	}

	let Ok(iter) = value.try_iter() else {
		return safe(String::from(EMPTY));
	};

	let parts = iter.map(|element| element_literal(&element)).collect::<Vec<_>>();

	if parts.is_empty() {
		return safe(String::from(EMPTY));
	}

	safe(format!("({})", parts.join(", ")))
}

/// Renders one `in_list` element.
fn element_literal(element: &Value) -> String
{
	if is_nullish(element) {
		return String::from("NULL");
	}

	match element.kind() {
		ValueKind::Bool => String::from(if element.is_true() { "TRUE" } else { "FALSE" }),
		ValueKind::Number => element.to_string(),
		_ => quote(&stringify(element)),
	}
}

/// `{{ x | sql_like }}`: LIKE-escaped, quoted pattern.
fn sql_like(value: Value) -> Value
{
	if is_nullish(&value) {
		return safe(String::from("NULL"));
	}

	safe(quote(&escape_like(&stringify(&value))))
}

/// `{{ x | sql_like_start }}`: prefix match; escaped input with a trailing
/// `%`.
fn sql_like_start(value: Value) -> Value
{
	if is_nullish(&value) {
		return safe(String::from("NULL"));
	}

	safe(quote(&format!("{}%", escape_like(&stringify(&value)))))
}

/// `{{ x | sql_like_end }}`: suffix match; escaped input with a leading `%`.
fn sql_like_end(value: Value) -> Value
{
	if is_nullish(&value) {
		return safe(String::from("NULL"));
	}

	safe(quote(&format!("%{}", escape_like(&stringify(&value)))))
}

/// `{{ x | json }}`: JSON-serialized, quote-escaped literal.
fn json(value: Value) -> Value
{
	if is_nullish(&value) {
		return safe(String::from("NULL"));
	}

	match serde_json::to_string(&value) {
		Ok(serialized) => safe(quote(&serialized)),
		Err(_) => safe(String::from("NULL")),
	}
}

/// Implementation of the `{% where %}` block.
///
/// The template module lowers `{% where %} … {% endwhere %}` onto a filter
/// block over this filter: the rendered body is stripped of one leading
/// `AND`/`OR`, and the non-empty remainder is prefixed with `WHERE `.
fn sql_where(value: Value) -> Value
{
	let body = stringify(&value);
	let conditions = strip_leading_conjunction(&body).trim_end();

	if conditions.is_empty() {
		return safe(String::new());
	}

	safe(format!("WHERE {conditions}"))
}

/// Strips one leading `AND`/`OR` (case-insensitive) from a condition body.
fn strip_leading_conjunction(body: &str) -> &str
{
	let trimmed = body.trim_start();

	for conjunction in ["AND", "OR"] {
		if trimmed.len() > conjunction.len()
			&& trimmed[..conjunction.len()].eq_ignore_ascii_case(conjunction)
			&& trimmed.as_bytes()[conjunction.len()].is_ascii_whitespace()
		{
			return trimmed[conjunction.len()..].trim_start();
		}
	}

	trimmed
}

/// Renders a value to its plain string form.
fn stringify(value: &Value) -> String
{
	value.as_str().map_or_else(|| value.to_string(), str::to_owned)
}
