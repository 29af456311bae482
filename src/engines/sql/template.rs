//! The SQL template engine.
//!
//! Templates are Jinja-style text with variable substitution, conditionals,
//! loops, the SQL filters from [`filters`], and a `{% where %}` block that
//! assembles optional conditions.
//!
//! The engine never interpolates raw values: an expression without any
//! filter is rendered as a single-quoted, quote-escaped string literal by
//! the auto-escape formatter. Templates may therefore reference variables in
//! any syntactic position without opening an injection hole; type-specific
//! filters exist so that numbers, lists, and dates render as the right kind
//! of literal (see [`safety`] for the analyzer that nudges authors toward
//! them).
//!
//! [`filters`]: super::filters
//! [`safety`]: super::safety

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::LazyLock;

use minijinja::value::{Value, ValueKind};
use minijinja::{AutoEscape, Environment};
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;

use super::filters;

/// `{% where %}` / `{% endwhere %}` tags, lowered onto a filter block before
/// compilation.
static WHERE_OPEN: LazyLock<regex::Regex> = LazyLock::new(|| {
	regex::Regex::new(r"\{%(-?)\s*where\s*(-?)%\}").expect("hardcoded regex is valid")
});

#[allow(clippy::missing_docs_in_private_items)]
static WHERE_CLOSE: LazyLock<regex::Regex> = LazyLock::new(|| {
	regex::Regex::new(r"\{%(-?)\s*endwhere\s*(-?)%\}").expect("hardcoded regex is valid")
});

/// Renders SQL templates and extracts their free variables.
pub struct TemplateEngine
{
	env: Environment<'static>,
}

impl TemplateEngine
{
	/// Creates an engine with the SQL filters and the auto-escape default
	/// installed.
	pub fn new() -> Self
	{
		let mut env = Environment::new();

		filters::register(&mut env);
		env.set_auto_escape_callback(|_| AutoEscape::Custom("sql"));
		env.set_formatter(sql_formatter);

		Self { env }
	}

	/// Renders a template with the given parameters to a final SQL string.
	pub fn render(
		&self,
		template: &str,
		params: &JsonMap<String, JsonValue>,
	) -> Result<String, minijinja::Error>
	{
		let source = lower_where_blocks(template);
		let compiled = self.env.template_from_str(&source)?;

		compiled.render(Value::from_serialize(params))
	}

	/// Returns the free variable names used by a template, sorted.
	pub fn parse_parameters(&self, template: &str) -> Result<Vec<String>, minijinja::Error>
	{
		let source = lower_where_blocks(template);
		let compiled = self.env.template_from_str(&source)?;

		Ok(compiled
			.undeclared_variables(false)
			.into_iter()
			.collect::<BTreeSet<_>>()
			.into_iter()
			.collect())
	}
}

impl Default for TemplateEngine
{
	fn default() -> Self
	{
		Self::new()
	}
}

impl std::fmt::Debug for TemplateEngine
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_tuple("TemplateEngine").finish_non_exhaustive()
	}
}

/// Rewrites `{% where %}` blocks onto minijinja's filter-block machinery.
fn lower_where_blocks(template: &str) -> String
{
	let opened = WHERE_OPEN.replace_all(template, "{%${1} filter sql_where ${2}%}");

	WHERE_CLOSE.replace_all(&opened, "{%${1} endfilter ${2}%}").into_owned()
}

/// The auto-escape formatter.
///
/// Filter outputs are marked safe and written verbatim. Anything else is a
/// bare `{{ expr }}` and renders as a string literal; null and undefined
/// render as `NULL`.
fn sql_formatter(
	out: &mut minijinja::Output<'_>,
	_state: &minijinja::State<'_, '_>,
	value: &Value,
) -> Result<(), minijinja::Error>
{
	if value.is_safe() {
		return write!(out, "{value}").map_err(Into::into);
	}

	if matches!(value.kind(), ValueKind::None | ValueKind::Undefined) {
		return write!(out, "NULL").map_err(Into::into);
	}

	let raw = value.as_str().map_or_else(|| value.to_string(), str::to_owned);

	write!(out, "{}", filters::quote(&raw)).map_err(Into::into)
}

#[cfg(test)]
mod tests
{
	use serde_json::json;

	use super::*;

	fn render(template: &str, params: JsonValue) -> String
	{
		let JsonValue::Object(params) = params else {
			panic!("params must be an object");
		};

		TemplateEngine::new().render(template, &params).expect("template should render")
	}

	#[test]
	fn unfiltered_expressions_are_quoted()
	{
		let sql = render("SELECT {{ name }}", json!({ "name": "'; DROP TABLE t;--" }));

		assert_eq!(sql, "SELECT '''; DROP TABLE t;--'");
	}

	#[test]
	fn unfiltered_null_renders_null()
	{
		assert_eq!(render("SELECT {{ x }}", json!({ "x": null })), "SELECT NULL");
		assert_eq!(render("SELECT {{ missing }}", json!({})), "SELECT NULL");
	}

	#[test]
	fn sql_int_renders_bare_integer()
	{
		let sql = render("SELECT {{ id | sql_int }} AS id", json!({ "id": 42 }));

		assert_eq!(sql, "SELECT 42 AS id");
	}

	#[test]
	fn sql_int_rejects_garbage()
	{
		let sql = render("SELECT {{ id | sql_int }}", json!({ "id": "42; --" }));

		assert_eq!(sql, "SELECT NULL");
	}

	#[test]
	fn sql_string_doubles_quotes()
	{
		let sql = render("SELECT {{ v | sql_string }}", json!({ "v": "O'Brien" }));

		assert_eq!(sql, "SELECT 'O''Brien'");
	}

	#[test]
	fn in_list_renders_elements()
	{
		let sql = render(
			"SELECT * FROM t WHERE id IN {{ ids | in_list }}",
			json!({ "ids": [1, "two", null, true] }),
		);

		assert_eq!(sql, "SELECT * FROM t WHERE id IN (1, 'two', NULL, TRUE)");
	}

	#[test]
	fn in_list_empty_never_matches()
	{
		let sql = render("{{ ids | in_list }}", json!({ "ids": [] }));

		assert_eq!(sql, "(SELECT 1 WHERE 1=0)");
	}

	#[test]
	fn like_filters_escape_wildcards()
	{
		assert_eq!(
			render("{{ q | sql_like_start }}", json!({ "q": "50%_off" })),
			r"'50\%\_off%'",
		);
		assert_eq!(
			render("{{ q | sql_like_end }}", json!({ "q": "tail" })),
			"'%tail'",
		);
	}

	#[test]
	fn where_block_strips_leading_and()
	{
		let template = "SELECT * FROM t {% where %} AND a = {{ a | sql_int }} {% endwhere %}";
		let sql = render(template, json!({ "a": 1 }));

		assert_eq!(sql, "SELECT * FROM t WHERE a = 1");
	}

	#[test]
	fn where_block_strips_leading_or()
	{
		let template = "SELECT * FROM t {% where %}or b = {{ b | sql_int }}{% endwhere %}";
		let sql = render(template, json!({ "b": 2 }));

		assert_eq!(sql, "SELECT * FROM t WHERE b = 2");
	}

	#[test]
	fn empty_where_block_renders_nothing()
	{
		let template = "SELECT * FROM t {% where %}{% if false %}AND a = 1{% endif %}{% endwhere %}";
		let sql = render(template, json!({}));

		assert_eq!(sql, "SELECT * FROM t ");
	}

	#[test]
	fn conditionals_and_loops_work()
	{
		let template = "SELECT 1{% for id in ids %}, {{ id | sql_int }}{% endfor %}";
		let sql = render(template, json!({ "ids": [2, 3] }));

		assert_eq!(sql, "SELECT 1, 2, 3");
	}

	#[test]
	fn parse_parameters_returns_free_variables()
	{
		let engine = TemplateEngine::new();
		let params = engine
			.parse_parameters(
				"SELECT {{ a | sql_int }} {% where %}AND b = {{ b }}{% endwhere %}",
			)
			.expect("template should parse");

		assert_eq!(params, ["a", "b"]);
	}
}
