//! Static analysis for SQL templates.
//!
//! Scans templates for `{{ variable }}` expressions that are not piped
//! through an explicit SQL filter. With the auto-escape default in place
//! these are not exploitable, but the warning steers endpoint authors
//! toward the type-specific filter (`sql_int` for integers instead of the
//! string-based default, and so on). Warnings are surfaced at publish time.

use std::sync::LazyLock;

use serde::Serialize;

use super::filters::SQL_FILTER_NAMES;

/// `{{ expr }}` expressions, including ones spanning lines.
static VAR_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
	regex::Regex::new(r"(?s)\{\{(.*?)\}\}").expect("hardcoded regex is valid")
});

/// One analyzer finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyWarning
{
	/// The variable at the root of the unfiltered expression.
	pub variable: String,

	/// 1-based line of the expression.
	pub line: usize,

	/// Human-readable advice.
	pub message: String,
}

/// Analyzes a template and returns a warning for every expression without
/// an explicit SQL filter.
///
/// An empty list means no issues were detected.
pub fn check_template_safety(template: &str) -> Vec<SafetyWarning>
{
	let mut warnings = Vec::new();

	for (line_index, line) in template.lines().enumerate() {
		for captures in VAR_PATTERN.captures_iter(line) {
			let expr = captures[1].trim().to_owned();

			if expr.is_empty() {
				continue;
			}

			let filters = extract_filters(&expr);

			if filters.iter().any(|name| is_sql_filter(name)) {
				continue;
			}

			let variable = root_variable(&expr);

			warnings.push(SafetyWarning {
				message: format!(
					"'{{{{ {variable} }}}}' has no explicit SQL filter. It will be \
					 auto-escaped as a quoted string. Consider using a type-specific \
					 filter: | sql_string, | sql_int, | sql_float, | sql_datetime, etc.",
				),
				variable,
				line: line_index + 1,
			});
		}
	}

	warnings
}

/// Whether a filter name counts as explicit SQL escaping.
fn is_sql_filter(name: &str) -> bool
{
	SQL_FILTER_NAMES.contains(&name) || matches!(name, "int" | "float" | "string")
}

/// Returns the filter names applied in a `{{ expr | f1 | f2 }}` expression.
fn extract_filters(expr: &str) -> Vec<String>
{
	expr.split('|')
		.skip(1)
		.filter_map(|part| {
			let name = part.trim().split('(').next()?.trim();

			(!name.is_empty()).then(|| name.to_owned())
		})
		.collect()
}

/// Returns the variable at the root of an expression.
fn root_variable(expr: &str) -> String
{
	expr.split('|')
		.next()
		.unwrap_or_default()
		.trim()
		.split(['.', '['])
		.next()
		.unwrap_or_default()
		.trim()
		.to_owned()
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn unfiltered_variable_warns()
	{
		let warnings = check_template_safety("SELECT {{ name }} FROM t");

		assert_eq!(warnings.len(), 1);
		assert_eq!(warnings[0].variable, "name");
		assert_eq!(warnings[0].line, 1);
	}

	#[test]
	fn sql_filter_silences_warning()
	{
		assert!(check_template_safety("SELECT {{ id | sql_int }}").is_empty());
		assert!(check_template_safety("SELECT {{ xs | in_list }}").is_empty());
	}

	#[test]
	fn non_sql_filter_still_warns()
	{
		let warnings = check_template_safety("SELECT {{ name | upper }}");

		assert_eq!(warnings.len(), 1);
		assert_eq!(warnings[0].variable, "name");
	}

	#[test]
	fn line_numbers_are_one_based()
	{
		let warnings = check_template_safety("SELECT 1\nFROM t\nWHERE a = {{ a }}");

		assert_eq!(warnings.len(), 1);
		assert_eq!(warnings[0].line, 3);
	}

	#[test]
	fn dotted_access_reports_root()
	{
		let warnings = check_template_safety("SELECT {{ user.name }}");

		assert_eq!(warnings[0].variable, "user");
	}
}
