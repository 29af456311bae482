//! Endpoint resolution.
//!
//! Maps an incoming `(first_segment, remaining_path, method)` to a
//! published endpoint and its path variables. The first segment selects a
//! module by its effective gateway key; the rest is matched against the
//! module's endpoint patterns in `(sort_order, id)` order. Modules whose
//! effective prefix is empty participate as "root" modules matched against
//! the full path.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::database::{Endpoint, Module, Store};
use crate::runtime;

/// Extracted `{name}` path variables.
pub type PathVariables = HashMap<String, String>;

/// `{name}` placeholders inside a stored path pattern.
static PLACEHOLDER: LazyLock<regex::Regex> =
	LazyLock::new(|| regex::Regex::new(r"\{([^}]+)\}").expect("hardcoded regex is valid"));

/// Resolves URLs to endpoints against the configuration store.
#[derive(Clone)]
pub struct Resolver
{
	store: Store,
}

impl Resolver
{
	/// Creates a resolver over the configuration store.
	pub fn new(store: Store) -> Self
	{
		Self { store }
	}

	/// Resolves a request to `(endpoint, path_variables)`.
	///
	/// Returns `Ok(None)` when nothing matches (the dispatcher answers
	/// 404).
	#[tracing::instrument(level = "debug", skip(self), err(level = "warn"))]
	pub async fn resolve(
		&self,
		first_segment: &str,
		remaining_path: &str,
		method: &str,
	) -> runtime::Result<Option<(Endpoint, PathVariables)>>
	{
		let segment = first_segment.trim();

		if segment.is_empty() {
			return Ok(None);
		}

		let method = method.to_uppercase();
		let modules = self.store.active_modules().await?;

		if let Some(module) = modules.iter().find(|module| gateway_key(module) == segment) {
			return self.resolve_in_module(module, remaining_path, &method).await;
		}

		// No module owns the first segment; retry against root modules with
		// the segment folded back into the path.
		let full_path = if remaining_path.is_empty() {
			segment.to_owned()
		} else {
			format!("{segment}/{remaining_path}")
		};

		for module in modules.iter().filter(|module| effective_prefix(module).is_empty()) {
			if let Some(resolved) = self.resolve_in_module(module, &full_path, &method).await? {
				return Ok(Some(resolved));
			}
		}

		Ok(None)
	}

	/// Matches a path against one module's published endpoints.
	async fn resolve_in_module(
		&self,
		module: &Module,
		path: &str,
		method: &str,
	) -> runtime::Result<Option<(Endpoint, PathVariables)>>
	{
		let path = path.trim().trim_matches('/');
		let endpoints = self.store.published_endpoints(module.id, method).await?;

		for endpoint in endpoints {
			// A stored pattern that fails to compile skips this endpoint
			// rather than aborting dispatch.
			let Ok(pattern) = compile_path_pattern(&endpoint.path) else {
				tracing::warn!(
					endpoint.id = %endpoint.id,
					endpoint.path = %endpoint.path,
					"stored path pattern does not compile; skipping endpoint",
				);
				continue;
			};

			if let Some(captures) = pattern.captures(path) {
				let variables = pattern
					.capture_names()
					.flatten()
					.filter_map(|name| {
						captures.name(name).map(|m| (name.to_owned(), m.as_str().to_owned()))
					})
					.collect();

				return Ok(Some((endpoint, variables)));
			}
		}

		Ok(None)
	}
}

impl std::fmt::Debug for Resolver
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_tuple("Resolver").finish_non_exhaustive()
	}
}

/// The URL segment a module answers to: its prefix stripped of slashes, or
/// a slug of its name when the prefix is empty.
pub fn gateway_key(module: &Module) -> String
{
	let prefix = effective_prefix(module);

	if prefix.is_empty() { slug(&module.name) } else { prefix.to_owned() }
}

/// The module's path prefix with surrounding slashes removed.
fn effective_prefix(module: &Module) -> &str
{
	module.path_prefix.trim_matches('/')
}

/// Lowercase alphanumeric-and-hyphen slug of a module name.
fn slug(name: &str) -> String
{
	let slugged = name
		.to_lowercase()
		.chars()
		.map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '-' })
		.collect::<String>()
		.trim_matches('-')
		.to_owned();

	if slugged.is_empty() { String::from("default") } else { slugged }
}

/// Compiles a stored path pattern to an anchored regex.
///
/// `{name}` placeholders become named captures matching `[^/]+`;
/// placeholders that are not valid identifiers are treated as literal
/// text; everything else is escaped.
pub fn compile_path_pattern(pattern: &str) -> Result<regex::Regex, regex::Error>
{
	let mut source = String::with_capacity(pattern.len() + 16);
	let mut last_end = 0;

	source.push('^');

	for captures in PLACEHOLDER.captures_iter(pattern) {
		let whole = captures.get(0).map_or(0..0, |m| m.range());
		let name = &captures[1];

		source.push_str(&regex::escape(&pattern[last_end..whole.start]));

		if is_identifier(name) {
			source.push_str(&format!("(?P<{name}>[^/]+)"));
		} else {
			source.push_str(&regex::escape(&pattern[whole.clone()]));
		}

		last_end = whole.end;
	}

	source.push_str(&regex::escape(&pattern[last_end..]));
	source.push('$');

	regex::Regex::new(&source)
}

/// Whether a placeholder name is a valid identifier.
fn is_identifier(name: &str) -> bool
{
	let mut chars = name.chars();

	chars
		.next()
		.is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
		&& chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[cfg(test)]
mod tests
{
	use uuid::Uuid;

	use super::*;

	fn module(name: &str, path_prefix: &str) -> Module
	{
		Module {
			id: Uuid::new_v4(),
			name: name.to_owned(),
			path_prefix: path_prefix.to_owned(),
			sort_order: 0,
			is_active: true,
		}
	}

	#[test]
	fn gateway_key_prefers_prefix()
	{
		assert_eq!(gateway_key(&module("Reports", "/api/")), "api");
		assert_eq!(gateway_key(&module("Reports", "")), "reports");
		assert_eq!(gateway_key(&module("My Reports!", "/")), "my-reports");
		assert_eq!(gateway_key(&module("!!!", "/")), "default");
	}

	#[test]
	fn plain_pattern_matches_exactly()
	{
		let pattern = compile_path_pattern("list").unwrap();

		assert!(pattern.is_match("list"));
		assert!(!pattern.is_match("list/1"));
		assert!(!pattern.is_match("lists"));
	}

	#[test]
	fn placeholders_become_named_captures()
	{
		let pattern = compile_path_pattern("users/{id}").unwrap();
		let captures = pattern.captures("users/42").unwrap();

		assert_eq!(&captures["id"], "42");
		assert!(!pattern.is_match("users/42/extra"));
		assert!(!pattern.is_match("users/"));
	}

	#[test]
	fn multiple_placeholders()
	{
		let pattern = compile_path_pattern("orgs/{org}/repos/{repo}").unwrap();
		let captures = pattern.captures("orgs/acme/repos/gateway").unwrap();

		assert_eq!(&captures["org"], "acme");
		assert_eq!(&captures["repo"], "gateway");
	}

	#[test]
	fn placeholders_do_not_cross_segments()
	{
		let pattern = compile_path_pattern("users/{id}").unwrap();

		assert!(!pattern.is_match("users/1/2"));
	}

	#[test]
	fn invalid_placeholder_names_are_literal()
	{
		let pattern = compile_path_pattern("users/{not valid}").unwrap();

		assert!(pattern.is_match("users/{not valid}"));
		assert!(!pattern.is_match("users/42"));
	}

	#[test]
	fn literal_regex_metacharacters_are_escaped()
	{
		let pattern = compile_path_pattern("v1.0/items").unwrap();

		assert!(pattern.is_match("v1.0/items"));
		assert!(!pattern.is_match("v1x0/items"));
	}
}
