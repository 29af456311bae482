//! Two-tier cache of resolved endpoint configuration.
//!
//! The runner needs the endpoint's content, parameter schema, validators,
//! result transform, and in-scope macros on every request; this module
//! caches that bundle per endpoint id in a short-TTL in-process map (L1)
//! and the shared KV store (L2), loading through from the configuration
//! store on miss. Admin mutations that touch an endpoint or its module's
//! macros must call [`ConfigCache::invalidate`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::params::{ParamSpec, ValidatorSpec};
use crate::database::{Endpoint, MacroDef, MacroKind, Store};
use crate::kv::Kv;
use crate::runtime;

/// Namespace for bundles in the KV tier.
const KEY_PREFIX: &str = "gateway:config:";

/// Short L1 TTL keeps entries fresh while avoiding a KV round-trip on every
/// request.
const LOCAL_TTL: Duration = Duration::from_secs(10);

/// L1 size bound.
const LOCAL_MAX_SIZE: usize = 2048;

/// The fully resolved execution bundle for one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigBundle
{
	/// Template or script text (snapshot when the endpoint is published
	/// against a version).
	pub content: String,

	/// Declared parameter schema.
	pub params: Vec<ParamSpec>,

	/// Per-parameter validation scripts.
	pub validators: Vec<ValidatorSpec>,

	/// Optional result-transform script.
	pub result_transform: Option<String>,

	/// Published SQL macro bodies to prepend for SQL endpoints.
	pub sql_macros: Vec<String>,

	/// Published script macro bodies to prepend for script endpoints and
	/// validators/transforms.
	pub script_macros: Vec<String>,
}

/// Two-tier load-through cache of [`ConfigBundle`]s.
pub struct ConfigCache
{
	store: Store,
	kv: Kv,
	local: Mutex<HashMap<Uuid, (ConfigBundle, Instant)>>,
	shared_ttl: Duration,
}

impl ConfigCache
{
	/// Creates a cache over the configuration store and KV tier.
	pub fn new(store: Store, kv: Kv, shared_ttl: Duration) -> Self
	{
		Self { store, kv, local: Mutex::new(HashMap::new()), shared_ttl }
	}

	/// Returns the bundle for an endpoint, loading and caching on miss.
	///
	/// `Ok(None)` means the endpoint has no stored content at all.
	#[tracing::instrument(level = "debug", skip_all, fields(endpoint.id = %endpoint.id), err(level = "debug"))]
	pub async fn get_or_load(&self, endpoint: &Endpoint)
	-> runtime::Result<Option<ConfigBundle>>
	{
		if let Some(bundle) = self.local_get(endpoint.id) {
			return Ok(Some(bundle));
		}

		if let Some(bundle) = self.shared_get(endpoint.id).await {
			self.local_set(endpoint.id, bundle.clone());
			return Ok(Some(bundle));
		}

		let Some(bundle) = self.load(endpoint).await? else {
			return Ok(None);
		};

		self.local_set(endpoint.id, bundle.clone());
		self.shared_set(endpoint.id, &bundle).await;

		Ok(Some(bundle))
	}

	/// Evicts both tiers for an endpoint.
	pub async fn invalidate(&self, endpoint_id: Uuid)
	{
		self.local.lock().remove(&endpoint_id);

		if let Err(error) = self.kv.del(&cache_key(endpoint_id)).await {
			tracing::debug!(%error, %endpoint_id, "kv invalidate failed");
		}
	}

	/// Loads the bundle from the configuration store.
	async fn load(&self, endpoint: &Endpoint) -> runtime::Result<Option<ConfigBundle>>
	{
		let Some(draft) = self.store.endpoint_content(endpoint.id).await? else {
			return Ok(None);
		};

		let mut content = draft.content;
		let mut params = ParamSpec::parse_list(draft.params.as_ref());
		let mut validators = ValidatorSpec::parse_list(draft.param_validates.as_ref());
		let mut result_transform = draft.result_transform;

		// A published version pins the runtime to its snapshot; the draft
		// only comes back into play after the next publish.
		if let Some(snapshot_id) = endpoint.published_version_id {
			if let Some(snapshot) = self.store.version_snapshot(snapshot_id).await? {
				content = snapshot.content_snapshot;
				params = ParamSpec::parse_list(snapshot.params_snapshot.as_ref());
				validators =
					ValidatorSpec::parse_list(snapshot.param_validates_snapshot.as_ref());
				result_transform = snapshot.result_transform_snapshot;
			}
		}

		let (sql_macros, script_macros) = self.load_macros(endpoint, &content).await?;

		Ok(Some(ConfigBundle {
			content,
			params,
			validators,
			result_transform: result_transform.filter(|script| !script.trim().is_empty()),
			sql_macros,
			script_macros,
		}))
	}

	/// Resolves the macros in scope for the endpoint's module.
	///
	/// An unpublished macro is only an error when the endpoint content
	/// actually references it by whole-word match; unreferenced ones are
	/// silently skipped. Published macro bodies come from their latest
	/// snapshot.
	async fn load_macros(
		&self,
		endpoint: &Endpoint,
		content: &str,
	) -> runtime::Result<(Vec<String>, Vec<String>)>
	{
		let macros = self.store.macros_in_scope(endpoint.module_id).await?;

		let unpublished_referenced = macros
			.iter()
			.filter(|def| !def.is_published && macro_referenced(&def.name, content))
			.map(|def| format!("'{}'", def.name))
			.collect::<Vec<_>>();

		if !unpublished_referenced.is_empty() {
			return Err(runtime::Error::macro_unpublished(unpublished_referenced));
		}

		let mut sql_macros = Vec::new();
		let mut script_macros = Vec::new();

		for def in macros.iter().filter(|def| def.is_published) {
			let Some(body) = self.macro_body(def).await? else {
				continue;
			};

			match def.macro_type {
				MacroKind::SqlMacro => sql_macros.push(body),
				MacroKind::ScriptMacro => script_macros.push(body),
			}
		}

		Ok((sql_macros, script_macros))
	}

	/// The published snapshot body of a macro, if any.
	async fn macro_body(&self, def: &MacroDef) -> runtime::Result<Option<String>>
	{
		let Some(snapshot_id) = def.published_version_id else {
			return Ok(None);
		};

		let snapshot = self.store.macro_snapshot(snapshot_id).await?;

		Ok(snapshot
			.map(|snapshot| snapshot.content_snapshot)
			.filter(|body| !body.trim().is_empty()))
	}

	/// L1 read.
	fn local_get(&self, endpoint_id: Uuid) -> Option<ConfigBundle>
	{
		let local = self.local.lock();
		let (bundle, expires_at) = local.get(&endpoint_id)?;

		if Instant::now() > *expires_at {
			return None;
		}

		Some(bundle.clone())
	}

	/// L1 write with best-effort eviction on overflow.
	fn local_set(&self, endpoint_id: Uuid, bundle: ConfigBundle)
	{
		let mut local = self.local.lock();

		if local.len() >= LOCAL_MAX_SIZE {
			let now = Instant::now();

			local.retain(|_, (_, expires_at)| now <= *expires_at);

			if local.len() >= LOCAL_MAX_SIZE {
				local.clear();
			}
		}

		local.insert(endpoint_id, (bundle, Instant::now() + LOCAL_TTL));
	}

	/// L2 read; errors and unparsable payloads count as misses.
	async fn shared_get(&self, endpoint_id: Uuid) -> Option<ConfigBundle>
	{
		let raw = match self.kv.get(&cache_key(endpoint_id)).await {
			Ok(raw) => raw?,
			Err(error) => {
				tracing::debug!(%error, %endpoint_id, "kv cache get failed");
				return None;
			}
		};

		serde_json::from_str(&raw).ok()
	}

	/// L2 write; failures are logged, never propagated.
	async fn shared_set(&self, endpoint_id: Uuid, bundle: &ConfigBundle)
	{
		let Ok(serialized) = serde_json::to_string(bundle) else {
			return;
		};

		let ttl = self.shared_ttl.as_secs().max(1);

		if let Err(error) = self.kv.set_ex(&cache_key(endpoint_id), &serialized, ttl).await {
			tracing::debug!(%error, %endpoint_id, "kv cache set failed");
		}
	}
}

impl std::fmt::Debug for ConfigCache
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_struct("ConfigCache").field("shared_ttl", &self.shared_ttl).finish_non_exhaustive()
	}
}

/// KV key for one endpoint's bundle.
fn cache_key(endpoint_id: Uuid) -> String
{
	format!("{KEY_PREFIX}{endpoint_id}")
}

/// Whether endpoint content references a macro name as a whole word.
pub fn macro_referenced(name: &str, content: &str) -> bool
{
	if name.is_empty() || content.is_empty() {
		return false;
	}

	let pattern = format!(r"\b{}\b", regex::escape(name));

	regex::Regex::new(&pattern).is_ok_and(|pattern| pattern.is_match(content))
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn whole_word_reference_matching()
	{
		assert!(macro_referenced("fmt_date", "SELECT fmt_date(created_at) FROM t"));
		assert!(macro_referenced("fmt_date", "fmt_date"));
		assert!(!macro_referenced("fmt_date", "SELECT fmt_dates(created_at)"));
		assert!(!macro_referenced("fmt_date", "SELECT my_fmt_date(x)"));
		assert!(!macro_referenced("fmt_date", ""));
		assert!(!macro_referenced("", "anything"));
	}

	#[test]
	fn reference_matching_handles_regex_metacharacters()
	{
		// A name that is not a clean identifier must not break the matcher.
		assert!(!macro_referenced("a+b", "SELECT aab"));
	}
}
