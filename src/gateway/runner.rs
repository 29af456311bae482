//! Request execution.
//!
//! The runner takes a resolved endpoint and the raw request pieces and
//! drives them end to end: bundle lookup, parameter binding/coercion/
//! validation, macro prepending, engine dispatch, result transform. An
//! access record is written on every exit path with the resulting status
//! and duration, success or not.

use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderMap;
use serde_json::{Map as JsonMap, Value as JsonValue};
use time::OffsetDateTime;
use tokio::runtime::Handle;
use uuid::Uuid;

use super::config_cache::{ConfigBundle, ConfigCache};
use super::params::{self, BoundParams};
use super::resolver::PathVariables;
use crate::access_log;
use crate::database::{AccessRecord, Datasource, Endpoint, EngineKind, Store};
use crate::engines::{script, sql};
use crate::kv::Kv;
use crate::pool;
use crate::runtime::{self, Config};

/// Request metadata carried through for the access record.
#[derive(Debug, Clone)]
pub struct RequestMeta
{
	/// Row id of the authenticated client, if any.
	pub client_ref: Option<Uuid>,

	pub ip: String,
	pub method: String,
	pub path: String,

	/// Request headers pre-serialized as JSON.
	pub headers_json: Option<String>,
}

/// Executes dispatched requests.
pub struct Runner
{
	store: Store,
	cache: Arc<ConfigCache>,
	pool: Arc<pool::Manager>,
	kv: Kv,
	config: Config,
	http_client: reqwest::Client,
	access_log: Arc<access_log::Writer>,
	template: sql::TemplateEngine,
}

impl Runner
{
	/// Creates a runner.
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		store: Store,
		cache: Arc<ConfigCache>,
		pool: Arc<pool::Manager>,
		kv: Kv,
		config: Config,
		http_client: reqwest::Client,
		access_log: Arc<access_log::Writer>,
	) -> Self
	{
		Self {
			store,
			cache,
			pool,
			kv,
			config,
			http_client,
			access_log,
			template: sql::TemplateEngine::new(),
		}
	}

	/// Runs one dispatched request and returns the raw engine result.
	///
	/// The access record is emitted here regardless of outcome, before any
	/// error propagates to the dispatcher.
	#[tracing::instrument(level = "debug", skip_all, fields(endpoint.id = %endpoint.id), err(level = "debug"))]
	pub async fn run(
		&self,
		endpoint: &Endpoint,
		path_variables: &PathVariables,
		query_string: Option<&str>,
		headers: &HeaderMap,
		body: &[u8],
		meta: RequestMeta,
	) -> runtime::Result<JsonValue>
	{
		let started = Instant::now();
		let mut body_for_log = None;
		let mut params_json = None;

		let outcome = self
			.run_inner(
				endpoint,
				path_variables,
				query_string,
				headers,
				body,
				&mut body_for_log,
				&mut params_json,
			)
			.await;

		let status_code = match &outcome {
			Ok(_) => 200,
			Err(error) => i32::from(error.status().as_u16()),
		};

		let record = AccessRecord {
			id: Uuid::new_v4(),
			api_assignment_id: Some(endpoint.id),
			app_client_id: meta.client_ref,
			ip_address: if meta.ip.is_empty() { String::from("0.0.0.0") } else { meta.ip },
			http_method: meta.method,
			path: meta.path,
			status_code,
			request_body: if self.config.access_log_body() { body_for_log } else { None },
			request_headers: meta.headers_json,
			request_params: params_json,
			created_at: OffsetDateTime::now_utc(),
			duration_ms: i32::try_from(started.elapsed().as_millis()).ok(),
		};

		self.access_log.write(record).await;

		outcome
	}

	/// The fallible part of [`run`].
	///
	/// [`run`]: Self::run
	#[allow(clippy::too_many_arguments)]
	async fn run_inner(
		&self,
		endpoint: &Endpoint,
		path_variables: &PathVariables,
		query_string: Option<&str>,
		headers: &HeaderMap,
		body: &[u8],
		body_for_log: &mut Option<String>,
		params_json: &mut Option<String>,
	) -> runtime::Result<JsonValue>
	{
		let Some(bundle) = self.cache.get_or_load(endpoint).await? else {
			return Err(runtime::Error::unhandled("endpoint has no stored content"));
		};

		let BoundParams { params, body_for_log: bound_body } =
			params::bind(path_variables, query_string, headers, body, &bundle.params).await;

		*body_for_log = bound_body;

		let params = params::coerce(&bundle.params, params)?;

		params::check_required(&bundle.params, &params)?;
		params::run_validators(
			&bundle.validators,
			&params,
			&bundle.script_macros,
			self.config.script_timeout(),
		)?;

		*params_json = serde_json::to_string(&params).ok();

		let datasource = self.load_datasource(endpoint).await?;

		let result = match endpoint.execute_engine {
			EngineKind::Sql => {
				self.run_sql(endpoint, &bundle, &params, &datasource).await?
			}
			EngineKind::Script => {
				self.run_script(endpoint, &bundle, &params, &datasource).await?
			}
		};

		let Some(transform) = bundle.result_transform.as_deref() else {
			return Ok(result);
		};

		self.run_transform(transform, &bundle, result, &params).await
	}

	/// Loads and checks the endpoint's datasource.
	async fn load_datasource(&self, endpoint: &Endpoint) -> runtime::Result<Datasource>
	{
		let Some(datasource_id) = endpoint.datasource_id else {
			return Err(runtime::Error::unhandled("endpoint has no datasource bound"));
		};

		let Some(datasource) = self.store.datasource(datasource_id).await? else {
			return Err(runtime::Error::unhandled("bound datasource does not exist"));
		};

		if !datasource.is_active {
			return Err(runtime::Error::datasource_inactive());
		}

		Ok(datasource)
	}

	/// SQL path: prepend macros, render, execute.
	async fn run_sql(
		&self,
		endpoint: &Endpoint,
		bundle: &ConfigBundle,
		params: &JsonMap<String, JsonValue>,
		datasource: &Datasource,
	) -> runtime::Result<JsonValue>
	{
		let content = prepend_macros(&bundle.sql_macros, &bundle.content);
		let sql = self
			.template
			.render(&content, params)
			.map_err(|error| runtime::Error::render_failed(error.to_string()))?;

		tracing::debug!(target: "dbgate::engines", rendered = %sql, "rendered sql");

		let use_pool = !close_after_execute(endpoint, datasource);
		let output = sql::execute_sql(&self.pool, datasource, &sql, use_pool).await?;

		Ok(serde_json::json!({ "data": output.into_data() }))
	}

	/// Script path: prepend macros, execute in the sandbox on a blocking
	/// worker.
	async fn run_script(
		&self,
		endpoint: &Endpoint,
		bundle: &ConfigBundle,
		params: &JsonMap<String, JsonValue>,
		datasource: &Datasource,
	) -> runtime::Result<JsonValue>
	{
		let content = prepend_macros(&bundle.script_macros, &bundle.content);
		let context = script::ScriptContext::new(
			datasource.clone(),
			JsonValue::Object(params.clone()),
			Arc::clone(&self.pool),
			self.kv.clone(),
			self.http_client.clone(),
			&self.config,
			Handle::current(),
			close_after_execute(endpoint, datasource),
		);

		let timeout = self.config.script_timeout();
		let extra_modules = self.config.script_extra_modules().to_vec();

		let value = tokio::task::spawn_blocking(move || {
			script::execute_endpoint_script(&content, &context, timeout, &extra_modules)
		})
		.await
		.map_err(|error| runtime::Error::unhandled(error.to_string()))??;

		Ok(serde_json::json!({ "data": value }))
	}

	/// Runs the result transform with script macros prepended.
	async fn run_transform(
		&self,
		transform: &str,
		bundle: &ConfigBundle,
		result: JsonValue,
		params: &JsonMap<String, JsonValue>,
	) -> runtime::Result<JsonValue>
	{
		let script = prepend_macros(&bundle.script_macros, transform);
		let params = JsonValue::Object(params.clone());
		let timeout = self.config.script_timeout();

		tokio::task::spawn_blocking(move || {
			script::run_transform_script(&script, &result, &params, timeout)
		})
		.await
		.map_err(|error| runtime::Error::unhandled(error.to_string()))?
		.map_err(|error| runtime::Error::transform_failed(error.to_string()))
	}
}

impl std::fmt::Debug for Runner
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_tuple("Runner").finish_non_exhaustive()
	}
}

/// Joins macro bodies ahead of the endpoint content.
fn prepend_macros(macros: &[String], content: &str) -> String
{
	if macros.is_empty() {
		return content.to_owned();
	}

	format!("{}\n\n{content}", macros.join("\n\n"))
}

/// Whether the idle pool must be bypassed for this execution.
fn close_after_execute(endpoint: &Endpoint, datasource: &Datasource) -> bool
{
	endpoint.close_connection_after_execute || datasource.close_connection_after_execute
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn macros_are_prepended_in_order()
	{
		let macros = vec![String::from("m1"), String::from("m2")];

		assert_eq!(prepend_macros(&macros, "content"), "m1\n\nm2\n\ncontent");
		assert_eq!(prepend_macros(&[], "content"), "content");
	}
}
