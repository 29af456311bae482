//! The context namespace injected into endpoint scripts.
//!
//! Scripts see a fixed set of objects: `db` (queries against the endpoint's
//! datasource), `tx` (explicit transaction control over a pinned
//! connection), `http` (outbound calls), `cache` (shared KV with a script
//! namespace), `env` (whitelisted configuration), `log` (structured
//! logging), `req` (the coerced parameters), and `ds` (datasource metadata
//! without credentials).
//!
//! Script execution happens on a blocking worker thread; the context
//! bridges back into the async runtime with [`Handle::block_on`] for every
//! DB, HTTP, and KV round-trip.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rhai::{Dynamic, Engine};
use serde_json::Value as JsonValue;
use tokio::runtime::Handle;

use super::sandbox::runtime_error;
use crate::database::Datasource;
use crate::kv::Kv;
use crate::pool::{ExternalConnection, Manager};
use crate::runtime::Config;

/// Key prefix separating script cache entries from the gateway's own.
const CACHE_KEY_PREFIX: &str = "script:";

/// Default timeout for outbound HTTP calls from scripts.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration keys scripts may read through `env`.
const ENV_WHITELIST: &[&str] =
	&["EXTERNAL_DB_POOL_SIZE", "EXTERNAL_DB_CONNECT_TIMEOUT", "CACHE_ENABLED"];

/// Connection state shared between `db` and `tx`.
#[derive(Default)]
struct ConnState
{
	/// Set while a transaction is open (and kept until script end); all
	/// `db` calls then share this connection.
	pinned: Option<ExternalConnection>,

	in_tx: bool,
}

#[allow(clippy::missing_docs_in_private_items)]
struct Shared
{
	datasource: Datasource,
	manager: Arc<Manager>,
	kv: Kv,
	handle: Handle,
	http_client: reqwest::Client,
	http_allowed_hosts: Vec<String>,
	env_values: HashMap<String, String>,
	req: JsonValue,
	close_after_execute: bool,
	conn: Mutex<ConnState>,
}

/// Everything a script execution needs, cheap to clone into the registered
/// API objects.
#[derive(Clone)]
pub struct ScriptContext
{
	shared: Arc<Shared>,
}

impl ScriptContext
{
	/// Builds a context for one script execution.
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		datasource: Datasource,
		req: JsonValue,
		manager: Arc<Manager>,
		kv: Kv,
		http_client: reqwest::Client,
		config: &Config,
		handle: Handle,
		close_after_execute: bool,
	) -> Self
	{
		let env_values = ENV_WHITELIST
			.iter()
			.filter_map(|&key| {
				let value = match key {
					"EXTERNAL_DB_POOL_SIZE" => config.pool_size().to_string(),
					"EXTERNAL_DB_CONNECT_TIMEOUT" => {
						config.connect_timeout().as_secs().to_string()
					}
					"CACHE_ENABLED" => config.cache_enabled().to_string(),
					_ => return None,
				};

				Some((key.to_owned(), value))
			})
			.collect();

		Self {
			shared: Arc::new(Shared {
				datasource,
				manager,
				kv,
				handle,
				http_client,
				http_allowed_hosts: config.script_http_allowed_hosts().to_vec(),
				env_values,
				req,
				close_after_execute,
				conn: Mutex::new(ConnState::default()),
			}),
		}
	}

	/// The coerced request parameters as a script value.
	pub(crate) fn req_dynamic(&self) -> Dynamic
	{
		rhai::serde::to_dynamic(&self.shared.req).unwrap_or(Dynamic::UNIT)
	}

	/// Registers the context API types and exposes the context objects as
	/// global constants (so they are visible inside script functions).
	pub(crate) fn register(&self, engine: &mut Engine)
	{
		engine.register_type_with_name::<DbApi>("Db");
		engine.register_fn("query", |db: &mut DbApi, sql: &str| db.query(sql, rhai::Array::new()));
		engine.register_fn("query", DbApi::query);
		engine.register_fn("query_one", |db: &mut DbApi, sql: &str| {
			db.query_one(sql, rhai::Array::new())
		});
		engine.register_fn("query_one", DbApi::query_one);
		engine.register_fn("execute", |db: &mut DbApi, sql: &str| {
			db.execute(sql, rhai::Array::new())
		});
		engine.register_fn("execute", DbApi::execute);

		// insert/update/delete are aliases of execute.
		for alias in ["insert", "update", "delete"] {
			engine.register_fn(alias, |db: &mut DbApi, sql: &str| {
				db.execute(sql, rhai::Array::new())
			});
			engine.register_fn(alias, DbApi::execute);
		}

		engine.register_type_with_name::<TxApi>("Tx");
		engine.register_fn("begin", TxApi::begin);
		engine.register_fn("commit", TxApi::commit);
		engine.register_fn("rollback", TxApi::rollback);

		engine.register_type_with_name::<HttpApi>("Http");

		for method in ["get", "post", "put", "delete"] {
			engine.register_fn(method, move |http: &mut HttpApi, url: &str| {
				http.request(method, url, rhai::Map::new())
			});

			engine.register_fn(
				method,
				move |http: &mut HttpApi, url: &str, options: rhai::Map| {
					http.request(method, url, options)
				},
			);
		}

		engine.register_type_with_name::<CacheApi>("Cache");
		engine.register_fn("get", CacheApi::get);
		engine.register_fn("set", |cache: &mut CacheApi, key: &str, value: Dynamic| {
			cache.set(key, value, 0)
		});
		engine.register_fn("set", CacheApi::set);
		engine.register_fn("delete", CacheApi::delete);
		engine.register_fn("exists", CacheApi::exists);
		engine.register_fn("incr", |cache: &mut CacheApi, key: &str| cache.incr(key, 1));
		engine.register_fn("incr", CacheApi::incr);
		engine.register_fn("decr", |cache: &mut CacheApi, key: &str| cache.decr(key, 1));
		engine.register_fn("decr", CacheApi::decr);

		engine.register_type_with_name::<EnvApi>("Env");
		engine.register_fn("get", |env: &mut EnvApi, key: &str| env.get(key, Dynamic::UNIT));
		engine.register_fn("get", EnvApi::get);
		engine.register_fn("get_int", |env: &mut EnvApi, key: &str| env.get_int(key, 0));
		engine.register_fn("get_int", EnvApi::get_int);
		engine.register_fn("get_bool", |env: &mut EnvApi, key: &str| env.get_bool(key, false));
		engine.register_fn("get_bool", EnvApi::get_bool);

		engine.register_type_with_name::<LogApi>("Log");
		engine.register_fn("info", LogApi::info);
		engine.register_fn("warn", LogApi::warn);
		engine.register_fn("error", LogApi::error);
		engine.register_fn("debug", LogApi::debug);

		let mut module = rhai::Module::new();

		module.set_var("db", Dynamic::from(DbApi { shared: Arc::clone(&self.shared) }));
		module.set_var("tx", Dynamic::from(TxApi { shared: Arc::clone(&self.shared) }));
		module.set_var("http", Dynamic::from(HttpApi { shared: Arc::clone(&self.shared) }));
		module.set_var("cache", Dynamic::from(CacheApi { shared: Arc::clone(&self.shared) }));
		module.set_var("env", Dynamic::from(EnvApi { shared: Arc::clone(&self.shared) }));
		module.set_var("log", Dynamic::from(LogApi));
		module.set_var("req", self.req_dynamic());
		module.set_var("ds", self.ds_dynamic());

		engine.register_global_module(module.into());
	}

	/// Datasource metadata exposed to scripts. No credentials.
	fn ds_dynamic(&self) -> Dynamic
	{
		let datasource = &self.shared.datasource;
		let metadata = serde_json::json!({
			"id": datasource.id.to_string(),
			"name": datasource.name,
			"product_type": datasource.kind.as_str(),
			"host": datasource.host,
			"port": datasource.port,
			"database": datasource.database,
		});

		rhai::serde::to_dynamic(&metadata).unwrap_or(Dynamic::UNIT)
	}

	/// Releases the pinned connection, rolling back first if a transaction
	/// is still open. Must run on every script exit.
	pub(crate) fn release(&self)
	{
		let (pinned, in_tx) = {
			let mut state = self.shared.conn.lock();
			let pinned = state.pinned.take();
			let in_tx = state.in_tx;

			state.in_tx = false;
			(pinned, in_tx)
		};

		let Some(mut conn) = pinned else {
			return;
		};

		let shared = &self.shared;

		shared.handle.block_on(async {
			if in_tx {
				if let Err(error) = conn.rollback().await {
					tracing::warn!(%error, "rollback on script exit failed");
				}
			}

			if shared.close_after_execute {
				conn.close().await;
			} else {
				shared.manager.release(conn, shared.datasource.id).await;
			}
		});
	}
}

impl std::fmt::Debug for ScriptContext
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_struct("ScriptContext")
			.field("datasource.id", &self.shared.datasource.id)
			.finish_non_exhaustive()
	}
}

/// Takes the pinned connection if one exists, otherwise acquires from the
/// pool. Returns the connection and whether it was pinned.
async fn take_connection(shared: &Shared) -> Result<(ExternalConnection, bool), String>
{
	let pinned = shared.conn.lock().pinned.take();

	if let Some(conn) = pinned {
		return Ok((conn, true));
	}

	shared
		.manager
		.acquire(&shared.datasource)
		.await
		.map(|conn| (conn, false))
		.map_err(|error| error.to_string())
}

/// Returns a connection after one `db` call: pinned connections go back to
/// the pin, others are released or closed per the endpoint flag.
async fn restore_connection(shared: &Shared, conn: ExternalConnection, was_pinned: bool)
{
	if was_pinned {
		shared.conn.lock().pinned = Some(conn);
		return;
	}

	if shared.close_after_execute {
		conn.close().await;
	} else {
		shared.manager.release(conn, shared.datasource.id).await;
	}
}

/// Converts script call arguments to JSON for parameter binding.
fn params_to_json(params: rhai::Array) -> Vec<JsonValue>
{
	params
		.iter()
		.map(|value| rhai::serde::from_dynamic::<JsonValue>(value).unwrap_or(JsonValue::Null))
		.collect()
}

/// The `db` object.
#[derive(Clone)]
pub(crate) struct DbApi
{
	shared: Arc<Shared>,
}

impl DbApi
{
	/// `db.query(sql, params?)` - rows as an array of maps.
	fn query(&mut self, sql: &str, params: rhai::Array) -> Result<Dynamic, Box<rhai::EvalAltResult>>
	{
		let rows = self.fetch(sql, params)?;

		rhai::serde::to_dynamic(&rows).map_err(|error| runtime_error(error.to_string()))
	}

	/// `db.query_one(sql, params?)` - first row or unit.
	fn query_one(
		&mut self,
		sql: &str,
		params: rhai::Array,
	) -> Result<Dynamic, Box<rhai::EvalAltResult>>
	{
		let rows = self.fetch(sql, params)?;

		match rows.into_iter().next() {
			None => Ok(Dynamic::UNIT),
			Some(row) => {
				rhai::serde::to_dynamic(&row).map_err(|error| runtime_error(error.to_string()))
			}
		}
	}

	/// `db.execute(sql, params?)` - affected rows.
	fn execute(&mut self, sql: &str, params: rhai::Array) -> Result<i64, Box<rhai::EvalAltResult>>
	{
		let shared = Arc::clone(&self.shared);
		let sql = sql.to_owned();
		let params = params_to_json(params);

		shared.handle.clone().block_on(async move {
			let (mut conn, was_pinned) =
				take_connection(&shared).await.map_err(runtime_error)?;

			let result = conn
				.execute_with_params(&sql, &params, shared.manager.statement_timeout())
				.await;

			restore_connection(&shared, conn, was_pinned).await;

			result
				.map(|affected| i64::try_from(affected).unwrap_or(i64::MAX))
				.map_err(|error| runtime_error(error.to_string()))
		})
	}

	/// Shared row-fetch path for `query`/`query_one`.
	fn fetch(
		&mut self,
		sql: &str,
		params: rhai::Array,
	) -> Result<Vec<JsonValue>, Box<rhai::EvalAltResult>>
	{
		let shared = Arc::clone(&self.shared);
		let sql = sql.to_owned();
		let params = params_to_json(params);

		shared.handle.clone().block_on(async move {
			let (mut conn, was_pinned) =
				take_connection(&shared).await.map_err(runtime_error)?;

			let result = conn
				.query_with_params(&sql, &params, shared.manager.statement_timeout())
				.await;

			restore_connection(&shared, conn, was_pinned).await;

			result.map_err(|error| runtime_error(error.to_string()))
		})
	}
}

/// The `tx` object.
#[derive(Clone)]
pub(crate) struct TxApi
{
	shared: Arc<Shared>,
}

impl TxApi
{
	/// `tx.begin()` - pins a connection and opens a transaction.
	fn begin(&mut self) -> Result<(), Box<rhai::EvalAltResult>>
	{
		let shared = Arc::clone(&self.shared);

		shared.handle.clone().block_on(async move {
			if shared.conn.lock().in_tx {
				return Ok(());
			}

			let mut conn = match shared.conn.lock().pinned.take() {
				Some(conn) => conn,
				None => {
					shared
						.manager
						.acquire(&shared.datasource)
						.await
						.map_err(|error| runtime_error(error.to_string()))?
				}
			};

			let begun = conn.begin().await;

			let mut state = shared.conn.lock();

			state.pinned = Some(conn);

			match begun {
				Ok(()) => {
					state.in_tx = true;
					Ok(())
				}
				Err(error) => Err(runtime_error(error.to_string())),
			}
		})
	}

	/// `tx.commit()` - commits the open transaction.
	fn commit(&mut self) -> Result<(), Box<rhai::EvalAltResult>>
	{
		self.finish(true)
	}

	/// `tx.rollback()` - rolls back the open transaction.
	fn rollback(&mut self) -> Result<(), Box<rhai::EvalAltResult>>
	{
		self.finish(false)
	}

	/// Ends the transaction; the connection stays pinned until script end.
	fn finish(&mut self, commit: bool) -> Result<(), Box<rhai::EvalAltResult>>
	{
		let shared = Arc::clone(&self.shared);

		shared.handle.clone().block_on(async move {
			let Some(mut conn) = shared.conn.lock().pinned.take() else {
				return Ok(());
			};

			let result = if commit { conn.commit().await } else { conn.rollback().await };

			let mut state = shared.conn.lock();

			state.pinned = Some(conn);
			state.in_tx = false;

			result.map_err(|error| runtime_error(error.to_string()))
		})
	}
}

/// The `http` object.
#[derive(Clone)]
pub(crate) struct HttpApi
{
	shared: Arc<Shared>,
}

impl HttpApi
{
	/// Performs one outbound request.
	fn request(
		&mut self,
		method: &str,
		url: &str,
		options: rhai::Map,
	) -> Result<Dynamic, Box<rhai::EvalAltResult>>
	{
		let shared = Arc::clone(&self.shared);

		let parsed = url::Url::parse(url).map_err(|error| runtime_error(error.to_string()))?;

		if !shared.http_allowed_hosts.is_empty() {
			let host = parsed.host_str().unwrap_or_default().to_lowercase();

			if !shared.http_allowed_hosts.iter().any(|allowed| *allowed == host) {
				return Err(runtime_error(format!("host '{host}' is not allowed")));
			}
		}

		let method: reqwest::Method =
			method.to_uppercase().parse().map_err(|_| runtime_error("invalid method"))?;

		let mut request =
			shared.http_client.request(method, parsed).timeout(HTTP_TIMEOUT);

		for (key, value) in &options {
			match key.as_str() {
				"headers" => {
					if let Some(map) = value.read_lock::<rhai::Map>() {
						for (name, header_value) in map.iter() {
							request = request.header(name.as_str(), header_value.to_string());
						}
					}
				}
				"query" => {
					let pairs =
						rhai::serde::from_dynamic::<HashMap<String, JsonValue>>(value)
							.unwrap_or_default();

					request = request.query(&pairs);
				}
				"json" => {
					let body = rhai::serde::from_dynamic::<JsonValue>(value)
						.unwrap_or(JsonValue::Null);

					request = request.json(&body);
				}
				"body" => {
					request = request.body(value.to_string());
				}
				other => {
					return Err(runtime_error(format!("unknown http option '{other}'")));
				}
			}
		}

		shared.handle.clone().block_on(async move {
			let response = request.send().await.map_err(|error| {
				if error.is_timeout() {
					runtime_error("http request timed out")
				} else {
					runtime_error(error.to_string())
				}
			})?;

			let status = response.status();

			if !status.is_success() {
				return Err(runtime_error(format!("http request failed with {status}")));
			}

			let is_json = response
				.headers()
				.get(reqwest::header::CONTENT_TYPE)
				.and_then(|value| value.to_str().ok())
				.is_some_and(|value| value.contains("application/json"));

			if is_json {
				let body = response
					.json::<JsonValue>()
					.await
					.map_err(|error| runtime_error(error.to_string()))?;

				return rhai::serde::to_dynamic(&body)
					.map_err(|error| runtime_error(error.to_string()));
			}

			response
				.text()
				.await
				.map(Dynamic::from)
				.map_err(|error| runtime_error(error.to_string()))
		})
	}
}

/// The `cache` object. All operations are no-ops when the KV store is
/// unavailable.
#[derive(Clone)]
pub(crate) struct CacheApi
{
	shared: Arc<Shared>,
}

impl CacheApi
{
	fn key(key: &str) -> String
	{
		format!("{CACHE_KEY_PREFIX}{key}")
	}

	fn get(&mut self, key: &str) -> Dynamic
	{
		let shared = &self.shared;
		let key = Self::key(key);

		shared
			.handle
			.clone()
			.block_on(async { shared.kv.get(&key).await })
			.ok()
			.flatten()
			.map_or(Dynamic::UNIT, Dynamic::from)
	}

	fn set(&mut self, key: &str, value: Dynamic, ttl_seconds: i64)
	{
		// No TTL requested: a year is close enough to forever.
		const DEFAULT_TTL: u64 = 365 * 24 * 60 * 60;

		let shared = &self.shared;
		let key = Self::key(key);
		let value = value.to_string();
		let ttl = u64::try_from(ttl_seconds).ok().filter(|&ttl| ttl > 0).unwrap_or(DEFAULT_TTL);

		let _ = shared
			.handle
			.clone()
			.block_on(async { shared.kv.set_ex(&key, &value, ttl).await });
	}

	fn delete(&mut self, key: &str)
	{
		let shared = &self.shared;
		let key = Self::key(key);

		let _ = shared.handle.clone().block_on(async { shared.kv.del(&key).await });
	}

	fn exists(&mut self, key: &str) -> bool
	{
		let shared = &self.shared;
		let key = Self::key(key);

		shared
			.handle
			.clone()
			.block_on(async { shared.kv.exists(&key).await })
			.unwrap_or(false)
	}

	fn incr(&mut self, key: &str, amount: i64) -> i64
	{
		let shared = &self.shared;
		let key = Self::key(key);

		shared
			.handle
			.clone()
			.block_on(async { shared.kv.incr(&key, amount).await })
			.unwrap_or(0)
	}

	fn decr(&mut self, key: &str, amount: i64) -> i64
	{
		let shared = &self.shared;
		let key = Self::key(key);

		shared
			.handle
			.clone()
			.block_on(async { shared.kv.decr(&key, amount).await })
			.unwrap_or(0)
	}
}

/// The `env` object. Only whitelisted keys are readable.
#[derive(Clone)]
pub(crate) struct EnvApi
{
	shared: Arc<Shared>,
}

impl EnvApi
{
	fn raw(&self, key: &str) -> Option<String>
	{
		if !ENV_WHITELIST.contains(&key) {
			return None;
		}

		self.shared
			.env_values
			.get(key)
			.cloned()
			.or_else(|| std::env::var(key).ok())
	}

	fn get(&mut self, key: &str, default: Dynamic) -> Dynamic
	{
		self.raw(key).map_or(default, Dynamic::from)
	}

	fn get_int(&mut self, key: &str, default: i64) -> i64
	{
		self.raw(key).and_then(|value| value.trim().parse().ok()).unwrap_or(default)
	}

	fn get_bool(&mut self, key: &str, default: bool) -> bool
	{
		self.raw(key).map_or(default, |value| {
			matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on")
		})
	}
}

/// The `log` object: structured logging passthrough.
#[derive(Clone)]
pub(crate) struct LogApi;

impl LogApi
{
	fn info(&mut self, message: &str)
	{
		tracing::info!(target: "dbgate::script", "{message}");
	}

	fn warn(&mut self, message: &str)
	{
		tracing::warn!(target: "dbgate::script", "{message}");
	}

	fn error(&mut self, message: &str)
	{
		tracing::error!(target: "dbgate::script", "{message}");
	}

	fn debug(&mut self, message: &str)
	{
		tracing::debug!(target: "dbgate::script", "{message}");
	}
}
