//! Runtime configuration for the gateway.
//!
//! This module contains the [`Config`] struct - a set of configuration options
//! that will be read from the environment on startup. See the `.env.example`
//! file in the root of the repository for examples.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use std::{env, fmt};

use thiserror::Error;
use url::Url;

/// The gateway's runtime configuration.
///
/// See [module level docs] for more details.
///
/// [module level docs]: crate::runtime::config
#[derive(Clone)]
pub struct Config
{
	/// [`Inner`] actually contains all the values, we just wrap it so
	/// [`Config`] is cheap to clone.
	inner: Arc<Inner>,
}

/// Error that can occur while initializing the gateway's [`Config`].
#[derive(Debug, Error)]
pub enum InitializeConfigError
{
	/// A required environment variable was not found or invalid UTF-8.
	#[error("failed to read configuration value: {0}")]
	Env(#[from] env::VarError),

	/// A required configuration option was empty.
	#[error("`{0}` cannot be empty")]
	EmptyValue(&'static str),

	/// A configuration option could not be parsed into the required type.
	#[error("failed to parse `{var}`: {error}")]
	Parse
	{
		/// The variable that failed to parse.
		var: &'static str,

		/// The underlying parse error.
		error: Box<dyn std::error::Error + Send + Sync + 'static>,
	},
}

impl Config
{
	/// Initializes a [`Config`] by reading and parsing environment variables.
	pub fn new() -> Result<Self, InitializeConfigError>
	{
		let database_url = parse_from_env::<Url>("DATABASE_URL")?;
		let secret_key = parse_from_env::<String>("SECRET_KEY")?;

		let jwt_expire_seconds =
			parse_from_env_or("GATEWAY_JWT_EXPIRE_SECONDS", 3600_u64)?;
		let x_api_key_enabled =
			parse_from_env_or("GATEWAY_AUTH_X_API_KEY_ENABLED", true)?;
		let access_log_body = parse_from_env_or("GATEWAY_ACCESS_LOG_BODY", true)?;
		let config_cache_ttl =
			parse_from_env_or("GATEWAY_CONFIG_CACHE_TTL_SECONDS", 300_u64)?;
		let firewall_default_allow =
			parse_from_env_or("GATEWAY_FIREWALL_DEFAULT_ALLOW", true)?;

		let rate_limit_enabled =
			parse_from_env_or("FLOW_CONTROL_RATE_LIMIT_ENABLED", true)?;
		let default_rate_limit_per_minute =
			parse_from_env_or("FLOW_CONTROL_RATE_LIMIT_PER_MINUTE", 0_u32)?;
		let max_concurrent_per_client =
			parse_from_env_or("FLOW_CONTROL_MAX_CONCURRENT_PER_CLIENT", 0_u32)?;

		let pool_size = parse_from_env_or("EXTERNAL_DB_POOL_SIZE", 8_usize)?;
		let pool_max_age =
			Duration::from_secs(parse_from_env_or("EXTERNAL_DB_POOL_MAX_AGE_SEC", 600_u64)?);
		let connect_timeout =
			Duration::from_secs(parse_from_env_or("EXTERNAL_DB_CONNECT_TIMEOUT", 10_u64)?);
		let statement_timeout = parse_from_env_opt::<u64>("EXTERNAL_DB_STATEMENT_TIMEOUT")?
			.filter(|&secs| secs > 0)
			.map(Duration::from_secs);

		let script_timeout = parse_from_env_opt::<u64>("SCRIPT_EXEC_TIMEOUT")?
			.filter(|&secs| secs > 0)
			.map(Duration::from_secs);
		let script_extra_modules = parse_name_list("SCRIPT_EXTRA_MODULES")?;
		let script_http_allowed_hosts = parse_name_list("SCRIPT_HTTP_ALLOWED_HOSTS")?
			.into_iter()
			.map(|host| host.to_lowercase())
			.collect();

		let cache_enabled = parse_from_env_or("CACHE_ENABLED", true)?;
		let redis_url = parse_from_env_opt::<Url>("REDIS_URL")?;

		Ok(Self {
			inner: Arc::new(Inner {
				database_url,
				secret_key,
				jwt_expire_seconds,
				x_api_key_enabled,
				access_log_body,
				config_cache_ttl,
				firewall_default_allow,
				rate_limit_enabled,
				default_rate_limit_per_minute,
				max_concurrent_per_client,
				pool_size,
				pool_max_age,
				connect_timeout,
				statement_timeout,
				script_timeout,
				script_extra_modules,
				script_http_allowed_hosts,
				cache_enabled,
				redis_url,
			}),
		})
	}

	/// Returns the URL of the gateway's main configuration store.
	pub fn database_url(&self) -> &Url
	{
		&self.inner.database_url
	}

	/// Returns the process secret used for JWT signing and field encryption.
	pub fn secret_key(&self) -> &str
	{
		&self.inner.secret_key
	}

	/// Returns the lifetime of issued gateway JWTs, in seconds.
	pub fn jwt_expire_seconds(&self) -> u64
	{
		self.inner.jwt_expire_seconds
	}

	/// Whether `X-API-Key` authentication is accepted.
	pub fn x_api_key_enabled(&self) -> bool
	{
		self.inner.x_api_key_enabled
	}

	/// Whether request bodies are captured in access records.
	pub fn access_log_body(&self) -> bool
	{
		self.inner.access_log_body
	}

	/// Returns the shared-tier TTL for cached endpoint configuration.
	pub fn config_cache_ttl(&self) -> Duration
	{
		Duration::from_secs(self.inner.config_cache_ttl.max(1))
	}

	/// Whether requests matching no firewall rule are admitted.
	pub fn firewall_default_allow(&self) -> bool
	{
		self.inner.firewall_default_allow
	}

	/// Whether rate limiting is enabled at all (kill switch).
	pub fn rate_limit_enabled(&self) -> bool
	{
		self.inner.rate_limit_enabled
	}

	/// Returns the default requests-per-minute limit (0 = no limit).
	pub fn default_rate_limit_per_minute(&self) -> u32
	{
		self.inner.default_rate_limit_per_minute
	}

	/// Returns the global per-client concurrency limit (0 = no limit).
	pub fn max_concurrent_per_client(&self) -> u32
	{
		self.inner.max_concurrent_per_client
	}

	/// Returns the maximum number of idle connections kept per datasource.
	pub fn pool_size(&self) -> usize
	{
		self.inner.pool_size
	}

	/// Returns the maximum age of a pooled connection before eviction.
	pub fn pool_max_age(&self) -> Duration
	{
		self.inner.pool_max_age
	}

	/// Returns the connect timeout for external datasources.
	pub fn connect_timeout(&self) -> Duration
	{
		self.inner.connect_timeout
	}

	/// Returns the per-statement timeout for external datasources, if any.
	pub fn statement_timeout(&self) -> Option<Duration>
	{
		self.inner.statement_timeout
	}

	/// Returns the wall-clock timeout for script execution, if any.
	pub fn script_timeout(&self) -> Option<Duration>
	{
		self.inner.script_timeout
	}

	/// Returns the names of extra packages exposed to scripts.
	pub fn script_extra_modules(&self) -> &[String]
	{
		&self.inner.script_extra_modules
	}

	/// Returns the allow-list of hosts scripts may reach over HTTP.
	///
	/// An empty list means any host is allowed.
	pub fn script_http_allowed_hosts(&self) -> &[String]
	{
		&self.inner.script_http_allowed_hosts
	}

	/// Whether the shared KV store should be used at all.
	pub fn cache_enabled(&self) -> bool
	{
		self.inner.cache_enabled
	}

	/// Returns the URL of the shared KV store, if configured.
	pub fn redis_url(&self) -> Option<&Url>
	{
		self.inner.redis_url.as_ref()
	}
}

impl fmt::Debug for Config
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
	{
		f.debug_struct("Config")
			.field("database_url", &format_args!("{:?}", self.database_url().as_str()))
			.field("jwt_expire_seconds", &self.jwt_expire_seconds())
			.field("x_api_key_enabled", &self.x_api_key_enabled())
			.field("access_log_body", &self.access_log_body())
			.field("config_cache_ttl", &self.config_cache_ttl())
			.field("firewall_default_allow", &self.firewall_default_allow())
			.field("rate_limit_enabled", &self.rate_limit_enabled())
			.field("pool_size", &self.pool_size())
			.field("pool_max_age", &self.pool_max_age())
			.field("connect_timeout", &self.connect_timeout())
			.field("statement_timeout", &self.statement_timeout())
			.field("script_timeout", &self.script_timeout())
			.field("cache_enabled", &self.cache_enabled())
			.finish_non_exhaustive()
	}
}

#[allow(clippy::missing_docs_in_private_items)]
struct Inner
{
	/// The URL of the main configuration store.
	database_url: Url,

	/// Process secret for JWT signing and datasource-password encryption.
	secret_key: String,

	jwt_expire_seconds: u64,
	x_api_key_enabled: bool,
	access_log_body: bool,
	config_cache_ttl: u64,
	firewall_default_allow: bool,
	rate_limit_enabled: bool,
	default_rate_limit_per_minute: u32,
	max_concurrent_per_client: u32,
	pool_size: usize,
	pool_max_age: Duration,
	connect_timeout: Duration,
	statement_timeout: Option<Duration>,
	script_timeout: Option<Duration>,
	script_extra_modules: Vec<String>,
	script_http_allowed_hosts: Vec<String>,
	cache_enabled: bool,
	redis_url: Option<Url>,
}

/// Reads and parses a required environment variable.
fn parse_from_env<T>(var: &'static str) -> Result<T, InitializeConfigError>
where
	T: FromStr<Err: std::error::Error + Send + Sync + 'static>,
{
	let value = env::var(var)?;

	if value.is_empty() {
		return Err(InitializeConfigError::EmptyValue(var));
	}

	value
		.parse::<T>()
		.map_err(|error| InitializeConfigError::Parse { var, error: Box::new(error) })
}

/// Reads and parses an environment variable.
///
/// Returns [`None`] if the variable does not exist or is empty.
fn parse_from_env_opt<T>(var: &'static str) -> Result<Option<T>, InitializeConfigError>
where
	T: FromStr<Err: std::error::Error + Send + Sync + 'static>,
{
	let Some(value) = env::var(var).ok() else {
		return Ok(None);
	};

	if value.is_empty() {
		return Ok(None);
	}

	value
		.parse::<T>()
		.map(Some)
		.map_err(|error| InitializeConfigError::Parse { var, error: Box::new(error) })
}

/// Reads and parses an environment variable, falling back to a default.
fn parse_from_env_or<T>(var: &'static str, default: T) -> Result<T, InitializeConfigError>
where
	T: FromStr<Err: std::error::Error + Send + Sync + 'static>,
{
	parse_from_env_opt(var).map(|value| value.unwrap_or(default))
}

/// Parses a comma-separated environment variable into a list of names.
fn parse_name_list(var: &'static str) -> Result<Vec<String>, InitializeConfigError>
{
	Ok(parse_from_env_opt::<String>(var)?
		.unwrap_or_default()
		.split(',')
		.map(str::trim)
		.filter(|name| !name.is_empty())
		.map(String::from)
		.collect())
}
