//! The request plane.
//!
//! One wildcard route across five HTTP methods dispatches every gateway
//! request: resolve the endpoint, run the admission pipeline (IP filter,
//! authentication, concurrency slot, rate limit), bind parameters, execute,
//! normalize, log. The submodules map one-to-one onto those stages.

pub use self::auth::ClientAuthenticator;
pub use self::concurrency::{Admission, ConcurrencyLimiter};
pub use self::config_cache::{ConfigBundle, ConfigCache, macro_referenced};
pub use self::firewall::Firewall;
pub use self::params::{BoundParams, ParamLocation, ParamSpec, ValidatorSpec};
pub use self::rate_limit::RateLimiter;
pub use self::resolver::{PathVariables, Resolver, compile_path_pattern};
pub use self::response::Naming;
pub use self::runner::{RequestMeta, Runner};

pub mod auth;
pub mod concurrency;
pub mod config_cache;
pub mod firewall;
pub mod params;
pub mod rate_limit;
pub mod resolver;
pub mod response;
pub mod runner;

mod http;

use std::sync::Arc;

use axum::Router;

use crate::access_log;
use crate::crypto::Keyring;
use crate::database::Store;
use crate::kv::Kv;
use crate::pool;
use crate::runtime::Config;

/// The assembled request plane, exposed as an [`axum::Router`].
#[derive(Clone)]
pub struct GatewayService
{
	inner: Arc<Inner>,
}

#[allow(clippy::missing_docs_in_private_items)]
struct Inner
{
	config: Config,
	resolver: Resolver,
	firewall: Firewall,
	authenticator: ClientAuthenticator,
	concurrency: Arc<ConcurrencyLimiter>,
	rate_limiter: RateLimiter,
	runner: Runner,
	cache: Arc<ConfigCache>,
}

impl GatewayService
{
	/// Wires the request plane together.
	pub fn new(
		config: Config,
		store: Store,
		kv: Kv,
		keyring: Keyring,
		pool: Arc<pool::Manager>,
		http_client: reqwest::Client,
		access_log: Arc<access_log::Writer>,
	) -> Self
	{
		let cache = Arc::new(ConfigCache::new(
			store.clone(),
			kv.clone(),
			config.config_cache_ttl(),
		));

		let runner = Runner::new(
			store.clone(),
			Arc::clone(&cache),
			pool,
			kv.clone(),
			config.clone(),
			http_client,
			access_log,
		);

		Self {
			inner: Arc::new(Inner {
				resolver: Resolver::new(store.clone()),
				firewall: Firewall::new(store.clone(), config.firewall_default_allow()),
				authenticator: ClientAuthenticator::new(
					store,
					keyring,
					config.x_api_key_enabled(),
				),
				concurrency: Arc::new(ConcurrencyLimiter::new(
					kv.clone(),
					config.max_concurrent_per_client(),
				)),
				rate_limiter: RateLimiter::new(kv, config.rate_limit_enabled()),
				runner,
				cache,
				config,
			}),
		}
	}

	/// The shared config cache, for admin-side invalidation hooks.
	pub fn config_cache(&self) -> Arc<ConfigCache>
	{
		Arc::clone(&self.inner.cache)
	}
}

impl std::fmt::Debug for GatewayService
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_tuple("GatewayService").finish_non_exhaustive()
	}
}

impl From<GatewayService> for Router
{
	fn from(svc: GatewayService) -> Self
	{
		self::http::router(svc)
	}
}
