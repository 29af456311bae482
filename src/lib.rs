//! dbgate - a dynamic database-API gateway.
//!
//! Administrators define HTTP endpoints whose implementation is a SQL
//! template or a sandboxed script executed against a configured backend
//! database. At request time the gateway resolves the URL to an endpoint,
//! authenticates the caller, enforces admission control (IP filter,
//! per-client concurrency, rate limit), binds and coerces parameters,
//! renders/executes the content against a pooled connection, normalizes
//! the result to a standard JSON envelope, and persists an access record.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;

mod signal;
pub use signal::shutdown_signal;

pub mod access_log;
pub mod crypto;
pub mod database;
pub mod engines;
pub mod gateway;
pub mod health;
pub mod kv;
pub mod middleware;
pub mod pool;
pub mod runtime;
pub mod setup;
pub mod token;

/// A [`tower::MakeService`] that can be passed to [`axum::serve()`].
pub type Server =
	axum::extract::connect_info::IntoMakeServiceWithConnectInfo<axum::Router, SocketAddr>;

/// Process-wide resources that need explicit disposal on shutdown.
pub struct AppResources
{
	store: database::Store,
	pool: Arc<pool::Manager>,
	access_log: Arc<access_log::Writer>,
}

impl AppResources
{
	/// Drains pools and closes connections.
	pub async fn dispose(self)
	{
		tracing::debug!("disposing external connection pools");
		self.pool.dispose(None).await;

		tracing::debug!("closing cached access-log connection");
		self.access_log.invalidate_cache().await;

		tracing::debug!("closing configuration store");
		self.store.shutdown().await;
	}
}

impl std::fmt::Debug for AppResources
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_tuple("AppResources").finish_non_exhaustive()
	}
}

/// Initializes the gateway's services and returns a [`tower::MakeService`].
///
/// You'll likely just pass the first return value to [`axum::serve()`];
/// dispose the second after the server exits.
#[tracing::instrument(target = "dbgate::runtime", name = "start", skip_all, err(Debug))]
pub async fn server(config: runtime::Config) -> Result<(Server, AppResources), setup::Error>
{
	let keyring = crypto::Keyring::new(config.secret_key());
	let store = database::Store::connect(config.database_url()).await?;

	store.run_migrations().await?;

	let kv = kv::Kv::connect(&config).await;
	let pool = Arc::new(pool::Manager::new(&config, keyring.clone()));
	let http_client = reqwest::Client::new();
	let access_log =
		Arc::new(access_log::Writer::new(store.clone(), keyring.clone(), &config));

	let gateway_svc = gateway::GatewayService::new(
		config.clone(),
		store.clone(),
		kv.clone(),
		keyring.clone(),
		Arc::clone(&pool),
		http_client,
		Arc::clone(&access_log),
	);

	let token_svc =
		token::TokenService::new(store.clone(), keyring, config.jwt_expire_seconds());
	let health_svc = health::HealthService::new(store.clone(), kv, Arc::clone(&pool));

	let panic_handler = middleware::panic_handler::layer();
	let logging = middleware::logging::layer!();

	// The gateway's wildcard routes merge last; static routes (`/health`,
	// `/token/…`) win over `/{module}` by router precedence.
	let server = Router::new()
		.merge(Router::from(health_svc))
		.nest("/token", token_svc.into())
		.merge(Router::from(gateway_svc))
		.layer(panic_handler)
		.layer(logging)
		.into_make_service_with_connect_info::<SocketAddr>();

	Ok((server, AppResources { store, pool, access_log }))
}
