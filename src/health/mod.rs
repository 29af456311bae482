//! Liveness reporting.

use std::sync::Arc;

use axum::extract::State;
use axum::{Json, Router, routing};
use serde::Serialize;

use crate::database::Store;
use crate::kv::Kv;
use crate::pool::{self, PoolStats};

/// A service reporting gateway health.
#[derive(Clone)]
pub struct HealthService
{
	store: Store,
	kv: Kv,
	pool: Arc<pool::Manager>,
}

/// Response body of `GET /health`.
#[derive(Debug, Serialize)]
struct HealthReport
{
	status: &'static str,
	database: bool,
	kv: bool,
	pool: PoolStats,
}

impl HealthService
{
	/// Creates a new [`HealthService`].
	pub fn new(store: Store, kv: Kv, pool: Arc<pool::Manager>) -> Self
	{
		Self { store, kv, pool }
	}
}

impl From<HealthService> for Router
{
	fn from(svc: HealthService) -> Self
	{
		Router::new().route("/health", routing::get(report)).with_state(svc)
	}
}

/// `GET /health`.
async fn report(State(svc): State<HealthService>) -> Json<HealthReport>
{
	let database = svc.store.is_healthy().await;
	let kv = svc.kv.ping().await;

	Json(HealthReport {
		status: if database { "ok" } else { "degraded" },
		database,
		kv,
		pool: svc.pool.stats().await,
	})
}

impl std::fmt::Debug for HealthService
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_tuple("HealthService").finish_non_exhaustive()
	}
}
