//! Facade to the main configuration store.
//!
//! The gateway keeps its own configuration (datasources, modules, endpoints,
//! clients, firewall rules, access records) in a PostgreSQL database. The
//! [`Store`] type wraps the connection pool and centralizes every query the
//! request plane issues against it.

pub use self::models::{
	AccessLogConfig,
	AccessRecord,
	AccessType,
	Client,
	Datasource,
	Endpoint,
	EndpointContent,
	EngineKind,
	FirewallRule,
	MacroDef,
	MacroKind,
	MacroSnapshot,
	Module,
	ProductKind,
	RuleKind,
	VersionSnapshot,
};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use url::Url;
use uuid::Uuid;

pub mod models;

/// Convenience alias for fallible store operations.
pub type StoreResult<T> = Result<T, sqlx::Error>;

static MIGRATIONS: Migrator = sqlx::migrate!();

/// Handle to the main configuration store.
///
/// Cheap to clone; construct once at startup and pass through the
/// application state.
#[must_use]
#[derive(Clone)]
pub struct Store
{
	pool: PgPool,
}

impl Store
{
	/// Attempts to establish a connection to the configuration store.
	pub async fn connect(url: &Url) -> StoreResult<Self>
	{
		PgPoolOptions::new()
			.min_connections(1)
			.connect(url.as_str())
			.await
			.map(|pool| Self { pool })
	}

	/// Wraps an existing pool (used by tests).
	pub fn from_pool(pool: PgPool) -> Self
	{
		Self { pool }
	}

	/// Runs outstanding database migrations.
	#[tracing::instrument(level = "trace", skip(self), err(level = "warn"))]
	pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError>
	{
		MIGRATIONS.run(&self.pool).await
	}

	/// Whether the store currently answers queries.
	pub async fn is_healthy(&self) -> bool
	{
		sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
	}

	/// Closes all open connections.
	pub async fn shutdown(self)
	{
		self.pool.close().await;
	}

	/// All active modules in `(sort_order, id)` order.
	pub async fn active_modules(&self) -> StoreResult<Vec<Module>>
	{
		sqlx::query_as::<_, Module>(
			"SELECT id, name, path_prefix, sort_order, is_active
			 FROM api_module
			 WHERE is_active
			 ORDER BY sort_order ASC, id ASC",
		)
		.fetch_all(&self.pool)
		.await
	}

	/// Published endpoints of one module matching an HTTP method, in
	/// `(sort_order, id)` order.
	pub async fn published_endpoints(
		&self,
		module_id: Uuid,
		http_method: &str,
	) -> StoreResult<Vec<Endpoint>>
	{
		sqlx::query_as::<_, Endpoint>(
			"SELECT id, module_id, name, path, http_method, execute_engine, datasource_id,
			        is_published, published_version_id, access_type, rate_limit_per_minute,
			        close_connection_after_execute, sort_order
			 FROM api_assignment
			 WHERE module_id = $1 AND is_published AND http_method = $2
			 ORDER BY sort_order ASC, id ASC",
		)
		.bind(module_id)
		.bind(http_method)
		.fetch_all(&self.pool)
		.await
	}

	/// Loads a single endpoint by id.
	pub async fn endpoint(&self, endpoint_id: Uuid) -> StoreResult<Option<Endpoint>>
	{
		sqlx::query_as::<_, Endpoint>(
			"SELECT id, module_id, name, path, http_method, execute_engine, datasource_id,
			        is_published, published_version_id, access_type, rate_limit_per_minute,
			        close_connection_after_execute, sort_order
			 FROM api_assignment
			 WHERE id = $1",
		)
		.bind(endpoint_id)
		.fetch_optional(&self.pool)
		.await
	}

	/// Loads the draft content of an endpoint.
	pub async fn endpoint_content(&self, endpoint_id: Uuid)
	-> StoreResult<Option<EndpointContent>>
	{
		sqlx::query_as::<_, EndpointContent>(
			"SELECT id, api_assignment_id, content, params, param_validates, result_transform
			 FROM api_context
			 WHERE api_assignment_id = $1",
		)
		.bind(endpoint_id)
		.fetch_optional(&self.pool)
		.await
	}

	/// Loads a published version snapshot.
	pub async fn version_snapshot(&self, snapshot_id: Uuid)
	-> StoreResult<Option<VersionSnapshot>>
	{
		sqlx::query_as::<_, VersionSnapshot>(
			"SELECT id, api_assignment_id, version, content_snapshot, params_snapshot,
			        param_validates_snapshot, result_transform_snapshot
			 FROM version_commit
			 WHERE id = $1",
		)
		.bind(snapshot_id)
		.fetch_optional(&self.pool)
		.await
	}

	/// All macros in scope for a module (global + module-owned), ordered by
	/// `(sort_order, name)`.
	pub async fn macros_in_scope(&self, module_id: Uuid) -> StoreResult<Vec<MacroDef>>
	{
		sqlx::query_as::<_, MacroDef>(
			"SELECT id, module_id, name, macro_type, is_published, published_version_id,
			        sort_order
			 FROM api_macro_def
			 WHERE module_id IS NULL OR module_id = $1
			 ORDER BY sort_order ASC, name ASC",
		)
		.bind(module_id)
		.fetch_all(&self.pool)
		.await
	}

	/// Loads a published macro snapshot.
	pub async fn macro_snapshot(&self, snapshot_id: Uuid) -> StoreResult<Option<MacroSnapshot>>
	{
		sqlx::query_as::<_, MacroSnapshot>(
			"SELECT id, macro_def_id, content_snapshot
			 FROM macro_def_version_commit
			 WHERE id = $1",
		)
		.bind(snapshot_id)
		.fetch_optional(&self.pool)
		.await
	}

	/// Looks up an active client by its opaque `client_id` string.
	pub async fn client_by_client_id(&self, client_id: &str) -> StoreResult<Option<Client>>
	{
		sqlx::query_as::<_, Client>(
			"SELECT id, name, client_id, client_secret, is_active, rate_limit_per_minute,
			        max_concurrent
			 FROM app_client
			 WHERE client_id = $1 AND is_active",
		)
		.bind(client_id)
		.fetch_optional(&self.pool)
		.await
	}

	/// Whether a client may call an endpoint, either through a shared group
	/// or through a direct grant.
	pub async fn client_has_endpoint_grant(
		&self,
		client_id: Uuid,
		endpoint_id: Uuid,
	) -> StoreResult<bool>
	{
		sqlx::query_scalar::<_, bool>(
			"SELECT EXISTS (
			     SELECT 1
			     FROM app_client_api_link
			     WHERE app_client_id = $1 AND api_assignment_id = $2
			 ) OR EXISTS (
			     SELECT 1
			     FROM app_client_group_link cg
			     JOIN api_assignment_group_link ag ON ag.api_group_id = cg.api_group_id
			     WHERE cg.app_client_id = $1 AND ag.api_assignment_id = $2
			 )",
		)
		.bind(client_id)
		.bind(endpoint_id)
		.fetch_one(&self.pool)
		.await
	}

	/// All active firewall rules in `(sort_order, id)` order.
	pub async fn firewall_rules(&self) -> StoreResult<Vec<FirewallRule>>
	{
		sqlx::query_as::<_, FirewallRule>(
			"SELECT id, rule_type, ip_range, is_active, sort_order
			 FROM firewall_rule
			 WHERE is_active
			 ORDER BY sort_order ASC, id ASC",
		)
		.fetch_all(&self.pool)
		.await
	}

	/// Loads a datasource by id.
	pub async fn datasource(&self, datasource_id: Uuid) -> StoreResult<Option<Datasource>>
	{
		sqlx::query_as::<_, Datasource>(
			"SELECT id, name, product_type, host, port, database, username, password, use_ssl,
			        close_connection_after_execute, is_active
			 FROM datasource
			 WHERE id = $1",
		)
		.bind(datasource_id)
		.fetch_optional(&self.pool)
		.await
	}

	/// Loads the singleton access-log configuration row.
	pub async fn access_log_config(&self) -> StoreResult<Option<AccessLogConfig>>
	{
		sqlx::query_as::<_, AccessLogConfig>(
			"SELECT id, datasource_id, use_audit_dialect
			 FROM access_log_config
			 WHERE id = 1",
		)
		.fetch_optional(&self.pool)
		.await
	}

	/// Inserts one access record into the main store.
	pub async fn insert_access_record(&self, record: &AccessRecord) -> StoreResult<()>
	{
		sqlx::query(
			"INSERT INTO access_record (
			     id, api_assignment_id, app_client_id, ip_address, http_method, path,
			     status_code, request_body, request_headers, request_params, created_at,
			     duration_ms
			 )
			 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
		)
		.bind(record.id)
		.bind(record.api_assignment_id)
		.bind(record.app_client_id)
		.bind(&record.ip_address)
		.bind(&record.http_method)
		.bind(&record.path)
		.bind(record.status_code)
		.bind(&record.request_body)
		.bind(&record.request_headers)
		.bind(&record.request_params)
		.bind(record.created_at)
		.bind(record.duration_ms)
		.execute(&self.pool)
		.await
		.map(drop)
	}
}

impl std::fmt::Debug for Store
{
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		fmt.debug_tuple("Store").finish_non_exhaustive()
	}
}
