//! Entities of the configuration store that the request plane reads.
//!
//! All of these are created and updated by the admin surface; the request
//! plane only ever reads them (and writes [`AccessRecord`]s). Cyclic
//! references (`api_assignment.published_version_id` ↔
//! `version_commit.api_assignment_id`) are represented as plain ids, never as
//! pointer cycles.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Supported backend database products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "product_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProductKind
{
	Postgres,
	Mysql,
	Trino,
}

impl ProductKind
{
	/// The default port for this product.
	pub fn default_port(self) -> u16
	{
		match self {
			Self::Postgres => 5432,
			Self::Mysql => 3306,
			Self::Trino => 8080,
		}
	}

	/// Lowercase name as stored and displayed.
	pub fn as_str(self) -> &'static str
	{
		match self {
			Self::Postgres => "postgres",
			Self::Mysql => "mysql",
			Self::Trino => "trino",
		}
	}
}

/// The engine an endpoint executes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "execute_engine", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineKind
{
	Sql,
	Script,
}

/// Whether an endpoint requires an authenticated client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "api_access_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccessType
{
	Public,
	Private,
}

/// The flavor of a reusable macro fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "macro_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MacroKind
{
	SqlMacro,
	ScriptMacro,
}

/// Firewall rule action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "firewall_rule_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RuleKind
{
	Allow,
	Deny,
}

/// A connection target for endpoint execution.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Datasource
{
	pub id: Uuid,
	pub name: String,

	#[sqlx(rename = "product_type")]
	pub kind: ProductKind,

	pub host: String,
	pub port: i32,
	pub database: String,
	pub username: String,

	/// Fernet-encrypted; decrypt with [`crate::crypto::Keyring`] at connect
	/// time only.
	pub password: String,

	pub use_ssl: bool,
	pub close_connection_after_execute: bool,
	pub is_active: bool,
}

/// A URL-prefix namespace grouping endpoints.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Module
{
	pub id: Uuid,
	pub name: String,
	pub path_prefix: String,
	pub sort_order: i32,
	pub is_active: bool,
}

/// The unit of dispatch: one path pattern + method within a module.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Endpoint
{
	pub id: Uuid,
	pub module_id: Uuid,
	pub name: String,

	/// Path within the module, e.g. `users` or `users/{id}`.
	pub path: String,

	pub http_method: String,
	pub execute_engine: EngineKind,
	pub datasource_id: Option<Uuid>,
	pub is_published: bool,
	pub published_version_id: Option<Uuid>,
	pub access_type: AccessType,
	pub rate_limit_per_minute: Option<i32>,
	pub close_connection_after_execute: bool,
	pub sort_order: i32,
}

/// Draft content of an endpoint (1-to-1 with [`Endpoint`]).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EndpointContent
{
	pub id: Uuid,
	pub api_assignment_id: Uuid,
	pub content: String,

	/// Typed parameter schema as stored JSON.
	pub params: Option<serde_json::Value>,

	/// Per-parameter validation scripts as stored JSON.
	pub param_validates: Option<serde_json::Value>,

	pub result_transform: Option<String>,
}

/// Immutable snapshot of endpoint content captured on publish.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VersionSnapshot
{
	pub id: Uuid,
	pub api_assignment_id: Uuid,
	pub version: i32,
	pub content_snapshot: String,
	pub params_snapshot: Option<serde_json::Value>,
	pub param_validates_snapshot: Option<serde_json::Value>,
	pub result_transform_snapshot: Option<String>,
}

/// A reusable text fragment prepended to endpoint content when referenced.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MacroDef
{
	pub id: Uuid,

	/// `None` means the macro is global.
	pub module_id: Option<Uuid>,

	pub name: String,
	pub macro_type: MacroKind,
	pub is_published: bool,
	pub published_version_id: Option<Uuid>,
	pub sort_order: i32,
}

/// Immutable snapshot of macro content captured on publish.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MacroSnapshot
{
	pub id: Uuid,
	pub macro_def_id: Uuid,
	pub content_snapshot: String,
}

/// Credentials for calling private endpoints.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Client
{
	pub id: Uuid,
	pub name: String,
	pub client_id: String,

	/// bcrypt hash, never the plaintext secret.
	pub client_secret: String,

	pub is_active: bool,
	pub rate_limit_per_minute: Option<i32>,
	pub max_concurrent: Option<i32>,
}

/// One IP allow/deny rule.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FirewallRule
{
	pub id: Uuid,
	pub rule_type: RuleKind,

	/// CIDR or a single address (treated as /32 or /128).
	pub ip_range: String,

	pub is_active: bool,
	pub sort_order: i32,
}

/// Singleton row selecting where access records are written.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccessLogConfig
{
	pub id: i32,
	pub datasource_id: Option<Uuid>,
	pub use_audit_dialect: bool,
}

/// One row per dispatched request.
#[derive(Debug, Clone)]
pub struct AccessRecord
{
	pub id: Uuid,
	pub api_assignment_id: Option<Uuid>,
	pub app_client_id: Option<Uuid>,
	pub ip_address: String,
	pub http_method: String,
	pub path: String,
	pub status_code: i32,
	pub request_body: Option<String>,
	pub request_headers: Option<String>,
	pub request_params: Option<String>,
	pub created_at: OffsetDateTime,
	pub duration_ms: Option<i32>,
}
