//! Minimal Trino client speaking the REST statement protocol.
//!
//! Trino has no wire driver in the sqlx sense; statements are submitted via
//! `POST /v1/statement` and results are paged by following `nextUri` until
//! the server stops returning one. Session properties (such as
//! `query_max_execution_time`) are sent per request in the
//! `X-Trino-Session` header, so "set and reset" of the statement timeout is
//! naturally stateless here.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::error::PoolError;

/// One page of the statement protocol.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementPage
{
	#[serde(default)]
	next_uri: Option<String>,

	#[serde(default)]
	columns: Option<Vec<ColumnInfo>>,

	#[serde(default)]
	data: Option<Vec<Vec<JsonValue>>>,

	#[serde(default)]
	update_count: Option<u64>,

	#[serde(default)]
	error: Option<StatementError>,
}

#[allow(clippy::missing_docs_in_private_items)]
#[derive(Debug, Deserialize)]
struct ColumnInfo
{
	name: String,
}

#[allow(clippy::missing_docs_in_private_items)]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementError
{
	message: String,

	#[serde(default)]
	error_name: Option<String>,
}

/// The final result of one statement.
#[derive(Debug)]
pub struct StatementOutput
{
	/// Result rows as JSON objects keyed by column name.
	pub rows: Vec<JsonValue>,

	/// Affected-row count for DML, when the server reports one.
	pub update_count: Option<u64>,
}

/// A logical connection to a Trino coordinator.
pub struct TrinoClient
{
	http: reqwest::Client,
	statement_url: String,
	user: String,
	password: Option<String>,
	catalog: String,

	/// Session properties attached to each statement, e.g.
	/// `query_max_execution_time=30s`.
	session_properties: Vec<String>,
}

impl TrinoClient
{
	/// Creates a client for the given coordinator.
	pub fn new(
		host: &str,
		port: u16,
		catalog: &str,
		user: &str,
		password: Option<String>,
		use_ssl: bool,
		timeout: Duration,
	) -> Result<Self, PoolError>
	{
		if use_ssl && password.as_deref().is_none_or(str::is_empty) {
			return Err(PoolError::Connection(
				"a password is required for trino over https".into(),
			));
		}

		let scheme = if use_ssl { "https" } else { "http" };
		let http = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|error| PoolError::Connection(error.into()))?;

		Ok(Self {
			http,
			statement_url: format!("{scheme}://{host}:{port}/v1/statement"),
			user: user.to_owned(),
			password,
			catalog: catalog.to_owned(),
			session_properties: Vec::new(),
		})
	}

	/// Attaches a session property to subsequent statements.
	pub fn set_session_property(&mut self, property: String)
	{
		self.session_properties.push(property);
	}

	/// Clears all session properties.
	pub fn clear_session_properties(&mut self)
	{
		self.session_properties.clear();
	}

	/// Submits a statement and drains all result pages.
	pub async fn execute(&self, sql: &str) -> Result<StatementOutput, PoolError>
	{
		let mut request = self
			.http
			.post(&self.statement_url)
			.header("X-Trino-User", &self.user)
			.header("X-Trino-Catalog", &self.catalog)
			.header("X-Trino-Schema", "default")
			.header("X-Trino-Source", "dbgate")
			.body(sql.to_owned());

		if !self.session_properties.is_empty() {
			request = request.header("X-Trino-Session", self.session_properties.join(","));
		}

		if let Some(ref password) = self.password {
			request = request.basic_auth(&self.user, Some(password));
		}

		let mut page = self.fetch_page(request).await?;
		let mut columns: Option<Vec<String>> = None;
		let mut rows = Vec::new();
		let mut update_count = None;

		loop {
			if let Some(error) = page.error {
				let name = error.error_name.unwrap_or_else(|| String::from("TRINO_ERROR"));

				if name == "EXCEEDED_TIME_LIMIT" {
					return Err(PoolError::StatementTimeout);
				}

				return Err(PoolError::Query(format!("{name}: {}", error.message).into()));
			}

			if columns.is_none() {
				columns = page
					.columns
					.map(|infos| infos.into_iter().map(|info| info.name).collect());
			}

			if let Some(data) = page.data {
				let names = columns.as_deref().unwrap_or_default();

				for values in data {
					let row = names
						.iter()
						.cloned()
						.zip(values)
						.collect::<serde_json::Map<String, JsonValue>>();

					rows.push(JsonValue::Object(row));
				}
			}

			if page.update_count.is_some() {
				update_count = page.update_count;
			}

			let Some(next_uri) = page.next_uri else {
				break;
			};

			let mut request = self.http.get(&next_uri).header("X-Trino-User", &self.user);

			if let Some(ref password) = self.password {
				request = request.basic_auth(&self.user, Some(password));
			}

			page = self.fetch_page(request).await?;
		}

		Ok(StatementOutput { rows, update_count })
	}

	/// Runs a liveness probe.
	pub async fn ping(&self) -> Result<(), PoolError>
	{
		self.execute("SELECT 1").await.map(drop)
	}

	/// Sends one protocol request and parses the page.
	async fn fetch_page(&self, request: reqwest::RequestBuilder)
	-> Result<StatementPage, PoolError>
	{
		let response = request.send().await.map_err(|error| {
			if error.is_timeout() {
				PoolError::StatementTimeout
			} else if error.is_connect() {
				PoolError::Connection(error.into())
			} else {
				PoolError::Query(error.into())
			}
		})?;

		let status = response.status();

		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();

			return Err(PoolError::Query(
				format!("trino returned {status}: {body}").into(),
			));
		}

		response
			.json::<StatementPage>()
			.await
			.map_err(|error| PoolError::Query(error.into()))
	}
}

impl std::fmt::Debug for TrinoClient
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_struct("TrinoClient")
			.field("statement_url", &self.statement_url)
			.field("user", &self.user)
			.field("catalog", &self.catalog)
			.finish_non_exhaustive()
	}
}
