//! The HTTP entry point of the request plane.
//!
//! Every gateway request lands in [`dispatch`], which runs the stages in
//! order and translates any failure into the error envelope with the
//! matching status. The concurrency slot taken in step 3 is held by a
//! guard, so it is returned on every exit path, including panics unwound
//! through the handler.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use axum::{Json, routing};
use bytes::Bytes;

use super::rate_limit::effective_limit;
use super::runner::RequestMeta;
use super::{ConcurrencyLimiter, GatewayService, Naming, response};
use crate::runtime;

/// Builds the wildcard gateway router.
pub(super) fn router(svc: GatewayService) -> Router
{
	Router::new()
		.route(
			"/{module}",
			routing::get(dispatch_module_root)
				.post(dispatch_module_root)
				.put(dispatch_module_root)
				.patch(dispatch_module_root)
				.delete(dispatch_module_root),
		)
		.route(
			"/{module}/{*rest}",
			routing::get(dispatch)
				.post(dispatch)
				.put(dispatch)
				.patch(dispatch)
				.delete(dispatch),
		)
		.with_state(svc)
}

/// `/{module}` with no remaining path.
async fn dispatch_module_root(
	State(svc): State<GatewayService>,
	Path(module): Path<String>,
	method: Method,
	RawQuery(query): RawQuery,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
	body: Bytes,
) -> Response
{
	dispatch_inner(svc, module, String::new(), method, query, peer, headers, body).await
}

/// `/{module}/{*rest}`.
async fn dispatch(
	State(svc): State<GatewayService>,
	Path((module, rest)): Path<(String, String)>,
	method: Method,
	RawQuery(query): RawQuery,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
	body: Bytes,
) -> Response
{
	dispatch_inner(svc, module, rest, method, query, peer, headers, body).await
}

/// The dispatch pipeline: resolve, admission (IP, auth, concurrency,
/// rate), run, format.
#[allow(clippy::too_many_arguments)]
async fn dispatch_inner(
	svc: GatewayService,
	module: String,
	rest: String,
	method: Method,
	query: Option<String>,
	peer: SocketAddr,
	headers: HeaderMap,
	body: Bytes,
) -> Response
{
	let naming = response_naming(query.as_deref(), &headers);
	let inner = &svc.inner;

	let ip = client_ip(&headers, peer);

	// Step 1: IP filter.
	match inner.firewall.check(&ip).await {
		Ok(true) => {}
		Ok(false) => return error_response(runtime::Error::firewall_blocked(), naming),
		Err(error) => return error_response(error, naming),
	}

	// Resolution before auth: an unknown path is 404 even unauthenticated.
	let resolved = match inner.resolver.resolve(&module, &rest, method.as_str()).await {
		Ok(resolved) => resolved,
		Err(error) => return error_response(error, naming),
	};

	let Some((endpoint, path_variables)) = resolved else {
		return error_response(runtime::Error::unknown_endpoint(), naming);
	};

	// Step 2: authentication, for private endpoints only.
	let client = if endpoint.access_type == crate::database::AccessType::Private {
		let client = match inner.authenticator.authenticate(&headers).await {
			Ok(client) => client,
			Err(error) => return error_response(error, naming),
		};

		let Some(client) = client else {
			return error_response(runtime::Error::auth_failed(), naming);
		};

		match inner.authenticator.authorize(client.id, endpoint.id).await {
			Ok(true) => {}
			Ok(false) => return error_response(runtime::Error::client_group_denied(), naming),
			Err(error) => return error_response(error, naming),
		}

		Some(client)
	} else {
		// Public endpoints skip authentication; their admission keys are
		// IP-based.
		None
	};

	let client_key = client
		.as_ref()
		.map_or_else(|| format!("ip:{ip}"), |client| client.client_id.clone());

	// Step 3: concurrency slot. The guard returns it on every exit path.
	let max_concurrent = client.as_ref().and_then(|client| client.max_concurrent);
	let admission = inner.concurrency.acquire(&client_key, max_concurrent).await;

	let _slot = match admission {
		super::Admission::Denied => {
			return error_response(runtime::Error::concurrency_exceeded(), naming);
		}
		super::Admission::Admitted { counted } => {
			SlotGuard::new(Arc::clone(&inner.concurrency), client_key.clone(), counted)
		}
	};

	// Step 4: rate limit. Denial releases the slot (via the guard).
	let client_limit = client.as_ref().and_then(|client| client.rate_limit_per_minute);

	if let Some((limit, window_key)) = effective_limit(
		endpoint.id,
		endpoint.rate_limit_per_minute,
		client_limit,
		inner.config.default_rate_limit_per_minute(),
		&client_key,
	) {
		if !inner.rate_limiter.check(&window_key, limit).await {
			return error_response(runtime::Error::rate_limited(), naming);
		}
	}

	let meta = RequestMeta {
		client_ref: client.as_ref().map(|client| client.id),
		ip,
		method: method.to_string(),
		path: format!("{module}/{rest}").trim_end_matches('/').to_owned(),
		headers_json: headers_json(&headers),
	};

	let result = inner
		.runner
		.run(&endpoint, &path_variables, query.as_deref(), &headers, &body, meta)
		.await;

	match result {
		Ok(raw) => {
			let normalized = response::normalize_result(raw, endpoint.execute_engine);
			let body = response::apply_naming(normalized, naming);

			Json(body).into_response()
		}
		Err(error) => error_response(error, naming),
	}
}

/// Renders a failure as the error envelope at its status.
fn error_response(error: runtime::Error, naming: Naming) -> Response
{
	let status = error.status();

	if status.is_server_error() {
		tracing::error!(
			target: "dbgate::audit_log",
			error = %error,
			source_location = %error.source_location(),
			"gateway dispatch failed",
		);
	}

	let body = response::apply_naming(response::error_envelope(&error.to_string()), naming);

	(status, Json(body)).into_response()
}

/// The client IP: rightmost `X-Forwarded-For` entry, else the transport
/// peer.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String
{
	headers
		.get("x-forwarded-for")
		.and_then(|value| value.to_str().ok())
		.and_then(|forwarded| forwarded.rsplit(',').next())
		.map(|ip| ip.trim().to_owned())
		.filter(|ip| !ip.is_empty())
		.unwrap_or_else(|| peer.ip().to_string())
}

/// The requested response naming: `?naming=camel` or
/// `X-Response-Naming: camel`.
fn response_naming(query: Option<&str>, headers: &HeaderMap) -> Naming
{
	if query.map(query_naming).unwrap_or_default() == Naming::Camel {
		return Naming::Camel;
	}

	headers
		.get("x-response-naming")
		.and_then(|value| value.to_str().ok())
		.map(Naming::parse)
		.unwrap_or_default()
}

/// The `naming` value in a raw query string.
fn query_naming(query: &str) -> Naming
{
	serde_html_form::from_str::<Vec<(String, String)>>(query)
		.unwrap_or_default()
		.into_iter()
		.find(|(key, _)| key == "naming")
		.map(|(_, value)| Naming::parse(&value))
		.unwrap_or_default()
}

/// Request headers as a JSON object string for the access record.
fn headers_json(headers: &HeaderMap) -> Option<String>
{
	let map = headers
		.iter()
		.filter_map(|(name, value)| {
			value.to_str().ok().map(|value| (name.as_str().to_owned(), value.to_owned()))
		})
		.collect::<BTreeMap<String, String>>();

	serde_json::to_string(&map).ok()
}

/// Holds one concurrency slot; releasing happens on drop so handled
/// errors, early returns, and panics all return the slot.
struct SlotGuard
{
	limiter: Arc<ConcurrencyLimiter>,
	client_key: String,
	counted: bool,
}

impl SlotGuard
{
	fn new(limiter: Arc<ConcurrencyLimiter>, client_key: String, counted: bool) -> Self
	{
		Self { limiter, client_key, counted }
	}
}

impl Drop for SlotGuard
{
	fn drop(&mut self)
	{
		if !self.counted {
			return;
		}

		let limiter = Arc::clone(&self.limiter);
		let client_key = std::mem::take(&mut self.client_key);

		tokio::spawn(async move { limiter.release(&client_key).await });
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	fn peer() -> SocketAddr
	{
		"192.0.2.9:5000".parse().expect("valid socket addr")
	}

	#[test]
	fn client_ip_prefers_rightmost_forwarded_entry()
	{
		let mut headers = HeaderMap::new();

		headers.insert("x-forwarded-for", "203.0.113.5, 10.0.0.1".parse().unwrap());

		assert_eq!(client_ip(&headers, peer()), "10.0.0.1");
	}

	#[test]
	fn client_ip_falls_back_to_peer()
	{
		assert_eq!(client_ip(&HeaderMap::new(), peer()), "192.0.2.9");
	}

	#[test]
	fn response_naming_sources()
	{
		let mut headers = HeaderMap::new();

		assert_eq!(response_naming(Some("naming=camel"), &headers), Naming::Camel);
		assert_eq!(response_naming(Some("naming=snake"), &headers), Naming::Snake);
		assert_eq!(response_naming(None, &headers), Naming::Snake);

		headers.insert("x-response-naming", "camel".parse().unwrap());

		assert_eq!(response_naming(None, &headers), Naming::Camel);
	}
}
