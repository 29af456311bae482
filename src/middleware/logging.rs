//! A middleware for logging incoming requests.
//!
//! Every dispatched request gets a span carrying the identity the gateway
//! actually keys on: the forwarded client IP (rightmost `X-Forwarded-For`
//! entry, the same rule the admission pipeline applies) alongside the raw
//! transport peer, so log lines and firewall/rate-limit decisions can be
//! correlated directly.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request};
use axum::response::Response;
use tower_http::classify::ServerErrorsFailureClass;
use uuid::Uuid;

/// Creates a tower service that will log incoming HTTP requests.
macro_rules! layer {
	() => {
		tower_http::trace::TraceLayer::new_for_http()
			.make_span_with($crate::middleware::logging::make_span)
			.on_response($crate::middleware::logging::on_response)
			.on_failure($crate::middleware::logging::on_failure)
	};
}

pub(crate) use layer;

#[doc(hidden)]
pub(crate) fn make_span(request: &Request) -> tracing::Span
{
	let peer = match request.extensions().get::<ConnectInfo<SocketAddr>>() {
		None => String::from("N/A"),
		Some(ConnectInfo(addr)) => addr.to_string(),
	};

	// The admission pipeline trusts the rightmost forwarded entry; record
	// the same value here so a denied request's log line names the IP the
	// firewall actually evaluated.
	let client_ip = request
		.headers()
		.get("x-forwarded-for")
		.and_then(|value| value.to_str().ok())
		.and_then(|forwarded| forwarded.rsplit(',').next())
		.map(|ip| ip.trim().to_owned())
		.unwrap_or_else(|| peer.clone());

	tracing::info_span! {
		target: "dbgate::http",
		"request",
		request.id = %Uuid::new_v4(),
		request.peer = %peer,
		request.client_ip = %client_ip,
		request.method = %request.method(),
		request.uri = %request.uri(),
		request.version = ?request.version(),
		request.headers = ?request.headers(),
		response.status = tracing::field::Empty,
		response.headers = tracing::field::Empty,
		latency = tracing::field::Empty,
	}
}

#[doc(hidden)]
pub(crate) fn on_response(response: &Response, latency: Duration, span: &tracing::Span)
{
	span.record("response.status", format_args!("{}", response.status()))
		.record("response.headers", format_args!("{:?}", response.headers()))
		.record("latency", format_args!("{latency:?}"));
}

#[doc(hidden)]
pub(crate) fn on_failure(
	failure: ServerErrorsFailureClass,
	_latency: Duration,
	_span: &tracing::Span,
)
{
	match failure {
		ServerErrorsFailureClass::Error(error) => {
			tracing::error!(target: "dbgate::audit_log", %error, "error occurred during request");
		}
		ServerErrorsFailureClass::StatusCode(status) if status.is_server_error() => {
			tracing::error!(target: "dbgate::audit_log", %status, "error occurred during request");
		}
		ServerErrorsFailureClass::StatusCode(status) if status.is_client_error() => {
			// Denials (403/404/429/...) are the gateway doing its job; keep
			// them at debug so admission noise does not flood the log.
			tracing::debug!(target: "dbgate::audit_log", %status, "error occurred during request");
		}
		ServerErrorsFailureClass::StatusCode(status) => {
			tracing::warn!(target: "dbgate::audit_log", %status, "error occurred during request");
		}
	}
}
