//! The main error type.
//!
//! This is returned by all fallible HTTP handlers, the runner, and the
//! admission pipeline. Every error maps to exactly one HTTP status and
//! renders as the standard response envelope.

use std::fmt;
use std::panic::Location;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Type alias that defaults to our [`Error`] as the default error type, but is
/// still overridable and therefore compatible with [`std::result::Result`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Convenience type alias.
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The main runtime error type.
///
/// This is the only error type allowed to reach callers of the gateway!
pub struct Error
{
	/// We box this so our error type is only 1 pointer wide.
	inner: Box<Inner>,
}

/// The different kinds of errors that can occur while dispatching a request.
#[derive(Debug, thiserror::Error)]
enum ErrorKind
{
	/// The client IP was rejected by the firewall.
	#[error("Forbidden")]
	FirewallBlocked,

	/// The request could not be authenticated.
	#[error("Unauthorized")]
	AuthFailed,

	/// The client is authenticated but has no grant for this endpoint.
	#[error("Forbidden")]
	ClientGroupDenied,

	/// The client has too many requests in flight.
	#[error("Service Unavailable")]
	ConcurrencyExceeded,

	/// The client exceeded its requests-per-minute budget.
	#[error("Too Many Requests")]
	RateLimited,

	/// No module/endpoint matched the request path.
	#[error("Not Found")]
	UnknownEndpoint,

	/// Declared required parameters resolved to nothing.
	#[error("Missing required parameters: {}", names.join(", "))]
	MissingParameter
	{
		/// The parameters that were missing.
		names: Vec<String>,
	},

	/// A parameter failed type coercion or a validation script.
	#[error("{0}")]
	BadParameter(String),

	/// Endpoint content references macros that are not published.
	#[error("Macro(s) must be published before use: {}", names.join(", "))]
	MacroUnpublished
	{
		/// The offending macro names.
		names: Vec<String>,
	},

	/// The SQL template failed to render.
	#[error("SQL template render failed: {0}")]
	RenderFailed(BoxError),

	/// The script failed to compile.
	#[error("script compile failed: {0}")]
	CompileScript(BoxError),

	/// The endpoint's datasource is marked inactive.
	#[error("datasource is inactive and cannot be used")]
	DatasourceInactive,

	/// A statement, script, or outbound HTTP call exceeded its time budget.
	#[error("{0}")]
	Timeout(String),

	/// The backend database rejected the query.
	#[error("SQL execution failed: {0}")]
	BackendQuery(BoxError),

	/// A connection to the backend database could not be established.
	#[error("database connection failed: {0}")]
	Connection(BoxError),

	/// The script raised an error at runtime.
	#[error("script execution failed: {0}")]
	ScriptRuntime(BoxError),

	/// The result-transform script failed.
	#[error("result transform failed: {0}")]
	TransformFailed(BoxError),

	/// Something unexpected happened.
	#[error("something unexpected happened; please report this incident")]
	Unhandled(BoxError),

	/// An HTTP handler panicked, but was caught by middleware.
	#[error("something unexpected happened; please report this incident")]
	Panic,
}

impl Error
{
	/// Create a new [`Error`].
	#[track_caller]
	fn new(kind: ErrorKind) -> Self
	{
		Self { inner: Box::new(Inner { kind, source_location: *Location::caller() }) }
	}

	/// Returns the original error source.
	pub fn source(&self) -> &(dyn std::error::Error + Send + Sync + 'static)
	{
		&self.inner.kind
	}

	/// Returns the source code location of where this error was created.
	pub fn source_location(&self) -> Location<'static>
	{
		self.inner.source_location
	}

	/// Returns the appropriate HTTP status code to use in an error response.
	pub fn status(&self) -> StatusCode
	{
		match self.inner.kind {
			ErrorKind::FirewallBlocked | ErrorKind::ClientGroupDenied => StatusCode::FORBIDDEN,
			ErrorKind::AuthFailed => StatusCode::UNAUTHORIZED,
			ErrorKind::ConcurrencyExceeded => StatusCode::SERVICE_UNAVAILABLE,
			ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
			ErrorKind::UnknownEndpoint => StatusCode::NOT_FOUND,
			ErrorKind::MissingParameter { .. }
			| ErrorKind::BadParameter(_)
			| ErrorKind::MacroUnpublished { .. }
			| ErrorKind::RenderFailed(_)
			| ErrorKind::CompileScript(_)
			| ErrorKind::DatasourceInactive
			| ErrorKind::Timeout(_)
			| ErrorKind::BackendQuery(_)
			| ErrorKind::ScriptRuntime(_)
			| ErrorKind::TransformFailed(_) => StatusCode::BAD_REQUEST,
			ErrorKind::Connection(_) | ErrorKind::Unhandled(_) | ErrorKind::Panic => {
				StatusCode::INTERNAL_SERVER_ERROR
			}
		}
	}

	/// Reject a request because the firewall denied its IP.
	#[track_caller]
	pub fn firewall_blocked() -> Self
	{
		Self::new(ErrorKind::FirewallBlocked)
	}

	/// Reject a request because it could not be authenticated.
	#[track_caller]
	pub fn auth_failed() -> Self
	{
		Self::new(ErrorKind::AuthFailed)
	}

	/// Reject a request because the client has no grant for the endpoint.
	#[track_caller]
	pub fn client_group_denied() -> Self
	{
		Self::new(ErrorKind::ClientGroupDenied)
	}

	/// Reject a request because the client's concurrency budget is exhausted.
	#[track_caller]
	pub fn concurrency_exceeded() -> Self
	{
		Self::new(ErrorKind::ConcurrencyExceeded)
	}

	/// Reject a request because the client's rate budget is exhausted.
	#[track_caller]
	pub fn rate_limited() -> Self
	{
		Self::new(ErrorKind::RateLimited)
	}

	/// Reject a request because no endpoint matched.
	#[track_caller]
	pub fn unknown_endpoint() -> Self
	{
		Self::new(ErrorKind::UnknownEndpoint)
	}

	/// Reject a request because required parameters are missing.
	#[track_caller]
	pub fn missing_parameters(names: Vec<String>) -> Self
	{
		Self::new(ErrorKind::MissingParameter { names })
	}

	/// Reject a request because a parameter is malformed.
	#[track_caller]
	pub fn bad_parameter(message: impl Into<String>) -> Self
	{
		Self::new(ErrorKind::BadParameter(message.into()))
	}

	/// Reject endpoint content that references unpublished macros.
	#[track_caller]
	pub fn macro_unpublished(names: Vec<String>) -> Self
	{
		Self::new(ErrorKind::MacroUnpublished { names })
	}

	/// The SQL template failed to render.
	#[track_caller]
	pub fn render_failed(reason: impl Into<BoxError>) -> Self
	{
		Self::new(ErrorKind::RenderFailed(reason.into()))
	}

	/// The script failed to compile.
	#[track_caller]
	pub fn compile_script(reason: impl Into<BoxError>) -> Self
	{
		Self::new(ErrorKind::CompileScript(reason.into()))
	}

	/// The endpoint's datasource is inactive.
	#[track_caller]
	pub fn datasource_inactive() -> Self
	{
		Self::new(ErrorKind::DatasourceInactive)
	}

	/// A statement, script, or outbound call timed out.
	#[track_caller]
	pub fn timeout(message: impl Into<String>) -> Self
	{
		Self::new(ErrorKind::Timeout(message.into()))
	}

	/// The backend database rejected the query.
	#[track_caller]
	pub fn backend_query(reason: impl Into<BoxError>) -> Self
	{
		Self::new(ErrorKind::BackendQuery(reason.into()))
	}

	/// A connection to the backend could not be established.
	#[track_caller]
	pub fn connection(reason: impl Into<BoxError>) -> Self
	{
		Self::new(ErrorKind::Connection(reason.into()))
	}

	/// The script raised at runtime.
	#[track_caller]
	pub fn script_runtime(reason: impl Into<BoxError>) -> Self
	{
		Self::new(ErrorKind::ScriptRuntime(reason.into()))
	}

	/// The result-transform script failed.
	#[track_caller]
	pub fn transform_failed(reason: impl Into<BoxError>) -> Self
	{
		Self::new(ErrorKind::TransformFailed(reason.into()))
	}

	/// Something went wrong that no other kind describes.
	#[track_caller]
	pub fn unhandled(reason: impl Into<BoxError>) -> Self
	{
		Self::new(ErrorKind::Unhandled(reason.into()))
	}

	/// Indicate that an HTTP handler panicked but the panic was caught.
	#[track_caller]
	pub(crate) fn panic() -> Self
	{
		Self::new(ErrorKind::Panic)
	}
}

impl fmt::Debug for Error
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
	{
		write!(f, "[{}]: {}", self.source_location(), self.source())
	}
}

impl fmt::Display for Error
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
	{
		fmt::Display::fmt(self.source(), f)
	}
}

impl IntoResponse for Error
{
	fn into_response(self) -> Response
	{
		let status = self.status();

		if status == StatusCode::INTERNAL_SERVER_ERROR {
			tracing::error! {
				target: "dbgate::audit_log",
				kind = ?self.inner.kind,
				source_location = %self.source_location(),
				"internal server error: \"{self}\"",
			};
		} else {
			tracing::debug! {
				%status,
				source_location = %self.source_location(),
				"runtime error: \"{self}\"",
			};
		}

		let body = serde_json::json!({
			"success": false,
			"message": self.to_string(),
			"data": [],
		});

		(status, Json(body)).into_response()
	}
}

impl From<sqlx::Error> for Error
{
	#[track_caller]
	fn from(value: sqlx::Error) -> Self
	{
		Self::new(ErrorKind::Unhandled(value.into()))
	}
}

/// The actual representation of [`Error`].
struct Inner
{
	/// Which particular error we're dealing with.
	kind: ErrorKind,

	/// The source code location of where this [`Error`] was created.
	source_location: Location<'static>,
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn status_codes_match_error_origin()
	{
		assert_eq!(Error::firewall_blocked().status(), StatusCode::FORBIDDEN);
		assert_eq!(Error::auth_failed().status(), StatusCode::UNAUTHORIZED);
		assert_eq!(Error::client_group_denied().status(), StatusCode::FORBIDDEN);
		assert_eq!(Error::concurrency_exceeded().status(), StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(Error::rate_limited().status(), StatusCode::TOO_MANY_REQUESTS);
		assert_eq!(Error::unknown_endpoint().status(), StatusCode::NOT_FOUND);
		assert_eq!(Error::bad_parameter("x").status(), StatusCode::BAD_REQUEST);
		assert_eq!(Error::datasource_inactive().status(), StatusCode::BAD_REQUEST);
		assert_eq!(Error::connection("refused").status(), StatusCode::INTERNAL_SERVER_ERROR);
	}

	#[test]
	fn missing_parameters_lists_all_names()
	{
		let error = Error::missing_parameters(vec!["q".to_owned(), "page".to_owned()]);

		assert_eq!(error.to_string(), "Missing required parameters: q, page");
	}
}
