//! A middleware for catching panics.
//!
//! Normally, if an HTTP handler panics, the connection will simply be
//! closed. This middleware catches the panic and answers with the standard
//! error envelope at status 500 instead, so callers always get a response
//! in the documented shape.

use std::any::Any;

use axum::http;
use axum::response::IntoResponse;
use tower_http::catch_panic::{CatchPanicLayer, ResponseForPanic};

use crate::runtime;

/// Creates a middleware layer for catching panics and turning them into
/// responses.
pub fn layer() -> CatchPanicLayer<PanicHandler>
{
	CatchPanicLayer::custom(PanicHandler)
}

/// A custom panic handler for [`CatchPanicLayer`].
#[derive(Debug, Clone)]
pub struct PanicHandler;

impl ResponseForPanic for PanicHandler
{
	type ResponseBody = axum::body::Body;

	fn response_for_panic(
		&mut self,
		payload: Box<dyn Any + Send + 'static>,
	) -> http::Response<Self::ResponseBody>
	{
		let message = payload
			.downcast_ref::<String>()
			.map(String::as_str)
			.or_else(|| payload.downcast_ref::<&str>().copied())
			.unwrap_or("<non-string payload>");

		tracing::error!(target: "dbgate::audit_log", panic = %message, "handler panicked");

		runtime::Error::panic().into_response()
	}
}
