//! HTTP handlers for this service.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::TokenService;
use crate::gateway::response::error_envelope;

impl From<TokenService> for Router
{
	fn from(svc: TokenService) -> Self
	{
		Router::new()
			.route("/generate", routing::post(generate).get(generate_legacy))
			.with_state(svc)
	}
}

/// Request body of `POST /token/generate`.
#[derive(Debug, Deserialize)]
struct TokenRequest
{
	#[serde(default)]
	client_id: String,

	#[serde(default)]
	client_secret: String,

	#[serde(default = "default_grant_type")]
	grant_type: String,
}

#[allow(clippy::missing_docs_in_private_items)]
fn default_grant_type() -> String
{
	String::from("client_credentials")
}

/// Response body of `POST /token/generate`.
#[derive(Debug, Serialize)]
struct TokenResponse
{
	access_token: String,
	token_type: &'static str,
	expires_in: u64,
}

/// `POST /token/generate`: client credentials in, JWT out.
///
/// Accepts `application/json` or `application/x-www-form-urlencoded`. Does
/// not require `Authorization` (this is where the token is obtained).
async fn generate(State(svc): State<TokenService>, headers: HeaderMap, body: Bytes) -> Response
{
	let is_json = headers
		.get(header::CONTENT_TYPE)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.parse::<mime::Mime>().ok())
		.is_some_and(|content_type| {
			content_type.essence_str() == mime::APPLICATION_JSON.essence_str()
		});

	let request = if is_json {
		match serde_json::from_slice::<TokenRequest>(&body) {
			Ok(request) => request,
			Err(_) => {
				return bad_request("Invalid JSON body");
			}
		}
	} else {
		match serde_html_form::from_bytes::<TokenRequest>(&body) {
			Ok(request) => request,
			Err(_) => {
				return bad_request("Invalid form body");
			}
		}
	};

	if request.grant_type != "client_credentials" {
		return bad_request("Unsupported grant_type");
	}

	match issue(&svc, &request.client_id, &request.client_secret).await {
		Ok((access_token, _)) => {
			Json(TokenResponse {
				access_token,
				token_type: "bearer",
				expires_in: svc.expire_seconds,
			})
			.into_response()
		}
		Err(response) => response,
	}
}

/// Query of the legacy `GET /token/generate`.
#[derive(Debug, Deserialize)]
struct LegacyTokenQuery
{
	#[serde(rename = "clientId")]
	client_id: String,

	secret: String,
}

/// Response of the legacy `GET /token/generate`.
#[derive(Debug, Serialize)]
struct LegacyTokenResponse
{
	#[serde(rename = "expireAt")]
	expire_at: u64,

	token: String,
}

/// `GET /token/generate?clientId=…&secret=…` (legacy migration shape).
async fn generate_legacy(
	State(svc): State<TokenService>,
	Query(query): Query<LegacyTokenQuery>,
) -> Response
{
	match issue(&svc, &query.client_id, &query.secret).await {
		Ok((token, expire_at)) => {
			Json(LegacyTokenResponse { expire_at, token }).into_response()
		}
		Err(response) => response,
	}
}

/// Verifies the credentials and issues a token.
async fn issue(
	svc: &TokenService,
	client_id: &str,
	client_secret: &str,
) -> Result<(String, u64), Response>
{
	let client = match svc.store.client_by_client_id(client_id).await {
		Ok(client) => client,
		Err(error) => {
			tracing::error!(%error, "client lookup failed during token issuance");

			return Err((
				StatusCode::INTERNAL_SERVER_ERROR,
				Json(error_envelope("token issuance failed")),
			)
				.into_response());
		}
	};

	let Some(client) = client else {
		return Err(invalid_credentials());
	};

	if !svc.keyring.verify_secret(client_secret, &client.client_secret) {
		return Err(invalid_credentials());
	}

	svc.keyring
		.issue_token(&client.client_id, svc.expire_seconds)
		.map_err(|error| {
			tracing::error!(%error, "jwt encoding failed");

			(StatusCode::INTERNAL_SERVER_ERROR, Json(error_envelope("token issuance failed")))
				.into_response()
		})
}

#[allow(clippy::missing_docs_in_private_items)]
fn bad_request(message: &str) -> Response
{
	(StatusCode::BAD_REQUEST, Json(error_envelope(message))).into_response()
}

#[allow(clippy::missing_docs_in_private_items)]
fn invalid_credentials() -> Response
{
	(
		StatusCode::UNAUTHORIZED,
		Json(error_envelope("Invalid client_id or client_secret")),
	)
		.into_response()
}
