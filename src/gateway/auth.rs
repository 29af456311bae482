//! Client authentication for private endpoints.
//!
//! Three schemes are accepted, in order: `Authorization: Bearer <jwt>`
//! (signed with the process secret, subject = `client_id`),
//! `Authorization: Basic base64(client_id:client_secret)`, and (when
//! enabled) `X-API-Key: base64(client_id:client_secret)`. The resolved
//! client must be active; authenticated clients must additionally hold a
//! group or direct grant for the endpoint.

use axum::http::HeaderMap;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use uuid::Uuid;

use crate::crypto::Keyring;
use crate::database::{Client, Store};
use crate::runtime;

/// Authenticates gateway clients from request headers.
#[derive(Clone)]
pub struct ClientAuthenticator
{
	store: Store,
	keyring: Keyring,
	x_api_key_enabled: bool,
}

impl ClientAuthenticator
{
	/// Creates an authenticator.
	pub fn new(store: Store, keyring: Keyring, x_api_key_enabled: bool) -> Self
	{
		Self { store, keyring, x_api_key_enabled }
	}

	/// Tries to authenticate the request.
	///
	/// Returns `Ok(None)` when no scheme yields an active client; the
	/// caller decides whether that is fatal (it is for private endpoints).
	#[tracing::instrument(level = "debug", skip_all, err(level = "warn"))]
	pub async fn authenticate(&self, headers: &HeaderMap) -> runtime::Result<Option<Client>>
	{
		let authorization = headers
			.get(axum::http::header::AUTHORIZATION)
			.and_then(|value| value.to_str().ok())
			.unwrap_or_default();

		if let Some(token) = authorization.strip_prefix("Bearer ") {
			let token = token.trim();

			if token.is_empty() {
				return Ok(None);
			}

			let Ok(client_id) = self.keyring.verify_token(token) else {
				return Ok(None);
			};

			return Ok(self.store.client_by_client_id(&client_id).await?);
		}

		if let Some(encoded) = authorization.strip_prefix("Basic ") {
			return self.authenticate_with_secret(encoded.trim()).await;
		}

		if self.x_api_key_enabled {
			let api_key = headers
				.get("X-API-Key")
				.and_then(|value| value.to_str().ok())
				.map(str::trim)
				.unwrap_or_default();

			if !api_key.is_empty() {
				return self.authenticate_with_secret(api_key).await;
			}
		}

		Ok(None)
	}

	/// Whether the client holds a group or direct grant for the endpoint.
	#[tracing::instrument(level = "debug", skip(self), err(level = "warn"))]
	pub async fn authorize(&self, client_id: Uuid, endpoint_id: Uuid) -> runtime::Result<bool>
	{
		Ok(self.store.client_has_endpoint_grant(client_id, endpoint_id).await?)
	}

	/// Shared path for Basic and X-API-Key: decode, look up, verify secret.
	async fn authenticate_with_secret(&self, encoded: &str) -> runtime::Result<Option<Client>>
	{
		let Some((client_id, client_secret)) = decode_credentials(encoded) else {
			return Ok(None);
		};

		let Some(client) = self.store.client_by_client_id(&client_id).await? else {
			return Ok(None);
		};

		if !self.keyring.verify_secret(&client_secret, &client.client_secret) {
			return Ok(None);
		}

		Ok(Some(client))
	}
}

impl std::fmt::Debug for ClientAuthenticator
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_struct("ClientAuthenticator")
			.field("x_api_key_enabled", &self.x_api_key_enabled)
			.finish_non_exhaustive()
	}
}

/// Decodes `base64(client_id:client_secret)`.
///
/// Returns `None` for invalid base64, invalid UTF-8, a missing colon, or an
/// empty id/secret.
fn decode_credentials(encoded: &str) -> Option<(String, String)>
{
	let decoded = BASE64.decode(encoded).ok()?;
	let decoded = String::from_utf8(decoded).ok()?;
	let (client_id, client_secret) = decoded.split_once(':')?;
	let client_id = client_id.trim();

	if client_id.is_empty() || client_secret.is_empty() {
		return None;
	}

	Some((client_id.to_owned(), client_secret.to_owned()))
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn decode_credentials_accepts_well_formed_pairs()
	{
		let encoded = BASE64.encode("acme:s3cret");

		assert_eq!(
			decode_credentials(&encoded),
			Some((String::from("acme"), String::from("s3cret"))),
		);
	}

	#[test]
	fn decode_credentials_keeps_colons_in_secret()
	{
		let encoded = BASE64.encode("acme:se:cr:et");

		assert_eq!(
			decode_credentials(&encoded),
			Some((String::from("acme"), String::from("se:cr:et"))),
		);
	}

	#[test]
	fn decode_credentials_rejects_malformed_input()
	{
		assert_eq!(decode_credentials("not base64!!!"), None);
		assert_eq!(decode_credentials(&BASE64.encode("no-colon")), None);
		assert_eq!(decode_credentials(&BASE64.encode(":empty-id")), None);
		assert_eq!(decode_credentials(&BASE64.encode("empty-secret:")), None);
	}
}
