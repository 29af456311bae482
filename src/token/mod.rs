//! Gateway token issuance.
//!
//! Clients exchange their `client_id`/`client_secret` for a JWT via
//! `POST /token/generate` (OAuth2-style client credentials, JSON or form
//! body). A legacy `GET /token/generate?clientId&secret` form is kept for
//! callers migrated from older deployments.

use axum::extract::FromRef;

use crate::crypto::Keyring;
use crate::database::Store;

mod http;

/// A service issuing gateway JWTs.
#[derive(Clone, FromRef)]
#[allow(clippy::missing_docs_in_private_items)]
pub struct TokenService
{
	store: Store,
	keyring: Keyring,
	expire_seconds: u64,
}

impl TokenService
{
	/// Creates a new [`TokenService`].
	pub fn new(store: Store, keyring: Keyring, expire_seconds: u64) -> Self
	{
		Self { store, keyring, expire_seconds }
	}
}

impl std::fmt::Debug for TokenService
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_struct("TokenService").field("expire_seconds", &self.expire_seconds).finish()
	}
}
