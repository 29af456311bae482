//! Process-wide cryptography helpers.
//!
//! Three concerns live here: hashing verification for client secrets,
//! signing/verification of gateway JWTs, and symmetric encryption of
//! sensitive configuration fields (datasource passwords). All key material
//! is derived from the single process secret at startup.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Token type claim carried by gateway JWTs so they cannot be replayed
/// against other token-issuing surfaces sharing the secret.
const TOKEN_TYPE_GATEWAY: &str = "gateway";

/// The errors that can occur in this module.
#[derive(Debug, Error)]
pub enum Error
{
	/// A JWT could not be created or verified.
	#[error("jwt error: {0}")]
	Jwt(#[from] jsonwebtoken::errors::Error),

	/// A stored value could not be decrypted with the process key.
	#[error("failed to decrypt stored value")]
	Decrypt,

	/// A stored hash was malformed.
	#[error("malformed secret hash: {0}")]
	MalformedHash(#[from] bcrypt::BcryptError),
}

/// Claims carried by a gateway JWT.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenClaims
{
	/// The authenticated client's `client_id`.
	pub sub: String,

	/// Expiry as UNIX seconds.
	pub exp: u64,

	/// Token type discriminator, always `"gateway"`.
	#[serde(rename = "type")]
	pub token_type: String,
}

/// Key material derived once from the process secret.
///
/// Cheap to clone; construct at startup and pass through the application
/// state.
#[derive(Clone)]
pub struct Keyring
{
	inner: Arc<Inner>,
}

#[allow(clippy::missing_docs_in_private_items)]
struct Inner
{
	encoding_key: jsonwebtoken::EncodingKey,
	decoding_key: jsonwebtoken::DecodingKey,
	fernet: fernet::Fernet,
}

impl Keyring
{
	/// Derives all key material from the process secret.
	pub fn new(secret_key: &str) -> Self
	{
		// Fernet wants a urlsafe-base64 32-byte key; derive it from the
		// secret the same way regardless of the secret's own length.
		let digest = Sha256::digest(secret_key.as_bytes());
		let fernet_key = URL_SAFE.encode(digest);
		let fernet = fernet::Fernet::new(&fernet_key)
			.unwrap_or_else(|| unreachable!("sha-256 digest is always a valid fernet key"));

		Self {
			inner: Arc::new(Inner {
				encoding_key: jsonwebtoken::EncodingKey::from_secret(secret_key.as_bytes()),
				decoding_key: jsonwebtoken::DecodingKey::from_secret(secret_key.as_bytes()),
				fernet,
			}),
		}
	}

	/// Issues a gateway JWT for the given client.
	///
	/// Returns the encoded token and its expiry as UNIX seconds.
	pub fn issue_token(&self, client_id: &str, expires_in_seconds: u64)
	-> Result<(String, u64), Error>
	{
		let expires_at = unix_now() + expires_in_seconds;
		let claims = TokenClaims {
			sub: client_id.to_owned(),
			exp: expires_at,
			token_type: TOKEN_TYPE_GATEWAY.to_owned(),
		};

		let token = jsonwebtoken::encode(
			&jsonwebtoken::Header::default(),
			&claims,
			&self.inner.encoding_key,
		)?;

		Ok((token, expires_at))
	}

	/// Verifies a gateway JWT and returns the subject (`client_id`).
	///
	/// Rejects expired tokens and tokens whose `type` claim is not
	/// `"gateway"`.
	pub fn verify_token(&self, token: &str) -> Result<String, Error>
	{
		let validation = jsonwebtoken::Validation::default();
		let data =
			jsonwebtoken::decode::<TokenClaims>(token, &self.inner.decoding_key, &validation)?;

		if data.claims.token_type != TOKEN_TYPE_GATEWAY {
			return Err(Error::Jwt(jsonwebtoken::errors::ErrorKind::InvalidToken.into()));
		}

		Ok(data.claims.sub)
	}

	/// Verifies a plaintext client secret against its stored bcrypt hash.
	pub fn verify_secret(&self, plain: &str, hashed: &str) -> bool
	{
		bcrypt::verify(plain, hashed).unwrap_or(false)
	}

	/// Hashes a client secret for storage.
	pub fn hash_secret(&self, plain: &str) -> Result<String, Error>
	{
		bcrypt::hash(plain, bcrypt::DEFAULT_COST).map_err(Error::MalformedHash)
	}

	/// Encrypts a sensitive configuration value for storage.
	pub fn encrypt(&self, plain: &str) -> String
	{
		if plain.is_empty() {
			return String::new();
		}

		self.inner.fernet.encrypt(plain.as_bytes())
	}

	/// Decrypts a stored configuration value.
	///
	/// All stored passwords must be encrypted; there is no plaintext
	/// fallback.
	pub fn decrypt(&self, encrypted: &str) -> Result<String, Error>
	{
		if encrypted.is_empty() {
			return Ok(String::new());
		}

		let bytes = self.inner.fernet.decrypt(encrypted).map_err(|_| Error::Decrypt)?;

		String::from_utf8(bytes).map_err(|_| Error::Decrypt)
	}
}

impl std::fmt::Debug for Keyring
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		f.debug_tuple("Keyring").finish_non_exhaustive()
	}
}

/// The current wall-clock time as UNIX seconds.
fn unix_now() -> u64
{
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|elapsed| elapsed.as_secs())
		.unwrap_or_default()
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn encrypt_decrypt_round_trips()
	{
		let keyring = Keyring::new("test-secret");
		let encrypted = keyring.encrypt("hunter2");

		assert_ne!(encrypted, "hunter2");
		assert_eq!(keyring.decrypt(&encrypted).unwrap(), "hunter2");
	}

	#[test]
	fn decrypt_rejects_garbage()
	{
		let keyring = Keyring::new("test-secret");

		assert!(keyring.decrypt("not-a-fernet-token").is_err());
	}

	#[test]
	fn decrypt_rejects_other_keys()
	{
		let keyring = Keyring::new("test-secret");
		let other = Keyring::new("other-secret");
		let encrypted = keyring.encrypt("hunter2");

		assert!(other.decrypt(&encrypted).is_err());
	}

	#[test]
	fn tokens_round_trip()
	{
		let keyring = Keyring::new("test-secret");
		let (token, expires_at) = keyring.issue_token("acme", 60).unwrap();

		assert!(expires_at > unix_now());
		assert_eq!(keyring.verify_token(&token).unwrap(), "acme");
	}

	#[test]
	fn tokens_from_other_secrets_are_rejected()
	{
		let keyring = Keyring::new("test-secret");
		let other = Keyring::new("other-secret");
		let (token, _) = other.issue_token("acme", 60).unwrap();

		assert!(keyring.verify_token(&token).is_err());
	}
}
