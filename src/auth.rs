//! Session authentication: HMAC-SHA-256 over raw bytes, HS256 JWTs for
//! registered agents, and basic-auth helpers for optional username /
//! password surfaces.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::util::unix_now;

type HmacSha256 = Hmac<Sha256>;

/// The issuer claim stamped into every generated token.
const TOKEN_ISSUER: &str = "server";

/// The errors produced by the authenticator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AuthError {
	/// The shared secret is empty; no MAC or token can be produced or
	/// checked
	#[error("authentication secret is empty")]
	EmptySecret,
	/// An HMAC did not match the data it claims to authenticate
	#[error("invalid signature")]
	InvalidSignature,
	/// A token failed to parse or verify
	#[error("invalid token")]
	InvalidToken,
	/// A token parsed and verified but its expiry has passed
	#[error("expired token")]
	ExpiredToken,
	/// JWT support is disabled by configuration
	#[error("jwt authentication is not enabled")]
	JwtDisabled,
	/// A basic-auth header was malformed
	#[error("invalid credentials")]
	InvalidCredentials,
}

/// Authenticator configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthConfig {
	/// Shared secret keying both HMACs and JWTs. Must be non-empty for any
	/// operation to succeed.
	pub secret: Vec<u8>,
	/// Lifetime of generated JWTs.
	pub token_ttl: Duration,
	/// Whether JWT generation/verification is enabled.
	pub enable_jwt: bool,
}

impl Default for AuthConfig {
	fn default() -> Self {
		Self {
			secret: Vec::new(),
			token_ttl: Duration::from_secs(24 * 60 * 60),
			enable_jwt: true,
		}
	}
}

/// The claims carried by a tether session token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
	/// The agent the token was issued to
	pub client_id: String,
	/// The role granted to the agent
	pub role: String,
	/// Issued-at, unix seconds
	pub iat: u64,
	/// Not-before, unix seconds
	pub nbf: u64,
	/// Expiry, unix seconds
	pub exp: u64,
	/// Issuer, always `"server"`
	pub iss: String,
	/// Subject, same as `client_id`
	pub sub: String,
}

/// HMAC and JWT session authentication keyed by one shared secret.
#[derive(Clone)]
pub struct Authenticator {
	config: AuthConfig,
}

impl std::fmt::Debug for Authenticator {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		fmt.debug_struct("Authenticator")
			.field("secret_len", &self.config.secret.len())
			.field("token_ttl", &self.config.token_ttl)
			.field("enable_jwt", &self.config.enable_jwt)
			.finish()
	}
}

impl Authenticator {
	/// Create an authenticator from its configuration.
	#[must_use]
	pub const fn new(config: AuthConfig) -> Self {
		Self { config }
	}

	/// Whether JWT operations are enabled.
	#[must_use]
	pub const fn jwt_enabled(&self) -> bool {
		self.config.enable_jwt
	}

	fn mac(&self) -> Result<HmacSha256, AuthError> {
		if self.config.secret.is_empty() {
			return Err(AuthError::EmptySecret);
		}
		Ok(HmacSha256::new_from_slice(&self.config.secret).expect("hmac accepts any key length"))
	}

	/// Compute the HMAC-SHA-256 of `data` under the shared secret.
	///
	/// # Errors
	/// Returns [`AuthError::EmptySecret`] when no secret is configured.
	pub fn generate_hmac(&self, data: &[u8]) -> Result<Vec<u8>, AuthError> {
		let mut mac = self.mac()?;
		mac.update(data);
		Ok(mac.finalize().into_bytes().to_vec())
	}

	/// Verify an HMAC-SHA-256 over `data` in constant time.
	///
	/// # Errors
	/// Returns [`AuthError::EmptySecret`] when no secret is configured and
	/// [`AuthError::InvalidSignature`] on mismatch.
	pub fn verify_hmac(&self, data: &[u8], tag: &[u8]) -> Result<(), AuthError> {
		let mut mac = self.mac()?;
		mac.update(data);
		mac.verify_slice(tag)
			.map_err(|_| AuthError::InvalidSignature)
	}

	/// Generate an HS256 session token for `client_id` with the given
	/// role, expiring after the configured TTL.
	///
	/// # Errors
	/// Returns [`AuthError::JwtDisabled`] when JWTs are disabled and
	/// [`AuthError::EmptySecret`] when no secret is configured.
	pub fn generate_jwt(&self, client_id: &str, role: &str) -> Result<String, AuthError> {
		if !self.config.enable_jwt {
			return Err(AuthError::JwtDisabled);
		}
		if self.config.secret.is_empty() {
			return Err(AuthError::EmptySecret);
		}

		let now = unix_now();
		let claims = Claims {
			client_id: client_id.to_string(),
			role: role.to_string(),
			iat: now,
			nbf: now,
			exp: now + self.config.token_ttl.as_secs(),
			iss: TOKEN_ISSUER.to_string(),
			sub: client_id.to_string(),
		};

		encode(
			&Header::new(Algorithm::HS256),
			&claims,
			&EncodingKey::from_secret(&self.config.secret),
		)
		.map_err(|_| AuthError::InvalidToken)
	}

	/// Verify an HS256 session token and return its claims.
	///
	/// The expiry is checked twice: once by the library during decoding and
	/// once explicitly against the decoded claim, so an expired token is
	/// always reported as [`AuthError::ExpiredToken`] and never as the
	/// generic [`AuthError::InvalidToken`].
	///
	/// # Errors
	/// [`AuthError::JwtDisabled`], [`AuthError::EmptySecret`],
	/// [`AuthError::ExpiredToken`], or [`AuthError::InvalidToken`].
	pub fn verify_jwt(&self, token: &str) -> Result<Claims, AuthError> {
		if !self.config.enable_jwt {
			return Err(AuthError::JwtDisabled);
		}
		if self.config.secret.is_empty() {
			return Err(AuthError::EmptySecret);
		}

		let mut validation = Validation::new(Algorithm::HS256);
		validation.leeway = 0;
		validation.validate_nbf = true;
		validation.set_required_spec_claims(&["exp"]);

		let data = decode::<Claims>(
			token,
			&DecodingKey::from_secret(&self.config.secret),
			&validation,
		)
		.map_err(|err| match err.kind() {
			jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
			_ => AuthError::InvalidToken,
		})?;

		if data.claims.exp <= unix_now() {
			return Err(AuthError::ExpiredToken);
		}

		Ok(data.claims)
	}

	/// Build a `Basic` authorization header value from a username and
	/// password.
	#[must_use]
	pub fn basic_authorization(username: &str, password: &str) -> String {
		format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
	}

	/// Parse a `Basic` authorization header value into its username and
	/// password.
	///
	/// # Errors
	/// Returns [`AuthError::InvalidCredentials`] for anything that is not a
	/// well-formed basic-auth header.
	pub fn parse_basic_authorization(header: &str) -> Result<(String, String), AuthError> {
		let encoded = header
			.strip_prefix("Basic ")
			.ok_or(AuthError::InvalidCredentials)?;
		let decoded = BASE64
			.decode(encoded)
			.map_err(|_| AuthError::InvalidCredentials)?;
		let decoded = String::from_utf8(decoded).map_err(|_| AuthError::InvalidCredentials)?;
		let (username, password) = decoded
			.split_once(':')
			.ok_or(AuthError::InvalidCredentials)?;

		Ok((username.to_string(), password.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn authenticator() -> Authenticator {
		Authenticator::new(AuthConfig {
			secret: b"a long and random shared secret".to_vec(),
			..AuthConfig::default()
		})
	}

	#[test]
	fn hmac_round_trip() {
		let auth = authenticator();
		let tag = auth.generate_hmac(b"payload").unwrap();
		auth.verify_hmac(b"payload", &tag).unwrap();
	}

	#[test]
	fn hmac_tamper_rejected() {
		let auth = authenticator();
		let tag = auth.generate_hmac(b"payload").unwrap();
		assert_eq!(
			auth.verify_hmac(b"other payload", &tag),
			Err(AuthError::InvalidSignature)
		);
	}

	#[test]
	fn empty_secret_rejected() {
		let auth = Authenticator::new(AuthConfig::default());
		assert_eq!(auth.generate_hmac(b"x"), Err(AuthError::EmptySecret));
		assert_eq!(
			auth.generate_jwt("c1", "agent"),
			Err(AuthError::EmptySecret)
		);
	}

	#[test]
	fn jwt_round_trip() {
		let auth = authenticator();
		let token = auth.generate_jwt("c1", "agent").unwrap();
		let claims = auth.verify_jwt(&token).unwrap();

		assert_eq!(claims.client_id, "c1");
		assert_eq!(claims.role, "agent");
		assert_eq!(claims.sub, "c1");
		assert_eq!(claims.iss, "server");
		assert!(claims.exp > claims.iat);
	}

	#[test]
	fn expired_jwt_is_distinct() {
		let auth = authenticator();
		let now = unix_now();
		let claims = Claims {
			client_id: "c1".to_string(),
			role: "agent".to_string(),
			iat: now - 120,
			nbf: now - 120,
			exp: now - 60,
			iss: "server".to_string(),
			sub: "c1".to_string(),
		};
		let token = encode(
			&Header::new(Algorithm::HS256),
			&claims,
			&EncodingKey::from_secret(b"a long and random shared secret"),
		)
		.unwrap();

		assert_eq!(auth.verify_jwt(&token), Err(AuthError::ExpiredToken));
	}

	#[test]
	fn garbage_jwt_rejected() {
		let auth = authenticator();
		assert_eq!(
			auth.verify_jwt("not.a.token"),
			Err(AuthError::InvalidToken)
		);
	}

	#[test]
	fn wrong_algorithm_rejected() {
		let auth = authenticator();
		let now = unix_now();
		let claims = Claims {
			client_id: "c1".to_string(),
			role: "agent".to_string(),
			iat: now,
			nbf: now,
			exp: now + 60,
			iss: "server".to_string(),
			sub: "c1".to_string(),
		};
		let token = encode(
			&Header::new(Algorithm::HS384),
			&claims,
			&EncodingKey::from_secret(b"a long and random shared secret"),
		)
		.unwrap();

		assert_eq!(auth.verify_jwt(&token), Err(AuthError::InvalidToken));
	}

	#[test]
	fn disabled_jwt_rejected() {
		let auth = Authenticator::new(AuthConfig {
			secret: b"secret".to_vec(),
			enable_jwt: false,
			..AuthConfig::default()
		});
		assert_eq!(
			auth.generate_jwt("c1", "agent"),
			Err(AuthError::JwtDisabled)
		);
		assert_eq!(auth.verify_jwt("whatever"), Err(AuthError::JwtDisabled));
	}

	#[test]
	fn basic_auth_round_trip() {
		let header = Authenticator::basic_authorization("operator", "hunter2");
		let (user, pass) = Authenticator::parse_basic_authorization(&header).unwrap();
		assert_eq!(user, "operator");
		assert_eq!(pass, "hunter2");
	}

	#[test]
	fn basic_auth_malformed() {
		assert_eq!(
			Authenticator::parse_basic_authorization("Bearer abc"),
			Err(AuthError::InvalidCredentials)
		);
		assert_eq!(
			Authenticator::parse_basic_authorization("Basic !!!"),
			Err(AuthError::InvalidCredentials)
		);
	}
}
