//! Ephemeral ECDH key agreement.
//!
//! Each handshake uses a fresh server keypair on one of the NIST curves.
//! Public keys travel as uncompressed SEC1 points; the symmetric channel
//! key is `SHA-256(shared_secret)`.

use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display as EnumDisplay, EnumString};

use crate::crypto::CryptoError;

/// The elliptic curve used for a key exchange.
#[derive(
	Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, EnumDisplay,
)]
#[strum(ascii_case_insensitive)]
pub enum Curve {
	/// NIST P-256 (secp256r1)
	#[default]
	#[serde(rename = "p-256", alias = "p256")]
	#[strum(to_string = "p-256", serialize = "p256")]
	P256,
	/// NIST P-384 (secp384r1)
	#[serde(rename = "p-384", alias = "p384")]
	#[strum(to_string = "p-384", serialize = "p384")]
	P384,
	/// NIST P-521 (secp521r1)
	#[serde(rename = "p-521", alias = "p521")]
	#[strum(to_string = "p-521", serialize = "p521")]
	P521,
}

impl Curve {
	/// Parse a curve name, mapping unknown names to
	/// [`CryptoError::UnsupportedCurve`].
	///
	/// # Errors
	/// Returns [`CryptoError::UnsupportedCurve`] for anything other than
	/// P-256, P-384, or P-521.
	pub fn parse(name: &str) -> Result<Self, CryptoError> {
		name.parse()
			.map_err(|_| CryptoError::UnsupportedCurve(name.to_string()))
	}
}

enum Secret {
	P256(p256::ecdh::EphemeralSecret),
	P384(p384::ecdh::EphemeralSecret),
	P521(Box<p521::ecdh::EphemeralSecret>),
}

/// One side of an ephemeral ECDH exchange: a keypair on a chosen curve and
/// the agreement operation against a peer's SEC1-encoded public key.
pub struct KeyExchanger {
	curve: Curve,
	secret: Secret,
	public: Vec<u8>,
}

impl std::fmt::Debug for KeyExchanger {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		fmt.debug_struct("KeyExchanger")
			.field("curve", &self.curve)
			.field("public_len", &self.public.len())
			.finish_non_exhaustive()
	}
}

impl KeyExchanger {
	/// Generate a fresh keypair on `curve`.
	#[must_use]
	pub fn new(curve: Curve) -> Self {
		let (secret, public) = match curve {
			Curve::P256 => {
				let secret = p256::ecdh::EphemeralSecret::random(&mut OsRng);
				let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
				(Secret::P256(secret), public)
			}
			Curve::P384 => {
				let secret = p384::ecdh::EphemeralSecret::random(&mut OsRng);
				let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
				(Secret::P384(secret), public)
			}
			Curve::P521 => {
				let secret = p521::ecdh::EphemeralSecret::random(&mut OsRng);
				let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
				(Secret::P521(Box::new(secret)), public)
			}
		};

		Self {
			curve,
			secret,
			public,
		}
	}

	/// The curve this keypair lives on.
	#[must_use]
	pub const fn curve(&self) -> Curve {
		self.curve
	}

	/// This side's public key as an uncompressed SEC1 point.
	#[must_use]
	pub fn public_key(&self) -> &[u8] {
		&self.public
	}

	/// Compute the raw ECDH shared secret against a peer's SEC1-encoded
	/// public key.
	///
	/// # Errors
	/// Returns [`CryptoError::InvalidPublicKey`] if `peer_public` is not a
	/// valid point on this exchanger's curve.
	pub fn compute_shared_secret(&self, peer_public: &[u8]) -> Result<Vec<u8>, CryptoError> {
		match &self.secret {
			Secret::P256(secret) => {
				let peer = p256::PublicKey::from_sec1_bytes(peer_public)
					.map_err(|_| CryptoError::InvalidPublicKey)?;
				Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
			}
			Secret::P384(secret) => {
				let peer = p384::PublicKey::from_sec1_bytes(peer_public)
					.map_err(|_| CryptoError::InvalidPublicKey)?;
				Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
			}
			Secret::P521(secret) => {
				let peer = p521::PublicKey::from_sec1_bytes(peer_public)
					.map_err(|_| CryptoError::InvalidPublicKey)?;
				Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
			}
		}
	}

	/// Derive the 32-byte symmetric channel key: `SHA-256(shared_secret)`.
	///
	/// # Errors
	/// Returns [`CryptoError::InvalidPublicKey`] if `peer_public` is not a
	/// valid point on this exchanger's curve.
	pub fn derive_key(&self, peer_public: &[u8]) -> Result<[u8; 32], CryptoError> {
		let shared = self.compute_shared_secret(peer_public)?;
		Ok(Sha256::digest(&shared).into())
	}
}
