//! Cryptographic primitives for the per-agent secure channel: key-id-bound
//! AEAD framing, ephemeral ECDH key agreement, the key rotation scheduler,
//! the forward secrecy handler, and RSA module-signature verification.

pub mod aead;
pub mod exchange;
pub mod forward;
pub mod rotation;
pub mod signature;
pub mod state;

use serde::{Deserialize, Serialize};
use strum::{Display as EnumDisplay, EnumString};

pub use self::{
	aead::Encrypter,
	exchange::{Curve, KeyExchanger},
	forward::ForwardSecrecy,
	rotation::{KeyRotator, RotationConfig},
	signature::ModuleVerifier,
	state::ClientCrypto,
};

/// The errors produced by the cryptographic layer. Each variant corresponds
/// to one rejection condition of the secure channel; all of them surface to
/// the caller, and a per-agent decrypt failure drops the offending frame
/// without ending the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CryptoError {
	/// A symmetric key had the wrong length or could not be used to build a
	/// cipher
	#[error("invalid key: {0}")]
	InvalidKey(String),
	/// Input data was empty, truncated, or otherwise unusable
	#[error("invalid data: {0}")]
	InvalidData(String),
	/// A frame's nonce was missing or had the wrong length
	#[error("invalid nonce")]
	InvalidNonce,
	/// The requested or negotiated encryption type is not supported for this
	/// operation
	#[error("unsupported encryption type: {0}")]
	UnsupportedEncryption(String),
	/// AEAD authentication or an RSA signature check failed
	#[error("invalid signature")]
	InvalidSignature,
	/// A peer public key could not be parsed on the negotiated curve
	#[error("invalid public key")]
	InvalidPublicKey,
	/// The named curve is not one of P-256, P-384, or P-521
	#[error("unsupported curve: {0}")]
	UnsupportedCurve(String),
	/// No verification key is registered under the requested module name
	#[error("unknown module: {0}")]
	UnknownModule(String),
	/// No crypto state is registered for the requested agent
	#[error("unknown client: {0}")]
	UnknownClient(String),
}

/// The symmetric encryption negotiated for an agent's channel. Serialized
/// in envelope headers and key-exchange frames by its lowercase name.
#[derive(
	Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, EnumDisplay,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum EncryptionKind {
	/// No encryption; payloads pass through the channel unchanged
	#[default]
	None,
	/// AES-256-GCM
	Aes,
	/// ChaCha20-Poly1305
	Chacha20,
}

impl EncryptionKind {
	/// Whether this kind actually encrypts payloads
	#[must_use]
	pub const fn is_encrypted(self) -> bool {
		!matches!(self, Self::None)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encryption_kind_parse() {
		assert_eq!("aes".parse(), Ok(EncryptionKind::Aes));
		assert_eq!("chacha20".parse(), Ok(EncryptionKind::Chacha20));
		assert_eq!("none".parse(), Ok(EncryptionKind::None));
		assert_eq!("AES".parse(), Ok(EncryptionKind::Aes));
		assert!("rot13".parse::<EncryptionKind>().is_err());
	}

	#[test]
	fn encryption_kind_display() {
		assert_eq!(EncryptionKind::Aes.to_string(), "aes");
		assert_eq!(EncryptionKind::Chacha20.to_string(), "chacha20");
		assert_eq!(EncryptionKind::None.to_string(), "none");
	}

	#[test]
	fn encryption_kind_json() {
		assert_eq!(
			serde_json::to_string(&EncryptionKind::Chacha20).unwrap(),
			"\"chacha20\""
		);
		assert_eq!(
			serde_json::from_str::<EncryptionKind>("\"aes\"").unwrap(),
			EncryptionKind::Aes
		);
	}
}
