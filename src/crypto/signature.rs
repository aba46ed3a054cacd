//! RSA module-signature verification.
//!
//! Loadable agent modules are signed offline with the distributor's RSA
//! key (PKCS#1 v1.5, SHA-256). The server holds one verification key per
//! module name and checks signatures before a module is handed out or
//! trusted in a registration.

use std::collections::HashMap;

use parking_lot::RwLock;
use rsa::{
	pkcs1v15::{Signature, VerifyingKey},
	pkcs8::DecodePublicKey,
	sha2::Sha256,
	signature::Verifier,
	RsaPublicKey,
};

use crate::crypto::CryptoError;

/// Verifies detached RSA PKCS#1 v1.5 + SHA-256 signatures over module
/// payloads, keyed by module name.
pub struct ModuleVerifier {
	keys: RwLock<HashMap<String, VerifyingKey<Sha256>>>,
}

impl std::fmt::Debug for ModuleVerifier {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		fmt.debug_struct("ModuleVerifier")
			.field("modules", &self.keys.read().len())
			.finish_non_exhaustive()
	}
}

impl Default for ModuleVerifier {
	fn default() -> Self {
		Self::new()
	}
}

impl ModuleVerifier {
	/// Create a verifier with no registered keys.
	#[must_use]
	pub fn new() -> Self {
		Self {
			keys: RwLock::new(HashMap::new()),
		}
	}

	/// Register the verification key for `module` from an SPKI PEM
	/// (`-----BEGIN PUBLIC KEY-----`) document, replacing any previous key
	/// for that module.
	///
	/// # Errors
	/// Returns [`CryptoError::InvalidPublicKey`] if the PEM does not parse
	/// into an RSA public key.
	pub fn add_key_pem(&self, module: impl Into<String>, pem: &str) -> Result<(), CryptoError> {
		let key =
			RsaPublicKey::from_public_key_pem(pem).map_err(|_| CryptoError::InvalidPublicKey)?;
		self.keys
			.write()
			.insert(module.into(), VerifyingKey::new(key));
		Ok(())
	}

	/// Register an already-parsed verification key for `module`.
	pub fn add_key(&self, module: impl Into<String>, key: RsaPublicKey) {
		self.keys
			.write()
			.insert(module.into(), VerifyingKey::new(key));
	}

	/// Whether a key is registered for `module`.
	#[must_use]
	pub fn knows(&self, module: &str) -> bool {
		self.keys.read().contains_key(module)
	}

	/// Verify `signature` over `data` with the key registered for
	/// `module`.
	///
	/// # Errors
	/// - [`CryptoError::UnknownModule`] if no key is registered for
	///   `module`
	/// - [`CryptoError::InvalidSignature`] if the signature is malformed or
	///   does not verify
	pub fn verify(&self, module: &str, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
		let keys = self.keys.read();
		let key = keys
			.get(module)
			.ok_or_else(|| CryptoError::UnknownModule(module.to_string()))?;

		let signature =
			Signature::try_from(signature).map_err(|_| CryptoError::InvalidSignature)?;
		key.verify(data, &signature)
			.map_err(|_| CryptoError::InvalidSignature)
	}
}

#[cfg(test)]
mod tests {
	use rsa::{
		pkcs1v15::SigningKey,
		signature::{SignatureEncoding, Signer},
		RsaPrivateKey,
	};

	use super::*;

	fn keypair() -> (SigningKey<Sha256>, RsaPublicKey) {
		let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
		let public = private.to_public_key();
		(SigningKey::new(private), public)
	}

	#[test]
	fn valid_signature_verifies() {
		let (signer, public) = keypair();
		let verifier = ModuleVerifier::new();
		verifier.add_key("shell", public);

		let data = b"module payload";
		let signature = signer.sign(data).to_vec();

		verifier.verify("shell", data, &signature).unwrap();
	}

	#[test]
	fn tampered_data_rejected() {
		let (signer, public) = keypair();
		let verifier = ModuleVerifier::new();
		verifier.add_key("shell", public);

		let signature = signer.sign(b"module payload").to_vec();

		assert_eq!(
			verifier.verify("shell", b"other payload", &signature),
			Err(CryptoError::InvalidSignature)
		);
	}

	#[test]
	fn unknown_module_rejected() {
		let verifier = ModuleVerifier::new();
		assert!(matches!(
			verifier.verify("ghost", b"data", b"sig"),
			Err(CryptoError::UnknownModule(_))
		));
	}

	#[test]
	fn bad_pem_rejected() {
		let verifier = ModuleVerifier::new();
		assert_eq!(
			verifier.add_key_pem("shell", "not a pem"),
			Err(CryptoError::InvalidPublicKey)
		);
		assert!(!verifier.knows("shell"));
	}
}
