//! Key-id-bound AEAD framing.
//!
//! Every ciphertext frame on the wire has the shape
//! `[key_id:4 big-endian][nonce:12][aead_ciphertext_with_tag]`, with the
//! 4 key-id bytes doubling as the AEAD's associated data. Binding the key
//! id into the tag means a frame produced under one key can never be
//! accepted under a state with a different key id, even if the raw key
//! bytes were somehow reused.

use aes_gcm::{
	aead::{Aead, OsRng, Payload},
	AeadCore, Aes256Gcm, KeyInit,
};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;

use crate::crypto::{CryptoError, EncryptionKind};

/// AEAD nonce length in bytes, shared by AES-256-GCM and
/// ChaCha20-Poly1305.
pub const NONCE_LEN: usize = 12;

/// Symmetric key length in bytes (both supported ciphers are 256-bit).
pub const KEY_LEN: usize = 32;

/// AEAD authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Frame header length: the big-endian key id.
pub const KEY_ID_LEN: usize = 4;

enum Cipher {
	Aes(Box<Aes256Gcm>),
	Chacha20(Box<ChaCha20Poly1305>),
}

/// A symmetric encrypter bound to a single key and key id. Frames it
/// produces embed the key id; frames it consumes must carry the same id.
///
/// The encrypter is cheap to share behind a read lock; encryption and
/// decryption take `&self`.
pub struct Encrypter {
	cipher: Cipher,
	key_id: u32,
}

impl std::fmt::Debug for Encrypter {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		fmt.debug_struct("Encrypter")
			.field("kind", &self.kind())
			.field("key_id", &self.key_id)
			.finish_non_exhaustive()
	}
}

impl Encrypter {
	/// Create an AES-256-GCM encrypter from a 32-byte key.
	///
	/// # Errors
	/// Returns [`CryptoError::InvalidKey`] if `key` is not exactly 32 bytes.
	pub fn aes(key: &[u8], key_id: u32) -> Result<Self, CryptoError> {
		let cipher = Aes256Gcm::new_from_slice(key)
			.map_err(|_| CryptoError::InvalidKey(format!("AES-256 key must be {KEY_LEN} bytes")))?;

		Ok(Self {
			cipher: Cipher::Aes(Box::new(cipher)),
			key_id,
		})
	}

	/// Create a ChaCha20-Poly1305 encrypter from a 32-byte key.
	///
	/// # Errors
	/// Returns [`CryptoError::InvalidKey`] if `key` is not exactly 32 bytes.
	pub fn chacha20(key: &[u8], key_id: u32) -> Result<Self, CryptoError> {
		let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| {
			CryptoError::InvalidKey(format!("ChaCha20 key must be {KEY_LEN} bytes"))
		})?;

		Ok(Self {
			cipher: Cipher::Chacha20(Box::new(cipher)),
			key_id,
		})
	}

	/// Create an encrypter of the given kind from a 32-byte key.
	///
	/// # Errors
	/// Returns [`CryptoError::UnsupportedEncryption`] for
	/// [`EncryptionKind::None`] and [`CryptoError::InvalidKey`] for a key of
	/// the wrong length.
	pub fn new(kind: EncryptionKind, key: &[u8], key_id: u32) -> Result<Self, CryptoError> {
		match kind {
			EncryptionKind::Aes => Self::aes(key, key_id),
			EncryptionKind::Chacha20 => Self::chacha20(key, key_id),
			EncryptionKind::None => {
				Err(CryptoError::UnsupportedEncryption(kind.to_string()))
			}
		}
	}

	/// Create an encrypter of the given kind with a freshly generated
	/// random key. Used by the key rotation scheduler.
	///
	/// # Errors
	/// Returns [`CryptoError::UnsupportedEncryption`] for
	/// [`EncryptionKind::None`].
	pub fn random(kind: EncryptionKind, key_id: u32) -> Result<Self, CryptoError> {
		let mut key = [0u8; KEY_LEN];
		rand::rngs::OsRng.fill_bytes(&mut key);
		Self::new(kind, &key, key_id)
	}

	/// The encryption kind of this encrypter.
	#[must_use]
	pub const fn kind(&self) -> EncryptionKind {
		match self.cipher {
			Cipher::Aes(_) => EncryptionKind::Aes,
			Cipher::Chacha20(_) => EncryptionKind::Chacha20,
		}
	}

	/// The key id embedded in every frame this encrypter produces.
	#[must_use]
	pub const fn key_id(&self) -> u32 {
		self.key_id
	}

	/// Encrypt `plaintext` into a wire frame.
	///
	/// # Errors
	/// Returns [`CryptoError::InvalidData`] for empty input. Cipher-internal
	/// failures surface as [`CryptoError::InvalidData`].
	pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
		if plaintext.is_empty() {
			return Err(CryptoError::InvalidData("empty plaintext".to_string()));
		}

		let aad = self.key_id.to_be_bytes();
		let payload = Payload {
			msg: plaintext,
			aad: &aad,
		};

		let (nonce, ciphertext) = match &self.cipher {
			Cipher::Aes(cipher) => {
				let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
				let ct = cipher
					.encrypt(&nonce, payload)
					.map_err(|_| CryptoError::InvalidData("encryption failed".to_string()))?;
				(nonce.to_vec(), ct)
			}
			Cipher::Chacha20(cipher) => {
				let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
				let ct = cipher
					.encrypt(&nonce, payload)
					.map_err(|_| CryptoError::InvalidData("encryption failed".to_string()))?;
				(nonce.to_vec(), ct)
			}
		};

		let mut frame = Vec::with_capacity(KEY_ID_LEN + NONCE_LEN + ciphertext.len());
		frame.extend_from_slice(&aad);
		frame.extend_from_slice(&nonce);
		frame.extend_from_slice(&ciphertext);
		Ok(frame)
	}

	/// Decrypt a wire frame produced by [`Self::encrypt`].
	///
	/// # Errors
	/// - [`CryptoError::InvalidData`] if the frame is shorter than the key
	///   id, nonce, and tag combined
	/// - [`CryptoError::InvalidKey`] if the frame's key id does not match
	///   this encrypter's
	/// - [`CryptoError::InvalidSignature`] if AEAD authentication fails
	pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
		if frame.len() < KEY_ID_LEN + NONCE_LEN + TAG_LEN {
			return Err(CryptoError::InvalidData(format!(
				"frame too short: {} bytes",
				frame.len()
			)));
		}

		let (aad, rest) = frame.split_at(KEY_ID_LEN);
		let frame_key_id = u32::from_be_bytes(aad.try_into().expect("split at KEY_ID_LEN"));
		if frame_key_id != self.key_id {
			return Err(CryptoError::InvalidKey(format!(
				"frame key id {frame_key_id} does not match active key id {}",
				self.key_id
			)));
		}

		let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
		let payload = Payload {
			msg: ciphertext,
			aad,
		};

		match &self.cipher {
			Cipher::Aes(cipher) => cipher
				.decrypt(nonce.into(), payload)
				.map_err(|_| CryptoError::InvalidSignature),
			Cipher::Chacha20(cipher) => cipher
				.decrypt(nonce.into(), payload)
				.map_err(|_| CryptoError::InvalidSignature),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const KEY: [u8; KEY_LEN] = [7u8; KEY_LEN];

	#[test]
	fn aes_round_trip() {
		let enc = Encrypter::aes(&KEY, 1).unwrap();
		let frame = enc.encrypt(b"Hello, world!").unwrap();

		// key id + nonce + at least one byte + tag
		assert!(frame.len() >= KEY_ID_LEN + NONCE_LEN + 1 + TAG_LEN);
		assert_eq!(&frame[..KEY_ID_LEN], &1u32.to_be_bytes());
		assert_eq!(enc.decrypt(&frame).unwrap(), b"Hello, world!");
	}

	#[test]
	fn chacha20_round_trip() {
		let enc = Encrypter::chacha20(&KEY, 9).unwrap();
		let frame = enc.encrypt(b"beacon").unwrap();
		assert_eq!(enc.decrypt(&frame).unwrap(), b"beacon");
	}

	#[test]
	fn empty_plaintext_rejected() {
		let enc = Encrypter::chacha20(&KEY, 0).unwrap();
		assert!(matches!(
			enc.encrypt(b""),
			Err(CryptoError::InvalidData(_))
		));
	}

	#[test]
	fn wrong_key_length_rejected() {
		assert!(matches!(
			Encrypter::aes(&[0u8; 16], 0),
			Err(CryptoError::InvalidKey(_))
		));
		assert!(matches!(
			Encrypter::chacha20(&[0u8; 31], 0),
			Err(CryptoError::InvalidKey(_))
		));
	}

	#[test]
	fn key_id_mismatch_rejected() {
		let old = Encrypter::aes(&KEY, 1).unwrap();
		let new = Encrypter::aes(&KEY, 2).unwrap();
		let frame = old.encrypt(b"stale").unwrap();

		assert!(matches!(
			new.decrypt(&frame),
			Err(CryptoError::InvalidKey(_))
		));
	}

	#[test]
	fn cross_key_decrypt_rejected() {
		// Same key id, different key bytes: the tag check must fail.
		let a = Encrypter::aes(&KEY, 3).unwrap();
		let b = Encrypter::aes(&[8u8; KEY_LEN], 3).unwrap();
		let frame = a.encrypt(b"secret").unwrap();

		assert_eq!(b.decrypt(&frame), Err(CryptoError::InvalidSignature));
	}

	#[test]
	fn tampered_frame_rejected() {
		let enc = Encrypter::chacha20(&KEY, 4).unwrap();
		let mut frame = enc.encrypt(b"payload").unwrap();
		let last = frame.len() - 1;
		frame[last] ^= 0xff;

		assert_eq!(enc.decrypt(&frame), Err(CryptoError::InvalidSignature));
	}

	#[test]
	fn short_frame_rejected() {
		let enc = Encrypter::aes(&KEY, 5).unwrap();
		assert!(matches!(
			enc.decrypt(&[0u8; KEY_ID_LEN + NONCE_LEN]),
			Err(CryptoError::InvalidData(_))
		));
	}

	#[test]
	fn unsupported_kind_rejected() {
		assert!(matches!(
			Encrypter::new(EncryptionKind::None, &KEY, 0),
			Err(CryptoError::UnsupportedEncryption(_))
		));
	}

	#[test]
	fn random_key_encrypters_disagree() {
		let a = Encrypter::random(EncryptionKind::Aes, 1).unwrap();
		let b = Encrypter::random(EncryptionKind::Aes, 1).unwrap();
		let frame = a.encrypt(b"fresh").unwrap();

		assert_eq!(b.decrypt(&frame), Err(CryptoError::InvalidSignature));
	}
}
