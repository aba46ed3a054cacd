//! Per-agent crypto state: the active cipher, the key exchange in
//! progress, and the bounded history of superseded keys.

use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::crypto::{CryptoError, Encrypter, EncryptionKind, KeyExchanger};

struct Inner {
	kind: EncryptionKind,
	encrypter: Option<Encrypter>,
	exchanger: Option<KeyExchanger>,
	history: VecDeque<Encrypter>,
}

/// The cryptographic state of one agent's channel.
///
/// Starts out unencrypted; a key-exchange handshake sets the kind and
/// installs an encrypter. Reads (encrypt/decrypt) share the state behind a
/// read lock; key installation briefly takes the write lock, so rotation
/// never blocks traffic for longer than the swap.
///
/// Invariant: an encrypted kind always has an installed encrypter, and
/// that encrypter's key id is the id embedded in every outgoing frame.
pub struct ClientCrypto {
	client_id: String,
	inner: RwLock<Inner>,
}

impl std::fmt::Debug for ClientCrypto {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let inner = self.inner.read();
		fmt.debug_struct("ClientCrypto")
			.field("client_id", &self.client_id)
			.field("kind", &inner.kind)
			.field("key_id", &inner.encrypter.as_ref().map(Encrypter::key_id))
			.field("history_len", &inner.history.len())
			.finish_non_exhaustive()
	}
}

impl ClientCrypto {
	/// Create an unencrypted state for `client_id`.
	#[must_use]
	pub fn new(client_id: impl Into<String>) -> Self {
		Self {
			client_id: client_id.into(),
			inner: RwLock::new(Inner {
				kind: EncryptionKind::None,
				encrypter: None,
				exchanger: None,
				history: VecDeque::new(),
			}),
		}
	}

	/// The agent this state belongs to.
	#[must_use]
	pub fn client_id(&self) -> &str {
		&self.client_id
	}

	/// The currently active encryption kind.
	#[must_use]
	pub fn kind(&self) -> EncryptionKind {
		self.inner.read().kind
	}

	/// The active key id, if an encrypter is installed.
	#[must_use]
	pub fn key_id(&self) -> Option<u32> {
		self.inner.read().encrypter.as_ref().map(Encrypter::key_id)
	}

	/// How many superseded encrypters are retained for late frames.
	#[must_use]
	pub fn history_len(&self) -> usize {
		self.inner.read().history.len()
	}

	/// Install a freshly negotiated encrypter and activate its kind,
	/// clearing any rotation history from a previous negotiation.
	pub fn install(&self, encrypter: Encrypter) {
		let mut inner = self.inner.write();
		inner.kind = encrypter.kind();
		inner.encrypter = Some(encrypter);
		inner.history.clear();
	}

	/// Swap in a rotated encrypter, retiring the previous one into a
	/// history bounded by `max_history`. With `max_history == 0` the old
	/// key is dropped immediately and in-flight frames against it fail.
	pub fn rotate_to(&self, encrypter: Encrypter, max_history: usize) {
		let mut inner = self.inner.write();
		inner.kind = encrypter.kind();
		if let Some(old) = inner.encrypter.replace(encrypter) {
			if max_history > 0 {
				while inner.history.len() >= max_history {
					inner.history.pop_front();
				}
				inner.history.push_back(old);
			}
		}
	}

	/// Drop the superseded encrypter with the given key id from the
	/// history, if still retained. Returns whether anything was removed.
	pub fn prune_history(&self, key_id: u32) -> bool {
		let mut inner = self.inner.write();
		let before = inner.history.len();
		inner.history.retain(|old| old.key_id() != key_id);
		inner.history.len() != before
	}

	/// Remember the key exchanger used for the in-progress handshake.
	pub fn set_exchanger(&self, exchanger: KeyExchanger) {
		self.inner.write().exchanger = Some(exchanger);
	}

	/// Run `f` over the stored exchanger, if any.
	pub fn with_exchanger<T>(&self, f: impl FnOnce(&KeyExchanger) -> T) -> Option<T> {
		self.inner.read().exchanger.as_ref().map(f)
	}

	/// Encrypt `plaintext` with the active encrypter.
	///
	/// # Errors
	/// Returns [`CryptoError::UnsupportedEncryption`] when no encrypter is
	/// installed, or any error of [`Encrypter::encrypt`].
	pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
		let inner = self.inner.read();
		let encrypter = inner
			.encrypter
			.as_ref()
			.ok_or_else(|| CryptoError::UnsupportedEncryption(inner.kind.to_string()))?;
		encrypter.encrypt(plaintext)
	}

	/// Decrypt a frame with the active encrypter, falling back to the
	/// retained history when the frame's key id belongs to a superseded
	/// key.
	///
	/// # Errors
	/// - [`CryptoError::UnsupportedEncryption`] when no encrypter is
	///   installed
	/// - [`CryptoError::InvalidData`] for a frame too short to carry a key
	///   id
	/// - [`CryptoError::InvalidKey`] when the frame's key id is unknown to
	///   both the active key and the history window
	/// - any decryption error of [`Encrypter::decrypt`]
	pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
		let inner = self.inner.read();
		let encrypter = inner
			.encrypter
			.as_ref()
			.ok_or_else(|| CryptoError::UnsupportedEncryption(inner.kind.to_string()))?;

		let frame_key_id = frame
			.get(..4)
			.map(|b| u32::from_be_bytes(b.try_into().expect("4-byte slice")))
			.ok_or_else(|| CryptoError::InvalidData("frame too short".to_string()))?;

		if frame_key_id == encrypter.key_id() {
			return encrypter.decrypt(frame);
		}

		inner
			.history
			.iter()
			.rev()
			.find(|old| old.key_id() == frame_key_id)
			.ok_or_else(|| {
				CryptoError::InvalidKey(format!("unknown key id {frame_key_id}"))
			})?
			.decrypt(frame)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::Curve;

	#[test]
	fn starts_unencrypted() {
		let state = ClientCrypto::new("c1");
		assert_eq!(state.kind(), EncryptionKind::None);
		assert_eq!(state.key_id(), None);
		assert!(matches!(
			state.encrypt(b"x"),
			Err(CryptoError::UnsupportedEncryption(_))
		));
	}

	#[test]
	fn install_activates_kind() {
		let state = ClientCrypto::new("c1");
		state.install(Encrypter::random(EncryptionKind::Aes, 1).unwrap());

		assert_eq!(state.kind(), EncryptionKind::Aes);
		assert_eq!(state.key_id(), Some(1));

		let frame = state.encrypt(b"hello").unwrap();
		assert_eq!(state.decrypt(&frame).unwrap(), b"hello");
	}

	#[test]
	fn rotation_keeps_old_frames_decryptable() {
		let state = ClientCrypto::new("c1");
		state.install(Encrypter::random(EncryptionKind::Chacha20, 1).unwrap());
		let old_frame = state.encrypt(b"in flight").unwrap();

		state.rotate_to(Encrypter::random(EncryptionKind::Chacha20, 2).unwrap(), 3);

		assert_eq!(state.key_id(), Some(2));
		assert_eq!(state.decrypt(&old_frame).unwrap(), b"in flight");
	}

	#[test]
	fn rotation_without_history_drops_old_key() {
		let state = ClientCrypto::new("c1");
		state.install(Encrypter::random(EncryptionKind::Aes, 1).unwrap());
		let old_frame = state.encrypt(b"in flight").unwrap();

		state.rotate_to(Encrypter::random(EncryptionKind::Aes, 2).unwrap(), 0);

		assert!(matches!(
			state.decrypt(&old_frame),
			Err(CryptoError::InvalidKey(_))
		));
	}

	#[test]
	fn history_is_bounded() {
		let state = ClientCrypto::new("c1");
		state.install(Encrypter::random(EncryptionKind::Aes, 0).unwrap());
		for id in 1..10u32 {
			state.rotate_to(Encrypter::random(EncryptionKind::Aes, id).unwrap(), 3);
		}
		assert_eq!(state.history_len(), 3);
	}

	#[test]
	fn unknown_key_id_rejected() {
		let state = ClientCrypto::new("c1");
		state.install(Encrypter::random(EncryptionKind::Aes, 1).unwrap());

		let other = Encrypter::random(EncryptionKind::Aes, 42).unwrap();
		let frame = other.encrypt(b"who are you").unwrap();

		assert!(matches!(
			state.decrypt(&frame),
			Err(CryptoError::InvalidKey(_))
		));
	}

	#[test]
	fn exchanger_round_trip() {
		let state = ClientCrypto::new("c1");
		assert!(state.with_exchanger(|_| ()).is_none());

		state.set_exchanger(KeyExchanger::new(Curve::P256));
		let curve = state.with_exchanger(KeyExchanger::curve);
		assert_eq!(curve, Some(Curve::P256));
	}
}
