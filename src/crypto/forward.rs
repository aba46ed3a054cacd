//! Forward secrecy handling.
//!
//! Independent of per-client key rotation, the server keeps one ephemeral
//! ECDH keypair that handshakes are computed against, replaces it on its
//! own schedule, and retains a bounded window of superseded private keys.
//! An exchange initiated against a server public key that has since been
//! rotated out can still complete during the grace window through
//! [`ForwardSecrecy::try_compute_shared_secret_with_history`].

use std::{collections::VecDeque, time::Duration};

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::crypto::{Curve, CryptoError, KeyExchanger};

/// How many superseded private keys are kept for late exchanges.
pub const MAX_KEY_HISTORY: usize = 5;

struct Inner {
	current: KeyExchanger,
	history: VecDeque<KeyExchanger>,
	rotated_at: Instant,
}

/// The server's ephemeral keypair with a bounded history of superseded
/// keys. Shared across connection handlers behind its internal lock.
pub struct ForwardSecrecy {
	curve: Curve,
	rotation_interval: Duration,
	inner: RwLock<Inner>,
}

impl std::fmt::Debug for ForwardSecrecy {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		fmt.debug_struct("ForwardSecrecy")
			.field("curve", &self.curve)
			.field("rotation_interval", &self.rotation_interval)
			.field("history_len", &self.history_len())
			.finish_non_exhaustive()
	}
}

impl ForwardSecrecy {
	/// Create a handler with a fresh keypair on `curve`, rotating every
	/// `rotation_interval`.
	#[must_use]
	pub fn new(curve: Curve, rotation_interval: Duration) -> Self {
		Self {
			curve,
			rotation_interval,
			inner: RwLock::new(Inner {
				current: KeyExchanger::new(curve),
				history: VecDeque::with_capacity(MAX_KEY_HISTORY),
				rotated_at: Instant::now(),
			}),
		}
	}

	/// The curve all keypairs in this handler live on.
	#[must_use]
	pub const fn curve(&self) -> Curve {
		self.curve
	}

	/// The interval at which [`Self::rotate_if_due`] replaces the keypair.
	#[must_use]
	pub const fn rotation_interval(&self) -> Duration {
		self.rotation_interval
	}

	/// The current public key as an uncompressed SEC1 point.
	#[must_use]
	pub fn public_key(&self) -> Vec<u8> {
		self.inner.read().current.public_key().to_vec()
	}

	/// How many superseded keys are currently retained.
	#[must_use]
	pub fn history_len(&self) -> usize {
		self.inner.read().history.len()
	}

	/// Replace the current keypair, retiring it into the history window.
	/// The oldest retained key is dropped once the window holds
	/// [`MAX_KEY_HISTORY`] keys.
	pub fn rotate(&self) {
		let mut inner = self.inner.write();
		let fresh = KeyExchanger::new(self.curve);
		let old = std::mem::replace(&mut inner.current, fresh);

		if inner.history.len() == MAX_KEY_HISTORY {
			inner.history.pop_front();
		}
		inner.history.push_back(old);
		inner.rotated_at = Instant::now();

		debug!(
			curve = %self.curve,
			history = inner.history.len(),
			"rotated forward-secrecy keypair",
		);
	}

	/// Rotate if the rotation interval has elapsed since the last rotation.
	/// Returns whether a rotation happened.
	pub fn rotate_if_due(&self) -> bool {
		let due = self.inner.read().rotated_at.elapsed() >= self.rotation_interval;
		if due {
			self.rotate();
		}
		due
	}

	/// Compute the shared secret between the current keypair and a peer's
	/// SEC1-encoded public key.
	///
	/// # Errors
	/// Returns [`CryptoError::InvalidPublicKey`] if `peer_public` is not a
	/// valid point on this handler's curve.
	pub fn compute_shared_secret(&self, peer_public: &[u8]) -> Result<Vec<u8>, CryptoError> {
		self.inner.read().current.compute_shared_secret(peer_public)
	}

	/// Compute a shared secret against the current keypair or, failing
	/// `accept`, against each retained superseded keypair (newest first).
	/// `accept` decides whether a candidate secret completes the exchange,
	/// typically by authenticating a value the peer derived from it.
	///
	/// # Errors
	/// - [`CryptoError::InvalidPublicKey`] if `peer_public` is not a valid
	///   point on this handler's curve
	/// - [`CryptoError::InvalidKey`] if no key in the window produced an
	///   accepted secret
	pub fn try_compute_shared_secret_with_history(
		&self,
		peer_public: &[u8],
		accept: impl Fn(&[u8]) -> bool,
	) -> Result<Vec<u8>, CryptoError> {
		let inner = self.inner.read();

		let current = inner.current.compute_shared_secret(peer_public)?;
		if accept(&current) {
			return Ok(current);
		}

		for old in inner.history.iter().rev() {
			let candidate = old.compute_shared_secret(peer_public)?;
			if accept(&candidate) {
				return Ok(candidate);
			}
		}

		Err(CryptoError::InvalidKey(
			"no key in the history window completes this exchange".to_string(),
		))
	}
}
