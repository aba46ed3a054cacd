//! Scheduled per-agent key rotation.
//!
//! A background task ticks every [`RotationConfig::interval`] and swaps a
//! freshly keyed AEAD (of whatever kind the agent negotiated) into every
//! registered crypto state. The superseded key stays decryptable through
//! the state's bounded history until either the history overflows
//! ([`RotationConfig::max_keys`]) or the grace period expires.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::crypto::{ClientCrypto, CryptoError, Encrypter};

/// Configuration for the key rotation scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RotationConfig {
	/// Whether the background scheduler runs at all. Disabling halts the
	/// scheduler but preserves all installed keys.
	pub enabled: bool,
	/// Time between rotation sweeps.
	pub interval: Duration,
	/// How long a superseded key remains decryptable after rotation.
	pub grace_period: Duration,
	/// Upper bound on superseded keys retained per agent.
	pub max_keys: usize,
}

impl Default for RotationConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			interval: Duration::from_secs(60 * 60),
			grace_period: Duration::from_secs(5 * 60),
			max_keys: 3,
		}
	}
}

struct Retirement {
	client_id: String,
	key_id: u32,
	retired_at: Instant,
}

struct Shared {
	config: RwLock<RotationConfig>,
	clients: RwLock<HashMap<String, Arc<ClientCrypto>>>,
	retired: Mutex<Vec<Retirement>>,
}

impl Shared {
	fn rotate_state(&self, state: &Arc<ClientCrypto>, max_keys: usize) -> Result<Option<u32>, CryptoError> {
		let kind = state.kind();
		if !kind.is_encrypted() {
			return Ok(None);
		}
		let Some(old_key_id) = state.key_id() else {
			return Ok(None);
		};

		let next_id = old_key_id.wrapping_add(1);
		state.rotate_to(Encrypter::random(kind, next_id)?, max_keys);
		self.retired.lock().push(Retirement {
			client_id: state.client_id().to_string(),
			key_id: old_key_id,
			retired_at: Instant::now(),
		});

		trace!(
			client_id = state.client_id(),
			key_id = next_id,
			"installed rotated key",
		);
		Ok(Some(next_id))
	}

	fn rotate_all(&self) -> usize {
		let clients = self.clients.read();
		let max_keys = self.config.read().max_keys;
		let mut rotated = 0;

		for state in clients.values() {
			match self.rotate_state(state, max_keys) {
				Ok(Some(_)) => rotated += 1,
				Ok(None) => {}
				Err(err) => {
					warn!(client_id = state.client_id(), %err, "key rotation failed");
				}
			}
		}

		if rotated > 0 {
			debug!(rotated, "rotated agent channel keys");
		}
		rotated
	}

	fn prune_expired(&self) {
		let grace = self.config.read().grace_period;
		let clients = self.clients.read();
		let mut retired = self.retired.lock();

		retired.retain(|r| {
			if r.retired_at.elapsed() < grace {
				return true;
			}
			if let Some(state) = clients.get(&r.client_id) {
				if state.prune_history(r.key_id) {
					trace!(
						client_id = r.client_id,
						key_id = r.key_id,
						"expired superseded key",
					);
				}
			}
			false
		});
	}
}

/// The rotation scheduler. Shared between the security manager, which
/// registers and unregisters agents, and its own background task.
pub struct KeyRotator {
	shared: Arc<Shared>,
	cancel: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for KeyRotator {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		fmt.debug_struct("KeyRotator")
			.field("config", &*self.shared.config.read())
			.field("clients", &self.shared.clients.read().len())
			.field("running", &self.cancel.lock().is_some())
			.finish_non_exhaustive()
	}
}

impl KeyRotator {
	/// Create a stopped rotator with the given configuration.
	#[must_use]
	pub fn new(config: RotationConfig) -> Self {
		Self {
			shared: Arc::new(Shared {
				config: RwLock::new(config),
				clients: RwLock::new(HashMap::new()),
				retired: Mutex::new(Vec::new()),
			}),
			cancel: Mutex::new(None),
		}
	}

	/// Register an agent's crypto state for scheduled rotation.
	pub fn register(&self, state: Arc<ClientCrypto>) {
		self.shared
			.clients
			.write()
			.insert(state.client_id().to_string(), state);
	}

	/// Remove an agent from scheduled rotation. Unknown ids are ignored.
	pub fn unregister(&self, client_id: &str) {
		self.shared.clients.write().remove(client_id);
		self.shared
			.retired
			.lock()
			.retain(|r| r.client_id != client_id);
	}

	/// How many agents are currently registered.
	#[must_use]
	pub fn len(&self) -> usize {
		self.shared.clients.read().len()
	}

	/// Whether no agents are registered.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.shared.clients.read().is_empty()
	}

	/// Whether the background scheduler is running.
	#[must_use]
	pub fn is_running(&self) -> bool {
		self.cancel.lock().is_some()
	}

	/// Rotate every registered agent that has negotiated encryption.
	/// Returns how many states were rotated.
	pub fn rotate_all(&self) -> usize {
		self.shared.rotate_all()
	}

	/// Drop superseded keys whose grace period has expired.
	pub fn prune_expired(&self) {
		self.shared.prune_expired();
	}

	/// Rotate a single agent out of schedule. Returns the new key id.
	///
	/// # Errors
	/// - [`CryptoError::UnknownClient`] if the agent is not registered
	/// - [`CryptoError::UnsupportedEncryption`] if it has not negotiated
	///   encryption yet
	pub fn force_rotate(&self, client_id: &str) -> Result<u32, CryptoError> {
		let state = self
			.shared
			.clients
			.read()
			.get(client_id)
			.cloned()
			.ok_or_else(|| CryptoError::UnknownClient(client_id.to_string()))?;
		let max_keys = self.shared.config.read().max_keys;

		self.shared
			.rotate_state(&state, max_keys)?
			.ok_or_else(|| CryptoError::UnsupportedEncryption(state.kind().to_string()))
	}

	/// Replace the configuration. Takes effect on the next scheduler
	/// start; a running scheduler keeps its current tick interval.
	pub fn set_config(&self, config: RotationConfig) {
		*self.shared.config.write() = config;
	}

	/// Start the background scheduler. Idempotent: a second call while
	/// running does nothing, as does starting a disabled rotator.
	pub fn start(&self) {
		let mut guard = self.cancel.lock();
		if guard.is_some() || !self.shared.config.read().enabled {
			return;
		}

		let cancel = CancellationToken::new();
		*guard = Some(cancel.clone());
		drop(guard);

		let shared = Arc::clone(&self.shared);
		let tick_every = shared.config.read().interval;
		tokio::spawn(async move {
			let mut ticker = interval(tick_every);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
			// the first tick of `interval` completes immediately
			ticker.tick().await;

			loop {
				tokio::select! {
					() = cancel.cancelled() => break,
					_ = ticker.tick() => {
						shared.rotate_all();
						shared.prune_expired();
					}
				}
			}

			debug!("key rotation scheduler stopped");
		});
	}

	/// Halt the background scheduler, preserving all installed keys.
	/// Idempotent.
	pub fn stop(&self) {
		if let Some(cancel) = self.cancel.lock().take() {
			cancel.cancel();
		}
	}
}

impl Drop for KeyRotator {
	fn drop(&mut self) {
		self.stop();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::EncryptionKind;

	fn encrypted_state(id: &str) -> Arc<ClientCrypto> {
		let state = Arc::new(ClientCrypto::new(id));
		state.install(Encrypter::random(EncryptionKind::Aes, 1).unwrap());
		state
	}

	#[test]
	fn rotate_all_skips_unencrypted() {
		let rotator = KeyRotator::new(RotationConfig::default());
		rotator.register(Arc::new(ClientCrypto::new("plain")));
		rotator.register(encrypted_state("secure"));

		assert_eq!(rotator.rotate_all(), 1);
	}

	#[test]
	fn rotation_advances_key_id_and_keeps_history() {
		let rotator = KeyRotator::new(RotationConfig::default());
		let state = encrypted_state("c1");
		rotator.register(Arc::clone(&state));

		let frame = state.encrypt(b"before rotation").unwrap();
		rotator.rotate_all();

		assert_eq!(state.key_id(), Some(2));
		assert_eq!(state.decrypt(&frame).unwrap(), b"before rotation");
	}

	#[test]
	fn force_rotate_unknown_client() {
		let rotator = KeyRotator::new(RotationConfig::default());
		assert!(matches!(
			rotator.force_rotate("ghost"),
			Err(CryptoError::UnknownClient(_))
		));
	}

	#[test]
	fn force_rotate_unnegotiated_client() {
		let rotator = KeyRotator::new(RotationConfig::default());
		rotator.register(Arc::new(ClientCrypto::new("plain")));
		assert!(matches!(
			rotator.force_rotate("plain"),
			Err(CryptoError::UnsupportedEncryption(_))
		));
	}

	#[test]
	fn expired_grace_prunes_history() {
		let rotator = KeyRotator::new(RotationConfig {
			grace_period: Duration::ZERO,
			..RotationConfig::default()
		});
		let state = encrypted_state("c1");
		rotator.register(Arc::clone(&state));

		let frame = state.encrypt(b"stale").unwrap();
		rotator.rotate_all();
		assert_eq!(state.decrypt(&frame).unwrap(), b"stale");

		rotator.prune_expired();
		assert!(matches!(
			state.decrypt(&frame),
			Err(CryptoError::InvalidKey(_))
		));
	}

	#[tokio::test]
	async fn scheduler_start_stop_idempotent() {
		let rotator = KeyRotator::new(RotationConfig {
			interval: Duration::from_millis(10),
			..RotationConfig::default()
		});

		rotator.start();
		rotator.start();
		assert!(rotator.is_running());

		rotator.stop();
		rotator.stop();
		assert!(!rotator.is_running());
	}

	#[tokio::test]
	async fn disabled_scheduler_does_not_start() {
		let rotator = KeyRotator::new(RotationConfig {
			enabled: false,
			..RotationConfig::default()
		});
		rotator.start();
		assert!(!rotator.is_running());
	}

	#[tokio::test]
	async fn scheduler_rotates_on_tick() {
		let rotator = KeyRotator::new(RotationConfig {
			interval: Duration::from_millis(20),
			..RotationConfig::default()
		});
		let state = encrypted_state("c1");
		rotator.register(Arc::clone(&state));

		rotator.start();
		tokio::time::sleep(Duration::from_millis(100)).await;
		rotator.stop();

		assert!(state.key_id().unwrap() > 1);
	}
}
