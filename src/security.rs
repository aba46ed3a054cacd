//! The security manager: composes the authenticator, key rotator,
//! forward-secrecy handler, obfuscator, module-signature verifier, and
//! the per-agent message processor into the one object the encrypted
//! listener talks to.
//!
//! Message pipelines, in order:
//! - incoming: mimicry strip -> padding strip -> key-exchange routing or
//!   envelope decryption
//! - outgoing: encryption -> padding -> mimicry

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{
	auth::{AuthConfig, AuthError, Authenticator, Claims},
	crypto::{
		ClientCrypto, CryptoError, Curve, Encrypter, ForwardSecrecy, KeyExchanger, KeyRotator,
		ModuleVerifier, RotationConfig,
	},
	obfuscate::{ObfuscationConfig, ObfuscationError, Obfuscator},
	util::unix_now,
	wire::{Envelope, KeyExchangeMessage, WireError},
};

/// How far in the future the handshake response advertises the next key
/// rotation.
const ADVERTISED_ROTATION: Duration = Duration::from_secs(24 * 60 * 60);

/// The errors produced by the security manager, aggregating its
/// sub-facilities.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SecurityError {
	/// A cryptographic operation failed
	#[error(transparent)]
	Crypto(#[from] CryptoError),
	/// Authentication failed
	#[error(transparent)]
	Auth(#[from] AuthError),
	/// Obfuscation stripping or application failed
	#[error(transparent)]
	Obfuscation(#[from] ObfuscationError),
	/// A wire frame failed to encode or decode
	#[error(transparent)]
	Wire(#[from] WireError),
	/// No crypto state is registered for the agent
	#[error("unknown client: {0}")]
	UnknownClient(String),
}

/// Security manager configuration.
#[derive(Clone, Debug)]
pub struct SecurityConfig {
	/// Authenticator settings (shared secret, token TTL, JWT switch)
	pub auth: AuthConfig,
	/// Per-agent key rotation settings
	pub rotation: RotationConfig,
	/// The curve for handshakes and the forward-secrecy keypair
	pub curve: Curve,
	/// How often the forward-secrecy keypair is replaced
	pub forward_rotation_interval: Duration,
	/// Padding, jitter, and mimicry settings
	pub obfuscation: ObfuscationConfig,
}

impl Default for SecurityConfig {
	fn default() -> Self {
		Self {
			auth: AuthConfig::default(),
			rotation: RotationConfig::default(),
			curve: Curve::default(),
			forward_rotation_interval: Duration::from_secs(60 * 60),
			obfuscation: ObfuscationConfig::default(),
		}
	}
}

/// What [`SecurityManager::process_incoming`] produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming {
	/// A decrypted (or never-encrypted) message for the dispatcher
	Plaintext(Vec<u8>),
	/// A finished key-exchange: these bytes go straight back to the
	/// transport, already obfuscated but deliberately not encrypted (the
	/// peer derives the channel key from this very response)
	HandshakeReply(Vec<u8>),
}

/// The per-agent secure channel orchestrator.
pub struct SecurityManager {
	authenticator: Authenticator,
	rotator: KeyRotator,
	forward: Arc<ForwardSecrecy>,
	obfuscator: Obfuscator,
	verifier: ModuleVerifier,
	clients: RwLock<HashMap<String, Arc<ClientCrypto>>>,
	curve: Curve,
	forward_cancel: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for SecurityManager {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		fmt.debug_struct("SecurityManager")
			.field("clients", &self.clients.read().len())
			.field("curve", &self.curve)
			.finish_non_exhaustive()
	}
}

impl SecurityManager {
	/// Create a manager from its configuration.
	///
	/// # Errors
	/// Returns [`SecurityError::Obfuscation`] for invalid padding or
	/// jitter bounds.
	pub fn new(config: SecurityConfig) -> Result<Arc<Self>, SecurityError> {
		Ok(Arc::new(Self {
			authenticator: Authenticator::new(config.auth),
			rotator: KeyRotator::new(config.rotation),
			forward: Arc::new(ForwardSecrecy::new(
				config.curve,
				config.forward_rotation_interval,
			)),
			obfuscator: Obfuscator::new(config.obfuscation)?,
			verifier: ModuleVerifier::new(),
			clients: RwLock::new(HashMap::new()),
			curve: config.curve,
			forward_cancel: Mutex::new(None),
		}))
	}

	/// Start the background schedulers: per-agent key rotation and
	/// forward-secrecy keypair rotation. Idempotent.
	pub fn start(&self) {
		self.rotator.start();

		let mut guard = self.forward_cancel.lock();
		if guard.is_some() {
			return;
		}
		let cancel = CancellationToken::new();
		*guard = Some(cancel.clone());
		drop(guard);

		let forward = Arc::clone(&self.forward);
		let tick_every = forward.rotation_interval();
		tokio::spawn(async move {
			let mut ticker = interval(tick_every);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
			ticker.tick().await;

			loop {
				tokio::select! {
					() = cancel.cancelled() => break,
					_ = ticker.tick() => forward.rotate(),
				}
			}
		});

		info!("security schedulers started");
	}

	/// Halt the background schedulers, preserving all keys. Idempotent.
	pub fn stop(&self) {
		self.rotator.stop();
		if let Some(cancel) = self.forward_cancel.lock().take() {
			cancel.cancel();
		}
	}

	/// Create and install crypto state for a new agent, registering it
	/// with the rotation scheduler.
	pub fn register_client(&self, client_id: &str) -> Arc<ClientCrypto> {
		let state = Arc::new(ClientCrypto::new(client_id));
		self.clients
			.write()
			.insert(client_id.to_string(), Arc::clone(&state));
		self.rotator.register(Arc::clone(&state));

		debug!(client_id, "registered agent crypto state");
		state
	}

	/// Drop an agent's crypto state and remove it from rotation. Unknown
	/// ids are ignored.
	pub fn unregister_client(&self, client_id: &str) {
		self.clients.write().remove(client_id);
		self.rotator.unregister(client_id);
		debug!(client_id, "unregistered agent crypto state");
	}

	/// The crypto state of a registered agent.
	#[must_use]
	pub fn client_state(&self, client_id: &str) -> Option<Arc<ClientCrypto>> {
		self.clients.read().get(client_id).cloned()
	}

	fn require_state(&self, client_id: &str) -> Result<Arc<ClientCrypto>, SecurityError> {
		self.client_state(client_id)
			.ok_or_else(|| SecurityError::UnknownClient(client_id.to_string()))
	}

	/// Run raw transport bytes through the incoming pipeline.
	///
	/// # Errors
	/// Any failure of the pipeline stages; a decryption failure means the
	/// frame is dropped, the connection itself stays usable.
	pub fn process_incoming(
		&self,
		client_id: &str,
		bytes: &[u8],
	) -> Result<Incoming, SecurityError> {
		let state = self.require_state(client_id)?;
		let stripped = self.obfuscator.deobfuscate(bytes)?;

		if let Some(exchange) = KeyExchangeMessage::detect(&stripped) {
			let reply = self.handle_key_exchange(&state, &exchange)?;
			return Ok(Incoming::HandshakeReply(self.obfuscator.obfuscate(&reply)?));
		}

		if !state.kind().is_encrypted() {
			return Ok(Incoming::Plaintext(stripped));
		}

		let envelope = Envelope::from_bytes(&stripped)?;
		if envelope.header.encryption != state.kind() {
			return Err(SecurityError::Crypto(CryptoError::UnsupportedEncryption(
				envelope.header.encryption.to_string(),
			)));
		}

		let plaintext = state.decrypt(&envelope.payload)?;
		Ok(Incoming::Plaintext(plaintext))
	}

	/// Run a plaintext reply through the outgoing pipeline.
	///
	/// # Errors
	/// Any failure of the pipeline stages.
	pub fn process_outgoing(
		&self,
		client_id: &str,
		plaintext: &[u8],
	) -> Result<Vec<u8>, SecurityError> {
		let state = self.require_state(client_id)?;

		if !state.kind().is_encrypted() {
			return Ok(self.obfuscator.obfuscate(plaintext)?);
		}

		let frame = state.encrypt(plaintext)?;
		let key_id = state.key_id().unwrap_or_default();
		let envelope = Envelope::new(state.kind(), key_id, frame);

		Ok(self.obfuscator.obfuscate(&envelope.to_bytes()?)?)
	}

	/// Complete an agent-initiated key exchange: activate the requested
	/// encryption, derive the channel key from a fresh server keypair,
	/// and produce the response frame.
	fn handle_key_exchange(
		&self,
		state: &Arc<ClientCrypto>,
		exchange: &KeyExchangeMessage,
	) -> Result<Vec<u8>, SecurityError> {
		let kind = exchange.encryption_type;
		if !kind.is_encrypted() {
			return Err(SecurityError::Crypto(CryptoError::UnsupportedEncryption(
				kind.to_string(),
			)));
		}

		let exchanger = KeyExchanger::new(self.curve);
		let key = exchanger.derive_key(&exchange.public_key)?;
		let key_id = state.key_id().map_or(1, |id| id.wrapping_add(1));
		let server_public = exchanger.public_key().to_vec();

		state.set_exchanger(exchanger);
		state.install(Encrypter::new(kind, &key, key_id)?);

		trace!(
			client_id = state.client_id(),
			%kind,
			key_id,
			"completed key exchange",
		);

		let rotation_deadline = unix_now() + ADVERTISED_ROTATION.as_secs();
		let response = KeyExchangeMessage::new(kind, server_public, rotation_deadline);
		Ok(response.to_bytes()?)
	}

	/// Generate a session token for an agent.
	///
	/// # Errors
	/// Any error of [`Authenticator::generate_jwt`].
	pub fn generate_token(&self, client_id: &str, role: &str) -> Result<String, SecurityError> {
		Ok(self.authenticator.generate_jwt(client_id, role)?)
	}

	/// Verify a session token.
	///
	/// # Errors
	/// Any error of [`Authenticator::verify_jwt`].
	pub fn verify_token(&self, token: &str) -> Result<Claims, SecurityError> {
		Ok(self.authenticator.verify_jwt(token)?)
	}

	/// A random delay for read deadlines, from the obfuscator's jitter
	/// bounds.
	#[must_use]
	pub fn apply_jitter(&self) -> Duration {
		self.obfuscator.apply_jitter()
	}

	/// Verify a module's detached RSA signature.
	///
	/// # Errors
	/// Any error of [`ModuleVerifier::verify`].
	pub fn verify_module_signature(
		&self,
		module: &str,
		data: &[u8],
		signature: &[u8],
	) -> Result<(), SecurityError> {
		Ok(self.verifier.verify(module, data, signature)?)
	}

	/// The authenticator, for surfaces doing their own HMAC or basic
	/// auth.
	#[must_use]
	pub const fn authenticator(&self) -> &Authenticator {
		&self.authenticator
	}

	/// The module-signature verifier, for key registration at startup.
	#[must_use]
	pub const fn module_verifier(&self) -> &ModuleVerifier {
		&self.verifier
	}

	/// The forward-secrecy handler.
	#[must_use]
	pub fn forward_secrecy(&self) -> Arc<ForwardSecrecy> {
		Arc::clone(&self.forward)
	}

	/// The key rotation scheduler.
	#[must_use]
	pub const fn rotator(&self) -> &KeyRotator {
		&self.rotator
	}
}

impl Drop for SecurityManager {
	fn drop(&mut self) {
		self.stop();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		crypto::EncryptionKind,
		wire::{AgentMessage, MessageKind},
	};

	fn manager() -> Arc<SecurityManager> {
		SecurityManager::new(SecurityConfig {
			auth: AuthConfig {
				secret: b"test secret for the security manager".to_vec(),
				..AuthConfig::default()
			},
			..SecurityConfig::default()
		})
		.unwrap()
	}

	/// Drive the agent's half of a handshake, returning the agent-side
	/// encrypter for the negotiated channel.
	fn client_handshake(manager: &SecurityManager, client_id: &str, kind: EncryptionKind) -> Encrypter {
		let agent_keys = KeyExchanger::new(Curve::P256);
		let hello = KeyExchangeMessage::new(kind, agent_keys.public_key().to_vec(), 0)
			.to_bytes()
			.unwrap();

		let reply = match manager.process_incoming(client_id, &hello).unwrap() {
			Incoming::HandshakeReply(reply) => reply,
			Incoming::Plaintext(_) => panic!("expected a handshake reply"),
		};

		let response = KeyExchangeMessage::detect(&reply).unwrap();
		assert_eq!(response.encryption_type, kind);
		assert!(response.key_rotation_time > unix_now());

		let key = agent_keys.derive_key(&response.public_key).unwrap();
		let key_id = manager
			.client_state(client_id)
			.unwrap()
			.key_id()
			.unwrap();
		Encrypter::new(kind, &key, key_id).unwrap()
	}

	#[test]
	fn unknown_client_rejected() {
		let manager = manager();
		assert!(matches!(
			manager.process_incoming("ghost", b"{}"),
			Err(SecurityError::UnknownClient(_))
		));
		assert!(matches!(
			manager.process_outgoing("ghost", b"hi"),
			Err(SecurityError::UnknownClient(_))
		));
	}

	#[test]
	fn plaintext_passthrough_before_handshake() {
		let manager = manager();
		manager.register_client("c1");

		let incoming = manager
			.process_incoming("c1", b"{\"type\":\"heartbeat\"}")
			.unwrap();
		assert_eq!(
			incoming,
			Incoming::Plaintext(b"{\"type\":\"heartbeat\"}".to_vec())
		);

		let outgoing = manager.process_outgoing("c1", b"reply").unwrap();
		assert_eq!(outgoing, b"reply");
	}

	#[test]
	fn handshake_establishes_shared_channel() {
		let manager = manager();
		manager.register_client("c1");
		let agent_encrypter = client_handshake(&manager, "c1", EncryptionKind::Aes);

		// agent -> server
		let message = b"{\"type\":\"command\",\"command\":\"status\"}";
		let frame = agent_encrypter.encrypt(message).unwrap();
		let state = manager.client_state("c1").unwrap();
		let envelope = Envelope::new(EncryptionKind::Aes, state.key_id().unwrap(), frame);

		let incoming = manager
			.process_incoming("c1", &envelope.to_bytes().unwrap())
			.unwrap();
		let Incoming::Plaintext(plaintext) = incoming else {
			panic!("expected plaintext");
		};
		let parsed = AgentMessage::from_bytes(&plaintext).unwrap();
		assert_eq!(parsed.kind, MessageKind::Command);

		// server -> agent
		let reply = manager.process_outgoing("c1", b"{\"status\":\"success\"}").unwrap();
		let reply_envelope = Envelope::from_bytes(&reply).unwrap();
		assert_eq!(
			agent_encrypter.decrypt(&reply_envelope.payload).unwrap(),
			b"{\"status\":\"success\"}"
		);
	}

	#[test]
	fn chacha20_channel_works_too() {
		let manager = manager();
		manager.register_client("c1");
		let agent_encrypter = client_handshake(&manager, "c1", EncryptionKind::Chacha20);

		let reply = manager.process_outgoing("c1", b"payload").unwrap();
		let envelope = Envelope::from_bytes(&reply).unwrap();
		assert_eq!(envelope.header.encryption, EncryptionKind::Chacha20);
		assert_eq!(
			agent_encrypter.decrypt(&envelope.payload).unwrap(),
			b"payload"
		);
	}

	#[test]
	fn envelope_kind_mismatch_rejected() {
		let manager = manager();
		manager.register_client("c1");
		let agent_encrypter = client_handshake(&manager, "c1", EncryptionKind::Aes);

		let frame = agent_encrypter.encrypt(b"hello").unwrap();
		let state = manager.client_state("c1").unwrap();
		let envelope = Envelope::new(
			EncryptionKind::Chacha20,
			state.key_id().unwrap(),
			frame,
		);

		assert!(matches!(
			manager.process_incoming("c1", &envelope.to_bytes().unwrap()),
			Err(SecurityError::Crypto(CryptoError::UnsupportedEncryption(_)))
		));
	}

	#[test]
	fn handshake_with_none_kind_rejected() {
		let manager = manager();
		manager.register_client("c1");

		let agent_keys = KeyExchanger::new(Curve::P256);
		let hello = KeyExchangeMessage::new(
			EncryptionKind::None,
			agent_keys.public_key().to_vec(),
			0,
		)
		.to_bytes()
		.unwrap();

		assert!(matches!(
			manager.process_incoming("c1", &hello),
			Err(SecurityError::Crypto(CryptoError::UnsupportedEncryption(_)))
		));
	}

	#[test]
	fn handshake_with_garbage_key_rejected() {
		let manager = manager();
		manager.register_client("c1");

		let hello = KeyExchangeMessage::new(EncryptionKind::Aes, b"invalid".to_vec(), 0)
			.to_bytes()
			.unwrap();

		assert!(matches!(
			manager.process_incoming("c1", &hello),
			Err(SecurityError::Crypto(CryptoError::InvalidPublicKey))
		));
	}

	#[test]
	fn unregister_drops_state() {
		let manager = manager();
		manager.register_client("c1");
		assert!(manager.client_state("c1").is_some());

		manager.unregister_client("c1");
		assert!(manager.client_state("c1").is_none());
		assert!(manager.rotator().is_empty());
	}

	#[test]
	fn tokens_round_trip_through_manager() {
		let manager = manager();
		let token = manager.generate_token("c1", "agent").unwrap();
		let claims = manager.verify_token(&token).unwrap();
		assert_eq!(claims.client_id, "c1");
		assert_eq!(claims.role, "agent");
	}

	#[tokio::test]
	async fn scheduler_start_stop_idempotent() {
		let manager = manager();
		manager.start();
		manager.start();
		assert!(manager.rotator().is_running());

		manager.stop();
		manager.stop();
		assert!(!manager.rotator().is_running());
	}

	#[test]
	fn obfuscated_pipeline_round_trip() {
		use crate::obfuscate::{JitterConfig, MimicryProfile, PaddingConfig};

		let manager = SecurityManager::new(SecurityConfig {
			auth: AuthConfig {
				secret: b"secret".to_vec(),
				..AuthConfig::default()
			},
			obfuscation: ObfuscationConfig {
				padding: Some(PaddingConfig { min: 8, max: 64 }),
				jitter: Some(JitterConfig {
					min_ms: 0,
					max_ms: 5,
				}),
				mimicry: MimicryProfile::Http,
			},
			..SecurityConfig::default()
		})
		.unwrap();
		manager.register_client("c1");

		// outgoing bytes are disguised as HTTP and still round-trip
		let wire = manager.process_outgoing("c1", b"beacon").unwrap();
		assert!(wire.starts_with(b"GET "));
		assert_eq!(
			manager.process_incoming("c1", &wire).unwrap(),
			Incoming::Plaintext(b"beacon".to_vec())
		);
	}
}
