//! The encrypted listener: glues a transport listener to the security
//! manager and the client registry, and dispatches decrypted messages.
//!
//! For every accepted connection the session handler allocates an agent
//! id, registers crypto state and a registry entry, then runs the read
//! loop: read with a jittered deadline, run the incoming pipeline,
//! dispatch by message type and command, run the reply through the
//! outgoing pipeline, write. Message-processing failures are answered
//! with a JSON error envelope and the connection lives on; transport
//! errors end the session and trigger cleanup.

use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
	listener::{
		BoxConn, ConnectionHandler, Listener, ListenerConfig, ListenerError, Protocol, Status,
	},
	registry::{Client, ClientRegistry, ClientStatus},
	security::{Incoming, SecurityManager},
	util::unix_now_nanos,
	wire::{AgentMessage, MessageKind, RegisterParams, Reply},
};

/// Base read deadline; per-iteration jitter is added on top.
const BASE_READ_DEADLINE: Duration = Duration::from_secs(30);

/// The role stamped into session tokens issued on registration.
const AGENT_ROLE: &str = "agent";

/// The connection handler shared by every connection of one encrypted
/// listener.
pub struct SessionHandler {
	security: Arc<SecurityManager>,
	registry: Arc<ClientRegistry>,
	protocol: Protocol,
	buffer_size: usize,
}

impl SessionHandler {
	/// Create a handler for connections arriving over `protocol`.
	#[must_use]
	pub fn new(
		security: Arc<SecurityManager>,
		registry: Arc<ClientRegistry>,
		protocol: Protocol,
		buffer_size: usize,
	) -> Arc<Self> {
		Arc::new(Self {
			security,
			registry,
			protocol,
			buffer_size,
		})
	}

	/// Handle one plaintext message, mutating the registry and producing
	/// the reply.
	fn dispatch(&self, client_id: &str, plaintext: &[u8]) -> Reply {
		let message = match AgentMessage::from_bytes(plaintext) {
			Ok(message) => message,
			Err(err) => {
				debug!(client_id, %err, "malformed agent message");
				return Reply::error("malformed message");
			}
		};

		match message.kind {
			MessageKind::Heartbeat => {
				if let Err(err) = self.registry.touch(client_id) {
					return Reply::error(err.to_string());
				}
				Reply::success("heartbeat received")
			}
			MessageKind::Command => match message.command.as_deref() {
				Some("register") => self.handle_register(client_id, message.params),
				Some("status") => self.handle_status(client_id),
				Some(other) => {
					debug!(client_id, command = other, "unknown command");
					Reply::error(format!("unknown command: {other}"))
				}
				None => Reply::error("command message without a command"),
			},
			MessageKind::KeyExchange => {
				// handshakes are routed before decryption; one arriving
				// inside an encrypted envelope is a protocol violation
				Reply::error("unexpected key_exchange message")
			}
		}
	}

	fn handle_register(&self, client_id: &str, params: Option<serde_json::Value>) -> Reply {
		let params: RegisterParams = match params.map(serde_json::from_value).transpose() {
			Ok(params) => params.unwrap_or_default(),
			Err(err) => {
				debug!(client_id, %err, "malformed register params");
				return Reply::error("malformed register params");
			}
		};

		let result = self
			.registry
			.set_name(client_id, params.hostname.clone())
			.and_then(|()| self.registry.set_os(client_id, params.os))
			.and_then(|()| self.registry.set_arch(client_id, params.arch))
			.and_then(|()| self.registry.set_modules(client_id, params.modules))
			.and_then(|()| {
				self.registry
					.update_status(client_id, ClientStatus::Online, None)
			});
		if let Err(err) = result {
			return Reply::error(err.to_string());
		}

		info!(client_id, hostname = params.hostname, "agent registered");
		let reply = Reply::success("registered").with_data(json!({ "client_id": client_id }));

		if self.security.authenticator().jwt_enabled() {
			match self.security.generate_token(client_id, AGENT_ROLE) {
				Ok(token) => reply.with_token(token),
				Err(err) => {
					warn!(client_id, %err, "could not issue session token");
					reply
				}
			}
		} else {
			reply
		}
	}

	fn handle_status(&self, client_id: &str) -> Reply {
		let client = match self.registry.get(client_id) {
			Ok(client) => client,
			Err(err) => return Reply::error(err.to_string()),
		};
		let encryption = self
			.security
			.client_state(client_id)
			.map_or_else(String::new, |state| state.kind().to_string());

		Reply::success("status").with_data(json!({
			"id": client.id,
			"name": client.name,
			"address": client.address,
			"os": client.os,
			"arch": client.arch,
			"modules": client.modules,
			"protocol": client.protocol,
			"status": client.status,
			"last_seen": client.last_seen,
			"encryption": encryption,
		}))
	}

	async fn run_session(&self, conn: &mut BoxConn, client_id: &str) -> io::Result<()> {
		let mut buf = vec![0u8; self.buffer_size];

		loop {
			conn.set_read_deadline(BASE_READ_DEADLINE + self.security.apply_jitter());

			let n = conn.read(&mut buf).await?;
			if n == 0 {
				return Ok(());
			}

			let reply_bytes = match self.security.process_incoming(client_id, &buf[..n]) {
				Ok(Incoming::HandshakeReply(bytes)) => bytes,
				Ok(Incoming::Plaintext(plaintext)) => {
					let reply = self.dispatch(client_id, &plaintext);
					let Ok(encoded) = reply.to_bytes() else {
						warn!(client_id, "could not encode reply");
						continue;
					};
					match self.security.process_outgoing(client_id, &encoded) {
						Ok(bytes) => bytes,
						Err(err) => {
							warn!(client_id, %err, "outgoing pipeline failed");
							continue;
						}
					}
				}
				Err(err) => {
					// a bad frame is dropped, the connection tolerates it
					debug!(client_id, %err, "dropping undecryptable frame");
					let reply = Reply::error(err.to_string());
					match reply
						.to_bytes()
						.ok()
						.and_then(|encoded| {
							self.security.process_outgoing(client_id, &encoded).ok()
						}) {
						Some(bytes) => bytes,
						None => continue,
					}
				}
			};

			conn.write(&reply_bytes).await?;
		}
	}
}

#[async_trait]
impl ConnectionHandler for SessionHandler {
	async fn handle(&self, mut conn: BoxConn) {
		let remote = conn.remote_addr();
		let client_id = format!("{remote}-{}", unix_now_nanos());

		self.security.register_client(&client_id);
		let mut client = Client::new(&client_id, remote.to_string(), self.protocol.to_string());
		client.status = ClientStatus::Online;
		if let Err(err) = self.registry.register(client) {
			warn!(client_id, %err, "could not register agent");
			self.security.unregister_client(&client_id);
			return;
		}

		trace!(client_id, %remote, protocol = %self.protocol, "session started");
		if let Err(err) = self.run_session(&mut conn, &client_id).await {
			debug!(client_id, %err, "session ended with transport error");
		}

		let _ = conn.close().await;
		self.security.unregister_client(&client_id);
		if let Err(err) = self.registry.unregister(&client_id) {
			warn!(client_id, %err, "could not unregister agent");
		}
		info!(client_id, %remote, "agent disconnected");
	}
}

/// A transport listener wrapped with the secure-channel session handler.
/// This is what the server binary builds one of per configured protocol.
pub struct EncryptedListener {
	inner: Arc<dyn Listener>,
	handler: Arc<SessionHandler>,
}

impl EncryptedListener {
	/// Wrap `inner`, wiring its connections into `security` and
	/// `registry`.
	#[must_use]
	pub fn new(
		inner: Arc<dyn Listener>,
		security: Arc<SecurityManager>,
		registry: Arc<ClientRegistry>,
	) -> Self {
		let handler = SessionHandler::new(
			security,
			registry,
			inner.protocol(),
			inner.config().buffer_size,
		);
		Self { inner, handler }
	}

	/// Start the wrapped listener with the session handler installed.
	///
	/// # Errors
	/// Any error of the wrapped listener's `start`.
	pub async fn start(&self, cancel: CancellationToken) -> Result<(), ListenerError> {
		self.inner
			.start(cancel, Arc::clone(&self.handler) as Arc<dyn ConnectionHandler>)
			.await
	}

	/// Stop the wrapped listener.
	///
	/// # Errors
	/// Any error of the wrapped listener's `stop`.
	pub async fn stop(&self) -> Result<(), ListenerError> {
		self.inner.stop().await
	}

	/// The wrapped listener's protocol.
	#[must_use]
	pub fn protocol(&self) -> Protocol {
		self.inner.protocol()
	}

	/// The wrapped listener's status.
	#[must_use]
	pub fn status(&self) -> Status {
		self.inner.status()
	}

	/// The wrapped listener's configuration.
	#[must_use]
	pub fn config(&self) -> ListenerConfig {
		self.inner.config()
	}

	/// The wrapped listener itself, for protocol-specific accessors.
	#[must_use]
	pub fn inner(&self) -> Arc<dyn Listener> {
		Arc::clone(&self.inner)
	}
}
