//! The listener manager: registry and factory for protocol listeners,
//! with collective start/halt and a root cancellation token.

use std::{collections::HashMap, sync::Arc};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
	dns::DnsListener, icmp::IcmpListener, tcp::TcpListener, udp::UdpListener, ws::WsListener,
	ConnectionHandler, Listener, ListenerConfig, ListenerError, Protocol, Status,
};

/// Owns one listener per protocol and the root cancel token that stops
/// them all.
pub struct ListenerManager {
	listeners: RwLock<HashMap<Protocol, Arc<dyn Listener>>>,
	root: Mutex<CancellationToken>,
}

impl std::fmt::Debug for ListenerManager {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		fmt.debug_struct("ListenerManager")
			.field("protocols", &self.protocols())
			.finish_non_exhaustive()
	}
}

impl Default for ListenerManager {
	fn default() -> Self {
		Self::new()
	}
}

impl ListenerManager {
	/// Create an empty manager.
	#[must_use]
	pub fn new() -> Self {
		Self {
			listeners: RwLock::new(HashMap::new()),
			root: Mutex::new(CancellationToken::new()),
		}
	}

	/// Build a listener for `protocol` from `config`.
	///
	/// # Errors
	/// Returns [`ListenerError::InvalidConfig`] when the configuration
	/// fails that listener's validation.
	pub fn create(
		protocol: Protocol,
		config: ListenerConfig,
	) -> Result<Arc<dyn Listener>, ListenerError> {
		Ok(match protocol {
			Protocol::Tcp => Arc::new(TcpListener::new(config)?),
			Protocol::Udp => Arc::new(UdpListener::new(config)?),
			Protocol::Ws => Arc::new(WsListener::new(config)?),
			Protocol::Icmp => Arc::new(IcmpListener::new(config)?),
			Protocol::Dns => Arc::new(DnsListener::new(config)?),
		})
	}

	/// Register a listener under its protocol.
	///
	/// # Errors
	/// Returns [`ListenerError::DuplicateListener`] if the protocol is
	/// taken.
	pub fn register(&self, listener: Arc<dyn Listener>) -> Result<(), ListenerError> {
		let protocol = listener.protocol();
		let mut listeners = self.listeners.write();
		if listeners.contains_key(&protocol) {
			return Err(ListenerError::DuplicateListener(protocol));
		}
		listeners.insert(protocol, listener);
		Ok(())
	}

	/// Remove a listener, stopping it first if it is running.
	///
	/// # Errors
	/// Returns [`ListenerError::UnknownListener`] for unregistered
	/// protocols; stop failures propagate and leave the listener
	/// registered.
	pub async fn unregister(&self, protocol: Protocol) -> Result<(), ListenerError> {
		let listener = self
			.listeners
			.read()
			.get(&protocol)
			.cloned()
			.ok_or(ListenerError::UnknownListener(protocol))?;

		if listener.status() == Status::Running {
			listener.stop().await?;
		}
		self.listeners.write().remove(&protocol);
		Ok(())
	}

	/// The listener registered for `protocol`, if any.
	#[must_use]
	pub fn get(&self, protocol: Protocol) -> Option<Arc<dyn Listener>> {
		self.listeners.read().get(&protocol).cloned()
	}

	/// The protocols with a registered listener.
	#[must_use]
	pub fn protocols(&self) -> Vec<Protocol> {
		self.listeners.read().keys().copied().collect()
	}

	/// A child of the root cancel token, for tasks that should stop with
	/// [`Self::halt_all`].
	#[must_use]
	pub fn cancel_token(&self) -> CancellationToken {
		self.root.lock().child_token()
	}

	/// Start every registered listener with the shared handler. Aborts on
	/// the first failure, leaving earlier listeners running.
	///
	/// # Errors
	/// Propagates the first listener startup error.
	pub async fn start_all(
		&self,
		handler: Arc<dyn ConnectionHandler>,
	) -> Result<(), ListenerError> {
		let root = self.root.lock().clone();
		let listeners: Vec<_> = self.listeners.read().values().cloned().collect();

		for listener in listeners {
			let protocol = listener.protocol();
			listener
				.start(root.clone(), Arc::clone(&handler))
				.await
				.inspect_err(|err| warn!(%protocol, %err, "listener failed during start_all"))?;
			info!(%protocol, "listener running");
		}
		Ok(())
	}

	/// Stop every running listener and cancel the root token. Stop
	/// failures are logged and do not prevent the remaining listeners
	/// from being halted. A fresh root token is installed so the manager
	/// can be started again.
	pub async fn halt_all(&self) {
		let listeners: Vec<_> = self.listeners.read().values().cloned().collect();

		for listener in listeners {
			if listener.status() == Status::Running {
				if let Err(err) = listener.stop().await {
					warn!(protocol = %listener.protocol(), %err, "error stopping listener");
				}
			}
		}

		let mut root = self.root.lock();
		root.cancel();
		*root = CancellationToken::new();
		info!("all listeners halted");
	}
}
