//! The transport layer: one listener per protocol, all behind the same
//! lifecycle contract and all producing the same connection abstraction.
//!
//! A listener controls a network socket and owns an accept/read task
//! spawned by [`Listener::start`]. Each accepted connection or datagram is
//! handed to the registered [`ConnectionHandler`] as a [`Conn`], so the
//! encrypted channel and dispatcher above never care whether the bytes
//! arrived over a TCP stream, a WebSocket frame, a UDP datagram, an ICMP
//! echo, or a DNS query.
//!
//! Lifecycle: `stopped -> running` on a successful `start`, back to
//! `stopped` on `stop` or cancellation, and to `error` when binding or
//! accepting fails during startup. Transitions are serialized; starting a
//! running listener and stopping a stopped one are typed errors.

pub mod dns;
pub mod icmp;
pub mod manager;
pub mod tcp;
pub mod udp;
pub mod ws;

use std::{io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum::{Display as EnumDisplay, EnumString};
use tokio::{sync::Mutex, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use self::manager::ListenerManager;

/// Default read buffer size when the config leaves it unset.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default connection capacity when the config leaves it unset.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Default per-operation timeout when the config leaves it unset.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// The transport protocols tether can listen on.
#[derive(
	Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, EnumDisplay,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Protocol {
	/// Stream connections over TCP
	Tcp,
	/// Datagrams over UDP
	Udp,
	/// WebSocket frames over an HTTP(S) upgrade
	Ws,
	/// ICMP echo request/reply pairs over a raw socket
	Icmp,
	/// DNS queries carrying tunnelled payloads
	Dns,
}

/// A listener's lifecycle status.
#[derive(
	Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, EnumDisplay,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
	/// Not accepting traffic; the only state `update_config` is allowed in
	#[default]
	Stopped,
	/// The accept/read task is live
	Running,
	/// Startup failed; the socket was never (or is no longer) usable
	Error,
}

/// The errors produced by listeners and the listener manager.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ListenerError {
	/// The configuration failed validation
	#[error("invalid listener configuration: {0}")]
	InvalidConfig(String),
	/// `start` was called while already running
	#[error("listener is already running")]
	AlreadyRunning,
	/// `stop` or `update_config` was called in the wrong state
	#[error("listener is not running")]
	NotRunning,
	/// `update_config` was called while running
	#[error("listener must be stopped to update its configuration")]
	NotStopped,
	/// Socket setup or accept failed
	#[error("listener i/o error: {0}")]
	Io(#[from] io::Error),
	/// TLS certificate or key loading failed
	#[error("tls setup failed: {0}")]
	Tls(String),
	/// A listener is already registered for this protocol
	#[error("listener already registered for {0}")]
	DuplicateListener(Protocol),
	/// No listener is registered for this protocol
	#[error("no listener registered for {0}")]
	UnknownListener(Protocol),
}

/// The DNS record types a DNS listener can answer with.
#[derive(
	Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString, EnumDisplay,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum DnsRecordKind {
	/// IPv4 address records, reply bytes packed four per record
	A,
	/// Text records, reply bytes hex-encoded into character strings
	Txt,
	/// Canonical-name records, reply bytes hex-encoded into labels
	Cname,
}

/// Extra configuration for the DNS tunnelling listener.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
	/// The base domain queries are addressed to; its labels are stripped
	/// from the QNAME before payload decoding
	pub domain: String,
	/// TTL for answer records
	pub ttl: u32,
	/// Record types answers may use, in preference order
	pub record_types: Vec<DnsRecordKind>,
}

impl Default for DnsConfig {
	fn default() -> Self {
		Self {
			domain: "example.com".to_string(),
			ttl: 60,
			record_types: vec![DnsRecordKind::Txt],
		}
	}
}

/// Configuration shared by all listeners. Zero-valued numeric fields are
/// filled with defaults during validation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
	/// `host:port` to bind
	pub address: String,
	/// Whether to wrap the transport in TLS (WebSocket listener only)
	#[serde(default)]
	pub enable_tls: bool,
	/// PEM certificate chain path, required when `enable_tls` is set
	#[serde(default)]
	pub tls_cert_path: Option<PathBuf>,
	/// PEM private key path, required when `enable_tls` is set
	#[serde(default)]
	pub tls_key_path: Option<PathBuf>,
	/// Read buffer size in bytes; `0` means the 4096 default
	#[serde(default)]
	pub buffer_size: usize,
	/// Concurrent connection capacity; `0` means the 100 default
	#[serde(default)]
	pub max_connections: usize,
	/// Per-operation timeout in seconds; `0` means the 30 s default
	#[serde(default)]
	pub timeout_seconds: u64,
	/// DNS-specific settings, used by the DNS listener only
	#[serde(default)]
	pub dns: Option<DnsConfig>,
}

impl ListenerConfig {
	/// A config binding `address` with everything else defaulted.
	#[must_use]
	pub fn for_address(address: impl Into<String>) -> Self {
		Self {
			address: address.into(),
			..Self::default()
		}
	}

	/// Validate this configuration, filling defaulted fields.
	///
	/// # Errors
	/// Returns [`ListenerError::InvalidConfig`] for an empty address or a
	/// TLS configuration without certificate/key paths.
	pub fn validated(mut self) -> Result<Self, ListenerError> {
		if self.address.is_empty() {
			return Err(ListenerError::InvalidConfig(
				"address must not be empty".to_string(),
			));
		}
		if self.enable_tls && (self.tls_cert_path.is_none() || self.tls_key_path.is_none()) {
			return Err(ListenerError::InvalidConfig(
				"tls requires both tls_cert_path and tls_key_path".to_string(),
			));
		}

		if self.buffer_size == 0 {
			self.buffer_size = DEFAULT_BUFFER_SIZE;
		}
		if self.max_connections == 0 {
			self.max_connections = DEFAULT_MAX_CONNECTIONS;
		}
		if self.timeout_seconds == 0 {
			self.timeout_seconds = DEFAULT_TIMEOUT_SECS;
		}

		Ok(self)
	}

	/// The per-operation timeout as a [`Duration`].
	#[must_use]
	pub const fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_seconds)
	}
}

/// A transport connection as seen by the connection handler: reads,
/// writes, a close, addressing, and a read deadline the handler adjusts
/// per iteration. Datagram transports back this with a captured payload
/// buffer and a write-to-source shim.
#[async_trait]
pub trait Conn: Send {
	/// Read up to `buf.len()` bytes. `Ok(0)` means the peer is done.
	///
	/// # Errors
	/// I/O errors of the underlying transport; [`io::ErrorKind::TimedOut`]
	/// when the read deadline passes.
	async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

	/// Write `data`, returning how many bytes were accepted.
	///
	/// # Errors
	/// I/O errors of the underlying transport.
	async fn write(&mut self, data: &[u8]) -> io::Result<usize>;

	/// Close the connection. Further reads and writes fail.
	///
	/// # Errors
	/// I/O errors of the underlying transport.
	async fn close(&mut self) -> io::Result<()>;

	/// The local address the connection arrived on.
	fn local_addr(&self) -> SocketAddr;

	/// The peer's address.
	fn remote_addr(&self) -> SocketAddr;

	/// Set the deadline applied to subsequent reads.
	fn set_read_deadline(&mut self, deadline: Duration);
}

/// A boxed [`Conn`], what handlers actually receive.
pub type BoxConn = Box<dyn Conn>;

/// The callback a listener invokes for every accepted connection or
/// datagram.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
	/// Handle one connection. Runs in its own task; the handler owns the
	/// connection and is responsible for closing it.
	async fn handle(&self, conn: BoxConn);
}

/// The lifecycle contract every protocol listener implements.
#[async_trait]
pub trait Listener: Send + Sync {
	/// Bind the socket and spawn the accept/read task. The task runs until
	/// `cancel` fires or `stop` is called.
	///
	/// # Errors
	/// [`ListenerError::AlreadyRunning`] in the running state; socket
	/// setup failures transition the listener to [`Status::Error`] and
	/// propagate their cause.
	async fn start(
		&self,
		cancel: CancellationToken,
		handler: Arc<dyn ConnectionHandler>,
	) -> Result<(), ListenerError>;

	/// Halt the accept/read task and release the socket.
	///
	/// # Errors
	/// [`ListenerError::NotRunning`] unless currently running.
	async fn stop(&self) -> Result<(), ListenerError>;

	/// The protocol this listener serves.
	fn protocol(&self) -> Protocol;

	/// The current lifecycle status.
	fn status(&self) -> Status;

	/// A snapshot of the active configuration.
	fn config(&self) -> ListenerConfig;

	/// Replace the configuration. Only permitted while stopped.
	///
	/// # Errors
	/// [`ListenerError::NotStopped`] while running;
	/// [`ListenerError::InvalidConfig`] if the new config fails
	/// validation.
	fn update_config(&self, config: ListenerConfig) -> Result<(), ListenerError>;
}

struct LifecycleInner {
	cancel: Option<CancellationToken>,
	task: Option<JoinHandle<()>>,
}

/// Shared lifecycle state for listener implementations: the validated
/// config, the externally visible status, and the accept task's cancel
/// token and join handle. Transitions are serialized by an async mutex so
/// a `start` racing a `stop` resolves in a defined order.
pub(crate) struct Lifecycle {
	protocol: Protocol,
	config: RwLock<ListenerConfig>,
	status: RwLock<Status>,
	inner: Mutex<LifecycleInner>,
}

impl Lifecycle {
	fn new(protocol: Protocol, config: ListenerConfig) -> Result<Self, ListenerError> {
		Ok(Self {
			protocol,
			config: RwLock::new(config.validated()?),
			status: RwLock::new(Status::Stopped),
			inner: Mutex::new(LifecycleInner {
				cancel: None,
				task: None,
			}),
		})
	}

	fn status(&self) -> Status {
		*self.status.read()
	}

	fn config(&self) -> ListenerConfig {
		self.config.read().clone()
	}

	fn update_config(&self, config: ListenerConfig) -> Result<(), ListenerError> {
		if self.status() != Status::Stopped {
			return Err(ListenerError::NotStopped);
		}
		*self.config.write() = config.validated()?;
		Ok(())
	}

	/// Run `bind` and, on success, record the spawned accept task. The
	/// whole transition happens under the state lock.
	async fn start_with<F, Fut>(
		&self,
		cancel: CancellationToken,
		bind: F,
	) -> Result<(), ListenerError>
	where
		F: FnOnce(ListenerConfig, CancellationToken) -> Fut + Send,
		Fut: std::future::Future<Output = Result<JoinHandle<()>, ListenerError>> + Send,
	{
		let mut inner = self.inner.lock().await;
		if self.status() == Status::Running {
			return Err(ListenerError::AlreadyRunning);
		}

		let child = cancel.child_token();
		match bind(self.config(), child.clone()).await {
			Ok(task) => {
				inner.cancel = Some(child);
				inner.task = Some(task);
				*self.status.write() = Status::Running;
				debug!(protocol = %self.protocol, "listener started");
				Ok(())
			}
			Err(err) => {
				*self.status.write() = Status::Error;
				warn!(protocol = %self.protocol, %err, "listener failed to start");
				Err(err)
			}
		}
	}

	/// Cancel the accept task and wait up to `grace` for it to finish,
	/// aborting it after that. Always ends in [`Status::Stopped`] once a
	/// running listener was found.
	async fn stop_with_grace(&self, grace: Duration) -> Result<(), ListenerError> {
		let mut inner = self.inner.lock().await;
		if self.status() != Status::Running {
			return Err(ListenerError::NotRunning);
		}

		if let Some(cancel) = inner.cancel.take() {
			cancel.cancel();
		}
		if let Some(mut task) = inner.task.take() {
			if timeout(grace, &mut task).await.is_err() {
				task.abort();
				warn!(
					protocol = %self.protocol,
					"accept task did not stop within grace period",
				);
			}
		}

		*self.status.write() = Status::Stopped;
		debug!(protocol = %self.protocol, "listener stopped");
		Ok(())
	}
}
