//! The TCP listener: accepts stream connections and hands each to the
//! connection handler with read/write deadlines from the configured
//! timeout.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;
use socket2::{Domain, Protocol as SocketProtocol, Socket, Type};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener as TokioTcpListener, TcpStream},
	sync::Semaphore,
	time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::{
	Conn, ConnectionHandler, Lifecycle, Listener, ListenerConfig, ListenerError, Protocol, Status,
};

/// Number of incoming connections kept in the socket's backlog.
const TCP_BACKLOG: i32 = 1024;

/// How long `stop` waits for the accept task before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Listens for TCP stream connections on a configured address.
pub struct TcpListener {
	lifecycle: Lifecycle,
	local_addr: RwLock<Option<SocketAddr>>,
}

impl TcpListener {
	/// Create a stopped TCP listener.
	///
	/// # Errors
	/// Returns [`ListenerError::InvalidConfig`] if the configuration fails
	/// validation.
	pub fn new(config: ListenerConfig) -> Result<Self, ListenerError> {
		Ok(Self {
			lifecycle: Lifecycle::new(Protocol::Tcp, config)?,
			local_addr: RwLock::new(None),
		})
	}

	/// The bound address while running. Useful when binding port `0`.
	#[must_use]
	pub fn local_addr(&self) -> Option<SocketAddr> {
		*self.local_addr.read()
	}
}

/// Bind a TCP socket the same way for every start: address reuse on unix,
/// non-blocking for tokio, no-delay for latency. Shared with the
/// WebSocket listener, whose transport is also a TCP accept loop.
pub(crate) fn bind_socket(address: &str) -> Result<TokioTcpListener, ListenerError> {
	let addr: SocketAddr = address
		.parse()
		.map_err(|_| ListenerError::InvalidConfig(format!("invalid address {address}")))?;

	let socket = Socket::new(
		Domain::for_address(addr),
		Type::STREAM,
		Some(SocketProtocol::TCP),
	)?;
	socket.set_reuse_address(cfg!(unix))?;
	socket.set_nonblocking(true)?;
	socket.set_nodelay(true)?;
	socket.bind(&addr.into())?;
	socket.listen(TCP_BACKLOG)?;

	Ok(TokioTcpListener::from_std(socket.into())?)
}

#[async_trait]
impl Listener for TcpListener {
	async fn start(
		&self,
		cancel: CancellationToken,
		handler: Arc<dyn ConnectionHandler>,
	) -> Result<(), ListenerError> {
		let local_addr = &self.local_addr;
		self.lifecycle
			.start_with(cancel, |config, cancel| async move {
				let listener = bind_socket(&config.address)?;
				let local = listener.local_addr()?;
				*local_addr.write() = Some(local);

				Ok(tokio::spawn(accept_loop(listener, config, cancel, handler)))
			})
			.await
	}

	async fn stop(&self) -> Result<(), ListenerError> {
		let result = self.lifecycle.stop_with_grace(STOP_GRACE).await;
		if result.is_ok() {
			*self.local_addr.write() = None;
		}
		result
	}

	fn protocol(&self) -> Protocol {
		Protocol::Tcp
	}

	fn status(&self) -> Status {
		self.lifecycle.status()
	}

	fn config(&self) -> ListenerConfig {
		self.lifecycle.config()
	}

	fn update_config(&self, config: ListenerConfig) -> Result<(), ListenerError> {
		self.lifecycle.update_config(config)
	}
}

async fn accept_loop(
	listener: TokioTcpListener,
	config: ListenerConfig,
	cancel: CancellationToken,
	handler: Arc<dyn ConnectionHandler>,
) {
	let local = listener.local_addr().ok();
	let semaphore = Arc::new(Semaphore::new(config.max_connections));
	let deadline = config.timeout();

	loop {
		// capacity gate: accepting blocks until a handler slot frees up
		let permit = tokio::select! {
			() = cancel.cancelled() => break,
			permit = Arc::clone(&semaphore).acquire_owned() => {
				permit.expect("connection semaphore is never closed")
			}
		};

		let accepted = tokio::select! {
			() = cancel.cancelled() => break,
			accepted = timeout(deadline, listener.accept()) => accepted,
		};

		match accepted {
			// the per-accept deadline is only a cancellation-check boundary
			Err(_elapsed) => continue,
			Ok(Err(err)) => {
				warn!(%err, "error accepting TCP connection");
				continue;
			}
			Ok(Ok((stream, remote))) => {
				trace!(%remote, "accepted TCP connection");
				let conn = TcpConn {
					stream,
					local: local.unwrap_or(remote),
					remote,
					read_deadline: deadline,
					write_deadline: deadline,
				};

				let handler = Arc::clone(&handler);
				tokio::spawn(async move {
					handler.handle(Box::new(conn)).await;
					drop(permit);
				});
			}
		}
	}

	// dropping the listener here closes the socket
	trace!("TCP accept loop ended");
}

struct TcpConn {
	stream: TcpStream,
	local: SocketAddr,
	remote: SocketAddr,
	read_deadline: Duration,
	write_deadline: Duration,
}

#[async_trait]
impl Conn for TcpConn {
	async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		timeout(self.read_deadline, self.stream.read(buf))
			.await
			.map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded"))?
	}

	async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
		timeout(self.write_deadline, self.stream.write(data))
			.await
			.map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded"))?
	}

	async fn close(&mut self) -> io::Result<()> {
		self.stream.shutdown().await
	}

	fn local_addr(&self) -> SocketAddr {
		self.local
	}

	fn remote_addr(&self) -> SocketAddr {
		self.remote
	}

	fn set_read_deadline(&mut self, deadline: Duration) {
		self.read_deadline = deadline;
	}
}
