//! The UDP listener: one bound datagram socket whose datagrams are
//! presented to the handler as synthetic single-shot connections. Reads
//! drain the captured datagram; writes send datagrams back to the source
//! address. The set of source addresses seen so far is this listener's
//! notion of its clients.

use std::{collections::HashSet, io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::{net::UdpSocket, sync::Semaphore, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::{
	Conn, ConnectionHandler, Lifecycle, Listener, ListenerConfig, ListenerError, Protocol, Status,
};

const STOP_GRACE: Duration = Duration::from_secs(2);

/// Listens for UDP datagrams on a configured address.
pub struct UdpListener {
	lifecycle: Lifecycle,
	local_addr: RwLock<Option<SocketAddr>>,
	peers: Arc<RwLock<HashSet<SocketAddr>>>,
}

impl UdpListener {
	/// Create a stopped UDP listener.
	///
	/// # Errors
	/// Returns [`ListenerError::InvalidConfig`] if the configuration fails
	/// validation.
	pub fn new(config: ListenerConfig) -> Result<Self, ListenerError> {
		Ok(Self {
			lifecycle: Lifecycle::new(Protocol::Udp, config)?,
			local_addr: RwLock::new(None),
			peers: Arc::new(RwLock::new(HashSet::new())),
		})
	}

	/// The bound address while running.
	#[must_use]
	pub fn local_addr(&self) -> Option<SocketAddr> {
		*self.local_addr.read()
	}

	/// Every source address this listener has received a datagram from.
	#[must_use]
	pub fn known_peers(&self) -> Vec<SocketAddr> {
		self.peers.read().iter().copied().collect()
	}
}

#[async_trait]
impl Listener for UdpListener {
	async fn start(
		&self,
		cancel: CancellationToken,
		handler: Arc<dyn ConnectionHandler>,
	) -> Result<(), ListenerError> {
		let local_addr = &self.local_addr;
		let peers = Arc::clone(&self.peers);

		self.lifecycle
			.start_with(cancel, |config, cancel| async move {
				let socket = Arc::new(UdpSocket::bind(&config.address).await?);
				let local = socket.local_addr()?;
				*local_addr.write() = Some(local);

				Ok(tokio::spawn(read_loop(socket, config, cancel, handler, peers)))
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
		Protocol::Udp
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

async fn read_loop(
	socket: Arc<UdpSocket>,
	config: ListenerConfig,
	cancel: CancellationToken,
	handler: Arc<dyn ConnectionHandler>,
	peers: Arc<RwLock<HashSet<SocketAddr>>>,
) {
	let local = socket.local_addr().ok();
	let semaphore = Arc::new(Semaphore::new(config.max_connections));
	let deadline = config.timeout();
	let mut buf = vec![0u8; config.buffer_size];

	loop {
		let permit = tokio::select! {
			() = cancel.cancelled() => break,
			permit = Arc::clone(&semaphore).acquire_owned() => {
				permit.expect("connection semaphore is never closed")
			}
		};

		let received = tokio::select! {
			() = cancel.cancelled() => break,
			received = timeout(deadline, socket.recv_from(&mut buf)) => received,
		};

		match received {
			Err(_elapsed) => continue,
			Ok(Err(err)) => {
				warn!(%err, "error reading UDP datagram");
				continue;
			}
			Ok(Ok((len, peer))) => {
				trace!(%peer, len, "received UDP datagram");
				peers.write().insert(peer);

				let conn = UdpConn {
					buffer: buf[..len].to_vec(),
					offset: 0,
					socket: Arc::clone(&socket),
					local: local.unwrap_or(peer),
					peer,
				};

				let handler = Arc::clone(&handler);
				tokio::spawn(async move {
					handler.handle(Box::new(conn)).await;
					drop(permit);
				});
			}
		}
	}

	trace!("UDP read loop ended");
}

/// A single datagram exchange disguised as a connection.
struct UdpConn {
	buffer: Vec<u8>,
	offset: usize,
	socket: Arc<UdpSocket>,
	local: SocketAddr,
	peer: SocketAddr,
}

#[async_trait]
impl Conn for UdpConn {
	async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		let remaining = &self.buffer[self.offset..];
		if remaining.is_empty() {
			return Ok(0);
		}

		let n = remaining.len().min(buf.len());
		buf[..n].copy_from_slice(&remaining[..n]);
		self.offset += n;
		Ok(n)
	}

	async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
		self.socket.send_to(data, self.peer).await
	}

	async fn close(&mut self) -> io::Result<()> {
		self.offset = self.buffer.len();
		Ok(())
	}

	fn local_addr(&self) -> SocketAddr {
		self.local
	}

	fn remote_addr(&self) -> SocketAddr {
		self.peer
	}

	fn set_read_deadline(&mut self, _deadline: Duration) {
		// reads drain a captured buffer and never block
	}
}
