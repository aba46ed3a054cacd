//! The WebSocket listener: an HTTP server whose single upgrade endpoint
//! turns each connection into a long-lived bidirectional frame stream.
//! `enable_tls` wraps the transport in TLS with the configured
//! certificate and key. New upgrades are rejected with `503 Service
//! Unavailable` while the listener is at capacity, and shutdown waits a
//! bounded five seconds before forcing handler tasks down.

use std::{fs::File, io, io::BufReader, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::{
	io::{AsyncRead, AsyncWrite},
	sync::{OwnedSemaphorePermit, Semaphore},
	time::timeout,
};
use tokio_rustls::{rustls::ServerConfig as TlsConfig, TlsAcceptor};
use tokio_tungstenite::{
	accept_async, accept_hdr_async,
	tungstenite::{
		handshake::server::{ErrorResponse, Request, Response},
		http::StatusCode,
		Message,
	},
	WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::{
	tcp::bind_socket, Conn, ConnectionHandler, Lifecycle, Listener, ListenerConfig,
	ListenerError, Protocol, Status,
};

/// Bounded graceful-shutdown window before handler tasks are abandoned.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Listens for WebSocket upgrades on a configured address, optionally
/// behind TLS.
pub struct WsListener {
	lifecycle: Lifecycle,
	local_addr: RwLock<Option<SocketAddr>>,
}

impl WsListener {
	/// Create a stopped WebSocket listener.
	///
	/// # Errors
	/// Returns [`ListenerError::InvalidConfig`] if the configuration fails
	/// validation.
	pub fn new(config: ListenerConfig) -> Result<Self, ListenerError> {
		Ok(Self {
			lifecycle: Lifecycle::new(Protocol::Ws, config)?,
			local_addr: RwLock::new(None),
		})
	}

	/// The bound address while running.
	#[must_use]
	pub fn local_addr(&self) -> Option<SocketAddr> {
		*self.local_addr.read()
	}
}

/// Load the PEM certificate chain and private key configured for TLS.
fn tls_acceptor(config: &ListenerConfig) -> Result<TlsAcceptor, ListenerError> {
	let cert_path = config
		.tls_cert_path
		.as_ref()
		.ok_or_else(|| ListenerError::Tls("missing certificate path".to_string()))?;
	let key_path = config
		.tls_key_path
		.as_ref()
		.ok_or_else(|| ListenerError::Tls("missing key path".to_string()))?;

	let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
		.collect::<Result<Vec<_>, _>>()
		.map_err(|err| ListenerError::Tls(format!("bad certificate: {err}")))?;
	let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))
		.map_err(|err| ListenerError::Tls(format!("bad private key: {err}")))?
		.ok_or_else(|| ListenerError::Tls("no private key in key file".to_string()))?;

	let tls_config = TlsConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.map_err(|err| ListenerError::Tls(err.to_string()))?;

	Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

#[async_trait]
impl Listener for WsListener {
	async fn start(
		&self,
		cancel: CancellationToken,
		handler: Arc<dyn ConnectionHandler>,
	) -> Result<(), ListenerError> {
		let local_addr = &self.local_addr;
		self.lifecycle
			.start_with(cancel, |config, cancel| async move {
				let acceptor = if config.enable_tls {
					Some(tls_acceptor(&config)?)
				} else {
					None
				};

				let listener = bind_socket(&config.address)?;
				let local = listener.local_addr()?;
				*local_addr.write() = Some(local);

				Ok(tokio::spawn(accept_loop(
					listener, acceptor, config, cancel, handler,
				)))
			})
			.await
	}

	async fn stop(&self) -> Result<(), ListenerError> {
		let result = self.lifecycle.stop_with_grace(SHUTDOWN_GRACE).await;
		if result.is_ok() {
			*self.local_addr.write() = None;
		}
		result
	}

	fn protocol(&self) -> Protocol {
		Protocol::Ws
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
	listener: tokio::net::TcpListener,
	acceptor: Option<TlsAcceptor>,
	config: ListenerConfig,
	cancel: CancellationToken,
	handler: Arc<dyn ConnectionHandler>,
) {
	let local = listener.local_addr().ok();
	let semaphore = Arc::new(Semaphore::new(config.max_connections));
	let deadline = config.timeout();

	loop {
		let accepted = tokio::select! {
			() = cancel.cancelled() => break,
			accepted = timeout(deadline, listener.accept()) => accepted,
		};

		match accepted {
			Err(_elapsed) => continue,
			Ok(Err(err)) => {
				warn!(%err, "error accepting WebSocket transport connection");
				continue;
			}
			Ok(Ok((stream, remote))) => {
				// capacity is enforced at the upgrade, so a full server
				// answers 503 instead of leaving the client hanging
				let permit = Arc::clone(&semaphore).try_acquire_owned().ok();
				let acceptor = acceptor.clone();
				let handler = Arc::clone(&handler);
				let local = local.unwrap_or(remote);

				tokio::spawn(async move {
					match acceptor {
						None => {
							upgrade(stream, local, remote, deadline, permit, handler).await;
						}
						Some(acceptor) => match acceptor.accept(stream).await {
							Ok(stream) => {
								upgrade(stream, local, remote, deadline, permit, handler).await;
							}
							Err(err) => warn!(%remote, %err, "TLS accept failed"),
						},
					}
				});
			}
		}
	}

	trace!("WebSocket accept loop ended");
}

async fn upgrade<S>(
	stream: S,
	local: SocketAddr,
	remote: SocketAddr,
	deadline: Duration,
	permit: Option<OwnedSemaphorePermit>,
	handler: Arc<dyn ConnectionHandler>,
) where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let Some(permit) = permit else {
		let reject = |_req: &Request, _resp: Response| {
			let mut resp = ErrorResponse::new(Some("server at capacity".to_string()));
			*resp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
			Err(resp)
		};
		if let Err(err) = accept_hdr_async(stream, reject).await {
			trace!(%remote, %err, "rejected WebSocket upgrade at capacity");
		}
		return;
	};

	match accept_async(stream).await {
		Ok(ws) => {
			trace!(%remote, "accepted WebSocket connection");
			let conn = WsConn {
				ws,
				pending: Vec::new(),
				offset: 0,
				local,
				remote,
				read_deadline: deadline,
			};
			handler.handle(Box::new(conn)).await;
			drop(permit);
		}
		Err(err) => warn!(%remote, %err, "WebSocket upgrade failed"),
	}
}

struct WsConn<S> {
	ws: WebSocketStream<S>,
	pending: Vec<u8>,
	offset: usize,
	local: SocketAddr,
	remote: SocketAddr,
	read_deadline: Duration,
}

fn ws_io_error(err: tokio_tungstenite::tungstenite::Error) -> io::Error {
	io::Error::other(err)
}

#[async_trait]
impl<S> Conn for WsConn<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		// drain any unread remainder of the previous frame first
		while self.offset >= self.pending.len() {
			let next = timeout(self.read_deadline, self.ws.next())
				.await
				.map_err(|_| {
					io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded")
				})?;

			match next {
				None | Some(Ok(Message::Close(_))) => return Ok(0),
				Some(Ok(Message::Binary(data))) => {
					self.pending = data.to_vec();
					self.offset = 0;
				}
				Some(Ok(Message::Text(text))) => {
					self.pending = text.as_str().as_bytes().to_vec();
					self.offset = 0;
				}
				// control frames are answered by the protocol layer
				Some(Ok(_)) => {}
				Some(Err(err)) => return Err(ws_io_error(err)),
			}
		}

		let remaining = &self.pending[self.offset..];
		let n = remaining.len().min(buf.len());
		buf[..n].copy_from_slice(&remaining[..n]);
		self.offset += n;
		Ok(n)
	}

	async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
		self.ws
			.send(Message::binary(data.to_vec()))
			.await
			.map_err(ws_io_error)?;
		Ok(data.len())
	}

	async fn close(&mut self) -> io::Result<()> {
		match self.ws.close(None).await {
			Ok(()) | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
			Err(err) => Err(ws_io_error(err)),
		}
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
