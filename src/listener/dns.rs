//! The DNS tunnelling listener: a UDP DNS server that treats the QNAME
//! of each query as encoded agent payload and answers with the handler's
//! reply encoded into record data.
//!
//! Payload labels use lowercase hex. DNS names are case-insensitive in
//! transit (resolvers may 0x20-randomize them), so a case-sensitive
//! alphabet like base64 would corrupt payloads; hex survives any
//! resolver at the cost of 2x expansion. Labels carry up to 62 hex
//! characters (31 payload bytes) each, below the 63-byte label limit.
//! Replies use the query's record type when it is in the configured
//! list, the first configured type otherwise: `A` records pack reply
//! bytes four per record, `TXT` records carry hex character-strings, and
//! `CNAME` answers encode the reply as hex labels under the base domain.

use std::{io, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use hickory_proto::{
	op::{Message, MessageType, OpCode, Query, ResponseCode},
	rr::{
		rdata::{A, CNAME, TXT},
		Name, RData, Record, RecordType,
	},
};
use parking_lot::RwLock;
use tokio::{net::UdpSocket, sync::Semaphore, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::{
	Conn, ConnectionHandler, DnsConfig, DnsRecordKind, Lifecycle, Listener, ListenerConfig,
	ListenerError, Protocol, Status,
};

const STOP_GRACE: Duration = Duration::from_secs(2);

/// Payload bytes per QNAME label (62 hex characters).
const LABEL_PAYLOAD_BYTES: usize = 31;

/// Listens for DNS queries on a configured UDP address.
pub struct DnsListener {
	lifecycle: Lifecycle,
	local_addr: RwLock<Option<SocketAddr>>,
}

impl DnsListener {
	/// Create a stopped DNS listener. The configuration must carry a
	/// [`DnsConfig`].
	///
	/// # Errors
	/// Returns [`ListenerError::InvalidConfig`] if validation fails, no
	/// [`DnsConfig`] is present, its record-type list is empty, or the
	/// base domain does not parse.
	pub fn new(config: ListenerConfig) -> Result<Self, ListenerError> {
		let Some(ref dns) = config.dns else {
			return Err(ListenerError::InvalidConfig(
				"dns listener requires a dns config section".to_string(),
			));
		};
		if dns.record_types.is_empty() {
			return Err(ListenerError::InvalidConfig(
				"dns record_types must not be empty".to_string(),
			));
		}
		Name::from_str(&dns.domain).map_err(|_| {
			ListenerError::InvalidConfig(format!("invalid dns base domain {}", dns.domain))
		})?;

		Ok(Self {
			lifecycle: Lifecycle::new(Protocol::Dns, config)?,
			local_addr: RwLock::new(None),
		})
	}

	/// The bound address while running.
	#[must_use]
	pub fn local_addr(&self) -> Option<SocketAddr> {
		*self.local_addr.read()
	}
}

/// Encode payload bytes into a QNAME under `domain` using the hex label
/// alphabet. This is what agents do on their side of the tunnel; it is
/// exposed for them and for tests.
///
/// # Errors
/// Returns [`ListenerError::InvalidConfig`] when the resulting name is
/// malformed (e.g. the payload pushes it past the 255-byte name limit).
pub fn encode_payload_qname(payload: &[u8], domain: &str) -> Result<Name, ListenerError> {
	let mut name = String::new();
	for chunk in payload.chunks(LABEL_PAYLOAD_BYTES) {
		name.push_str(&hex::encode(chunk));
		name.push('.');
	}
	name.push_str(domain);

	Name::from_str(&name)
		.map_err(|err| ListenerError::InvalidConfig(format!("payload does not fit a qname: {err}")))
}

/// Decode the payload carried by `qname`: every label in front of the
/// base domain, hex-decoded in order. Returns `None` when the name is
/// not under the base domain or a label is not valid hex.
fn decode_payload_qname(qname: &Name, base: &Name) -> Option<Vec<u8>> {
	if !base.zone_of(qname) {
		return None;
	}

	let payload_labels = qname.num_labels().checked_sub(base.num_labels())?;
	let mut hex_chars = String::new();
	for label in qname.iter().take(usize::from(payload_labels)) {
		hex_chars.push_str(std::str::from_utf8(label).ok()?);
	}

	hex::decode(hex_chars.to_ascii_lowercase()).ok()
}

#[async_trait]
impl Listener for DnsListener {
	async fn start(
		&self,
		cancel: CancellationToken,
		handler: Arc<dyn ConnectionHandler>,
	) -> Result<(), ListenerError> {
		let local_addr = &self.local_addr;
		self.lifecycle
			.start_with(cancel, |config, cancel| async move {
				let socket = Arc::new(UdpSocket::bind(&config.address).await?);
				let local = socket.local_addr()?;
				*local_addr.write() = Some(local);

				Ok(tokio::spawn(serve_loop(socket, config, cancel, handler)))
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
		Protocol::Dns
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

async fn serve_loop(
	socket: Arc<UdpSocket>,
	config: ListenerConfig,
	cancel: CancellationToken,
	handler: Arc<dyn ConnectionHandler>,
) {
	let local = socket.local_addr().ok();
	let semaphore = Arc::new(Semaphore::new(config.max_connections));
	let deadline = config.timeout();
	let dns = config.dns.clone().unwrap_or_default();
	let base = Name::from_str(&dns.domain).expect("domain validated at construction");
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

		let (len, peer) = match received {
			Err(_elapsed) => continue,
			Ok(Err(err)) => {
				warn!(%err, "error reading DNS query");
				continue;
			}
			Ok(Ok(received)) => received,
		};

		let query_message = match Message::from_vec(&buf[..len]) {
			Ok(message) => message,
			Err(err) => {
				trace!(%peer, %err, "dropping malformed DNS message");
				continue;
			}
		};
		let Some(query) = query_message.queries().first().cloned() else {
			continue;
		};

		let Some(payload) = decode_payload_qname(query.name(), &base) else {
			trace!(%peer, qname = %query.name(), "query outside the tunnel domain");
			let refusal =
				build_response(query_message.id(), &query, ResponseCode::FormErr, Vec::new());
			send_response(&socket, &refusal, peer).await;
			continue;
		};

		trace!(%peer, len = payload.len(), "received tunnelled DNS payload");
		let conn = DnsConn {
			buffer: payload,
			offset: 0,
			socket: Arc::clone(&socket),
			local: local.unwrap_or(peer),
			peer,
			query_id: query_message.id(),
			query,
			dns: dns.clone(),
		};

		let handler = Arc::clone(&handler);
		tokio::spawn(async move {
			handler.handle(Box::new(conn)).await;
			drop(permit);
		});
	}

	trace!("DNS serve loop ended");
}

fn build_response(id: u16, query: &Query, code: ResponseCode, answers: Vec<Record>) -> Message {
	let mut response = Message::new();
	response
		.set_id(id)
		.set_message_type(MessageType::Response)
		.set_op_code(OpCode::Query)
		.set_recursion_desired(false)
		.set_recursion_available(false)
		.set_response_code(code)
		.add_query(query.clone());
	for answer in answers {
		response.add_answer(answer);
	}
	response
}

async fn send_response(socket: &UdpSocket, response: &Message, peer: SocketAddr) {
	match response.to_vec() {
		Ok(bytes) => {
			if let Err(err) = socket.send_to(&bytes, peer).await {
				warn!(%peer, %err, "error sending DNS response");
			}
		}
		Err(err) => warn!(%err, "error encoding DNS response"),
	}
}

/// Pick the answer record kind: the query's own type when configured,
/// the first configured type otherwise.
fn pick_record_kind(query_type: RecordType, configured: &[DnsRecordKind]) -> DnsRecordKind {
	let wanted = match query_type {
		RecordType::A => Some(DnsRecordKind::A),
		RecordType::TXT => Some(DnsRecordKind::Txt),
		RecordType::CNAME => Some(DnsRecordKind::Cname),
		_ => None,
	};

	wanted
		.filter(|kind| configured.contains(kind))
		.or_else(|| configured.first().copied())
		.unwrap_or(DnsRecordKind::Txt)
}

/// Encode reply bytes into answer records of the chosen kind.
fn encode_answers(reply: &[u8], query: &Query, dns: &DnsConfig) -> Vec<Record> {
	let name = query.name().clone();
	let kind = pick_record_kind(query.query_type(), &dns.record_types);

	match kind {
		DnsRecordKind::A => reply
			.chunks(4)
			.map(|chunk| {
				let mut octets = [0u8; 4];
				octets[..chunk.len()].copy_from_slice(chunk);
				Record::from_rdata(
					name.clone(),
					dns.ttl,
					RData::A(A::new(octets[0], octets[1], octets[2], octets[3])),
				)
			})
			.collect(),
		DnsRecordKind::Txt => {
			// 255-byte character-strings; hex stays comfortably under
			let strings = hex::encode(reply)
				.as_bytes()
				.chunks(254)
				.map(|chunk| String::from_utf8_lossy(chunk).into_owned())
				.collect::<Vec<_>>();
			vec![Record::from_rdata(
				name,
				dns.ttl,
				RData::TXT(TXT::new(strings)),
			)]
		}
		DnsRecordKind::Cname => {
			let target = encode_payload_qname(reply, &dns.domain)
				.unwrap_or_else(|_| Name::from_str(&dns.domain).unwrap_or_default());
			vec![Record::from_rdata(
				name,
				dns.ttl,
				RData::CNAME(CNAME(target)),
			)]
		}
	}
}

/// One query/response exchange disguised as a connection. Reads drain
/// the decoded QNAME payload; each write answers the query with the
/// written bytes encoded into record data.
struct DnsConn {
	buffer: Vec<u8>,
	offset: usize,
	socket: Arc<UdpSocket>,
	local: SocketAddr,
	peer: SocketAddr,
	query_id: u16,
	query: Query,
	dns: DnsConfig,
}

#[async_trait]
impl Conn for DnsConn {
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
		let answers = encode_answers(data, &self.query, &self.dns);
		let response = build_response(self.query_id, &self.query, ResponseCode::NoError, answers);
		let bytes = response
			.to_vec()
			.map_err(|err| io::Error::other(format!("dns encoding: {err}")))?;

		self.socket.send_to(&bytes, self.peer).await?;
		Ok(data.len())
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

#[cfg(test)]
mod tests {
	use super::*;
	use crate::listener::BoxConn;

	struct EchoHandler;

	#[async_trait]
	impl ConnectionHandler for EchoHandler {
		async fn handle(&self, mut conn: BoxConn) {
			let mut buf = [0u8; 1024];
			let n = conn.read(&mut buf).await.unwrap();
			let _ = conn.write(&buf[..n]).await;
			let _ = conn.close().await;
		}
	}

	fn config() -> ListenerConfig {
		ListenerConfig {
			timeout_seconds: 1,
			dns: Some(DnsConfig {
				domain: "t.example.com".to_string(),
				ttl: 60,
				record_types: vec![DnsRecordKind::Txt, DnsRecordKind::A],
			}),
			..ListenerConfig::for_address("127.0.0.1:0")
		}
	}

	fn query_for(payload: &[u8], record_type: RecordType) -> Message {
		let name = encode_payload_qname(payload, "t.example.com").unwrap();
		let mut message = Message::new();
		message
			.set_id(0x4242)
			.set_message_type(MessageType::Query)
			.set_op_code(OpCode::Query)
			.set_recursion_desired(true)
			.add_query(Query::query(name, record_type));
		message
	}

	#[test]
	fn qname_codec_round_trip() {
		let base = Name::from_str("t.example.com").unwrap();
		for payload in [&b"x"[..], b"some longer tunnelled request payload"] {
			let qname = encode_payload_qname(payload, "t.example.com").unwrap();
			assert_eq!(decode_payload_qname(&qname, &base).unwrap(), payload);
		}
	}

	#[test]
	fn qname_outside_domain_rejected() {
		let base = Name::from_str("t.example.com").unwrap();
		let other = Name::from_str("deadbeef.other.org").unwrap();
		assert_eq!(decode_payload_qname(&other, &base), None);
	}

	#[test]
	fn non_hex_labels_rejected() {
		let base = Name::from_str("t.example.com").unwrap();
		let bad = Name::from_str("not-hex.t.example.com").unwrap();
		assert_eq!(decode_payload_qname(&bad, &base), None);
	}

	#[test]
	fn record_kind_selection() {
		let configured = vec![DnsRecordKind::Txt, DnsRecordKind::A];
		assert_eq!(
			pick_record_kind(RecordType::A, &configured),
			DnsRecordKind::A
		);
		assert_eq!(
			pick_record_kind(RecordType::TXT, &configured),
			DnsRecordKind::Txt
		);
		// unlisted query type falls back to the first configured kind
		assert_eq!(
			pick_record_kind(RecordType::CNAME, &configured),
			DnsRecordKind::Txt
		);
	}

	#[tokio::test]
	async fn query_and_txt_answer_round_trip() {
		let listener = DnsListener::new(config()).unwrap();
		listener
			.start(CancellationToken::new(), Arc::new(EchoHandler))
			.await
			.unwrap();
		let addr = listener.local_addr().unwrap();

		let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let query = query_for(b"hello tunnel", RecordType::TXT);
		client.send_to(&query.to_vec().unwrap(), addr).await.unwrap();

		let mut buf = [0u8; 2048];
		let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
			.await
			.unwrap()
			.unwrap();
		let response = Message::from_vec(&buf[..n]).unwrap();

		assert_eq!(response.id(), 0x4242);
		assert_eq!(response.response_code(), ResponseCode::NoError);
		let answer = &response.answers()[0];
		assert_eq!(answer.ttl(), 60);

		let RData::TXT(txt) = answer.data().unwrap() else {
			panic!("expected TXT answer");
		};
		let hex_reply = txt
			.txt_data()
			.iter()
			.map(|s| String::from_utf8_lossy(s).into_owned())
			.collect::<String>();
		assert_eq!(hex::decode(hex_reply).unwrap(), b"hello tunnel");

		listener.stop().await.unwrap();
	}

	#[tokio::test]
	async fn foreign_query_answered_with_formerr() {
		let listener = DnsListener::new(config()).unwrap();
		listener
			.start(CancellationToken::new(), Arc::new(EchoHandler))
			.await
			.unwrap();
		let addr = listener.local_addr().unwrap();

		let mut message = Message::new();
		message
			.set_id(7)
			.set_message_type(MessageType::Query)
			.add_query(Query::query(
				Name::from_str("www.unrelated.org").unwrap(),
				RecordType::A,
			));

		let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		client
			.send_to(&message.to_vec().unwrap(), addr)
			.await
			.unwrap();

		let mut buf = [0u8; 512];
		let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
			.await
			.unwrap()
			.unwrap();
		let response = Message::from_vec(&buf[..n]).unwrap();
		assert_eq!(response.response_code(), ResponseCode::FormErr);

		listener.stop().await.unwrap();
	}

	#[tokio::test]
	async fn lifecycle_matches_contract() {
		let listener = DnsListener::new(ListenerConfig {
			dns: Some(DnsConfig {
				domain: "example.com".to_string(),
				ttl: 60,
				record_types: vec![DnsRecordKind::A, DnsRecordKind::Txt],
			}),
			..ListenerConfig::for_address("127.0.0.1:0")
		})
		.unwrap();
		assert_eq!(listener.protocol(), Protocol::Dns);
		assert_eq!(listener.protocol().to_string(), "dns");

		listener
			.start(CancellationToken::new(), Arc::new(EchoHandler))
			.await
			.unwrap();
		assert_eq!(listener.status(), Status::Running);

		listener.stop().await.unwrap();
		assert_eq!(listener.status(), Status::Stopped);
		assert!(matches!(
			listener.stop().await,
			Err(ListenerError::NotRunning)
		));
	}

	#[tokio::test]
	async fn missing_dns_config_rejected() {
		assert!(matches!(
			DnsListener::new(ListenerConfig::for_address("127.0.0.1:0")),
			Err(ListenerError::InvalidConfig(_))
		));
	}
}
