//! End-to-end agent session tests over real sockets: key exchange,
//! registration, heartbeats, and status through the full pipeline.

use std::{sync::Arc, time::Duration};

use tether::{
	crypto::{Curve, Encrypter, EncryptionKind, KeyExchanger},
	listener::{tcp::TcpListener, udp::UdpListener, Listener, ListenerConfig},
	registry::ClientRegistry,
	security::{SecurityConfig, SecurityManager},
	server::EncryptedListener,
	wire::{AgentMessage, Envelope, KeyExchangeMessage, MessageKind, Reply, ReplyStatus},
};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpStream, UdpSocket},
	time::timeout,
};
use tokio_util::sync::CancellationToken;

fn security() -> Arc<SecurityManager> {
	SecurityManager::new(SecurityConfig {
		auth: tether::auth::AuthConfig {
			secret: b"integration test secret, long and random enough".to_vec(),
			..tether::auth::AuthConfig::default()
		},
		..SecurityConfig::default()
	})
	.unwrap()
}

fn listener_config() -> ListenerConfig {
	ListenerConfig {
		timeout_seconds: 2,
		..ListenerConfig::for_address("127.0.0.1:0")
	}
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
	let mut buf = vec![0u8; 4096];
	let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
		.await
		.expect("read timed out")
		.expect("read failed");
	buf.truncate(n);
	buf
}

/// The agent's half of the handshake: send a key-exchange frame, derive
/// the channel key from the response, and build the matching encrypter.
async fn agent_handshake(stream: &mut TcpStream, kind: EncryptionKind) -> Encrypter {
	let agent_keys = KeyExchanger::new(Curve::P256);
	let hello = KeyExchangeMessage::new(kind, agent_keys.public_key().to_vec(), 0)
		.to_bytes()
		.unwrap();
	stream.write_all(&hello).await.unwrap();

	let reply = read_frame(stream).await;
	let response = KeyExchangeMessage::detect(&reply).expect("handshake reply expected");
	assert_eq!(response.encryption_type, kind);
	assert!(response.key_rotation_time > 0);

	let key = agent_keys.derive_key(&response.public_key).unwrap();
	// the first negotiated key on a fresh connection has id 1
	Encrypter::new(kind, &key, 1).unwrap()
}

async fn send_encrypted(
	stream: &mut TcpStream,
	encrypter: &Encrypter,
	message: &AgentMessage,
) -> Reply {
	let plaintext = serde_json::to_vec(message).unwrap();
	let frame = encrypter.encrypt(&plaintext).unwrap();
	let envelope = Envelope::new(encrypter.kind(), encrypter.key_id(), frame);
	stream
		.write_all(&envelope.to_bytes().unwrap())
		.await
		.unwrap();

	let raw = read_frame(stream).await;
	let envelope = Envelope::from_bytes(&raw).expect("encrypted reply expected");
	let plaintext = encrypter.decrypt(&envelope.payload).unwrap();
	serde_json::from_slice(&plaintext).unwrap()
}

#[tokio::test]
async fn full_encrypted_session_over_tcp() {
	let registry = Arc::new(ClientRegistry::new());
	let security = security();
	let tcp = Arc::new(TcpListener::new(listener_config()).unwrap());
	let encrypted = EncryptedListener::new(
		Arc::clone(&tcp) as Arc<dyn Listener>,
		Arc::clone(&security),
		Arc::clone(&registry),
	);
	encrypted.start(CancellationToken::new()).await.unwrap();
	let addr = tcp.local_addr().unwrap();

	let mut stream = TcpStream::connect(addr).await.unwrap();
	let encrypter = agent_handshake(&mut stream, EncryptionKind::Aes).await;

	// the connection is registered while the session is live
	assert_eq!(registry.len(), 1);

	// register
	let register = AgentMessage {
		kind: MessageKind::Command,
		command: Some("register".to_string()),
		params: Some(serde_json::json!({
			"hostname": "edge-7",
			"os": "linux",
			"arch": "x86_64",
			"modules": ["shell", "files"],
			"protocols": ["tcp"],
		})),
	};
	let reply = send_encrypted(&mut stream, &encrypter, &register).await;
	assert_eq!(reply.status, ReplyStatus::Success);
	let token = reply.token.expect("register reply carries a session token");
	let claims = security.verify_token(&token).unwrap();
	assert_eq!(claims.role, "agent");

	let clients = registry.all();
	assert_eq!(clients[0].name, "edge-7");
	assert_eq!(clients[0].modules, vec!["shell", "files"]);

	// heartbeat
	let heartbeat = AgentMessage {
		kind: MessageKind::Heartbeat,
		command: None,
		params: None,
	};
	let reply = send_encrypted(&mut stream, &encrypter, &heartbeat).await;
	assert_eq!(reply.status, ReplyStatus::Success);
	assert_eq!(reply.message, "heartbeat received");

	// status
	let status = AgentMessage {
		kind: MessageKind::Command,
		command: Some("status".to_string()),
		params: None,
	};
	let reply = send_encrypted(&mut stream, &encrypter, &status).await;
	assert_eq!(reply.status, ReplyStatus::Success);
	let data = reply.data.unwrap();
	assert_eq!(data["encryption"], "aes");
	assert_eq!(data["name"], "edge-7");

	// disconnect triggers cleanup
	drop(stream);
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert!(registry.is_empty());

	encrypted.stop().await.unwrap();
}

#[tokio::test]
async fn undecryptable_frame_gets_error_reply_and_session_survives() {
	let registry = Arc::new(ClientRegistry::new());
	let security = security();
	let tcp = Arc::new(TcpListener::new(listener_config()).unwrap());
	let encrypted = EncryptedListener::new(
		Arc::clone(&tcp) as Arc<dyn Listener>,
		security,
		Arc::clone(&registry),
	);
	encrypted.start(CancellationToken::new()).await.unwrap();

	let mut stream = TcpStream::connect(tcp.local_addr().unwrap()).await.unwrap();
	let encrypter = agent_handshake(&mut stream, EncryptionKind::Chacha20).await;

	// garbage after the handshake: the frame is dropped with an error
	// reply, the connection stays open
	stream.write_all(b"complete garbage").await.unwrap();
	let raw = read_frame(&mut stream).await;
	let envelope = Envelope::from_bytes(&raw).unwrap();
	let reply: Reply =
		serde_json::from_slice(&encrypter.decrypt(&envelope.payload).unwrap()).unwrap();
	assert_eq!(reply.status, ReplyStatus::Error);

	// a valid heartbeat still works on the same connection
	let heartbeat = AgentMessage {
		kind: MessageKind::Heartbeat,
		command: None,
		params: None,
	};
	let reply = send_encrypted(&mut stream, &encrypter, &heartbeat).await;
	assert_eq!(reply.status, ReplyStatus::Success);

	encrypted.stop().await.unwrap();
}

#[tokio::test]
async fn plaintext_heartbeat_over_udp() {
	let registry = Arc::new(ClientRegistry::new());
	let udp = Arc::new(UdpListener::new(listener_config()).unwrap());
	let encrypted = EncryptedListener::new(
		Arc::clone(&udp) as Arc<dyn Listener>,
		security(),
		Arc::clone(&registry),
	);
	encrypted.start(CancellationToken::new()).await.unwrap();
	let addr = udp.local_addr().unwrap();

	let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
	client
		.send_to(b"{\"type\":\"heartbeat\"}", addr)
		.await
		.unwrap();

	let mut buf = [0u8; 1024];
	let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
		.await
		.unwrap()
		.unwrap();
	let reply: Reply = serde_json::from_slice(&buf[..n]).unwrap();
	assert_eq!(reply.status, ReplyStatus::Success);
	assert_eq!(reply.message, "heartbeat received");

	encrypted.stop().await.unwrap();
}
