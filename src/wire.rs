//! The JSON wire formats of the agent channel: the encrypted-message
//! envelope, key-exchange frames, and the command/heartbeat messages
//! carried inside envelope payloads.
//!
//! Binary payloads travel base64-encoded inside JSON strings; the
//! ciphertext framing itself is documented in [`crate::crypto::aead`].

use serde::{Deserialize, Serialize};
use strum::{Display as EnumDisplay, EnumString};

use crate::{crypto::EncryptionKind, util::unix_now};

/// The only accepted envelope version.
pub const ENVELOPE_VERSION: u32 = 1;

/// The errors produced when encoding or decoding wire frames.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WireError {
	/// The bytes were not valid JSON for the expected shape
	#[error("malformed frame: {0}")]
	Malformed(#[from] serde_json::Error),
	/// The envelope carried a version other than [`ENVELOPE_VERSION`]
	#[error("unsupported envelope version {0}")]
	UnsupportedVersion(u32),
}

mod base64_bytes {
	//! `Vec<u8>` as a base64 JSON string.

	use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&BASE64.encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
		let encoded = String::deserialize(deserializer)?;
		BASE64
			.decode(encoded)
			.map_err(serde::de::Error::custom)
	}
}

/// The header of an encrypted-message envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
	/// Envelope format version; always [`ENVELOPE_VERSION`]
	pub version: u32,
	/// The encryption the payload was produced under
	pub encryption: EncryptionKind,
	/// The key id the payload's frame is bound to
	pub key_id: u32,
	/// Unix seconds at encryption time
	pub timestamp: u64,
}

/// An encrypted message on the wire: a header describing the ciphertext
/// and the ciphertext frame itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
	/// Describes how the payload is encrypted
	pub header: EnvelopeHeader,
	/// The ciphertext frame, base64-encoded in JSON
	#[serde(with = "base64_bytes")]
	pub payload: Vec<u8>,
}

impl Envelope {
	/// Build an envelope around a ciphertext frame, stamped with the
	/// current time.
	#[must_use]
	pub fn new(encryption: EncryptionKind, key_id: u32, payload: Vec<u8>) -> Self {
		Self {
			header: EnvelopeHeader {
				version: ENVELOPE_VERSION,
				encryption,
				key_id,
				timestamp: unix_now(),
			},
			payload,
		}
	}

	/// Serialize to JSON bytes.
	///
	/// # Errors
	/// Returns [`WireError::Malformed`] if serialization fails.
	pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
		Ok(serde_json::to_vec(self)?)
	}

	/// Parse an envelope from JSON bytes, rejecting unknown versions.
	///
	/// # Errors
	/// [`WireError::Malformed`] for invalid JSON,
	/// [`WireError::UnsupportedVersion`] for any version other than 1.
	pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
		let envelope: Self = serde_json::from_slice(bytes)?;
		if envelope.header.version != ENVELOPE_VERSION {
			return Err(WireError::UnsupportedVersion(envelope.header.version));
		}
		Ok(envelope)
	}
}

/// A key-exchange frame. Sent by an agent to initiate a handshake and by
/// the server in response, carrying the responder's ephemeral public key
/// and the next scheduled rotation time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeMessage {
	/// Always `"key_exchange"`
	#[serde(rename = "type")]
	pub kind: String,
	/// The symmetric encryption the agent wants for its channel
	pub encryption_type: EncryptionKind,
	/// The sender's ephemeral public key (SEC1, base64 in JSON)
	#[serde(with = "base64_bytes")]
	pub public_key: Vec<u8>,
	/// Unix seconds of the next scheduled key rotation
	#[serde(default)]
	pub key_rotation_time: u64,
}

impl KeyExchangeMessage {
	/// The value of the `type` field identifying key-exchange frames.
	pub const TYPE: &'static str = "key_exchange";

	/// Build a key-exchange frame.
	#[must_use]
	pub fn new(encryption_type: EncryptionKind, public_key: Vec<u8>, key_rotation_time: u64) -> Self {
		Self {
			kind: Self::TYPE.to_string(),
			encryption_type,
			public_key,
			key_rotation_time,
		}
	}

	/// Try to parse `bytes` as a key-exchange frame. Returns `None` for
	/// anything else (including valid JSON of a different type), so the
	/// message processor can cheaply route frames.
	#[must_use]
	pub fn detect(bytes: &[u8]) -> Option<Self> {
		serde_json::from_slice::<Self>(bytes)
			.ok()
			.filter(|msg| msg.kind == Self::TYPE)
	}

	/// Serialize to JSON bytes.
	///
	/// # Errors
	/// Returns [`WireError::Malformed`] if serialization fails.
	pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
		Ok(serde_json::to_vec(self)?)
	}
}

/// The type of a decrypted agent message.
#[derive(
	Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString, EnumDisplay,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageKind {
	/// A command carrying an operation name and parameters
	Command,
	/// A keep-alive
	Heartbeat,
	/// A key-exchange frame that arrived inside an envelope
	KeyExchange,
}

/// A decrypted agent message: `{type, command?, params?}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessage {
	/// The message type
	#[serde(rename = "type")]
	pub kind: MessageKind,
	/// The command name, for [`MessageKind::Command`] messages
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub command: Option<String>,
	/// Command parameters, shape depends on the command
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub params: Option<serde_json::Value>,
}

impl AgentMessage {
	/// Parse a plaintext message.
	///
	/// # Errors
	/// Returns [`WireError::Malformed`] for invalid JSON.
	pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
		Ok(serde_json::from_slice(bytes)?)
	}
}

/// The parameters of the `register` command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterParams {
	/// The agent's self-reported hostname
	#[serde(default)]
	pub hostname: String,
	/// Operating system name
	#[serde(default)]
	pub os: String,
	/// CPU architecture
	#[serde(default)]
	pub arch: String,
	/// Module names the agent has loaded
	#[serde(default)]
	pub modules: Vec<String>,
	/// Transport protocols the agent supports
	#[serde(default)]
	pub protocols: Vec<String>,
}

/// The status of a server reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
	/// The request was handled
	Success,
	/// The request was rejected or failed
	Error,
}

/// A server reply to an agent message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
	/// Outcome of the request
	pub status: ReplyStatus,
	/// Human-readable description
	pub message: String,
	/// Session token, attached to successful registrations when JWTs are
	/// enabled
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub token: Option<String>,
	/// Reply payload, shape depends on the request
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<serde_json::Value>,
}

impl Reply {
	/// A success reply with the given message.
	#[must_use]
	pub fn success(message: impl Into<String>) -> Self {
		Self {
			status: ReplyStatus::Success,
			message: message.into(),
			token: None,
			data: None,
		}
	}

	/// An error reply with the given message.
	#[must_use]
	pub fn error(message: impl Into<String>) -> Self {
		Self {
			status: ReplyStatus::Error,
			message: message.into(),
			token: None,
			data: None,
		}
	}

	/// Attach a session token.
	#[must_use]
	pub fn with_token(mut self, token: impl Into<String>) -> Self {
		self.token = Some(token.into());
		self
	}

	/// Attach a data payload.
	#[must_use]
	pub fn with_data(mut self, data: serde_json::Value) -> Self {
		self.data = Some(data);
		self
	}

	/// Serialize to JSON bytes.
	///
	/// # Errors
	/// Returns [`WireError::Malformed`] if serialization fails.
	pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
		Ok(serde_json::to_vec(self)?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn envelope_round_trip() {
		let envelope = Envelope::new(EncryptionKind::Aes, 7, vec![1, 2, 3, 255]);
		let bytes = envelope.to_bytes().unwrap();
		assert_eq!(Envelope::from_bytes(&bytes).unwrap(), envelope);
	}

	#[test]
	fn envelope_payload_is_base64() {
		let envelope = Envelope::new(EncryptionKind::None, 0, b"\x00\xff".to_vec());
		let json: serde_json::Value =
			serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
		assert_eq!(json["payload"], "AP8=");
		assert_eq!(json["header"]["version"], 1);
		assert_eq!(json["header"]["encryption"], "none");
	}

	#[test]
	fn unknown_version_rejected() {
		let mut envelope = Envelope::new(EncryptionKind::Aes, 1, vec![1]);
		envelope.header.version = 2;
		let bytes = serde_json::to_vec(&envelope).unwrap();

		assert!(matches!(
			Envelope::from_bytes(&bytes),
			Err(WireError::UnsupportedVersion(2))
		));
	}

	#[test]
	fn key_exchange_detection() {
		let msg = KeyExchangeMessage::new(EncryptionKind::Chacha20, vec![4, 4, 4], 0);
		let bytes = msg.to_bytes().unwrap();
		assert_eq!(KeyExchangeMessage::detect(&bytes), Some(msg));

		assert_eq!(KeyExchangeMessage::detect(b"{\"type\":\"heartbeat\"}"), None);
		assert_eq!(KeyExchangeMessage::detect(b"not json"), None);
	}

	#[test]
	fn agent_message_parse() {
		let msg =
			AgentMessage::from_bytes(b"{\"type\":\"command\",\"command\":\"status\"}").unwrap();
		assert_eq!(msg.kind, MessageKind::Command);
		assert_eq!(msg.command.as_deref(), Some("status"));

		let heartbeat = AgentMessage::from_bytes(b"{\"type\":\"heartbeat\"}").unwrap();
		assert_eq!(heartbeat.kind, MessageKind::Heartbeat);
		assert_eq!(heartbeat.command, None);

		assert!(AgentMessage::from_bytes(b"{\"type\":\"telepathy\"}").is_err());
	}

	#[test]
	fn register_params_parse() {
		let msg = AgentMessage::from_bytes(
			br#"{"type":"command","command":"register","params":{"hostname":"edge-1","os":"linux","arch":"x86_64","modules":["shell"],"protocols":["tcp","dns"]}}"#,
		)
		.unwrap();

		let params: RegisterParams =
			serde_json::from_value(msg.params.unwrap()).unwrap();
		assert_eq!(params.hostname, "edge-1");
		assert_eq!(params.modules, vec!["shell"]);
		assert_eq!(params.protocols, vec!["tcp", "dns"]);
	}

	#[test]
	fn reply_serialization() {
		let reply = Reply::success("heartbeat received");
		let json: serde_json::Value =
			serde_json::from_slice(&reply.to_bytes().unwrap()).unwrap();
		assert_eq!(json["status"], "success");
		assert_eq!(json.get("token"), None);

		let with_token = Reply::success("registered").with_token("jwt");
		let json: serde_json::Value =
			serde_json::from_slice(&with_token.to_bytes().unwrap()).unwrap();
		assert_eq!(json["token"], "jwt");
	}
}
