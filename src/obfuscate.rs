//! Traffic obfuscation: random padding, timing jitter, and protocol
//! mimicry.
//!
//! Padding frames every payload as
//! `[original_length:4 big-endian][payload][random_padding]` with a pad
//! length drawn uniformly from the configured bounds. Jitter produces a
//! random delay that read-deadline setters add to perturb timing
//! patterns. Mimicry wraps the (already encrypted) bytes in an envelope
//! shaped like HTTP, a DNS query, or a TLS record; all three are exact
//! inverses of their strip operation and are off by default.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use strum::{Display as EnumDisplay, EnumString};

/// The errors produced by the obfuscation layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ObfuscationError {
	/// Padding bounds were inverted
	#[error("invalid padding bounds: min {min} > max {max}")]
	InvalidPaddingBounds {
		/// Configured lower bound
		min: usize,
		/// Configured upper bound
		max: usize,
	},
	/// Jitter bounds were inverted
	#[error("invalid jitter bounds: min {min_ms}ms > max {max_ms}ms")]
	InvalidJitterBounds {
		/// Configured lower bound in milliseconds
		min_ms: u64,
		/// Configured upper bound in milliseconds
		max_ms: u64,
	},
	/// A padded payload was shorter than its length prefix claims
	#[error("truncated padded payload")]
	TruncatedPadding,
	/// A payload exceeded the 4-byte length prefix
	#[error("payload too large to pad")]
	PayloadTooLarge,
	/// Bytes did not match the expected mimicry envelope
	#[error("envelope does not match the {0} mimicry profile")]
	MimicryMismatch(MimicryProfile),
}

/// Bounds for the random padding appended to every payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaddingConfig {
	/// Minimum padding length in bytes
	pub min: usize,
	/// Maximum padding length in bytes
	pub max: usize,
}

impl Default for PaddingConfig {
	fn default() -> Self {
		Self { min: 16, max: 128 }
	}
}

/// Bounds for the random delay added to read deadlines.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterConfig {
	/// Minimum jitter in milliseconds
	pub min_ms: u64,
	/// Maximum jitter in milliseconds
	pub max_ms: u64,
}

impl Default for JitterConfig {
	fn default() -> Self {
		Self {
			min_ms: 0,
			max_ms: 250,
		}
	}
}

/// The protocol a channel's traffic is disguised as.
#[derive(
	Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, EnumDisplay,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum MimicryProfile {
	/// No disguise; bytes pass through unchanged
	#[default]
	None,
	/// An HTTP GET request carrying the payload base64-encoded in a header
	Http,
	/// A DNS query carrying the payload in QNAME labels
	Dns,
	/// A TLS handshake record carrying the payload as its body
	Tls,
}

/// Obfuscator configuration. Every part is optional; the default applies
/// nothing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationConfig {
	/// Padding bounds, or `None` to pass payloads through unpadded
	pub padding: Option<PaddingConfig>,
	/// Jitter bounds, or `None` for no added delay
	pub jitter: Option<JitterConfig>,
	/// The mimicry profile
	pub mimicry: MimicryProfile,
}

const HTTP_PREFIX: &str = "GET /assets/app.js HTTP/1.1\r\nHost: cdn.example.com\r\nUser-Agent: Mozilla/5.0 (Windows NT 10.0; Win64; x64)\r\nAccept: */*\r\nX-Request-Data: ";
const HTTP_SUFFIX: &str = "\r\nConnection: keep-alive\r\n\r\n";

const TLS_CONTENT_HANDSHAKE: u8 = 0x16;
const TLS_VERSION: [u8; 2] = [0x03, 0x03];
const TLS_HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Applies and strips padding, jitter, and protocol mimicry per its
/// configuration.
#[derive(Clone, Debug)]
pub struct Obfuscator {
	config: ObfuscationConfig,
}

impl Obfuscator {
	/// Create an obfuscator, validating the configured bounds.
	///
	/// # Errors
	/// Returns [`ObfuscationError::InvalidPaddingBounds`] or
	/// [`ObfuscationError::InvalidJitterBounds`] for inverted ranges.
	pub fn new(config: ObfuscationConfig) -> Result<Self, ObfuscationError> {
		if let Some(PaddingConfig { min, max }) = config.padding {
			if min > max {
				return Err(ObfuscationError::InvalidPaddingBounds { min, max });
			}
		}
		if let Some(JitterConfig { min_ms, max_ms }) = config.jitter {
			if min_ms > max_ms {
				return Err(ObfuscationError::InvalidJitterBounds { min_ms, max_ms });
			}
		}

		Ok(Self { config })
	}

	/// The active configuration.
	#[must_use]
	pub const fn config(&self) -> &ObfuscationConfig {
		&self.config
	}

	/// Frame `data` with its length and append random padding.
	///
	/// # Errors
	/// Returns [`ObfuscationError::PayloadTooLarge`] if `data` exceeds
	/// `u32::MAX` bytes.
	pub fn add_padding(&self, data: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
		let Some(PaddingConfig { min, max }) = self.config.padding else {
			return Ok(data.to_vec());
		};

		let len = u32::try_from(data.len()).map_err(|_| ObfuscationError::PayloadTooLarge)?;
		let pad_len = rand::thread_rng().gen_range(min..=max);

		let mut framed = Vec::with_capacity(4 + data.len() + pad_len);
		framed.extend_from_slice(&len.to_be_bytes());
		framed.extend_from_slice(data);

		let mut padding = vec![0u8; pad_len];
		rand::thread_rng().fill_bytes(&mut padding);
		framed.extend_from_slice(&padding);

		Ok(framed)
	}

	/// Recover the original payload from a padded frame.
	///
	/// # Errors
	/// Returns [`ObfuscationError::TruncatedPadding`] if the frame is
	/// shorter than its length prefix claims.
	pub fn remove_padding(&self, data: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
		if self.config.padding.is_none() {
			return Ok(data.to_vec());
		}

		let len = data
			.get(..4)
			.map(|b| u32::from_be_bytes(b.try_into().expect("4-byte slice")))
			.ok_or(ObfuscationError::TruncatedPadding)? as usize;

		data.get(4..4 + len)
			.map(<[u8]>::to_vec)
			.ok_or(ObfuscationError::TruncatedPadding)
	}

	/// A random delay within the configured jitter bounds, or zero when
	/// jitter is disabled.
	#[must_use]
	pub fn apply_jitter(&self) -> Duration {
		let Some(JitterConfig { min_ms, max_ms }) = self.config.jitter else {
			return Duration::ZERO;
		};

		Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
	}

	/// Wrap `data` in the configured mimicry envelope.
	#[must_use]
	pub fn apply_mimicry(&self, data: &[u8]) -> Vec<u8> {
		match self.config.mimicry {
			MimicryProfile::None => data.to_vec(),
			MimicryProfile::Http => {
				let mut out = Vec::with_capacity(HTTP_PREFIX.len() + data.len() * 4 / 3 + 32);
				out.extend_from_slice(HTTP_PREFIX.as_bytes());
				out.extend_from_slice(BASE64.encode(data).as_bytes());
				out.extend_from_slice(HTTP_SUFFIX.as_bytes());
				out
			}
			MimicryProfile::Dns => Self::wrap_dns(data),
			MimicryProfile::Tls => Self::wrap_tls(data),
		}
	}

	/// Extract the original bytes from a mimicry envelope.
	///
	/// # Errors
	/// Returns [`ObfuscationError::MimicryMismatch`] when `data` does not
	/// match the configured profile.
	pub fn strip_mimicry(&self, data: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
		match self.config.mimicry {
			MimicryProfile::None => Ok(data.to_vec()),
			MimicryProfile::Http => {
				let text = std::str::from_utf8(data)
					.map_err(|_| ObfuscationError::MimicryMismatch(MimicryProfile::Http))?;
				let encoded = text
					.strip_prefix(HTTP_PREFIX)
					.and_then(|rest| rest.strip_suffix(HTTP_SUFFIX))
					.ok_or(ObfuscationError::MimicryMismatch(MimicryProfile::Http))?;
				BASE64
					.decode(encoded)
					.map_err(|_| ObfuscationError::MimicryMismatch(MimicryProfile::Http))
			}
			MimicryProfile::Dns => Self::unwrap_dns(data),
			MimicryProfile::Tls => Self::unwrap_tls(data),
		}
	}

	/// The outgoing half of the obfuscation pipeline: pad, then disguise.
	///
	/// # Errors
	/// Returns any error of [`Self::add_padding`].
	pub fn obfuscate(&self, data: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
		Ok(self.apply_mimicry(&self.add_padding(data)?))
	}

	/// The incoming half of the pipeline: strip the disguise, then unpad.
	///
	/// # Errors
	/// Returns any error of [`Self::strip_mimicry`] or
	/// [`Self::remove_padding`].
	pub fn deobfuscate(&self, data: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
		self.remove_padding(&self.strip_mimicry(data)?)
	}

	// A query-shaped DNS message: random id, standard-query flags, one
	// question whose QNAME labels carry the payload in <=63 byte chunks.
	fn wrap_dns(data: &[u8]) -> Vec<u8> {
		let mut out = Vec::with_capacity(12 + data.len() + data.len() / 63 + 8);
		out.extend_from_slice(&rand::thread_rng().gen::<u16>().to_be_bytes());
		out.extend_from_slice(&[
			0x01, 0x00, // flags: standard query, recursion desired
			0x00, 0x01, // qdcount
			0x00, 0x00, // ancount
			0x00, 0x00, // nscount
			0x00, 0x00, // arcount
		]);

		for chunk in data.chunks(63) {
			out.push(u8::try_from(chunk.len()).expect("chunks of at most 63"));
			out.extend_from_slice(chunk);
		}
		out.push(0); // root label
		out.extend_from_slice(&[0x00, 0x10]); // qtype TXT
		out.extend_from_slice(&[0x00, 0x01]); // qclass IN
		out
	}

	fn unwrap_dns(data: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
		let mismatch = || ObfuscationError::MimicryMismatch(MimicryProfile::Dns);

		if data.len() < 12 + 1 + 4 {
			return Err(mismatch());
		}

		let mut out = Vec::with_capacity(data.len().saturating_sub(17));
		let mut pos = 12;
		loop {
			let len = *data.get(pos).ok_or_else(mismatch)? as usize;
			pos += 1;
			if len == 0 {
				break;
			}
			out.extend_from_slice(data.get(pos..pos + len).ok_or_else(mismatch)?);
			pos += len;
		}

		// the question's qtype/qclass must still follow
		if data.len() != pos + 4 {
			return Err(mismatch());
		}
		Ok(out)
	}

	// A TLS record shaped like the start of a handshake: record header,
	// then a ClientHello-typed handshake header around the raw payload.
	fn wrap_tls(data: &[u8]) -> Vec<u8> {
		let body_len = data.len() + 4;
		let mut out = Vec::with_capacity(5 + body_len);
		out.push(TLS_CONTENT_HANDSHAKE);
		out.extend_from_slice(&TLS_VERSION);
		out.extend_from_slice(
			&u16::try_from(body_len).unwrap_or(u16::MAX).to_be_bytes(),
		);
		out.push(TLS_HANDSHAKE_CLIENT_HELLO);
		let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
		out.extend_from_slice(&len.to_be_bytes()[1..]); // 24-bit length
		out.extend_from_slice(data);
		out
	}

	fn unwrap_tls(data: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
		let mismatch = || ObfuscationError::MimicryMismatch(MimicryProfile::Tls);

		if data.len() < 9
			|| data[0] != TLS_CONTENT_HANDSHAKE
			|| data[1..3] != TLS_VERSION
			|| data[5] != TLS_HANDSHAKE_CLIENT_HELLO
		{
			return Err(mismatch());
		}

		let len = usize::from(data[6]) << 16 | usize::from(data[7]) << 8 | usize::from(data[8]);
		data.get(9..9 + len).map(<[u8]>::to_vec).ok_or_else(mismatch)
	}
}

impl Default for Obfuscator {
	/// An obfuscator that applies nothing.
	fn default() -> Self {
		Self {
			config: ObfuscationConfig::default(),
		}
	}
}
