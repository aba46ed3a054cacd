//! Server configuration handling.
//!
//! Configuration is merged from three sources, later ones overwriting
//! earlier ones: environment variables (`TETHER_[OPTION]`), an optional
//! TOML/YAML/JSON file, and command-line arguments (`--[option]`). The
//! user-facing [`Partial`] has every field optional; the merged
//! [`Config`] hands out typed sub-configurations for the listeners, the
//! security manager, the monitor, and the pattern detector.

use std::{
	env,
	ffi::OsStr,
	fs,
	io::Error as IoError,
	path::{Path, PathBuf},
	str::FromStr,
	time::Duration,
};

use parking_lot::RwLock;
use pico_args::Arguments;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use strum::{Display as EnumDisplay, EnumString};
use tracing::{debug, warn, Level};

use crate::{
	auth::AuthConfig,
	crypto::{Curve, RotationConfig},
	listener::{DnsConfig, DnsRecordKind, ListenerConfig, Protocol},
	monitor::MonitorConfig,
	obfuscate::{JitterConfig, MimicryProfile, ObfuscationConfig, PaddingConfig},
	patterns::PatternConfig,
	security::SecurityConfig,
};

/// The error returned by fallible conversions into a [`Partial`].
#[derive(Debug, thiserror::Error)]
pub enum IntoPartialError {
	/// Failed to parse from toml
	#[error("failed to parse from toml")]
	Toml(#[from] basic_toml::Error),
	/// Failed to parse from yaml
	#[error("failed to parse from yaml")]
	Yaml(#[from] serde_yaml::Error),
	/// Failed to parse from json
	#[error("failed to parse from json")]
	Json(#[from] serde_json::Error),
	/// Failed to read the config file
	#[error("failed to read config file")]
	Io(#[from] IoError),
	/// File extension unknown, could not determine the format
	#[error("file extension unknown, could not determine format")]
	UnknownExtension,
}

/// Log level, corresponding to `tracing`'s.
#[derive(
	Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, EnumDisplay,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogLevel {
	/// Log everything. May expose secret material in logs.
	Trace,
	/// Log verbose debugging information. May expose secret material.
	Debug,
	/// Recommended level: general information, warnings, and errors.
	#[default]
	Info,
	/// Warnings and errors only.
	Warn,
	/// Errors only.
	Error,
}

impl From<LogLevel> for Level {
	fn from(level: LogLevel) -> Self {
		match level {
			LogLevel::Trace => Self::TRACE,
			LogLevel::Debug => Self::DEBUG,
			LogLevel::Info => Self::INFO,
			LogLevel::Warn => Self::WARN,
			LogLevel::Error => Self::ERROR,
		}
	}
}

/// The error returned by fallible conversions into [`ListenAddress`],
/// containing the invalid input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("\"{0}\" is not a valid listen address (expected protocol:host:port)")]
pub struct IntoListenAddressError(String);

/// A listener's address: the protocol and the `host:port` it binds.
///
/// # String representation
/// `protocol:host:port`, e.g. `tcp:0.0.0.0:8443`, `dns:127.0.0.1:8053`,
/// `ws:[::1]:9000`. The protocol is case-insensitive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "&str", into = "String")]
pub struct ListenAddress {
	/// The protocol the listener will serve
	pub protocol: Protocol,
	/// The `host:port` to bind
	pub address: String,
}

impl std::fmt::Display for ListenAddress {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(fmt, "{}:{}", self.protocol, self.address)
	}
}

impl FromStr for ListenAddress {
	type Err = IntoListenAddressError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (protocol, address) = s
			.split_once(':')
			.ok_or_else(|| IntoListenAddressError(s.to_string()))?;
		if address.is_empty() {
			return Err(IntoListenAddressError(s.to_string()));
		}

		Ok(Self {
			protocol: protocol
				.parse()
				.map_err(|_| IntoListenAddressError(s.to_string()))?,
			address: address.to_string(),
		})
	}
}

impl TryFrom<&str> for ListenAddress {
	type Error = IntoListenAddressError;

	fn try_from(s: &str) -> Result<Self, Self::Error> {
		s.parse()
	}
}

impl From<ListenAddress> for String {
	fn from(address: ListenAddress) -> Self {
		address.to_string()
	}
}

/// Parse the provided environment variable, returning `Some(...)` if it
/// is present and parsed successfully, `None` otherwise.
fn parse_env_var<T: FromStr>(key: &'static str) -> Option<T> {
	env::var(key).map_or(None, |s| s.parse().ok())
}

fn parse_list<T: FromStr>(s: &str) -> Option<Vec<T>> {
	s.split(',')
		.map(str::trim)
		.filter(|part| !part.is_empty())
		.map(|part| part.parse().ok())
		.collect()
}

/// Server configuration as seen from one source. All fields are
/// optional, which allows incremental updates to the merged [`Config`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Partial {
	/// Minimum level of logs to be collected
	pub log_level: Option<LogLevel>,
	/// Shared secret for HMACs and session tokens
	pub secret: Option<String>,
	/// Session token lifetime in seconds
	pub token_ttl_seconds: Option<u64>,
	/// Whether session tokens are issued and verified
	pub enable_jwt: Option<bool>,
	/// Listener addresses, see [`ListenAddress`]
	pub listeners: Option<Vec<ListenAddress>>,
	/// Read buffer size for all listeners, bytes
	pub buffer_size: Option<usize>,
	/// Concurrent connection capacity per listener
	pub max_connections: Option<usize>,
	/// Per-operation transport timeout, seconds
	pub timeout_seconds: Option<u64>,
	/// Wrap the WebSocket listener in TLS
	pub enable_tls: Option<bool>,
	/// PEM certificate chain for TLS
	pub tls_cert_path: Option<PathBuf>,
	/// PEM private key for TLS
	pub tls_key_path: Option<PathBuf>,
	/// Whether scheduled key rotation runs
	pub rotation_enabled: Option<bool>,
	/// Seconds between key rotation sweeps
	pub rotation_interval_seconds: Option<u64>,
	/// Seconds a superseded key stays decryptable
	pub rotation_grace_seconds: Option<u64>,
	/// Superseded keys retained per agent
	pub rotation_max_keys: Option<usize>,
	/// Handshake and forward-secrecy curve (p-256, p-384, p-521)
	pub curve: Option<Curve>,
	/// Seconds between forward-secrecy keypair rotations
	pub forward_rotation_seconds: Option<u64>,
	/// Minimum padding per message, bytes; with `padding_max` enables
	/// padding
	pub padding_min: Option<usize>,
	/// Maximum padding per message, bytes
	pub padding_max: Option<usize>,
	/// Minimum read-deadline jitter, milliseconds; with `jitter_max_ms`
	/// enables jitter
	pub jitter_min_ms: Option<u64>,
	/// Maximum read-deadline jitter, milliseconds
	pub jitter_max_ms: Option<u64>,
	/// Traffic disguise profile (none, http, dns, tls)
	pub mimicry: Option<MimicryProfile>,
	/// Seconds between monitor scans
	pub check_interval_seconds: Option<u64>,
	/// Seconds between reconnection attempts
	pub reconnect_interval_seconds: Option<u64>,
	/// Reconnection attempts before synthetic recovery
	pub max_reconnect_attempts: Option<u32>,
	/// Exceptions needed before a pattern is emitted
	pub pattern_min_frequency: Option<usize>,
	/// Seconds a pattern's reports may span
	pub pattern_time_window_seconds: Option<u64>,
	/// Base domain for the DNS tunnelling listener
	pub dns_domain: Option<String>,
	/// TTL for DNS answers, seconds
	pub dns_ttl: Option<u32>,
	/// DNS answer record types, in preference order
	pub dns_record_types: Option<Vec<DnsRecordKind>>,
}

impl Partial {
	/// Collect configuration from `TETHER_*` environment variables.
	#[must_use]
	pub fn from_env_vars() -> Self {
		Self {
			log_level: parse_env_var("TETHER_LOG_LEVEL"),
			secret: env::var("TETHER_SECRET").ok(),
			token_ttl_seconds: parse_env_var("TETHER_TOKEN_TTL_SECONDS"),
			enable_jwt: parse_env_var("TETHER_ENABLE_JWT"),
			listeners: env::var("TETHER_LISTENERS")
				.ok()
				.and_then(|s| parse_list(&s)),
			buffer_size: parse_env_var("TETHER_BUFFER_SIZE"),
			max_connections: parse_env_var("TETHER_MAX_CONNECTIONS"),
			timeout_seconds: parse_env_var("TETHER_TIMEOUT_SECONDS"),
			enable_tls: parse_env_var("TETHER_ENABLE_TLS"),
			tls_cert_path: parse_env_var("TETHER_TLS_CERT_PATH"),
			tls_key_path: parse_env_var("TETHER_TLS_KEY_PATH"),
			rotation_enabled: parse_env_var("TETHER_ROTATION_ENABLED"),
			rotation_interval_seconds: parse_env_var("TETHER_ROTATION_INTERVAL_SECONDS"),
			rotation_grace_seconds: parse_env_var("TETHER_ROTATION_GRACE_SECONDS"),
			rotation_max_keys: parse_env_var("TETHER_ROTATION_MAX_KEYS"),
			curve: parse_env_var("TETHER_CURVE"),
			forward_rotation_seconds: parse_env_var("TETHER_FORWARD_ROTATION_SECONDS"),
			padding_min: parse_env_var("TETHER_PADDING_MIN"),
			padding_max: parse_env_var("TETHER_PADDING_MAX"),
			jitter_min_ms: parse_env_var("TETHER_JITTER_MIN_MS"),
			jitter_max_ms: parse_env_var("TETHER_JITTER_MAX_MS"),
			mimicry: parse_env_var("TETHER_MIMICRY"),
			check_interval_seconds: parse_env_var("TETHER_CHECK_INTERVAL_SECONDS"),
			reconnect_interval_seconds: parse_env_var("TETHER_RECONNECT_INTERVAL_SECONDS"),
			max_reconnect_attempts: parse_env_var("TETHER_MAX_RECONNECT_ATTEMPTS"),
			pattern_min_frequency: parse_env_var("TETHER_PATTERN_MIN_FREQUENCY"),
			pattern_time_window_seconds: parse_env_var("TETHER_PATTERN_TIME_WINDOW_SECONDS"),
			dns_domain: env::var("TETHER_DNS_DOMAIN").ok(),
			dns_ttl: parse_env_var("TETHER_DNS_TTL"),
			dns_record_types: env::var("TETHER_DNS_RECORD_TYPES")
				.ok()
				.and_then(|s| parse_list(&s)),
		}
	}

	/// Parse configuration from a TOML document.
	///
	/// # Errors
	/// Returns [`IntoPartialError::Toml`] for invalid TOML.
	pub fn from_toml(toml: &str) -> Result<Self, IntoPartialError> {
		Ok(basic_toml::from_str(toml)?)
	}

	/// Parse configuration from a YAML (or JSON) document.
	///
	/// # Errors
	/// Returns [`IntoPartialError::Yaml`] for invalid YAML.
	pub fn from_yaml(yaml: &str) -> Result<Self, IntoPartialError> {
		Ok(serde_yaml::from_str(yaml)?)
	}

	/// Read and parse configuration from a file, deciding the format by
	/// extension.
	///
	/// # Errors
	/// [`IntoPartialError::Io`] when reading fails,
	/// [`IntoPartialError::UnknownExtension`] for unrecognized
	/// extensions, and the format's parse error otherwise.
	pub fn from_file(path: &Path) -> Result<Self, IntoPartialError> {
		let contents = fs::read_to_string(path)?;

		match path.extension().and_then(OsStr::to_str) {
			Some("toml") => Self::from_toml(&contents),
			Some("yaml" | "yml" | "json") => Self::from_yaml(&contents),
			_ => Err(IntoPartialError::UnknownExtension),
		}
	}

	/// Collect configuration from command-line arguments
	/// (`--option value`, kebab-case).
	#[must_use]
	pub fn from_args() -> Self {
		let mut args = Arguments::from_env();
		Self::from_arguments(&mut args)
	}

	fn opt<T: FromStr>(args: &mut Arguments, key: &'static str) -> Option<T>
	where
		T::Err: std::fmt::Display,
	{
		args.opt_value_from_str(key).unwrap_or_default()
	}

	fn from_arguments(args: &mut Arguments) -> Self {
		Self {
			log_level: Self::opt(args, "--log-level"),
			secret: Self::opt(args, "--secret"),
			token_ttl_seconds: Self::opt(args, "--token-ttl-seconds"),
			enable_jwt: Self::opt(args, "--enable-jwt"),
			listeners: Self::opt::<String>(args, "--listeners").and_then(|s| parse_list(&s)),
			buffer_size: Self::opt(args, "--buffer-size"),
			max_connections: Self::opt(args, "--max-connections"),
			timeout_seconds: Self::opt(args, "--timeout-seconds"),
			enable_tls: Self::opt(args, "--enable-tls"),
			tls_cert_path: Self::opt(args, "--tls-cert-path"),
			tls_key_path: Self::opt(args, "--tls-key-path"),
			rotation_enabled: Self::opt(args, "--rotation-enabled"),
			rotation_interval_seconds: Self::opt(args, "--rotation-interval-seconds"),
			rotation_grace_seconds: Self::opt(args, "--rotation-grace-seconds"),
			rotation_max_keys: Self::opt(args, "--rotation-max-keys"),
			curve: Self::opt(args, "--curve"),
			forward_rotation_seconds: Self::opt(args, "--forward-rotation-seconds"),
			padding_min: Self::opt(args, "--padding-min"),
			padding_max: Self::opt(args, "--padding-max"),
			jitter_min_ms: Self::opt(args, "--jitter-min-ms"),
			jitter_max_ms: Self::opt(args, "--jitter-max-ms"),
			mimicry: Self::opt(args, "--mimicry"),
			check_interval_seconds: Self::opt(args, "--check-interval-seconds"),
			reconnect_interval_seconds: Self::opt(args, "--reconnect-interval-seconds"),
			max_reconnect_attempts: Self::opt(args, "--max-reconnect-attempts"),
			pattern_min_frequency: Self::opt(args, "--pattern-min-frequency"),
			pattern_time_window_seconds: Self::opt(args, "--pattern-time-window-seconds"),
			dns_domain: Self::opt(args, "--dns-domain"),
			dns_ttl: Self::opt(args, "--dns-ttl"),
			dns_record_types: Self::opt::<String>(args, "--dns-record-types")
				.and_then(|s| parse_list(&s)),
		}
	}
}

/// Actual configuration storage inside of a [`Config`].
#[derive(Clone, Debug, PartialEq)]
struct ConfigInner {
	log_level: LogLevel,
	secret: String,
	token_ttl: Duration,
	enable_jwt: bool,
	listeners: Vec<ListenAddress>,
	buffer_size: usize,
	max_connections: usize,
	timeout_seconds: u64,
	enable_tls: bool,
	tls_cert_path: Option<PathBuf>,
	tls_key_path: Option<PathBuf>,
	rotation: RotationConfig,
	curve: Curve,
	forward_rotation: Duration,
	padding_min: Option<usize>,
	padding_max: Option<usize>,
	jitter_min_ms: Option<u64>,
	jitter_max_ms: Option<u64>,
	mimicry: MimicryProfile,
	monitor: MonitorConfig,
	patterns: PatternConfig,
	dns: DnsConfig,
}

impl Default for ConfigInner {
	fn default() -> Self {
		Self {
			log_level: LogLevel::default(),
			secret: rand::thread_rng()
				.sample_iter(&Alphanumeric)
				.take(32)
				.map(char::from)
				.collect(),
			token_ttl: Duration::from_secs(24 * 60 * 60),
			enable_jwt: true,
			listeners: vec![ListenAddress {
				protocol: Protocol::Tcp,
				address: "0.0.0.0:8443".to_string(),
			}],
			buffer_size: 4096,
			max_connections: 100,
			timeout_seconds: 30,
			enable_tls: false,
			tls_cert_path: None,
			tls_key_path: None,
			rotation: RotationConfig::default(),
			curve: Curve::default(),
			forward_rotation: Duration::from_secs(60 * 60),
			padding_min: None,
			padding_max: None,
			jitter_min_ms: None,
			jitter_max_ms: None,
			mimicry: MimicryProfile::default(),
			monitor: MonitorConfig::default(),
			patterns: PatternConfig::default(),
			dns: DnsConfig::default(),
		}
	}
}

impl ConfigInner {
	/// Overwrite the fields this [`Partial`] specifies.
	#[allow(clippy::too_many_lines)]
	fn update_from_partial(&mut self, partial: &Partial) {
		if let Some(log_level) = partial.log_level {
			self.log_level = log_level;
		}
		if let Some(ref secret) = partial.secret {
			self.secret.clone_from(secret);
		}
		if let Some(ttl) = partial.token_ttl_seconds {
			self.token_ttl = Duration::from_secs(ttl);
		}
		if let Some(enable_jwt) = partial.enable_jwt {
			self.enable_jwt = enable_jwt;
		}
		if let Some(ref listeners) = partial.listeners {
			self.listeners.clone_from(listeners);
		}
		if let Some(buffer_size) = partial.buffer_size {
			self.buffer_size = buffer_size;
		}
		if let Some(max_connections) = partial.max_connections {
			self.max_connections = max_connections;
		}
		if let Some(timeout_seconds) = partial.timeout_seconds {
			self.timeout_seconds = timeout_seconds;
		}
		if let Some(enable_tls) = partial.enable_tls {
			self.enable_tls = enable_tls;
		}
		if let Some(ref path) = partial.tls_cert_path {
			self.tls_cert_path = Some(path.clone());
		}
		if let Some(ref path) = partial.tls_key_path {
			self.tls_key_path = Some(path.clone());
		}
		if let Some(enabled) = partial.rotation_enabled {
			self.rotation.enabled = enabled;
		}
		if let Some(interval) = partial.rotation_interval_seconds {
			self.rotation.interval = Duration::from_secs(interval);
		}
		if let Some(grace) = partial.rotation_grace_seconds {
			self.rotation.grace_period = Duration::from_secs(grace);
		}
		if let Some(max_keys) = partial.rotation_max_keys {
			self.rotation.max_keys = max_keys;
		}
		if let Some(curve) = partial.curve {
			self.curve = curve;
		}
		if let Some(seconds) = partial.forward_rotation_seconds {
			self.forward_rotation = Duration::from_secs(seconds);
		}
		if partial.padding_min.is_some() {
			self.padding_min = partial.padding_min;
		}
		if partial.padding_max.is_some() {
			self.padding_max = partial.padding_max;
		}
		if partial.jitter_min_ms.is_some() {
			self.jitter_min_ms = partial.jitter_min_ms;
		}
		if partial.jitter_max_ms.is_some() {
			self.jitter_max_ms = partial.jitter_max_ms;
		}
		if let Some(mimicry) = partial.mimicry {
			self.mimicry = mimicry;
		}
		if let Some(seconds) = partial.check_interval_seconds {
			self.monitor.check_interval = Duration::from_secs(seconds);
		}
		if let Some(seconds) = partial.reconnect_interval_seconds {
			self.monitor.reconnect_interval = Duration::from_secs(seconds);
		}
		if let Some(attempts) = partial.max_reconnect_attempts {
			self.monitor.max_reconnect_attempts = attempts;
		}
		if let Some(min_frequency) = partial.pattern_min_frequency {
			self.patterns.min_frequency = min_frequency;
		}
		if let Some(seconds) = partial.pattern_time_window_seconds {
			self.patterns.time_window = Duration::from_secs(seconds);
		}
		if let Some(ref domain) = partial.dns_domain {
			self.dns.domain.clone_from(domain);
		}
		if let Some(ttl) = partial.dns_ttl {
			self.dns.ttl = ttl;
		}
		if let Some(ref record_types) = partial.dns_record_types {
			self.dns.record_types.clone_from(record_types);
		}
	}
}

/// Global configuration for the tether server: the merged, shareable
/// view over all configuration sources.
#[derive(Debug)]
pub struct Config {
	inner: RwLock<ConfigInner>,
	file: Option<PathBuf>,
}

impl Config {
	/// Create a new `Config` using the provided file path as the
	/// configuration file. Source errors are logged as warnings, not
	/// returned; the remaining sources still apply.
	///
	/// # IO
	/// Performs synchronous file IO; do not call in async contexts.
	#[must_use]
	pub fn new(file: Option<PathBuf>) -> Self {
		let config = Self {
			inner: RwLock::new(ConfigInner::default()),
			file,
		};
		config.update();
		config
	}

	/// Re-merge configuration from environment variables, the config
	/// file, and command-line arguments, in that order.
	///
	/// # IO
	/// Performs synchronous file IO; do not call in async contexts.
	pub fn update(&self) {
		let mut config = ConfigInner::default();

		config.update_from_partial(&Partial::from_env_vars());

		if let Some(ref file) = self.file {
			match Partial::from_file(file) {
				Ok(partial) => config.update_from_partial(&partial),
				Err(err) => warn!("could not read configuration from file: {err}"),
			}
		}

		config.update_from_partial(&Partial::from_args());

		debug!(?config, "configuration loaded");
		*self.inner.write() = config;
	}

	/// The configured log level.
	#[must_use]
	pub fn log_level(&self) -> LogLevel {
		self.inner.read().log_level
	}

	/// The configured listener addresses.
	#[must_use]
	pub fn listeners(&self) -> Vec<ListenAddress> {
		self.inner.read().listeners.clone()
	}

	/// Assemble the [`ListenerConfig`] for one configured listen
	/// address.
	#[must_use]
	pub fn listener_config(&self, listen: &ListenAddress) -> ListenerConfig {
		let inner = self.inner.read();
		ListenerConfig {
			address: listen.address.clone(),
			enable_tls: inner.enable_tls && listen.protocol == Protocol::Ws,
			tls_cert_path: inner.tls_cert_path.clone(),
			tls_key_path: inner.tls_key_path.clone(),
			buffer_size: inner.buffer_size,
			max_connections: inner.max_connections,
			timeout_seconds: inner.timeout_seconds,
			dns: (listen.protocol == Protocol::Dns).then(|| inner.dns.clone()),
		}
	}

	/// Assemble the security manager configuration.
	#[must_use]
	pub fn security_config(&self) -> SecurityConfig {
		let inner = self.inner.read();

		let padding = match (inner.padding_min, inner.padding_max) {
			(Some(min), Some(max)) => Some(PaddingConfig { min, max }),
			(None, None) => None,
			(min, max) => Some(PaddingConfig {
				min: min.unwrap_or_default(),
				max: max.unwrap_or_else(|| PaddingConfig::default().max),
			}),
		};
		let jitter = match (inner.jitter_min_ms, inner.jitter_max_ms) {
			(Some(min_ms), Some(max_ms)) => Some(JitterConfig { min_ms, max_ms }),
			(None, None) => None,
			(min_ms, max_ms) => Some(JitterConfig {
				min_ms: min_ms.unwrap_or_default(),
				max_ms: max_ms.unwrap_or_else(|| JitterConfig::default().max_ms),
			}),
		};

		SecurityConfig {
			auth: AuthConfig {
				secret: inner.secret.clone().into_bytes(),
				token_ttl: inner.token_ttl,
				enable_jwt: inner.enable_jwt,
			},
			rotation: inner.rotation.clone(),
			curve: inner.curve,
			forward_rotation_interval: inner.forward_rotation,
			obfuscation: ObfuscationConfig {
				padding,
				jitter,
				mimicry: inner.mimicry,
			},
		}
	}

	/// The monitor configuration.
	#[must_use]
	pub fn monitor_config(&self) -> MonitorConfig {
		self.inner.read().monitor
	}

	/// The pattern detector configuration.
	#[must_use]
	pub fn pattern_config(&self) -> PatternConfig {
		self.inner.read().patterns
	}

	/// The configuration file path, if one was given.
	#[must_use]
	pub const fn file(&self) -> &Option<PathBuf> {
		&self.file
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn listen_address_parse() {
		assert_eq!(
			"tcp:0.0.0.0:8443".parse(),
			Ok(ListenAddress {
				protocol: Protocol::Tcp,
				address: "0.0.0.0:8443".to_string(),
			})
		);
		assert_eq!(
			"DNS:127.0.0.1:8053".parse(),
			Ok(ListenAddress {
				protocol: Protocol::Dns,
				address: "127.0.0.1:8053".to_string(),
			})
		);
		assert_eq!(
			"ws:[::1]:9000".parse(),
			Ok(ListenAddress {
				protocol: Protocol::Ws,
				address: "[::1]:9000".to_string(),
			})
		);
	}

	#[test]
	fn listen_address_parse_invalid() {
		assert!("tcp".parse::<ListenAddress>().is_err());
		assert!("smtp:0.0.0.0:25".parse::<ListenAddress>().is_err());
		assert!("tcp:".parse::<ListenAddress>().is_err());
	}

	#[test]
	fn listen_address_round_trip() {
		let address: ListenAddress = "udp:0.0.0.0:9000".parse().unwrap();
		assert_eq!(address.to_string(), "udp:0.0.0.0:9000");
	}

	#[test]
	fn partial_from_toml() {
		let partial = Partial::from_toml(
			r#"
log_level = "debug"
secret = "super secret"
listeners = ["tcp:127.0.0.1:9000", "dns:127.0.0.1:8053"]
rotation_interval_seconds = 120
padding_min = 8
padding_max = 64
mimicry = "http"
dns_domain = "c2.example.net"
dns_record_types = ["TXT", "A"]
"#,
		)
		.unwrap();

		assert_eq!(partial.log_level, Some(LogLevel::Debug));
		assert_eq!(partial.secret.as_deref(), Some("super secret"));
		assert_eq!(partial.listeners.as_ref().unwrap().len(), 2);
		assert_eq!(partial.rotation_interval_seconds, Some(120));
		assert_eq!(partial.mimicry, Some(MimicryProfile::Http));
		assert_eq!(
			partial.dns_record_types,
			Some(vec![DnsRecordKind::Txt, DnsRecordKind::A])
		);
	}

	#[test]
	fn partial_from_yaml() {
		let partial = Partial::from_yaml(
			r"
log_level: warn
max_connections: 5
curve: p-384
",
		)
		.unwrap();

		assert_eq!(partial.log_level, Some(LogLevel::Warn));
		assert_eq!(partial.max_connections, Some(5));
		assert_eq!(partial.curve, Some(Curve::P384));
	}

	#[test]
	fn config_assembles_typed_sections() {
		let config = Config::new(None);
		{
			let mut inner = config.inner.write();
			inner.listeners = vec![
				ListenAddress {
					protocol: Protocol::Tcp,
					address: "127.0.0.1:9000".to_string(),
				},
				ListenAddress {
					protocol: Protocol::Dns,
					address: "127.0.0.1:8053".to_string(),
				},
			];
			inner.padding_min = Some(8);
			inner.padding_max = Some(64);
		}

		let listeners = config.listeners();
		let tcp = config.listener_config(&listeners[0]);
		assert_eq!(tcp.address, "127.0.0.1:9000");
		assert!(tcp.dns.is_none());

		let dns = config.listener_config(&listeners[1]);
		assert!(dns.dns.is_some());

		let security = config.security_config();
		assert_eq!(
			security.obfuscation.padding,
			Some(PaddingConfig { min: 8, max: 64 })
		);
		assert!(!security.auth.secret.is_empty());
	}

	#[test]
	fn defaults_are_sane() {
		let inner = ConfigInner::default();
		assert_eq!(inner.secret.len(), 32);
		assert_eq!(inner.buffer_size, 4096);
		assert_eq!(inner.max_connections, 100);
		assert_eq!(inner.timeout_seconds, 30);
		assert!(inner.rotation.enabled);
		assert_eq!(inner.mimicry, MimicryProfile::None);
	}

	#[test]
	fn update_from_partial_overwrites_only_set_fields() {
		let mut inner = ConfigInner::default();
		let secret_before = inner.secret.clone();

		inner.update_from_partial(&Partial {
			log_level: Some(LogLevel::Error),
			max_connections: Some(7),
			..Partial::default()
		});

		assert_eq!(inner.log_level, LogLevel::Error);
		assert_eq!(inner.max_connections, 7);
		assert_eq!(inner.secret, secret_before);
	}
}
