//! The live registry of connected agents and their exception reports.
//!
//! One shared map, guarded by a reader/writer lock: the encrypted
//! listener registers and mutates entries, the monitor and the pattern
//! detector read them. Exception reports are append-only per agent with
//! non-decreasing timestamps.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum::{Display as EnumDisplay, EnumString};
use tracing::{debug, trace};

use crate::util::unix_now;

/// The errors produced by registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
	/// The id does not name a registered agent
	#[error("client not found: {0}")]
	ClientNotFound(String),
	/// The id is already registered
	#[error("client already registered: {0}")]
	DuplicateClient(String),
}

/// The connection status of an agent.
#[derive(
	Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, EnumDisplay,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ClientStatus {
	/// Connected and responsive
	Online,
	/// Cleanly disconnected
	Offline,
	/// In a failure state; the monitor will attempt recovery
	Error,
	/// Not yet determined
	#[default]
	Unknown,
}

/// The severity of an exception report.
#[derive(
	Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, EnumString,
	EnumDisplay,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Severity {
	/// Informational
	Info,
	/// Unexpected but handled
	Warning,
	/// A failed operation
	Error,
	/// A failure threatening the agent's session
	Critical,
}

/// A connected agent as tracked by the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
	/// Listener-local identity, derived from the remote address and a
	/// monotonic timestamp
	pub id: String,
	/// Display name (the agent's self-reported hostname)
	pub name: String,
	/// Remote network address
	pub address: String,
	/// Operating system name
	pub os: String,
	/// CPU architecture
	pub arch: String,
	/// Module names the agent has loaded
	pub modules: Vec<String>,
	/// The transport protocol the agent connected over
	pub protocol: String,
	/// Current status
	pub status: ClientStatus,
	/// Unix seconds of the last message from the agent
	pub last_seen: u64,
	/// The error that put the agent into [`ClientStatus::Error`], if any
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl Client {
	/// Create a new, still-unnamed client record.
	#[must_use]
	pub fn new(
		id: impl Into<String>,
		address: impl Into<String>,
		protocol: impl Into<String>,
	) -> Self {
		Self {
			id: id.into(),
			name: String::new(),
			address: address.into(),
			os: String::new(),
			arch: String::new(),
			modules: Vec::new(),
			protocol: protocol.into(),
			status: ClientStatus::Unknown,
			last_seen: unix_now(),
			error: None,
		}
	}
}

/// An exception reported by or about an agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionReport {
	/// The agent the exception belongs to
	pub client_id: String,
	/// The module that raised it
	pub module: String,
	/// Human-readable description
	pub message: String,
	/// Severity classification
	pub severity: Severity,
	/// Stack trace or call-site information, if available
	#[serde(default)]
	pub stack: String,
	/// Unix seconds; non-decreasing per agent
	pub timestamp: u64,
	/// Free-form metadata
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub metadata: Option<HashMap<String, String>>,
}

#[derive(Default)]
struct ExceptionLog {
	reports: Vec<ExceptionReport>,
	last_timestamp: u64,
}

/// The thread-safe registry of connected agents.
#[derive(Default)]
pub struct ClientRegistry {
	clients: RwLock<HashMap<String, Client>>,
	exceptions: RwLock<HashMap<String, ExceptionLog>>,
}

impl std::fmt::Debug for ClientRegistry {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		fmt.debug_struct("ClientRegistry")
			.field("clients", &self.clients.read().len())
			.finish_non_exhaustive()
	}
}

impl ClientRegistry {
	/// Create an empty registry.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a new agent.
	///
	/// # Errors
	/// Returns [`RegistryError::DuplicateClient`] if the id is taken.
	pub fn register(&self, client: Client) -> Result<(), RegistryError> {
		let mut clients = self.clients.write();
		if clients.contains_key(&client.id) {
			return Err(RegistryError::DuplicateClient(client.id));
		}

		debug!(
			client_id = client.id,
			address = client.address,
			protocol = client.protocol,
			"registered agent",
		);
		clients.insert(client.id.clone(), client);
		Ok(())
	}

	/// Remove an agent and its exception log, returning the final record.
	///
	/// # Errors
	/// Returns [`RegistryError::ClientNotFound`] for unknown ids.
	pub fn unregister(&self, id: &str) -> Result<Client, RegistryError> {
		let removed = self
			.clients
			.write()
			.remove(id)
			.ok_or_else(|| RegistryError::ClientNotFound(id.to_string()))?;
		self.exceptions.write().remove(id);

		debug!(client_id = id, "unregistered agent");
		Ok(removed)
	}

	/// Get a snapshot of an agent's record.
	///
	/// # Errors
	/// Returns [`RegistryError::ClientNotFound`] for unknown ids.
	pub fn get(&self, id: &str) -> Result<Client, RegistryError> {
		self.clients
			.read()
			.get(id)
			.cloned()
			.ok_or_else(|| RegistryError::ClientNotFound(id.to_string()))
	}

	/// Snapshots of all registered agents.
	#[must_use]
	pub fn all(&self) -> Vec<Client> {
		self.clients.read().values().cloned().collect()
	}

	/// Snapshots of all agents currently in `status`.
	#[must_use]
	pub fn get_by_status(&self, status: ClientStatus) -> Vec<Client> {
		self.clients
			.read()
			.values()
			.filter(|c| c.status == status)
			.cloned()
			.collect()
	}

	/// How many agents are registered.
	#[must_use]
	pub fn len(&self) -> usize {
		self.clients.read().len()
	}

	/// Whether no agents are registered.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.clients.read().is_empty()
	}

	fn with_client<T>(
		&self,
		id: &str,
		f: impl FnOnce(&mut Client) -> T,
	) -> Result<T, RegistryError> {
		let mut clients = self.clients.write();
		clients
			.get_mut(id)
			.map(f)
			.ok_or_else(|| RegistryError::ClientNotFound(id.to_string()))
	}

	/// Set an agent's status, recording the error message for
	/// [`ClientStatus::Error`] and clearing it otherwise.
	///
	/// # Errors
	/// Returns [`RegistryError::ClientNotFound`] for unknown ids.
	pub fn update_status(
		&self,
		id: &str,
		status: ClientStatus,
		error: Option<String>,
	) -> Result<(), RegistryError> {
		self.with_client(id, |client| {
			trace!(client_id = id, %status, "status update");
			client.status = status;
			client.error = if status == ClientStatus::Error {
				error
			} else {
				None
			};
		})
	}

	/// Update an agent's `last_seen` to now.
	///
	/// # Errors
	/// Returns [`RegistryError::ClientNotFound`] for unknown ids.
	pub fn touch(&self, id: &str) -> Result<(), RegistryError> {
		self.with_client(id, |client| client.last_seen = unix_now())
	}

	/// Set an agent's display name.
	///
	/// # Errors
	/// Returns [`RegistryError::ClientNotFound`] for unknown ids.
	pub fn set_name(&self, id: &str, name: impl Into<String>) -> Result<(), RegistryError> {
		self.with_client(id, |client| client.name = name.into())
	}

	/// Set an agent's operating system.
	///
	/// # Errors
	/// Returns [`RegistryError::ClientNotFound`] for unknown ids.
	pub fn set_os(&self, id: &str, os: impl Into<String>) -> Result<(), RegistryError> {
		self.with_client(id, |client| client.os = os.into())
	}

	/// Set an agent's CPU architecture.
	///
	/// # Errors
	/// Returns [`RegistryError::ClientNotFound`] for unknown ids.
	pub fn set_arch(&self, id: &str, arch: impl Into<String>) -> Result<(), RegistryError> {
		self.with_client(id, |client| client.arch = arch.into())
	}

	/// Replace an agent's module list.
	///
	/// # Errors
	/// Returns [`RegistryError::ClientNotFound`] for unknown ids.
	pub fn set_modules(&self, id: &str, modules: Vec<String>) -> Result<(), RegistryError> {
		self.with_client(id, |client| client.modules = modules)
	}

	/// Append an exception report for an agent. Timestamps are clamped to
	/// be non-decreasing per agent even across wall-clock adjustments.
	///
	/// # Errors
	/// Returns [`RegistryError::ClientNotFound`] for unknown ids.
	pub fn report_exception(
		&self,
		id: &str,
		message: impl Into<String>,
		severity: Severity,
		module: impl Into<String>,
		stack: impl Into<String>,
		metadata: Option<HashMap<String, String>>,
	) -> Result<ExceptionReport, RegistryError> {
		if !self.clients.read().contains_key(id) {
			return Err(RegistryError::ClientNotFound(id.to_string()));
		}

		let mut exceptions = self.exceptions.write();
		let log = exceptions.entry(id.to_string()).or_default();

		let timestamp = unix_now().max(log.last_timestamp);
		log.last_timestamp = timestamp;

		let report = ExceptionReport {
			client_id: id.to_string(),
			module: module.into(),
			message: message.into(),
			severity,
			stack: stack.into(),
			timestamp,
			metadata,
		};
		log.reports.push(report.clone());

		trace!(
			client_id = id,
			severity = %report.severity,
			module = report.module,
			"exception reported",
		);
		Ok(report)
	}

	/// All exception reports for one agent, in append order.
	#[must_use]
	pub fn exceptions_for(&self, id: &str) -> Vec<ExceptionReport> {
		self.exceptions
			.read()
			.get(id)
			.map(|log| log.reports.clone())
			.unwrap_or_default()
	}

	/// All exception reports across all agents.
	#[must_use]
	pub fn all_exception_reports(&self) -> Vec<ExceptionReport> {
		self.exceptions
			.read()
			.values()
			.flat_map(|log| log.reports.iter().cloned())
			.collect()
	}
}
