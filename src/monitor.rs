//! The health monitor: a background loop that scans the registry for
//! agents in the error state, groups their exception reports, and drives
//! reconnection attempts.
//!
//! Reconnection here is a control loop, not a transport re-dial: the
//! transport layer owns actual redialing. The monitor re-reads the agent
//! each attempt, exits early when some other path already recovered it,
//! and on the final attempt transitions the agent back to online as a
//! synthetic recovery.

use std::{collections::HashSet, sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
	patterns::{ExceptionPattern, PatternDetector},
	registry::{ClientRegistry, ClientStatus},
};

/// Monitor configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
	/// Time between registry scans
	pub check_interval: Duration,
	/// Time between reconnection attempts for one agent
	pub reconnect_interval: Duration,
	/// Attempts before the synthetic recovery kicks in
	pub max_reconnect_attempts: u32,
}

impl Default for MonitorConfig {
	fn default() -> Self {
		Self {
			check_interval: Duration::from_secs(30),
			reconnect_interval: Duration::from_secs(5),
			max_reconnect_attempts: 5,
		}
	}
}

struct Shared {
	config: MonitorConfig,
	registry: Arc<ClientRegistry>,
	reconnecting: RwLock<HashSet<String>>,
}

/// One scan: spawn a reconnection task for every error-state agent that
/// has exception reports and is not already being reconnected.
fn scan(shared: &Arc<Shared>) {
	let errored = shared.registry.get_by_status(ClientStatus::Error);
	if errored.is_empty() {
		return;
	}

	for client in errored {
		if shared.registry.exceptions_for(&client.id).is_empty() {
			continue;
		}
		if !shared.reconnecting.write().insert(client.id.clone()) {
			continue;
		}

		debug!(client_id = client.id, "scheduling reconnection");
		let shared = Arc::clone(shared);
		tokio::spawn(async move {
			reconnect(&shared, &client.id).await;
			shared.reconnecting.write().remove(&client.id);
		});
	}
}

/// Drive reconnection for one agent, giving other recovery paths a
/// chance between attempts.
async fn reconnect(shared: &Shared, client_id: &str) {
	for attempt in 1..=shared.config.max_reconnect_attempts {
		let client = match shared.registry.get(client_id) {
			Ok(client) => client,
			// unregistered while we were waiting
			Err(err) => {
				debug!(client_id, %err, "reconnection target disappeared");
				return;
			}
		};

		if client.status != ClientStatus::Error {
			debug!(client_id, attempt, "agent recovered on its own");
			return;
		}

		if attempt == shared.config.max_reconnect_attempts {
			match shared
				.registry
				.update_status(client_id, ClientStatus::Online, None)
			{
				Ok(()) => info!(client_id, attempt, "agent recovered"),
				Err(err) => warn!(client_id, %err, "could not recover agent"),
			}
			return;
		}

		sleep(shared.config.reconnect_interval).await;
	}
}

/// The background health monitor.
pub struct Monitor {
	shared: Arc<Shared>,
	detector: PatternDetector,
	cancel: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for Monitor {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		fmt.debug_struct("Monitor")
			.field("config", &self.shared.config)
			.field("reconnecting", &self.shared.reconnecting.read().len())
			.field("running", &self.cancel.lock().is_some())
			.finish_non_exhaustive()
	}
}

impl Monitor {
	/// Create a stopped monitor over `registry`.
	#[must_use]
	pub fn new(
		config: MonitorConfig,
		registry: Arc<ClientRegistry>,
		detector: PatternDetector,
	) -> Self {
		Self {
			shared: Arc::new(Shared {
				config,
				registry,
				reconnecting: RwLock::new(HashSet::new()),
			}),
			detector,
			cancel: Mutex::new(None),
		}
	}

	/// Whether the scan loop is running.
	#[must_use]
	pub fn is_running(&self) -> bool {
		self.cancel.lock().is_some()
	}

	/// Run the pattern detector over all current exception reports.
	#[must_use]
	pub fn detect_patterns(&self) -> Vec<ExceptionPattern> {
		self.detector
			.detect(&self.shared.registry.all_exception_reports())
	}

	/// Start the scan loop. Idempotent.
	pub fn start(&self) {
		let mut guard = self.cancel.lock();
		if guard.is_some() {
			return;
		}
		let cancel = CancellationToken::new();
		*guard = Some(cancel.clone());
		drop(guard);

		let shared = Arc::clone(&self.shared);
		tokio::spawn(async move {
			let mut ticker = interval(shared.config.check_interval);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

			loop {
				tokio::select! {
					() = cancel.cancelled() => break,
					_ = ticker.tick() => scan(&shared),
				}
			}

			debug!("monitor loop stopped");
		});

		info!(
			check_interval = ?self.shared.config.check_interval,
			"monitor started",
		);
	}

	/// Halt the scan loop. In-flight reconnection tasks run to
	/// completion. Idempotent.
	pub fn stop(&self) {
		if let Some(cancel) = self.cancel.lock().take() {
			cancel.cancel();
		}
	}
}

impl Drop for Monitor {
	fn drop(&mut self) {
		self.stop();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		patterns::PatternConfig,
		registry::{Client, Severity},
	};

	fn fast_monitor(registry: Arc<ClientRegistry>) -> Monitor {
		Monitor::new(
			MonitorConfig {
				check_interval: Duration::from_millis(100),
				reconnect_interval: Duration::from_millis(50),
				max_reconnect_attempts: 3,
			},
			registry,
			PatternDetector::default(),
		)
	}

	async fn wait_for_status(
		registry: &ClientRegistry,
		id: &str,
		status: ClientStatus,
		within: Duration,
	) -> bool {
		let deadline = tokio::time::Instant::now() + within;
		while tokio::time::Instant::now() < deadline {
			if registry.get(id).map(|c| c.status) == Ok(status) {
				return true;
			}
			sleep(Duration::from_millis(10)).await;
		}
		false
	}

	#[tokio::test]
	async fn errored_agent_recovers() {
		let registry = Arc::new(ClientRegistry::new());
		registry
			.register(Client::new("c1", "203.0.113.4:100", "tcp"))
			.unwrap();
		registry
			.update_status("c1", ClientStatus::Error, Some("boom".to_string()))
			.unwrap();
		registry
			.report_exception("c1", "Connection timeout", Severity::Error, "network", "", None)
			.unwrap();

		let monitor = fast_monitor(Arc::clone(&registry));
		monitor.start();

		assert!(
			wait_for_status(&registry, "c1", ClientStatus::Online, Duration::from_millis(500))
				.await,
			"agent should recover within 500ms",
		);
		assert_eq!(registry.get("c1").unwrap().error, None);

		monitor.stop();
	}

	#[tokio::test]
	async fn error_without_exceptions_is_left_alone() {
		let registry = Arc::new(ClientRegistry::new());
		registry
			.register(Client::new("c1", "203.0.113.4:100", "tcp"))
			.unwrap();
		registry
			.update_status("c1", ClientStatus::Error, None)
			.unwrap();

		let monitor = fast_monitor(Arc::clone(&registry));
		monitor.start();

		sleep(Duration::from_millis(400)).await;
		assert_eq!(registry.get("c1").unwrap().status, ClientStatus::Error);

		monitor.stop();
	}

	#[tokio::test]
	async fn external_recovery_short_circuits() {
		let registry = Arc::new(ClientRegistry::new());
		registry
			.register(Client::new("c1", "203.0.113.4:100", "tcp"))
			.unwrap();
		registry
			.update_status("c1", ClientStatus::Error, None)
			.unwrap();
		registry
			.report_exception("c1", "boom", Severity::Error, "net", "", None)
			.unwrap();

		let monitor = fast_monitor(Arc::clone(&registry));
		monitor.start();

		// recover through another path before the monitor does
		registry
			.update_status("c1", ClientStatus::Offline, None)
			.unwrap();
		sleep(Duration::from_millis(400)).await;

		assert_eq!(registry.get("c1").unwrap().status, ClientStatus::Offline);
		monitor.stop();
	}

	#[tokio::test]
	async fn start_stop_idempotent() {
		let monitor = fast_monitor(Arc::new(ClientRegistry::new()));
		monitor.start();
		monitor.start();
		assert!(monitor.is_running());
		monitor.stop();
		monitor.stop();
		assert!(!monitor.is_running());
	}

	#[tokio::test]
	async fn patterns_from_registry_reports() {
		let registry = Arc::new(ClientRegistry::new());
		registry
			.register(Client::new("c1", "203.0.113.4:100", "tcp"))
			.unwrap();
		for _ in 0..3 {
			registry
				.report_exception("c1", "Connection timeout", Severity::Error, "network", "", None)
				.unwrap();
		}
		for _ in 0..2 {
			registry
				.report_exception("c1", "Authentication failed", Severity::Warning, "auth", "", None)
				.unwrap();
		}

		let monitor = Monitor::new(
			MonitorConfig::default(),
			Arc::clone(&registry),
			PatternDetector::new(PatternConfig {
				min_frequency: 2,
				..PatternConfig::default()
			}),
		);

		let patterns = monitor.detect_patterns();
		assert_eq!(patterns.len(), 2);
		assert_eq!(patterns[0].frequency, 3);
		assert_eq!(patterns[1].frequency, 2);
	}
}
