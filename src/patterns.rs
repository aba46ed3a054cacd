//! Exception pattern detection.
//!
//! Groups exception reports by `(client, module, message)` and emits a
//! pattern for every group that is both frequent enough and tight enough
//! in time. Grouping is by exact message; the similarity threshold is
//! carried in the configuration for a future fuzzy grouper and is not
//! consulted by the current implementation.

use std::{
	collections::HashMap,
	hash::{DefaultHasher, Hash, Hasher},
	time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::registry::{ExceptionReport, Severity};

/// Configuration for the pattern detector.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PatternConfig {
	/// Minimum group size before a pattern is emitted
	pub min_frequency: usize,
	/// Maximum span between a group's first and last report
	pub time_window: Duration,
	/// Reserved for fuzzy message grouping; unused by the exact grouper
	pub similarity_threshold: f64,
}

impl Default for PatternConfig {
	fn default() -> Self {
		Self {
			min_frequency: 3,
			time_window: Duration::from_secs(5 * 60),
			similarity_threshold: 0.8,
		}
	}
}

/// A recurring exception: one group of identical reports from one agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionPattern {
	/// Stable identifier derived from the group key
	pub pattern_id: String,
	/// The agent the reports came from
	pub client_id: String,
	/// The module that raised them
	pub module: String,
	/// The shared message of the group
	pub message: String,
	/// The highest severity observed in the group
	pub severity: Severity,
	/// How many reports the group holds
	pub frequency: usize,
	/// Unix seconds of the earliest report
	pub first_seen: u64,
	/// Unix seconds of the latest report
	pub last_seen: u64,
	/// The detection window the group was measured against, in seconds
	pub observed_window: u64,
}

/// Detects recurring exceptions across the registry's reports.
#[derive(Clone, Debug, Default)]
pub struct PatternDetector {
	config: PatternConfig,
}

impl PatternDetector {
	/// Create a detector with the given configuration.
	#[must_use]
	pub const fn new(config: PatternConfig) -> Self {
		Self { config }
	}

	/// The active configuration.
	#[must_use]
	pub const fn config(&self) -> &PatternConfig {
		&self.config
	}

	/// Group `reports` and return every pattern meeting the configured
	/// frequency and window bounds, most frequent first.
	#[must_use]
	pub fn detect(&self, reports: &[ExceptionReport]) -> Vec<ExceptionPattern> {
		let mut groups: HashMap<(&str, &str, &str), Vec<&ExceptionReport>> = HashMap::new();
		for report in reports {
			groups
				.entry((&report.client_id, &report.module, &report.message))
				.or_default()
				.push(report);
		}

		let mut patterns: Vec<ExceptionPattern> = groups
			.into_iter()
			.filter(|(_, group)| group.len() >= self.config.min_frequency)
			.filter_map(|((client_id, module, message), group)| {
				let first_seen = group.iter().map(|r| r.timestamp).min()?;
				let last_seen = group.iter().map(|r| r.timestamp).max()?;
				if last_seen - first_seen > self.config.time_window.as_secs() {
					return None;
				}

				let severity = group.iter().map(|r| r.severity).max()?;
				Some(ExceptionPattern {
					pattern_id: pattern_id(client_id, module, message),
					client_id: client_id.to_string(),
					module: module.to_string(),
					message: message.to_string(),
					severity,
					frequency: group.len(),
					first_seen,
					last_seen,
					observed_window: self.config.time_window.as_secs(),
				})
			})
			.collect();

		patterns.sort_by(|a, b| {
			b.frequency
				.cmp(&a.frequency)
				.then_with(|| a.pattern_id.cmp(&b.pattern_id))
		});
		patterns
	}
}

fn pattern_id(client_id: &str, module: &str, message: &str) -> String {
	let mut hasher = DefaultHasher::new();
	message.hash(&mut hasher);
	format!("{client_id}:{module}:{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn report(client: &str, module: &str, message: &str, severity: Severity, ts: u64) -> ExceptionReport {
		ExceptionReport {
			client_id: client.to_string(),
			module: module.to_string(),
			message: message.to_string(),
			severity,
			stack: String::new(),
			timestamp: ts,
			metadata: None,
		}
	}

	#[test]
	fn detects_frequencies_per_group() {
		let detector = PatternDetector::new(PatternConfig {
			min_frequency: 2,
			..PatternConfig::default()
		});

		let mut reports = Vec::new();
		for i in 0..3 {
			reports.push(report(
				"c1",
				"network",
				"Connection timeout",
				Severity::Error,
				1000 + i,
			));
		}
		for i in 0..2 {
			reports.push(report(
				"c1",
				"auth",
				"Authentication failed",
				Severity::Warning,
				1000 + i,
			));
		}

		let patterns = detector.detect(&reports);
		assert_eq!(patterns.len(), 2);
		assert_eq!(patterns[0].frequency, 3);
		assert_eq!(patterns[0].message, "Connection timeout");
		assert_eq!(patterns[0].severity, Severity::Error);
		assert_eq!(patterns[1].frequency, 2);
		assert_eq!(patterns[1].message, "Authentication failed");
	}

	#[test]
	fn below_threshold_is_silent() {
		let detector = PatternDetector::default();
		let reports = vec![
			report("c1", "net", "boom", Severity::Error, 10),
			report("c1", "net", "boom", Severity::Error, 11),
		];
		assert!(detector.detect(&reports).is_empty());
	}

	#[test]
	fn window_excludes_spread_out_groups() {
		let detector = PatternDetector::new(PatternConfig {
			min_frequency: 3,
			time_window: Duration::from_secs(60),
			..PatternConfig::default()
		});

		let reports = vec![
			report("c1", "net", "boom", Severity::Error, 0),
			report("c1", "net", "boom", Severity::Error, 30),
			report("c1", "net", "boom", Severity::Error, 120),
		];
		assert!(detector.detect(&reports).is_empty());
	}

	#[test]
	fn groups_are_per_client() {
		let detector = PatternDetector::new(PatternConfig {
			min_frequency: 2,
			..PatternConfig::default()
		});

		let reports = vec![
			report("c1", "net", "boom", Severity::Error, 10),
			report("c2", "net", "boom", Severity::Error, 10),
			report("c2", "net", "boom", Severity::Error, 11),
		];

		let patterns = detector.detect(&reports);
		assert_eq!(patterns.len(), 1);
		assert_eq!(patterns[0].client_id, "c2");
		assert_eq!(patterns[0].frequency, 2);
	}

	#[test]
	fn pattern_bounds_and_severity() {
		let detector = PatternDetector::new(PatternConfig {
			min_frequency: 2,
			..PatternConfig::default()
		});

		let reports = vec![
			report("c1", "net", "boom", Severity::Warning, 100),
			report("c1", "net", "boom", Severity::Critical, 160),
		];

		let patterns = detector.detect(&reports);
		assert_eq!(patterns[0].first_seen, 100);
		assert_eq!(patterns[0].last_seen, 160);
		assert_eq!(patterns[0].severity, Severity::Critical);
	}
}
