//! Miscellaneous statics and utilities used throughout tether.

use std::time::{SystemTime, UNIX_EPOCH};

/// A string representation of this crate's version. In debug builds, this
/// is in the form of `[full semver crate version]+debug`. In release
/// builds this gets shortened to `MAJOR.MINOR`.
pub const VERSION: &str = if cfg!(debug_assertions) {
	concat!(env!("CARGO_PKG_VERSION"), "+debug")
} else {
	concat!(
		env!("CARGO_PKG_VERSION_MAJOR"),
		".",
		env!("CARGO_PKG_VERSION_MINOR")
	)
};

/// The name of the server implemented by this crate, used in logs on
/// startup. Currently this is `tether/[version]`.
pub const SERVER_NAME: &str = if cfg!(debug_assertions) {
	concat!("tether/", env!("CARGO_PKG_VERSION"), "+debug")
} else {
	concat!(
		"tether/",
		env!("CARGO_PKG_VERSION_MAJOR"),
		".",
		env!("CARGO_PKG_VERSION_MINOR")
	)
};

/// Current wall-clock time as whole seconds since the unix epoch.
///
/// Saturates to `0` for clocks set before 1970 rather than panicking.
#[must_use]
pub fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}

/// Current wall-clock time as nanoseconds since the unix epoch.
#[must_use]
pub fn unix_now_nanos() -> u128 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_nanos()
}

/// Help string for the server CLI
pub const SERVER_HELP: &str = r#"tether server

USAGE:
    server [FLAGS] [OPTIONS] [CONFIGURATION]

EXAMPLE:
    server -c ./config.toml --log-level warn

FLAGS:
 -h --help                   Print this and exit

OPTIONS:
 -c --config PATH            Configuration file path. Supported formats: toml (*.toml), yaml/json (*.yaml, *.yml, *.json)

CONFIGURATION:
    --[OPTION] VALUE         Configuration option (in "kebab-case"), see documentation for possible options and values

Configuration options are parsed first from environment variables ("TETHER_[CONFIG_OPTION]"), then from the configuration file, then from command-line arguments ("--[config-option]"), later ones overwriting earlier ones.
"#;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unix_now_is_sane() {
		// 2020-01-01T00:00:00Z
		assert!(unix_now() > 1_577_836_800);
	}

	#[test]
	fn nanos_exceed_seconds() {
		let secs = unix_now();
		let nanos = unix_now_nanos();
		assert!(nanos / 1_000_000_000 >= u128::from(secs));
	}
}
