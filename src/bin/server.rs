//! # tether server
//!
//! The server binary wires the whole stack together: it merges the
//! layered configuration, builds the security manager, the client
//! registry, and one encrypted listener per configured transport, starts
//! the background schedulers and the health monitor, and shuts
//! everything down in reverse start order on ctrl-c.

use std::sync::{
	atomic::{AtomicUsize, Ordering},
	Arc,
};

use anyhow::anyhow;
use pico_args::Arguments;
use tether::{
	config::Config,
	listener::ListenerManager,
	monitor::Monitor,
	patterns::PatternDetector,
	registry::ClientRegistry,
	security::SecurityManager,
	server::EncryptedListener,
	util::{SERVER_HELP, SERVER_NAME},
};
use tokio::runtime::Builder;
use tracing::{debug, info, Level};
use tracing_subscriber::{filter::DynFilterFn, prelude::*, FmtSubscriber};

fn main() -> Result<(), anyhow::Error> {
	// Temporary subscriber to collect and show logs during startup
	let tracing_subscriber = FmtSubscriber::builder()
		.with_level(true)
		.with_max_level(if cfg!(debug_assertions) {
			Level::DEBUG
		} else {
			Level::INFO
		})
		.finish();
	let subscriber_guard = tracing::subscriber::set_default(tracing_subscriber);

	info!(server = SERVER_NAME, "Starting tether");

	let mut args = Arguments::from_env();
	if args.contains(["-h", "--help"]) {
		println!("{SERVER_HELP}");
		Err(anyhow!(""))?;
	}

	info!("Getting server configuration");
	let config: &'static Config = Box::leak(Box::new(Config::new(
		args.opt_value_from_str(["-c", "--config"])?,
	)));
	debug!(log_level = %config.log_level(), "Server configuration parsed");

	// A filter that tracks the configured log level
	let tracing_filter = DynFilterFn::new(move |metadata, _| {
		metadata.level() <= &Level::from(config.log_level())
	});

	let (non_blocking, _tracing_appender_guard) = tracing_appender::non_blocking(std::io::stdout());
	let tracing_subscriber = FmtSubscriber::builder()
		.with_level(true)
		.with_max_level(Level::TRACE)
		.with_writer(non_blocking)
		.finish()
		.with(tracing_filter);

	drop(subscriber_guard);
	tracing::subscriber::set_global_default(tracing_subscriber)
		.expect("setting tracing default subscriber failed");

	let rt = Builder::new_multi_thread()
		.enable_all()
		.thread_name_fn(|| {
			static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
			let id = ATOMIC_ID.fetch_add(1, Ordering::Relaxed);
			format!("tether-worker-{id:#04x}")
		})
		.build()
		.expect("async runtime initialization");

	rt.block_on(run(config))
}

async fn run(config: &'static Config) -> Result<(), anyhow::Error> {
	let registry = Arc::new(ClientRegistry::new());
	let security = SecurityManager::new(config.security_config())?;
	security.start();

	let manager = ListenerManager::new();
	let mut listeners = Vec::new();
	for listen in config.listeners() {
		let listener = ListenerManager::create(listen.protocol, config.listener_config(&listen))?;
		manager.register(Arc::clone(&listener))?;
		listeners.push(EncryptedListener::new(
			listener,
			Arc::clone(&security),
			Arc::clone(&registry),
		));
	}

	for listener in &listeners {
		listener.start(manager.cancel_token()).await?;
		info!(protocol = %listener.protocol(), address = listener.config().address, "listening");
	}

	let monitor = Monitor::new(
		config.monitor_config(),
		Arc::clone(&registry),
		PatternDetector::new(config.pattern_config()),
	);
	monitor.start();

	info!(server = SERVER_NAME, "tether server started");
	tokio::signal::ctrl_c().await?;
	info!("Shutting down");

	// reverse start order: monitor, security schedulers, listeners
	monitor.stop();
	security.stop();
	manager.halt_all().await;

	Ok(())
}
