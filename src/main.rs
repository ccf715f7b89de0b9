//! framed-rpc server binary.
//!
//! Loads configuration, initialises logging and hands the bound listener
//! to the selected runtime.

use framed_rpc::config::Config;
use framed_rpc::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        addr = %config.addr,
        strategy = config.strategy.as_str(),
        workers = config.workers,
        event_workers = config.event_workers,
        idle_timeout = ?config.idle_timeout,
        max_frame_size = config.max_frame_size,
        "Starting framed-rpc server"
    );

    runtime::run(config)?;
    Ok(())
}
