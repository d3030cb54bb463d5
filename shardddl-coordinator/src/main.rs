//! Shard DDL coordinator service binary.
//!
//! Loads the service configuration, connects the coordination store and rebuilds the DDL locks
//! from the stored change reports.

use shardddl_config::load_config;
use shardddl_config::shared::ServiceConfig;
use shardddl_telemetry::tracing::init_tracing;

use crate::core::start_coordinator_with_config;

mod core;

fn main() -> anyhow::Result<()> {
    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"))?;

    let config = load_config::<ServiceConfig>()?;
    config.validate()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_coordinator_with_config(config))?;

    Ok(())
}
