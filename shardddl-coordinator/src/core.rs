use shardddl::coordinator::Coordinator;
use shardddl::store::{CoordinationStore, KvStore, MemoryKv, PostgresKv};
use shardddl_config::shared::{CoordinationStoreConfig, ServiceConfig};
use tracing::{info, warn};

/// Connects the configured store and rebuilds the coordination state from it.
pub async fn start_coordinator_with_config(config: ServiceConfig) -> anyhow::Result<()> {
    info!("starting shard ddl coordinator");

    log_config(&config);

    // Static dispatch over the store backend.
    match &config.store {
        CoordinationStoreConfig::Memory => {
            warn!("using the in-memory coordination store, state is lost on exit");

            let store = CoordinationStore::new(MemoryKv::new());
            start_coordinator(Coordinator::new(store, config.coordinator)).await?;
        }
        CoordinationStoreConfig::Postgres(connection) => {
            PostgresKv::migrate(connection).await?;

            let store = CoordinationStore::new(PostgresKv::connect(connection));
            start_coordinator(Coordinator::new(store, config.coordinator)).await?;
        }
    }

    info!("shard ddl coordinator stopped");

    Ok(())
}

fn log_config(config: &ServiceConfig) {
    info!(
        unknown_participant = ?config.coordinator.unknown_participant,
        destructive_changes = ?config.coordinator.destructive_changes,
        "coordinator config"
    );

    match &config.store {
        CoordinationStoreConfig::Memory => info!("store config: memory"),
        CoordinationStoreConfig::Postgres(connection) => info!(
            host = %connection.host,
            port = connection.port,
            database = %connection.name,
            username = %connection.username,
            tls_enabled = connection.tls.enabled,
            max_connections = connection.max_connections,
            "store config: postgres"
        ),
    }
}

async fn start_coordinator<K>(coordinator: Coordinator<K>) -> anyhow::Result<()>
where
    K: KvStore + Send + Sync,
{
    let summary = coordinator.rebuild().await?;

    let mut locks: Vec<_> = coordinator.locks().snapshot().into_values().collect();
    locks.sort_by(|a, b| a.id().cmp(b.id()));

    for lock in &locks {
        info!(
            lock_id = %lock.id(),
            task = %lock.task(),
            downstream = %lock.downstream(),
            status = %lock.status(),
            sources = lock.sources().len(),
            "ddl lock"
        );
    }

    for task in coordinator.tables().tasks() {
        info!(
            %task,
            sources = coordinator.tables().list_for_task(&task).len(),
            "task table sets"
        );
    }

    if let Some(failures) = &summary.failures {
        warn!(
            conflicts = summary.conflicts,
            error = %failures,
            "some change reports need manual resolution"
        );
    }

    Ok(())
}
