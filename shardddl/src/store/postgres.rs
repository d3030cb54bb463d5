use std::time::Duration;

use shardddl_config::shared::PgConnectionConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Postgres, Transaction};
use tracing::{debug, info};

use crate::error::ShardDdlResult;
use crate::store::kv::{
    Compare, KeyValue, KvStore, RangeResponse, Revision, Txn, TxnOp, TxnResponse,
};

/// Connections are closed after being idle for this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connections used while running migrations.
const NUM_MIGRATION_CONNECTIONS: u32 = 1;

/// [`KvStore`] backed by a Postgres database.
///
/// Entries live in `shardddl.coordination_kv`; the store revision is the single row of
/// `shardddl.coordination_revision`. Write transactions lock that row first, which serializes
/// writers and hands out strictly increasing revisions.
#[derive(Debug, Clone)]
pub struct PostgresKv {
    pool: PgPool,
}

impl PostgresKv {
    /// Creates a store with a lazily connected pool.
    ///
    /// No connection is opened until the first read or write.
    pub fn connect(config: &PgConnectionConfig) -> Self {
        let pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(config.max_connections)
            .idle_timeout(Some(IDLE_TIMEOUT))
            .connect_lazy_with(config.connect_options());

        Self { pool }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates or upgrades the `shardddl` schema.
    ///
    /// Migration bookkeeping is kept inside the `shardddl` schema rather than `public`.
    pub async fn migrate(config: &PgConnectionConfig) -> ShardDdlResult<()> {
        let pool = PgPoolOptions::new()
            .max_connections(NUM_MIGRATION_CONNECTIONS)
            .min_connections(NUM_MIGRATION_CONNECTIONS)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute("create schema if not exists shardddl;")
                        .await?;
                    conn.execute("set search_path = 'shardddl';").await?;
                    Ok(())
                })
            })
            .connect_with(config.connect_options())
            .await?;

        info!(database = %config.name, "running coordination store migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        pool.close().await;

        Ok(())
    }

    async fn current_revision(tx: &mut Transaction<'_, Postgres>) -> ShardDdlResult<Revision> {
        let revision: i64 = sqlx::query_scalar(
            r#"
            select revision from shardddl.coordination_revision
            where id = 1
            for update
            "#,
        )
        .fetch_one(&mut **tx)
        .await?;

        Ok(revision)
    }

    async fn mod_revision(
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
    ) -> ShardDdlResult<Revision> {
        let revision: Option<i64> = sqlx::query_scalar(
            r#"
            select mod_revision from shardddl.coordination_kv
            where key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(revision.unwrap_or(0))
    }
}

impl KvStore for PostgresKv {
    async fn range(&self, prefix: &str) -> ShardDdlResult<RangeResponse> {
        let mut tx = self.pool.begin().await?;

        // Entries and revision have to come from the same snapshot.
        sqlx::query("set transaction isolation level repeatable read read only")
            .execute(&mut *tx)
            .await?;

        let rows: Vec<(String, Vec<u8>, i64)> = sqlx::query_as(
            r#"
            select key, value, mod_revision from shardddl.coordination_kv
            where starts_with(key, $1)
            order by key
            "#,
        )
        .bind(prefix)
        .fetch_all(&mut *tx)
        .await?;

        let revision: i64 = sqlx::query_scalar(
            r#"
            select revision from shardddl.coordination_revision
            where id = 1
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let entries = rows
            .into_iter()
            .map(|(key, value, mod_revision)| KeyValue {
                key,
                value,
                mod_revision,
            })
            .collect();

        Ok(RangeResponse { entries, revision })
    }

    async fn txn(&self, txn: Txn) -> ShardDdlResult<TxnResponse> {
        let mut tx = self.pool.begin().await?;

        let current = Self::current_revision(&mut tx).await?;

        for compare in &txn.compares {
            let Compare::ModRevision { key, revision } = compare;
            let actual = Self::mod_revision(&mut tx, key).await?;
            if actual != *revision {
                debug!(%key, expected = revision, actual, "store compare failed");
                tx.rollback().await?;

                return Ok(TxnResponse {
                    succeeded: false,
                    revision: current,
                });
            }
        }

        if txn.is_empty() {
            tx.commit().await?;

            return Ok(TxnResponse {
                succeeded: true,
                revision: current,
            });
        }

        let revision: i64 = sqlx::query_scalar(
            r#"
            update shardddl.coordination_revision
            set revision = revision + 1
            where id = 1
            returning revision
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;

        for op in txn.ops {
            match op {
                TxnOp::Put { key, value } => {
                    sqlx::query(
                        r#"
                        insert into shardddl.coordination_kv (key, value, mod_revision)
                        values ($1, $2, $3)
                        on conflict (key) do update
                        set value = excluded.value, mod_revision = excluded.mod_revision
                        "#,
                    )
                    .bind(key)
                    .bind(value)
                    .bind(revision)
                    .execute(&mut *tx)
                    .await?;
                }
                TxnOp::Delete { key } => {
                    sqlx::query(
                        r#"
                        delete from shardddl.coordination_kv
                        where key = $1
                        "#,
                    )
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;

        Ok(TxnResponse {
            succeeded: true,
            revision,
        })
    }
}
