//! Orchestration of the store and the in-memory registries.
//!
//! Every operation writes to the [`CoordinationStore`] first and mirrors the change into the
//! registries only after the write succeeded. No registry lock is held across a store call.
//!
//! A task merges into exactly one downstream table at a time. Reports targeting another
//! downstream table are refused until the task's current lock is retired.

use shardddl_config::shared::CoordinatorConfig;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::bail;
use crate::error::{ErrorKind, ShardDdlError, ShardDdlResult};
use crate::lock::{DdlLock, LockRegistry};
use crate::store::{CoordinationStore, DownstreamRecords, KvStore, Revision};
use crate::tables::TableRegistry;
use crate::types::{ChangeReport, Decision, DecisionConflict, TableName, TableSet};

/// Outcome of [`Coordinator::rebuild`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebuildSummary {
    /// Revision the table sets were read at.
    pub table_sets_revision: Revision,
    /// Revision the change reports were read at.
    pub reports_revision: Revision,
    /// Number of replayed change reports.
    pub reports: usize,
    /// Number of locks after the replay.
    pub locks: usize,
    /// Number of replayed reports that failed to synchronize.
    pub conflicts: usize,
    /// The replay failures, aggregated when there are several.
    pub failures: Option<ShardDdlError>,
}

/// Drives the DDL locks of every task from the change reports sources submit.
#[derive(Debug)]
pub struct Coordinator<K> {
    store: CoordinationStore<K>,
    locks: LockRegistry,
    tables: TableRegistry,
    /// Held shared while a report travels from the store into its lock, and exclusively while
    /// locks are retired or rebuilt.
    cycles: RwLock<()>,
}

impl<K> Coordinator<K>
where
    K: KvStore + Send + Sync,
{
    pub fn new(store: CoordinationStore<K>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            locks: LockRegistry::new(config),
            tables: TableRegistry::new(),
            cycles: RwLock::new(()),
        }
    }

    pub fn store(&self) -> &CoordinationStore<K> {
        &self.store
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    /// Rebuilds both registries from the store.
    ///
    /// Table sets are loaded first, then every stored change report is replayed in task,
    /// source, schema and table order. Replay conflicts are logged and counted; they are
    /// reproduced when the source reports again.
    pub async fn rebuild(&self) -> ShardDdlResult<RebuildSummary> {
        let _cycles = self.cycles.write().await;

        let (table_sets, table_sets_revision) = self.store.get_table_sets().await?;
        let (reports, reports_revision) = self.store.get_reports().await?;

        self.tables.reinitialize(table_sets);
        self.locks.clear();

        let mut summary = RebuildSummary {
            table_sets_revision,
            reports_revision,
            ..RebuildSummary::default()
        };
        let mut failures = Vec::new();

        for (task, sources) in reports {
            let table_sets = self.tables.list_for_task(&task);
            let task_reports = sources
                .into_values()
                .flat_map(|schemas| schemas.into_values())
                .flat_map(|tables| tables.into_values());

            for report in task_reports {
                summary.reports += 1;

                let (lock_id, result) =
                    self.locks.synchronize_with(&report, || table_sets.clone());
                if let Err(err) = result {
                    warn!(
                        %lock_id,
                        source = %report.source,
                        upstream = %report.upstream,
                        error = %err.description(),
                        detail = err.detail().unwrap_or_default(),
                        "change report does not synchronize during rebuild"
                    );
                    failures.push(err);
                }
            }
        }

        summary.locks = self.locks.len();
        summary.conflicts = failures.len();
        if !failures.is_empty() {
            summary.failures = Some(ShardDdlError::from(failures));
        }

        info!(
            table_sets_revision,
            reports_revision,
            reports = summary.reports,
            locks = summary.locks,
            conflicts = summary.conflicts,
            "rebuilt coordination state"
        );

        Ok(summary)
    }

    /// Handles a change report submitted together with the reporting source's table set.
    ///
    /// Both are stored in one transaction before the report reaches its lock, and the resulting
    /// decision is stored afterwards. Tables missing from the new table set leave the task's
    /// locks first. Resubmitting the stored report unchanged keeps a decision the source
    /// already settled. Conflicts are stored as a decision without statements and returned as
    /// the error.
    ///
    /// A report targeting another downstream table than the task's current lock is refused
    /// with [`ErrorKind::InvalidData`] and not stored.
    pub async fn handle_report(
        &self,
        report: ChangeReport,
        table_set: TableSet,
    ) -> ShardDdlResult<Decision> {
        let belongs_to_report = table_set.task == report.task && table_set.source == report.source;
        if table_set.is_deleted || !belongs_to_report {
            bail!(
                ErrorKind::InvalidData,
                "Change report needs the live table set of its source",
                format!(
                    "report of source `{}` in task `{}` came with the table set of source `{}` \
                     in task `{}` (deleted: {})",
                    report.source,
                    report.task,
                    table_set.source,
                    table_set.task,
                    table_set.is_deleted
                )
            );
        }

        let _cycles = self.cycles.read().await;

        if let Some(other) = self
            .locks
            .find_by_task(&report.task)
            .into_iter()
            .find(|lock| *lock.downstream() != report.downstream)
        {
            bail!(
                ErrorKind::InvalidData,
                "Task already merges into another downstream table",
                format!(
                    "task `{}` is coordinated by lock `{}` for {}, report of source `{}` \
                     targets {}",
                    report.task,
                    other.id(),
                    other.downstream(),
                    report.source,
                    report.downstream
                )
            );
        }

        let (previous, _) = self
            .store
            .get_report(&report.task, &report.source, &report.upstream)
            .await?;
        let resubmitted = previous.as_ref() == Some(&report);

        let revision = self.store.put_table_set_report(&table_set, &report).await?;
        debug!(
            task = %report.task,
            source = %report.source,
            upstream = %report.upstream,
            revision,
            "stored change report"
        );

        self.tables.apply(table_set);

        let (lock_id, result) = self
            .locks
            .synchronize_with(&report, || self.tables.list_for_task(&report.task));
        let ddls = match result {
            Ok(ddls) => ddls,
            Err(err) if err.kind() == ErrorKind::InvalidData => {
                // Another downstream table got its lock in the meantime.
                self.restore_report(&report, previous).await?;

                return Err(err);
            }
            Err(err) => {
                if let Some(conflict) = DecisionConflict::from_error_kind(err.kind()) {
                    let decision = Decision::for_report(&report, vec![], conflict);
                    self.store.put_decision(&decision, resubmitted).await?;
                    warn!(
                        %lock_id,
                        decision_id = %decision.id,
                        %conflict,
                        "stored conflict decision"
                    );
                }

                return Err(err);
            }
        };

        let decision = Decision::for_report(&report, ddls, DecisionConflict::Resolved);
        let write = self.store.put_decision(&decision, resubmitted).await?;
        if !write.written {
            debug!(
                %lock_id,
                decision_id = %decision.id,
                "source already settled the previous decision"
            );
        }

        Ok(decision)
    }

    /// Marks a decision as executed by its source.
    ///
    /// Only the decision currently stored for its table is settled; an acknowledgement of a
    /// decision a newer cycle replaced is ignored. Returns whether this retired the lock, which
    /// happens once the lock is synchronized and every stored decision of its reports is
    /// settled.
    pub async fn settle(&self, decision: &Decision) -> ShardDdlResult<bool> {
        let Some(revision) = self.store.settle_decision(decision).await? else {
            warn!(
                decision_id = %decision.id,
                task = %decision.task,
                source = %decision.source,
                upstream = %decision.upstream,
                "ignored settlement of a decision that is no longer stored"
            );

            return Ok(false);
        };
        debug!(decision_id = %decision.id, revision, "settled decision");

        let (report, _) = self
            .store
            .get_report(&decision.task, &decision.source, &decision.upstream)
            .await?;
        let Some(report) = report else {
            debug!(decision_id = %decision.id, "settled decision has no change report");
            return Ok(false);
        };

        let _cycles = self.cycles.write().await;

        let Some(lock) = self.locks.find_by_report(&report) else {
            debug!(decision_id = %decision.id, "settled decision has no lock");
            return Ok(false);
        };
        if !lock.is_synced() {
            return Ok(false);
        }

        let (records, _) = self
            .store
            .get_downstream_records(lock.task(), lock.downstream())
            .await?;
        if !records.all_settled() {
            return Ok(false);
        }

        if !self.delete_records(&lock, &records).await? {
            return Ok(false);
        }

        Ok(self.locks.remove_if(lock.id(), DdlLock::is_synced))
    }

    /// Deletes the stored reports and decisions of a lock, then removes it.
    ///
    /// Returns `false` if no such lock exists or its records changed while being deleted.
    pub async fn retire_lock(&self, lock_id: &str) -> ShardDdlResult<bool> {
        let _cycles = self.cycles.write().await;

        let Some(lock) = self.locks.find(lock_id) else {
            return Ok(false);
        };

        let (records, _) = self
            .store
            .get_downstream_records(lock.task(), lock.downstream())
            .await?;
        if !self.delete_records(&lock, &records).await? {
            return Ok(false);
        }

        Ok(self.locks.remove(lock_id))
    }

    /// Adds an upstream table to a source of a known task.
    ///
    /// Returns `false` for unknown tasks and tables that are already listed.
    pub async fn add_table(
        &self,
        task: &str,
        source: &str,
        schema: &str,
        table: &str,
    ) -> ShardDdlResult<bool> {
        if !self.tables.tasks().iter().any(|known| known == task) {
            return Ok(false);
        }

        let mut table_set = self
            .tables
            .get(task, source)
            .unwrap_or_else(|| TableSet::new(task, source, Default::default()));
        if !table_set.add_table(schema, table) {
            return Ok(false);
        }

        self.store.put_table_set(&table_set).await?;

        let added = self.tables.add_table(task, source, schema, table);
        self.locks.refresh_task(task, || self.tables.list_for_task(task));

        Ok(added)
    }

    /// Removes an upstream table together with its pending change report.
    ///
    /// Returns `false` if the task, source or table is unknown.
    pub async fn remove_table(
        &self,
        task: &str,
        source: &str,
        schema: &str,
        table: &str,
    ) -> ShardDdlResult<bool> {
        let Some(mut table_set) = self.tables.get(task, source) else {
            return Ok(false);
        };
        if !table_set.remove_table(schema, table) {
            return Ok(false);
        }

        let (pending, _) = self
            .store
            .get_report(task, source, &TableName::new(schema, table))
            .await?;

        let revision = match pending {
            Some(report) => {
                self.store
                    .put_table_set_delete_report(&table_set, &report)
                    .await?
            }
            None => self.store.put_table_set(&table_set).await?,
        };
        debug!(%task, %source, %schema, %table, revision, "removed table from source");

        let removed = self.tables.remove_table(task, source, schema, table);
        self.locks.remove_table(task, source, schema, table);

        Ok(removed)
    }

    /// Removes a source from a task with all of its stored records.
    ///
    /// Returns `false` if the source has no table set in the task.
    pub async fn remove_source(&self, task: &str, source: &str) -> ShardDdlResult<bool> {
        if self.tables.get(task, source).is_none() {
            return Ok(false);
        }

        let (reports, _) = self.store.get_reports().await?;
        let (decisions, _) = self.store.get_decisions().await?;

        let reports: Vec<ChangeReport> = reports
            .get(task)
            .and_then(|sources| sources.get(source))
            .into_iter()
            .flat_map(|schemas| schemas.values())
            .flat_map(|tables| tables.values().cloned())
            .collect();
        let decisions: Vec<Decision> = decisions
            .get(task)
            .and_then(|sources| sources.get(source))
            .into_iter()
            .flat_map(|schemas| schemas.values())
            .flat_map(|tables| tables.values().cloned())
            .collect();

        let tombstone = TableSet::tombstone(task, source);
        let revision = self
            .store
            .remove_source(&tombstone, &reports, &decisions)
            .await?;

        let removed = self.tables.apply(tombstone);
        let locks = self.locks.remove_source(task, source);

        info!(%task, %source, revision, locks, "removed source from task");

        Ok(removed)
    }

    /// Deletes `records` if none of them changed since they were read.
    async fn delete_records(
        &self,
        lock: &DdlLock,
        records: &DownstreamRecords,
    ) -> ShardDdlResult<bool> {
        let Some(revision) = self.store.delete_downstream_records(records).await? else {
            warn!(lock_id = %lock.id(), "records of ddl lock changed while retiring it");

            return Ok(false);
        };

        info!(
            lock_id = %lock.id(),
            reports = records.reports.len(),
            decisions = records.decisions.len(),
            revision,
            "retired ddl lock"
        );

        Ok(true)
    }

    /// Puts back the report `report` overwrote, or deletes it if there was none.
    async fn restore_report(
        &self,
        report: &ChangeReport,
        previous: Option<ChangeReport>,
    ) -> ShardDdlResult<()> {
        match previous {
            Some(previous) => {
                self.store.put_report(&previous).await?;
            }
            None => {
                self.store
                    .delete_reports_decisions(std::slice::from_ref(report), &[])
                    .await?;
            }
        }

        Ok(())
    }
}
