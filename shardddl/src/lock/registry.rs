use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use shardddl_config::shared::CoordinatorConfig;
use tracing::info;

use crate::error::{ErrorKind, ShardDdlResult};
use crate::shardddl_error;
use crate::lock::DdlLock;
use crate::types::{ChangeReport, TableName, TableSet};

/// Returns the identifier of the lock coordinating `downstream` within `task`.
pub fn lock_id(task: &str, downstream: &TableName) -> String {
    format!("{task}-{}", downstream.as_quoted_identifier())
}

/// In-memory index of the DDL locks, keyed by lock identifier.
///
/// Nothing here is persisted; [`LockRegistry::clear`] followed by a replay of the stored
/// change reports rebuilds the same locks.
#[derive(Debug, Default)]
pub struct LockRegistry {
    options: CoordinatorConfig,
    locks: RwLock<HashMap<String, Arc<DdlLock>>>,
}

impl LockRegistry {
    /// Creates an empty registry whose locks apply `options`.
    pub fn new(options: CoordinatorConfig) -> Self {
        Self {
            options,
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Feeds `report` into the lock of its downstream table.
    ///
    /// A missing lock is created with the report's prior shape as joined shape, which also
    /// recreates locks that were already retired. The lock identifier is returned even when
    /// synchronization fails.
    pub fn synchronize(
        &self,
        report: &ChangeReport,
        table_sets: &[TableSet],
    ) -> (String, ShardDdlResult<Vec<String>>) {
        let id = lock_id(&report.task, &report.downstream);

        let mut locks = self.locks.write();
        let lock = locks.entry(id.clone()).or_insert_with(|| {
            Arc::new(DdlLock::new(
                id.clone(),
                report.task.clone(),
                report.downstream.clone(),
                report.shape_before.clone(),
                table_sets,
                self.options,
            ))
        });

        let result = lock.try_sync(
            &report.source,
            &report.upstream,
            &report.ddls,
            &report.shape_after,
            table_sets,
        );

        (id, result)
    }

    /// Feeds `report` into the lock of its downstream table, which must be the only downstream
    /// table the task merges into.
    ///
    /// `list_table_sets` is called while the registry is write locked, so the table sets it
    /// returns are not older than any membership change already mirrored into the locks. Every
    /// lock of the task is aligned with them before the report is synchronized.
    ///
    /// Fails with [`ErrorKind::InvalidData`] when another lock of the task coordinates a
    /// different downstream table; no lock is touched in that case.
    pub fn synchronize_with<F>(
        &self,
        report: &ChangeReport,
        list_table_sets: F,
    ) -> (String, ShardDdlResult<Vec<String>>)
    where
        F: FnOnce() -> Vec<TableSet>,
    {
        let id = lock_id(&report.task, &report.downstream);

        let mut locks = self.locks.write();
        if let Some(other) = locks
            .values()
            .find(|lock| lock.task() == report.task && lock.id() != id)
        {
            let err = shardddl_error!(
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

            return (id, Err(err));
        }

        let table_sets = list_table_sets();
        for lock in locks.values().filter(|lock| lock.task() == report.task) {
            lock.refresh(&table_sets);
        }

        let lock = locks.entry(id.clone()).or_insert_with(|| {
            Arc::new(DdlLock::new(
                id.clone(),
                report.task.clone(),
                report.downstream.clone(),
                report.shape_before.clone(),
                &table_sets,
                self.options,
            ))
        });

        let result = lock.try_sync(
            &report.source,
            &report.upstream,
            &report.ddls,
            &report.shape_after,
            &table_sets,
        );

        (id, result)
    }

    /// Removes a lock, returning whether it existed.
    pub fn remove(&self, lock_id: &str) -> bool {
        let removed = self.locks.write().remove(lock_id).is_some();
        if removed {
            info!(%lock_id, "removed ddl lock");
        }

        removed
    }

    pub fn find(&self, lock_id: &str) -> Option<Arc<DdlLock>> {
        self.locks.read().get(lock_id).cloned()
    }

    pub fn find_by_report(&self, report: &ChangeReport) -> Option<Arc<DdlLock>> {
        self.find(&lock_id(&report.task, &report.downstream))
    }

    /// Returns the locks of `task`.
    pub fn find_by_task(&self, task: &str) -> Vec<Arc<DdlLock>> {
        self.locks
            .read()
            .values()
            .filter(|lock| lock.task() == task)
            .cloned()
            .collect()
    }

    /// Removes a lock if `predicate` holds for it, returning whether it was removed.
    ///
    /// The predicate runs while the registry is write locked, so no report is synchronized
    /// into the lock between the check and the removal.
    pub fn remove_if<P>(&self, lock_id: &str, predicate: P) -> bool
    where
        P: FnOnce(&DdlLock) -> bool,
    {
        let mut locks = self.locks.write();
        if !locks.get(lock_id).is_some_and(|lock| predicate(lock)) {
            return false;
        }

        locks.remove(lock_id);
        info!(%lock_id, "removed ddl lock");

        true
    }

    /// Aligns the participants of every lock of `task` with the table sets `list_table_sets`
    /// returns, which is called while the registry is write locked.
    pub fn refresh_task<F>(&self, task: &str, list_table_sets: F)
    where
        F: FnOnce() -> Vec<TableSet>,
    {
        let locks = self.locks.write();
        let table_sets = list_table_sets();
        for lock in locks.values().filter(|lock| lock.task() == task) {
            lock.refresh(&table_sets);
        }
    }

    /// Drops `source` from every lock of `task`, returning how many locks it participated in.
    pub fn remove_source(&self, task: &str, source: &str) -> usize {
        let locks = self.locks.write();
        locks
            .values()
            .filter(|lock| lock.task() == task)
            .filter(|lock| lock.remove_source(source))
            .count()
    }

    /// Drops one upstream table from every lock of `task`, returning how many locks it
    /// participated in.
    pub fn remove_table(&self, task: &str, source: &str, schema: &str, table: &str) -> usize {
        let locks = self.locks.write();
        locks
            .values()
            .filter(|lock| lock.task() == task)
            .filter(|lock| lock.remove_table(source, schema, table))
            .count()
    }

    /// Returns a copy of the index that can be iterated without blocking the registry.
    pub fn snapshot(&self) -> HashMap<String, Arc<DdlLock>> {
        self.locks.read().clone()
    }

    pub fn clear(&self) {
        self.locks.write().clear();
    }

    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::types::{ColumnShape, TableShape};

    fn report(task: &str, source: &str, downstream: TableName) -> ChangeReport {
        let before = TableShape::new().with_column("id", ColumnShape::new("INT"));
        let after = before.clone().with_column("c1", ColumnShape::new("INT"));

        ChangeReport::new(
            task,
            source,
            TableName::new("db", "tbl"),
            downstream,
            vec!["ALTER TABLE bar ADD COLUMN c1 INT".to_string()],
            before,
            after,
        )
    }

    fn table_sets(task: &str, sources: &[&str]) -> Vec<TableSet> {
        sources
            .iter()
            .map(|source| {
                let mut table_set = TableSet::new(task, *source, BTreeMap::new());
                table_set.add_table("db", "tbl");
                table_set
            })
            .collect()
    }

    #[test]
    fn lock_id_quotes_the_downstream_table() {
        assert_eq!(
            lock_id("task", &TableName::new("foo", "bar")),
            "task-`foo`.`bar`"
        );
        assert_eq!(
            lock_id("task", &TableName::new("fo`o", "bar")),
            "task-`fo``o`.`bar`"
        );
    }

    #[test]
    fn synchronize_creates_and_reuses_locks() {
        let registry = LockRegistry::default();
        let sets = table_sets("task", &["source-a", "source-b"]);
        let first = report("task", "source-a", TableName::new("foo", "bar"));
        let second = report("task", "source-b", TableName::new("foo", "bar"));

        let (id, result) = registry.synchronize(&first, &sets);
        assert_eq!(result.unwrap(), first.ddls);
        let (same_id, result) = registry.synchronize(&second, &sets);
        assert_eq!(result.unwrap(), second.ddls);

        assert_eq!(id, same_id);
        assert_eq!(registry.len(), 1);

        let found = registry.find(&id).unwrap();
        let by_report = registry.find_by_report(&first).unwrap();
        assert!(Arc::ptr_eq(&found, &by_report));
        assert!(found.is_synced());
    }

    #[test]
    fn failed_synchronization_still_returns_the_lock_id() {
        let registry = LockRegistry::default();
        let report = report("task", "source-c", TableName::new("foo", "bar"));

        let (id, result) = registry.synchronize(&report, &table_sets("task", &["source-a"]));

        assert_eq!(id, "task-`foo`.`bar`");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::UnknownParticipant);
        assert!(registry.find(&id).is_some());
    }

    #[test]
    fn remove_reports_whether_the_lock_existed() {
        let registry = LockRegistry::default();
        let sets = table_sets("task", &["source-a"]);
        let (id, _) = registry.synchronize(
            &report("task", "source-a", TableName::new("foo", "bar")),
            &sets,
        );
        registry.synchronize(
            &report("task", "source-a", TableName::new("foo", "baz")),
            &sets,
        );

        assert!(!registry.remove("task-`foo`.`missing`"));
        assert_eq!(registry.len(), 2);
        assert!(registry.remove(&id));
        assert_eq!(registry.len(), 1);
        assert!(!registry.remove(&id));
    }

    #[test]
    fn snapshot_is_independent_of_the_registry() {
        let registry = LockRegistry::default();
        let sets = table_sets("task", &["source-a"]);
        registry.synchronize(
            &report("task", "source-a", TableName::new("foo", "bar")),
            &sets,
        );
        registry.synchronize(
            &report("other", "source-a", TableName::new("foo", "bar")),
            &table_sets("other", &["source-a"]),
        );

        let snapshot = registry.snapshot();
        registry.clear();

        assert_eq!(snapshot.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.find_by_task("task").is_empty());
    }

    #[test]
    fn locks_are_listed_per_task() {
        let registry = LockRegistry::default();
        let sets = table_sets("task", &["source-a"]);
        for table in ["bar", "baz"] {
            registry.synchronize(
                &report("task", "source-a", TableName::new("foo", table)),
                &sets,
            );
        }
        registry.synchronize(
            &report("other", "source-a", TableName::new("foo", "bar")),
            &table_sets("other", &["source-a"]),
        );

        assert_eq!(registry.find_by_task("task").len(), 2);
        assert_eq!(registry.find_by_task("other").len(), 1);
    }

    #[test]
    fn synchronize_with_refuses_a_second_downstream_table_of_a_task() {
        let registry = LockRegistry::default();
        let sets = table_sets("task", &["source-a", "source-b"]);

        let (bar, result) = registry.synchronize_with(
            &report("task", "source-a", TableName::new("foo", "bar")),
            || sets.clone(),
        );
        result.unwrap();

        let (baz, result) = registry.synchronize_with(
            &report("task", "source-b", TableName::new("foo", "baz")),
            || panic!("table sets are not listed for a refused report"),
        );

        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidData);
        assert!(registry.find(&baz).is_none());
        assert!(!registry.find(&bar).unwrap().ready()["source-b"]["db"]["tbl"]);
    }

    #[test]
    fn synchronize_with_aligns_the_task_locks_with_the_listed_table_sets() {
        let registry = LockRegistry::default();
        let first = report("task", "source-a", TableName::new("foo", "bar"));
        let (id, _) = registry.synchronize(&first, &table_sets("task", &["source-a", "source-b"]));
        let lock = registry.find(&id).unwrap();
        assert!(!lock.is_synced());

        let (_, result) = registry.synchronize_with(&first, || table_sets("task", &["source-a"]));

        assert_eq!(result.unwrap(), first.ddls);
        assert_eq!(lock.sources(), vec!["source-a"]);
        assert!(lock.is_synced());
    }

    #[test]
    fn remove_if_keeps_locks_failing_the_predicate() {
        let registry = LockRegistry::default();
        let sets = table_sets("task", &["source-a", "source-b"]);
        let (id, _) = registry.synchronize(
            &report("task", "source-a", TableName::new("foo", "bar")),
            &sets,
        );

        assert!(!registry.remove_if(&id, DdlLock::is_synced));
        assert!(registry.find(&id).is_some());
        assert!(!registry.remove_if("task-`foo`.`missing`", |_| true));

        registry.refresh_task("task", || table_sets("task", &["source-a"]));
        assert!(registry.remove_if(&id, DdlLock::is_synced));
        assert!(registry.is_empty());
    }

    #[test]
    fn sources_and_tables_leave_every_lock_of_the_task() {
        let registry = LockRegistry::default();
        let sets = table_sets("task", &["source-a", "source-b"]);
        let (id, _) = registry.synchronize(
            &report("task", "source-a", TableName::new("foo", "bar")),
            &sets,
        );

        assert_eq!(registry.remove_table("task", "source-b", "db", "tbl"), 1);
        assert_eq!(registry.remove_table("task", "source-b", "db", "tbl"), 0);
        assert_eq!(registry.remove_source("task", "source-a"), 1);
        assert_eq!(registry.remove_source("other", "source-a"), 0);
        assert!(registry.find(&id).unwrap().sources().is_empty());
    }
}
