use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use parking_lot::Mutex;
use shardddl_config::shared::{
    CoordinatorConfig, DestructiveChangePolicy, UnknownParticipantPolicy,
};
use tracing::{debug, info, warn};

use crate::bail;
use crate::error::{ErrorKind, ShardDdlResult};
use crate::types::{ShapeElement, TableName, TableShape, TableSet};

/// Shapes by source, upstream schema and upstream table.
type TableShapes = BTreeMap<String, BTreeMap<String, BTreeMap<String, TableShape>>>;

/// Listed upstream tables by source and schema.
type Participants<'a> = BTreeMap<&'a str, BTreeMap<&'a str, BTreeSet<&'a str>>>;

/// Reconciliation flags by source, upstream schema and upstream table.
pub type ReadyMap = BTreeMap<String, BTreeMap<String, BTreeMap<String, bool>>>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LockStatus {
    /// At least one participating table has not caught up with the joined shape.
    Pending,
    /// Every participating table has the joined shape.
    Synchronized,
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockStatus::Pending => f.write_str("pending"),
            LockStatus::Synchronized => f.write_str("synchronized"),
        }
    }
}

#[derive(Debug)]
struct LockState {
    /// Shape the downstream table is agreed to have.
    joined: TableShape,
    /// Last shape reported, or seeded, for every participating upstream table.
    tables: TableShapes,
}

impl LockState {
    fn shape(&self, source: &str, schema: &str, table: &str) -> Option<&TableShape> {
        self.tables.get(source)?.get(schema)?.get(table)
    }

    fn set_shape(&mut self, source: &str, schema: &str, table: &str, shape: TableShape) {
        self.tables
            .entry(source.to_string())
            .or_default()
            .entry(schema.to_string())
            .or_default()
            .insert(table.to_string(), shape);
    }

    fn shapes(&self) -> impl Iterator<Item = (&str, &str, &str, &TableShape)> {
        self.tables.iter().flat_map(|(source, schemas)| {
            schemas.iter().flat_map(move |(schema, tables)| {
                tables.iter().map(move |(table, shape)| {
                    (source.as_str(), schema.as_str(), table.as_str(), shape)
                })
            })
        })
    }

    /// Adds the listed tables the lock does not know yet, seeded with the joined shape.
    fn admit(&mut self, participants: &Participants<'_>) {
        for (source, schemas) in participants {
            for (schema, tables) in schemas {
                for table in tables {
                    if self.shape(source, schema, table).is_none() {
                        let joined = self.joined.clone();
                        self.set_shape(source, schema, table, joined);
                    }
                }
            }
        }
    }

    /// Forgets the tables missing from `participants`.
    fn retain(&mut self, participants: &Participants<'_>) {
        for (source, schemas) in self.tables.iter_mut() {
            let listed_schemas = participants.get(source.as_str());
            for (schema, tables) in schemas.iter_mut() {
                let listed = listed_schemas.and_then(|schemas| schemas.get(schema.as_str()));
                tables.retain(|table, _| {
                    listed.is_some_and(|listed| listed.contains(table.as_str()))
                });
            }
            schemas.retain(|_, tables| !tables.is_empty());
        }
        self.tables.retain(|_, schemas| !schemas.is_empty());
    }

    fn is_synced(&self) -> bool {
        self.shapes().all(|(_, _, _, shape)| *shape == self.joined)
    }
}

/// Coordinates the schema changes of every upstream table merged into one downstream table.
///
/// The lock keeps the joined shape of the downstream table and the last known shape of each
/// participating upstream table. A table is reconciled once its shape equals the joined shape;
/// the lock is synchronized when all of them are.
///
/// Locks are held only in memory. Replaying the stored change reports rebuilds them.
#[derive(Debug)]
pub struct DdlLock {
    id: String,
    task: String,
    downstream: TableName,
    options: CoordinatorConfig,
    state: Mutex<LockState>,
}

impl DdlLock {
    /// Creates a lock whose joined shape is `joined`.
    ///
    /// Every table of the task's `table_sets` participates from the start with that shape.
    pub fn new(
        id: String,
        task: String,
        downstream: TableName,
        joined: TableShape,
        table_sets: &[TableSet],
        options: CoordinatorConfig,
    ) -> Self {
        let mut state = LockState {
            joined,
            tables: TableShapes::new(),
        };
        state.admit(&participants(&task, table_sets));

        info!(lock_id = %id, %task, %downstream, "created ddl lock");

        Self {
            id,
            task,
            downstream,
            options,
            state: Mutex::new(state),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn downstream(&self) -> &TableName {
        &self.downstream
    }

    /// Ingests a schema change of one upstream table.
    ///
    /// Tables listed in `table_sets` that the lock does not know yet join as participants.
    /// Tables are only dropped through [`DdlLock::refresh`] and the removal methods.
    ///
    /// Returns the statements the reporting source has to run against the downstream table.
    /// Fails with [`ErrorKind::UnknownParticipant`], [`ErrorKind::SchemaConflict`] or
    /// [`ErrorKind::UnadoptedDrop`] without touching the joined shape.
    pub fn try_sync(
        &self,
        source: &str,
        upstream: &TableName,
        ddls: &[String],
        shape_after: &TableShape,
        table_sets: &[TableSet],
    ) -> ShardDdlResult<Vec<String>> {
        let mut state = self.state.lock();
        state.admit(&participants(&self.task, table_sets));

        let prior = match state.shape(source, &upstream.schema, &upstream.name) {
            Some(shape) => shape.clone(),
            None => match self.options.unknown_participant {
                UnknownParticipantPolicy::Reject => {
                    warn!(
                        lock_id = %self.id,
                        %source,
                        %upstream,
                        "rejected report from unknown participant"
                    );
                    bail!(
                        ErrorKind::UnknownParticipant,
                        "Reporting table does not participate in the task",
                        format!(
                            "table {upstream} of source `{source}` is not listed for task `{}`",
                            self.task
                        )
                    );
                }
                UnknownParticipantPolicy::Admit => state.joined.clone(),
            },
        };

        let mut candidate = shape_after.clone();
        for (other_source, schema, table, shape) in state.shapes() {
            if other_source == source && schema == upstream.schema && table == upstream.name {
                continue;
            }

            candidate = match candidate.join(shape) {
                Ok(joined) => joined,
                Err(conflict) => {
                    warn!(lock_id = %self.id, %source, %upstream, %conflict, "schema conflict");
                    bail!(
                        ErrorKind::SchemaConflict,
                        "Reported shape conflicts with another table of the lock",
                        format!(
                            "{conflict} (reported by table {upstream} of source `{source}`, \
                             other definition from table {schema}.{table} of source \
                             `{other_source}`)"
                        )
                    );
                }
            };
        }

        let unadopted: Vec<ShapeElement> = prior
            .missing_from(shape_after)
            .into_iter()
            .filter(|element| candidate.has(element))
            .collect();

        let mut forwarded = ddls.to_vec();
        if !unadopted.is_empty() {
            let elements = unadopted
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");

            match self.options.destructive_changes {
                DestructiveChangePolicy::Reject => {
                    warn!(
                        lock_id = %self.id,
                        %source,
                        %upstream,
                        %elements,
                        "rejected drop of elements other tables still have"
                    );
                    bail!(
                        ErrorKind::UnadoptedDrop,
                        "Dropped elements are still present in other tables",
                        format!(
                            "table {upstream} of source `{source}` dropped {elements} which \
                             other tables of lock `{}` still have",
                            self.id
                        )
                    );
                }
                DestructiveChangePolicy::Defer => {
                    debug!(
                        lock_id = %self.id,
                        %source,
                        %upstream,
                        %elements,
                        "deferring drop until every table adopted it"
                    );
                    forwarded.clear();
                }
            }
        }

        state.set_shape(source, &upstream.schema, &upstream.name, shape_after.clone());
        if candidate != state.joined {
            info!(lock_id = %self.id, %source, %upstream, "advanced joined shape");
            state.joined = candidate;
        }

        debug!(
            lock_id = %self.id,
            %source,
            %upstream,
            ddls = forwarded.len(),
            synced = state.is_synced(),
            "synchronized table"
        );

        Ok(forwarded)
    }

    pub fn status(&self) -> LockStatus {
        if self.is_synced() {
            LockStatus::Synchronized
        } else {
            LockStatus::Pending
        }
    }

    /// Returns whether every participating table has the joined shape.
    pub fn is_synced(&self) -> bool {
        self.state.lock().is_synced()
    }

    pub fn joined(&self) -> TableShape {
        self.state.lock().joined.clone()
    }

    /// Returns the reconciliation flag of every participating table.
    pub fn ready(&self) -> ReadyMap {
        let state = self.state.lock();

        let mut ready = ReadyMap::new();
        for (source, schema, table, shape) in state.shapes() {
            ready
                .entry(source.to_string())
                .or_default()
                .entry(schema.to_string())
                .or_default()
                .insert(table.to_string(), *shape == state.joined);
        }

        ready
    }

    /// Returns whether the upstream table participates in the lock.
    pub fn has_table(&self, source: &str, schema: &str, table: &str) -> bool {
        self.state.lock().shape(source, schema, table).is_some()
    }

    /// Aligns the participating tables with `table_sets`: listed tables are added with the
    /// joined shape and unlisted ones are forgotten.
    pub fn refresh(&self, table_sets: &[TableSet]) {
        let participants = participants(&self.task, table_sets);

        let mut state = self.state.lock();
        state.admit(&participants);
        state.retain(&participants);
    }

    /// Returns the participating sources in name order.
    pub fn sources(&self) -> Vec<String> {
        self.state.lock().tables.keys().cloned().collect()
    }

    /// Forgets every table of `source`, returning whether it participated.
    pub fn remove_source(&self, source: &str) -> bool {
        let removed = self.state.lock().tables.remove(source).is_some();
        if removed {
            info!(lock_id = %self.id, %source, "removed source from ddl lock");
        }

        removed
    }

    /// Forgets one upstream table, returning whether it participated.
    pub fn remove_table(&self, source: &str, schema: &str, table: &str) -> bool {
        let mut state = self.state.lock();

        let Some(schemas) = state.tables.get_mut(source) else {
            return false;
        };
        let Some(tables) = schemas.get_mut(schema) else {
            return false;
        };
        if tables.remove(table).is_none() {
            return false;
        }

        if tables.is_empty() {
            schemas.remove(schema);
        }
        if schemas.is_empty() {
            state.tables.remove(source);
        }

        true
    }
}

/// Upstream tables of `task` listed in live table sets.
fn participants<'a>(task: &str, table_sets: &'a [TableSet]) -> Participants<'a> {
    let mut participants = Participants::new();
    for table_set in table_sets
        .iter()
        .filter(|table_set| table_set.task == task && !table_set.is_deleted)
    {
        for (schema, table) in table_set.iter_tables() {
            participants
                .entry(table_set.source.as_str())
                .or_default()
                .entry(schema)
                .or_default()
                .insert(table);
        }
    }

    participants
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::types::ColumnShape;

    const TASK: &str = "task";

    fn base() -> TableShape {
        TableShape::new().with_column("id", ColumnShape::new("INT").not_null())
    }

    fn with_c1(typ: &str) -> TableShape {
        base().with_column("c1", ColumnShape::new(typ))
    }

    fn table_set(source: &str, tables: &[(&str, &str)]) -> TableSet {
        let mut table_set = TableSet::new(TASK, source, BTreeMap::new());
        for (schema, table) in tables {
            table_set.add_table(schema, table);
        }
        table_set
    }

    fn two_sources() -> Vec<TableSet> {
        vec![
            table_set("source-a", &[("db", "tbl")]),
            table_set("source-b", &[("db", "tbl")]),
        ]
    }

    fn lock(options: CoordinatorConfig, joined: TableShape, table_sets: &[TableSet]) -> DdlLock {
        DdlLock::new(
            "task-`foo`.`bar`".to_string(),
            TASK.to_string(),
            TableName::new("foo", "bar"),
            joined,
            table_sets,
            options,
        )
    }

    fn ddl(statement: &str) -> Vec<String> {
        vec![statement.to_string()]
    }

    #[test]
    fn new_lock_starts_synchronized() {
        let lock = lock(CoordinatorConfig::default(), base(), &two_sources());

        assert_eq!(lock.status(), LockStatus::Synchronized);
        assert_eq!(lock.sources(), vec!["source-a", "source-b"]);
    }

    #[test]
    fn added_column_advances_joined_shape_and_leaves_others_pending() {
        let table_sets = two_sources();
        let lock = lock(CoordinatorConfig::default(), base(), &table_sets);
        let upstream = TableName::new("db", "tbl");
        let add = ddl("ALTER TABLE bar ADD COLUMN c1 INT");

        let ddls = lock
            .try_sync("source-a", &upstream, &add, &with_c1("INT"), &table_sets)
            .unwrap();

        assert_eq!(ddls, add);
        assert_eq!(lock.joined(), with_c1("INT"));
        assert_eq!(lock.status(), LockStatus::Pending);
        assert!(lock.ready()["source-a"]["db"]["tbl"]);
        assert!(!lock.ready()["source-b"]["db"]["tbl"]);

        let ddls = lock
            .try_sync("source-b", &upstream, &add, &with_c1("INT"), &table_sets)
            .unwrap();

        assert_eq!(ddls, add);
        assert_eq!(lock.status(), LockStatus::Synchronized);
    }

    #[test]
    fn conflicting_column_leaves_joined_shape_unchanged() {
        let table_sets = two_sources();
        let lock = lock(CoordinatorConfig::default(), base(), &table_sets);
        let upstream = TableName::new("db", "tbl");

        lock.try_sync(
            "source-a",
            &upstream,
            &ddl("ALTER TABLE bar ADD COLUMN c1 INT"),
            &with_c1("INT"),
            &table_sets,
        )
        .unwrap();
        let err = lock
            .try_sync(
                "source-b",
                &upstream,
                &ddl("ALTER TABLE bar ADD COLUMN c1 VARCHAR(20)"),
                &with_c1("VARCHAR(20)"),
                &table_sets,
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SchemaConflict);
        assert_eq!(lock.joined(), with_c1("INT"));
        assert!(!lock.ready()["source-b"]["db"]["tbl"]);
    }

    #[test]
    fn unknown_participant_is_rejected_by_default() {
        let table_sets = vec![table_set("source-a", &[("db", "tbl")])];
        let lock = lock(CoordinatorConfig::default(), base(), &table_sets);

        let err = lock
            .try_sync(
                "source-b",
                &TableName::new("db", "tbl"),
                &ddl("ALTER TABLE bar ADD COLUMN c1 INT"),
                &with_c1("INT"),
                &table_sets,
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnknownParticipant);
        assert_eq!(lock.joined(), base());
    }

    #[test]
    fn unknown_participant_is_admitted_when_configured() {
        let options = CoordinatorConfig {
            unknown_participant: UnknownParticipantPolicy::Admit,
            ..CoordinatorConfig::default()
        };
        let table_sets = vec![table_set("source-a", &[("db", "tbl")])];
        let lock = lock(options, base(), &table_sets);

        let ddls = lock
            .try_sync(
                "source-b",
                &TableName::new("db", "tbl"),
                &ddl("ALTER TABLE bar ADD COLUMN c1 INT"),
                &with_c1("INT"),
                &table_sets,
            )
            .unwrap();

        assert_eq!(ddls.len(), 1);
        assert_eq!(lock.sources(), vec!["source-a", "source-b"]);
        assert_eq!(lock.status(), LockStatus::Pending);
    }

    #[test]
    fn drop_not_adopted_by_others_is_rejected_by_default() {
        let table_sets = two_sources();
        let lock = lock(CoordinatorConfig::default(), with_c1("INT"), &table_sets);

        let err = lock
            .try_sync(
                "source-a",
                &TableName::new("db", "tbl"),
                &ddl("ALTER TABLE bar DROP COLUMN c1"),
                &base(),
                &table_sets,
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnadoptedDrop);
        assert_eq!(lock.joined(), with_c1("INT"));
        assert_eq!(lock.status(), LockStatus::Synchronized);
    }

    #[test]
    fn deferred_drop_is_forwarded_by_the_last_holder() {
        let options = CoordinatorConfig {
            destructive_changes: DestructiveChangePolicy::Defer,
            ..CoordinatorConfig::default()
        };
        let table_sets = two_sources();
        let lock = lock(options, with_c1("INT"), &table_sets);
        let upstream = TableName::new("db", "tbl");
        let drop = ddl("ALTER TABLE bar DROP COLUMN c1");

        let ddls = lock
            .try_sync("source-a", &upstream, &drop, &base(), &table_sets)
            .unwrap();
        assert!(ddls.is_empty());
        assert_eq!(lock.joined(), with_c1("INT"));
        assert_eq!(lock.status(), LockStatus::Pending);

        let ddls = lock
            .try_sync("source-b", &upstream, &drop, &base(), &table_sets)
            .unwrap();
        assert_eq!(ddls, drop);
        assert_eq!(lock.joined(), base());
        assert_eq!(lock.status(), LockStatus::Synchronized);
    }

    #[test]
    fn removed_participants_no_longer_block_synchronization() {
        let table_sets = two_sources();
        let lock = lock(CoordinatorConfig::default(), base(), &table_sets);
        let upstream = TableName::new("db", "tbl");

        lock.try_sync(
            "source-a",
            &upstream,
            &ddl("ALTER TABLE bar ADD COLUMN c1 INT"),
            &with_c1("INT"),
            &table_sets,
        )
        .unwrap();
        assert_eq!(lock.status(), LockStatus::Pending);

        assert!(lock.remove_table("source-b", "db", "tbl"));
        assert!(!lock.remove_table("source-b", "db", "tbl"));
        assert_eq!(lock.sources(), vec!["source-a"]);
        assert_eq!(lock.status(), LockStatus::Synchronized);
        assert!(!lock.remove_source("source-b"));
        assert!(lock.remove_source("source-a"));
    }

    #[test]
    fn sync_admits_listed_tables_and_refresh_prunes_unlisted_ones() {
        let lock = lock(CoordinatorConfig::default(), base(), &two_sources());
        let table_sets = vec![
            table_set("source-a", &[("db", "tbl")]),
            TableSet::tombstone(TASK, "source-b"),
            table_set("source-c", &[("db", "tbl")]),
        ];

        lock.try_sync(
            "source-a",
            &TableName::new("db", "tbl"),
            &[],
            &base(),
            &table_sets,
        )
        .unwrap();
        assert_eq!(lock.sources(), vec!["source-a", "source-b", "source-c"]);

        lock.refresh(&table_sets);
        assert_eq!(lock.sources(), vec!["source-a", "source-c"]);
        assert!(lock.has_table("source-c", "db", "tbl"));
        assert!(!lock.has_table("source-b", "db", "tbl"));
    }

    #[test]
    fn refresh_seeds_new_tables_with_the_joined_shape() {
        let lock = lock(CoordinatorConfig::default(), with_c1("INT"), &two_sources());

        let mut table_sets = two_sources();
        table_sets[1].add_table("db", "tbl_2");
        lock.refresh(&table_sets);

        assert!(lock.ready()["source-b"]["db"]["tbl_2"]);
        assert_eq!(lock.status(), LockStatus::Synchronized);
    }
}
