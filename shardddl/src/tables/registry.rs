use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::store::TableSetMap;
use crate::types::TableSet;

/// In-memory index of the table sets by task and source.
///
/// Mirrors the table sets kept in the coordination store. Callers write to the store first
/// and apply the same change here once the write succeeded.
#[derive(Debug, Default)]
pub struct TableRegistry {
    tables: RwLock<HashMap<String, HashMap<String, TableSet>>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole content with `table_sets`, as read from the store.
    pub fn reinitialize(&self, table_sets: TableSetMap) {
        let tables = table_sets
            .into_iter()
            .map(|(task, sources)| (task, sources.into_iter().collect()))
            .collect();

        *self.tables.write() = tables;
    }

    /// Stores `table_set`, or removes its entry when it is a tombstone.
    ///
    /// Returns whether anything was stored or removed.
    pub fn apply(&self, table_set: TableSet) -> bool {
        let mut tables = self.tables.write();

        if table_set.is_deleted {
            let Some(sources) = tables.get_mut(&table_set.task) else {
                return false;
            };

            let removed = sources.remove(&table_set.source).is_some();
            if removed {
                debug!(task = %table_set.task, source = %table_set.source, "removed table set");
            }

            return removed;
        }

        tables
            .entry(table_set.task.clone())
            .or_default()
            .insert(table_set.source.clone(), table_set);

        true
    }

    /// Adds a table to a source of an already known task.
    ///
    /// Returns `false` for unknown tasks and for tables that are already listed.
    pub fn add_table(&self, task: &str, source: &str, schema: &str, table: &str) -> bool {
        let mut tables = self.tables.write();

        let Some(sources) = tables.get_mut(task) else {
            return false;
        };

        sources
            .entry(source.to_string())
            .or_insert_with(|| TableSet::new(task, source, Default::default()))
            .add_table(schema, table)
    }

    /// Removes a table, returning `false` if the task, source or table is unknown.
    pub fn remove_table(&self, task: &str, source: &str, schema: &str, table: &str) -> bool {
        let mut tables = self.tables.write();

        let Some(table_set) = tables
            .get_mut(task)
            .and_then(|sources| sources.get_mut(source))
        else {
            return false;
        };

        table_set.remove_table(schema, table)
    }

    /// Returns the table set of `(task, source)`, if any.
    pub fn get(&self, task: &str, source: &str) -> Option<TableSet> {
        self.tables.read().get(task)?.get(source).cloned()
    }

    /// Returns the table sets of `task` ordered by source.
    pub fn list_for_task(&self, task: &str) -> Vec<TableSet> {
        let mut table_sets: Vec<TableSet> = {
            let tables = self.tables.read();
            let Some(sources) = tables.get(task) else {
                return vec![];
            };
            sources.values().cloned().collect()
        };

        table_sets.sort_by(|a, b| a.source.cmp(&b.source));

        table_sets
    }

    pub fn tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = self.tables.read().keys().cloned().collect();
        tasks.sort();

        tasks
    }
}
