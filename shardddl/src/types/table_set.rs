use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Upstream tables feeding a task from one source.
///
/// Keyed by `(task, source)`. A tombstoned set marks the source as removed from the task.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableSet {
    pub task: String,
    pub source: String,
    /// Schema name to table names. Empty when no table is routed, never absent.
    #[serde(default)]
    pub tables: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl TableSet {
    pub fn new(
        task: impl Into<String>,
        source: impl Into<String>,
        tables: BTreeMap<String, BTreeSet<String>>,
    ) -> Self {
        Self {
            task: task.into(),
            source: source.into(),
            tables,
            is_deleted: false,
        }
    }

    /// Creates the deletion marker for `(task, source)`.
    pub fn tombstone(task: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            source: source.into(),
            tables: BTreeMap::new(),
            is_deleted: true,
        }
    }

    /// Adds a table, returning `false` if it was already listed.
    pub fn add_table(&mut self, schema: &str, table: &str) -> bool {
        self.tables
            .entry(schema.to_string())
            .or_default()
            .insert(table.to_string())
    }

    /// Removes a table, returning `false` if it was not listed.
    ///
    /// The schema entry is dropped together with its last table.
    pub fn remove_table(&mut self, schema: &str, table: &str) -> bool {
        let Some(tables) = self.tables.get_mut(schema) else {
            return false;
        };

        if !tables.remove(table) {
            return false;
        }

        if tables.is_empty() {
            self.tables.remove(schema);
        }

        true
    }

    pub fn contains(&self, schema: &str, table: &str) -> bool {
        self.tables
            .get(schema)
            .is_some_and(|tables| tables.contains(table))
    }

    /// Iterates over `(schema, table)` pairs in name order.
    pub fn iter_tables(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tables.iter().flat_map(|(schema, tables)| {
            tables
                .iter()
                .map(move |table| (schema.as_str(), table.as_str()))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_report_whether_anything_changed() {
        let mut table_set = TableSet::new("task", "mysql-replica-1", BTreeMap::new());

        assert!(table_set.add_table("db", "tbl_1"));
        assert!(!table_set.add_table("db", "tbl_1"));
        assert!(table_set.add_table("db", "tbl_2"));
        assert!(table_set.contains("db", "tbl_1"));

        assert!(table_set.remove_table("db", "tbl_1"));
        assert!(!table_set.remove_table("db", "tbl_1"));
        assert!(!table_set.remove_table("other", "tbl_2"));
        assert!(table_set.remove_table("db", "tbl_2"));

        assert!(table_set.is_empty());
        assert!(!table_set.tables.contains_key("db"));
    }

    #[test]
    fn tables_are_iterated_in_name_order() {
        let mut table_set = TableSet::new("task", "mysql-replica-1", BTreeMap::new());
        table_set.add_table("db_2", "b");
        table_set.add_table("db_1", "z");
        table_set.add_table("db_2", "a");

        let tables: Vec<_> = table_set.iter_tables().collect();

        assert_eq!(tables, vec![("db_1", "z"), ("db_2", "a"), ("db_2", "b")]);
    }

    #[test]
    fn missing_tables_deserialize_as_empty_mapping() {
        let table_set: TableSet =
            serde_json::from_str(r#"{"task": "task", "source": "mysql-replica-1"}"#).unwrap();

        assert!(table_set.tables.is_empty());
        assert!(!table_set.is_deleted);

        let tombstone = TableSet::tombstone("task", "mysql-replica-1");
        let rendered = serde_json::to_string(&tombstone).unwrap();
        assert!(rendered.contains("\"tables\":{}"));
    }
}
