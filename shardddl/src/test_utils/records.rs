use std::collections::BTreeMap;

use crate::types::{ChangeReport, TableName, TableSet, TableShape};

/// Downstream table every test report is merged into.
pub const DOWNSTREAM_SCHEMA: &str = "foo";
pub const DOWNSTREAM_TABLE: &str = "bar";

pub fn downstream() -> TableName {
    TableName::new(DOWNSTREAM_SCHEMA, DOWNSTREAM_TABLE)
}

/// Creates a table set listing `tables` as `(schema, table)` pairs.
pub fn table_set(task: &str, source: &str, tables: &[(&str, &str)]) -> TableSet {
    let mut table_set = TableSet::new(task, source, BTreeMap::new());
    for (schema, table) in tables {
        table_set.add_table(schema, table);
    }

    table_set
}

/// Creates a report of `upstream` merged into [`downstream`].
pub fn report(
    task: &str,
    source: &str,
    upstream: (&str, &str),
    ddls: Vec<String>,
    shape_before: TableShape,
    shape_after: TableShape,
) -> ChangeReport {
    ChangeReport::new(
        task,
        source,
        TableName::new(upstream.0, upstream.1),
        downstream(),
        ddls,
        shape_before,
        shape_after,
    )
}

/// Renders the statement adding `column` to the downstream table.
pub fn add_column_ddl(column: &str, typ: &str) -> String {
    format!("ALTER TABLE `{DOWNSTREAM_SCHEMA}`.`{DOWNSTREAM_TABLE}` ADD COLUMN `{column}` {typ}")
}

/// Renders the statement dropping `column` from the downstream table.
pub fn drop_column_ddl(column: &str) -> String {
    format!("ALTER TABLE `{DOWNSTREAM_SCHEMA}`.`{DOWNSTREAM_TABLE}` DROP COLUMN `{column}`")
}
