use serde::{Deserialize, Serialize};

use crate::types::{TableName, TableShape};

/// One source's observation of a DDL applied to one upstream table.
///
/// Keyed by `(task, source, upstream.schema, upstream.name)`; a newer report for the same key
/// overwrites the previous one.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChangeReport {
    pub task: String,
    pub source: String,
    pub upstream: TableName,
    pub downstream: TableName,
    /// Statements in execution order.
    #[serde(default)]
    pub ddls: Vec<String>,
    #[serde(default)]
    pub shape_before: TableShape,
    #[serde(default)]
    pub shape_after: TableShape,
}

impl ChangeReport {
    pub fn new(
        task: impl Into<String>,
        source: impl Into<String>,
        upstream: TableName,
        downstream: TableName,
        ddls: Vec<String>,
        shape_before: TableShape,
        shape_after: TableShape,
    ) -> Self {
        Self {
            task: task.into(),
            source: source.into(),
            upstream,
            downstream,
            ddls,
            shape_before,
            shape_after,
        }
    }
}
