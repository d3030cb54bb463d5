use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::{ChangeReport, TableName};

/// Outcome classification of a synchronization attempt.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionConflict {
    /// The source may run the decision's DDLs downstream.
    Resolved,
    /// The reported shape cannot be joined with the lock's shape.
    IncompatibleSchema,
    /// The source dropped an element other sources still have.
    UnadoptedDrop,
    /// The reporting table is not a participant of the task.
    UnknownParticipant,
}

impl DecisionConflict {
    /// Classifies a synchronization error, returning `None` for errors that are not conflicts.
    pub fn from_error_kind(kind: ErrorKind) -> Option<Self> {
        match kind {
            ErrorKind::SchemaConflict => Some(DecisionConflict::IncompatibleSchema),
            ErrorKind::UnadoptedDrop => Some(DecisionConflict::UnadoptedDrop),
            ErrorKind::UnknownParticipant => Some(DecisionConflict::UnknownParticipant),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, DecisionConflict::Resolved)
    }
}

impl fmt::Display for DecisionConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecisionConflict::Resolved => "resolved",
            DecisionConflict::IncompatibleSchema => "incompatible_schema",
            DecisionConflict::UnadoptedDrop => "unadopted_drop",
            DecisionConflict::UnknownParticipant => "unknown_participant",
        };
        f.write_str(name)
    }
}

/// The coordinator's resolution for one source table.
///
/// Shares the key of the [`ChangeReport`] it answers and is overwritten on every cycle.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub task: String,
    pub source: String,
    pub upstream: TableName,
    /// Statements the source has to execute against the downstream table.
    #[serde(default)]
    pub ddls: Vec<String>,
    pub conflict: DecisionConflict,
    /// Set once the source confirmed it executed the statements.
    #[serde(default)]
    pub settled: bool,
}

impl Decision {
    /// Creates an unsettled decision answering `report`, with a fresh identifier.
    pub fn for_report(
        report: &ChangeReport,
        ddls: Vec<String>,
        conflict: DecisionConflict,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task: report.task.clone(),
            source: report.source.clone(),
            upstream: report.upstream.clone(),
            ddls,
            conflict,
            settled: false,
        }
    }

    /// Returns a copy marked as executed by the source.
    pub fn settle(&self) -> Self {
        Self {
            settled: true,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TableShape;

    #[test]
    fn settled_copy_keeps_the_identity() {
        let report = ChangeReport::new(
            "task",
            "mysql-replica-1",
            TableName::new("foo-1", "bar-1"),
            TableName::new("foo", "bar"),
            vec!["ALTER TABLE bar ADD COLUMN c1 INT".to_string()],
            TableShape::new(),
            TableShape::new(),
        );

        let decision =
            Decision::for_report(&report, report.ddls.clone(), DecisionConflict::Resolved);
        let settled = decision.settle();

        assert_eq!(decision.upstream, report.upstream);
        assert!(!decision.settled);
        assert!(settled.settled);
        assert_eq!(settled.id, decision.id);
    }

    #[test]
    fn conflict_kinds_are_classified() {
        assert_eq!(
            DecisionConflict::from_error_kind(ErrorKind::UnadoptedDrop),
            Some(DecisionConflict::UnadoptedDrop)
        );
        assert_eq!(
            DecisionConflict::from_error_kind(ErrorKind::UnknownParticipant),
            Some(DecisionConflict::UnknownParticipant)
        );
        assert_eq!(
            DecisionConflict::from_error_kind(ErrorKind::StoreUnavailable),
            None
        );
    }

    #[test]
    fn conflict_serializes_in_snake_case() {
        let rendered = serde_json::to_string(&DecisionConflict::IncompatibleSchema).unwrap();

        assert_eq!(rendered, "\"incompatible_schema\"");
        assert_eq!(
            DecisionConflict::IncompatibleSchema.to_string(),
            "incompatible_schema"
        );
    }
}
