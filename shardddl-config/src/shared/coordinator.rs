use serde::{Deserialize, Serialize};

/// How a DDL lock treats a report from an upstream table that is not listed in the task's
/// table sets.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UnknownParticipantPolicy {
    /// Fail the synchronization with an unknown participant error.
    #[default]
    Reject,
    /// Seed the table with the lock's joined shape and synchronize it as a pending participant.
    Admit,
}

/// How a DDL lock treats a source dropping a column or index that other sources still have.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DestructiveChangePolicy {
    /// Fail the synchronization with an unadopted drop error until the operator intervenes.
    #[default]
    Reject,
    /// Record the drop and hand out no DDL until the last holder drops the element too.
    Defer,
}

/// Policies applied by every DDL lock of a coordinator.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub unknown_participant: UnknownParticipantPolicy,
    #[serde(default)]
    pub destructive_changes: DestructiveChangePolicy,
}
