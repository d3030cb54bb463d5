use serde::Deserialize;

use crate::shared::{PgConnectionConfig, ValidationError};

/// Backend holding change reports, decisions and table sets.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationStoreConfig {
    /// In-process store, lost on restart.
    #[default]
    Memory,
    /// Postgres-backed store.
    Postgres(PgConnectionConfig),
}

impl CoordinationStoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            CoordinationStoreConfig::Memory => Ok(()),
            CoordinationStoreConfig::Postgres(connection) => connection.validate(),
        }
    }
}
