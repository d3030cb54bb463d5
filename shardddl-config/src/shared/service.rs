use serde::Deserialize;

use crate::load::Config;
use crate::shared::{CoordinationStoreConfig, CoordinatorConfig, ValidationError};

/// Top-level configuration of the coordinator service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub store: CoordinationStoreConfig,
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.store.validate()
    }
}

impl Config for ServiceConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::DestructiveChangePolicy;

    #[test]
    fn deserializes_postgres_store() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{
                "coordinator": {"destructive_changes": "defer"},
                "store": {"postgres": {
                    "host": "localhost",
                    "port": 5432,
                    "name": "coordination",
                    "username": "postgres",
                    "password": null
                }}
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.coordinator.destructive_changes,
            DestructiveChangePolicy::Defer
        );
        let CoordinationStoreConfig::Postgres(connection) = &config.store else {
            panic!("expected a postgres store");
        };
        assert_eq!(connection.max_connections, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults_to_memory_store() {
        let config: ServiceConfig = serde_json::from_str("{}").unwrap();

        assert!(matches!(config.store, CoordinationStoreConfig::Memory));
    }
}
