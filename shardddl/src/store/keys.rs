use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::bail;
use crate::error::{ErrorKind, ShardDdlResult};

/// Change reports, keyed by task, source, upstream schema and upstream table.
pub const REPORT_PREFIX: KeyAdapter = KeyAdapter::new("/shardddl/optimism/info/", 4);

/// Decisions, keyed like change reports.
pub const DECISION_PREFIX: KeyAdapter = KeyAdapter::new("/shardddl/optimism/operation/", 4);

/// Table sets, keyed by task and source.
pub const TABLE_SET_PREFIX: KeyAdapter = KeyAdapter::new("/shardddl/optimism/source-tables/", 2);

/// Maps name components onto keys below a fixed prefix.
///
/// Components are encoded as URL-safe base64 without padding, so names containing `/` cannot
/// alias each other.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KeyAdapter {
    prefix: &'static str,
    components: usize,
}

impl KeyAdapter {
    const fn new(prefix: &'static str, components: usize) -> Self {
        Self { prefix, components }
    }

    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    /// Builds the key for the given components.
    ///
    /// Passing fewer components than the adapter's key length yields a prefix selecting every
    /// key below them.
    pub fn encode(&self, components: &[&str]) -> String {
        let mut key = String::from(self.prefix);
        for (i, component) in components.iter().enumerate() {
            if i > 0 {
                key.push('/');
            }
            URL_SAFE_NO_PAD.encode_string(component, &mut key);
        }
        if components.len() < self.components && !components.is_empty() {
            key.push('/');
        }

        key
    }

    /// Splits a full key back into its components.
    pub fn decode(&self, key: &str) -> ShardDdlResult<Vec<String>> {
        let Some(rest) = key.strip_prefix(self.prefix) else {
            bail!(
                ErrorKind::InvalidKey,
                "Key does not belong to the expected prefix",
                format!("key `{key}` is not below `{}`", self.prefix)
            );
        };

        let components = rest
            .split('/')
            .map(|component| {
                let bytes = URL_SAFE_NO_PAD.decode(component)?;
                Ok(String::from_utf8(bytes)?)
            })
            .collect::<ShardDdlResult<Vec<_>>>()?;

        if components.len() != self.components {
            bail!(
                ErrorKind::InvalidKey,
                "Key has an unexpected number of components",
                format!(
                    "key `{key}` has {} components, expected {}",
                    components.len(),
                    self.components
                )
            );
        }

        Ok(components)
    }
}
