use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::ShardDdlResult;
use crate::store::kv::{
    Compare, KeyValue, KvStore, RangeResponse, Revision, Txn, TxnOp, TxnResponse,
};

#[derive(Debug, Default)]
struct Inner {
    /// Value and last write revision by key.
    entries: BTreeMap<String, (Vec<u8>, Revision)>,
    revision: Revision,
}

impl Inner {
    fn mod_revision(&self, key: &str) -> Revision {
        self.entries
            .get(key)
            .map(|(_, revision)| *revision)
            .unwrap_or(0)
    }
}

/// In-process [`KvStore`] keeping every entry in memory.
///
/// Suited for tests and development. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current store revision.
    pub async fn revision(&self) -> Revision {
        self.inner.lock().await.revision
    }
}

impl KvStore for MemoryKv {
    async fn range(&self, prefix: &str) -> ShardDdlResult<RangeResponse> {
        let inner = self.inner.lock().await;

        let entries = inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, mod_revision))| KeyValue {
                key: key.clone(),
                value: value.clone(),
                mod_revision: *mod_revision,
            })
            .collect();

        Ok(RangeResponse {
            entries,
            revision: inner.revision,
        })
    }

    async fn txn(&self, txn: Txn) -> ShardDdlResult<TxnResponse> {
        let mut inner = self.inner.lock().await;

        let holds = txn.compares.iter().all(|compare| match compare {
            Compare::ModRevision { key, revision } => inner.mod_revision(key) == *revision,
        });

        if !holds {
            return Ok(TxnResponse {
                succeeded: false,
                revision: inner.revision,
            });
        }

        if txn.ops.is_empty() {
            return Ok(TxnResponse {
                succeeded: true,
                revision: inner.revision,
            });
        }

        inner.revision += 1;
        let revision = inner.revision;
        for op in txn.ops {
            match op {
                TxnOp::Put { key, value } => {
                    inner.entries.insert(key, (value, revision));
                }
                TxnOp::Delete { key } => {
                    inner.entries.remove(&key);
                }
            }
        }

        Ok(TxnResponse {
            succeeded: true,
            revision,
        })
    }
}
