use std::future::Future;

use crate::error::ShardDdlResult;

/// Store revision. Advances by one with every successful write transaction.
pub type Revision = i64;

/// A key with its value and the revision of its last write.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: Revision,
}

/// Result of a prefix read.
#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    /// Entries ordered by key.
    pub entries: Vec<KeyValue>,
    /// Store revision the entries were read at.
    pub revision: Revision,
}

/// Guard evaluated before the operations of a [`Txn`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Compare {
    /// The key was last written at the given revision, `0` meaning it does not exist.
    ModRevision { key: String, revision: Revision },
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl TxnOp {
    pub fn key(&self) -> &str {
        match self {
            TxnOp::Put { key, .. } | TxnOp::Delete { key } => key,
        }
    }
}

/// Conditional multi-key write.
///
/// Operations are applied together only if every compare holds.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub ops: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    pub fn put(mut self, key: String, value: Vec<u8>) -> Self {
        self.ops.push(TxnOp::Put { key, value });
        self
    }

    pub fn delete(mut self, key: String) -> Self {
        self.ops.push(TxnOp::Delete { key });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TxnResponse {
    /// Whether every compare held and the operations were applied.
    pub succeeded: bool,
    /// Store revision after the transaction.
    pub revision: Revision,
}

/// Strongly consistent key-value store with multi-key transactions.
///
/// Implementations must stamp every key written by one transaction with the same revision and
/// return, from reads, a revision no older than any entry they contain.
pub trait KvStore {
    /// Returns every entry whose key starts with `prefix`.
    fn range(&self, prefix: &str) -> impl Future<Output = ShardDdlResult<RangeResponse>> + Send;

    /// Applies `txn` atomically.
    ///
    /// A transaction without operations whose compares hold leaves the revision unchanged.
    fn txn(&self, txn: Txn) -> impl Future<Output = ShardDdlResult<TxnResponse>> + Send;
}
