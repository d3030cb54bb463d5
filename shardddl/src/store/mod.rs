//! Persistence of coordination records.
//!
//! [`KvStore`] is the seam to the transactional key-value backend; [`CoordinationStore`] maps
//! the coordination records onto it.

mod coordination;
mod keys;
mod kv;
mod memory;
mod postgres;

pub use coordination::{
    CoordinationStore, DecisionMap, DecisionWrite, DownstreamRecords, ReportMap, TableSetMap,
    Versioned,
};
pub use keys::{KeyAdapter, DECISION_PREFIX, REPORT_PREFIX, TABLE_SET_PREFIX};
pub use kv::{Compare, KeyValue, KvStore, RangeResponse, Revision, Txn, TxnOp, TxnResponse};
pub use memory::MemoryKv;
pub use postgres::PostgresKv;
