//! Per downstream table DDL locks and the registry indexing them.

mod ddl_lock;
mod registry;

pub use ddl_lock::{DdlLock, LockStatus, ReadyMap};
pub use registry::{LockRegistry, lock_id};
