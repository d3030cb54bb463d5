//! Coordination core for optimistic shard DDL synchronization.
//!
//! Several upstream shard tables merged into one downstream table report their schema changes
//! independently. The [`lock::DdlLock`] of each downstream table joins those changes into one
//! agreed shape and decides which statements every source has to run. Locks and table
//! memberships live in in-memory registries that are rebuilt from the
//! [`store::CoordinationStore`] whenever the process starts.

pub mod coordinator;
pub mod error;
pub mod lock;
mod macros;
pub mod store;
pub mod tables;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
