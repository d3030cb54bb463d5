//! Upstream table membership of every task.

mod registry;

pub use registry::TableRegistry;
