//! Telemetry setup shared by the coordinator binary and tests.

pub mod tracing;
