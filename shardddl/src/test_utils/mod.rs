//! Fixtures shared by unit and integration tests.

pub mod records;
pub mod shape;
