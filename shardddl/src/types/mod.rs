//! Records exchanged with the coordination store and the shape model they carry.

mod decision;
mod name;
mod report;
mod shape;
mod table_set;

pub use decision::{Decision, DecisionConflict};
pub use name::TableName;
pub use report::ChangeReport;
pub use shape::{ColumnShape, IndexShape, ShapeConflict, ShapeElement, TableShape};
pub use table_set::TableSet;
