use crate::types::{ColumnShape, IndexShape, TableShape};

/// Shape of the tables used across tests: a non-null `id` primary key and a `name` column.
pub fn base_shape() -> TableShape {
    TableShape::new()
        .with_column("id", ColumnShape::new("BIGINT").not_null())
        .with_column("name", ColumnShape::new("VARCHAR(64)"))
        .with_index("PRIMARY", IndexShape::new(["id"]).unique())
}

/// Returns `shape` with an extra nullable column.
pub fn with_column(shape: &TableShape, name: &str, typ: &str) -> TableShape {
    shape.clone().with_column(name, ColumnShape::new(typ))
}

/// Returns `shape` without the given column.
pub fn without_column(shape: &TableShape, name: &str) -> TableShape {
    shape.clone().without_column(name)
}
