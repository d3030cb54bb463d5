use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Definition of a single column as seen by the coordinator.
///
/// The type is kept as the text produced by the DDL parser; two columns are compatible only
/// when every field is equal.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ColumnShape {
    pub typ: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

const fn default_nullable() -> bool {
    true
}

impl ColumnShape {
    /// Creates a nullable column without a default.
    pub fn new(typ: impl Into<String>) -> Self {
        Self {
            typ: typ.into(),
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

impl fmt::Display for ColumnShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.typ)?;
        if !self.nullable {
            f.write_str(" NOT NULL")?;
        }
        if let Some(default) = &self.default {
            write!(f, " DEFAULT {default}")?;
        }

        Ok(())
    }
}

/// Definition of an index over an ordered list of columns.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct IndexShape {
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexShape {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

impl fmt::Display for IndexShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unique {
            f.write_str("UNIQUE ")?;
        }
        write!(f, "({})", self.columns.join(", "))
    }
}

/// A named element of a [`TableShape`].
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum ShapeElement {
    Column(String),
    Index(String),
}

impl fmt::Display for ShapeElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeElement::Column(name) => write!(f, "column `{name}`"),
            ShapeElement::Index(name) => write!(f, "index `{name}`"),
        }
    }
}

/// Two shapes define the same element differently.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("{element} is defined as `{left}` and as `{right}`")]
pub struct ShapeConflict {
    pub element: ShapeElement,
    pub left: String,
    pub right: String,
}

/// Structural snapshot of a table: its columns and indexes by name.
///
/// The coordinator never parses DDL; it only compares and joins shapes produced upstream.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableShape {
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnShape>,
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexShape>,
}

impl TableShape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: impl Into<String>, column: ColumnShape) -> Self {
        self.columns.insert(name.into(), column);
        self
    }

    pub fn with_index(mut self, name: impl Into<String>, index: IndexShape) -> Self {
        self.indexes.insert(name.into(), index);
        self
    }

    pub fn without_column(mut self, name: &str) -> Self {
        self.columns.remove(name);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.indexes.is_empty()
    }

    /// Returns whether an element with the same name exists, regardless of its definition.
    pub fn has(&self, element: &ShapeElement) -> bool {
        match element {
            ShapeElement::Column(name) => self.columns.contains_key(name),
            ShapeElement::Index(name) => self.indexes.contains_key(name),
        }
    }

    /// Joins two shapes into the smallest shape containing both.
    ///
    /// Fails with the first element defined differently on each side.
    pub fn join(&self, other: &TableShape) -> Result<TableShape, ShapeConflict> {
        Ok(TableShape {
            columns: join_elements(&self.columns, &other.columns, ShapeElement::Column)?,
            indexes: join_elements(&self.indexes, &other.indexes, ShapeElement::Index)?,
        })
    }

    /// Returns whether every element of `other` exists in `self` with an equal definition.
    pub fn contains(&self, other: &TableShape) -> bool {
        other
            .columns
            .iter()
            .all(|(name, column)| self.columns.get(name) == Some(column))
            && other
                .indexes
                .iter()
                .all(|(name, index)| self.indexes.get(name) == Some(index))
    }

    /// Returns the elements of `self` whose name does not exist in `other`.
    pub fn missing_from(&self, other: &TableShape) -> Vec<ShapeElement> {
        let columns = self
            .columns
            .keys()
            .filter(|name| !other.columns.contains_key(*name))
            .map(|name| ShapeElement::Column(name.clone()));
        let indexes = self
            .indexes
            .keys()
            .filter(|name| !other.indexes.contains_key(*name))
            .map(|name| ShapeElement::Index(name.clone()));

        columns.chain(indexes).collect()
    }
}

fn join_elements<V>(
    left: &BTreeMap<String, V>,
    right: &BTreeMap<String, V>,
    element: fn(String) -> ShapeElement,
) -> Result<BTreeMap<String, V>, ShapeConflict>
where
    V: Clone + Eq + fmt::Display,
{
    let mut joined = left.clone();
    for (name, definition) in right {
        match joined.get(name) {
            Some(existing) if existing != definition => {
                return Err(ShapeConflict {
                    element: element(name.clone()),
                    left: existing.to_string(),
                    right: definition.to_string(),
                });
            }
            Some(_) => {}
            None => {
                joined.insert(name.clone(), definition.clone());
            }
        }
    }

    Ok(joined)
}
