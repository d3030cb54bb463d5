use std::fmt;

use serde::{Deserialize, Serialize};

/// A schema qualified table name, upstream or downstream.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> TableName {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Returns the name quoted with backticks, doubling any backtick inside a component.
    ///
    /// This is the normalized form used in lock identifiers.
    pub fn as_quoted_identifier(&self) -> String {
        format!(
            "`{}`.`{}`",
            self.schema.replace('`', "``"),
            self.name.replace('`', "``")
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_identifier_escapes_backticks() {
        let name = TableName::new("my`db", "orders");

        assert_eq!(name.as_quoted_identifier(), "`my``db`.`orders`");
        assert_eq!(name.to_string(), "my`db.orders");
    }
}
