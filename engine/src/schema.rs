//! Static descriptors of the synchronized tables.
//!
//! The engine never introspects the host database at runtime; the host builds
//! one [`SchemaDescriptor`] at setup from its schema declaration and the
//! descriptor stays immutable for the engine's lifetime. Foreign keys drive
//! parent linkage and delete propagation.

use crate::{error::Result, Error, FieldMap, TableName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Column types supported in synchronized tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::Text => write!(f, "Text"),
            ColumnType::Integer => write!(f, "Integer"),
            ColumnType::Real => write!(f, "Real"),
            ColumnType::Boolean => write!(f, "Boolean"),
            ColumnType::Timestamp => write!(f, "Timestamp"),
            ColumnType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a column in a synchronized table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default: Option<serde_json::Value>,
    pub primary_key: bool,
}

impl ColumnDef {
    /// The table's primary key column.
    pub fn primary_key(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: None,
            primary_key: true,
        }
    }

    /// A non-null column.
    pub fn required(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: None,
            primary_key: false,
        }
    }

    /// A nullable column.
    pub fn nullable(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            default: None,
            primary_key: false,
        }
    }

    /// Attach a default value, used by `ON DELETE SET DEFAULT`.
    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Validate a value (or its absence) against this column.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None | Some(serde_json::Value::Null) => {
                if self.nullable {
                    Ok(())
                } else {
                    Err(Error::MissingRequiredColumn(self.name.clone()))
                }
            }
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.column_type {
            ColumnType::Text => value.is_string(),
            ColumnType::Integer => value.is_i64() || value.is_u64(),
            ColumnType::Real => value.is_f64() || value.is_i64() || value.is_u64(),
            ColumnType::Boolean => value.is_boolean(),
            ColumnType::Timestamp => value.is_u64() || value.is_i64(),
            ColumnType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                column: self.name.clone(),
                expected: self.column_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Boolean",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Integer",
        serde_json::Value::Number(_) => "Real",
        serde_json::Value::String(_) => "Text",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// What deleting the referenced parent row does to rows holding the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OnDeleteAction {
    Cascade,
    SetNull,
    SetDefault,
}

/// A single-column foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    /// Referencing column in this table
    pub column: String,
    /// Referenced (parent) table; the reference is to its primary key
    pub references: TableName,
    pub on_delete: OnDeleteAction,
}

impl ForeignKey {
    pub fn new(
        column: impl Into<String>,
        references: impl Into<TableName>,
        on_delete: OnDeleteAction,
    ) -> Self {
        Self {
            column: column.into(),
            references: references.into(),
            on_delete,
        }
    }
}

/// Schema of one synchronized table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub name: TableName,
    pub columns: Vec<ColumnDef>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn new(name: impl Into<TableName>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
            foreign_keys: Vec::new(),
        }
    }

    /// Builder-style method to declare a foreign key.
    pub fn with_foreign_key(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The primary key column. Synchronized tables always declare exactly one.
    pub fn primary_key_column(&self) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.primary_key)
    }

    /// The parent edge: present iff the table declares exactly one foreign key.
    ///
    /// Tables with zero or multiple foreign keys have no parent; their rows
    /// are flat.
    pub fn parent_edge(&self) -> Option<&ForeignKey> {
        match self.foreign_keys.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    /// Validate a full row payload against the column definitions.
    pub fn validate_row(&self, row: &FieldMap) -> Result<()> {
        for column in &self.columns {
            column.validate(row.get(&column.name))?;
        }
        for key in row.keys() {
            if self.column(key).is_none() {
                return Err(Error::InvalidRow(format!(
                    "unknown column '{key}' in table '{}'",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Schema of every synchronized table, built once at engine setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDescriptor {
    /// Schema version for snapshot compatibility
    pub version: crate::SchemaVersion,
    /// Table schemas by name
    pub tables: BTreeMap<TableName, TableSchema>,
}

impl SchemaDescriptor {
    pub fn new(version: crate::SchemaVersion) -> Self {
        Self {
            version,
            tables: BTreeMap::new(),
        }
    }

    pub fn add_table(&mut self, table: TableSchema) -> &mut Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Builder-style method to add a table.
    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.add_table(table);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Tables whose foreign keys reference `parent`, with the referencing key.
    pub fn children_of(&self, parent: &str) -> Vec<(&TableSchema, &ForeignKey)> {
        self.tables
            .values()
            .flat_map(|t| {
                t.foreign_keys
                    .iter()
                    .filter(|fk| fk.references == parent)
                    .map(move |fk| (t, fk))
            })
            .collect()
    }
}
