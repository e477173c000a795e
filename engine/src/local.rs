//! In-memory local row store.
//!
//! Stands in for the host's relational store: tables of key-value rows,
//! atomic multi-row application, and foreign-key delete propagation. The
//! engine validates and plans every mutation up front, then applies the plan
//! infallibly, which is what makes a write transactional here.

use crate::{
    error::Result,
    schema::{OnDeleteAction, SchemaDescriptor},
    Error, FieldMap, PrimaryKey, TableName,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Distinguishes user-originated writes from writes the engine itself replays
/// while applying remote state. Threaded explicitly through every write path;
/// never ambient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncContext {
    pub is_synchronizing: bool,
}

impl SyncContext {
    /// A write issued by the host application.
    pub fn user() -> Self {
        Self {
            is_synchronizing: false,
        }
    }

    /// A write replayed by the engine from already-committed remote state.
    pub fn engine() -> Self {
        Self {
            is_synchronizing: true,
        }
    }
}

/// One planned or applied row mutation, with old/new values for hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RowChange {
    Inserted {
        table: TableName,
        primary_key: PrimaryKey,
        new: FieldMap,
    },
    Updated {
        table: TableName,
        primary_key: PrimaryKey,
        old: FieldMap,
        new: FieldMap,
    },
    Deleted {
        table: TableName,
        primary_key: PrimaryKey,
        old: FieldMap,
    },
}

impl RowChange {
    pub fn table(&self) -> &str {
        match self {
            RowChange::Inserted { table, .. }
            | RowChange::Updated { table, .. }
            | RowChange::Deleted { table, .. } => table,
        }
    }

    pub fn primary_key(&self) -> &str {
        match self {
            RowChange::Inserted { primary_key, .. }
            | RowChange::Updated { primary_key, .. }
            | RowChange::Deleted { primary_key, .. } => primary_key,
        }
    }
}

/// Canonical string form of a key-ish JSON value. Null and composite values
/// have no key form.
pub(crate) fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Tables of rows keyed by canonical primary key string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalStore {
    tables: BTreeMap<TableName, BTreeMap<PrimaryKey, FieldMap>>,
}

impl LocalStore {
    pub fn new(schema: &SchemaDescriptor) -> Self {
        let mut tables = BTreeMap::new();
        for name in schema.tables.keys() {
            tables.insert(name.clone(), BTreeMap::new());
        }
        Self { tables }
    }

    pub fn get(&self, table: &str, primary_key: &str) -> Option<&FieldMap> {
        self.tables.get(table)?.get(primary_key)
    }

    pub fn contains(&self, table: &str, primary_key: &str) -> bool {
        self.get(table, primary_key).is_some()
    }

    /// Iterate rows of one table as `(primary_key, row)`.
    pub fn rows(&self, table: &str) -> impl Iterator<Item = (&PrimaryKey, &FieldMap)> {
        self.tables.get(table).into_iter().flatten()
    }

    pub fn table_len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Plan an insert: validates the payload and returns the change to apply.
    pub fn plan_insert(
        &self,
        schema: &SchemaDescriptor,
        table: &str,
        mut values: FieldMap,
    ) -> Result<RowChange> {
        let table_schema = schema
            .table(table)
            .ok_or_else(|| Error::TableNotSynchronized(table.to_string()))?;

        // Fill declared defaults for absent columns before validating.
        for column in &table_schema.columns {
            if !values.contains_key(&column.name) {
                if let Some(default) = &column.default {
                    values.insert(column.name.clone(), default.clone());
                }
            }
        }
        table_schema.validate_row(&values)?;

        let primary_key = self.primary_key_of(schema, table, &values)?;
        if self.contains(table, &primary_key) {
            return Err(Error::RowAlreadyExists {
                table: table.to_string(),
                primary_key,
            });
        }

        Ok(RowChange::Inserted {
            table: table.to_string(),
            primary_key,
            new: values,
        })
    }

    /// Plan an update: merges `values` over the existing row. A primary-key
    /// change comes back as delete + insert.
    pub fn plan_update(
        &self,
        schema: &SchemaDescriptor,
        table: &str,
        primary_key: &str,
        values: FieldMap,
    ) -> Result<Vec<RowChange>> {
        let table_schema = schema
            .table(table)
            .ok_or_else(|| Error::TableNotSynchronized(table.to_string()))?;

        let old = self
            .get(table, primary_key)
            .ok_or_else(|| Error::RowNotFound {
                table: table.to_string(),
                primary_key: primary_key.to_string(),
            })?
            .clone();

        let mut new = old.clone();
        for (key, value) in values {
            new.insert(key, value);
        }
        table_schema.validate_row(&new)?;

        let new_primary_key = self.primary_key_of(schema, table, &new)?;
        if new_primary_key != primary_key {
            return Ok(vec![
                RowChange::Deleted {
                    table: table.to_string(),
                    primary_key: primary_key.to_string(),
                    old,
                },
                RowChange::Inserted {
                    table: table.to_string(),
                    primary_key: new_primary_key,
                    new,
                },
            ]);
        }

        Ok(vec![RowChange::Updated {
            table: table.to_string(),
            primary_key: primary_key.to_string(),
            old,
            new,
        }])
    }

    /// Plan a delete with foreign-key propagation. Cascaded deletions come
    /// deepest-first so no child ever outlives the constraint on its parent;
    /// SET NULL / SET DEFAULT children surface as updates.
    pub fn plan_delete(
        &self,
        schema: &SchemaDescriptor,
        table: &str,
        primary_key: &str,
    ) -> Result<Vec<RowChange>> {
        if schema.table(table).is_none() {
            return Err(Error::TableNotSynchronized(table.to_string()));
        }
        if !self.contains(table, primary_key) {
            return Err(Error::RowNotFound {
                table: table.to_string(),
                primary_key: primary_key.to_string(),
            });
        }

        let mut plan = Vec::new();
        let mut visited = HashSet::new();
        self.plan_delete_inner(schema, table, primary_key, &mut plan, &mut visited);
        Ok(plan)
    }

    fn plan_delete_inner(
        &self,
        schema: &SchemaDescriptor,
        table: &str,
        primary_key: &str,
        plan: &mut Vec<RowChange>,
        visited: &mut HashSet<(TableName, PrimaryKey)>,
    ) {
        if !visited.insert((table.to_string(), primary_key.to_string())) {
            return;
        }
        let Some(old) = self.get(table, primary_key).cloned() else {
            return;
        };

        for (child_table, foreign_key) in schema.children_of(table) {
            let referencing: Vec<(PrimaryKey, FieldMap)> = self
                .rows(&child_table.name)
                .filter(|(_, row)| {
                    row.get(&foreign_key.column)
                        .and_then(key_string)
                        .as_deref()
                        == Some(primary_key)
                })
                .map(|(pk, row)| (pk.clone(), row.clone()))
                .collect();

            for (child_pk, child_row) in referencing {
                match foreign_key.on_delete {
                    OnDeleteAction::Cascade => {
                        self.plan_delete_inner(schema, &child_table.name, &child_pk, plan, visited);
                    }
                    OnDeleteAction::SetNull | OnDeleteAction::SetDefault => {
                        let replacement = match foreign_key.on_delete {
                            OnDeleteAction::SetDefault => child_table
                                .column(&foreign_key.column)
                                .and_then(|c| c.default.clone())
                                .unwrap_or(Value::Null),
                            _ => Value::Null,
                        };
                        let mut new = child_row.clone();
                        new.insert(foreign_key.column.clone(), replacement);
                        plan.push(RowChange::Updated {
                            table: child_table.name.clone(),
                            primary_key: child_pk,
                            old: child_row,
                            new,
                        });
                    }
                }
            }
        }

        plan.push(RowChange::Deleted {
            table: table.to_string(),
            primary_key: primary_key.to_string(),
            old,
        });
    }

    /// Apply a plan. Plans are validated when built, so application cannot
    /// fail partway.
    pub fn apply(&mut self, changes: &[RowChange]) {
        for change in changes {
            match change {
                RowChange::Inserted {
                    table,
                    primary_key,
                    new,
                } => {
                    self.tables
                        .entry(table.clone())
                        .or_default()
                        .insert(primary_key.clone(), new.clone());
                }
                RowChange::Updated {
                    table,
                    primary_key,
                    new,
                    ..
                } => {
                    self.tables
                        .entry(table.clone())
                        .or_default()
                        .insert(primary_key.clone(), new.clone());
                }
                RowChange::Deleted {
                    table, primary_key, ..
                } => {
                    if let Some(rows) = self.tables.get_mut(table) {
                        rows.remove(primary_key);
                    }
                }
            }
        }
    }

    /// Remove one row without foreign-key propagation (zone wipes).
    pub(crate) fn remove(&mut self, table: &str, primary_key: &str) -> Option<FieldMap> {
        self.tables.get_mut(table)?.remove(primary_key)
    }

    fn primary_key_of(
        &self,
        schema: &SchemaDescriptor,
        table: &str,
        values: &FieldMap,
    ) -> Result<PrimaryKey> {
        let table_schema = schema
            .table(table)
            .ok_or_else(|| Error::TableNotSynchronized(table.to_string()))?;
        let pk_column = table_schema
            .primary_key_column()
            .ok_or_else(|| Error::InvalidRow(format!("table '{table}' has no primary key")))?;
        values
            .get(&pk_column.name)
            .and_then(key_string)
            .ok_or_else(|| {
                Error::InvalidRow(format!(
                    "row in '{table}' has no usable primary key value in '{}'",
                    pk_column.name
                ))
            })
    }
}
