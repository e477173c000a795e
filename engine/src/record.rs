//! Remote record model: names, zones, identities, and record payloads.
//!
//! A synchronized local row maps 1:1 to a remote record. The remote addresses
//! records by `(record_name, zone_name, owner_name)`; the record name is
//! derived from the row's primary key and table so the mapping needs no
//! separate id column.

use crate::{ChangeTag, FieldMap, LogicalClock, RecordName, Result, TableName};
use serde::{Deserialize, Serialize};

/// Record names starting with this prefix are reserved for the remote store.
pub const RESERVED_RECORD_NAME_PREFIX: &str = "_";

/// Server-imposed upper bound on record name length, in bytes.
pub const MAX_RECORD_NAME_BYTES: usize = 255;

/// Derive the remote record name for a local row: `"{primary_key}:{table}"`.
pub fn record_name(primary_key: &str, record_type: &str) -> Result<RecordName> {
    let name = format!("{primary_key}:{record_type}");
    validate_record_name(&name)?;
    Ok(name)
}

/// Check a record name against the remote store's naming rules.
pub fn validate_record_name(name: &str) -> Result<()> {
    if name.starts_with(RESERVED_RECORD_NAME_PREFIX) {
        return Err(crate::Error::ReservedRecordName(name.to_string()));
    }
    if name.len() > MAX_RECORD_NAME_BYTES {
        return Err(crate::Error::RecordNameTooLong {
            name: name.to_string(),
            len: name.len(),
            limit: MAX_RECORD_NAME_BYTES,
        });
    }
    Ok(())
}

/// Split a derived record name back into `(primary_key, record_type)`.
///
/// Table names never contain `:`, so the split is on the last separator;
/// primary keys containing `:` survive the round trip.
pub fn split_record_name(name: &str) -> Option<(&str, &str)> {
    name.rsplit_once(':')
}

/// A remote zone: a grouping of records under one owner.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneId {
    pub zone_name: String,
    pub owner_name: String,
}

impl ZoneId {
    pub fn new(zone_name: impl Into<String>, owner_name: impl Into<String>) -> Self {
        Self {
            zone_name: zone_name.into(),
            owner_name: owner_name.into(),
        }
    }
}

/// Full remote identity of a record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordIdentity {
    pub record_name: RecordName,
    pub zone: ZoneId,
}

impl RecordIdentity {
    pub fn new(record_name: impl Into<RecordName>, zone: ZoneId) -> Self {
        Self {
            record_name: record_name.into(),
            zone,
        }
    }
}

/// Which remote database a zone belongs to, from this device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Zones owned by the current account
    Private,
    /// Zones shared into this account by other owners
    Shared,
}

impl Scope {
    /// A zone is private iff its owner is the current account.
    pub fn for_zone(zone: &ZoneId, current_owner: &str) -> Scope {
        if zone.owner_name == current_owner {
            Scope::Private
        } else {
            Scope::Shared
        }
    }
}

/// A record as the remote store holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    /// Remote identity
    pub id: RecordIdentity,
    /// The synchronized table this record maps to
    pub record_type: TableName,
    /// Reference to the parent record, if any
    pub parent: Option<RecordIdentity>,
    /// Reference to the share governing this record's subtree, if any
    pub share: Option<RecordIdentity>,
    /// Field payload; may carry fields with no local column
    pub fields: FieldMap,
    /// Opaque token the remote rewrites on every accepted save.
    /// `None` until the record has been accepted at least once.
    pub change_tag: Option<ChangeTag>,
    /// Clock of the device edit this record content came from
    pub modification_clock: LogicalClock,
}

impl RemoteRecord {
    pub fn new(
        id: RecordIdentity,
        record_type: impl Into<TableName>,
        fields: FieldMap,
        modification_clock: LogicalClock,
    ) -> Self {
        Self {
            id,
            record_type: record_type.into(),
            parent: None,
            share: None,
            fields,
            change_tag: None,
            modification_clock,
        }
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}
