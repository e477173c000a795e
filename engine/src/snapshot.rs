//! Snapshot types for persisting and restoring engine state.
//!
//! A relaunch contract: a freshly constructed engine given this snapshot
//! resumes identically to one that never stopped, including undrained queue
//! entries and buffered orphan children. Collections serialize through
//! `BTreeMap`/`BTreeSet` so equal states produce byte-identical JSON.

use crate::{
    error::Result, graph::OrphanBuffer, local::LocalStore, metadata::MetadataStore,
    queue::PendingQueues, record::ZoneId, schema::SchemaDescriptor, share::ShareRegistry, Error,
    LogicalClock, NodeId, SchemaVersion,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Version of the snapshot format for forward compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Everything the engine persists between launches.
///
/// Local rows ride along standing in for the host's database file, so a test
/// relaunch restores both sides from one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    pub node_id: NodeId,
    pub current_owner: String,
    pub default_zone: ZoneId,
    pub clock: LogicalClock,
    pub metadata: MetadataStore,
    pub local_rows: LocalStore,
    pub queues: PendingQueues,
    pub orphans: OrphanBuffer,
    pub shares: ShareRegistry,
    pub saved_zones: BTreeSet<ZoneId>,
}

impl EngineSnapshot {
    /// Check the snapshot against the schema the engine was set up with.
    pub fn validate(&self, schema: &SchemaDescriptor) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        if self.schema_version != schema.version {
            return Err(Error::SchemaVersionMismatch {
                expected: schema.version,
                actual: self.schema_version,
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(snapshot)
    }

    /// Cheap overview without walking the full snapshot.
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            format_version: self.format_version,
            schema_version: self.schema_version,
            node_id: self.node_id.clone(),
            clock_counter: self.clock.counter,
            metadata_count: self.metadata.len(),
            buffered_orphan_count: self.orphans.len(),
            share_count: self.shares.len(),
        }
    }
}

/// Metadata about a snapshot, without the data itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    pub node_id: NodeId,
    pub clock_counter: u64,
    pub metadata_count: usize,
    pub buffered_orphan_count: usize,
    pub share_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType, TableSchema};
    use crate::{
        engine::{SyncEngine, DEFAULT_OWNER_NAME},
        FieldMap,
    };
    use serde_json::json;

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new(1).with_table(TableSchema::new(
            "remindersLists",
            vec![
                ColumnDef::primary_key("id", ColumnType::Integer),
                ColumnDef::required("title", ColumnType::Text),
            ],
        ))
    }

    fn snapshot_with_data() -> EngineSnapshot {
        let mut engine = SyncEngine::new(schema(), "device-1");
        let mut values = FieldMap::new();
        values.insert("id".into(), json!(1));
        values.insert("title".into(), json!("Personal"));
        engine.insert("remindersLists", values).unwrap();
        engine.export_state()
    }

    #[test]
    fn json_roundtrip() {
        let snapshot = snapshot_with_data();
        let json = snapshot.to_json().unwrap();
        let restored = EngineSnapshot::from_json(&json).unwrap();
        assert_eq!(snapshot, restored);
    }

    #[test]
    fn deterministic_serialization() {
        let a = snapshot_with_data();
        let b = snapshot_with_data();
        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }

    #[test]
    fn validate_version_gates() {
        let mut snapshot = snapshot_with_data();
        assert!(snapshot.validate(&schema()).is_ok());

        snapshot.schema_version = 99;
        assert!(matches!(
            snapshot.validate(&schema()),
            Err(Error::SchemaVersionMismatch { .. })
        ));

        let mut snapshot = snapshot_with_data();
        snapshot.format_version = SNAPSHOT_FORMAT_VERSION + 1;
        assert!(matches!(
            snapshot.validate(&schema()),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn reject_future_format_on_parse() {
        let mut snapshot = snapshot_with_data();
        snapshot.format_version = SNAPSHOT_FORMAT_VERSION + 1;
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(matches!(
            EngineSnapshot::from_json(&json),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn summary_counts() {
        let snapshot = snapshot_with_data();
        let summary = snapshot.summary();
        assert_eq!(summary.node_id, "device-1");
        assert_eq!(summary.metadata_count, 1);
        assert_eq!(summary.buffered_orphan_count, 0);
        assert_eq!(summary.share_count, 0);
        assert!(summary.clock_counter > 0);
    }

    #[test]
    fn snapshot_preserves_owner() {
        let snapshot = snapshot_with_data();
        assert_eq!(snapshot.current_owner, DEFAULT_OWNER_NAME);
    }
}
