//! The metadata shadow store.
//!
//! One [`SyncMetadata`] row mirrors every synchronized local row and carries
//! everything the engine needs to address, order, and reconcile it remotely:
//! remote identity, parent linkage, the last snapshot the server confirmed,
//! tombstone state, and the logical clock of the latest local edit.
//!
//! The store also tracks the set of record names that were created and
//! deleted locally before ever reaching the server, so their queued deletes
//! can be suppressed instead of sent.

use crate::{
    record::{self, RecordIdentity, ZoneId},
    LogicalClock, PrimaryKey, RecordName, RemoteRecord, Result, TableName,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Synchronization state of one local row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    /// Synchronized table the row lives in
    pub record_type: TableName,
    /// Primary key of the row, in canonical string form
    pub record_primary_key: PrimaryKey,
    /// Derived remote name: `"{primary_key}:{record_type}"`
    pub record_name: RecordName,
    /// Zone/owner placement of the remote record
    pub zone: ZoneId,
    pub parent_record_type: Option<TableName>,
    pub parent_record_primary_key: Option<PrimaryKey>,
    pub parent_record_name: Option<RecordName>,
    /// Last server-confirmed snapshot, restricted to fields with local columns
    pub last_known_server_record: Option<RemoteRecord>,
    /// Last server-confirmed snapshot with every field, for lossless round-trip
    pub last_known_server_record_all_fields: Option<RemoteRecord>,
    /// Name of the share record governing this row's subtree, if shared
    pub share: Option<RecordName>,
    /// Tombstone: the local row is gone but the remote delete is unconfirmed
    pub is_deleted: bool,
    /// Clock of the latest local user edit
    pub user_modification_time: LogicalClock,
}

impl SyncMetadata {
    pub fn new(
        record_type: impl Into<TableName>,
        record_primary_key: impl Into<PrimaryKey>,
        zone: ZoneId,
        user_modification_time: LogicalClock,
    ) -> Result<Self> {
        let record_type = record_type.into();
        let record_primary_key = record_primary_key.into();
        let record_name = record::record_name(&record_primary_key, &record_type)?;
        Ok(Self {
            record_type,
            record_primary_key,
            record_name,
            zone,
            parent_record_type: None,
            parent_record_primary_key: None,
            parent_record_name: None,
            last_known_server_record: None,
            last_known_server_record_all_fields: None,
            share: None,
            is_deleted: false,
            user_modification_time,
        })
    }

    pub fn identity(&self) -> RecordIdentity {
        RecordIdentity::new(self.record_name.clone(), self.zone.clone())
    }

    pub fn has_last_known_server_record(&self) -> bool {
        self.last_known_server_record.is_some()
    }

    pub fn is_shared(&self) -> bool {
        self.share.is_some()
    }

    /// Set or clear the parent linkage, re-deriving `parent_record_name`.
    pub fn set_parent(&mut self, parent: Option<(&str, &str)>) -> Result<()> {
        match parent {
            Some((table, primary_key)) => {
                self.parent_record_name = Some(record::record_name(primary_key, table)?);
                self.parent_record_type = Some(table.to_string());
                self.parent_record_primary_key = Some(primary_key.to_string());
            }
            None => {
                self.parent_record_name = None;
                self.parent_record_type = None;
                self.parent_record_primary_key = None;
            }
        }
        Ok(())
    }

    /// Drop both server snapshot caches. A placement change makes the cached
    /// remote identity wrong, so the record must be re-sent from scratch.
    pub fn invalidate_server_record(&mut self) {
        self.last_known_server_record = None;
        self.last_known_server_record_all_fields = None;
    }
}

/// Lookup key for a row that may not have validated metadata yet.
pub(crate) fn lookup_name(table: &str, primary_key: &str) -> RecordName {
    format!("{primary_key}:{table}")
}

/// The persistent shadow table of synchronization state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataStore {
    rows: BTreeMap<RecordName, SyncMetadata>,
    /// Record names created and deleted locally before ever being pushed
    unsynced: BTreeSet<RecordName>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, record_name: &str) -> Option<&SyncMetadata> {
        self.rows.get(record_name)
    }

    pub fn get_mut(&mut self, record_name: &str) -> Option<&mut SyncMetadata> {
        self.rows.get_mut(record_name)
    }

    pub fn by_row(&self, table: &str, primary_key: &str) -> Option<&SyncMetadata> {
        self.rows.get(&lookup_name(table, primary_key))
    }

    pub fn by_row_mut(&mut self, table: &str, primary_key: &str) -> Option<&mut SyncMetadata> {
        self.rows.get_mut(&lookup_name(table, primary_key))
    }

    /// Join helper: does a metadata row exist for this local row?
    pub fn has_metadata(&self, table: &str, primary_key: &str) -> bool {
        self.by_row(table, primary_key).is_some()
    }

    /// Insert if absent; an existing row is left untouched so capture
    /// re-entrancy cannot clobber state.
    pub fn upsert(&mut self, metadata: SyncMetadata) -> &mut SyncMetadata {
        self.rows
            .entry(metadata.record_name.clone())
            .or_insert(metadata)
    }

    /// Replace (or insert) a metadata row unconditionally.
    pub fn put(&mut self, metadata: SyncMetadata) {
        self.rows.insert(metadata.record_name.clone(), metadata);
    }

    /// Flip the tombstone on. Returns false if no such row.
    pub fn mark_deleted(&mut self, record_name: &str) -> bool {
        match self.rows.get_mut(record_name) {
            Some(row) => {
                row.is_deleted = true;
                true
            }
            None => false,
        }
    }

    /// Remove a metadata row entirely.
    pub fn hard_delete(&mut self, record_name: &str) -> Option<SyncMetadata> {
        self.unsynced.remove(record_name);
        self.rows.remove(record_name)
    }

    /// Walk `parent_record_name` transitively to the topmost resolvable row.
    ///
    /// A missing parent row and a cycle both terminate the walk: the last
    /// resolvable name is treated as the root.
    pub fn find_root(&self, record_name: &str) -> RecordName {
        let mut current = record_name.to_string();
        let mut visited = HashSet::new();
        while visited.insert(current.clone()) {
            match self.rows.get(&current).and_then(|m| m.parent_record_name.clone()) {
                Some(parent) if self.rows.contains_key(&parent) => current = parent,
                _ => break,
            }
        }
        current
    }

    /// Direct children: rows whose parent linkage names `record_name`.
    pub fn children_of(&self, record_name: &str) -> Vec<RecordName> {
        self.rows
            .values()
            .filter(|m| m.parent_record_name.as_deref() == Some(record_name))
            .map(|m| m.record_name.clone())
            .collect()
    }

    /// Transitive closure of children, breadth-first (parents before their
    /// descendants), cycle-safe. Does not include `record_name` itself.
    pub fn find_descendants(&self, record_name: &str) -> Vec<RecordName> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(record_name.to_string());
        let mut frontier = vec![record_name.to_string()];
        while let Some(current) = frontier.pop() {
            for child in self.children_of(&current) {
                if visited.insert(child.clone()) {
                    out.push(child.clone());
                    frontier.push(child);
                }
            }
        }
        out
    }

    /// All metadata rows placed in `zone`.
    pub fn in_zone(&self, zone: &ZoneId) -> Vec<RecordName> {
        self.rows
            .values()
            .filter(|m| &m.zone == zone)
            .map(|m| m.record_name.clone())
            .collect()
    }

    /// Remove every row in `zone` and return what was removed.
    pub fn wipe_zone(&mut self, zone: &ZoneId) -> Vec<SyncMetadata> {
        let names = self.in_zone(zone);
        names
            .iter()
            .filter_map(|name| self.hard_delete(name))
            .collect()
    }

    pub fn mark_unsynced(&mut self, record_name: impl Into<RecordName>) {
        self.unsynced.insert(record_name.into());
    }

    pub fn is_unsynced(&self, record_name: &str) -> bool {
        self.unsynced.contains(record_name)
    }

    /// Remove a name from the unsynced set, reporting whether it was present.
    pub fn take_unsynced(&mut self, record_name: &str) -> bool {
        self.unsynced.remove(record_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncMetadata> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Clear everything; used on account sign-out.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.unsynced.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> ZoneId {
        ZoneId::new("records", "alice")
    }

    fn meta(table: &str, pk: &str) -> SyncMetadata {
        SyncMetadata::new(table, pk, zone(), LogicalClock::with_counter("d1", 1)).unwrap()
    }

    fn meta_with_parent(table: &str, pk: &str, parent: (&str, &str)) -> SyncMetadata {
        let mut m = meta(table, pk);
        m.set_parent(Some(parent)).unwrap();
        m
    }

    #[test]
    fn derives_record_name() {
        let m = meta("remindersLists", "1");
        assert_eq!(m.record_name, "1:remindersLists");
        assert!(!m.has_last_known_server_record());
        assert!(!m.is_shared());
    }

    #[test]
    fn rejects_reserved_primary_key() {
        let result = SyncMetadata::new(
            "lists",
            "_sys",
            zone(),
            LogicalClock::with_counter("d1", 1),
        );
        assert!(matches!(result, Err(crate::Error::ReservedRecordName(_))));
    }

    #[test]
    fn parent_linkage_derivation() {
        let m = meta_with_parent("reminders", "2", ("remindersLists", "1"));
        assert_eq!(m.parent_record_name.as_deref(), Some("1:remindersLists"));
        assert_eq!(m.parent_record_type.as_deref(), Some("remindersLists"));
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut store = MetadataStore::new();
        let mut first = meta("lists", "1");
        first.is_deleted = true;
        store.upsert(first);

        // A second upsert for the same row must not clobber the original.
        store.upsert(meta("lists", "1"));
        assert!(store.get("1:lists").unwrap().is_deleted);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn mark_and_hard_delete() {
        let mut store = MetadataStore::new();
        store.upsert(meta("lists", "1"));

        assert!(store.mark_deleted("1:lists"));
        assert!(store.get("1:lists").unwrap().is_deleted);

        let removed = store.hard_delete("1:lists").unwrap();
        assert_eq!(removed.record_name, "1:lists");
        assert!(store.get("1:lists").is_none());

        assert!(!store.mark_deleted("1:lists"));
    }

    #[test]
    fn find_root_walks_parent_chain() {
        let mut store = MetadataStore::new();
        store.upsert(meta("lists", "1"));
        store.upsert(meta_with_parent("reminders", "2", ("lists", "1")));
        store.upsert(meta_with_parent("tags", "3", ("reminders", "2")));

        assert_eq!(store.find_root("3:tags"), "1:lists");
        assert_eq!(store.find_root("2:reminders"), "1:lists");
        assert_eq!(store.find_root("1:lists"), "1:lists");
    }

    #[test]
    fn find_root_treats_missing_parent_as_root() {
        let mut store = MetadataStore::new();
        store.upsert(meta_with_parent("reminders", "2", ("lists", "99")));
        // "99:lists" has no metadata row; the walk stops at the reminder.
        assert_eq!(store.find_root("2:reminders"), "2:reminders");
    }

    #[test]
    fn find_root_terminates_on_cycle() {
        let mut store = MetadataStore::new();
        store.upsert(meta_with_parent("a", "1", ("b", "2")));
        store.upsert(meta_with_parent("b", "2", ("a", "1")));
        // Must terminate; either member of the cycle is acceptable as root.
        let root = store.find_root("1:a");
        assert!(root == "1:a" || root == "2:b");
    }

    #[test]
    fn find_descendants_transitive() {
        let mut store = MetadataStore::new();
        store.upsert(meta("lists", "1"));
        store.upsert(meta_with_parent("reminders", "2", ("lists", "1")));
        store.upsert(meta_with_parent("reminders", "3", ("lists", "1")));
        store.upsert(meta_with_parent("tags", "4", ("reminders", "2")));

        let descendants = store.find_descendants("1:lists");
        assert_eq!(descendants.len(), 3);
        assert!(descendants.contains(&"2:reminders".to_string()));
        assert!(descendants.contains(&"3:reminders".to_string()));
        assert!(descendants.contains(&"4:tags".to_string()));

        assert!(store.find_descendants("4:tags").is_empty());
    }

    #[test]
    fn find_descendants_terminates_on_cycle() {
        let mut store = MetadataStore::new();
        store.upsert(meta_with_parent("a", "1", ("b", "2")));
        store.upsert(meta_with_parent("b", "2", ("a", "1")));
        let descendants = store.find_descendants("1:a");
        assert_eq!(descendants, vec!["2:b".to_string()]);
    }

    #[test]
    fn zone_wipe() {
        let mut store = MetadataStore::new();
        store.upsert(meta("lists", "1"));
        let mut other = SyncMetadata::new(
            "lists",
            "2",
            ZoneId::new("records", "bob"),
            LogicalClock::with_counter("d1", 1),
        )
        .unwrap();
        other.set_parent(None).unwrap();
        store.upsert(other);

        let removed = store.wipe_zone(&ZoneId::new("records", "bob"));
        assert_eq!(removed.len(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("1:lists").is_some());
    }

    #[test]
    fn unsynced_set() {
        let mut store = MetadataStore::new();
        store.mark_unsynced("1:lists");
        assert!(store.is_unsynced("1:lists"));
        assert!(store.take_unsynced("1:lists"));
        assert!(!store.is_unsynced("1:lists"));
        assert!(!store.take_unsynced("1:lists"));
    }

    #[test]
    fn serialization_roundtrip() {
        let mut store = MetadataStore::new();
        store.upsert(meta("lists", "1"));
        store.upsert(meta_with_parent("reminders", "2", ("lists", "1")));
        store.mark_unsynced("2:reminders");

        let json = serde_json::to_string(&store).unwrap();
        let parsed: MetadataStore = serde_json::from_str(&json).unwrap();
        assert_eq!(store, parsed);
    }
}
