//! Record graph resolution: outbound ordering and inbound orphan buffering.
//!
//! The remote store refuses a record whose parent reference names a record it
//! has never seen, so outbound saves are ordered parents-first. Inbound, the
//! mirror problem appears: a child can arrive before its parent, and must be
//! held back without materializing until the parent shows up.

use crate::{metadata::MetadataStore, record::ZoneId, RecordIdentity, RecordName, RemoteRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Order queued saves so every parent is transmitted at or before its
/// children. Records outside any parent chain keep their queue order.
///
/// The sort key is the number of in-set ancestors, which is strictly smaller
/// for a parent than for any of its in-set descendants; the sort is stable so
/// unrelated records stay in enqueue order. Cycles terminate via the visited
/// set and fall back to queue order among themselves.
pub fn send_order(saves: &[RecordIdentity], metadata: &MetadataStore) -> Vec<RecordIdentity> {
    let in_set: HashSet<&str> = saves.iter().map(|s| s.record_name.as_str()).collect();

    let depth_of = |name: &str| -> usize {
        let mut depth = 0;
        let mut visited = HashSet::new();
        let mut current = name.to_string();
        while visited.insert(current.clone()) {
            match metadata
                .get(&current)
                .and_then(|m| m.parent_record_name.clone())
            {
                Some(parent) => {
                    if in_set.contains(parent.as_str()) {
                        depth += 1;
                    }
                    current = parent;
                }
                None => break,
            }
        }
        depth
    };

    let mut ordered: Vec<(usize, usize, &RecordIdentity)> = saves
        .iter()
        .enumerate()
        .map(|(index, save)| (depth_of(&save.record_name), index, save))
        .collect();
    ordered.sort_by_key(|(depth, index, _)| (*depth, *index));
    ordered.into_iter().map(|(_, _, save)| save.clone()).collect()
}

/// Remote records received before their declared parent was known locally.
///
/// Buffered records are not local rows; they are full remote payloads waiting
/// to be applied. The buffer persists across engine relaunches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanBuffer {
    by_parent: BTreeMap<RecordName, Vec<RemoteRecord>>,
}

impl OrphanBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold a record until its parent materializes. Re-delivery of the same
    /// record replaces the buffered copy.
    pub fn buffer(&mut self, record: RemoteRecord) {
        let Some(parent) = record.parent.as_ref() else {
            return;
        };
        let bucket = self.by_parent.entry(parent.record_name.clone()).or_default();
        if let Some(existing) = bucket
            .iter_mut()
            .find(|r| r.id.record_name == record.id.record_name)
        {
            *existing = record;
        } else {
            bucket.push(record);
        }
    }

    /// Take every buffered child of `parent`, removing them from the buffer.
    pub fn take_children(&mut self, parent: &str) -> Vec<RemoteRecord> {
        self.by_parent.remove(parent).unwrap_or_default()
    }

    /// Is this record name sitting in the buffer?
    pub fn contains(&self, record_name: &str) -> bool {
        self.by_parent
            .values()
            .flatten()
            .any(|r| r.id.record_name == record_name)
    }

    /// Drop a buffered record wherever it is held.
    pub fn discard(&mut self, record_name: &str) {
        for bucket in self.by_parent.values_mut() {
            bucket.retain(|r| r.id.record_name != record_name);
        }
        self.by_parent.retain(|_, bucket| !bucket.is_empty());
    }

    /// Drop everything buffered for records in `zone`.
    pub fn remove_zone(&mut self, zone: &ZoneId) {
        for bucket in self.by_parent.values_mut() {
            bucket.retain(|r| &r.id.zone != zone);
        }
        self.by_parent.retain(|_, bucket| !bucket.is_empty());
    }

    /// Total buffered records.
    pub fn len(&self) -> usize {
        self.by_parent.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_parent.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_parent.clear();
    }
}
