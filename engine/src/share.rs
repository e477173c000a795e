//! Sharing: share records, participants, and cross-scope re-homing.
//!
//! A share is itself a record living in the same zone as the root it governs.
//! Participants gain access to the whole subtree under that root; write
//! access is decided per share, and only root records (tables with no foreign
//! keys) can anchor one.

use crate::{
    metadata::MetadataStore,
    queue::{PendingDatabaseChange, PendingQueues, PendingRecordZoneChange},
    record::{self, RecordIdentity, Scope, ZoneId},
    RecordName, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What a participant may do with the shared subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SharePermission {
    ReadOnly,
    ReadWrite,
}

/// One user granted access through a share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareParticipant {
    pub user_name: String,
    pub permission: SharePermission,
}

impl ShareParticipant {
    pub fn read_only(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            permission: SharePermission::ReadOnly,
        }
    }

    pub fn read_write(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            permission: SharePermission::ReadWrite,
        }
    }
}

/// The record representing a share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRecord {
    /// The share's own record name
    pub record_name: RecordName,
    /// Zone the share (and its root) lives in
    pub zone: ZoneId,
    /// Root record this share governs
    pub root_record_name: RecordName,
    /// The sharing user; always has write access
    pub owner_name: String,
    pub participants: Vec<ShareParticipant>,
}

impl ShareRecord {
    /// Deterministic share name for a root record.
    pub fn name_for_root(root_record_name: &str) -> Result<RecordName> {
        let name = format!("share-{root_record_name}");
        record::validate_record_name(&name)?;
        Ok(name)
    }

    pub fn new(
        root_record_name: impl Into<RecordName>,
        zone: ZoneId,
        owner_name: impl Into<String>,
    ) -> Result<Self> {
        let root_record_name = root_record_name.into();
        let record_name = Self::name_for_root(&root_record_name)?;
        Ok(Self {
            record_name,
            zone,
            root_record_name,
            owner_name: owner_name.into(),
            participants: Vec::new(),
        })
    }

    pub fn identity(&self) -> RecordIdentity {
        RecordIdentity::new(self.record_name.clone(), self.zone.clone())
    }

    pub fn participant(&self, user_name: &str) -> Option<&ShareParticipant> {
        self.participants.iter().find(|p| p.user_name == user_name)
    }

    /// Add or replace a participant entry.
    pub fn add_participant(&mut self, participant: ShareParticipant) {
        self.participants
            .retain(|p| p.user_name != participant.user_name);
        self.participants.push(participant);
    }

    /// The owner always writes; participants write iff granted.
    pub fn allows_write(&self, user_name: &str) -> bool {
        if user_name == self.owner_name {
            return true;
        }
        matches!(
            self.participant(user_name),
            Some(ShareParticipant {
                permission: SharePermission::ReadWrite,
                ..
            })
        )
    }
}

/// All shares this engine knows about, keyed by the root they govern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRegistry {
    by_root: std::collections::BTreeMap<RecordName, ShareRecord>,
}

impl ShareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_by_root(&self, root_record_name: &str) -> Option<&ShareRecord> {
        self.by_root.get(root_record_name)
    }

    pub fn get_by_name(&self, record_name: &str) -> Option<&ShareRecord> {
        self.by_root.values().find(|s| s.record_name == record_name)
    }

    pub fn insert(&mut self, share: ShareRecord) {
        self.by_root.insert(share.root_record_name.clone(), share);
    }

    pub fn remove_by_root(&mut self, root_record_name: &str) -> Option<ShareRecord> {
        self.by_root.remove(root_record_name)
    }

    pub fn remove_by_name(&mut self, record_name: &str) -> Option<ShareRecord> {
        let root = self
            .by_root
            .values()
            .find(|s| s.record_name == record_name)?
            .root_record_name
            .clone();
        self.by_root.remove(&root)
    }

    /// Drop every share whose zone was deleted.
    pub fn remove_zone(&mut self, zone: &ZoneId) {
        self.by_root.retain(|_, share| &share.zone != zone);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShareRecord> {
        self.by_root.values()
    }

    pub fn len(&self) -> usize {
        self.by_root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_root.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_root.clear();
    }
}

/// Move a record and its whole subtree into a different zone/owner.
///
/// For every affected record: the placement changes, the cached server
/// snapshots become invalid (the remote identity changed with the zone), a
/// delete is queued against the old zone when the record ever reached the
/// server, and a save is queued into the new zone. Records already placed in
/// the target zone are skipped, which makes repeated application a no-op.
pub(crate) fn re_home_subtree(
    metadata: &mut MetadataStore,
    queues: &mut PendingQueues,
    saved_zones: &mut BTreeSet<ZoneId>,
    current_owner: &str,
    record_name: &str,
    new_zone: &ZoneId,
) {
    let mut names = vec![record_name.to_string()];
    names.extend(metadata.find_descendants(record_name));

    for name in names {
        let (old_identity, was_synced) = match metadata.get(&name) {
            Some(md) if &md.zone != new_zone => {
                (md.identity(), md.has_last_known_server_record())
            }
            _ => continue,
        };

        let old_scope = Scope::for_zone(&old_identity.zone, current_owner);
        if was_synced {
            queues
                .scope_mut(old_scope)
                .enqueue_record(PendingRecordZoneChange::DeleteRecord(old_identity));
        } else {
            // The record never reached the server under the old identity;
            // a stale queued save there must not be sent.
            queues
                .scope_mut(old_scope)
                .remove_record_change(&PendingRecordZoneChange::SaveRecord(old_identity));
        }

        if let Some(md) = metadata.get_mut(&name) {
            md.zone = new_zone.clone();
            md.invalidate_server_record();
        }
        let new_identity = RecordIdentity::new(name.clone(), new_zone.clone());

        let new_scope = Scope::for_zone(new_zone, current_owner);
        if !saved_zones.contains(new_zone) {
            queues
                .scope_mut(new_scope)
                .enqueue_database(PendingDatabaseChange::SaveZone(new_zone.clone()));
        }
        queues
            .scope_mut(new_scope)
            .enqueue_record(PendingRecordZoneChange::SaveRecord(new_identity));

        tracing::debug!(record = %name, zone = ?new_zone, "re-homed record");
    }
}
