//! Durable per-scope queues of outbound work.
//!
//! Entries are appended by change capture and the sharing subsystem and
//! removed only when the remote store acknowledges them, so stopping the
//! engine never loses pending work. Each scope also carries the opaque
//! change cursor returned by the last successful inbound fetch.

use crate::{
    record::{RecordIdentity, Scope, ZoneId},
    ChangeCursor, RecordName,
};
use serde::{Deserialize, Serialize};

/// An outbound record-level operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PendingRecordZoneChange {
    SaveRecord(RecordIdentity),
    DeleteRecord(RecordIdentity),
}

impl PendingRecordZoneChange {
    pub fn identity(&self) -> &RecordIdentity {
        match self {
            PendingRecordZoneChange::SaveRecord(id)
            | PendingRecordZoneChange::DeleteRecord(id) => id,
        }
    }
}

/// An outbound database-level operation. Drained before record-level changes:
/// a zone must exist remotely before records can be saved into it, and a
/// share must exist before participants can see the zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PendingDatabaseChange {
    SaveZone(ZoneId),
    DeleteZone(ZoneId),
    SaveShare(RecordName),
    DeleteShare(RecordName),
}

/// Ordered outbound log plus inbound cursor for one scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeQueue {
    database_changes: Vec<PendingDatabaseChange>,
    record_changes: Vec<PendingRecordZoneChange>,
    cursor: Option<ChangeCursor>,
    /// One outbound request at a time; not persisted, a relaunch starts idle.
    #[serde(skip)]
    in_flight: bool,
}

impl ScopeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record change, coalescing against what is already queued:
    /// a save for an identity already awaiting save is dropped, and a delete
    /// cancels any queued save for the same identity.
    pub fn enqueue_record(&mut self, change: PendingRecordZoneChange) {
        match &change {
            PendingRecordZoneChange::SaveRecord(id) => {
                if self
                    .record_changes
                    .iter()
                    .any(|c| matches!(c, PendingRecordZoneChange::SaveRecord(existing) if existing == id))
                {
                    return;
                }
            }
            PendingRecordZoneChange::DeleteRecord(id) => {
                self.record_changes.retain(
                    |c| !matches!(c, PendingRecordZoneChange::SaveRecord(existing) if existing == id),
                );
                if self
                    .record_changes
                    .iter()
                    .any(|c| matches!(c, PendingRecordZoneChange::DeleteRecord(existing) if existing == id))
                {
                    return;
                }
            }
        }
        self.record_changes.push(change);
    }

    /// Append a database change; duplicates are dropped and a delete cancels
    /// the matching queued save (zone or share).
    pub fn enqueue_database(&mut self, change: PendingDatabaseChange) {
        match &change {
            PendingDatabaseChange::DeleteZone(zone) => {
                self.database_changes.retain(
                    |c| !matches!(c, PendingDatabaseChange::SaveZone(existing) if existing == zone),
                );
            }
            PendingDatabaseChange::DeleteShare(name) => {
                self.database_changes.retain(
                    |c| !matches!(c, PendingDatabaseChange::SaveShare(existing) if existing == name),
                );
            }
            _ => {}
        }
        if !self.database_changes.contains(&change) {
            self.database_changes.push(change);
        }
    }

    pub fn record_changes(&self) -> &[PendingRecordZoneChange] {
        &self.record_changes
    }

    pub fn database_changes(&self) -> &[PendingDatabaseChange] {
        &self.database_changes
    }

    pub fn has_pending(&self) -> bool {
        !self.record_changes.is_empty() || !self.database_changes.is_empty()
    }

    /// Remove exactly the acknowledged record entries; everything else stays
    /// queued for the next drain.
    pub fn acknowledge_records(&mut self, acknowledged: &[PendingRecordZoneChange]) {
        self.record_changes.retain(|c| !acknowledged.contains(c));
    }

    pub fn acknowledge_database(&mut self, acknowledged: &[PendingDatabaseChange]) {
        self.database_changes.retain(|c| !acknowledged.contains(c));
    }

    /// Drop queued record changes targeting `zone` (the zone is gone).
    pub fn remove_zone_records(&mut self, zone: &ZoneId) {
        self.record_changes.retain(|c| &c.identity().zone != zone);
        self.database_changes.retain(|c| {
            !matches!(c, PendingDatabaseChange::SaveZone(z) | PendingDatabaseChange::DeleteZone(z) if z == zone)
        });
    }

    /// Remove a single queued record change.
    pub fn remove_record_change(&mut self, change: &PendingRecordZoneChange) {
        self.record_changes.retain(|c| c != change);
    }

    pub fn cursor(&self) -> Option<&ChangeCursor> {
        self.cursor.as_ref()
    }

    pub fn set_cursor(&mut self, cursor: Option<ChangeCursor>) {
        if cursor.is_some() {
            self.cursor = cursor;
        }
    }

    /// Claim the single outbound slot. Returns false if a send is in flight.
    pub fn begin_send(&mut self) -> bool {
        if self.in_flight {
            false
        } else {
            self.in_flight = true;
            true
        }
    }

    pub fn finish_send(&mut self) {
        self.in_flight = false;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn clear(&mut self) {
        self.database_changes.clear();
        self.record_changes.clear();
        self.cursor = None;
        self.in_flight = false;
    }
}

/// The private and shared scope queues.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQueues {
    private: ScopeQueue,
    shared: ScopeQueue,
}

impl PendingQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(&self, scope: Scope) -> &ScopeQueue {
        match scope {
            Scope::Private => &self.private,
            Scope::Shared => &self.shared,
        }
    }

    pub fn scope_mut(&mut self, scope: Scope) -> &mut ScopeQueue {
        match scope {
            Scope::Private => &mut self.private,
            Scope::Shared => &mut self.shared,
        }
    }

    pub fn clear(&mut self) {
        self.private.clear();
        self.shared.clear();
    }
}
