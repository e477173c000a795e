//! The engine facade: lifecycle, local writes, outbound batching, and
//! inbound application.
//!
//! Change capture and the pending queues work identically whether the engine
//! is running or stopped; only remote exchange is gated. The host moves
//! [`OutboundBatch`]es to the remote store and feeds acknowledgments and
//! fetched [`RemoteBatch`]es back in; the engine never performs IO itself.

use crate::{
    capture::{self, CaptureEnv, HookRegistry},
    graph::{self, OrphanBuffer},
    local::{LocalStore, RowChange, SyncContext},
    metadata::{lookup_name, MetadataStore, SyncMetadata},
    queue::{PendingDatabaseChange, PendingQueues, PendingRecordZoneChange},
    reconcile::{self, ApplyOutcome, ReconcileEnv, RemoteBatch},
    record::{self, RecordIdentity, Scope, ZoneId},
    schema::SchemaDescriptor,
    share::{ShareRecord, ShareRegistry},
    snapshot::{EngineSnapshot, SNAPSHOT_FORMAT_VERSION},
    ChangeCursor, Error, FieldMap, LogicalClock, NodeId, RecordName, RemoteRecord, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, trace};

/// Zone records land in until a parent dictates otherwise.
pub const DEFAULT_ZONE_NAME: &str = "tether.records";

/// Owner name used before any account has signed in.
pub const DEFAULT_OWNER_NAME: &str = "defaultOwner";

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Running,
}

/// One outbound request's worth of work for a scope. Database-level changes
/// must be sent before the record changes: zones and shares have to exist
/// remotely before records referencing them are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundBatch {
    pub scope: Scope,
    pub database_changes: Vec<PendingDatabaseChange>,
    /// Materialized payloads for the queued share saves
    pub share_records: Vec<ShareRecord>,
    /// Full record payloads, parents ordered before children
    pub saves: Vec<RemoteRecord>,
    pub deletions: Vec<RecordIdentity>,
}

/// What the remote store confirmed from an outbound batch. Partial
/// acknowledgment is normal: unacknowledged entries stay queued.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckBatch {
    /// Saved records as the server now holds them (fresh change tags)
    pub saved_records: Vec<RemoteRecord>,
    pub deleted_records: Vec<RecordIdentity>,
    pub saved_zones: Vec<ZoneId>,
    pub deleted_zones: Vec<ZoneId>,
    pub saved_shares: Vec<RecordName>,
    pub deleted_shares: Vec<RecordName>,
}

/// The synchronization engine.
pub struct SyncEngine {
    schema: SchemaDescriptor,
    node_id: NodeId,
    current_owner: String,
    default_zone: ZoneId,
    state: EngineState,
    clock: LogicalClock,
    local: LocalStore,
    metadata: MetadataStore,
    queues: PendingQueues,
    orphans: OrphanBuffer,
    shares: ShareRegistry,
    hooks: HookRegistry,
    saved_zones: BTreeSet<ZoneId>,
}

impl SyncEngine {
    /// Set up an engine over `schema`. Capture hooks are registered for every
    /// synchronized table; the engine starts stopped.
    pub fn new(schema: SchemaDescriptor, node_id: impl Into<NodeId>) -> Self {
        let node_id = node_id.into();
        let local = LocalStore::new(&schema);
        let mut hooks = HookRegistry::new();
        for table in schema.tables.keys() {
            hooks.register(table.clone());
        }
        Self {
            local,
            hooks,
            clock: LogicalClock::new(node_id.clone()),
            node_id,
            current_owner: DEFAULT_OWNER_NAME.to_string(),
            default_zone: ZoneId::new(DEFAULT_ZONE_NAME, DEFAULT_OWNER_NAME),
            state: EngineState::Stopped,
            metadata: MetadataStore::new(),
            queues: PendingQueues::new(),
            orphans: OrphanBuffer::new(),
            shares: ShareRegistry::new(),
            saved_zones: BTreeSet::new(),
            schema,
        }
    }

    /// Use a custom default zone name instead of [`DEFAULT_ZONE_NAME`].
    pub fn with_default_zone_name(mut self, zone_name: impl Into<String>) -> Self {
        self.default_zone = ZoneId::new(zone_name, self.current_owner.clone());
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == EngineState::Running
    }

    pub fn current_owner(&self) -> &str {
        &self.current_owner
    }

    pub fn default_zone(&self) -> &ZoneId {
        &self.default_zone
    }

    /// Begin scheduling remote work. Queued changes from while the engine was
    /// stopped become eligible for the next drain.
    pub fn start(&mut self) {
        if self.state != EngineState::Running {
            info!(node = %self.node_id, "sync engine started");
            self.state = EngineState::Running;
        }
    }

    /// Stop scheduling remote work. Queued work is kept; in-flight operations
    /// may still complete via [`SyncEngine::handle_ack`].
    pub fn stop(&mut self) {
        if self.state != EngineState::Stopped {
            info!(node = %self.node_id, "sync engine stopped");
            self.state = EngineState::Stopped;
        }
    }

    /// Consume an account sign-in/out event, re-deriving default placement.
    /// Sign-out tears down all synchronization state (local rows stay).
    pub fn account_changed(&mut self, owner: Option<&str>) {
        match owner {
            Some(owner) => {
                debug!(%owner, "account signed in");
                self.current_owner = owner.to_string();
                self.default_zone =
                    ZoneId::new(self.default_zone.zone_name.clone(), owner);
            }
            None => {
                debug!("account signed out; clearing synchronization state");
                self.metadata.clear();
                self.queues.clear();
                self.orphans.clear();
                self.shares.clear();
                self.saved_zones.clear();
                self.current_owner = DEFAULT_OWNER_NAME.to_string();
                self.default_zone =
                    ZoneId::new(self.default_zone.zone_name.clone(), DEFAULT_OWNER_NAME);
            }
        }
    }

    // ------------------------------------------------------------------
    // Local writes
    // ------------------------------------------------------------------

    /// Insert a row into a synchronized table.
    pub fn insert(&mut self, table: &str, values: FieldMap) -> Result<()> {
        let change = self.local.plan_insert(&self.schema, table, values)?;
        self.commit(vec![change], SyncContext::user())
    }

    /// Update a row; `values` may be a partial set of columns. Changing the
    /// primary key is treated as delete + insert.
    pub fn update(&mut self, table: &str, primary_key: &str, values: FieldMap) -> Result<()> {
        let changes = self
            .local
            .plan_update(&self.schema, table, primary_key, values)?;
        self.commit(changes, SyncContext::user())
    }

    /// Delete a row, propagating through local foreign-key semantics.
    pub fn delete(&mut self, table: &str, primary_key: &str) -> Result<()> {
        let name = lookup_name(table, primary_key);
        let foreign_share_root = self
            .metadata
            .get(&name)
            .and_then(|md| md.share.as_deref())
            .and_then(|share_name| self.shares.get_by_name(share_name))
            .is_some_and(|share| share.owner_name != self.current_owner);
        if foreign_share_root {
            // A participant deleting a shared root leaves the share: local
            // state detaches, the owner's records are never deleted remotely.
            return self.detach_shared_root(table, primary_key, &name);
        }

        let changes = self.local.plan_delete(&self.schema, table, primary_key)?;
        self.commit(changes, SyncContext::user())
    }

    fn detach_shared_root(
        &mut self,
        table: &str,
        primary_key: &str,
        root_name: &str,
    ) -> Result<()> {
        let mut names = vec![root_name.to_string()];
        names.extend(self.metadata.find_descendants(root_name));
        let identities: Vec<RecordIdentity> = names
            .iter()
            .filter_map(|n| self.metadata.get(n))
            .map(SyncMetadata::identity)
            .collect();

        let plan = self.local.plan_delete(&self.schema, table, primary_key)?;
        self.local.apply(&plan);
        capture::detach_subtree(&mut self.metadata, root_name);
        self.shares.remove_by_root(root_name);

        for identity in identities {
            let scope = Scope::for_zone(&identity.zone, &self.current_owner);
            let queue = self.queues.scope_mut(scope);
            queue.remove_record_change(&PendingRecordZoneChange::SaveRecord(identity.clone()));
            queue.remove_record_change(&PendingRecordZoneChange::DeleteRecord(identity));
        }
        debug!(root = %root_name, "detached shared subtree");
        Ok(())
    }

    /// Validate, apply, and capture a planned transaction. Every fallible
    /// check precedes the first mutation.
    fn commit(&mut self, changes: Vec<RowChange>, ctx: SyncContext) -> Result<()> {
        if !ctx.is_synchronizing {
            for change in &changes {
                capture::check_write_permission(
                    &self.metadata,
                    &self.shares,
                    &self.schema,
                    &self.current_owner,
                    change,
                )?;
                if let RowChange::Inserted {
                    table, primary_key, ..
                } = change
                {
                    record::record_name(primary_key, table)?;
                }
            }
        }

        self.local.apply(&changes);

        let mut env = CaptureEnv {
            schema: &self.schema,
            metadata: &mut self.metadata,
            queues: &mut self.queues,
            shares: &self.shares,
            clock: &mut self.clock,
            default_zone: &self.default_zone,
            current_owner: &self.current_owner,
            saved_zones: &mut self.saved_zones,
        };
        for change in &changes {
            if self.hooks.is_registered(change.table()) {
                capture::row_changed(&mut env, change, ctx)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Assemble the next outbound batch for a scope, claiming the scope's
    /// single in-flight slot. Returns `None` while stopped, while a send is
    /// in flight, or when nothing is pending.
    pub fn next_batch(&mut self, scope: Scope) -> Option<OutboundBatch> {
        if !self.is_running() {
            return None;
        }
        if self.queues.scope(scope).is_in_flight() {
            return None;
        }

        self.suppress_unsynced_deletes(scope);

        let database_changes = self.queues.scope(scope).database_changes().to_vec();
        let record_changes = self.queues.scope(scope).record_changes().to_vec();
        if database_changes.is_empty() && record_changes.is_empty() {
            return None;
        }

        let share_records: Vec<ShareRecord> = database_changes
            .iter()
            .filter_map(|change| match change {
                PendingDatabaseChange::SaveShare(name) => self.shares.get_by_name(name).cloned(),
                _ => None,
            })
            .collect();

        let save_identities: Vec<RecordIdentity> = record_changes
            .iter()
            .filter_map(|change| match change {
                PendingRecordZoneChange::SaveRecord(id) => Some(id.clone()),
                _ => None,
            })
            .collect();
        let deletions: Vec<RecordIdentity> = record_changes
            .iter()
            .filter_map(|change| match change {
                PendingRecordZoneChange::DeleteRecord(id) => Some(id.clone()),
                _ => None,
            })
            .collect();

        let ordered = graph::send_order(&save_identities, &self.metadata);
        let saves: Vec<RemoteRecord> = ordered
            .iter()
            .filter_map(|identity| self.outbound_record(identity))
            .collect();

        self.queues.scope_mut(scope).begin_send();
        debug!(
            ?scope,
            saves = saves.len(),
            deletions = deletions.len(),
            database_changes = database_changes.len(),
            "assembled outbound batch"
        );
        Some(OutboundBatch {
            scope,
            database_changes,
            share_records,
            saves,
            deletions,
        })
    }

    /// Deletes for records that were never acknowledged remotely are dropped
    /// rather than sent; their tombstones resolve immediately.
    fn suppress_unsynced_deletes(&mut self, scope: Scope) {
        let entries = self.queues.scope(scope).record_changes().to_vec();
        for entry in entries {
            if let PendingRecordZoneChange::DeleteRecord(identity) = &entry {
                if self.metadata.is_unsynced(&identity.record_name) {
                    trace!(record = %identity.record_name, "suppressing delete of unsynced record");
                    self.queues.scope_mut(scope).remove_record_change(&entry);
                    self.metadata.hard_delete(&identity.record_name);
                }
            }
        }
    }

    /// Build the full outbound payload for one queued save.
    fn outbound_record(&self, identity: &RecordIdentity) -> Option<RemoteRecord> {
        let md = self.metadata.get(&identity.record_name)?;
        if md.is_deleted || md.zone != identity.zone {
            return None;
        }
        let table_schema = self.schema.table(&md.record_type)?;
        let row = self.local.get(&md.record_type, &md.record_primary_key)?;

        let mut fields: FieldMap = row.clone();
        // Foreign fields cached from the server round-trip unchanged.
        if let Some(all) = &md.last_known_server_record_all_fields {
            for (key, value) in &all.fields {
                if table_schema.column(key).is_none() {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }

        let mut outbound = RemoteRecord::new(
            md.identity(),
            md.record_type.clone(),
            fields,
            md.user_modification_time.clone(),
        );
        outbound.parent = md
            .parent_record_name
            .as_ref()
            .map(|parent| RecordIdentity::new(parent.clone(), md.zone.clone()));
        outbound.share = md
            .share
            .as_ref()
            .map(|share| RecordIdentity::new(share.clone(), md.zone.clone()));
        outbound.change_tag = md
            .last_known_server_record_all_fields
            .as_ref()
            .and_then(|cached| cached.change_tag.clone());
        Some(outbound)
    }

    /// Apply the remote store's confirmation of an outbound batch. Runs even
    /// when stopped: the confirmed state is already committed remotely.
    pub fn handle_ack(&mut self, scope: Scope, ack: &AckBatch) {
        for zone in &ack.saved_zones {
            self.saved_zones.insert(zone.clone());
            self.queues
                .scope_mut(scope)
                .acknowledge_database(&[PendingDatabaseChange::SaveZone(zone.clone())]);
        }
        for zone in &ack.deleted_zones {
            self.saved_zones.remove(zone);
            self.queues
                .scope_mut(scope)
                .acknowledge_database(&[PendingDatabaseChange::DeleteZone(zone.clone())]);
        }
        for name in &ack.saved_shares {
            self.queues
                .scope_mut(scope)
                .acknowledge_database(&[PendingDatabaseChange::SaveShare(name.clone())]);
        }
        for name in &ack.deleted_shares {
            self.queues
                .scope_mut(scope)
                .acknowledge_database(&[PendingDatabaseChange::DeleteShare(name.clone())]);
        }

        for saved in &ack.saved_records {
            let name = &saved.id.record_name;
            if let Some(table_schema) = self.schema.table(&saved.record_type) {
                let mapped = reconcile::mapped_snapshot(saved, table_schema);
                if let Some(md) = self.metadata.get_mut(name) {
                    // A re-home after the send leaves this ack addressed to a
                    // stale identity; the fresh save will earn its own ack.
                    if md.zone == saved.id.zone {
                        md.last_known_server_record = Some(mapped);
                        md.last_known_server_record_all_fields = Some(saved.clone());
                    }
                }
            }
            self.queues
                .scope_mut(scope)
                .acknowledge_records(&[PendingRecordZoneChange::SaveRecord(saved.id.clone())]);
        }

        for identity in &ack.deleted_records {
            let tombstoned = self
                .metadata
                .get(&identity.record_name)
                .is_some_and(|md| md.is_deleted && md.zone == identity.zone);
            if tombstoned {
                self.metadata.hard_delete(&identity.record_name);
            }
            self.queues
                .scope_mut(scope)
                .acknowledge_records(&[PendingRecordZoneChange::DeleteRecord(identity.clone())]);
        }

        self.queues.scope_mut(scope).finish_send();
    }

    /// Release the in-flight slot after a failed send; entries stay queued
    /// for the next drain.
    pub fn handle_send_failure(&mut self, scope: Scope) {
        self.queues.scope_mut(scope).finish_send();
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Apply a fetched batch of remote changes. Idempotent; also legal while
    /// stopped (the batch represents already-committed remote state).
    pub fn apply_remote_batch(&mut self, scope: Scope, batch: &RemoteBatch) -> Result<ApplyOutcome> {
        let outcome = {
            let mut env = ReconcileEnv {
                schema: &self.schema,
                metadata: &mut self.metadata,
                local: &mut self.local,
                queues: &mut self.queues,
                shares: &mut self.shares,
                orphans: &mut self.orphans,
                clock: &mut self.clock,
                current_owner: &self.current_owner,
                saved_zones: &mut self.saved_zones,
            };
            reconcile::apply_batch(&mut env, scope, batch)?
        };
        self.queues
            .scope_mut(scope)
            .set_cursor(batch.new_cursor.clone());
        Ok(outcome)
    }

    /// Apply a remote zone deletion (owner revoked access or removed the
    /// zone): wipes every row and metadata row in the zone.
    pub fn apply_zone_deletion(&mut self, scope: Scope, zone: &ZoneId) -> Vec<RecordName> {
        let mut env = ReconcileEnv {
            schema: &self.schema,
            metadata: &mut self.metadata,
            local: &mut self.local,
            queues: &mut self.queues,
            shares: &mut self.shares,
            orphans: &mut self.orphans,
            clock: &mut self.clock,
            current_owner: &self.current_owner,
            saved_zones: &mut self.saved_zones,
        };
        reconcile::apply_zone_deletion(&mut env, scope, zone)
    }

    /// The change cursor to resume fetching a scope from.
    pub fn change_cursor(&self, scope: Scope) -> Option<&ChangeCursor> {
        self.queues.scope(scope).cursor()
    }

    // ------------------------------------------------------------------
    // Sharing
    // ------------------------------------------------------------------

    /// Can rows of this table anchor a share at all?
    pub fn share_eligible(&self, table: &str) -> Result<()> {
        let table_schema = self
            .schema
            .table(table)
            .ok_or_else(|| Error::TableNotSynchronized(table.to_string()))?;
        if table_schema.foreign_keys.is_empty() {
            Ok(())
        } else {
            Err(Error::RecordNotRoot {
                table: table.to_string(),
                primary_key: String::new(),
                foreign_keys: table_schema
                    .foreign_keys
                    .iter()
                    .map(|fk| fk.column.clone())
                    .collect(),
            })
        }
    }

    /// Create (or idempotently update) the share governing a root record.
    pub fn share(
        &mut self,
        table: &str,
        primary_key: &str,
        configure: impl FnOnce(&mut ShareRecord),
    ) -> Result<ShareRecord> {
        let table_schema = self
            .schema
            .table(table)
            .ok_or_else(|| Error::TableNotSynchronized(table.to_string()))?;
        if !table_schema.foreign_keys.is_empty() {
            return Err(Error::RecordNotRoot {
                table: table.to_string(),
                primary_key: primary_key.to_string(),
                foreign_keys: table_schema
                    .foreign_keys
                    .iter()
                    .map(|fk| fk.column.clone())
                    .collect(),
            });
        }
        let md = self.metadata.by_row(table, primary_key).ok_or_else(|| {
            Error::RecordMetadataNotFound {
                table: table.to_string(),
                primary_key: primary_key.to_string(),
            }
        })?;
        if !self.is_running() {
            return Err(Error::SyncEngineNotRunning);
        }

        let root_name = md.record_name.clone();
        let zone = md.zone.clone();
        let mut share = match self.shares.get_by_root(&root_name) {
            Some(existing) => existing.clone(),
            None => ShareRecord::new(root_name.clone(), zone.clone(), self.current_owner.clone())?,
        };
        configure(&mut share);

        if let Some(md) = self.metadata.get_mut(&root_name) {
            md.share = Some(share.record_name.clone());
        }
        self.shares.insert(share.clone());

        let scope = Scope::for_zone(&zone, &self.current_owner);
        self.queues
            .scope_mut(scope)
            .enqueue_database(PendingDatabaseChange::SaveShare(share.record_name.clone()));
        self.queues
            .scope_mut(scope)
            .enqueue_record(PendingRecordZoneChange::SaveRecord(RecordIdentity::new(
                root_name, zone,
            )));
        Ok(share)
    }

    /// Remove the share from a root record; the record itself stays.
    pub fn unshare(&mut self, table: &str, primary_key: &str) -> Result<()> {
        let md = self.metadata.by_row(table, primary_key).ok_or_else(|| {
            Error::RecordMetadataNotFound {
                table: table.to_string(),
                primary_key: primary_key.to_string(),
            }
        })?;
        let Some(share_name) = md.share.clone() else {
            return Ok(());
        };
        let root_name = md.record_name.clone();
        let zone = md.zone.clone();

        if let Some(md) = self.metadata.get_mut(&root_name) {
            md.share = None;
        }
        self.shares.remove_by_name(&share_name);

        let scope = Scope::for_zone(&zone, &self.current_owner);
        self.queues
            .scope_mut(scope)
            .enqueue_database(PendingDatabaseChange::DeleteShare(share_name));
        self.queues
            .scope_mut(scope)
            .enqueue_record(PendingRecordZoneChange::SaveRecord(RecordIdentity::new(
                root_name, zone,
            )));
        Ok(())
    }

    /// Accept a share another user extended: materializes the root into the
    /// shared scope; descendants follow via subsequent fetches.
    pub fn accept_share(
        &mut self,
        root_record: &RemoteRecord,
        share: &ShareRecord,
    ) -> Result<ApplyOutcome> {
        let batch = RemoteBatch {
            modifications: vec![root_record.clone()],
            shares: vec![share.clone()],
            ..Default::default()
        };
        self.apply_remote_batch(Scope::Shared, &batch)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Read a local row.
    pub fn row(&self, table: &str, primary_key: &str) -> Option<&FieldMap> {
        self.local.get(table, primary_key)
    }

    /// Iterate a table's rows.
    pub fn rows(&self, table: &str) -> impl Iterator<Item = (&String, &FieldMap)> {
        self.local.rows(table)
    }

    pub fn metadata_for(&self, table: &str, primary_key: &str) -> Option<&SyncMetadata> {
        self.metadata.by_row(table, primary_key)
    }

    pub fn has_metadata(&self, table: &str, primary_key: &str) -> bool {
        self.metadata.has_metadata(table, primary_key)
    }

    /// The root of a record's parent chain.
    pub fn find_root(&self, table: &str, primary_key: &str) -> Option<&SyncMetadata> {
        let name = self.metadata.by_row(table, primary_key)?.record_name.clone();
        let root = self.metadata.find_root(&name);
        self.metadata.get(&root)
    }

    pub fn share_for(&self, table: &str, primary_key: &str) -> Option<&ShareRecord> {
        let md = self.metadata.by_row(table, primary_key)?;
        let share_name = md.share.as_deref()?;
        self.shares.get_by_name(share_name)
    }

    /// Remote children received ahead of their parents, held without
    /// materialization. An expected transient state, not a failure.
    pub fn buffered_record_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn metadata_count(&self) -> usize {
        self.metadata.len()
    }

    // ------------------------------------------------------------------
    // Relaunch
    // ------------------------------------------------------------------

    /// Export everything a fresh engine instance needs to resume exactly
    /// where this one is.
    pub fn export_state(&self) -> EngineSnapshot {
        EngineSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version: self.schema.version,
            node_id: self.node_id.clone(),
            current_owner: self.current_owner.clone(),
            default_zone: self.default_zone.clone(),
            clock: self.clock.clone(),
            metadata: self.metadata.clone(),
            local_rows: self.local.clone(),
            queues: self.queues.clone(),
            orphans: self.orphans.clone(),
            shares: self.shares.clone(),
            saved_zones: self.saved_zones.clone(),
        }
    }

    /// Restore persisted state into this (freshly constructed) instance.
    /// The engine stays stopped; `start()` resumes draining from the front
    /// of the restored queues.
    pub fn import_state(&mut self, snapshot: EngineSnapshot) -> Result<()> {
        snapshot.validate(&self.schema)?;
        if snapshot.node_id != self.node_id {
            return Err(Error::InvalidSnapshot(format!(
                "node id mismatch: expected '{}', got '{}'",
                self.node_id, snapshot.node_id
            )));
        }

        self.current_owner = snapshot.current_owner;
        self.default_zone = snapshot.default_zone;
        self.clock = snapshot.clock;
        self.metadata = snapshot.metadata;
        self.local = snapshot.local_rows;
        self.queues = snapshot.queues;
        self.orphans = snapshot.orphans;
        self.shares = snapshot.shares;
        self.saved_zones = snapshot.saved_zones;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType, ForeignKey, OnDeleteAction, TableSchema};
    use serde_json::json;

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new(1)
            .with_table(TableSchema::new(
                "remindersLists",
                vec![
                    ColumnDef::primary_key("id", ColumnType::Integer),
                    ColumnDef::required("title", ColumnType::Text),
                ],
            ))
            .with_table(
                TableSchema::new(
                    "reminders",
                    vec![
                        ColumnDef::primary_key("id", ColumnType::Integer),
                        ColumnDef::required("title", ColumnType::Text),
                        ColumnDef::nullable("remindersListID", ColumnType::Integer),
                    ],
                )
                .with_foreign_key(ForeignKey::new(
                    "remindersListID",
                    "remindersLists",
                    OnDeleteAction::Cascade,
                )),
            )
    }

    fn engine() -> SyncEngine {
        let mut engine = SyncEngine::new(schema(), "device-1");
        engine.account_changed(Some("alice"));
        engine
    }

    fn row(pairs: &[(&str, serde_json::Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn writes_work_while_stopped() {
        let mut engine = engine();
        assert!(!engine.is_running());

        engine
            .insert(
                "remindersLists",
                row(&[("id", json!(1)), ("title", json!("Personal"))]),
            )
            .unwrap();

        // Metadata exists, nothing was pushed, and no batch is offered.
        let md = engine.metadata_for("remindersLists", "1").unwrap();
        assert!(!md.has_last_known_server_record());
        assert!(engine.next_batch(Scope::Private).is_none());

        // Starting makes the queued work drainable.
        engine.start();
        let batch = engine.next_batch(Scope::Private).unwrap();
        assert_eq!(batch.saves.len(), 1);
        assert_eq!(batch.saves[0].id.record_name, "1:remindersLists");
    }

    #[test]
    fn batch_includes_zone_save_before_records() {
        let mut engine = engine();
        engine.start();
        engine
            .insert(
                "remindersLists",
                row(&[("id", json!(1)), ("title", json!("Personal"))]),
            )
            .unwrap();

        let batch = engine.next_batch(Scope::Private).unwrap();
        assert!(matches!(
            &batch.database_changes[0],
            PendingDatabaseChange::SaveZone(zone) if zone == engine.default_zone()
        ));
    }

    #[test]
    fn in_flight_blocks_second_batch() {
        let mut engine = engine();
        engine.start();
        engine
            .insert(
                "remindersLists",
                row(&[("id", json!(1)), ("title", json!("Personal"))]),
            )
            .unwrap();

        assert!(engine.next_batch(Scope::Private).is_some());
        assert!(engine.next_batch(Scope::Private).is_none());

        engine.handle_send_failure(Scope::Private);
        // Entries were kept; the retry sees them again.
        assert!(engine.next_batch(Scope::Private).is_some());
    }

    #[test]
    fn ack_refreshes_caches_and_clears_queue() {
        let mut engine = engine();
        engine.start();
        engine
            .insert(
                "remindersLists",
                row(&[("id", json!(1)), ("title", json!("Personal"))]),
            )
            .unwrap();

        let batch = engine.next_batch(Scope::Private).unwrap();
        let mut saved = batch.saves[0].clone();
        saved.change_tag = Some("tag-1".into());

        engine.handle_ack(
            Scope::Private,
            &AckBatch {
                saved_records: vec![saved],
                saved_zones: batch
                    .database_changes
                    .iter()
                    .filter_map(|c| match c {
                        PendingDatabaseChange::SaveZone(z) => Some(z.clone()),
                        _ => None,
                    })
                    .collect(),
                ..Default::default()
            },
        );

        let md = engine.metadata_for("remindersLists", "1").unwrap();
        assert!(md.has_last_known_server_record());
        assert!(engine.next_batch(Scope::Private).is_none());
    }

    #[test]
    fn ack_arriving_after_stop_still_applies() {
        let mut engine = engine();
        engine.start();
        engine
            .insert(
                "remindersLists",
                row(&[("id", json!(1)), ("title", json!("Personal"))]),
            )
            .unwrap();
        let batch = engine.next_batch(Scope::Private).unwrap();

        // The send was in flight when the engine stopped.
        engine.stop();
        let mut saved = batch.saves[0].clone();
        saved.change_tag = Some("tag-1".into());
        engine.handle_ack(
            Scope::Private,
            &AckBatch {
                saved_records: vec![saved],
                ..Default::default()
            },
        );

        // The confirmed remote state landed in the metadata store, but no
        // new outbound work is scheduled until start().
        assert!(engine
            .metadata_for("remindersLists", "1")
            .unwrap()
            .has_last_known_server_record());
        assert!(engine.next_batch(Scope::Private).is_none());
    }

    #[test]
    fn unsynced_delete_is_suppressed() {
        let mut engine = engine();
        engine.start();
        engine
            .insert(
                "remindersLists",
                row(&[("id", json!(1)), ("title", json!("Ephemeral"))]),
            )
            .unwrap();
        engine.delete("remindersLists", "1").unwrap();

        // Created and deleted before any drain: no record work to send (the
        // zone save may still be pending).
        if let Some(batch) = engine.next_batch(Scope::Private) {
            assert!(batch.saves.is_empty());
            assert!(batch.deletions.is_empty());
        }
        assert!(!engine.has_metadata("remindersLists", "1"));
    }

    #[test]
    fn share_requires_running_engine() {
        let mut engine = engine();
        engine
            .insert(
                "remindersLists",
                row(&[("id", json!(1)), ("title", json!("Personal"))]),
            )
            .unwrap();

        let err = engine.share("remindersLists", "1", |_| {}).unwrap_err();
        assert_eq!(err, Error::SyncEngineNotRunning);
    }

    #[test]
    fn share_requires_metadata() {
        let mut engine = engine();
        engine.start();
        let err = engine.share("remindersLists", "9", |_| {}).unwrap_err();
        assert!(matches!(err, Error::RecordMetadataNotFound { .. }));
    }

    #[test]
    fn share_rejects_child_tables() {
        let mut engine = engine();
        engine.start();
        let err = engine.share("reminders", "1", |_| {}).unwrap_err();
        match err {
            Error::RecordNotRoot { foreign_keys, .. } => {
                assert_eq!(foreign_keys, vec!["remindersListID".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn share_is_idempotent() {
        let mut engine = engine();
        engine.start();
        engine
            .insert(
                "remindersLists",
                row(&[("id", json!(1)), ("title", json!("Personal"))]),
            )
            .unwrap();

        let first = engine
            .share("remindersLists", "1", |share| {
                share.add_participant(crate::share::ShareParticipant::read_write("bob"));
            })
            .unwrap();
        let second = engine
            .share("remindersLists", "1", |share| {
                share.add_participant(crate::share::ShareParticipant::read_only("carol"));
            })
            .unwrap();

        assert_eq!(first.record_name, second.record_name);
        // Second call updated the existing share rather than replacing it.
        assert!(second.participant("bob").is_some());
        assert!(second.participant("carol").is_some());
    }

    #[test]
    fn unshare_clears_reference_and_keeps_record() {
        let mut engine = engine();
        engine.start();
        engine
            .insert(
                "remindersLists",
                row(&[("id", json!(1)), ("title", json!("Personal"))]),
            )
            .unwrap();
        engine.share("remindersLists", "1", |_| {}).unwrap();
        assert!(engine.share_for("remindersLists", "1").is_some());

        engine.unshare("remindersLists", "1").unwrap();
        assert!(engine.share_for("remindersLists", "1").is_none());
        assert!(engine.row("remindersLists", "1").is_some());
        assert!(engine
            .metadata_for("remindersLists", "1")
            .unwrap()
            .share
            .is_none());
    }

    #[test]
    fn sign_out_clears_sync_state_keeps_rows() {
        let mut engine = engine();
        engine
            .insert(
                "remindersLists",
                row(&[("id", json!(1)), ("title", json!("Personal"))]),
            )
            .unwrap();

        engine.account_changed(None);
        assert_eq!(engine.metadata_count(), 0);
        assert!(engine.row("remindersLists", "1").is_some());
        assert_eq!(engine.current_owner(), DEFAULT_OWNER_NAME);
    }

    #[test]
    fn snapshot_relaunch_roundtrip() {
        let mut engine = engine();
        engine
            .insert(
                "remindersLists",
                row(&[("id", json!(1)), ("title", json!("Personal"))]),
            )
            .unwrap();

        let snapshot = engine.export_state();

        let mut relaunched = SyncEngine::new(schema(), "device-1");
        relaunched.import_state(snapshot).unwrap();
        relaunched.start();

        assert_eq!(relaunched.current_owner(), "alice");
        assert!(relaunched.has_metadata("remindersLists", "1"));
        let batch = relaunched.next_batch(Scope::Private).unwrap();
        assert_eq!(batch.saves.len(), 1);
    }

    #[test]
    fn import_rejects_wrong_node() {
        let engine1 = engine();
        let snapshot = engine1.export_state();

        let mut other = SyncEngine::new(schema(), "device-2");
        let err = other.import_state(snapshot).unwrap_err();
        assert!(matches!(err, Error::InvalidSnapshot(_)));
    }

    #[test]
    fn reserved_primary_key_rejected_before_any_mutation() {
        let schema = SchemaDescriptor::new(1).with_table(TableSchema::new(
            "notes",
            vec![
                ColumnDef::primary_key("id", ColumnType::Text),
                ColumnDef::required("body", ColumnType::Text),
            ],
        ));
        let mut engine = SyncEngine::new(schema, "device-1");

        let err = engine
            .insert(
                "notes",
                row(&[("id", json!("_reserved")), ("body", json!("Nope"))]),
            )
            .unwrap_err();
        assert!(matches!(err, Error::ReservedRecordName(_)));
        // The transaction aborted: no row, no metadata.
        assert!(engine.row("notes", "_reserved").is_none());
        assert!(!engine.has_metadata("notes", "_reserved"));
    }
}
