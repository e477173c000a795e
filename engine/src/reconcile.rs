//! Inbound reconciliation: applying remote batches to local state.
//!
//! A batch may arrive out of order, duplicated, or concurrently with local
//! edits. The rules, in the order they are checked per record:
//!
//! - a child whose parent is unknown locally is buffered, not materialized
//! - a record never seen before materializes a local row plus metadata
//! - a replayed snapshot identical to the cached one is a no-op
//! - a remote snapshot older than the latest local edit is informational:
//!   caches refresh, local values survive, the queued save re-asserts them
//! - otherwise the newer side by logical clock wins at record granularity
//!
//! Deletions hard-delete rows and metadata, cascading through local
//! foreign-key semantics without emitting outbound work.

use crate::{
    capture,
    graph::OrphanBuffer,
    local::{key_string, LocalStore, RowChange},
    metadata::{MetadataStore, SyncMetadata},
    queue::{PendingQueues, PendingRecordZoneChange},
    record::{split_record_name, RecordIdentity, Scope, ZoneId},
    schema::{ColumnType, SchemaDescriptor, TableSchema},
    share::{self, ShareRecord, ShareRegistry},
    ChangeCursor, FieldMap, LogicalClock, RecordName, RemoteRecord, Result, TableName,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// A record deletion reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDeletion {
    pub identity: RecordIdentity,
    pub record_type: TableName,
}

/// One scope's worth of fetched remote changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteBatch {
    pub modifications: Vec<RemoteRecord>,
    pub deletions: Vec<RecordDeletion>,
    pub shares: Vec<ShareRecord>,
    pub deleted_shares: Vec<RecordName>,
    pub new_cursor: Option<ChangeCursor>,
}

/// What applying a batch did, for introspection and tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    /// Records whose remote state was applied locally
    pub applied: Vec<RecordName>,
    /// Records whose local edits outrank the received snapshot
    pub preserved_local: Vec<RecordName>,
    /// Records held back until their parent arrives
    pub buffered: Vec<RecordName>,
    /// Records removed locally
    pub deleted: Vec<RecordName>,
}

/// Engine state reconciliation borrows for one apply pass.
pub(crate) struct ReconcileEnv<'a> {
    pub schema: &'a SchemaDescriptor,
    pub metadata: &'a mut MetadataStore,
    pub local: &'a mut LocalStore,
    pub queues: &'a mut PendingQueues,
    pub shares: &'a mut ShareRegistry,
    pub orphans: &'a mut OrphanBuffer,
    pub clock: &'a mut LogicalClock,
    pub current_owner: &'a str,
    pub saved_zones: &'a mut BTreeSet<ZoneId>,
}

/// Apply one inbound batch. Idempotent: re-applying the same batch leaves
/// the same state.
pub(crate) fn apply_batch(
    env: &mut ReconcileEnv<'_>,
    scope: Scope,
    batch: &RemoteBatch,
) -> Result<ApplyOutcome> {
    let mut outcome = ApplyOutcome::default();
    debug!(
        ?scope,
        modifications = batch.modifications.len(),
        deletions = batch.deletions.len(),
        shares = batch.shares.len(),
        "applying remote batch"
    );

    for share in &batch.shares {
        apply_share(env, share);
    }
    for share_name in &batch.deleted_shares {
        if let Some(removed) = env.shares.remove_by_name(share_name) {
            if let Some(root) = env.metadata.get_mut(&removed.root_record_name) {
                root.share = None;
            }
        }
    }

    for record in &batch.modifications {
        apply_modification(env, record, &mut outcome)?;
    }
    for deletion in &batch.deletions {
        apply_deletion(env, deletion, &mut outcome)?;
    }

    Ok(outcome)
}

fn apply_share(env: &mut ReconcileEnv<'_>, share: &ShareRecord) {
    env.saved_zones.insert(share.zone.clone());
    if let Some(root) = env.metadata.get_mut(&share.root_record_name) {
        root.share = Some(share.record_name.clone());
    }
    env.shares.insert(share.clone());
}

fn apply_modification(
    env: &mut ReconcileEnv<'_>,
    record: &RemoteRecord,
    outcome: &mut ApplyOutcome,
) -> Result<()> {
    if try_apply(env, record, outcome)? {
        // Anything waiting on this record (or on records it unblocked) can
        // drain now, transitively.
        let mut unblocked = vec![record.id.record_name.clone()];
        while let Some(parent_name) = unblocked.pop() {
            for child in env.orphans.take_children(&parent_name) {
                let child_name = child.id.record_name.clone();
                if try_apply(env, &child, outcome)? {
                    unblocked.push(child_name);
                }
            }
        }
    }
    Ok(())
}

/// Apply one remote record. Returns true when the record materialized or
/// merged (i.e. its children are no longer orphans).
fn try_apply(
    env: &mut ReconcileEnv<'_>,
    record: &RemoteRecord,
    outcome: &mut ApplyOutcome,
) -> Result<bool> {
    let name = record.id.record_name.clone();
    env.clock.observe(&record.modification_clock);
    env.saved_zones.insert(record.id.zone.clone());

    let Some((primary_key, table)) = split_record_name(&name).map(|(pk, t)| (pk.to_string(), t.to_string())) else {
        trace!(record = %name, "ignoring record with undecodable name");
        return Ok(false);
    };
    let Some(table_schema) = env.schema.table(&table) else {
        trace!(record = %name, table = %table, "ignoring record of unsynchronized type");
        return Ok(false);
    };

    if let Some(parent) = &record.parent {
        if env.metadata.get(&parent.record_name).is_none() {
            trace!(record = %name, parent = %parent.record_name, "buffering orphan");
            env.orphans.buffer(record.clone());
            outcome.buffered.push(name);
            return Ok(false);
        }
    }

    enum Decision {
        Materialize,
        RefreshTombstone,
        Noop,
        Accept { superseded_local_edit: bool },
        Preserve,
    }

    let decision = match env.metadata.get(&name) {
        None => Decision::Materialize,
        Some(md) if md.is_deleted => Decision::RefreshTombstone,
        Some(md) => {
            let cached = md.last_known_server_record_all_fields.as_ref();
            let unchanged = cached
                .is_some_and(|c| c.change_tag == record.change_tag && c.fields == record.fields);
            if unchanged {
                Decision::Noop
            } else {
                let locally_edited = match cached {
                    Some(c) => c
                        .modification_clock
                        .happened_before(&md.user_modification_time),
                    // Metadata without a cache means the first push is pending.
                    None => true,
                };
                let remote_newer = md
                    .user_modification_time
                    .happened_before(&record.modification_clock);

                if !locally_edited {
                    Decision::Accept {
                        superseded_local_edit: false,
                    }
                } else if remote_newer {
                    Decision::Accept {
                        superseded_local_edit: true,
                    }
                } else {
                    Decision::Preserve
                }
            }
        }
    };

    match decision {
        Decision::Materialize => {
            materialize(env, record, table_schema, &table, &primary_key)?;
            outcome.applied.push(name);
            Ok(true)
        }
        Decision::RefreshTombstone => {
            // A local tombstone is still awaiting its outbound delete; the
            // remote snapshot only refreshes what we know of the server.
            let mapped = mapped_snapshot(record, table_schema);
            if let Some(md) = env.metadata.get_mut(&name) {
                md.last_known_server_record = Some(mapped);
                md.last_known_server_record_all_fields = Some(record.clone());
            }
            outcome.preserved_local.push(name);
            Ok(true)
        }
        Decision::Noop => {
            outcome.applied.push(name);
            Ok(true)
        }
        Decision::Accept {
            superseded_local_edit,
        } => {
            accept_remote(
                env,
                record,
                table_schema,
                &table,
                &primary_key,
                superseded_local_edit,
            )?;
            outcome.applied.push(name);
            Ok(true)
        }
        Decision::Preserve => {
            // Stale remote: the server does not yet know about the local
            // edit. Remember what the server holds; our queued save wins.
            let mapped = mapped_snapshot(record, table_schema);
            if let Some(md) = env.metadata.get_mut(&name) {
                md.last_known_server_record = Some(mapped);
                md.last_known_server_record_all_fields = Some(record.clone());
            }
            trace!(record = %name, "preserving local edits over stale remote snapshot");
            outcome.preserved_local.push(name);
            Ok(true)
        }
    }
}

/// First sight of a record: create the local row and its metadata.
fn materialize(
    env: &mut ReconcileEnv<'_>,
    record: &RemoteRecord,
    table_schema: &TableSchema,
    table: &str,
    primary_key: &str,
) -> Result<()> {
    let row = mapped_row(record, table_schema, primary_key);
    let change = if env.local.contains(table, primary_key) {
        RowChange::Updated {
            table: table.to_string(),
            primary_key: primary_key.to_string(),
            old: env
                .local
                .get(table, primary_key)
                .cloned()
                .unwrap_or_default(),
            new: row,
        }
    } else {
        RowChange::Inserted {
            table: table.to_string(),
            primary_key: primary_key.to_string(),
            new: row,
        }
    };
    env.local.apply(&[change]);

    let mut md = SyncMetadata::new(
        table,
        primary_key,
        record.id.zone.clone(),
        record.modification_clock.clone(),
    )?;
    set_parent_from_remote(&mut md, record)?;
    md.share = record
        .share
        .as_ref()
        .map(|share| share.record_name.clone());
    md.last_known_server_record = Some(mapped_snapshot(record, table_schema));
    md.last_known_server_record_all_fields = Some(record.clone());
    env.metadata.put(md);
    Ok(())
}

/// The remote snapshot wins: overwrite mapped columns and refresh metadata.
fn accept_remote(
    env: &mut ReconcileEnv<'_>,
    record: &RemoteRecord,
    table_schema: &TableSchema,
    table: &str,
    primary_key: &str,
    superseded_local_edit: bool,
) -> Result<()> {
    let name = record.id.record_name.clone();

    let old_identity = env
        .metadata
        .get(&name)
        .map(|md| md.identity())
        .unwrap_or_else(|| record.id.clone());
    let zone_changed = old_identity.zone != record.id.zone;

    if superseded_local_edit {
        // Record-level last-writer-wins: the queued save for the superseded
        // edit must not overwrite the fresher remote state.
        let scope = Scope::for_zone(&old_identity.zone, env.current_owner);
        env.queues
            .scope_mut(scope)
            .remove_record_change(&PendingRecordZoneChange::SaveRecord(old_identity.clone()));
    }

    if let Some(old_row) = env.local.get(table, primary_key).cloned() {
        let mut new_row = old_row.clone();
        for (key, value) in mapped_row(record, table_schema, primary_key) {
            new_row.insert(key, value);
        }
        env.local.apply(&[RowChange::Updated {
            table: table.to_string(),
            primary_key: primary_key.to_string(),
            old: old_row,
            new: new_row,
        }]);
    } else {
        env.local.apply(&[RowChange::Inserted {
            table: table.to_string(),
            primary_key: primary_key.to_string(),
            new: mapped_row(record, table_schema, primary_key),
        }]);
    }

    let mapped = mapped_snapshot(record, table_schema);
    if let Some(md) = env.metadata.get_mut(&name) {
        set_parent_from_remote(md, record)?;
        if let Some(share) = &record.share {
            md.share = Some(share.record_name.clone());
        }
        md.zone = record.id.zone.clone();
        md.user_modification_time = record.modification_clock.clone();
        md.last_known_server_record = Some(mapped);
        md.last_known_server_record_all_fields = Some(record.clone());
    }

    if zone_changed {
        // Parent reassignment moved this record across zones; descendants
        // that have not heard about the move yet follow it.
        let children = env.metadata.children_of(&name);
        for child in children {
            share::re_home_subtree(
                env.metadata,
                env.queues,
                env.saved_zones,
                env.current_owner,
                &child,
                &record.id.zone,
            );
        }
    }
    Ok(())
}

fn apply_deletion(
    env: &mut ReconcileEnv<'_>,
    deletion: &RecordDeletion,
    outcome: &mut ApplyOutcome,
) -> Result<()> {
    let name = &deletion.identity.record_name;
    env.orphans.discard(name);

    let Some(md) = env.metadata.get(name) else {
        // Never materialized here; nothing local to remove.
        return Ok(());
    };
    if md.zone != deletion.identity.zone {
        // The record has since re-homed into a different zone; this deletion
        // addresses the stale identity. Skipping it is what makes a move
        // correct regardless of confirmation arrival order.
        return Ok(());
    }

    let Some((primary_key, table)) =
        split_record_name(name).map(|(pk, t)| (pk.to_string(), t.to_string()))
    else {
        return Ok(());
    };

    if env.local.contains(&table, &primary_key) {
        let plan = env.local.plan_delete(env.schema, &table, &primary_key)?;
        env.local.apply(&plan);
        for change in &plan {
            match change {
                RowChange::Deleted {
                    table, primary_key, ..
                } => {
                    let cascade_name = crate::metadata::lookup_name(table, primary_key);
                    env.metadata.hard_delete(&cascade_name);
                    if cascade_name != *name {
                        outcome.deleted.push(cascade_name);
                    }
                }
                RowChange::Updated {
                    table,
                    primary_key,
                    new,
                    ..
                } => {
                    // SET NULL / SET DEFAULT child: linkage recomputes from
                    // the new foreign-key value, placement stays.
                    let child_name = crate::metadata::lookup_name(table, primary_key);
                    let parent = capture::resolve_parent(env.schema, table, new);
                    if let Some(md) = env.metadata.get_mut(&child_name) {
                        md.set_parent(
                            parent.as_ref().map(|(t, pk)| (t.as_str(), pk.as_str())),
                        )?;
                    }
                }
                RowChange::Inserted { .. } => {}
            }
        }
    } else {
        env.metadata.hard_delete(name);
    }

    // Local pending work for a record the server no longer has is moot.
    for scope in [Scope::Private, Scope::Shared] {
        let queue = env.queues.scope_mut(scope);
        queue.remove_record_change(&PendingRecordZoneChange::SaveRecord(
            deletion.identity.clone(),
        ));
        queue.remove_record_change(&PendingRecordZoneChange::DeleteRecord(
            deletion.identity.clone(),
        ));
    }

    outcome.deleted.push(name.clone());
    Ok(())
}

/// Owner revoked access or deleted the zone: every local row and metadata
/// row in the zone goes, regardless of per-row foreign-key rules.
pub(crate) fn apply_zone_deletion(
    env: &mut ReconcileEnv<'_>,
    scope: Scope,
    zone: &ZoneId,
) -> Vec<RecordName> {
    let names = env.metadata.in_zone(zone);
    for name in &names {
        if let Some((primary_key, table)) = split_record_name(name) {
            env.local.remove(table, primary_key);
        }
        env.metadata.hard_delete(name);
    }
    env.orphans.remove_zone(zone);
    env.shares.remove_zone(zone);
    env.queues.scope_mut(scope).remove_zone_records(zone);
    env.saved_zones.remove(zone);
    debug!(?zone, wiped = names.len(), "applied zone deletion");
    names
}

fn set_parent_from_remote(md: &mut SyncMetadata, record: &RemoteRecord) -> Result<()> {
    match &record.parent {
        Some(parent) => match split_record_name(&parent.record_name) {
            Some((pk, table)) => md.set_parent(Some((table, pk))),
            None => md.set_parent(None),
        },
        None => md.set_parent(None),
    }
}

/// Restrict a remote record's fields to those with local columns.
pub(crate) fn mapped_snapshot(record: &RemoteRecord, table_schema: &TableSchema) -> RemoteRecord {
    let mut snapshot = record.clone();
    snapshot.fields = record
        .fields
        .iter()
        .filter(|(key, _)| table_schema.column(key).is_some())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    snapshot
}

/// Build local row values from a remote record's mapped fields.
fn mapped_row(record: &RemoteRecord, table_schema: &TableSchema, primary_key: &str) -> FieldMap {
    let mut row: FieldMap = record
        .fields
        .iter()
        .filter(|(key, _)| table_schema.column(key).is_some())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    if let Some(pk_column) = table_schema.primary_key_column() {
        let present = row
            .get(&pk_column.name)
            .and_then(key_string)
            .is_some_and(|k| k == primary_key);
        if !present {
            row.insert(pk_column.name.clone(), pk_value(pk_column.column_type, primary_key));
        }
    }
    row
}

/// Reconstruct a primary key value from its canonical string form.
fn pk_value(column_type: ColumnType, primary_key: &str) -> Value {
    match column_type {
        ColumnType::Integer | ColumnType::Timestamp => primary_key
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(primary_key.to_string())),
        ColumnType::Real => primary_key
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(primary_key.to_string())),
        ColumnType::Boolean => primary_key
            .parse::<bool>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(primary_key.to_string())),
        ColumnType::Text | ColumnType::Json => Value::String(primary_key.to_string()),
    }
}
