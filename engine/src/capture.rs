//! Change capture: the per-table mutation hooks.
//!
//! Capture runs inside the same transaction as the local write it observes
//! and turns row changes into metadata mutations plus queued outbound
//! operations. The [`SyncContext`] flag tells capture whether the engine
//! itself is replaying remote state, in which case nothing may be re-emitted
//! outward.

use crate::{
    local::{key_string, RowChange, SyncContext},
    metadata::{lookup_name, MetadataStore, SyncMetadata},
    queue::{PendingDatabaseChange, PendingQueues, PendingRecordZoneChange},
    record::{Scope, ZoneId},
    schema::SchemaDescriptor,
    share::{self, ShareRegistry},
    Error, FieldMap, LogicalClock, PrimaryKey, Result, TableName,
};
use std::collections::{BTreeSet, HashSet};

/// Tables whose mutations are observed. The engine registers every
/// synchronized table here at setup; unregistered tables pass through.
#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    tables: BTreeSet<TableName>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, table: impl Into<TableName>) {
        self.tables.insert(table.into());
    }

    pub fn is_registered(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Everything capture may touch, borrowed from the engine for the duration
/// of one transaction.
pub(crate) struct CaptureEnv<'a> {
    pub schema: &'a SchemaDescriptor,
    pub metadata: &'a mut MetadataStore,
    pub queues: &'a mut PendingQueues,
    pub shares: &'a ShareRegistry,
    pub clock: &'a mut LogicalClock,
    pub default_zone: &'a ZoneId,
    pub current_owner: &'a str,
    pub saved_zones: &'a mut BTreeSet<ZoneId>,
}

/// Resolve the parent reference of a row: the table's single foreign key,
/// when its value is non-null.
pub(crate) fn resolve_parent(
    schema: &SchemaDescriptor,
    table: &str,
    row: &FieldMap,
) -> Option<(TableName, PrimaryKey)> {
    let table_schema = schema.table(table)?;
    let edge = table_schema.parent_edge()?;
    let value = row.get(&edge.column)?;
    let parent_pk = key_string(value)?;
    Some((edge.references.clone(), parent_pk))
}

/// Reject a user write whose root record is governed by a share the current
/// user may not write to. Checked before anything mutates.
pub(crate) fn check_write_permission(
    metadata: &MetadataStore,
    shares: &ShareRegistry,
    schema: &SchemaDescriptor,
    current_owner: &str,
    change: &RowChange,
) -> Result<()> {
    let start = match change {
        RowChange::Inserted { table, new, .. } => {
            // A brand-new row is governed by whatever subtree its parent
            // belongs to; without a parent it is its own (unshared) root.
            match resolve_parent(schema, table, new) {
                Some((parent_table, parent_pk)) => lookup_name(&parent_table, &parent_pk),
                None => return Ok(()),
            }
        }
        RowChange::Updated {
            table, primary_key, ..
        }
        | RowChange::Deleted {
            table, primary_key, ..
        } => lookup_name(table, primary_key),
    };

    let root = metadata.find_root(&start);
    let share = metadata
        .get(&root)
        .and_then(|root_md| root_md.share.as_deref())
        .and_then(|share_name| shares.get_by_name(share_name));

    match share {
        Some(share) if !share.allows_write(current_owner) => Err(Error::WritePermission {
            record_name: lookup_name(change.table(), change.primary_key()),
        }),
        _ => Ok(()),
    }
}

/// Hook entry point: dispatch one observed row change.
pub(crate) fn row_changed(
    env: &mut CaptureEnv<'_>,
    change: &RowChange,
    ctx: SyncContext,
) -> Result<()> {
    match change {
        RowChange::Inserted {
            table,
            primary_key,
            new,
        } => on_insert(env, table, primary_key, new, ctx),
        RowChange::Updated {
            table,
            primary_key,
            new,
            ..
        } => on_update(env, table, primary_key, new, ctx),
        RowChange::Deleted {
            table, primary_key, ..
        } => on_delete(env, table, primary_key, ctx),
    }
}

fn on_insert(
    env: &mut CaptureEnv<'_>,
    table: &str,
    primary_key: &str,
    row: &FieldMap,
    ctx: SyncContext,
) -> Result<()> {
    if ctx.is_synchronizing {
        // The reconciliation engine writes its own metadata; re-emitting here
        // would feed the change straight back into the queue.
        return Ok(());
    }

    let parent = resolve_parent(env.schema, table, row);
    let zone = parent
        .as_ref()
        .and_then(|(pt, ppk)| env.metadata.by_row(pt, ppk))
        .map(|parent_md| parent_md.zone.clone())
        .unwrap_or_else(|| env.default_zone.clone());

    let name = lookup_name(table, primary_key);
    match env.metadata.get(&name) {
        Some(existing) if !existing.is_deleted => {
            // Capture re-entrancy: metadata already present, leave it alone.
            return Ok(());
        }
        _ => {}
    }

    let mut md = SyncMetadata::new(table, primary_key, zone.clone(), env.clock.tick())?;
    md.set_parent(parent.as_ref().map(|(t, pk)| (t.as_str(), pk.as_str())))?;
    let identity = md.identity();
    // Re-inserting a primary key that was deleted before ever syncing starts
    // the record over.
    env.metadata.take_unsynced(&name);
    env.metadata.put(md);

    let scope = Scope::for_zone(&zone, env.current_owner);
    ensure_zone_saved(env, &zone, scope);
    env.queues
        .scope_mut(scope)
        .enqueue_record(PendingRecordZoneChange::SaveRecord(identity));
    Ok(())
}

fn on_update(
    env: &mut CaptureEnv<'_>,
    table: &str,
    primary_key: &str,
    row: &FieldMap,
    ctx: SyncContext,
) -> Result<()> {
    if ctx.is_synchronizing {
        return Ok(());
    }

    let name = lookup_name(table, primary_key);
    if env.metadata.get(&name).is_none() {
        // Invariant: every synchronized row has metadata. Recover by
        // capturing as an insert.
        debug_assert!(false, "update captured for row without metadata: {name}");
        return on_insert(env, table, primary_key, row, ctx);
    }

    // Parent linkage may have changed; re-resolve it from the new values.
    let parent = resolve_parent(env.schema, table, row);
    let parent_zone = parent
        .as_ref()
        .and_then(|(pt, ppk)| env.metadata.by_row(pt, ppk))
        .map(|parent_md| parent_md.zone.clone());

    let tick = env.clock.tick();
    let (identity, zone, needs_re_home) = {
        let md = match env.metadata.get_mut(&name) {
            Some(md) => md,
            None => return Ok(()),
        };
        md.set_parent(parent.as_ref().map(|(t, pk)| (t.as_str(), pk.as_str())))?;
        md.user_modification_time = tick;
        let needs_re_home = parent_zone
            .as_ref()
            .is_some_and(|parent_zone| parent_zone != &md.zone);
        (md.identity(), md.zone.clone(), needs_re_home)
    };

    if let Some(new_zone) = parent_zone.filter(|_| needs_re_home) {
        // The parent lives elsewhere: the record and its subtree follow it.
        share::re_home_subtree(
            env.metadata,
            env.queues,
            env.saved_zones,
            env.current_owner,
            &name,
            &new_zone,
        );
        return Ok(());
    }

    let scope = Scope::for_zone(&zone, env.current_owner);
    env.queues
        .scope_mut(scope)
        .enqueue_record(PendingRecordZoneChange::SaveRecord(identity));
    Ok(())
}

fn on_delete(
    env: &mut CaptureEnv<'_>,
    table: &str,
    primary_key: &str,
    ctx: SyncContext,
) -> Result<()> {
    let name = lookup_name(table, primary_key);

    if ctx.is_synchronizing {
        // An acknowledged remote deletion is the only path that hard-deletes.
        env.metadata.hard_delete(&name);
        return Ok(());
    }

    let Some(md) = env.metadata.get(&name) else {
        debug_assert!(false, "delete captured for row without metadata: {name}");
        return Ok(());
    };

    let identity = md.identity();
    let scope = Scope::for_zone(&identity.zone, env.current_owner);
    let never_synced = !md.has_last_known_server_record();

    env.metadata.mark_deleted(&name);
    if never_synced {
        // Created and deleted before a push ever happened; the queued delete
        // is suppressed at drain time instead of sent.
        env.metadata.mark_unsynced(&name);
    }
    env.queues
        .scope_mut(scope)
        .enqueue_record(PendingRecordZoneChange::DeleteRecord(identity));
    tracing::trace!(record = %name, "tombstoned");
    Ok(())
}

fn ensure_zone_saved(env: &mut CaptureEnv<'_>, zone: &ZoneId, scope: Scope) {
    if !env.saved_zones.contains(zone) {
        env.queues
            .scope_mut(scope)
            .enqueue_database(PendingDatabaseChange::SaveZone(zone.clone()));
    }
}

/// Tombstone an entire locally-deleted subtree without emitting any outbound
/// work: the path taken when a participant deletes a shared root they do not
/// own. The share and its metadata detach locally; the owner's records are
/// untouched remotely.
pub(crate) fn detach_subtree(
    metadata: &mut MetadataStore,
    root_record_name: &str,
) -> Vec<crate::RecordName> {
    let mut names = vec![root_record_name.to_string()];
    names.extend(metadata.find_descendants(root_record_name));
    let mut detached = Vec::new();
    let mut seen = HashSet::new();
    for name in names {
        if seen.insert(name.clone()) && metadata.hard_delete(&name).is_some() {
            detached.push(name);
        }
    }
    detached
}
