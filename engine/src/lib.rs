//! # Tether Engine
//!
//! A bidirectional synchronization engine keeping a local relational store
//! consistent with a remote, multi-device record store under
//! eventual-consistency semantics.
//!
//! Local writes are captured transactionally and queued outward; remote
//! changes (possibly out of order, duplicated, or conflicting) merge in;
//! and a sharing model lets one user's record subtree become visible and
//! editable by other users without duplicating storage.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files, network, or wall clocks;
//!   the host moves batches and feeds acknowledgments back in
//! - **Deterministic**: conflicts resolve by logical clock with a total
//!   order, so every device converges on the same state
//! - **Transactional**: change capture runs inside the same transaction as
//!   the local write; metadata and queues never diverge from row state
//! - **Durable by construction**: queued work survives stop/start and, via
//!   [`EngineSnapshot`], full process relaunches
//!
//! ## Core Concepts
//!
//! ### Metadata shadow store
//!
//! Every synchronized row has exactly one [`SyncMetadata`] row carrying its
//! remote identity, parent linkage, last server-confirmed snapshot,
//! tombstone state, and the [`LogicalClock`] of its latest local edit.
//!
//! ### Change capture
//!
//! Inserts, updates, deletes, and primary-key changes on synchronized
//! tables are observed by per-table hooks registered at setup. A
//! [`SyncContext`] flag distinguishes user writes from engine replays so
//! nothing the engine applies feeds back into the outbound queue.
//!
//! ### Scopes, zones, and sharing
//!
//! Records live in zones owned either by the current account
//! ([`Scope::Private`]) or by someone else ([`Scope::Shared`]). Sharing a
//! root record creates a [`ShareRecord`]; re-pointing a child's foreign key
//! across zones re-homes its whole subtree.
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_engine::{
//!     ColumnDef, ColumnType, FieldMap, Scope, SchemaDescriptor, SyncEngine, TableSchema,
//! };
//! use serde_json::json;
//!
//! // 1. Describe the synchronized tables
//! let schema = SchemaDescriptor::new(1).with_table(TableSchema::new(
//!     "remindersLists",
//!     vec![
//!         ColumnDef::primary_key("id", ColumnType::Integer),
//!         ColumnDef::required("title", ColumnType::Text),
//!     ],
//! ));
//!
//! // 2. Set up the engine
//! let mut engine = SyncEngine::new(schema, "device-1");
//! engine.account_changed(Some("alice"));
//! engine.start();
//!
//! // 3. Local writes are captured transactionally
//! let mut values = FieldMap::new();
//! values.insert("id".into(), json!(1));
//! values.insert("title".into(), json!("Personal"));
//! engine.insert("remindersLists", values).unwrap();
//!
//! let metadata = engine.metadata_for("remindersLists", "1").unwrap();
//! assert_eq!(metadata.record_name, "1:remindersLists");
//!
//! // 4. Drain the pending queue toward the remote store
//! let batch = engine.next_batch(Scope::Private).unwrap();
//! assert_eq!(batch.saves[0].id.record_name, "1:remindersLists");
//! ```
//!
//! ## Persistence
//!
//! [`SyncEngine::export_state`] and [`SyncEngine::import_state`] round-trip
//! an [`EngineSnapshot`]: a freshly constructed engine restored from a
//! snapshot resumes identically to one that never stopped, including
//! undrained queues and buffered orphan children.

pub mod capture;
pub mod clock;
pub mod engine;
pub mod error;
pub mod graph;
pub mod local;
pub mod metadata;
pub mod queue;
pub mod reconcile;
pub mod record;
pub mod schema;
pub mod share;
pub mod snapshot;

// Re-export main types at crate root
pub use capture::HookRegistry;
pub use clock::LogicalClock;
pub use engine::{
    AckBatch, EngineState, OutboundBatch, SyncEngine, DEFAULT_OWNER_NAME, DEFAULT_ZONE_NAME,
};
pub use error::{Error, Result};
pub use graph::{send_order, OrphanBuffer};
pub use local::{LocalStore, RowChange, SyncContext};
pub use metadata::{MetadataStore, SyncMetadata};
pub use queue::{PendingDatabaseChange, PendingQueues, PendingRecordZoneChange, ScopeQueue};
pub use reconcile::{ApplyOutcome, RecordDeletion, RemoteBatch};
pub use record::{
    record_name, split_record_name, validate_record_name, RecordIdentity, RemoteRecord, Scope,
    ZoneId, MAX_RECORD_NAME_BYTES, RESERVED_RECORD_NAME_PREFIX,
};
pub use schema::{
    ColumnDef, ColumnType, ForeignKey, OnDeleteAction, SchemaDescriptor, TableSchema,
};
pub use share::{ShareParticipant, SharePermission, ShareRecord, ShareRegistry};
pub use snapshot::{EngineSnapshot, SnapshotSummary, SNAPSHOT_FORMAT_VERSION};

/// Type aliases for clarity
pub type RecordName = String;
pub type TableName = String;
pub type PrimaryKey = String;
pub type NodeId = String;
pub type ChangeTag = String;
pub type ChangeCursor = String;
pub type SchemaVersion = u32;
pub type FieldMap = serde_json::Map<String, serde_json::Value>;
