//! # apiary-core: conflict resolution for shared API workspaces
//!
//! Single-authority, in-memory coordination of concurrent editors working on
//! collections of request definitions.
//!
//! ## Architecture
//!
//! ```text
//!  actor ──► Coordinator::submit_operation
//!                 │
//!                 ▼
//!        ┌─────────────────┐   pending   ┌────────────┐
//!        │   Transformer   │ ◄────────── │ PendingSet │
//!        └────────┬────────┘             └────────────┘
//!                 ▼
//!        ┌─────────────────┐
//!        │ Ledger<Operation>│  seq 1, 2, 3, ...
//!        └─────────────────┘
//!
//!  LockManager      one live lock per resource, ttl expiry
//!  VersionMerger    field-level merge with conflict report
//!  HistoryBook      executed requests, bundles, export/import
//!  CollectionRegistry  shared collections and collaborators
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the owner of all state; one call at a time
//! - [`transform`]: positional conflict detection and shifting
//! - [`lock`]: time-bounded resource locks
//! - [`merge`]: two-version field merge
//! - [`ledger`]: append-only, sequence-stamped log with retention
//! - [`history`]: request/response history and bundles
//! - [`collection`]: live shared collections
//!
//! Ordering is decided by ledger sequence numbers only. Wall-clock time is
//! read for lock expiry and informational timestamps.

pub mod clock;
pub mod collection;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod ledger;
pub mod lock;
pub mod merge;
pub mod operation;
pub mod transform;
pub mod value;

/// Opaque participant identity.
pub type ActorId = String;

/// Opaque identifier of a lockable resource.
pub type ResourceId = String;

pub use clock::{Clock, ManualClock, Millis, SystemClock};
pub use collection::{Collection, CollectionRegistry, CollectionRequest};
pub use config::CoordinatorConfig;
pub use coordinator::{CleanupReport, Coordinator, LockResult};
pub use error::{CoreError, CoreResult, RecordKind};
pub use history::{
    Auth, Bundle, BundleOrigin, BundleRequest, ExportFormat, ExportedBundle, Headers,
    HistoryBook, HistoryEntry, HistoryMetadata, ResponseEnvelope, StoredRequest,
};
pub use ledger::{Ledger, LedgerEntry, LedgerError, PruneStats};
pub use lock::{LockDenied, LockGrant, LockManager, ResourceLock};
pub use merge::{FieldConflict, MergeResolution, MergedRecord, VersionMerger};
pub use operation::{ConflictMetadata, Operation, OperationKind, TransformResolution};
pub use transform::{PendingSet, Transformer};
pub use value::{field_map, FieldMap, FieldValue, MAX_NESTING};
