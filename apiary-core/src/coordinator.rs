//! Single owner of all session state.
//!
//! ```text
//!  inbound call ──► Coordinator
//!                    ├── Transformer ◄── PendingSet
//!                    │        │
//!                    │        ▼
//!                    ├── Ledger<Operation>   (sequence = total order)
//!                    ├── LockManager         (ttl expiry)
//!                    ├── VersionMerger
//!                    ├── HistoryBook         (Ledger<HistoryEntry> + bundles)
//!                    └── CollectionRegistry
//! ```
//!
//! Every method takes `&mut self`: callers serialize access by owning the
//! coordinator in one task. Nothing in here blocks or awaits.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::clock::{duration_ms, Clock, Millis, SystemClock};
use crate::collection::{Collection, CollectionRegistry, CollectionRequest};
use crate::config::CoordinatorConfig;
use crate::error::{CoreError, CoreResult, RecordKind};
use crate::history::{
    Bundle, ExportFormat, ExportedBundle, HistoryBook, HistoryEntry, ResponseEnvelope,
    StoredRequest,
};
use crate::ledger::{Ledger, PruneStats};
use crate::lock::{LockDenied, LockGrant, LockManager, ResourceLock};
use crate::merge::{MergedRecord, VersionMerger};
use crate::operation::{Operation, OperationKind};
use crate::transform::{PendingSet, Transformer};
use crate::value::FieldMap;
use crate::{ActorId, ResourceId};

/// Outcome of a lock request.
pub type LockResult = Result<LockGrant, LockDenied>;

/// What one maintenance pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub locks_swept: Vec<ResourceId>,
    pub operations_pruned: usize,
    pub history_pruned: PruneStats,
    pub pending_expired: usize,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    locks: LockManager,
    pending: PendingSet,
    operations: Ledger<Operation>,
    transformer: Transformer,
    merger: VersionMerger,
    history: HistoryBook,
    collections: CollectionRegistry,
}

impl Coordinator {
    /// Create a coordinator on the system clock.
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_defaults() -> Self {
        Self::new(CoordinatorConfig::default())
    }

    pub fn with_clock(config: CoordinatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            transformer: Transformer::new(config.proximity),
            merger: VersionMerger::new(config.merge_separator.clone()),
            history: HistoryBook::new(config.history_global_cap),
            locks: LockManager::new(),
            pending: PendingSet::new(),
            operations: Ledger::new(),
            collections: CollectionRegistry::new(),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn now(&self) -> Millis {
        self.clock.now_ms()
    }

    // ── Operations ────────────────────────────────────────────────

    /// Transform `kind` against the pending set and commit it.
    pub fn submit_operation(&mut self, kind: OperationKind, actor: &str) -> CoreResult<Operation> {
        let op = Operation::new(kind, actor, self.now());
        self.commit(op)
    }

    /// Announce an operation without committing it.
    ///
    /// Later submissions by other actors are transformed against it until it
    /// is committed with [`submit_proposed`](Self::submit_proposed),
    /// acknowledged, or expires.
    pub fn propose_operation(&mut self, kind: OperationKind, actor: &str) -> Operation {
        let op = Operation::new(kind, actor, self.now());
        log::debug!("{actor} proposed {} operation {}", op.kind.verb(), op.id);
        self.pending.insert(op.clone());
        op
    }

    /// Commit a previously proposed operation.
    pub fn submit_proposed(&mut self, id: &Uuid, actor: &str) -> CoreResult<Operation> {
        let op = match self.pending.get(id) {
            Some(op) if op.actor == actor => op.clone(),
            _ => return Err(CoreError::not_found(RecordKind::PendingOperation, id)),
        };
        self.commit(op)
    }

    /// Drop every pending operation of `actor`.
    pub fn acknowledge(&mut self, actor: &str) -> usize {
        self.pending.acknowledge(actor)
    }

    fn commit(&mut self, op: Operation) -> CoreResult<Operation> {
        let mut op = self.transformer.transform(op, &self.pending);
        self.pending.remove(&op.id);

        let seq = self.operations.append(op.clone())?;
        op.sequence = Some(seq);

        match &op.conflict {
            Some(meta) => log::info!(
                "{} {} committed at seq {seq} after resolving conflict with {}",
                op.actor,
                op.kind.verb(),
                meta.conflicted_with
            ),
            None => log::debug!("{} {} committed at seq {seq}", op.actor, op.kind.verb()),
        }
        Ok(op)
    }

    /// Committed operations, newest first.
    pub fn recent_operations(&self, limit: usize) -> Vec<Operation> {
        self.operations.recent(limit).into_iter().cloned().collect()
    }

    pub fn pending(&self) -> &PendingSet {
        &self.pending
    }

    // ── Locks ─────────────────────────────────────────────────────

    /// Acquire `resource` for `actor`; `ttl` defaults to the configured one.
    ///
    /// A zero ttl is rejected before the lock table is consulted.
    pub fn acquire_lock(
        &mut self,
        resource: &str,
        actor: &str,
        ttl: Option<Duration>,
    ) -> CoreResult<LockResult> {
        let ttl = ttl.unwrap_or(self.config.default_lock_ttl);
        if ttl.is_zero() {
            return Err(CoreError::InvalidArgument("lock ttl must be positive".into()));
        }
        if resource.is_empty() {
            return Err(CoreError::InvalidArgument("resource id must not be empty".into()));
        }
        let now = self.now();
        Ok(self.locks.acquire(resource, actor, ttl, now))
    }

    pub fn release_lock(&mut self, resource: &str, actor: &str) -> bool {
        self.locks.release(resource, actor)
    }

    pub fn lock_holder(&self, resource: &str) -> Option<ResourceLock> {
        self.locks.holder(resource, self.now()).cloned()
    }

    pub fn live_locks(&self) -> Vec<ResourceLock> {
        self.locks.live_locks(self.now())
    }

    // ── Merge ─────────────────────────────────────────────────────

    pub fn merge_versions(
        &self,
        base: &FieldMap,
        incoming: &FieldMap,
        actor: &str,
    ) -> MergedRecord {
        self.merger.merge(base, incoming, actor, self.now())
    }

    // ── History ───────────────────────────────────────────────────

    pub fn save_history_entry(
        &mut self,
        request: StoredRequest,
        response: ResponseEnvelope,
        actor: &str,
        extra: Option<FieldMap>,
    ) -> CoreResult<HistoryEntry> {
        let now = self.now();
        Ok(self
            .history
            .save(request, response, actor, extra.unwrap_or_default(), now)?)
    }

    pub fn user_history(&self, actor: &str, limit: usize) -> Vec<HistoryEntry> {
        self.history.user_history(actor, limit)
    }

    pub fn all_history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.history.all_history(limit)
    }

    pub fn replay(&self, history_id: &Uuid, actor: &str) -> CoreResult<StoredRequest> {
        self.history.replay(history_id, actor)
    }

    pub fn bundle(
        &mut self,
        name: &str,
        history_ids: &[Uuid],
        actor: &str,
        description: Option<&str>,
    ) -> CoreResult<Bundle> {
        let now = self.now();
        self.history
            .bundle(name, history_ids, actor, description.unwrap_or(""), now)
    }

    pub fn export_bundle(
        &self,
        bundle_id: &Uuid,
        format: ExportFormat,
    ) -> CoreResult<ExportedBundle> {
        self.history.export_bundle(bundle_id, format, self.now())
    }

    pub fn import_bundle(&mut self, payload: &str, actor: &str) -> CoreResult<Bundle> {
        let now = self.now();
        self.history.import_bundle(payload, actor, now)
    }

    // ── Collections ───────────────────────────────────────────────

    pub fn create_collection(
        &mut self,
        name: &str,
        description: &str,
        actor: &str,
    ) -> CoreResult<Collection> {
        let now = self.now();
        self.collections.create(name, description, actor, now)
    }

    pub fn join_collection(&mut self, id: &Uuid, actor: &str) -> CoreResult<Collection> {
        self.collections.join(id, actor)
    }

    pub fn add_request_to_collection(
        &mut self,
        id: &Uuid,
        request: StoredRequest,
        actor: &str,
    ) -> CoreResult<(CollectionRequest, Vec<ActorId>)> {
        let now = self.now();
        self.collections.add_request(id, request, actor, now)
    }

    pub fn collections_for(&self, actor: &str) -> Vec<Collection> {
        self.collections.for_actor(actor)
    }

    pub fn collection(&self, id: &Uuid) -> Option<&Collection> {
        self.collections.get(id)
    }

    // ── Maintenance ───────────────────────────────────────────────

    /// Sweep expired locks and apply every retention policy at `now`.
    pub fn cleanup(&mut self, now: Millis) -> CleanupReport {
        let report = CleanupReport {
            locks_swept: self.locks.sweep(now),
            operations_pruned: self
                .operations
                .prune_older_than(self.config.operation_retention, now),
            history_pruned: self.history.prune(
                self.config.history_retention,
                self.config.history_per_actor_cap,
                now,
            ),
            pending_expired: self
                .pending
                .expire_before(now.saturating_sub(duration_ms(self.config.pending_window))),
        };

        log::info!(
            "Cleanup: {} lock(s) swept, {} operation(s) and {} history entr(ies) pruned, \
             {} pending expired",
            report.locks_swept.len(),
            report.operations_pruned,
            report.history_pruned.total(),
            report.pending_expired
        );
        report
    }

    /// [`cleanup`](Self::cleanup) at the coordinator's current time.
    pub fn cleanup_now(&mut self) -> CleanupReport {
        let now = self.now();
        self.cleanup(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::history::ExportFormat;
    use crate::value::{field_map, FieldValue};
    use pretty_assertions::assert_eq;

    const HOUR: Duration = Duration::from_secs(60 * 60);
    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn coordinator() -> (Coordinator, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let coordinator =
            Coordinator::with_clock(CoordinatorConfig::default(), Arc::new(clock.clone()));
        (coordinator, clock)
    }

    #[test]
    fn test_sequence_numbers_strictly_increase() {
        let (mut c, clock) = coordinator();
        let mut last = 0;
        for i in 0..20 {
            let op = c
                .submit_operation(OperationKind::edit("url", i * 20, Some("x")), "alice")
                .unwrap();
            let seq = op.sequence.unwrap();
            assert!(seq > last);
            last = seq;
            clock.advance(Duration::from_millis(1));
        }
        let recent: Vec<u64> = c
            .recent_operations(3)
            .iter()
            .filter_map(|op| op.sequence)
            .collect();
        assert_eq!(recent, vec![20, 19, 18]);
    }

    #[test]
    fn test_proposed_operation_shifts_other_actor() {
        let (mut c, _) = coordinator();
        let bob = c.propose_operation(OperationKind::edit("url", 15, Some("ALEX")), "Bob");
        assert_eq!(c.pending().len(), 1);

        let alice = c
            .submit_operation(OperationKind::edit("url", 10, None), "Alice")
            .unwrap();
        assert_eq!(alice.position(), Some(19));
        assert_eq!(alice.conflict.as_ref().unwrap().conflicted_with, "Bob");

        // committing the announced operation does not shift it against itself
        let committed = c.submit_proposed(&bob.id, "Bob").unwrap();
        assert_eq!(committed.position(), Some(15));
        assert!(committed.conflict.is_none());
        assert!(c.pending().is_empty());
        assert!(committed.sequence.unwrap() > alice.sequence.unwrap());
    }

    #[test]
    fn test_submit_proposed_by_other_actor_rejected() {
        let (mut c, _) = coordinator();
        let bob = c.propose_operation(OperationKind::edit("url", 1, None), "Bob");
        assert!(matches!(
            c.submit_proposed(&bob.id, "Alice"),
            Err(CoreError::NotFound {
                kind: RecordKind::PendingOperation,
                ..
            })
        ));
        assert_eq!(c.acknowledge("Bob"), 1);
        assert!(c.submit_proposed(&bob.id, "Bob").is_err());
    }

    #[test]
    fn test_lock_contention_and_release() {
        let (mut c, clock) = coordinator();
        let grant = c.acquire_lock("req-1", "alice", None).unwrap().unwrap();
        assert_eq!(grant.ttl, Duration::from_secs(30));

        clock.advance(Duration::from_millis(10_500));
        let denied = c.acquire_lock("req-1", "bob", None).unwrap().unwrap_err();
        assert_eq!(denied.holder, "alice");
        assert_eq!(denied.wait_secs(), 20);

        assert!(!c.release_lock("req-1", "bob"));
        assert_eq!(c.lock_holder("req-1").unwrap().holder, "alice");
        assert!(c.release_lock("req-1", "alice"));
        assert!(c.acquire_lock("req-1", "bob", None).unwrap().is_ok());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let (mut c, _) = coordinator();
        assert!(matches!(
            c.acquire_lock("r", "alice", Some(Duration::ZERO)),
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(c.live_locks().is_empty());
    }

    #[test]
    fn test_cleanup_sweeps_expired_locks_only() {
        let (mut c, clock) = coordinator();
        c.acquire_lock("old", "alice", Some(Duration::from_secs(10))).unwrap().unwrap();
        clock.advance(Duration::from_secs(5));
        c.acquire_lock("fresh", "bob", Some(Duration::from_secs(10))).unwrap().unwrap();
        clock.advance(Duration::from_secs(5));

        let report = c.cleanup(clock.now_ms());
        assert_eq!(report.locks_swept, vec!["old".to_string()]);
        assert_eq!(c.live_locks().len(), 1);
        assert_eq!(c.lock_holder("fresh").unwrap().holder, "bob");
    }

    #[test]
    fn test_cleanup_prunes_history_and_operations_by_age() {
        let (mut c, clock) = coordinator();
        let old = c
            .save_history_entry(
                StoredRequest::new("GET", "https://httpbin.org/get"),
                ResponseEnvelope::new(200),
                "alice",
                None,
            )
            .unwrap();
        c.submit_operation(OperationKind::Save { target: "c1".into() }, "alice")
            .unwrap();

        clock.advance(DAY * 29);
        let fresh = c
            .save_history_entry(
                StoredRequest::new("GET", "https://httpbin.org/get"),
                ResponseEnvelope::new(200),
                "alice",
                None,
            )
            .unwrap();
        clock.advance(DAY + HOUR);

        let report = c.cleanup_now();
        assert_eq!(report.history_pruned.by_age, 1);
        assert_eq!(report.operations_pruned, 1);
        assert!(c.replay(&old.id, "alice").is_err());
        assert!(c.replay(&fresh.id, "alice").is_ok());
        assert!(c.recent_operations(10).is_empty());
    }

    #[test]
    fn test_cleanup_expires_stale_pending() {
        let (mut c, clock) = coordinator();
        c.propose_operation(OperationKind::edit("url", 1, None), "bob");
        clock.advance(Duration::from_secs(6 * 60));
        assert_eq!(c.cleanup_now().pending_expired, 1);
        assert!(c.pending().is_empty());
    }

    #[test]
    fn test_merge_uses_clock_and_actor() {
        let (c, clock) = coordinator();
        let merged = c.merge_versions(
            &field_map([("x", FieldValue::from("a")), ("y", FieldValue::from(1))]),
            &field_map([("x", FieldValue::from("b")), ("y", FieldValue::from(2))]),
            "carol",
        );
        assert_eq!(merged.merged_at, clock.now_ms());
        assert_eq!(merged.merged_by, "carol");
        assert_eq!(merged.conflicts.len(), 2);
    }

    #[test]
    fn test_bundle_export_import_through_coordinator() {
        let (mut c, _) = coordinator();
        let ids: Vec<Uuid> = ["users", "posts", "comments"]
            .iter()
            .map(|path| {
                c.save_history_entry(
                    StoredRequest::new(
                        "GET",
                        format!("https://jsonplaceholder.typicode.com/{path}"),
                    ),
                    ResponseEnvelope::new(200),
                    "alice",
                    None,
                )
                .unwrap()
                .id
            })
            .collect();

        let bundle = c.bundle("Practice", &ids, "alice", Some("all three")).unwrap();
        let exported = c.export_bundle(&bundle.id, ExportFormat::Json).unwrap();
        let imported = c.import_bundle(&exported.payload, "bob").unwrap();

        assert_eq!(imported.requests.len(), 3);
        assert!(imported.collaborators.contains(&"bob".to_string()));
        assert_eq!(imported.description, "all three");
        assert_eq!(c.bundle("None", &[], "alice", None), Err(CoreError::EmptySelection));
    }

    #[test]
    fn test_collections_flow() {
        let (mut c, _) = coordinator();
        let created = c.create_collection("Shared", "team requests", "alice").unwrap();
        c.join_collection(&created.id, "bob").unwrap();
        let (_, notify) = c
            .add_request_to_collection(
                &created.id,
                StoredRequest::new("GET", "https://api.github.com/zen"),
                "bob",
            )
            .unwrap();
        assert_eq!(notify.len(), 2);
        assert_eq!(c.collections_for("bob").len(), 1);
        assert_eq!(c.collection(&created.id).unwrap().requests.len(), 1);
    }
}
