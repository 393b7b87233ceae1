//! Positional adjustment of incoming edits against pending ones.
//!
//! Two edits conflict when they touch the same field within `proximity`
//! positions of each other. For every conflicting pending edit, in arrival
//! order, the incoming edit is pushed past the pending edit's inserted text
//! when it would otherwise land at or before it:
//!
//! ```text
//! pending  (bob):    url @15 "ALEX"
//! incoming (alice):  url @10           |10 - 15| < 10  → conflict
//! result   (alice):  url @19           15 + len("ALEX")
//! ```
//!
//! This is a shift-on-conflict policy, not operational-transform
//! composition. An incoming edit positioned after the pending one is
//! flagged but keeps its position.

use uuid::Uuid;

use crate::clock::Millis;
use crate::operation::{ConflictMetadata, Operation, OperationKind, TransformResolution};

/// Default proximity threshold, in position units.
pub const DEFAULT_PROXIMITY: u64 = 10;

/// Operations announced but not yet committed, in arrival order.
#[derive(Debug, Default, Clone)]
pub struct PendingSet {
    ops: Vec<Operation>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation; an existing entry with the same id is replaced in place.
    pub fn insert(&mut self, op: Operation) {
        match self.ops.iter_mut().find(|p| p.id == op.id) {
            Some(slot) => *slot = op,
            None => self.ops.push(op),
        }
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Operation> {
        let index = self.ops.iter().position(|p| &p.id == id)?;
        Some(self.ops.remove(index))
    }

    pub fn get(&self, id: &Uuid) -> Option<&Operation> {
        self.ops.iter().find(|p| &p.id == id)
    }

    /// Drop every pending operation of `actor`. Returns how many were dropped.
    pub fn acknowledge(&mut self, actor: &str) -> usize {
        let before = self.ops.len();
        self.ops.retain(|p| p.actor != actor);
        before - self.ops.len()
    }

    /// Drop operations announced at or before `cutoff`.
    pub fn expire_before(&mut self, cutoff: Millis) -> usize {
        let before = self.ops.len();
        self.ops.retain(|p| p.submitted_at > cutoff);
        before - self.ops.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

/// Applies the shift-on-conflict policy.
#[derive(Debug, Clone, Copy)]
pub struct Transformer {
    proximity: u64,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new(DEFAULT_PROXIMITY)
    }
}

impl Transformer {
    pub fn new(proximity: u64) -> Self {
        Self { proximity }
    }

    pub fn proximity(&self) -> u64 {
        self.proximity
    }

    /// Conflict predicate. Defined over edits only.
    pub fn conflicts(&self, a: &Operation, b: &Operation) -> bool {
        match (&a.kind, &b.kind) {
            (
                OperationKind::Edit {
                    field: fa,
                    position: pa,
                    ..
                },
                OperationKind::Edit {
                    field: fb,
                    position: pb,
                    ..
                },
            ) => fa == fb && pa.abs_diff(*pb) < self.proximity,
            _ => false,
        }
    }

    /// Adjust `incoming` against every conflicting entry of `pending`.
    ///
    /// A pending entry carrying the same id as `incoming` is its own
    /// announcement and is skipped.
    pub fn transform(&self, incoming: Operation, pending: &PendingSet) -> Operation {
        let id = incoming.id;
        let mut op = incoming;
        for other in pending.iter().filter(|p| p.id != id) {
            if self.conflicts(&op, other) {
                op = Self::resolve(op, other);
            }
        }
        op
    }

    fn resolve(op: Operation, other: &Operation) -> Operation {
        log::debug!(
            "Edit by {} conflicts with pending edit by {}",
            op.actor,
            other.actor
        );

        let original = Box::new(op.clone());
        let mut resolved = op;

        if let (
            OperationKind::Edit { position, .. },
            OperationKind::Edit {
                position: other_pos,
                text: other_text,
                ..
            },
        ) = (&mut resolved.kind, &other.kind)
        {
            if *position <= *other_pos {
                let span = other_text
                    .as_deref()
                    .map_or(0, |t| t.chars().count() as u64);
                *position = other_pos.saturating_add(span);
            }
        }

        resolved.conflict = Some(ConflictMetadata {
            original,
            conflicted_with: other.actor.clone(),
            resolution: TransformResolution::Merged,
        });
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn edit(field: &str, position: u64, text: Option<&str>, actor: &str) -> Operation {
        Operation::new(OperationKind::edit(field, position, text), actor, 0)
    }

    fn pending_of(ops: Vec<Operation>) -> PendingSet {
        let mut set = PendingSet::new();
        for op in ops {
            set.insert(op);
        }
        set
    }

    #[test]
    fn test_incoming_before_pending_is_shifted() {
        let pending = pending_of(vec![edit("url", 15, Some("ALEX"), "bob")]);
        let incoming = edit("url", 10, None, "alice");

        let out = Transformer::default().transform(incoming.clone(), &pending);
        assert_eq!(out.position(), Some(19));

        let meta = out.conflict.expect("conflict metadata");
        assert_eq!(meta.conflicted_with, "bob");
        assert_eq!(meta.resolution, TransformResolution::Merged);
        assert_eq!(*meta.original, incoming);
    }

    #[test]
    fn test_different_field_untouched() {
        let pending = pending_of(vec![edit("url", 15, Some("ALEX"), "bob")]);
        let incoming = edit("body", 10, Some("x"), "alice");

        let out = Transformer::default().transform(incoming.clone(), &pending);
        assert_eq!(out, incoming);
        assert!(out.conflict.is_none());
    }

    #[test]
    fn test_outside_proximity_untouched() {
        let pending = pending_of(vec![edit("url", 20, Some("A"), "bob")]);
        let incoming = edit("url", 10, None, "alice");
        let out = Transformer::default().transform(incoming, &pending);
        assert_eq!(out.position(), Some(10));
        assert!(!out.was_transformed());
    }

    #[test]
    fn test_incoming_after_pending_flagged_but_not_moved() {
        let pending = pending_of(vec![edit("url", 15, Some("ALEX"), "bob")]);
        let incoming = edit("url", 18, Some("!"), "alice");

        let out = Transformer::default().transform(incoming, &pending);
        assert_eq!(out.position(), Some(18));
        assert_eq!(out.conflict.unwrap().conflicted_with, "bob");
    }

    #[test]
    fn test_equal_position_shifts() {
        let pending = pending_of(vec![edit("url", 5, Some("abc"), "bob")]);
        let out = Transformer::default().transform(edit("url", 5, None, "alice"), &pending);
        assert_eq!(out.position(), Some(8));
    }

    #[test]
    fn test_pending_without_text_shifts_to_its_position() {
        let pending = pending_of(vec![edit("url", 7, None, "bob")]);
        let out = Transformer::default().transform(edit("url", 2, None, "alice"), &pending);
        assert_eq!(out.position(), Some(7));
    }

    #[test]
    fn test_sequential_shifts_accumulate() {
        // second pending is evaluated against the already-shifted edit
        let pending = pending_of(vec![
            edit("url", 10, Some("ab"), "bob"),
            edit("url", 12, Some("cdef"), "carol"),
        ]);
        let out = Transformer::default().transform(edit("url", 9, None, "alice"), &pending);
        assert_eq!(out.position(), Some(16));

        let meta = out.conflict.unwrap();
        assert_eq!(meta.conflicted_with, "carol");
        // snapshot taken after the first shift
        assert_eq!(meta.original.position(), Some(12));
        assert_eq!(meta.original.conflict.as_ref().unwrap().conflicted_with, "bob");
    }

    #[test]
    fn test_non_edits_never_conflict() {
        let t = Transformer::default();
        let add = Operation::new(
            OperationKind::Add {
                target: "url".into(),
                payload: crate::value::FieldValue::Null,
            },
            "alice",
            0,
        );
        let delete = Operation::new(OperationKind::Delete { target: "url".into() }, "bob", 0);
        assert!(!t.conflicts(&add, &delete));
        assert!(!t.conflicts(&add, &edit("url", 0, None, "bob")));
    }

    #[test]
    fn test_own_announcement_skipped() {
        let op = edit("url", 10, Some("x"), "alice");
        let pending = pending_of(vec![op.clone()]);
        let out = Transformer::default().transform(op.clone(), &pending);
        assert_eq!(out, op);
    }

    #[test]
    fn test_text_length_counts_chars() {
        let pending = pending_of(vec![edit("name", 0, Some("héllo"), "bob")]);
        let out = Transformer::default().transform(edit("name", 0, None, "alice"), &pending);
        assert_eq!(out.position(), Some(5));
    }

    #[test]
    fn test_pending_set_bookkeeping() {
        let a = edit("url", 1, None, "alice");
        let b = edit("url", 2, None, "bob");
        let mut set = pending_of(vec![a.clone(), b.clone(), edit("url", 3, None, "alice")]);
        assert_eq!(set.len(), 3);

        assert_eq!(set.acknowledge("alice"), 2);
        assert!(set.get(&a.id).is_none());
        assert_eq!(set.remove(&b.id).unwrap().actor, "bob");
        assert!(set.is_empty());
    }

    #[test]
    fn test_pending_insert_replaces_same_id() {
        let mut op = edit("url", 1, None, "alice");
        let mut set = PendingSet::new();
        set.insert(op.clone());
        op.kind = OperationKind::edit("url", 4, None);
        set.insert(op.clone());
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&op.id).unwrap().position(), Some(4));
    }

    #[test]
    fn test_pending_expiry() {
        let mut set = PendingSet::new();
        set.insert(Operation::new(OperationKind::edit("a", 0, None), "x", 100));
        set.insert(Operation::new(OperationKind::edit("a", 0, None), "y", 300));
        assert_eq!(set.expire_before(200), 1);
        assert_eq!(set.iter().next().unwrap().actor, "y");
    }

    #[test]
    fn test_shift_near_end_of_range_saturates() {
        let pending = pending_of(vec![edit("url", u64::MAX - 1, Some("ALEX"), "bob")]);
        let incoming = edit("url", u64::MAX - 5, None, "alice");

        let out = Transformer::default().transform(incoming, &pending);
        assert_eq!(out.position(), Some(u64::MAX));
        assert!(out.conflict.is_some());
    }
}
