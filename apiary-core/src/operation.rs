//! Edit intents submitted by participants.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Millis;
use crate::ledger::LedgerEntry;
use crate::value::FieldValue;
use crate::ActorId;

/// What an operation does.
///
/// Only [`OperationKind::Edit`] carries a position, so only edits can take
/// part in positional conflict detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Insert `text` into `field` at `position`.
    Edit {
        field: String,
        position: u64,
        text: Option<String>,
    },
    Add {
        target: String,
        payload: FieldValue,
    },
    Delete {
        target: String,
    },
    /// Run a request definition.
    Test {
        target: String,
    },
    Save {
        target: String,
    },
    /// Application-specific action not known to the core.
    Custom {
        name: String,
        payload: FieldValue,
    },
}

impl OperationKind {
    pub fn edit(field: impl Into<String>, position: u64, text: Option<&str>) -> Self {
        OperationKind::Edit {
            field: field.into(),
            position,
            text: text.map(str::to_string),
        }
    }

    /// Lower-case verb naming the kind.
    pub fn verb(&self) -> &str {
        match self {
            OperationKind::Edit { .. } => "edit",
            OperationKind::Add { .. } => "add",
            OperationKind::Delete { .. } => "delete",
            OperationKind::Test { .. } => "test",
            OperationKind::Save { .. } => "save",
            OperationKind::Custom { name, .. } => name,
        }
    }
}

/// Resolution applied by the transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformResolution {
    Merged,
}

impl TransformResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformResolution::Merged => "merged",
        }
    }
}

/// Present on an operation the transformer had to adjust.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictMetadata {
    /// The operation as it stood before this resolution.
    pub original: Box<Operation>,
    /// Actor whose pending operation it collided with.
    pub conflicted_with: ActorId,
    pub resolution: TransformResolution,
}

/// An edit or action intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub actor: ActorId,
    pub submitted_at: Millis,
    /// Ledger position; `None` until committed.
    pub sequence: Option<u64>,
    pub conflict: Option<ConflictMetadata>,
}

impl Operation {
    pub fn new(kind: OperationKind, actor: impl Into<ActorId>, submitted_at: Millis) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            actor: actor.into(),
            submitted_at,
            sequence: None,
            conflict: None,
        }
    }

    /// Create with an explicit id (for testing and re-submission).
    pub fn with_id(
        id: Uuid,
        kind: OperationKind,
        actor: impl Into<ActorId>,
        submitted_at: Millis,
    ) -> Self {
        Self {
            id,
            ..Self::new(kind, actor, submitted_at)
        }
    }

    pub fn is_committed(&self) -> bool {
        self.sequence.is_some()
    }

    pub fn was_transformed(&self) -> bool {
        self.conflict.is_some()
    }

    /// Position of an edit, `None` for other kinds.
    pub fn position(&self) -> Option<u64> {
        match &self.kind {
            OperationKind::Edit { position, .. } => Some(*position),
            _ => None,
        }
    }
}

impl LedgerEntry for Operation {
    fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    fn stamp(&mut self, sequence: u64) {
        self.sequence = Some(sequence);
    }

    fn timestamp(&self) -> Millis {
        self.submitted_at
    }

    fn actor(&self) -> &str {
        &self.actor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_operation_is_uncommitted() {
        let op = Operation::new(OperationKind::edit("url", 3, Some("x")), "alice", 10);
        assert!(!op.is_committed());
        assert!(!op.was_transformed());
        assert_eq!(op.position(), Some(3));
        assert_eq!(op.kind.verb(), "edit");
    }

    #[test]
    fn test_non_edit_has_no_position() {
        let op = Operation::new(
            OperationKind::Delete {
                target: "req-1".into(),
            },
            "bob",
            0,
        );
        assert_eq!(op.position(), None);
        assert_eq!(op.kind.verb(), "delete");
    }

    #[test]
    fn test_custom_verb() {
        let kind = OperationKind::Custom {
            name: "rename".into(),
            payload: FieldValue::Null,
        };
        assert_eq!(kind.verb(), "rename");
        assert_eq!(TransformResolution::Merged.as_str(), "merged");
    }
}
