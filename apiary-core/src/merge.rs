//! Field-level merge of two divergent versions of a record.
//!
//! The merged map starts as a copy of `base`; each field of `incoming` is
//! then overlaid in its insertion order:
//!
//! | base        | incoming    | merged                      | entry           |
//! |-------------|-------------|-----------------------------|-----------------|
//! | absent      | v           | v                           | none            |
//! | v           | v (equal)   | v                           | none            |
//! | text a      | text b      | `a + separator + b`         | `combined`      |
//! | any a       | any b       | b                           | `newer_version` |

use serde::{Deserialize, Serialize};

use crate::clock::Millis;
use crate::value::{FieldMap, FieldValue};
use crate::ActorId;

pub const DEFAULT_SEPARATOR: &str = "\n";

/// How a differing field was reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeResolution {
    /// Both texts kept, base first.
    Combined,
    /// Incoming value won.
    NewerVersion,
}

impl MergeResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeResolution::Combined => "combined",
            MergeResolution::NewerVersion => "newer_version",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub resolution: MergeResolution,
}

/// Output of [`VersionMerger::merge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub fields: FieldMap,
    pub base: FieldMap,
    pub incoming: FieldMap,
    pub merged_by: ActorId,
    pub merged_at: Millis,
    pub conflicts: Vec<FieldConflict>,
}

impl MergedRecord {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn conflict_for(&self, field: &str) -> Option<MergeResolution> {
        self.conflicts
            .iter()
            .find(|c| c.field == field)
            .map(|c| c.resolution)
    }
}

#[derive(Debug, Clone)]
pub struct VersionMerger {
    separator: String,
}

impl Default for VersionMerger {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR)
    }
}

impl VersionMerger {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }

    pub fn merge(
        &self,
        base: &FieldMap,
        incoming: &FieldMap,
        actor: &str,
        now: Millis,
    ) -> MergedRecord {
        let mut fields = base.clone();
        let mut conflicts = Vec::new();

        for (key, theirs) in incoming {
            let merged = match base.get(key) {
                None => theirs.clone(),
                Some(ours) if ours == theirs => continue,
                Some(FieldValue::Text(ours)) if theirs.is_text() => {
                    conflicts.push(FieldConflict {
                        field: key.clone(),
                        resolution: MergeResolution::Combined,
                    });
                    let theirs = theirs.as_text().unwrap_or_default();
                    FieldValue::Text(format!("{ours}{}{theirs}", self.separator))
                }
                Some(_) => {
                    conflicts.push(FieldConflict {
                        field: key.clone(),
                        resolution: MergeResolution::NewerVersion,
                    });
                    theirs.clone()
                }
            };
            fields.insert(key.clone(), merged);
        }

        log::info!(
            "{actor} merged two versions with {} conflicting field(s)",
            conflicts.len()
        );

        MergedRecord {
            fields,
            base: base.clone(),
            incoming: incoming.clone(),
            merged_by: actor.to_string(),
            merged_at: now,
            conflicts,
        }
    }
}
