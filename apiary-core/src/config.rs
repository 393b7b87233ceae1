use std::time::Duration;

use crate::merge::DEFAULT_SEPARATOR;
use crate::transform::DEFAULT_PROXIMITY;

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Position distance under which two edits of one field conflict
    pub proximity: u64,
    /// Inserted between two differing texts when merging
    pub merge_separator: String,
    /// Lock ttl when the caller does not supply one
    pub default_lock_ttl: Duration,
    /// Committed operations older than this are pruned on cleanup
    pub operation_retention: Duration,
    /// History entries older than this are pruned on cleanup
    pub history_retention: Duration,
    /// Most recent history entries kept per actor
    pub history_per_actor_cap: usize,
    /// Most recent history entries kept overall
    pub history_global_cap: usize,
    /// Announced operations never committed are dropped after this
    pub pending_window: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            proximity: DEFAULT_PROXIMITY,
            merge_separator: DEFAULT_SEPARATOR.to_string(),
            default_lock_ttl: Duration::from_secs(30),
            operation_retention: Duration::from_secs(24 * 60 * 60), // 24h
            history_retention: Duration::from_secs(30 * 24 * 60 * 60), // 30 days
            history_per_actor_cap: 1000,
            history_global_cap: 1000,
            pending_window: Duration::from_secs(5 * 60),
        }
    }
}

impl CoordinatorConfig {
    /// Config for testing (short windows, small caps).
    pub fn for_testing() -> Self {
        Self {
            default_lock_ttl: Duration::from_secs(1),
            operation_retention: Duration::from_secs(60),
            history_retention: Duration::from_secs(120),
            history_per_actor_cap: 10,
            history_global_cap: 50,
            pending_window: Duration::from_secs(5),
            ..Self::default()
        }
    }
}
