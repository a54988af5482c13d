//! Domain-specific assertions for PaceLog tests

use crate::backend::MockBackend;
use pace_sync::{Priority, QueueEntry};

/// Panic unless the backend attempted exactly these record ids, in order
pub fn assert_attempted_in_order(backend: &MockBackend, expected: &[&str]) {
    let attempted = backend.attempted_ids();
    assert_eq!(
        attempted, expected,
        "attempt order mismatch: got {:?}, expected {:?}",
        attempted, expected
    );
}

/// Panic if a lower-urgency entry precedes a higher-urgency one
pub fn assert_priority_ordered(entries: &[QueueEntry]) {
    let mut last = Priority::Critical;
    for entry in entries {
        assert!(
            entry.priority >= last,
            "entry {} with {:?} priority appears after {:?}",
            entry.id,
            entry.priority,
            last
        );
        last = entry.priority;
    }
}
