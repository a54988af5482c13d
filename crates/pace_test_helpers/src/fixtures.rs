//! Queue entry, payload, and change-event builders

use pace_common::{ChangeEvent, ChangeEventType};
use pace_sync::{Operation, Priority, QueueEntry};
use serde_json::{json, Value};

/// Collection every fixture targets
pub const TABLE: &str = "workouts";

/// A plausible workout payload with the fields the engine cares about
pub fn workout_payload(record_id: &str, owner_id: &str, exercise: &str, updated_at: &str) -> Value {
    json!({
        "id": record_id,
        "owner_id": owner_id,
        "exercise": exercise,
        "duration_min": 30,
        "sets": [],
        "updated_at": updated_at,
    })
}

/// A queue entry for `record_id`, with a payload where the operation needs one
pub fn queue_entry(id: &str, operation: Operation, record_id: &str, priority: Priority) -> QueueEntry {
    let payload = match operation {
        Operation::Delete => None,
        _ => Some(workout_payload(
            record_id,
            "user-1",
            "run",
            "2024-05-01T10:00:00Z",
        )),
    };
    QueueEntry::new(id, operation, TABLE, record_id, payload, priority)
}

pub fn insert_event(record_id: &str, owner_id: &str, payload: Value) -> ChangeEvent {
    ChangeEvent {
        event_type: ChangeEventType::Insert,
        table: TABLE.to_string(),
        record_id: record_id.to_string(),
        owner_id: owner_id.to_string(),
        payload: Some(payload),
    }
}

pub fn update_event(record_id: &str, owner_id: &str, payload: Value) -> ChangeEvent {
    ChangeEvent {
        event_type: ChangeEventType::Update,
        table: TABLE.to_string(),
        record_id: record_id.to_string(),
        owner_id: owner_id.to_string(),
        payload: Some(payload),
    }
}

pub fn delete_event(record_id: &str, owner_id: &str) -> ChangeEvent {
    ChangeEvent {
        event_type: ChangeEventType::Delete,
        table: TABLE.to_string(),
        record_id: record_id.to_string(),
        owner_id: owner_id.to_string(),
        payload: None,
    }
}
