//! Conflict detection and resolution

use crate::{new_id, Result, SyncError};
use chrono::{DateTime, Utc};
use pace_common::modified_at;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

/// Kinds of divergence between a local and a remote version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides changed since the shared baseline
    ConcurrentUpdate,

    /// One side deleted, the other updated
    DeleteConflict,

    /// Structurally incompatible payloads
    SchemaMismatch,
}

/// How a conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    ServerWins,
    Merged,
    Manual,
}

/// Who settled it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    System,
    Manual,
}

/// A detected divergence between local and remote state for one record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,

    pub table: String,

    pub record_id: String,

    /// Local contents at detection time; absent when locally deleted
    pub local_version: Option<Value>,

    /// Remote contents at detection time; absent when remotely deleted
    pub server_version: Option<Value>,

    pub conflict_type: ConflictType,

    pub detected_at: DateTime<Utc>,

    pub resolved_at: Option<DateTime<Utc>>,

    pub resolution: Option<Resolution>,

    pub resolved_by: Option<ResolvedBy>,
}

impl ConflictRecord {
    pub fn new(
        table: impl Into<String>,
        record_id: impl Into<String>,
        local_version: Option<Value>,
        server_version: Option<Value>,
        conflict_type: ConflictType,
    ) -> Self {
        Self {
            id: new_id(12),
            table: table.into(),
            record_id: record_id.into(),
            local_version,
            server_version,
            conflict_type,
            detected_at: Utc::now(),
            resolved_at: None,
            resolution: None,
            resolved_by: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    // The resolution triple is only ever set together, and resolved_at
    // never precedes detected_at.
    fn mark_resolved(&mut self, resolution: Resolution, resolved_by: ResolvedBy) {
        self.resolution = Some(resolution);
        self.resolved_by = Some(resolved_by);
        self.resolved_at = Some(Utc::now().max(self.detected_at));
    }
}

/// Classifies divergences and applies resolution policies
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Classify a divergence, if any
    ///
    /// `baseline` is the last version both sides agreed on, when known.
    /// Without one, differing present versions are treated as concurrent:
    /// callers only ask while a local mutation is still pending.
    pub fn detect(
        &self,
        local: Option<&Value>,
        server: Option<&Value>,
        baseline: Option<&Value>,
    ) -> Option<ConflictType> {
        match (local, server) {
            (None, None) => None,
            (Some(local), None) => {
                if baseline.map_or(true, |b| b != local) {
                    Some(ConflictType::DeleteConflict)
                } else {
                    // Local side unchanged; the remote delete is a fast-forward
                    None
                }
            }
            (None, Some(server)) => {
                if baseline.map_or(true, |b| b != server) {
                    Some(ConflictType::DeleteConflict)
                } else {
                    None
                }
            }
            (Some(local), Some(server)) => {
                if json_kind(local) != json_kind(server) {
                    return Some(ConflictType::SchemaMismatch);
                }
                if local == server {
                    return None;
                }
                match baseline {
                    Some(baseline) => {
                        let local_changed = local != baseline;
                        let server_changed = server != baseline;
                        if local_changed && server_changed {
                            Some(ConflictType::ConcurrentUpdate)
                        } else {
                            // One-sided change fast-forwards without conflict
                            None
                        }
                    }
                    None => Some(ConflictType::ConcurrentUpdate),
                }
            }
        }
    }

    /// Attempt automatic resolution; never guesses
    ///
    /// Only concurrent updates whose versions both carry a comparable
    /// modification timestamp are resolved: the later timestamp wins, equal
    /// timestamps keep the local version. Everything else returns `None`
    /// and waits for an explicit `resolve`.
    pub fn auto_resolve(&self, conflict: &mut ConflictRecord) -> Option<Resolution> {
        if conflict.conflict_type != ConflictType::ConcurrentUpdate {
            return None;
        }
        let local_ts = modified_at(conflict.local_version.as_ref()?)?;
        let server_ts = modified_at(conflict.server_version.as_ref()?)?;

        let resolution = if server_ts > local_ts {
            Resolution::ServerWins
        } else {
            Resolution::LocalWins
        };
        conflict.mark_resolved(resolution, ResolvedBy::System);
        tracing::debug!(
            record = %conflict.record_id,
            resolution = ?resolution,
            "conflict auto-resolved by timestamp"
        );
        Some(resolution)
    }

    /// Record an explicit resolution chosen outside the resolver
    pub fn resolve(&self, conflict: &mut ConflictRecord, resolution: Resolution) {
        conflict.mark_resolved(resolution, ResolvedBy::Manual);
        tracing::info!(
            record = %conflict.record_id,
            resolution = ?resolution,
            "conflict resolved manually"
        );
    }
}

fn json_kind(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Union-merge an array-valued sub-field by item id
///
/// Keeps every local item, appends server items whose id the local side
/// does not have (local wins overlapping ids), and stamps the merged
/// payload with a fresh modification time.
pub fn merge_sub_records(local: &Value, server: &Value, field: &str) -> Value {
    let local_items = local
        .get(field)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let server_items = server
        .get(field)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let local_ids: HashSet<&str> = local_items
        .iter()
        .filter_map(|item| item.get("id").and_then(Value::as_str))
        .collect();

    let mut items = local_items.clone();
    for item in server_items {
        let overlaps = item
            .get("id")
            .and_then(Value::as_str)
            .map(|id| local_ids.contains(id))
            .unwrap_or(false);
        if !overlaps {
            items.push(item);
        }
    }

    let mut merged = local.clone();
    if let Value::Object(map) = &mut merged {
        map.insert(field.to_string(), Value::Array(items));
        map.insert(
            "updated_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
    }
    merged
}

/// In-memory log of detected conflicts
#[derive(Debug, Default)]
pub struct ConflictLog {
    records: Mutex<Vec<ConflictRecord>>,
}

impl ConflictLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a detected conflict
    pub fn record(&self, conflict: ConflictRecord) {
        tracing::info!(
            record = %conflict.record_id,
            kind = ?conflict.conflict_type,
            resolved = conflict.is_resolved(),
            "conflict recorded"
        );
        self.lock().push(conflict);
    }

    pub fn all(&self) -> Vec<ConflictRecord> {
        self.lock().clone()
    }

    pub fn unresolved(&self) -> Vec<ConflictRecord> {
        self.lock()
            .iter()
            .filter(|c| !c.is_resolved())
            .cloned()
            .collect()
    }

    /// Apply an explicit resolution to a logged conflict
    pub fn resolve(&self, id: &str, resolution: Resolution) -> Result<ConflictRecord> {
        let mut records = self.lock();
        let conflict = records
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| SyncError::Validation(format!("unknown conflict: {}", id)))?;
        if conflict.is_resolved() {
            return Err(SyncError::Validation(format!(
                "conflict already resolved: {}",
                id
            )));
        }
        conflict.mark_resolved(resolution, ResolvedBy::Manual);
        Ok(conflict.clone())
    }

    /// Archive: drop records that have been resolved
    pub fn prune_resolved(&self) {
        self.lock().retain(|c| !c.is_resolved());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ConflictRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
