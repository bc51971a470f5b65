pub mod document;
#[cfg(test)]
pub mod memory;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

use crate::error::BackfillError;

pub use document::{Document, PathConflict};
pub use sqlite::SqliteStore;

// ============================================================================
// Update operations
// ============================================================================

/// A single field-level mutation.
///
/// Operations are serialized into audit logs and into the rollback-stash field
/// of migrated records, so the wire form is part of the persisted format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum UpdateOp {
    Set { path: String, value: Value },
    Unset { path: String },
}

impl UpdateOp {
    pub fn set(path: impl Into<String>, value: Value) -> Self {
        UpdateOp::Set {
            path: path.into(),
            value,
        }
    }

    pub fn unset(path: impl Into<String>) -> Self {
        UpdateOp::Unset { path: path.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            UpdateOp::Set { path, .. } | UpdateOp::Unset { path } => path,
        }
    }

    pub fn apply(&self, doc: &mut Document) -> Result<(), PathConflict> {
        match self {
            UpdateOp::Set { path, value } => document::set_path(doc, path, value.clone()),
            UpdateOp::Unset { path } => {
                document::unset_path(doc, path);
                Ok(())
            }
        }
    }
}

/// Optimistic-concurrency filter: matches a record only if its id matches and
/// its guard field still holds the value observed when the update was built.
/// A `None` guard value matches only records that still lack the guard field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub id: String,
    pub guard_field: String,
    pub guard_value: Option<Value>,
}

impl RecordFilter {
    pub fn matches(&self, doc: &Document) -> bool {
        document::record_id(doc) == Some(self.id.as_str())
            && document::get_path(doc, &self.guard_field) == self.guard_value.as_ref()
    }
}

/// One record's worth of mutation, as handed to `Store::bulk_write`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub filter: RecordFilter,
    pub ops: Vec<UpdateOp>,
}

/// Outcome of one `Store::bulk_write`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteResult {
    /// Records actually modified.
    pub modified: usize,
    /// Ids of updates that changed nothing: the record was gone, its guard no
    /// longer matched, or an operation ran into a conflicting field.
    pub unmatched: Vec<String>,
}

// ============================================================================
// Queries
// ============================================================================

/// Which side of the migration a query selects.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Records that do not yet carry the fingerprint at `fingerprint_path`.
    Unmigrated { fingerprint_path: String },
    /// Records that carry the rollback-stash field `section`.
    RollbackEligible { section: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    pub selection: Selection,
    pub user_id: Option<String>,
    /// Only records with an id strictly greater than this are returned.
    pub after_id: Option<String>,
    pub batch_size: usize,
    pub limit: usize,
    /// Top-level fields to return. `None` returns the full record.
    pub projection: Option<Vec<String>>,
}

impl FindQuery {
    pub fn apply_projection(&self, doc: Document) -> Document {
        match &self.projection {
            None => doc,
            Some(fields) => doc
                .into_iter()
                .filter(|(k, _)| k == document::ID_FIELD || fields.iter().any(|f| f == k))
                .collect(),
        }
    }
}

// ============================================================================
// Capacity and replication
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollectionStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum MemberState {
    Primary,
    Secondary,
    Arbiter,
    Startup,
    Startup2,
    Recovering,
    Rollback,
    Down,
    Removed,
    Unknown,
}

impl MemberState {
    /// True for states a member settles into once an election is over.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            MemberState::Primary | MemberState::Secondary | MemberState::Arbiter
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberStatus {
    pub name: String,
    pub healthy: bool,
    pub uptime_secs: u64,
    pub state: MemberState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationStatus {
    pub members: Vec<MemberStatus>,
}

/// Retained span and capacity of the replication log. Timestamps are seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogWindow {
    pub oldest_timestamp: i64,
    pub newest_timestamp: i64,
    pub max_size_bytes: u64,
}

impl LogWindow {
    pub fn span_secs(&self) -> u64 {
        (self.newest_timestamp - self.oldest_timestamp).max(0) as u64
    }
}

// ============================================================================
// Store
// ============================================================================

/// The collection being migrated, seen only through the operations the engine
/// needs. Every call is synchronous.
pub trait Store {
    /// Returns the records matching `query`, ascending by id.
    fn find(&self, query: &FindQuery) -> Result<Vec<Document>, BackfillError>;

    /// Applies every update whose filter still matches, reporting how many
    /// records were modified and which updates were skipped.
    fn bulk_write(&self, updates: &[RecordUpdate]) -> Result<BulkWriteResult, BackfillError>;

    fn collection_stats(&self) -> Result<CollectionStats, BackfillError>;

    /// `None` when the store is a standalone (non-replicated) node.
    fn replication_status(&self) -> Result<Option<ReplicationStatus>, BackfillError>;

    /// `None` when the store is a standalone (non-replicated) node.
    fn replication_log_window(&self) -> Result<Option<LogWindow>, BackfillError>;
}

/// Open a store from a connection string (`sqlite://<path>` or a bare path).
pub fn open(connection: &str, capacity_bytes: Option<u64>) -> Result<Box<dyn Store>, BackfillError> {
    let path = match connection.split_once("://") {
        Some(("sqlite", path)) => path,
        Some((scheme, _)) => {
            return Err(BackfillError::ConfigError(format!(
                "Unsupported store scheme '{}' in connection '{}'",
                scheme, connection
            )))
        }
        None => connection,
    };

    if path.is_empty() {
        return Err(BackfillError::ConfigError(
            "Store connection string is empty".to_string(),
        ));
    }

    Ok(Box::new(SqliteStore::open(path, capacity_bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_op_wire_format() {
        let op = UpdateOp::set("deduplicator.hash", json!("abc"));
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json, json!({"op": "set", "path": "deduplicator.hash", "value": "abc"}));

        let op: UpdateOp = serde_json::from_value(json!({"op": "unset", "path": "x"})).unwrap();
        assert_eq!(op, UpdateOp::unset("x"));
    }

    #[test]
    fn test_filter_matches_guard() {
        let doc = json!({"_id": "a", "modifiedTime": "2024-01-01T00:00:00Z"})
            .as_object()
            .cloned()
            .unwrap();
        let mut filter = RecordFilter {
            id: "a".to_string(),
            guard_field: "modifiedTime".to_string(),
            guard_value: Some(json!("2024-01-01T00:00:00Z")),
        };
        assert!(filter.matches(&doc));

        filter.guard_value = Some(json!("2024-02-01T00:00:00Z"));
        assert!(!filter.matches(&doc));

        filter.guard_value = None;
        assert!(!filter.matches(&doc));
    }

    #[test]
    fn test_member_state_parsing() {
        assert_eq!("SECONDARY".parse::<MemberState>().unwrap(), MemberState::Secondary);
        assert_eq!("primary".parse::<MemberState>().unwrap(), MemberState::Primary);
        assert!(!MemberState::Startup2.is_settled());
        assert!(MemberState::Arbiter.is_settled());
    }

    #[test]
    fn test_open_rejects_unknown_scheme() {
        let result = open("mongodb://localhost:27017", None);
        assert!(matches!(result, Err(BackfillError::ConfigError(_))));
    }

    #[test]
    fn test_log_window_span() {
        let window = LogWindow {
            oldest_timestamp: 100,
            newest_timestamp: 400,
            max_size_bytes: 1,
        };
        assert_eq!(window.span_secs(), 300);
    }
}
