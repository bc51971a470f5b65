use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};

use serde_json::Value;

use crate::error::BackfillError;

use super::document::{self, Document};
use super::{
    BulkWriteResult, CollectionStats, FindQuery, LogWindow, MemberState, MemberStatus, RecordUpdate,
    ReplicationStatus, Selection, Store,
};

/// In-memory store for tests.
///
/// Replication status and log windows are scripted as queues: each call pops
/// the front entry until one remains, which is then returned forever.
pub struct MemoryStore {
    docs: RefCell<BTreeMap<String, Document>>,
    stats: Cell<CollectionStats>,
    statuses: RefCell<VecDeque<Option<ReplicationStatus>>>,
    windows: RefCell<VecDeque<Option<LogWindow>>>,
    fail_stats: Cell<bool>,
    bulk_writes: Cell<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            docs: RefCell::new(BTreeMap::new()),
            stats: Cell::new(CollectionStats {
                total_bytes: 1000,
                used_bytes: 100,
            }),
            statuses: RefCell::new(VecDeque::from([None])),
            windows: RefCell::new(VecDeque::from([None])),
            fail_stats: Cell::new(false),
            bulk_writes: Cell::new(0),
        }
    }

    pub fn with_docs(docs: Vec<Value>) -> Self {
        let store = Self::new();
        for doc in docs {
            store.insert(doc);
        }
        store
    }

    pub fn insert(&self, doc: Value) {
        let doc = doc.as_object().cloned().expect("document must be an object");
        let id = document::record_id(&doc).expect("document needs _id").to_string();
        self.docs.borrow_mut().insert(id, doc);
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        self.docs.borrow().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Document> {
        self.docs.borrow().values().cloned().collect()
    }

    /// Simulate a concurrent application write that changes the guard field.
    pub fn touch(&self, id: &str, guard_field: &str, value: Value) {
        if let Some(doc) = self.docs.borrow_mut().get_mut(id) {
            document::set_path(doc, guard_field, value).unwrap();
        }
    }

    pub fn set_stats(&self, total_bytes: u64, used_bytes: u64) {
        self.stats.set(CollectionStats {
            total_bytes,
            used_bytes,
        });
    }

    pub fn fail_stats(&self) {
        self.fail_stats.set(true);
    }

    pub fn script_replication(&self, statuses: Vec<ReplicationStatus>, windows: Vec<LogWindow>) {
        *self.statuses.borrow_mut() = statuses.into_iter().map(Some).collect();
        *self.windows.borrow_mut() = windows.into_iter().map(Some).collect();
    }

    pub fn bulk_write_calls(&self) -> usize {
        self.bulk_writes.get()
    }

    pub fn healthy_set() -> ReplicationStatus {
        ReplicationStatus {
            members: vec![
                MemberStatus {
                    name: "node-0".to_string(),
                    healthy: true,
                    uptime_secs: 86_400,
                    state: MemberState::Primary,
                },
                MemberStatus {
                    name: "node-1".to_string(),
                    healthy: true,
                    uptime_secs: 86_400,
                    state: MemberState::Secondary,
                },
            ],
        }
    }

    fn next<T: Clone>(queue: &RefCell<VecDeque<T>>) -> Option<T> {
        let mut queue = queue.borrow_mut();
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl Store for MemoryStore {
    fn find(&self, query: &FindQuery) -> Result<Vec<Document>, BackfillError> {
        let docs = self.docs.borrow();
        let selected = docs
            .iter()
            .filter(|(id, _)| match &query.after_id {
                Some(after) => id.as_str() > after.as_str(),
                None => true,
            })
            .filter(|(_, doc)| match &query.selection {
                Selection::Unmigrated { fingerprint_path } => {
                    document::get_path(doc, fingerprint_path).is_none()
                }
                Selection::RollbackEligible { section } => {
                    document::get_path(doc, section).is_some()
                }
            })
            .filter(|(_, doc)| match &query.user_id {
                Some(user) => doc.get(document::USER_ID_FIELD).and_then(Value::as_str)
                    == Some(user.as_str()),
                None => true,
            })
            .take(query.limit)
            .map(|(_, doc)| query.apply_projection(doc.clone()))
            .collect();
        Ok(selected)
    }

    fn bulk_write(&self, updates: &[RecordUpdate]) -> Result<BulkWriteResult, BackfillError> {
        self.bulk_writes.set(self.bulk_writes.get() + 1);
        let mut docs = self.docs.borrow_mut();
        let mut result = BulkWriteResult::default();
        for update in updates {
            let Some(doc) = docs
                .get_mut(&update.filter.id)
                .filter(|doc| update.filter.matches(doc))
            else {
                result.unmatched.push(update.filter.id.clone());
                continue;
            };
            let mut updated = doc.clone();
            if update.ops.iter().all(|op| op.apply(&mut updated).is_ok()) {
                *doc = updated;
                result.modified += 1;
            } else {
                result.unmatched.push(update.filter.id.clone());
            }
        }
        Ok(result)
    }

    fn collection_stats(&self) -> Result<CollectionStats, BackfillError> {
        if self.fail_stats.get() {
            return Err(BackfillError::StoreUnavailable("stats unavailable".into()));
        }
        Ok(self.stats.get())
    }

    fn replication_status(&self) -> Result<Option<ReplicationStatus>, BackfillError> {
        Ok(Self::next(&self.statuses).flatten())
    }

    fn replication_log_window(&self) -> Result<Option<LogWindow>, BackfillError> {
        Ok(Self::next(&self.windows).flatten())
    }
}
