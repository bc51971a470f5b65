use log::{debug, error, warn, Level};
use logging_timer::timer;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::error::BackfillError;

use super::{
    BulkWriteResult, CollectionStats, Document, FindQuery, LogWindow, RecordUpdate,
    ReplicationStatus, Selection, Store,
};

const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS device_data (
    id TEXT PRIMARY KEY,
    doc TEXT NOT NULL
);";

/// Document store backed by a single SQLite file.
///
/// Each row holds one JSON record; selections are evaluated with SQLite's JSON
/// functions. A SQLite file has no replica set, so the replication calls
/// always report a standalone node.
pub struct SqliteStore {
    conn: Connection,
    capacity_bytes: Option<u64>,
}

impl SqliteStore {
    pub fn open(path: &str, capacity_bytes: Option<u64>) -> Result<Self, BackfillError> {
        let conn = Connection::open(path).map_err(|e| {
            BackfillError::StoreUnavailable(format!("Failed to open '{}': {}", path, e))
        })?;
        conn.execute_batch(CREATE_SCHEMA_SQL)?;
        debug!("Opened SQLite store at '{}'", path);

        Ok(Self {
            conn,
            capacity_bytes,
        })
    }

    /// Execute `f` inside a `BEGIN IMMEDIATE` transaction, committing on success
    /// and rolling back on any error.
    fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, BackfillError>
    where
        F: FnOnce(&Connection) -> Result<T, BackfillError>,
    {
        conn.execute("BEGIN IMMEDIATE", [])?;
        match f(conn) {
            Ok(value) => {
                conn.execute("COMMIT", [])?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = conn.execute("ROLLBACK", []) {
                    error!("Rollback after failed write also failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    /// Convert a dotted field path to a quoted SQLite JSON path (`$."a"."b"`).
    fn json_path(path: &str) -> String {
        let mut json_path = String::from("$");
        for segment in path.split('.') {
            json_path.push_str(".\"");
            json_path.push_str(&segment.replace('"', "\\\""));
            json_path.push('"');
        }
        json_path
    }

    fn pragma_i64(&self, pragma: &str) -> Result<i64, BackfillError> {
        let value = self
            .conn
            .query_row(&format!("PRAGMA {}", pragma), [], |row| row.get(0))
            .map_err(|e| {
                BackfillError::StoreUnavailable(format!("Failed to read PRAGMA {}: {}", pragma, e))
            })?;
        Ok(value)
    }

    #[cfg(test)]
    pub fn insert_records(&self, docs: &[Document]) -> Result<usize, BackfillError> {
        Self::immediate_transaction(&self.conn, |conn| {
            for doc in docs {
                let id = super::document::record_id(doc)
                    .ok_or_else(|| BackfillError::Error("record without _id".into()))?;
                conn.execute(
                    "INSERT OR REPLACE INTO device_data (id, doc) VALUES (?, ?)",
                    params![id, serde_json::to_string(doc)?],
                )?;
            }
            Ok(docs.len())
        })
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Result<Option<Document>, BackfillError> {
        let text: Option<String> = self
            .conn
            .query_row("SELECT doc FROM device_data WHERE id = ?", [id], |row| row.get(0))
            .optional()?;
        Ok(match text {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        })
    }
}

impl Store for SqliteStore {
    fn find(&self, query: &FindQuery) -> Result<Vec<Document>, BackfillError> {
        let _tmr = timer!(Level::Trace; "SqliteStore.find", "limit {}", query.limit);

        let mut sql = String::from("SELECT doc FROM device_data WHERE 1 = 1");
        let mut values: Vec<String> = Vec::new();

        match &query.selection {
            Selection::Unmigrated { fingerprint_path } => {
                sql.push_str(" AND json_type(doc, ?) IS NULL");
                values.push(Self::json_path(fingerprint_path));
            }
            Selection::RollbackEligible { section } => {
                sql.push_str(" AND json_type(doc, ?) IS NOT NULL");
                values.push(Self::json_path(section));
            }
        }

        if let Some(user_id) = &query.user_id {
            sql.push_str(" AND json_extract(doc, '$._userId') = ?");
            values.push(user_id.clone());
        }

        if let Some(after_id) = &query.after_id {
            sql.push_str(" AND id > ?");
            values.push(after_id.clone());
        }

        sql.push_str(&format!(" ORDER BY id ASC LIMIT {}", query.limit));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?;

        let mut docs = Vec::with_capacity(query.limit.min(query.batch_size.max(1)));
        for row in rows {
            let doc: Document = serde_json::from_str(&row?)?;
            docs.push(query.apply_projection(doc));
        }

        Ok(docs)
    }

    fn bulk_write(&self, updates: &[RecordUpdate]) -> Result<BulkWriteResult, BackfillError> {
        let _tmr = timer!(Level::Trace; "SqliteStore.bulk_write", "{}", updates.len());

        Self::immediate_transaction(&self.conn, |conn| {
            let mut result = BulkWriteResult::default();

            for update in updates {
                let id = &update.filter.id;
                let text: Option<String> = conn
                    .query_row("SELECT doc FROM device_data WHERE id = ?", [id], |row| {
                        row.get(0)
                    })
                    .optional()?;

                let mut doc: Document = match text {
                    Some(text) => serde_json::from_str(&text)?,
                    None => {
                        result.unmatched.push(id.clone());
                        continue;
                    }
                };

                if !update.filter.matches(&doc) {
                    result.unmatched.push(id.clone());
                    continue;
                }

                if let Some(conflict) = update.ops.iter().find_map(|op| op.apply(&mut doc).err()) {
                    warn!("Skipping update of record '{}': {}", id, conflict);
                    result.unmatched.push(id.clone());
                    continue;
                }

                conn.execute(
                    "UPDATE device_data SET doc = ? WHERE id = ?",
                    params![serde_json::to_string(&doc)?, id],
                )?;
                result.modified += 1;
            }

            Ok(result)
        })
    }

    fn collection_stats(&self) -> Result<CollectionStats, BackfillError> {
        let page_size = self.pragma_i64("page_size")?.max(0) as u64;
        let page_count = self.pragma_i64("page_count")?.max(0) as u64;
        let freelist_count = self.pragma_i64("freelist_count")?.max(0) as u64;

        let total_bytes = match self.capacity_bytes {
            Some(capacity) => capacity,
            None => self.pragma_i64("max_page_count")?.max(0) as u64 * page_size,
        };

        Ok(CollectionStats {
            total_bytes,
            used_bytes: page_count.saturating_sub(freelist_count) * page_size,
        })
    }

    fn replication_status(&self) -> Result<Option<ReplicationStatus>, BackfillError> {
        Ok(None)
    }

    fn replication_log_window(&self) -> Result<Option<LogWindow>, BackfillError> {
        Ok(None)
    }
}
