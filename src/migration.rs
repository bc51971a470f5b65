// Migration States
// 1. Idle: between pages.
// 2. Fetching: read the next page of records after the cursor (unmigrated, or
//    rollback-eligible in reverse mode), ascending by id.
// 3. Transforming: build one update per record; failures are collected (or
//    abort the run with stop-on-error).
// 4. Throttling: before each write chunk, wait for replica health and a
//    sufficient replication window, then check free space.
// 5. Applying: bulk write the chunk, then record the checkpoint and flush the
//    audit logs.
// 6. Done: a fetch came back empty or the record limit was reached.
// 7. Failed: any fatal error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use strum::Display;

use crate::audit::{AuditSink, ErrorData};
use crate::checkpoint::Checkpoint;
use crate::error::BackfillError;
use crate::fingerprint::{FingerprintBuilder, UpdateData, FINGERPRINT_PATH};
use crate::monitor::CapacityMonitor;
use crate::settings::MigrationSettings;
use crate::store::document::{self, Document};
use crate::store::{BulkWriteResult, FindQuery, RecordUpdate, Selection, Store};
use crate::utils::Utils;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MigrationState {
    Idle,
    Fetching,
    Transforming,
    Throttling,
    Applying,
    Done,
    Failed,
}

/// Run counters, mutated only by the `Migrator`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationStats {
    pub fetched: usize,
    pub applied: usize,
    pub errored: usize,
    /// Updates built but not yet applied.
    pub pending: usize,
    /// Updates whose concurrency filter no longer matched at write time.
    pub mismatched: usize,
    pub write_batch_size: usize,
    pub elapsed: Duration,
}

/// Drives the fetch -> transform -> throttle -> apply loop over the collection.
pub struct Migrator<'a> {
    store: &'a dyn Store,
    builder: &'a FingerprintBuilder<'a>,
    monitor: CapacityMonitor<'a>,
    checkpoint: Checkpoint,
    audit: AuditSink,
    settings: MigrationSettings,
    interrupt_token: Arc<AtomicBool>,
    state: MigrationState,
    stats: MigrationStats,
}

impl<'a> Migrator<'a> {
    pub fn new(
        store: &'a dyn Store,
        builder: &'a FingerprintBuilder<'a>,
        monitor: CapacityMonitor<'a>,
        checkpoint: Checkpoint,
        audit: AuditSink,
        settings: MigrationSettings,
        interrupt_token: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            builder,
            monitor,
            checkpoint,
            audit,
            settings,
            interrupt_token,
            state: MigrationState::Idle,
            stats: MigrationStats::default(),
        }
    }

    /// Run until the selection is exhausted, the record limit is reached, or a
    /// fatal error occurs.
    pub fn run(&mut self) -> Result<MigrationStats, BackfillError> {
        let started = Instant::now();
        info!("Starting {} run", self.settings.mode());

        let result = self.run_loop(started);
        self.stats.elapsed = started.elapsed();

        // Errors staged by a failing page are still worth keeping
        if let Err(flush_err) = self.audit.flush() {
            warn!("Failed to flush audit logs: {}", flush_err);
        }

        match result {
            Ok(()) => {
                self.set_state(MigrationState::Done);
                self.report_summary();
                Ok(self.stats.clone())
            }
            Err(err) => {
                self.set_state(MigrationState::Failed);
                error!("Run failed: {}", err);
                self.report_progress();
                Err(err)
            }
        }
    }

    fn run_loop(&mut self, started: Instant) -> Result<(), BackfillError> {
        let write_batch_size = self.monitor.compute_write_batch_size()?;
        self.stats.write_batch_size = write_batch_size;

        let mut cursor = self.checkpoint.load()?;
        if let Some(id) = &cursor {
            info!("Resuming after checkpoint '{}'", id);
        }

        loop {
            self.check_interrupted()?;

            let page_limit = match self.remaining() {
                Some(0) => break,
                Some(remaining) => remaining.min(self.settings.query_page_limit),
                None => self.settings.query_page_limit,
            };

            self.set_state(MigrationState::Fetching);
            let records = self.fetch(cursor.clone(), page_limit)?;
            if records.is_empty() {
                break;
            }
            self.stats.fetched += records.len();

            cursor = Some(
                records
                    .last()
                    .and_then(document::record_id)
                    .ok_or_else(|| {
                        BackfillError::StoreUnavailable(
                            "store returned a record without a string _id".into(),
                        )
                    })?
                    .to_string(),
            );

            self.set_state(MigrationState::Transforming);
            let updates = self.transform(&records)?;
            self.stats.pending = updates.len();

            self.apply(&updates, write_batch_size)?;
            self.audit.flush()?;

            self.stats.elapsed = started.elapsed();
            self.report_progress();
            self.set_state(MigrationState::Idle);
        }

        Ok(())
    }

    /// Records still allowed under the record limit, if there is one. The
    /// larger of the fetched and applied counts is charged against the limit.
    fn remaining(&self) -> Option<usize> {
        self.settings.record_limit.map(|limit| {
            limit.saturating_sub(self.stats.fetched.max(self.stats.applied))
        })
    }

    fn selection(&self) -> Selection {
        if self.settings.rollback {
            Selection::RollbackEligible {
                section: self.settings.rollback_section.clone(),
            }
        } else {
            Selection::Unmigrated {
                fingerprint_path: FINGERPRINT_PATH.to_string(),
            }
        }
    }

    fn fetch(&self, after_id: Option<String>, limit: usize) -> Result<Vec<Document>, BackfillError> {
        let _tmr = timer!(Level::Trace; "Migrator.fetch", "limit {}", limit);
        let query = FindQuery {
            selection: self.selection(),
            user_id: self.settings.user_id.clone(),
            after_id,
            batch_size: self.settings.query_batch_size.min(limit),
            limit,
            projection: None,
        };
        self.store.find(&query)
    }

    fn transform(&mut self, records: &[Document]) -> Result<Vec<UpdateData>, BackfillError> {
        let mut updates = Vec::with_capacity(records.len());

        for record in records {
            let result = if self.settings.rollback {
                self.builder.build_rollback(record)
            } else {
                self.builder.build_update(record)
            };

            match result {
                Ok(update) => updates.push(update),
                Err(err) => {
                    let id = document::record_id(record).unwrap_or("<missing>");
                    let record_type = document::record_type(record).unwrap_or("unknown");
                    debug!("Record '{}' ({}) failed: {}", id, record_type, err);

                    self.stats.errored += 1;
                    self.audit
                        .record_error(ErrorData::new(id, record_type, &err));

                    if self.settings.stop_on_error {
                        return Err(BackfillError::RecordFailed {
                            id: id.to_string(),
                            source: err,
                        });
                    }
                }
            }
        }

        Ok(updates)
    }

    fn apply(&mut self, updates: &[UpdateData], write_batch_size: usize) -> Result<(), BackfillError> {
        for chunk in updates.chunks(write_batch_size.max(1)) {
            // Audit records are staged before the write they describe and
            // dropped again if that write never happens
            for update in chunk {
                self.audit.record_audit(update);
            }

            let result = match self.write_chunk(chunk) {
                Ok(result) => result,
                Err(err) => {
                    self.audit.discard_audits();
                    return Err(err);
                }
            };

            if !result.unmatched.is_empty() {
                self.stats.mismatched += result.unmatched.len();
                self.audit.withdraw_audits(&result.unmatched);
                info!(
                    "Applied {} of {} updates; {} records changed concurrently and are left for a later pass",
                    result.modified,
                    chunk.len(),
                    result.unmatched.len()
                );
            }

            self.stats.applied += result.modified;
            self.stats.pending = self.stats.pending.saturating_sub(chunk.len());

            if !self.settings.dry_run {
                if let Some(last) = chunk.last() {
                    self.checkpoint.record(&last.id)?;
                }
            }
            self.audit.flush()?;
        }

        Ok(())
    }

    /// Gate and write one chunk. A dry run passes the space check and counts
    /// every update as applied.
    fn write_chunk(&mut self, chunk: &[UpdateData]) -> Result<BulkWriteResult, BackfillError> {
        self.check_interrupted()?;

        self.set_state(MigrationState::Throttling);
        if !self.settings.dry_run {
            self.monitor.block_until_ready()?;
        }
        self.monitor.check_free_space()?;

        self.set_state(MigrationState::Applying);
        if self.settings.dry_run {
            return Ok(BulkWriteResult {
                modified: chunk.len(),
                unmatched: Vec::new(),
            });
        }

        let _tmr = timer!(Level::Trace; "Migrator.bulk_write", "{}", chunk.len());
        let writes: Vec<RecordUpdate> = chunk.iter().map(UpdateData::to_record_update).collect();
        self.store.bulk_write(&writes)
    }

    fn check_interrupted(&self) -> Result<(), BackfillError> {
        if self.interrupt_token.load(Ordering::Acquire) {
            Err(BackfillError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn set_state(&mut self, state: MigrationState) {
        if self.state != state {
            debug!("Migration state {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn report_progress(&self) {
        info!(
            "Fetched [{}] applied [{}] errored [{}] pending [{}] elapsed [{}]",
            self.stats.fetched,
            self.stats.applied,
            self.stats.errored,
            self.stats.pending,
            Utils::format_elapsed(self.stats.elapsed)
        );
    }

    fn report_summary(&self) {
        info!(
            "Completed {} run: fetched {}, applied {}, errored {}, concurrently modified {}, write batch size {}, elapsed {}",
            self.settings.mode(),
            self.stats.fetched,
            self.stats.applied,
            self.stats.errored,
            self.stats.mismatched,
            self.stats.write_batch_size,
            Utils::format_elapsed(self.stats.elapsed)
        );
        for (record_type, count) in self.audit.error_counts() {
            warn!("{} {} records could not be processed", count, record_type);
        }
    }
}
