use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use log::{debug, Level};
use logging_timer::timer;
use serde::Serialize;

use crate::error::BackfillError;
use crate::fingerprint::{TransformError, UpdateData};

/// One record's transform failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorData {
    pub id: String,
    pub record_type: String,
    pub error: String,
    pub message: String,
}

impl ErrorData {
    pub fn new(id: &str, record_type: &str, err: &TransformError) -> Self {
        Self {
            id: id.to_string(),
            record_type: record_type.to_string(),
            error: err.as_ref().to_string(),
            message: err.to_string(),
        }
    }
}

/// Per-type staging of error and audit records.
///
/// Records are grouped by record type in memory and written out on `flush`,
/// one JSON object per line, to `<type>_errors.log` and `<type>_audit.log`.
/// With persistence disabled `flush` discards the staged records.
pub struct AuditSink {
    directory: PathBuf,
    persist: bool,
    errors: BTreeMap<String, Vec<ErrorData>>,
    audits: BTreeMap<String, Vec<UpdateData>>,
    error_counts: BTreeMap<String, u64>,
}

impl AuditSink {
    pub fn new(directory: PathBuf, persist: bool) -> Self {
        Self {
            directory,
            persist,
            errors: BTreeMap::new(),
            audits: BTreeMap::new(),
            error_counts: BTreeMap::new(),
        }
    }

    pub fn record_error(&mut self, error: ErrorData) {
        *self.error_counts.entry(error.record_type.clone()).or_default() += 1;
        self.errors
            .entry(error.record_type.clone())
            .or_default()
            .push(error);
    }

    pub fn record_audit(&mut self, update: &UpdateData) {
        if !self.persist {
            return;
        }
        self.audits
            .entry(update.record_type.clone())
            .or_default()
            .push(update.clone());
    }

    /// Drop every staged audit record. Staged errors are kept.
    pub fn discard_audits(&mut self) {
        self.audits.clear();
    }

    /// Drop the staged audit records of updates that were not applied.
    pub fn withdraw_audits(&mut self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        for group in self.audits.values_mut() {
            group.retain(|update| !ids.contains(&update.id));
        }
        self.audits.retain(|_, group| !group.is_empty());
    }

    #[cfg(test)]
    pub fn staged(&self) -> usize {
        self.errors.values().map(Vec::len).sum::<usize>()
            + self.audits.values().map(Vec::len).sum::<usize>()
    }

    /// Errors recorded over the lifetime of the sink, by record type.
    pub fn error_counts(&self) -> &BTreeMap<String, u64> {
        &self.error_counts
    }

    /// Write every staged group to its type-named log file and clear the groups.
    /// Returns the number of lines written.
    pub fn flush(&mut self) -> Result<usize, BackfillError> {
        let errors = std::mem::take(&mut self.errors);
        let audits = std::mem::take(&mut self.audits);

        if !self.persist {
            return Ok(0);
        }

        let _tmr = timer!(Level::Trace; "AuditSink.flush");
        let mut written = 0;
        for (record_type, group) in &errors {
            written += self.append(record_type, "errors", group)?;
        }
        for (record_type, group) in &audits {
            written += self.append(record_type, "audit", group)?;
        }

        if written > 0 {
            debug!("Flushed {} audit lines to {}", written, self.directory.display());
        }
        Ok(written)
    }

    fn append<T: Serialize>(
        &self,
        record_type: &str,
        kind: &str,
        group: &[T],
    ) -> Result<usize, BackfillError> {
        if group.is_empty() {
            return Ok(0);
        }

        fs::create_dir_all(&self.directory)?;
        let path = self
            .directory
            .join(format!("{}_{}.log", Self::file_stem(record_type), kind));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);

        for entry in group {
            serde_json::to_writer(&mut writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        Ok(group.len())
    }

    /// Record types come from the data, so keep only filename-safe characters.
    fn file_stem(record_type: &str) -> String {
        let stem: String = record_type
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        if stem.is_empty() {
            "unknown".to_string()
        } else {
            stem
        }
    }
}
