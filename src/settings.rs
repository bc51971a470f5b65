use std::time::Duration;

use crate::config::Config;
use crate::monitor::ThrottleSettings;

/// Immutable configuration of one migration run, assembled once from the
/// merged configuration and command line.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationSettings {
    /// Compute everything but never persist a change.
    pub dry_run: bool,
    /// Abort the run on the first per-record failure instead of collecting it.
    pub stop_on_error: bool,
    /// Cap on records fetched and applied.
    pub record_limit: Option<usize>,
    pub query_batch_size: usize,
    pub query_page_limit: usize,
    /// Run in reverse, undoing a previous forward run.
    pub rollback: bool,
    pub rollback_section: String,
    /// Stash reverse operations on each migrated record.
    pub capture_rollback: bool,
    pub guard_field: String,
    pub user_id: Option<String>,
    pub throttle: ThrottleSettings,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        MigrationSettings::from_config(&Config::default())
    }
}

impl MigrationSettings {
    pub fn from_config(config: &Config) -> Self {
        let migration = &config.migration;
        MigrationSettings {
            dry_run: false,
            stop_on_error: false,
            record_limit: None,
            query_batch_size: migration.query_batch_size,
            query_page_limit: migration.query_page_limit,
            rollback: false,
            rollback_section: migration.rollback_section.clone(),
            capture_rollback: migration.capture_rollback,
            guard_field: migration.guard_field.clone(),
            user_id: None,
            throttle: ThrottleSettings {
                no_op_percent: migration.no_op_percent,
                min_window: Duration::from_secs(migration.min_window_hours * 60 * 60),
                expected_entry_bytes: migration.expected_entry_bytes,
                min_free_percent: migration.min_free_percent,
            },
        }
    }

    /// Direction label used in logs.
    pub fn mode(&self) -> &'static str {
        match (self.rollback, self.dry_run) {
            (false, false) => "migrate",
            (false, true) => "migrate (dry run)",
            (true, false) => "rollback",
            (true, true) => "rollback (dry run)",
        }
    }
}
