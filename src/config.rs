use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::BackfillError;

const ENV_PREFIX: &str = "DEDUP_BACKFILL_";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub backfill: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const BACKFILL_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            backfill: Self::BACKFILL_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.backfill.clone();
        self.backfill = self.backfill.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.backfill.as_str()) {
            eprintln!(
                "Config error: backfill log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::BACKFILL_LEVEL
            );
            self.backfill = Self::BACKFILL_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// `sqlite://<path>` or a bare path to the SQLite file.
    pub connection: String,
    /// Capacity the store may grow to, used for the free space check.
    pub capacity_bytes: Option<u64>,
}

impl StoreConfig {
    fn default() -> Self {
        StoreConfig {
            connection: "sqlite://device_data.db".to_string(),
            capacity_bytes: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MigrationConfig {
    pub query_batch_size: usize,
    pub query_page_limit: usize,
    /// Percent of the replication log taken by no-op entries. Deliberately has
    /// no default: observed values range from under 1 to 100 between workloads.
    pub no_op_percent: Option<f64>,
    pub min_window_hours: u64,
    pub expected_entry_bytes: u64,
    pub min_free_percent: f64,
    pub rollback_section: String,
    pub capture_rollback: bool,
    pub guard_field: String,
}

impl MigrationConfig {
    const QUERY_BATCH_SIZE: usize = 1_000;
    const QUERY_PAGE_LIMIT: usize = 50_000;
    const MIN_WINDOW_HOURS: u64 = 8;
    const EXPECTED_ENTRY_BYTES: u64 = 420;
    const MIN_FREE_PERCENT: f64 = 10.0;
    const ROLLBACK_SECTION: &str = "_rollbackMigration";
    const GUARD_FIELD: &str = "modifiedTime";

    fn default() -> Self {
        MigrationConfig {
            query_batch_size: Self::QUERY_BATCH_SIZE,
            query_page_limit: Self::QUERY_PAGE_LIMIT,
            no_op_percent: None,
            min_window_hours: Self::MIN_WINDOW_HOURS,
            expected_entry_bytes: Self::EXPECTED_ENTRY_BYTES,
            min_free_percent: Self::MIN_FREE_PERCENT,
            rollback_section: Self::ROLLBACK_SECTION.to_string(),
            capture_rollback: true,
            guard_field: Self::GUARD_FIELD.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        if self.query_batch_size == 0 {
            eprintln!(
                "Config error: query_batch_size must be positive - using default of {}",
                Self::QUERY_BATCH_SIZE
            );
            self.query_batch_size = Self::QUERY_BATCH_SIZE;
        }

        if self.query_page_limit == 0 {
            eprintln!(
                "Config error: query_page_limit must be positive - using default of {}",
                Self::QUERY_PAGE_LIMIT
            );
            self.query_page_limit = Self::QUERY_PAGE_LIMIT;
        }

        if let Some(no_op) = self.no_op_percent {
            if !(no_op > 0.0 && no_op <= 100.0) {
                eprintln!(
                    "Config error: no_op_percent of {} is outside (0, 100] - leaving it unset",
                    no_op
                );
                self.no_op_percent = None;
            }
        }

        if self.min_window_hours == 0 {
            eprintln!(
                "Config error: min_window_hours must be positive - using default of {}",
                Self::MIN_WINDOW_HOURS
            );
            self.min_window_hours = Self::MIN_WINDOW_HOURS;
        }

        if self.expected_entry_bytes == 0 {
            eprintln!(
                "Config error: expected_entry_bytes must be positive - using default of {}",
                Self::EXPECTED_ENTRY_BYTES
            );
            self.expected_entry_bytes = Self::EXPECTED_ENTRY_BYTES;
        }

        if !(0.0..=100.0).contains(&self.min_free_percent) {
            eprintln!(
                "Config error: min_free_percent of {} is outside [0, 100] - using default of {}",
                self.min_free_percent,
                Self::MIN_FREE_PERCENT
            );
            self.min_free_percent = Self::MIN_FREE_PERCENT;
        }

        self.rollback_section = self.rollback_section.trim().to_string();
        if self.rollback_section.is_empty() {
            eprintln!(
                "Config error: rollback_section is empty - using default of '{}'",
                Self::ROLLBACK_SECTION
            );
            self.rollback_section = Self::ROLLBACK_SECTION.to_string();
        }

        self.guard_field = self.guard_field.trim().to_string();
        if self.guard_field.is_empty() {
            eprintln!(
                "Config error: guard_field is empty - using default of '{}'",
                Self::GUARD_FIELD
            );
            self.guard_field = Self::GUARD_FIELD.to_string();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FilesConfig {
    /// Last-processed-id file. Empty disables checkpointing.
    pub checkpoint: String,
    pub log_directory: String,
    pub persist_audit: bool,
}

impl FilesConfig {
    fn default() -> Self {
        FilesConfig {
            checkpoint: "last_processed_id".to_string(),
            log_directory: "backfill_logs".to_string(),
            persist_audit: false,
        }
    }

    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        let trimmed = self.checkpoint.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct IdentityConfig {
    /// Record type -> extra identity fields following `_userId, deviceId, time, type`.
    pub types: BTreeMap<String, Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    pub migration: MigrationConfig,
    pub files: FilesConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            store: StoreConfig::default(),
            migration: MigrationConfig::default(),
            files: FilesConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

impl Config {
    pub fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("", "", "dedup-backfill")
    }

    /// Loads configuration from `explicit_path` if given, otherwise from the
    /// app's local data directory. When the default file doesn't exist it is
    /// written out with the defaults so operators have a template to edit.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, BackfillError> {
        match explicit_path {
            Some(path) => {
                if !path.exists() {
                    return Err(BackfillError::ConfigError(format!(
                        "Config file {} does not exist",
                        path.display()
                    )));
                }
                Self::load_from(path)
            }
            None => match Self::project_dirs() {
                Some(dirs) => {
                    let path = dirs.data_local_dir().join(CONFIG_FILE_NAME);
                    Self::write_default_if_missing(&path);
                    Self::load_from(&path)
                }
                None => Self::load_from(Path::new(CONFIG_FILE_NAME)),
            },
        }
    }

    /// Merge defaults, the TOML file at `path` (if present) and the environment.
    pub fn load_from(path: &Path) -> Result<Self, BackfillError> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Config = figment.extract()?;
        config.ensure_valid();
        Ok(config)
    }

    fn write_default_if_missing(config_path: &Path) {
        if config_path.exists() {
            return;
        }

        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
                return;
            }
        }

        match toml::to_string_pretty(&Config::default()) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.migration.ensure_valid();
    }
}
