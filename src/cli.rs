use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use crate::audit::AuditSink;
use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::error::BackfillError;
use crate::fingerprint::{FingerprintBuilder, TypeRegistry};
use crate::migration::Migrator;
use crate::monitor::{CapacityMonitor, SleepWait};
use crate::settings::MigrationSettings;
use crate::store;

#[derive(Parser)]
#[command(
    name = "dedup-backfill",
    version,
    about = "Backfill deduplication fingerprints onto stored device records"
)]
pub struct Cli {
    /// Configuration file (default: <local data dir>/dedup-backfill/config.toml)
    #[arg(long = "config", short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Fingerprint unmigrated records (or undo a previous run with --rollback)
    Migrate(MigrateArgs),

    /// Inspect or reset the last-processed-id checkpoint
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,

        /// Last-processed-id file (overrides [files] checkpoint)
        #[arg(long = "last-id-file", global = true)]
        last_id_file: Option<PathBuf>,

        /// Act on the rollback checkpoint instead of the forward one
        #[arg(long = "rollback", global = true, default_value_t = false)]
        rollback: bool,
    },

    /// List the registered record types
    Types,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum CheckpointAction {
    /// Print the persisted id
    Show,
    /// Remove the persisted id so the next run starts from the beginning
    Clear,
}

#[derive(Args, Debug, Default, PartialEq)]
pub struct MigrateArgs {
    /// Compute every update but write nothing (no records, no checkpoint).
    /// The replication readiness wait is skipped, so a dry run does not show
    /// the throttle pauses a real run would take; free space is still checked.
    #[arg(long = "dry-run", default_value_t = false)]
    pub dry_run: bool,

    /// Abort on the first record that cannot be transformed
    #[arg(long = "stop-on-error", default_value_t = false)]
    pub stop_on_error: bool,

    /// Stop after this many records
    #[arg(long = "limit", short = 'l')]
    pub limit: Option<usize>,

    /// Percent of the replication log taken by no-op entries (required for replicated stores)
    #[arg(long = "no-op-percent")]
    pub no_op_percent: Option<f64>,

    /// Records per round trip while reading
    #[arg(long = "query-batch-size")]
    pub query_batch_size: Option<usize>,

    /// Records per page while reading
    #[arg(long = "query-limit")]
    pub query_limit: Option<usize>,

    /// Store connection string (sqlite://<path> or a bare path)
    #[arg(long = "store", short = 's')]
    pub store: Option<String>,

    /// Last-processed-id file (overrides [files] checkpoint)
    #[arg(long = "last-id-file")]
    pub last_id_file: Option<PathBuf>,

    /// Only migrate records belonging to this user
    #[arg(long = "user-id", short = 'u')]
    pub user_id: Option<String>,

    /// Undo a previous run using the reverse operations stashed on each record
    #[arg(long = "rollback", default_value_t = false)]
    pub rollback: bool,

    /// Field holding the stashed reverse operations
    #[arg(long = "rollback-section")]
    pub rollback_section: Option<String>,

    /// Write per-type audit logs of every update
    #[arg(long = "audit", default_value_t = false)]
    pub audit: bool,

    /// Interrupt the run after this many seconds (the checkpoint makes it resumable)
    #[arg(long = "max-duration", value_parser = clap::value_parser!(u64).range(1..))]
    pub max_duration: Option<u64>,
}

impl MigrateArgs {
    /// Apply command-line overrides on top of the merged configuration.
    fn apply_to(&self, config: &mut Config) {
        if let Some(no_op) = self.no_op_percent {
            config.migration.no_op_percent = Some(no_op);
        }
        if let Some(size) = self.query_batch_size.filter(|s| *s > 0) {
            config.migration.query_batch_size = size;
        }
        if let Some(limit) = self.query_limit.filter(|l| *l > 0) {
            config.migration.query_page_limit = limit;
        }
        if let Some(connection) = &self.store {
            config.store.connection = connection.clone();
        }
        if let Some(path) = &self.last_id_file {
            config.files.checkpoint = path.to_string_lossy().into_owned();
        }
        if let Some(section) = self.rollback_section.as_deref().map(str::trim) {
            if !section.is_empty() {
                config.migration.rollback_section = section.to_string();
            }
        }
        if self.audit {
            config.files.persist_audit = true;
        }
    }

    fn settings(&self, config: &Config) -> MigrationSettings {
        MigrationSettings {
            dry_run: self.dry_run,
            stop_on_error: self.stop_on_error,
            record_limit: self.limit,
            rollback: self.rollback,
            user_id: self.user_id.clone(),
            ..MigrationSettings::from_config(config)
        }
    }
}

impl Cli {
    pub fn handle_command_line(args: Cli, mut config: Config) -> Result<(), BackfillError> {
        match args.command {
            Command::Migrate(migrate) => {
                migrate.apply_to(&mut config);
                Self::migrate(&migrate, &config)
            }
            Command::Checkpoint {
                action,
                last_id_file,
                rollback,
            } => {
                if let Some(path) = last_id_file {
                    config.files.checkpoint = path.to_string_lossy().into_owned();
                }
                Self::checkpoint(action, rollback, &config)
            }
            Command::Types => {
                Self::types(&config);
                Ok(())
            }
        }
    }

    fn registry(config: &Config) -> TypeRegistry {
        let mut registry = TypeRegistry::with_defaults();
        registry.register_identity_table(&config.identity.types);
        registry
    }

    fn migrate(args: &MigrateArgs, config: &Config) -> Result<(), BackfillError> {
        let settings = args.settings(config);
        let interrupt_token = Arc::new(AtomicBool::new(false));

        if let Some(secs) = args.max_duration {
            let token = Arc::clone(&interrupt_token);
            thread::spawn(move || {
                thread::sleep(Duration::from_secs(secs));
                warn!("Maximum run duration of {}s reached; interrupting", secs);
                token.store(true, Ordering::Release);
            });
        }

        let store = store::open(&config.store.connection, config.store.capacity_bytes)?;
        let registry = Self::registry(config);
        let builder = FingerprintBuilder::new(
            &registry,
            settings.guard_field.clone(),
            settings.rollback_section.clone(),
            settings.capture_rollback,
        );
        let monitor = CapacityMonitor::new(
            store.as_ref(),
            settings.throttle.clone(),
            Box::new(SleepWait),
            Arc::clone(&interrupt_token),
        );
        let checkpoint = Checkpoint::for_direction(config.files.checkpoint_path(), settings.rollback);
        let audit = AuditSink::new(
            PathBuf::from(&config.files.log_directory),
            config.files.persist_audit,
        );

        let mut migrator = Migrator::new(
            store.as_ref(),
            &builder,
            monitor,
            checkpoint,
            audit,
            settings,
            interrupt_token,
        );
        let stats = migrator.run()?;

        println!(
            "fetched {} applied {} errored {} concurrently modified {}",
            stats.fetched, stats.applied, stats.errored, stats.mismatched
        );
        Ok(())
    }

    fn checkpoint(
        action: CheckpointAction,
        rollback: bool,
        config: &Config,
    ) -> Result<(), BackfillError> {
        let checkpoint = Checkpoint::for_direction(config.files.checkpoint_path(), rollback);
        let location = match checkpoint.path() {
            Some(path) => path.display().to_string(),
            None => {
                println!("Checkpointing is disabled");
                return Ok(());
            }
        };

        match action {
            CheckpointAction::Show => match checkpoint.load()? {
                Some(id) => println!("{}", id),
                None => println!("No checkpoint recorded in {}", location),
            },
            CheckpointAction::Clear => {
                if checkpoint.clear()? {
                    info!("Cleared checkpoint {}", location);
                    println!("Cleared checkpoint {}", location);
                } else {
                    println!("No checkpoint recorded in {}", location);
                }
            }
        }
        Ok(())
    }

    fn types(config: &Config) {
        let registry = Self::registry(config);
        for record_type in registry.record_types() {
            println!("{}", record_type);
        }
    }
}
