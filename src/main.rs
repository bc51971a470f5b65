mod audit;
mod checkpoint;
mod cli;
mod config;
mod error;
mod fingerprint;
mod migration;
mod monitor;
mod settings;
mod store;
mod utils;

use clap::Parser;
use flexi_logger::{
    Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming, WriteMode,
};
use log::{error, info};

use cli::Cli;
use config::Config;
use error::BackfillError;

const LOG_FILE_BASENAME: &str = "dedup-backfill";
const LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const LOG_FILES_KEPT: usize = 10;

fn main() {
    let args = Cli::parse();

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    };

    // The handle must stay alive for the file writer to keep flushing
    let _logger = match setup_logging(&config) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    };

    info!("dedup-backfill v{} starting", env!("CARGO_PKG_VERSION"));

    if let Err(err) = Cli::handle_command_line(args, config) {
        error!("{}", err);
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

fn setup_logging(config: &Config) -> Result<LoggerHandle, BackfillError> {
    let log_err = |e: flexi_logger::FlexiLoggerError| {
        BackfillError::Error(format!("Failed to initialize logging: {}", e))
    };

    Logger::try_with_str(format!("dedup_backfill={}", config.logging.backfill))
        .map_err(log_err)?
        .log_to_file(
            FileSpec::default()
                .directory(&config.files.log_directory)
                .basename(LOG_FILE_BASENAME),
        )
        .rotate(
            Criterion::Size(LOG_ROTATE_BYTES),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(LOG_FILES_KEPT),
        )
        .duplicate_to_stderr(Duplicate::Warn)
        .format_for_files(flexi_logger::detailed_format)
        .write_mode(WriteMode::BufferAndFlush)
        .start()
        .map_err(log_err)
}
