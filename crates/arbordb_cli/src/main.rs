//! ArborDB CLI
//!
//! Command-line maintenance tools for ArborDB stores.
//!
//! # Commands
//!
//! - `vacuum` - Remove objects no longer reachable from the root
//! - `inspect` - Display object counts and the latest tid
//! - `version` - Show version information
//!
//! The backend comes from `--config` (a JSON file), `--backend` and
//! `--path`; a bare `--path` opens a snapshot file.
//!
//! `vacuum` exits with 0 when nothing was removed, 1 when objects were
//! removed (or would be, with `--dry-run`), and 2 on error.

mod commands;
mod settings;

use clap::{Parser, Subcommand};
use commands::OutputFormat;
use settings::{CliError, Settings};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

use arbordb_core::Database;

/// Exit status for failed commands.
const FAILURE: u8 = 2;

/// ArborDB command-line maintenance tools.
#[derive(Parser)]
#[command(name = "arbordb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backend name (memory, file)
    #[arg(global = true, short, long)]
    backend: Option<String>,

    /// Path to the snapshot file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// JSON configuration file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Remove objects no longer reachable from the root
    Vacuum {
        /// Dry run - report what would be removed
        #[arg(short, long)]
        dry_run: bool,

        /// Rows per metadata page
        #[arg(long)]
        page_size: Option<usize>,

        /// Connections used to gather metadata
        #[arg(long)]
        connections: Option<usize>,

        /// Objects deleted per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Display object counts and the latest tid
    Inspect {
        /// Also count resources of this type (repeatable)
        #[arg(short = 't', long = "type")]
        types: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show version information
    Version,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(status) => ExitCode::from(status),
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::from(FAILURE)
        }
    }
}

async fn run(cli: Cli) -> Result<u8, CliError> {
    let Cli {
        backend,
        path,
        config,
        command,
        ..
    } = cli;

    if let Commands::Version = command {
        println!("ArborDB CLI v{}", env!("CARGO_PKG_VERSION"));
        println!("ArborDB Core v{}", arbordb_core::VERSION);
        return Ok(commands::vacuum::CLEAN);
    }

    let settings = Settings::load(config.as_deref())?.with_overrides(backend, path);
    let db = Database::open(&settings.backend, settings.engine.clone())?;

    let result = match command {
        Commands::Vacuum {
            dry_run,
            page_size,
            connections,
            batch_size,
            format,
        } => {
            let mut options = settings.engine.vacuum.dry_run(dry_run || settings.engine.vacuum.dry_run);
            if let Some(size) = page_size {
                options = options.page_size(size);
            }
            if let Some(count) = connections {
                options = options.connections(count);
            }
            if let Some(size) = batch_size {
                options = options.batch_size(size);
            }
            commands::vacuum::run(&db, options, format).await
        }
        Commands::Inspect { types, format } => commands::inspect::run(&db, &types, format)
            .await
            .map(|()| commands::vacuum::CLEAN),
        Commands::Version => Ok(commands::vacuum::CLEAN),
    };

    db.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["arbordb", "vacuum", "--dry-run", "--path", "site.cbor"]).unwrap();
        assert_eq!(cli.path, Some(PathBuf::from("site.cbor")));
        assert!(matches!(cli.command, Commands::Vacuum { dry_run: true, .. }));
    }

    #[test]
    fn parses_inspect_types() {
        let cli = Cli::try_parse_from([
            "arbordb", "inspect", "-t", "Folder", "--type", "Document", "--format", "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Inspect { types, format } => {
                assert_eq!(types, vec!["Folder", "Document"]);
                assert_eq!(format, OutputFormat::Json);
            }
            _ => panic!("expected inspect"),
        }
    }

    #[tokio::test]
    async fn unknown_backend_is_an_error() {
        let cli = Cli::try_parse_from(["arbordb", "--backend", "nosuch", "inspect"]).unwrap();
        assert!(run(cli).await.is_err());
    }
}
