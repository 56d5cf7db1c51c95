//! Vacuum command implementation.

use super::OutputFormat;
use crate::settings::CliError;
use arbordb_core::{Database, VacuumOptions, VacuumReport};

/// Exit status when nothing was removed.
pub const CLEAN: u8 = 0;
/// Exit status when objects were removed, or would be in a dry run.
pub const REMOVED: u8 = 1;

/// Runs the vacuum command and returns the exit status.
pub async fn run(db: &Database, options: VacuumOptions, format: OutputFormat) -> Result<u8, CliError> {
    if options.dry_run && format == OutputFormat::Text {
        println!("(dry run - no changes will be made)");
        println!();
    }

    let report = db.vacuum_with(options).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_text_output(&report),
    }

    Ok(exit_status(&report))
}

/// Maps a report to the process exit status.
pub fn exit_status(report: &VacuumReport) -> u8 {
    if report.removed_any() {
        REMOVED
    } else {
        CLEAN
    }
}

fn print_text_output(report: &VacuumReport) {
    let verb = if report.dry_run { "Removable" } else { "Removed" };
    println!("Vacuum");
    println!("======");
    println!("  Objects gathered: {}", report.gathered);
    println!("  {verb:<16}: {}", report.removed);
    println!("  Passes:           {}", report.passes);
    if !report.removed_any() {
        println!();
        println!("Nothing to collect - every object is reachable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbordb_core::EngineConfig;
    use arbordb_storage::BackendConfig;

    #[test]
    fn exit_status_reflects_removals() {
        let clean = VacuumReport::default();
        assert_eq!(exit_status(&clean), CLEAN);

        let dirty = VacuumReport {
            removed: 3,
            dry_run: true,
            ..VacuumReport::default()
        };
        assert_eq!(exit_status(&dirty), REMOVED);
    }

    #[tokio::test]
    async fn clean_store_exits_zero() {
        let db = Database::open(&BackendConfig::memory(), EngineConfig::default()).unwrap();
        let status = run(&db, VacuumOptions::default(), OutputFormat::Json)
            .await
            .unwrap();
        assert_eq!(status, CLEAN);
    }
}
