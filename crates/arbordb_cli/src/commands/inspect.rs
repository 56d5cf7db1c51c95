//! Inspect command implementation.

use super::OutputFormat;
use crate::settings::CliError;
use arbordb_core::{Database, DatabaseInfo};

/// Runs the inspect command.
pub async fn run(db: &Database, types: &[String], format: OutputFormat) -> Result<(), CliError> {
    let info = db.inspect(types).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
        OutputFormat::Text => print_text_output(&info),
    }
    Ok(())
}

fn print_text_output(info: &DatabaseInfo) {
    println!("ArborDB Database Inspection");
    println!("===========================");
    println!();
    println!("Backend:   {} (pool of {})", info.backend, info.pool_size);
    println!("Last tid:  {}", info.current_tid);
    println!();
    println!("Objects:");
    println!("  Total:      {}", info.objects);
    println!("  Resources:  {}", info.resources);
    println!("  Sub-values: {}", info.objects.saturating_sub(info.resources));

    if !info.types.is_empty() {
        println!();
        println!("Types:");
        for (type_name, count) in &info.types {
            println!("  {type_name}: {count}");
        }
    }
}
