//! CLI for the recalculation engine.
//!
//! Loads a JSON workspace document, applies an edit or runs a bulk
//! recompute, prints the resulting op-map, and optionally writes the
//! updated document back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use recalc_core::graph::{topological_order, GraphStore};
use recalc_core::{OpMap, Operation, RecalcConfig, Recalculator, WorkspaceDocument};
use recalc_runtime::{ApplyBridge, ApplyEvent, MemoryPublisher};

/// Command-line arguments for the recalculation tool.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workspace document (JSON)
    #[arg(short, long)]
    workspace: PathBuf,

    /// Author stamped on written records
    #[arg(long, default_value = "usrCli")]
    user: String,

    /// Write the updated document back to the workspace file
    #[arg(long)]
    write: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply one cell edit and its full cascade
    Apply {
        #[arg(long)]
        table: String,
        #[arg(long)]
        record: String,
        #[arg(long)]
        field: String,
        /// New cell value as JSON, e.g. `42`, `"text"`, `{"id":"rec1"}`
        #[arg(long)]
        value: String,
        /// Record version the edit is based on; defaults to the stored one
        #[arg(long)]
        version: Option<u64>,
    },
    /// Recompute computed fields of a table
    Calculate {
        #[arg(long)]
        table: String,
        #[arg(long, value_delimiter = ',', required = true)]
        fields: Vec<String>,
    },
    /// Recompute fields and every dependent, whether or not values changed
    Reset {
        #[arg(long)]
        table: String,
        #[arg(long, value_delimiter = ',', required = true)]
        fields: Vec<String>,
    },
    /// Recompute every computed field of the given records
    Records {
        #[arg(long)]
        table: String,
        #[arg(long, value_delimiter = ',', required = true)]
        records: Vec<String>,
    },
    /// Print the calculation order downstream of a field
    Graph {
        #[arg(long)]
        field: String,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RecalcConfig> {
    let mut config = match path {
        Some(path) => RecalcConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RecalcConfig::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

fn print_op_map(op_map: &OpMap) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(op_map)?);
    Ok(())
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let document = WorkspaceDocument::load(&args.workspace)
        .with_context(|| format!("loading workspace {}", args.workspace.display()))?;
    let db = Arc::new(document.into_database()?);
    let engine = Arc::new(Recalculator::new(Arc::clone(&db), config));
    let publisher = Arc::new(MemoryPublisher::new());
    let bridge = ApplyBridge::new(engine, publisher.clone());

    match args.command {
        Command::Apply {
            table,
            record,
            field,
            value,
            version,
        } => {
            let value: Value = serde_json::from_str(&value)
                .with_context(|| format!("parsing value {}", value))?;
            let version = match version {
                Some(version) => version,
                None => db.get_record(&table, &record)?.version,
            };
            let event = ApplyEvent::new(
                &table,
                &record,
                version,
                Operation::set_field(&field, Value::Null, value),
            );
            let outcome = bridge.apply(&args.user, &event)?;
            tracing::info!(
                retries = outcome.retries,
                generation = outcome.generation,
                "edit applied"
            );
            print_op_map(&outcome.op_map)?;
        }
        Command::Calculate { table, fields } => {
            print_op_map(&bridge.calculate_fields(&args.user, &table, &fields)?)?;
        }
        Command::Reset { table, fields } => {
            print_op_map(&bridge.reset_fields(&args.user, &table, &fields)?)?;
        }
        Command::Records { table, records } => {
            print_op_map(&bridge.calculate_fields_by_record_ids(&args.user, &table, &records)?)?;
        }
        Command::Graph { field } => {
            let snapshot = db.snapshot();
            snapshot.field(&field)?;
            let order = topological_order(&field, &GraphStore::new(&snapshot).edges());
            println!("{}", serde_json::to_string_pretty(&order)?);
            return Ok(());
        }
    }

    tracing::debug!(bundles = publisher.len(), "published bundles");
    if args.write {
        WorkspaceDocument::from_database(&db)?.save(&args.workspace)?;
        tracing::info!(path = %args.workspace.display(), "workspace written");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    run(Args::parse())
}
