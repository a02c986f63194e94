//! OfflineKit CLI - Command line interface for inspecting offline stores.
//!
//! This tool opens an on-disk (SQLite) store and lets an operator list
//! databases, read journals, run selectors, finish interrupted migrations
//! and delete data.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use offlinekit_common::DatabaseName;
use offlinekit_storage::{create_default_registry, StorageEngine};
use offlinekit_sync::{
    ContextConfig, Direction, JournalEntry, OfflineContext, OperationJournal, QueryExecutor,
    Selector,
};

#[derive(Parser)]
#[command(name = "offlinekit")]
#[command(about = "OfflineKit - Offline store inspection and maintenance")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Store directory (default: platform data dir + offlinekit).
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List databases with their versions.
    Databases,

    /// Show the physical schema of a database.
    Schema {
        /// Database name.
        database: String,
    },

    /// List pending mutations in replay order.
    Pending {
        /// Database name.
        database: String,
    },

    /// List fetch markers.
    Markers {
        /// Database name.
        database: String,

        /// Only markers of this table.
        #[arg(short, long)]
        table: Option<String>,
    },

    /// Run a selector and print matching rows as JSON lines.
    Fetch {
        /// Database name.
        database: String,

        /// Table name.
        table: String,

        /// Criterion as field=value; a JSON array value matches any member.
        #[arg(short = 'w', long = "where")]
        criteria: Vec<String>,

        /// Ordering as field or field:desc.
        #[arg(short, long)]
        order: Vec<String>,
    },

    /// List offline identifiers and their recorded dependents.
    Keys,

    /// Finish a recreate interrupted by a crash.
    Recover {
        /// Database name.
        database: String,
    },

    /// Delete one database.
    Delete {
        /// Database name.
        database: String,
    },

    /// Delete every database in the store.
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let context = open_context(cli.root)?;

    match cli.command {
        Commands::Databases => cmd_databases(&context).await,

        Commands::Schema { database } => cmd_schema(&context, &database).await,

        Commands::Pending { database } => cmd_pending(&context, &database).await,

        Commands::Markers { database, table } => {
            cmd_markers(&context, &database, table.as_deref()).await
        }

        Commands::Fetch {
            database,
            table,
            criteria,
            order,
        } => cmd_fetch(&context, &database, &table, &criteria, &order).await,

        Commands::Keys => cmd_keys(&context).await,

        Commands::Recover { database } => cmd_recover(&context, &database).await,

        Commands::Delete { database } => cmd_delete(&context, &database).await,

        Commands::Reset => cmd_reset(&context).await,
    }
}

/// Open the SQLite store under `root`.
fn open_context(root: Option<PathBuf>) -> Result<OfflineContext> {
    let root = match root {
        Some(root) => root,
        None => dirs::data_dir()
            .context("No platform data directory, pass --root")?
            .join("offlinekit"),
    };

    let config = ContextConfig {
        engine: "sqlite".to_string(),
        engine_config: serde_json::json!({ "root": root.to_string_lossy() }),
    };
    let registry = create_default_registry();
    OfflineContext::from_config(&registry, &config)
        .with_context(|| format!("Failed to open store at {}", root.display()))
}

async fn journal(context: &OfflineContext, database: &str) -> Result<OperationJournal> {
    let name = DatabaseName::new(database).context("Invalid database name")?;
    let opened = context
        .store()
        .open_existing(&name)
        .await
        .context("Failed to open database")?
        .with_context(|| format!("Database '{}' does not exist", database))?;
    Ok(OperationJournal::new(opened))
}

fn print_entries(entries: &[JournalEntry]) -> Result<()> {
    if entries.is_empty() {
        println!("No entries.");
        return Ok(());
    }
    for entry in entries {
        println!("{}", serde_json::to_string(entry)?);
    }
    Ok(())
}

/// List databases.
async fn cmd_databases(context: &OfflineContext) -> Result<()> {
    let store = context.store();
    let names = store.databases().await.context("Failed to list databases")?;

    if names.is_empty() {
        println!("Store is empty.");
        return Ok(());
    }
    for name in names {
        // Listed names include scratch copies, which are not valid names.
        let schema = store
            .engine()
            .schema(&name)
            .await
            .context("Failed to read schema")?;
        match schema {
            Some(schema) => println!(
                "  {} (version {}, {} tables)",
                name,
                schema.version,
                schema.tables.len()
            ),
            None => println!("  {}", name),
        }
    }
    Ok(())
}

/// Show the physical schema.
async fn cmd_schema(context: &OfflineContext, database: &str) -> Result<()> {
    let name = DatabaseName::new(database).context("Invalid database name")?;
    let schema = context
        .store()
        .schema(&name)
        .await
        .context("Failed to read schema")?
        .with_context(|| format!("Database '{}' does not exist", database))?;

    println!("{} (version {}):", database, schema.version);
    for (table, definition) in schema.definitions() {
        println!("  {}: {}", table, definition);
    }
    Ok(())
}

/// List pending mutations.
async fn cmd_pending(context: &OfflineContext, database: &str) -> Result<()> {
    let entries = journal(context, database)
        .await?
        .read_pending()
        .await
        .context("Failed to read journal")?;
    print_entries(&entries)
}

/// List fetch markers.
async fn cmd_markers(context: &OfflineContext, database: &str, table: Option<&str>) -> Result<()> {
    let entries = journal(context, database)
        .await?
        .fetch_markers(table)
        .await
        .context("Failed to read journal")?;
    print_entries(&entries)
}

/// Parse `field=value`; values that are not JSON are taken as strings.
fn parse_criterion(criterion: &str) -> Result<(String, Value)> {
    let (field, raw) = criterion
        .split_once('=')
        .with_context(|| format!("Criterion '{}' is not field=value", criterion))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((field.to_string(), value))
}

/// Run a selector.
async fn cmd_fetch(
    context: &OfflineContext,
    database: &str,
    table: &str,
    criteria: &[String],
    order: &[String],
) -> Result<()> {
    let mut selector = Selector::new(table);
    for criterion in criteria {
        let (field, value) = parse_criterion(criterion)?;
        selector = selector.with(field, value);
    }
    for ordering in order {
        selector = match ordering.split_once(':') {
            Some((field, "desc")) => selector.order_by(field, Direction::Descending),
            Some((field, "asc")) => selector.order_by(field, Direction::Ascending),
            Some((_, other)) => anyhow::bail!("Unknown direction '{}', use asc or desc", other),
            None => selector.order_by(ordering.as_str(), Direction::Ascending),
        };
    }

    let name = DatabaseName::new(database).context("Invalid database name")?;
    let executor = QueryExecutor::new(context.store().clone(), name);
    let rows = executor
        .fetch_rows(&selector)
        .await
        .context("Failed to run selector")?;

    for row in &rows {
        println!("{}", serde_json::to_string(row)?);
    }
    info!("{} rows", rows.len());
    Ok(())
}

/// List offline identifiers.
async fn cmd_keys(context: &OfflineContext) -> Result<()> {
    let records = context
        .graph()
        .records()
        .await
        .context("Failed to read offline keys")?;

    if records.is_empty() {
        println!("No offline identifiers.");
        return Ok(());
    }
    for record in records {
        println!("{}:", record.offline_primary_key);
        for dependency in &record.dependencies {
            println!(
                "  {}.{} {} via {}",
                dependency.service_name,
                dependency.table_name,
                dependency.primary_key,
                dependency.foreign_key_name
            );
        }
    }
    Ok(())
}

/// Finish an interrupted recreate.
async fn cmd_recover(context: &OfflineContext, database: &str) -> Result<()> {
    let name = DatabaseName::new(database).context("Invalid database name")?;
    let recovered = context
        .store()
        .recover_interrupted(&name)
        .await
        .context("Failed to recover database")?;

    if recovered {
        println!("Recovered interrupted migration of {}", database);
    } else {
        println!("Nothing to recover for {}", database);
    }
    Ok(())
}

/// Delete one database.
async fn cmd_delete(context: &OfflineContext, database: &str) -> Result<()> {
    context
        .delete_database(database)
        .await
        .context("Failed to delete database")?;
    println!("Deleted {}", database);
    Ok(())
}

/// Delete every database.
async fn cmd_reset(context: &OfflineContext) -> Result<()> {
    let store = context.store();
    let names = store.databases().await.context("Failed to list databases")?;
    for name in &names {
        store
            .engine()
            .delete(name)
            .await
            .with_context(|| format!("Failed to delete {}", name))?;
    }
    context.reset().await.context("Failed to reset store")?;

    println!("Deleted {} databases", names.len());
    Ok(())
}
