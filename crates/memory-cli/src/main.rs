// ============================================================================
// agenc-memory - CLI inspection tool for Tetsuo's long-term memory
// ============================================================================
// Usage:
//   agenc-memory list [--owner ID] [--type TYPE] [--limit N]   List records
//   agenc-memory get OWNER TYPE KEY                            Show one record
//   agenc-memory search OWNER TYPE QUERY [--limit N]           Similarity search
//   agenc-memory delete OWNER TYPE KEY                         Delete one record
//   agenc-memory stats [--owner ID]                            Record counts
//   agenc-memory export --format json [--owner ID]             Dump records
//   agenc-memory consolidate [--owner ID] [--type TYPE]        Merge duplicates
// ============================================================================

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use memory_core::memory::{ConsolidationStats, MemoryManager, MemoryType, Namespace, NamespacePattern, StoredItem};
use memory_core::MemoryConfig;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

/// Tetsuo memory inspection tool
#[derive(Parser)]
#[command(name = "agenc-memory", version, about = "Inspect and manage Tetsuo's long-term memory")]
struct Cli {
    /// JSON config file (defaults plus MEMORY_* environment otherwise)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the Qdrant URL
    #[arg(long, global = true)]
    qdrant_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List records, optionally narrowed to one owner and/or type
    List {
        #[arg(long)]
        owner: Option<String>,
        /// semantic or episodic
        #[arg(long = "type")]
        memory_type: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Show one record as JSON
    Get {
        owner: String,
        memory_type: String,
        key: String,
    },

    /// Similarity search within one namespace
    Search {
        owner: String,
        memory_type: String,
        query: String,
        #[arg(long, default_value = "5")]
        limit: usize,
    },

    /// Delete one record
    Delete {
        owner: String,
        memory_type: String,
        key: String,
    },

    /// Record counts per namespace
    Stats {
        #[arg(long)]
        owner: Option<String>,
    },

    /// Export records as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
        #[arg(long)]
        owner: Option<String>,
    },

    /// Merge near-duplicate memories
    Consolidate {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long = "type")]
        memory_type: Option<String>,
    },
}

fn parse_type(s: &str) -> Result<MemoryType> {
    s.parse::<MemoryType>().map_err(|e| {
        anyhow::anyhow!("{}. Valid values: semantic, episodic", e)
    })
}

fn pattern(owner: Option<&str>, memory_type: Option<&str>) -> Result<NamespacePattern> {
    Ok(NamespacePattern {
        owner_id: owner.map(str::to_string),
        memory_type: memory_type.map(parse_type).transpose()?,
    })
}

fn format_time(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("memory_core=info".parse()?)
                .add_directive("agenc_memory=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = MemoryConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.qdrant_url {
        config.store.qdrant_url = url;
    }
    debug!("Using collection {} at {}", config.store.collection, config.store.qdrant_url);

    let manager = MemoryManager::connect(config).await?;

    match cli.command {
        Commands::List {
            owner,
            memory_type,
            limit,
        } => cmd_list(&manager, owner.as_deref(), memory_type.as_deref(), limit).await,
        Commands::Get {
            owner,
            memory_type,
            key,
        } => cmd_get(&manager, &owner, &memory_type, &key).await,
        Commands::Search {
            owner,
            memory_type,
            query,
            limit,
        } => cmd_search(&manager, &owner, &memory_type, &query, limit).await,
        Commands::Delete {
            owner,
            memory_type,
            key,
        } => cmd_delete(&manager, &owner, &memory_type, &key).await,
        Commands::Stats { owner } => cmd_stats(&manager, owner.as_deref()).await,
        Commands::Export { format, owner } => cmd_export(&manager, &format, owner.as_deref()).await,
        Commands::Consolidate { owner, memory_type } => {
            cmd_consolidate(&manager, owner.as_deref(), memory_type.as_deref()).await
        }
    }
}

fn print_items(items: &[StoredItem]) {
    println!(
        "{:<36}  {:<24}  {:<3}  {:<22}  {}",
        "KEY", "NAMESPACE", "IMP", "UPDATED", "SUMMARY"
    );
    println!("{}", "-".repeat(110));

    for item in items {
        let summary = item.value.display_summary.chars().take(40).collect::<String>();
        let score = item.score.map(|s| format!(" ({:.2})", s)).unwrap_or_default();
        println!(
            "{:<36}  {:<24}  {:<3}  {:<22}  {}{}",
            item.key,
            item.namespace.path(),
            item.value.importance,
            format_time(&item.updated_at),
            summary,
            score
        );
    }
}

async fn cmd_list(manager: &MemoryManager, owner: Option<&str>, memory_type: Option<&str>, limit: usize) -> Result<()> {
    let items = manager.list(&pattern(owner, memory_type)?, Some(limit)).await?;
    if items.is_empty() {
        println!("No memories found.");
        return Ok(());
    }
    print_items(&items);
    println!("\nTotal: {} records", items.len());
    Ok(())
}

async fn cmd_get(manager: &MemoryManager, owner: &str, memory_type: &str, key: &str) -> Result<()> {
    let namespace = Namespace::new(owner, parse_type(memory_type)?)?;
    match manager.get(&namespace, key).await? {
        Some(item) => println!("{}", serde_json::to_string_pretty(&item)?),
        None => println!("No record {} in {}", key, namespace),
    }
    Ok(())
}

async fn cmd_search(manager: &MemoryManager, owner: &str, memory_type: &str, query: &str, limit: usize) -> Result<()> {
    let namespace = Namespace::new(owner, parse_type(memory_type)?)?;
    let items = manager.search(&namespace, query, None, limit).await?;
    if items.is_empty() {
        println!("No matches.");
        return Ok(());
    }
    print_items(&items);
    Ok(())
}

async fn cmd_delete(manager: &MemoryManager, owner: &str, memory_type: &str, key: &str) -> Result<()> {
    let namespace = Namespace::new(owner, parse_type(memory_type)?)?;
    if manager.delete(&namespace, key).await? {
        println!("Deleted {} from {}", key, namespace);
    } else {
        println!("No record {} in {}", key, namespace);
    }
    Ok(())
}

async fn cmd_stats(manager: &MemoryManager, owner: Option<&str>) -> Result<()> {
    println!("=== Tetsuo Memory Stats ===");
    println!("Collection: {}", manager.config().store.collection);
    println!();

    match owner {
        Some(owner) => {
            for memory_type in [MemoryType::Semantic, MemoryType::Episodic] {
                let namespace = Namespace::new(owner, memory_type)?;
                let count = manager.store().count(&namespace).await?;
                let max = manager.config().max_records(memory_type);
                println!("  {:24} {:>6} / {}", namespace.path(), count, max);
            }
        }
        None => {
            let items = manager.list(&NamespacePattern::any(), None).await?;
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            for item in &items {
                *counts.entry(item.namespace.path()).or_default() += 1;
            }
            for (namespace, count) in &counts {
                println!("  {:24} {:>6}", namespace, count);
            }
            println!("\nNamespaces: {}", counts.len());
            println!("Records:    {}", items.len());
        }
    }
    Ok(())
}

async fn cmd_export(manager: &MemoryManager, format: &str, owner: Option<&str>) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let items = manager.list(&pattern(owner, None)?, None).await?;
    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "collection": manager.config().store.collection,
        "count": items.len(),
        "records": items,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

async fn cmd_consolidate(manager: &MemoryManager, owner: Option<&str>, memory_type: Option<&str>) -> Result<()> {
    let memory_type = memory_type.map(parse_type).transpose()?;
    let stats: ConsolidationStats = manager.run_consolidation(owner, memory_type).await?;

    println!("Owners processed: {}", stats.owners_processed);
    println!("Records scanned:  {}", stats.records_scanned);
    println!("Merge groups:     {}", stats.merge_groups);
    println!("Records merged:   {}", stats.records_merged);

    if !stats.errors.is_empty() {
        println!("\nErrors:");
        for error in &stats.errors {
            println!("  - {}: {}", error.owner_id, error.message);
        }
    }
    Ok(())
}
