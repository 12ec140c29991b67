// ============================================================================
// companion-db - seeding and inspection tool for companion chat
// ============================================================================
// Usage:
//   companion-db seed                                   Insert default categories
//   companion-db categories                             List categories
//   companion-db history --companion C --model M --user U
//   companion-db write --companion C --model M --user U "Human: hi"
//   companion-db seed-history --companion C --model M --user U --file seed.txt
//   companion-db search --file-name elon.txt "what's next?"
//   companion-db index --file-name elon.txt ./elon.txt
//   companion-db subscription status --user U
// ============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use companion_core::{
    CatalogDb, CompanionKey, MemoryManager, SearchOutcome, SeedOutcome, SubscriptionGate,
    UserSubscription, WriteOutcome, DEFAULT_CATEGORIES,
};
use std::sync::Arc;
use tracing::{error, info};

/// Companion chat seeding and inspection tool
#[derive(Parser)]
#[command(name = "companion-db", version, about = "Seed and inspect companion chat storage")]
struct Cli {
    /// Path to the catalog database (default: ~/.companion/catalog.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct KeyArgs {
    /// Companion name
    #[arg(long)]
    companion: String,

    /// Model name
    #[arg(long)]
    model: String,

    /// User id (omit to exercise the no-user path)
    #[arg(long)]
    user: Option<String>,
}

impl KeyArgs {
    fn to_key(&self) -> CompanionKey {
        CompanionKey {
            companion_name: self.companion.clone(),
            model_name: self.model.clone(),
            user_id: self.user.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Insert the default companion categories
    Seed,

    /// List categories
    Categories,

    /// Show catalog statistics and memory backends
    Stats,

    /// Print the latest chat history for a companion key
    History {
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Append one line to a companion key's history
    Write {
        #[command(flatten)]
        key: KeyArgs,

        /// Text to append
        text: String,
    },

    /// Seed history from a file (only when the key has no history yet)
    SeedHistory {
        #[command(flatten)]
        key: KeyArgs,

        /// File holding the seed conversation
        #[arg(long)]
        file: PathBuf,

        /// Line delimiter; `\n` and `\t` escapes are understood
        #[arg(long, default_value = "\\n")]
        delimiter: String,
    },

    /// Search a companion's knowledge file with some chat text
    Search {
        /// Knowledge file name recorded in chunk metadata
        #[arg(long)]
        file_name: String,

        /// Chat text to search with
        query: String,
    },

    /// Chunk, embed and index a knowledge file
    Index {
        /// Name to record as `fileName` (default: the file's name)
        #[arg(long)]
        file_name: Option<String>,

        /// Path to the knowledge file
        path: PathBuf,
    },

    /// Inspect or record subscription state
    Subscription {
        #[command(subcommand)]
        action: SubscriptionCommand,
    },
}

#[derive(Subcommand)]
enum SubscriptionCommand {
    /// Show a user's plan
    Status {
        #[arg(long)]
        user: String,
    },

    /// Record a paid subscription for a user
    Set {
        #[arg(long)]
        user: String,

        /// Stripe price id
        #[arg(long)]
        price: String,

        /// Unix timestamp (seconds) when the paid period ends
        #[arg(long)]
        period_end: i64,

        #[arg(long)]
        customer: Option<String>,

        #[arg(long)]
        subscription: Option<String>,
    },
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

/// Turn shell-typed `\n` / `\t` into the characters they name
fn unescape_delimiter(raw: &str) -> String {
    raw.replace("\\n", "\n").replace("\\t", "\t")
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("companion_core=info".parse()?)
                .add_directive("companion_db=info".parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }
    init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Seed => cmd_seed(cli.db_path.as_deref()),
        Commands::Categories => cmd_categories(cli.db_path.as_deref()),
        Commands::Stats => cmd_stats(cli.db_path.as_deref()).await,
        Commands::History { key } => cmd_history(&key.to_key()).await,
        Commands::Write { key, text } => cmd_write(&key.to_key(), &text).await,
        Commands::SeedHistory {
            key,
            file,
            delimiter,
        } => cmd_seed_history(&key.to_key(), &file, &unescape_delimiter(&delimiter)).await,
        Commands::Search { file_name, query } => cmd_search(&file_name, &query).await,
        Commands::Index { file_name, path } => cmd_index(file_name, &path).await,
        Commands::Subscription { action } => cmd_subscription(cli.db_path.as_deref(), action).await,
    }
}

fn cmd_seed(db_path: Option<&str>) -> Result<()> {
    // The handle drops (and the file closes) on every path out of this scope
    let db = CatalogDb::open(db_path).map_err(|e| {
        error!("Error seeding default categories: {}", e);
        anyhow::Error::new(e).context("Error seeding default categories")
    })?;
    let created = seed_categories(&db)?;
    println!(
        "Seeded {} categories ({} already present)",
        created,
        DEFAULT_CATEGORIES.len() - created
    );
    Ok(())
}

/// Insert the default categories; returns how many were new
fn seed_categories(db: &CatalogDb) -> Result<usize> {
    db.create_many(&DEFAULT_CATEGORIES).map_err(|e| {
        error!("Error seeding default categories: {}", e);
        anyhow::Error::new(e).context("Error seeding default categories")
    })
}

fn cmd_categories(db_path: Option<&str>) -> Result<()> {
    let db = CatalogDb::open(db_path)?;
    let categories = db.list_categories()?;

    if categories.is_empty() {
        println!("No categories found. Run `companion-db seed` first.");
        return Ok(());
    }

    println!("{:<36}  {}", "CATEGORY ID", "NAME");
    println!("{}", "-".repeat(60));
    for category in &categories {
        println!("{:<36}  {}", category.id, category.name);
    }
    println!("\nTotal: {} categories", categories.len());
    Ok(())
}

async fn cmd_stats(db_path: Option<&str>) -> Result<()> {
    let db = CatalogDb::open(db_path)?;
    let stats = db.stats()?;

    println!("=== Companion Storage Stats ===");
    if let Some(path) = db.path() {
        println!("Catalog:       {}", path.display());
    }
    println!("Categories:    {}", stats.total_categories);
    println!("Subscriptions: {}", stats.total_subscriptions);

    match MemoryManager::global().await {
        Ok(manager) => {
            let health = manager.health();
            println!();
            println!("History store: {}", health.history_backend);
            println!("Vector index:  {}", health.vector_backend);
            println!("Embeddings:    {}", health.embedding_model);
        }
        Err(e) => println!("\nMemory backends unavailable: {}", e),
    }
    Ok(())
}

async fn cmd_history(key: &CompanionKey) -> Result<()> {
    let manager = MemoryManager::global().await?;
    let history = manager.read_latest_history(key).await?;

    if history.is_empty() {
        println!("No chat history.");
    } else {
        println!("{}", history);
    }
    Ok(())
}

async fn cmd_write(key: &CompanionKey, text: &str) -> Result<()> {
    let manager = MemoryManager::global().await?;
    match manager.write_to_history(text, key).await? {
        WriteOutcome::Written { added } => println!("Wrote {} new line(s)", added),
        WriteOutcome::Skipped => anyhow::bail!("Companion key has no user id; nothing written"),
    }
    Ok(())
}

async fn cmd_seed_history(key: &CompanionKey, file: &PathBuf, delimiter: &str) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read seed file {}", file.display()))?;

    let manager = MemoryManager::global().await?;
    match manager.seed_chat_history(&content, delimiter, key).await? {
        SeedOutcome::Seeded { lines } => println!("Seeded {} lines", lines),
        SeedOutcome::AlreadySeeded => println!("User already has chat history; left untouched"),
        SeedOutcome::Skipped => anyhow::bail!("Companion key has no user id; nothing seeded"),
    }
    Ok(())
}

async fn cmd_search(file_name: &str, query: &str) -> Result<()> {
    let manager = MemoryManager::global().await?;

    match manager.vector_search(query, file_name).await {
        SearchOutcome::Matches(matches) => {
            println!("{}", serde_json::to_string_pretty(&matches)?);
            Ok(())
        }
        SearchOutcome::Empty => {
            println!("[]");
            Ok(())
        }
        SearchOutcome::Failed(e) => Err(e).context("Vector search failed"),
    }
}

async fn cmd_index(file_name: Option<String>, path: &PathBuf) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read knowledge file {}", path.display()))?;
    let file_name = match file_name {
        Some(name) => name,
        None => path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .context("Cannot derive a file name; pass --file-name")?,
    };

    let manager = MemoryManager::global().await?;
    let written = manager.index_companion_file(&file_name, &content).await?;
    info!("Indexed {} as {}", path.display(), file_name);
    println!("Indexed {} chunks as {}", written, file_name);
    Ok(())
}

async fn cmd_subscription(db_path: Option<&str>, action: SubscriptionCommand) -> Result<()> {
    let db = Arc::new(CatalogDb::open(db_path)?);

    match action {
        SubscriptionCommand::Status { user } => {
            let gate = SubscriptionGate::new(db.clone());
            let status = gate.check(Some(&user)).await?;
            println!("{}", status.plan_message());

            if let Some(sub) = db.get_subscription(&user)? {
                if let Some(end) = sub.stripe_current_period_end {
                    println!("Current period ends: {}", format_timestamp(end));
                }
            }
        }
        SubscriptionCommand::Set {
            user,
            price,
            period_end,
            customer,
            subscription,
        } => {
            let mut record = db
                .get_subscription(&user)?
                .unwrap_or_else(|| UserSubscription::new(user.clone()));
            record.stripe_price_id = Some(price);
            record.stripe_current_period_end = Some(period_end);
            if customer.is_some() {
                record.stripe_customer_id = customer;
            }
            if subscription.is_some() {
                record.stripe_subscription_id = subscription;
            }
            db.upsert_subscription(&record)?;
            println!(
                "Recorded subscription for {} (period ends {})",
                user,
                format_timestamp(period_end)
            );
        }
    }
    Ok(())
}
