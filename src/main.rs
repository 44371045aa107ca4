mod inspect;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepwise_core::config::{AppConfig, LogConfig};
use stepwise_memory::ConversationStore;

#[derive(Parser)]
#[command(name = "stepwise", version, about = "Operator tools for Stepwise conversations")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepwise.toml", env = "STEPWISE_CONFIG")]
    config: PathBuf,

    /// Override the conversation store path from the config
    #[arg(long)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarise a persisted conversation, from a JSON file or by id
    Inspect {
        /// Path to a serialized conversation, or a conversation id in the store
        target: String,
        /// Print the raw serialized conversation instead of a summary
        #[arg(long)]
        raw: bool,
    },
    /// List stored conversations, most recent first
    List {
        /// Maximum number of rows
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show the effective configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_tracing(&config.log);

    let store_path = cli
        .store
        .clone()
        .unwrap_or_else(|| config.store.resolved_path());

    match cli.command {
        Commands::Inspect { target, raw } => {
            let conversation = inspect::load(&target, &store_path)?;
            if raw {
                println!("{}", serde_json::to_string_pretty(&conversation.to_value()?)?);
            } else {
                inspect::print(&conversation);
            }
        }
        Commands::List { limit } => list(&store_path, limit)?,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

/// The file when it exists, built-in defaults otherwise.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".stepwise").join("config.toml"));
    match home_config {
        Some(home) if home.exists() => Ok(AppConfig::load(&home)?),
        _ => Ok(AppConfig::default()),
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr so command output stays pipeable.
    if log.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn list(store_path: &Path, limit: usize) -> anyhow::Result<()> {
    if !store_path.exists() {
        warn!(path = %store_path.display(), "Conversation store not found");
        println!("No conversations stored.");
        return Ok(());
    }
    let store = ConversationStore::open(store_path)?;
    let rows = store.list()?;
    info!(path = %store_path.display(), count = rows.len(), "Listing conversations");
    if rows.is_empty() {
        println!("No conversations stored.");
        return Ok(());
    }

    println!(
        "  {:<36}  {:<20}  {:<24}  UPDATED",
        "ID", "COMPONENT", "STATUS"
    );
    for row in rows.iter().take(limit) {
        println!(
            "  {:<36}  {:<20}  {:<24}  {}",
            row.id,
            truncate(&row.component, 20),
            row.status.as_deref().unwrap_or("-"),
            row.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    if rows.len() > limit {
        println!("  ... {} more", rows.len() - limit);
    }
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
