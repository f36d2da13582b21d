//! # Insight Server CLI (`insightd`)
//!
//! The `insightd` binary runs the vault-synchronized semantic index: the
//! HTTP server with its filesystem watcher, plus one-shot commands for
//! re-indexing and querying from the terminal.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `insightd serve` | Start the HTTP server and vault watcher |
//! | `insightd reindex` | Re-index every Insight in the vault |
//! | `insightd query "<text>"` | Retrieve Insights related to a question |
//! | `insightd status` | Show index and configuration status |
//!
//! ## Examples
//!
//! ```bash
//! # Start the server with a config file
//! insightd --config ./insightd.toml serve
//!
//! # Rebuild the index for a specific vault
//! insightd reindex --vault ~/notes
//!
//! # Ask what past Insights relate to a question
//! insightd query "Why does depth beat speed?" --top-k 3
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use insight_server::config::{load_config, Config};
use insight_server::embedding::OpenAiEmbedder;
use insight_server::questions::QuestionGenerator;
use insight_server::server::{run_server, AppState};
use insight_server::store::InsightStore;
use insight_server::sync::reindex_vault;
use insight_server::vector::ChromaIndex;
use insight_server::watcher::VaultWatcher;

/// Insight Server — a vault-synchronized semantic index and retrieval
/// server for personal notes.
#[derive(Parser)]
#[command(
    name = "insightd",
    about = "A vault-synchronized semantic index and retrieval server for personal notes",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./insightd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server and vault watcher.
    ///
    /// Binds to `[server].bind` and, when `[vault].path` is configured,
    /// watches its `Insights/` folder for changes.
    Serve,

    /// Re-index every Insight note in the vault.
    ///
    /// Walks `<vault>/Insights`, parses each markdown file, and upserts
    /// it into the index. Per-document failures are reported, not fatal.
    Reindex {
        /// Vault path; defaults to `[vault].path` from the config.
        #[arg(long)]
        vault: Option<PathBuf>,
    },

    /// Retrieve Insights related to a question.
    Query {
        /// The question text.
        text: String,

        /// Number of results to return (1-10).
        #[arg(long, default_value_t = 5)]
        top_k: usize,

        /// Minimum similarity threshold (0-1).
        #[arg(long, default_value_t = 0.7)]
        min_similarity: f32,
    },

    /// Show index and configuration status.
    Status,
}

/// Connect to Chroma and build the store from config.
async fn build_store(config: &Config) -> Result<Arc<InsightStore>> {
    let api_key = Config::openai_api_key()?;
    let embedder = OpenAiEmbedder::new(&config.embedding, api_key)?;
    let index = ChromaIndex::connect(&config.index).await?;
    Ok(Arc::new(InsightStore::new(
        Arc::new(embedder),
        Arc::new(index),
    )))
}

fn resolved_vault(config: &Config, override_path: Option<PathBuf>) -> Result<PathBuf> {
    let vault = override_path
        .or_else(|| config.vault.path.clone())
        .context("no vault path: pass --vault or set [vault].path in the config")?;
    Ok(vault.canonicalize().unwrap_or(vault))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            let store = build_store(&config).await?;
            let generator = QuestionGenerator::new(&config.llm, Config::openai_api_key()?)?;
            let debounce = Duration::from_millis(config.vault.debounce_ms);

            let watcher = match config.vault_path_resolved() {
                Some(vault) => {
                    let mut w = VaultWatcher::new(store.clone(), vault, debounce);
                    w.start()?;
                    Some(w)
                }
                None => {
                    println!("No vault path configured; watcher idle until PUT /api/v1/config.");
                    None
                }
            };

            let state = AppState {
                store,
                watcher: Arc::new(tokio::sync::Mutex::new(watcher)),
                generator: Arc::new(generator),
                openai_configured: true,
                debounce,
            };

            run_server(&config.server.bind, state).await?;
        }

        Commands::Reindex { vault } => {
            let vault = resolved_vault(&config, vault)?;
            let store = build_store(&config).await?;

            let report = reindex_vault(&store, &vault).await?;
            println!("Indexed {} Insight(s).", report.indexed_count);
            if !report.errors.is_empty() {
                println!("{} document(s) failed:", report.errors.len());
                for error in &report.errors {
                    println!("  {error}");
                }
            }
        }

        Commands::Query {
            text,
            top_k,
            min_similarity,
        } => {
            if !(1..=10).contains(&top_k) {
                bail!("--top-k must be between 1 and 10");
            }
            if !(0.0..=1.0).contains(&min_similarity) {
                bail!("--min-similarity must be between 0 and 1");
            }

            let store = build_store(&config).await?;
            let results = store.query(&text, top_k, min_similarity).await?;

            if results.is_empty() {
                println!("No related Insights found.");
            }
            for (i, insight) in results.iter().enumerate() {
                println!(
                    "{}. {} (similarity {:.4})",
                    i + 1,
                    insight.path,
                    insight.similarity
                );
                for line in insight.content.lines().take(3) {
                    println!("   {line}");
                }
            }
        }

        Commands::Status => {
            println!("config:      {}", cli.config.display());
            println!("server bind: {}", config.server.bind);
            println!("chroma:      {}", config.index.url);
            println!("collection:  {}", config.index.collection);
            match config.vault_path_resolved() {
                Some(vault) => println!("vault:       {}", vault.display()),
                None => println!("vault:       (not configured)"),
            }

            match ChromaIndex::connect(&config.index).await {
                Ok(index) => {
                    use insight_server::vector::VectorIndex;
                    let count = index.count().await.unwrap_or(0);
                    println!("indexed:     {count} Insight(s)");
                }
                Err(e) => println!("indexed:     unavailable ({e:#})"),
            }
        }
    }

    Ok(())
}
