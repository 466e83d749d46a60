//! Engram - memory layer CLI
//!
//! The `engram` command inspects and drives a memory backend by hand.
//!
//! ## Commands
//!
//! - `append`: Record an episode in a session
//! - `retrieve`: Ranked hybrid retrieval for a query
//! - `profile`: Show a user's stored profile facts
//! - `flush`: Run any pending extraction for a session
//! - `clear`: Tombstone a session's episodes
//! - `purge-user`: Remove every profile fact for a user

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use engram_core::{
    init_tracing, HashingEmbedder, MemoryConfig, MemoryCore, OpenAiConfig, OpenAiEmbedding,
    OpenAiExtraction, ScriptedExtractor,
};
use engram_store::{EpisodeDraft, Scope, SurrealHandle};

#[derive(Parser)]
#[command(name = "engram")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Memory layer for conversational AI agents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Group (tenant) the command operates in
    #[arg(long, global = true, default_value = "default")]
    group: String,

    /// Agent participating in the session
    #[arg(long, global = true, default_value = "assistant")]
    agent: String,

    /// User the memory belongs to
    #[arg(long, global = true, default_value = "user")]
    user: String,

    /// Session identifier
    #[arg(long, global = true, default_value = "default")]
    session: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record an episode in the session
    Append {
        /// Episode content
        content: String,

        /// Producer of the episode (defaults to --user)
        #[arg(long)]
        producer: Option<String>,
    },

    /// Ranked hybrid retrieval for a query
    Retrieve {
        /// Query text
        query: String,

        /// Maximum candidates to return
        #[arg(short, long, default_value_t = 10)]
        k: usize,
    },

    /// Show the user's stored profile facts
    Profile {
        /// Restrict to one tag
        #[arg(long)]
        tag: Option<String>,
    },

    /// Run any pending extraction for the session to completion
    Flush,

    /// Tombstone the session's episodes
    Clear,

    /// Remove every profile fact for the user
    PurgeUser,
}

/// Build the core against the configured backend. Capabilities come from
/// OPENAI_API_KEY when set; otherwise embeddings are deterministic hashes
/// and extraction is a no-op (append/retrieve still work).
async fn build_core() -> Result<MemoryCore> {
    let handle = Arc::new(
        SurrealHandle::setup_from_env()
            .await
            .context("Failed to connect to the Engram database")?,
    );

    let core = match OpenAiConfig::from_env() {
        Ok(config) => MemoryCore::new(
            handle.clone(),
            handle,
            Arc::new(OpenAiEmbedding::new(config.clone())),
            Arc::new(OpenAiExtraction::new(config)),
            MemoryConfig::default(),
        ),
        Err(_) => MemoryCore::new(
            handle.clone(),
            handle,
            Arc::new(HashingEmbedder::default()),
            Arc::new(ScriptedExtractor::default()),
            MemoryConfig::default(),
        ),
    };
    Ok(core)
}

async fn cmd_append(core: &MemoryCore, scope: &Scope, producer: &str, content: &str) -> Result<()> {
    let episode = core
        .append_episode(scope, EpisodeDraft::message(producer, content))
        .await?;
    println!("{} (seq {})", episode.episode_id, episode.seq);
    Ok(())
}

async fn cmd_retrieve(core: &MemoryCore, scope: &Scope, query: &str, k: usize) -> Result<()> {
    let result = core.retrieve(scope, query, k).await?;
    if result.partial {
        eprintln!("warning: partial result (a retrieval branch was dropped)");
    }
    for candidate in &result.candidates {
        println!(
            "{:>8.4}  {:<8}  {}",
            candidate.score,
            format!("{:?}", candidate.source).to_lowercase(),
            candidate.content
        );
    }
    Ok(())
}

async fn cmd_profile(core: &MemoryCore, group: &str, user: &str, tag: Option<&str>) -> Result<()> {
    let tags = tag.map(|t| vec![t.to_string()]);
    let facts = core.get_profile(group, user, tags.as_deref()).await?;
    for fact in &facts {
        println!(
            "{}/{} = {} (confidence {:.2}, v{})",
            fact.tag, fact.feature, fact.value, fact.confidence, fact.version
        );
    }
    if facts.is_empty() {
        println!("(no facts)");
    }
    Ok(())
}

async fn cmd_flush(core: &MemoryCore, scope: &Scope) -> Result<()> {
    let outcome = core.flush_extraction(scope).await?;
    println!(
        "watermark {} | {} facts written | {} conflicts",
        outcome.new_watermark,
        outcome.facts_written,
        outcome.conflicts.len()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let core = build_core().await?;
    let scope = Scope::new(&cli.group, &cli.agent, &cli.user, &cli.session);

    match cli.command {
        Commands::Append { content, producer } => {
            let producer = producer.as_deref().unwrap_or(&cli.user);
            cmd_append(&core, &scope, producer, &content).await
        }
        Commands::Retrieve { query, k } => cmd_retrieve(&core, &scope, &query, k).await,
        Commands::Profile { tag } => cmd_profile(&core, &cli.group, &cli.user, tag.as_deref()).await,
        Commands::Flush => cmd_flush(&core, &scope).await,
        Commands::Clear => {
            core.clear_session(&scope).await?;
            println!("session cleared");
            Ok(())
        }
        Commands::PurgeUser => {
            let removed = core.purge_user(&cli.group, &cli.user).await?;
            println!("{removed} facts removed");
            Ok(())
        }
    }
}
