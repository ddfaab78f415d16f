//! Recall - agent orchestration with long-term memory
//!
//! Command-line entry point. Results go to stdout as JSON, logs to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use recall_core::services::{PipelineResult, RetentionPolicy};
use recall_core::{config, AppState};
use recall_llm::ChatMessage;
use recall_models::NewMemory;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Recall - answer questions with a four-stage agent pipeline backed by
/// long-term memory.
#[derive(Parser)]
#[command(name = "recall")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reasoning pipeline for a query.
    Ask {
        /// The question or goal.
        query: String,

        /// Owner of the memories to use.
        #[arg(short, long, env = "RECALL_USER")]
        user: String,
    },

    /// Extract memories from a JSON transcript read on stdin.
    ///
    /// The transcript is an array of `{"role": "user"|"assistant", "content": "..."}`.
    Remember {
        #[arg(short, long, env = "RECALL_USER")]
        user: String,
    },

    /// Save one memory directly.
    Save {
        content: String,

        #[arg(short, long, env = "RECALL_USER")]
        user: String,

        /// Importance in [0, 1].
        #[arg(short, long, default_value = "0.5")]
        importance: f64,

        /// Tags (comma-separated).
        #[arg(short, long)]
        tags: Option<String>,
    },

    /// Delete one of the user's memories.
    Forget {
        memory_id: String,

        #[arg(short, long, env = "RECALL_USER")]
        user: String,
    },

    /// Delete the user's old, unimportant memories.
    Sweep {
        #[arg(short, long, env = "RECALL_USER")]
        user: String,

        #[arg(long, default_value = "90")]
        max_age_days: u32,

        /// Memories at or above this importance are kept.
        #[arg(long, default_value = "0.8")]
        protect_at: f64,
    },

    /// Print a session's ledger trail.
    Session {
        session_id: String,
    },

    /// Resume an errored session.
    Resume {
        session_id: String,
    },
}

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recall=debug,recall_core=debug".into()),
        )
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for the insight write-back, then print the answer.
async fn finish(
    (result, writeback): (PipelineResult, recall_core::services::InsightWriteback),
) -> anyhow::Result<()> {
    let outcome = writeback.wait().await;
    tracing::debug!(
        stored = outcome.stored.len(),
        failed = outcome.errors.len(),
        "Insight write-back settled"
    );
    print_json(&result)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = config::config();
    let state = AppState::new(config)
        .await
        .context("failed to initialize services")?;

    match cli.command {
        Commands::Ask { query, user } => {
            let run = state
                .orchestrator
                .run_pipeline_with_writeback(&query, &user)
                .await?;
            finish(run).await?;
        }
        Commands::Remember { user } => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .context("failed to read transcript from stdin")?;
            let transcript: Vec<ChatMessage> =
                serde_json::from_str(&raw).context("transcript must be a JSON array of messages")?;

            let result = state.extractor.extract_and_store(&transcript, &user).await;
            print_json(&result)?;
            if !result.success {
                std::process::exit(1);
            }
        }
        Commands::Save {
            content,
            user,
            importance,
            tags,
        } => {
            let tags = tags
                .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            let record = state
                .memory
                .save(
                    NewMemory::new(user, content)
                        .with_importance(importance)
                        .with_tags(tags),
                )
                .await?;
            print_json(&serde_json::json!({ "id": record.id }))?;
        }
        Commands::Forget { memory_id, user } => {
            let removed = state.memory.forget(&user, &memory_id).await?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
        Commands::Sweep {
            user,
            max_age_days,
            protect_at,
        } => {
            let removed = state
                .memory
                .sweep(
                    &user,
                    RetentionPolicy {
                        max_age_days,
                        protect_importance_at: protect_at,
                    },
                )
                .await?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
        Commands::Session { session_id } => {
            let trail = state.orchestrator.trail(&session_id).await?;
            print_json(&trail)?;
        }
        Commands::Resume { session_id } => {
            let run = state
                .orchestrator
                .resume_pipeline_with_writeback(&session_id)
                .await?;
            finish(run).await?;
        }
    }

    Ok(())
}
