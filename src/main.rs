//! # CI Triage CLI (`triage`)
//!
//! The `triage` binary is the operational interface for CI Triage. It
//! provides commands for database initialization, one-shot log analysis,
//! queue management, the worker pool, semantic search, embedding backfill,
//! and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! triage --config ./config/triage.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `triage init` | Create the SQLite database and run schema migrations |
//! | `triage analyze <file>` | Parse, classify, and analyze a log file synchronously |
//! | `triage enqueue` | Queue a run for background processing |
//! | `triage worker` | Run the worker pool until ctrl-c |
//! | `triage search "<query>"` | Semantic search over ingested chunks |
//! | `triage embed pending` | Backfill missing chunk embeddings |
//! | `triage stats` | Database and queue statistics |
//! | `triage serve` | Start the webhook + analysis HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ci_triage::queue::{self, LogProcessingJob, LOG_PROCESSING};
use ci_triage::{
    analyzer, config, db, embed_cmd, migrate, pipeline, search, server, stats, worker,
};

/// CI Triage — build-log ingestion, failure classification, and
/// retrieval-augmented root-cause analysis.
#[derive(Parser)]
#[command(
    name = "triage",
    about = "CI Triage — build-log ingestion, failure classification, and root-cause analysis",
    version,
    long_about = "CI Triage ingests CI/CD build logs, chunks and embeds them into a \
    searchable index, classifies failures deterministically, and grounds LLM root-cause \
    narratives in historically similar failures."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/triage.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent.
    Init,

    /// Analyze a log file synchronously, without the queue.
    ///
    /// Runs the full pure pipeline (clean → steps → chunks → errors →
    /// classify → analyze) and prints the verdict. Nothing is persisted.
    Analyze {
        /// Path to the raw log file.
        file: PathBuf,

        /// Emit the verdict as JSON instead of the human-readable report.
        #[arg(long)]
        json: bool,
    },

    /// Queue a run for background processing.
    Enqueue {
        /// Repository in `owner/name` form.
        #[arg(long)]
        repo: String,

        /// Provider-side run id.
        #[arg(long)]
        run_id: i64,

        /// Provider installation id.
        #[arg(long, default_value_t = 0)]
        installation_id: i64,
    },

    /// Run the worker pool until ctrl-c.
    Worker {
        /// Number of concurrent job executors.
        #[arg(long, default_value_t = 2)]
        concurrency: usize,
    },

    /// Semantic search over ingested chunks.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<i64>,

        /// Minimum similarity in [0, 1]; defaults to the configured threshold.
        #[arg(long)]
        min_similarity: Option<f64>,

        /// Only return error-bearing chunks.
        #[arg(long)]
        errors_only: bool,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Database and queue statistics.
    Stats,

    /// Start the webhook + analysis HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that are missing embeddings.
    Pending {
        /// Maximum number of chunks to embed in this run.
        #[arg(long)]
        limit: Option<i64>,

        /// Show counts without performing any embedding.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(cfg) => cfg,
        // One-shot analysis should work out of the box; everything else
        // needs a real config file.
        Err(e) if matches!(cli.command, Commands::Analyze { .. }) => {
            eprintln!("Warning: {} — using built-in defaults", e);
            config::Config::minimal()
        }
        Err(e) => return Err(e),
    };

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Analyze { file, json } => {
            let raw = std::fs::read_to_string(&file)?;
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;

            let run_id = uuid::Uuid::new_v4().to_string();
            let parsed = pipeline::parse_log(&cfg, &run_id, &raw)?;
            let verdict = analyzer::analyze(&pool, &cfg, &parsed.chunks, &parsed.errors).await;

            if json {
                let out = serde_json::json!({
                    "detectedErrors": parsed.errors,
                    "steps": parsed.steps,
                    "rootCause": verdict.narrative.root_cause,
                    "failureStage": verdict.narrative.failure_stage,
                    "suggestedFix": verdict.narrative.suggested_fix,
                    "failureType": verdict.failure_type,
                    "priority": verdict.priority,
                    "confidence": verdict.confidence,
                    "usedLlm": verdict.used_llm,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("Steps ({}):", parsed.steps.len());
                for s in &parsed.steps {
                    println!("  {:>5}-{:<5} {}", s.start_line, s.end_line, s.name);
                }
                println!();
                println!("Detected errors ({}):", parsed.errors.len());
                for e in &parsed.errors {
                    println!("  - [{}] {} (step: {})", e.category, e.message, e.step_name);
                }
                println!();
                println!(
                    "Classification: {} (priority {}) — {}",
                    verdict.failure_type, verdict.priority, verdict.classification.reason
                );
                println!("Used LLM:       {}", verdict.used_llm);
                println!("Confidence:     {:.2}", verdict.confidence);
                println!();
                println!("Root cause:     {}", verdict.narrative.root_cause);
                println!("Failure stage:  {}", verdict.narrative.failure_stage);
                println!("Suggested fix:  {}", verdict.narrative.suggested_fix);
            }

            pool.close().await;
        }
        Commands::Enqueue {
            repo,
            run_id,
            installation_id,
        } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;

            let payload = LogProcessingJob {
                repo_full_name: repo,
                run_id,
                installation_id,
            };
            let job_id = queue::enqueue(
                &pool,
                LOG_PROCESSING,
                LOG_PROCESSING,
                &serde_json::to_string(&payload)?,
                chrono::Utc::now().timestamp(),
            )
            .await?;

            println!("enqueued job {}", job_id);
            pool.close().await;
        }
        Commands::Worker { concurrency } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            worker::run_worker(pool, cfg, concurrency).await?;
        }
        Commands::Search {
            query,
            limit,
            min_similarity,
            errors_only,
        } => {
            let pool = db::connect(&cfg).await?;
            search::run_search(&pool, &cfg, &query, limit, min_similarity, errors_only).await?;
            pool.close().await;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit, dry_run } => {
                let pool = db::connect(&cfg).await?;
                embed_cmd::run_embed_pending(&pool, &cfg, limit, dry_run).await?;
                pool.close().await;
            }
        },
        Commands::Stats => {
            let pool = db::connect(&cfg).await?;
            stats::run_stats(&pool, &cfg).await?;
            pool.close().await;
        }
        Commands::Serve => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            server::run_server(pool, &cfg).await?;
        }
    }

    Ok(())
}
