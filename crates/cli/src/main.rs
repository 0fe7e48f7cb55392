//! codeweave CLI - multi-repository code indexing service
//!
//! `serve` runs the background service; the other subcommands are one-shot
//! operations against the configured storage.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use codeweave::lock::{default_lock_path, ServiceLock};
use codeweave::output;
use codeweave::{build_orchestrator, load_config};
use codeweave_core::{EntityKind, HealthStatus, Language, SearchFilters};
use codeweave_indexer::Orchestrator;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often `serve` samples loop health
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "codeweave")]
#[command(about = "Index several repositories into one searchable code graph")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Use in-process storage and mock embeddings; nothing is persisted
    #[arg(long, global = true)]
    memory: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the indexing service until interrupted
    Serve,
    /// Scan every repository, index the changes and resolve references once
    Index,
    /// Show indexing status
    Status {
        /// Repository name; all repositories when omitted
        repository: Option<String>,
    },
    /// Semantic search over indexed entities
    Search {
        query: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
        /// Restrict to a repository (name)
        #[arg(long)]
        repository: Option<String>,
        #[arg(long)]
        language: Option<String>,
        #[arg(long)]
        kind: Option<String>,
        /// Restrict to a file path relative to its repository root
        #[arg(long)]
        file: Option<String>,
    },
    /// Show an entity and its relations
    Show {
        /// Fully qualified name, e.g. `pkg.module.Class.method`
        qualified_name: String,
    },
    /// Rescan a repository and index what changed
    Reindex {
        repository: String,
        /// Requeue every file and retry failed ones
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(cli.config.as_deref(), cli.memory)?;
    let in_memory = config.storage.backend == "memory";
    // Two services over the same storage would race each other's claims
    let _lock = match cli.command {
        Commands::Serve if !in_memory => Some(ServiceLock::acquire(&default_lock_path()?)?),
        _ => None,
    };
    let orchestrator = build_orchestrator(config).await?;

    if in_memory && !matches!(cli.command, Commands::Serve | Commands::Index) {
        // Nothing survives between runs: build the index first
        info!("In-memory storage, indexing before the query");
        orchestrator.run_once().await?;
    }

    let result = run(&cli, &orchestrator).await;
    if !matches!(cli.command, Commands::Serve) {
        orchestrator.storage().close().await;
    }
    result
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: &Cli, orchestrator: &Orchestrator) -> Result<()> {
    match &cli.command {
        Commands::Serve => serve(orchestrator).await,
        Commands::Index => {
            let report = orchestrator.run_once().await?;
            emit(cli.json, &report, || output::format_run(&report))
        }
        Commands::Status { repository } => {
            let status = orchestrator.status(repository.as_deref()).await?;
            emit(cli.json, &status, || output::format_status(&status))
        }
        Commands::Search {
            query,
            limit,
            repository,
            language,
            kind,
            file,
        } => {
            let filters = SearchFilters {
                repository_id: match repository {
                    Some(name) => Some(repository_id(orchestrator, name).await?),
                    None => None,
                },
                language: language
                    .as_deref()
                    .map(|l| l.parse::<Language>())
                    .transpose()
                    .map_err(|e| anyhow!("Invalid language: {e}"))?,
                kind: kind
                    .as_deref()
                    .map(|k| k.parse::<EntityKind>())
                    .transpose()
                    .map_err(|e| anyhow!("Invalid entity kind: {e}"))?,
                file_path: file.clone(),
            };
            let hits = orchestrator.query().search(query, *limit, &filters).await?;
            emit(cli.json, &hits, || output::format_hits(&hits))
        }
        Commands::Show { qualified_name } => {
            let query = orchestrator.query();
            let entities = query.get_entity(qualified_name).await?;
            if entities.is_empty() {
                return Err(anyhow!("No entity named {qualified_name}"));
            }
            for entity in &entities {
                let references = query.get_references(&entity.id).await?;
                if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&serde_json::json!({
                            "entity": entity,
                            "references": references,
                        }))?
                    );
                } else {
                    println!(
                        "{} {} ({}:{})",
                        entity.kind, entity.qualified_name, entity.repository_id, entity.span.start_line
                    );
                    print!("{}", output::format_references(&references));
                }
            }
            Ok(())
        }
        Commands::Reindex { repository, force } => {
            let scan = orchestrator.query().reindex(repository, *force).await?;
            let drain = orchestrator.drain_backlog().await?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "scan": scan,
                        "drain": drain,
                    }))?
                );
            } else {
                print!("{}", output::format_scan(repository, &scan));
                println!("indexed {}, deleted {}, failed {}", drain.indexed, drain.deleted, drain.failed);
            }
            Ok(())
        }
    }
}

/// Run the background loops until ctrl-c, logging every health change
async fn serve(orchestrator: &Orchestrator) -> Result<()> {
    orchestrator.start().await?;
    info!("codeweave is running; press ctrl-c to stop");

    let mut last = HealthStatus::Healthy;
    let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(e) = signal {
                    warn!("Failed to listen for ctrl-c: {e}");
                }
                break;
            }
            _ = ticker.tick() => {
                let health = orchestrator.health();
                if health != last {
                    match &health {
                        HealthStatus::Healthy => info!("Service recovered; all loops healthy"),
                        HealthStatus::Degraded { loops } => {
                            warn!(loops = %loops.join(","), "Service degraded")
                        }
                    }
                    last = health;
                }
            }
        }
    }
    orchestrator.shutdown().await;
    Ok(())
}

async fn repository_id(orchestrator: &Orchestrator, name: &str) -> Result<String> {
    let reports = orchestrator
        .query()
        .get_index_status(Some(name))
        .await
        .with_context(|| format!("Unknown repository {name}"))?;
    reports
        .into_iter()
        .next()
        .map(|r| r.repository.id)
        .ok_or_else(|| anyhow!("Unknown repository {name}"))
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print!("{}", text());
    }
    Ok(())
}
