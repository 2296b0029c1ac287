use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::build_router;
use crate::orchestrator::CreateEventRequest;
use crate::query::TimeRange;
use crate::runtime::EvidenceRuntime;

/// Top-level CLI interface for the evidence graph
#[derive(Parser)]
#[command(
    name = "evidence_graph",
    version,
    about = "Tamper-evident compliance evidence ledger and graph"
)]
pub struct Cli {
    /// Configuration file (defaults to $EVIDENCE_CONFIG or evidence.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API and run the clock monitor and anchor job
    Serve {
        /// Host/IP to bind, overriding server.host
        #[arg(long)]
        host: Option<String>,
        /// Port to bind, overriding server.port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Ingest events from a JSON array or JSON lines file
    Ingest {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Validate hash chains
    Validate {
        #[arg(short, long)]
        source: Option<String>,
        #[arg(long)]
        from: Option<u64>,
        #[arg(long)]
        to: Option<u64>,
    },

    /// List sequence gaps
    Gaps {
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Validate and gap-check every stream, flagging failures as degraded
    Audit,

    /// Evaluate every running clock once
    Tick,

    /// Seal and witness one anchor now
    Anchor,

    /// Run a compliance query over a time range
    Query {
        #[arg(short, long)]
        id: String,
        #[arg(long)]
        from: DateTime<Utc>,
        #[arg(long)]
        to: DateTime<Utc>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse a JSON array, or one request per non-empty line.
fn parse_events(raw: &str) -> anyhow::Result<Vec<CreateEventRequest>> {
    if raw.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(raw)?);
    }
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("invalid event on line {}", n + 1))
        })
        .collect()
}

pub async fn run(cli: Cli, runtime: EvidenceRuntime) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { host, port } => {
            let mut server = runtime.config.server.clone();
            if let Some(host) = host {
                server.host = host;
            }
            if let Some(port) = port {
                server.port = port;
            }
            let addr = server.bind_addr();

            let runtime = Arc::new(runtime);
            let tasks = runtime.spawn_background();
            let app = build_router(runtime.clone());

            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            info!(%addr, "HTTP server listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(error = %e, "failed to listen for shutdown signal");
                    }
                })
                .await?;

            for task in tasks {
                task.stop().await;
            }
            info!("server stopped");
        }
        Commands::Ingest { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let mut receipts = Vec::new();
            for request in parse_events(&raw)? {
                receipts.push(runtime.orchestrator.create_event(request)?);
            }
            print_json(&receipts)?;
        }
        Commands::Validate { source, from, to } => {
            let result = runtime
                .ledger
                .validate_chain(source.as_deref(), from, to)?;
            print_json(&result)?;
            if !result.valid {
                bail!(
                    "chain broken at sequence {}",
                    result.broken_at_sequence.unwrap_or_default()
                );
            }
        }
        Commands::Gaps { source } => {
            print_json(&runtime.ledger.detect_gaps(source.as_deref())?)?;
        }
        Commands::Audit => {
            let audits = runtime.ledger.audit_all()?;
            print_json(&audits)?;
            let degraded = audits.iter().filter(|a| !a.is_healthy()).count();
            if degraded > 0 {
                bail!("{degraded} stream(s) degraded");
            }
        }
        Commands::Tick => {
            print_json(&runtime.clocks.tick_now()?)?;
        }
        Commands::Anchor => match runtime.anchors.run_now().await? {
            Some(anchor) => print_json(&anchor)?,
            None => println!("nothing to anchor"),
        },
        Commands::Query { id, from, to } => {
            let range = TimeRange::new(from, to)?;
            print_json(&runtime.queries.run_compliance_query(&id, range)?)?;
        }
    }
    Ok(())
}
