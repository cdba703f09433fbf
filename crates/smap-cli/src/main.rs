use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use smap_client::{ClientConfig, HistoryCollector, PageFetcher};
use smap_core::EntityKind;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "smap")]
#[command(about = "Salesmap history attribution command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Drain every history page and print the merged list as JSON.
    Fetch {
        #[arg(long, default_value = "people")]
        kind: EntityKind,
        #[arg(long, env = "SMAP_API_TOKEN", hide_env_values = true)]
        token: String,
        #[arg(long)]
        cursor: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Collect, analyze and write the attribution workbook to the export directory.
    Export {
        #[arg(long, default_value = "people")]
        kind: EntityKind,
        #[arg(long, env = "SMAP_API_TOKEN", hide_env_values = true)]
        token: String,
        #[arg(long)]
        cursor: Option<String>,
    },
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "smap=info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Fetch {
            kind,
            token,
            cursor,
            out,
        } => {
            let config = ClientConfig::from_env();
            let fetcher = Arc::new(PageFetcher::new(&config)?);
            let collector = HistoryCollector::with_fresh_limiter(fetcher, config.rate_limit);
            let collected = collector.collect(kind, &token, cursor.as_deref()).await;

            let list = collected
                .records
                .iter()
                .map(|r| r.to_wire_json(kind))
                .collect::<Vec<_>>();
            let body = serde_json::to_string_pretty(&serde_json::json!({
                (kind.list_key()): list,
                "nextCursor": null,
            }))?;

            match out {
                Some(path) => {
                    std::fs::write(&path, body)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), "history written");
                }
                None => println!("{body}"),
            }
            eprintln!(
                "fetch complete: run_id={} kind={} pages={} records={}",
                collected.run_id,
                kind,
                collected.pages,
                collected.records.len()
            );
        }
        Commands::Export {
            kind,
            token,
            cursor,
        } => {
            let summary = smap_export::run_export_from_env(kind, &token, cursor.as_deref()).await?;
            println!(
                "export complete: run_id={} kind={} records={} rows={} partial={} manifest={}",
                summary.run_id,
                summary.kind,
                summary.records,
                summary.rows,
                summary.partial,
                summary.manifest
            );
        }
        Commands::Serve { port } => {
            smap_web::serve_from_env(port).await?;
        }
    }

    Ok(())
}
