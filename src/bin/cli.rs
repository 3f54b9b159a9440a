// PdfChunk - Encrypted PDF chunk download core
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use pdf_chunk_core::crypto::DecryptMode;
use pdf_chunk_core::download::resume::STATE_KEY_PREFIX;
use pdf_chunk_core::download::{ReassemblyPolicy, ResumeManager};
use pdf_chunk_core::{
    DownloadCallbacks, DownloadConfig, DownloadOutcome, DownloadRequest, Downloader, ReportClient,
    SqliteStateStore, StateStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "pdfchunk-cli")]
#[command(about = "PdfChunk CLI - download chunked PDF reports", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Resume state database (defaults to the platform data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a report
    Download {
        /// File id on the report service
        file_id: String,
        /// Document name used for the output file
        #[arg(short, long, default_value = "report.pdf")]
        name: String,
        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Keep chunks as delivered instead of decrypting them
        #[arg(long)]
        passthrough: bool,
        /// Save the document even if it fails validation
        #[arg(long)]
        lenient: bool,
    },
    /// Check that the chunk service is reachable
    Health,
    /// Inspect persisted resume states
    States {
        #[command(subcommand)]
        action: StatesAction,
    },
}

#[derive(Subcommand)]
enum StatesAction {
    /// List stored checkpoints
    List,
    /// Keep only the newest checkpoints
    Cleanup,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<DownloadConfig> {
    let mut config = match path {
        Some(path) => DownloadConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => DownloadConfig::default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

async fn open_store(path: Option<PathBuf>) -> anyhow::Result<Arc<SqliteStateStore>> {
    let path = path.unwrap_or_else(SqliteStateStore::get_default_path);
    let store = SqliteStateStore::new(&path)
        .await
        .with_context(|| format!("opening state database {}", path.display()))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Download {
            file_id,
            name,
            output,
            passthrough,
            lenient,
        } => {
            if let Some(output) = output {
                config.output_directory = output;
            }
            if lenient {
                config.reassembly_policy = ReassemblyPolicy::Lenient;
            }

            let api = Arc::new(ReportClient::from_config(&config)?);
            let store = open_store(cli.db).await?;
            let downloader = Downloader::new(api, store, config)?;

            let mut request = DownloadRequest::new(file_id, name);
            if passthrough {
                request = request.with_decrypt_mode(DecryptMode::Passthrough);
            }

            let callbacks = DownloadCallbacks::new()
                .on_progress(|percent| println!("Progress: {}%", percent))
                .on_error(|e| eprintln!("Error: {}", e.user_message()));

            match downloader.start_download(request, callbacks).await? {
                DownloadOutcome::Completed(path) => println!("Saved to {}", path.display()),
                other => bail!("download ended without a document: {:?}", other),
            }
            downloader.shutdown().await;
        }
        Commands::Health => {
            let api = Arc::new(ReportClient::from_config(&config)?);
            let store = Arc::new(pdf_chunk_core::MemoryStateStore::new());
            let downloader = Downloader::new(api, store, config)?;
            if !downloader.test_connection().await {
                bail!("chunk service is not reachable");
            }
            println!("Chunk service is healthy");
        }
        Commands::States { action } => {
            let store = open_store(cli.db).await?;
            let resume = ResumeManager::new(store.clone(), &config);
            match action {
                StatesAction::List => {
                    let mut keys = store.keys().await?;
                    keys.retain(|key| key.starts_with(STATE_KEY_PREFIX));
                    keys.sort();
                    if keys.is_empty() {
                        println!("No stored download states");
                    }
                    for key in keys {
                        let file_id = &key[STATE_KEY_PREFIX.len()..];
                        match resume.load_state(file_id).await {
                            Ok(Some(state)) => println!(
                                "{}: {}/{} chunks ({}%), saved at {}",
                                file_id,
                                state.downloaded_chunks,
                                state.total_chunks,
                                state.progress,
                                state.timestamp
                            ),
                            Ok(None) => {}
                            Err(e) => println!("{}: unreadable ({})", file_id, e),
                        }
                    }
                }
                StatesAction::Cleanup => {
                    let removed = resume.cleanup_old_states().await?;
                    println!("Removed {} old download state(s)", removed);
                }
            }
        }
    }

    Ok(())
}
