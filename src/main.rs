use std::path::PathBuf;

use ::tracing::{error, info, warn};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use storage_driver::{Driver, Error as StorageError};
use tokio::io::AsyncWriteExt;
use tokio_util::{io::ReaderStream, sync::CancellationToken};

mod config;
mod tracing;
use tracing::setup_tracing;

#[derive(Parser)]
#[command(version, about = "Inspect and maintain blob storage", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the origin that presigned URLs point at, for a CSP header.
    ProbeCsp,
    /// List every stored key.
    ListKeys,
    /// Print a presigned download URL for KEY.
    Presign { key: String },
    /// Upload FILE under KEY. Fails if KEY already exists.
    Put { key: String, file: PathBuf },
    /// Download KEY into FILE.
    Get { key: String, file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::ToolConfig::load(cli.config.as_deref())?;
    setup_tracing(&config);

    let driver = Driver::from_config(&config.storage)
        .await
        .context("creating storage driver")?;
    info!(backend = driver.backend().name(), "storage driver ready");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling");
                cancel.cancel();
            }
        }
    });

    let result = run(&driver, &cancel, cli.command).await;
    if let Err(err) = driver.close() {
        error!("error closing storage driver: {:?}", err);
    }
    result
}

async fn run(driver: &Driver, cancel: &CancellationToken, command: Command) -> Result<()> {
    match command {
        Command::ProbeCsp => {
            let origin = driver
                .probe_csp_uri(cancel)
                .await
                .context("probing csp origin")?;
            if origin.is_empty() {
                info!("backend serves no presigned urls, nothing to add to the csp");
            } else {
                println!("{origin}");
            }
        }
        Command::ListKeys => {
            let mut count = 0usize;
            driver
                .walk_keys(cancel, |key| {
                    println!("{key}");
                    count += 1;
                    Ok::<_, StorageError>(())
                })
                .await
                .context("listing keys")?;
            info!(count, "listed keys");
        }
        Command::Presign { key } => match driver.url(cancel, &key).await {
            Some(presigned) => println!("{}", presigned.url),
            None => {
                anyhow::bail!("no presigned url available for {key}; fetch it with `get` instead")
            }
        },
        Command::Put { key, file } => {
            let reader = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("opening {}", file.display()))?;
            let written = driver
                .put_stream(cancel, &key, ReaderStream::new(reader))
                .await
                .with_context(|| format!("storing {key}"))?;
            info!(key, bytes = written, "stored");
        }
        Command::Get { key, file } => {
            let mut reader = driver
                .get_stream(cancel, &key)
                .await
                .with_context(|| format!("reading {key}"))?;
            let mut writer = tokio::fs::File::create(&file)
                .await
                .with_context(|| format!("creating {}", file.display()))?;
            let mut read = 0u64;
            while let Some(chunk) = reader.next().await {
                let chunk = chunk.with_context(|| format!("reading {key}"))?;
                read += chunk.len() as u64;
                writer.write_all(&chunk).await?;
            }
            writer.flush().await?;
            info!(key, bytes = read, path = %file.display(), "fetched");
        }
    }
    Ok(())
}
