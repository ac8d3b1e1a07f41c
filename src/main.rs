//! Command line front end for the blob gallery.
//!
//! ## Usage
//!
//! ```bash
//! # Create the gallery container if it does not exist yet
//! blob-gallery provision
//!
//! # Store a file under its file name, then list the gallery
//! blob-gallery upload ./cat.jpg
//!
//! # List the gallery, optionally with inline thumbnails or as JSON
//! blob-gallery list --thumbnails
//! blob-gallery list --json
//!
//! # Download one blob
//! blob-gallery fetch cat.jpg --output /tmp/cat.jpg
//!
//! # Describe an image with the vision service (needs SUBS_KEY)
//! blob-gallery analyze cat.jpg
//! ```
//!
//! Credentials come from `ACCOUNT_NAME` and `ACCOUNT_KEY` (or
//! `AZURE_STORAGE_SAS_TOKEN`).  A `.env` file in the working directory is
//! loaded first.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use blob_gallery::client::AzureBlobClient;
use blob_gallery::config::GalleryConfig;
use blob_gallery::error::{GalleryError, StorageError};
use blob_gallery::gallery::{Gallery, GalleryFeed, UploadRequest};
use blob_gallery::retry::RetryPolicy;
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "blob-gallery")]
#[command(about = "Image gallery backed by Azure Blob Storage")]
struct Args {
    /// Container holding the gallery
    #[arg(long, env = "GALLERY_CONTAINER")]
    container: Option<String>,

    /// Attempts per storage call, including the first
    #[arg(long, default_value_t = 3)]
    attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the gallery container if it is missing
    Provision,
    /// Upload a file and list the gallery
    Upload {
        path: PathBuf,
        /// Blob name; defaults to the file name
        #[arg(long)]
        name: Option<String>,
    },
    /// List the gallery
    List {
        /// Print each image as an inline data URL
        #[arg(long, conflicts_with = "json")]
        thumbnails: bool,
        /// Print the summaries as a JSON array
        #[arg(long)]
        json: bool,
    },
    /// Download a blob
    Fetch {
        key: String,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Describe an image with the vision service
    Analyze { key: String },
}

fn print_feed(feed: &GalleryFeed) {
    for blob in &feed.blobs {
        println!(
            "{}\t{}\t{}\t{}",
            blob.name, blob.size, blob.content_type, blob.url
        );
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = GalleryConfig::from_env()?;
    if let Some(container) = args.container {
        config.container = container;
    }
    debug!(?config, "loaded configuration");

    let retry = RetryPolicy {
        max_attempts: args.attempts.max(1),
        ..Default::default()
    };
    let client: Arc<AzureBlobClient> = Arc::new(config.blob_client()?);
    let gallery = Gallery::new(client, &config.container).with_retry(retry);

    match args.command {
        Command::Provision => {
            let outcome = gallery.provision().await?;
            info!(container = gallery.container(), ?outcome, "provisioned");
            println!("{}: {:?}", gallery.container(), outcome);
        }
        Command::Upload { path, name } => {
            let name = match name {
                Some(name) => name,
                None => path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("cannot derive a blob name from {}", path.display()))?,
            };
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            let feed = gallery
                .render_feed(Some(UploadRequest::new(&name, file)))
                .await?;
            print_feed(&feed);
        }
        Command::List { thumbnails, json } => {
            let feed = gallery.render_feed(None).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&feed.blobs)?);
                return Ok(());
            }
            print_feed(&feed);
            if thumbnails {
                for blob in &feed.blobs {
                    println!("{}\t{}", blob.name, gallery.thumbnail_data_url(&blob.name).await?);
                }
            }
        }
        Command::Fetch { key, output } => {
            let blob = gallery.fetch(&key).await?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, &blob.content)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(blob = %key, path = %path.display(), bytes = blob.content.len(), "saved blob");
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&blob.content).await?;
                    stdout.flush().await?;
                }
            }
        }
        Command::Analyze { key } => {
            let analyzer = config.vision_client()?;
            let analysis = gallery.analyze(&key, &analyzer).await?;
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
    }
    Ok(())
}

/// Renders failures as `<code>: <message>`
fn report(err: &anyhow::Error) -> String {
    if let Some(err) = err.downcast_ref::<GalleryError>() {
        err.to_string()
    } else if let Some(err) = err.downcast_ref::<StorageError>() {
        format!("{}: {}", err.code(), err)
    } else {
        format!("{:#}", err)
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("blob_gallery=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(err) = run(Args::parse()).await {
        eprintln!("{}", report(&err));
        std::process::exit(1);
    }
}
