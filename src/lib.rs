//! An image gallery kept in an [Azure Blob Storage] container.
//!
//! [Azure Blob Storage]: https://learn.microsoft.com/rest/api/storageservices/blob-service-rest-api
//!
//! Every pass of the gallery runs the same sequence: make sure the container
//! exists (creating it at most once), store an optional upload under its file
//! name, then list what the container holds.  Blob content is only downloaded
//! on request, for an inline thumbnail or to hand to an image analyzer.
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use blob_gallery::config::GalleryConfig;
//! use blob_gallery::gallery::{Gallery, UploadRequest};
//!
//! let config = GalleryConfig::from_env()?;
//! let gallery = Gallery::new(Arc::new(config.blob_client()?), &config.container);
//!
//! let file = tokio::fs::File::open("cat.jpg").await?;
//! let feed = gallery
//!     .render_feed(Some(UploadRequest::new("cat.jpg", file)))
//!     .await?;
//! for blob in feed.blobs {
//!     println!("{} ({} bytes)", blob.url, blob.size);
//! }
//! ```
//!
//! The storage calls go through the [`BlobStorageApi`] trait.
//! [`AzureBlobClient`] talks to the REST API; [`InMemoryBlobStore`] keeps
//! everything in process, which is what the tests run against.
//!
//! [`BlobStorageApi`]: crate::client::BlobStorageApi
//! [`AzureBlobClient`]: crate::client::AzureBlobClient
//! [`InMemoryBlobStore`]: crate::memory::InMemoryBlobStore

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod gallery;
pub mod listing;
pub mod memory;
pub mod provision;
pub mod retry;
pub mod upload;
pub mod vision;
