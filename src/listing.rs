//! Blob listing and content retrieval.
//!
//! Listing only returns summaries.  Content is downloaded per blob, on
//! request, so rendering a large container does not pull every blob over the
//! network.

use bytes::Bytes;
use futures::stream::{self, Stream, TryStreamExt};

use crate::client::{BlobContent, BlobStorageApi, BlobSummary, ListBlobsOptions};
use crate::error::GalleryError;
use crate::retry::RetryPolicy;

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Lazily enumerates the blobs in `container`.
///
/// Pages are requested only as the stream is consumed and follow the
/// service's continuation markers.  Each call starts a fresh enumeration.
pub fn blob_summaries<'a, A>(
    api: &'a A,
    container: &'a str,
    page_size: Option<u32>,
    retry: &'a RetryPolicy,
) -> impl Stream<Item = Result<BlobSummary, GalleryError>> + 'a
where
    A: BlobStorageApi + ?Sized,
{
    stream::try_unfold(Cursor::Start, move |cursor| async move {
        let marker = match cursor {
            Cursor::Start => None,
            Cursor::Next(marker) => Some(marker),
            Cursor::Done => return Ok::<_, GalleryError>(None),
        };
        let options = ListBlobsOptions {
            marker,
            max_results: page_size,
            ..Default::default()
        };
        let page = retry
            .run("list_blobs", || api.list_blobs(container, options.clone()))
            .await
            .map_err(|source| GalleryError::ListingFailure {
                container: container.to_string(),
                source,
            })?;

        let next = match page.next_marker {
            Some(marker) => Cursor::Next(marker),
            None => Cursor::Done,
        };
        Ok(Some((stream::iter(page.blobs.into_iter().map(Ok::<_, GalleryError>)), next)))
    })
    .try_flatten()
}

/// Collects every blob summary in `container`
pub async fn list_blobs<A>(
    api: &A,
    container: &str,
    retry: &RetryPolicy,
) -> Result<Vec<BlobSummary>, GalleryError>
where
    A: BlobStorageApi + ?Sized,
{
    blob_summaries(api, container, None, retry)
        .try_collect()
        .await
}

/// Downloads a blob together with its content type
pub async fn fetch_blob<A>(
    api: &A,
    container: &str,
    key: &str,
    retry: &RetryPolicy,
) -> Result<BlobContent, GalleryError>
where
    A: BlobStorageApi + ?Sized,
{
    retry
        .run("get_blob", || api.get_blob(container, key))
        .await
        .map_err(|source| GalleryError::FetchFailure {
            container: container.to_string(),
            blob: key.to_string(),
            source,
        })
}

/// Downloads the content of a single blob
pub async fn fetch_content<A>(
    api: &A,
    container: &str,
    key: &str,
    retry: &RetryPolicy,
) -> Result<Bytes, GalleryError>
where
    A: BlobStorageApi + ?Sized,
{
    Ok(fetch_blob(api, container, key, retry).await?.content)
}

/// Names of the blobs in `container`, in listing order
pub async fn blob_names<A>(
    api: &A,
    container: &str,
    retry: &RetryPolicy,
) -> Result<Vec<String>, GalleryError>
where
    A: BlobStorageApi + ?Sized,
{
    blob_summaries(api, container, None, retry)
        .map_ok(|summary| summary.name)
        .try_collect()
        .await
}
