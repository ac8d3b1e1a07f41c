//! Upload dispatch.
//!
//! Uploads are staged on local disk first, the way a web front end receives a
//! multipart file, and the staged copy is deleted once the dispatch attempt is
//! over, whether it succeeded or not.

use std::future::Future;
use std::path::Path;

use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info};

use crate::client::{BlobBody, BlobStorageApi, BlobSummary, PutBlobOptions};
use crate::error::{GalleryError, Result, StorageError};
use crate::retry::RetryPolicy;

/// Guess content type from the file extension
pub fn guess_content_type(file_name: &str) -> &'static str {
    let extension = match file_name.rsplit_once('.') {
        Some((_, extension)) => extension.to_lowercase(),
        None => String::new(),
    };

    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "tif" | "tiff" => "image/tiff",
        "ico" => "image/x-icon",
        "txt" => "text/plain",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

/// An upload staged in a temporary file.  The file is removed on drop.
#[derive(Debug)]
pub struct StagedUpload {
    file_name: String,
    file: NamedTempFile,
}

impl StagedUpload {
    /// Stages `reader` in the system temp directory
    pub async fn stage<R>(file_name: &str, reader: R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        Self::stage_in(&std::env::temp_dir(), file_name, reader).await
    }

    /// Stages `reader` in `dir`, reading it to completion
    pub async fn stage_in<R>(dir: &Path, file_name: &str, mut reader: R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let file = NamedTempFile::new_in(dir)?;
        let mut out = tokio::fs::File::from_std(file.as_file().try_clone()?);
        let written = tokio::io::copy(&mut reader, &mut out).await?;
        out.flush().await?;
        debug!(file_name, bytes = written, path = %file.path().display(), "staged upload");

        Ok(Self {
            file_name: file_name.to_string(),
            file,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Location of the staged copy on disk
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Opens the staged copy for streaming.  Each call starts from the top.
    pub async fn body(&self) -> Result<BlobBody> {
        BlobBody::from_path(self.file.path()).await
    }
}

/// Puts one blob, building a fresh body for every attempt
async fn put_with_retry<A, F, Fut>(
    api: &A,
    container: &str,
    file_name: &str,
    mut body: F,
    retry: &RetryPolicy,
) -> std::result::Result<BlobSummary, GalleryError>
where
    A: BlobStorageApi + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<BlobBody>>,
{
    let options = PutBlobOptions {
        content_type: Some(guess_content_type(file_name).to_string()),
    };
    let options = &options;
    let summary = retry
        .run("put_blob", move || {
            let next = body();
            async move {
                let body = next.await?;
                api.put_blob(container, file_name, body, options.clone()).await
            }
        })
        .await
        .map_err(|source| GalleryError::UploadFailure {
            container: container.to_string(),
            blob: file_name.to_string(),
            source,
        })?;

    info!(container, blob = file_name, size = summary.size, "uploaded blob");
    Ok(summary)
}

/// Stores `content` under `file_name`, replacing any blob with that name.
///
/// The container is not checked or created here; provision it first.
pub async fn upload_bytes<A>(
    api: &A,
    container: &str,
    file_name: &str,
    content: Bytes,
    retry: &RetryPolicy,
) -> std::result::Result<BlobSummary, GalleryError>
where
    A: BlobStorageApi + ?Sized,
{
    let content = &content;
    put_with_retry(
        api,
        container,
        file_name,
        move || async move { Ok::<_, StorageError>(BlobBody::Bytes(content.clone())) },
        retry,
    )
    .await
}

/// Streams a staged file to the backend and deletes the staged copy afterwards.
pub async fn dispatch_staged<A>(
    api: &A,
    container: &str,
    staged: StagedUpload,
    retry: &RetryPolicy,
) -> std::result::Result<BlobSummary, GalleryError>
where
    A: BlobStorageApi + ?Sized,
{
    let source = &staged;
    put_with_retry(api, container, staged.file_name(), move || source.body(), retry).await
}

/// Reads `reader` to completion and stores it under `file_name`.
pub async fn upload_blob<A, R>(
    api: &A,
    container: &str,
    file_name: &str,
    reader: R,
    retry: &RetryPolicy,
) -> std::result::Result<BlobSummary, GalleryError>
where
    A: BlobStorageApi + ?Sized,
    R: AsyncRead + Unpin,
{
    if file_name.is_empty() {
        return Err(GalleryError::UploadFailure {
            container: container.to_string(),
            blob: String::new(),
            source: StorageError::required("file name"),
        });
    }
    let staged = StagedUpload::stage(file_name, reader)
        .await
        .map_err(|source| GalleryError::UploadFailure {
            container: container.to_string(),
            blob: file_name.to_string(),
            source,
        })?;
    dispatch_staged(api, container, staged, retry).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::StorageCredential;
    use crate::client::AzureBlobClient;
    use crate::memory::{InMemoryBlobStore, Operation};

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(guess_content_type("cat.JPG"), "image/jpeg");
        assert_eq!(guess_content_type("HelloWorld.txt"), "text/plain");
        assert_eq!(guess_content_type("archive"), "application/octet-stream");
    }

    #[tokio::test]
    async fn staged_file_is_removed_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryBlobStore::new().with_container("imagecontainer", Default::default());

        let staged = StagedUpload::stage_in(dir.path(), "cat.jpg", &b"0123456789"[..])
            .await
            .unwrap();
        let path = staged.path().to_path_buf();
        assert!(path.exists());

        let summary = dispatch_staged(&store, "imagecontainer", staged, &RetryPolicy::none())
            .await
            .unwrap();

        assert_eq!(summary.size, 10);
        assert_eq!(summary.content_type, "image/jpeg");
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn staged_file_is_streamed_to_the_service() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/imagecontainer/cat.jpg")
            .match_header("content-length", "10")
            .match_header("content-type", "image/jpeg")
            .match_body("0123456789")
            .with_status(201)
            .create_async()
            .await;
        let credential = StorageCredential::shared_key("devaccount", "a2V5").unwrap();
        let client = AzureBlobClient::with_credentials("devaccount", Arc::new(credential))
            .with_base_url(&server.url());

        let dir = tempfile::tempdir().unwrap();
        let staged = StagedUpload::stage_in(dir.path(), "cat.jpg", &b"0123456789"[..])
            .await
            .unwrap();

        let summary = dispatch_staged(&client, "imagecontainer", staged, &RetryPolicy::none())
            .await
            .unwrap();

        assert_eq!(summary.size, 10);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn retried_uploads_resend_the_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryBlobStore::new().with_container("imagecontainer", Default::default());
        store
            .fail_next(
                Operation::PutBlob,
                StorageError::Service {
                    status: 503,
                    code: "ServerBusy".to_string(),
                    message: "try later".to_string(),
                },
            )
            .await;
        let retry = RetryPolicy {
            base_delay: std::time::Duration::from_millis(1),
            ..RetryPolicy::default()
        };

        let staged = StagedUpload::stage_in(dir.path(), "cat.jpg", &b"0123456789"[..])
            .await
            .unwrap();
        dispatch_staged(&store, "imagecontainer", staged, &retry)
            .await
            .unwrap();

        let blob = store.get_blob("imagecontainer", "cat.jpg").await.unwrap();
        assert_eq!(blob.content, Bytes::from_static(b"0123456789"));
        assert_eq!(store.call_count(Operation::PutBlob).await, 2);
    }

    #[tokio::test]
    async fn staged_file_is_removed_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryBlobStore::new().with_container("imagecontainer", Default::default());
        store
            .fail_next(
                Operation::PutBlob,
                StorageError::Service {
                    status: 500,
                    code: "InternalError".to_string(),
                    message: "boom".to_string(),
                },
            )
            .await;

        let staged = StagedUpload::stage_in(dir.path(), "cat.jpg", &b"0123456789"[..])
            .await
            .unwrap();
        let path = staged.path().to_path_buf();

        let err = dispatch_staged(&store, "imagecontainer", staged, &RetryPolicy::none())
            .await
            .unwrap_err();

        assert!(matches!(err, GalleryError::UploadFailure { .. }));
        assert_eq!(err.code(), "InternalError");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn upload_overwrites_existing_blob() {
        let store = InMemoryBlobStore::new().with_container("imagecontainer", Default::default());

        for content in [&b"first"[..], &b"second"[..]] {
            upload_blob(&store, "imagecontainer", "cat.jpg", content, &RetryPolicy::none())
                .await
                .unwrap();
        }

        let blob = store.get_blob("imagecontainer", "cat.jpg").await.unwrap();
        assert_eq!(blob.content, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn empty_file_name_is_rejected() {
        let store = InMemoryBlobStore::new().with_container("imagecontainer", Default::default());

        let err = upload_blob(&store, "imagecontainer", "", &b"x"[..], &RetryPolicy::none())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "InvalidInput");
        assert_eq!(store.call_count(Operation::PutBlob).await, 0);
    }
}
