//! The gallery workflow: provision the container, dispatch an optional
//! upload, then list what is stored.
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use serde_json::Value;
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::client::{BlobContent, BlobStorageApi, BlobSummary, CreateContainerOptions};
use crate::error::GalleryError;
use crate::listing;
use crate::provision::{ensure_container_exists, gallery_container_options, ProvisionOutcome};
use crate::retry::RetryPolicy;
use crate::upload;
use crate::vision::{encode_data_url, ImageAnalyzer};

/// A file to store in the gallery.  The reader is consumed once.
pub struct UploadRequest {
    file_name: String,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

impl UploadRequest {
    pub fn new<R>(file_name: &str, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            file_name: file_name.to_string(),
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(file_name: &str, content: impl Into<Bytes>) -> Self {
        Self::new(file_name, std::io::Cursor::new(content.into()))
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

/// Everything a gallery page shows after one pass of the workflow
#[derive(Clone, Debug, PartialEq)]
pub struct GalleryFeed {
    pub provisioned: ProvisionOutcome,
    /// The blob stored by this pass, if an upload was requested
    pub uploaded: Option<BlobSummary>,
    /// Every blob in the container, in listing order
    pub blobs: Vec<BlobSummary>,
}

/// An image gallery kept in one storage container.
///
/// The storage client is shared and only read from, so a `Gallery` can be
/// cloned cheaply and used from several tasks.
pub struct Gallery<A: BlobStorageApi + ?Sized> {
    api: Arc<A>,
    container: String,
    options: CreateContainerOptions,
    retry: RetryPolicy,
    page_size: Option<u32>,
}

impl<A: BlobStorageApi + ?Sized> Clone for Gallery<A> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            container: self.container.clone(),
            options: self.options.clone(),
            retry: self.retry.clone(),
            page_size: self.page_size,
        }
    }
}

impl<A: BlobStorageApi + ?Sized> Gallery<A> {
    /// Creates a gallery over `container` using the default gallery container
    /// options and retry policy
    pub fn new(api: Arc<A>, container: &str) -> Self {
        Self {
            api,
            container: container.to_string(),
            options: gallery_container_options(),
            retry: RetryPolicy::default(),
            page_size: None,
        }
    }

    /// Options used if the container has to be created
    pub fn with_container_options(mut self, options: CreateContainerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Caps the number of summaries requested per listing page
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub async fn provision(&self) -> Result<ProvisionOutcome, GalleryError> {
        ensure_container_exists(self.api.as_ref(), &self.container, &self.options, &self.retry)
            .await
    }

    /// Stores an upload.  The container must already exist.
    pub async fn upload(&self, request: UploadRequest) -> Result<BlobSummary, GalleryError> {
        upload::upload_blob(
            self.api.as_ref(),
            &self.container,
            &request.file_name,
            request.reader,
            &self.retry,
        )
        .await
    }

    /// Lazily enumerates the stored blobs
    pub fn summaries(&self) -> impl Stream<Item = Result<BlobSummary, GalleryError>> + '_ {
        listing::blob_summaries(self.api.as_ref(), &self.container, self.page_size, &self.retry)
    }

    pub async fn list(&self) -> Result<Vec<BlobSummary>, GalleryError> {
        listing::list_blobs(self.api.as_ref(), &self.container, &self.retry).await
    }

    pub async fn fetch(&self, key: &str) -> Result<BlobContent, GalleryError> {
        listing::fetch_blob(self.api.as_ref(), &self.container, key, &self.retry).await
    }

    /// Runs one pass of the workflow.
    ///
    /// The steps run strictly in order and the first failure ends the pass:
    /// nothing is uploaded unless provisioning succeeded, and nothing is listed
    /// after a failed upload.
    pub async fn render_feed(
        &self,
        upload: Option<UploadRequest>,
    ) -> Result<GalleryFeed, GalleryError> {
        let provisioned = self.provision().await?;

        let uploaded = match upload {
            Some(request) => Some(self.upload(request).await?),
            None => None,
        };

        let blobs = self.list().await?;
        info!(
            container = %self.container,
            ?provisioned,
            uploaded = uploaded.as_ref().map(|blob| blob.name.as_str()),
            blobs = blobs.len(),
            "rendered gallery feed"
        );

        Ok(GalleryFeed {
            provisioned,
            uploaded,
            blobs,
        })
    }

    /// Downloads a blob and renders it as an inline `data:` URL
    pub async fn thumbnail_data_url(&self, key: &str) -> Result<String, GalleryError> {
        let blob = self.fetch(key).await?;
        debug!(blob = key, bytes = blob.content.len(), "rendering thumbnail");
        Ok(encode_data_url(&blob.content_type, &blob.content))
    }

    /// Downloads a blob and hands its bytes to `analyzer`
    pub async fn analyze(
        &self,
        key: &str,
        analyzer: &dyn ImageAnalyzer,
    ) -> Result<Value, GalleryError> {
        let content = listing::fetch_content(self.api.as_ref(), &self.container, key, &self.retry)
            .await?;
        analyzer
            .analyze(content)
            .await
            .map_err(|source| GalleryError::AnalysisFailure {
                blob: key.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::client::PublicAccess;
    use crate::error::{Result, StorageError};
    use crate::memory::{InMemoryBlobStore, Operation};
    use crate::vision::decode_data_url;

    fn gallery(store: InMemoryBlobStore) -> Gallery<InMemoryBlobStore> {
        Gallery::new(Arc::new(store), "imagecontainer").with_retry(RetryPolicy::none())
    }

    #[derive(Default)]
    struct RecordingAnalyzer {
        seen: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl ImageAnalyzer for RecordingAnalyzer {
        async fn analyze(&self, image: Bytes) -> Result<Value> {
            self.seen.lock().await.push(image);
            Ok(serde_json::json!({ "description": { "tags": ["cat"] } }))
        }
    }

    struct FailingAnalyzer;

    #[async_trait]
    impl ImageAnalyzer for FailingAnalyzer {
        async fn analyze(&self, _image: Bytes) -> Result<Value> {
            Err(StorageError::forbidden("invalid subscription key"))
        }
    }

    #[tokio::test]
    async fn feed_without_upload_provisions_and_lists() {
        let gallery = gallery(InMemoryBlobStore::new());

        let feed = gallery.render_feed(None).await.unwrap();

        assert_eq!(feed.provisioned, ProvisionOutcome::Created);
        assert!(feed.uploaded.is_none());
        assert!(feed.blobs.is_empty());
        let options = gallery.api().container_options("imagecontainer").await.unwrap();
        assert_eq!(options.public_access, PublicAccess::Container);
    }

    #[tokio::test]
    async fn feed_includes_the_new_upload() {
        let gallery = gallery(InMemoryBlobStore::new());

        let feed = gallery
            .render_feed(Some(UploadRequest::from_bytes("cat.jpg", &b"0123456789"[..])))
            .await
            .unwrap();

        let uploaded = feed.uploaded.unwrap();
        assert_eq!(uploaded.name, "cat.jpg");
        assert_eq!(feed.blobs, vec![uploaded]);

        let again = gallery.render_feed(None).await.unwrap();
        assert_eq!(again.provisioned, ProvisionOutcome::AlreadyExists);
        assert_eq!(gallery.api().call_count(Operation::CreateContainer).await, 1);
    }

    #[tokio::test]
    async fn failed_upload_skips_listing() {
        let store = InMemoryBlobStore::new();
        store
            .fail_next(
                Operation::PutBlob,
                StorageError::forbidden("read only"),
            )
            .await;
        let gallery = gallery(store);

        let err = gallery
            .render_feed(Some(UploadRequest::from_bytes("cat.jpg", &b"x"[..])))
            .await
            .unwrap_err();

        assert!(matches!(err, GalleryError::UploadFailure { .. }));
        assert_eq!(gallery.api().call_count(Operation::ListBlobs).await, 0);
    }

    #[tokio::test]
    async fn failed_provisioning_skips_upload() {
        let store = InMemoryBlobStore::new();
        store
            .fail_next(
                Operation::ListContainers,
                StorageError::forbidden("bad key"),
            )
            .await;
        let gallery = gallery(store);

        let err = gallery
            .render_feed(Some(UploadRequest::from_bytes("cat.jpg", &b"x"[..])))
            .await
            .unwrap_err();

        assert!(matches!(err, GalleryError::ProvisioningFailure { .. }));
        assert_eq!(gallery.api().call_count(Operation::PutBlob).await, 0);
    }

    #[tokio::test]
    async fn thumbnails_are_data_urls() {
        let gallery = gallery(InMemoryBlobStore::new());
        gallery
            .render_feed(Some(UploadRequest::from_bytes("cat.png", &b"\x89PNG"[..])))
            .await
            .unwrap();

        let url = gallery.thumbnail_data_url("cat.png").await.unwrap();
        let (content_type, content) = decode_data_url(&url).unwrap();

        assert_eq!(content_type, "image/png");
        assert_eq!(content, Bytes::from_static(b"\x89PNG"));
    }

    #[tokio::test]
    async fn analysis_sees_the_stored_bytes() {
        let gallery = gallery(InMemoryBlobStore::new());
        gallery
            .render_feed(Some(UploadRequest::from_bytes("cat.jpg", &b"0123456789"[..])))
            .await
            .unwrap();
        let analyzer = RecordingAnalyzer::default();

        let analysis = gallery.analyze("cat.jpg", &analyzer).await.unwrap();

        assert_eq!(analysis["description"]["tags"][0], "cat");
        assert_eq!(
            *analyzer.seen.lock().await,
            vec![Bytes::from_static(b"0123456789")]
        );
    }

    #[tokio::test]
    async fn analyzer_errors_are_analysis_failures() {
        let gallery = gallery(InMemoryBlobStore::new());
        gallery
            .render_feed(Some(UploadRequest::from_bytes("cat.jpg", &b"0123456789"[..])))
            .await
            .unwrap();

        let err = gallery.analyze("cat.jpg", &FailingAnalyzer).await.unwrap_err();
        assert!(matches!(err, GalleryError::AnalysisFailure { .. }));
        assert_eq!(err.code(), "AuthenticationFailed");

        let err = gallery
            .analyze("dog.jpg", &RecordingAnalyzer::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GalleryError::FetchFailure { .. }));
    }

    #[tokio::test]
    async fn custom_container_options_are_used() {
        let gallery = gallery(InMemoryBlobStore::new())
            .with_container_options(CreateContainerOptions::default().with_metadata("owner", "me"));

        gallery.provision().await.unwrap();

        let options = gallery.api().container_options("imagecontainer").await.unwrap();
        assert_eq!(options.public_access, PublicAccess::Private);
        assert_eq!(options.metadata.get("owner").map(String::as_str), Some("me"));
    }
}
