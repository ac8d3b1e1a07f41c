//! In-memory storage backend.
//!
//! Behaves like the real service for the operations the gallery uses
//! (prefix listing, marker paging, overwrite on put, missing-container errors)
//! and records how often each operation was called.  Faults can be queued
//! per operation to exercise error paths.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::client::{
    validate_blob_name, validate_container_name, BlobBody, BlobContent, BlobStorageApi, BlobSummary,
    ContainerItem, CreateContainerOptions, ListBlobsOptions, ListBlobsResult,
    ListContainersOptions, ListContainersResult, PutBlobOptions,
};
use crate::error::{Result, StorageError};

/// Matches the service's default page size.
const DEFAULT_PAGE_SIZE: usize = 5000;

/// Storage operations, used to count calls and target injected faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    ListContainers,
    CreateContainer,
    PutBlob,
    ListBlobs,
    GetBlob,
}

#[derive(Debug)]
struct StoredBlob {
    content: Bytes,
    content_type: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct StoredContainer {
    options: CreateContainerOptions,
    last_modified: DateTime<Utc>,
    blobs: BTreeMap<String, StoredBlob>,
}

#[derive(Default)]
struct InMemoryState {
    containers: BTreeMap<String, StoredContainer>,
    calls: HashMap<Operation, usize>,
    faults: HashMap<Operation, VecDeque<StorageError>>,
}

impl InMemoryState {
    /// Counts the call and returns the next injected fault, if any.
    fn begin(&mut self, operation: Operation) -> Result<()> {
        *self.calls.entry(operation).or_default() += 1;
        match self
            .faults
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front())
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Returns the page starting at `marker` and the marker of the next page.
fn page<'a, T>(
    items: impl Iterator<Item = (&'a String, T)>,
    marker: Option<&str>,
    max_results: Option<u32>,
    page_size: usize,
) -> (Vec<(&'a String, T)>, Option<String>) {
    let limit = max_results
        .map(|m| m as usize)
        .unwrap_or(page_size)
        .min(page_size)
        .max(1);
    let mut remaining = items.skip_while(|(name, _)| marker.is_some_and(|m| name.as_str() < m));
    let page = remaining.by_ref().take(limit).collect::<Vec<_>>();
    let next_marker = remaining.next().map(|(name, _)| name.clone());
    (page, next_marker)
}

/// A [`BlobStorageApi`] kept entirely in process memory
pub struct InMemoryBlobStore {
    state: Mutex<InMemoryState>,
    base_url: String,
    page_size: usize,
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemoryState::default()),
            base_url: "memory://blobs".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Caps every listing page at `page_size` entries
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Seeds an existing container without counting a create call
    pub fn with_container(mut self, name: &str, options: CreateContainerOptions) -> Self {
        self.state.get_mut().containers.insert(
            name.to_string(),
            StoredContainer {
                options,
                last_modified: Utc::now(),
                blobs: BTreeMap::new(),
            },
        );
        self
    }

    /// Number of times `operation` has been called, including failed calls
    pub async fn call_count(&self, operation: Operation) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Makes the next call to `operation` fail with `err`
    pub async fn fail_next(&self, operation: Operation, err: StorageError) {
        self.state
            .lock()
            .await
            .faults
            .entry(operation)
            .or_default()
            .push_back(err);
    }

    pub async fn container_names(&self) -> Vec<String> {
        self.state.lock().await.containers.keys().cloned().collect()
    }

    /// The options a container was created with
    pub async fn container_options(&self, name: &str) -> Option<CreateContainerOptions> {
        self.state
            .lock()
            .await
            .containers
            .get(name)
            .map(|c| c.options.clone())
    }
}

#[async_trait]
impl BlobStorageApi for InMemoryBlobStore {
    fn blob_url(&self, container: &str, name: &str) -> String {
        format!("{}/{}/{}", self.base_url, container, name)
    }

    async fn list_containers(&self, options: ListContainersOptions) -> Result<ListContainersResult> {
        let mut state = self.state.lock().await;
        state.begin(Operation::ListContainers)?;

        let prefix = options.prefix.unwrap_or_default();
        let matching = state
            .containers
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix));
        let (page, next_marker) = page(
            matching,
            options.marker.as_deref(),
            options.max_results,
            self.page_size,
        );

        Ok(ListContainersResult {
            containers: page
                .into_iter()
                .map(|(name, container)| ContainerItem {
                    name: name.clone(),
                    public_access: container.options.public_access,
                    last_modified: Some(container.last_modified),
                })
                .collect(),
            next_marker,
        })
    }

    async fn create_container(&self, name: &str, options: CreateContainerOptions) -> Result<()> {
        let mut state = self.state.lock().await;
        state.begin(Operation::CreateContainer)?;
        validate_container_name(name)?;

        if state.containers.contains_key(name) {
            return Err(StorageError::ContainerAlreadyExists(name.to_string()));
        }
        state.containers.insert(
            name.to_string(),
            StoredContainer {
                options,
                last_modified: Utc::now(),
                blobs: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn put_blob(
        &self,
        container: &str,
        name: &str,
        body: BlobBody,
        options: PutBlobOptions,
    ) -> Result<BlobSummary> {
        let body = body.into_bytes().await?;
        let mut state = self.state.lock().await;
        state.begin(Operation::PutBlob)?;
        validate_container_name(container)?;
        validate_blob_name(name)?;

        let stored = state
            .containers
            .get_mut(container)
            .ok_or_else(|| StorageError::ContainerNotFound(container.to_string()))?;
        let content_type = options
            .content_type
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let last_modified = Utc::now();
        let size = body.len() as u64;
        stored.blobs.insert(
            name.to_string(),
            StoredBlob {
                content: body,
                content_type: content_type.clone(),
                last_modified,
            },
        );

        Ok(BlobSummary {
            name: name.to_string(),
            url: self.blob_url(container, name),
            content_type,
            size,
            last_modified: Some(last_modified),
        })
    }

    async fn list_blobs(&self, container: &str, options: ListBlobsOptions) -> Result<ListBlobsResult> {
        let mut state = self.state.lock().await;
        state.begin(Operation::ListBlobs)?;

        let stored = state
            .containers
            .get(container)
            .ok_or_else(|| StorageError::ContainerNotFound(container.to_string()))?;
        let prefix = options.prefix.unwrap_or_default();
        let matching = stored
            .blobs
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix));
        let (page, next_marker) = page(
            matching,
            options.marker.as_deref(),
            options.max_results,
            self.page_size,
        );

        Ok(ListBlobsResult {
            blobs: page
                .into_iter()
                .map(|(name, blob)| BlobSummary {
                    name: name.clone(),
                    url: self.blob_url(container, name),
                    content_type: blob.content_type.clone(),
                    size: blob.content.len() as u64,
                    last_modified: Some(blob.last_modified),
                })
                .collect(),
            next_marker,
        })
    }

    async fn get_blob(&self, container: &str, name: &str) -> Result<BlobContent> {
        let mut state = self.state.lock().await;
        state.begin(Operation::GetBlob)?;

        let stored = state
            .containers
            .get(container)
            .ok_or_else(|| StorageError::ContainerNotFound(container.to_string()))?;
        let blob = stored
            .blobs
            .get(name)
            .ok_or_else(|| StorageError::BlobNotFound(format!("{}/{}", container, name)))?;

        Ok(BlobContent {
            content: blob.content.clone(),
            content_type: blob.content_type.clone(),
        })
    }
}
