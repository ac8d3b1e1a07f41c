//! Container provisioning.
//!
//! The service has no list-free existence check for containers, so the
//! provisioner lists containers by name prefix and looks for an exact match.
//! The prefix filter alone is not enough: `img` also matches `imgfoo`.

use tracing::{debug, info};

use crate::client::{BlobStorageApi, CreateContainerOptions, ListContainersOptions, PublicAccess};
use crate::error::{GalleryError, Result, StorageError};
use crate::retry::RetryPolicy;

/// What [`ensure_container_exists`] had to do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The container was created by this call
    Created,
    /// The container was already there; nothing was changed
    AlreadyExists,
}

/// Create options used by the gallery: world-readable container with the
/// sample metadata attached.
pub fn gallery_container_options() -> CreateContainerOptions {
    CreateContainerOptions::default()
        .with_public_access(PublicAccess::Container)
        .with_metadata("key1", "value1")
        .with_metadata("key2", "value2")
}

/// Returns true if a container named exactly `name` exists.
///
/// Follows continuation markers until a match is found or the listing ends.
pub async fn container_exists<A>(api: &A, name: &str, retry: &RetryPolicy) -> Result<bool>
where
    A: BlobStorageApi + ?Sized,
{
    let mut marker = None;
    loop {
        let options = ListContainersOptions {
            prefix: Some(name.to_string()),
            marker: marker.clone(),
            max_results: None,
        };
        let page = retry
            .run("list_containers", || api.list_containers(options.clone()))
            .await?;

        if page.containers.iter().any(|container| container.name == name) {
            return Ok(true);
        }
        match page.next_marker {
            Some(next) => marker = Some(next),
            None => return Ok(false),
        }
    }
}

/// Makes sure a container exists, creating it at most once.
///
/// Calling this repeatedly with the same name is safe: only the first call
/// that finds the container missing creates it.  If another caller creates
/// the container between the listing and the create call, the conflict is
/// reported as [`ProvisionOutcome::AlreadyExists`].
pub async fn ensure_container_exists<A>(
    api: &A,
    name: &str,
    options: &CreateContainerOptions,
    retry: &RetryPolicy,
) -> std::result::Result<ProvisionOutcome, GalleryError>
where
    A: BlobStorageApi + ?Sized,
{
    let failure = |source: StorageError| GalleryError::ProvisioningFailure {
        container: name.to_string(),
        source,
    };

    if container_exists(api, name, retry).await.map_err(failure)? {
        debug!(container = name, "container already exists");
        return Ok(ProvisionOutcome::AlreadyExists);
    }

    let created = retry
        .run("create_container", || api.create_container(name, options.clone()))
        .await;
    match created {
        Ok(()) => {
            info!(container = name, access = ?options.public_access, "provisioned container");
            Ok(ProvisionOutcome::Created)
        }
        Err(StorageError::ContainerAlreadyExists(_)) => {
            debug!(container = name, "container created concurrently");
            Ok(ProvisionOutcome::AlreadyExists)
        }
        Err(err) => Err(failure(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryBlobStore, Operation};

    #[tokio::test]
    async fn creates_missing_container_with_gallery_options() {
        let store = InMemoryBlobStore::new();

        let outcome = ensure_container_exists(
            &store,
            "imagecontainer",
            &gallery_container_options(),
            &RetryPolicy::none(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, ProvisionOutcome::Created);
        let options = store.container_options("imagecontainer").await.unwrap();
        assert_eq!(options.public_access, PublicAccess::Container);
        assert_eq!(options.metadata.get("key1").map(String::as_str), Some("value1"));
        assert_eq!(options.metadata.get("key2").map(String::as_str), Some("value2"));
    }

    #[tokio::test]
    async fn similarly_prefixed_container_is_not_a_match() {
        let store = InMemoryBlobStore::new().with_container("imgfoo", Default::default());

        let outcome =
            ensure_container_exists(&store, "img", &Default::default(), &RetryPolicy::none())
                .await
                .unwrap();

        assert_eq!(outcome, ProvisionOutcome::Created);
        assert_eq!(store.call_count(Operation::CreateContainer).await, 1);
    }

    #[tokio::test]
    async fn exact_match_found_on_a_later_page() {
        let mut store = InMemoryBlobStore::new().with_page_size(2);
        for name in ["imga", "imgaa", "imgab", "imgac"] {
            store = store.with_container(name, Default::default());
        }

        let found = container_exists(&store, "imgac", &RetryPolicy::none())
            .await
            .unwrap();
        assert!(found);

        let outcome =
            ensure_container_exists(&store, "img", &Default::default(), &RetryPolicy::none())
                .await
                .unwrap();
        assert_eq!(outcome, ProvisionOutcome::Created);
        // "img" matched every container by prefix, so all pages were read
        assert_eq!(store.call_count(Operation::ListContainers).await, 1 + 2);
    }

    #[tokio::test]
    async fn concurrent_creation_counts_as_existing() {
        let store = InMemoryBlobStore::new();
        store
            .fail_next(
                Operation::CreateContainer,
                StorageError::ContainerAlreadyExists("imagecontainer".to_string()),
            )
            .await;

        let outcome = ensure_container_exists(
            &store,
            "imagecontainer",
            &Default::default(),
            &RetryPolicy::none(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, ProvisionOutcome::AlreadyExists);
    }

    #[tokio::test]
    async fn listing_errors_abort_provisioning() {
        let store = InMemoryBlobStore::new();
        store
            .fail_next(
                Operation::ListContainers,
                StorageError::forbidden("Server failed to authenticate the request."),
            )
            .await;

        let err = ensure_container_exists(
            &store,
            "imagecontainer",
            &Default::default(),
            &RetryPolicy::none(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, GalleryError::ProvisioningFailure { .. }));
        assert_eq!(err.code(), "AuthenticationFailed");
        assert_eq!(store.call_count(Operation::CreateContainer).await, 0);
    }
}
