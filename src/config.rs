//! Runtime configuration, read from the environment.
use std::env;
use std::sync::Arc;

use crate::auth::{StorageCredential, ACCOUNT_KEY_VAR, ACCOUNT_NAME_VAR, SAS_TOKEN_VAR};
use crate::client::AzureBlobClient;
use crate::error::{Result, StorageError};
use crate::vision::{VisionClient, DEFAULT_VISION_ENDPOINT};

pub const SUBSCRIPTION_KEY_VAR: &str = "SUBS_KEY";
pub const BLOB_ENDPOINT_VAR: &str = "AZURE_BLOB_API_URL";
pub const CONTAINER_VAR: &str = "GALLERY_CONTAINER";
pub const VISION_ENDPOINT_VAR: &str = "VISION_API_URL";

pub const DEFAULT_CONTAINER: &str = "imagecontainer";

/// Everything the gallery needs to reach its storage account and the vision
/// service.
#[derive(Clone)]
pub struct GalleryConfig {
    pub account_name: String,
    account_key: Option<String>,
    sas_token: Option<String>,
    subscription_key: Option<String>,
    /// Container holding the gallery images
    pub container: String,
    /// Overrides `https://{account}.blob.core.windows.net`
    pub blob_endpoint: Option<String>,
    pub vision_endpoint: String,
}

// Custom implementation of Debug to avoid printing secrets
impl std::fmt::Debug for GalleryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |secret: &Option<String>| secret.as_ref().map(|_| "**********");
        f.debug_struct("GalleryConfig")
            .field("account_name", &self.account_name)
            .field("account_key", &redact(&self.account_key))
            .field("sas_token", &redact(&self.sas_token))
            .field("subscription_key", &redact(&self.subscription_key))
            .field("container", &self.container)
            .field("blob_endpoint", &self.blob_endpoint)
            .field("vision_endpoint", &self.vision_endpoint)
            .finish()
    }
}

impl GalleryConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.  Empty
    /// values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let account_name = var(ACCOUNT_NAME_VAR).ok_or_else(|| StorageError::required(ACCOUNT_NAME_VAR))?;
        let account_key = var(ACCOUNT_KEY_VAR);
        let sas_token = var(SAS_TOKEN_VAR);
        if account_key.is_none() && sas_token.is_none() {
            return Err(StorageError::NotAuthenticated());
        }

        Ok(Self {
            account_name,
            account_key,
            sas_token,
            subscription_key: var(SUBSCRIPTION_KEY_VAR),
            container: var(CONTAINER_VAR).unwrap_or_else(|| DEFAULT_CONTAINER.to_string()),
            blob_endpoint: var(BLOB_ENDPOINT_VAR),
            vision_endpoint: var(VISION_ENDPOINT_VAR)
                .unwrap_or_else(|| DEFAULT_VISION_ENDPOINT.to_string()),
        })
    }

    /// The storage credential; an account key wins over a SAS token
    pub fn credential(&self) -> Result<StorageCredential> {
        match (&self.account_key, &self.sas_token) {
            (Some(key), _) => StorageCredential::shared_key(&self.account_name, key),
            (None, Some(token)) => Ok(StorageCredential::sas_token(token)),
            (None, None) => Err(StorageError::NotAuthenticated()),
        }
    }

    pub fn blob_client(&self) -> Result<AzureBlobClient> {
        let client =
            AzureBlobClient::with_credentials(&self.account_name, Arc::new(self.credential()?));
        Ok(match &self.blob_endpoint {
            Some(endpoint) => client.with_base_url(endpoint),
            None => client,
        })
    }

    /// Fails unless `SUBS_KEY` is set
    pub fn vision_client(&self) -> Result<VisionClient> {
        let key = self
            .subscription_key
            .as_deref()
            .ok_or_else(|| StorageError::required(SUBSCRIPTION_KEY_VAR))?;
        Ok(VisionClient::new(&self.vision_endpoint, key))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serial_test::serial;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config =
            GalleryConfig::from_lookup(lookup(&[("ACCOUNT_NAME", "gallery"), ("ACCOUNT_KEY", "a2V5")]))
                .unwrap();

        assert_eq!(config.container, "imagecontainer");
        assert_eq!(config.vision_endpoint, DEFAULT_VISION_ENDPOINT);
        assert!(config.blob_endpoint.is_none());
        assert!(matches!(
            config.credential().unwrap(),
            StorageCredential::SharedKey { .. }
        ));
    }

    #[test]
    fn account_name_is_required() {
        let err = GalleryConfig::from_lookup(lookup(&[("ACCOUNT_KEY", "a2V5")])).unwrap_err();
        assert_eq!(err.code(), "InvalidInput");
    }

    #[test]
    fn some_credential_is_required() {
        let err = GalleryConfig::from_lookup(lookup(&[("ACCOUNT_NAME", "gallery"), ("ACCOUNT_KEY", " ")]))
            .unwrap_err();
        assert!(matches!(err, StorageError::NotAuthenticated()));
    }

    #[test]
    fn sas_token_is_used_without_a_key() {
        let config = GalleryConfig::from_lookup(lookup(&[
            ("ACCOUNT_NAME", "gallery"),
            ("AZURE_STORAGE_SAS_TOKEN", "?sv=2023-11-03&sig=abc"),
            ("GALLERY_CONTAINER", "photos"),
        ]))
        .unwrap();

        assert_eq!(config.container, "photos");
        match config.credential().unwrap() {
            StorageCredential::SasToken(token) => assert_eq!(token, "sv=2023-11-03&sig=abc"),
            other => panic!("Expected a SAS token, got {:?}", other),
        }
    }

    #[test]
    fn vision_client_needs_a_subscription_key() {
        let config =
            GalleryConfig::from_lookup(lookup(&[("ACCOUNT_NAME", "gallery"), ("ACCOUNT_KEY", "a2V5")]))
                .unwrap();
        assert!(config.vision_client().is_err());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let config = GalleryConfig::from_lookup(lookup(&[
            ("ACCOUNT_NAME", "gallery"),
            ("ACCOUNT_KEY", "c2VjcmV0"),
            ("SUBS_KEY", "subscription-secret"),
        ]))
        .unwrap();

        let printed = format!("{:?}", config);
        assert!(printed.contains("gallery"));
        assert!(!printed.contains("c2VjcmV0"));
        assert!(!printed.contains("subscription-secret"));
    }

    #[test]
    #[serial]
    fn reads_process_environment() {
        env::set_var("ACCOUNT_NAME", "envgallery");
        env::set_var("ACCOUNT_KEY", "a2V5");
        env::set_var("VISION_API_URL", "http://localhost:9999");

        let config = GalleryConfig::from_env();

        env::remove_var("ACCOUNT_NAME");
        env::remove_var("ACCOUNT_KEY");
        env::remove_var("VISION_API_URL");

        let config = config.unwrap();
        assert_eq!(config.account_name, "envgallery");
        assert_eq!(config.vision_endpoint, "http://localhost:9999");
    }
}
