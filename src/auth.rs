//! Authentication utilities for working with the storage API
use std::collections::BTreeMap;
use std::env;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Result, StorageError};

pub const ACCOUNT_NAME_VAR: &str = "ACCOUNT_NAME";
pub const ACCOUNT_KEY_VAR: &str = "ACCOUNT_KEY";
pub const SAS_TOKEN_VAR: &str = "AZURE_STORAGE_SAS_TOKEN";

type HmacSha256 = Hmac<Sha256>;

/// Credentials used to authorize requests against a storage account.
#[derive(Clone)]
pub enum StorageCredential {
    /// Shared Key authorization with the (decoded) account key
    SharedKey { account: String, key: Vec<u8> },
    /// A shared access signature, appended to every request URL
    SasToken(String),
}

// Custom implementation of Debug to avoid printing secrets
impl std::fmt::Debug for StorageCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageCredential::SharedKey { account, .. } => f
                .debug_struct("SharedKey")
                .field("account", account)
                .field("key", &"**********")
                .finish(),
            StorageCredential::SasToken(_) => {
                f.debug_tuple("SasToken").field(&"**********").finish()
            }
        }
    }
}

impl StorageCredential {
    /// Builds a Shared Key credential from an account name and its base64 account key
    pub fn shared_key(account: &str, key: &str) -> Result<Self> {
        if account.is_empty() {
            return Err(StorageError::required("account name"));
        }
        let key = BASE64_STANDARD
            .decode(key.trim())
            .map_err(|e| StorageError::InvalidInput(format!("account key is not base64: {}", e)))?;
        Ok(StorageCredential::SharedKey {
            account: account.to_string(),
            key,
        })
    }

    pub fn sas_token(token: &str) -> Self {
        StorageCredential::SasToken(token.trim_start_matches('?').to_string())
    }

    /// Reads `ACCOUNT_NAME` / `ACCOUNT_KEY`, falling back to `AZURE_STORAGE_SAS_TOKEN`
    pub fn from_env() -> Result<Self> {
        if let (Ok(account), Ok(key)) = (env::var(ACCOUNT_NAME_VAR), env::var(ACCOUNT_KEY_VAR)) {
            return Self::shared_key(&account, &key);
        }
        env::var(SAS_TOKEN_VAR)
            .map(|token| Self::sas_token(&token))
            .map_err(|_| StorageError::NotAuthenticated())
    }
}

/// A trait for providing credentials to authenticate with the storage API.
///
/// Most applications can hand a [`StorageCredential`] straight to the client.
/// Implement this trait when credentials have to be fetched or refreshed, for
/// example short-lived SAS tokens minted by another service.  The operation
/// (e.g. `list_containers`, `put_blob`) and the resource path are provided in
/// case fine-grained authorization is required.
#[async_trait]
pub trait CredentialProvider: std::fmt::Debug + Send + Sync {
    async fn get_credential(&self, operation: &str, resource: &str) -> Result<StorageCredential>;
}

#[async_trait]
impl CredentialProvider for StorageCredential {
    async fn get_credential(&self, _operation: &str, _resource: &str) -> Result<StorageCredential> {
        Ok(self.clone())
    }
}

pub(crate) async fn get_credential(
    provider: Option<&dyn CredentialProvider>,
    operation: &str,
    resource: &str,
) -> Result<StorageCredential> {
    if let Some(provider) = provider {
        provider.get_credential(operation, resource).await
    } else {
        StorageCredential::from_env()
    }
}

/// The parts of a request covered by a Shared Key signature.
pub(crate) struct CanonicalRequest<'a> {
    pub method: &'a str,
    pub content_length: usize,
    pub content_type: Option<&'a str>,
    /// `x-ms-*` headers sent with the request
    pub ms_headers: &'a [(String, String)],
    /// The URL path, already percent-encoded
    pub path: &'a str,
    /// Decoded query parameters
    pub query: &'a [(String, String)],
}

impl CanonicalRequest<'_> {
    pub(crate) fn string_to_sign(&self, account: &str) -> String {
        // Content-Length is left empty when zero (API versions 2015-02-21+)
        let content_length = if self.content_length == 0 {
            String::new()
        } else {
            self.content_length.to_string()
        };

        let mut headers = self
            .ms_headers
            .iter()
            .map(|(name, value)| (name.to_lowercase(), value.trim().to_string()))
            .filter(|(name, _)| name.starts_with("x-ms-"))
            .collect::<Vec<_>>();
        headers.sort();
        let canonicalized_headers = headers
            .iter()
            .map(|(name, value)| format!("{}:{}", name, value))
            .collect::<Vec<_>>()
            .join("\n");

        let mut params: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for (name, value) in self.query {
            params
                .entry(name.to_lowercase())
                .or_default()
                .push(value.as_str());
        }
        let mut canonicalized_resource = format!("/{}{}", account, self.path);
        for (name, mut values) in params {
            values.sort();
            canonicalized_resource.push_str(&format!("\n{}:{}", name, values.join(",")));
        }

        format!(
            "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n{}\n{}",
            self.method,
            content_length,
            self.content_type.unwrap_or(""),
            canonicalized_headers,
            canonicalized_resource
        )
    }
}

/// Signs a request with Shared Key authorization, returning the `Authorization` header value
pub(crate) fn sign_shared_key(
    account: &str,
    key: &[u8],
    request: &CanonicalRequest<'_>,
) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StorageError::InvalidInput(format!("invalid account key: {}", e)))?;
    mac.update(request.string_to_sign(account).as_bytes());
    let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());
    Ok(format!("SharedKey {}:{}", account, signature))
}
