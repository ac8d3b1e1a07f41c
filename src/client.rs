//! A Rust definition of the storage API and a client for Azure Blob Storage
use std::{collections::BTreeMap, env, path::Path, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::{
    auth::{get_credential, sign_shared_key, CanonicalRequest, CredentialProvider, StorageCredential},
    error::{Result, StorageError},
};

pub const AZURE_API_VERSION: &str = "2023-11-03";
static GLOBAL_CLIENT: Lazy<Client> = Lazy::new(Client::new);

/// Characters left unescaped in blob paths: unreserved characters and `/`
const BLOB_PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

const MAX_BLOB_NAME_LEN: usize = 1024;

/// Public read access granted on a container
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PublicAccess {
    /// Only the account owner can read
    #[default]
    Private,
    /// Blobs can be read anonymously but the container cannot be enumerated
    Blob,
    /// Blobs can be read and the container enumerated anonymously
    Container,
}

impl PublicAccess {
    fn header_value(&self) -> Option<&'static str> {
        match self {
            PublicAccess::Private => None,
            PublicAccess::Blob => Some("blob"),
            PublicAccess::Container => Some("container"),
        }
    }

    fn from_header_value(value: Option<&str>) -> Self {
        match value {
            Some("container") => PublicAccess::Container,
            Some("blob") => PublicAccess::Blob,
            _ => PublicAccess::Private,
        }
    }
}

/// Options for the create container operation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateContainerOptions {
    /// The public access policy of the new container
    pub public_access: PublicAccess,
    /// User-defined metadata attached to the container
    pub metadata: BTreeMap<String, String>,
}

impl CreateContainerOptions {
    pub fn with_public_access(mut self, public_access: PublicAccess) -> Self {
        self.public_access = public_access;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Options for the list containers operation
///
/// The prefix filter is not an exact match: listing with prefix `img` also
/// returns `imgfoo`.
#[derive(Clone, Debug, Default)]
pub struct ListContainersOptions {
    /// A prefix to filter results
    pub prefix: Option<String>,
    /// A marker (returned from a previous list call) used to page results
    pub marker: Option<String>,
    /// The maximum number of results to return
    pub max_results: Option<u32>,
}

/// Details about a container returned by the list containers operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerItem {
    pub name: String,
    pub public_access: PublicAccess,
    pub last_modified: Option<DateTime<Utc>>,
}

/// The response from the list containers operation
#[derive(Clone, Debug, Default)]
pub struct ListContainersResult {
    pub containers: Vec<ContainerItem>,
    /// Set when more results are available
    pub next_marker: Option<String>,
}

/// Options for the list blobs operation
#[derive(Clone, Debug, Default)]
pub struct ListBlobsOptions {
    /// A prefix to filter results
    pub prefix: Option<String>,
    /// A marker (returned from a previous list call) used to page results
    pub marker: Option<String>,
    /// The maximum number of results to return
    pub max_results: Option<u32>,
}

/// Details about a blob.  Summaries never carry the blob content; use
/// [`BlobStorageApi::get_blob`] to download it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobSummary {
    /// The blob key (the uploaded file name)
    pub name: String,
    /// The URL to download the blob
    pub url: String,
    pub content_type: String,
    /// The size of the blob in bytes
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// The response from the list blobs operation
#[derive(Clone, Debug, Default)]
pub struct ListBlobsResult {
    pub blobs: Vec<BlobSummary>,
    /// Set when more results are available
    pub next_marker: Option<String>,
}

/// Options for the put blob operation
#[derive(Clone, Debug, Default)]
pub struct PutBlobOptions {
    /// The content type of the blob.  Defaults to `application/octet-stream`
    pub content_type: Option<String>,
}

/// The content of a blob upload
#[derive(Debug)]
pub enum BlobBody {
    /// Content already held in memory
    Bytes(Bytes),
    /// An open file, streamed to the service as the request is sent
    File { file: tokio::fs::File, size: u64 },
}

impl BlobBody {
    /// Opens `path` so its content can be streamed
    pub async fn from_path(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(BlobBody::File { file, size })
    }

    /// Size of the content in bytes
    pub fn len(&self) -> u64 {
        match self {
            BlobBody::Bytes(bytes) => bytes.len() as u64,
            BlobBody::File { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the whole body into memory
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self {
            BlobBody::Bytes(bytes) => Ok(bytes),
            BlobBody::File { mut file, size } => {
                let mut content = Vec::with_capacity(size as usize);
                file.read_to_end(&mut content).await?;
                Ok(Bytes::from(content))
            }
        }
    }

    fn into_request_body(self) -> reqwest::Body {
        match self {
            BlobBody::Bytes(bytes) => reqwest::Body::from(bytes),
            BlobBody::File { file, .. } => reqwest::Body::wrap_stream(ReaderStream::new(file)),
        }
    }
}

impl From<Bytes> for BlobBody {
    fn from(bytes: Bytes) -> Self {
        BlobBody::Bytes(bytes)
    }
}

/// The downloaded content of a blob
#[derive(Clone, Debug)]
pub struct BlobContent {
    pub content: Bytes,
    pub content_type: String,
}

/// Functions a storage backend must provide to host the gallery
#[async_trait]
pub trait BlobStorageApi: Send + Sync {
    /// The URL a blob is (or would be) served from
    fn blob_url(&self, container: &str, name: &str) -> String;

    /// Lists containers in the account, optionally filtered by name prefix
    async fn list_containers(&self, options: ListContainersOptions) -> Result<ListContainersResult>;

    /// Creates a container
    ///
    /// Fails with [`StorageError::ContainerAlreadyExists`] if the name is taken.
    async fn create_container(&self, name: &str, options: CreateContainerOptions) -> Result<()>;

    /// Uploads a blob, replacing any existing blob with the same name
    ///
    /// The container must already exist; it is never created implicitly.
    async fn put_blob(
        &self,
        container: &str,
        name: &str,
        body: BlobBody,
        options: PutBlobOptions,
    ) -> Result<BlobSummary>;

    /// Lists blobs in a container in the backend's native order
    async fn list_blobs(&self, container: &str, options: ListBlobsOptions) -> Result<ListBlobsResult>;

    /// Downloads the content of a blob
    async fn get_blob(&self, container: &str, name: &str) -> Result<BlobContent>;
}

/// Checks a container name against the storage naming rules: 3-63 lowercase
/// letters, digits and hyphens, starting and ending with a letter or digit,
/// with no consecutive hyphens.
pub fn validate_container_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StorageError::required("container name"));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_ends = !name.starts_with('-') && !name.ends_with('-');
    if !(3..=63).contains(&name.len()) || !valid_chars || !valid_ends || name.contains("--") {
        return Err(StorageError::InvalidInput(format!(
            "'{}' is not a valid container name",
            name
        )));
    }
    Ok(())
}

pub fn validate_blob_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StorageError::required("blob name"));
    }
    if name.chars().count() > MAX_BLOB_NAME_LEN {
        return Err(StorageError::InvalidInput(format!(
            "blob names are limited to {} characters",
            MAX_BLOB_NAME_LEN
        )));
    }
    Ok(())
}

/// The process-wide HTTP client shared by every API client in the crate
pub(crate) fn http_client() -> &'static Client {
    &GLOBAL_CLIENT
}

pub(crate) fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

fn url_join(left: String, right: String) -> String {
    if left.ends_with('/') {
        if let Some(stripped) = right.strip_prefix('/') {
            left + stripped
        } else {
            left + &right
        }
    } else if right.starts_with('/') {
        left + &right
    } else {
        left + "/" + &right
    }
}

fn container_path(container: &str) -> String {
    format!("/{}", container)
}

fn blob_path(container: &str, name: &str) -> String {
    format!(
        "/{}/{}",
        container,
        utf8_percent_encode(name, BLOB_PATH_ENCODE_SET)
    )
}

#[derive(Deserialize)]
struct AzureErrorBody {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContainerEnumeration {
    #[serde(rename = "Containers", default)]
    containers: Option<ContainerList>,
    #[serde(rename = "NextMarker", default)]
    next_marker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContainerList {
    #[serde(rename = "Container", default)]
    container: Vec<ContainerEntry>,
}

#[derive(Debug, Deserialize)]
struct ContainerEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Properties", default)]
    properties: Option<EntryProperties>,
}

#[derive(Debug, Deserialize)]
struct BlobEnumeration {
    #[serde(rename = "Blobs", default)]
    blobs: Option<BlobList>,
    #[serde(rename = "NextMarker", default)]
    next_marker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlobList {
    #[serde(rename = "Blob", default)]
    blob: Vec<BlobEntry>,
}

#[derive(Debug, Deserialize)]
struct BlobEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Properties", default)]
    properties: Option<EntryProperties>,
}

#[derive(Debug, Default, Deserialize)]
struct EntryProperties {
    #[serde(rename = "Last-Modified", default)]
    last_modified: Option<String>,
    #[serde(rename = "Content-Length", default)]
    content_length: Option<u64>,
    #[serde(rename = "Content-Type", default)]
    content_type: Option<String>,
    #[serde(rename = "PublicAccess", default)]
    public_access: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// A request to the Blob service before authorization is applied
struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    ms_headers: Vec<(String, String)>,
    content_type: Option<String>,
    body: Option<BlobBody>,
}

impl ApiRequest {
    fn new(method: Method, path: String) -> Self {
        Self {
            method,
            path,
            query: Vec::new(),
            ms_headers: Vec::new(),
            content_type: None,
            body: None,
        }
    }

    fn query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    fn maybe_query(self, name: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.query(name, value),
            None => self,
        }
    }

    fn ms_header(mut self, name: &str, value: impl ToString) -> Self {
        self.ms_headers.push((name.to_lowercase(), value.to_string()));
        self
    }

    fn body(mut self, content_type: Option<String>, body: BlobBody) -> Self {
        self.content_type = content_type;
        self.body = Some(body);
        self
    }
}

/// A client for the Azure Blob Storage REST API
///
/// Credentials come from the environment (`ACCOUNT_NAME` / `ACCOUNT_KEY`)
/// unless a credential provider is supplied.  A single client can be shared
/// between requests; it holds no per-request state.
pub struct AzureBlobClient {
    /// A credential provider used to authorize requests
    credential_provider: Option<Arc<dyn CredentialProvider>>,
    /// The service URL to use.  Defaults to the public endpoint of the account
    /// but can point at an emulator or a mock server.
    base_url: String,
    /// The API version sent with every request
    api_version: String,
}

impl AzureBlobClient {
    /// Creates a client that reads credentials from the environment
    pub fn new(account: &str) -> Self {
        Self {
            credential_provider: None,
            base_url: Self::get_base_url(account),
            api_version: Self::get_api_version(),
        }
    }

    /// Creates a client with explicit credentials
    pub fn with_credentials(account: &str, credential_provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            credential_provider: Some(credential_provider),
            base_url: Self::get_base_url(account),
            api_version: Self::get_api_version(),
        }
    }

    /// Overrides the service URL (e.g. an Azurite emulator)
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    fn get_base_url(account: &str) -> String {
        env::var("AZURE_BLOB_API_URL")
            .unwrap_or_else(|_| format!("https://{}.blob.core.windows.net", account))
    }

    fn get_api_version() -> String {
        env::var("AZURE_BLOB_API_VERSION_OVERRIDE").unwrap_or_else(|_| AZURE_API_VERSION.to_string())
    }

    async fn send(&self, operation: &str, request: ApiRequest) -> Result<Response> {
        let mut url = Url::parse(&url_join(self.base_url.clone(), request.path.clone()))
            .map_err(|e| StorageError::InvalidInput(format!("invalid request url: {}", e)))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }

        let mut ms_headers = request.ms_headers;
        ms_headers.push((
            "x-ms-date".to_string(),
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        ));
        ms_headers.push(("x-ms-version".to_string(), self.api_version.clone()));

        let credential =
            get_credential(self.credential_provider.as_deref(), operation, url.path()).await?;
        let mut authorization = None;
        match &credential {
            StorageCredential::SharedKey { account, key } => {
                let query = url.query_pairs().into_owned().collect::<Vec<_>>();
                let canonical = CanonicalRequest {
                    method: request.method.as_str(),
                    content_length: request.body.as_ref().map(|b| b.len() as usize).unwrap_or(0),
                    content_type: request.content_type.as_deref(),
                    ms_headers: &ms_headers,
                    path: url.path(),
                    query: &query,
                };
                authorization = Some(sign_shared_key(account, key, &canonical)?);
            }
            StorageCredential::SasToken(token) => {
                let query = match url.query() {
                    Some(existing) => format!("{}&{}", existing, token),
                    None => token.clone(),
                };
                url.set_query(Some(&query));
            }
        }

        debug!("{} {} ({})", request.method, url.path(), operation);

        let mut builder = GLOBAL_CLIENT.request(request.method, url);
        for (name, value) in &ms_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(authorization) = authorization {
            builder = builder.header("authorization", authorization);
        }
        if let Some(content_type) = request.content_type {
            builder = builder.header("content-type", content_type);
        }
        if let Some(body) = request.body {
            // streamed bodies carry no length of their own
            builder = builder
                .header("content-length", body.len())
                .body(body.into_request_body());
        }

        Ok(builder.send().await?)
    }

    async fn handle_error(response: Response, resource: &str) -> StorageError {
        let status = response.status();
        let header_code = response
            .headers()
            .get("x-ms-error-code")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = response.text().await.unwrap_or_default();
        let parsed = quick_xml::de::from_str::<AzureErrorBody>(&body).ok();

        let code = match parsed.as_ref().map(|e| e.code.clone()).or(header_code) {
            Some(code) => code,
            None => return StorageError::unknown_error(status),
        };
        // Azure appends RequestId and Time lines to the message
        let message = parsed
            .and_then(|e| e.message)
            .and_then(|m| m.lines().next().map(|line| line.trim().to_string()))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown Error").to_string());

        match code.as_str() {
            "ContainerNotFound" => StorageError::ContainerNotFound(resource.to_string()),
            "ContainerAlreadyExists" => StorageError::ContainerAlreadyExists(resource.to_string()),
            "BlobNotFound" => StorageError::BlobNotFound(resource.to_string()),
            "AuthenticationFailed"
            | "AuthorizationFailure"
            | "AuthorizationPermissionMismatch"
            | "InsufficientAccountPermissions" => StorageError::Forbidden { code, message },
            _ => StorageError::Service {
                status: status.as_u16(),
                code,
                message,
            },
        }
    }
}

#[async_trait]
impl BlobStorageApi for AzureBlobClient {
    fn blob_url(&self, container: &str, name: &str) -> String {
        url_join(self.base_url.clone(), blob_path(container, name))
    }

    async fn list_containers(&self, options: ListContainersOptions) -> Result<ListContainersResult> {
        let request = ApiRequest::new(Method::GET, "/".to_string())
            .query("comp", "list")
            .maybe_query("prefix", options.prefix)
            .maybe_query("marker", options.marker)
            .maybe_query("maxresults", options.max_results);
        let rsp = self.send("list_containers", request).await?;

        if rsp.status() != StatusCode::OK {
            return Err(Self::handle_error(rsp, "/").await);
        }
        let body = rsp.text().await?;
        let parsed: ContainerEnumeration = quick_xml::de::from_str(&body)
            .map_err(|e| StorageError::InvalidResponse(format!("container listing: {}", e)))?;

        let containers = parsed
            .containers
            .map(|list| list.container)
            .unwrap_or_default()
            .into_iter()
            .map(|entry| {
                let properties = entry.properties.unwrap_or_default();
                ContainerItem {
                    name: entry.name,
                    public_access: PublicAccess::from_header_value(properties.public_access.as_deref()),
                    last_modified: properties.last_modified.as_deref().and_then(parse_http_date),
                }
            })
            .collect();

        Ok(ListContainersResult {
            containers,
            next_marker: non_empty(parsed.next_marker),
        })
    }

    async fn create_container(&self, name: &str, options: CreateContainerOptions) -> Result<()> {
        validate_container_name(name)?;

        let mut request = ApiRequest::new(Method::PUT, container_path(name))
            .query("restype", "container")
            .body(None, BlobBody::Bytes(Bytes::new()));
        if let Some(access) = options.public_access.header_value() {
            request = request.ms_header("x-ms-blob-public-access", access);
        }
        for (key, value) in &options.metadata {
            request = request.ms_header(&format!("x-ms-meta-{}", key), value);
        }

        let rsp = self.send("create_container", request).await?;
        if rsp.status() != StatusCode::CREATED {
            return Err(Self::handle_error(rsp, name).await);
        }
        info!(container = name, "created container");
        Ok(())
    }

    async fn put_blob(
        &self,
        container: &str,
        name: &str,
        body: BlobBody,
        options: PutBlobOptions,
    ) -> Result<BlobSummary> {
        validate_container_name(container)?;
        validate_blob_name(name)?;

        let content_type = options
            .content_type
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let size = body.len();
        let request = ApiRequest::new(Method::PUT, blob_path(container, name))
            .ms_header("x-ms-blob-type", "BlockBlob")
            .body(Some(content_type.clone()), body);

        let rsp = self.send("put_blob", request).await?;
        if rsp.status() != StatusCode::CREATED {
            return Err(Self::handle_error(rsp, &format!("{}/{}", container, name)).await);
        }
        let last_modified = rsp
            .headers()
            .get("last-modified")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        Ok(BlobSummary {
            name: name.to_string(),
            url: self.blob_url(container, name),
            content_type,
            size,
            last_modified,
        })
    }

    async fn list_blobs(&self, container: &str, options: ListBlobsOptions) -> Result<ListBlobsResult> {
        validate_container_name(container)?;

        let request = ApiRequest::new(Method::GET, container_path(container))
            .query("restype", "container")
            .query("comp", "list")
            .maybe_query("prefix", options.prefix)
            .maybe_query("marker", options.marker)
            .maybe_query("maxresults", options.max_results);
        let rsp = self.send("list_blobs", request).await?;

        if rsp.status() != StatusCode::OK {
            return Err(Self::handle_error(rsp, container).await);
        }
        let body = rsp.text().await?;
        let parsed: BlobEnumeration = quick_xml::de::from_str(&body)
            .map_err(|e| StorageError::InvalidResponse(format!("blob listing: {}", e)))?;

        let blobs = parsed
            .blobs
            .map(|list| list.blob)
            .unwrap_or_default()
            .into_iter()
            .map(|entry| {
                let properties = entry.properties.unwrap_or_default();
                BlobSummary {
                    url: self.blob_url(container, &entry.name),
                    name: entry.name,
                    content_type: non_empty(properties.content_type)
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    size: properties.content_length.unwrap_or(0),
                    last_modified: properties.last_modified.as_deref().and_then(parse_http_date),
                }
            })
            .collect();

        Ok(ListBlobsResult {
            blobs,
            next_marker: non_empty(parsed.next_marker),
        })
    }

    async fn get_blob(&self, container: &str, name: &str) -> Result<BlobContent> {
        validate_container_name(container)?;
        validate_blob_name(name)?;

        let request = ApiRequest::new(Method::GET, blob_path(container, name));
        let rsp = self.send("get_blob", request).await?;

        if rsp.status() != StatusCode::OK {
            return Err(Self::handle_error(rsp, &format!("{}/{}", container, name)).await);
        }
        let content_type = rsp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let content = rsp.bytes().await?;

        Ok(BlobContent {
            content,
            content_type,
        })
    }
}
