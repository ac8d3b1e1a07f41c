//! Image analysis through the Computer Vision REST API.
//!
//! The gallery never inspects image bytes itself.  It hands the raw content
//! of a blob to an [`ImageAnalyzer`] and returns whatever JSON comes back.
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::client::http_client;
use crate::error::{Result, StorageError};

pub const DEFAULT_VISION_ENDPOINT: &str = "https://southeastasia.api.cognitive.microsoft.com";
const ANALYZE_PATH: &str = "/vision/v2.0/analyze";
const BASE64_MARKER: &str = ";base64,";

/// Something that can describe an image given its raw bytes
#[async_trait]
pub trait ImageAnalyzer: Send + Sync {
    async fn analyze(&self, image: Bytes) -> Result<Value>;
}

/// Query parameters for the analyze call
#[derive(Clone, Debug)]
pub struct AnalyzeOptions {
    /// Which features to return, e.g. `Categories`, `Description`, `Color`
    pub visual_features: Vec<String>,
    /// Domain-specific details, e.g. `Celebrities`, `Landmarks`
    pub details: Vec<String>,
    pub language: String,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            visual_features: vec![
                "Categories".to_string(),
                "Description".to_string(),
                "Color".to_string(),
            ],
            details: Vec::new(),
            language: "en".to_string(),
        }
    }
}

/// A client for the Computer Vision analyze endpoint
pub struct VisionClient {
    endpoint: String,
    subscription_key: String,
    options: AnalyzeOptions,
}

// Custom implementation of Debug to avoid printing the subscription key
impl std::fmt::Debug for VisionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionClient")
            .field("endpoint", &self.endpoint)
            .field("subscription_key", &"**********")
            .field("options", &self.options)
            .finish()
    }
}

#[derive(Deserialize)]
struct VisionErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

/// The service reports errors either at the top level or nested under `error`
#[derive(Deserialize)]
struct VisionErrorBody {
    code: Option<String>,
    message: Option<String>,
    error: Option<VisionErrorDetail>,
}

impl VisionClient {
    pub fn new(endpoint: &str, subscription_key: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            subscription_key: subscription_key.to_string(),
            options: AnalyzeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: AnalyzeOptions) -> Self {
        self.options = options;
        self
    }

    async fn handle_error(response: Response) -> StorageError {
        let status = response.status();
        let body = match response.json::<VisionErrorBody>().await {
            Ok(body) => body,
            Err(_) => return StorageError::unknown_error(status),
        };
        let (code, message) = match body.error {
            Some(detail) => (detail.code, detail.message),
            None => (body.code, body.message),
        };

        let code = code.unwrap_or_else(|| status.as_u16().to_string());
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return StorageError::Forbidden {
                code,
                message: message.unwrap_or_else(|| "access denied".to_string()),
            };
        }
        StorageError::Service {
            status: status.as_u16(),
            code,
            message: message.unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("Unknown Error")
                    .to_string()
            }),
        }
    }
}

#[async_trait]
impl ImageAnalyzer for VisionClient {
    async fn analyze(&self, image: Bytes) -> Result<Value> {
        if image.is_empty() {
            return Err(StorageError::required("image content"));
        }

        let url = format!("{}{}", self.endpoint, ANALYZE_PATH);
        debug!(bytes = image.len(), "POST {}", url);
        let response = http_client()
            .post(url)
            .query(&[
                ("visualFeatures", self.options.visual_features.join(",")),
                ("details", self.options.details.join(",")),
                ("language", self.options.language.clone()),
            ])
            .header("Ocp-Apim-Subscription-Key", &self.subscription_key)
            .header("content-type", "application/octet-stream")
            .body(image)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            Err(Self::handle_error(response).await)
        } else {
            Ok(response.json::<Value>().await?)
        }
    }
}

/// Renders bytes as a `data:` URL suitable for an inline `<img>`
pub fn encode_data_url(content_type: &str, content: &[u8]) -> String {
    format!(
        "data:{}{}{}",
        content_type,
        BASE64_MARKER,
        BASE64_STANDARD.encode(content)
    )
}

/// Splits a `data:` URL into its content type and decoded bytes.
///
/// Both the base64 form and the percent-encoded plain form are accepted.
pub fn decode_data_url(data_url: &str) -> Result<(String, Bytes)> {
    let rest = data_url
        .strip_prefix("data:")
        .ok_or_else(|| StorageError::InvalidInput("not a data URL".to_string()))?;

    if let Some((content_type, payload)) = rest.split_once(BASE64_MARKER) {
        let content = BASE64_STANDARD
            .decode(payload)
            .map_err(|e| StorageError::InvalidInput(format!("invalid base64 payload: {}", e)))?;
        return Ok((content_type.to_string(), Bytes::from(content)));
    }

    let (content_type, payload) = rest
        .split_once(',')
        .ok_or_else(|| StorageError::InvalidInput("data URL has no payload".to_string()))?;
    let content = percent_decode_str(payload).collect::<Vec<u8>>();
    Ok((content_type.to_string(), Bytes::from(content)))
}
