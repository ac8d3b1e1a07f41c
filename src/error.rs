//! Error handling utilities for the crate
use thiserror::Error;

use reqwest::Error as ReqwestError;
use reqwest::StatusCode;

/// Errors raised by a storage backend (or the vision API) for a single call
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("No storage credentials. Expected environment variables ACCOUNT_NAME and ACCOUNT_KEY (or AZURE_STORAGE_SAS_TOKEN)")]
    NotAuthenticated(),
    #[error("Access denied: {message}")]
    Forbidden { code: String, message: String },
    #[error("The specified container does not exist: {0}")]
    ContainerNotFound(String),
    #[error("The specified container already exists: {0}")]
    ContainerAlreadyExists(String),
    #[error("The specified blob does not exist: {0}")]
    BlobNotFound(String),
    #[error("Service error ({status}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },
    #[error("Internal HTTP error: {0}")]
    HttpError(#[from] ReqwestError),
    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn unknown_error(status_code: StatusCode) -> Self {
        StorageError::Service {
            status: status_code.as_u16(),
            code: "UnknownError".to_string(),
            message: status_code
                .canonical_reason()
                .unwrap_or("Unknown Error")
                .to_string(),
        }
    }

    pub fn required(field_name: &str) -> Self {
        StorageError::InvalidInput(format!("{} is required", field_name))
    }

    /// An access failure reported as `AuthenticationFailed`
    pub fn forbidden(message: &str) -> Self {
        StorageError::Forbidden {
            code: "AuthenticationFailed".to_string(),
            message: message.to_string(),
        }
    }

    /// The backend error code, e.g. `ContainerNotFound` or `AuthenticationFailed`
    pub fn code(&self) -> &str {
        match self {
            StorageError::NotAuthenticated() => "NotAuthenticated",
            StorageError::Forbidden { code, .. } => code,
            StorageError::ContainerNotFound(_) => "ContainerNotFound",
            StorageError::ContainerAlreadyExists(_) => "ContainerAlreadyExists",
            StorageError::BlobNotFound(_) => "BlobNotFound",
            StorageError::Service { code, .. } => code,
            StorageError::HttpError(_) => "TransportError",
            StorageError::InvalidResponse(_) => "InvalidResponse",
            StorageError::InvalidInput(_) => "InvalidInput",
            StorageError::Io(_) => "IoError",
        }
    }

    /// True for errors worth retrying: timeouts, dropped connections and
    /// throttling or server-side failures.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Service { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            StorageError::HttpError(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }
}

/// Failures of the provision / upload / list sequence.
///
/// Each variant names the step that failed and wraps the backend error, whose
/// code and message are what gets reported to the user.
#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("{}: failed to provision container '{container}': {source}", .source.code())]
    ProvisioningFailure {
        container: String,
        source: StorageError,
    },
    #[error("{}: failed to upload '{blob}' to container '{container}': {source}", .source.code())]
    UploadFailure {
        container: String,
        blob: String,
        source: StorageError,
    },
    #[error("{}: failed to list blobs in container '{container}': {source}", .source.code())]
    ListingFailure {
        container: String,
        source: StorageError,
    },
    #[error("{}: failed to fetch '{blob}' from container '{container}': {source}", .source.code())]
    FetchFailure {
        container: String,
        blob: String,
        source: StorageError,
    },
    #[error("{}: failed to analyze '{blob}': {source}", .source.code())]
    AnalysisFailure { blob: String, source: StorageError },
}

impl GalleryError {
    /// The backend error wrapped by this failure
    pub fn storage_error(&self) -> &StorageError {
        match self {
            GalleryError::ProvisioningFailure { source, .. }
            | GalleryError::UploadFailure { source, .. }
            | GalleryError::ListingFailure { source, .. }
            | GalleryError::FetchFailure { source, .. }
            | GalleryError::AnalysisFailure { source, .. } => source,
        }
    }

    pub fn code(&self) -> &str {
        self.storage_error().code()
    }

    pub fn message(&self) -> String {
        self.storage_error().to_string()
    }
}

pub(crate) type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gallery_error_reports_backend_code_and_message() {
        let err = GalleryError::UploadFailure {
            container: "imagecontainer".to_string(),
            blob: "cat.jpg".to_string(),
            source: StorageError::ContainerNotFound("imagecontainer".to_string()),
        };

        assert_eq!(err.code(), "ContainerNotFound");
        assert_eq!(
            err.message(),
            "The specified container does not exist: imagecontainer"
        );
        assert!(err.to_string().starts_with("ContainerNotFound: failed to upload"));
    }

    #[test]
    fn access_failures_keep_their_code() {
        let err = GalleryError::ProvisioningFailure {
            container: "imagecontainer".to_string(),
            source: StorageError::Forbidden {
                code: "AuthorizationFailure".to_string(),
                message: "This request is not authorized to perform this operation.".to_string(),
            },
        };

        assert_eq!(err.code(), "AuthorizationFailure");
        assert!(err.to_string().starts_with("AuthorizationFailure: failed to provision"));
        assert_eq!(StorageError::forbidden("bad key").code(), "AuthenticationFailed");
    }

    #[test]
    fn only_server_side_and_throttling_errors_are_transient() {
        let busy = StorageError::Service {
            status: 503,
            code: "ServerBusy".to_string(),
            message: "try later".to_string(),
        };
        let throttled = StorageError::Service {
            status: 429,
            code: "TooManyRequests".to_string(),
            message: "slow down".to_string(),
        };
        let bad = StorageError::Service {
            status: 400,
            code: "InvalidHeaderValue".to_string(),
            message: "nope".to_string(),
        };

        assert!(busy.is_transient());
        assert!(throttled.is_transient());
        assert!(!bad.is_transient());
        assert!(!StorageError::BlobNotFound("a".to_string()).is_transient());
    }
}
