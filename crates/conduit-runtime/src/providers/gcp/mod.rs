//! Google Cloud Pub/Sub and Cloud Storage adapters.
//!
//! Both adapters call the JSON REST APIs with reqwest. Requests carry an
//! OAuth access token obtained from a service-account key or the metadata
//! server; emulator hosts skip authentication entirely.
//!
//! ## Queue Semantics
//!
//! Pub/Sub is a pull queue with ack deadlines. Each logical queue maps to a
//! topic and a subscription of the same name, both assumed to exist. There
//! is no native delay: `scheduledTime` is recorded as an attribute and
//! honored by this consumer when the message is pulled.

use crate::error::{QueueError, StorageError};
use crate::provider::GcpConfig;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

pub mod auth;
pub mod gcs;
pub mod pubsub;

pub use auth::{ServiceAccountKey, TokenProvider};
pub use gcs::GcsStorage;
pub use pubsub::PubSubQueue;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

#[cfg(test)]
pub(crate) mod test_support;

/// GCP adapter errors
#[derive(Debug, Error)]
pub enum GcpError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("GCP API error {status} (HTTP {code}): {message}")]
    ApiError {
        code: u16,
        status: String,
        message: String,
    },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid ack id: {0}")]
    InvalidAckId(String),

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),
}

impl GcpError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkError(_) => true,
            Self::ApiError { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }

    /// Map to the portable queue error; `queue_name` names the missing resource
    pub fn to_queue_error(self, queue_name: &str) -> QueueError {
        match self {
            Self::Authentication(message) | Self::PermissionDenied(message) => {
                QueueError::AuthenticationFailed { message }
            }
            Self::NetworkError(message) => QueueError::BackendUnavailable {
                backend: "gcp".to_string(),
                message,
            },
            Self::ApiError {
                code,
                status,
                message,
            } if code >= 500 => QueueError::BackendUnavailable {
                backend: "gcp".to_string(),
                message: format!("{}: {}", status, message),
            },
            Self::ApiError {
                status, message, ..
            } => QueueError::ProviderError {
                provider: "gcp".to_string(),
                code: status,
                message,
            },
            Self::NotFound(_) => QueueError::QueueNotFound {
                queue_name: queue_name.to_string(),
            },
            Self::InvalidAckId(ack_id) => {
                QueueError::message_state(&ack_id, "ack id is invalid or expired")
            }
            Self::MessageTooLarge { size, max_size } => {
                QueueError::MessageTooLarge { size, max_size }
            }
            other => QueueError::ProviderError {
                provider: "gcp".to_string(),
                code: "Client".to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Map to the portable storage error
    pub fn to_storage_error(self, bucket: &str, key: &str) -> StorageError {
        match self {
            Self::Authentication(message) => StorageError::AuthenticationFailed { message },
            Self::PermissionDenied(operation) => StorageError::PermissionDenied { operation },
            Self::NetworkError(message) => StorageError::BackendUnavailable {
                backend: "gcp".to_string(),
                message,
            },
            Self::ApiError {
                code,
                status,
                message,
            } if code >= 500 => StorageError::BackendUnavailable {
                backend: "gcp".to_string(),
                message: format!("{}: {}", status, message),
            },
            Self::ApiError {
                status, message, ..
            } => StorageError::ProviderError {
                provider: "gcp".to_string(),
                code: status,
                message,
            },
            Self::NotFound(_) => StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            Self::SigningFailed(message) => StorageError::SigningFailed { message },
            other => StorageError::ProviderError {
                provider: "gcp".to_string(),
                code: "Client".to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for GcpError {
    fn from(err: reqwest::Error) -> Self {
        Self::NetworkError(err.to_string())
    }
}

/// Google API error envelope: `{"error": {"code", "message", "status"}}`
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

/// Map a failed response to a [`GcpError`]
pub(crate) fn parse_error_response(code: u16, body: &str) -> GcpError {
    let (status, message) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (envelope.error.status, envelope.error.message),
        Err(_) => (String::new(), body.chars().take(200).collect()),
    };

    match code {
        401 => GcpError::Authentication(message),
        403 => GcpError::PermissionDenied(message),
        404 => GcpError::NotFound(message),
        _ => GcpError::ApiError {
            code,
            status: if status.is_empty() {
                format!("HTTP{}", code)
            } else {
                status
            },
            message,
        },
    }
}

/// Send a request and return the body, mapping failures
pub(crate) async fn send_request(request: reqwest::RequestBuilder) -> Result<bytes::Bytes, GcpError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(parse_error_response(
            status.as_u16(),
            &String::from_utf8_lossy(&body),
        ));
    }
    Ok(body)
}

/// Normalize a `host[:port]` or URL setting to a base URL
pub(crate) fn host_base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

/// Build the Pub/Sub queue and Cloud Storage adapters
///
/// Resolves credentials and the project id first; fails when no project can
/// be determined.
pub async fn create(config: &GcpConfig) -> Result<(PubSubQueue, GcsStorage), GcpError> {
    let http = reqwest::Client::builder()
        .build()
        .map_err(|e| GcpError::ConfigurationError(format!("HTTP client: {}", e)))?;

    let key = match config.credentials_path {
        Some(ref path) => Some(ServiceAccountKey::from_file(path).await?),
        None => None,
    };
    let tokens = Arc::new(TokenProvider::new(
        http.clone(),
        key,
        &config.metadata_host,
    ));
    let project_id = tokens.resolve_project_id(config.project_id.as_deref()).await?;

    tracing::info!(
        project_id = %project_id,
        credentials = tokens.source_name(),
        pubsub_emulator = ?config.pubsub_emulator_host,
        storage_emulator = ?config.storage_emulator_host,
        "Creating GCP adapters"
    );

    let queue = PubSubQueue::new(config, http.clone(), Arc::clone(&tokens), &project_id);
    let storage = GcsStorage::new(config, http, tokens);
    Ok((queue, storage))
}
