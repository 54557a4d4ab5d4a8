//! AWS SQS and S3 adapters.
//!
//! Both adapters speak the HTTP APIs directly with reqwest and sign every
//! request with Signature Version 4. SQS uses the query protocol (form POST,
//! XML responses); S3 uses its REST API.
//!
//! ## Queue Semantics
//!
//! SQS is a visibility-timeout queue: received messages are hidden until they
//! are deleted (ack) or their visibility is changed (nack). Queues whose name
//! ends in `.fifo` receive group and deduplication ids.
//!
//! ## Testing
//!
//! Point `endpoint_url` at LocalStack or a mock server. A custom endpoint
//! switches S3 to path-style addressing.

use crate::error::{QueueError, StorageError};
use crate::provider::AwsConfig;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::sync::Arc;
use thiserror::Error;

pub mod credentials;
pub mod s3;
pub mod signer;
pub mod sqs;

pub use credentials::{AwsCredentials, CredentialProvider};
pub use s3::S3Storage;
pub use signer::SigV4Signer;
pub use sqs::SqsQueue;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

// ============================================================================
// Error Types
// ============================================================================

/// AWS adapter errors
#[derive(Debug, Error)]
pub enum AwsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("AWS service error {code} (HTTP {status}): {message}")]
    ServiceError {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl AwsError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkError(_) => true,
            Self::ServiceError { status, code, .. } => {
                *status >= 500 || *status == 429 || code.contains("Throttl")
            }
            _ => false,
        }
    }

    /// Map to the portable queue error
    pub fn to_queue_error(self) -> QueueError {
        match self {
            Self::Authentication(message) | Self::AccessDenied(message) => {
                QueueError::AuthenticationFailed { message }
            }
            Self::NetworkError(message) => QueueError::BackendUnavailable {
                backend: "aws".to_string(),
                message,
            },
            Self::ServiceError {
                status,
                code,
                message,
            } if status >= 500 => QueueError::BackendUnavailable {
                backend: "aws".to_string(),
                message: format!("{}: {}", code, message),
            },
            Self::ServiceError { code, message, .. } => QueueError::ProviderError {
                provider: "aws".to_string(),
                code,
                message,
            },
            Self::QueueNotFound(queue_name) => QueueError::QueueNotFound { queue_name },
            Self::InvalidReceipt(receipt) => {
                QueueError::message_state(&receipt, "receipt handle is invalid or expired")
            }
            Self::ObjectNotFound { bucket, key } => QueueError::ProviderError {
                provider: "aws".to_string(),
                code: "NoSuchKey".to_string(),
                message: format!("{}/{}", bucket, key),
            },
            Self::MessageTooLarge { size, max_size } => {
                QueueError::MessageTooLarge { size, max_size }
            }
            Self::ConfigurationError(message) => QueueError::ProviderError {
                provider: "aws".to_string(),
                code: "Configuration".to_string(),
                message,
            },
            Self::SerializationError(message) => QueueError::ProviderError {
                provider: "aws".to_string(),
                code: "Serialization".to_string(),
                message,
            },
        }
    }

    /// Map to the portable storage error
    pub fn to_storage_error(self) -> StorageError {
        match self {
            Self::Authentication(message) => StorageError::AuthenticationFailed { message },
            Self::AccessDenied(operation) => StorageError::PermissionDenied { operation },
            Self::NetworkError(message) => StorageError::BackendUnavailable {
                backend: "aws".to_string(),
                message,
            },
            Self::ServiceError {
                status,
                code,
                message,
            } if status >= 500 => StorageError::BackendUnavailable {
                backend: "aws".to_string(),
                message: format!("{}: {}", code, message),
            },
            Self::ObjectNotFound { bucket, key } => StorageError::NotFound { bucket, key },
            Self::ServiceError { code, message, .. } => StorageError::ProviderError {
                provider: "aws".to_string(),
                code,
                message,
            },
            other => StorageError::ProviderError {
                provider: "aws".to_string(),
                code: "Client".to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for AwsError {
    fn from(err: reqwest::Error) -> Self {
        Self::NetworkError(err.to_string())
    }
}

// ============================================================================
// Construction
// ============================================================================

/// Build the SQS queue and S3 storage adapters sharing one HTTP client and
/// credential cache
pub fn create(config: &AwsConfig) -> Result<(SqsQueue, S3Storage), AwsError> {
    let http = reqwest::Client::builder()
        .build()
        .map_err(|e| AwsError::ConfigurationError(format!("HTTP client: {}", e)))?;
    let credentials = Arc::new(CredentialProvider::from_config(config, http.clone()));

    tracing::info!(
        region = %config.region,
        credentials = credentials.source_name(),
        endpoint = ?config.endpoint_url,
        "Creating AWS adapters"
    );

    let queue = SqsQueue::new(config, http.clone(), Arc::clone(&credentials))?;
    let storage = S3Storage::new(config, http, credentials)?;
    Ok((queue, storage))
}

// ============================================================================
// XML Helpers
// ============================================================================

/// Text of the first `<element>` in an XML document
pub(crate) fn xml_text(xml: &str, element: &str) -> Result<Option<String>, AwsError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut inside = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => inside = e.name().as_ref() == element.as_bytes(),
            Ok(Event::Text(e)) if inside => {
                let text = e
                    .unescape()
                    .map_err(|e| AwsError::SerializationError(e.to_string()))?;
                return Ok(Some(text.into_owned()));
            }
            Ok(Event::End(_)) => inside = false,
            Ok(Event::Eof) => return Ok(None),
            Err(e) => return Err(AwsError::SerializationError(format!("XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }
}

/// Map an error response to an [`AwsError`]
///
/// Handles both the SQS `<ErrorResponse><Error>` envelope and the bare S3
/// `<Error>` document. `subject` names the queue or object for not-found
/// errors.
pub(crate) fn parse_error_response(status: u16, body: &str, subject: &str) -> AwsError {
    let code = xml_text(body, "Code").ok().flatten().unwrap_or_default();
    let message = xml_text(body, "Message")
        .ok()
        .flatten()
        .unwrap_or_else(|| body.chars().take(200).collect());

    match code.as_str() {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            AwsError::QueueNotFound(subject.to_string())
        }
        "ReceiptHandleIsInvalid" | "InvalidReceiptHandle" => {
            AwsError::InvalidReceipt(subject.to_string())
        }
        "InvalidClientTokenId"
        | "UnrecognizedClientException"
        | "SignatureDoesNotMatch"
        | "InvalidAccessKeyId"
        | "ExpiredToken" => AwsError::Authentication(format!("{}: {}", code, message)),
        "AccessDenied" | "AccessDeniedException" => {
            AwsError::AccessDenied(format!("{}: {}", subject, message))
        }
        _ if status == 401 => AwsError::Authentication(message),
        _ if status == 403 => AwsError::AccessDenied(format!("{}: {}", subject, message)),
        _ => AwsError::ServiceError {
            status,
            code: if code.is_empty() {
                format!("HTTP{}", status)
            } else {
                code
            },
            message,
        },
    }
}
