//! Error types for queue, storage and provider construction.

use thiserror::Error;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    /// Terminal operation on a receipt handle that is not currently in flight
    #[error("Receipt handle '{receipt}' is not in flight: {reason}")]
    MessageState { receipt: String, reason: String },

    #[error("Backend unavailable ({backend}): {message}")]
    BackendUnavailable { backend: String, message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Queue provider is shutting down")]
    ShuttingDown,

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient and should be retried by the caller
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::MessageState { .. } => false,
            Self::BackendUnavailable { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::MessageTooLarge { .. } => false,
            Self::ProviderError { .. } => true,
            Self::ShuttingDown => false,
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    pub(crate) fn message_state(receipt: &str, reason: impl Into<String>) -> Self {
        Self::MessageState {
            receipt: receipt.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors returned by storage providers
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Key resolves outside the storage root
    #[error("Key '{key}' escapes the storage root")]
    PathTraversal { key: String },

    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Backend unavailable ({backend}): {message}")]
    BackendUnavailable { backend: String, message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Permission denied: {operation}")]
    PermissionDenied { operation: String },

    #[error("URL signing failed: {message}")]
    SigningFailed { message: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),
}

impl StorageError {
    /// Check if error is transient and worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::ProviderError { .. } | Self::Io(_)
        )
    }

    /// Check if error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors during message serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,

    #[error("Base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Response parsing failed: {message}")]
    InvalidResponse { message: String },

    #[error("Message attribute '{key}' has invalid value")]
    InvalidAttribute { key: String },
}

/// Configuration errors, raised before any backend client is constructed
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    /// One half of a credential pair was supplied without the other
    #[error("Partial credentials: {present} is set but {missing} is not")]
    PartialCredentials { present: String, missing: String },

    #[error("Unknown provider '{value}' (expected one of: local, aws, gcp)")]
    UnknownProvider { value: String },

    #[error("Provider {provider} is not available: {message}")]
    UnsupportedProvider { provider: String, message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Errors produced while building a provider
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Failed to initialize {provider} provider: {message}")]
    Initialization { provider: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
