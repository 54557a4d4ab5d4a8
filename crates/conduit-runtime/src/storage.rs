//! # Object Storage Interface
//!
//! Uniform blob contract over local files, S3 and Cloud Storage.
//!
//! Objects are addressed by `(bucket, key)`. Buckets are logical names; each
//! backend maps them through its [`BucketNaming`](crate::provider::BucketNaming)
//! before touching the real store.

use crate::error::StorageError;
use crate::provider::ProviderType;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Content type used when an upload does not name one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Default lifetime of signed URLs in seconds
pub const DEFAULT_SIGNED_URL_EXPIRY_SECONDS: u64 = 3600;

/// Longest lifetime accepted by V4 signing on S3 and GCS (7 days)
pub const MAX_SIGNED_URL_EXPIRY_SECONDS: u64 = 7 * 24 * 3600;

// ============================================================================
// Core Trait
// ============================================================================

/// Interface for object storage operations
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Store an object, replacing any existing one, and return its URI
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: &UploadOptions,
    ) -> Result<String, StorageError>;

    /// Fetch an object with its content type and metadata
    ///
    /// Metadata keys come back as the backend stores them: S3 lower-cases
    /// them, so `Job-Id` supplied at upload is returned as `job-id`. Local and
    /// Cloud Storage preserve case.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when the object does not exist.
    async fn download(&self, bucket: &str, key: &str) -> Result<DownloadedObject, StorageError>;

    /// Produce a time-limited URL granting read or write access
    async fn get_signed_url(
        &self,
        bucket: &str,
        key: &str,
        options: &SignedUrlOptions,
    ) -> Result<String, StorageError>;

    /// Remove an object; succeeds when it is already absent
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// Check whether an object exists
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError>;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;
}

// ============================================================================
// Supporting Types
// ============================================================================

/// Options for `upload`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Content type, falling back to `application/octet-stream`
    pub fn content_type(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}

/// Access granted by a signed URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignedUrlAction {
    #[default]
    Read,
    Write,
}

impl SignedUrlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    /// HTTP method the URL authorizes
    pub fn http_method(&self) -> &'static str {
        match self {
            Self::Read => "GET",
            Self::Write => "PUT",
        }
    }
}

impl FromStr for SignedUrlAction {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            other => Err(StorageError::SigningFailed {
                message: format!("unknown action '{}'", other),
            }),
        }
    }
}

/// Options for `get_signed_url`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedUrlOptions {
    pub expires_in_seconds: u64,
    pub action: SignedUrlAction,
}

impl SignedUrlOptions {
    pub fn read(expires_in_seconds: u64) -> Self {
        Self {
            expires_in_seconds,
            action: SignedUrlAction::Read,
        }
    }

    pub fn write(expires_in_seconds: u64) -> Self {
        Self {
            expires_in_seconds,
            action: SignedUrlAction::Write,
        }
    }

    /// Reject zero and over-long lifetimes
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.expires_in_seconds == 0 || self.expires_in_seconds > MAX_SIGNED_URL_EXPIRY_SECONDS
        {
            return Err(StorageError::SigningFailed {
                message: format!(
                    "expiry must be between 1 and {} seconds, got {}",
                    MAX_SIGNED_URL_EXPIRY_SECONDS, self.expires_in_seconds
                ),
            });
        }
        Ok(())
    }
}

impl Default for SignedUrlOptions {
    fn default() -> Self {
        Self::read(DEFAULT_SIGNED_URL_EXPIRY_SECONDS)
    }
}

/// Object returned by `download`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedObject {
    pub data: Bytes,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

/// Validate an object key shared by every backend
///
/// Keys must be non-empty, relative and free of NUL bytes. Backends add their
/// own checks on top.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let reason = if key.is_empty() {
        Some("key is empty")
    } else if key.len() > 1024 {
        Some("key exceeds 1024 bytes")
    } else if key.starts_with('/') {
        Some("key must be relative")
    } else if key.contains('\0') {
        Some("key contains a NUL byte")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Validate a logical bucket name
pub fn validate_bucket(bucket: &str) -> Result<(), StorageError> {
    if bucket.is_empty()
        || bucket == "."
        || bucket == ".."
        || !bucket
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(StorageError::InvalidKey {
            key: bucket.to_string(),
            reason: "bucket names are ASCII alphanumerics, hyphens, underscores and dots"
                .to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
#[path = "storage_tests.rs"]
mod tests;
