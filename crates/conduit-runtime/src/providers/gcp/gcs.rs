//! Cloud Storage adapter (JSON API) with V4 signed URLs.

use super::auth::TokenProvider;
use super::{host_base_url, send_request, GcpError};
use crate::error::StorageError;
use crate::provider::{BucketNaming, GcpConfig, ProviderType};
use crate::storage::{
    validate_bucket, validate_key, DownloadedObject, SignedUrlOptions, StorageProvider,
    UploadOptions, DEFAULT_CONTENT_TYPE,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use url::Url;

#[cfg(test)]
#[path = "gcs_tests.rs"]
mod tests;

const STORAGE_BASE_URL: &str = "https://storage.googleapis.com";
const IAM_CREDENTIALS_BASE_URL: &str = "https://iamcredentials.googleapis.com";
const SIGNING_ALGORITHM: &str = "GOOG4-RSA-SHA256";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Cloud Storage implementation of [`StorageProvider`]
pub struct GcsStorage {
    http: reqwest::Client,
    /// `None` when talking to an emulator
    api_tokens: Option<Arc<TokenProvider>>,
    /// Signing identity; used for signed URLs even against an emulator
    signer: Arc<TokenProvider>,
    base_url: String,
    iam_base_url: String,
    bucket_naming: BucketNaming,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource<'a> {
    name: &'a str,
    content_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMetadata {
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct SignBlobRequest {
    payload: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignBlobResponse {
    signed_blob: String,
}

/// A V4 signed URL awaiting its signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UnsignedUrl {
    /// Full URL including every query parameter except the signature
    pub url: String,
    pub string_to_sign: String,
}

impl UnsignedUrl {
    pub fn with_signature(self, signature: &[u8]) -> String {
        format!("{}&X-Goog-Signature={}", self.url, hex::encode(signature))
    }
}

impl GcsStorage {
    pub fn new(config: &GcpConfig, http: reqwest::Client, tokens: Arc<TokenProvider>) -> Self {
        let (base_url, api_tokens) = match config.storage_emulator_host {
            Some(ref host) => (host_base_url(host), None),
            None => (STORAGE_BASE_URL.to_string(), Some(Arc::clone(&tokens))),
        };

        Self {
            http,
            api_tokens,
            signer: tokens,
            base_url,
            iam_base_url: IAM_CREDENTIALS_BASE_URL.to_string(),
            bucket_naming: config.bucket_naming.clone(),
        }
    }

    /// Override the IAM credentials endpoint used for keyless signing
    pub fn with_iam_base_url(mut self, url: impl Into<String>) -> Self {
        self.iam_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn resolve(&self, bucket: &str, key: &str) -> Result<String, StorageError> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        Ok(self.bucket_naming.resolve(bucket))
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.base_url,
            bucket,
            urlencoding::encode(key)
        )
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
    ) -> Result<reqwest::RequestBuilder, GcpError> {
        let request = self.http.request(method, url);
        match self.api_tokens {
            Some(ref tokens) => Ok(request.bearer_auth(tokens.access_token().await?.as_str())),
            None => Ok(request),
        }
    }

    async fn metadata(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, GcpError> {
        let request = self
            .request(Method::GET, &self.object_url(bucket, key))
            .await?;
        let body = send_request(request).await?;
        serde_json::from_slice(&body).map_err(|e| GcpError::SerializationError(e.to_string()))
    }

    /// Build the unsigned V4 URL for `method` on `bucket/key`
    pub(crate) fn unsigned_url(
        &self,
        bucket: &str,
        key: &str,
        method: &str,
        email: &str,
        expires_in_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<UnsignedUrl, GcpError> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| GcpError::ConfigurationError(format!("{}: {}", self.base_url, e)))?;
        let host = match (base.host_str(), base.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(GcpError::ConfigurationError(format!(
                    "storage URL '{}' has no host",
                    self.base_url
                )))
            }
        };

        let date = now.format("%Y%m%d").to_string();
        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = format!("{}/auto/storage/goog4_request", date);
        let path = format!("/{}/{}", bucket, encode_object_path(key));

        let mut query = BTreeMap::new();
        query.insert("X-Goog-Algorithm", SIGNING_ALGORITHM.to_string());
        query.insert("X-Goog-Credential", format!("{}/{}", email, scope));
        query.insert("X-Goog-Date", timestamp.clone());
        query.insert("X-Goog-Expires", expires_in_seconds.to_string());
        query.insert("X-Goog-SignedHeaders", "host".to_string());
        let canonical_query = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\n\nhost\n{}",
            method, path, canonical_query, host, UNSIGNED_PAYLOAD
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            SIGNING_ALGORITHM,
            timestamp,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        Ok(UnsignedUrl {
            url: format!(
                "{}://{}{}?{}",
                base.scheme(),
                host,
                path,
                canonical_query
            ),
            string_to_sign,
        })
    }

    /// Sign with the local key, or through IAM `signBlob` without one
    async fn sign(&self, email: &str, payload: &str) -> Result<Vec<u8>, GcpError> {
        if let Some(key) = self.signer.service_account_key() {
            return Ok(key.sign(payload.as_bytes()));
        }

        let token = self
            .signer
            .access_token()
            .await
            .map_err(|e| GcpError::SigningFailed(e.to_string()))?;
        let url = format!(
            "{}/v1/projects/-/serviceAccounts/{}:signBlob",
            self.iam_base_url, email
        );
        let body = send_request(
            self.http
                .post(url)
                .bearer_auth(token.as_str())
                .json(&SignBlobRequest {
                    payload: STANDARD.encode(payload.as_bytes()),
                }),
        )
        .await
        .map_err(|e| GcpError::SigningFailed(e.to_string()))?;

        let response: SignBlobResponse = serde_json::from_slice(&body)
            .map_err(|e| GcpError::SigningFailed(format!("invalid signBlob response: {}", e)))?;
        STANDARD
            .decode(response.signed_blob.as_bytes())
            .map_err(|e| GcpError::SigningFailed(format!("invalid signBlob signature: {}", e)))
    }
}

/// Percent-encode an object name for a URL path, keeping `/` separators
fn encode_object_path(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// `multipart/related` body carrying the object resource then the media
fn multipart_body(resource: &[u8], content_type: &str, data: &[u8], boundary: &str) -> Bytes {
    let mut body = BytesMut::with_capacity(resource.len() + data.len() + 256);
    body.put_slice(format!("--{}\r\n", boundary).as_bytes());
    body.put_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.put_slice(resource);
    body.put_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.put_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.put_slice(data);
    body.put_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body.freeze()
}

#[async_trait]
impl StorageProvider for GcsStorage {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: &UploadOptions,
    ) -> Result<String, StorageError> {
        let resolved = self.resolve(bucket, key)?;
        let content_type = options.content_type();
        let resource = serde_json::to_vec(&ObjectResource {
            name: key,
            content_type,
            metadata: Some(&options.metadata).filter(|m| !m.is_empty()),
        })
        .map_err(|e| GcpError::SerializationError(e.to_string()).to_storage_error(&resolved, key))?;

        let boundary = format!("conduit-{}", uuid::Uuid::new_v4().simple());
        let body = multipart_body(&resource, content_type, &data, &boundary);
        let url = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=multipart",
            self.base_url, resolved
        );

        let result = async {
            let request = self.request(Method::POST, &url).await?;
            send_request(
                request
                    .header(
                        "content-type",
                        format!("multipart/related; boundary={}", boundary),
                    )
                    .body(body),
            )
            .await
        }
        .await;
        result.map_err(|e| e.to_storage_error(&resolved, key))?;

        tracing::debug!(bucket = %resolved, key = %key, size = data.len(), "Object uploaded to GCS");
        Ok(format!("gs://{}/{}", resolved, key))
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<DownloadedObject, StorageError> {
        let resolved = self.resolve(bucket, key)?;

        let result = async {
            let metadata = self.metadata(&resolved, key).await?;
            let url = format!("{}?alt=media", self.object_url(&resolved, key));
            let data = send_request(self.request(Method::GET, &url).await?).await?;
            Ok::<_, GcpError>((metadata, data))
        }
        .await;
        let (metadata, data) = result.map_err(|e| e.to_storage_error(&resolved, key))?;

        tracing::debug!(bucket = %resolved, key = %key, size = data.len(), "Object downloaded from GCS");
        Ok(DownloadedObject {
            data,
            content_type: metadata
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            metadata: metadata.metadata,
        })
    }

    async fn get_signed_url(
        &self,
        bucket: &str,
        key: &str,
        options: &SignedUrlOptions,
    ) -> Result<String, StorageError> {
        options.validate()?;
        let resolved = self.resolve(bucket, key)?;

        let result = async {
            let email = self
                .signer
                .service_account_email()
                .await
                .map_err(|e| GcpError::SigningFailed(e.to_string()))?;
            let unsigned = self.unsigned_url(
                &resolved,
                key,
                options.action.http_method(),
                &email,
                options.expires_in_seconds,
                Utc::now(),
            )?;
            let signature = self.sign(&email, &unsigned.string_to_sign).await?;
            Ok::<_, GcpError>(unsigned.with_signature(&signature))
        }
        .await;
        result.map_err(|e| e.to_storage_error(&resolved, key))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let resolved = self.resolve(bucket, key)?;

        let result = async {
            let request = self
                .request(Method::DELETE, &self.object_url(&resolved, key))
                .await?;
            send_request(request).await
        }
        .await;
        match result {
            Ok(_) | Err(GcpError::NotFound(_)) => {
                tracing::debug!(bucket = %resolved, key = %key, "Object deleted from GCS");
                Ok(())
            }
            Err(e) => Err(e.to_storage_error(&resolved, key)),
        }
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        let resolved = self.resolve(bucket, key)?;
        match self.metadata(&resolved, key).await {
            Ok(_) => Ok(true),
            Err(GcpError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.to_storage_error(&resolved, key)),
        }
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Gcp
    }
}
