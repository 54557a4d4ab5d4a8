//! S3 object storage adapter (REST API).

use super::credentials::CredentialProvider;
use super::signer::{encode_key_path, payload_hash, SigV4Signer};
use super::{parse_error_response, AwsError};
use crate::error::StorageError;
use crate::provider::{AwsConfig, BucketNaming, ProviderType};
use crate::storage::{
    validate_bucket, validate_key, DownloadedObject, SignedUrlOptions, StorageProvider,
    UploadOptions, DEFAULT_CONTENT_TYPE,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use url::Url;

#[cfg(test)]
#[path = "s3_tests.rs"]
mod tests;

const METADATA_HEADER_PREFIX: &str = "x-amz-meta-";

/// S3 implementation of [`StorageProvider`]
pub struct S3Storage {
    http: reqwest::Client,
    credentials: Arc<CredentialProvider>,
    signer: SigV4Signer,
    region: String,
    /// Custom endpoint; switches to path-style addressing
    endpoint: Option<Url>,
    bucket_naming: BucketNaming,
}

impl S3Storage {
    pub fn new(
        config: &AwsConfig,
        http: reqwest::Client,
        credentials: Arc<CredentialProvider>,
    ) -> Result<Self, AwsError> {
        let endpoint = config
            .endpoint_url
            .as_deref()
            .map(|raw| {
                Url::parse(raw).map_err(|e| {
                    AwsError::ConfigurationError(format!("S3 endpoint '{}': {}", raw, e))
                })
            })
            .transpose()?;

        Ok(Self {
            http,
            credentials,
            signer: SigV4Signer::new(&config.region, "s3"),
            region: config.region.clone(),
            endpoint,
            bucket_naming: config.bucket_naming.clone(),
        })
    }

    /// Object URL: path-style on a custom endpoint, virtual-hosted on AWS
    fn object_url(&self, bucket: &str, key: &str) -> Result<Url, AwsError> {
        let raw = match self.endpoint {
            Some(ref endpoint) => format!(
                "{}/{}/{}",
                endpoint.as_str().trim_end_matches('/'),
                bucket,
                encode_key_path(key)
            ),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                bucket,
                self.region,
                encode_key_path(key)
            ),
        };
        Url::parse(&raw).map_err(|e| AwsError::ConfigurationError(format!("{}: {}", raw, e)))
    }

    /// Validate names and return `(resolved bucket, url)`
    fn target(&self, bucket: &str, key: &str) -> Result<(String, Url), StorageError> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        let resolved = self.bucket_naming.resolve(bucket);
        let url = self
            .object_url(&resolved, key)
            .map_err(AwsError::to_storage_error)?;
        Ok((resolved, url))
    }

    /// Send a signed request and return status, headers and body
    async fn send(
        &self,
        method: Method,
        url: &Url,
        mut headers: BTreeMap<String, String>,
        body: Bytes,
    ) -> Result<(StatusCode, HeaderMap, Bytes), AwsError> {
        let credentials = self.credentials.credentials().await?;
        let hash = payload_hash(&body);
        headers.insert("x-amz-content-sha256".to_string(), hash.clone());

        let signed = self.signer.sign_headers(
            &credentials,
            method.as_str(),
            url,
            &headers,
            &hash,
            &Utc::now(),
        );

        let mut request = self.http.request(method, url.clone()).body(body);
        for (name, value) in headers.iter().chain(signed.iter()) {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        let response_headers = response.headers().clone();
        let bytes = response.bytes().await?;
        Ok((status, response_headers, bytes))
    }

    fn failure(status: StatusCode, body: &[u8], bucket: &str, key: &str) -> StorageError {
        let error = if status == StatusCode::NOT_FOUND {
            AwsError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }
        } else {
            let text = String::from_utf8_lossy(body);
            parse_error_response(status.as_u16(), &text, &format!("{}/{}", bucket, key))
        };
        error.to_storage_error()
    }
}

fn metadata_from_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(METADATA_HEADER_PREFIX)?;
            let value = value.to_str().ok()?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

#[async_trait]
impl StorageProvider for S3Storage {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: &UploadOptions,
    ) -> Result<String, StorageError> {
        let (resolved, url) = self.target(bucket, key)?;
        let size = data.len();

        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), options.content_type().to_string());
        for (name, value) in &options.metadata {
            // S3 stores metadata keys lower-cased.
            headers.insert(
                format!("{}{}", METADATA_HEADER_PREFIX, name.to_ascii_lowercase()),
                value.clone(),
            );
        }

        let (status, _, body) = self
            .send(Method::PUT, &url, headers, data)
            .await
            .map_err(AwsError::to_storage_error)?;
        if !status.is_success() {
            return Err(Self::failure(status, &body, &resolved, key));
        }

        tracing::debug!(bucket = %resolved, key = %key, size, "Object uploaded to S3");
        Ok(format!("s3://{}/{}", resolved, key))
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<DownloadedObject, StorageError> {
        let (resolved, url) = self.target(bucket, key)?;

        let (status, headers, body) = self
            .send(Method::GET, &url, BTreeMap::new(), Bytes::new())
            .await
            .map_err(AwsError::to_storage_error)?;
        if !status.is_success() {
            return Err(Self::failure(status, &body, &resolved, key));
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        tracing::debug!(bucket = %resolved, key = %key, size = body.len(), "Object downloaded from S3");
        Ok(DownloadedObject {
            data: body,
            content_type,
            metadata: metadata_from_headers(&headers),
        })
    }

    async fn get_signed_url(
        &self,
        bucket: &str,
        key: &str,
        options: &SignedUrlOptions,
    ) -> Result<String, StorageError> {
        options.validate()?;
        let (_, url) = self.target(bucket, key)?;
        let credentials = self
            .credentials
            .credentials()
            .await
            .map_err(AwsError::to_storage_error)?;

        Ok(self.signer.presign_url(
            &credentials,
            options.action.http_method(),
            &url,
            options.expires_in_seconds,
            &Utc::now(),
        ))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let (resolved, url) = self.target(bucket, key)?;

        let (status, _, body) = self
            .send(Method::DELETE, &url, BTreeMap::new(), Bytes::new())
            .await
            .map_err(AwsError::to_storage_error)?;
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(Self::failure(status, &body, &resolved, key));
        }

        tracing::debug!(bucket = %resolved, key = %key, "Object deleted from S3");
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        let (resolved, url) = self.target(bucket, key)?;

        let (status, _, body) = self
            .send(Method::HEAD, &url, BTreeMap::new(), Bytes::new())
            .await
            .map_err(AwsError::to_storage_error)?;
        match status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Self::failure(s, &body, &resolved, key)),
        }
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Aws
    }
}
