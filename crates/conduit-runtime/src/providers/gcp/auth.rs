//! OAuth access tokens for Google APIs.
//!
//! A service-account key signs an RS256 JWT assertion that is exchanged for an
//! access token at the key's token endpoint. Without a key, tokens come from
//! the GCE metadata server. Tokens are cached until five minutes before they
//! expire.

use super::{host_base_url, send_request, GcpError};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;

/// Scope granting access to Pub/Sub, Cloud Storage and IAM credentials
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECONDS: i64 = 3600;
const REFRESH_MARGIN_SECONDS: i64 = 300;
const METADATA_FLAVOR: (&str, &str) = ("Metadata-Flavor", "Google");

// ============================================================================
// Service Account Key
// ============================================================================

#[derive(Deserialize)]
struct KeyFile {
    client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
}

/// Service-account key loaded from a JSON key file
#[derive(Clone)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key_id: Option<String>,
    pub project_id: Option<String>,
    pub token_uri: String,
    private_key: RsaPrivateKey,
}

impl ServiceAccountKey {
    /// Parse a key file's JSON content, validating the RSA key
    pub fn from_json(json: &str) -> Result<Self, GcpError> {
        let file: KeyFile = serde_json::from_str(json)
            .map_err(|e| GcpError::ConfigurationError(format!("invalid key file: {}", e)))?;
        let pem = Zeroizing::new(file.private_key);

        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|e| {
                GcpError::ConfigurationError(format!("invalid private key in key file: {}", e))
            })?;

        Ok(Self {
            client_email: file.client_email,
            private_key_id: file.private_key_id,
            project_id: file.project_id,
            token_uri: file.token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            private_key,
        })
    }

    pub async fn from_file(path: &Path) -> Result<Self, GcpError> {
        let json = Zeroizing::new(tokio::fs::read_to_string(path).await.map_err(|e| {
            GcpError::ConfigurationError(format!("cannot read {}: {}", path.display(), e))
        })?);
        Self::from_json(&json)
    }

    /// RSASSA-PKCS1-v1_5 SHA-256 signature over `data`
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        signing_key.sign(data).to_vec()
    }

    /// Signed JWT assertion for the OAuth token exchange
    fn assertion(&self, now: DateTime<Utc>) -> Result<String, GcpError> {
        let der = self
            .private_key
            .to_pkcs1_der()
            .map_err(|e| GcpError::Authentication(format!("cannot encode key: {}", e)))?;
        let encoding_key = EncodingKey::from_rsa_der(der.as_bytes());

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();

        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: &self.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECONDS,
        };

        encode(&header, &claims, &encoding_key)
            .map_err(|e| GcpError::Authentication(format!("failed to sign assertion: {}", e)))
    }
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("project_id", &self.project_id)
            .field("token_uri", &self.token_uri)
            .field("private_key", &"<REDACTED>")
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

// ============================================================================
// Token Provider
// ============================================================================

#[derive(Clone)]
struct AccessToken {
    value: Zeroizing<String>,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(REFRESH_MARGIN_SECONDS) < self.expires_at
    }
}

/// Supplies and caches access tokens for the GCP adapters
pub struct TokenProvider {
    http: reqwest::Client,
    key: Option<ServiceAccountKey>,
    metadata_base: String,
    cache: RwLock<Option<AccessToken>>,
}

impl TokenProvider {
    pub fn new(http: reqwest::Client, key: Option<ServiceAccountKey>, metadata_host: &str) -> Self {
        Self {
            http,
            key,
            metadata_base: host_base_url(metadata_host),
            cache: RwLock::new(None),
        }
    }

    /// Name of the credential source, for logging
    pub fn source_name(&self) -> &'static str {
        if self.key.is_some() {
            "service-account"
        } else {
            "metadata-server"
        }
    }

    pub fn service_account_key(&self) -> Option<&ServiceAccountKey> {
        self.key.as_ref()
    }

    /// Current access token, refreshed near expiry
    pub async fn access_token(&self) -> Result<Zeroizing<String>, GcpError> {
        {
            let cache = self.cache.read().await;
            if let Some(ref token) = *cache {
                if token.is_fresh(Utc::now()) {
                    return Ok(token.value.clone());
                }
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(ref token) = *cache {
            if token.is_fresh(Utc::now()) {
                return Ok(token.value.clone());
            }
        }

        let now = Utc::now();
        let response = match self.key {
            Some(ref key) => self.exchange_assertion(key, now).await?,
            None => self.metadata_token().await?,
        };
        let token = AccessToken {
            value: Zeroizing::new(response.access_token),
            expires_at: now + Duration::seconds(response.expires_in.unwrap_or(3600)),
        };

        tracing::debug!(
            source = self.source_name(),
            expires_at = %token.expires_at,
            "Obtained GCP access token"
        );
        let value = token.value.clone();
        *cache = Some(token);
        Ok(value)
    }

    async fn exchange_assertion(
        &self,
        key: &ServiceAccountKey,
        now: DateTime<Utc>,
    ) -> Result<TokenResponse, GcpError> {
        let assertion = key.assertion(now)?;
        let body = send_request(
            self.http
                .post(&key.token_uri)
                .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)]),
        )
        .await
        .map_err(as_auth_error)?;

        serde_json::from_slice(&body)
            .map_err(|e| GcpError::Authentication(format!("invalid token response: {}", e)))
    }

    async fn metadata_token(&self) -> Result<TokenResponse, GcpError> {
        let body = self
            .metadata_get("instance/service-accounts/default/token")
            .await?;
        serde_json::from_slice(&body)
            .map_err(|e| GcpError::Authentication(format!("invalid metadata token: {}", e)))
    }

    async fn metadata_get(&self, path: &str) -> Result<bytes::Bytes, GcpError> {
        send_request(
            self.http
                .get(format!("{}/computeMetadata/v1/{}", self.metadata_base, path))
                .header(METADATA_FLAVOR.0, METADATA_FLAVOR.1),
        )
        .await
        .map_err(as_auth_error)
    }

    /// Email of the signing identity: the key's account or the instance default
    pub async fn service_account_email(&self) -> Result<String, GcpError> {
        match self.key {
            Some(ref key) => Ok(key.client_email.clone()),
            None => {
                let body = self
                    .metadata_get("instance/service-accounts/default/email")
                    .await?;
                Ok(String::from_utf8_lossy(&body).trim().to_string())
            }
        }
    }

    /// Explicit project, else the key file's, else the metadata server's
    pub async fn resolve_project_id(&self, explicit: Option<&str>) -> Result<String, GcpError> {
        if let Some(project) = explicit {
            return Ok(project.to_string());
        }
        if let Some(project) = self.key.as_ref().and_then(|k| k.project_id.clone()) {
            return Ok(project);
        }

        let body = self.metadata_get("project/project-id").await.map_err(|e| {
            GcpError::ConfigurationError(format!(
                "no project id configured and metadata server lookup failed: {}",
                e
            ))
        })?;
        let project = String::from_utf8_lossy(&body).trim().to_string();
        if project.is_empty() {
            return Err(GcpError::ConfigurationError(
                "metadata server returned an empty project id".to_string(),
            ));
        }
        Ok(project)
    }
}

fn as_auth_error(error: GcpError) -> GcpError {
    match error {
        GcpError::ApiError { message, .. }
        | GcpError::NotFound(message)
        | GcpError::PermissionDenied(message)
        | GcpError::NetworkError(message) => GcpError::Authentication(message),
        other => other,
    }
}
