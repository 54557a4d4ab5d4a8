//! AWS credential resolution.
//!
//! Static keys from configuration win. Otherwise credentials come from the
//! container credentials endpoint (ECS/EKS) when configured, and finally from
//! the EC2 instance metadata service using IMDSv2 session tokens. Ambient
//! credentials are cached until five minutes before they expire.

use super::AwsError;
use crate::provider::AwsConfig;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

#[cfg(test)]
#[path = "credentials_tests.rs"]
mod tests;

const IMDS_TOKEN_TTL_SECONDS: &str = "21600";
const REFRESH_MARGIN_MINUTES: i64 = 5;

/// Resolved credentials used for signing
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: Zeroizing<String>,
    pub session_token: Option<Zeroizing<String>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AwsCredentials {
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => now + Duration::minutes(REFRESH_MARGIN_MINUTES) >= expiry,
            None => false,
        }
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<REDACTED>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Credential document served by both the container and instance endpoints
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialDocument {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expiration: Option<DateTime<Utc>>,
}

impl From<CredentialDocument> for AwsCredentials {
    fn from(doc: CredentialDocument) -> Self {
        Self {
            access_key_id: doc.access_key_id,
            secret_access_key: Zeroizing::new(doc.secret_access_key),
            session_token: doc.token.map(Zeroizing::new),
            expires_at: doc.expiration,
        }
    }
}

#[derive(Debug, Clone)]
enum CredentialSource {
    Static,
    Container {
        url: String,
        authorization: Option<Zeroizing<String>>,
    },
    InstanceMetadata {
        endpoint: String,
    },
}

/// Resolves and caches credentials for the AWS adapters
pub struct CredentialProvider {
    http: reqwest::Client,
    source: CredentialSource,
    cache: RwLock<Option<AwsCredentials>>,
}

impl CredentialProvider {
    pub fn from_config(config: &AwsConfig, http: reqwest::Client) -> Self {
        let (source, cached) = match (&config.credentials, &config.container_credentials_url) {
            (Some(creds), _) => (
                CredentialSource::Static,
                Some(AwsCredentials {
                    access_key_id: creds.access_key_id.clone(),
                    secret_access_key: creds.secret_access_key.clone(),
                    session_token: creds.session_token.clone(),
                    expires_at: None,
                }),
            ),
            (None, Some(url)) => (
                CredentialSource::Container {
                    url: url.clone(),
                    authorization: config.container_authorization_token.clone(),
                },
                None,
            ),
            (None, None) => (
                CredentialSource::InstanceMetadata {
                    endpoint: config.imds_endpoint.trim_end_matches('/').to_string(),
                },
                None,
            ),
        };

        Self {
            http,
            source,
            cache: RwLock::new(cached),
        }
    }

    /// Name of the active source, for logging
    pub fn source_name(&self) -> &'static str {
        match self.source {
            CredentialSource::Static => "static",
            CredentialSource::Container { .. } => "container",
            CredentialSource::InstanceMetadata { .. } => "instance-metadata",
        }
    }

    /// Current credentials, refreshing ambient ones near expiry
    pub async fn credentials(&self) -> Result<AwsCredentials, AwsError> {
        {
            let cache = self.cache.read().await;
            if let Some(ref creds) = *cache {
                if !creds.needs_refresh(Utc::now()) {
                    return Ok(creds.clone());
                }
            }
        }

        let mut cache = self.cache.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(ref creds) = *cache {
            if !creds.needs_refresh(Utc::now()) {
                return Ok(creds.clone());
            }
        }

        let fresh = match &self.source {
            CredentialSource::Static => {
                return Err(AwsError::Authentication(
                    "static credentials missing from cache".to_string(),
                ))
            }
            CredentialSource::Container { url, authorization } => {
                self.fetch_container(url, authorization.as_ref()).await?
            }
            CredentialSource::InstanceMetadata { endpoint } => {
                self.fetch_instance_metadata(endpoint).await?
            }
        };

        tracing::debug!(
            source = self.source_name(),
            expires_at = ?fresh.expires_at,
            "Refreshed AWS credentials"
        );
        *cache = Some(fresh.clone());
        Ok(fresh)
    }

    async fn fetch_container(
        &self,
        url: &str,
        authorization: Option<&Zeroizing<String>>,
    ) -> Result<AwsCredentials, AwsError> {
        let mut request = self.http.get(url);
        if let Some(token) = authorization {
            request = request.header("Authorization", token.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| AwsError::Authentication(format!("container credentials: {}", e)))?;
        if !response.status().is_success() {
            return Err(AwsError::Authentication(format!(
                "container credentials endpoint returned {}",
                response.status()
            )));
        }

        let doc: CredentialDocument = response.json().await.map_err(|e| {
            AwsError::Authentication(format!("invalid container credentials: {}", e))
        })?;
        Ok(doc.into())
    }

    async fn fetch_instance_metadata(&self, endpoint: &str) -> Result<AwsCredentials, AwsError> {
        let unavailable =
            |e: reqwest::Error| AwsError::Authentication(format!("instance metadata: {}", e));

        let token = self
            .http
            .put(format!("{}/latest/api/token", endpoint))
            .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECONDS)
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?
            .text()
            .await
            .map_err(unavailable)?;

        let roles_url = format!("{}/latest/meta-data/iam/security-credentials/", endpoint);
        let roles = self
            .http
            .get(&roles_url)
            .header("X-aws-ec2-metadata-token", token.as_str())
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?
            .text()
            .await
            .map_err(unavailable)?;

        let role = roles
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| {
                AwsError::Authentication("no IAM role attached to instance".to_string())
            })?;

        let doc: CredentialDocument = self
            .http
            .get(format!("{}{}", roles_url, role))
            .header("X-aws-ec2-metadata-token", token.as_str())
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?
            .json()
            .await
            .map_err(unavailable)?;

        Ok(doc.into())
    }
}
