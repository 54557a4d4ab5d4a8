//! Provider types and configuration.

use crate::environment::{
    Environment, AWS_ACCESS_KEY_ID, AWS_CONTAINER_AUTHORIZATION_TOKEN,
    AWS_CONTAINER_CREDENTIALS_FULL_URI, AWS_CONTAINER_CREDENTIALS_RELATIVE_URI,
    AWS_DEFAULT_REGION, AWS_EC2_METADATA_SERVICE_ENDPOINT, AWS_ENDPOINT_URL, AWS_REGION,
    AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN, DEFAULT_AWS_REGION, DEFAULT_LOCAL_STORAGE_PATH,
    DEFAULT_GCE_METADATA_HOST, DLQ_SUFFIX, GCE_METADATA_HOST, GCP_PROJECT_ID, GOOGLE_APPLICATION_CREDENTIALS, GOOGLE_CLOUD_PROJECT,
    LOCAL_SIGNING_SECRET, LOCAL_STORAGE_PATH, LOCAL_STORAGE_PUBLIC_URL, PUBSUB_EMULATOR_HOST,
    SQS_QUEUE_PREFIX, STORAGE_BUCKET_PREFIX, STORAGE_BUCKET_SUFFIX, STORAGE_EMULATOR_HOST,
};
use crate::error::ConfigurationError;
use crate::message::DEFAULT_DLQ_SUFFIX;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Enumeration of supported backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// In-memory queue and filesystem storage
    Local,
    /// SQS and S3
    Aws,
    /// Pub/Sub and Cloud Storage
    Gcp,
}

impl ProviderType {
    pub const ALL: [ProviderType; 3] = [Self::Local, Self::Aws, Self::Gcp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Aws => "aws",
            Self::Gcp => "gcp",
        }
    }

    /// Check whether the backend was compiled into this build
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Local => true,
            Self::Aws => cfg!(feature = "aws"),
            Self::Gcp => cfg!(feature = "gcp"),
        }
    }

    /// Get maximum message size for provider
    pub fn max_message_size(&self) -> usize {
        match self {
            Self::Local => 10 * 1024 * 1024, // 10MB
            Self::Aws => 256 * 1024,         // 256KB
            Self::Gcp => 10 * 1024 * 1024,   // 10MB
        }
    }

    /// Check if the backend honours FIFO group and deduplication ids
    pub fn supports_fifo(&self) -> bool {
        matches!(self, Self::Aws)
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "memory" | "in-memory" => Ok(Self::Local),
            "aws" | "sqs" => Ok(Self::Aws),
            "gcp" | "google" | "pubsub" => Ok(Self::Gcp),
            _ => Err(ConfigurationError::UnknownProvider {
                value: s.to_string(),
            }),
        }
    }
}

/// Maps logical bucket names to backend bucket names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketNaming {
    pub prefix: String,
    pub suffix: String,
}

impl BucketNaming {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    fn from_environment(env: &Environment) -> Self {
        Self::new(
            env.get(STORAGE_BUCKET_PREFIX).unwrap_or_default(),
            env.get(STORAGE_BUCKET_SUFFIX).unwrap_or_default(),
        )
    }

    /// Resolve `<prefix><bucket><suffix>`
    pub fn resolve(&self, bucket: &str) -> String {
        format!("{}{}{}", self.prefix, bucket, self.suffix)
    }
}

/// Provider-specific configuration
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    Local(LocalConfig),
    Aws(AwsConfig),
    Gcp(GcpConfig),
}

impl ProviderConfig {
    /// Build the configuration for `provider_type` from an environment snapshot
    pub fn from_environment(
        provider_type: ProviderType,
        env: &Environment,
    ) -> Result<Self, ConfigurationError> {
        Ok(match provider_type {
            ProviderType::Local => Self::Local(LocalConfig::from_environment(env)),
            ProviderType::Aws => Self::Aws(AwsConfig::from_environment(env)?),
            ProviderType::Gcp => Self::Gcp(GcpConfig::from_environment(env)),
        })
    }

    pub fn provider_type(&self) -> ProviderType {
        match self {
            Self::Local(_) => ProviderType::Local,
            Self::Aws(_) => ProviderType::Aws,
            Self::Gcp(_) => ProviderType::Gcp,
        }
    }
}

/// Local provider configuration
#[derive(Clone)]
pub struct LocalConfig {
    /// Root directory for stored objects
    pub storage_path: PathBuf,
    /// Base of generated signed URLs; `file://<storage_path>` when unset
    pub public_url: Option<String>,
    /// HMAC key for signed URLs; random per provider when unset
    pub signing_secret: Option<Zeroizing<String>>,
    pub dlq_suffix: String,
    pub bucket_naming: BucketNaming,
}

impl LocalConfig {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            ..Self::default()
        }
    }

    pub fn from_environment(env: &Environment) -> Self {
        Self {
            storage_path: PathBuf::from(
                env.get(LOCAL_STORAGE_PATH)
                    .unwrap_or(DEFAULT_LOCAL_STORAGE_PATH),
            ),
            public_url: env.get(LOCAL_STORAGE_PUBLIC_URL).map(str::to_string),
            signing_secret: env
                .get(LOCAL_SIGNING_SECRET)
                .map(|s| Zeroizing::new(s.to_string())),
            dlq_suffix: env
                .get(DLQ_SUFFIX)
                .unwrap_or(DEFAULT_DLQ_SUFFIX)
                .to_string(),
            bucket_naming: BucketNaming::from_environment(env),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from(DEFAULT_LOCAL_STORAGE_PATH),
            public_url: None,
            signing_secret: None,
            dlq_suffix: DEFAULT_DLQ_SUFFIX.to_string(),
            bucket_naming: BucketNaming::default(),
        }
    }
}

impl std::fmt::Debug for LocalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConfig")
            .field("storage_path", &self.storage_path)
            .field("public_url", &self.public_url)
            .field(
                "signing_secret",
                &self.signing_secret.as_ref().map(|_| "<REDACTED>"),
            )
            .field("dlq_suffix", &self.dlq_suffix)
            .field("bucket_naming", &self.bucket_naming)
            .finish()
    }
}

/// Static AWS credentials
#[derive(Clone)]
pub struct AwsStaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: Zeroizing<String>,
    pub session_token: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for AwsStaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsStaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<REDACTED>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

/// Address of the ECS task credentials endpoint
pub const ECS_CREDENTIALS_HOST: &str = "http://169.254.170.2";

/// Default instance metadata service endpoint
pub const DEFAULT_IMDS_ENDPOINT: &str = "http://169.254.169.254";

/// AWS SQS and S3 configuration
#[derive(Clone)]
pub struct AwsConfig {
    pub region: String,
    /// Static key pair; `None` means ambient (container or instance) credentials
    pub credentials: Option<AwsStaticCredentials>,
    /// Custom endpoint for SQS and S3 (LocalStack, tests)
    pub endpoint_url: Option<String>,
    /// Namespace prepended to every queue name
    pub queue_prefix: String,
    pub dlq_suffix: String,
    pub bucket_naming: BucketNaming,
    /// Container credentials endpoint, tried before instance metadata
    pub container_credentials_url: Option<String>,
    pub container_authorization_token: Option<Zeroizing<String>>,
    pub imds_endpoint: String,
}

impl std::fmt::Debug for AwsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsConfig")
            .field("region", &self.region)
            .field("credentials", &self.credentials)
            .field("endpoint_url", &self.endpoint_url)
            .field("queue_prefix", &self.queue_prefix)
            .field("dlq_suffix", &self.dlq_suffix)
            .field("bucket_naming", &self.bucket_naming)
            .field("container_credentials_url", &self.container_credentials_url)
            .field(
                "container_authorization_token",
                &self.container_authorization_token.as_ref().map(|_| "<REDACTED>"),
            )
            .field("imds_endpoint", &self.imds_endpoint)
            .finish()
    }
}

impl AwsConfig {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            credentials: None,
            endpoint_url: None,
            queue_prefix: String::new(),
            dlq_suffix: DEFAULT_DLQ_SUFFIX.to_string(),
            bucket_naming: BucketNaming::default(),
            container_credentials_url: None,
            container_authorization_token: None,
            imds_endpoint: DEFAULT_IMDS_ENDPOINT.to_string(),
        }
    }

    pub fn with_static_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.credentials = Some(AwsStaticCredentials {
            access_key_id: access_key_id.into(),
            secret_access_key: Zeroizing::new(secret_access_key.into()),
            session_token: None,
        });
        self
    }

    pub fn with_endpoint_url(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint.into());
        self
    }

    pub fn with_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    /// Build from the environment, rejecting half a key pair
    pub fn from_environment(env: &Environment) -> Result<Self, ConfigurationError> {
        let credentials = match (env.get(AWS_ACCESS_KEY_ID), env.get(AWS_SECRET_ACCESS_KEY)) {
            (Some(key_id), Some(secret)) => Some(AwsStaticCredentials {
                access_key_id: key_id.to_string(),
                secret_access_key: Zeroizing::new(secret.to_string()),
                session_token: env
                    .get(AWS_SESSION_TOKEN)
                    .map(|t| Zeroizing::new(t.to_string())),
            }),
            (Some(_), None) => {
                return Err(ConfigurationError::PartialCredentials {
                    present: AWS_ACCESS_KEY_ID.to_string(),
                    missing: AWS_SECRET_ACCESS_KEY.to_string(),
                })
            }
            (None, Some(_)) => {
                return Err(ConfigurationError::PartialCredentials {
                    present: AWS_SECRET_ACCESS_KEY.to_string(),
                    missing: AWS_ACCESS_KEY_ID.to_string(),
                })
            }
            (None, None) => None,
        };

        Ok(Self {
            region: env
                .first_of(&[AWS_REGION, AWS_DEFAULT_REGION])
                .unwrap_or(DEFAULT_AWS_REGION)
                .to_string(),
            credentials,
            endpoint_url: env.get(AWS_ENDPOINT_URL).map(str::to_string),
            queue_prefix: env.get(SQS_QUEUE_PREFIX).unwrap_or_default().to_string(),
            dlq_suffix: env
                .get(DLQ_SUFFIX)
                .unwrap_or(DEFAULT_DLQ_SUFFIX)
                .to_string(),
            bucket_naming: BucketNaming::from_environment(env),
            container_credentials_url: env
                .get(AWS_CONTAINER_CREDENTIALS_RELATIVE_URI)
                .map(|path| format!("{}{}", ECS_CREDENTIALS_HOST, path))
                .or_else(|| env.get(AWS_CONTAINER_CREDENTIALS_FULL_URI).map(str::to_string)),
            container_authorization_token: env
                .get(AWS_CONTAINER_AUTHORIZATION_TOKEN)
                .map(|t| Zeroizing::new(t.to_string())),
            imds_endpoint: env
                .get(AWS_EC2_METADATA_SERVICE_ENDPOINT)
                .unwrap_or(DEFAULT_IMDS_ENDPOINT)
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

/// Google Pub/Sub and Cloud Storage configuration
#[derive(Debug, Clone)]
pub struct GcpConfig {
    /// Explicit project; detected from the key file or metadata server when unset
    pub project_id: Option<String>,
    /// Service-account key file
    pub credentials_path: Option<PathBuf>,
    /// `host:port` of a Pub/Sub emulator; disables auth for Pub/Sub
    pub pubsub_emulator_host: Option<String>,
    /// `host:port` or URL of a Cloud Storage emulator; disables auth for GCS
    pub storage_emulator_host: Option<String>,
    /// Defer pulled messages whose `scheduledTime` is in the future
    pub honor_scheduled_time: bool,
    pub dlq_suffix: String,
    pub bucket_naming: BucketNaming,
    /// Metadata server `host[:port]` for ambient credentials and project id
    pub metadata_host: String,
}

impl GcpConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..Self::default()
        }
    }

    pub fn from_environment(env: &Environment) -> Self {
        Self {
            project_id: env
                .first_of(&[GCP_PROJECT_ID, GOOGLE_CLOUD_PROJECT])
                .map(str::to_string),
            credentials_path: env.get(GOOGLE_APPLICATION_CREDENTIALS).map(PathBuf::from),
            pubsub_emulator_host: env.get(PUBSUB_EMULATOR_HOST).map(str::to_string),
            storage_emulator_host: env.get(STORAGE_EMULATOR_HOST).map(str::to_string),
            honor_scheduled_time: true,
            dlq_suffix: env
                .get(DLQ_SUFFIX)
                .unwrap_or(DEFAULT_DLQ_SUFFIX)
                .to_string(),
            bucket_naming: BucketNaming::from_environment(env),
            metadata_host: env
                .get(GCE_METADATA_HOST)
                .unwrap_or(DEFAULT_GCE_METADATA_HOST)
                .to_string(),
        }
    }
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            credentials_path: None,
            pubsub_emulator_host: None,
            storage_emulator_host: None,
            honor_scheduled_time: true,
            dlq_suffix: DEFAULT_DLQ_SUFFIX.to_string(),
            bucket_naming: BucketNaming::default(),
            metadata_host: DEFAULT_GCE_METADATA_HOST.to_string(),
        }
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
