//! # Environment Validation
//!
//! Per-backend tables of the environment variables each provider reads, and
//! the pre-flight validator the factory runs before any client is built.
//!
//! Values are read from an [`Environment`] snapshot rather than from the
//! process directly, so validation and settings resolution can be exercised
//! with explicit key/value pairs.

use crate::error::ConfigurationError;
use crate::provider::ProviderType;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

pub const CLOUD_PROVIDER: &str = "CLOUD_PROVIDER";
pub const QUEUE_NAME: &str = "QUEUE_NAME";
pub const DLQ_SUFFIX: &str = "DLQ_SUFFIX";
pub const STORAGE_BUCKET_PREFIX: &str = "STORAGE_BUCKET_PREFIX";
pub const STORAGE_BUCKET_SUFFIX: &str = "STORAGE_BUCKET_SUFFIX";

pub const LOCAL_STORAGE_PATH: &str = "LOCAL_STORAGE_PATH";
pub const LOCAL_STORAGE_PUBLIC_URL: &str = "LOCAL_STORAGE_PUBLIC_URL";
pub const LOCAL_SIGNING_SECRET: &str = "LOCAL_SIGNING_SECRET";

pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
pub const AWS_REGION: &str = "AWS_REGION";
pub const AWS_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";
pub const AWS_ENDPOINT_URL: &str = "AWS_ENDPOINT_URL";
pub const SQS_QUEUE_PREFIX: &str = "SQS_QUEUE_PREFIX";
pub const AWS_CONTAINER_CREDENTIALS_RELATIVE_URI: &str = "AWS_CONTAINER_CREDENTIALS_RELATIVE_URI";
pub const AWS_CONTAINER_CREDENTIALS_FULL_URI: &str = "AWS_CONTAINER_CREDENTIALS_FULL_URI";
pub const AWS_CONTAINER_AUTHORIZATION_TOKEN: &str = "AWS_CONTAINER_AUTHORIZATION_TOKEN";
pub const AWS_EC2_METADATA_SERVICE_ENDPOINT: &str = "AWS_EC2_METADATA_SERVICE_ENDPOINT";

pub const GOOGLE_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
pub const GCP_PROJECT_ID: &str = "GCP_PROJECT_ID";
pub const GOOGLE_CLOUD_PROJECT: &str = "GOOGLE_CLOUD_PROJECT";
pub const PUBSUB_EMULATOR_HOST: &str = "PUBSUB_EMULATOR_HOST";
pub const STORAGE_EMULATOR_HOST: &str = "STORAGE_EMULATOR_HOST";
pub const GCE_METADATA_HOST: &str = "GCE_METADATA_HOST";

pub const DEFAULT_QUEUE_NAME: &str = "jobs";
pub const DEFAULT_LOCAL_STORAGE_PATH: &str = "./data/storage";
pub const DEFAULT_AWS_REGION: &str = "us-east-1";
pub const DEFAULT_GCE_METADATA_HOST: &str = "metadata.google.internal";

// ============================================================================
// Environment Snapshot
// ============================================================================

/// Immutable snapshot of environment variables
///
/// Empty values are treated as unset.
#[derive(Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    /// Capture the current process environment
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build from explicit pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Return a copy with one variable set
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Look up a variable, ignoring blank values
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// First present variable among `keys`, in order
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Resolve the backend from `CLOUD_PROVIDER`, defaulting to local
    pub fn provider_type(&self) -> Result<ProviderType, ConfigurationError> {
        match self.get(CLOUD_PROVIDER) {
            Some(value) => value.parse(),
            None => Ok(ProviderType::Local),
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Values may be secrets; only names are shown.
        let mut keys: Vec<&String> = self.vars.keys().collect();
        keys.sort();
        f.debug_struct("Environment").field("keys", &keys).finish()
    }
}

// ============================================================================
// Variable Tables
// ============================================================================

/// How a backend treats a variable's absence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    /// Silently defaulted
    Optional,
    /// Defaulted with a warning
    Recommended,
    /// Must be supplied together with its partner variable, or neither
    Paired(&'static str),
}

/// One row of a backend's environment table
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EnvVarSpec {
    pub name: &'static str,
    pub requirement: Requirement,
    /// Legacy name consulted when `name` is unset
    pub alias: Option<&'static str>,
    pub default: Option<&'static str>,
    pub secret: bool,
    pub description: &'static str,
}

const fn var(name: &'static str, default: Option<&'static str>, description: &'static str) -> EnvVarSpec {
    EnvVarSpec {
        name,
        requirement: Requirement::Optional,
        alias: None,
        default,
        secret: false,
        description,
    }
}

const COMMON_VARS: &[EnvVarSpec] = &[
    var(CLOUD_PROVIDER, Some("local"), "Backend selection"),
    var(QUEUE_NAME, Some(DEFAULT_QUEUE_NAME), "Default queue name"),
    var(DLQ_SUFFIX, Some("-dlq"), "Dead-letter queue suffix"),
    var(STORAGE_BUCKET_PREFIX, None, "Prefix applied to every bucket name"),
    var(STORAGE_BUCKET_SUFFIX, None, "Suffix applied to every bucket name"),
];

const LOCAL_VARS: &[EnvVarSpec] = &[
    var(LOCAL_STORAGE_PATH, Some(DEFAULT_LOCAL_STORAGE_PATH), "Storage root directory"),
    var(LOCAL_STORAGE_PUBLIC_URL, None, "Base URL for signed URLs"),
    EnvVarSpec {
        secret: true,
        ..var(LOCAL_SIGNING_SECRET, None, "HMAC key for signed URLs")
    },
];

const AWS_VARS: &[EnvVarSpec] = &[
    EnvVarSpec {
        requirement: Requirement::Paired(AWS_SECRET_ACCESS_KEY),
        ..var(AWS_ACCESS_KEY_ID, None, "Static access key id")
    },
    EnvVarSpec {
        requirement: Requirement::Paired(AWS_ACCESS_KEY_ID),
        secret: true,
        ..var(AWS_SECRET_ACCESS_KEY, None, "Static secret access key")
    },
    EnvVarSpec {
        secret: true,
        ..var(AWS_SESSION_TOKEN, None, "Session token for temporary credentials")
    },
    EnvVarSpec {
        requirement: Requirement::Recommended,
        alias: Some(AWS_DEFAULT_REGION),
        ..var(AWS_REGION, Some(DEFAULT_AWS_REGION), "Region for SQS and S3")
    },
    var(AWS_ENDPOINT_URL, None, "Custom SQS/S3 endpoint"),
    var(SQS_QUEUE_PREFIX, None, "Namespace prepended to queue names"),
    var(
        AWS_CONTAINER_CREDENTIALS_RELATIVE_URI,
        None,
        "ECS task credentials path",
    ),
    var(
        AWS_CONTAINER_CREDENTIALS_FULL_URI,
        None,
        "Container credentials endpoint",
    ),
    EnvVarSpec {
        secret: true,
        ..var(
            AWS_CONTAINER_AUTHORIZATION_TOKEN,
            None,
            "Authorization header for the container credentials endpoint",
        )
    },
    var(
        AWS_EC2_METADATA_SERVICE_ENDPOINT,
        Some("http://169.254.169.254"),
        "Instance metadata service endpoint",
    ),
];

const GCP_VARS: &[EnvVarSpec] = &[
    EnvVarSpec {
        requirement: Requirement::Recommended,
        ..var(GOOGLE_APPLICATION_CREDENTIALS, None, "Service-account key file")
    },
    EnvVarSpec {
        requirement: Requirement::Recommended,
        alias: Some(GOOGLE_CLOUD_PROJECT),
        ..var(GCP_PROJECT_ID, None, "Project hosting topics and buckets")
    },
    var(PUBSUB_EMULATOR_HOST, None, "Pub/Sub emulator host:port"),
    var(STORAGE_EMULATOR_HOST, None, "Cloud Storage emulator host"),
    var(
        GCE_METADATA_HOST,
        Some(DEFAULT_GCE_METADATA_HOST),
        "Metadata server host for ambient credentials",
    ),
];

/// Variables shared by every backend
pub fn common_env_vars() -> &'static [EnvVarSpec] {
    COMMON_VARS
}

/// Variables read by a specific backend
pub fn env_vars(provider: ProviderType) -> &'static [EnvVarSpec] {
    match provider {
        ProviderType::Local => LOCAL_VARS,
        ProviderType::Aws => AWS_VARS,
        ProviderType::Gcp => GCP_VARS,
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Outcome of a successful pre-flight validation
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub provider: ProviderType,
    /// Soft problems; the backend will fall back to ambient behaviour
    pub warnings: Vec<String>,
    /// Effective value of every known variable; secrets are redacted
    pub resolved: BTreeMap<String, String>,
}

impl ValidationReport {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Validate the environment for `provider` before any client is constructed
///
/// Partial credential pairs are a hard error. Missing recommended variables
/// produce warnings, each also logged at `warn`.
pub fn validate_environment(
    provider: ProviderType,
    env: &Environment,
) -> Result<ValidationReport, ConfigurationError> {
    if !provider.is_enabled() {
        return Err(ConfigurationError::UnsupportedProvider {
            provider: provider.to_string(),
            message: format!("built without the '{}' feature", provider),
        });
    }

    let vars = env_vars(provider);
    let mut warnings = Vec::new();
    let mut resolved = BTreeMap::new();

    for var in COMMON_VARS.iter().chain(vars.iter()) {
        let value = match var.alias {
            Some(alias) => env.first_of(&[var.name, alias]),
            None => env.get(var.name),
        };

        match (value, var.requirement) {
            (None, Requirement::Paired(partner)) => {
                if env.contains(partner) {
                    return Err(ConfigurationError::PartialCredentials {
                        present: partner.to_string(),
                        missing: var.name.to_string(),
                    });
                }
            }
            (None, Requirement::Recommended) => {
                warnings.push(match var.default {
                    Some(default) => {
                        format!("{} is not set; defaulting to '{}'", var.name, default)
                    }
                    None => format!("{} is not set; using ambient detection", var.name),
                });
            }
            _ => {}
        }

        let shown = match value {
            Some(_) if var.secret => Some("<REDACTED>".to_string()),
            Some(v) => Some(v.to_string()),
            None => var.default.map(str::to_string),
        };
        if let Some(shown) = shown {
            resolved.insert(var.name.to_string(), shown);
        }
    }

    backend_warnings(provider, env, &mut warnings);

    for warning in &warnings {
        tracing::warn!(provider = %provider, "{}", warning);
    }

    Ok(ValidationReport {
        provider,
        warnings,
        resolved,
    })
}

fn backend_warnings(provider: ProviderType, env: &Environment, warnings: &mut Vec<String>) {
    match provider {
        ProviderType::Aws => {
            if !env.contains(AWS_ACCESS_KEY_ID) && !env.contains(AWS_SECRET_ACCESS_KEY) {
                warnings.push(
                    "No static AWS credentials; assuming IAM role or instance profile".to_string(),
                );
            }
        }
        ProviderType::Gcp => {
            if env.contains(PUBSUB_EMULATOR_HOST) {
                warnings.push(format!(
                    "{} is set; Pub/Sub requests go to the emulator without auth",
                    PUBSUB_EMULATOR_HOST
                ));
            }
        }
        ProviderType::Local => {}
    }
}

#[cfg(test)]
#[path = "environment_tests.rs"]
mod tests;
