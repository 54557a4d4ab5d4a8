//! Backend selection and the memoized provider registry.
//!
//! [`create_provider`] validates the environment before constructing anything
//! and builds only the selected backend. [`ProviderRegistry`] memoizes one
//! [`Provider`] per registry; concurrent first callers share a single
//! initialization through a `tokio::sync::OnceCell`.

use crate::client::QueueProvider;
use crate::environment::{validate_environment, Environment};
use crate::error::{ConfigurationError, FactoryError};
use crate::provider::{LocalConfig, ProviderConfig, ProviderType};
use crate::providers::{LocalQueue, LocalStorage};
use crate::storage::StorageProvider;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tokio::sync::OnceCell;

#[cfg(test)]
#[path = "factory_tests.rs"]
mod tests;

/// A constructed backend: one storage and one queue sharing configuration
#[derive(Clone)]
pub struct Provider {
    pub provider_type: ProviderType,
    pub storage: Arc<dyn StorageProvider>,
    pub queue: Arc<dyn QueueProvider>,
}

impl Provider {
    pub fn new(
        provider_type: ProviderType,
        storage: Arc<dyn StorageProvider>,
        queue: Arc<dyn QueueProvider>,
    ) -> Self {
        Self {
            provider_type,
            storage,
            queue,
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("provider_type", &self.provider_type)
            .finish_non_exhaustive()
    }
}

/// Validate `env` for `provider_type`, then build that backend
///
/// # Errors
///
/// Returns [`FactoryError::Configuration`] when validation fails; no client
/// has been constructed in that case.
pub async fn create_provider(
    provider_type: ProviderType,
    env: &Environment,
) -> Result<Provider, FactoryError> {
    let report = validate_environment(provider_type, env)?;
    tracing::debug!(
        provider = %provider_type,
        warnings = report.warnings.len(),
        "Environment validated"
    );

    let config = ProviderConfig::from_environment(provider_type, env)?;
    create_from_config(config).await
}

/// Build a backend from an explicit configuration, skipping environment validation
pub async fn create_from_config(config: ProviderConfig) -> Result<Provider, FactoryError> {
    let provider_type = config.provider_type();
    let provider = match config {
        ProviderConfig::Local(local) => create_local(&local).await?,
        ProviderConfig::Aws(aws) => create_aws(&aws)?,
        ProviderConfig::Gcp(gcp) => create_gcp(&gcp).await?,
    };

    tracing::info!(provider = %provider_type, "Provider created");
    Ok(provider)
}

async fn create_local(config: &LocalConfig) -> Result<Provider, FactoryError> {
    let storage = LocalStorage::new(config)
        .await
        .map_err(|e| initialization(ProviderType::Local, e))?;
    let queue = LocalQueue::with_dlq_suffix(config.dlq_suffix.clone());
    Ok(Provider::new(
        ProviderType::Local,
        Arc::new(storage),
        Arc::new(queue),
    ))
}

#[cfg(feature = "aws")]
fn create_aws(config: &crate::provider::AwsConfig) -> Result<Provider, FactoryError> {
    let (queue, storage) =
        crate::providers::aws::create(config).map_err(|e| initialization(ProviderType::Aws, e))?;
    Ok(Provider::new(
        ProviderType::Aws,
        Arc::new(storage),
        Arc::new(queue),
    ))
}

#[cfg(not(feature = "aws"))]
fn create_aws(_config: &crate::provider::AwsConfig) -> Result<Provider, FactoryError> {
    Err(unsupported(ProviderType::Aws))
}

#[cfg(feature = "gcp")]
async fn create_gcp(config: &crate::provider::GcpConfig) -> Result<Provider, FactoryError> {
    let (queue, storage) = crate::providers::gcp::create(config)
        .await
        .map_err(|e| initialization(ProviderType::Gcp, e))?;
    Ok(Provider::new(
        ProviderType::Gcp,
        Arc::new(storage),
        Arc::new(queue),
    ))
}

#[cfg(not(feature = "gcp"))]
async fn create_gcp(_config: &crate::provider::GcpConfig) -> Result<Provider, FactoryError> {
    Err(unsupported(ProviderType::Gcp))
}

fn initialization(provider: ProviderType, error: impl std::fmt::Display) -> FactoryError {
    FactoryError::Initialization {
        provider: provider.to_string(),
        message: error.to_string(),
    }
}

#[cfg(any(not(feature = "aws"), not(feature = "gcp")))]
fn unsupported(provider: ProviderType) -> FactoryError {
    FactoryError::Configuration(ConfigurationError::UnsupportedProvider {
        provider: provider.to_string(),
        message: format!("built without the '{}' feature", provider),
    })
}

// ============================================================================
// Registry
// ============================================================================

type ProviderCell = Arc<OnceCell<Arc<Provider>>>;

/// Memoizes one [`Provider`] built from an environment snapshot
///
/// Pass a registry to the code that needs backends; tests build their own
/// from explicit pairs or inject a provider with [`set_provider`].
///
/// [`set_provider`]: ProviderRegistry::set_provider
pub struct ProviderRegistry {
    environment: Environment,
    cell: RwLock<ProviderCell>,
}

impl ProviderRegistry {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            cell: RwLock::new(Arc::new(OnceCell::new())),
        }
    }

    /// Process-wide registry over the process environment
    pub fn global() -> &'static ProviderRegistry {
        static GLOBAL: OnceLock<ProviderRegistry> = OnceLock::new();
        GLOBAL.get_or_init(|| ProviderRegistry::new(Environment::from_process()))
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Provider selected by `CLOUD_PROVIDER`, built on first use
    pub async fn get(&self) -> Result<Arc<Provider>, FactoryError> {
        let provider_type = self.environment.provider_type()?;
        self.get_for(provider_type).await
    }

    /// Provider of an explicit type, built on first use
    ///
    /// # Errors
    ///
    /// Fails with a configuration error when the registry already holds a
    /// provider of a different type; call [`reset`](Self::reset) first.
    pub async fn get_for(&self, provider_type: ProviderType) -> Result<Arc<Provider>, FactoryError> {
        let cell = self.current_cell();
        let provider = cell
            .get_or_try_init(|| async {
                create_provider(provider_type, &self.environment)
                    .await
                    .map(Arc::new)
            })
            .await?;

        if provider.provider_type != provider_type {
            return Err(FactoryError::Configuration(ConfigurationError::Invalid {
                message: format!(
                    "registry already holds a {} provider; requested {}",
                    provider.provider_type, provider_type
                ),
            }));
        }
        Ok(Arc::clone(provider))
    }

    /// Replace the memoized provider
    pub fn set_provider(&self, provider: Provider) {
        tracing::debug!(provider = %provider.provider_type, "Provider overridden");
        self.replace_cell(Arc::new(OnceCell::new_with(Some(Arc::new(provider)))));
    }

    /// Drop the memoized provider; the next call builds a new one
    pub fn reset(&self) {
        self.replace_cell(Arc::new(OnceCell::new()));
    }

    /// Whether a provider has been built or injected
    pub fn is_initialized(&self) -> bool {
        self.current_cell().initialized()
    }

    fn current_cell(&self) -> ProviderCell {
        Arc::clone(&self.cell.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn replace_cell(&self, cell: ProviderCell) {
        *self.cell.write().unwrap_or_else(PoisonError::into_inner) = cell;
    }
}
