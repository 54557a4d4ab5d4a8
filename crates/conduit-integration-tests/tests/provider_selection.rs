//! Integration tests for backend selection and the provider registry
//!
//! These tests verify:
//! - `CLOUD_PROVIDER` and its aliases select the backend
//! - Validation failures stop construction before any client exists
//! - Producers and consumers sharing a registry see the same backend

mod common;

use common::{init_tracing, local_environment, order, Order};
use conduit_runtime::environment::{
    AWS_SECRET_ACCESS_KEY, CLOUD_PROVIDER, GCP_PROJECT_ID, GCE_METADATA_HOST,
    PUBSUB_EMULATOR_HOST,
};
use conduit_runtime::{
    validate_environment, ConfigurationError, EnqueueOptions, Environment, FactoryError,
    ProviderRegistry, ProviderType, QueueClientExt, ReceiveOptions,
};
use std::sync::Arc;
use tempfile::TempDir;

/// Verify that provider aliases resolve to the same backend.
#[test]
fn test_provider_aliases() {
    for (value, expected) in [
        ("memory", ProviderType::Local),
        ("SQS", ProviderType::Aws),
        ("google", ProviderType::Gcp),
    ] {
        let env = Environment::from_pairs([(CLOUD_PROVIDER, value)]);
        assert_eq!(env.provider_type().ok(), Some(expected), "alias {}", value);
    }
}

/// Verify that a lone secret key blocks AWS construction.
#[tokio::test]
async fn test_partial_credentials_block_construction() {
    init_tracing();
    let registry = ProviderRegistry::new(Environment::from_pairs([
        (CLOUD_PROVIDER, "aws"),
        (AWS_SECRET_ACCESS_KEY, "secret-without-id"),
    ]));

    let result = registry.get().await;

    assert!(matches!(
        result,
        Err(FactoryError::Configuration(
            ConfigurationError::PartialCredentials { .. }
        ))
    ));
    assert!(!registry.is_initialized());
}

/// Verify that the GCP validator warns about emulator use.
#[test]
fn test_gcp_emulator_warning() -> anyhow::Result<()> {
    let env = Environment::from_pairs([
        (GCP_PROJECT_ID, "p"),
        (PUBSUB_EMULATOR_HOST, "localhost:8085"),
        (GCE_METADATA_HOST, "127.0.0.1:1"),
    ]);

    let report = validate_environment(ProviderType::Gcp, &env)?;

    assert!(report.warnings.iter().any(|w| w.contains(PUBSUB_EMULATOR_HOST)));
    assert_eq!(report.resolved[GCP_PROJECT_ID], "p");
    Ok(())
}

/// Verify that a producer and a consumer task share one local backend.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_registry_between_tasks() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let registry = Arc::new(ProviderRegistry::new(local_environment(&dir)));

    let producer = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let provider = registry.get().await?;
            for n in 1..=3 {
                provider
                    .queue
                    .send("work", &order(n), &EnqueueOptions::new())
                    .await?;
            }
            anyhow::Ok(())
        })
    };

    let consumer = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let provider = registry.get().await?;
            let mut seen = Vec::new();
            while seen.len() < 3 {
                let batch = provider
                    .queue
                    .receive_as::<Order>("work", &ReceiveOptions::new().with_wait_time(5))
                    .await?;
                anyhow::ensure!(!batch.is_empty(), "timed out waiting for work");
                for message in batch {
                    if let Some(ref receipt) = message.receipt_handle {
                        provider.queue.ack("work", receipt).await?;
                    }
                    seen.push(message.body.order);
                }
            }
            anyhow::Ok(seen)
        })
    };

    producer.await??;
    let seen = consumer.await??;
    assert_eq!(seen, vec![1, 2, 3]);
    Ok(())
}
