//! Tests for provider construction and the registry.

use super::*;
use crate::environment::{
    AWS_ACCESS_KEY_ID, AWS_ENDPOINT_URL, AWS_SECRET_ACCESS_KEY, CLOUD_PROVIDER, DLQ_SUFFIX,
    GCP_PROJECT_ID, LOCAL_STORAGE_PATH, PUBSUB_EMULATOR_HOST, STORAGE_EMULATOR_HOST,
};
use crate::message::{EnqueueOptions, ReceiveOptions};
use crate::storage::UploadOptions;
use bytes::Bytes;
use tempfile::TempDir;

fn local_env(dir: &TempDir) -> Environment {
    Environment::from_pairs([
        (CLOUD_PROVIDER, "local"),
        (LOCAL_STORAGE_PATH, dir.path().to_str().unwrap()),
    ])
}

mod create {
    use super::*;

    /// Verify that the local backend is usable through the trait objects.
    #[tokio::test]
    async fn test_create_local_provider() {
        let dir = TempDir::new().unwrap();
        let provider = create_provider(ProviderType::Local, &local_env(&dir))
            .await
            .unwrap();

        assert_eq!(provider.provider_type, ProviderType::Local);
        assert_eq!(provider.queue.provider_type(), ProviderType::Local);
        assert_eq!(provider.storage.provider_type(), ProviderType::Local);

        provider
            .queue
            .enqueue("jobs", serde_json::json!({"n": 1}), &EnqueueOptions::new())
            .await
            .unwrap();
        let messages = provider
            .queue
            .receive("jobs", &ReceiveOptions::new())
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);

        provider
            .storage
            .upload("b", "k.txt", Bytes::from("x"), &UploadOptions::new())
            .await
            .unwrap();
        assert!(dir.path().join("b").join("k.txt").exists());
    }

    /// Verify that the dead-letter suffix reaches the queue.
    #[tokio::test]
    async fn test_dlq_suffix_applied() {
        let dir = TempDir::new().unwrap();
        let env = local_env(&dir).with(DLQ_SUFFIX, "_dead");
        let provider = create_provider(ProviderType::Local, &env).await.unwrap();

        assert_eq!(provider.queue.dlq_name("jobs"), "jobs_dead");
    }

    /// Verify that partial AWS credentials fail before anything is built.
    #[tokio::test]
    async fn test_partial_credentials_fail_fast() {
        let env = Environment::from_pairs([(AWS_ACCESS_KEY_ID, "AKIAEXAMPLE")]);

        let result = create_provider(ProviderType::Aws, &env).await;
        assert!(matches!(
            result,
            Err(FactoryError::Configuration(
                ConfigurationError::PartialCredentials { .. }
            ))
        ));
    }

    /// Verify that the AWS backend is built without any network access.
    #[cfg(feature = "aws")]
    #[tokio::test]
    async fn test_create_aws_provider() {
        let env = Environment::from_pairs([
            (AWS_ACCESS_KEY_ID, "AKIAEXAMPLE"),
            (AWS_SECRET_ACCESS_KEY, "secret"),
            (AWS_ENDPOINT_URL, "http://127.0.0.1:1"),
        ]);

        let provider = create_provider(ProviderType::Aws, &env).await.unwrap();
        assert_eq!(provider.provider_type, ProviderType::Aws);
        assert_eq!(provider.queue.dlq_name("orders.fifo"), "orders-dlq.fifo");
    }

    /// Verify that the GCP backend is built against emulators with an explicit project.
    #[cfg(feature = "gcp")]
    #[tokio::test]
    async fn test_create_gcp_provider() {
        let env = Environment::from_pairs([
            (GCP_PROJECT_ID, "local-project"),
            (PUBSUB_EMULATOR_HOST, "127.0.0.1:1"),
            (STORAGE_EMULATOR_HOST, "127.0.0.1:1"),
        ]);

        let provider = create_provider(ProviderType::Gcp, &env).await.unwrap();
        assert_eq!(provider.provider_type, ProviderType::Gcp);
        assert_eq!(provider.queue.provider_type(), ProviderType::Gcp);
    }

    /// Verify that an unreadable key file is an initialization error.
    #[cfg(feature = "gcp")]
    #[tokio::test]
    async fn test_gcp_missing_key_file() {
        let env = Environment::from_pairs([
            (GCP_PROJECT_ID, "p"),
            (
                crate::environment::GOOGLE_APPLICATION_CREDENTIALS,
                "/nonexistent/key.json",
            ),
        ]);

        assert!(matches!(
            create_provider(ProviderType::Gcp, &env).await,
            Err(FactoryError::Initialization { ref provider, .. }) if provider == "gcp"
        ));
    }
}

mod registry {
    use super::*;

    /// Verify that the provider is built once and then shared.
    #[tokio::test]
    async fn test_get_memoizes() {
        let dir = TempDir::new().unwrap();
        let registry = ProviderRegistry::new(local_env(&dir));
        assert!(!registry.is_initialized());

        let first = registry.get().await.unwrap();
        let second = registry.get().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.is_initialized());
    }

    /// Verify that concurrent first callers share one initialization.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_callers() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(ProviderRegistry::new(local_env(&dir)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get().await.unwrap() })
            })
            .collect();

        let mut providers = Vec::new();
        for handle in handles {
            providers.push(handle.await.unwrap());
        }
        assert!(providers.iter().all(|p| Arc::ptr_eq(p, &providers[0])));
    }

    /// Verify that an injected provider replaces the built one.
    #[tokio::test]
    async fn test_set_provider_overrides() {
        let registry = ProviderRegistry::new(Environment::default());
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(&LocalConfig::new(dir.path())).await.unwrap();
        let queue = Arc::new(LocalQueue::new());

        registry.set_provider(Provider::new(
            ProviderType::Local,
            Arc::new(storage),
            queue.clone(),
        ));
        let provider = registry.get().await.unwrap();
        provider
            .queue
            .enqueue("jobs", serde_json::json!(1), &EnqueueOptions::new())
            .await
            .unwrap();

        assert_eq!(queue.queue_depth("jobs"), 1);
    }

    /// Verify that reset forces a fresh provider.
    #[tokio::test]
    async fn test_reset_rebuilds() {
        let dir = TempDir::new().unwrap();
        let registry = ProviderRegistry::new(local_env(&dir));

        let first = registry.get().await.unwrap();
        registry.reset();
        assert!(!registry.is_initialized());
        let second = registry.get().await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
    }

    /// Verify that asking for a different type than the memoized one fails.
    #[tokio::test]
    async fn test_get_for_type_mismatch() {
        let dir = TempDir::new().unwrap();
        let registry = ProviderRegistry::new(local_env(&dir));
        registry.get_for(ProviderType::Local).await.unwrap();

        assert!(matches!(
            registry.get_for(ProviderType::Aws).await,
            Err(FactoryError::Configuration(ConfigurationError::Invalid { .. }))
        ));
    }

    /// Verify that a failed initialization is not memoized.
    #[tokio::test]
    async fn test_failed_init_retried() {
        let registry = ProviderRegistry::new(Environment::from_pairs([
            (CLOUD_PROVIDER, "aws"),
            (AWS_SECRET_ACCESS_KEY, "orphan"),
        ]));

        assert!(registry.get().await.is_err());
        assert!(!registry.is_initialized());
    }

    /// Verify that an unknown provider name is a configuration error.
    #[tokio::test]
    async fn test_unknown_provider() {
        let registry =
            ProviderRegistry::new(Environment::from_pairs([(CLOUD_PROVIDER, "azure")]));

        assert!(matches!(
            registry.get().await,
            Err(FactoryError::Configuration(
                ConfigurationError::UnknownProvider { .. }
            ))
        ));
    }
}
