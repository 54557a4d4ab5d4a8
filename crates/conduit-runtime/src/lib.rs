//! # Conduit Runtime
//!
//! Cloud-agnostic durable queues and object storage. Application code talks
//! to [`QueueProvider`] and [`StorageProvider`]; the backend is picked at
//! startup from the environment.
//!
//! Backends:
//! - `local` - in-memory queue and filesystem storage, always compiled
//! - `aws` - SQS and S3 (feature `aws`)
//! - `gcp` - Pub/Sub and Cloud Storage (feature `gcp`)
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for queue, storage and construction failures
//! - [`message`] - Messages, receipt handles and enqueue/receive options
//! - [`client`] - The queue contract and typed extension methods
//! - [`storage`] - The object storage contract and key validation
//! - [`provider`] - Backend selection and per-backend configuration
//! - [`environment`] - Environment snapshot and validation
//! - [`factory`] - Provider construction and the memoized registry
//! - [`providers`] - Backend implementations
//!
//! ```no_run
//! use conduit_runtime::{EnqueueOptions, ProviderRegistry, QueueClientExt};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = ProviderRegistry::global().get().await?;
//! provider
//!     .queue
//!     .send("jobs", &serde_json::json!({"task": "resize"}), &EnqueueOptions::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod environment;
pub mod error;
pub mod factory;
pub mod message;
pub mod provider;
pub mod providers;
pub mod storage;

pub use client::{QueueClientExt, QueueProvider};
pub use environment::{validate_environment, Environment, ValidationReport};
pub use error::{
    ConfigurationError, FactoryError, QueueError, SerializationError, StorageError,
    ValidationError,
};
pub use factory::{create_from_config, create_provider, Provider, ProviderRegistry};
pub use message::{
    EnqueueOptions, MessageId, Priority, QueueMessage, ReceiptHandle, ReceiveOptions, Timestamp,
};
pub use provider::{AwsConfig, BucketNaming, GcpConfig, LocalConfig, ProviderConfig, ProviderType};
pub use storage::{
    DownloadedObject, SignedUrlAction, SignedUrlOptions, StorageProvider, UploadOptions,
};
