//! Backend implementations of the queue and storage contracts.
//!
//! The local providers are always compiled. The AWS and GCP adapters sit
//! behind the `aws` and `gcp` Cargo features.

pub mod local_queue;
pub mod local_storage;

#[cfg(feature = "aws")]
pub mod aws;

#[cfg(feature = "gcp")]
pub mod gcp;

pub use local_queue::LocalQueue;
pub use local_storage::{LocalStorage, VerifiedUrl};

#[cfg(feature = "aws")]
pub use aws::{AwsError, S3Storage, SqsQueue};

#[cfg(feature = "gcp")]
pub use gcp::{GcpError, GcsStorage, PubSubQueue};
