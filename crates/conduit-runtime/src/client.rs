//! Queue contract implemented by every backend.

use crate::error::{QueueError, SerializationError};
use crate::message::{EnqueueOptions, MessageId, QueueMessage, ReceiptHandle, ReceiveOptions};
use crate::provider::ProviderType;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Interface implemented by specific queue backends (local, AWS, GCP)
///
/// Bodies cross this boundary as JSON values so the trait stays object safe;
/// [`QueueClientExt`] adds typed wrappers.
///
/// Delivery is at-least-once. A receipt handle is consumed by exactly one of
/// `ack`, `nack` or `move_to_dlq`. The local backend rejects a second terminal
/// call with [`QueueError::MessageState`]; managed backends may accept it
/// silently.
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Store a message; never waits for a consumer
    async fn enqueue(
        &self,
        queue_name: &str,
        body: serde_json::Value,
        options: &EnqueueOptions,
    ) -> Result<MessageId, QueueError>;

    /// Receive up to `max_messages`, long-polling for `wait_time_seconds` when empty
    async fn receive(
        &self,
        queue_name: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Permanently remove an in-flight message
    async fn ack(&self, queue_name: &str, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Return an in-flight message for redelivery after `delay_seconds`
    async fn nack(
        &self,
        queue_name: &str,
        receipt: &ReceiptHandle,
        delay_seconds: Option<u32>,
    ) -> Result<(), QueueError>;

    /// Publish to the dead-letter queue, then delete the original if it has a receipt
    async fn move_to_dlq(&self, queue_name: &str, message: &QueueMessage)
        -> Result<(), QueueError>;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;

    /// Suffix appended to a queue name to form its dead-letter queue
    fn dlq_suffix(&self) -> &str;

    /// Dead-letter queue name for `queue_name`
    fn dlq_name(&self, queue_name: &str) -> String {
        format!("{}{}", queue_name, self.dlq_suffix())
    }
}

/// Typed convenience methods over any [`QueueProvider`]
#[async_trait]
pub trait QueueClientExt: QueueProvider {
    /// Serialize `body` and enqueue it
    async fn send<T>(
        &self,
        queue_name: &str,
        body: &T,
        options: &EnqueueOptions,
    ) -> Result<MessageId, QueueError>
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(body).map_err(SerializationError::from)?;
        self.enqueue(queue_name, value, options).await
    }

    /// Receive and deserialize every message body into `T`
    ///
    /// Fails on the first body that does not match `T`; the already received
    /// messages stay in flight until their visibility lapses.
    async fn receive_as<T>(
        &self,
        queue_name: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<QueueMessage<T>>, QueueError>
    where
        T: DeserializeOwned + Send,
    {
        let messages = self.receive(queue_name, options).await?;
        messages
            .into_iter()
            .map(|m| m.decode::<T>().map_err(QueueError::from))
            .collect()
    }

    /// Dead-letter a typed message
    async fn dead_letter<T>(
        &self,
        queue_name: &str,
        message: &QueueMessage<T>,
    ) -> Result<(), QueueError>
    where
        T: Serialize + Sync,
    {
        let encoded = message.encode()?;
        self.move_to_dlq(queue_name, &encoded).await
    }
}

impl<Q: QueueProvider + ?Sized> QueueClientExt for Q {}
