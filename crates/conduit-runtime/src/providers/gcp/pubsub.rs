//! Pub/Sub queue adapter (REST API).
//!
//! A queue name maps to a topic for publishing and a subscription of the
//! same name for pulling. Receipt handles are Pub/Sub ack ids.

use super::auth::TokenProvider;
use super::{host_base_url, send_request, GcpError};
use crate::client::QueueProvider;
use crate::error::{QueueError, SerializationError};
use crate::message::{
    dead_letter_attributes, validate_queue_name, EnqueueOptions, MessageId, QueueMessage,
    ReceiptHandle, ReceiveOptions, Timestamp, ATTR_GROUP_ID, ATTR_SCHEDULED_TIME,
};
use crate::provider::{GcpConfig, ProviderType};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

#[cfg(test)]
#[path = "pubsub_tests.rs"]
mod tests;

const PUBSUB_BASE_URL: &str = "https://pubsub.googleapis.com";

/// Longest ack deadline Pub/Sub accepts
pub const MAX_ACK_DEADLINE_SECONDS: u32 = 600;

/// Pub/Sub implementation of [`QueueProvider`]
#[derive(Clone)]
pub struct PubSubQueue {
    http: reqwest::Client,
    /// `None` when talking to an emulator
    tokens: Option<Arc<TokenProvider>>,
    base_url: String,
    project_id: String,
    dlq_suffix: String,
    honor_scheduled_time: bool,
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest<'a> {
    messages: [OutgoingMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingMessage<'a> {
    data: String,
    attributes: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ordering_key: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: u32,
    return_immediately: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
    #[serde(default)]
    delivery_attempt: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    message_id: String,
    #[serde(default)]
    publish_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: &'a [&'a str],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: &'a [&'a str],
    ack_deadline_seconds: u32,
}

impl ReceivedMessage {
    /// Time before which the message must not be processed, if still pending
    fn deferred_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.message
            .attributes
            .get(ATTR_SCHEDULED_TIME)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .filter(|t| *t > now)
    }

    fn into_queue_message(self) -> Result<QueueMessage, QueueError> {
        let bytes = STANDARD
            .decode(self.message.data.as_bytes())
            .map_err(SerializationError::from)?;
        let text = String::from_utf8(bytes).map_err(|_| SerializationError::InvalidUtf8)?;
        let body = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => {
                tracing::debug!(message_id = %self.message.message_id, "Non-JSON Pub/Sub data kept as string");
                serde_json::Value::String(text)
            }
        };

        Ok(QueueMessage {
            id: self.message.message_id.parse()?,
            body,
            receipt_handle: Some(ReceiptHandle::new(self.ack_id)),
            attributes: self.message.attributes,
            enqueued_at: self
                .message
                .publish_time
                .map(Timestamp::from_datetime)
                .unwrap_or_else(Timestamp::now),
            retry_count: self.delivery_attempt.map(|a| a.saturating_sub(1)).unwrap_or(0),
        })
    }
}

// ============================================================================
// Adapter
// ============================================================================

impl PubSubQueue {
    pub fn new(
        config: &GcpConfig,
        http: reqwest::Client,
        tokens: Arc<TokenProvider>,
        project_id: &str,
    ) -> Self {
        let (base_url, tokens) = match config.pubsub_emulator_host {
            Some(ref host) => (host_base_url(host), None),
            None => (PUBSUB_BASE_URL.to_string(), Some(tokens)),
        };

        Self {
            http,
            tokens,
            base_url,
            project_id: project_id.to_string(),
            dlq_suffix: config.dlq_suffix.clone(),
            honor_scheduled_time: config.honor_scheduled_time,
        }
    }

    fn topic_url(&self, topic: &str, verb: &str) -> String {
        format!(
            "{}/v1/projects/{}/topics/{}:{}",
            self.base_url, self.project_id, topic, verb
        )
    }

    fn subscription_url(&self, subscription: &str, verb: &str) -> String {
        format!(
            "{}/v1/projects/{}/subscriptions/{}:{}",
            self.base_url, self.project_id, subscription, verb
        )
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        url: String,
        body: &B,
    ) -> Result<bytes::Bytes, GcpError> {
        let mut request = self.http.post(url).json(body);
        if let Some(ref tokens) = self.tokens {
            let token = tokens.access_token().await?;
            request = request.bearer_auth(token.as_str());
        }
        send_request(request).await
    }

    async fn publish(
        &self,
        topic: &str,
        body: &serde_json::Value,
        attributes: &HashMap<String, String>,
        ordering_key: Option<&str>,
    ) -> Result<MessageId, GcpError> {
        let text =
            serde_json::to_string(body).map_err(|e| GcpError::SerializationError(e.to_string()))?;
        let max_size = ProviderType::Gcp.max_message_size();
        if text.len() > max_size {
            return Err(GcpError::MessageTooLarge {
                size: text.len(),
                max_size,
            });
        }

        let request = PublishRequest {
            messages: [OutgoingMessage {
                data: STANDARD.encode(text.as_bytes()),
                attributes,
                ordering_key,
            }],
        };
        let response = self.post(self.topic_url(topic, "publish"), &request).await?;
        let response: PublishResponse = serde_json::from_slice(&response)
            .map_err(|e| GcpError::SerializationError(e.to_string()))?;

        response
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| GcpError::SerializationError("publish returned no message id".into()))?
            .parse()
            .map_err(|e: crate::error::ValidationError| GcpError::SerializationError(e.to_string()))
    }

    async fn pull(
        &self,
        subscription: &str,
        max_messages: u32,
        return_immediately: bool,
    ) -> Result<PullResponse, GcpError> {
        let request = PullRequest {
            max_messages,
            return_immediately,
        };
        let response = self
            .post(self.subscription_url(subscription, "pull"), &request)
            .await?;
        serde_json::from_slice(&response).map_err(|e| GcpError::SerializationError(e.to_string()))
    }

    /// Long-poll pull bounded by `budget`
    ///
    /// The request runs on its own task. A response that arrives after the
    /// budget, or after the caller went away, has its messages released with
    /// a zero ack deadline so they are redelivered at once.
    async fn pull_within(
        &self,
        subscription: &str,
        max_messages: u32,
        budget: std::time::Duration,
    ) -> Result<PullResponse, GcpError> {
        let (tx, mut rx) = oneshot::channel();
        let queue = self.clone();
        let owned_subscription = subscription.to_string();
        tokio::spawn(async move {
            let pulled = queue.pull(&owned_subscription, max_messages, false).await;
            if let Err(Ok(late)) = tx.send(pulled) {
                queue.release(&owned_subscription, late).await;
            }
        });

        match tokio::time::timeout(budget, &mut rx).await {
            Ok(Ok(pulled)) => pulled,
            Ok(Err(_)) => Err(GcpError::NetworkError(
                "pull task ended without a response".to_string(),
            )),
            Err(_) => {
                rx.close();
                // A response that landed between the timeout and the close is still ours.
                match rx.try_recv() {
                    Ok(pulled) => pulled,
                    Err(_) => Ok(PullResponse::default()),
                }
            }
        }
    }

    /// Make every message in a late pull response immediately redeliverable
    async fn release(&self, subscription: &str, late: PullResponse) {
        let ack_ids: Vec<&str> = late
            .received_messages
            .iter()
            .map(|m| m.ack_id.as_str())
            .collect();
        if ack_ids.is_empty() {
            return;
        }
        match self.modify_ack_deadline(subscription, &ack_ids, 0).await {
            Ok(()) => tracing::debug!(
                queue = %subscription,
                count = ack_ids.len(),
                "Released messages from a pull that outlived its wait budget"
            ),
            Err(e) => tracing::warn!(
                queue = %subscription,
                error = %e,
                "Failed to release messages from a late pull"
            ),
        }
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: &[&str]) -> Result<(), GcpError> {
        self.post(
            self.subscription_url(subscription, "acknowledge"),
            &AcknowledgeRequest { ack_ids },
        )
        .await
        .map(|_| ())
        .map_err(|e| as_ack_error(e, ack_ids))
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[&str],
        seconds: u32,
    ) -> Result<(), GcpError> {
        self.post(
            self.subscription_url(subscription, "modifyAckDeadline"),
            &ModifyAckDeadlineRequest {
                ack_ids,
                ack_deadline_seconds: seconds.min(MAX_ACK_DEADLINE_SECONDS),
            },
        )
        .await
        .map(|_| ())
        .map_err(|e| as_ack_error(e, ack_ids))
    }

    /// Push deferred messages back until their scheduled time
    async fn defer(
        &self,
        queue_name: &str,
        deferred: Vec<(String, DateTime<Utc>)>,
        now: DateTime<Utc>,
    ) {
        for (ack_id, due) in deferred {
            let remaining = (due - now).num_seconds().max(1);
            let seconds = u32::try_from(remaining).unwrap_or(MAX_ACK_DEADLINE_SECONDS);
            if let Err(e) = self
                .modify_ack_deadline(queue_name, &[ack_id.as_str()], seconds)
                .await
            {
                // The message still comes back once its current deadline lapses.
                tracing::warn!(queue = %queue_name, error = %e, "Failed to defer scheduled message");
            }
        }
    }
}

/// A 400 that names the ack id means the receipt is stale or malformed
fn as_ack_error(error: GcpError, ack_ids: &[&str]) -> GcpError {
    match error {
        GcpError::ApiError { code: 400, ref message, .. }
            if message.to_ascii_lowercase().contains("ack") =>
        {
            GcpError::InvalidAckId(ack_ids.join(","))
        }
        other => other,
    }
}

#[async_trait]
impl QueueProvider for PubSubQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        body: serde_json::Value,
        options: &EnqueueOptions,
    ) -> Result<MessageId, QueueError> {
        validate_queue_name(queue_name)?;

        let mut attributes = options.hint_attributes();
        if let Some(delay) = options.effective_delay() {
            let due = Utc::now() + Duration::seconds(i64::from(delay));
            attributes.insert(
                ATTR_SCHEDULED_TIME.to_string(),
                Timestamp::from_datetime(due).to_rfc3339(),
            );
        }

        let id = self
            .publish(queue_name, &body, &attributes, options.group_id.as_deref())
            .await
            .map_err(|e| e.to_queue_error(queue_name))?;

        tracing::debug!(
            queue = %queue_name,
            message_id = %id,
            delay_seconds = options.effective_delay().unwrap_or(0),
            "Message published to Pub/Sub"
        );
        Ok(id)
    }

    async fn receive(
        &self,
        queue_name: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        validate_queue_name(queue_name)?;
        let max_messages = options.max_messages();
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let wait = options.wait_time();
        let pulled = if wait == 0 {
            self.pull(queue_name, max_messages, true).await
        } else {
            let budget = std::time::Duration::from_secs(u64::from(wait));
            self.pull_within(queue_name, max_messages, budget).await
        };
        let pulled = pulled.map_err(|e| e.to_queue_error(queue_name))?;

        let now = Utc::now();
        let mut ready = Vec::new();
        let mut deferred = Vec::new();
        for received in pulled.received_messages {
            match received.deferred_until(now) {
                Some(due) if self.honor_scheduled_time => {
                    deferred.push((received.ack_id, due));
                }
                _ => ready.push(received),
            }
        }
        if !deferred.is_empty() {
            tracing::debug!(queue = %queue_name, count = deferred.len(), "Deferring scheduled Pub/Sub messages");
            self.defer(queue_name, deferred, now).await;
        }

        if let Some(timeout) = options.visibility_timeout_seconds {
            let ack_ids: Vec<&str> = ready.iter().map(|m| m.ack_id.as_str()).collect();
            if !ack_ids.is_empty() {
                self.modify_ack_deadline(queue_name, &ack_ids, timeout)
                    .await
                    .map_err(|e| e.to_queue_error(queue_name))?;
            }
        }

        let messages = ready
            .into_iter()
            .map(ReceivedMessage::into_queue_message)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(queue = %queue_name, count = messages.len(), "Pulled Pub/Sub messages");
        Ok(messages)
    }

    async fn ack(&self, queue_name: &str, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        validate_queue_name(queue_name)?;
        self.acknowledge(queue_name, &[receipt.as_str()])
            .await
            .map_err(|e| e.to_queue_error(queue_name))?;
        tracing::debug!(queue = %queue_name, "Message acknowledged on Pub/Sub");
        Ok(())
    }

    async fn nack(
        &self,
        queue_name: &str,
        receipt: &ReceiptHandle,
        delay_seconds: Option<u32>,
    ) -> Result<(), QueueError> {
        validate_queue_name(queue_name)?;
        let deadline = delay_seconds.unwrap_or(0).min(MAX_ACK_DEADLINE_SECONDS);
        self.modify_ack_deadline(queue_name, &[receipt.as_str()], deadline)
            .await
            .map_err(|e| e.to_queue_error(queue_name))?;
        tracing::debug!(queue = %queue_name, ack_deadline = deadline, "Message returned to Pub/Sub");
        Ok(())
    }

    async fn move_to_dlq(
        &self,
        queue_name: &str,
        message: &QueueMessage,
    ) -> Result<(), QueueError> {
        validate_queue_name(queue_name)?;
        let dlq = self.dlq_name(queue_name);
        let attributes = dead_letter_attributes(queue_name, message, Timestamp::now());

        let dlq_id = self
            .publish(
                &dlq,
                &message.body,
                &attributes,
                message.attributes.get(ATTR_GROUP_ID).map(String::as_str),
            )
            .await
            .map_err(|e| e.to_queue_error(&dlq))?;

        if let Some(ref receipt) = message.receipt_handle {
            self.acknowledge(queue_name, &[receipt.as_str()])
                .await
                .map_err(|e| e.to_queue_error(queue_name))?;
        }

        tracing::info!(
            queue = %queue_name,
            dlq = %dlq,
            message_id = %message.id,
            dlq_message_id = %dlq_id,
            "Message moved to dead-letter queue"
        );
        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Gcp
    }

    fn dlq_suffix(&self) -> &str {
        &self.dlq_suffix
    }
}
