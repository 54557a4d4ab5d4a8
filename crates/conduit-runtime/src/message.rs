//! Message types for queue operations including core domain identifiers.

use crate::error::{SerializationError, ValidationError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

// ============================================================================
// Wire Attribute Names
// ============================================================================

/// Priority hint set on enqueue
pub const ATTR_PRIORITY: &str = "priority";
/// Ordering key hint set on enqueue
pub const ATTR_GROUP_ID: &str = "groupId";
/// Duplicate-suppression hint set on enqueue
pub const ATTR_DEDUPLICATION_ID: &str = "deduplicationId";
/// Earliest processing time for backends without native delay
pub const ATTR_SCHEDULED_TIME: &str = "scheduledTime";
/// Logical queue a dead-lettered message came from
pub const ATTR_ORIGINAL_QUEUE: &str = "originalQueue";
/// Id of the delivery that was dead-lettered
pub const ATTR_ORIGINAL_MESSAGE_ID: &str = "originalMessageId";
/// Escalation timestamp (RFC 3339)
pub const ATTR_FAILED_AT: &str = "failedAt";
/// Retry count at escalation time
pub const ATTR_RETRY_COUNT: &str = "retryCount";
/// Prefix for copies of the original attributes on a dead-lettered message
pub const ORIGINAL_ATTRIBUTE_PREFIX: &str = "original_";

/// Default dead-letter queue suffix
pub const DEFAULT_DLQ_SUFFIX: &str = "-dlq";

/// Default batch size for `receive`
pub const DEFAULT_MAX_MESSAGES: u32 = 10;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validate a logical queue name
///
/// Names must be 1-255 characters of ASCII alphanumerics, hyphens,
/// underscores or dots. Every backend accepts this set.
pub fn validate_queue_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > 255 {
        return Err(ValidationError::OutOfRange {
            field: "queue_name".to_string(),
            message: "must be 1-255 characters".to_string(),
        });
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ValidationError::InvalidFormat {
            field: "queue_name".to_string(),
            message: "only ASCII alphanumeric, hyphens, underscores and dots allowed".to_string(),
        });
    }

    Ok(())
}

/// Backend-assigned identifier of a message delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque token for acknowledging or rejecting a received message
///
/// Only valid while the delivery is in flight. Exactly one of `ack`, `nack`
/// or `move_to_dlq` may consume it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    /// Wrap a backend receipt token
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Get handle string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Create timestamp from milliseconds since the Unix epoch
    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::<Utc>::from_timestamp_millis(millis).map(Self)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// RFC 3339 representation with millisecond precision
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// Delivery priority hint
///
/// Only the local provider acts on it (head insertion for `High`); managed
/// backends carry it as the `priority` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(ValidationError::InvalidFormat {
                field: "priority".to_string(),
                message: format!("'{}' is not one of high, normal, low", s),
            }),
        }
    }
}

/// A message received from a queue
///
/// `T` defaults to `serde_json::Value`, the form in which bodies cross the
/// provider trait boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage<T = serde_json::Value> {
    pub id: MessageId,
    pub body: T,
    pub receipt_handle: Option<ReceiptHandle>,
    pub attributes: HashMap<String, String>,
    pub enqueued_at: Timestamp,
    pub retry_count: u32,
}

impl<T> QueueMessage<T> {
    /// Replace the body, keeping delivery metadata
    pub fn map_body<U>(self, f: impl FnOnce(T) -> U) -> QueueMessage<U> {
        QueueMessage {
            id: self.id,
            body: f(self.body),
            receipt_handle: self.receipt_handle,
            attributes: self.attributes,
            enqueued_at: self.enqueued_at,
            retry_count: self.retry_count,
        }
    }

    /// Priority attribute, if present and recognised
    pub fn priority(&self) -> Option<Priority> {
        self.attributes
            .get(ATTR_PRIORITY)
            .and_then(|p| p.parse().ok())
    }
}

impl QueueMessage<serde_json::Value> {
    /// Deserialize the JSON body into `T`
    pub fn decode<T: DeserializeOwned>(self) -> Result<QueueMessage<T>, SerializationError> {
        let QueueMessage {
            id,
            body,
            receipt_handle,
            attributes,
            enqueued_at,
            retry_count,
        } = self;
        let body = serde_json::from_value(body)?;
        Ok(QueueMessage {
            id,
            body,
            receipt_handle,
            attributes,
            enqueued_at,
            retry_count,
        })
    }
}

impl<T: Serialize> QueueMessage<T> {
    /// Serialize the body back into JSON form
    pub fn encode(&self) -> Result<QueueMessage<serde_json::Value>, SerializationError> {
        Ok(QueueMessage {
            id: self.id.clone(),
            body: serde_json::to_value(&self.body)?,
            receipt_handle: self.receipt_handle.clone(),
            attributes: self.attributes.clone(),
            enqueued_at: self.enqueued_at,
            retry_count: self.retry_count,
        })
    }
}

/// Build the attribute set carried by a dead-lettered message
///
/// All backends use this so the dead-letter contract is identical everywhere.
pub fn dead_letter_attributes<T>(
    origin_queue: &str,
    message: &QueueMessage<T>,
    failed_at: Timestamp,
) -> HashMap<String, String> {
    let mut attributes: HashMap<String, String> = message
        .attributes
        .iter()
        .map(|(k, v)| (format!("{}{}", ORIGINAL_ATTRIBUTE_PREFIX, k), v.clone()))
        .collect();

    attributes.insert(ATTR_ORIGINAL_QUEUE.to_string(), origin_queue.to_string());
    attributes.insert(
        ATTR_ORIGINAL_MESSAGE_ID.to_string(),
        message.id.as_str().to_string(),
    );
    attributes.insert(ATTR_FAILED_AT.to_string(), failed_at.to_rfc3339());
    attributes.insert(ATTR_RETRY_COUNT.to_string(), message.retry_count.to_string());
    attributes
}

// ============================================================================
// Enqueue and Receive Options
// ============================================================================

/// Options for `enqueue`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Seconds before the message becomes visible
    pub delay_seconds: Option<u32>,
    /// Priority hint
    pub priority: Option<Priority>,
    /// Duplicate-suppression id (FIFO-capable backends only)
    pub deduplication_id: Option<String>,
    /// Ordering key (FIFO-capable backends only)
    pub group_id: Option<String>,
    /// Extra attributes carried verbatim
    pub attributes: HashMap<String, String>,
}

impl EnqueueOptions {
    /// Create new enqueue options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay visibility by the given number of seconds
    pub fn with_delay_seconds(mut self, seconds: u32) -> Self {
        self.delay_seconds = Some(seconds);
        self
    }

    /// Set priority hint
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set deduplication id
    pub fn with_deduplication_id(mut self, id: impl Into<String>) -> Self {
        self.deduplication_id = Some(id.into());
        self
    }

    /// Set FIFO group id
    pub fn with_group_id(mut self, id: impl Into<String>) -> Self {
        self.group_id = Some(id.into());
        self
    }

    /// Add a custom attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Effective delay, treating `Some(0)` as no delay
    pub fn effective_delay(&self) -> Option<u32> {
        self.delay_seconds.filter(|d| *d > 0)
    }

    /// Caller attributes plus the hint attributes every backend records
    pub(crate) fn hint_attributes(&self) -> HashMap<String, String> {
        let mut attributes = self.attributes.clone();
        if let Some(priority) = self.priority {
            attributes.insert(ATTR_PRIORITY.to_string(), priority.as_str().to_string());
        }
        if let Some(ref group_id) = self.group_id {
            attributes.insert(ATTR_GROUP_ID.to_string(), group_id.clone());
        }
        if let Some(ref dedup_id) = self.deduplication_id {
            attributes.insert(ATTR_DEDUPLICATION_ID.to_string(), dedup_id.clone());
        }
        attributes
    }
}

/// Options for `receive`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Maximum number of messages to return (default 10)
    pub max_messages: Option<u32>,
    /// In-flight window for the returned messages
    pub visibility_timeout_seconds: Option<u32>,
    /// Long-poll budget when the queue is empty
    pub wait_time_seconds: Option<u32>,
}

impl ReceiveOptions {
    /// Create new receive options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum number of messages to receive
    pub fn with_max_messages(mut self, max: u32) -> Self {
        self.max_messages = Some(max);
        self
    }

    /// Set visibility timeout
    pub fn with_visibility_timeout(mut self, seconds: u32) -> Self {
        self.visibility_timeout_seconds = Some(seconds);
        self
    }

    /// Set long-poll wait time
    pub fn with_wait_time(mut self, seconds: u32) -> Self {
        self.wait_time_seconds = Some(seconds);
        self
    }

    /// Resolved batch size
    pub fn max_messages(&self) -> u32 {
        self.max_messages.unwrap_or(DEFAULT_MAX_MESSAGES)
    }

    /// Resolved wait budget in seconds
    pub fn wait_time(&self) -> u32 {
        self.wait_time_seconds.unwrap_or(0)
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
