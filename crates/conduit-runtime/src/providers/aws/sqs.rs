//! SQS queue adapter (query protocol).

use super::credentials::CredentialProvider;
use super::signer::{payload_hash, SigV4Signer};
use super::{parse_error_response, xml_text, AwsError};
use crate::client::QueueProvider;
use crate::error::{QueueError, SerializationError};
use crate::message::{
    dead_letter_attributes, validate_queue_name, EnqueueOptions, MessageId, QueueMessage,
    ReceiptHandle, ReceiveOptions, Timestamp, ATTR_GROUP_ID,
};
use crate::provider::{AwsConfig, ProviderType};
use async_trait::async_trait;
use chrono::Utc;
use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;

const API_VERSION: &str = "2012-11-05";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// SQS returns at most 10 messages per call
pub const MAX_RECEIVE_MESSAGES: u32 = 10;
/// Longest long-poll SQS supports
pub const MAX_WAIT_SECONDS: u32 = 20;
/// Longest per-message delay SQS supports
pub const MAX_DELAY_SECONDS: u32 = 900;
/// Longest visibility timeout SQS supports (12 hours)
pub const MAX_VISIBILITY_TIMEOUT_SECONDS: u32 = 43_200;
/// SQS message attribute limit
pub const MAX_NATIVE_ATTRIBUTES: usize = 10;
/// Attribute holding a JSON object of attributes beyond the native limit
pub const OVERFLOW_ATTRIBUTE: &str = "conduitAttributes";
/// Group id used for FIFO queues when the caller supplies none
pub const DEFAULT_MESSAGE_GROUP: &str = "default";

/// Check whether a queue name denotes a FIFO queue
pub fn is_fifo(queue_name: &str) -> bool {
    queue_name.ends_with(".fifo")
}

/// SQS implementation of [`QueueProvider`]
pub struct SqsQueue {
    http: reqwest::Client,
    credentials: Arc<CredentialProvider>,
    signer: SigV4Signer,
    endpoint: Url,
    queue_prefix: String,
    dlq_suffix: String,
    queue_urls: RwLock<HashMap<String, String>>,
}

impl SqsQueue {
    pub fn new(
        config: &AwsConfig,
        http: reqwest::Client,
        credentials: Arc<CredentialProvider>,
    ) -> Result<Self, AwsError> {
        let endpoint = match config.endpoint_url {
            Some(ref url) => url.clone(),
            None => format!("https://sqs.{}.amazonaws.com/", config.region),
        };
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| AwsError::ConfigurationError(format!("SQS endpoint '{}': {}", endpoint, e)))?;

        Ok(Self {
            http,
            credentials,
            signer: SigV4Signer::new(&config.region, "sqs"),
            endpoint,
            queue_prefix: config.queue_prefix.clone(),
            dlq_suffix: config.dlq_suffix.clone(),
            queue_urls: RwLock::new(HashMap::new()),
        })
    }

    /// Backend queue name including the configured prefix
    fn physical_name(&self, queue_name: &str) -> String {
        format!("{}{}", self.queue_prefix, queue_name)
    }

    /// Send one signed query-protocol request and return the response body
    async fn call(
        &self,
        action: &str,
        params: &[(String, String)],
        subject: &str,
    ) -> Result<String, AwsError> {
        let body = encode_form(action, params);
        let credentials = self.credentials.credentials().await?;
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), FORM_CONTENT_TYPE.to_string());
        let signed = self.signer.sign_headers(
            &credentials,
            "POST",
            &self.endpoint,
            &headers,
            &payload_hash(body.as_bytes()),
            &Utc::now(),
        );

        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header("content-type", FORM_CONTENT_TYPE)
            .body(body);
        for (name, value) in &signed {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let error = parse_error_response(status.as_u16(), &text, subject);
            tracing::debug!(action, status = status.as_u16(), error = %error, "SQS request failed");
            return Err(error);
        }
        Ok(text)
    }

    /// Resolve a logical queue name to its URL, caching the result
    async fn queue_url(&self, queue_name: &str) -> Result<String, AwsError> {
        {
            let cache = self.queue_urls.read().await;
            if let Some(url) = cache.get(queue_name) {
                return Ok(url.clone());
            }
        }

        let params = vec![("QueueName".to_string(), self.physical_name(queue_name))];
        let xml = self.call("GetQueueUrl", &params, queue_name).await?;
        let url = xml_text(&xml, "QueueUrl")?.ok_or_else(|| {
            AwsError::SerializationError("GetQueueUrl response has no QueueUrl".to_string())
        })?;

        tracing::debug!(queue = %queue_name, queue_url = %url, "Resolved SQS queue URL");
        self.queue_urls
            .write()
            .await
            .insert(queue_name.to_string(), url.clone());
        Ok(url)
    }

    /// Call an action against a queue, dropping a stale cached URL on not-found
    async fn queue_call(
        &self,
        queue_name: &str,
        action: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<String, AwsError> {
        let url = self.queue_url(queue_name).await?;
        params.insert(0, ("QueueUrl".to_string(), url));

        let result = self.call(action, &params, queue_name).await;
        if let Err(AwsError::QueueNotFound(_)) = result {
            self.queue_urls.write().await.remove(queue_name);
        }
        result
    }

    async fn send_message(
        &self,
        queue_name: &str,
        body: String,
        attributes: &HashMap<String, String>,
        group_id: Option<&str>,
        deduplication_id: Option<&str>,
        delay_seconds: Option<u32>,
    ) -> Result<MessageId, AwsError> {
        let max_size = ProviderType::Aws.max_message_size();
        let size = message_size(&body, attributes);
        if size > max_size {
            return Err(AwsError::MessageTooLarge { size, max_size });
        }

        let mut params = Vec::new();
        if is_fifo(queue_name) {
            params.push((
                "MessageGroupId".to_string(),
                group_id.unwrap_or(DEFAULT_MESSAGE_GROUP).to_string(),
            ));
            // Content-based deduplication when the caller supplies no id.
            let dedup = match deduplication_id {
                Some(id) => id.to_string(),
                None => hex::encode(Sha256::digest(body.as_bytes())),
            };
            params.push(("MessageDeduplicationId".to_string(), dedup));
            if delay_seconds.is_some() {
                tracing::debug!(queue = %queue_name, "FIFO queues ignore per-message delay");
            }
        } else if let Some(delay) = delay_seconds {
            params.push((
                "DelaySeconds".to_string(),
                delay.min(MAX_DELAY_SECONDS).to_string(),
            ));
        }
        params.extend(encode_attributes(attributes)?);
        params.insert(0, ("MessageBody".to_string(), body));

        let xml = self.queue_call(queue_name, "SendMessage", params).await?;
        let id = xml_text(&xml, "MessageId")?.ok_or_else(|| {
            AwsError::SerializationError("SendMessage response has no MessageId".to_string())
        })?;
        id.parse()
            .map_err(|e: crate::error::ValidationError| AwsError::SerializationError(e.to_string()))
    }

    async fn delete_message(
        &self,
        queue_name: &str,
        receipt: &ReceiptHandle,
    ) -> Result<(), AwsError> {
        let params = vec![(
            "ReceiptHandle".to_string(),
            receipt.as_str().to_string(),
        )];
        self.queue_call(queue_name, "DeleteMessage", params)
            .await
            .map(|_| ())
            .map_err(|e| with_receipt(e, receipt))
    }
}

#[async_trait]
impl QueueProvider for SqsQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        body: serde_json::Value,
        options: &EnqueueOptions,
    ) -> Result<MessageId, QueueError> {
        validate_queue_name(queue_name)?;
        let text = serde_json::to_string(&body).map_err(SerializationError::from)?;

        let id = self
            .send_message(
                queue_name,
                text,
                &options.hint_attributes(),
                options.group_id.as_deref(),
                options.deduplication_id.as_deref(),
                options.effective_delay(),
            )
            .await
            .map_err(AwsError::to_queue_error)?;

        tracing::debug!(
            queue = %queue_name,
            message_id = %id,
            delay_seconds = options.effective_delay().unwrap_or(0),
            "Message sent to SQS"
        );
        Ok(id)
    }

    async fn receive(
        &self,
        queue_name: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        validate_queue_name(queue_name)?;
        let max_messages = options.max_messages().min(MAX_RECEIVE_MESSAGES);
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let mut params = vec![
            ("MaxNumberOfMessages".to_string(), max_messages.to_string()),
            (
                "WaitTimeSeconds".to_string(),
                options.wait_time().min(MAX_WAIT_SECONDS).to_string(),
            ),
            ("AttributeName.1".to_string(), "All".to_string()),
            ("MessageAttributeName.1".to_string(), "All".to_string()),
        ];
        if let Some(timeout) = options.visibility_timeout_seconds {
            params.push((
                "VisibilityTimeout".to_string(),
                timeout.min(MAX_VISIBILITY_TIMEOUT_SECONDS).to_string(),
            ));
        }

        let xml = self
            .queue_call(queue_name, "ReceiveMessage", params)
            .await
            .map_err(AwsError::to_queue_error)?;
        let raw = parse_receive_response(&xml).map_err(AwsError::to_queue_error)?;

        let messages = raw
            .into_iter()
            .map(|m| m.into_queue_message())
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(queue = %queue_name, count = messages.len(), "Received SQS messages");
        Ok(messages)
    }

    async fn ack(&self, queue_name: &str, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        validate_queue_name(queue_name)?;
        self.delete_message(queue_name, receipt)
            .await
            .map_err(AwsError::to_queue_error)?;
        tracing::debug!(queue = %queue_name, "Message deleted from SQS");
        Ok(())
    }

    async fn nack(
        &self,
        queue_name: &str,
        receipt: &ReceiptHandle,
        delay_seconds: Option<u32>,
    ) -> Result<(), QueueError> {
        validate_queue_name(queue_name)?;
        let timeout = delay_seconds
            .unwrap_or(0)
            .min(MAX_VISIBILITY_TIMEOUT_SECONDS);
        let params = vec![
            ("ReceiptHandle".to_string(), receipt.as_str().to_string()),
            ("VisibilityTimeout".to_string(), timeout.to_string()),
        ];

        self.queue_call(queue_name, "ChangeMessageVisibility", params)
            .await
            .map_err(|e| with_receipt(e, receipt).to_queue_error())?;

        tracing::debug!(queue = %queue_name, visibility_timeout = timeout, "Message returned to SQS");
        Ok(())
    }

    async fn move_to_dlq(
        &self,
        queue_name: &str,
        message: &QueueMessage,
    ) -> Result<(), QueueError> {
        validate_queue_name(queue_name)?;
        let dlq = self.dlq_name(queue_name);
        let text = serde_json::to_string(&message.body).map_err(SerializationError::from)?;
        let attributes = dead_letter_attributes(queue_name, message, Timestamp::now());

        let dlq_id = self
            .send_message(
                &dlq,
                text,
                &attributes,
                message.attributes.get(ATTR_GROUP_ID).map(String::as_str),
                Some(message.id.as_str()),
                None,
            )
            .await
            .map_err(AwsError::to_queue_error)?;

        if let Some(ref receipt) = message.receipt_handle {
            self.delete_message(queue_name, receipt)
                .await
                .map_err(AwsError::to_queue_error)?;
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
        ProviderType::Aws
    }

    fn dlq_suffix(&self) -> &str {
        &self.dlq_suffix
    }

    /// FIFO queues need a FIFO dead-letter queue, so the suffix goes before `.fifo`
    fn dlq_name(&self, queue_name: &str) -> String {
        match queue_name.strip_suffix(".fifo") {
            Some(base) => format!("{}{}.fifo", base, self.dlq_suffix),
            None => format!("{}{}", queue_name, self.dlq_suffix),
        }
    }
}

/// Encode a query-protocol form body
///
/// The serializer is not `Sync`, so it must never live across an await point.
fn encode_form(action: &str, params: &[(String, String)]) -> String {
    let mut form = url::form_urlencoded::Serializer::new(String::new());
    form.append_pair("Action", action);
    form.append_pair("Version", API_VERSION);
    for (key, value) in params {
        form.append_pair(key, value);
    }
    form.finish()
}

fn with_receipt(error: AwsError, receipt: &ReceiptHandle) -> AwsError {
    match error {
        AwsError::InvalidReceipt(_) => AwsError::InvalidReceipt(receipt.as_str().to_string()),
        other => other,
    }
}

/// Size as SQS counts it: body plus attribute names, types and values
fn message_size(body: &str, attributes: &HashMap<String, String>) -> usize {
    body.len()
        + attributes
            .iter()
            .map(|(k, v)| k.len() + v.len() + "String".len())
            .sum::<usize>()
}

// ============================================================================
// Attribute Encoding
// ============================================================================

/// Encode attributes as `MessageAttribute.N.*` parameters
///
/// At most [`MAX_NATIVE_ATTRIBUTES`] go out natively. When there are more,
/// the first nine by name stay native and the rest are folded into
/// [`OVERFLOW_ATTRIBUTE`]. Empty values always fold since SQS rejects them.
fn encode_attributes(
    attributes: &HashMap<String, String>,
) -> Result<Vec<(String, String)>, AwsError> {
    let mut sorted: Vec<(&String, &String)> = attributes.iter().collect();
    sorted.sort();

    let (mut native, mut folded): (Vec<_>, Vec<_>) =
        sorted.into_iter().partition(|(_, v)| !v.is_empty());
    if native.len() + usize::from(!folded.is_empty()) > MAX_NATIVE_ATTRIBUTES {
        folded.extend(native.split_off(MAX_NATIVE_ATTRIBUTES - 1));
    }

    let mut entries: Vec<(String, String)> = native
        .into_iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if !folded.is_empty() {
        let overflow: BTreeMap<&String, &String> = folded.into_iter().collect();
        let json = serde_json::to_string(&overflow)
            .map_err(|e| AwsError::SerializationError(e.to_string()))?;
        entries.push((OVERFLOW_ATTRIBUTE.to_string(), json));
    }

    let mut params = Vec::with_capacity(entries.len() * 3);
    for (index, (name, value)) in entries.into_iter().enumerate() {
        let prefix = format!("MessageAttribute.{}", index + 1);
        params.push((format!("{}.Name", prefix), name));
        params.push((format!("{}.Value.DataType", prefix), "String".to_string()));
        params.push((format!("{}.Value.StringValue", prefix), value));
    }
    Ok(params)
}

/// Merge a folded overflow attribute back into the attribute map
fn unfold_attributes(
    mut attributes: HashMap<String, String>,
) -> Result<HashMap<String, String>, SerializationError> {
    if let Some(json) = attributes.remove(OVERFLOW_ATTRIBUTE) {
        let overflow: HashMap<String, String> = serde_json::from_str(&json).map_err(|_| {
            SerializationError::InvalidAttribute {
                key: OVERFLOW_ATTRIBUTE.to_string(),
            }
        })?;
        attributes.extend(overflow);
    }
    Ok(attributes)
}

// ============================================================================
// Response Parsing
// ============================================================================

/// One `<Message>` of a `ReceiveMessage` response
#[derive(Debug, Default)]
struct RawMessage {
    message_id: String,
    receipt_handle: String,
    body: String,
    system_attributes: HashMap<String, String>,
    message_attributes: HashMap<String, String>,
}

impl RawMessage {
    fn into_queue_message(self) -> Result<QueueMessage, QueueError> {
        let body = match serde_json::from_str(&self.body) {
            Ok(value) => value,
            Err(_) => {
                tracing::debug!(message_id = %self.message_id, "Non-JSON SQS body kept as string");
                serde_json::Value::String(self.body)
            }
        };

        let retry_count = self
            .system_attributes
            .get("ApproximateReceiveCount")
            .and_then(|c| c.parse::<u32>().ok())
            .map(|c| c.saturating_sub(1))
            .unwrap_or(0);
        let enqueued_at = self
            .system_attributes
            .get("SentTimestamp")
            .and_then(|t| t.parse::<i64>().ok())
            .and_then(Timestamp::from_millis)
            .unwrap_or_else(Timestamp::now);

        Ok(QueueMessage {
            id: self.message_id.parse()?,
            body,
            receipt_handle: Some(ReceiptHandle::new(self.receipt_handle)),
            attributes: unfold_attributes(self.message_attributes)?,
            enqueued_at,
            retry_count,
        })
    }
}

fn parse_receive_response(xml: &str) -> Result<Vec<RawMessage>, AwsError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut path: Vec<String> = Vec::new();
    let mut messages = Vec::new();
    let mut current: Option<RawMessage> = None;
    let mut pending_name: Option<String> = None;
    let mut pending_value: Option<String> = None;

    loop {
        let text = match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match name.as_str() {
                    "Message" => current = Some(RawMessage::default()),
                    "Attribute" | "MessageAttribute" => {
                        pending_name = None;
                        pending_value = None;
                    }
                    _ => {}
                }
                path.push(name);
                None
            }
            Ok(Event::End(e)) => {
                match e.name().as_ref() {
                    b"Message" => messages.extend(current.take()),
                    b"Attribute" => {
                        if let (Some(message), Some(k), Some(v)) =
                            (current.as_mut(), pending_name.take(), pending_value.take())
                        {
                            message.system_attributes.insert(k, v);
                        }
                    }
                    b"MessageAttribute" => {
                        if let (Some(message), Some(k)) = (current.as_mut(), pending_name.take()) {
                            message
                                .message_attributes
                                .insert(k, pending_value.take().unwrap_or_default());
                        }
                    }
                    _ => {}
                }
                path.pop();
                None
            }
            Ok(Event::Text(e)) => Some(
                e.unescape()
                    .map_err(|e| AwsError::SerializationError(e.to_string()))?
                    .into_owned(),
            ),
            Ok(Event::CData(e)) => Some(String::from_utf8_lossy(&e).into_owned()),
            Ok(Event::Eof) => break,
            Err(e) => return Err(AwsError::SerializationError(format!("XML: {}", e))),
            _ => None,
        };

        if let (Some(text), Some(message)) = (text, current.as_mut()) {
            let depth = path.len();
            let element = path.last().map(String::as_str).unwrap_or_default();
            let parent = depth
                .checked_sub(2)
                .and_then(|i| path.get(i))
                .map(String::as_str)
                .unwrap_or_default();

            match (parent, element) {
                ("Message", "MessageId") => message.message_id = text,
                ("Message", "ReceiptHandle") => message.receipt_handle = text,
                ("Message", "Body") => message.body = text,
                ("Attribute", "Name") | ("MessageAttribute", "Name") => pending_name = Some(text),
                ("Attribute", "Value") | ("Value", "StringValue") => pending_value = Some(text),
                _ => {}
            }
        }
        buf.clear();
    }

    Ok(messages)
}
