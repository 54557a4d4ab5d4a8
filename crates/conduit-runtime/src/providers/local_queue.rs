//! In-memory queue for local development and tests.
//!
//! Reference semantics for the queue contract:
//! - `Priority::High` inserts at the head of the queue, everything else at the
//!   tail. Several high-priority messages therefore come out newest first.
//! - Delayed enqueues and delayed nacks sit in a min-heap keyed by
//!   `tokio::time::Instant` and are promoted lazily on every operation. No
//!   background task is spawned, and a paused tokio clock drives them in tests.
//! - Receipt handles are tracked in an in-flight map. A terminal operation on a
//!   handle that is not in the map fails with [`QueueError::MessageState`].
//! - Dead-lettered messages land in an ordinary queue named
//!   `<queue><dlq_suffix>`, receivable like any other.

use crate::client::QueueProvider;
use crate::error::QueueError;
use crate::message::{
    dead_letter_attributes, validate_queue_name, EnqueueOptions, MessageId, Priority,
    QueueMessage, ReceiptHandle, ReceiveOptions, Timestamp, DEFAULT_DLQ_SUFFIX,
};
use crate::provider::ProviderType;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[cfg(test)]
#[path = "local_queue_tests.rs"]
mod tests;

// ============================================================================
// Internal State
// ============================================================================

/// A message at rest in a queue
#[derive(Debug, Clone)]
struct StoredMessage {
    id: MessageId,
    body: serde_json::Value,
    attributes: HashMap<String, String>,
    enqueued_at: Timestamp,
    retry_count: u32,
}

impl StoredMessage {
    fn deliver(&self, receipt: Option<ReceiptHandle>) -> QueueMessage {
        QueueMessage {
            id: self.id.clone(),
            body: self.body.clone(),
            receipt_handle: receipt,
            attributes: self.attributes.clone(),
            enqueued_at: self.enqueued_at,
            retry_count: self.retry_count,
        }
    }
}

/// Where a message is inserted when it becomes visible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Head,
    Tail,
}

/// A delivery waiting for its delay to elapse
#[derive(Debug)]
struct ScheduledDelivery {
    ready_at: Instant,
    sequence: u64,
    queue: String,
    placement: Placement,
    message: StoredMessage,
}

impl PartialEq for ScheduledDelivery {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.sequence == other.sequence
    }
}

impl Eq for ScheduledDelivery {}

impl PartialOrd for ScheduledDelivery {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledDelivery {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap yields the earliest delivery; sequence breaks ties FIFO.
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// A received message awaiting ack, nack or dead-lettering
#[derive(Debug)]
struct InFlightMessage {
    queue: String,
    message: StoredMessage,
    /// Visibility deadline; `None` keeps the message in flight indefinitely
    visible_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct LocalQueueState {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    in_flight: HashMap<String, InFlightMessage>,
    scheduled: BinaryHeap<ScheduledDelivery>,
    next_sequence: u64,
    shut_down: bool,
}

impl LocalQueueState {
    fn queue_mut(&mut self, name: &str) -> &mut VecDeque<StoredMessage> {
        self.queues.entry(name.to_string()).or_default()
    }

    fn insert(&mut self, queue: &str, message: StoredMessage, placement: Placement) {
        let messages = self.queue_mut(queue);
        match placement {
            Placement::Head => messages.push_front(message),
            Placement::Tail => messages.push_back(message),
        }
    }

    fn schedule(
        &mut self,
        queue: &str,
        message: StoredMessage,
        placement: Placement,
        ready_at: Instant,
    ) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.scheduled.push(ScheduledDelivery {
            ready_at,
            sequence,
            queue: queue.to_string(),
            placement,
            message,
        });
    }

    /// Promote due deliveries and return expired in-flight messages to their queues
    fn promote(&mut self, now: Instant) {
        while self
            .scheduled
            .peek()
            .is_some_and(|entry| entry.ready_at <= now)
        {
            if let Some(entry) = self.scheduled.pop() {
                self.insert(&entry.queue, entry.message, entry.placement);
            }
        }

        let mut expired: Vec<(Instant, String)> = self
            .in_flight
            .iter()
            .filter_map(|(receipt, entry)| match entry.visible_at {
                Some(at) if at <= now => Some((at, receipt.clone())),
                _ => None,
            })
            .collect();
        if expired.is_empty() {
            return;
        }

        expired.sort();
        for (_, receipt) in expired {
            if let Some(entry) = self.in_flight.remove(&receipt) {
                let mut message = entry.message;
                message.retry_count += 1;
                tracing::debug!(
                    queue = %entry.queue,
                    message_id = %message.id,
                    "Visibility timeout expired, message returned to queue"
                );
                self.insert(&entry.queue, message, Placement::Tail);
            }
        }
    }

    /// Earliest instant at which state changes without outside input
    fn next_wake(&self) -> Option<Instant> {
        let scheduled = self.scheduled.peek().map(|entry| entry.ready_at);
        let visibility = self
            .in_flight
            .values()
            .filter_map(|entry| entry.visible_at)
            .min();
        match (scheduled, visibility) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Remove an in-flight entry after checking it belongs to `queue`
    fn take_in_flight(
        &mut self,
        queue: &str,
        receipt: &ReceiptHandle,
    ) -> Result<InFlightMessage, QueueError> {
        let owner = match self.in_flight.get(receipt.as_str()) {
            Some(entry) => entry.queue.clone(),
            None => {
                return Err(QueueError::message_state(
                    receipt.as_str(),
                    "handle is unknown, already settled or its visibility timeout expired",
                ))
            }
        };

        if owner != queue {
            return Err(QueueError::message_state(
                receipt.as_str(),
                format!("handle belongs to queue '{}'", owner),
            ));
        }

        self.in_flight
            .remove(receipt.as_str())
            .ok_or_else(|| QueueError::message_state(receipt.as_str(), "handle vanished"))
    }

    fn ensure_running(&self) -> Result<(), QueueError> {
        if self.shut_down {
            return Err(QueueError::ShuttingDown);
        }
        Ok(())
    }
}

// ============================================================================
// LocalQueue
// ============================================================================

/// In-memory queue provider
///
/// One mutex guards every queue, the in-flight map and the scheduled heap; it
/// is never held across an `.await`.
pub struct LocalQueue {
    state: Mutex<LocalQueueState>,
    notify: Notify,
    dlq_suffix: String,
}

impl LocalQueue {
    /// Create a queue using the default `-dlq` suffix
    pub fn new() -> Self {
        Self::with_dlq_suffix(DEFAULT_DLQ_SUFFIX)
    }

    pub fn with_dlq_suffix(dlq_suffix: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(LocalQueueState::default()),
            notify: Notify::new(),
            dlq_suffix: dlq_suffix.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LocalQueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel every scheduled delivery and reject further calls
    ///
    /// Waiting receivers wake and fail with [`QueueError::ShuttingDown`].
    /// Returns the number of cancelled deliveries.
    pub fn shutdown(&self) -> usize {
        let cancelled = {
            let mut state = self.lock();
            state.shut_down = true;
            let cancelled = state.scheduled.len();
            state.scheduled.clear();
            cancelled
        };
        self.notify.notify_waiters();
        tracing::info!(cancelled, "Local queue shut down");
        cancelled
    }

    /// Number of visible messages in `queue_name`
    pub fn queue_depth(&self, queue_name: &str) -> usize {
        let mut state = self.lock();
        state.promote(Instant::now());
        state.queues.get(queue_name).map_or(0, VecDeque::len)
    }

    /// Number of received but unsettled messages from `queue_name`
    pub fn in_flight_count(&self, queue_name: &str) -> usize {
        let mut state = self.lock();
        state.promote(Instant::now());
        state
            .in_flight
            .values()
            .filter(|entry| entry.queue == queue_name)
            .count()
    }

    /// Number of deliveries still waiting on a delay, across all queues
    pub fn scheduled_count(&self) -> usize {
        let mut state = self.lock();
        state.promote(Instant::now());
        state.scheduled.len()
    }

    /// Snapshot of the visible contents of `queue_name`'s dead-letter queue
    pub fn dead_letters(&self, queue_name: &str) -> Vec<QueueMessage> {
        let dlq = self.dlq_name(queue_name);
        let state = self.lock();
        state
            .queues
            .get(&dlq)
            .map(|messages| messages.iter().map(|m| m.deliver(None)).collect())
            .unwrap_or_default()
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueProvider for LocalQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        body: serde_json::Value,
        options: &EnqueueOptions,
    ) -> Result<MessageId, QueueError> {
        validate_queue_name(queue_name)?;

        let max_size = ProviderType::Local.max_message_size();
        let size = serde_json::to_vec(&body)
            .map_err(crate::error::SerializationError::from)?
            .len();
        if size > max_size {
            return Err(QueueError::MessageTooLarge { size, max_size });
        }

        let message = StoredMessage {
            id: MessageId::new(),
            body,
            attributes: options.hint_attributes(),
            enqueued_at: Timestamp::now(),
            retry_count: 0,
        };
        let id = message.id.clone();
        let placement = match options.priority {
            Some(Priority::High) => Placement::Head,
            _ => Placement::Tail,
        };

        {
            let mut state = self.lock();
            state.ensure_running()?;
            let now = Instant::now();
            state.promote(now);
            match options.effective_delay() {
                Some(delay) => {
                    let ready_at = now + Duration::from_secs(u64::from(delay));
                    state.schedule(queue_name, message, placement, ready_at);
                }
                None => state.insert(queue_name, message, placement),
            }
        }

        // Waiters also recompute their deadline against a newly scheduled delivery.
        self.notify.notify_waiters();

        tracing::debug!(
            queue = %queue_name,
            message_id = %id,
            delay_seconds = options.effective_delay().unwrap_or(0),
            "Message enqueued"
        );
        Ok(id)
    }

    async fn receive(
        &self,
        queue_name: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        validate_queue_name(queue_name)?;

        let max_messages = options.max_messages() as usize;
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        let visibility = options
            .visibility_timeout_seconds
            .map(|s| Duration::from_secs(u64::from(s)));
        let wait = Duration::from_secs(u64::from(options.wait_time()));
        let deadline = Instant::now() + wait;

        loop {
            // Registered before inspecting state so a concurrent enqueue cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut state = self.lock();
                state.ensure_running()?;
                let now = Instant::now();
                state.promote(now);

                let mut batch = Vec::new();
                while batch.len() < max_messages {
                    let Some(message) = state
                        .queues
                        .get_mut(queue_name)
                        .and_then(VecDeque::pop_front)
                    else {
                        break;
                    };
                    let receipt = ReceiptHandle::new(uuid::Uuid::new_v4().to_string());
                    batch.push(message.deliver(Some(receipt.clone())));
                    state.in_flight.insert(
                        receipt.as_str().to_string(),
                        InFlightMessage {
                            queue: queue_name.to_string(),
                            message,
                            visible_at: visibility.map(|v| now + v),
                        },
                    );
                }

                if !batch.is_empty() {
                    tracing::debug!(queue = %queue_name, count = batch.len(), "Messages received");
                    return Ok(batch);
                }

                state.next_wake()
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_wake.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn ack(&self, queue_name: &str, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let entry = {
            let mut state = self.lock();
            state.ensure_running()?;
            state.promote(Instant::now());
            state.take_in_flight(queue_name, receipt)?
        };

        tracing::debug!(queue = %queue_name, message_id = %entry.message.id, "Message acknowledged");
        Ok(())
    }

    async fn nack(
        &self,
        queue_name: &str,
        receipt: &ReceiptHandle,
        delay_seconds: Option<u32>,
    ) -> Result<(), QueueError> {
        let delay = delay_seconds.filter(|d| *d > 0);
        let message_id = {
            let mut state = self.lock();
            state.ensure_running()?;
            let now = Instant::now();
            state.promote(now);

            let entry = state.take_in_flight(queue_name, receipt)?;
            let mut message = entry.message;
            message.retry_count += 1;
            let id = message.id.clone();

            match delay {
                Some(delay) => {
                    let ready_at = now + Duration::from_secs(u64::from(delay));
                    state.schedule(queue_name, message, Placement::Tail, ready_at);
                }
                None => state.insert(queue_name, message, Placement::Tail),
            }
            id
        };

        self.notify.notify_waiters();

        tracing::debug!(
            queue = %queue_name,
            message_id = %message_id,
            delay_seconds = delay.unwrap_or(0),
            "Message returned to queue"
        );
        Ok(())
    }

    async fn move_to_dlq(
        &self,
        queue_name: &str,
        message: &QueueMessage,
    ) -> Result<(), QueueError> {
        validate_queue_name(queue_name)?;
        let dlq = self.dlq_name(queue_name);

        let dead_letter = StoredMessage {
            id: MessageId::new(),
            body: message.body.clone(),
            attributes: dead_letter_attributes(queue_name, message, Timestamp::now()),
            enqueued_at: Timestamp::now(),
            retry_count: 0,
        };

        {
            let mut state = self.lock();
            state.ensure_running()?;
            state.promote(Instant::now());

            if let Some(ref receipt) = message.receipt_handle {
                state.take_in_flight(queue_name, receipt)?;
            }
            state.insert(&dlq, dead_letter, Placement::Tail);
        }

        self.notify.notify_waiters();

        tracing::debug!(
            queue = %queue_name,
            dlq = %dlq,
            message_id = %message.id,
            retry_count = message.retry_count,
            "Message moved to dead-letter queue"
        );
        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Local
    }

    fn dlq_suffix(&self) -> &str {
        &self.dlq_suffix
    }
}
