//! The queue store collaborator. Claims are the exclusivity mechanism
//! for delivery: a claimed message is invisible to every other pickup
//! until its outcome is recorded.
use crate::delivery::DeliveryOutcome;
use crate::message::{Envelope, LifecycleState, Message, MessageId, Payload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lruttl::LruCacheWithTtl;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Terminal results are remembered for status queries until they
/// age out or are evicted by newer ones
pub const RESULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
pub const RESULT_CAPACITY: usize = 100_000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DeliveryStatus {
    Delivered,
    Failed,
    Pending,
}

/// When and how a non-terminal message goes back into the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reschedule {
    pub attempt_send_after: DateTime<Utc>,
    pub deferred_count: u32,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(
        &self,
        envelope: Envelope,
        payload: Payload,
        outbound_group: Option<String>,
    ) -> anyhow::Result<MessageId>;

    /// Atomically claim up to `max` messages that are due, oldest due
    /// time first. Messages claimed by another worker are skipped.
    async fn try_claim_next(&self, max: usize) -> anyhow::Result<Vec<Message>>;

    /// Claim a specific message. Returns `None` when it is already
    /// claimed, not yet due, or no longer queued.
    async fn try_claim(&self, id: MessageId) -> anyhow::Result<Option<Message>>;

    /// Release the claim on `id`, either removing it from the queue
    /// (when `next` is `None`) or making it due again at the given time.
    async fn record_outcome(
        &self,
        id: MessageId,
        outcome: &DeliveryOutcome,
        next: Option<Reschedule>,
    ) -> anyhow::Result<()>;

    async fn delivery_result(&self, id: MessageId) -> anyhow::Result<DeliveryStatus>;

    /// Forget terminal results whose retention has lapsed.
    /// Returns the number removed.
    fn purge_results(&self) -> usize {
        0
    }
}

#[derive(Default)]
struct Inner {
    messages: HashMap<MessageId, Message>,
}

impl Inner {
    fn claim(message: &mut Message, now: DateTime<Utc>) -> bool {
        let Some(queue) = message.queue.as_mut() else {
            return false;
        };
        if message.state != LifecycleState::Queued
            || queue.pickup_locked
            || queue.attempt_send_after > now
        {
            return false;
        }
        queue.pickup_locked = true;
        queue.num_attempts = queue.num_attempts.saturating_add(1);
        message.state = LifecycleState::PickedUp;
        true
    }
}

/// A queue held in memory
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    results: LruCacheWithTtl<MessageId, DeliveryStatus>,
    result_retention: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::with_result_retention(RESULT_CAPACITY, RESULT_RETENTION)
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` terminal results, each for `retention`
    pub fn with_result_retention(capacity: usize, retention: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            results: LruCacheWithTtl::new("delivery_results", capacity),
            result_retention: retention,
        }
    }

    /// Number of messages still queued, including claimed ones
    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of a queued message
    pub fn get(&self, id: MessageId) -> Option<Message> {
        self.inner.lock().messages.get(&id).cloned()
    }

    /// Insert a fully formed message, preserving its metadata
    pub fn insert(&self, message: Message) -> MessageId {
        let id = message.id;
        self.inner.lock().messages.insert(id, message);
        id
    }

    /// The earliest due time across unclaimed messages
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .messages
            .values()
            .filter(|msg| msg.state == LifecycleState::Queued)
            .filter_map(|msg| msg.queue.as_ref().map(|q| q.attempt_send_after))
            .min()
    }
}

#[async_trait]
impl QueueStore for MemoryQueue {
    async fn enqueue(
        &self,
        envelope: Envelope,
        payload: Payload,
        outbound_group: Option<String>,
    ) -> anyhow::Result<MessageId> {
        envelope.recipient_domain()?;
        let message = Message::new(envelope, payload, outbound_group);
        let id = self.insert(message);
        tracing::debug!(message_id = %id, "enqueued");
        Ok(id)
    }

    async fn try_claim_next(&self, max: usize) -> anyhow::Result<Vec<Message>> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let mut due: Vec<(DateTime<Utc>, MessageId)> = inner
            .messages
            .values()
            .filter(|msg| msg.state == LifecycleState::Queued)
            .filter_map(|msg| {
                let queue = msg.queue.as_ref()?;
                (!queue.pickup_locked && queue.attempt_send_after <= now)
                    .then_some((queue.attempt_send_after, msg.id))
            })
            .collect();
        due.sort();
        due.truncate(max);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(message) = inner.messages.get_mut(&id) {
                if Inner::claim(message, now) {
                    claimed.push(message.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn try_claim(&self, id: MessageId) -> anyhow::Result<Option<Message>> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        Ok(inner
            .messages
            .get_mut(&id)
            .and_then(|message| Inner::claim(message, now).then(|| message.clone())))
    }

    async fn record_outcome(
        &self,
        id: MessageId,
        outcome: &DeliveryOutcome,
        next: Option<Reschedule>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let Some(message) = inner.messages.get_mut(&id) else {
            anyhow::bail!("message {id} is not queued");
        };
        if message.state != LifecycleState::PickedUp {
            anyhow::bail!("message {id} is not claimed");
        }

        match next {
            Some(next) => {
                if outcome.is_terminal() {
                    anyhow::bail!("terminal outcome for {id} cannot be rescheduled");
                }
                let queue = message.queue.get_or_insert_with(|| {
                    crate::message::QueueMetadata::new(Utc::now(), None)
                });
                queue.attempt_send_after = next.attempt_send_after;
                queue.deferred_count = next.deferred_count;
                queue.pickup_locked = false;
                message.state = LifecycleState::Queued;
            }
            None => {
                let status = match outcome {
                    DeliveryOutcome::Delivered { .. } => DeliveryStatus::Delivered,
                    DeliveryOutcome::Failed { .. } => DeliveryStatus::Failed,
                    _ => anyhow::bail!("non-terminal outcome for {id} requires a reschedule"),
                };
                // Recorded while `inner` is held so that a status query
                // never sees the message as neither queued nor finished
                self.results
                    .insert(id, status, Instant::now() + self.result_retention);
                inner.messages.remove(&id);
            }
        }
        Ok(())
    }

    async fn delivery_result(&self, id: MessageId) -> anyhow::Result<DeliveryStatus> {
        let inner = self.inner.lock();
        if inner.messages.contains_key(&id) {
            return Ok(DeliveryStatus::Pending);
        }
        match self.results.get(&id) {
            Some(status) => Ok(status),
            None => anyhow::bail!("unknown message {id}"),
        }
    }

    fn purge_results(&self) -> usize {
        self.results.purge_expired()
    }
}
