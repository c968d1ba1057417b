use chrono::{DateTime, Utc};
use rfc5321::{ForwardPath, ReversePath};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Identifies a message within the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MessageId(Uuid);

impl std::fmt::Display for MessageId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.simple().fmt(fmt)
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for MessageId {
    type Error = uuid::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let uuid = Uuid::parse_str(&s)?;
        Ok(Self(uuid))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LifecycleState {
    Queued,
    /// Claimed by a worker; invisible to other pickups
    PickedUp,
    Delivered,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

/// The envelope of a queued message. All recipients share one
/// domain so that a single MX list serves the whole message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// The reverse path; empty for the null sender
    pub sender: String,
    pub recipients: Vec<String>,
}

impl Envelope {
    pub fn new<S: Into<String>>(sender: S, recipients: Vec<String>) -> Self {
        Self {
            sender: sender.into(),
            recipients,
        }
    }

    pub fn reverse_path(&self) -> Result<ReversePath, &'static str> {
        ReversePath::try_from(self.sender.as_str())
    }

    pub fn forward_paths(&self) -> Result<Vec<ForwardPath>, &'static str> {
        self.recipients
            .iter()
            .map(|recip| ForwardPath::try_from(recip.as_str()))
            .collect()
    }

    /// The lowercased domain shared by every recipient
    pub fn recipient_domain(&self) -> anyhow::Result<String> {
        let mut domain: Option<String> = None;
        for path in self
            .forward_paths()
            .map_err(|err| anyhow::anyhow!("invalid recipient: {err}"))?
        {
            let this = path
                .domain()
                .ok_or_else(|| anyhow::anyhow!("recipient {path} has no domain"))?
                .to_ascii_lowercase();
            match &domain {
                None => domain = Some(this),
                Some(existing) if *existing == this => {}
                Some(existing) => {
                    anyhow::bail!("recipients span multiple domains: {existing} and {this}")
                }
            }
        }
        domain.ok_or_else(|| anyhow::anyhow!("envelope has no recipients"))
    }
}

/// Where the message content lives
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Inline(Arc<Vec<u8>>),
    Path(PathBuf),
}

impl Payload {
    pub fn inline<B: Into<Vec<u8>>>(data: B) -> Self {
        Self::Inline(Arc::new(data.into()))
    }

    pub async fn load(&self) -> anyhow::Result<Arc<Vec<u8>>> {
        match self {
            Self::Inline(data) => Ok(Arc::clone(data)),
            Self::Path(path) => {
                let data = tokio::fs::read(path).await.map_err(|err| {
                    anyhow::anyhow!("reading payload from {}: {err:#}", path.display())
                })?;
                Ok(Arc::new(data))
            }
        }
    }
}

/// Scheduling state attached to a message while it is queued
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QueueMetadata {
    pub queued_at: DateTime<Utc>,
    /// Earliest time for the next attempt
    pub attempt_send_after: DateTime<Utc>,
    /// Number of deferrals that count towards backoff growth
    pub deferred_count: u32,
    /// Number of attempts, including throttled ones
    pub num_attempts: u32,
    pub pickup_locked: bool,
    /// Which vmta group to send from; the default group when None
    pub outbound_group: Option<String>,
}

impl QueueMetadata {
    pub fn new(now: DateTime<Utc>, outbound_group: Option<String>) -> Self {
        Self {
            queued_at: now,
            attempt_send_after: now,
            deferred_count: 0,
            num_attempts: 0,
            pickup_locked: false,
            outbound_group,
        }
    }
}

/// A message with its lifecycle state. `queue` is present only while
/// the message is queued or picked up.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub envelope: Envelope,
    pub payload: Payload,
    pub state: LifecycleState,
    pub queue: Option<QueueMetadata>,
}

impl Message {
    pub fn new(envelope: Envelope, payload: Payload, outbound_group: Option<String>) -> Self {
        Self {
            id: MessageId::new(),
            envelope,
            payload,
            state: LifecycleState::Queued,
            queue: Some(QueueMetadata::new(Utc::now(), outbound_group)),
        }
    }

    pub fn deferred_count(&self) -> u32 {
        self.queue.as_ref().map(|q| q.deferred_count).unwrap_or(0)
    }

    pub fn queued_at(&self) -> Option<DateTime<Utc>> {
        self.queue.as_ref().map(|q| q.queued_at)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recipient_domain() {
        let env = Envelope::new(
            "sender@example.com",
            vec![
                "a@Example.NET".to_string(),
                "<b@example.net>".to_string(),
            ],
        );
        k9::assert_equal!(env.recipient_domain().unwrap(), "example.net");

        let env = Envelope::new(
            "",
            vec!["a@example.net".to_string(), "b@example.org".to_string()],
        );
        assert!(env.recipient_domain().is_err());

        let env = Envelope::new("", vec![]);
        assert!(env.recipient_domain().is_err());
    }

    #[test]
    fn message_id_round_trip() {
        let id = MessageId::new();
        let text = id.to_string();
        k9::assert_equal!(text.len(), 32);
        k9::assert_equal!(MessageId::try_from(text).unwrap(), id);
    }

    #[tokio::test]
    async fn payload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msg.eml");
        std::fs::write(&path, b"Subject: hi\r\n\r\nbody\r\n").unwrap();
        let payload = Payload::Path(path);
        k9::assert_equal!(
            payload.load().await.unwrap().as_slice(),
            b"Subject: hi\r\n\r\nbody\r\n".as_slice()
        );
        assert!(Payload::Path("/nonexistent/relayd".into()).load().await.is_err());
    }
}
