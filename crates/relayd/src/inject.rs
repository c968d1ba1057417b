//! Seeds the queue from JSON message descriptions
use crate::message::{Envelope, MessageId, Payload};
use crate::queue::QueueStore;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Content {
    /// The complete RFC 5322 message text
    Rfc822(String),
    /// Path to a file holding the message text; read at delivery time
    Path(PathBuf),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InjectRequest {
    /// The envelope sender; empty for the null sender
    #[serde(default)]
    pub envelope_sender: String,

    /// The recipients. Recipients in different domains are queued
    /// as separate messages.
    pub recipients: Vec<String>,

    pub content: Content,

    /// Which vmta_group to send from
    #[serde(default)]
    pub outbound_group: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct InjectResponse {
    /// The number of messages that were queued
    pub success_count: usize,
    /// The number of messages that could not be queued
    pub fail_count: usize,
    /// Recipients of the messages that could not be queued
    pub failed_recipients: Vec<String>,
    pub ids: Vec<MessageId>,
}

fn domain_of(recipient: &str) -> String {
    recipient
        .trim_matches(|c| c == '<' || c == '>')
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_ascii_lowercase())
        .unwrap_or_default()
}

impl InjectRequest {
    pub async fn inject(self, queue: &dyn QueueStore) -> InjectResponse {
        let payload = match self.content {
            Content::Rfc822(text) => Payload::inline(text),
            Content::Path(path) => Payload::Path(path),
        };

        let mut by_domain: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for recipient in self.recipients {
            by_domain
                .entry(domain_of(&recipient))
                .or_default()
                .push(recipient);
        }

        let mut response = InjectResponse::default();
        for (_, recipients) in by_domain {
            let envelope = Envelope::new(self.envelope_sender.clone(), recipients.clone());
            match queue
                .enqueue(envelope, payload.clone(), self.outbound_group.clone())
                .await
            {
                Ok(id) => {
                    response.success_count += 1;
                    response.ids.push(id);
                }
                Err(err) => {
                    tracing::error!("failed to queue message for {recipients:?}: {err:#}");
                    response.fail_count += 1;
                    response.failed_recipients.extend(recipients);
                }
            }
        }
        response
    }
}

/// Queue every request in `path`, a JSON array of `InjectRequest`
pub async fn inject_file(path: &Path, queue: &dyn QueueStore) -> anyhow::Result<InjectResponse> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let requests: Vec<InjectRequest> = serde_json::from_str(&data)
        .with_context(|| format!("parsing json from file {}", path.display()))?;

    let mut total = InjectResponse::default();
    for request in requests {
        let response = request.inject(queue).await;
        total.success_count += response.success_count;
        total.fail_count += response.fail_count;
        total.failed_recipients.extend(response.failed_recipients);
        total.ids.extend(response.ids);
    }
    Ok(total)
}
