//! Drives one claimed message through a single delivery attempt and
//! commits the outcome back to the queue.
use crate::egress_source::{EgressSources, VirtualMta};
use crate::logging::{RecordType, TransactionLogger, TransactionRecord};
use crate::message::Message;
use crate::pool::{AcquireError, ConnectionPool};
use crate::queue::{QueueStore, Reschedule};
use crate::retry::{RetryPolicy, Schedule};
use bounce_classify::{BounceClassifier, BouncePair};
use chrono::Utc;
use dns_resolver::MxResolver;
use rfc5321::Response;
use std::sync::Arc;
use throttle::ThrottleManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DeferralKind {
    /// Network failures and 4xx replies; grows the backoff
    Transient,
    /// The destination signalled that it is unavailable
    ServiceUnavailable,
    /// No connection could be obtained locally
    LocalCapacity,
}

/// The result of a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered {
        response: Response,
    },
    Deferred {
        response: Response,
        kind: DeferralKind,
        bounce: BouncePair,
    },
    /// Denied by the hourly rate limit before any connection was made
    Throttled,
    Failed {
        response: Response,
        bounce: BouncePair,
    },
}

impl DeliveryOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered { .. } | Self::Failed { .. })
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Delivered { response }
            | Self::Deferred { response, .. }
            | Self::Failed { response, .. } => Some(response),
            Self::Throttled => None,
        }
    }

    pub fn bounce(&self) -> Option<BouncePair> {
        match self {
            Self::Deferred { bounce, .. } | Self::Failed { bounce, .. } => Some(*bounce),
            Self::Delivered { .. } | Self::Throttled => None,
        }
    }

    fn record_type(&self) -> RecordType {
        match self {
            Self::Delivered { .. } => RecordType::Delivery,
            Self::Deferred { .. } => RecordType::TransientFailure,
            Self::Throttled => RecordType::Throttled,
            Self::Failed { .. } => RecordType::Bounce,
        }
    }
}

/// An outcome plus where it happened, for the transaction log
#[derive(Debug)]
pub struct Attempt {
    pub outcome: DeliveryOutcome,
    pub mx_host: Option<String>,
    pub vmta: Option<Arc<VirtualMta>>,
    pub expired: bool,
}

impl Attempt {
    fn new(outcome: DeliveryOutcome) -> Self {
        Self {
            outcome,
            mx_host: None,
            vmta: None,
            expired: false,
        }
    }

    fn with_vmta(mut self, vmta: &Arc<VirtualMta>) -> Self {
        self.vmta.replace(Arc::clone(vmta));
        self
    }

    fn with_mx_host(mut self, host: &str) -> Self {
        self.mx_host.replace(host.to_string());
        self
    }
}

pub struct DeliveryOrchestrator {
    pub queue: Arc<dyn QueueStore>,
    pub resolver: Arc<dyn MxResolver>,
    pub throttle: Arc<ThrottleManager>,
    pub pool: Arc<ConnectionPool>,
    pub egress: Arc<EgressSources>,
    pub classifier: Arc<BounceClassifier>,
    pub logger: Arc<dyn TransactionLogger>,
    pub retry: RetryPolicy,
    /// Treat a Hard classification from a user bounce rule as terminal
    /// even when the reply was a 4xx
    pub hard_bounce_rules_are_terminal: bool,
}

impl DeliveryOrchestrator {
    fn fail(&self, code: u16, text: &str) -> DeliveryOutcome {
        let response = Response::with_code_and_message(code, text);
        let bounce = self.classifier.classify_response(&response);
        DeliveryOutcome::Failed { response, bounce }
    }

    fn defer(&self, response: Response, kind: DeferralKind) -> DeliveryOutcome {
        let bounce = self.classifier.classify_response(&response);
        DeliveryOutcome::Deferred {
            response,
            kind,
            bounce,
        }
    }

    /// Fold a rejected or failed transaction into an outcome
    fn classify_failure(&self, response: Response) -> DeliveryOutcome {
        let bounce = self.classifier.classify_response(&response);
        if response.is_permanent() {
            return DeliveryOutcome::Failed { response, bounce };
        }
        if self.hard_bounce_rules_are_terminal {
            let by_rule = self.classifier.match_rules(&response.to_single_line());
            if by_rule.map(|pair| pair.is_hard()).unwrap_or(false) {
                return DeliveryOutcome::Failed { response, bounce };
            }
        }
        DeliveryOutcome::Deferred {
            response,
            kind: DeferralKind::Transient,
            bounce,
        }
    }

    /// Run one attempt for a claimed message. Never fails: every
    /// problem becomes part of the outcome.
    pub async fn attempt(&self, message: &Message) -> Attempt {
        let now = Utc::now();
        if let Some(queued_at) = message.queued_at() {
            if self.retry.is_expired(queued_at, now) {
                let mut attempt = Attempt::new(self.fail(
                    551,
                    "5.4.7 message exceeded the maximum time in queue",
                ));
                attempt.expired = true;
                return attempt;
            }
        }

        let domain = match message.envelope.recipient_domain() {
            Ok(domain) => domain,
            Err(err) => return Attempt::new(self.fail(550, &format!("5.1.3 {err:#}"))),
        };
        let sender = match message.envelope.reverse_path() {
            Ok(sender) => sender,
            Err(err) => return Attempt::new(self.fail(553, &format!("5.1.7 invalid sender: {err}"))),
        };
        let recipients = match message.envelope.forward_paths() {
            Ok(recipients) => recipients,
            Err(err) => {
                return Attempt::new(self.fail(553, &format!("5.1.3 invalid recipient: {err}")))
            }
        };

        let candidates = match self.resolver.resolve_mx(&domain).await {
            Ok(candidates) if candidates.is_empty() => {
                return Attempt::new(self.fail(
                    556,
                    &format!("5.1.10 Recipient address has null MX or does not exist: {domain}"),
                ));
            }
            Ok(candidates) => candidates,
            Err(err) if err.is_temporary() => {
                return Attempt::new(self.defer(
                    Response::with_code_and_message(451, &format!("4.4.3 {err:#}")),
                    DeferralKind::Transient,
                ));
            }
            Err(err) => return Attempt::new(self.fail(550, &format!("5.1.2 {err:#}"))),
        };

        let group = message.queue.as_ref().and_then(|q| q.outbound_group.as_deref());
        let vmta = match self.egress.select(group) {
            Ok(vmta) => vmta,
            Err(err) => {
                tracing::error!(message_id = %message.id, "{err:#}");
                return Attempt::new(self.defer(
                    Response::with_code_and_message(451, &format!("4.3.5 {err:#}")),
                    DeferralKind::Transient,
                ));
            }
        };

        let data = match message.payload.load().await {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(message_id = %message.id, "{err:#}");
                return Attempt::new(self.defer(
                    Response::with_code_and_message(451, &format!("4.3.0 {err:#}")),
                    DeferralKind::Transient,
                ))
                .with_vmta(&vmta);
            }
        };

        let primary = &candidates[0].host;
        if !self
            .throttle
            .try_acquire_send_permission(vmta.key_ip(), primary)
        {
            tracing::debug!(message_id = %message.id, "throttled sending to {primary} from {}", vmta.name);
            return Attempt::new(DeliveryOutcome::Throttled)
                .with_vmta(&vmta)
                .with_mx_host(primary);
        }

        let mut client = match self.pool.acquire(&vmta, &candidates).await {
            Ok(client) => client,
            Err(err) => {
                let kind = match &err {
                    AcquireError::ServiceUnavailable { .. } => DeferralKind::ServiceUnavailable,
                    AcquireError::AtCapacity { .. } | AcquireError::ShuttingDown => {
                        DeferralKind::LocalCapacity
                    }
                    AcquireError::AllCandidatesFailed { .. } => DeferralKind::Transient,
                };
                tracing::debug!(message_id = %message.id, "no connection: {err:#}");
                return Attempt::new(self.defer(err.to_response(), kind))
                    .with_vmta(&vmta)
                    .with_mx_host(primary);
            }
        };

        let host = client.key().host.to_string();
        let outcome = match client.send_mail(sender, &recipients, data.as_slice()).await {
            Ok(response) => DeliveryOutcome::Delivered { response },
            Err(err) => {
                let response = err.to_response();
                if client.is_service_unavailable() || response.is_service_unavailable() {
                    self.pool.mark_service_unavailable(client.key());
                    self.defer(response, DeferralKind::ServiceUnavailable)
                } else {
                    self.classify_failure(response)
                }
            }
        };
        drop(client);

        Attempt::new(outcome).with_vmta(&vmta).with_mx_host(&host)
    }

    /// Attempt delivery of a claimed message, then record the outcome
    /// and release the claim
    pub async fn deliver(&self, message: Message) -> DeliveryOutcome {
        let attempt = self.attempt(&message).await;
        let outcome = attempt.outcome.clone();

        let next = match self.retry.schedule(&outcome, message.deferred_count()) {
            Schedule::Done => None,
            Schedule::Retry {
                deferred_count,
                delay,
            } => Some(Reschedule {
                attempt_send_after: Utc::now()
                    .checked_add_signed(delay)
                    .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC),
                deferred_count,
            }),
        };

        tracing::debug!(
            message_id = %message.id,
            "{} via {}: {outcome:?}; next attempt {:?}",
            message.envelope.recipients.join(","),
            attempt.mx_host.as_deref().unwrap_or("-"),
            next.map(|n| n.attempt_send_after)
        );

        if let Err(err) = self.queue.record_outcome(message.id, &outcome, next).await {
            tracing::error!(message_id = %message.id, "recording outcome: {err:#}");
        }

        let now = Utc::now();
        let response = match outcome.response() {
            Some(response) => response.clone(),
            None => Response::with_code_and_message(451, "4.7.0 local rate limit reached"),
        };
        let record = TransactionRecord {
            kind: if attempt.expired {
                RecordType::Expiration
            } else {
                outcome.record_type()
            },
            id: message.id,
            sender: message.envelope.sender.to_string(),
            recipients: message.envelope.recipients.clone(),
            site: attempt.mx_host.clone(),
            sending_ip: attempt.vmta.as_ref().and_then(|v| v.source_address),
            egress_source: attempt.vmta.as_ref().map(|v| v.name.to_string()),
            response,
            bounce_classification: outcome.bounce(),
            timestamp: now,
            created: message.queued_at().unwrap_or(now),
            num_attempts: message.queue.as_ref().map(|q| q.num_attempts).unwrap_or(1),
        };
        self.logger.log_transaction(record).await;

        outcome
    }
}
