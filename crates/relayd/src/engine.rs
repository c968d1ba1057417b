//! Wires the delivery components together and runs the pickup loop
use crate::config::{EngineConfig, RelayConfig};
use crate::delivery::DeliveryOrchestrator;
use crate::logging::TransactionLogger;
use crate::pool::ConnectionPool;
use crate::queue::QueueStore;
use dns_resolver::MxResolver;
use egress_rules::{RuleMatcher, RuleStore, StaticRuleStore};
use relay_lifecycle::{LifeCycleHandle, ShutdownSubscription};
use std::sync::Arc;
use throttle::ThrottleManager;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub struct Engine {
    config: EngineConfig,
    queue: Arc<dyn QueueStore>,
    rules: Arc<RuleMatcher>,
    throttle: Arc<ThrottleManager>,
    pool: Arc<ConnectionPool>,
    logger: Arc<dyn TransactionLogger>,
    orchestrator: Arc<DeliveryOrchestrator>,
    workers: Arc<Semaphore>,
}

impl Engine {
    /// Build an engine whose rules come from the config file
    pub async fn new(
        config: &RelayConfig,
        queue: Arc<dyn QueueStore>,
        logger: Arc<dyn TransactionLogger>,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(StaticRuleStore::new(config.rule_tables()));
        let resolver = config.build_resolver()?;
        Self::with_parts(config, store, resolver, queue, logger).await
    }

    pub async fn with_parts(
        config: &RelayConfig,
        store: Arc<dyn RuleStore>,
        resolver: Arc<dyn MxResolver>,
        queue: Arc<dyn QueueStore>,
        logger: Arc<dyn TransactionLogger>,
    ) -> anyhow::Result<Self> {
        let rules = Arc::new(RuleMatcher::new(store, config.rules_refresh).await?);
        let throttle = Arc::new(ThrottleManager::new(Arc::clone(&rules)));
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&rules),
            Arc::clone(&resolver),
            config.pool,
            config.client_timeouts,
            config.engine.smtp_port,
            config.engine.max_concurrent_connects,
        ));
        let orchestrator = Arc::new(DeliveryOrchestrator {
            queue: Arc::clone(&queue),
            resolver,
            throttle: Arc::clone(&throttle),
            pool: Arc::clone(&pool),
            egress: Arc::new(config.egress_sources()?),
            classifier: Arc::new(config.build_classifier()?),
            logger: Arc::clone(&logger),
            retry: config.retry,
            hard_bounce_rules_are_terminal: config.engine.hard_bounce_rules_are_terminal,
        });

        Ok(Self {
            config: config.engine.clone(),
            queue,
            rules,
            throttle,
            pool,
            logger,
            orchestrator,
            workers: Arc::new(Semaphore::new(config.engine.workers)),
        })
    }

    pub fn queue(&self) -> &Arc<dyn QueueStore> {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Number of delivery attempts currently running
    pub fn in_flight(&self) -> usize {
        self.config.workers - self.workers.available_permits()
    }

    /// Start the background maintenance tasks and the pickup loop.
    /// The returned handle resolves once shutdown has begun and the
    /// pickup loop has stopped claiming work; in-flight attempts hold
    /// activities on `life` until they complete.
    pub fn start(self: &Arc<Self>, life: &LifeCycleHandle) -> JoinHandle<()> {
        self.throttle.start_sweeper(life.subscribe());
        self.pool.start_reaper(life.subscribe());
        self.start_rule_refresher(life.clone());

        let engine = Arc::clone(self);
        let life = life.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.run_pickup(&life).await {
                tracing::error!("pickup loop failed: {err:#}");
                life.request_shutdown();
            }
            tracing::debug!("pickup loop stopped");
        })
    }

    fn start_rule_refresher(self: &Arc<Self>, life: LifeCycleHandle) -> JoinHandle<()> {
        let rules = Arc::clone(&self.rules);
        let queue = Arc::clone(&self.queue);
        let mut shutdown = life.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(rules.refresh_interval()) => {}
                    _ = shutdown.shutting_down() => return,
                }
                match rules.refresh_if_stale().await {
                    Ok(true) => tracing::info!("outbound rules reloaded"),
                    Ok(false) => {}
                    Err(err) if err.is_fatal() => {
                        tracing::error!("{err:#}");
                        life.request_shutdown();
                        return;
                    }
                    Err(err) => {
                        tracing::warn!("{err:#}; keeping the previous rules");
                    }
                }
                let purged = rules.purge_expired();
                if purged > 0 {
                    tracing::trace!("purged {purged} expired rule matches");
                }
                let purged = queue.purge_results();
                if purged > 0 {
                    tracing::trace!("forgot {purged} delivery results");
                }
            }
        })
    }

    async fn idle(&self, shutdown: &mut ShutdownSubscription) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = shutdown.shutting_down() => {}
        }
    }

    async fn run_pickup(&self, life: &LifeCycleHandle) -> anyhow::Result<()> {
        let mut shutdown = life.subscribe();
        loop {
            let first = tokio::select! {
                permit = Arc::clone(&self.workers).acquire_owned() => permit?,
                _ = shutdown.shutting_down() => return Ok(()),
            };
            let Some(activity) = life.activity("pickup") else {
                return Ok(());
            };

            let batch = (self.workers.available_permits() + 1).min(self.config.pickup_batch);
            let messages = match self.queue.try_claim_next(batch).await {
                Ok(messages) => messages,
                Err(err) => {
                    tracing::error!("claiming messages: {err:#}");
                    drop(first);
                    drop(activity);
                    self.idle(&mut shutdown).await;
                    continue;
                }
            };
            if messages.is_empty() {
                drop(first);
                drop(activity);
                self.idle(&mut shutdown).await;
                continue;
            }

            tracing::trace!("claimed {} messages", messages.len());
            let mut first = Some(first);
            for message in messages {
                let permit = match first.take() {
                    Some(permit) => permit,
                    None => Arc::clone(&self.workers).acquire_owned().await?,
                };
                let activity = activity.clone();
                let orchestrator = Arc::clone(&self.orchestrator);
                tokio::spawn(async move {
                    orchestrator.deliver(message).await;
                    drop(permit);
                    drop(activity);
                });
            }
        }
    }

    /// Close pooled sessions and flush the transaction log. Call once
    /// the life cycle has drained.
    pub async fn shutdown(&self) {
        self.pool.close_all().await;
        self.logger.shutdown().await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::logging::{MemoryLogger, RecordType};
    use crate::message::{Envelope, Payload};
    use crate::queue::{DeliveryStatus, MemoryQueue};
    use crate::testing::{SinkScript, SmtpSink};
    use egress_rules::RuleTables;
    use relay_lifecycle::LifeCycle;
    use std::time::Duration;

    /// `extra` holds top level keys and is placed before any table
    fn config_for(sink: &SmtpSink, extra: &str) -> RelayConfig {
        RelayConfig::parse(&format!(
            r#"{extra}
[engine]
workers = 4
pickup_batch = 2
poll_interval = "20ms"
smtp_port = {port}

[[pattern]]
id = 1
type = "regex"
value = "."
is_default = true

[dns.static_mx]
"example.net" = [{{host="mx1.test", preference=10}}]

[dns.static_hosts]
"mx1.test" = ["127.0.0.1"]
"#,
            port = sink.port()
        ))
        .unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, f: F) {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "timed out waiting for {what}");
    }

    #[test_log::test(tokio::test)]
    async fn delivers_queued_messages() {
        let sink = SmtpSink::start(SinkScript::default()).await;
        let queue = Arc::new(MemoryQueue::new());
        let logger = Arc::new(MemoryLogger::default());
        let engine = Arc::new(
            Engine::new(&config_for(&sink, ""), queue.clone(), logger.clone())
                .await
                .unwrap(),
        );

        let mut ids = vec![];
        for i in 0..10 {
            ids.push(
                queue
                    .enqueue(
                        Envelope::new("sender@example.com", vec![format!("user{i}@example.net")]),
                        Payload::inline(format!("Subject: {i}\r\n\r\nhello\r\n")),
                        None,
                    )
                    .await
                    .unwrap(),
            );
        }

        let mut life = LifeCycle::new();
        let pickup = engine.start(&life.handle());
        wait_for("delivery", || queue.is_empty()).await;

        assert!(life.shutdown(Some(Duration::from_secs(10))).await);
        pickup.await.unwrap();
        engine.shutdown().await;

        k9::assert_equal!(sink.stats.accepted(), 10);
        assert!(sink.stats.max_live() <= 4);
        for id in ids {
            k9::assert_equal!(queue.delivery_result(id).await.unwrap(), DeliveryStatus::Delivered);
        }
        let records = logger.records();
        k9::assert_equal!(records.len(), 10);
        assert!(records.iter().all(|r| r.kind == RecordType::Delivery));
        k9::assert_equal!(engine.in_flight(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn deferred_messages_stay_queued() {
        let sink = SmtpSink::start(SinkScript {
            rcpt_to: "451 4.3.0 try later\r\n",
            ..Default::default()
        })
        .await;
        let queue = Arc::new(MemoryQueue::new());
        let logger = Arc::new(MemoryLogger::default());
        let engine = Arc::new(
            Engine::new(&config_for(&sink, ""), queue.clone(), logger.clone())
                .await
                .unwrap(),
        );
        let id = queue
            .enqueue(
                Envelope::new("sender@example.com", vec!["user@example.net".to_string()]),
                Payload::inline("Subject: x\r\n\r\nx\r\n"),
                None,
            )
            .await
            .unwrap();

        let mut life = LifeCycle::new();
        let pickup = engine.start(&life.handle());
        wait_for("an attempt", || !logger.records().is_empty()).await;
        // The backoff keeps it from being picked up again
        tokio::time::sleep(Duration::from_millis(200)).await;

        life.shutdown(Some(Duration::from_secs(10))).await;
        pickup.await.unwrap();
        engine.shutdown().await;

        k9::assert_equal!(logger.records().len(), 1);
        k9::assert_equal!(queue.delivery_result(id).await.unwrap(), DeliveryStatus::Pending);
        let meta = queue.get(id).unwrap().queue.unwrap();
        k9::assert_equal!(meta.deferred_count, 1);
        assert!(!meta.pickup_locked);
    }

    #[test_log::test(tokio::test)]
    async fn losing_the_default_pattern_requests_shutdown() {
        let sink = SmtpSink::start(SinkScript::default()).await;
        let config = config_for(&sink, "rules_refresh = \"50ms\"\n");
        let store = Arc::new(StaticRuleStore::new(config.rule_tables()));
        let engine = Arc::new(
            Engine::with_parts(
                &config,
                store.clone(),
                config.build_resolver().unwrap(),
                Arc::new(MemoryQueue::new()),
                Arc::new(MemoryLogger::default()),
            )
            .await
            .unwrap(),
        );

        let mut life = LifeCycle::new();
        let pickup = engine.start(&life.handle());
        store.replace(RuleTables::default());

        tokio::time::timeout(Duration::from_secs(10), life.wait_for_shutdown(None))
            .await
            .unwrap()
            .unwrap();
        pickup.await.unwrap();
        engine.shutdown().await;
    }
}
