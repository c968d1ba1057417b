//! Manages the life cycle of the relay and lets it shut down
//! gracefully.
//!
//! Work that must not be interrupted holds an `Activity`; idle loops
//! hold a `ShutdownSubscription`. Once shutdown begins no new
//! activities can be started, and `LifeCycle::shutdown` returns once
//! every outstanding activity has been dropped.
//!
//! See <https://tokio.rs/tokio/topics/shutdown> for more information.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc::{Receiver as MPSCReceiver, Sender as MPSCSender};
use tokio::sync::watch::{Receiver as WatchReceiver, Sender as WatchSender};
use uuid::Uuid;

const STRAGGLER_REPORT_INTERVAL: Duration = Duration::from_secs(15);

type Labels = Arc<Mutex<HashMap<Uuid, String>>>;

/// Represents some activity which cannot be ruthlessly interrupted.
/// While any Activity instances are alive, `LifeCycle::shutdown`
/// cannot complete.
pub struct Activity {
    tx: MPSCSender<()>,
    uuid: Uuid,
    labels: Labels,
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Activity").finish()
    }
}

impl Clone for Activity {
    fn clone(&self) -> Self {
        let uuid = Uuid::new_v4();
        let mut labels = self.labels.lock();

        let label = match labels.get(&self.uuid) {
            Some(existing) => format!("clone of {existing}"),
            None => format!("impossible missing label for {}", self.uuid),
        };
        labels.insert(uuid, label);

        Activity {
            tx: self.tx.clone(),
            uuid,
            labels: Arc::clone(&self.labels),
        }
    }
}

impl Drop for Activity {
    fn drop(&mut self) {
        self.labels.lock().remove(&self.uuid);
    }
}

struct Shared {
    root: Mutex<Option<Activity>>,
    labels: Labels,
    shutting_down: AtomicBool,
    stop_requested: AtomicBool,
    stop_tx: WatchSender<bool>,
    request_shutdown_tx: MPSCSender<()>,
}

/// A cloneable reference to the life cycle, handed out to the
/// components that need to register work or watch for shutdown.
#[derive(Clone)]
pub struct LifeCycleHandle {
    shared: Arc<Shared>,
}

impl LifeCycleHandle {
    /// Obtain an Activity instance.
    /// If None is returned then the relay is shutting down
    /// and no new activity can be initiated.
    pub fn activity(&self, label: impl Into<String>) -> Option<Activity> {
        let root = self.shared.root.lock();
        let root = root.as_ref()?;
        let uuid = Uuid::new_v4();
        self.shared.labels.lock().insert(uuid, label.into());
        Some(Activity {
            tx: root.tx.clone(),
            uuid,
            labels: Arc::clone(&self.shared.labels),
        })
    }

    pub fn subscribe(&self) -> ShutdownSubscription {
        ShutdownSubscription {
            rx: self.shared.stop_tx.subscribe(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Relaxed)
    }

    /// Request that the relay shut down. This wakes up
    /// `LifeCycle::wait_for_shutdown`.
    pub fn request_shutdown(&self) {
        tracing::debug!("shutdown has been requested");
        if self
            .shared
            .stop_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.shared.request_shutdown_tx.try_send(()).ok();
        }
    }
}

/// ShutdownSubscription can be used by code that is idling.
/// Select on your timeout and `ShutdownSubscription::shutting_down`
/// to wake up when either the timeout expires or the relay is
/// about to shut down.
#[derive(Clone)]
pub struct ShutdownSubscription {
    rx: WatchReceiver<bool>,
}

impl ShutdownSubscription {
    /// Resolves once shutdown has begun, including when it began
    /// before this subscription was obtained.
    pub async fn shutting_down(&mut self) {
        self.rx.wait_for(|stopping| *stopping).await.ok();
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }
}

/// The life cycle of this relay instance
pub struct LifeCycle {
    shared: Arc<Shared>,
    activity_rx: MPSCReceiver<()>,
    request_shutdown_rx: MPSCReceiver<()>,
}

impl Default for LifeCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl LifeCycle {
    pub fn new() -> Self {
        let (activity_tx, activity_rx) = tokio::sync::mpsc::channel(1);
        let (request_shutdown_tx, request_shutdown_rx) = tokio::sync::mpsc::channel(1);
        let (stop_tx, _) = tokio::sync::watch::channel(false);

        let labels: Labels = Arc::default();
        let uuid = Uuid::new_v4();
        labels.lock().insert(uuid, "Root LifeCycle".to_string());

        let shared = Arc::new(Shared {
            root: Mutex::new(Some(Activity {
                tx: activity_tx,
                uuid,
                labels: Arc::clone(&labels),
            })),
            labels,
            shutting_down: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stop_tx,
            request_shutdown_tx,
        });

        Self {
            shared,
            activity_rx,
            request_shutdown_rx,
        }
    }

    pub fn handle(&self) -> LifeCycleHandle {
        LifeCycleHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Wait for a signal or a shutdown request, then shut down,
    /// waiting at most `drain_timeout` for in-flight work.
    pub async fn wait_for_shutdown(&mut self, drain_timeout: Option<Duration>) -> anyhow::Result<()> {
        tracing::debug!("Waiting for interrupt");
        let mut sig_term = tokio::signal::unix::signal(SignalKind::terminate())?;
        let mut sig_hup = tokio::signal::unix::signal(SignalKind::hangup())?;

        tokio::select! {
            _ = sig_term.recv() => {}
            _ = sig_hup.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
            _ = self.request_shutdown_rx.recv() => {}
        };
        tracing::info!(
            "Shutdown requested, please wait while in-flight deliveries complete. \
             Interrupting shutdown may cause duplicate delivery."
        );
        self.shutdown(drain_timeout).await;
        Ok(())
    }

    /// Propagate the shutdown state to running tasks and wait for
    /// their activities to complete. Returns false if `drain_timeout`
    /// elapsed first.
    pub async fn shutdown(&mut self, drain_timeout: Option<Duration>) -> bool {
        tracing::debug!("Signal tasks that we are stopping");
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.root.lock().take();
        self.shared.stop_tx.send_replace(true);

        tracing::debug!("Waiting for tasks to wrap up");
        match drain_timeout {
            Some(duration) => {
                match tokio::time::timeout(duration, self.wait_for_activities()).await {
                    Ok(()) => true,
                    Err(_) => {
                        tracing::warn!(
                            "Gave up waiting after {duration:?}: {}",
                            self.summarize_pending()
                        );
                        false
                    }
                }
            }
            None => {
                self.wait_for_activities().await;
                true
            }
        }
    }

    async fn wait_for_activities(&mut self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(STRAGGLER_REPORT_INTERVAL) => {
                    tracing::info!("Still waiting for {}", self.summarize_pending());
                }
                _ = self.activity_rx.recv() => {
                    return
                }
            }
        }
    }

    fn summarize_pending(&self) -> String {
        let labels = self.shared.labels.lock().clone();
        let n = labels.len();
        let summary: Vec<&str> = labels.values().map(|s| s.as_str()).take(10).collect();
        let summary = summary.join(", ");
        if n > 10 {
            format!("{n} pending activities... {summary} (and {} others)", n - 10)
        } else {
            format!("{n} pending activities... {summary}")
        }
    }
}
