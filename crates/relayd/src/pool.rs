//! Reusable outbound SMTP sessions keyed by (sending IP, destination
//! host).
//!
//! A session is either idle in its host pool, owned by exactly one
//! `PooledClient`, or being established. The sum of the three is
//! bounded by the MaxConnections rule for the destination. A separate
//! process-wide semaphore bounds the number of connect attempts in
//! flight across every destination.
use crate::egress_source::VirtualMta;
use dashmap::DashMap;
use dns_resolver::{MxRecord, MxResolver};
use egress_rules::RuleMatcher;
use parking_lot::Mutex;
use relay_lifecycle::ShutdownSubscription;
use rfc5321::{ClientError, ForwardPath, Response, ReversePath, SmtpClient, SmtpClientTimeouts};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Idle sessions older than this are closed with QUIT
    #[serde(default = "PoolConfig::default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    #[serde(default = "PoolConfig::default_reap_interval", with = "humantime_serde")]
    pub reap_interval: Duration,

    /// How long a destination that signalled 421, or that repeatedly
    /// refused connections, is skipped
    #[serde(
        default = "PoolConfig::default_service_unavailable_window",
        with = "humantime_serde"
    )]
    pub service_unavailable_window: Duration,

    #[serde(default = "PoolConfig::default_connect_failures")]
    pub connect_failures_before_unavailable: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Self::default_idle_timeout(),
            reap_interval: Self::default_reap_interval(),
            service_unavailable_window: Self::default_service_unavailable_window(),
            connect_failures_before_unavailable: Self::default_connect_failures(),
        }
    }
}

impl PoolConfig {
    fn default_idle_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_reap_interval() -> Duration {
        Duration::from_secs(5)
    }
    fn default_service_unavailable_window() -> Duration {
        Duration::from_secs(60)
    }
    fn default_connect_failures() -> usize {
        3
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub source: IpAddr,
    pub host: String,
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}->{}", self.source, self.host)
    }
}

#[derive(Error, Debug)]
pub enum AcquireError {
    #[error("{host} is unavailable from {sending_ip}")]
    ServiceUnavailable { host: String, sending_ip: IpAddr },
    #[error("{host} already has {limit} connections")]
    AtCapacity { host: String, limit: usize },
    #[error("connection pool is shutting down")]
    ShuttingDown,
    #[error("no MX candidate could be reached: {}", .response.to_single_line())]
    AllCandidatesFailed { response: Response },
}

impl AcquireError {
    /// Describe the failure as an SMTP style response for logging
    /// and classification
    pub fn to_response(&self) -> Response {
        match self {
            Self::AllCandidatesFailed { response } => response.clone(),
            Self::ServiceUnavailable { .. } => {
                Response::with_code_and_message(421, &format!("4.4.5 {self}"))
            }
            Self::AtCapacity { .. } | Self::ShuttingDown => {
                Response::with_code_and_message(451, &format!("4.4.5 {self}"))
            }
        }
    }
}

#[derive(Default, Debug)]
struct HostPool {
    idle: VecDeque<SmtpClient>,
    in_use: usize,
    connecting: usize,
    consecutive_connect_failures: usize,
}

impl HostPool {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use + self.connecting
    }
}

enum Plan {
    Reuse(SmtpClient),
    Connect,
    AtCapacity(usize),
}

/// A session on loan from the pool. Dropping it returns a still
/// connected session to the idle queue of its key.
#[derive(Debug)]
pub struct PooledClient {
    client: Option<SmtpClient>,
    key: PoolKey,
    host_pool: Arc<Mutex<HostPool>>,
    reused: bool,
}

impl PooledClient {
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn was_reused(&self) -> bool {
        self.reused
    }

    pub fn is_connected(&self) -> bool {
        self.client.as_ref().map(|c| c.is_connected()).unwrap_or(false)
    }

    pub fn is_service_unavailable(&self) -> bool {
        self.client
            .as_ref()
            .map(|c| c.is_service_unavailable())
            .unwrap_or(false)
    }

    pub fn messages_sent(&self) -> usize {
        self.client.as_ref().map(|c| c.messages_sent()).unwrap_or(0)
    }

    pub async fn send_mail<B: AsRef<[u8]>>(
        &mut self,
        sender: ReversePath,
        recipients: &[ForwardPath],
        data: B,
    ) -> Result<Response, ClientError> {
        match self.client.as_mut() {
            Some(client) => client.send_mail(sender, recipients, data).await,
            None => Err(ClientError::NotConnected),
        }
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        let mut pool = self.host_pool.lock();
        pool.in_use = pool.in_use.saturating_sub(1);
        if let Some(client) = self.client.take() {
            if client.is_connected() {
                pool.idle.push_back(client);
            } else {
                tracing::trace!("{}: session closed; not returning it to the pool", self.key);
            }
        }
    }
}

fn quit_in_background(clients: Vec<SmtpClient>) {
    if clients.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for mut client in clients {
            client.quit().await;
        }
    });
}

pub struct ConnectionPool {
    rules: Arc<RuleMatcher>,
    resolver: Arc<dyn MxResolver>,
    config: PoolConfig,
    timeouts: SmtpClientTimeouts,
    smtp_port: u16,
    connect_limiter: Arc<Semaphore>,
    hosts: DashMap<PoolKey, Arc<Mutex<HostPool>>>,
    unavailable: DashMap<PoolKey, Instant>,
}

impl ConnectionPool {
    pub fn new(
        rules: Arc<RuleMatcher>,
        resolver: Arc<dyn MxResolver>,
        config: PoolConfig,
        timeouts: SmtpClientTimeouts,
        smtp_port: u16,
        max_concurrent_connects: usize,
    ) -> Self {
        Self {
            rules,
            resolver,
            config,
            timeouts,
            smtp_port,
            connect_limiter: Arc::new(Semaphore::new(max_concurrent_connects.max(1))),
            hosts: DashMap::new(),
            unavailable: DashMap::new(),
        }
    }

    fn host_pool(&self, key: &PoolKey) -> Arc<Mutex<HostPool>> {
        Arc::clone(self.hosts.entry(key.clone()).or_default().value())
    }

    /// Returns true while `key` is within its service-unavailable window
    pub fn is_unavailable(&self, key: &PoolKey) -> bool {
        let expired = match self.unavailable.get(key) {
            Some(until) => *until <= Instant::now(),
            None => return false,
        };
        if expired {
            self.unavailable.remove_if(key, |_, until| *until <= Instant::now());
            return false;
        }
        true
    }

    /// Stop creating sessions for `key` for the service-unavailable
    /// window and close its idle sessions
    pub fn mark_service_unavailable(&self, key: &PoolKey) {
        tracing::info!(
            "{key}: marking unavailable for {:?}",
            self.config.service_unavailable_window
        );
        self.unavailable
            .insert(key.clone(), Instant::now() + self.config.service_unavailable_window);
        if let Some(pool) = self.hosts.get(key).map(|p| Arc::clone(p.value())) {
            let idle: Vec<SmtpClient> = pool.lock().idle.drain(..).collect();
            quit_in_background(idle);
        }
    }

    /// Number of sessions (idle, in use, connecting) for `key`
    pub fn connection_count(&self, key: &PoolKey) -> usize {
        self.hosts
            .get(key)
            .map(|p| p.value().lock().total())
            .unwrap_or(0)
    }

    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.hosts
            .get(key)
            .map(|p| p.value().lock().idle.len())
            .unwrap_or(0)
    }

    /// Obtain a session to the first usable candidate. Candidates are
    /// tried in order; only connection level failures move on to the
    /// next one.
    pub async fn acquire(
        &self,
        vmta: &VirtualMta,
        candidates: &[MxRecord],
    ) -> Result<PooledClient, AcquireError> {
        let sending_ip = vmta.key_ip();
        let mut last_failure: Option<Response> = None;

        for candidate in candidates {
            let key = PoolKey {
                source: sending_ip,
                host: candidate.host.to_string(),
            };

            if self.is_unavailable(&key) {
                tracing::debug!("{key}: skipping; marked unavailable");
                return Err(AcquireError::ServiceUnavailable {
                    host: key.host,
                    sending_ip,
                });
            }

            let rules = self.rules.resolve_rules(&key.host, sending_ip).rules;
            let host_pool = self.host_pool(&key);

            loop {
                let plan = {
                    let mut pool = host_pool.lock();
                    let mut stale = vec![];
                    let mut reuse = None;
                    while let Some(client) = pool.idle.pop_back() {
                        if client.is_connected() && client.idle_for() < self.config.idle_timeout {
                            reuse.replace(client);
                            break;
                        }
                        stale.push(client);
                    }
                    quit_in_background(stale);

                    match reuse {
                        Some(client) => {
                            pool.in_use += 1;
                            Plan::Reuse(client)
                        }
                        None => match rules.max_connections {
                            Some(limit) if pool.total() >= limit => Plan::AtCapacity(limit),
                            _ => {
                                pool.connecting += 1;
                                Plan::Connect
                            }
                        },
                    }
                };

                match plan {
                    Plan::Reuse(mut client) => {
                        let mut pooled = PooledClient {
                            client: None,
                            key: key.clone(),
                            host_pool: Arc::clone(&host_pool),
                            reused: true,
                        };
                        match client.reset().await {
                            Ok(_) => {
                                pooled.client.replace(client);
                                return Ok(pooled);
                            }
                            Err(err) => {
                                tracing::debug!("{key}: idle session failed RSET: {err:#}");
                                // Dropping `pooled` releases the in_use slot
                                drop(pooled);
                                if client.is_service_unavailable() {
                                    self.mark_service_unavailable(&key);
                                    return Err(AcquireError::ServiceUnavailable {
                                        host: key.host,
                                        sending_ip,
                                    });
                                }
                                continue;
                            }
                        }
                    }
                    Plan::AtCapacity(limit) => {
                        tracing::debug!("{key}: at connection limit {limit}");
                        return Err(AcquireError::AtCapacity {
                            host: key.host,
                            limit,
                        });
                    }
                    Plan::Connect => {
                        let result = self.connect(vmta, &key).await;
                        let mut pool = host_pool.lock();
                        pool.connecting = pool.connecting.saturating_sub(1);
                        match result {
                            Ok(mut client) => {
                                pool.consecutive_connect_failures = 0;
                                pool.in_use += 1;
                                client.set_max_messages(rules.max_messages_per_connection);
                                return Ok(PooledClient {
                                    client: Some(client),
                                    key,
                                    host_pool: Arc::clone(&host_pool),
                                    reused: false,
                                });
                            }
                            Err(ConnectFailure::ShuttingDown) => {
                                return Err(AcquireError::ShuttingDown);
                            }
                            Err(ConnectFailure::Client(err)) => {
                                let response = err.to_response();
                                tracing::debug!(
                                    "{key}: connection failed: {}",
                                    response.to_single_line()
                                );
                                if response.is_service_unavailable() {
                                    drop(pool);
                                    self.mark_service_unavailable(&key);
                                    return Err(AcquireError::ServiceUnavailable {
                                        host: key.host,
                                        sending_ip,
                                    });
                                }
                                pool.consecutive_connect_failures += 1;
                                if pool.consecutive_connect_failures
                                    >= self.config.connect_failures_before_unavailable
                                {
                                    pool.consecutive_connect_failures = 0;
                                    drop(pool);
                                    self.mark_service_unavailable(&key);
                                }
                                last_failure.replace(response);
                                break;
                            }
                        }
                    }
                }
            }
        }

        Err(AcquireError::AllCandidatesFailed {
            response: last_failure.unwrap_or_else(|| {
                Response::with_code_and_message(451, "4.4.4 no usable MX candidates")
            }),
        })
    }

    async fn connect(&self, vmta: &VirtualMta, key: &PoolKey) -> Result<SmtpClient, ConnectFailure> {
        let _permit = self
            .connect_limiter
            .acquire()
            .await
            .map_err(|_| ConnectFailure::ShuttingDown)?;

        let addrs = self.resolver.resolve_ip(&key.host).await.map_err(|err| {
            ConnectFailure::Client(ClientError::Rejected(Response::with_code_and_message(
                451,
                &format!("4.4.4 {err:#}"),
            )))
        })?;
        let port = vmta.remote_port.unwrap_or(self.smtp_port);
        let ehlo_name = vmta.ehlo_name();

        let mut last_err = None;
        for addr in addrs {
            let address = SocketAddr::new(addr, port);
            match self.establish(vmta, address, &key.host, &ehlo_name).await {
                Ok(client) => {
                    tracing::debug!("{key}: connected to {address}");
                    return Ok(client);
                }
                Err(err) => {
                    tracing::debug!("{key}: {address}: {err:#}");
                    let unavailable = err
                        .response()
                        .map(|r| r.is_service_unavailable())
                        .unwrap_or(false);
                    last_err.replace(err);
                    if unavailable {
                        break;
                    }
                }
            }
        }
        Err(ConnectFailure::Client(
            last_err.unwrap_or(ClientError::NotConnected),
        ))
    }

    async fn establish(
        &self,
        vmta: &VirtualMta,
        address: SocketAddr,
        host: &str,
        ehlo_name: &str,
    ) -> Result<SmtpClient, ClientError> {
        let mut client =
            SmtpClient::connect(vmta.source_address, address, host, self.timeouts).await?;
        client.read_greeting().await?;
        client.hello(ehlo_name).await?;
        Ok(client)
    }

    /// Close idle sessions that timed out or were disconnected, forget
    /// expired unavailability marks and drop empty host pools.
    /// Returns the number of sessions closed.
    pub fn reap(&self) -> usize {
        let now = Instant::now();
        self.unavailable.retain(|_, until| *until > now);

        let mut closed = vec![];
        self.hosts.retain(|key, pool| {
            let mut p = pool.lock();
            let mut keep = VecDeque::with_capacity(p.idle.len());
            while let Some(client) = p.idle.pop_front() {
                if client.is_connected() && client.idle_for() < self.config.idle_timeout {
                    keep.push_back(client);
                } else {
                    tracing::trace!("{key}: reaping idle session");
                    closed.push(client);
                }
            }
            p.idle = keep;
            // A pool referenced by an outstanding PooledClient must stay
            p.total() > 0 || Arc::strong_count(pool) > 1
        });

        let count = closed.len();
        quit_in_background(closed);
        count
    }

    /// QUIT every idle session and refuse new connections
    pub async fn close_all(&self) {
        self.connect_limiter.close();
        let mut idle = vec![];
        for entry in self.hosts.iter() {
            idle.extend(entry.value().lock().idle.drain(..));
        }
        tracing::debug!("closing {} idle sessions", idle.len());
        for mut client in idle {
            client.quit().await;
        }
    }

    pub fn start_reaper(self: &Arc<Self>, mut shutdown: ShutdownSubscription) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(pool.config.reap_interval) => {
                        let closed = pool.reap();
                        if closed > 0 {
                            tracing::debug!("reaper closed {closed} idle sessions");
                        }
                    }
                    _ = shutdown.shutting_down() => {
                        pool.close_all().await;
                        return;
                    }
                }
            }
        })
    }
}

enum ConnectFailure {
    ShuttingDown,
    Client(ClientError),
}
