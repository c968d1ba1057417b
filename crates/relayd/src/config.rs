use crate::egress_source::{EgressSources, VirtualMta, VirtualMtaGroup};
use crate::logging::LogFileParams;
use crate::pool::PoolConfig;
use crate::retry::RetryPolicy;
use anyhow::Context;
use bounce_classify::{BounceClassifier, BounceClassifierBuilder};
use dns_resolver::{HickoryMxResolver, MxResolver, StaticMxResolver};
use egress_rules::{OutboundMxPattern, OutboundRule, RuleTables};
use rfc5321::SmtpClientTimeouts;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum number of delivery attempts in flight
    #[serde(default = "EngineConfig::default_workers")]
    pub workers: usize,

    /// How many due messages to claim per pickup
    #[serde(default = "EngineConfig::default_pickup_batch")]
    pub pickup_batch: usize,

    /// How long to wait before polling an empty queue again
    #[serde(default = "EngineConfig::default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "EngineConfig::default_smtp_port")]
    pub smtp_port: u16,

    /// Upper bound on connection attempts in progress across all
    /// destinations
    #[serde(default = "EngineConfig::default_max_concurrent_connects")]
    pub max_concurrent_connects: usize,

    /// When a user bounce rule classifies a 4xx reply as Hard, fail
    /// the message instead of retrying it
    #[serde(default)]
    pub hard_bounce_rules_are_terminal: bool,

    /// How long to wait for in-flight attempts when shutting down.
    /// Waits indefinitely when unset.
    #[serde(default, with = "humantime_serde")]
    pub shutdown_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: Self::default_workers(),
            pickup_batch: Self::default_pickup_batch(),
            poll_interval: Self::default_poll_interval(),
            smtp_port: Self::default_smtp_port(),
            max_concurrent_connects: Self::default_max_concurrent_connects(),
            hard_bounce_rules_are_terminal: false,
            shutdown_timeout: None,
        }
    }
}

impl EngineConfig {
    fn default_workers() -> usize {
        64
    }
    fn default_pickup_batch() -> usize {
        32
    }
    fn default_poll_interval() -> Duration {
        Duration::from_secs(1)
    }
    fn default_smtp_port() -> u16 {
        25
    }
    fn default_max_concurrent_connects() -> usize {
        32
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StaticMx {
    pub host: String,
    #[serde(default)]
    pub preference: u16,
}

/// Fixed DNS answers. When both tables are empty the system
/// resolver is used.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    #[serde(default)]
    pub static_mx: BTreeMap<String, Vec<StaticMx>>,
    #[serde(default)]
    pub static_hosts: BTreeMap<String, Vec<IpAddr>>,
}

impl DnsConfig {
    pub fn is_static(&self) -> bool {
        !self.static_mx.is_empty() || !self.static_hosts.is_empty()
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub client_timeouts: SmtpClientTimeouts,

    #[serde(default)]
    pub vmta: Vec<VirtualMta>,
    #[serde(default)]
    pub vmta_group: Vec<VirtualMtaGroup>,

    #[serde(default)]
    pub pattern: Vec<OutboundMxPattern>,
    #[serde(default)]
    pub rule: Vec<OutboundRule>,
    /// How often the pattern and rule tables are reloaded
    #[serde(default = "RelayConfig::default_rules_refresh", with = "humantime_serde")]
    pub rules_refresh: Duration,

    /// Bounce rule files, merged in order. `.json` files are parsed
    /// as JSON and anything else as TOML.
    #[serde(default)]
    pub bounce_rules: Vec<PathBuf>,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub transaction_log: Option<LogFileParams>,
}

impl RelayConfig {
    fn default_rules_refresh() -> Duration {
        Duration::from_secs(5 * 60)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("loading config from {}", path.display()))?;
        let config = Self::parse(&data)
            .with_context(|| format!("parsing config from {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(data: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configuration that can never work. Rules that reference
    /// an unknown pattern are only reported since they have no effect.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.engine.workers == 0 {
            anyhow::bail!("engine.workers must be greater than zero");
        }
        if self.engine.pickup_batch == 0 {
            anyhow::bail!("engine.pickup_batch must be greater than zero");
        }

        let mut ids = HashSet::new();
        for pattern in &self.pattern {
            if !ids.insert(pattern.id) {
                anyhow::bail!("pattern id {} is defined more than once", pattern.id);
            }
        }
        if !self.pattern.iter().any(|p| p.is_default) {
            anyhow::bail!("no default pattern is configured; set is_default on one [[pattern]]");
        }
        for rule in &self.rule {
            if !ids.contains(&rule.pattern_id) {
                tracing::warn!(
                    "{} rule references unknown pattern {}; it will be ignored",
                    rule.rule_type,
                    rule.pattern_id
                );
            }
        }

        EgressSources::new(&self.vmta, &self.vmta_group)?;
        Ok(())
    }

    pub fn rule_tables(&self) -> RuleTables {
        RuleTables {
            patterns: self.pattern.clone(),
            rules: self.rule.clone(),
        }
    }

    pub fn egress_sources(&self) -> anyhow::Result<EgressSources> {
        EgressSources::new(&self.vmta, &self.vmta_group)
    }

    pub fn build_resolver(&self) -> anyhow::Result<Arc<dyn MxResolver>> {
        if !self.dns.is_static() {
            let resolver = HickoryMxResolver::from_system_conf()
                .context("initializing the system DNS resolver")?;
            return Ok(Arc::new(resolver));
        }
        let mut resolver = StaticMxResolver::new();
        for (domain, entries) in &self.dns.static_mx {
            for entry in entries {
                resolver.add_mx(domain, &entry.host, entry.preference);
            }
        }
        for (host, addrs) in &self.dns.static_hosts {
            resolver.add_host(host, addrs);
        }
        tracing::info!(
            "using static DNS answers for {} domains and {} hosts",
            self.dns.static_mx.len(),
            self.dns.static_hosts.len()
        );
        Ok(Arc::new(resolver))
    }

    pub fn build_classifier(&self) -> anyhow::Result<BounceClassifier> {
        let mut builder = BounceClassifierBuilder::new();
        for path in &self.bounce_rules {
            builder
                .merge_file(path)
                .with_context(|| format!("loading bounce rules from {}", path.display()))?;
        }
        Ok(builder.build()?)
    }
}
