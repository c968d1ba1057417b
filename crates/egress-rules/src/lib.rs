//! Resolves the connection and rate limits that apply when sending
//! from a given IP to a given destination host.
//!
//! Patterns are evaluated in a fixed priority order: patterns scoped
//! to the sending IP come first, then global patterns, each group
//! sorted by its `order` field, and finally the catch-all default.
use arc_swap::ArcSwap;
use lruttl::LruCacheWithTtl;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

mod store;
mod types;

pub use store::*;
pub use types::*;

/// How long a (host, ip) match result stays fresh
pub const MATCH_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const MATCH_CACHE_CAPACITY: usize = 16 * 1024;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("no default outbound pattern is configured; refusing to send")]
    MissingDefaultPattern,
    #[error("loading outbound rules: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl RuleError {
    /// Fatal errors mean that no delivery decision can be made
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingDefaultPattern)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResult {
    pub pattern_id: PatternId,
    pub rules: RuleSet,
}

#[derive(Debug)]
enum Matcher {
    Regex(Regex),
    Hosts(Vec<String>),
    Never,
}

impl Matcher {
    fn new(pattern: &OutboundMxPattern) -> Self {
        match pattern.pattern_type {
            PatternType::Regex => match RegexBuilder::new(&pattern.value)
                .case_insensitive(true)
                .build()
            {
                Ok(re) => Self::Regex(re),
                Err(err) => {
                    tracing::warn!(
                        "pattern {} ({}) has an invalid regex and will never match: {err}",
                        pattern.id,
                        pattern.name
                    );
                    Self::Never
                }
            },
            PatternType::CommaDelimited => Self::Hosts(
                pattern
                    .value
                    .split(',')
                    .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
                    .filter(|h| !h.is_empty())
                    .collect(),
            ),
        }
    }

    /// `host` must already be lowercased
    fn matches(&self, host: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(host),
            Self::Hosts(hosts) => hosts.iter().any(|h| h == host),
            Self::Never => false,
        }
    }
}

#[derive(Debug)]
struct CompiledPattern {
    id: PatternId,
    limited_to_ip: Option<IpAddr>,
    matcher: Matcher,
    rules: RuleSet,
}

/// An evaluation-ready form of `RuleTables`
#[derive(Debug)]
struct CompiledRules {
    tables: RuleTables,
    ordered: Vec<CompiledPattern>,
    default: MatchResult,
}

impl CompiledRules {
    fn compile(tables: RuleTables) -> Result<Self, RuleError> {
        let mut defaults: Vec<&OutboundMxPattern> =
            tables.patterns.iter().filter(|p| p.is_default).collect();
        defaults.sort_by_key(|p| (p.order, p.id));
        let default_pattern = *defaults.first().ok_or(RuleError::MissingDefaultPattern)?;
        if defaults.len() > 1 {
            tracing::warn!(
                "{} default patterns are configured; using {}",
                defaults.len(),
                default_pattern.id
            );
        }

        let mut by_pattern: HashMap<PatternId, Vec<&OutboundRule>> = HashMap::new();
        for rule in &tables.rules {
            if tables.patterns.iter().any(|p| p.id == rule.pattern_id) {
                by_pattern.entry(rule.pattern_id).or_default().push(rule);
            } else {
                tracing::warn!(
                    "ignoring {} rule for unknown pattern {}",
                    rule.rule_type,
                    rule.pattern_id
                );
            }
        }

        let rules_for = |id: PatternId| by_pattern.get(&id).into_iter().flatten().copied();

        // Rule types the default doesn't mention fall back to the
        // conservative values; other patterns inherit from the default
        let default_rules = apply_rules(
            default_pattern.id,
            RuleSet::CONSERVATIVE,
            rules_for(default_pattern.id),
        );
        for rule_type in [
            RuleType::MaxConnections,
            RuleType::MaxMessagesPerConnection,
            RuleType::MaxMessagesPerHour,
        ] {
            if !rules_for(default_pattern.id).any(|r| r.rule_type == rule_type) {
                tracing::warn!(
                    "default pattern {} has no {rule_type} rule; using {:?}",
                    default_pattern.id,
                    RuleSet::CONSERVATIVE.limit(rule_type)
                );
            }
        }

        let mut candidates: Vec<&OutboundMxPattern> = tables
            .patterns
            .iter()
            .filter(|p| p.id != default_pattern.id)
            .collect();
        candidates.sort_by_key(|p| (p.limited_to_ip.is_none(), p.order, p.id));

        let ordered = candidates
            .into_iter()
            .map(|p| CompiledPattern {
                id: p.id,
                limited_to_ip: p.limited_to_ip,
                matcher: Matcher::new(p),
                rules: apply_rules(p.id, default_rules, rules_for(p.id)),
            })
            .collect();

        let default = MatchResult {
            pattern_id: default_pattern.id,
            rules: default_rules,
        };

        Ok(Self {
            tables,
            ordered,
            default,
        })
    }

    fn evaluate(&self, host: &str, ip: IpAddr) -> MatchResult {
        for pattern in &self.ordered {
            if let Some(limited) = pattern.limited_to_ip {
                if limited != ip {
                    continue;
                }
            }
            if pattern.matcher.matches(host) {
                return MatchResult {
                    pattern_id: pattern.id,
                    rules: pattern.rules,
                };
            }
        }
        self.default
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Resolves rule sets for (destination host, sending IP) pairs,
/// caching the result of each evaluation.
pub struct RuleMatcher {
    store: Arc<dyn RuleStore>,
    compiled: ArcSwap<CompiledRules>,
    cache: LruCacheWithTtl<(String, IpAddr), MatchResult>,
    refresh_interval: Duration,
    loaded_at: parking_lot::Mutex<Instant>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl RuleMatcher {
    /// Load and compile the tables from `store`.
    /// Fails if the tables have no default pattern.
    pub async fn new(
        store: Arc<dyn RuleStore>,
        refresh_interval: Duration,
    ) -> Result<Self, RuleError> {
        let tables = store.load().await?;
        let compiled = CompiledRules::compile(tables)?;
        tracing::info!(
            "loaded {} outbound patterns; default is {}",
            compiled.ordered.len() + 1,
            compiled.default.pattern_id
        );
        Ok(Self {
            store,
            compiled: ArcSwap::from_pointee(compiled),
            cache: LruCacheWithTtl::new("egress_rule_matches", MATCH_CACHE_CAPACITY),
            refresh_interval,
            loaded_at: parking_lot::Mutex::new(Instant::now()),
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Determine which rule set applies to sending from `ip` to `host`.
    /// Repeated calls for the same pair return the same pattern until
    /// the cached result expires or the tables change.
    pub fn resolve_rules(&self, host: &str, ip: IpAddr) -> MatchResult {
        let host = normalize_host(host);
        let compiled = self.compiled.load();
        self.cache
            .get_or_insert((host.clone(), ip), MATCH_CACHE_TTL, || {
                let result = compiled.evaluate(&host, ip);
                tracing::trace!("{host} from {ip} matched pattern {}", result.pattern_id);
                result
            })
    }

    pub fn default_rules(&self) -> MatchResult {
        self.compiled.load().default
    }

    /// Reload the tables from the store. The match cache is cleared
    /// when the tables changed. On error the previous tables remain
    /// in effect. Returns true if the tables changed.
    pub async fn reload(&self) -> Result<bool, RuleError> {
        let _guard = self.refresh_lock.lock().await;
        let tables = self.store.load().await?;
        *self.loaded_at.lock() = Instant::now();
        if tables == self.compiled.load().tables {
            return Ok(false);
        }
        let compiled = CompiledRules::compile(tables)?;
        self.compiled.store(Arc::new(compiled));
        let purged = self.cache.clear();
        tracing::info!("outbound rules changed; cleared {purged} cached matches");
        Ok(true)
    }

    /// Reload if the tables are older than the refresh interval
    pub async fn refresh_if_stale(&self) -> Result<bool, RuleError> {
        if self.loaded_at.lock().elapsed() < self.refresh_interval {
            return Ok(false);
        }
        self.reload().await
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Drop expired match results
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }
}
