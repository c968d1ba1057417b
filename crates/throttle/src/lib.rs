//! A sliding-window limiter for messages-per-hour ceilings.
//!
//! Each (sending IP, matched pattern) pair keeps a log of recent send
//! times. The hourly ceiling is mapped to the finest interval of whole
//! minutes that still allows at least one send per interval, and a
//! send is permitted while the trailing interval holds fewer than the
//! interval's share of the ceiling.
//!
//! This is a rate limiter and not a queue: a denial is immediate and
//! the caller is expected to reschedule.
use dashmap::DashMap;
use egress_rules::{MatchResult, PatternId, RuleMatcher};
use relay_lifecycle::ShutdownSubscription;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Returns `(interval_minutes, max_in_interval)` for an hourly
/// ceiling, or `None` when the ceiling is zero.
///
/// `interval_minutes` is the smallest value in `1..=60` for which
/// `max_per_hour * interval_minutes / 60` is at least one.
pub fn interval_for_rate(max_per_hour: u64) -> Option<(u64, u64)> {
    if max_per_hour == 0 {
        return None;
    }
    let minutes = 60u64.div_ceil(max_per_hour).clamp(1, 60);
    let max_in_interval = max_per_hour.saturating_mul(minutes) / 60;
    Some((minutes, max_in_interval))
}

#[derive(Debug)]
pub struct ThrottleWindow {
    max_per_hour: u64,
    interval: Duration,
    max_in_interval: u64,
    sends: VecDeque<Instant>,
}

impl ThrottleWindow {
    fn new(max_per_hour: u64) -> Self {
        let mut window = Self {
            max_per_hour,
            interval: Duration::ZERO,
            max_in_interval: 0,
            sends: VecDeque::new(),
        };
        window.recompute(max_per_hour);
        window
    }

    fn recompute(&mut self, max_per_hour: u64) {
        let (minutes, max_in_interval) = interval_for_rate(max_per_hour).unwrap_or((60, 0));
        self.max_per_hour = max_per_hour;
        self.interval = Duration::from_secs(minutes * 60);
        self.max_in_interval = max_in_interval;
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.sends.front() {
            if now.saturating_duration_since(oldest) >= self.interval {
                self.sends.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_acquire(&mut self, max_per_hour: u64, now: Instant) -> bool {
        if max_per_hour != self.max_per_hour {
            self.recompute(max_per_hour);
        }
        self.prune(now);
        if (self.sends.len() as u64) < self.max_in_interval {
            self.sends.push_back(now);
            true
        } else {
            false
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_in_interval(&self) -> u64 {
        self.max_in_interval
    }
}

pub struct ThrottleManager {
    rules: Arc<RuleMatcher>,
    windows: DashMap<(IpAddr, PatternId), ThrottleWindow>,
}

impl ThrottleManager {
    pub fn new(rules: Arc<RuleMatcher>) -> Self {
        Self {
            rules,
            windows: DashMap::new(),
        }
    }

    /// May a message be sent from `ip` to `host` right now?
    /// A grant is recorded against the matched pattern's window.
    pub fn try_acquire_send_permission(&self, ip: IpAddr, host: &str) -> bool {
        let matched = self.rules.resolve_rules(host, ip);
        self.try_acquire_for(ip, &matched)
    }

    /// As `try_acquire_send_permission`, for a caller that already
    /// resolved the rules
    pub fn try_acquire_for(&self, ip: IpAddr, matched: &MatchResult) -> bool {
        let max_per_hour = match matched.rules.max_messages_per_hour {
            None => return true,
            Some(max) => max,
        };

        let now = Instant::now();
        let granted = self
            .windows
            .entry((ip, matched.pattern_id))
            .or_insert_with(|| ThrottleWindow::new(max_per_hour))
            .try_acquire(max_per_hour, now);
        if !granted {
            tracing::debug!(
                "throttled {ip} for pattern {}: {max_per_hour}/hour",
                matched.pattern_id
            );
        }
        granted
    }

    /// Prune old send times from every window, dropping windows that
    /// become empty. Returns the number of windows still tracked.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        self.windows.retain(|_, window| {
            window.prune(now);
            !window.sends.is_empty()
        });
        self.windows.len()
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    /// Run `sweep` every `SWEEP_INTERVAL` until shutdown.
    /// A sweep that overran the interval is followed immediately
    /// by the next one.
    pub fn start_sweeper(self: &Arc<Self>, mut shutdown: ShutdownSubscription) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let started = Instant::now();
                let remaining = manager.sweep();
                let elapsed = started.elapsed();
                tracing::trace!("throttle sweep took {elapsed:?}; {remaining} windows remain");

                let delay = SWEEP_INTERVAL.saturating_sub(elapsed);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.shutting_down() => {
                        tracing::debug!("throttle sweeper stopping");
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use egress_rules::{
        OutboundMxPattern, OutboundRule, PatternType, RuleTables, RuleType, StaticRuleStore,
    };

    fn smallest_interval(max_per_hour: u64) -> Option<u64> {
        (1..=60).find(|&minutes| max_per_hour * minutes / 60 >= 1)
    }

    #[test]
    fn interval_is_smallest_that_allows_a_send() {
        for max in 1..=5000u64 {
            let (minutes, per_interval) = interval_for_rate(max).unwrap();
            k9::assert_equal!(Some(minutes), smallest_interval(max), "max={max}");
            assert!(per_interval >= 1, "max={max}");
            k9::assert_equal!(per_interval, max * minutes / 60, "max={max}");
        }
        k9::assert_equal!(interval_for_rate(0), None);
        k9::assert_equal!(interval_for_rate(1), Some((60, 1)));
        k9::assert_equal!(interval_for_rate(7), Some((9, 1)));
        k9::assert_equal!(interval_for_rate(600), Some((1, 10)));
        k9::assert_equal!(interval_for_rate(100_000), Some((1, 1666)));
    }

    async fn manager(per_hour: &str) -> ThrottleManager {
        let tables = RuleTables {
            patterns: vec![OutboundMxPattern {
                id: PatternId(1),
                name: "default".to_string(),
                pattern_type: PatternType::Regex,
                value: ".".to_string(),
                limited_to_ip: None,
                order: 0,
                is_default: true,
            }],
            rules: vec![OutboundRule {
                pattern_id: PatternId(1),
                rule_type: RuleType::MaxMessagesPerHour,
                value: per_hour.to_string(),
            }],
        };
        let rules = RuleMatcher::new(
            Arc::new(StaticRuleStore::new(tables)),
            Duration::from_secs(300),
        )
        .await
        .unwrap();
        ThrottleManager::new(Arc::new(rules))
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_always_permits() {
        let manager = manager("-1").await;
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..10_000 {
            assert!(manager.try_acquire_send_permission(ip, "mx.example.net"));
        }
        k9::assert_equal!(manager.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_denies_everything() {
        let manager = manager("0").await;
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(!manager.try_acquire_send_permission(ip, "mx.example.net"));
    }

    #[tokio::test(start_paused = true)]
    async fn no_window_exceeds_its_share() {
        let manager = manager("120").await;
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let (minutes, per_interval) = interval_for_rate(120).unwrap();
        let interval = Duration::from_secs(minutes * 60);

        let start = Instant::now();
        let mut granted = vec![];
        // Try every 7 seconds for two hours
        for _ in 0..(2 * 3600 / 7) {
            if manager.try_acquire_send_permission(ip, "mx.example.net") {
                granted.push(Instant::now());
            }
            tokio::time::advance(Duration::from_secs(7)).await;
        }

        assert!(!granted.is_empty());
        for (i, &t) in granted.iter().enumerate() {
            let in_window = granted[i..]
                .iter()
                .take_while(|&&later| later.duration_since(t) < interval)
                .count();
            assert!(
                in_window as u64 <= per_interval,
                "{in_window} sends in window starting at {:?}",
                t.duration_since(start)
            );
        }
        // Two grants every 63 seconds given the 7 second probe cadence
        assert!(granted.len() > 200, "only {} grants", granted.len());
    }

    #[tokio::test(start_paused = true)]
    async fn windows_are_per_ip() {
        let manager = manager("60").await;
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(manager.try_acquire_send_permission(a, "mx.example.net"));
        assert!(!manager.try_acquire_send_permission(a, "mx.example.net"));
        assert!(manager.try_acquire_send_permission(b, "mx.example.net"));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(manager.try_acquire_send_permission(a, "mx.example.net"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_idle_windows() {
        let manager = manager("60").await;
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(manager.try_acquire_send_permission(ip, "mx.example.net"));
        k9::assert_equal!(manager.sweep(), 1);
        tokio::time::advance(Duration::from_secs(61)).await;
        k9::assert_equal!(manager.sweep(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_shutdown() {
        let manager = Arc::new(manager("60").await);
        let mut life_cycle = relay_lifecycle::LifeCycle::new();
        let handle = life_cycle.handle();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(manager.try_acquire_send_permission(ip, "mx.example.net"));

        let sweeper = manager.start_sweeper(handle.subscribe());
        tokio::time::advance(Duration::from_secs(90)).await;
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        k9::assert_equal!(manager.tracked(), 0);

        life_cycle.shutdown(None).await;
        sweeper.await.unwrap();
    }
}
