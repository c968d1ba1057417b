use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PatternId(pub i32);

impl std::fmt::Display for PatternId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Case-insensitive search of the destination host
    Regex,
    /// Case-insensitive exact match against any listed host
    CommaDelimited,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutboundMxPattern {
    pub id: PatternId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub pattern_type: PatternType,
    #[serde(default)]
    pub value: String,
    /// When set, the pattern only applies to sends from this IP
    #[serde(default)]
    pub limited_to_ip: Option<IpAddr>,
    #[serde(default)]
    pub order: i32,
    /// The catch-all pattern. Exactly one should exist.
    #[serde(default)]
    pub is_default: bool,
}

#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::EnumString,
    strum::Display,
)]
pub enum RuleType {
    MaxConnections,
    MaxMessagesPerConnection,
    MaxMessagesPerHour,
}

/// A single limit attached to a pattern. The value is kept as text
/// because that is how the tables are authored; it is interpreted
/// when the tables are compiled.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutboundRule {
    pub pattern_id: PatternId,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub value: String,
}

/// The raw pattern and rule tables as provided by a `RuleStore`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct RuleTables {
    #[serde(default, rename = "pattern")]
    pub patterns: Vec<OutboundMxPattern>,
    #[serde(default, rename = "rule")]
    pub rules: Vec<OutboundRule>,
}

/// Effective limits for a destination. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleSet {
    pub max_connections: Option<usize>,
    pub max_messages_per_connection: Option<usize>,
    pub max_messages_per_hour: Option<u64>,
}

impl RuleSet {
    /// Used when a configured value cannot be interpreted
    pub const CONSERVATIVE: Self = Self {
        max_connections: Some(1),
        max_messages_per_connection: Some(1),
        max_messages_per_hour: None,
    };

    pub fn limit(&self, rule_type: RuleType) -> Option<u64> {
        match rule_type {
            RuleType::MaxConnections => self.max_connections.map(|n| n as u64),
            RuleType::MaxMessagesPerConnection => {
                self.max_messages_per_connection.map(|n| n as u64)
            }
            RuleType::MaxMessagesPerHour => self.max_messages_per_hour,
        }
    }

    fn set_limit(&mut self, rule_type: RuleType, value: Option<u64>) {
        match rule_type {
            RuleType::MaxConnections => self.max_connections = value.map(|n| n as usize),
            RuleType::MaxMessagesPerConnection => {
                self.max_messages_per_connection = value.map(|n| n as usize)
            }
            RuleType::MaxMessagesPerHour => self.max_messages_per_hour = value,
        }
    }
}

/// Interpret a rule value: `-1` means unlimited, otherwise a
/// non-negative integer.
pub fn parse_rule_value(value: &str) -> Result<Option<u64>, std::num::ParseIntError> {
    let value = value.trim();
    if value == "-1" {
        return Ok(None);
    }
    value.parse::<u64>().map(Some)
}

/// Fold the rules for one pattern over `base`. Values that cannot be
/// parsed degrade to the conservative default for that rule type.
pub(crate) fn apply_rules<'a>(
    pattern_id: PatternId,
    base: RuleSet,
    rules: impl Iterator<Item = &'a OutboundRule>,
) -> RuleSet {
    let mut set = base;
    for rule in rules {
        match parse_rule_value(&rule.value) {
            Ok(value) => set.set_limit(rule.rule_type, value),
            Err(err) => {
                let fallback = RuleSet::CONSERVATIVE.limit(rule.rule_type);
                tracing::warn!(
                    "pattern {pattern_id}: invalid {} value {:?} ({err}); using {fallback:?}",
                    rule.rule_type,
                    rule.value
                );
                set.set_limit(rule.rule_type, fallback);
            }
        }
    }
    set
}
