use regex::{Regex, RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;

mod dsn;

pub use dsn::extract_bounce_text;

/// Whether a failure is worth retrying
#[derive(
    Serialize,
    Deserialize,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Copy,
    Clone,
    Default,
    strum::EnumString,
    strum::Display,
)]
pub enum BounceType {
    #[default]
    Unknown,
    NotABounce,
    /// Transient; the message may be retried
    Soft,
    /// Permanent; retrying will not help
    Hard,
}

/// The reason bucket for a failure
#[derive(
    Serialize,
    Deserialize,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Copy,
    Clone,
    Default,
    strum::EnumString,
    strum::Display,
)]
pub enum BounceCode {
    #[default]
    Unknown,
    NotABounce,
    /// The mailbox does not exist or cannot accept mail
    BadEmailAddress,
    General,
    MailboxFull,
    MessageSizeTooLarge,
    /// Routing or connectivity problems reaching the destination
    UnableToConnect,
    ServiceUnavailable,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Copy, Clone, Default)]
pub struct BouncePair {
    pub bounce_type: BounceType,
    pub bounce_code: BounceCode,
}

impl BouncePair {
    pub const fn new(bounce_type: BounceType, bounce_code: BounceCode) -> Self {
        Self {
            bounce_type,
            bounce_code,
        }
    }

    pub fn is_hard(&self) -> bool {
        self.bounce_type == BounceType::Hard
    }
}

impl std::fmt::Display for BouncePair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.bounce_type, self.bounce_code)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Criteria {
    Regex(String),
    Substring(String),
}

impl Criteria {
    fn to_pattern(&self) -> String {
        match self {
            Self::Regex(re) => re.clone(),
            Self::Substring(s) => regex::escape(s),
        }
    }
}

/// A user supplied classification; rules are tried in the order
/// that they were added and the first match wins.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BounceRule {
    #[serde(rename = "type")]
    pub bounce_type: BounceType,
    pub code: BounceCode,
    #[serde(flatten)]
    pub criteria: Criteria,
}

/// Defines the content of bounce rules files
#[derive(Deserialize, Serialize, Debug, Default)]
pub struct BounceRulesFile {
    #[serde(default)]
    pub rules: Vec<BounceRule>,
}

#[derive(Error, Debug)]
pub enum BounceRuleError {
    #[error("reading file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("decoding {path} as BounceRulesFile: {reason}")]
    Decode { path: String, reason: String },
    #[error("compiling rules: {0}")]
    Compile(#[from] regex::Error),
}

/// Holds state for compiling rules files into a classifier
#[derive(Default)]
pub struct BounceClassifierBuilder {
    rules: Vec<BounceRule>,
}

impl BounceClassifierBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: BounceRule) {
        self.rules.push(rule);
    }

    pub fn merge(&mut self, mut decoded_file: BounceRulesFile) {
        self.rules.append(&mut decoded_file.rules);
    }

    fn read(path: &Path) -> Result<String, BounceRuleError> {
        std::fs::read_to_string(path).map_err(|source| BounceRuleError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn merge_json_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), BounceRuleError> {
        let path = path.as_ref();
        let data = Self::read(path)?;
        let decoded: BounceRulesFile =
            serde_json::from_str(&data).map_err(|err| BounceRuleError::Decode {
                path: path.display().to_string(),
                reason: format!("{err:#}"),
            })?;
        self.merge(decoded);
        Ok(())
    }

    pub fn merge_toml_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), BounceRuleError> {
        let path = path.as_ref();
        let data = Self::read(path)?;
        let decoded: BounceRulesFile =
            toml::from_str(&data).map_err(|err| BounceRuleError::Decode {
                path: path.display().to_string(),
                reason: format!("{err:#}"),
            })?;
        self.merge(decoded);
        Ok(())
    }

    /// Merge a file, picking the decoder from its extension
    pub fn merge_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), BounceRuleError> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => self.merge_json_file(path),
            _ => self.merge_toml_file(path),
        }
    }

    pub fn build(self) -> Result<BounceClassifier, BounceRuleError> {
        let patterns: Vec<String> = self.rules.iter().map(|r| r.criteria.to_pattern()).collect();
        let pattern_to_pair = self
            .rules
            .iter()
            .map(|r| BouncePair::new(r.bounce_type, r.code))
            .collect();

        let set = RegexSetBuilder::new(patterns)
            .case_insensitive(true)
            .build()?;
        tracing::debug!("compiled {} bounce rules", set.len());
        Ok(BounceClassifier {
            set,
            pattern_to_pair,
        })
    }
}

static NDR_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\d.])([245])\.(\d{1,3})\.(\d{1,3})(?:[^\d.]|\.(?:\s|$)|$)")
        .expect("NDR code pattern is valid")
});

static SMTP_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([2-5])(\d\d)(?:[\s-]|$)").expect("SMTP code pattern is valid"));

const SUCCESS: BouncePair = BouncePair::new(BounceType::Unknown, BounceCode::NotABounce);

fn type_for_class(class: u8) -> BounceType {
    match class {
        4 => BounceType::Soft,
        5 => BounceType::Hard,
        _ => BounceType::NotABounce,
    }
}

/// Map the subject/detail of an enhanced status code to a bucket
fn ndr_bucket(subject: u16, detail: u16) -> BounceCode {
    match (subject, detail) {
        (1, _) => BounceCode::BadEmailAddress,
        (2, 2) => BounceCode::MailboxFull,
        (2, 3) => BounceCode::MessageSizeTooLarge,
        (2, _) => BounceCode::BadEmailAddress,
        (3, 4) => BounceCode::MessageSizeTooLarge,
        (4, _) => BounceCode::UnableToConnect,
        _ => BounceCode::General,
    }
}

fn smtp_bucket(code: u16) -> BounceCode {
    match code {
        450 | 550 | 551 | 553 => BounceCode::BadEmailAddress,
        431 | 452 | 552 => BounceCode::MailboxFull,
        421 | 521 | 530 => BounceCode::ServiceUnavailable,
        _ => BounceCode::General,
    }
}

fn find_smtp_code(s: &str) -> Option<u16> {
    let caps = SMTP_CODE.captures(s)?;
    let class: u16 = caps.get(1)?.as_str().parse().ok()?;
    let rest: u16 = caps.get(2)?.as_str().parse().ok()?;
    Some(class * 100 + rest)
}

fn classify_by_ndr(s: &str) -> Option<BouncePair> {
    let caps = NDR_CODE.captures(s)?;
    let class: u8 = caps.get(1)?.as_str().parse().ok()?;
    let subject: u16 = caps.get(2)?.as_str().parse().ok()?;
    let detail: u16 = caps.get(3)?.as_str().parse().ok()?;

    if class == 2 {
        return Some(BouncePair::new(BounceType::NotABounce, BounceCode::NotABounce));
    }

    let mut bucket = ndr_bucket(subject, detail);
    if bucket == BounceCode::General {
        // An enhanced code such as 4.7.0 cannot express that the peer
        // is closing the channel; the reply code can
        if let Some(code) = find_smtp_code(s) {
            if smtp_bucket(code) == BounceCode::ServiceUnavailable {
                bucket = BounceCode::ServiceUnavailable;
            }
        }
    }
    Some(BouncePair::new(type_for_class(class), bucket))
}

fn classify_by_smtp_code(s: &str) -> Option<BouncePair> {
    let code = find_smtp_code(s)?;
    if code < 400 {
        return Some(SUCCESS);
    }
    Some(BouncePair::new(
        type_for_class((code / 100) as u8),
        smtp_bucket(code),
    ))
}

pub struct BounceClassifier {
    set: RegexSet,
    pattern_to_pair: Vec<BouncePair>,
}

impl Default for BounceClassifier {
    fn default() -> Self {
        Self {
            set: RegexSet::empty(),
            pattern_to_pair: vec![],
        }
    }
}

impl BounceClassifier {
    /// The classification from the first matching user rule, if any
    pub fn match_rules(&self, s: &str) -> Option<BouncePair> {
        self.set
            .matches(s)
            .into_iter()
            .next()
            .and_then(|idx| self.pattern_to_pair.get(idx))
            .copied()
    }

    /// Classify free text such as an SMTP reply or a diagnostic line
    pub fn classify_str(&self, s: &str) -> BouncePair {
        self.match_rules(s)
            .or_else(|| classify_by_ndr(s))
            .or_else(|| classify_by_smtp_code(s))
            .unwrap_or_default()
    }

    pub fn classify_response(&self, response: &rfc5321::Response) -> BouncePair {
        let line = response.to_single_line();
        self.classify_str(&line)
    }

    /// Classify a complete non-delivery report message
    pub fn classify_bounce_email(&self, raw: &[u8]) -> BouncePair {
        match extract_bounce_text(raw) {
            Some(text) => self.classify_str(&text),
            None => BouncePair::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pair(bounce_type: BounceType, bounce_code: BounceCode) -> BouncePair {
        BouncePair::new(bounce_type, bounce_code)
    }

    #[test]
    fn builtin_classification() {
        let classifier = BounceClassifier::default();

        let corpus = &[
            (
                "550 5.1.1 mailbox unavailable",
                pair(BounceType::Hard, BounceCode::BadEmailAddress),
            ),
            (
                "421 4.7.0 throttled",
                pair(BounceType::Soft, BounceCode::ServiceUnavailable),
            ),
            ("4.1.1", pair(BounceType::Soft, BounceCode::BadEmailAddress)),
            ("250 Ok", pair(BounceType::Unknown, BounceCode::NotABounce)),
            (
                "552 5.2.2 mailbox is stuffed",
                pair(BounceType::Hard, BounceCode::MailboxFull),
            ),
            (
                "552 5.3.4 message too big",
                pair(BounceType::Hard, BounceCode::MessageSizeTooLarge),
            ),
            (
                "451 4.4.1 no answer from host",
                pair(BounceType::Soft, BounceCode::UnableToConnect),
            ),
            (
                "550 5.7.1 rejected by policy",
                pair(BounceType::Hard, BounceCode::General),
            ),
            (
                "452 too many recipients",
                pair(BounceType::Soft, BounceCode::MailboxFull),
            ),
            (
                "521 does not accept mail",
                pair(BounceType::Hard, BounceCode::ServiceUnavailable),
            ),
            (
                "554 transaction failed",
                pair(BounceType::Hard, BounceCode::General),
            ),
            (
                "delivery failed: status 5.1.1.",
                pair(BounceType::Hard, BounceCode::BadEmailAddress),
            ),
            (
                "connected to 10.5.1.12 and gave up",
                pair(BounceType::Unknown, BounceCode::Unknown),
            ),
            ("something odd", pair(BounceType::Unknown, BounceCode::Unknown)),
        ];

        for &(input, output) in corpus {
            assert_eq!(
                classifier.classify_str(input),
                output,
                "expected {input} -> {output:?}"
            );
        }
    }

    #[test]
    fn user_rules_take_precedence() {
        let mut builder = BounceClassifierBuilder::new();
        builder.add_rule(BounceRule {
            bounce_type: BounceType::Hard,
            code: BounceCode::BadEmailAddress,
            criteria: Criteria::Substring("user (unknown)".to_string()),
        });
        builder.add_rule(BounceRule {
            bounce_type: BounceType::Soft,
            code: BounceCode::MailboxFull,
            criteria: Criteria::Regex(r"over\s+quota".to_string()),
        });
        builder.add_rule(BounceRule {
            bounce_type: BounceType::Hard,
            code: BounceCode::General,
            criteria: Criteria::Regex("quota".to_string()),
        });
        let classifier = builder.build().unwrap();

        k9::assert_equal!(
            classifier.classify_str("451 4.3.0 User (Unknown) here"),
            pair(BounceType::Hard, BounceCode::BadEmailAddress)
        );
        // first match wins even though a later rule also matches
        k9::assert_equal!(
            classifier.classify_str("552 5.2.2 OVER   QUOTA"),
            pair(BounceType::Soft, BounceCode::MailboxFull)
        );
        // falls through to the built in handling
        k9::assert_equal!(
            classifier.classify_str("550 5.1.1 mailbox unavailable"),
            pair(BounceType::Hard, BounceCode::BadEmailAddress)
        );
    }

    #[test]
    fn rules_file_formats() {
        let toml_rules: BounceRulesFile = toml::from_str(
            r#"
[[rules]]
type = "Hard"
code = "BadEmailAddress"
substring = "no such user"

[[rules]]
type = "Soft"
code = "ServiceUnavailable"
regex = "try again (later|soon)"
"#,
        )
        .unwrap();
        k9::assert_equal!(toml_rules.rules.len(), 2);
        k9::assert_equal!(
            toml_rules.rules[1].criteria,
            Criteria::Regex("try again (later|soon)".to_string())
        );

        let json_rules: BounceRulesFile = serde_json::from_str(
            r#"{"rules": [{"type": "Soft", "code": "MailboxFull", "substring": "full"}]}"#,
        )
        .unwrap();

        let mut builder = BounceClassifierBuilder::new();
        builder.merge(toml_rules);
        builder.merge(json_rules);
        let classifier = builder.build().unwrap();
        k9::assert_equal!(
            classifier.classify_str("please try again soon"),
            pair(BounceType::Soft, BounceCode::ServiceUnavailable)
        );
        k9::assert_equal!(
            classifier.classify_str("the box is full"),
            pair(BounceType::Soft, BounceCode::MailboxFull)
        );
    }

    #[test]
    fn bad_regex_is_reported() {
        let mut builder = BounceClassifierBuilder::new();
        builder.add_rule(BounceRule {
            bounce_type: BounceType::Hard,
            code: BounceCode::General,
            criteria: Criteria::Regex("(unclosed".to_string()),
        });
        assert!(matches!(builder.build(), Err(BounceRuleError::Compile(_))));
    }

    #[test]
    fn classify_response() {
        let classifier = BounceClassifier::default();
        let response = rfc5321::Response::with_code_and_message(550, "5.1.1 no such user");
        k9::assert_equal!(
            classifier.classify_response(&response),
            pair(BounceType::Hard, BounceCode::BadEmailAddress)
        );
    }

    #[test]
    fn string_forms() {
        k9::assert_equal!(BounceCode::MailboxFull.to_string(), "MailboxFull");
        k9::assert_equal!(
            "ServiceUnavailable".parse::<BounceCode>().unwrap(),
            BounceCode::ServiceUnavailable
        );
        k9::assert_equal!(
            pair(BounceType::Soft, BounceCode::General).to_string(),
            "Soft/General"
        );
    }
}
