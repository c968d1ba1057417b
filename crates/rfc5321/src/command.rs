use crate::client_types::SmtpClientTimeouts;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub local_part: String,
    pub domain: String,
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

impl TryFrom<&str> for Mailbox {
    type Error = &'static str;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let s = s.trim().trim_start_matches('<').trim_end_matches('>');
        match s.rsplit_once('@') {
            Some((local_part, domain)) if !local_part.is_empty() && !domain.is_empty() => {
                if domain.contains('@') || local_part.contains('@') {
                    return Err("wrong number of @ signs");
                }
                if !local_part.chars().all(is_local_part_char) {
                    return Err("invalid character in local part");
                }
                if !is_valid_domain(domain) {
                    return Err("invalid domain");
                }
                Ok(Self {
                    local_part: local_part.to_string(),
                    domain: domain.to_string(),
                })
            }
            Some(_) => Err("empty local part or domain"),
            None => Err("wrong number of @ signs"),
        }
    }
}

/// Anything that would end the command line or the angle bracketed
/// path is refused; quoting is not interpreted.
fn is_local_part_char(c: char) -> bool {
    !(c.is_control() || c.is_whitespace() || c == '<' || c == '>')
}

/// A dotted name of letters, digits and hyphens (non-ASCII labels are
/// allowed for SMTPUTF8), or an address literal such as `[192.0.2.1]`.
fn is_valid_domain(domain: &str) -> bool {
    if let Some(literal) = domain.strip_prefix('[').and_then(|d| d.strip_suffix(']')) {
        return !literal.is_empty()
            && literal
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-'));
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_alphanumeric() || c == '-' || (!c.is_ascii() && !c.is_control()))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversePath {
    Path(Mailbox),
    NullSender,
}

impl TryFrom<&str> for ReversePath {
    type Error = &'static str;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == "<>" {
            Ok(Self::NullSender)
        } else {
            Mailbox::try_from(trimmed).map(Self::Path)
        }
    }
}

impl fmt::Display for ReversePath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Path(p) => p.fmt(f),
            Self::NullSender => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardPath {
    Path(Mailbox),
    Postmaster,
}

impl ForwardPath {
    pub fn domain(&self) -> Option<&str> {
        match self {
            Self::Path(p) => Some(&p.domain),
            Self::Postmaster => None,
        }
    }
}

impl TryFrom<&str> for ForwardPath {
    type Error = &'static str;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == "<>" {
            Err("cannot send to null sender")
        } else if trimmed.eq_ignore_ascii_case("postmaster") {
            Ok(Self::Postmaster)
        } else {
            Mailbox::try_from(trimmed).map(Self::Path)
        }
    }
}

impl fmt::Display for ForwardPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Path(p) => p.fmt(f),
            Self::Postmaster => f.write_str("postmaster"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpParameter {
    pub name: String,
    pub value: Option<String>,
}

impl EsmtpParameter {
    pub fn new<N: Into<String>>(name: N, value: Option<&str>) -> Self {
        Self {
            name: name.into(),
            value: value.map(|v| v.to_string()),
        }
    }
}

impl fmt::Display for EsmtpParameter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.name, value),
            None => f.write_str(&self.name),
        }
    }
}

/// The subset of SMTP verbs that an outbound client issues
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    Helo(String),
    MailFrom {
        address: ReversePath,
        parameters: Vec<EsmtpParameter>,
    },
    RcptTo {
        address: ForwardPath,
        parameters: Vec<EsmtpParameter>,
    },
    Data,
    DataDot,
    Rset,
    Quit,
    Noop(Option<String>),
}

fn encode_params(parameters: &[EsmtpParameter]) -> String {
    let mut params = String::new();
    for p in parameters {
        params.push(' ');
        params.push_str(&p.to_string());
    }
    params
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::Helo(domain) => format!("HELO {domain}\r\n"),
            Self::MailFrom {
                address,
                parameters,
            } => format!("MAIL FROM:<{address}>{}\r\n", encode_params(parameters)),
            Self::RcptTo {
                address,
                parameters,
            } => format!("RCPT TO:<{address}>{}\r\n", encode_params(parameters)),
            Self::Data => "DATA\r\n".to_string(),
            Self::DataDot => ".\r\n".to_string(),
            Self::Rset => "RSET\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
            Self::Noop(Some(param)) => format!("NOOP {param}\r\n"),
            Self::Noop(None) => "NOOP\r\n".to_string(),
        }
    }

    /// Timeouts for reading the response
    pub fn client_timeout(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        match self {
            Self::Helo(_) | Self::Ehlo(_) => timeouts.ehlo_timeout,
            Self::MailFrom { .. } => timeouts.mail_from_timeout,
            Self::RcptTo { .. } => timeouts.rcpt_to_timeout,
            Self::Data => timeouts.data_timeout,
            Self::DataDot => timeouts.data_dot_timeout,
            Self::Rset => timeouts.rset_timeout,
            Self::Quit | Self::Noop(_) => timeouts.idle_timeout,
        }
    }

    /// Timeouts for writing the request
    pub fn client_timeout_request(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        let one_minute = Duration::from_secs(60);
        self.client_timeout(timeouts).min(one_minute)
    }
}
