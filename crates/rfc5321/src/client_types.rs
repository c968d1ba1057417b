use serde::{Deserialize, Serialize};
use std::time::Duration;

const GREETING_TIMEOUT: Duration = Duration::from_secs(60);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for each step of a session. Fields that are not
/// given in a config file keep their default.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SmtpClientTimeouts {
    /// TCP connect
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// The 220 greeting
    #[serde(with = "humantime_serde")]
    pub banner_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub ehlo_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub mail_from_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub rcpt_to_timeout: Duration,
    /// The 354 reply to DATA
    #[serde(with = "humantime_serde")]
    pub data_timeout: Duration,
    /// The reply to the terminating dot
    #[serde(with = "humantime_serde")]
    pub data_dot_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub rset_timeout: Duration,
    /// QUIT and NOOP
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for SmtpClientTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: GREETING_TIMEOUT,
            banner_timeout: GREETING_TIMEOUT,
            ehlo_timeout: COMMAND_TIMEOUT,
            mail_from_timeout: COMMAND_TIMEOUT,
            rcpt_to_timeout: COMMAND_TIMEOUT,
            data_timeout: COMMAND_TIMEOUT,
            data_dot_timeout: COMMAND_TIMEOUT,
            rset_timeout: HOUSEKEEPING_TIMEOUT,
            idle_timeout: HOUSEKEEPING_TIMEOUT,
        }
    }
}

impl SmtpClientTimeouts {
    /// The same timeout for every step
    pub fn uniform(duration: Duration) -> Self {
        Self {
            connect_timeout: duration,
            banner_timeout: duration,
            ehlo_timeout: duration,
            mail_from_timeout: duration,
            rcpt_to_timeout: duration,
            data_timeout: duration,
            data_dot_timeout: duration,
            rset_timeout: duration,
            idle_timeout: duration,
        }
    }

    pub fn short_timeouts() -> Self {
        Self::uniform(Duration::from_secs(20))
    }
}

/// A complete, possibly multi-line, reply from the peer
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Hash)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// The text of the reply with the enhanced code removed from each
    /// line. Lines are joined with `\n`; serialized as a single line.
    #[serde(serialize_with = "serialize_single_line")]
    pub content: String,
    /// The command that elicited this reply, if any
    pub command: Option<String>,
}

impl Response {
    /// `code [enhanced] text` with line breaks flattened to spaces
    pub fn to_single_line(&self) -> String {
        let text = remove_line_break(&self.content);
        match &self.enhanced_code {
            Some(enh) => format!("{} {enh} {text}", self.code),
            None => format!("{} {text}", self.code),
        }
    }

    /// 2xx and 3xx replies
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.code)
    }

    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn is_permanent(&self) -> bool {
        (500..600).contains(&self.code)
    }

    /// The peer is shutting down the transmission channel (421)
    pub fn is_service_unavailable(&self) -> bool {
        self.code == 421
    }

    /// Synthesize a reply, typically to describe a local failure in
    /// the same terms as a remote one. A leading enhanced status code
    /// in `message` is parsed out.
    pub fn with_code_and_message(code: u16, message: &str) -> Self {
        let mut lines = message.lines();
        let mut reply = MultiLineResponse::start(&ResponseLine {
            code,
            is_final: true,
            content: lines.next().unwrap_or(""),
        });
        for content in lines {
            reply.append_text(content);
        }
        reply.finish(None)
    }
}

/// An RFC 3463 status code such as `5.1.1`
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Hash)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl std::fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

impl EnhancedStatusCode {
    /// Split a leading `class.subject.detail ` from `text`. Only the
    /// defined classes 2, 4 and 5 are recognized.
    pub fn split_prefix(text: &str) -> Option<(Self, &str)> {
        let (code, rest) = text.split_once(' ')?;
        let mut parts = code.split('.');
        let class: u8 = parts.next()?.parse().ok()?;
        let subject: u16 = parts.next()?.parse().ok()?;
        let detail: u16 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !matches!(class, 2 | 4 | 5) {
            return None;
        }
        Some((
            Self {
                class,
                subject,
                detail,
            },
            rest,
        ))
    }
}

/// Replace CR, LF and CRLF sequences with a single space each
pub fn remove_line_break(data: &str) -> String {
    data.replace("\r\n", " ").replace(['\r', '\n'], " ")
}

/// One line of a reply as it appeared on the wire
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ResponseLine<'a> {
    pub code: u16,
    /// `250 ` rather than `250-`
    pub is_final: bool,
    pub content: &'a str,
}

impl<'a> ResponseLine<'a> {
    /// Parse `NNN text`, `NNN-text` or a bare `NNN`
    pub fn parse(line: &'a str) -> Option<Self> {
        let code = line.get(0..3)?;
        if !code.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let code = code.parse().ok()?;
        match line.as_bytes().get(3) {
            None => Some(Self {
                code,
                is_final: true,
                content: "",
            }),
            Some(b' ') => Some(Self {
                code,
                is_final: true,
                content: &line[4..],
            }),
            Some(b'-') => Some(Self {
                code,
                is_final: false,
                content: &line[4..],
            }),
            Some(_) => None,
        }
    }
}

/// Accumulates the lines of a multi-line reply
pub(crate) struct MultiLineResponse {
    code: u16,
    enhanced_code: Option<EnhancedStatusCode>,
    content: String,
}

impl MultiLineResponse {
    pub fn start(first: &ResponseLine) -> Self {
        let (enhanced_code, content) = match EnhancedStatusCode::split_prefix(first.content) {
            Some((enh, rest)) => (Some(enh), rest),
            None => (None, first.content),
        };
        Self {
            code: first.code,
            enhanced_code,
            content: content.to_string(),
        }
    }

    /// Add a continuation line. Fails with the offending line when its
    /// code differs from the first line.
    pub fn push(&mut self, line: &ResponseLine) -> Result<(), String> {
        if line.code != self.code {
            let sep = if line.is_final { ' ' } else { '-' };
            return Err(format!("{}{sep}{}", line.code, line.content));
        }
        self.append_text(line.content);
        Ok(())
    }

    fn append_text(&mut self, text: &str) {
        let repeated = self
            .enhanced_code
            .map(|enh| format!("{enh} "))
            .and_then(|prefix| text.strip_prefix(prefix.as_str()));
        self.content.push('\n');
        self.content.push_str(repeated.unwrap_or(text));
    }

    pub fn finish(self, command: Option<String>) -> Response {
        Response {
            code: self.code,
            enhanced_code: self.enhanced_code,
            content: self.content,
            command,
        }
    }
}

fn serialize_single_line<S>(content: &str, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&remove_line_break(content))
}
