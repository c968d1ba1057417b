//! Mail exchanger resolution for outbound delivery.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

mod hickory;
mod static_resolver;

pub use hickory::HickoryMxResolver;
pub use static_resolver::StaticMxResolver;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MxSource {
    /// Published as an MX record
    #[default]
    Mx,
    /// The domain has no MX records; its own address records are used
    ARecordFallback,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub host: String,
    pub preference: u16,
    #[serde(default)]
    pub source: MxSource,
}

impl MxRecord {
    pub fn new(host: impl Into<String>, preference: u16) -> Self {
        Self {
            host: host.into(),
            preference,
            source: MxSource::Mx,
        }
    }

    pub fn fallback(domain: impl Into<String>) -> Self {
        Self {
            host: domain.into(),
            preference: 0,
            source: MxSource::ARecordFallback,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("invalid domain name {0:?}")]
    InvalidName(String),
    #[error("DNS lookup for {name} failed: {reason}")]
    LookupFailed { name: String, reason: String },
    #[error("no addresses found for {0}")]
    NoAddresses(String),
}

impl DnsError {
    /// Returns true if the lookup may succeed when retried later
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::LookupFailed { .. } | Self::NoAddresses(_))
    }
}

/// Resolves the ordered list of mail exchangers for a domain and the
/// addresses of a mail exchanger host.
#[async_trait]
pub trait MxResolver: Send + Sync {
    /// Returns the candidates in ascending preference order.
    /// An empty list means the domain does not accept mail, either
    /// because it does not exist or because it publishes a null MX.
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError>;

    async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
}

/// Lowercase and strip any trailing dot
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Build the candidate list from raw `(preference, exchange)` pairs.
/// Candidates are sorted by preference, then by host name so that the
/// order is stable across lookups. A null MX (exchange `.`) means
/// the domain accepts no mail at all.
pub fn ordered_mx_records<I, S>(entries: I) -> Vec<MxRecord>
where
    I: IntoIterator<Item = (u16, S)>,
    S: AsRef<str>,
{
    let mut records = vec![];
    for (preference, exchange) in entries {
        let host = normalize_name(exchange.as_ref());
        if host.is_empty() {
            tracing::debug!("null MX published; domain accepts no mail");
            return vec![];
        }
        if !records.iter().any(|r: &MxRecord| r.host == host) {
            records.push(MxRecord::new(host, preference));
        }
    }
    records.sort_by(|a, b| {
        a.preference
            .cmp(&b.preference)
            .then_with(|| a.host.cmp(&b.host))
    });
    records
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mx_ordering() {
        let records = ordered_mx_records([
            (20, "MX2.example.com."),
            (10, "mx1b.example.com."),
            (10, "mx1a.example.com"),
            (20, "mx2.example.com"),
        ]);
        k9::assert_equal!(
            records,
            vec![
                MxRecord::new("mx1a.example.com", 10),
                MxRecord::new("mx1b.example.com", 10),
                MxRecord::new("mx2.example.com", 20),
            ]
        );
    }

    #[test]
    fn null_mx() {
        k9::assert_equal!(ordered_mx_records([(0, ".")]), vec![]);
        k9::assert_equal!(ordered_mx_records(Vec::<(u16, &str)>::new()), vec![]);
    }

    #[test]
    fn temporary_errors() {
        assert!(DnsError::LookupFailed {
            name: "example.com".to_string(),
            reason: "timed out".to_string()
        }
        .is_temporary());
        assert!(!DnsError::InvalidName("..".to_string()).is_temporary());
    }
}
