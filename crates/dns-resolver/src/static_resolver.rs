use crate::{normalize_name, ordered_mx_records, DnsError, MxRecord, MxResolver};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;

/// A resolver answering from fixed tables, for closed environments
/// and tests.
///
/// A domain without MX entries that has host entries of its own
/// resolves through the address fallback, as it would in DNS.
#[derive(Debug, Default, Clone)]
pub struct StaticMxResolver {
    mx: HashMap<String, Vec<(u16, String)>>,
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticMxResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mx(mut self, domain: &str, host: &str, preference: u16) -> Self {
        self.add_mx(domain, host, preference);
        self
    }

    pub fn with_host(mut self, host: &str, addrs: &[IpAddr]) -> Self {
        self.add_host(host, addrs);
        self
    }

    pub fn add_mx(&mut self, domain: &str, host: &str, preference: u16) {
        self.mx
            .entry(normalize_name(domain))
            .or_default()
            .push((preference, host.to_string()));
    }

    pub fn add_host(&mut self, host: &str, addrs: &[IpAddr]) {
        self.hosts
            .entry(normalize_name(host))
            .or_default()
            .extend_from_slice(addrs);
    }
}

#[async_trait]
impl MxResolver for StaticMxResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError> {
        let domain = normalize_name(domain);
        if domain.is_empty() {
            return Err(DnsError::InvalidName(domain));
        }
        if let Some(entries) = self.mx.get(&domain) {
            return Ok(ordered_mx_records(
                entries.iter().map(|(pref, host)| (*pref, host.as_str())),
            ));
        }
        if self.hosts.contains_key(&domain) {
            return Ok(vec![MxRecord::fallback(domain)]);
        }
        Ok(vec![])
    }

    async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let host = normalize_name(host);
        match self.hosts.get(&host) {
            Some(addrs) if !addrs.is_empty() => Ok(addrs.clone()),
            _ => Err(DnsError::NoAddresses(host)),
        }
    }
}
