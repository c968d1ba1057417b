use crate::{normalize_name, ordered_mx_records, DnsError, MxRecord, MxResolver};
use async_trait::async_trait;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{ResolveError, TokioResolver};
use lruttl::LruCacheWithTtl;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const MIN_CACHE_TTL: Duration = Duration::from_secs(60);
const MAX_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Resolves using the system resolver configuration, caching
/// answers for their DNS TTL bounded to a minute..an hour.
pub struct HickoryMxResolver {
    resolver: TokioResolver,
    mx_cache: LruCacheWithTtl<String, Arc<Vec<MxRecord>>>,
    ip_cache: LruCacheWithTtl<String, Arc<Vec<IpAddr>>>,
}

fn cache_expiry(valid_until: std::time::Instant) -> Instant {
    let ttl = valid_until
        .saturating_duration_since(std::time::Instant::now())
        .clamp(MIN_CACHE_TTL, MAX_CACHE_TTL);
    Instant::now() + ttl
}

fn lookup_failed(name: &str, err: ResolveError) -> DnsError {
    DnsError::LookupFailed {
        name: name.to_string(),
        reason: err.to_string(),
    }
}

impl HickoryMxResolver {
    pub fn from_system_conf() -> Result<Self, DnsError> {
        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|err| lookup_failed("system configuration", err))?
            .build();
        Ok(Self::with_resolver(resolver))
    }

    pub fn with_resolver(resolver: TokioResolver) -> Self {
        Self {
            resolver,
            mx_cache: LruCacheWithTtl::new("dns_resolver_mx", 64 * 1024),
            ip_cache: LruCacheWithTtl::new("dns_resolver_ip", 1024),
        }
    }

    async fn lookup_mx(&self, domain: &str) -> Result<(Vec<MxRecord>, Instant), DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let expires = cache_expiry(lookup.valid_until());
                let records = ordered_mx_records(lookup.iter().map(|mx| {
                    let exchange = mx.exchange();
                    let host = if exchange.is_root() {
                        ".".to_string()
                    } else {
                        exchange.to_utf8()
                    };
                    (mx.preference(), host)
                }));
                Ok((records, expires))
            }
            Err(err) if err.is_nx_domain() => {
                tracing::debug!("{domain} does not exist");
                Ok((vec![], Instant::now() + MIN_CACHE_TTL))
            }
            Err(err) if err.is_no_records_found() => {
                tracing::debug!("no MX records for {domain}, falling back to A/AAAA");
                match self.resolver.lookup_ip(domain).await {
                    Ok(lookup) if lookup.iter().next().is_some() => Ok((
                        vec![MxRecord::fallback(domain)],
                        cache_expiry(lookup.valid_until()),
                    )),
                    Ok(_) => Ok((vec![], Instant::now() + MIN_CACHE_TTL)),
                    Err(err) if err.is_no_records_found() => {
                        Ok((vec![], Instant::now() + MIN_CACHE_TTL))
                    }
                    Err(err) => Err(lookup_failed(domain, err)),
                }
            }
            Err(err) => {
                tracing::warn!("MX lookup for {domain} failed: {err}");
                Err(lookup_failed(domain, err))
            }
        }
    }
}

#[async_trait]
impl MxResolver for HickoryMxResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError> {
        let domain = normalize_name(domain);
        if domain.is_empty() {
            return Err(DnsError::InvalidName(domain));
        }
        if let Some(records) = self.mx_cache.get(&domain) {
            return Ok(records.as_ref().clone());
        }

        let (records, expires) = self.lookup_mx(&domain).await?;
        let records = self.mx_cache.insert(domain, Arc::new(records), expires);
        Ok(records.as_ref().clone())
    }

    async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let host = normalize_name(host);
        if let Some(addrs) = self.ip_cache.get(&host) {
            return Ok(addrs.as_ref().clone());
        }

        let lookup = match self.resolver.lookup_ip(host.as_str()).await {
            Ok(lookup) => lookup,
            Err(err) if err.is_no_records_found() => {
                return Err(DnsError::NoAddresses(host));
            }
            Err(err) => return Err(lookup_failed(&host, err)),
        };
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            return Err(DnsError::NoAddresses(host));
        }
        let expires = cache_expiry(lookup.valid_until());
        let addrs = self.ip_cache.insert(host, Arc::new(addrs), expires);
        Ok(addrs.as_ref().clone())
    }
}
