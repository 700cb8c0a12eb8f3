//! DNS resolution with per-record TTLs and in-flight deduplication

use crate::Result;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::RData;
use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// One resolved address with its advertised TTL.
/// `ttl: None` marks an address that never expires (literal IPs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedIp {
    pub ip: IpAddr,
    pub ttl: Option<Duration>,
}

/// Resolver wrapper. Concurrent lookups of the same domain share a single
/// in-flight request; every waiter receives the same answer exactly once.
pub struct DnsClient {
    resolver: TokioAsyncResolver,
    ipv6: bool,
    timeout: Duration,
    in_flight: Mutex<HashMap<String, Vec<oneshot::Sender<Vec<ResolvedIp>>>>>,
}

impl DnsClient {
    pub fn new(ipv6: bool, timeout: Duration) -> Result<Self> {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(r) => r,
            Err(e) => {
                warn!("System resolver unavailable ({}), using defaults", e);
                let mut opts = ResolverOpts::default();
                opts.timeout = Duration::from_secs(5);
                opts.attempts = 2;
                TokioAsyncResolver::tokio(ResolverConfig::default(), opts)
            }
        };
        Ok(DnsClient {
            resolver,
            ipv6,
            timeout,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a domain to addresses with TTLs. Literal IPs return
    /// immediately with an infinite TTL. An empty result means resolution
    /// failed; the caller decides what that implies.
    ///
    /// `apply_timeout` bounds the lookup; it is off when the caller has no
    /// proxy fallback and a direct answer is the only option.
    pub async fn resolve(&self, domain: &str, apply_timeout: bool) -> Vec<ResolvedIp> {
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return vec![ResolvedIp { ip, ttl: None }];
        }

        let rx = {
            let mut in_flight = self.in_flight.lock();
            if let Some(waiters) = in_flight.get_mut(domain) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            } else {
                in_flight.insert(domain.to_string(), Vec::new());
                None
            }
        };

        if let Some(rx) = rx {
            return rx.await.unwrap_or_default();
        }

        let lookup = self.lookup(domain);
        let ips = if apply_timeout {
            match tokio::time::timeout(self.timeout, lookup).await {
                Ok(ips) => ips,
                Err(_) => {
                    debug!("DNS lookup for {} timed out", domain);
                    Vec::new()
                }
            }
        } else {
            lookup.await
        };

        let waiters = self.in_flight.lock().remove(domain).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(ips.clone());
        }
        ips
    }

    async fn lookup(&self, domain: &str) -> Vec<ResolvedIp> {
        let mut out = Vec::new();

        match self.resolver.ipv4_lookup(domain).await {
            Ok(lookup) => {
                for rec in lookup.as_lookup().record_iter() {
                    if let Some(RData::A(a)) = rec.data() {
                        out.push(ResolvedIp {
                            ip: IpAddr::V4(a.0),
                            ttl: Some(Duration::from_secs(rec.ttl() as u64)),
                        });
                    }
                }
            }
            Err(e) => debug!("A lookup for {} failed: {}", domain, e),
        }

        if self.ipv6 {
            match self.resolver.ipv6_lookup(domain).await {
                Ok(lookup) => {
                    for rec in lookup.as_lookup().record_iter() {
                        if let Some(RData::AAAA(aaaa)) = rec.data() {
                            out.push(ResolvedIp {
                                ip: IpAddr::V6(aaaa.0),
                                ttl: Some(Duration::from_secs(rec.ttl() as u64)),
                            });
                        }
                    }
                }
                Err(e) => debug!("AAAA lookup for {} failed: {}", domain, e),
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_literal_ip_short_circuit() {
        let dns = DnsClient::new(false, Duration::from_secs(1)).unwrap();
        let res = dns.resolve("203.0.113.9", true).await;
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].ip, "203.0.113.9".parse::<IpAddr>().unwrap());
        assert_eq!(res[0].ttl, None);
    }

    #[tokio::test]
    async fn test_literal_v6_short_circuit() {
        let dns = DnsClient::new(true, Duration::from_secs(1)).unwrap();
        let res = dns.resolve("::1", true).await;
        assert_eq!(res.len(), 1);
        assert!(res[0].ip.is_loopback());
    }
}
