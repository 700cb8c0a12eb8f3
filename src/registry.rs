//! Target Registry: configured upstream proxies and fixed-domain overrides

use crate::config::UpstreamConfig;
use crate::diag::stats::Target;
use crate::Result;
use dashmap::DashMap;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// Static lookup over the configured upstream targets. A domain matching a
/// fixed pattern is always routed through the owning proxy, bypassing
/// diagnosis entirely.
pub struct TargetRegistry {
    proxies: Vec<Arc<Target>>,
    fixed: Vec<(Regex, Arc<Target>)>,
    memo: DashMap<String, Arc<Target>>,
}

impl TargetRegistry {
    pub fn from_config(upstreams: &[UpstreamConfig]) -> Result<Self> {
        let mut proxies = Vec::with_capacity(upstreams.len());
        let mut fixed = Vec::new();
        for up in upstreams {
            let target = Target::proxy(up.ip, up.port, up.fixed_domains.clone());
            for pattern in &up.fixed_domains {
                let re = Regex::new(pattern)
                    .map_err(|e| crate::Error::config(format!("pattern {:?}: {}", pattern, e)))?;
                fixed.push((re, target.clone()));
            }
            proxies.push(target);
        }
        Ok(TargetRegistry {
            proxies,
            fixed,
            memo: DashMap::new(),
        })
    }

    /// All configured proxy targets, in configuration order
    pub fn proxies(&self) -> &[Arc<Target>] {
        &self.proxies
    }

    pub fn has_proxies(&self) -> bool {
        !self.proxies.is_empty()
    }

    /// Proxy forced for a domain by a fixed pattern, if any. Matches are
    /// memoized per domain.
    pub fn fixed_target(&self, domain: &str) -> Option<Arc<Target>> {
        if let Some(hit) = self.memo.get(domain) {
            return Some(hit.clone());
        }
        for (re, target) in &self.fixed {
            if re.is_match(domain) {
                debug!("Domain {} pinned to proxy {}", domain, target.ip);
                self.memo.insert(domain.to_string(), target.clone());
                return Some(target.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TargetRegistry {
        TargetRegistry::from_config(&[
            UpstreamConfig {
                ip: "10.0.0.2".parse().unwrap(),
                port: 8080,
                fixed_domains: vec![r".*\.corp\.example".to_string()],
            },
            UpstreamConfig {
                ip: "10.0.0.3".parse().unwrap(),
                port: 1080,
                fixed_domains: vec![],
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_proxies_listed() {
        let reg = registry();
        assert_eq!(reg.proxies().len(), 2);
        assert!(reg.has_proxies());
        assert!(!reg.proxies()[0].direct);
    }

    #[test]
    fn test_fixed_match_and_memo() {
        let reg = registry();
        let hit = reg.fixed_target("wiki.corp.example").unwrap();
        assert_eq!(hit.port, 8080);
        // memoized second lookup returns the same target
        let again = reg.fixed_target("wiki.corp.example").unwrap();
        assert!(Arc::ptr_eq(&hit, &again));
        assert!(reg.fixed_target("example.com").is_none());
    }
}
