//! Candidate data model and health classification

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A connectable endpoint: an upstream proxy or a directly-resolved IP.
/// Immutable once constructed, shared via `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub ip: IpAddr,
    pub port: u16,
    /// True for a path connecting straight to the resolved origin IP
    pub direct: bool,
    /// Domain patterns (regex) always routed through this target
    pub fixed_domains: Vec<String>,
}

impl Target {
    pub fn proxy(ip: IpAddr, port: u16, fixed_domains: Vec<String>) -> Arc<Self> {
        Arc::new(Target {
            ip,
            port,
            direct: false,
            fixed_domains,
        })
    }

    pub fn direct(ip: IpAddr, port: u16) -> Arc<Self> {
        Arc::new(Target {
            ip,
            port,
            direct: true,
            fixed_domains: Vec::new(),
        })
    }
}

/// Measured health of one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Zero loss, low latency, no outstanding negative feedback
    Good,
    /// Usable but unproven
    Work,
    /// Lossy or repeatedly underperforming in live races
    Bad,
}

/// Per-destination, per-target candidate entry.
///
/// Created fresh whenever a destination is (re)diagnosed; the whole list for
/// a `domain:port` key is replaced wholesale when the TTL forces a new
/// diagnosis.
#[derive(Debug, Clone)]
pub struct CandidateStats {
    pub domain: String,
    pub port: u16,
    /// Composite key, `domain:port`
    pub d_and_p: String,
    pub target: Arc<Target>,
    /// Wall-clock millis of last verification
    pub updated_at_ms: u64,
    /// DNS TTL; `None` means never expires (proxies, literal IPs)
    pub ttl: Option<Duration>,
    /// Packet loss percentage, -1.0 = untested
    pub loss_pct: f32,
    /// Ping latency in millis, 0 = untested
    pub latency_ms: u32,
    /// Last latency observed from a live race
    pub last_race_latency_ms: u32,
    pub status: HealthStatus,
}

impl CandidateStats {
    pub fn new(domain: &str, port: u16, target: Arc<Target>, ttl: Option<Duration>) -> Self {
        CandidateStats {
            domain: domain.to_string(),
            port,
            d_and_p: format!("{}:{}", domain, port),
            target,
            updated_at_ms: now_millis(),
            ttl,
            loss_pct: -1.0,
            latency_ms: 0,
            last_race_latency_ms: 0,
            status: HealthStatus::Work,
        }
    }

    /// Whether `updated_at_ms + ttl` has passed, with a lookahead margin.
    pub fn ttl_expired(&self, now_ms: u64, margin: Duration) -> bool {
        match self.ttl {
            None => false,
            Some(ttl) => {
                let expires_at = self.updated_at_ms.saturating_add(ttl.as_millis() as u64);
                expires_at < now_ms.saturating_add(margin.as_millis() as u64)
            }
        }
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Derive a candidate's status from its measurements and the domain's
/// outstanding not-exactly-good counter.
pub fn classify(
    loss_pct: f32,
    latency_ms: u32,
    good_latency_ms: u32,
    not_good_count: f64,
    not_good_limit: f64,
) -> HealthStatus {
    if loss_pct > 0.0 || not_good_count > not_good_limit {
        HealthStatus::Bad
    } else if loss_pct == 0.0 && latency_ms < good_latency_ms && not_good_count == 0.0 {
        HealthStatus::Good
    } else {
        HealthStatus::Work
    }
}

/// One ping outcome for a resolved IP
#[derive(Debug, Clone, Copy)]
pub struct ProbeReport {
    pub loss_pct: f32,
    pub latency_ms: u32,
}

/// Build direct candidates from ping reports and merge them into the seeded
/// proxy list: IPs above the loss ceiling are dropped, survivors are sorted
/// by ascending loss and capped at the best two, `Good` entries go to the
/// front of the list and the rest to the back.
pub fn merge_probed(
    seeded: &mut Vec<CandidateStats>,
    mut probed: Vec<CandidateStats>,
    max_loss_pct: f32,
) {
    probed.retain(|c| c.loss_pct >= 0.0 && c.loss_pct <= max_loss_pct);
    probed.sort_by(|a, b| a.loss_pct.partial_cmp(&b.loss_pct).unwrap_or(std::cmp::Ordering::Equal));
    for cand in probed.into_iter().take(2) {
        if cand.status == HealthStatus::Good {
            seeded.insert(0, cand);
        } else {
            seeded.push(cand);
        }
    }
}

/// Pick what the caller should race over.
///
/// A `Good` front entry with no outstanding feedback short-circuits to a
/// single candidate: no need to race at all. Otherwise every non-`Bad` entry
/// races; when none survive, a domain past the feedback limit falls back to
/// proxy entries only, and as a last resort the full list is returned.
pub fn select_candidates(
    list: &[CandidateStats],
    not_good_count: f64,
    not_good_limit: f64,
) -> Vec<CandidateStats> {
    if let Some(front) = list.first() {
        if front.status == HealthStatus::Good && not_good_count == 0.0 {
            return vec![front.clone()];
        }
    }
    let usable: Vec<CandidateStats> = list
        .iter()
        .filter(|c| c.status != HealthStatus::Bad)
        .cloned()
        .collect();
    if !usable.is_empty() {
        return usable;
    }
    if not_good_count > not_good_limit {
        let proxies: Vec<CandidateStats> =
            list.iter().filter(|c| !c.target.direct).cloned().collect();
        if !proxies.is_empty() {
            return proxies;
        }
    }
    list.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn direct(domain: &str, loss: f32, latency: u32, status: HealthStatus) -> CandidateStats {
        let mut c = CandidateStats::new(
            domain,
            443,
            Target::direct(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), 443),
            Some(Duration::from_secs(300)),
        );
        c.loss_pct = loss;
        c.latency_ms = latency;
        c.status = status;
        c
    }

    fn proxy_seed(domain: &str) -> CandidateStats {
        CandidateStats::new(
            domain,
            443,
            Target::proxy(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 8080, vec![]),
            None,
        )
    }

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(classify(0.0, 50, 150, 0.0, 3.5), HealthStatus::Good);
        assert_eq!(classify(0.0, 200, 150, 0.0, 3.5), HealthStatus::Work);
        assert_eq!(classify(10.0, 50, 150, 0.0, 3.5), HealthStatus::Bad);
        // outstanding feedback blocks good
        assert_eq!(classify(0.0, 50, 150, 1.0, 3.5), HealthStatus::Work);
        // feedback past the limit forces bad even with clean pings
        assert_eq!(classify(0.0, 50, 150, 4.0, 3.5), HealthStatus::Bad);
    }

    #[test]
    fn test_merge_good_goes_first_and_caps_two() {
        let mut list = vec![proxy_seed("example.com")];
        let probed = vec![
            direct("example.com", 20.0, 80, HealthStatus::Work),
            direct("example.com", 0.0, 40, HealthStatus::Good),
            direct("example.com", 5.0, 60, HealthStatus::Work),
        ];
        merge_probed(&mut list, probed, 50.0);
        // best two by loss kept: the good one in front, 5% loss one appended
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].status, HealthStatus::Good);
        assert!(list[0].target.direct);
        assert!(!list[1].target.direct);
        assert_eq!(list[2].loss_pct, 5.0);
    }

    #[test]
    fn test_merge_drops_lossy() {
        let mut list = vec![proxy_seed("example.com")];
        merge_probed(
            &mut list,
            vec![direct("example.com", 80.0, 40, HealthStatus::Bad)],
            50.0,
        );
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_select_short_circuit() {
        let list = vec![
            direct("example.com", 0.0, 40, HealthStatus::Good),
            proxy_seed("example.com"),
        ];
        let picked = select_candidates(&list, 0.0, 3.5);
        assert_eq!(picked.len(), 1);
        assert!(picked[0].target.direct);
    }

    #[test]
    fn test_select_skips_short_circuit_with_feedback() {
        let list = vec![
            direct("example.com", 0.0, 40, HealthStatus::Good),
            proxy_seed("example.com"),
        ];
        let picked = select_candidates(&list, 1.0, 3.5);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn test_select_filters_bad() {
        let list = vec![
            proxy_seed("example.com"),
            direct("example.com", 10.0, 40, HealthStatus::Bad),
        ];
        let picked = select_candidates(&list, 0.0, 3.5);
        assert_eq!(picked.len(), 1);
        assert!(!picked[0].target.direct);
    }

    #[test]
    fn test_select_proxy_only_past_limit() {
        let list = vec![
            direct("example.com", 10.0, 40, HealthStatus::Bad),
            proxy_seed("example.com"),
        ];
        // mark the proxy bad too, so the non-bad filter comes up empty
        let mut list: Vec<CandidateStats> = list;
        list[1].status = HealthStatus::Bad;
        let picked = select_candidates(&list, 4.0, 3.5);
        assert_eq!(picked.len(), 1);
        assert!(!picked[0].target.direct);
    }

    #[test]
    fn test_ttl_expiry() {
        let mut c = direct("example.com", 0.0, 40, HealthStatus::Good);
        c.ttl = Some(Duration::from_secs(60));
        let now = c.updated_at_ms;
        assert!(!c.ttl_expired(now + 30_000, Duration::ZERO));
        assert!(c.ttl_expired(now + 61_000, Duration::ZERO));
        // lookahead margin pulls expiry earlier
        assert!(c.ttl_expired(now + 45_000, Duration::from_secs(30)));
        c.ttl = None;
        assert!(!c.ttl_expired(now + 10_000_000, Duration::ZERO));
    }
}
