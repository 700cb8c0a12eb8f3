//! Channel Diagnostics Engine
//!
//! Owns per-destination candidate lists: seeds them with configured proxies,
//! resolves and ping-probes direct paths, classifies health, revalidates
//! DNS-derived candidates when their TTL runs out, persists usage counters
//! across restarts, and folds live feedback from the race connector back
//! into the health model.

pub mod dns;
pub mod feedback;
pub mod ping;
pub mod stats;
pub mod usage;

use crate::config::{Config, Tunables};
use crate::registry::TargetRegistry;
use crate::Result;
use dashmap::DashMap;
use dns::DnsClient;
use feedback::NotGoodLedger;
use stats::{classify, merge_probed, now_millis, select_candidates, CandidateStats, Target};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use usage::UsageBook;

/// Deadline for one restored-entry re-probe during startup
const RESTORE_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Debounce before an opportunistic cache save
const SAVE_DEBOUNCE: Duration = Duration::from_secs(2);

/// Cadence of the wall-clock polling daemon driving refresh and network
/// watching. Wall-clock based so cycles fire promptly after sleep/wake.
const POLL_TICK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default)]
struct DiagnoseFlags {
    /// Discard any cached list and measure from scratch
    rediagnose: bool,
    /// Wait for ping results instead of exposing a provisional candidate
    force_sync: bool,
    /// Skip request counting (internal refresh traffic)
    ignore_count: bool,
}

/// Diagnostics engine instance. One per process, shared via `Arc`; all maps
/// are owned here and mutated only through these methods.
pub struct DiagnosticEngine {
    registry: Arc<TargetRegistry>,
    dns: DnsClient,
    ledger: NotGoodLedger,
    usage: UsageBook,
    tunables: Tunables,
    stats_map: DashMap<String, Vec<CandidateStats>>,
    shutdown: CancellationToken,
    refresh_kick: Notify,
    /// Bumped to pre-empt a running refresh cycle
    refresh_generation: AtomicU64,
}

impl DiagnosticEngine {
    pub fn new(registry: Arc<TargetRegistry>, config: &Config) -> Result<Arc<Self>> {
        let tunables = config.tunables.clone();
        let dns = DnsClient::new(config.ipv6, Duration::from_millis(tunables.dns_timeout_ms))?;
        let usage = UsageBook::new(&config.cache_file, tunables.cache_domain_life_hours as u64);
        Ok(Arc::new(DiagnosticEngine {
            registry,
            dns,
            ledger: NotGoodLedger::new(),
            usage,
            tunables,
            stats_map: DashMap::new(),
            shutdown: CancellationToken::new(),
            refresh_kick: Notify::new(),
            refresh_generation: AtomicU64::new(0),
        }))
    }

    /// Candidate targets for a destination. Fixed-domain overrides bypass
    /// diagnosis entirely; everything else goes through `diagnose`.
    pub async fn get_targets(self: &Arc<Self>, addr: &str, port: u16) -> Vec<CandidateStats> {
        if let Some(target) = self.registry.fixed_target(addr) {
            return vec![CandidateStats::new(addr, port, target, None)];
        }
        self.diagnose_inner(addr, port, DiagnoseFlags::default())
            .await
    }

    /// Diagnose a destination and return the candidates worth racing.
    /// An empty result means neither DNS nor proxies offer a path.
    pub async fn diagnose(self: &Arc<Self>, domain: &str, port: u16) -> Vec<CandidateStats> {
        self.diagnose_inner(domain, port, DiagnoseFlags::default())
            .await
    }

    async fn diagnose_inner(
        self: &Arc<Self>,
        domain: &str,
        port: u16,
        flags: DiagnoseFlags,
    ) -> Vec<CandidateStats> {
        let d_and_p = format!("{}:{}", domain, port);
        if !flags.ignore_count && self.usage.record(&d_and_p) {
            self.schedule_save();
        }

        let mut list = if flags.rediagnose {
            Vec::new()
        } else {
            self.stats_map
                .get(&d_and_p)
                .map(|e| e.clone())
                .unwrap_or_default()
        };

        let stale = list.is_empty() || !self.verify_ttl(&mut list, Duration::ZERO).await;
        if stale {
            list = self.fresh_diagnosis(domain, port, &d_and_p, flags).await;
        }

        if list.is_empty() {
            // keep serving the previous list rather than nothing
            match self.stats_map.get(&d_and_p) {
                Some(old) if !old.is_empty() => list = old.clone(),
                _ => return Vec::new(),
            }
        }

        self.stats_map.insert(d_and_p, list.clone());

        select_candidates(
            &list,
            self.ledger.count(domain),
            self.tunables.not_good_limit,
        )
    }

    /// Seed with proxies, resolve, ping, classify, merge. In async-ping mode
    /// the first resolved IP is exposed immediately as a provisional direct
    /// candidate and the ping sweep finishes in the background.
    async fn fresh_diagnosis(
        self: &Arc<Self>,
        domain: &str,
        port: u16,
        d_and_p: &str,
        flags: DiagnoseFlags,
    ) -> Vec<CandidateStats> {
        let seeded: Vec<CandidateStats> = self
            .registry
            .proxies()
            .iter()
            .map(|t| CandidateStats::new(domain, port, t.clone(), None))
            .collect();

        let ips = self
            .dns
            .resolve(domain, self.registry.has_proxies())
            .await;
        if ips.is_empty() {
            if seeded.is_empty() {
                warn!("No DNS answer and no proxies for {}", d_and_p);
            }
            return seeded;
        }

        let ping_async = self.tunables.ping_async && !flags.force_sync;
        if ping_async && self.registry.has_proxies() {
            let mut provisional = seeded.clone();
            provisional.push(CandidateStats::new(
                domain,
                port,
                Target::direct(ips[0].ip, port),
                ips[0].ttl,
            ));

            let engine = self.clone();
            let domain = domain.to_string();
            let d_and_p = d_and_p.to_string();
            tokio::spawn(async move {
                let mut merged = seeded;
                let probed = engine.probe_ips(&domain, port, &ips).await;
                merge_probed(&mut merged, probed, engine.tunables.max_loss_pct);
                if !merged.is_empty() {
                    engine.stats_map.insert(d_and_p, merged);
                }
            });
            provisional
        } else {
            let mut merged = seeded;
            let probed = self.probe_ips(domain, port, &ips).await;
            merge_probed(&mut merged, probed, self.tunables.max_loss_pct);
            merged
        }
    }

    /// Ping every resolved IP concurrently and build classified candidates
    async fn probe_ips(
        self: &Arc<Self>,
        domain: &str,
        port: u16,
        ips: &[dns::ResolvedIp],
    ) -> Vec<CandidateStats> {
        let deadline = Duration::from_secs(self.tunables.ping_timeout_secs);
        let reports = futures::future::join_all(ips.iter().map(|resolved| async move {
            match tokio::time::timeout(
                deadline,
                ping::probe(resolved.ip, ping::ECHO_COUNT, Duration::from_secs(1)),
            )
            .await
            {
                Ok(report) => report,
                Err(_) => stats::ProbeReport {
                    loss_pct: 100.0,
                    latency_ms: 0,
                },
            }
        }))
        .await;

        let not_good = self.ledger.count(domain);
        ips.iter()
            .zip(reports)
            .map(|(resolved, report)| {
                let mut cand = CandidateStats::new(
                    domain,
                    port,
                    Target::direct(resolved.ip, port),
                    resolved.ttl,
                );
                cand.loss_pct = report.loss_pct;
                cand.latency_ms = report.latency_ms;
                cand.status = classify(
                    report.loss_pct,
                    report.latency_ms,
                    self.tunables.good_latency_ms,
                    not_good,
                    self.tunables.not_good_limit,
                );
                debug!(
                    "Probed {} via {}: loss {:.0}% latency {}ms -> {:?}",
                    domain, resolved.ip, report.loss_pct, report.latency_ms, cand.status
                );
                cand
            })
            .collect()
    }

    /// Revalidate a cached list whose DNS-derived entries may have expired.
    /// When every expired entry's IP still appears in a fresh resolution the
    /// entries are merely re-stamped; any changed IP makes the whole list
    /// stale. Returns false when the list must be rebuilt.
    async fn verify_ttl(&self, list: &mut [CandidateStats], margin: Duration) -> bool {
        let now = now_millis();
        let expired: Vec<usize> = list
            .iter()
            .enumerate()
            .filter(|(_, c)| c.ttl_expired(now, margin))
            .map(|(i, _)| i)
            .collect();
        if expired.is_empty() {
            return true;
        }

        let domain = list[expired[0]].domain.clone();
        let fresh = self.dns.resolve(&domain, true).await;
        for &i in &expired {
            if !fresh.iter().any(|r| r.ip == list[i].target.ip) {
                debug!("TTL check: {} moved away from {}", domain, list[i].target.ip);
                return false;
            }
            list[i].updated_at_ms = now_millis();
        }
        true
    }

    /// Live-race feedback. No-op for LAN destinations; the counters feed
    /// classification and selection on the next diagnosis.
    pub fn feedback(&self, was_bad: bool, domain: &str) {
        self.ledger.feedback(was_bad, domain);
    }

    /// Record the latency the winning path showed in a live race
    pub fn note_race_latency(&self, d_and_p: &str, latency_ms: u32) {
        if let Some(mut entry) = self.stats_map.get_mut(d_and_p) {
            for cand in entry.iter_mut() {
                cand.last_race_latency_ms = latency_ms;
            }
        }
    }

    pub fn not_good_count(&self, domain: &str) -> f64 {
        self.ledger.count(domain)
    }

    /// Restore the usage snapshot and re-probe restored destinations in the
    /// background, batched and rate-limited. Destinations that already
    /// gained in-memory stats are skipped.
    pub fn restore_cache(self: &Arc<Self>) {
        let restored = match self.usage.restore() {
            Ok(list) => list,
            Err(e) => {
                warn!("Cache restore failed: {}", e);
                return;
            }
        };
        if restored.is_empty() {
            return;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            for batch in restored.chunks(engine.tunables.ping_batch_count) {
                if engine.shutdown.is_cancelled() {
                    return;
                }
                let probes = batch
                    .iter()
                    .filter(|d_and_p| !engine.stats_map.contains_key(*d_and_p))
                    .filter_map(|d_and_p| split_d_and_p(d_and_p))
                    .map(|(domain, port)| {
                        let engine = engine.clone();
                        async move {
                            let _ = tokio::time::timeout(
                                RESTORE_PROBE_TIMEOUT,
                                engine.diagnose_inner(
                                    &domain,
                                    port,
                                    DiagnoseFlags {
                                        rediagnose: false,
                                        force_sync: true,
                                        ignore_count: true,
                                    },
                                ),
                            )
                            .await;
                        }
                    });
                futures::future::join_all(probes).await;
                tokio::task::yield_now().await;
            }
            info!("Restored-cache re-probing finished");
        });
    }

    /// Start the background polling daemon: TTL refresh on a wall-clock
    /// cadence plus local-address watching. One task, cancelled via `close`.
    pub fn spawn_background(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let interval_ms = engine.tunables.refresh_interval_ms;
            let mut last_refresh = now_millis();
            let mut local_addrs = crate::common::net::local_addr_snapshot();
            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    _ = engine.refresh_kick.notified() => {
                        last_refresh = now_millis();
                        engine.refresh_cycle(true).await;
                    }
                    _ = tokio::time::sleep(POLL_TICK) => {
                        let addrs = crate::common::net::local_addr_snapshot();
                        if addrs != local_addrs {
                            info!("Local address set changed, resetting channel health");
                            local_addrs = addrs;
                            engine.ledger.clear();
                            engine.force_refresh();
                            continue;
                        }
                        // wall-clock comparison so a sleep/wake gap triggers
                        // a refresh immediately instead of drifting
                        if now_millis().saturating_sub(last_refresh) >= interval_ms {
                            last_refresh = now_millis();
                            engine.refresh_cycle(false).await;
                        }
                    }
                }
            }
        });
    }

    /// Pre-empt any running cycle and run a fresh one as soon as possible
    pub fn force_refresh(&self) {
        self.refresh_generation.fetch_add(1, Ordering::SeqCst);
        self.refresh_kick.notify_one();
    }

    /// One refresh pass: re-diagnose every destination whose direct entries
    /// fail TTL validation (looking ahead one interval), in bounded batches,
    /// yielding between batches.
    async fn refresh_cycle(self: &Arc<Self>, unconditional: bool) {
        let generation = self.refresh_generation.load(Ordering::SeqCst);
        let margin = Duration::from_millis(self.tunables.refresh_interval_ms);
        let now = now_millis();

        let mut due: Vec<(String, u16)> = Vec::new();
        for entry in self.stats_map.iter() {
            let has_expiring_direct = entry
                .value()
                .iter()
                .any(|c| c.target.direct && (unconditional || c.ttl_expired(now, margin)));
            if has_expiring_direct {
                if let Some(first) = entry.value().first() {
                    due.push((first.domain.clone(), first.port));
                }
            }
        }
        if due.is_empty() {
            return;
        }
        debug!("Refresh cycle: {} destinations due", due.len());

        for batch in due.chunks(self.tunables.ping_batch_count) {
            if self.shutdown.is_cancelled()
                || self.refresh_generation.load(Ordering::SeqCst) != generation
            {
                debug!("Refresh cycle pre-empted");
                return;
            }
            let probes = batch.iter().map(|(domain, port)| {
                let engine = self.clone();
                let domain = domain.clone();
                let port = *port;
                async move {
                    engine
                        .diagnose_inner(
                            &domain,
                            port,
                            DiagnoseFlags {
                                rediagnose: true,
                                force_sync: true,
                                ignore_count: true,
                            },
                        )
                        .await;
                }
            });
            futures::future::join_all(probes).await;
            tokio::task::yield_now().await;
        }
    }

    /// Debounced opportunistic cache save
    fn schedule_save(self: &Arc<Self>) {
        if !self.usage.try_schedule_save() {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            engine.usage.judge_save(now_millis());
            engine.usage.save_scheduled_done();
        });
    }

    /// Stop background tasks and write the final snapshot
    pub fn close(&self) {
        self.shutdown.cancel();
        if let Err(e) = self.usage.save() {
            warn!("Final cache save failed: {}", e);
        }
    }

    #[cfg(test)]
    pub(crate) fn stats_map(&self) -> &DashMap<String, Vec<CandidateStats>> {
        &self.stats_map
    }
}

/// Split a `domain:port` key. IPv6 literals keep their colons; the port is
/// everything after the last one.
pub fn split_d_and_p(d_and_p: &str) -> Option<(String, u16)> {
    let (domain, port) = d_and_p.rsplit_once(':')?;
    let port = port.parse().ok()?;
    Some((domain.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use stats::HealthStatus;

    fn engine_with_proxies(upstreams: &[UpstreamConfig]) -> Arc<DiagnosticEngine> {
        let registry = Arc::new(TargetRegistry::from_config(upstreams).unwrap());
        let mut config = Config::default();
        config.cache_file = std::env::temp_dir()
            .join(format!("racegate-diag-test-{}.bin", std::process::id()))
            .to_string_lossy()
            .into_owned();
        DiagnosticEngine::new(registry, &config).unwrap()
    }

    #[test]
    fn test_split_d_and_p() {
        assert_eq!(
            split_d_and_p("example.com:443"),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(split_d_and_p("::1:8080"), Some(("::1".to_string(), 8080)));
        assert_eq!(split_d_and_p("nocolon"), None);
    }

    #[tokio::test]
    async fn test_fixed_domain_bypasses_diagnosis() {
        let engine = engine_with_proxies(&[UpstreamConfig {
            ip: "10.0.0.2".parse().unwrap(),
            port: 8080,
            fixed_domains: vec![r".*\.pinned\.example".to_string()],
        }]);
        let targets = engine.get_targets("api.pinned.example", 443).await;
        assert_eq!(targets.len(), 1);
        assert!(!targets[0].target.direct);
        assert_eq!(targets[0].target.port, 8080);
        // nothing cached: diagnosis never ran
        assert!(engine.stats_map().is_empty());
    }

    #[tokio::test]
    async fn test_literal_ip_diagnosis_no_proxies() {
        // needs unprivileged DGRAM-ICMP (ping_group_range); skip where the
        // host forbids it, since the probe then reports total loss
        let probe = ping::probe("127.0.0.1".parse().unwrap(), 1, Duration::from_millis(500)).await;
        if probe.loss_pct > 0.0 {
            return;
        }

        // a literal LAN IP resolves to itself with infinite TTL; with no
        // proxies configured, the sync path pings it (loopback answers)
        let engine = engine_with_proxies(&[]);
        let list = engine.diagnose("127.0.0.1", 8080).await;
        assert_eq!(list.len(), 1);
        assert!(list[0].target.direct);
        assert_eq!(list[0].target.ip, "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_ttl_revalidation_re_stamps_same_ip() {
        let engine = engine_with_proxies(&[]);
        let ip: std::net::IpAddr = "127.0.0.1".parse().unwrap();
        let mut cand = CandidateStats::new("127.0.0.1", 80, Target::direct(ip, 80), None);
        cand.ttl = Some(Duration::from_millis(1));
        cand.updated_at_ms = 0; // long expired
        let mut list = vec![cand];
        // fresh resolution of the literal returns the same IP: entries are
        // re-stamped, list survives
        assert!(engine.verify_ttl(&mut list, Duration::ZERO).await);
        assert!(list[0].updated_at_ms > 0);
    }

    #[tokio::test]
    async fn test_ttl_invalidation_on_changed_ip() {
        let engine = engine_with_proxies(&[]);
        let ip: std::net::IpAddr = "127.0.0.2".parse().unwrap();
        // the entry claims domain "127.0.0.1" but holds a different IP, so
        // revalidation sees the address set changed
        let mut cand = CandidateStats::new("127.0.0.1", 80, Target::direct(ip, 80), None);
        cand.ttl = Some(Duration::from_millis(1));
        cand.updated_at_ms = 0;
        let mut list = vec![cand];
        assert!(!engine.verify_ttl(&mut list, Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_feedback_reaches_selection() {
        let engine = engine_with_proxies(&[]);
        engine.feedback(true, "example.com");
        assert_eq!(engine.not_good_count("example.com"), 1.0);
        // LAN addresses stay exempt
        engine.feedback(true, "127.0.0.1");
        assert_eq!(engine.not_good_count("127.0.0.1"), 0.0);
    }

    #[tokio::test]
    async fn test_single_good_candidate_scenario() {
        // diagnosing a destination where the probe reports 0% loss and
        // 50ms latency (threshold 150ms) yields one good candidate
        let engine = engine_with_proxies(&[]);
        let not_good = engine.not_good_count("example.com");
        let status = classify(0.0, 50, 150, not_good, 3.5);
        assert_eq!(status, HealthStatus::Good);

        let mut seeded = Vec::new();
        let mut cand = CandidateStats::new(
            "example.com",
            443,
            Target::direct("93.184.216.34".parse().unwrap(), 443),
            Some(Duration::from_secs(300)),
        );
        cand.loss_pct = 0.0;
        cand.latency_ms = 50;
        cand.status = status;
        merge_probed(&mut seeded, vec![cand], 50.0);
        let picked = select_candidates(&seeded, not_good, 3.5);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].status, HealthStatus::Good);
    }
}
