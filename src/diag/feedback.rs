//! Not-exactly-good feedback counters
//!
//! A candidate can look healthy to passive probing yet keep losing live
//! races (intercepted or reset connections, for example). Each "this target
//! underperformed" signal bumps the domain's counter; each "performed fine"
//! signal decays it. The counter feeds health classification and candidate
//! selection.

use crate::common::net::is_lan_host;
use dashmap::DashMap;
use tracing::debug;

/// Decay applied per positive signal; four positives cancel one negative.
const DECAY_STEP: f64 = 0.25;

/// Per-domain decaying penalty counters. Not persisted; cleared wholesale
/// when the local network identity changes.
#[derive(Default)]
pub struct NotGoodLedger {
    counters: DashMap<String, f64>,
}

impl NotGoodLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one live-race outcome for a domain. Same-LAN destinations are
    /// never penalized.
    pub fn feedback(&self, was_bad: bool, domain: &str) {
        if is_lan_host(domain) {
            return;
        }
        if was_bad {
            let mut entry = self.counters.entry(domain.to_string()).or_insert(0.0);
            *entry += 1.0;
            debug!("Domain {} not-good counter raised to {:.2}", domain, *entry);
        } else if let Some(mut entry) = self.counters.get_mut(domain) {
            *entry -= DECAY_STEP;
            if *entry <= 0.0 {
                let key = entry.key().clone();
                drop(entry);
                self.counters.remove_if(&key, |_, v| *v <= 0.0);
            }
        }
    }

    /// Current counter for a domain, zero when absent
    pub fn count(&self, domain: &str) -> f64 {
        self.counters.get(domain).map(|v| *v).unwrap_or(0.0)
    }

    /// Drop every counter. Used when the host's network identity changes
    /// and prior judgments are suspect.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decay_symmetry() {
        let ledger = NotGoodLedger::new();
        let n = 3;
        for _ in 0..n {
            ledger.feedback(true, "example.com");
        }
        assert_eq!(ledger.count("example.com"), n as f64);
        for _ in 0..(4 * n) {
            ledger.feedback(false, "example.com");
        }
        assert_eq!(ledger.count("example.com"), 0.0);
    }

    #[test]
    fn test_floor_at_zero() {
        let ledger = NotGoodLedger::new();
        ledger.feedback(false, "example.com");
        assert_eq!(ledger.count("example.com"), 0.0);
        ledger.feedback(true, "example.com");
        for _ in 0..10 {
            ledger.feedback(false, "example.com");
        }
        assert_eq!(ledger.count("example.com"), 0.0);
    }

    #[test]
    fn test_lan_exempt() {
        let ledger = NotGoodLedger::new();
        ledger.feedback(true, "192.168.1.5");
        ledger.feedback(true, "localhost");
        assert_eq!(ledger.count("192.168.1.5"), 0.0);
        assert_eq!(ledger.count("localhost"), 0.0);
    }

    #[test]
    fn test_clear() {
        let ledger = NotGoodLedger::new();
        ledger.feedback(true, "example.com");
        ledger.clear();
        assert_eq!(ledger.count("example.com"), 0.0);
    }
}
