//! Race connector
//!
//! Opens one transport connection per candidate concurrently, scores the
//! first post-handshake byte of each path, commits to the strictly best
//! one under a decision timer, and exposes the committed path as a single
//! logical duplex channel. Direct paths carry a cost handicap whenever a
//! proxy is also racing, so a direct route must beat the proxies by a real
//! margin to win.

mod session;

use crate::config::Tunables;
use crate::diag::stats::{CandidateStats, Target};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Events a race session emits to its caller. Per-candidate losses stay
/// internal; only the committed path's lifecycle is visible.
#[derive(Debug)]
pub enum RaceEvent {
    /// First candidate finished its handshake; payload can flow
    Connected,
    /// Data from the committed path (or replayed pre-commit data, in
    /// arrival order)
    Data(Bytes),
    /// The committed path ended cleanly
    End,
    /// Terminal failure: every candidate exhausted, or the committed path
    /// broke, or the overall deadline passed
    Error(Error),
}

/// Live-outcome feedback sink, implemented by the diagnostics engine.
/// Narrow on purpose: the race connector never touches the health model
/// directly.
pub trait RaceFeedback: Send + Sync {
    fn feedback(&self, was_bad: bool, domain: &str);
    fn race_latency(&self, _d_and_p: &str, _latency_ms: u32) {}
}

impl RaceFeedback for crate::diag::DiagnosticEngine {
    fn feedback(&self, was_bad: bool, domain: &str) {
        crate::diag::DiagnosticEngine::feedback(self, was_bad, domain);
    }

    fn race_latency(&self, d_and_p: &str, latency_ms: u32) {
        self.note_race_latency(d_and_p, latency_ms);
    }
}

/// No-op sink for sessions that bypass diagnostics (fixed-domain routes)
pub struct NoFeedback;

impl RaceFeedback for NoFeedback {
    fn feedback(&self, _was_bad: bool, _domain: &str) {}
}

/// Timing knobs one session runs under
#[derive(Debug, Clone)]
pub struct RaceSettings {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub good_socket_timeout: Duration,
    pub max_retry: u32,
    pub retry_delay: Duration,
    pub proxy_cost_bonus_ms: u64,
    pub action_cost_rate: f64,
    pub idle_reverify_wait: Duration,
}

impl From<&Tunables> for RaceSettings {
    fn from(t: &Tunables) -> Self {
        RaceSettings {
            connect_timeout: Duration::from_millis(t.connect_timeout_ms),
            idle_timeout: Duration::from_millis(t.idle_timeout_ms),
            good_socket_timeout: Duration::from_millis(t.good_socket_timeout_ms),
            max_retry: t.max_retry,
            retry_delay: Duration::from_millis(t.retry_delay_ms),
            proxy_cost_bonus_ms: t.proxy_cost_bonus_ms,
            action_cost_rate: t.action_cost_rate,
            idle_reverify_wait: Duration::from_millis(t.idle_reverify_wait_ms),
        }
    }
}

/// Weighted cost of a path's first usable byte. `action_cost` is time since
/// payload flush, `race_cost` time since connect start; the bonus penalizes
/// direct paths only while at least one proxy is in the race.
pub(crate) fn weighted_cost(
    action_cost_ms: u64,
    race_cost_ms: u64,
    direct: bool,
    have_proxy: bool,
    settings: &RaceSettings,
) -> f64 {
    let bonus = if direct && have_proxy {
        settings.proxy_cost_bonus_ms
    } else {
        0
    };
    action_cost_ms as f64 * settings.action_cost_rate + race_cost_ms as f64 + bonus as f64
}

/// Leadership tracking for one session. A challenger takes the lead only
/// with a strictly lower weighted cost.
#[derive(Debug)]
pub(crate) struct ScoreBoard {
    leader: Option<usize>,
    min_cost: f64,
}

pub(crate) enum Challenge {
    /// Challenger leads now; the displaced previous leader, if any, must be
    /// cancelled by the caller
    Lead { displaced: Option<usize> },
    /// Not strictly better than the standing cost
    Outscored,
}

impl ScoreBoard {
    pub(crate) fn new() -> Self {
        ScoreBoard {
            leader: None,
            min_cost: f64::INFINITY,
        }
    }

    pub(crate) fn leader(&self) -> Option<usize> {
        self.leader
    }

    pub(crate) fn challenge(&mut self, idx: usize, cost: f64) -> Challenge {
        if cost >= self.min_cost {
            return Challenge::Outscored;
        }
        let displaced = self.leader.replace(idx);
        self.min_cost = cost;
        Challenge::Lead { displaced }
    }

    /// The leader fell away; scoring starts over
    pub(crate) fn reset(&mut self) {
        self.leader = None;
        self.min_cost = f64::INFINITY;
    }
}

/// Write half of a race session. Dropping it tears the session down.
pub struct RaceSender {
    cmd_tx: mpsc::UnboundedSender<session::Command>,
}

impl RaceSender {
    /// Send client payload. Before commitment this buffers and broadcasts
    /// to every handshake-complete candidate; after, it goes to the winner
    /// only.
    pub fn write(&self, data: Bytes) {
        let _ = self.cmd_tx.send(session::Command::Write(data));
    }

    /// Tear the whole session down
    pub fn destroy(&self) {
        let _ = self.cmd_tx.send(session::Command::Destroy);
    }
}

impl Drop for RaceSender {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(session::Command::Destroy);
    }
}

/// Handle to a running race session: the caller's half of the logical
/// duplex channel.
pub struct RaceHandle {
    sender: RaceSender,
    event_rx: mpsc::UnboundedReceiver<RaceEvent>,
}

impl RaceHandle {
    pub fn write(&self, data: Bytes) {
        self.sender.write(data);
    }

    pub fn destroy(&self) {
        self.sender.destroy();
    }

    /// Next session event; `None` after the session is gone
    pub async fn recv(&mut self) -> Option<RaceEvent> {
        self.event_rx.recv().await
    }

    /// Split into independent write and event halves, for callers that
    /// multiplex several sessions
    pub fn into_parts(self) -> (RaceSender, mpsc::UnboundedReceiver<RaceEvent>) {
        (self.sender, self.event_rx)
    }
}

/// Start racing the given candidates through `adapter`. `fallback_proxies`
/// are the globally configured proxies, joined late when a lone direct
/// candidate fails to commit within the grace period.
pub fn race(
    candidates: Vec<CandidateStats>,
    adapter: Arc<dyn crate::adapter::PathProtocol>,
    feedback: Arc<dyn RaceFeedback>,
    fallback_proxies: Vec<Arc<Target>>,
    settings: RaceSettings,
) -> Result<RaceHandle> {
    if candidates.is_empty() {
        return Err(Error::diagnosis_unavailable("no candidates to race"));
    }
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    session::Session::spawn(
        candidates,
        adapter,
        feedback,
        fallback_proxies,
        settings,
        cmd_rx,
        event_tx,
    );
    Ok(RaceHandle {
        sender: RaceSender { cmd_tx },
        event_rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RaceSettings {
        RaceSettings {
            connect_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(4),
            good_socket_timeout: Duration::from_millis(300),
            max_retry: 3,
            retry_delay: Duration::from_millis(300),
            proxy_cost_bonus_ms: 30,
            action_cost_rate: 3.0,
            idle_reverify_wait: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_bonus_applies_only_to_direct_with_proxy_present() {
        let s = settings();
        let direct = weighted_cost(10, 100, true, true, &s);
        let direct_alone = weighted_cost(10, 100, true, false, &s);
        let proxy = weighted_cost(10, 100, false, true, &s);
        assert_eq!(direct, 30.0 + 100.0 + 30.0);
        assert_eq!(direct_alone, 30.0 + 100.0);
        assert_eq!(proxy, 30.0 + 100.0);
    }

    #[test]
    fn test_proxy_wins_within_bonus_margin() {
        // direct first byte at 100ms, proxy at 120ms, bonus 30: the proxy
        // scores lower and keeps the lead
        let s = settings();
        let mut board = ScoreBoard::new();
        let proxy_cost = weighted_cost(0, 120, false, true, &s);
        let direct_cost = weighted_cost(0, 100, true, true, &s);
        assert!(matches!(
            board.challenge(1, proxy_cost),
            Challenge::Lead { displaced: None }
        ));
        assert!(matches!(
            board.challenge(0, direct_cost),
            Challenge::Outscored
        ));
        assert_eq!(board.leader(), Some(1));
    }

    #[test]
    fn test_leadership_cost_strictly_decreasing() {
        let mut board = ScoreBoard::new();
        assert!(matches!(board.challenge(0, 500.0), Challenge::Lead { .. }));
        // equal cost never displaces
        assert!(matches!(board.challenge(1, 500.0), Challenge::Outscored));
        match board.challenge(2, 499.0) {
            Challenge::Lead { displaced } => assert_eq!(displaced, Some(0)),
            Challenge::Outscored => panic!("strictly better challenger must lead"),
        }
        assert_eq!(board.leader(), Some(2));
    }

    #[test]
    fn test_reset_reopens_scoring() {
        let mut board = ScoreBoard::new();
        board.challenge(0, 100.0);
        board.reset();
        assert!(board.leader().is_none());
        assert!(matches!(board.challenge(1, 900.0), Challenge::Lead { .. }));
    }

    #[test]
    fn test_empty_candidate_list_rejected() {
        let err = race(
            Vec::new(),
            Arc::new(crate::adapter::http::HttpAdapter::tunnel_for_test(
                "example.com",
                443,
            )),
            Arc::new(NoFeedback),
            Vec::new(),
            settings(),
        )
        .err();
        assert!(matches!(err, Some(Error::DiagnosisUnavailable(_))));
    }
}
