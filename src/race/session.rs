//! One race session: the event loop coordinating candidate path tasks.
//!
//! Each candidate runs in its own task (connect, handshake, read loop) and
//! reports to the session over a channel; the session owns all scoring and
//! commitment state, cancels losers through per-candidate tokens, and
//! relays the committed path to the caller.

use super::{weighted_cost, Challenge, RaceEvent, RaceFeedback, RaceSettings, ScoreBoard};
use crate::adapter::PathProtocol;
use crate::diag::stats::{CandidateStats, HealthStatus, Target};
use crate::Error;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) enum Command {
    Write(Bytes),
    Destroy,
}

/// Messages from candidate path tasks to the session loop
enum PathMsg {
    /// Transport connected and handshake complete; payload may flow
    Ready { idx: usize, writer: OwnedWriteHalf },
    /// One data chunk, with first-byte costs measured by the path task
    Data {
        idx: usize,
        data: Bytes,
        action_cost_ms: u64,
        race_cost_ms: u64,
    },
    /// Clean remote close
    Ended { idx: usize, recv_count: u64 },
    /// Path failure; retryable failures happened before any data
    Failed {
        idx: usize,
        error: Error,
        retryable: bool,
    },
    /// Retry delay for a slot elapsed; decide now whether to reconnect
    RetryKick { idx: usize },
}

struct Slot {
    stats: CandidateStats,
    cancel: CancellationToken,
    writer: Option<OwnedWriteHalf>,
    alive: bool,
    ended: bool,
    retry_pending: bool,
    retries: u32,
}

impl Slot {
    fn new(stats: CandidateStats) -> Self {
        Slot {
            stats,
            cancel: CancellationToken::new(),
            writer: None,
            alive: true,
            ended: false,
            retry_pending: false,
            retries: 0,
        }
    }
}

pub(crate) struct Session {
    adapter: Arc<dyn PathProtocol>,
    feedback: Arc<dyn RaceFeedback>,
    settings: RaceSettings,
    fallback_proxies: Vec<Arc<Target>>,
    slots: Vec<Slot>,
    board: ScoreBoard,
    /// Chunks the provisional leader received before commitment
    leader_buf: Vec<Bytes>,
    leader_latency_ms: u32,
    winner: Option<usize>,
    finished: bool,
    connected_emitted: bool,
    /// Client payload written before commitment, broadcast to late joiners
    data_cache: Vec<Bytes>,
    have_proxy: bool,
    decision_at: Option<TokioInstant>,
    msg_tx: mpsc::UnboundedSender<PathMsg>,
    event_tx: mpsc::UnboundedSender<RaceEvent>,
}

impl Session {
    pub(crate) fn spawn(
        candidates: Vec<CandidateStats>,
        adapter: Arc<dyn PathProtocol>,
        feedback: Arc<dyn RaceFeedback>,
        fallback_proxies: Vec<Arc<Target>>,
        settings: RaceSettings,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        event_tx: mpsc::UnboundedSender<RaceEvent>,
    ) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let have_proxy = candidates.iter().any(|c| !c.target.direct);
        let mut session = Session {
            adapter,
            feedback,
            settings,
            fallback_proxies,
            slots: candidates.into_iter().map(Slot::new).collect(),
            board: ScoreBoard::new(),
            leader_buf: Vec::new(),
            leader_latency_ms: 0,
            winner: None,
            finished: false,
            connected_emitted: false,
            data_cache: Vec::new(),
            have_proxy,
            decision_at: None,
            msg_tx,
            event_tx,
        };
        tokio::spawn(async move {
            for idx in 0..session.slots.len() {
                session.spawn_path(idx);
            }
            session.run(cmd_rx, msg_rx).await;
        });
    }

    async fn run(
        &mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut msg_rx: mpsc::UnboundedReceiver<PathMsg>,
    ) {
        let deadline = TokioInstant::now() + self.settings.connect_timeout;
        // A lone direct candidate while proxies are configured gets a grace
        // period; past it the proxies join the race.
        let mut correction_at = if !self.fallback_proxies.is_empty()
            && self.slots.len() == 1
            && self.slots[0].stats.target.direct
        {
            Some(TokioInstant::now() + self.settings.good_socket_timeout)
        } else {
            None
        };

        while !self.finished {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Write(data)) => self.on_write(data).await,
                    Some(Command::Destroy) | None => {
                        debug!("Race session for {} destroyed by caller", self.adapter.addr());
                        break;
                    }
                },
                Some(msg) = msg_rx.recv() => self.on_path_msg(msg).await,
                _ = sleep_opt(self.decision_at) => {
                    self.decision_at = None;
                    self.commit_leader();
                }
                _ = sleep_opt(correction_at) => {
                    correction_at = None;
                    self.direct_only_correction();
                }
                _ = tokio::time::sleep_until(deadline), if self.winner.is_none() => {
                    warn!("Race for {} hit the connect deadline", self.adapter.addr());
                    self.emit(RaceEvent::Error(Error::timeout("no path committed in time")));
                    break;
                }
            }
        }
        for slot in &self.slots {
            slot.cancel.cancel();
        }
    }

    fn emit(&self, event: RaceEvent) {
        let _ = self.event_tx.send(event);
    }

    fn alive_count(&self) -> usize {
        self.slots.iter().filter(|s| s.alive).count()
    }

    fn retry_pending(&self) -> bool {
        self.slots.iter().any(|s| s.retry_pending)
    }

    fn spawn_path(&self, idx: usize) {
        let slot = &self.slots[idx];
        tokio::spawn(run_path(
            idx,
            slot.stats.clone(),
            self.adapter.clone(),
            self.msg_tx.clone(),
            slot.cancel.clone(),
            self.settings.clone(),
        ));
    }

    async fn on_write(&mut self, data: Bytes) {
        let adapter = self.adapter.clone();
        if let Some(w) = self.winner {
            let slot = &mut self.slots[w];
            if let Some(writer) = slot.writer.as_mut() {
                if let Err(e) = adapter.write_to_path(&data, writer, &slot.stats.target).await {
                    warn!("Write to committed path failed: {}", e);
                }
            }
            return;
        }
        self.data_cache.push(data.clone());
        for slot in self.slots.iter_mut().filter(|s| s.alive) {
            if let Some(writer) = slot.writer.as_mut() {
                if let Err(e) = adapter.write_to_path(&data, writer, &slot.stats.target).await {
                    debug!("Broadcast write to {} failed: {}", slot.stats.target.ip, e);
                }
            }
        }
    }

    async fn on_path_msg(&mut self, msg: PathMsg) {
        match msg {
            PathMsg::Ready { idx, writer } => self.on_ready(idx, writer).await,
            PathMsg::Data {
                idx,
                data,
                action_cost_ms,
                race_cost_ms,
            } => self.on_data(idx, data, action_cost_ms, race_cost_ms),
            PathMsg::Ended { idx, recv_count } => self.on_ended(idx, recv_count),
            PathMsg::Failed {
                idx,
                error,
                retryable,
            } => self.on_failed(idx, error, retryable),
            PathMsg::RetryKick { idx } => self.on_retry_kick(idx),
        }
    }

    async fn on_ready(&mut self, idx: usize, writer: OwnedWriteHalf) {
        if !self.slots[idx].alive {
            return;
        }
        let adapter = self.adapter.clone();
        let cached = self.data_cache.clone();
        {
            let slot = &mut self.slots[idx];
            let mut writer = writer;
            for data in &cached {
                if let Err(e) = adapter.write_to_path(data, &mut writer, &slot.stats.target).await {
                    debug!("Replay to {} failed: {}", slot.stats.target.ip, e);
                    break;
                }
            }
            slot.writer = Some(writer);
        }
        if !self.connected_emitted {
            self.connected_emitted = true;
            self.emit(RaceEvent::Connected);
        }
    }

    fn on_data(&mut self, idx: usize, data: Bytes, action_cost_ms: u64, race_cost_ms: u64) {
        if let Some(w) = self.winner {
            if idx == w {
                self.emit(RaceEvent::Data(data));
            } else if self.slots[idx].stats.status == HealthStatus::Good {
                // a passively-good path producing data after losing the
                // race: it was not exactly good
                self.feedback.feedback(true, self.adapter.addr());
            }
            return;
        }
        if !self.slots[idx].alive {
            return;
        }
        if self.board.leader() == Some(idx) {
            self.leader_buf.push(data);
            return;
        }

        let direct = self.slots[idx].stats.target.direct;
        let cost = weighted_cost(action_cost_ms, race_cost_ms, direct, self.have_proxy, &self.settings);
        match self.board.challenge(idx, cost) {
            Challenge::Outscored => {
                self.fail_slot(idx);
                self.commit_if_last_standing();
                self.check_all_failed(Error::race_fail("outscored by a faster path"));
            }
            Challenge::Lead { displaced } => {
                debug!(
                    "Path {} leads {} at cost {:.0}",
                    self.slots[idx].stats.target.ip,
                    self.adapter.addr(),
                    cost
                );
                self.leader_buf = vec![data];
                self.leader_latency_ms = race_cost_ms as u32;
                if let Some(d) = displaced {
                    self.fail_slot(d);
                }
                if self.alive_count() == 1 {
                    // last path standing wins immediately
                    self.commit_leader();
                } else if self.decision_at.is_none() {
                    let bonus = if direct && self.have_proxy {
                        self.settings.proxy_cost_bonus_ms
                    } else {
                        0
                    };
                    self.decision_at = Some(
                        TokioInstant::now()
                            + std::time::Duration::from_millis(bonus + action_cost_ms),
                    );
                    let threshold = self.settings.good_socket_timeout.as_millis() as u64;
                    if direct && action_cost_ms + race_cost_ms < threshold {
                        self.feedback.feedback(false, self.adapter.addr());
                    } else if self
                        .slots
                        .iter()
                        .any(|s| s.stats.status == HealthStatus::Good)
                    {
                        self.feedback.feedback(true, self.adapter.addr());
                    }
                }
            }
        }
    }

    /// Cancel a losing path. Good direct paths that lose feed the
    /// not-exactly-good counter.
    fn fail_slot(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        if !slot.alive {
            return;
        }
        slot.alive = false;
        slot.cancel.cancel();
        slot.writer = None;
        if slot.stats.target.direct && slot.stats.status == HealthStatus::Good {
            self.feedback.feedback(true, self.adapter.addr());
        }
        if self.board.leader() == Some(idx) {
            self.board.reset();
            self.leader_buf.clear();
            self.decision_at = None;
        }
    }

    fn check_all_failed(&mut self, error: Error) {
        if self.winner.is_some() || self.finished {
            return;
        }
        if self.alive_count() == 0 && !self.retry_pending() {
            warn!("Every path to {} failed: {}", self.adapter.addr(), error);
            self.emit(RaceEvent::Error(Error::all_failed(error.to_string())));
            self.finished = true;
        }
    }

    /// A leader left as the only live path wins at once instead of waiting
    /// out the decision window.
    fn commit_if_last_standing(&mut self) {
        if self.winner.is_none() && self.board.leader().is_some() && self.alive_count() == 1 {
            self.commit_leader();
        }
    }

    /// Declare the current leader the winner: cancel everyone else and
    /// replay the leader's buffered chunks in arrival order.
    fn commit_leader(&mut self) {
        if self.winner.is_some() {
            return;
        }
        let Some(leader) = self.board.leader() else {
            return;
        };
        self.winner = Some(leader);
        self.decision_at = None;
        for idx in 0..self.slots.len() {
            if idx != leader && self.slots[idx].alive {
                let slot = &mut self.slots[idx];
                slot.alive = false;
                slot.cancel.cancel();
                slot.writer = None;
            }
        }
        debug!(
            "Committed {} for {} ({}ms to first byte)",
            self.slots[leader].stats.target.ip,
            self.adapter.addr(),
            self.leader_latency_ms
        );
        self.feedback
            .race_latency(&self.slots[leader].stats.d_and_p, self.leader_latency_ms);
        for data in std::mem::take(&mut self.leader_buf) {
            self.emit(RaceEvent::Data(data));
        }
        if self.slots[leader].ended {
            self.emit(RaceEvent::End);
            self.finished = true;
        }
    }

    fn on_ended(&mut self, idx: usize, recv_count: u64) {
        if self.winner == Some(idx) {
            self.emit(RaceEvent::End);
            self.finished = true;
            return;
        }
        if self.winner.is_none() && self.board.leader() == Some(idx) {
            // leader closed after data; if it still wins, the session ends
            // right after the buffered replay
            self.slots[idx].ended = true;
            return;
        }
        if self.winner.is_none() && recv_count == 0 {
            // closed before producing anything, worth a fresh attempt
            self.slots[idx].alive = false;
            self.slots[idx].cancel.cancel();
            self.slots[idx].writer = None;
            self.schedule_retry(idx);
            self.commit_if_last_standing();
            return;
        }
        self.fail_slot(idx);
        self.commit_if_last_standing();
        self.check_all_failed(Error::race_fail("path closed before commitment"));
    }

    fn on_failed(&mut self, idx: usize, error: Error, retryable: bool) {
        if self.finished {
            return;
        }
        debug!(
            "Path {} for {} failed: {}",
            self.slots[idx].stats.target.ip,
            self.adapter.addr(),
            error
        );
        if self.winner == Some(idx) {
            self.emit(RaceEvent::Error(error));
            self.finished = true;
            return;
        }
        self.fail_slot(idx);
        self.commit_if_last_standing();
        if self.winner.is_some() {
            return;
        }
        if retryable {
            self.schedule_retry(idx);
            return;
        }
        self.check_all_failed(error);
    }

    fn schedule_retry(&mut self, idx: usize) {
        self.slots[idx].retry_pending = true;
        let tx = self.msg_tx.clone();
        let delay = self.settings.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(PathMsg::RetryKick { idx });
        });
    }

    fn on_retry_kick(&mut self, idx: usize) {
        self.slots[idx].retry_pending = false;
        if self.finished || self.winner.is_some() {
            return;
        }
        // no retry once someone leads, or past the retry budget
        if self.board.leader().is_some() || self.slots[idx].retries >= self.settings.max_retry {
            self.commit_if_last_standing();
            self.check_all_failed(Error::race_fail("retry budget exhausted"));
            return;
        }
        let slot = &mut self.slots[idx];
        slot.retries += 1;
        slot.cancel = CancellationToken::new();
        slot.alive = true;
        slot.ended = false;
        slot.writer = None;
        debug!(
            "Retrying path {} for {} (attempt {})",
            slot.stats.target.ip,
            self.adapter.addr(),
            slot.retries
        );
        self.spawn_path(idx);
    }

    /// The lone direct candidate failed to commit within the grace period:
    /// flag it and bring the configured proxies into the race.
    fn direct_only_correction(&mut self) {
        if self.winner.is_some() || self.finished {
            return;
        }
        self.feedback.feedback(true, self.adapter.addr());
        let domain = self.adapter.addr().to_string();
        let port = self.adapter.port();
        let proxies = self.fallback_proxies.clone();
        debug!("Direct-only correction for {}: adding {} proxies", domain, proxies.len());
        for target in proxies {
            let stats = CandidateStats::new(&domain, port, target, None);
            self.slots.push(Slot::new(stats));
            self.spawn_path(self.slots.len() - 1);
        }
        self.have_proxy = true;
    }
}

async fn sleep_opt(at: Option<TokioInstant>) {
    match at {
        Some(t) => tokio::time::sleep_until(t).await,
        None => std::future::pending().await,
    }
}

/// One candidate path: connect, handshake, then read until cancelled.
/// First-byte costs are measured here so queueing in the session channel
/// never skews scoring.
async fn run_path(
    idx: usize,
    stats: CandidateStats,
    adapter: Arc<dyn PathProtocol>,
    tx: mpsc::UnboundedSender<PathMsg>,
    cancel: CancellationToken,
    settings: RaceSettings,
) {
    let race_start = Instant::now();
    let target = stats.target.clone();
    let addr = SocketAddr::new(target.ip, target.port);

    let connect = tokio::select! {
        _ = cancel.cancelled() => return,
        c = TcpStream::connect(addr) => c,
    };
    let mut stream = match connect {
        Ok(s) => s,
        Err(e) => {
            let _ = tx.send(PathMsg::Failed {
                idx,
                error: e.into(),
                retryable: false,
            });
            return;
        }
    };

    let handshake = tokio::select! {
        _ = cancel.cancelled() => return,
        r = adapter.on_path_connect(&target, &mut stream) => r,
    };
    match handshake {
        Ok(rounds) => {
            debug!("Path {} handshake done ({} rounds)", target.ip, rounds);
        }
        Err(e) => {
            // a malformed acknowledgement counts as a connect failure,
            // eligible for retry
            let _ = tx.send(PathMsg::Failed {
                idx,
                error: e,
                retryable: true,
            });
            return;
        }
    }

    let (reader, writer) = stream.into_split();
    if tx.send(PathMsg::Ready { idx, writer }).is_err() {
        return;
    }
    read_loop(idx, reader, &target, adapter, tx, cancel, settings, race_start).await;
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    idx: usize,
    mut reader: OwnedReadHalf,
    target: &Target,
    adapter: Arc<dyn PathProtocol>,
    tx: mpsc::UnboundedSender<PathMsg>,
    cancel: CancellationToken,
    settings: RaceSettings,
    race_start: Instant,
) {
    let flushed_at = Instant::now();
    let mut recv_count: u64 = 0;
    let mut last_verify: Option<Instant> = None;
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            r = tokio::time::timeout(settings.idle_timeout, reader.read(&mut buf)) => r,
        };
        match read {
            Ok(Ok(0)) => {
                let _ = tx.send(PathMsg::Ended { idx, recv_count });
                return;
            }
            Ok(Ok(n)) => {
                recv_count += 1;
                let now = Instant::now();
                let sent = tx.send(PathMsg::Data {
                    idx,
                    data: Bytes::copy_from_slice(&buf[..n]),
                    action_cost_ms: now.duration_since(flushed_at).as_millis() as u64,
                    race_cost_ms: now.duration_since(race_start).as_millis() as u64,
                });
                if sent.is_err() {
                    return;
                }
            }
            Ok(Err(e)) => {
                let _ = tx.send(PathMsg::Failed {
                    idx,
                    error: e.into(),
                    retryable: false,
                });
                return;
            }
            Err(_) => {
                // idle window elapsed; a path that already produced enough
                // data may just be quiet, so verify out-of-band, at most
                // once per debounce window
                if recv_count >= adapter.min_idle_verify_recv() {
                    let debounced = last_verify
                        .map(|t| t.elapsed() < settings.idle_reverify_wait)
                        .unwrap_or(false);
                    if debounced {
                        continue;
                    }
                    last_verify = Some(Instant::now());
                    if adapter.verify_idle(target).await {
                        debug!("Idle verify for {} succeeded, keeping path", target.ip);
                        continue;
                    }
                    debug!("Idle verify for {} failed", target.ip);
                }
                let _ = tx.send(PathMsg::Failed {
                    idx,
                    error: Error::idle_timeout("no data within the idle window"),
                    retryable: false,
                });
                return;
            }
        }
    }
}
