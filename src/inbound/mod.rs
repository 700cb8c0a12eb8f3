//! Inbound listener and session orchestration
//!
//! Accepts client sockets, detects the spoken protocol from the first
//! packet, asks the diagnostics engine for candidates and hands the
//! connection to a race session. CONNECT tunnels and SOCKS5 sessions pump
//! one race; plain HTTP proxy connections may address several destinations
//! in turn and get one race per `domain:port`.

use crate::adapter::http::{self, HttpAdapter};
use crate::adapter::socks5::Socks5Adapter;
use crate::adapter::PathProtocol;
use crate::diag::DiagnosticEngine;
use crate::race::{race, RaceEvent, RaceFeedback, RaceHandle, RaceSender, RaceSettings};
use crate::registry::TargetRegistry;
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CLIENT_BUF_SIZE: usize = 16 * 1024;

pub struct Inbound {
    engine: Arc<DiagnosticEngine>,
    registry: Arc<TargetRegistry>,
    settings: RaceSettings,
}

impl Inbound {
    pub fn new(
        engine: Arc<DiagnosticEngine>,
        registry: Arc<TargetRegistry>,
        settings: RaceSettings,
    ) -> Arc<Self> {
        Arc::new(Inbound {
            engine,
            registry,
            settings,
        })
    }

    /// Accept loop. Runs until the shutdown token fires.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!("Listening on {}", listener.local_addr()?);
        loop {
            let client = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        debug!("Accepted client {}", peer);
                        client
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };
            let inbound = self.clone();
            tokio::spawn(async move {
                if let Err(e) = inbound.handle_client(client).await {
                    debug!("Client session ended with error: {}", e);
                }
            });
        }
    }

    async fn handle_client(&self, mut client: TcpStream) -> Result<()> {
        let mut first = vec![0u8; CLIENT_BUF_SIZE];
        let n = client.read(&mut first).await?;
        if n == 0 {
            return Ok(());
        }
        first.truncate(n);

        if let Some(adapter) = HttpAdapter::detect(&first)? {
            let adapter = Arc::new(adapter);
            if adapter.is_connect() {
                self.serve_single(client, adapter).await
            } else {
                self.serve_http_plain(client, adapter).await
            }
        } else if let Some(adapter) = Socks5Adapter::detect(&first, &mut client).await? {
            self.serve_single(client, Arc::new(adapter)).await
        } else {
            debug!("Unrecognized protocol, dropping client");
            Ok(())
        }
    }

    /// Race one destination and pump bytes both ways until either side
    /// finishes. Used for CONNECT tunnels and SOCKS5 sessions.
    async fn serve_single(
        &self,
        mut client: TcpStream,
        adapter: Arc<dyn PathProtocol>,
    ) -> Result<()> {
        let mut handle = match self.start_race(adapter.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                adapter.on_fail_feedback(&mut client).await;
                return Err(e);
            }
        };

        let mut buf = vec![0u8; CLIENT_BUF_SIZE];
        let mut first_payload_seen = false;
        loop {
            tokio::select! {
                read = client.read(&mut buf) => match read {
                    Ok(0) | Err(_) => {
                        handle.destroy();
                        return Ok(());
                    }
                    Ok(n) => {
                        if !first_payload_seen {
                            first_payload_seen = true;
                            adapter.note_client_payload(&buf[..n]);
                        }
                        handle.write(Bytes::copy_from_slice(&buf[..n]));
                    }
                },
                event = handle.recv() => match event {
                    Some(RaceEvent::Connected) => {
                        adapter.on_connected_feedback(&mut client).await;
                    }
                    Some(RaceEvent::Data(data)) => {
                        if client.write_all(&data).await.is_err() {
                            handle.destroy();
                            return Ok(());
                        }
                    }
                    Some(RaceEvent::End) | None => {
                        let _ = client.shutdown().await;
                        return Ok(());
                    }
                    Some(RaceEvent::Error(e)) => {
                        warn!("Session for {} failed: {}", adapter.addr(), e);
                        adapter.on_fail_feedback(&mut client).await;
                        let _ = client.shutdown().await;
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Plain HTTP proxying: the client sends absolute-form requests and may
    /// switch destinations between them, so routes are opened per
    /// `domain:port` and requests steered by their parsed destination.
    async fn serve_http_plain(&self, mut client: TcpStream, adapter: Arc<HttpAdapter>) -> Result<()> {
        let primary_dp = format!("{}:{}", adapter.addr(), adapter.port());
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<(String, RaceEvent)>();

        let head = adapter.head();
        let mut routes: HashMap<String, Route> = HashMap::new();
        // a request head without its terminator means the body continues in
        // later packets, which must follow it to the same route
        let mut pending_dp: Option<String> = if head.ends_with(b"\r\n\r\n") {
            None
        } else {
            Some(primary_dp.clone())
        };

        let sender = match self
            .open_route(&primary_dp, adapter.clone(), &ev_tx)
            .await
        {
            Ok(sender) => sender,
            Err(e) => {
                adapter.on_fail_feedback(&mut client).await;
                return Err(e);
            }
        };
        sender.write(head);
        routes.insert(primary_dp.clone(), Route::new(sender));

        let mut buf = vec![0u8; CLIENT_BUF_SIZE];
        loop {
            tokio::select! {
                read = client.read(&mut buf) => match read {
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        let dp = match &pending_dp {
                            Some(dp) => dp.clone(),
                            None => match http::parse_destination(&data) {
                                Some((_, dest)) => {
                                    let dp = format!("{}:{}", dest.addr, dest.port);
                                    if !routes.contains_key(&dp) {
                                        let next: Arc<HttpAdapter> =
                                            Arc::new(HttpAdapter::for_destination(&dest));
                                        match self.open_route(&dp, next, &ev_tx).await {
                                            Ok(sender) => {
                                                debug!("Opened route to {}", dp);
                                                routes.insert(dp.clone(), Route::new(sender));
                                            }
                                            Err(e) => {
                                                warn!("Cannot route to {}: {}", dp, e);
                                                adapter.on_fail_feedback(&mut client).await;
                                                continue;
                                            }
                                        }
                                    }
                                    pending_dp = Some(dp.clone());
                                    dp
                                }
                                None => {
                                    debug!("Unparsed client packet, forwarding to {}", primary_dp);
                                    primary_dp.clone()
                                }
                            },
                        };
                        if let Some(route) = routes.get(&dp) {
                            route.sender.write(data.clone());
                        }
                        if data.ends_with(b"\r\n\r\n") {
                            pending_dp = None;
                        }
                    }
                },
                event = ev_rx.recv() => {
                    let Some((dp, event)) = event else { return Ok(()) };
                    match event {
                        RaceEvent::Connected => {}
                        RaceEvent::Data(data) => {
                            let deliver = pending_dp.as_deref().map_or(true, |p| p == dp);
                            if deliver && client.write_all(&data).await.is_err() {
                                return Ok(());
                            }
                            if let Some(route) = routes.get_mut(&dp) {
                                if let Some(close) = route.resp.on_chunk(&data) {
                                    if close {
                                        debug!("Route {} asked to close", dp);
                                        routes.remove(&dp);
                                    }
                                }
                            }
                        }
                        RaceEvent::End => {
                            routes.remove(&dp);
                            if routes.is_empty() {
                                let _ = client.shutdown().await;
                                return Ok(());
                            }
                        }
                        RaceEvent::Error(e) => {
                            warn!("Route {} failed: {}", dp, e);
                            routes.remove(&dp);
                            if routes.is_empty() {
                                adapter.on_fail_feedback(&mut client).await;
                                let _ = client.shutdown().await;
                                return Ok(());
                            }
                        }
                    }
                },
            }
        }
    }

    async fn start_race(&self, adapter: Arc<dyn PathProtocol>) -> Result<RaceHandle> {
        let candidates = self.engine.get_targets(adapter.addr(), adapter.port()).await;
        if candidates.is_empty() {
            return Err(Error::diagnosis_unavailable(format!(
                "{}:{}",
                adapter.addr(),
                adapter.port()
            )));
        }
        race(
            candidates,
            adapter,
            self.engine.clone() as Arc<dyn RaceFeedback>,
            self.registry.proxies().to_vec(),
            self.settings.clone(),
        )
    }

    /// Start a race for one destination and forward its events, tagged,
    /// into the shared channel.
    async fn open_route(
        &self,
        d_and_p: &str,
        adapter: Arc<HttpAdapter>,
        ev_tx: &mpsc::UnboundedSender<(String, RaceEvent)>,
    ) -> Result<RaceSender> {
        let handle = self.start_race(adapter).await?;
        let (sender, mut events) = handle.into_parts();
        let tag = d_and_p.to_string();
        let tx = ev_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send((tag.clone(), event)).is_err() {
                    break;
                }
            }
        });
        Ok(sender)
    }
}

struct Route {
    sender: RaceSender,
    resp: RespTracker,
}

impl Route {
    fn new(sender: RaceSender) -> Self {
        Route {
            sender,
            resp: RespTracker::default(),
        }
    }
}

/// Tracks response message boundaries on one route so connection-close
/// responses tear their route down at the right moment
#[derive(Default)]
struct RespTracker {
    active: bool,
    len_rest: Option<i64>,
    to_close: bool,
}

impl RespTracker {
    /// Feed one response chunk. `Some(to_close)` when a full response has
    /// been seen.
    fn on_chunk(&mut self, data: &[u8]) -> Option<bool> {
        if !self.active {
            if let Some(head) = http::parse_response_head(data) {
                self.active = true;
                self.to_close = head.connection_close;
                self.len_rest = head
                    .content_length
                    .map(|len| len as i64 - (data.len() - head.content_start) as i64);
            }
        } else if let Some(rest) = self.len_rest.as_mut() {
            *rest -= data.len() as i64;
        }
        let complete = match self.len_rest {
            Some(rest) => self.active && rest <= 0,
            None => data.ends_with(b"\r\n\r\n"),
        };
        if complete {
            let to_close = self.to_close;
            *self = RespTracker::default();
            Some(to_close)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resp_tracker_content_length() {
        let mut tracker = RespTracker::default();
        assert_eq!(
            tracker.on_chunk(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n12345"),
            None
        );
        assert_eq!(tracker.on_chunk(b"67890"), Some(false));
        // tracker reset for the next response
        assert!(!tracker.active);
    }

    #[test]
    fn test_resp_tracker_connection_close() {
        let mut tracker = RespTracker::default();
        let complete =
            tracker.on_chunk(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");
        assert_eq!(complete, Some(true));
    }

    #[test]
    fn test_resp_tracker_headerless_tail() {
        let mut tracker = RespTracker::default();
        assert_eq!(tracker.on_chunk(b"HTTP/1.1 304 Not Modified\r\n\r\n"), Some(false));
    }
}
