//! Protocol adapters
//!
//! An adapter recognizes a wire protocol from the first client bytes, then
//! drives every per-path concern the race connector needs: the handshake on
//! a freshly connected path, target-aware payload writes, out-of-band idle
//! verification, and the failure response sent to the client when no path
//! works. Detection tries HTTP first, then SOCKS5.

pub mod http;
pub mod socks5;

use crate::diag::stats::Target;
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Write one message and wait for the peer's next chunk as its
/// acknowledgement. Handshakes here are strict request/response rounds.
pub(crate) async fn write_for_ack(
    stream: &mut TcpStream,
    data: &[u8],
    wait: Duration,
) -> Result<Vec<u8>> {
    stream.write_all(data).await?;
    let mut buf = vec![0u8; 4096];
    let n = tokio::time::timeout(wait, stream.read(&mut buf))
        .await
        .map_err(|_| Error::protocol("no acknowledgement within the wait window"))??;
    if n == 0 {
        return Err(Error::protocol("peer closed during handshake"));
    }
    buf.truncate(n);
    Ok(buf)
}

/// Per-path protocol behavior consumed by the race connector.
#[async_trait]
pub trait PathProtocol: Send + Sync {
    /// Destination host this session is for
    fn addr(&self) -> &str;

    /// Destination port
    fn port(&self) -> u16;

    /// Minimum data chunks a path must have produced before an idle timeout
    /// is treated as ambiguous and verified out-of-band
    fn min_idle_verify_recv(&self) -> u64;

    /// Perform the per-path handshake on a connected stream. Returns the
    /// number of handshake round-trips consumed.
    async fn on_path_connect(&self, target: &Target, stream: &mut TcpStream) -> Result<u32>;

    /// Write client payload to a path, rewriting per-target where the wire
    /// format differs between proxy and origin.
    async fn write_to_path(
        &self,
        data: &[u8],
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        target: &Target,
    ) -> Result<()>;

    /// Out-of-band liveness probe used to disambiguate idle timeouts
    async fn verify_idle(&self, target: &Target) -> bool;

    /// Success response once a path commits (establishment line, reply
    /// packet); a no-op for protocols that need none
    async fn on_connected_feedback(&self, client: &mut TcpStream);

    /// Protocol-appropriate failure response when no candidate succeeds
    async fn on_fail_feedback(&self, client: &mut TcpStream);

    /// First client payload after detection, for protocols that refine
    /// their view of the tunneled traffic from it
    fn note_client_payload(&self, _first: &[u8]) {}
}
