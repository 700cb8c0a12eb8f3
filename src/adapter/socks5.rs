//! Minimal SOCKS5 adapter: no-auth only, CONNECT command only.
//!
//! Detection is interactive. The greeting is acknowledged immediately and
//! the connect request read from the client, so by the time racing starts
//! the destination is known and the original request bytes are kept for
//! replay to chained upstream proxies.

use super::{write_for_ack, PathProtocol};
use crate::diag::stats::Target;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const VER: u8 = 5;
const CMD_CONNECT: u8 = 1;
const NO_AUTH_ACK: [u8; 2] = [5, 0];
const NO_AUTH_REQ: [u8; 3] = [5, 1, 0];
const REP_SUCCEEDED: u8 = 0;
const REP_HOST_UNREACHABLE: u8 = 4;

const GREETING_ACK_WAIT: Duration = Duration::from_millis(1500);
const CONNECT_ACK_WAIT: Duration = Duration::from_millis(2500);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Parse the address and port out of a SOCKS5 connect request
fn parse_addr_port(data: &[u8]) -> Result<(String, u16)> {
    if data.len() < 5 {
        return Err(Error::protocol("socks5 request too short"));
    }
    let (addr, rest) = match data[3] {
        1 => {
            if data.len() < 8 {
                return Err(Error::protocol("truncated socks5 ipv4 address"));
            }
            let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
            (ip.to_string(), &data[8..])
        }
        3 => {
            let end = 5 + data[4] as usize;
            if data.len() < end {
                return Err(Error::protocol("truncated socks5 domain"));
            }
            let domain = std::str::from_utf8(&data[5..end])
                .map_err(|_| Error::protocol("socks5 domain is not utf-8"))?;
            (domain.to_string(), &data[end..])
        }
        4 => {
            if data.len() < 20 {
                return Err(Error::protocol("truncated socks5 ipv6 address"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[4..20]);
            (Ipv6Addr::from(octets).to_string(), &data[20..])
        }
        other => {
            return Err(Error::protocol(format!(
                "unsupported socks5 address type {}",
                other
            )))
        }
    };
    if rest.len() != 2 {
        return Err(Error::protocol("illegal socks5 port field length"));
    }
    Ok((addr, u16::from_be_bytes([rest[0], rest[1]])))
}

pub struct Socks5Adapter {
    addr: String,
    port: u16,
    /// The client's connect request, replayed to chained proxies and
    /// echoed back (with a reply code) to the client
    request: Bytes,
}

impl Socks5Adapter {
    /// Recognize a SOCKS5 greeting. On match, acks the greeting and reads
    /// the connect request off the client stream.
    pub async fn detect(first: &[u8], client: &mut TcpStream) -> Result<Option<Socks5Adapter>> {
        if first.first() != Some(&VER) || first.len() != 2 + first.get(1).copied().unwrap_or(0) as usize
        {
            return Ok(None);
        }
        client.write_all(&NO_AUTH_ACK).await?;
        let mut buf = vec![0u8; 512];
        let n = client.read(&mut buf).await?;
        if n == 0 || buf[0] != VER {
            return Err(Error::protocol("socks5 communication error"));
        }
        if buf[1] != CMD_CONNECT {
            return Err(Error::protocol("unsupported socks5 command"));
        }
        buf.truncate(n);
        let (addr, port) = parse_addr_port(&buf)?;
        debug!("SOCKS5 request for {}:{}", addr, port);
        Ok(Some(Socks5Adapter {
            addr,
            port,
            request: Bytes::from(buf),
        }))
    }

    /// Reply to the client by echoing its request with a reply code
    async fn reply(&self, client: &mut TcpStream, code: u8) {
        let mut ack = self.request.to_vec();
        if ack.len() > 1 {
            ack[1] = code;
            let _ = client.write_all(&ack).await;
        }
    }
}

#[async_trait]
impl PathProtocol for Socks5Adapter {
    fn addr(&self) -> &str {
        &self.addr
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn min_idle_verify_recv(&self) -> u64 {
        0
    }

    async fn on_path_connect(&self, target: &Target, stream: &mut TcpStream) -> Result<u32> {
        if target.direct {
            return Ok(0);
        }
        // chained proxy: greeting round, then the client's request verbatim
        let ack = write_for_ack(stream, &NO_AUTH_REQ, GREETING_ACK_WAIT).await?;
        if ack != NO_AUTH_ACK {
            return Err(Error::protocol("unknown greeting ack from next proxy"));
        }
        let ack = write_for_ack(stream, &self.request, CONNECT_ACK_WAIT).await?;
        if ack.len() < 2 || ack[0] != VER || ack[1] != REP_SUCCEEDED {
            return Err(Error::protocol("next proxy refused the connect request"));
        }
        Ok(2)
    }

    async fn write_to_path(
        &self,
        data: &[u8],
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        _target: &Target,
    ) -> Result<()> {
        writer.write_all(data).await?;
        Ok(())
    }

    async fn verify_idle(&self, target: &Target) -> bool {
        // no re-verification through a chained proxy
        if !target.direct {
            return true;
        }
        let scheme = if self.port == 443 { "https" } else { "http" };
        let url = format!(
            "{}://{}{}",
            scheme,
            self.addr,
            if self.port == 80 || self.port == 443 {
                String::new()
            } else {
                format!(":{}", self.port)
            }
        );
        let Ok(client) = reqwest::Client::builder()
            .timeout(VERIFY_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
        else {
            return false;
        };
        match client.get(&url).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!("Idle verify request to {} failed: {}", url, e);
                false
            }
        }
    }

    async fn on_connected_feedback(&self, client: &mut TcpStream) {
        self.reply(client, REP_SUCCEEDED).await;
    }

    async fn on_fail_feedback(&self, client: &mut TcpStream) {
        self.reply(client, REP_HOST_UNREACHABLE).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_request() {
        let req = [5, 1, 0, 1, 93, 184, 216, 34, 1, 187];
        let (addr, port) = parse_addr_port(&req).unwrap();
        assert_eq!(addr, "93.184.216.34");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_domain_request() {
        let mut req = vec![5, 1, 0, 3, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        let (addr, port) = parse_addr_port(&req).unwrap();
        assert_eq!(addr, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_ipv6_request() {
        let mut req = vec![5, 1, 0, 4];
        req.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        req.extend_from_slice(&8080u16.to_be_bytes());
        let (addr, port) = parse_addr_port(&req).unwrap();
        assert_eq!(addr, "::1");
        assert_eq!(port, 8080);
    }

    #[test]
    fn test_parse_rejects_trailing_bytes() {
        let req = [5, 1, 0, 1, 127, 0, 0, 1, 0, 80, 99];
        assert!(parse_addr_port(&req).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_atyp() {
        let req = [5, 1, 0, 9, 0, 0];
        assert!(parse_addr_port(&req).is_err());
    }
}
