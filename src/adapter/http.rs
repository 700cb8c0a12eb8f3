//! HTTP and HTTPS (CONNECT) adapter
//!
//! Two modes share one adapter. CONNECT requests open a tunnel to a single
//! destination; plain HTTP proxy requests carry absolute-form URLs and may
//! address several destinations over one client socket, so the inbound
//! layer keys one race per `domain:port` and uses request-line parsing here
//! to spot destination switches.

use super::{write_for_ack, PathProtocol};
use crate::diag::stats::Target;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const MAX_METHOD_LEN: usize = 10;
const MAX_URL_LEN: usize = 100_000;
const LINE_END: &[u8] = b"\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";
pub(crate) const CONNECTED_FEEDBACK: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const CONNECT_FAILED_FEEDBACK: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const CONNECTION_ESTABLISHED: &[u8] = b"Connection Established";

/// Ack wait for a CONNECT forwarded through an upstream proxy
const PROXY_CONNECT_ACK_WAIT: Duration = Duration::from_millis(2500);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(2);

static SCHEME_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://[^/]*").expect("static pattern"));

#[derive(Debug, Clone)]
pub(crate) struct RequestLine {
    pub method: String,
    pub url: String,
    pub version: String,
}

/// Parsed destination of an absolute-form or CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpDestination {
    pub addr: String,
    pub port: u16,
    pub scheme: String,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub(crate) fn parse_request_line(data: &[u8]) -> Option<RequestLine> {
    let first_space = data.iter().position(|&b| b == b' ')?;
    if first_space > MAX_METHOD_LEN {
        return None;
    }
    let line_end = find(data, LINE_END).unwrap_or(data.len());
    if line_end > MAX_URL_LEN {
        return None;
    }
    let rest = &data[first_space + 1..line_end];
    let second_space = rest.iter().position(|&b| b == b' ')?;
    Some(RequestLine {
        method: std::str::from_utf8(&data[..first_space]).ok()?.to_string(),
        url: std::str::from_utf8(&rest[..second_space]).ok()?.to_string(),
        version: std::str::from_utf8(&rest[second_space + 1..])
            .ok()?
            .to_string(),
    })
}

/// Destination of one client request packet, `None` when the bytes do not
/// look like an HTTP request head.
pub fn parse_destination(data: &[u8]) -> Option<(RequestLine, HttpDestination)> {
    let line = parse_request_line(data)?;
    let (scheme, rest) = if let Some(stripped) = line.url.strip_prefix("https://") {
        ("https", stripped)
    } else if let Some(stripped) = line.url.strip_prefix("http://") {
        ("http", stripped)
    } else {
        ("", line.url.as_str())
    };
    let host_port = rest.split('/').next().unwrap_or("");
    let (addr, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (host_port, 80),
    };
    if addr.is_empty() {
        return None;
    }
    let dest = HttpDestination {
        addr: addr.to_string(),
        port,
        scheme: scheme.to_string(),
    };
    Some((line, dest))
}

/// Parsed response head, for tracking message boundaries in plain-HTTP mode
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub code: u16,
    pub content_length: Option<u64>,
    pub connection_close: bool,
    pub content_start: usize,
}

pub(crate) fn parse_response_head(data: &[u8]) -> Option<ResponseHead> {
    if !data.starts_with(b"HTTP/") {
        return None;
    }
    let head_end = find(data, HEAD_END)?;
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(&data[..head_end + HEAD_END.len()]) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return None,
    }
    let mut content_length = None;
    let mut connection_close = false;
    for header in resp.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            content_length = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse().ok());
        } else if header.name.eq_ignore_ascii_case("connection") {
            connection_close = header.value.eq_ignore_ascii_case(b"close");
        }
    }
    Some(ResponseHead {
        code: resp.code?,
        content_length,
        connection_close,
        content_start: head_end + HEAD_END.len(),
    })
}

/// One HTTP adapter per raced destination
pub struct HttpAdapter {
    addr: String,
    port: u16,
    /// Refined once the first tunneled packet is seen, so idle-verify
    /// probes use the scheme actually spoken
    scheme: RwLock<String>,
    payload_judged: AtomicBool,
    is_connect: bool,
    /// The client's request head, forwarded verbatim when tunneling
    /// through an upstream proxy
    head: Bytes,
}

impl HttpAdapter {
    /// Recognize an HTTP request in the first client bytes
    pub fn detect(first: &[u8]) -> Result<Option<HttpAdapter>> {
        let Some((line, dest)) = parse_destination(first) else {
            return Ok(None);
        };
        let is_connect = line.method.eq_ignore_ascii_case("CONNECT");
        // a CONNECT with no explicit scheme is almost certainly TLS
        let scheme = if dest.scheme.is_empty() {
            if is_connect { "https" } else { "http" }.to_string()
        } else {
            dest.scheme
        };
        Ok(Some(HttpAdapter {
            addr: dest.addr,
            port: dest.port,
            scheme: RwLock::new(scheme),
            payload_judged: AtomicBool::new(false),
            is_connect,
            head: Bytes::copy_from_slice(first),
        }))
    }

    /// Adapter for a follow-up destination on a multiplexed plain-HTTP
    /// client connection
    pub fn for_destination(dest: &HttpDestination) -> HttpAdapter {
        HttpAdapter {
            addr: dest.addr.clone(),
            port: dest.port,
            scheme: RwLock::new(if dest.scheme.is_empty() {
                "http".to_string()
            } else {
                dest.scheme.clone()
            }),
            payload_judged: AtomicBool::new(false),
            is_connect: false,
            head: Bytes::new(),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.is_connect
    }

    /// The request head captured at detection, replayed into the race for
    /// plain-HTTP requests
    pub fn head(&self) -> Bytes {
        self.head.clone()
    }

    #[cfg(test)]
    pub(crate) fn tunnel_for_test(addr: &str, port: u16) -> HttpAdapter {
        HttpAdapter {
            addr: addr.to_string(),
            port,
            scheme: RwLock::new("https".to_string()),
            payload_judged: AtomicBool::new(false),
            is_connect: true,
            head: Bytes::new(),
        }
    }
}

/// Strip `scheme://host` from an absolute-form request line so an origin
/// server sees the path it expects. `None` when nothing needs rewriting.
fn strip_origin_form(data: &[u8]) -> Option<Vec<u8>> {
    let first_space = data.iter().position(|&b| b == b' ')?;
    let rest = &data[first_space + 1..];
    let second_space = rest.iter().position(|&b| b == b' ')? + first_space + 1;
    let url = std::str::from_utf8(&data[first_space + 1..second_space]).ok()?;
    let stripped = SCHEME_HOST.replace(url, "");
    if stripped == url {
        return None;
    }
    let path: &str = if stripped.is_empty() { "/" } else { &stripped };
    let mut rewritten = Vec::with_capacity(data.len());
    rewritten.extend_from_slice(&data[..first_space + 1]);
    rewritten.extend_from_slice(path.as_bytes());
    rewritten.extend_from_slice(&data[second_space..]);
    Some(rewritten)
}

#[async_trait]
impl PathProtocol for HttpAdapter {
    fn addr(&self) -> &str {
        &self.addr
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn min_idle_verify_recv(&self) -> u64 {
        // a tunnel that completed its CONNECT exchange deserves idle
        // verification; plain HTTP requests do not
        if self.is_connect {
            1
        } else {
            0
        }
    }

    async fn on_path_connect(&self, target: &Target, stream: &mut TcpStream) -> Result<u32> {
        if self.is_connect && !target.direct {
            // forward the client's CONNECT to the upstream proxy and wait
            // for its establishment line
            let ack = write_for_ack(stream, &self.head, PROXY_CONNECT_ACK_WAIT).await?;
            if find(&ack, CONNECTION_ESTABLISHED).is_none() {
                return Err(Error::protocol(format!(
                    "establish proxy connection failed: {}",
                    String::from_utf8_lossy(&ack)
                )));
            }
            return Ok(1);
        }
        Ok(0)
    }

    async fn write_to_path(
        &self,
        data: &[u8],
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        target: &Target,
    ) -> Result<()> {
        if !self.is_connect && target.direct {
            if let Some(rewritten) = strip_origin_form(data) {
                debug!("Rewrote absolute-form request line for {}", self.addr);
                writer.write_all(&rewritten).await?;
                return Ok(());
            }
        }
        writer.write_all(data).await?;
        Ok(())
    }

    async fn verify_idle(&self, target: &Target) -> bool {
        let url = format!(
            "{}://{}{}",
            self.scheme.read(),
            self.addr,
            if self.port == 80 || self.port == 443 {
                String::new()
            } else {
                format!(":{}", self.port)
            }
        );
        let mut builder = reqwest::Client::builder()
            .timeout(VERIFY_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none());
        if !target.direct {
            match reqwest::Proxy::all(format!("http://{}:{}", target.ip, target.port)) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(_) => return false,
            }
        }
        let Ok(client) = builder.build() else {
            return false;
        };
        match client.get(&url).send().await {
            // any response at all proves the path is alive
            Ok(_) => true,
            Err(e) => {
                debug!("Idle verify request to {} failed: {}", url, e);
                false
            }
        }
    }

    async fn on_connected_feedback(&self, client: &mut TcpStream) {
        if self.is_connect {
            let _ = client.write_all(CONNECTED_FEEDBACK).await;
        }
    }

    async fn on_fail_feedback(&self, client: &mut TcpStream) {
        let _ = client.write_all(CONNECT_FAILED_FEEDBACK).await;
    }

    fn note_client_payload(&self, first: &[u8]) {
        if !self.is_connect || self.payload_judged.swap(true, Ordering::SeqCst) {
            return;
        }
        // plaintext HTTP inside a CONNECT tunnel
        if let Some(line) = parse_request_line(first) {
            if line.version.len() >= 4 && line.version[..4].eq_ignore_ascii_case("http") {
                *self.scheme.write() = "http".to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_destination() {
        let (line, dest) = parse_destination(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(line.method, "CONNECT");
        assert_eq!(dest.addr, "example.com");
        assert_eq!(dest.port, 443);
        assert!(dest.scheme.is_empty());
    }

    #[test]
    fn test_parse_absolute_form() {
        let (line, dest) =
            parse_destination(b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
                .unwrap();
        assert_eq!(line.method, "GET");
        assert_eq!(dest.addr, "example.com");
        assert_eq!(dest.port, 80);
        assert_eq!(dest.scheme, "http");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_destination(&[5, 1, 0]).is_none());
        assert!(parse_destination(b"NOSPACES").is_none());
    }

    #[test]
    fn test_detect_connect_defaults_to_https() {
        let adapter = HttpAdapter::detect(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(adapter.is_connect());
        assert_eq!(*adapter.scheme.read(), "https");
        assert_eq!(adapter.min_idle_verify_recv(), 1);
    }

    #[test]
    fn test_first_tunnel_packet_downgrades_scheme() {
        let adapter = HttpAdapter::detect(b"CONNECT example.com:80 HTTP/1.1\r\n\r\n")
            .unwrap()
            .unwrap();
        adapter.note_client_payload(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(*adapter.scheme.read(), "http");
        // judged once; later packets never flip it back
        adapter.note_client_payload(&[0x16, 0x03, 0x01]);
        assert_eq!(*adapter.scheme.read(), "http");
    }

    #[test]
    fn test_strip_origin_form() {
        let rewritten =
            strip_origin_form(b"GET http://example.com/a/b HTTP/1.1\r\nHost: example.com\r\n\r\n")
                .unwrap();
        assert!(rewritten.starts_with(b"GET /a/b HTTP/1.1\r\n"));
        // bare root URL still yields a path
        let rewritten = strip_origin_form(b"GET http://example.com HTTP/1.1\r\n\r\n").unwrap();
        assert!(rewritten.starts_with(b"GET / HTTP/1.1\r\n"));
        // relative form left alone
        assert!(strip_origin_form(b"GET /a/b HTTP/1.1\r\n\r\n").is_none());
    }

    #[test]
    fn test_parse_response_head() {
        let head = parse_response_head(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .unwrap();
        assert_eq!(head.code, 200);
        assert_eq!(head.content_length, Some(5));
        assert!(head.connection_close);
        assert_eq!(&b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello"[head.content_start..], b"hello");
    }

    #[test]
    fn test_parse_response_head_partial() {
        assert!(parse_response_head(b"HTTP/1.1 200 OK\r\nContent-").is_none());
        assert!(parse_response_head(b"not a response").is_none());
    }
}
