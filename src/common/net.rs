//! Shared network helpers

use std::net::IpAddr;

/// Whether an address belongs to the local network (loopback, RFC1918,
/// link-local). Feedback counters never penalize these destinations.
pub fn is_lan_addr(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 link-local and fc00::/7 unique-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Whether a destination string names a LAN address. Non-IP domains are not
/// treated as local.
pub fn is_lan_host(host: &str) -> bool {
    match host.parse::<IpAddr>() {
        Ok(ip) => is_lan_addr(ip),
        Err(_) => host == "localhost",
    }
}

/// Snapshot of local interface identity, used to detect network changes.
///
/// The UDP sockets are never actually sent on; connecting them just asks the
/// kernel which source address would be used for an external destination.
pub fn local_addr_snapshot() -> Vec<IpAddr> {
    let mut addrs = Vec::new();
    for probe in ["8.8.8.8:53", "[2001:4860:4860::8888]:53"] {
        if let Ok(sock) = std::net::UdpSocket::bind(if probe.starts_with('[') {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        }) {
            if sock.connect(probe).is_ok() {
                if let Ok(local) = sock.local_addr() {
                    addrs.push(local.ip());
                }
            }
        }
    }
    addrs.sort();
    addrs.dedup();
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lan_detection() {
        assert!(is_lan_host("127.0.0.1"));
        assert!(is_lan_host("192.168.1.20"));
        assert!(is_lan_host("10.0.0.5"));
        assert!(is_lan_host("localhost"));
        assert!(!is_lan_host("1.1.1.1"));
        assert!(!is_lan_host("example.com"));
    }

    #[test]
    fn test_lan_v6() {
        assert!(is_lan_host("::1"));
        assert!(is_lan_host("fe80::1"));
        assert!(!is_lan_host("2606:4700::1111"));
    }
}
