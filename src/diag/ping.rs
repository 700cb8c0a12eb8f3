//! ICMP echo probing for direct candidates
//!
//! Uses unprivileged DGRAM-ICMP sockets (no raw-socket capability needed on
//! Linux hosts with `ping_group_range` configured). The kernel strips the IP
//! header and fills in the echo identifier, so only type/seq matching is done
//! here.

use super::stats::ProbeReport;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::debug;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Spacing between echoes within one probe
const ECHO_INTERVAL: Duration = Duration::from_millis(200);

/// Number of echoes per probe
pub const ECHO_COUNT: u32 = 10;

/// Probe one address: send `count` echoes, report loss percentage and mean
/// round-trip time. A probe that cannot even open a socket reports 100% loss
/// so the loss ceiling filters the candidate out.
pub async fn probe(ip: IpAddr, count: u32, reply_timeout: Duration) -> ProbeReport {
    let socket = match icmp_socket(ip) {
        Ok(s) => s,
        Err(e) => {
            debug!("ICMP socket for {} unavailable: {}", ip, e);
            return ProbeReport {
                loss_pct: 100.0,
                latency_ms: 0,
            };
        }
    };

    let dst = SocketAddr::new(ip, 0);
    let ident: u16 = rand::random();
    let mut received = 0u32;
    let mut total_rtt = Duration::ZERO;

    for seq in 0..count as u16 {
        let started = Instant::now();
        let packet = build_echo_request(ip, ident, seq);
        if socket.send_to(&packet, dst).await.is_err() {
            continue;
        }

        if let Some(rtt) = wait_reply(&socket, ip, seq, reply_timeout).await {
            received += 1;
            total_rtt += rtt;
        }

        let elapsed = started.elapsed();
        if elapsed < ECHO_INTERVAL && seq + 1 < count as u16 {
            tokio::time::sleep(ECHO_INTERVAL - elapsed).await;
        }
    }

    let loss_pct = 100.0 * (count - received) as f32 / count as f32;
    let latency_ms = if received > 0 {
        (total_rtt / received).as_millis() as u32
    } else {
        0
    };
    ProbeReport {
        loss_pct,
        latency_ms,
    }
}

async fn wait_reply(
    socket: &UdpSocket,
    ip: IpAddr,
    seq: u16,
    reply_timeout: Duration,
) -> Option<Duration> {
    let started = Instant::now();
    let mut buf = [0u8; 1500];
    loop {
        let remaining = reply_timeout.checked_sub(started.elapsed())?;
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) if n >= 8 => {
                let expected = if ip.is_ipv4() {
                    ICMP_ECHO_REPLY
                } else {
                    ICMPV6_ECHO_REPLY
                };
                let recv_seq = u16::from_be_bytes([buf[6], buf[7]]);
                if buf[0] == expected && recv_seq == seq {
                    return Some(started.elapsed());
                }
                // stale reply to an earlier echo, keep waiting
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => return None,
        }
    }
}

fn icmp_socket(ip: IpAddr) -> std::io::Result<UdpSocket> {
    let (domain, protocol) = if ip.is_ipv4() {
        (Domain::IPV4, Protocol::ICMPV4)
    } else {
        (Domain::IPV6, Protocol::ICMPV6)
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(protocol))?;
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

fn build_echo_request(ip: IpAddr, ident: u16, seq: u16) -> Vec<u8> {
    // 8-byte header + 16-byte payload
    let mut packet = vec![0u8; 24];
    packet[0] = if ip.is_ipv4() {
        ICMP_ECHO_REQUEST
    } else {
        ICMPV6_ECHO_REQUEST
    };
    packet[1] = 0;
    packet[4..6].copy_from_slice(&ident.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    for (i, b) in packet[8..].iter_mut().enumerate() {
        *b = i as u8;
    }
    // The kernel computes the ICMPv6 checksum; v4 is on us.
    if ip.is_ipv4() {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let Some(&last) = chunks.remainder().first() {
        sum += (last as u32) << 8;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_checksum_self_cancels() {
        let packet = build_echo_request(IpAddr::V4(Ipv4Addr::LOCALHOST), 0x1234, 7);
        // summing a packet that already contains its checksum yields 0xffff
        let mut sum = 0u32;
        for chunk in packet.chunks_exact(2) {
            sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        assert_eq!(sum, 0xffff);
    }

    #[test]
    fn test_echo_layout() {
        let packet = build_echo_request(IpAddr::V4(Ipv4Addr::LOCALHOST), 0xabcd, 3);
        assert_eq!(packet[0], ICMP_ECHO_REQUEST);
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 0xabcd);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 3);
    }
}
