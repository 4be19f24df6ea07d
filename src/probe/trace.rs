//! UDP traceroute probe
//!
//! One UDP socket sends datagrams with increasing TTL, each to its own
//! destination port; a raw ICMP socket opened beforehand collects the
//! time-exceeded and unreachable replies. A reply counts for a hop only when
//! the UDP header it quotes carries our source port and that hop's
//! destination port.

use byteorder::{BigEndian, ByteOrder};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::icmp::{family_of, open_raw_icmp, recv_until};
use super::{IpVersion, Prober};
use crate::error::ProbeError;
use crate::model::{Hop, ProbeValue};

const TIME_EXCEEDED_V4: u8 = 11;
const UNREACHABLE_V4: u8 = 3;
const TIME_EXCEEDED_V6: u8 = 3;
const UNREACHABLE_V6: u8 = 1;

const ICMP_HEADER_LEN: usize = 8;
const IPV6_HEADER_LEN: usize = 40;
const UDP_PROTOCOL: u8 = 17;

/// Datagram payload; content is irrelevant to the responders.
const PROBE_PAYLOAD: &[u8] = b"vantage";

/// Destination port for the datagram sent with `ttl`.
pub fn hop_port(base: u16, ttl: u8) -> u16 {
    base.wrapping_add(u16::from(ttl.saturating_sub(1)))
}

/// Source and destination ports of the UDP header quoted by a hop response.
fn quoted_ports(packet: &[u8], version: IpVersion) -> Option<(u16, u16)> {
    let (icmp, kinds) = match version {
        IpVersion::Ipv4 => {
            let ihl = usize::from(packet.first()? & 0x0F) * 4;
            (packet.get(ihl..)?, [TIME_EXCEEDED_V4, UNREACHABLE_V4])
        }
        IpVersion::Ipv6 => (packet, [TIME_EXCEEDED_V6, UNREACHABLE_V6]),
    };
    if !kinds.contains(icmp.first()?) {
        return None;
    }

    let inner = icmp.get(ICMP_HEADER_LEN..)?;
    let udp = match version {
        IpVersion::Ipv4 => {
            if *inner.get(9)? != UDP_PROTOCOL {
                return None;
            }
            let ihl = usize::from(inner.first()? & 0x0F) * 4;
            inner.get(ihl..)?
        }
        IpVersion::Ipv6 => {
            if *inner.get(6)? != UDP_PROTOCOL {
                return None;
            }
            inner.get(IPV6_HEADER_LEN..)?
        }
    };
    let ports = udp.get(..4)?;
    Some((BigEndian::read_u16(&ports[..2]), BigEndian::read_u16(&ports[2..])))
}

/// Whether a raw ICMP packet answers the datagram sent from `local_port` to
/// `dest_port`.
pub fn is_hop_response(packet: &[u8], version: IpVersion, local_port: u16, dest_port: u16) -> bool {
    quoted_ports(packet, version) == Some((local_port, dest_port))
}

fn set_hop_limit(socket: &UdpSocket, version: IpVersion, ttl: u8) -> std::io::Result<()> {
    match version {
        IpVersion::Ipv4 => socket.set_ttl(u32::from(ttl)),
        IpVersion::Ipv6 => socket2::SockRef::from(socket).set_unicast_hops_v6(u32::from(ttl)),
    }
}

/// Walk TTL 1..=`max_hops` toward `dest`, sending TTL `n` to port
/// `port + n - 1`. Unanswered hops are skipped; the walk stops once the
/// destination itself answers.
pub fn trace_blocking(
    dest: IpAddr,
    max_hops: u8,
    port: u16,
    hop_timeout: Duration,
) -> Result<Vec<Hop>, ProbeError> {
    let version = family_of(&dest);
    let receiver = open_raw_icmp(version)?;
    let local: SocketAddr = match version {
        IpVersion::Ipv4 => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpVersion::Ipv6 => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let sender = UdpSocket::bind(local)?;
    let local_port = sender.local_addr()?.port();

    let mut hops = Vec::new();
    for ttl in 1..=max_hops {
        set_hop_limit(&sender, version, ttl)?;
        let dest_port = hop_port(port, ttl);
        let started = Instant::now();
        sender.send_to(PROBE_PAYLOAD, SocketAddr::new(dest, dest_port))?;

        let answer = recv_until(&receiver, started + hop_timeout, hop_timeout, |packet, from| {
            is_hop_response(packet, version, local_port, dest_port).then(|| from.ip())
        });

        match answer {
            Ok(responder) => {
                let rtt_ms = (started.elapsed().as_secs_f64() * 100_000.0).round() / 100.0;
                trace!(ttl, %responder, rtt_ms, "Hop answered");
                hops.push(Hop { address: responder.to_string(), rtt_ms });
                if responder == dest {
                    break;
                }
            }
            Err(ProbeError::Timeout(_)) => trace!(ttl, "Hop silent"),
            Err(err) => return Err(err),
        }
    }
    Ok(hops)
}

impl Prober {
    /// Hop list toward `addr`, or "N/A" when raw sockets are unavailable.
    pub async fn trace(&self, addr: IpAddr) -> ProbeValue {
        let max_hops = self.settings.max_hops;
        let port = self.settings.trace_port;
        let hop_timeout = self.settings.trace_hop_timeout;

        let outcome =
            tokio::task::spawn_blocking(move || trace_blocking(addr, max_hops, port, hop_timeout)).await;

        match outcome {
            Ok(Ok(hops)) => {
                debug!(%addr, hops = hops.len(), "Trace finished");
                ProbeValue::Hops(hops)
            }
            Ok(Err(err)) => {
                warn!(%addr, %err, "Trace unavailable");
                ProbeValue::na()
            }
            Err(err) => {
                warn!(%addr, %err, "Trace task aborted");
                ProbeValue::na()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// IPv4 packet as a raw socket delivers it: outer IP header, ICMP header,
    /// then the quoted IP and UDP headers of the datagram that triggered it.
    fn quoted_v4(kind: u8, protocol: u8, src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut packet = vec![0u8; 20 + ICMP_HEADER_LEN + 20 + 8];
        packet[0] = 0x45;
        packet[20] = kind;
        packet[28] = 0x45;
        packet[28 + 9] = protocol;
        BigEndian::write_u16(&mut packet[48..50], src_port);
        BigEndian::write_u16(&mut packet[50..52], dst_port);
        packet
    }

    fn quoted_v6(kind: u8, src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut packet = vec![0u8; ICMP_HEADER_LEN + IPV6_HEADER_LEN + 8];
        packet[0] = kind;
        packet[ICMP_HEADER_LEN] = 0x60;
        packet[ICMP_HEADER_LEN + 6] = UDP_PROTOCOL;
        let udp = ICMP_HEADER_LEN + IPV6_HEADER_LEN;
        BigEndian::write_u16(&mut packet[udp..udp + 2], src_port);
        BigEndian::write_u16(&mut packet[udp + 2..udp + 4], dst_port);
        packet
    }

    #[test]
    fn test_hop_port_increments_with_ttl() {
        assert_eq!(hop_port(33434, 1), 33434);
        assert_eq!(hop_port(33434, 3), 33436);
        assert_eq!(hop_port(33434, 30), 33463);
        assert_eq!(hop_port(u16::MAX, 2), 0);
    }

    #[test]
    fn test_hop_response_types_v4() {
        let ours = |kind| quoted_v4(kind, UDP_PROTOCOL, 40000, 33434);
        assert!(is_hop_response(&ours(TIME_EXCEEDED_V4), IpVersion::Ipv4, 40000, 33434));
        assert!(is_hop_response(&ours(UNREACHABLE_V4), IpVersion::Ipv4, 40000, 33434));
        assert!(!is_hop_response(&ours(0), IpVersion::Ipv4, 40000, 33434));
        assert!(!is_hop_response(&[0x45], IpVersion::Ipv4, 40000, 33434));
    }

    #[test]
    fn test_hop_response_types_v6() {
        let ours = |kind| quoted_v6(kind, 40000, 33434);
        assert!(is_hop_response(&ours(TIME_EXCEEDED_V6), IpVersion::Ipv6, 40000, 33434));
        assert!(is_hop_response(&ours(UNREACHABLE_V6), IpVersion::Ipv6, 40000, 33434));
        assert!(!is_hop_response(&ours(129), IpVersion::Ipv6, 40000, 33434));
        assert!(!is_hop_response(&[], IpVersion::Ipv6, 40000, 33434));
    }

    #[test]
    fn test_hop_response_for_another_datagram_is_rejected() {
        // Another traceroute on the host
        let foreign = quoted_v4(TIME_EXCEEDED_V4, UDP_PROTOCOL, 40001, 33434);
        assert!(!is_hop_response(&foreign, IpVersion::Ipv4, 40000, 33434));

        // Late answer to the previous TTL
        let stale = quoted_v4(TIME_EXCEEDED_V4, UDP_PROTOCOL, 40000, 33434);
        assert!(!is_hop_response(&stale, IpVersion::Ipv4, 40000, 33435));

        // Quoted TCP segment
        let tcp = quoted_v4(UNREACHABLE_V4, 6, 40000, 33434);
        assert!(!is_hop_response(&tcp, IpVersion::Ipv4, 40000, 33434));

        let foreign = quoted_v6(TIME_EXCEEDED_V6, 40001, 33434);
        assert!(!is_hop_response(&foreign, IpVersion::Ipv6, 40000, 33434));

        let mut truncated = quoted_v4(TIME_EXCEEDED_V4, UDP_PROTOCOL, 40000, 33434);
        truncated.truncate(50);
        assert!(!is_hop_response(&truncated, IpVersion::Ipv4, 40000, 33434));
    }

    #[tokio::test]
    async fn test_trace_stops_at_destination() {
        let closed_port = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let settings = crate::probe::ProbeSettings {
            max_hops: 3,
            trace_port: closed_port,
            trace_hop_timeout: Duration::from_millis(500),
            nameservers: vec!["127.0.0.1".parse().unwrap()],
            ..Default::default()
        };
        let prober = Prober::new(settings).unwrap();
        let outcome = prober.trace("127.0.0.1".parse().unwrap()).await;

        if open_raw_icmp(IpVersion::Ipv4).is_ok() {
            match outcome {
                ProbeValue::Hops(hops) => {
                    assert_eq!(hops.len(), 1);
                    assert_eq!(hops[0].address, "127.0.0.1");
                    assert!(hops[0].rtt_ms >= 0.0);
                }
                other => panic!("expected hops, got {:?}", other),
            }
        } else {
            assert_eq!(outcome, ProbeValue::na());
        }
    }
}
