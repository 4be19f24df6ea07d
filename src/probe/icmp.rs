//! ICMP echo probe with hand-built packets
//!
//! Requests are assembled byte by byte and sent over a raw socket. Every raw
//! socket sees every ICMP packet the host receives, so a reply is accepted
//! only when it is an echo-reply from the pinged address carrying our
//! identifier and the sequence number of this very request.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::Cursor;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::{IpVersion, Prober};
use crate::constants::{FAIL, ICMPV6_PAYLOAD, ICMP_RECV_BUFFER, OK};
use crate::error::ProbeError;
use crate::model::{PingRecord, ProbeValue};

pub const ECHO_REQUEST_V4: u8 = 8;
pub const ECHO_REPLY_V4: u8 = 0;
pub const ECHO_REQUEST_V6: u8 = 128;
pub const ECHO_REPLY_V6: u8 = 129;

/// ICMP header length: type, code, checksum, identifier, sequence.
const HEADER_LEN: usize = 8;

static NEXT_SEQUENCE: AtomicU16 = AtomicU16::new(1);

/// Internet checksum: one's-complement of the one's-complement sum of
/// big-endian 16-bit words, odd trailing byte padded with zero.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(BigEndian::read_u16(word));
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Echo identifier: the process id truncated to 16 bits.
pub fn identifier() -> u16 {
    (std::process::id() & 0xFFFF) as u16
}

/// Sequence number for the next echo request of this process.
pub fn next_sequence() -> u16 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Build an echo request for the given family.
pub fn echo_request(version: IpVersion, id: u16, sequence: u16) -> Vec<u8> {
    let (kind, payload): (u8, &[u8]) = match version {
        IpVersion::Ipv4 => (ECHO_REQUEST_V4, &[]),
        IpVersion::Ipv6 => (ECHO_REQUEST_V6, ICMPV6_PAYLOAD),
    };

    let mut packet = vec![0u8; HEADER_LEN + payload.len()];
    packet[0] = kind;
    packet[1] = 0;
    BigEndian::write_u16(&mut packet[4..6], id);
    BigEndian::write_u16(&mut packet[6..8], sequence);
    packet[HEADER_LEN..].copy_from_slice(payload);

    let sum = checksum(&packet);
    BigEndian::write_u16(&mut packet[2..4], sum);
    packet
}

/// Validate a received packet as the echo reply to our request.
///
/// IPv4 raw sockets deliver the IP header in front of the ICMP message;
/// IPv6 raw sockets deliver the ICMPv6 message alone.
pub fn parse_echo_reply(
    packet: &[u8],
    version: IpVersion,
    id: u16,
    sequence: u16,
) -> Result<(), ProbeError> {
    let malformed = |e: std::io::Error| ProbeError::Malformed(e.to_string());

    let (message, expected) = match version {
        IpVersion::Ipv4 => {
            let first = packet
                .first()
                .ok_or_else(|| ProbeError::Malformed("empty packet".into()))?;
            let ihl = usize::from(first & 0x0F) * 4;
            let message = packet
                .get(ihl..)
                .ok_or_else(|| ProbeError::Malformed(format!("truncated IPv4 header ({} bytes)", ihl)))?;
            (message, ECHO_REPLY_V4)
        }
        IpVersion::Ipv6 => (packet, ECHO_REPLY_V6),
    };

    if message.len() < HEADER_LEN {
        return Err(ProbeError::Malformed(format!("short ICMP message ({} bytes)", message.len())));
    }

    let mut cursor = Cursor::new(message);
    let kind = cursor.read_u8().map_err(malformed)?;
    let _code = cursor.read_u8().map_err(malformed)?;
    let _checksum = cursor.read_u16::<BigEndian>().map_err(malformed)?;
    let reply_id = cursor.read_u16::<BigEndian>().map_err(malformed)?;
    let reply_sequence = cursor.read_u16::<BigEndian>().map_err(malformed)?;

    if kind != expected {
        return Err(ProbeError::Malformed(format!("unexpected ICMP type {}", kind)));
    }
    if reply_id != id {
        return Err(ProbeError::Malformed(format!("identifier {} is not ours ({})", reply_id, id)));
    }
    if reply_sequence != sequence {
        return Err(ProbeError::Malformed(format!(
            "sequence {} is not ours ({})",
            reply_sequence, sequence
        )));
    }
    Ok(())
}

/// Whether `reply`, received from `from`, answers the request sent to `dest`.
pub fn is_own_reply(reply: &[u8], from: IpAddr, dest: IpAddr, id: u16, sequence: u16) -> bool {
    if from != dest {
        trace!(%from, %dest, "Skipping ICMP packet from another host");
        return false;
    }
    match parse_echo_reply(reply, family_of(&dest), id, sequence) {
        Ok(()) => true,
        Err(err) => {
            trace!(%from, %err, "Skipping unrelated ICMP packet");
            false
        }
    }
}

/// Open a raw ICMP socket for the family. Fails with `PermissionDenied`
/// without the necessary privilege.
pub(crate) fn open_raw_icmp(version: IpVersion) -> Result<UdpSocket, ProbeError> {
    let (domain, protocol) = match version {
        IpVersion::Ipv4 => (Domain::IPV4, Protocol::ICMPV4),
        IpVersion::Ipv6 => (Domain::IPV6, Protocol::ICMPV6),
    };
    let socket = Socket::new(domain, Type::RAW, Some(protocol))?;
    Ok(socket.into())
}

pub(crate) fn family_of(addr: &IpAddr) -> IpVersion {
    if addr.is_ipv4() {
        IpVersion::Ipv4
    } else {
        IpVersion::Ipv6
    }
}

/// Receive until `accept` returns a value or `deadline` passes. Every read is
/// bounded by the socket read timeout.
pub(crate) fn recv_until<T>(
    socket: &UdpSocket,
    deadline: Instant,
    budget: Duration,
    mut accept: impl FnMut(&[u8], SocketAddr) -> Option<T>,
) -> Result<T, ProbeError> {
    let mut buf = [0u8; ICMP_RECV_BUFFER];
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(ProbeError::Timeout(budget))?;
        socket.set_read_timeout(Some(remaining))?;

        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) =>
            {
                return Err(ProbeError::Timeout(budget));
            }
            Err(err) => return Err(err.into()),
        };

        if let Some(value) = accept(&buf[..n], from) {
            return Ok(value);
        }
    }
}

/// Send one echo request and wait for the matching reply.
pub fn ping_blocking(
    addr: IpAddr,
    id: u16,
    sequence: u16,
    timeout: Duration,
) -> Result<IpAddr, ProbeError> {
    let version = family_of(&addr);
    let socket = open_raw_icmp(version)?;
    let packet = echo_request(version, id, sequence);
    socket.send_to(&packet, SocketAddr::new(addr, 0))?;

    let deadline = Instant::now() + timeout;
    recv_until(&socket, deadline, timeout, |reply, from| {
        is_own_reply(reply, from.ip(), addr, id, sequence).then(|| from.ip())
    })
}

impl Prober {
    /// ICMP echo to `addr`: "OK" plus the replying address, "Fail" on
    /// timeout, "N/A" when the raw socket cannot be used.
    pub async fn ping(&self, addr: IpAddr) -> PingRecord {
        let id = identifier();
        let sequence = next_sequence();
        let timeout = self.settings.icmp_timeout;
        let outcome =
            tokio::task::spawn_blocking(move || ping_blocking(addr, id, sequence, timeout)).await;

        match outcome {
            Ok(Ok(source)) => PingRecord {
                status: ProbeValue::text(OK),
                source: ProbeValue::text(source.to_string()),
            },
            Ok(Err(ProbeError::Timeout(_))) => {
                debug!(%addr, "Ping timed out");
                PingRecord { status: ProbeValue::text(FAIL), source: ProbeValue::na() }
            }
            Ok(Err(err)) => {
                if matches!(err, ProbeError::PermissionDenied(_)) {
                    warn!(%addr, %err, "Raw ICMP socket unavailable, ping skipped");
                } else {
                    debug!(%addr, %err, "Ping failed");
                }
                PingRecord::unavailable()
            }
            Err(err) => {
                warn!(%addr, %err, "Ping task aborted");
                PingRecord::unavailable()
            }
        }
    }
}
