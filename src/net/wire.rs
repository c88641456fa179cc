//! IPv4, TCP and UDP wire format: inbound frame parsing and outbound frame
//! serialization.
//!
//! Parsing is zero-copy over the caller's buffer; anything the engines retain
//! past the call is copied, because the link read buffer is reused. Outbound
//! frames are produced as fresh, fully checksummed buffers so the link writer
//! can hand them to the device verbatim.

use crate::errors::{Error, Result};
use crate::net::addr::Endpoint;
use std::fmt;
use std::net::Ipv4Addr;

/// Fixed time-to-live stamped on every outbound frame.
pub const TTL: u8 = 10;
/// Fixed receive window advertised on every outbound TCP segment.
pub const WINDOW: u16 = 64240;
/// IPv4 header length; options are never emitted and ignored on inbound frames.
pub const IPV4_HEADER_LEN: usize = 20;
/// TCP header length; no TCP options are ever offered.
pub const TCP_HEADER_LEN: usize = 20;
/// UDP header length.
pub const UDP_HEADER_LEN: usize = 8;
/// IPv4 protocol number for TCP.
pub const PROTO_TCP: u8 = 6;
/// IPv4 protocol number for UDP.
pub const PROTO_UDP: u8 = 17;

/// The decoded portion of an inbound IPv4 header.
#[derive(Clone, Copy, Debug)]
pub struct Ipv4Header {
  /// source address
  pub src: Ipv4Addr,
  /// destination address
  pub dst: Ipv4Addr,
  /// transport protocol number
  pub protocol: u8,
}

/// The decoded portion of a TCP segment header.
#[derive(Clone, Copy, Debug)]
pub struct TcpHeader {
  /// source port
  pub src_port: u16,
  /// destination port
  pub dst_port: u16,
  /// sequence number
  pub seq: u32,
  /// acknowledgement number
  pub ack: u32,
  /// control flags
  pub flags: TcpFlags,
  /// advertised receive window
  pub window: u16,
}

/// The decoded portion of a UDP datagram header.
#[derive(Clone, Copy, Debug)]
pub struct UdpHeader {
  /// source port
  pub src_port: u16,
  /// destination port
  pub dst_port: u16,
}

/// TCP control flags as the raw header byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
  /// FIN: sender has finished sending.
  pub const FIN: TcpFlags = TcpFlags(0x01);
  /// SYN: synchronize sequence numbers.
  pub const SYN: TcpFlags = TcpFlags(0x02);
  /// RST: reset the connection.
  pub const RST: TcpFlags = TcpFlags(0x04);
  /// ACK: the acknowledgement field is significant.
  pub const ACK: TcpFlags = TcpFlags(0x10);

  /// Whether every flag in `other` is set in `self`.
  pub fn contains(self, other: TcpFlags) -> bool {
    self.0 & other.0 == other.0
  }

  /// FIN is set.
  pub fn fin(self) -> bool {
    self.contains(Self::FIN)
  }

  /// SYN is set.
  pub fn syn(self) -> bool {
    self.contains(Self::SYN)
  }

  /// RST is set.
  pub fn rst(self) -> bool {
    self.contains(Self::RST)
  }

  /// ACK is set.
  pub fn ack(self) -> bool {
    self.contains(Self::ACK)
  }
}

impl std::ops::BitOr for TcpFlags {
  type Output = TcpFlags;

  fn bitor(self, rhs: TcpFlags) -> TcpFlags {
    TcpFlags(self.0 | rhs.0)
  }
}

impl fmt::Display for TcpFlags {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut names = Vec::new();
    for (bit, name) in [(0x01, "FIN"), (0x02, "SYN"), (0x04, "RST"), (0x10, "ACK")] {
      if self.0 & bit != 0 {
        names.push(name);
      }
    }
    write!(f, "{}", names.join("+"))
  }
}

/// What an inbound frame turned out to carry.
#[derive(Debug)]
pub enum Parsed<'a> {
  /// An IPv4 frame carrying a TCP segment.
  Tcp(Ipv4Header, TcpHeader, &'a [u8]),
  /// An IPv4 frame carrying a UDP datagram.
  Udp(Ipv4Header, UdpHeader, &'a [u8]),
}

/// Classify a raw frame read from the link.
///
/// Frames that are not IPv4 or not TCP/UDP are not errors from the caller's
/// point of view; they simply carry nothing the engines care about.
pub fn parse_frame(frame: &[u8]) -> Result<Option<Parsed<'_>>> {
  let (ip, inner) = parse_ipv4(frame)?;
  match ip.protocol {
    PROTO_TCP => {
      let (tcp, payload) = parse_tcp(inner)?;
      Ok(Some(Parsed::Tcp(ip, tcp, payload)))
    }
    PROTO_UDP => {
      let (udp, payload) = parse_udp(inner)?;
      Ok(Some(Parsed::Udp(ip, udp, payload)))
    }
    _ => Ok(None),
  }
}

/// Parse an IPv4 header, returning the header and the transport slice.
pub fn parse_ipv4(frame: &[u8]) -> Result<(Ipv4Header, &[u8])> {
  if frame.len() < IPV4_HEADER_LEN {
    return Err(Error::MalformedFrame("short IPv4 header"));
  }
  let version = frame[0] >> 4;
  if version != 4 {
    return Err(Error::MalformedFrame("not IPv4"));
  }
  let header_len = ((frame[0] & 0x0f) as usize) * 4;
  if header_len < IPV4_HEADER_LEN || header_len > frame.len() {
    return Err(Error::MalformedFrame("bad IPv4 header length"));
  }
  let total_len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
  if total_len < header_len || total_len > frame.len() {
    return Err(Error::MalformedFrame("bad IPv4 total length"));
  }
  let header = Ipv4Header {
    src: Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]),
    dst: Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]),
    protocol: frame[9],
  };
  Ok((header, &frame[header_len..total_len]))
}

/// Parse a TCP header, returning the header and the payload slice.
pub fn parse_tcp(segment: &[u8]) -> Result<(TcpHeader, &[u8])> {
  if segment.len() < TCP_HEADER_LEN {
    return Err(Error::MalformedFrame("short TCP header"));
  }
  let data_offset = ((segment[12] >> 4) as usize) * 4;
  if data_offset < TCP_HEADER_LEN || data_offset > segment.len() {
    return Err(Error::MalformedFrame("bad TCP data offset"));
  }
  let header = TcpHeader {
    src_port: u16::from_be_bytes([segment[0], segment[1]]),
    dst_port: u16::from_be_bytes([segment[2], segment[3]]),
    seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
    ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
    flags: TcpFlags(segment[13]),
    window: u16::from_be_bytes([segment[14], segment[15]]),
  };
  Ok((header, &segment[data_offset..]))
}

/// Parse a UDP header, returning the header and the payload slice.
pub fn parse_udp(datagram: &[u8]) -> Result<(UdpHeader, &[u8])> {
  if datagram.len() < UDP_HEADER_LEN {
    return Err(Error::MalformedFrame("short UDP header"));
  }
  let length = u16::from_be_bytes([datagram[4], datagram[5]]) as usize;
  if length < UDP_HEADER_LEN || length > datagram.len() {
    return Err(Error::MalformedFrame("bad UDP length"));
  }
  let header = UdpHeader {
    src_port: u16::from_be_bytes([datagram[0], datagram[1]]),
    dst_port: u16::from_be_bytes([datagram[2], datagram[3]]),
  };
  Ok((header, &datagram[UDP_HEADER_LEN..length]))
}

/// One's-complement internet checksum over `data`.
pub fn checksum(data: &[u8]) -> u16 {
  !(fold(sum_bytes(0, data)))
}

/// Transport checksum over the IPv4 pseudo-header and the transport segment.
pub fn pseudo_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
  let mut sum = 0u32;
  sum = sum_bytes(sum, &src.octets());
  sum = sum_bytes(sum, &dst.octets());
  sum = sum.wrapping_add(protocol as u32);
  sum = sum.wrapping_add(segment.len() as u32);
  sum = sum_bytes(sum, segment);
  !(fold(sum))
}

fn sum_bytes(mut sum: u32, data: &[u8]) -> u32 {
  let mut chunks = data.chunks_exact(2);
  for chunk in &mut chunks {
    sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
  }
  if let [last] = chunks.remainder() {
    sum = sum.wrapping_add((*last as u32) << 8);
  }
  sum
}

fn fold(mut sum: u32) -> u16 {
  while sum >> 16 != 0 {
    sum = (sum & 0xffff) + (sum >> 16);
  }
  sum as u16
}

/// Serialize a complete IPv4+TCP frame from `src` to `dst`.
///
/// The advertised window is fixed; PSH, URG and the IP DF flag are never set
/// and no TCP options are emitted. The returned buffer owns a copy of the
/// payload.
pub fn build_tcp_frame(
  src: Endpoint,
  dst: Endpoint,
  seq: u32,
  ack: u32,
  flags: TcpFlags,
  payload: &[u8],
) -> Result<Vec<u8>> {
  let total = IPV4_HEADER_LEN + TCP_HEADER_LEN + payload.len();
  if total > u16::MAX as usize {
    return Err(Error::Serialize(format!(
      "TCP payload of {} bytes does not fit a single frame",
      payload.len()
    )));
  }
  let mut frame = vec![0u8; total];
  let tcp = &mut frame[IPV4_HEADER_LEN..];
  tcp[0..2].copy_from_slice(&src.port.to_be_bytes());
  tcp[2..4].copy_from_slice(&dst.port.to_be_bytes());
  tcp[4..8].copy_from_slice(&seq.to_be_bytes());
  tcp[8..12].copy_from_slice(&ack.to_be_bytes());
  tcp[12] = (TCP_HEADER_LEN as u8 / 4) << 4;
  tcp[13] = flags.0;
  tcp[14..16].copy_from_slice(&WINDOW.to_be_bytes());
  tcp[TCP_HEADER_LEN..].copy_from_slice(payload);
  let check = pseudo_checksum(src.addr, dst.addr, PROTO_TCP, tcp);
  frame[IPV4_HEADER_LEN + 16..IPV4_HEADER_LEN + 18].copy_from_slice(&check.to_be_bytes());
  fill_ipv4_header(&mut frame, src.addr, dst.addr, PROTO_TCP, total);
  Ok(frame)
}

/// Serialize a complete IPv4+UDP frame from `src` to `dst`.
pub fn build_udp_frame(src: Endpoint, dst: Endpoint, payload: &[u8]) -> Result<Vec<u8>> {
  let total = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
  if total > u16::MAX as usize {
    return Err(Error::Serialize(format!(
      "UDP payload of {} bytes does not fit a single frame",
      payload.len()
    )));
  }
  let mut frame = vec![0u8; total];
  let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
  let udp = &mut frame[IPV4_HEADER_LEN..];
  udp[0..2].copy_from_slice(&src.port.to_be_bytes());
  udp[2..4].copy_from_slice(&dst.port.to_be_bytes());
  udp[4..6].copy_from_slice(&udp_len.to_be_bytes());
  udp[UDP_HEADER_LEN..].copy_from_slice(payload);
  let check = match pseudo_checksum(src.addr, dst.addr, PROTO_UDP, udp) {
    // an all-zero UDP checksum means "not computed" on the wire
    0 => 0xffff,
    c => c,
  };
  frame[IPV4_HEADER_LEN + 6..IPV4_HEADER_LEN + 8].copy_from_slice(&check.to_be_bytes());
  fill_ipv4_header(&mut frame, src.addr, dst.addr, PROTO_UDP, total);
  Ok(frame)
}

fn fill_ipv4_header(frame: &mut [u8], src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, total: usize) {
  frame[0] = 0x45;
  frame[2..4].copy_from_slice(&(total as u16).to_be_bytes());
  frame[8] = TTL;
  frame[9] = protocol;
  frame[12..16].copy_from_slice(&src.octets());
  frame[16..20].copy_from_slice(&dst.octets());
  let check = checksum(&frame[..IPV4_HEADER_LEN]);
  frame[10..12].copy_from_slice(&check.to_be_bytes());
}

/// One-line summary of a TCP segment for logging.
pub fn summarize_tcp(ip: &Ipv4Header, tcp: &TcpHeader, payload_len: usize) -> String {
  format!(
    "TCP {}:{} => {}:{} {} - Seq {} - Ack {} - Len {}",
    ip.src, tcp.src_port, ip.dst, tcp.dst_port, tcp.flags, tcp.seq, tcp.ack, payload_len
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  fn endpoint(addr: [u8; 4], port: u16) -> Endpoint {
    Endpoint::new(Ipv4Addr::from(addr), port)
  }

  #[test]
  fn ipv4_checksum_verifies_to_zero() {
    let frame = build_tcp_frame(
      endpoint([10, 1, 1, 1], 80),
      endpoint([10, 1, 1, 100], 43210),
      7,
      11,
      TcpFlags::ACK,
      b"hello",
    )
    .unwrap();
    // a valid header sums to zero when the checksum field is included
    assert_eq!(checksum(&frame[..IPV4_HEADER_LEN]), 0);
  }

  #[test]
  fn tcp_frame_round_trips_through_the_parser() {
    let src = endpoint([93, 184, 216, 34], 443);
    let dst = endpoint([10, 1, 1, 100], 50000);
    let frame =
      build_tcp_frame(src, dst, 1234, 5678, TcpFlags::SYN | TcpFlags::ACK, b"abc").unwrap();
    let (ip, rest) = parse_ipv4(&frame).unwrap();
    assert_eq!(ip.src, src.addr);
    assert_eq!(ip.dst, dst.addr);
    assert_eq!(ip.protocol, PROTO_TCP);
    let (tcp, payload) = parse_tcp(rest).unwrap();
    assert_eq!(tcp.src_port, 443);
    assert_eq!(tcp.dst_port, 50000);
    assert_eq!(tcp.seq, 1234);
    assert_eq!(tcp.ack, 5678);
    assert!(tcp.flags.syn() && tcp.flags.ack() && !tcp.flags.fin());
    assert_eq!(tcp.window, WINDOW);
    assert_eq!(payload, b"abc");
    // the transport checksum must also verify
    assert_eq!(pseudo_checksum(ip.src, ip.dst, PROTO_TCP, rest), 0);
  }

  #[test]
  fn udp_frame_round_trips_through_the_parser() {
    let src = endpoint([10, 1, 1, 1], 53);
    let dst = endpoint([10, 1, 1, 100], 40000);
    let frame = build_udp_frame(src, dst, b"\x12\x34response").unwrap();
    let (ip, rest) = parse_ipv4(&frame).unwrap();
    assert_eq!(ip.protocol, PROTO_UDP);
    let (udp, payload) = parse_udp(rest).unwrap();
    assert_eq!(udp.src_port, 53);
    assert_eq!(udp.dst_port, 40000);
    assert_eq!(payload, b"\x12\x34response");
    assert_eq!(pseudo_checksum(ip.src, ip.dst, PROTO_UDP, rest), 0);
  }

  #[test]
  fn truncated_frames_are_rejected() {
    assert!(matches!(
      parse_ipv4(&[0x45, 0x00]),
      Err(Error::MalformedFrame(_))
    ));
    let mut frame = build_tcp_frame(
      endpoint([10, 1, 1, 1], 80),
      endpoint([10, 1, 1, 100], 43210),
      0,
      0,
      TcpFlags::SYN,
      &[],
    )
    .unwrap();
    // claim more payload than the buffer holds
    frame[2..4].copy_from_slice(&100u16.to_be_bytes());
    assert!(matches!(
      parse_ipv4(&frame),
      Err(Error::MalformedFrame("bad IPv4 total length"))
    ));
  }

  #[test]
  fn non_transport_protocols_are_discarded() {
    let mut frame = build_udp_frame(
      endpoint([10, 1, 1, 1], 1),
      endpoint([10, 1, 1, 100], 2),
      &[],
    )
    .unwrap();
    frame[9] = 1; // ICMP
    assert!(matches!(parse_frame(&frame), Ok(None)));
  }
}
