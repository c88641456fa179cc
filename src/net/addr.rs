//! Endpoint and flow-key value types.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// An IPv4 address together with a port number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
  /// IPv4 address
  pub addr: Ipv4Addr,
  /// port number
  pub port: u16,
}

impl Endpoint {
  /// Create an endpoint from an address and a port.
  pub fn new(addr: Ipv4Addr, port: u16) -> Self {
    Self { addr, port }
  }
}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.addr, self.port)
  }
}

impl From<Endpoint> for SocketAddr {
  fn from(value: Endpoint) -> Self {
    SocketAddr::V4(SocketAddrV4::new(value.addr, value.port))
  }
}

/// The 4-tuple identifying one intercepted connection.
///
/// A process will happily open several connections to the same remote service
/// from different source ports, so flows are keyed by both endpoints. The
/// `child` endpoint is the source the subprocess used; the `peer` endpoint is
/// the destination it was trying to reach, which the engine impersonates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
  /// source endpoint inside the isolated environment
  pub child: Endpoint,
  /// destination endpoint the engine answers for
  pub peer: Endpoint,
}

impl FlowKey {
  /// Create a flow key from the child and peer endpoints.
  pub fn new(child: Endpoint, peer: Endpoint) -> Self {
    Self { child, peer }
  }
}

impl fmt::Display for FlowKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} => {}", self.child, self.peer)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn display_matches_wire_order() {
    let key = FlowKey::new(
      Endpoint::new(Ipv4Addr::new(10, 1, 1, 100), 43210),
      Endpoint::new(Ipv4Addr::new(93, 184, 216, 34), 80),
    );
    assert_eq!(key.to_string(), "10.1.1.100:43210 => 93.184.216.34:80");
  }

  #[test]
  fn keys_differ_by_source_port() {
    let peer = Endpoint::new(Ipv4Addr::new(1, 1, 1, 1), 443);
    let a = FlowKey::new(Endpoint::new(Ipv4Addr::new(10, 1, 1, 100), 1000), peer);
    let b = FlowKey::new(Endpoint::new(Ipv4Addr::new(10, 1, 1, 100), 1001), peer);
    assert_ne!(a, b);
  }
}
