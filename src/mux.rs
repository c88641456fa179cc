//! Routes newly intercepted flows to handlers registered by destination
//! pattern.
//!
//! Patterns are `":<port>"` (any address), `"<addr>:<port>"`, or the
//! catch-all `"*"`. Registrations are consulted in order and the first match
//! wins; a TCP flow with no matching handler is rejected, a UDP flow with no
//! matching handler is dropped.

use crate::errors::{Error, Result};
use crate::net::addr::Endpoint;
use crate::net::tcp::{TcpFlowStream, TcpRequest};
use crate::net::udp::UdpFlowStream;
use async_trait::async_trait;
use std::future::Future;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

/// A destination pattern for flow routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pattern {
  /// Matches every flow.
  Any,
  /// Matches any address on one port.
  Port(u16),
  /// Matches one address and port.
  Endpoint(Ipv4Addr, u16),
}

impl Pattern {
  fn matches(&self, peer: Endpoint) -> bool {
    match self {
      Pattern::Any => true,
      Pattern::Port(port) => peer.port == *port,
      Pattern::Endpoint(addr, port) => peer.addr == *addr && peer.port == *port,
    }
  }
}

impl FromStr for Pattern {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    if s == "*" {
      return Ok(Pattern::Any);
    }
    let (addr, port) = s
      .rsplit_once(':')
      .ok_or_else(|| Error::Pattern(s.to_string()))?;
    let port: u16 = port.parse().map_err(|_| Error::Pattern(s.to_string()))?;
    if addr.is_empty() {
      return Ok(Pattern::Port(port));
    }
    let addr: Ipv4Addr = addr.parse().map_err(|_| Error::Pattern(s.to_string()))?;
    Ok(Pattern::Endpoint(addr, port))
  }
}

/// Handles one accepted TCP flow as a bidirectional byte stream.
///
/// The handler may read until end-of-stream, write whatever it likes, and
/// must eventually close the stream.
#[async_trait]
pub trait TcpHandler: Send + Sync + 'static {
  /// Run the flow to completion.
  async fn handle(&self, stream: TcpFlowStream);
}

/// Handles one UDP flow: inbound datagrams plus a reply handle.
#[async_trait]
pub trait UdpHandler: Send + Sync + 'static {
  /// Run the flow to completion.
  async fn handle(&self, flow: UdpFlowStream);
}

struct TcpHandlerFn<F>(F);

#[async_trait]
impl<F, Fut> TcpHandler for TcpHandlerFn<F>
where
  F: Fn(TcpFlowStream) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  async fn handle(&self, stream: TcpFlowStream) {
    (self.0)(stream).await
  }
}

struct UdpHandlerFn<F>(F);

#[async_trait]
impl<F, Fut> UdpHandler for UdpHandlerFn<F>
where
  F: Fn(UdpFlowStream) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  async fn handle(&self, flow: UdpFlowStream) {
    (self.0)(flow).await
  }
}

/// The flow router. Build it up before starting the stack, then share it.
#[derive(Default)]
pub struct Mux {
  tcp: Vec<(Pattern, Arc<dyn TcpHandler>)>,
  udp: Vec<(Pattern, Arc<dyn UdpHandler>)>,
}

impl Mux {
  /// Create an empty mux.
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a TCP handler for flows whose peer endpoint matches `pattern`.
  pub fn handle_tcp(&mut self, pattern: &str, handler: impl TcpHandler) -> Result<()> {
    let pattern = pattern.parse()?;
    self.tcp.push((pattern, Arc::new(handler)));
    Ok(())
  }

  /// Register an async closure as a TCP handler.
  pub fn handle_tcp_fn<F, Fut>(&mut self, pattern: &str, handler: F) -> Result<()>
  where
    F: Fn(TcpFlowStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self.handle_tcp(pattern, TcpHandlerFn(handler))
  }

  /// Register a UDP handler for flows whose peer endpoint matches `pattern`.
  pub fn handle_udp(&mut self, pattern: &str, handler: impl UdpHandler) -> Result<()> {
    let pattern = pattern.parse()?;
    self.udp.push((pattern, Arc::new(handler)));
    Ok(())
  }

  /// Register an async closure as a UDP handler.
  pub fn handle_udp_fn<F, Fut>(&mut self, pattern: &str, handler: F) -> Result<()>
  where
    F: Fn(UdpFlowStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self.handle_udp(pattern, UdpHandlerFn(handler))
  }

  /// Resolve a new TCP flow: accept it into a handler task, or reject it.
  /// Returns whether the flow was accepted.
  pub(crate) fn notify_tcp(&self, request: TcpRequest) -> bool {
    let peer = request.peer();
    match self.tcp.iter().find(|(pattern, _)| pattern.matches(peer)) {
      Some((_, handler)) => {
        let handler = handler.clone();
        let stream = request.accept();
        tokio::spawn(async move { handler.handle(stream).await });
        true
      }
      None => {
        tracing::debug!("no TCP handler matches {}, rejecting", peer);
        request.reject();
        false
      }
    }
  }

  /// Find the handler for a new UDP flow, if any.
  pub(crate) fn notify_udp(&self, peer: Endpoint) -> Option<Arc<dyn UdpHandler>> {
    self
      .udp
      .iter()
      .find(|(pattern, _)| pattern.matches(peer))
      .map(|(_, handler)| handler.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pattern_parsing() {
    assert_eq!("*".parse::<Pattern>().unwrap(), Pattern::Any);
    assert_eq!(":80".parse::<Pattern>().unwrap(), Pattern::Port(80));
    assert_eq!(
      "10.1.1.1:53".parse::<Pattern>().unwrap(),
      Pattern::Endpoint(Ipv4Addr::new(10, 1, 1, 1), 53)
    );
    assert!("http".parse::<Pattern>().is_err());
    assert!(":http".parse::<Pattern>().is_err());
    assert!("nonsense:80".parse::<Pattern>().is_err());
  }

  #[test]
  fn pattern_matching() {
    let peer = Endpoint::new(Ipv4Addr::new(93, 184, 216, 34), 443);
    assert!(Pattern::Any.matches(peer));
    assert!(Pattern::Port(443).matches(peer));
    assert!(!Pattern::Port(80).matches(peer));
    assert!(Pattern::Endpoint(Ipv4Addr::new(93, 184, 216, 34), 443).matches(peer));
    assert!(!Pattern::Endpoint(Ipv4Addr::new(1, 1, 1, 1), 443).matches(peer));
  }

  #[test]
  fn first_registration_wins() {
    let mut mux = Mux::new();
    mux.handle_tcp_fn(":443", |_stream| async {}).unwrap();
    mux.handle_tcp_fn("*", |_stream| async {}).unwrap();
    assert_eq!(mux.tcp.len(), 2);
    let peer = Endpoint::new(Ipv4Addr::new(1, 2, 3, 4), 443);
    let index = mux.tcp.iter().position(|(p, _)| p.matches(peer)).unwrap();
    assert_eq!(index, 0);
  }
}
