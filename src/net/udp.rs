//! The UDP engine: a lighter sibling of the TCP engine that surfaces
//! datagrams and a reply handle to the upper layer.

use crate::errors::{Error, Result};
use crate::mux::Mux;
use crate::net::addr::{Endpoint, FlowKey};
use crate::net::wire::{self, Ipv4Header, UdpHeader};
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-flow inbox depth, in datagrams.
const INBOX_CAPACITY: usize = 64;

/// One UDP flow: datagrams from the child plus a way to answer them.
pub struct UdpFlowStream {
  child: Endpoint,
  peer: Endpoint,
  inbox: mpsc::Receiver<Bytes>,
  outbound: mpsc::Sender<Bytes>,
}

impl UdpFlowStream {
  /// The identity this flow impersonates: the address the subprocess sent to.
  pub fn local_addr(&self) -> SocketAddr {
    self.peer.into()
  }

  /// The subprocess's own address and port.
  pub fn remote_addr(&self) -> SocketAddr {
    self.child.into()
  }

  /// Receive the next datagram payload, or `None` once the flow is torn down.
  pub async fn recv(&mut self) -> Option<Bytes> {
    self.inbox.recv().await
  }

  /// Send a single datagram from the impersonated endpoint back to the child.
  pub fn reply(&self, payload: &[u8]) -> Result<()> {
    let frame = wire::build_udp_frame(self.peer, self.child, payload)?;
    let len = frame.len();
    match self.outbound.try_send(Bytes::from(frame)) {
      Ok(()) => Ok(()),
      Err(mpsc::error::TrySendError::Full(_)) => Err(Error::BackpressureDrop { len }),
      Err(mpsc::error::TrySendError::Closed(_)) => {
        Err(Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)))
      }
    }
  }
}

/// Accepts inbound UDP datagrams and demultiplexes them into flows.
pub struct UdpEngine {
  flows: HashMap<FlowKey, mpsc::Sender<Bytes>>,
  outbound: mpsc::Sender<Bytes>,
  mux: Arc<Mux>,
}

impl UdpEngine {
  /// Create an engine that routes new flows through `mux` and emits frames
  /// on `outbound`.
  pub fn new(mux: Arc<Mux>, outbound: mpsc::Sender<Bytes>) -> Self {
    Self {
      flows: HashMap::new(),
      outbound,
      mux,
    }
  }

  /// Number of flows currently tracked.
  pub fn flow_count(&self) -> usize {
    self.flows.len()
  }

  /// Ingest one inbound UDP datagram.
  pub fn handle_frame(&mut self, ip: &Ipv4Header, udp: &UdpHeader, payload: &[u8]) {
    let key = FlowKey::new(
      Endpoint::new(ip.src, udp.src_port),
      Endpoint::new(ip.dst, udp.dst_port),
    );
    tracing::debug!("got {} udp bytes to {}", payload.len(), key.peer);

    if let Some(inbox) = self.flows.get(&key) {
      match inbox.try_send(Bytes::copy_from_slice(payload)) {
        Ok(()) => return,
        Err(mpsc::error::TrySendError::Full(_)) => {
          tracing::debug!("udp inbox for {} would block, dropping {} bytes", key, payload.len());
          return;
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
          // handler exited; treat the datagram as the start of a new flow
          self.flows.remove(&key);
        }
      }
    }

    let Some(handler) = self.mux.notify_udp(key.peer) else {
      tracing::debug!("no UDP handler matches {}, dropping {} bytes", key.peer, payload.len());
      return;
    };
    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    // the first datagram created the flow; it must also be delivered
    if inbox_tx.try_send(Bytes::copy_from_slice(payload)).is_err() {
      tracing::debug!("dropping first datagram for {}", key);
    }
    self.flows.insert(key, inbox_tx);
    let flow = UdpFlowStream {
      child: key.child,
      peer: key.peer,
      inbox: inbox_rx,
      outbound: self.outbound.clone(),
    };
    tokio::spawn(async move { handler.handle(flow).await });
  }
}
