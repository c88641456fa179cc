//! The TCP engine: per-flow state machines that terminate the child's
//! connections as if they were the intended remote endpoints.
//!
//! The engine is driven from the link-reader task only, so the flow table
//! needs no synchronization. What crosses tasks is the per-flow
//! [`TcpFlowStream`] handed to a handler: its inbox is the receiving half of
//! a bounded channel filled by the engine, and its writes go straight to the
//! shared outbound frame queue. Sequence counters are atomics; the state
//! field is behind a mutex held only for the transition itself.

use crate::errors::{Error, Result};
use crate::mux::Mux;
use crate::net::addr::{Endpoint, FlowKey};
use crate::net::wire::{self, Ipv4Header, TcpFlags, TcpHeader};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Per-flow inbox depth, in payloads.
const INBOX_CAPACITY: usize = 1024;

/// Largest payload placed in a single outbound segment. The virtual link has
/// a 1500-byte MTU; larger writes are split across segments.
pub(crate) const MAX_SEGMENT: usize = 1460;

/// The state of one intercepted TCP connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
  /// No SYN seen yet.
  Init,
  /// SYN received and SYN+ACK sent; awaiting the completing ACK.
  SynReceived,
  /// Handshake complete; bytes may flow both ways.
  Connected,
  /// The child sent FIN and the engine acknowledged it; we may still send.
  PeerFinished,
  /// We sent our own FIN; no more data may be sent.
  Closed,
}

impl fmt::Display for TcpState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      TcpState::Init => "Init",
      TcpState::SynReceived => "SynReceived",
      TcpState::Connected => "Connected",
      TcpState::PeerFinished => "PeerFinished",
      TcpState::Closed => "Closed",
    };
    f.write_str(name)
  }
}

/// State shared between the engine and the handler task for one flow.
struct FlowShared {
  key: FlowKey,
  state: Mutex<TcpState>,
  /// Next sequence number for outbound segments (our side of the stream).
  seq_out: AtomicU32,
  /// Next expected inbound sequence number; what we acknowledge.
  ack_out: AtomicU32,
  outbound: mpsc::Sender<Bytes>,
}

impl FlowShared {
  fn state_lock(&self) -> MutexGuard<'_, TcpState> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn state(&self) -> TcpState {
    *self.state_lock()
  }

  fn set_state(&self, next: TcpState) {
    *self.state_lock() = next;
  }

  /// Claim `n` sequence numbers, returning the first.
  fn take_seq(&self, n: u32) -> u32 {
    self.seq_out.fetch_add(n, Ordering::SeqCst)
  }

  fn ack(&self) -> u32 {
    self.ack_out.load(Ordering::SeqCst)
  }

  /// Overwrite the acknowledgement pointer. The link is in-order, so this
  /// only ever moves forward.
  fn store_ack(&self, value: u32) {
    self.ack_out.store(value, Ordering::SeqCst);
  }

  /// Serialize a segment from the peer endpoint back to the child and
  /// enqueue it. Fails fast when the outbound queue is full.
  fn send_segment(&self, flags: TcpFlags, seq: u32, ack: u32, payload: &[u8]) -> Result<()> {
    let frame = wire::build_tcp_frame(self.key.peer, self.key.child, seq, ack, flags, payload)?;
    let len = frame.len();
    match self.outbound.try_send(Bytes::from(frame)) {
      Ok(()) => Ok(()),
      Err(mpsc::error::TrySendError::Full(_)) => Err(Error::BackpressureDrop { len }),
      Err(mpsc::error::TrySendError::Closed(_)) => {
        Err(Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)))
      }
    }
  }

  /// Like [`send_segment`], but control segments are never worth failing a
  /// caller over: a drop is logged and swallowed.
  fn send_segment_lossy(&self, flags: TcpFlags, seq: u32, ack: u32, payload: &[u8]) {
    if let Err(e) = self.send_segment(flags, seq, ack, payload) {
      tracing::debug!("dropping {} segment for {}: {}", flags, self.key, e);
    }
  }
}

/// A request by the child to open a TCP connection.
///
/// The mux resolves it by calling [`accept`](TcpRequest::accept), which
/// answers with SYN+ACK, or [`reject`](TcpRequest::reject), which answers
/// with RST and destroys the flow.
pub struct TcpRequest {
  shared: Arc<FlowShared>,
  inbox: mpsc::Receiver<Bytes>,
}

impl TcpRequest {
  /// The address and port of the subprocess that initiated the connection.
  pub fn remote_addr(&self) -> SocketAddr {
    self.shared.key.child.into()
  }

  /// The address and port the subprocess was trying to reach.
  pub fn local_addr(&self) -> SocketAddr {
    self.shared.key.peer.into()
  }

  /// The peer endpoint, used for pattern matching.
  pub(crate) fn peer(&self) -> Endpoint {
    self.shared.key.peer
  }

  /// Reply with SYN+ACK and expose the flow as a byte stream.
  pub fn accept(self) -> TcpFlowStream {
    let seq = self.shared.take_seq(1);
    let ack = self.shared.ack();
    tracing::debug!("sending SYN+ACK to subprocess for {}", self.shared.key);
    self
      .shared
      .send_segment_lossy(TcpFlags::SYN | TcpFlags::ACK, seq, ack, &[]);
    TcpFlowStream {
      shared: self.shared,
      inbox: self.inbox,
    }
  }

  /// Reply with RST; the connection is done.
  pub fn reject(self) {
    let seq = self.shared.take_seq(1);
    let ack = self.shared.ack();
    tracing::debug!("sending RST to subprocess for {}", self.shared.key);
    self
      .shared
      .send_segment_lossy(TcpFlags::RST | TcpFlags::ACK, seq, ack, &[]);
  }
}

/// One accepted flow, presented to a handler as a bidirectional byte stream.
///
/// Reads surface payloads exactly as they arrived on the link; a payload is
/// never split across reads, so the caller's buffer must be at least
/// MTU-sized. Writes are framed as ACK segments addressed from the endpoint
/// this stream impersonates. The stream also implements [`AsyncRead`] and
/// [`AsyncWrite`] so it can be wrapped by TLS acceptors and buffered readers.
pub struct TcpFlowStream {
  shared: Arc<FlowShared>,
  inbox: mpsc::Receiver<Bytes>,
}

impl TcpFlowStream {
  /// The identity this stream impersonates: the address the subprocess was
  /// trying to reach.
  pub fn local_addr(&self) -> SocketAddr {
    self.shared.key.peer.into()
  }

  /// The subprocess's own address and port.
  pub fn remote_addr(&self) -> SocketAddr {
    self.shared.key.child.into()
  }

  /// Current connection state.
  pub fn state(&self) -> TcpState {
    self.shared.state()
  }

  /// Receive the next payload sent by the subprocess.
  ///
  /// Returns `Ok(0)` at end of stream. Fails with
  /// [`Error::BufferTooSmall`] when `buf` cannot hold the next payload.
  pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
    while let Some(payload) = self.inbox.recv().await {
      if payload.is_empty() {
        continue;
      }
      if payload.len() > buf.len() {
        return Err(Error::BufferTooSmall {
          need: payload.len(),
          have: buf.len(),
        });
      }
      buf[..payload.len()].copy_from_slice(&payload);
      return Ok(payload.len());
    }
    Ok(0)
  }

  /// Send `payload` to the subprocess as if it came from the impersonated
  /// endpoint.
  ///
  /// Payloads larger than one segment are split. Fails with
  /// [`Error::BackpressureDrop`] when the outbound queue is full before any
  /// byte was enqueued; otherwise returns how many bytes were enqueued.
  pub fn write(&self, payload: &[u8]) -> Result<usize> {
    let mut written = 0;
    for chunk in payload.chunks(MAX_SEGMENT) {
      let seq = self.shared.take_seq(chunk.len() as u32);
      let ack = self.shared.ack();
      match self.shared.send_segment(TcpFlags::ACK, seq, ack, chunk) {
        Ok(()) => written += chunk.len(),
        Err(e) if written == 0 => return Err(e),
        Err(e) => {
          tracing::debug!("partial write to {}: {}", self.shared.key, e);
          break;
        }
      }
    }
    Ok(written)
  }

  /// Close our side of the connection by sending FIN+ACK.
  ///
  /// Idempotent once closed; fails with [`Error::CloseInInit`] if the flow
  /// never completed a handshake.
  pub fn close(&self) -> Result<()> {
    {
      let mut state = self.shared.state_lock();
      match *state {
        TcpState::Init => {
          tracing::error!("handler tried to close {} in state {}", self.shared.key, *state);
          return Err(Error::CloseInInit);
        }
        TcpState::Closed => {
          tracing::debug!("handler closed {} twice, ignoring", self.shared.key);
          return Ok(());
        }
        _ => *state = TcpState::Closed,
      }
    }
    let seq = self.shared.take_seq(1);
    let ack = self.shared.ack();
    tracing::debug!("sending FIN to subprocess for {}", self.shared.key);
    self
      .shared
      .send_segment_lossy(TcpFlags::FIN | TcpFlags::ACK, seq, ack, &[]);
    Ok(())
  }

  /// Read deadlines are not implemented for intercepted flows; accepted and
  /// ignored for interface compatibility.
  pub fn set_read_timeout(&self, _timeout: Option<Duration>) -> Result<()> {
    tracing::debug!("read timeouts not implemented for TCP flows, ignoring");
    Ok(())
  }

  /// Write deadlines are not implemented for intercepted flows; accepted and
  /// ignored for interface compatibility.
  pub fn set_write_timeout(&self, _timeout: Option<Duration>) -> Result<()> {
    tracing::debug!("write timeouts not implemented for TCP flows, ignoring");
    Ok(())
  }
}

impl AsyncRead for TcpFlowStream {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    loop {
      match self.inbox.poll_recv(cx) {
        Poll::Ready(Some(payload)) => {
          if payload.is_empty() {
            continue;
          }
          if payload.len() > buf.remaining() {
            return Poll::Ready(Err(
              Error::BufferTooSmall {
                need: payload.len(),
                have: buf.remaining(),
              }
              .into(),
            ));
          }
          buf.put_slice(&payload);
          return Poll::Ready(Ok(()));
        }
        Poll::Ready(None) => return Poll::Ready(Ok(())),
        Poll::Pending => return Poll::Pending,
      }
    }
  }
}

impl AsyncWrite for TcpFlowStream {
  fn poll_write(
    self: Pin<&mut Self>,
    _cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::result::Result<usize, io::Error>> {
    Poll::Ready(self.write(buf).map_err(Into::into))
  }

  fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Poll::Ready(Ok(()))
  }

  fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Poll::Ready(self.close().map_err(Into::into))
  }
}

struct FlowEntry {
  shared: Arc<FlowShared>,
  /// Sender half of the handler's inbox; `None` once the inbox is shut.
  inbox: Option<mpsc::Sender<Bytes>>,
  /// Receiver half, parked here until the mux takes it at SYN time.
  pending_inbox: Option<mpsc::Receiver<Bytes>>,
}

impl FlowEntry {
  fn deliver(&self, payload: &[u8]) {
    let Some(inbox) = &self.inbox else {
      tracing::debug!("inbox for {} is shut, dropping {} bytes", self.shared.key, payload.len());
      return;
    };
    // copy: the link read buffer is reused before the handler runs
    match inbox.try_send(Bytes::copy_from_slice(payload)) {
      Ok(()) => {}
      Err(_) => {
        tracing::debug!(
          "inbox for {} would block, dropping {} bytes",
          self.shared.key,
          payload.len()
        );
      }
    }
  }
}

/// Accepts inbound TCP segments and drives per-flow state machines.
pub struct TcpEngine {
  flows: HashMap<FlowKey, FlowEntry>,
  outbound: mpsc::Sender<Bytes>,
  mux: Arc<Mux>,
}

impl TcpEngine {
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

  /// The state of the flow for `key`, if one exists.
  pub fn flow_state(&self, key: &FlowKey) -> Option<TcpState> {
    self.flows.get(key).map(|entry| entry.shared.state())
  }

  /// Ingest one inbound TCP segment.
  pub fn handle_frame(&mut self, ip: &Ipv4Header, tcp: &TcpHeader, payload: &[u8]) {
    let key = FlowKey::new(
      Endpoint::new(ip.src, tcp.src_port),
      Endpoint::new(ip.dst, tcp.dst_port),
    );

    // an inbound RST destroys the flow immediately; no reply
    if tcp.flags.rst() {
      if self.flows.remove(&key).is_some() {
        tracing::debug!("got RST for {}, destroying flow", key);
      }
      return;
    }

    if !self.flows.contains_key(&key) {
      if !tcp.flags.syn() {
        tracing::debug!("{}", Error::UnknownFlow(key.to_string()));
      }
      // create a flow no matter what kind of segment this is; anything other
      // than a SYN leaves it parked in Init
      let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
      let shared = Arc::new(FlowShared {
        key,
        state: Mutex::new(TcpState::Init),
        seq_out: AtomicU32::new(0),
        ack_out: AtomicU32::new(tcp.seq),
        outbound: self.outbound.clone(),
      });
      self.flows.insert(
        key,
        FlowEntry {
          shared,
          inbox: Some(inbox_tx),
          pending_inbox: Some(inbox_rx),
        },
      );
    }

    let flows = &mut self.flows;
    let mux = &self.mux;
    let Some(entry) = flows.get_mut(&key) else {
      return;
    };

    // connection establishment
    if tcp.flags.syn() && entry.shared.state() == TcpState::Init {
      entry.shared.set_state(TcpState::SynReceived);
      entry.shared.store_ack(tcp.seq.wrapping_add(1));
      tracing::debug!(
        "got SYN to {}, now state is {}",
        entry.shared.key.peer,
        entry.shared.state()
      );
      let accepted = match entry.pending_inbox.take() {
        Some(inbox) => mux.notify_tcp(TcpRequest {
          shared: entry.shared.clone(),
          inbox,
        }),
        None => {
          tracing::debug!("duplicate SYN for {}, ignoring", key);
          true
        }
      };
      if !accepted {
        flows.remove(&key);
        return;
      }
    }

    let Some(entry) = self.flows.get_mut(&key) else {
      return;
    };

    // handshake completion; any payload on the same segment is handled below
    if tcp.flags.ack() && entry.shared.state() == TcpState::SynReceived {
      entry.shared.set_state(TcpState::Connected);
      tracing::debug!(
        "got ACK to {}, now state is {}",
        entry.shared.key.peer,
        entry.shared.state()
      );
    }

    // data transport; payload delivery precedes any FIN handling so that a
    // FIN bundled with data does not lose the data
    let mut delivered = 0u32;
    if !tcp.flags.syn() && !payload.is_empty() && entry.shared.state() == TcpState::Connected {
      tracing::debug!(
        "got {} tcp bytes to {}, forwarding to application",
        payload.len(),
        entry.shared.key.peer
      );
      entry
        .shared
        .store_ack(tcp.seq.wrapping_add(payload.len() as u32));
      entry.deliver(payload);
      delivered = payload.len() as u32;
    }

    // connection teardown: we may always acknowledge the child's FIN, even
    // after sending our own
    if tcp.flags.fin() && entry.shared.state() != TcpState::Init {
      let both_sides_done = entry.shared.state() == TcpState::Closed;
      if !both_sides_done {
        entry.shared.set_state(TcpState::PeerFinished);
      }
      let fin_ack = tcp.seq.wrapping_add(delivered).wrapping_add(1);
      entry.shared.store_ack(fin_ack);
      let seq = entry.shared.take_seq(1);
      tracing::debug!(
        "got FIN to {}, now state is {}",
        entry.shared.key.peer,
        entry.shared.state()
      );
      entry
        .shared
        .send_segment_lossy(TcpFlags::FIN | TcpFlags::ACK, seq, fin_ack, &[]);
      // shut the inbox so readers see end-of-stream
      entry.inbox = None;
      if both_sides_done {
        self.flows.remove(&key);
      }
      return;
    }

    // the ACK of our FIN after the child's own FIN ends the flow's life
    if tcp.flags.ack()
      && !tcp.flags.syn()
      && payload.is_empty()
      && entry.shared.state() == TcpState::Closed
      && entry.inbox.is_none()
    {
      tracing::debug!("flow {} fully closed, removing", key);
      self.flows.remove(&key);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn state_display_names() {
    assert_eq!(TcpState::SynReceived.to_string(), "SynReceived");
    assert_eq!(TcpState::PeerFinished.to_string(), "PeerFinished");
  }

  #[test]
  fn flags_compose_and_report() {
    let flags = TcpFlags::FIN | TcpFlags::ACK;
    assert!(flags.fin() && flags.ack());
    assert!(!flags.syn() && !flags.rst());
    assert_eq!(flags.to_string(), "FIN+ACK");
  }
}
