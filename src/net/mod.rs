//! The packet-interception datapath.
//!
//! A single duplex link carries raw IPv4 frames: the link reader parses each
//! inbound frame and dispatches it to the TCP or UDP engine, flows surface to
//! handlers as byte streams, and handler writes come back as fully framed
//! IPv4 packets on a shared outbound queue drained by the link writer.
//!
//! ```text
//!  link-in ─▶ parser ─▶ (tcp|udp) engine ─▶ flow ─▶ handler
//!  link-out ◀─ writer ◀─ outbound queue ◀─ serializer ◀─ handler
//! ```

pub mod addr;
pub mod tcp;
pub mod udp;
pub mod wire;

use crate::errors::Result;
use crate::mux::Mux;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Maximum transmission unit of the virtual link.
pub const MTU: usize = 1500;

/// Outbound queue depth, in frames. Producers fail fast when it is full.
const OUTBOUND_CAPACITY: usize = 1000;

/// The assembled datapath: both engines plus the link plumbing.
pub struct NetStack {
  tcp: tcp::TcpEngine,
  udp: udp::UdpEngine,
  outbound_rx: Option<mpsc::Receiver<Bytes>>,
}

impl NetStack {
  /// Build a stack that routes new flows through `mux`.
  pub fn new(mux: Arc<Mux>) -> Self {
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    Self {
      tcp: tcp::TcpEngine::new(mux.clone(), outbound_tx.clone()),
      udp: udp::UdpEngine::new(mux, outbound_tx),
      outbound_rx: Some(outbound_rx),
    }
  }

  /// The TCP engine, for inspection.
  pub fn tcp(&self) -> &tcp::TcpEngine {
    &self.tcp
  }

  /// The UDP engine, for inspection.
  pub fn udp(&self) -> &udp::UdpEngine {
    &self.udp
  }

  /// Take the receiving half of the outbound queue.
  ///
  /// [`run`](Self::run) drains it into the device; tests take it to observe
  /// the frames the engines emit.
  pub fn take_outbound(&mut self) -> Option<mpsc::Receiver<Bytes>> {
    self.outbound_rx.take()
  }

  /// Parse one inbound frame and dispatch it to the engines.
  ///
  /// Malformed frames are dropped with a log line; processing continues.
  pub fn handle_frame(&mut self, frame: &[u8]) {
    match wire::parse_frame(frame) {
      Ok(Some(wire::Parsed::Tcp(ip, tcp, payload))) => {
        tracing::debug!(
          "received from subprocess: {}",
          wire::summarize_tcp(&ip, &tcp, payload.len())
        );
        self.tcp.handle_frame(&ip, &tcp, payload);
      }
      Ok(Some(wire::Parsed::Udp(ip, udp, payload))) => {
        self.udp.handle_frame(&ip, &udp, payload);
      }
      Ok(None) => {}
      Err(e) => tracing::debug!("dropping inbound frame: {}", e),
    }
  }

  /// Drive the datapath over `device` until the link is torn down.
  ///
  /// The device must deliver one complete IPv4 frame per read and accept one
  /// complete frame per write, which is what a TUN device does. Write errors
  /// are logged per frame and recovered; a read error is fatal.
  pub async fn run<D>(mut self, device: D) -> Result<()>
  where
    D: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let Some(mut outbound) = self.take_outbound() else {
      return Ok(());
    };
    let (mut reader, mut writer) = tokio::io::split(device);

    tokio::spawn(async move {
      while let Some(frame) = outbound.recv().await {
        tracing::debug!("transmitting {} raw bytes to subprocess", frame.len());
        if let Err(e) = writer.write_all(&frame).await {
          tracing::error!(
            "error writing {} bytes to tun: {}, dropping and continuing",
            frame.len(),
            e
          );
        }
      }
    });

    let mut buf = vec![0u8; MTU];
    loop {
      let n = match reader.read(&mut buf).await {
        Ok(0) => return Ok(()),
        Ok(n) => n,
        Err(e) => {
          tracing::error!("error reading a packet from tun: {}", e);
          return Err(e.into());
        }
      };
      self.handle_frame(&buf[..n]);
    }
  }
}
