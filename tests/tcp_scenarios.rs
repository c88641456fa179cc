//! End-to-end scenarios for the TCP engine, driven through in-memory
//! channels: handshake, echo, reject, teardown from both sides, oversized
//! payloads and concurrent flows.

use bytes::Bytes;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webtap::net::addr::{Endpoint, FlowKey};
use webtap::net::tcp::{TcpEngine, TcpFlowStream, TcpState};
use webtap::net::wire::{self, TcpFlags};
use webtap::{Error, Mux};

const PSH_ACK: TcpFlags = TcpFlags(0x18);

fn child() -> Endpoint {
  Endpoint::new(Ipv4Addr::new(10, 1, 1, 100), 43210)
}

fn peer() -> Endpoint {
  Endpoint::new(Ipv4Addr::new(93, 184, 216, 34), 80)
}

fn key() -> FlowKey {
  FlowKey::new(child(), peer())
}

/// Feed one child-originated segment into the engine, going through the real
/// serializer and parser on the way.
fn feed(engine: &mut TcpEngine, src: Endpoint, dst: Endpoint, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) {
  let frame = wire::build_tcp_frame(src, dst, seq, ack, flags, payload).unwrap();
  let (ip, rest) = wire::parse_ipv4(&frame).unwrap();
  let (tcp, payload) = wire::parse_tcp(rest).unwrap();
  engine.handle_frame(&ip, &tcp, payload);
}

#[derive(Debug)]
struct Sent {
  src: Endpoint,
  dst: Endpoint,
  seq: u32,
  ack: u32,
  flags: TcpFlags,
  payload: Vec<u8>,
}

/// Parse an outbound frame, checking that both checksums validate.
fn parse_sent(frame: &[u8]) -> Sent {
  assert_eq!(wire::checksum(&frame[..wire::IPV4_HEADER_LEN]), 0, "IPv4 checksum must validate");
  let (ip, rest) = wire::parse_ipv4(frame).unwrap();
  assert_eq!(
    wire::pseudo_checksum(ip.src, ip.dst, ip.protocol, rest),
    0,
    "TCP checksum must validate"
  );
  let (tcp, payload) = wire::parse_tcp(rest).unwrap();
  Sent {
    src: Endpoint::new(ip.src, tcp.src_port),
    dst: Endpoint::new(ip.dst, tcp.dst_port),
    seq: tcp.seq,
    ack: tcp.ack,
    flags: tcp.flags,
    payload: payload.to_vec(),
  }
}

async fn recv_frame(rx: &mut mpsc::Receiver<Bytes>) -> Sent {
  let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
    .await
    .expect("timed out waiting for an outbound frame")
    .expect("outbound queue closed");
  parse_sent(&frame)
}

fn engine_with(mux: Mux) -> (TcpEngine, mpsc::Receiver<Bytes>) {
  let (tx, rx) = mpsc::channel(64);
  (TcpEngine::new(Arc::new(mux), tx), rx)
}

/// Scenario A: three-way handshake, then the handler answers "ping" with
/// "pong".
#[tokio::test]
async fn handshake_then_echo() {
  let mut mux = Mux::new();
  mux
    .handle_tcp_fn(":80", |mut stream| async move {
      let mut buf = [0u8; 2048];
      while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
          break;
        }
        stream.write(b"pong").unwrap();
      }
    })
    .unwrap();
  let (mut engine, mut rx) = engine_with(mux);

  feed(&mut engine, child(), peer(), 1000, 0, TcpFlags::SYN, &[]);
  let synack = recv_frame(&mut rx).await;
  assert!(synack.flags.syn() && synack.flags.ack());
  assert_eq!(synack.seq, 0);
  assert_eq!(synack.ack, 1001);
  assert_eq!(synack.src, peer());
  assert_eq!(synack.dst, child());
  assert_eq!(engine.flow_state(&key()), Some(TcpState::SynReceived));

  feed(&mut engine, child(), peer(), 1001, 1, TcpFlags::ACK, &[]);
  assert_eq!(engine.flow_state(&key()), Some(TcpState::Connected));

  feed(&mut engine, child(), peer(), 1001, 1, PSH_ACK, b"ping");
  let reply = recv_frame(&mut rx).await;
  assert!(reply.flags.ack() && !reply.flags.syn() && !reply.flags.fin());
  assert_eq!(reply.seq, 1);
  assert_eq!(reply.ack, 1005);
  assert_eq!(reply.payload, b"pong");
  assert_eq!(engine.flow_state(&key()), Some(TcpState::Connected));
}

/// Scenario B: a SYN to a port nothing handles is answered with RST+ACK and
/// the flow is destroyed.
#[tokio::test]
async fn unmatched_syn_is_rejected() {
  let mut mux = Mux::new();
  mux.handle_tcp_fn(":80", |_stream| async {}).unwrap();
  let (mut engine, mut rx) = engine_with(mux);

  let nowhere = Endpoint::new(peer().addr, 9999);
  feed(&mut engine, child(), nowhere, 4242, 0, TcpFlags::SYN, &[]);
  let rst = recv_frame(&mut rx).await;
  assert!(rst.flags.rst() && rst.flags.ack());
  assert_eq!(rst.seq, 0);
  assert_eq!(rst.ack, 4243);
  assert_eq!(engine.flow_count(), 0);
}

/// Scenario C: the child closes first; the engine acknowledges the FIN and
/// the handler sees end-of-stream.
#[tokio::test]
async fn peer_close_reaches_the_handler_as_eof() {
  let (eof_tx, mut eof_rx) = mpsc::channel(1);
  let mut mux = Mux::new();
  mux
    .handle_tcp_fn(":80", move |mut stream| {
      let eof_tx = eof_tx.clone();
      async move {
        let mut buf = [0u8; 2048];
        loop {
          match stream.read(&mut buf).await {
            Ok(0) => {
              let _ = eof_tx.send(()).await;
              break;
            }
            Ok(_) => {}
            Err(_) => break,
          }
        }
      }
    })
    .unwrap();
  let (mut engine, mut rx) = engine_with(mux);

  feed(&mut engine, child(), peer(), 1000, 0, TcpFlags::SYN, &[]);
  recv_frame(&mut rx).await;
  feed(&mut engine, child(), peer(), 1001, 1, TcpFlags::ACK, &[]);

  feed(&mut engine, child(), peer(), 1001, 1, TcpFlags::FIN | TcpFlags::ACK, &[]);
  let finack = recv_frame(&mut rx).await;
  assert!(finack.flags.fin() && finack.flags.ack());
  assert_eq!(finack.seq, 1);
  assert_eq!(finack.ack, 1002);
  assert_eq!(engine.flow_state(&key()), Some(TcpState::PeerFinished));

  tokio::time::timeout(Duration::from_secs(5), eof_rx.recv())
    .await
    .expect("handler never saw end-of-stream");
}

/// Scenario D: the handler closes first; a second close is a clean no-op.
#[tokio::test]
async fn local_close_is_idempotent() {
  let (stream_tx, mut stream_rx) = mpsc::channel::<TcpFlowStream>(1);
  let mut mux = Mux::new();
  mux
    .handle_tcp_fn(":80", move |stream| {
      let stream_tx = stream_tx.clone();
      async move {
        let _ = stream_tx.send(stream).await;
      }
    })
    .unwrap();
  let (mut engine, mut rx) = engine_with(mux);

  feed(&mut engine, child(), peer(), 1000, 0, TcpFlags::SYN, &[]);
  recv_frame(&mut rx).await;
  feed(&mut engine, child(), peer(), 1001, 1, TcpFlags::ACK, &[]);

  let stream = tokio::time::timeout(Duration::from_secs(5), stream_rx.recv())
    .await
    .expect("handler never received the stream")
    .expect("handler channel closed");

  stream.close().unwrap();
  let finack = recv_frame(&mut rx).await;
  assert!(finack.flags.fin() && finack.flags.ack());
  assert_eq!(finack.seq, 1);
  assert_eq!(finack.ack, 1001);
  assert_eq!(engine.flow_state(&key()), Some(TcpState::Closed));
  assert_eq!(stream.state(), TcpState::Closed);

  // closing again succeeds and emits nothing further
  stream.close().unwrap();
  assert!(rx.try_recv().is_err());
}

/// Scenario E: a payload larger than the reader's buffer surfaces as an
/// error; payloads are never fragmented across reads.
#[tokio::test]
async fn oversized_payload_with_small_buffer_errors() {
  let (err_tx, mut err_rx) = mpsc::channel(1);
  let mut mux = Mux::new();
  mux
    .handle_tcp_fn(":80", move |mut stream| {
      let err_tx = err_tx.clone();
      async move {
        let mut buf = [0u8; 256];
        if let Err(e) = stream.read(&mut buf).await {
          let _ = err_tx.send(e).await;
        }
      }
    })
    .unwrap();
  let (mut engine, mut rx) = engine_with(mux);

  feed(&mut engine, child(), peer(), 1000, 0, TcpFlags::SYN, &[]);
  recv_frame(&mut rx).await;
  feed(&mut engine, child(), peer(), 1001, 1, TcpFlags::ACK, &[]);
  feed(&mut engine, child(), peer(), 1001, 1, PSH_ACK, &[0x55; 1400]);

  let error = tokio::time::timeout(Duration::from_secs(5), err_rx.recv())
    .await
    .expect("handler never reported a read error")
    .expect("error channel closed");
  assert!(matches!(
    error,
    Error::BufferTooSmall {
      need: 1400,
      have: 256
    }
  ));
}

/// Scenario F: two simultaneous flows from different source ports stay
/// isolated from each other.
#[tokio::test]
async fn concurrent_flows_do_not_mix() {
  let mut mux = Mux::new();
  mux
    .handle_tcp_fn(":80", |mut stream| async move {
      let mut buf = [0u8; 2048];
      while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
          break;
        }
        stream.write(&buf[..n]).unwrap();
      }
    })
    .unwrap();
  let (mut engine, mut rx) = engine_with(mux);

  let child_a = Endpoint::new(child().addr, 40001);
  let child_b = Endpoint::new(child().addr, 40002);

  feed(&mut engine, child_a, peer(), 100, 0, TcpFlags::SYN, &[]);
  let synack_a = recv_frame(&mut rx).await;
  assert_eq!(synack_a.dst, child_a);
  feed(&mut engine, child_b, peer(), 200, 0, TcpFlags::SYN, &[]);
  let synack_b = recv_frame(&mut rx).await;
  assert_eq!(synack_b.dst, child_b);
  assert_eq!(engine.flow_count(), 2);

  feed(&mut engine, child_a, peer(), 101, 1, TcpFlags::ACK, &[]);
  feed(&mut engine, child_b, peer(), 201, 1, TcpFlags::ACK, &[]);

  feed(&mut engine, child_a, peer(), 101, 1, PSH_ACK, b"flow-a");
  feed(&mut engine, child_b, peer(), 201, 1, PSH_ACK, b"flow-b");

  let mut replies = Vec::new();
  replies.push(recv_frame(&mut rx).await);
  replies.push(recv_frame(&mut rx).await);
  for reply in replies {
    match reply.dst.port {
      40001 => assert_eq!(reply.payload, b"flow-a"),
      40002 => assert_eq!(reply.payload, b"flow-b"),
      other => panic!("reply to unexpected port {}", other),
    }
  }
}

/// An inbound RST destroys the flow without any reply.
#[tokio::test]
async fn inbound_rst_destroys_the_flow() {
  let mut mux = Mux::new();
  mux.handle_tcp_fn(":80", |_stream| async {}).unwrap();
  let (mut engine, mut rx) = engine_with(mux);

  feed(&mut engine, child(), peer(), 1000, 0, TcpFlags::SYN, &[]);
  recv_frame(&mut rx).await;
  assert_eq!(engine.flow_count(), 1);

  feed(&mut engine, child(), peer(), 1001, 1, TcpFlags::RST, &[]);
  assert_eq!(engine.flow_count(), 0);
  assert!(rx.try_recv().is_err());
}

/// Round trip: bytes fed in arrive back in order and in full, and sequence
/// numbers advance monotonically over the whole exchange.
#[tokio::test]
async fn round_trip_preserves_order_and_sequence_monotonicity() {
  let mut mux = Mux::new();
  mux
    .handle_tcp_fn(":80", |mut stream| async move {
      let mut buf = [0u8; 2048];
      while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
          break;
        }
        stream.write(&buf[..n]).unwrap();
      }
    })
    .unwrap();
  let (mut engine, mut rx) = engine_with(mux);

  feed(&mut engine, child(), peer(), 1000, 0, TcpFlags::SYN, &[]);
  let mut last_seq = recv_frame(&mut rx).await.seq;
  feed(&mut engine, child(), peer(), 1001, 1, TcpFlags::ACK, &[]);

  let chunks: Vec<Vec<u8>> = (0u8..3).map(|i| vec![i; 1000]).collect();
  let mut seq = 1001u32;
  for chunk in &chunks {
    feed(&mut engine, child(), peer(), seq, 1, PSH_ACK, chunk);
    seq += chunk.len() as u32;
  }

  let mut echoed = Vec::new();
  while echoed.len() < 3000 {
    let reply = recv_frame(&mut rx).await;
    assert!(reply.seq >= last_seq, "seq_out must never move backward");
    last_seq = reply.seq;
    echoed.extend_from_slice(&reply.payload);
  }
  let expected: Vec<u8> = chunks.concat();
  assert_eq!(echoed, expected);
}

/// A FIN that arrives bundled with data must not lose the data: the payload
/// is delivered first, then the stream ends.
#[tokio::test]
async fn fin_with_payload_delivers_the_payload_first() {
  let (seen_tx, mut seen_rx) = mpsc::channel(4);
  let mut mux = Mux::new();
  mux
    .handle_tcp_fn(":80", move |mut stream| {
      let seen_tx = seen_tx.clone();
      async move {
        let mut buf = [0u8; 2048];
        loop {
          match stream.read(&mut buf).await {
            Ok(0) => {
              let _ = seen_tx.send(Vec::new()).await;
              break;
            }
            Ok(n) => {
              let _ = seen_tx.send(buf[..n].to_vec()).await;
            }
            Err(_) => break,
          }
        }
      }
    })
    .unwrap();
  let (mut engine, mut rx) = engine_with(mux);

  feed(&mut engine, child(), peer(), 1000, 0, TcpFlags::SYN, &[]);
  recv_frame(&mut rx).await;
  feed(&mut engine, child(), peer(), 1001, 1, TcpFlags::ACK, &[]);

  feed(
    &mut engine,
    child(),
    peer(),
    1001,
    1,
    TcpFlags::FIN | PSH_ACK,
    b"last words",
  );
  let finack = recv_frame(&mut rx).await;
  assert!(finack.flags.fin() && finack.flags.ack());
  // the FIN occupies the sequence number after the payload
  assert_eq!(finack.ack, 1001 + 10 + 1);

  let first = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
    .await
    .expect("handler never saw the payload")
    .expect("handler channel closed");
  assert_eq!(first, b"last words");
  let second = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
    .await
    .expect("handler never saw end-of-stream")
    .expect("handler channel closed");
  assert!(second.is_empty());
}
