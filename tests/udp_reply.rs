//! UDP engine behavior: flow creation, delivery, reply framing and the
//! no-handler drop path.

use bytes::Bytes;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webtap::net::addr::Endpoint;
use webtap::net::udp::UdpEngine;
use webtap::net::wire;
use webtap::Mux;

fn child() -> Endpoint {
  Endpoint::new(Ipv4Addr::new(10, 1, 1, 100), 40000)
}

fn resolver() -> Endpoint {
  Endpoint::new(Ipv4Addr::new(10, 1, 1, 1), 53)
}

fn feed(engine: &mut UdpEngine, src: Endpoint, dst: Endpoint, payload: &[u8]) {
  let frame = wire::build_udp_frame(src, dst, payload).unwrap();
  let (ip, rest) = wire::parse_ipv4(&frame).unwrap();
  let (udp, payload) = wire::parse_udp(rest).unwrap();
  engine.handle_frame(&ip, &udp, payload);
}

#[tokio::test]
async fn datagrams_reach_the_handler_and_replies_are_framed() {
  let mut mux = Mux::new();
  mux
    .handle_udp_fn(":53", |mut flow| async move {
      while let Some(datagram) = flow.recv().await {
        let mut reversed = datagram.to_vec();
        reversed.reverse();
        flow.reply(&reversed).unwrap();
      }
    })
    .unwrap();
  let (tx, mut rx) = mpsc::channel::<Bytes>(16);
  let mut engine = UdpEngine::new(Arc::new(mux), tx);

  feed(&mut engine, child(), resolver(), b"abc");
  assert_eq!(engine.flow_count(), 1);

  let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
    .await
    .expect("timed out waiting for a reply frame")
    .expect("outbound queue closed");

  // both checksums on the reply must validate
  assert_eq!(wire::checksum(&frame[..wire::IPV4_HEADER_LEN]), 0);
  let (ip, rest) = wire::parse_ipv4(&frame).unwrap();
  assert_eq!(wire::pseudo_checksum(ip.src, ip.dst, ip.protocol, rest), 0);
  assert_eq!(ip.protocol, wire::PROTO_UDP);

  let (udp, payload) = wire::parse_udp(rest).unwrap();
  assert_eq!(ip.src, resolver().addr);
  assert_eq!(udp.src_port, 53);
  assert_eq!(ip.dst, child().addr);
  assert_eq!(udp.dst_port, 40000);
  assert_eq!(payload, b"cba");
}

#[tokio::test]
async fn later_datagrams_append_to_the_same_flow() {
  let (seen_tx, mut seen_rx) = mpsc::channel(4);
  let mut mux = Mux::new();
  mux
    .handle_udp_fn(":53", move |mut flow| {
      let seen_tx = seen_tx.clone();
      async move {
        while let Some(datagram) = flow.recv().await {
          let _ = seen_tx.send(datagram.to_vec()).await;
        }
      }
    })
    .unwrap();
  let (tx, _rx) = mpsc::channel::<Bytes>(16);
  let mut engine = UdpEngine::new(Arc::new(mux), tx);

  feed(&mut engine, child(), resolver(), b"first");
  feed(&mut engine, child(), resolver(), b"second");
  assert_eq!(engine.flow_count(), 1);

  for expected in [b"first".as_slice(), b"second".as_slice()] {
    let got = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
      .await
      .expect("timed out waiting for a datagram")
      .expect("handler channel closed");
    assert_eq!(got, expected);
  }
}

#[tokio::test]
async fn unmatched_datagrams_are_dropped() {
  let mut mux = Mux::new();
  mux.handle_udp_fn(":53", |_flow| async {}).unwrap();
  let (tx, mut rx) = mpsc::channel::<Bytes>(16);
  let mut engine = UdpEngine::new(Arc::new(mux), tx);

  let elsewhere = Endpoint::new(Ipv4Addr::new(10, 1, 1, 1), 999);
  feed(&mut engine, child(), elsewhere, b"nobody listens");
  assert_eq!(engine.flow_count(), 0);
  assert!(rx.try_recv().is_err());
}
