//! # webtap
//!
//! Run a command inside an isolated network environment and intercept,
//! decrypt and log its HTTP(S) traffic.
//!
//! The only route out of the isolated environment is a virtual
//! point-to-point link owned by this crate. Everything the child sends
//! arrives here as raw IPv4 frames; a small homegrown TCP/UDP engine
//! terminates each connection as if it were the intended remote endpoint and
//! exposes it to handlers as an ordinary byte stream. The child trusts a
//! root CA minted fresh for the run, so its TLS sessions terminate here too.
//!
//! ```text
//!  child ──▶ tun ──▶ link reader ──▶ tcp/udp engines ──▶ mux ──▶ handlers
//!                                                              (http, https,
//!  child ◀── tun ◀── link writer ◀── outbound queue ◀──────────  dns, raw)
//! ```
//!
//! The [`net`] module is the datapath; [`mux`] routes new flows to handlers
//! by destination pattern; [`proxy`] and [`dns`] are the handlers the binary
//! installs; [`ca`], [`netns`], [`har`] and [`report`] are the surrounding
//! machinery: certificate minting, namespace/TUN setup, HAR capture and
//! terminal output.

/// certificate authority minting and trust-store export
pub mod ca;
/// DNS-over-UDP handling for the child
pub mod dns;
mod errors;
/// HAR 1.2 capture
pub mod har;
/// flow routing by destination pattern
pub mod mux;
/// the packet-interception datapath
pub mod net;
/// namespaces, the TUN device and the child process
pub mod netns;
/// HTTP/HTTPS interception handlers
pub mod proxy;
/// captured exchanges and terminal reporting
pub mod report;

pub use errors::{Error, Result};
pub use mux::Mux;
pub use net::NetStack;
