//! Captured HTTP exchanges and terminal reporting.
//!
//! Handlers publish completed request/response pairs onto a broadcast
//! channel; the terminal printer and the HAR collector are independent
//! subscribers.

use bytes::Bytes;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::broadcast;

/// One completed request/response pair observed on an intercepted flow.
#[derive(Clone, Debug)]
pub struct HttpExchange {
  /// request method
  pub method: String,
  /// full request URL, scheme included
  pub url: String,
  /// protocol version, e.g. `HTTP/1.1`
  pub http_version: String,
  /// response status code
  pub status: u16,
  /// response reason phrase
  pub status_text: String,
  /// request headers in wire order
  pub request_headers: Vec<(String, String)>,
  /// response headers in wire order
  pub response_headers: Vec<(String, String)>,
  /// request body
  pub request_body: Bytes,
  /// response body
  pub response_body: Bytes,
  /// when the request was first seen
  pub started: OffsetDateTime,
  /// wall time from request to response
  pub duration: std::time::Duration,
}

/// Fan-out hub for completed exchanges.
#[derive(Clone)]
pub struct ExchangeLog {
  tx: broadcast::Sender<Arc<HttpExchange>>,
}

impl Default for ExchangeLog {
  fn default() -> Self {
    Self::new()
  }
}

impl ExchangeLog {
  /// Create a hub. Slow subscribers lag rather than block publishers.
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(256);
    Self { tx }
  }

  /// Publish one exchange to whoever is listening.
  pub fn publish(&self, exchange: HttpExchange) {
    // no subscribers is fine; the record is simply not kept
    let _ = self.tx.send(Arc::new(exchange));
  }

  /// Subscribe to future exchanges.
  pub fn subscribe(&self) -> broadcast::Receiver<Arc<HttpExchange>> {
    self.tx.subscribe()
  }
}

/// What the terminal printer includes beyond the summary lines.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrintOptions {
  /// print request and response headers
  pub head: bool,
  /// print request and response bodies
  pub body: bool,
}

const BLUE_BOLD: &str = "\x1b[1;34m";
const GREEN: &str = "\x1b[32m";
const MAGENTA: &str = "\x1b[35m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Print exchanges to standard output until the log is torn down.
pub async fn print_exchanges(
  mut rx: broadcast::Receiver<Arc<HttpExchange>>,
  options: PrintOptions,
) {
  loop {
    let exchange = match rx.recv().await {
      Ok(exchange) => exchange,
      Err(broadcast::error::RecvError::Lagged(missed)) => {
        tracing::debug!("terminal printer lagged, missed {} exchanges", missed);
        continue;
      }
      Err(broadcast::error::RecvError::Closed) => return,
    };

    println!("{}---> {} {}{}", BLUE_BOLD, exchange.method, exchange.url, RESET);
    if options.head {
      for (name, value) in &exchange.request_headers {
        println!("> {}: {}", name, value);
      }
    }
    if options.body && !exchange.request_body.is_empty() {
      println!("{}", String::from_utf8_lossy(&exchange.request_body));
    }

    let color = match exchange.status {
      0..=299 => GREEN,
      300..=399 => MAGENTA,
      400..=499 => YELLOW,
      _ => RED,
    };
    println!(
      "{}<--- {} {} ({} bytes){}",
      color,
      exchange.status,
      exchange.url,
      exchange.response_body.len(),
      RESET
    );
    if options.head {
      for (name, value) in &exchange.response_headers {
        println!("< {}: {}", name, value);
      }
    }
    if options.body && !exchange.response_body.is_empty() {
      println!("{}", String::from_utf8_lossy(&exchange.response_body));
    }
  }
}
