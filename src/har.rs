//! HAR 1.2 serialization of captured exchanges for `--dump-har`.

use crate::errors::{Error, Result};
use crate::report::HttpExchange;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast;

#[derive(Serialize)]
struct Har {
  log: HarLog,
}

#[derive(Serialize)]
struct HarLog {
  version: &'static str,
  creator: HarCreator,
  entries: Vec<HarEntry>,
}

#[derive(Serialize)]
struct HarCreator {
  name: &'static str,
  version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HarEntry {
  started_date_time: String,
  /// total elapsed time in milliseconds
  time: f64,
  request: HarRequest,
  response: HarResponse,
  cache: serde_json::Value,
  timings: HarTimings,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HarRequest {
  method: String,
  url: String,
  http_version: String,
  cookies: Vec<serde_json::Value>,
  headers: Vec<HarNameValue>,
  query_string: Vec<serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  post_data: Option<HarPostData>,
  headers_size: i64,
  body_size: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HarResponse {
  status: u16,
  status_text: String,
  http_version: String,
  cookies: Vec<serde_json::Value>,
  headers: Vec<HarNameValue>,
  content: HarContent,
  redirect_url: String,
  headers_size: i64,
  body_size: i64,
}

#[derive(Serialize)]
struct HarNameValue {
  name: String,
  value: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HarPostData {
  mime_type: String,
  text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HarContent {
  size: i64,
  mime_type: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  text: Option<String>,
}

#[derive(Serialize)]
struct HarTimings {
  send: f64,
  wait: f64,
  receive: f64,
}

fn headers(pairs: &[(String, String)]) -> Vec<HarNameValue> {
  pairs
    .iter()
    .map(|(name, value)| HarNameValue {
      name: name.clone(),
      value: value.clone(),
    })
    .collect()
}

fn content_type(pairs: &[(String, String)]) -> String {
  pairs
    .iter()
    .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
    .map(|(_, value)| value.clone())
    .unwrap_or_default()
}

fn entry(exchange: &HttpExchange) -> HarEntry {
  let started_date_time = exchange
    .started
    .format(&Rfc3339)
    .unwrap_or_else(|_| exchange.started.to_string());
  let post_data = if exchange.request_body.is_empty() {
    None
  } else {
    String::from_utf8(exchange.request_body.to_vec())
      .ok()
      .map(|text| HarPostData {
        mime_type: content_type(&exchange.request_headers),
        text,
      })
  };
  let time = exchange.duration.as_secs_f64() * 1000.0;
  HarEntry {
    started_date_time,
    time,
    request: HarRequest {
      method: exchange.method.clone(),
      url: exchange.url.clone(),
      http_version: exchange.http_version.clone(),
      cookies: Vec::new(),
      headers: headers(&exchange.request_headers),
      query_string: Vec::new(),
      post_data,
      headers_size: -1,
      body_size: exchange.request_body.len() as i64,
    },
    response: HarResponse {
      status: exchange.status,
      status_text: exchange.status_text.clone(),
      http_version: exchange.http_version.clone(),
      cookies: Vec::new(),
      headers: headers(&exchange.response_headers),
      content: HarContent {
        size: exchange.response_body.len() as i64,
        mime_type: content_type(&exchange.response_headers),
        text: String::from_utf8(exchange.response_body.to_vec()).ok(),
      },
      redirect_url: String::new(),
      headers_size: -1,
      body_size: exchange.response_body.len() as i64,
    },
    cache: serde_json::json!({}),
    timings: HarTimings {
      send: 0.0,
      wait: time,
      receive: 0.0,
    },
  }
}

/// Collect exchanges into `sink` until the log is torn down.
pub async fn collect(
  mut rx: broadcast::Receiver<Arc<HttpExchange>>,
  sink: Arc<Mutex<Vec<Arc<HttpExchange>>>>,
) {
  loop {
    match rx.recv().await {
      Ok(exchange) => {
        sink
          .lock()
          .unwrap_or_else(|poisoned| poisoned.into_inner())
          .push(exchange);
      }
      Err(broadcast::error::RecvError::Lagged(missed)) => {
        tracing::debug!("HAR collector lagged, missed {} exchanges", missed);
      }
      Err(broadcast::error::RecvError::Closed) => return,
    }
  }
}

/// Serialize the collected exchanges as a HAR 1.2 log at `path`.
pub fn write(path: &Path, exchanges: &[Arc<HttpExchange>]) -> Result<()> {
  let har = Har {
    log: HarLog {
      version: "1.2",
      creator: HarCreator {
        name: "webtap",
        version: env!("CARGO_PKG_VERSION"),
      },
      entries: exchanges.iter().map(|exchange| entry(exchange)).collect(),
    },
  };
  let file = std::fs::File::create(path)?;
  serde_json::to_writer(file, &har).map_err(|e| Error::Proxy(format!("HAR serialization: {}", e)))
}
