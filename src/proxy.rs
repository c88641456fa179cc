//! HTTP and HTTPS interception built over the flow byte streams.
//!
//! The HTTP handler parses each request off the flow, replays it against the
//! real destination from the host's network, and writes the response back as
//! if it came from that destination. The HTTPS handler first terminates TLS
//! with a leaf certificate minted for the requested server name, then runs
//! the same HTTP loop over the decrypted stream. Flows nothing else claims
//! are tunneled byte-for-byte by the passthrough handler.

use crate::ca::CertificateAuthority;
use crate::errors::{Error, Result};
use crate::mux::TcpHandler;
use crate::net::tcp::TcpFlowStream;
use crate::report::{ExchangeLog, HttpExchange};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::io::{
  AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{
  verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};

/// Host name processes inside the namespace use to reach the host's loopback.
pub const SPECIAL_HOST_NAME: &str = "host.webtap.local";
/// Address form of [`SPECIAL_HOST_NAME`].
pub const SPECIAL_HOST_IP: &str = "169.254.77.65";

fn remap_host(host: &str) -> &str {
  if host == SPECIAL_HOST_NAME || host == SPECIAL_HOST_IP {
    "127.0.0.1"
  } else {
    host
  }
}

fn remap_addr(addr: SocketAddr) -> SocketAddr {
  if addr.ip().to_string() == SPECIAL_HOST_IP {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
  } else {
    addr
  }
}

fn is_hop_by_hop(name: &str) -> bool {
  [
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
  ]
  .iter()
  .any(|h| name.eq_ignore_ascii_case(h))
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(n, _)| n.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

/// One parsed HTTP request as it came off the wire.
#[derive(Clone, Debug)]
pub(crate) struct RawRequest {
  method: String,
  target: String,
  version: String,
  headers: Vec<(String, String)>,
  body: Bytes,
}

impl RawRequest {
  fn host(&self) -> Option<&str> {
    header_value(&self.headers, "host")
  }

  /// Serialize for the upstream connection: hop-by-hop headers dropped, the
  /// body reframed with a plain content length, connection closed after one
  /// exchange.
  fn for_upstream(&self) -> Vec<u8> {
    let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version).into_bytes();
    for (name, value) in &self.headers {
      if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
        continue;
      }
      out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    if !self.body.is_empty() {
      out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(&self.body);
    out
  }
}

/// One parsed HTTP response from upstream.
#[derive(Clone, Debug)]
pub(crate) struct RawResponse {
  version: String,
  status: u16,
  reason: String,
  headers: Vec<(String, String)>,
  body: Bytes,
}

impl RawResponse {
  /// Serialize for the child: the decoded body is reframed with a plain
  /// content length so chunked upstream responses arrive whole.
  fn for_child(&self, close: bool) -> Vec<u8> {
    let mut out = format!("{} {} {}\r\n", self.version, self.status, self.reason).into_bytes();
    for (name, value) in &self.headers {
      if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
        continue;
      }
      out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
    out.extend_from_slice(if close {
      b"Connection: close\r\n\r\n"
    } else {
      b"Connection: keep-alive\r\n\r\n"
    });
    out.extend_from_slice(&self.body);
    out
  }
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
  let mut line = Vec::new();
  let n = reader.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Ok(None);
  }
  if line.last() == Some(&b'\n') {
    line.pop();
    if line.last() == Some(&b'\r') {
      line.pop();
    }
  }
  String::from_utf8(line)
    .map(Some)
    .map_err(|_| Error::proxy("header line is not UTF-8"))
}

async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<(String, String)>> {
  let mut headers = Vec::new();
  loop {
    let Some(line) = read_line(reader).await? else {
      return Err(Error::proxy("connection closed inside headers"));
    };
    if line.is_empty() {
      return Ok(headers);
    }
    let Some((name, value)) = line.split_once(':') else {
      return Err(Error::proxy(format!("malformed header line {:?}", line)));
    };
    headers.push((name.trim().to_string(), value.trim().to_string()));
  }
}

async fn read_body<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  headers: &[(String, String)],
  close_delimited: bool,
) -> Result<Bytes> {
  let chunked = header_value(headers, "transfer-encoding")
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false);
  if chunked {
    let mut body = Vec::new();
    loop {
      let Some(size_line) = read_line(reader).await? else {
        return Err(Error::proxy("connection closed inside chunked body"));
      };
      let size_str = size_line.split(';').next().unwrap_or("").trim();
      let size = usize::from_str_radix(size_str, 16)
        .map_err(|_| Error::proxy(format!("bad chunk size {:?}", size_line)))?;
      if size == 0 {
        // consume optional trailers up to the final empty line
        while let Some(line) = read_line(reader).await? {
          if line.is_empty() {
            break;
          }
        }
        return Ok(body.into());
      }
      let start = body.len();
      body.resize(start + size, 0);
      reader.read_exact(&mut body[start..]).await?;
      let mut crlf = [0u8; 2];
      reader.read_exact(&mut crlf).await?;
    }
  } else if let Some(length) = header_value(headers, "content-length") {
    let length: usize = length
      .trim()
      .parse()
      .map_err(|_| Error::proxy(format!("bad content length {:?}", length)))?;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(body.into())
  } else if close_delimited {
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await?;
    Ok(body.into())
  } else {
    Ok(Bytes::new())
  }
}

/// Read one request off the stream; `None` at a clean end of stream.
pub(crate) async fn read_request<R: AsyncBufRead + Unpin>(
  reader: &mut R,
) -> Result<Option<RawRequest>> {
  let line = loop {
    let Some(line) = read_line(reader).await? else {
      return Ok(None);
    };
    // tolerate stray blank lines between pipelined requests
    if !line.is_empty() {
      break line;
    }
  };
  let mut parts = line.split_whitespace();
  let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
  else {
    return Err(Error::proxy(format!("malformed request line {:?}", line)));
  };
  let headers = read_headers(reader).await?;
  let body = read_body(reader, &headers, false).await?;
  Ok(Some(RawRequest {
    method: method.to_string(),
    target: target.to_string(),
    version: version.to_string(),
    headers,
    body,
  }))
}

pub(crate) async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<RawResponse> {
  let Some(line) = read_line(reader).await? else {
    return Err(Error::proxy("upstream closed before the status line"));
  };
  let mut parts = line.splitn(3, ' ');
  let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
    return Err(Error::proxy(format!("malformed status line {:?}", line)));
  };
  let status: u16 = status
    .parse()
    .map_err(|_| Error::proxy(format!("bad status code in {:?}", line)))?;
  let reason = match parts.next() {
    Some(reason) if !reason.is_empty() => reason.to_string(),
    _ => http::StatusCode::from_u16(status)
      .ok()
      .and_then(|code| code.canonical_reason())
      .unwrap_or("")
      .to_string(),
  };
  let headers = read_headers(reader).await?;
  let body = read_body(reader, &headers, true).await?;
  Ok(RawResponse {
    version: version.to_string(),
    status,
    reason,
    headers,
    body,
  })
}

/// Upstream certificates are accepted without chain or host-name checks:
/// the child's trust decisions are already replaced wholesale by the minted
/// CA, so there is nothing meaningful to enforce here. Handshake signatures
/// are still verified with whatever algorithms the crypto provider offers.
#[derive(Debug)]
struct NoVerifier(WebPkiSupportedAlgorithms);

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    verify_tls12_signature(message, cert, dss, &self.0)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    verify_tls13_signature(message, cert, dss, &self.0)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.0.supported_schemes()
  }
}

/// Replays intercepted requests against the real network.
pub struct Upstream {
  tls: TlsConnector,
}

impl Default for Upstream {
  fn default() -> Self {
    Self::new()
  }
}

impl Upstream {
  /// Build the forwarder and its client TLS configuration.
  pub fn new() -> Self {
    let provider = CryptoProvider::get_default().cloned().unwrap_or_else(|| {
      Arc::new(tokio_rustls::rustls::crypto::aws_lc_rs::default_provider())
    });
    let verifier = NoVerifier(provider.signature_verification_algorithms);
    let mut config = ClientConfig::builder()
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(verifier))
      .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Self {
      tls: TlsConnector::from(Arc::new(config)),
    }
  }

  /// Send `request` to `host:port`, optionally over TLS, and read the
  /// response. Each exchange uses a fresh connection.
  pub(crate) async fn send(
    &self,
    host: &str,
    port: u16,
    tls: bool,
    request: &RawRequest,
  ) -> Result<RawResponse> {
    let connect_host = remap_host(host).to_string();
    tracing::debug!("dialing {}:{} for {}", connect_host, port, host);
    let stream = TcpStream::connect((connect_host.as_str(), port)).await?;
    if tls {
      let name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::proxy(format!("invalid server name {:?}", host)))?;
      let stream = self.tls.connect(name, stream).await?;
      send_and_read(stream, request).await
    } else {
      send_and_read(stream, request).await
    }
  }
}

async fn send_and_read<S>(mut stream: S, request: &RawRequest) -> Result<RawResponse>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  stream.write_all(&request.for_upstream()).await?;
  stream.flush().await?;
  let mut reader = BufReader::new(stream);
  read_response(&mut reader).await
}

fn wants_close(request: &RawRequest) -> bool {
  if let Some(connection) = header_value(&request.headers, "connection") {
    return connection.eq_ignore_ascii_case("close");
  }
  request.version.eq_ignore_ascii_case("HTTP/1.0")
}

fn split_host_port(host: &str, default_port: u16) -> (String, u16) {
  match host.rsplit_once(':') {
    Some((name, port)) => match port.parse() {
      Ok(port) => (name.to_string(), port),
      Err(_) => (host.to_string(), default_port),
    },
    None => (host.to_string(), default_port),
  }
}

const BAD_GATEWAY: &[u8] =
  b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Run the request/response loop over one (possibly TLS-wrapped) stream.
async fn serve<S>(
  stream: S,
  tls: bool,
  origin: SocketAddr,
  upstream: &Upstream,
  log: &ExchangeLog,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut reader = BufReader::new(stream);
  loop {
    let request = match read_request(&mut reader).await {
      Ok(Some(request)) => request,
      Ok(None) => break,
      Err(e) => {
        tracing::debug!("unparseable request on {}: {}", origin, e);
        break;
      }
    };
    let started = OffsetDateTime::now_utc();
    let clock = Instant::now();
    let host_header = request
      .host()
      .map(str::to_string)
      .unwrap_or_else(|| origin.ip().to_string());
    let (host, port) = split_host_port(&host_header, origin.port());
    let scheme = if tls { "https" } else { "http" };
    let url = if request.target.starts_with("http://") || request.target.starts_with("https://") {
      request.target.clone()
    } else {
      format!("{}://{}{}", scheme, host_header, request.target)
    };
    let close = wants_close(&request);

    let response = match upstream.send(&host, port, tls, &request).await {
      Ok(response) => response,
      Err(e) => {
        tracing::debug!("upstream request for {} failed: {}", url, e);
        reader.get_mut().write_all(BAD_GATEWAY).await?;
        break;
      }
    };

    let writer = reader.get_mut();
    writer.write_all(&response.for_child(close)).await?;
    writer.flush().await?;

    log.publish(HttpExchange {
      method: request.method.clone(),
      url,
      http_version: request.version.clone(),
      status: response.status,
      status_text: response.reason.clone(),
      request_headers: request.headers.clone(),
      response_headers: response.headers.clone(),
      request_body: request.body.clone(),
      response_body: response.body.clone(),
      started,
      duration: clock.elapsed(),
    });

    if close {
      break;
    }
  }
  let mut stream = reader.into_inner();
  if let Err(e) = stream.shutdown().await {
    tracing::debug!("shutting down http session for {}: {}", origin, e);
  }
  Ok(())
}

/// Intercepts plaintext HTTP flows.
pub struct HttpProxy {
  upstream: Arc<Upstream>,
  log: ExchangeLog,
}

impl HttpProxy {
  /// Create a handler forwarding through `upstream` and logging to `log`.
  pub fn new(upstream: Arc<Upstream>, log: ExchangeLog) -> Self {
    Self { upstream, log }
  }
}

#[async_trait]
impl TcpHandler for HttpProxy {
  async fn handle(&self, stream: TcpFlowStream) {
    let origin = stream.local_addr();
    if let Err(e) = serve(stream, false, origin, &self.upstream, &self.log).await {
      tracing::debug!("http flow for {} ended: {}", origin, e);
    }
  }
}

/// Terminates TLS with a minted certificate, then intercepts the inner HTTP.
pub struct HttpsProxy {
  ca: Arc<CertificateAuthority>,
  upstream: Arc<Upstream>,
  log: ExchangeLog,
}

impl HttpsProxy {
  /// Create a handler minting leaves from `ca` and forwarding through
  /// `upstream`.
  pub fn new(ca: Arc<CertificateAuthority>, upstream: Arc<Upstream>, log: ExchangeLog) -> Self {
    Self { ca, upstream, log }
  }

  async fn serve_tls(&self, stream: TcpFlowStream, origin: SocketAddr) -> Result<()> {
    let acceptor =
      LazyConfigAcceptor::new(tokio_rustls::rustls::server::Acceptor::default(), stream);
    let start = acceptor.await?;
    let host = match start.client_hello().server_name() {
      Some(name) => name.to_string(),
      // no SNI: mint for the address the child dialed
      None => origin.ip().to_string(),
    };
    let config = self.ca.server_config(&host)?;
    let tls_stream = start.into_stream(config).await?;
    serve(tls_stream, true, origin, &self.upstream, &self.log).await
  }
}

#[async_trait]
impl TcpHandler for HttpsProxy {
  async fn handle(&self, stream: TcpFlowStream) {
    let origin = stream.local_addr();
    if let Err(e) = self.serve_tls(stream, origin).await {
      tracing::debug!("https flow for {} ended: {}", origin, e);
    }
  }
}

/// Tunnels flows no other handler claimed, byte for byte.
pub struct TcpPassthrough;

#[async_trait]
impl TcpHandler for TcpPassthrough {
  async fn handle(&self, mut stream: TcpFlowStream) {
    let target = remap_addr(stream.local_addr());
    tracing::debug!("tunneling raw TCP to {}", target);
    match TcpStream::connect(target).await {
      Ok(mut upstream) => {
        if let Err(e) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
          tracing::debug!("tunnel to {} ended: {}", target, e);
        }
      }
      Err(e) => {
        tracing::debug!("failed to reach {}: {}", target, e);
        if let Err(e) = stream.close() {
          tracing::debug!("closing unreachable tunnel: {}", e);
        }
      }
    }
  }
}
