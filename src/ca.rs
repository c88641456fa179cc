//! Certificate authority management.
//!
//! Each run mints a fresh root CA that the child process is trust-anchored
//! to through its environment, plus per-host leaf certificates used to
//! terminate the child's TLS sessions.

use crate::errors::{Error, Result};
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Leaf certificate validity period in seconds (1 year).
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamps to absorb clock skew (60 seconds).
const NOT_BEFORE_OFFSET: i64 = 60;

/// Every name the leaf should answer for. The dNSName entry is always
/// present, including for IP literals, since clients disagree on whether an
/// IP target is matched against the iPAddress or the textual name.
fn subject_alt_names(host: &str) -> Result<Vec<SanType>> {
  let mut sans = Vec::new();
  if let Ok(ip) = host.parse::<IpAddr>() {
    sans.push(SanType::IpAddress(ip));
  }
  if let Ok(name) = host.try_into() {
    sans.push(SanType::DnsName(name));
  }
  if sans.is_empty() {
    return Err(Error::certificate(format!(
      "no usable subject names for {:?}",
      host
    )));
  }
  Ok(sans)
}

/// The trust-store files written for the child process.
pub struct TrustStore {
  /// Directory holding the bundle files; also exported as the cert dir.
  pub dir: PathBuf,
  /// Path of the `ca-certificates.crt` bundle.
  pub bundle: PathBuf,
}

impl TrustStore {
  /// Environment variables that point common TLS stacks at the bundle.
  pub fn child_env(&self) -> Vec<(String, String)> {
    let bundle = self.bundle.to_string_lossy().to_string();
    vec![
      ("CURL_CA_BUNDLE".to_string(), bundle.clone()),
      ("REQUESTS_CA_BUNDLE".to_string(), bundle.clone()),
      ("SSL_CERT_FILE".to_string(), bundle.clone()),
      ("SSL_CERT_DIR".to_string(), self.dir.to_string_lossy().to_string()),
      // deno and bun do not read SSL_CERT_FILE
      ("DENO_CERT".to_string(), bundle.clone()),
      ("NODE_EXTRA_CA_CERTS".to_string(), bundle),
    ]
  }
}

/// A freshly minted root CA and a cache of leaf server configurations.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_pem: String,
  ca_cert_der: CertificateDer<'static>,
  server_configs: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateAuthority {
  /// Generate a new root CA. Nothing is persisted; the CA lives and dies
  /// with the run.
  pub fn generate() -> Result<Self> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "webtap root CA");
    dn.push(DnType::OrganizationName, "webtap");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate CA key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("failed to self-sign CA: {}", e)))?;

    let ca_cert_pem = cert.pem();
    let ca_cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::new(params, key_pair);

    Ok(Self {
      issuer,
      ca_cert_pem,
      ca_cert_der,
      server_configs: Mutex::new(HashMap::new()),
    })
  }

  /// The root certificate in PEM format.
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Write the root certificate under the common bundle names inside `dir`.
  pub fn write_trust_store(&self, dir: &Path) -> Result<TrustStore> {
    std::fs::create_dir_all(dir)?;
    let bundle = dir.join("ca-certificates.crt");
    std::fs::write(&bundle, self.ca_cert_pem.as_bytes())?;
    // some stacks look for the alternate name
    std::fs::write(dir.join("ca-bundle.crt"), self.ca_cert_pem.as_bytes())?;
    tracing::debug!("wrote CA bundle to {}", bundle.display());
    Ok(TrustStore {
      dir: dir.to_path_buf(),
      bundle,
    })
  }

  /// Mint a leaf certificate for `host` signed by this CA.
  fn generate_server_cert(
    &self,
    host: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();
    params.subject_alt_names = subject_alt_names(host)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    // fresh serial per leaf so reissued certificates never collide in
    // client caches
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate leaf key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {}: {}", host, e)))?;
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;

    let chain = vec![
      CertificateDer::from(cert.der().to_vec()),
      self.ca_cert_der.clone(),
    ];
    Ok((chain, key_der))
  }

  /// A rustls server configuration presenting a leaf for `host`, cached per
  /// host name.
  pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
    {
      let cache = self
        .server_configs
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
      if let Some(config) = cache.get(host) {
        return Ok(config.clone());
      }
    }

    let (chain, key) = self.generate_server_cert(host)?;
    let mut config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let config = Arc::new(config);

    self
      .server_configs
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .insert(host.to_string(), config.clone());
    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ca_generates_and_exports_pem() {
    let ca = CertificateAuthority::generate().unwrap();
    assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
  }

  #[test]
  fn server_configs_are_cached_per_host() {
    let ca = CertificateAuthority::generate().unwrap();
    let first = ca.server_config("example.com").unwrap();
    let second = ca.server_config("example.com").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    let other = ca.server_config("10.1.1.1").unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
  }

  #[test]
  fn trust_store_env_points_at_bundle() {
    let ca = CertificateAuthority::generate().unwrap();
    let dir = std::env::temp_dir().join(format!("webtap-ca-test-{}", std::process::id()));
    let store = ca.write_trust_store(&dir).unwrap();
    let env = store.child_env();
    assert!(env.iter().any(|(k, v)| k == "SSL_CERT_FILE" && v.ends_with("ca-certificates.crt")));
    assert!(env.iter().any(|(k, _)| k == "NODE_EXTRA_CA_CERTS"));
    std::fs::remove_dir_all(&dir).ok();
  }
}
