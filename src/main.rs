//! The `webtap` binary: argument parsing, environment setup, and wiring of
//! the datapath to the proxy handlers.

use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use webtap::ca::CertificateAuthority;
use webtap::dns::DnsProxy;
use webtap::netns::{self, IsolationConfig, TunDevice};
use webtap::proxy::{HttpProxy, HttpsProxy, TcpPassthrough, Upstream};
use webtap::report::{self, ExchangeLog, PrintOptions};
use webtap::{har, Mux, NetStack, Result};

/// Run a command and intercept its HTTP(S) traffic.
#[derive(Parser)]
#[command(name = "webtap", version, about)]
struct Args {
  /// print every packet and state transition
  #[arg(short, long, env = "WEBTAP_VERBOSE")]
  verbose: bool,
  /// log to standard error (default is standard out)
  #[arg(long, env = "WEBTAP_LOG_TO_STDERR")]
  stderr: bool,
  /// name of the TUN device that will be created
  #[arg(long, default_value = "webtap")]
  tun: String,
  /// IP address of the network interface that the subprocess will see
  #[arg(long, default_value = "10.1.1.100/24")]
  subnet: String,
  /// IP address of the gateway that intercepts and proxies network packets
  #[arg(long, default_value = "10.1.1.1")]
  gateway: Ipv4Addr,
  /// run the command as this user (username or id)
  #[arg(long)]
  user: Option<String>,
  /// do not overlay /etc/resolv.conf inside the namespace
  #[arg(long = "no-overlay", env = "WEBTAP_NO_OVERLAY")]
  no_overlay: bool,
  /// path to dump a HAR capture to
  #[arg(long = "dump-har", env = "WEBTAP_DUMP_HAR")]
  dump_har: Option<PathBuf>,
  /// TCP ports to intercept HTTP traffic on
  #[arg(long = "http", default_values_t = vec![80u16])]
  http_ports: Vec<u16>,
  /// TCP ports to intercept HTTPS traffic on
  #[arg(long = "https", default_values_t = vec![443u16])]
  https_ports: Vec<u16>,
  /// include HTTP headers in terminal output
  #[arg(long)]
  head: bool,
  /// include HTTP payloads in terminal output
  #[arg(long)]
  body: bool,
  /// the command to run (defaults to /bin/sh)
  #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
  command: Vec<String>,
}

fn main() -> ExitCode {
  match run() {
    Ok(code) => code,
    Err(e) => {
      tracing::error!("{}", e);
      eprintln!("webtap: {}", e);
      ExitCode::FAILURE
    }
  }
}

fn run() -> Result<ExitCode> {
  let args = Args::parse();

  let default_level = if args.verbose { "webtap=debug" } else { "webtap=info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
  if args.stderr {
    builder.with_writer(std::io::stderr).init();
  } else {
    builder.init();
  }

  // while we are still single-threaded: become root inside a user namespace
  netns::enter_user_namespace()?;

  let ca = CertificateAuthority::generate()?;
  let scratch_dir = std::env::temp_dir().join(format!("webtap-{}", std::process::id()));
  let trust_store = ca.write_trust_store(&scratch_dir)?;

  let command = if args.command.is_empty() {
    vec!["/bin/sh".to_string()]
  } else {
    args.command.clone()
  };
  tracing::info!("running {} inside the intercepted environment", command.join(" "));

  // the namespace thread creates the TUN device and starts the child in the
  // isolated environment; our own worker threads keep the host's view
  let (tun_file, child) = netns::launch(IsolationConfig {
    tun_name: args.tun.clone(),
    subnet: args.subnet.clone(),
    gateway: args.gateway,
    user: args.user.clone(),
    overlay_resolv: !args.no_overlay,
    scratch_dir: scratch_dir.clone(),
    env: trust_store.child_env(),
    command,
  })?;

  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()?;
  let code = runtime.block_on(intercept(&args, ca, tun_file, child))?;

  std::fs::remove_dir_all(&scratch_dir).ok();
  Ok(code)
}

async fn intercept(
  args: &Args,
  ca: CertificateAuthority,
  tun_file: std::fs::File,
  child: std::process::Child,
) -> Result<ExitCode> {
  let device = TunDevice::new(tun_file)?;
  let ca = Arc::new(ca);
  let upstream = Arc::new(Upstream::new());
  let log = ExchangeLog::new();

  tokio::spawn(report::print_exchanges(
    log.subscribe(),
    PrintOptions {
      head: args.head,
      body: args.body,
    },
  ));

  let har_entries = args.dump_har.as_ref().map(|_| {
    let sink = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(har::collect(log.subscribe(), sink.clone()));
    sink
  });

  let mut mux = Mux::new();
  mux.handle_udp(":53", DnsProxy::new()?)?;
  for port in &args.http_ports {
    mux.handle_tcp(
      &format!(":{}", port),
      HttpProxy::new(upstream.clone(), log.clone()),
    )?;
  }
  for port in &args.https_ports {
    mux.handle_tcp(
      &format!(":{}", port),
      HttpsProxy::new(ca.clone(), upstream.clone(), log.clone()),
    )?;
  }
  mux.handle_tcp("*", TcpPassthrough)?;

  let stack = NetStack::new(Arc::new(mux));
  tokio::spawn(async move {
    if let Err(e) = stack.run(device).await {
      tracing::error!("datapath stopped: {}", e);
    }
  });

  let status = tokio::task::spawn_blocking(move || {
    let mut child = child;
    child.wait()
  })
  .await
  .map_err(|e| webtap::Error::Isolation(format!("failed to join child waiter: {}", e)))??;

  if let (Some(path), Some(entries)) = (&args.dump_har, &har_entries) {
    let entries = entries
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    har::write(path, &entries)?;
    tracing::info!("wrote {} HAR entries to {}", entries.len(), path.display());
  }

  let code = status.code().unwrap_or(1);
  Ok(ExitCode::from(code.clamp(0, 255) as u8))
}
