//! Environment isolation: namespaces, the TUN device, and the child process.
//!
//! The process enters a user namespace while it is still single-threaded.
//! The network (and mount) namespaces are then confined to one dedicated OS
//! thread: that thread creates and configures the TUN device, bind-mounts
//! the replacement `resolv.conf`, and spawns the child command so it inherits
//! the isolated view. Every other thread, in particular the tokio workers
//! that dial upstream servers, stays in the host's namespaces.

use crate::errors::{Error, Result};
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use std::fs::File;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{Child, Command};
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Everything needed to build the isolated environment and start the child.
pub struct IsolationConfig {
  /// Name of the TUN device to create.
  pub tun_name: String,
  /// Address (CIDR) the child's interface will carry, e.g. `10.1.1.100/24`.
  pub subnet: String,
  /// Gateway address this tool impersonates; also the child's nameserver.
  pub gateway: Ipv4Addr,
  /// Run the child as this user (name or numeric id).
  pub user: Option<String>,
  /// Whether to bind-mount a replacement `/etc/resolv.conf`.
  pub overlay_resolv: bool,
  /// Scratch directory for generated files.
  pub scratch_dir: PathBuf,
  /// Extra environment for the child (trust-store exports).
  pub env: Vec<(String, String)>,
  /// The command to run.
  pub command: Vec<String>,
}

/// Move the whole process into a new user namespace, mapped to root.
///
/// Must be called while the process is still single-threaded; the kernel
/// refuses `CLONE_NEWUSER` otherwise.
pub fn enter_user_namespace() -> Result<()> {
  let uid = nix::unistd::Uid::current();
  let gid = nix::unistd::Gid::current();
  unshare(CloneFlags::CLONE_NEWUSER)
    .map_err(|e| Error::isolation(format!("failed to create user namespace: {}", e)))?;
  std::fs::write("/proc/self/uid_map", format!("0 {} 1\n", uid))?;
  std::fs::write("/proc/self/setgroups", "deny")?;
  std::fs::write("/proc/self/gid_map", format!("0 {} 1\n", gid))?;
  tracing::debug!("entered user namespace as uid 0 (outer uid {})", uid);
  Ok(())
}

/// Build the isolated environment on a dedicated thread and spawn the child
/// inside it. Returns the TUN device file (usable from any thread; wrap it
/// in a [`TunDevice`] once a runtime exists) and the child.
pub fn launch(config: IsolationConfig) -> Result<(File, Child)> {
  let (tx, rx) = std::sync::mpsc::channel();
  std::thread::Builder::new()
    .name("webtap-netns".to_string())
    .spawn(move || {
      let _ = tx.send(setup_and_spawn(&config));
    })
    .map_err(|e| Error::isolation(format!("failed to spawn namespace thread: {}", e)))?;
  rx.recv()
    .map_err(|_| Error::isolation("namespace thread exited without a result"))?
}

/// Runs on the namespace thread.
fn setup_and_spawn(config: &IsolationConfig) -> Result<(File, Child)> {
  let mut flags = CloneFlags::CLONE_NEWNET;
  if config.overlay_resolv {
    flags |= CloneFlags::CLONE_NEWNS;
  }
  unshare(flags).map_err(|e| Error::isolation(format!("failed to unshare namespaces: {}", e)))?;

  let tun = open_tun(&config.tun_name)?;
  configure_links(config)?;
  if config.overlay_resolv {
    overlay_resolv_conf(&config.scratch_dir, config.gateway)?;
  }
  let child = spawn_child(config)?;
  Ok((tun, child))
}

#[repr(C)]
struct IfReq {
  ifr_name: [libc::c_char; libc::IFNAMSIZ],
  ifr_flags: libc::c_short,
  _pad: [u8; 22],
}

/// Open `/dev/net/tun` and attach it to a new non-blocking TUN interface.
fn open_tun(name: &str) -> Result<File> {
  if name.len() >= libc::IFNAMSIZ {
    return Err(Error::isolation(format!("tun device name {:?} is too long", name)));
  }
  let fd = unsafe {
    libc::open(
      c"/dev/net/tun".as_ptr(),
      libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
    )
  };
  if fd < 0 {
    return Err(std::io::Error::last_os_error().into());
  }
  // from_raw_fd takes ownership, so the fd is closed on any error below
  let file = unsafe { File::from_raw_fd(fd) };

  let mut req = IfReq {
    ifr_name: [0; libc::IFNAMSIZ],
    ifr_flags: IFF_TUN | IFF_NO_PI,
    _pad: [0; 22],
  };
  for (dst, src) in req.ifr_name.iter_mut().zip(name.bytes()) {
    *dst = src as libc::c_char;
  }
  let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &req as *const IfReq) };
  if rc < 0 {
    return Err(std::io::Error::last_os_error().into());
  }
  tracing::debug!("created tun device {}", name);
  Ok(file)
}

fn run_ip(args: &[&str]) -> Result<()> {
  let status = Command::new("ip")
    .args(args)
    .status()
    .map_err(|e| Error::isolation(format!("failed to run ip {}: {}", args.join(" "), e)))?;
  if !status.success() {
    return Err(Error::isolation(format!(
      "ip {} exited with {}",
      args.join(" "),
      status
    )));
  }
  Ok(())
}

/// Bring the links up, assign the subnet address and route everything at us.
fn configure_links(config: &IsolationConfig) -> Result<()> {
  run_ip(&["link", "set", "lo", "up"])?;
  run_ip(&["link", "set", &config.tun_name, "up"])?;
  run_ip(&["addr", "add", &config.subnet, "dev", &config.tun_name])?;
  run_ip(&[
    "route",
    "add",
    "default",
    "via",
    &config.gateway.to_string(),
    "dev",
    &config.tun_name,
  ])?;
  Ok(())
}

/// Point the child's resolver at the gateway without touching the host's
/// `/etc/resolv.conf`. Requires the mount namespace entered above.
fn overlay_resolv_conf(scratch_dir: &Path, gateway: Ipv4Addr) -> Result<()> {
  // keep our mounts out of the host namespace
  mount(
    None::<&str>,
    "/",
    None::<&str>,
    MsFlags::MS_REC | MsFlags::MS_PRIVATE,
    None::<&str>,
  )
  .map_err(|e| Error::isolation(format!("failed to make mounts private: {}", e)))?;

  let replacement = scratch_dir.join("resolv.conf");
  std::fs::write(&replacement, format!("nameserver {}\n", gateway))?;
  mount(
    Some(replacement.as_path()),
    "/etc/resolv.conf",
    None::<&str>,
    MsFlags::MS_BIND,
    None::<&str>,
  )
  .map_err(|e| Error::isolation(format!("failed to overlay /etc/resolv.conf: {}", e)))?;
  tracing::debug!("overlaid /etc/resolv.conf with nameserver {}", gateway);
  Ok(())
}

/// Spawn the child command; it inherits this thread's namespaces.
fn spawn_child(config: &IsolationConfig) -> Result<Child> {
  let Some((program, args)) = config.command.split_first() else {
    return Err(Error::isolation("no command to run"));
  };
  let mut cmd = Command::new(program);
  cmd.args(args);
  cmd.env("WEBTAP", "1");
  cmd.env("PS1", "WEBTAP # ");
  for (key, value) in &config.env {
    cmd.env(key, value);
  }
  if let Some(user) = &config.user {
    let looked_up = nix::unistd::User::from_name(user)
      .map_err(|e| Error::isolation(format!("failed to look up user {:?}: {}", user, e)))?
      .ok_or_else(|| Error::isolation(format!("no such user {:?}", user)))?;
    cmd.uid(looked_up.uid.as_raw());
    cmd.gid(looked_up.gid.as_raw());
  }
  cmd
    .spawn()
    .map_err(|e| Error::isolation(format!("failed to start {:?}: {}", program, e)))
}

/// The TUN device as an async duplex link. Reads yield one IP frame each;
/// writes accept one frame each.
pub struct TunDevice {
  inner: AsyncFd<File>,
}

impl TunDevice {
  /// Register the (non-blocking) device file with the runtime's reactor.
  pub fn new(file: File) -> Result<Self> {
    Ok(Self {
      inner: AsyncFd::new(file)?,
    })
  }
}

impl AsyncRead for TunDevice {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    loop {
      let mut guard = ready!(self.inner.poll_read_ready(cx))?;
      let unfilled = buf.initialize_unfilled();
      match guard.try_io(|inner| (&*inner.get_ref()).read(unfilled)) {
        Ok(Ok(n)) => {
          buf.advance(n);
          return Poll::Ready(Ok(()));
        }
        Ok(Err(e)) => return Poll::Ready(Err(e)),
        Err(_would_block) => continue,
      }
    }
  }
}

impl AsyncWrite for TunDevice {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    loop {
      let mut guard = ready!(self.inner.poll_write_ready(cx))?;
      match guard.try_io(|inner| (&*inner.get_ref()).write(buf)) {
        Ok(result) => return Poll::Ready(result),
        Err(_would_block) => continue,
      }
    }
  }

  fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Poll::Ready(Ok(()))
  }

  fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Poll::Ready(Ok(()))
  }
}
