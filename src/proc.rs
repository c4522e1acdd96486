//! Worker process lifecycle: fork, privilege drop, signals, reaping.
//!
//! The parent allocates every shared region, forks one child per stage,
//! then detaches from the data-plane regions itself. Children detach
//! from whatever their stage has no business touching before dropping
//! privileges.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{anyhow, bail, Result};
use log::{info, warn};

use crate::keys::KeyCell;
use crate::packet::PacketPool;
use crate::replay::ReplayWindow;
use crate::ring::Ring;
use crate::shm::Shared;
use crate::state::SharedState;

/// Unrecoverable state corruption: log and terminate this process. The
/// supervisor notices the exit and tears the rest of the daemon down.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::exit(1);
    }};
}

/// The pipeline stages. The discriminant doubles as the packet routing
/// tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Stage {
    Clear = 1,
    Crypto = 2,
    Encrypt = 3,
    Decrypt = 4,
    Keying = 5,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Clear,
        Stage::Crypto,
        Stage::Encrypt,
        Stage::Decrypt,
        Stage::Keying,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Clear => "clear",
            Stage::Crypto => "crypto",
            Stage::Encrypt => "encrypt",
            Stage::Decrypt => "decrypt",
            Stage::Keying => "keying",
        }
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.name() == name)
    }
}

/// Every shared resource, handed to each child at fork time. A stage
/// detaches the entries it must not touch and keeps the rest.
#[derive(Clone, Copy)]
pub struct ProcIo {
    pub state: Option<Shared<SharedState>>,
    pub pool: Option<Shared<PacketPool>>,
    pub tx: Option<Shared<KeyCell>>,
    pub rx: Option<Shared<KeyCell>>,
    pub arwin: Option<Shared<ReplayWindow>>,
    /// Decrypted packets on their way to the tunnel device.
    pub clear: Option<Shared<Ring>>,
    /// Sealed packets on their way to the peer.
    pub crypto: Option<Shared<Ring>>,
    /// Plaintext packets awaiting the encrypt stage.
    pub encrypt: Option<Shared<Ring>>,
    /// Sealed packets awaiting the decrypt stage.
    pub decrypt: Option<Shared<Ring>>,
}

/// Unmap a shared region this process does not need.
pub fn detach<T>(slot: &mut Option<Shared<T>>) {
    if let Some(shared) = slot.take() {
        shared.detach();
    }
}

static LAST_SIGNAL: AtomicI32 = AtomicI32::new(-1);

extern "C" fn signal_handler(sig: libc::c_int) {
    LAST_SIGNAL.store(sig, Ordering::Relaxed);
}

/// Route `sig` to the last-signal latch.
pub fn signal_trap(sig: libc::c_int) {
    unsafe {
        libc::signal(sig, signal_handler as *const () as libc::sighandler_t);
    }
}

pub fn signal_ignore(sig: libc::c_int) {
    unsafe {
        libc::signal(sig, libc::SIG_IGN);
    }
}

/// Take the most recently received trapped signal, if any.
pub fn last_signal() -> Option<i32> {
    let sig = LAST_SIGNAL.swap(-1, Ordering::Relaxed);
    (sig != -1).then_some(sig)
}

/// Wait up to `timeout_ms` for `fd` to become readable. A negative
/// timeout blocks until readable or interrupted.
pub fn wait_readable(fd: RawFd, timeout_ms: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if n == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return false;
        }
        crate::fatal!("poll: {}", err);
    }

    n > 0 && pfd.revents & libc::POLLIN != 0
}

/// Pause between idle sweeps. The high-performance build spins instead
/// of sleeping.
pub fn idle_pause() {
    #[cfg(feature = "high-performance")]
    std::hint::spin_loop();
    #[cfg(not(feature = "high-performance"))]
    std::thread::sleep(std::time::Duration::from_micros(500));
}

/// Credentials a stage drops to after acquiring its resources.
#[derive(Debug, Clone, Copy)]
pub struct RunAs {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

/// Resolve a user name through the password database.
pub fn lookup_user(name: &str) -> Result<RunAs> {
    let cname = CString::new(name).map_err(|_| anyhow!("user name '{}' contains NUL", name))?;
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        bail!("user '{}' not found", name);
    }
    let pw = unsafe { &*pw };
    Ok(RunAs {
        uid: pw.pw_uid,
        gid: pw.pw_gid,
    })
}

/// Drop this process to the configured credentials. Called by each stage
/// once its privileged setup (tun device, sockets, shared maps) is done.
pub fn drop_privileges(runas: Option<RunAs>) {
    let Some(run) = runas else {
        return;
    };

    let ok = unsafe {
        libc::setgroups(1, &run.gid) == 0
            && libc::setgid(run.gid) == 0
            && libc::setegid(run.gid) == 0
            && libc::setuid(run.uid) == 0
            && libc::seteuid(run.uid) == 0
    };
    if !ok {
        crate::fatal!(
            "failed to drop privileges to uid={} gid={}: {}",
            run.uid,
            run.gid,
            std::io::Error::last_os_error()
        );
    }
}

struct Proc {
    pid: libc::pid_t,
    stage: Stage,
}

/// The supervisor's view of its children.
#[derive(Default)]
pub struct ProcTable {
    procs: Vec<Proc>,
}

impl ProcTable {
    /// Fork a worker. The child runs `entry` and exits 0 when it
    /// returns; `entry` never comes back to the caller.
    pub fn spawn(&mut self, stage: Stage, entry: impl FnOnce()) -> Result<()> {
        match unsafe { libc::fork() } {
            -1 => bail!(
                "fork for {} failed: {}",
                stage.name(),
                std::io::Error::last_os_error()
            ),
            0 => {
                entry();
                std::process::exit(0);
            }
            pid => {
                info!("started {} (pid={})", stage.name(), pid);
                self.procs.push(Proc { pid, stage });
                Ok(())
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    /// Collect exited children without blocking. Returns true when any
    /// child exited abnormally.
    pub fn reap(&mut self) -> bool {
        let mut failed = false;

        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            match pid {
                -1 => {
                    let err = std::io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::ECHILD) => break,
                        Some(libc::EINTR) => continue,
                        _ => crate::fatal!("waitpid: {}", err),
                    }
                }
                0 => break,
                pid => {
                    if let Some(pos) = self.procs.iter().position(|p| p.pid == pid) {
                        let proc = self.procs.remove(pos);
                        let clean = libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0;
                        if clean {
                            info!("{} exited", proc.stage.name());
                        } else {
                            warn!("{} exited abnormally (status={})", proc.stage.name(), status);
                            failed = true;
                        }
                    }
                }
            }
        }

        failed
    }

    pub fn killall(&self, sig: libc::c_int) {
        for proc in &self.procs {
            if unsafe { libc::kill(proc.pid, sig) } == -1 {
                warn!(
                    "failed to signal {} (pid={}): {}",
                    proc.stage.name(),
                    proc.pid,
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    /// Ask every worker to finish its sweep and exit, then collect them.
    /// Returns true when any worker went down abnormally.
    pub fn shutdown(&mut self) -> bool {
        self.killall(libc::SIGQUIT);

        let mut failed = false;
        while !self.is_empty() {
            failed |= self.reap();
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        failed
    }
}
