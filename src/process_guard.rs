//! Child process lifecycle for the command runner
//!
//! Every command spawned by [`SystemRunner`](crate::command_runner::SystemRunner)
//! is placed in its own process group and registered here while it runs.
//! That gives two guarantees:
//!
//! - a command that exceeds its timeout is stopped together with anything it
//!   forked (`apt-get` spawning `dpkg`, an installer spawning helpers)
//! - a SIGINT/SIGTERM/SIGHUP delivered to botstrap does not leave a package
//!   manager running unattended in the background
//!
//! Termination is SIGTERM to the whole group, a grace period, then SIGKILL.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL when a command times out
pub const TIMEOUT_GRACE: Duration = Duration::from_secs(2);

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Process-group leaders currently owned by the runner
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    shutting_down: bool,
}

impl ChildRegistry {
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!(pid, "registered child process group");
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!(pid, "unregistered child process group");
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Terminate every registered group. Only the first call does anything.
    pub fn terminate_all(&mut self, grace: Duration) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        if self.pids.is_empty() {
            return;
        }

        info!(count = self.pids.len(), "terminating running commands");
        for pid in self.pids.drain() {
            terminate_group(pid, grace);
        }
    }
}

/// Register `pid` with the global registry, tolerating a poisoned lock
pub(crate) fn track(pid: u32) {
    let registry = ChildRegistry::global();
    let mut guard = registry.lock().unwrap_or_else(|p| p.into_inner());
    guard.register(pid);
}

pub(crate) fn untrack(pid: u32) {
    let registry = ChildRegistry::global();
    let mut guard = registry.lock().unwrap_or_else(|p| p.into_inner());
    guard.unregister(pid);
}

#[cfg(unix)]
mod imp {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    fn signal_group(pgid: u32, sig: Signal) -> nix::Result<()> {
        signal::kill(Pid::from_raw(-(pgid as i32)), sig)
    }

    fn signal_pid(pid: u32, sig: Signal) -> nix::Result<()> {
        signal::kill(Pid::from_raw(pid as i32), sig)
    }

    /// True while the process exists and is not a zombie
    pub(crate) fn is_alive(pid: u32) -> bool {
        if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            // state is the field after the parenthesised command name
            Ok(stat) => match stat.rsplit_once(')') {
                Some((_, rest)) => !matches!(rest.split_whitespace().next(), Some("Z" | "X")),
                None => true,
            },
            Err(_) => true,
        }
    }

    pub fn terminate_group(pgid: u32, grace: Duration) {
        if let Err(e) = signal_group(pgid, Signal::SIGTERM) {
            debug!(pgid, error = %e, "group SIGTERM failed, signalling leader");
            if signal_pid(pgid, Signal::SIGTERM).is_err() {
                return;
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            if !is_alive(pgid) {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        warn!(pgid, "process group ignored SIGTERM, sending SIGKILL");
        if signal_group(pgid, Signal::SIGKILL).is_err() {
            let _ = signal_pid(pgid, Signal::SIGKILL);
        }
    }

    /// SIGKILL every remaining member of the group, without a grace period
    pub fn kill_group(pgid: u32) {
        if let Err(e) = signal_group(pgid, Signal::SIGKILL) {
            debug!(pgid, error = %e, "group SIGKILL failed");
        }
    }

    /// Install handlers that tear down running commands on SIGINT, SIGTERM
    /// and SIGHUP, then exit with `128 + signal`.
    pub fn init_signal_handlers() -> std::io::Result<()> {
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        std::thread::spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!(signal = sig, "received signal, stopping running commands");
                let registry = ChildRegistry::global();
                let mut guard = registry.lock().unwrap_or_else(|p| p.into_inner());
                guard.terminate_all(TIMEOUT_GRACE);
                std::process::exit(128 + sig);
            }
        });
        Ok(())
    }

    impl CommandProcessGroup for std::process::Command {
        fn in_new_process_group(&mut self) -> &mut Self {
            use std::os::unix::process::CommandExt;
            // PGID = child PID, so the group can be signalled as a unit
            self.process_group(0);
            #[cfg(target_os = "linux")]
            unsafe {
                self.pre_exec(|| {
                    if nix::libc::prctl(nix::libc::PR_SET_PDEATHSIG, nix::libc::SIGTERM) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            self
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    // The runner kills the direct child itself; there are no groups to reap.
    pub fn terminate_group(_pgid: u32, _grace: Duration) {}

    pub fn kill_group(_pgid: u32) {}

    pub fn init_signal_handlers() -> std::io::Result<()> {
        Ok(())
    }

    impl CommandProcessGroup for std::process::Command {
        fn in_new_process_group(&mut self) -> &mut Self {
            self
        }
    }
}

pub use imp::{init_signal_handlers, kill_group, terminate_group};

/// Extension trait for `std::process::Command`
pub trait CommandProcessGroup {
    /// Run the command as leader of a new process group
    fn in_new_process_group(&mut self) -> &mut Self;
}
