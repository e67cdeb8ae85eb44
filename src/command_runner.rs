//! External command execution
//!
//! All process spawning in botstrap goes through a [`CommandRunner`]. Steps
//! describe *what* to run with a [`CommandSpec`] and interpret the result;
//! the runner only launches, waits, and classifies:
//!
//! | Situation                     | Result                              |
//! |-------------------------------|-------------------------------------|
//! | exit status 0                 | `Ok(CommandOutput)`                 |
//! | nonzero exit / killed by signal | `Err(ProvisionError::CommandFailed)` |
//! | executable missing            | `Err(ProvisionError::NotFound)`     |
//! | not executable / no privilege | `Err(ProvisionError::PermissionDenied)` |
//! | time limit exceeded           | `Err(ProvisionError::Timeout)`      |
//!
//! The runner never looks inside stdout; that is the step's job.
//!
//! Each command leads its own process group. Once the leader exits, or
//! times out, the rest of the group is terminated as well, so a background
//! helper holding the output pipes cannot stretch a run past its timeout.

use crate::error::{ProvisionError, Result};
use crate::process_guard::{self, CommandProcessGroup, TIMEOUT_GRACE};
use std::ffi::OsString;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Bytes of stdout/stderr kept per stream; the rest is drained and dropped.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// How long to wait for output once the command has exited or timed out
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// A fully described command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment variables for the child
    pub env: Vec<(String, String)>,
    /// PATH override (normally taken from the engine's environment snapshot)
    pub path: Option<OsString>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            path: None,
            cwd: None,
            timeout,
        }
    }

    pub fn with_path(mut self, path: OsString) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Output of a command that exited with status 0
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Last non-empty line of stdout, falling back to stderr. Useful as a
    /// one-line detail (`Python 3.12.1`, `Created symlink ...`).
    pub fn summary(&self) -> &str {
        [&self.stdout, &self.stderr]
            .into_iter()
            .filter_map(|s| s.lines().rev().find(|l| !l.trim().is_empty()))
            .map(str::trim)
            .next()
            .unwrap_or("")
    }
}

/// Executes external commands
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs real processes, each in its own process group
#[derive(Debug, Clone)]
pub struct SystemRunner {
    output_limit_bytes: usize,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self {
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        if spec.timeout.is_zero() {
            return Err(ProvisionError::validation(format!(
                "timeout for `{}` must be positive",
                spec.program
            )));
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();
        if let Some(path) = &spec.path {
            cmd.env("PATH", path);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        info!(command = %spec, timeout_secs = spec.timeout.as_secs(), "running command");
        let mut child = cmd
            .spawn()
            .map_err(|e| ProvisionError::from_io(e, &spec.program))?;
        let pid = child.id();
        process_guard::track(pid);

        let deadline = Instant::now() + spec.timeout;
        let limit = self.output_limit_bytes;
        let (tx, rx) = mpsc::channel();
        spawn_reader(Stream::Stdout, child.stdout.take(), limit, tx.clone());
        spawn_reader(Stream::Stderr, child.stderr.take(), limit, tx);

        let waited = child.wait_timeout(spec.timeout);
        let status = match waited {
            Ok(Some(status)) => {
                // the leader is gone; anything it left in the group goes too
                process_guard::terminate_group(pid, TIMEOUT_GRACE);
                Some(status)
            }
            Ok(None) => {
                warn!(command = %spec, "command timed out, terminating process group");
                process_guard::terminate_group(pid, TIMEOUT_GRACE);
                let _ = child.kill();
                let _ = child.wait();
                None
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                process_guard::kill_group(pid);
                process_guard::untrack(pid);
                return Err(e.into());
            }
        };

        let drain_until = deadline.max(Instant::now() + OUTPUT_DRAIN);
        let (stdout, stderr) = collect_output(&rx, pid, drain_until);
        process_guard::untrack(pid);

        let Some(status) = status else {
            return Err(ProvisionError::Timeout {
                program: spec.program.clone(),
                timeout: spec.timeout,
            });
        };

        debug!(command = %spec, exit_code = ?status.code(), "command finished");
        if status.success() {
            Ok(CommandOutput {
                exit_code: status.code(),
                stdout,
                stderr,
            })
        } else {
            Err(ProvisionError::CommandFailed {
                program: spec.program.clone(),
                code: status.code(),
                stderr,
            })
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: Stream,
    pipe: Option<R>,
    limit: usize,
    tx: Sender<(Stream, String)>,
) {
    thread::spawn(move || {
        // the receiver may have given up on us already
        let _ = tx.send((stream, read_limited(pipe, limit)));
    });
}

/// Wait for both reader threads until `deadline`. A descendant that still
/// holds a pipe open at that point is killed along with its whole group.
fn collect_output(
    rx: &Receiver<(Stream, String)>,
    pgid: u32,
    mut deadline: Instant,
) -> (String, String) {
    let mut stdout = None;
    let mut stderr = None;
    let mut killed = false;
    while stdout.is_none() || stderr.is_none() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((Stream::Stdout, text)) => stdout = Some(text),
            Ok((Stream::Stderr, text)) => stderr = Some(text),
            Err(RecvTimeoutError::Timeout) if !killed => {
                warn!(pgid, "output pipes still open, killing process group");
                process_guard::kill_group(pgid);
                killed = true;
                deadline = Instant::now() + OUTPUT_DRAIN;
            }
            Err(_) => break,
        }
    }
    (stdout.unwrap_or_default(), stderr.unwrap_or_default())
}

fn read_limited<R: Read>(stream: Option<R>, limit: usize) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut buf = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let room = limit.saturating_sub(buf.len());
        let keep = n.min(room);
        buf.extend_from_slice(&chunk[..keep]);
        dropped += n - keep;
    }
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if dropped > 0 {
        text.push_str(&format!("\n[truncated {} bytes]\n", dropped));
    }
    text
}

/// Logs commands instead of running them. Every command "succeeds" with
/// empty output.
#[derive(Debug, Clone, Default)]
pub struct DryRunRunner;

impl CommandRunner for DryRunRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        info!(command = %spec, "[dry-run] skipped");
        Ok(CommandOutput {
            exit_code: Some(0),
            ..CommandOutput::default()
        })
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use scripted::{Reply, ScriptedRunner};

#[cfg(any(test, feature = "test-support"))]
mod scripted {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};

    /// Canned response for [`ScriptedRunner`]
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Reply {
        Ok(String),
        Exit(i32, String),
        NotFound,
        PermissionDenied,
        Timeout,
    }

    impl Reply {
        fn into_result(self, spec: &CommandSpec) -> Result<CommandOutput> {
            match self {
                Reply::Ok(stdout) => Ok(CommandOutput {
                    exit_code: Some(0),
                    stdout,
                    stderr: String::new(),
                }),
                Reply::Exit(code, stderr) => Err(ProvisionError::CommandFailed {
                    program: spec.program.clone(),
                    code: Some(code),
                    stderr,
                }),
                Reply::NotFound => Err(ProvisionError::not_found(spec.program.clone())),
                Reply::PermissionDenied => {
                    Err(ProvisionError::permission_denied(spec.program.clone()))
                }
                Reply::Timeout => Err(ProvisionError::Timeout {
                    program: spec.program.clone(),
                    timeout: spec.timeout,
                }),
            }
        }
    }

    /// Test runner returning queued replies keyed by program name.
    ///
    /// Once a program's queue is down to one reply, that reply repeats.
    /// Programs with no queue answer with the default reply
    /// (`Reply::Ok("")` unless changed).
    #[derive(Debug)]
    pub struct ScriptedRunner {
        replies: RefCell<HashMap<String, VecDeque<Reply>>>,
        default: Reply,
        calls: RefCell<Vec<CommandSpec>>,
    }

    impl Default for ScriptedRunner {
        fn default() -> Self {
            Self {
                replies: RefCell::default(),
                default: Reply::Ok(String::new()),
                calls: RefCell::default(),
            }
        }
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_default(mut self, reply: Reply) -> Self {
            self.default = reply;
            self
        }

        /// Queue `reply` for the next call to `program`
        pub fn reply(self, program: &str, reply: Reply) -> Self {
            self.replies
                .borrow_mut()
                .entry(program.to_string())
                .or_default()
                .push_back(reply);
            self
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.borrow().clone()
        }

        /// Number of calls whose program and first argument match
        pub fn count(&self, program: &str, first_arg: Option<&str>) -> usize {
            self.calls
                .borrow()
                .iter()
                .filter(|c| c.program == program)
                .filter(|c| first_arg.is_none_or(|a| c.args.first().map(String::as_str) == Some(a)))
                .count()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls.borrow_mut().push(spec.clone());
            let reply = {
                let mut replies = self.replies.borrow_mut();
                match replies.get_mut(&spec.program) {
                    Some(queue) if queue.len() > 1 => queue.pop_front(),
                    Some(queue) => queue.front().cloned(),
                    None => None,
                }
            };
            reply.unwrap_or_else(|| self.default.clone()).into_result(spec)
        }
    }
}
