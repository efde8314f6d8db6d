//! External command boundary.
//!
//! Every interaction with an OS supervisor goes through [`CommandRunner`], so
//! adapters can be exercised against a scripted double instead of a live
//! launchd/systemd/Windows session.

use std::fmt;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{Result, ServiceError};

/// Default bound on any single supervisor command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Program plus argument vector. Never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuilder {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// True when the program matches and the arguments start with `prefix`.
    pub fn starts_with(&self, program: &str, prefix: &[&str]) -> bool {
        self.program == program
            && self.args.len() >= prefix.len()
            && self.args.iter().zip(prefix).all(|(a, p)| a == p)
    }
}

impl fmt::Display for CommandBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Turn a non-zero exit into a [`ServiceError::SupervisorCommand`].
    pub fn check(self, cmd: &CommandBuilder) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(ServiceError::SupervisorCommand {
                command: cmd.to_string(),
                status: self.status,
                stderr: if self.stderr.trim().is_empty() {
                    self.stdout
                } else {
                    self.stderr
                },
            })
        }
    }
}

/// Executes supervisor commands.
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output. A non-zero exit is *not* an
    /// error at this layer; spawn failures and timeouts are.
    fn run(&self, cmd: &CommandBuilder) -> Result<CommandOutput>;

    /// Launch without waiting, with no inherited stdio.
    fn spawn_detached(&self, cmd: &CommandBuilder) -> Result<()>;

    /// Run and require a zero exit status.
    fn run_checked(&self, cmd: &CommandBuilder) -> Result<CommandOutput> {
        self.run(cmd)?.check(cmd)
    }
}

/// Runs real processes with a hard deadline.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn command(cmd: &CommandBuilder) -> Command {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            command.creation_flags(CREATE_NO_WINDOW);
        }
        command
    }

    fn spawn_error(cmd: &CommandBuilder, e: std::io::Error) -> ServiceError {
        ServiceError::SupervisorCommand {
            command: cmd.to_string(),
            status: None,
            stderr: format!("failed to execute {}: {e}", cmd.program),
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &CommandBuilder) -> Result<CommandOutput> {
        debug!("running `{cmd}`");

        let mut child = Self::command(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Self::spawn_error(cmd, e))?;

        // Drain both pipes concurrently so a chatty command cannot block on a
        // full pipe while we poll for its exit.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ServiceError::Timeout {
                        command: cmd.to_string(),
                        timeout: self.timeout,
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(Self::spawn_error(cmd, e)),
            }
        };

        // A background child can inherit the pipes and keep them open long
        // after the command itself exited; its output is dropped at the deadline.
        let output = CommandOutput {
            status: status.code(),
            stdout: stdout.map(|rx| collect(cmd, rx, deadline)).unwrap_or_default(),
            stderr: stderr.map(|rx| collect(cmd, rx, deadline)).unwrap_or_default(),
        };
        debug!("`{cmd}` exited with {:?}", output.status);
        Ok(output)
    }

    fn spawn_detached(&self, cmd: &CommandBuilder) -> Result<()> {
        debug!("spawning `{cmd}`");
        Self::command(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(drop)
            .map_err(|e| Self::spawn_error(cmd, e))
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

fn collect(cmd: &CommandBuilder, rx: Receiver<Vec<u8>>, deadline: Instant) -> String {
    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
        Err(_) => {
            warn!("`{cmd}` exited but its output pipe stayed open; output discarded");
            String::new()
        }
    }
}
