//! Scripted [`CommandRunner`] double for adapter and controller tests.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::command::{CommandBuilder, CommandOutput, CommandRunner};
use crate::descriptor::ServiceDescriptor;
use crate::error::{Result, ServiceError};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Output(CommandOutput),
    Timeout,
    SpawnFailure,
}

pub(crate) fn ok(stdout: &str) -> Reply {
    Reply::Output(CommandOutput {
        status: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    })
}

pub(crate) fn fail(code: i32, stderr: &str) -> Reply {
    Reply::Output(CommandOutput {
        status: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    })
}

struct Rule {
    program: String,
    prefix: Vec<String>,
    reply: Reply,
    remaining: Option<usize>,
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub cmd: CommandBuilder,
    pub detached: bool,
    /// Whether the watched artifact existed when the command ran.
    pub artifact_present: bool,
}

#[derive(Default)]
pub(crate) struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
    watch: Mutex<Option<PathBuf>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to every matching command. Earlier rules win.
    pub fn on(&self, program: &str, prefix: &[&str], reply: Reply) -> &Self {
        self.push(program, prefix, reply, None)
    }

    /// Reply to the next matching command only.
    pub fn once(&self, program: &str, prefix: &[&str], reply: Reply) -> &Self {
        self.push(program, prefix, reply, Some(1))
    }

    fn push(&self, program: &str, prefix: &[&str], reply: Reply, remaining: Option<usize>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            program: program.to_string(),
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            reply,
            remaining,
        });
        self
    }

    /// Record artifact presence at every invocation.
    pub fn watch(&self, path: PathBuf) {
        *self.watch.lock().unwrap() = Some(path);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations rendered as strings, for compact assertions.
    pub fn commands(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.cmd.to_string()).collect()
    }

    fn record(&self, cmd: &CommandBuilder, detached: bool) {
        let artifact_present = self
            .watch
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|p| p.exists());
        self.calls.lock().unwrap().push(Call {
            cmd: cmd.clone(),
            detached,
            artifact_present,
        });
    }

    fn reply_for(&self, cmd: &CommandBuilder) -> Reply {
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            let prefix: Vec<&str> = rule.prefix.iter().map(String::as_str).collect();
            if rule.remaining == Some(0) || !cmd.starts_with(&rule.program, &prefix) {
                continue;
            }
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            return rule.reply.clone();
        }
        ok("")
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, cmd: &CommandBuilder) -> Result<CommandOutput> {
        self.record(cmd, false);
        match self.reply_for(cmd) {
            Reply::Output(out) => Ok(out),
            Reply::Timeout => Err(ServiceError::Timeout {
                command: cmd.to_string(),
                timeout: Duration::from_secs(10),
            }),
            Reply::SpawnFailure => Err(ServiceError::SupervisorCommand {
                command: cmd.to_string(),
                status: None,
                stderr: format!("failed to execute {}: not found", cmd.program),
            }),
        }
    }

    fn spawn_detached(&self, cmd: &CommandBuilder) -> Result<()> {
        self.record(cmd, true);
        match self.reply_for(cmd) {
            Reply::Output(out) if out.success() => Ok(()),
            Reply::Output(out) => out.check(cmd).map(drop),
            Reply::Timeout | Reply::SpawnFailure => Err(ServiceError::SupervisorCommand {
                command: cmd.to_string(),
                status: None,
                stderr: "spawn failed".into(),
            }),
        }
    }
}

/// Descriptor from the install-then-query scenario, rooted in `work`.
pub(crate) fn sample_descriptor(work: &std::path::Path) -> ServiceDescriptor {
    ServiceDescriptor::new("test.daemon", "/usr/bin/node", work)
        .description("Test daemon")
        .arg("server.js")
        .env("NODE_ENV", "production")
        .run_at_load(true)
        .keep_alive(true)
        .throttle_seconds(10)
        .log_paths(work.join("logs/out.log"), work.join("logs/err.log"))
}
