//! Per-user systemd control (`systemctl --user`).

use crate::command::{CommandBuilder, CommandRunner};
use crate::error::Result;

use super::SupervisorView;

/// `systemctl --user <args...>`
fn systemctl<I, S>(args: I) -> CommandBuilder
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CommandBuilder::new("systemctl").arg("--user").args(args)
}

/// Reload unit files after one was written or removed.
pub fn daemon_reload(runner: &dyn CommandRunner) -> Result<()> {
    runner.run_checked(&systemctl(["daemon-reload"])).map(drop)
}

/// Create the `default.target` wants link.
pub fn enable(runner: &dyn CommandRunner, unit: &str) -> Result<()> {
    runner.run_checked(&systemctl(["enable", unit])).map(drop)
}

pub fn disable(runner: &dyn CommandRunner, unit: &str) -> Result<()> {
    runner.run_checked(&systemctl(["disable", unit])).map(drop)
}

pub fn start(runner: &dyn CommandRunner, unit: &str) -> Result<()> {
    runner.run_checked(&systemctl(["start", unit])).map(drop)
}

pub fn stop(runner: &dyn CommandRunner, unit: &str) -> Result<()> {
    runner.run_checked(&systemctl(["stop", unit])).map(drop)
}

/// Restart, starting the unit if it was not running.
pub fn restart(runner: &dyn CommandRunner, unit: &str) -> Result<()> {
    runner.run_checked(&systemctl(["restart", unit])).map(drop)
}

/// Query load and activity state via `systemctl show`.
///
/// Unlike `is-active`, `show` exits 0 for unknown units, so "not found" is
/// read from `LoadState` rather than guessed from the exit code.
pub fn show(runner: &dyn CommandRunner, unit: &str) -> SupervisorView {
    let cmd = systemctl([
        "show",
        unit,
        "--property=LoadState,ActiveState,SubState,MainPID",
    ]);
    match runner.run(&cmd) {
        Ok(out) if out.success() => parse_show_output(&out.stdout),
        Ok(out) => SupervisorView::Unknown(format!(
            "`{cmd}` exited with {:?}: {}",
            out.status,
            out.stderr.trim()
        )),
        Err(e) => SupervisorView::Unknown(e.to_string()),
    }
}

pub(crate) fn parse_show_output(stdout: &str) -> SupervisorView {
    let mut load_state = None;
    let mut active_state = None;
    let mut main_pid = None;

    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "LoadState" => load_state = Some(value.trim()),
            "ActiveState" => active_state = Some(value.trim()),
            "MainPID" => main_pid = value.trim().parse::<u32>().ok(),
            _ => {}
        }
    }

    match load_state {
        None => SupervisorView::Unknown("systemctl show returned no LoadState".into()),
        Some("not-found") => SupervisorView::NotLoaded,
        Some(_) => SupervisorView::Loaded {
            running: matches!(active_state, Some("active" | "reloading")),
            pid: main_pid.filter(|pid| *pid != 0),
        },
    }
}
