//! Read-only process listing and termination for startup-script services.

use log::debug;

use super::script::ProcessIdentity;
use crate::command::{CommandBuilder, CommandRunner};
use crate::error::Result;

/// Tab-separated `pid, executable path, command line`, one process per line.
const LIST_SCRIPT: &str = "$t = [char]9; Get-CimInstance Win32_Process | ForEach-Object { \
     [string]$_.ProcessId + $t + $_.ExecutablePath + $t + $_.CommandLine }";

/// `taskkill` exit code when the process is already gone.
const TASKKILL_NOT_FOUND: i32 = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub executable_path: String,
    pub command_line: String,
}

impl ProcessEntry {
    /// Executable paths compare case-insensitively, as NTFS does.
    pub fn matches(&self, identity: &ProcessIdentity) -> bool {
        self.executable_path.eq_ignore_ascii_case(&identity.executable)
            && identity
                .first_argument
                .as_deref()
                .is_none_or(|arg| self.command_line.contains(arg))
    }
}

pub fn list_command() -> CommandBuilder {
    CommandBuilder::new("powershell.exe").args([
        "-NoProfile",
        "-NonInteractive",
        "-Command",
        LIST_SCRIPT,
    ])
}

pub fn list_processes(runner: &dyn CommandRunner) -> Result<Vec<ProcessEntry>> {
    let out = runner.run_checked(&list_command())?;
    Ok(parse_process_list(&out.stdout))
}

/// Processes without an executable path (system processes) are skipped.
pub fn parse_process_list(stdout: &str) -> Vec<ProcessEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, '\t');
            let pid = fields.next()?.trim().parse::<u32>().ok()?;
            let executable_path = fields.next()?.trim();
            if executable_path.is_empty() {
                return None;
            }
            Some(ProcessEntry {
                pid,
                executable_path: executable_path.to_string(),
                command_line: fields.next().unwrap_or_default().trim().to_string(),
            })
        })
        .collect()
}

pub fn find_matching(runner: &dyn CommandRunner, identity: &ProcessIdentity) -> Result<Vec<u32>> {
    Ok(list_processes(runner)?
        .into_iter()
        .filter(|p| p.matches(identity))
        .map(|p| p.pid)
        .collect())
}

/// Force-terminate a process and its children.
pub fn terminate(runner: &dyn CommandRunner, pid: u32) -> Result<()> {
    let pid_text = pid.to_string();
    let cmd = CommandBuilder::new("taskkill").args(["/F", "/T", "/PID", pid_text.as_str()]);
    let out = runner.run(&cmd)?;
    if out.status == Some(TASKKILL_NOT_FOUND) {
        debug!("process {pid} already exited");
        return Ok(());
    }
    out.check(&cmd).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedRunner, fail};

    const LISTING: &str = "0\t\t\r\n\
        4\t\t\r\n\
        812\tC:\\Windows\\System32\\cmd.exe\tcmd.exe /d /s /c \"\"C:\\Program Files\\nodejs\\node.exe\" ^\"server.js^\"\"\r\n\
        904\tC:\\Program Files\\nodejs\\node.exe\t\"C:\\Program Files\\nodejs\\node.exe\" \"server.js\"\r\n\
        905\tc:\\program files\\nodejs\\NODE.EXE\t\"c:\\program files\\nodejs\\NODE.EXE\" \"server.js\"\r\n\
        990\tC:\\Program Files\\nodejs\\node.exe\t\"C:\\Program Files\\nodejs\\node.exe\" \"other.js\"\r\n";

    fn identity() -> ProcessIdentity {
        ProcessIdentity {
            executable: r"C:\Program Files\nodejs\node.exe".into(),
            first_argument: Some("server.js".into()),
        }
    }

    #[test]
    fn listing_skips_processes_without_path() {
        let entries = parse_process_list(LISTING);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].pid, 812);
        assert_eq!(entries[1].command_line, r#""C:\Program Files\nodejs\node.exe" "server.js""#);
    }

    #[test]
    fn matches_executable_case_insensitively_and_first_argument() {
        let runner = ScriptedRunner::new();
        runner.on("powershell.exe", &[], crate::test_support::ok(LISTING));
        assert_eq!(find_matching(&runner, &identity()).unwrap(), vec![904, 905]);

        let any_args = ProcessIdentity {
            first_argument: None,
            ..identity()
        };
        assert_eq!(find_matching(&runner, &any_args).unwrap(), vec![904, 905, 990]);
    }

    #[test]
    fn listing_failure_is_an_error() {
        let runner = ScriptedRunner::new();
        runner.on("powershell.exe", &[], fail(1, "Access denied"));
        assert!(list_processes(&runner).is_err());
    }

    #[test]
    fn terminate_tolerates_exited_process() {
        let runner = ScriptedRunner::new();
        runner.once("taskkill", &[], fail(128, "ERROR: The process \"904\" not found."));
        terminate(&runner, 904).unwrap();

        runner.once("taskkill", &[], fail(1, "ERROR: Access is denied."));
        assert!(terminate(&runner, 904).is_err());
        assert_eq!(
            runner.commands(),
            vec!["taskkill /F /T /PID 904", "taskkill /F /T /PID 904"]
        );
    }
}
