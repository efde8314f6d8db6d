//! Windows login startup via a VBScript in the per-user Startup folder.
//!
//! There is no supervisor: the script is the registration, and "running"
//! means a process matching the identity recorded in the script header.

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info};

use super::{
    Artifact, InstallOutcome, InstallReport, Platform, PlatformAdapter, SupervisorView,
    path_string, prepare_install, write_artifact,
};
use crate::command::{CommandBuilder, CommandRunner};
use crate::descriptor::ServiceDescriptor;
use crate::error::{Result, ServiceError};
use crate::file_ops::{self, ArtifactChange};

mod process;
mod script;

pub use process::{ProcessEntry, parse_process_list};
pub use script::{ProcessIdentity, generate_startup_script, parse_identity};

pub struct StartupFolderAdapter {
    startup_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl StartupFolderAdapter {
    pub fn new(startup_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            startup_dir: startup_dir.into(),
            runner,
        }
    }

    /// `%APPDATA%\Microsoft\Windows\Start Menu\Programs\Startup`
    pub fn for_current_user(runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let appdata = dirs::config_dir()
            .ok_or_else(|| ServiceError::Config("could not determine APPDATA directory".into()))?;
        let startup = ["Microsoft", "Windows", "Start Menu", "Programs", "Startup"]
            .iter()
            .fold(appdata, |p, c| p.join(c));
        Ok(Self::new(startup, runner))
    }

    /// Identity recorded in the installed script, if any.
    fn identity(&self, label: &str) -> Result<Option<ProcessIdentity>> {
        let path = self.artifact_path(label);
        Ok(file_ops::read_existing(&path)?.and_then(|script| parse_identity(&script)))
    }

    fn running_pids(&self, identity: &ProcessIdentity) -> Result<Vec<u32>> {
        process::find_matching(self.runner.as_ref(), identity)
    }

    fn terminate_all(&self, label: &str, pids: &[u32]) -> Result<()> {
        for &pid in pids {
            process::terminate(self.runner.as_ref(), pid)?;
            info!("{label}: terminated process {pid}");
        }
        Ok(())
    }

    /// Run the startup script now, exactly as the login sequence would.
    fn launch(&self, label: &str) -> Result<()> {
        let script = path_string(&self.artifact_path(label))?;
        let cmd = CommandBuilder::new("wscript.exe").args(["//B", "//Nologo", script.as_str()]);
        self.runner.spawn_detached(&cmd)?;
        info!("{label} launched");
        Ok(())
    }
}

impl PlatformAdapter for StartupFolderAdapter {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    fn artifact_path(&self, label: &str) -> PathBuf {
        self.startup_dir.join(format!("{label}.vbs"))
    }

    fn render(&self, descriptor: &ServiceDescriptor) -> Result<Artifact> {
        generate_startup_script(descriptor)
    }

    fn install(&self, descriptor: &ServiceDescriptor) -> Result<InstallReport> {
        let label = &descriptor.label;
        let artifact = prepare_install(self, descriptor)?;

        // Processes started from the previous script, before it is replaced
        let running = match self.identity(label)? {
            Some(identity) => self.running_pids(&identity)?,
            None => Vec::new(),
        };
        let (change, path) = write_artifact(self, descriptor, &artifact)?;

        let run_now = descriptor.restart_policy.run_at_load;
        let outcome = match (change, running.is_empty()) {
            (ArtifactChange::Unchanged, false) => InstallOutcome::Unchanged,
            (ArtifactChange::Unchanged, true) if !run_now => InstallOutcome::Unchanged,
            (ArtifactChange::Unchanged, true) => {
                self.launch(label)?;
                InstallOutcome::Registered
            }
            (change, _) => {
                if !running.is_empty() {
                    self.terminate_all(label, &running)?;
                }
                if run_now {
                    self.launch(label)?;
                }
                change.into()
            }
        };

        Ok(InstallReport {
            outcome,
            artifact_path: path,
            warnings: artifact.warnings,
        })
    }

    fn uninstall(&self, label: &str) -> Result<()> {
        let path = self.artifact_path(label);
        let Some(script) = file_ops::read_existing(&path)? else {
            debug!("{label} has no startup script at {}, nothing to uninstall", path.display());
            return Ok(());
        };
        if let Some(identity) = parse_identity(&script) {
            let pids = self.running_pids(&identity)?;
            self.terminate_all(label, &pids)?;
        }
        file_ops::remove_if_exists(&path)?;
        info!("{label} removed from the Startup folder");
        Ok(())
    }

    fn query(&self, label: &str) -> SupervisorView {
        let identity = match self.identity(label) {
            Ok(Some(identity)) => identity,
            Ok(None) => return SupervisorView::NotLoaded,
            Err(e) => return SupervisorView::Unknown(e.to_string()),
        };
        match self.running_pids(&identity) {
            Ok(pids) => SupervisorView::Loaded {
                running: !pids.is_empty(),
                pid: pids.first().copied(),
            },
            Err(e) => SupervisorView::Unknown(e.to_string()),
        }
    }

    fn restart(&self, label: &str) -> Result<()> {
        let Some(identity) = self.identity(label)? else {
            return Err(ServiceError::NotInstalled(label.to_string()));
        };
        let pids = self.running_pids(&identity)?;
        self.terminate_all(label, &pids)?;
        self.launch(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Warning;
    use crate::platform::ServiceState;
    use crate::test_support::{ScriptedRunner, fail, ok};
    use std::fs;
    use tempfile::TempDir;

    const PS: &str = "powershell.exe";

    fn setup() -> (TempDir, Arc<ScriptedRunner>, StartupFolderAdapter) {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let adapter = StartupFolderAdapter::new(tmp.path().join("Startup"), runner.clone());
        (tmp, runner, adapter)
    }

    fn descriptor(tmp: &TempDir) -> ServiceDescriptor {
        let work = tmp.path();
        ServiceDescriptor::new("test.daemon", r"C:\Tools\agent.exe", work)
            .description("Test daemon")
            .arg("--serve")
            .log_paths(work.join("logs").join("out.log"), work.join("logs").join("err.log"))
    }

    fn listing(pid: u32) -> String {
        format!("{pid}\tC:\\Tools\\agent.exe\t\"C:\\Tools\\agent.exe\" \"--serve\"\r\n")
    }

    #[test]
    fn install_writes_script_warns_and_launches() {
        let (tmp, runner, adapter) = setup();

        let report = adapter.install(&descriptor(&tmp)).unwrap();

        assert_eq!(report.outcome, InstallOutcome::Created);
        assert_eq!(report.warnings, vec![Warning::KeepAliveUnsupported]);
        assert_eq!(report.artifact_path, tmp.path().join("Startup").join("test.daemon.vbs"));
        let script = fs::read_to_string(&report.artifact_path).unwrap();
        assert!(script.contains("shell.Run "));

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].detached);
        assert!(calls[0].cmd.starts_with("wscript.exe", &["//B", "//Nologo"]));
    }

    #[test]
    fn reinstall_while_running_is_a_noop() {
        let (tmp, runner, adapter) = setup();
        adapter.install(&descriptor(&tmp)).unwrap();
        runner.on(PS, &[], ok(&listing(4100)));
        let before = runner.calls().len();

        let report = adapter.install(&descriptor(&tmp)).unwrap();

        assert_eq!(report.outcome, InstallOutcome::Unchanged);
        let after: Vec<_> = runner.calls()[before..].to_vec();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].cmd.program, PS);
    }

    #[test]
    fn changed_script_replaces_running_process() {
        let (tmp, runner, adapter) = setup();
        adapter.install(&descriptor(&tmp)).unwrap();
        runner.on(PS, &[], ok(&listing(4100)));
        let before = runner.calls().len();

        let report = adapter.install(&descriptor(&tmp).env("MODE", "fast")).unwrap();

        assert_eq!(report.outcome, InstallOutcome::Updated);
        let cmds: Vec<String> = runner.commands()[before..].to_vec();
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[1], "taskkill /F /T /PID 4100");
        assert!(cmds[2].starts_with("wscript.exe //B //Nologo"));
    }

    #[test]
    fn run_at_load_false_writes_without_launching() {
        let (tmp, runner, adapter) = setup();

        let report = adapter
            .install(&descriptor(&tmp).keep_alive(false).run_at_load(false))
            .unwrap();

        assert_eq!(report.warnings, vec![Warning::RunAtLoadUnsupported]);
        assert!(adapter.is_installed("test.daemon"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn invalid_path_leaves_nothing_behind() {
        let (tmp, runner, adapter) = setup();
        let d = descriptor(&tmp).log_paths(r"C:\logs\%TEMP%.log", r"C:\logs\err.log");

        assert!(matches!(adapter.install(&d), Err(ServiceError::Validation(_))));
        assert!(!adapter.is_installed("test.daemon"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn uninstall_terminates_before_deleting() {
        let (tmp, runner, adapter) = setup();
        adapter.install(&descriptor(&tmp)).unwrap();
        runner.watch(adapter.artifact_path("test.daemon"));
        runner.on(PS, &[], ok(&listing(4100)));

        adapter.uninstall("test.daemon").unwrap();

        let kill = runner
            .calls()
            .into_iter()
            .find(|c| c.cmd.program == "taskkill")
            .expect("taskkill issued");
        assert!(kill.artifact_present);
        assert!(!adapter.is_installed("test.daemon"));
    }

    #[test]
    fn failed_listing_keeps_script() {
        let (tmp, runner, adapter) = setup();
        adapter.install(&descriptor(&tmp)).unwrap();
        runner.on(PS, &[], fail(1, "Get-CimInstance : Access denied"));

        let err = adapter.uninstall("test.daemon").unwrap_err();

        assert!(err.is_transient());
        assert!(adapter.is_installed("test.daemon"));
    }

    #[test]
    fn status_reflects_matching_process() {
        let (tmp, runner, adapter) = setup();
        assert_eq!(adapter.status("test.daemon").state, ServiceState::NotInstalled);

        adapter.install(&descriptor(&tmp)).unwrap();
        runner.once(PS, &[], ok(""));
        runner.on(PS, &[], ok(&listing(4100)));

        let idle = adapter.status("test.daemon");
        assert!(idle.installed);
        assert!(!idle.active);
        assert_eq!(idle.state, ServiceState::LoadedInactive);

        let running = adapter.status("test.daemon");
        assert!(running.active);
        assert_eq!(running.platform_label, "windows-startup");
        assert_eq!(running.state, ServiceState::Active { pid: Some(4100) });
    }

    #[test]
    fn restart_kills_then_relaunches() {
        let (tmp, runner, adapter) = setup();
        assert!(matches!(
            adapter.restart("test.daemon"),
            Err(ServiceError::NotInstalled(_))
        ));

        adapter.install(&descriptor(&tmp)).unwrap();
        runner.on(PS, &[], ok(&listing(4100)));
        let before = runner.calls().len();

        adapter.restart("test.daemon").unwrap();

        let cmds: Vec<String> = runner.commands()[before..].to_vec();
        assert_eq!(cmds[1], "taskkill /F /T /PID 4100");
        assert!(cmds[2].starts_with("wscript.exe"));
    }
}
