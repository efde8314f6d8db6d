//! Linux user service registration with systemd.

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};

use super::{
    Artifact, InstallOutcome, InstallReport, Platform, PlatformAdapter, SupervisorView,
    prepare_install, write_artifact,
};
use crate::command::CommandRunner;
use crate::descriptor::ServiceDescriptor;
use crate::error::{Result, ServiceError};
use crate::file_ops::{self, ArtifactChange};

pub mod service_control;
mod unit;

pub use unit::generate_unit;

/// systemd user unit in `~/.config/systemd/user`.
pub struct SystemdAdapter {
    unit_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl SystemdAdapter {
    pub fn new(unit_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            runner,
        }
    }

    /// Honors `$XDG_CONFIG_HOME` through `dirs::config_dir`.
    pub fn for_current_user(runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let config = dirs::config_dir()
            .ok_or_else(|| ServiceError::Config("could not determine config directory".into()))?;
        Ok(Self::new(config.join("systemd").join("user"), runner))
    }

    fn unit_name(label: &str) -> String {
        format!("{label}.service")
    }
}

impl PlatformAdapter for SystemdAdapter {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn artifact_path(&self, label: &str) -> PathBuf {
        self.unit_dir.join(Self::unit_name(label))
    }

    fn render(&self, descriptor: &ServiceDescriptor) -> Result<Artifact> {
        generate_unit(descriptor).map(Artifact::new)
    }

    fn install(&self, descriptor: &ServiceDescriptor) -> Result<InstallReport> {
        let label = &descriptor.label;
        let unit = Self::unit_name(label);
        let run_at_load = descriptor.restart_policy.run_at_load;
        let runner = self.runner.as_ref();

        let artifact = prepare_install(self, descriptor)?;
        let view = self.query(label);
        let (change, path) = write_artifact(self, descriptor, &artifact)?;

        let settled = view.is_loaded() && (view.is_running() || !run_at_load);
        if change == ArtifactChange::Unchanged && settled {
            info!("{unit} already installed with identical unit file");
            return Ok(InstallReport {
                outcome: InstallOutcome::Unchanged,
                artifact_path: path,
                warnings: artifact.warnings,
            });
        }

        service_control::daemon_reload(runner)?;
        if run_at_load {
            service_control::enable(runner, &unit)?;
            if view.is_running() && change != ArtifactChange::Unchanged {
                // A running unit keeps its old definition until restarted
                service_control::restart(runner, &unit)?;
                info!("{unit} restarted with updated unit file");
            } else {
                service_control::start(runner, &unit)?;
                info!("{unit} enabled and started");
            }
        } else if view.is_loaded() {
            // An earlier install may have enabled or started the unit
            if view.is_running() {
                service_control::stop(runner, &unit)?;
            }
            service_control::disable(runner, &unit)?;
            info!("{unit} disabled (run_at_load = false)");
        } else {
            debug!("{unit} installed without enable/start (run_at_load = false)");
        }

        let outcome = match change {
            ArtifactChange::Unchanged => InstallOutcome::Registered,
            change => change.into(),
        };
        Ok(InstallReport {
            outcome,
            artifact_path: path,
            warnings: artifact.warnings,
        })
    }

    fn uninstall(&self, label: &str) -> Result<()> {
        let path = self.artifact_path(label);
        if !path.is_file() {
            debug!("{label} has no unit at {}, nothing to uninstall", path.display());
            return Ok(());
        }

        let unit = Self::unit_name(label);
        let runner = self.runner.as_ref();
        match self.query(label) {
            SupervisorView::NotLoaded => debug!("{unit} not loaded, skipping stop/disable"),
            _ => {
                service_control::stop(runner, &unit)?;
                service_control::disable(runner, &unit)?;
            }
        }

        file_ops::remove_if_exists(&path)?;
        // The unit is already stopped and disabled; a failed reload only
        // leaves systemd with a stale cached definition.
        if let Err(e) = service_control::daemon_reload(runner) {
            warn!("daemon-reload after removing {unit} failed: {e}");
        }
        info!("{unit} removed");
        Ok(())
    }

    fn query(&self, label: &str) -> SupervisorView {
        service_control::show(self.runner.as_ref(), &Self::unit_name(label))
    }

    fn restart(&self, label: &str) -> Result<()> {
        if !self.is_installed(label) {
            return Err(ServiceError::NotInstalled(label.to_string()));
        }
        let unit = Self::unit_name(label);
        let runner = self.runner.as_ref();
        if !self.query(label).is_loaded() {
            service_control::daemon_reload(runner)?;
        }
        service_control::restart(runner, &unit)?;
        info!("{unit} restarted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ServiceState;
    use crate::test_support::{Reply, ScriptedRunner, fail, ok, sample_descriptor};
    use std::fs;
    use tempfile::TempDir;

    const NOT_FOUND: &str = "LoadState=not-found\nActiveState=inactive\nSubState=dead\nMainPID=0\n";
    const RUNNING: &str = "LoadState=loaded\nActiveState=active\nSubState=running\nMainPID=777\n";
    const STOPPED: &str = "LoadState=loaded\nActiveState=inactive\nSubState=dead\nMainPID=0\n";

    const SHOW: &[&str] = &["--user", "show"];

    fn setup() -> (TempDir, Arc<ScriptedRunner>, SystemdAdapter) {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let adapter = SystemdAdapter::new(tmp.path().join("systemd/user"), runner.clone());
        (tmp, runner, adapter)
    }

    #[test]
    fn fresh_install_reloads_enables_and_starts() {
        let (tmp, runner, adapter) = setup();
        runner.once("systemctl", SHOW, ok(NOT_FOUND));

        let report = adapter.install(&sample_descriptor(tmp.path())).unwrap();

        assert_eq!(report.outcome, InstallOutcome::Created);
        assert_eq!(
            report.artifact_path,
            tmp.path().join("systemd/user/test.daemon.service")
        );
        assert!(tmp.path().join("logs").is_dir());
        let unit = fs::read_to_string(&report.artifact_path).unwrap();
        assert!(unit.contains("Restart=on-failure"));
        assert_eq!(
            runner.commands()[1..],
            [
                "systemctl --user daemon-reload",
                "systemctl --user enable test.daemon.service",
                "systemctl --user start test.daemon.service",
            ]
        );
    }

    #[test]
    fn unchanged_running_unit_is_left_alone() {
        let (tmp, runner, adapter) = setup();
        let d = sample_descriptor(tmp.path());
        runner.once("systemctl", SHOW, ok(NOT_FOUND));
        adapter.install(&d).unwrap();
        let before = runner.calls().len();

        runner.on("systemctl", SHOW, ok(RUNNING));
        let report = adapter.install(&d).unwrap();

        assert_eq!(report.outcome, InstallOutcome::Unchanged);
        // only the status query
        assert_eq!(runner.calls().len(), before + 1);
    }

    #[test]
    fn changed_unit_restarts_running_service() {
        let (tmp, runner, adapter) = setup();
        runner.once("systemctl", SHOW, ok(NOT_FOUND));
        adapter.install(&sample_descriptor(tmp.path())).unwrap();

        runner.on("systemctl", SHOW, ok(RUNNING));
        let report = adapter
            .install(&sample_descriptor(tmp.path()).arg("--verbose"))
            .unwrap();

        assert_eq!(report.outcome, InstallOutcome::Updated);
        let cmds = runner.commands();
        assert_eq!(
            cmds[cmds.len() - 3..],
            [
                "systemctl --user daemon-reload",
                "systemctl --user enable test.daemon.service",
                "systemctl --user restart test.daemon.service",
            ]
        );
    }

    #[test]
    fn unchanged_but_stopped_unit_is_started_again() {
        let (tmp, runner, adapter) = setup();
        let d = sample_descriptor(tmp.path());
        runner.once("systemctl", SHOW, ok(NOT_FOUND));
        adapter.install(&d).unwrap();

        runner.on("systemctl", SHOW, ok(STOPPED));
        let report = adapter.install(&d).unwrap();

        assert_eq!(report.outcome, InstallOutcome::Registered);
        assert_eq!(
            runner.commands().last().map(String::as_str),
            Some("systemctl --user start test.daemon.service")
        );
    }

    #[test]
    fn run_at_load_false_only_reloads() {
        let (tmp, runner, adapter) = setup();
        runner.once("systemctl", SHOW, ok(NOT_FOUND));

        adapter
            .install(&sample_descriptor(tmp.path()).run_at_load(false))
            .unwrap();

        assert_eq!(runner.commands()[1..], ["systemctl --user daemon-reload"]);
    }

    #[test]
    fn turning_off_run_at_load_stops_and_disables() {
        let (tmp, runner, adapter) = setup();
        runner.once("systemctl", SHOW, ok(NOT_FOUND));
        adapter.install(&sample_descriptor(tmp.path())).unwrap();

        runner.once("systemctl", SHOW, ok(RUNNING));
        let before = runner.calls().len();
        let report = adapter
            .install(&sample_descriptor(tmp.path()).run_at_load(false))
            .unwrap();

        assert_eq!(report.outcome, InstallOutcome::Updated);
        assert_eq!(
            runner.commands()[before + 1..],
            [
                "systemctl --user daemon-reload",
                "systemctl --user stop test.daemon.service",
                "systemctl --user disable test.daemon.service",
            ]
        );

        // Settled now: repeating the install changes nothing
        runner.on("systemctl", SHOW, ok(STOPPED));
        let before = runner.calls().len();
        let report = adapter
            .install(&sample_descriptor(tmp.path()).run_at_load(false))
            .unwrap();
        assert_eq!(report.outcome, InstallOutcome::Unchanged);
        assert_eq!(runner.calls().len(), before + 1);
    }

    #[test]
    fn supervisor_failure_keeps_artifact_and_reports_stderr() {
        let (tmp, runner, adapter) = setup();
        runner
            .once("systemctl", SHOW, ok(NOT_FOUND))
            .on(
                "systemctl",
                &["--user", "start"],
                fail(1, "Job for test.daemon.service failed because the control process exited"),
            );

        let err = adapter.install(&sample_descriptor(tmp.path())).unwrap_err();

        match err {
            ServiceError::SupervisorCommand { command, status, stderr } => {
                assert_eq!(command, "systemctl --user start test.daemon.service");
                assert_eq!(status, Some(1));
                assert!(stderr.contains("control process exited"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(adapter.is_installed("test.daemon"));
    }

    #[test]
    fn missing_working_directory_fails_before_any_command() {
        let (tmp, runner, adapter) = setup();
        let d = sample_descriptor(&tmp.path().join("does-not-exist"));

        let err = adapter.install(&d).unwrap_err();

        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(runner.calls().is_empty());
        assert!(!adapter.is_installed("test.daemon"));
    }

    #[test]
    fn uninstall_stops_and_disables_before_removing() {
        let (tmp, runner, adapter) = setup();
        runner.once("systemctl", SHOW, ok(NOT_FOUND));
        adapter.install(&sample_descriptor(tmp.path())).unwrap();
        runner.watch(adapter.artifact_path("test.daemon"));
        runner.on("systemctl", SHOW, ok(RUNNING));
        let before = runner.calls().len();

        adapter.uninstall("test.daemon").unwrap();

        let calls = &runner.calls()[before..];
        let rendered: Vec<String> = calls.iter().map(|c| c.cmd.to_string()).collect();
        assert_eq!(
            rendered,
            [
                "systemctl --user show test.daemon.service --property=LoadState,ActiveState,SubState,MainPID",
                "systemctl --user stop test.daemon.service",
                "systemctl --user disable test.daemon.service",
                "systemctl --user daemon-reload",
            ]
        );
        assert!(calls[1].artifact_present);
        assert!(calls[2].artifact_present);
        assert!(!calls[3].artifact_present);
        assert!(!adapter.is_installed("test.daemon"));
    }

    #[test]
    fn failed_stop_keeps_unit_file() {
        let (tmp, runner, adapter) = setup();
        runner.once("systemctl", SHOW, ok(NOT_FOUND));
        adapter.install(&sample_descriptor(tmp.path())).unwrap();
        runner
            .on("systemctl", SHOW, ok(RUNNING))
            .on("systemctl", &["--user", "stop"], Reply::Timeout);

        let err = adapter.uninstall("test.daemon").unwrap_err();

        assert!(matches!(err, ServiceError::Timeout { .. }));
        assert!(adapter.is_installed("test.daemon"));
    }

    #[test]
    fn uninstall_twice_is_a_noop() {
        let (tmp, runner, adapter) = setup();
        runner.once("systemctl", SHOW, ok(NOT_FOUND));
        adapter.install(&sample_descriptor(tmp.path())).unwrap();
        adapter.uninstall("test.daemon").unwrap();
        let before = runner.calls().len();

        adapter.uninstall("test.daemon").unwrap();

        assert_eq!(runner.calls().len(), before);
    }

    #[test]
    fn status_after_install_reports_active_pid() {
        let (tmp, runner, adapter) = setup();
        runner.once("systemctl", SHOW, ok(NOT_FOUND));
        adapter.install(&sample_descriptor(tmp.path())).unwrap();
        runner.on("systemctl", SHOW, ok(RUNNING));

        let status = adapter.status("test.daemon");

        assert!(status.installed);
        assert!(status.active);
        assert_eq!(status.platform_label, "systemd-user");
        assert_eq!(status.state, ServiceState::Active { pid: Some(777) });
    }

    #[test]
    fn status_survives_query_failure() {
        let (_tmp, runner, adapter) = setup();
        runner.on("systemctl", SHOW, Reply::SpawnFailure);

        let status = adapter.status("test.daemon");

        assert!(!status.active);
        assert!(matches!(status.state, ServiceState::Unknown(_)));
    }

    #[test]
    fn restart_reloads_unloaded_unit_first() {
        let (tmp, runner, adapter) = setup();
        runner.once("systemctl", SHOW, ok(NOT_FOUND));
        adapter
            .install(&sample_descriptor(tmp.path()).run_at_load(false))
            .unwrap();
        runner.on("systemctl", SHOW, ok(NOT_FOUND));
        let before = runner.calls().len();

        adapter.restart("test.daemon").unwrap();

        assert_eq!(
            runner.commands()[before..],
            [
                "systemctl --user show test.daemon.service --property=LoadState,ActiveState,SubState,MainPID",
                "systemctl --user daemon-reload",
                "systemctl --user restart test.daemon.service",
            ]
        );
    }

    #[test]
    fn restart_without_unit_is_not_installed() {
        let (_tmp, runner, adapter) = setup();
        assert!(matches!(
            adapter.restart("test.daemon"),
            Err(ServiceError::NotInstalled(_))
        ));
        assert!(runner.calls().is_empty());
    }
}
