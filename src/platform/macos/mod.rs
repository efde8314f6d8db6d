//! macOS agent registration with launchd (launchctl).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use super::{
    Artifact, InstallOutcome, InstallReport, Platform, PlatformAdapter, SupervisorView,
    path_string, prepare_install, write_artifact,
};
use crate::command::{CommandBuilder, CommandRunner};
use crate::descriptor::ServiceDescriptor;
use crate::error::{Result, ServiceError};
use crate::file_ops::{self, ArtifactChange};

mod plist;

pub use plist::generate_plist;

/// `launchctl` exits with this when the label is not loaded.
const ESRCH_EXIT: i32 = 113;

/// Per-user launchd agent in `~/Library/LaunchAgents`.
pub struct LaunchdAdapter {
    agents_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl LaunchdAdapter {
    pub fn new(agents_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            agents_dir: agents_dir.into(),
            runner,
        }
    }

    pub fn for_current_user(runner: Arc<dyn CommandRunner>) -> Result<Self> {
        Ok(Self::new(
            super::home_relative(&["Library", "LaunchAgents"])?,
            runner,
        ))
    }

    fn launchctl<I, S>(args: I) -> CommandBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandBuilder::new("launchctl").args(args)
    }

    /// `launchctl load` reports many failures on stderr with a zero exit.
    fn load(&self, plist: &Path) -> Result<()> {
        let plist = path_string(plist)?;
        let cmd = Self::launchctl(["load", "-w", plist.as_str()]);
        let out = self.runner.run_checked(&cmd)?;
        let stderr = out.stderr.trim();
        if stderr.contains("Load failed") || stderr.contains("Invalid property list") {
            return Err(ServiceError::SupervisorCommand {
                command: cmd.to_string(),
                status: out.status,
                stderr: stderr.to_string(),
            });
        }
        Ok(())
    }

    fn unload(&self, plist: &Path) -> Result<()> {
        let plist = path_string(plist)?;
        let cmd = Self::launchctl(["unload", "-w", plist.as_str()]);
        self.runner.run_checked(&cmd).map(drop)
    }

    fn kickstart(&self, label: &str) -> Result<()> {
        let Some(uid) = current_uid() else {
            return Err(ServiceError::UnsupportedPlatform(
                "launchd domains require a unix user id".into(),
            ));
        };
        let target = format!("gui/{uid}/{label}");
        self.runner
            .run_checked(&Self::launchctl(["kickstart", "-k", target.as_str()]))
            .map(drop)
    }
}

#[cfg(unix)]
fn current_uid() -> Option<u32> {
    Some(nix::unistd::getuid().as_raw())
}

#[cfg(not(unix))]
fn current_uid() -> Option<u32> {
    None
}

/// Parse `launchctl list <label>` output, a property-list-like dictionary
/// where a running job carries `"PID" = <n>;`.
pub(crate) fn parse_list_output(stdout: &str) -> SupervisorView {
    let pid = stdout.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("\"PID\"")?;
        rest.trim_start()
            .strip_prefix('=')?
            .trim()
            .trim_end_matches(';')
            .trim()
            .parse::<u32>()
            .ok()
    });
    SupervisorView::Loaded {
        running: pid.is_some(),
        pid,
    }
}

impl PlatformAdapter for LaunchdAdapter {
    fn platform(&self) -> Platform {
        Platform::MacOs
    }

    fn artifact_path(&self, label: &str) -> PathBuf {
        self.agents_dir.join(format!("{label}.plist"))
    }

    fn render(&self, descriptor: &ServiceDescriptor) -> Result<Artifact> {
        generate_plist(descriptor).map(Artifact::new)
    }

    fn install(&self, descriptor: &ServiceDescriptor) -> Result<InstallReport> {
        let label = &descriptor.label;
        let artifact = prepare_install(self, descriptor)?;
        let view = self.query(label);
        let (change, path) = write_artifact(self, descriptor, &artifact)?;

        match (change, &view) {
            (ArtifactChange::Unchanged, SupervisorView::Loaded { .. }) => {
                info!("{label} already loaded with identical plist");
            }
            (_, SupervisorView::Loaded { .. }) => {
                // launchd caches the job definition; reload to pick up changes.
                self.unload(&path)?;
                self.load(&path)?;
                info!("{label} reloaded into launchd");
            }
            _ => {
                self.load(&path)?;
                info!("{label} loaded into launchd");
            }
        }

        let outcome = match (change, view.is_loaded()) {
            (ArtifactChange::Unchanged, true) => InstallOutcome::Unchanged,
            (ArtifactChange::Unchanged, false) => InstallOutcome::Registered,
            (change, _) => change.into(),
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
            debug!("{label} has no plist at {}, nothing to uninstall", path.display());
            return Ok(());
        }
        match self.query(label) {
            SupervisorView::NotLoaded => debug!("{label} not loaded, skipping unload"),
            _ => self.unload(&path)?,
        }
        file_ops::remove_if_exists(&path)?;
        info!("{label} removed from launchd");
        Ok(())
    }

    fn query(&self, label: &str) -> SupervisorView {
        let cmd = Self::launchctl(["list", label]);
        match self.runner.run(&cmd) {
            Ok(out) if out.success() => parse_list_output(&out.stdout),
            Ok(out)
                if out.status == Some(ESRCH_EXIT)
                    || out.stderr.contains("Could not find service") =>
            {
                SupervisorView::NotLoaded
            }
            Ok(out) => SupervisorView::Unknown(format!(
                "`{cmd}` exited with {:?}: {}",
                out.status,
                out.stderr.trim()
            )),
            Err(e) => SupervisorView::Unknown(e.to_string()),
        }
    }

    fn restart(&self, label: &str) -> Result<()> {
        let path = self.artifact_path(label);
        if !path.is_file() {
            return Err(ServiceError::NotInstalled(label.to_string()));
        }
        if !self.query(label).is_loaded() {
            self.load(&path)?;
        }
        // kickstart -k kills and relaunches in one step; fall back to
        // stop/start on systems without the modern subcommand.
        if let Err(e) = self.kickstart(label) {
            warn!("launchctl kickstart failed for {label} ({e}), falling back to stop/start");
            self.runner
                .run_checked(&Self::launchctl(["stop", label]))?;
            self.runner
                .run_checked(&Self::launchctl(["start", label]))?;
        }
        info!("{label} restarted");
        Ok(())
    }
}
