//! Platform adapters: one per supervisor family.
//!
//! - macOS: per-user launchd agent (`~/Library/LaunchAgents/<label>.plist`)
//! - Linux: systemd user unit (`~/.config/systemd/user/<label>.service`)
//! - Windows: login Startup folder script (`<Startup>\<label>.vbs`)
//!
//! Every adapter generates its artifact with a pure function, stages it
//! atomically, and talks to the supervisor only through a [`CommandRunner`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::command::CommandRunner;
use crate::descriptor::ServiceDescriptor;
use crate::error::{Result, ServiceError, Warning};
use crate::file_ops::{self, ArtifactChange};

pub mod linux;
pub mod macos;
pub mod windows;

/// Supervisor family of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    MacOs,
    Linux,
    Windows,
}

static CURRENT: Lazy<Option<Platform>> = Lazy::new(|| {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "macos")] {
            Some(Platform::MacOs)
        } else if #[cfg(target_os = "linux")] {
            Some(Platform::Linux)
        } else if #[cfg(target_os = "windows")] {
            Some(Platform::Windows)
        } else {
            None
        }
    }
});

impl Platform {
    /// Host platform, detected once per process.
    pub fn current() -> Option<Platform> {
        *CURRENT
    }

    /// Stable label reported in [`ServiceStatus::platform_label`].
    pub fn label(self) -> &'static str {
        match self {
            Platform::MacOs => "launchd",
            Platform::Linux => "systemd-user",
            Platform::Windows => "windows-startup",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Generated artifact text plus any capability the platform cannot honor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub content: String,
    pub warnings: Vec<Warning>,
}

impl Artifact {
    pub fn new(content: String) -> Self {
        Self {
            content,
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallOutcome {
    Created,
    Updated,
    /// Artifact was already identical but had to be registered again.
    Registered,
    /// Identical artifact already registered; nothing was touched.
    Unchanged,
}

impl From<ArtifactChange> for InstallOutcome {
    fn from(change: ArtifactChange) -> Self {
        match change {
            ArtifactChange::Created => Self::Created,
            ArtifactChange::Updated => Self::Updated,
            ArtifactChange::Unchanged => Self::Unchanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub outcome: InstallOutcome,
    pub artifact_path: PathBuf,
    pub warnings: Vec<Warning>,
}

/// What the supervisor itself reports for a label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorView {
    NotLoaded,
    Loaded { running: bool, pid: Option<u32> },
    /// Query failed; the reason is kept for diagnostics.
    Unknown(String),
}

impl SupervisorView {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Loaded { running: true, .. })
    }
}

/// Fine-grained lifecycle state, combining the artifact check with the
/// supervisor query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ServiceState {
    NotInstalled,
    InstalledNotLoaded,
    LoadedInactive,
    Active { pid: Option<u32> },
    /// Supervisor still knows the label but its artifact is gone.
    Orphaned,
    Unknown(String),
}

impl ServiceState {
    pub fn from_parts(installed: bool, view: SupervisorView) -> Self {
        match (installed, view) {
            (_, SupervisorView::Unknown(reason)) => Self::Unknown(reason),
            (false, SupervisorView::NotLoaded) => Self::NotInstalled,
            (false, SupervisorView::Loaded { .. }) => Self::Orphaned,
            (true, SupervisorView::NotLoaded) => Self::InstalledNotLoaded,
            (true, SupervisorView::Loaded { running: false, .. }) => Self::LoadedInactive,
            (true, SupervisorView::Loaded { running: true, pid }) => Self::Active { pid },
        }
    }
}

/// Uniform status, identical in shape on every platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub label: String,
    pub installed: bool,
    pub active: bool,
    pub artifact_path: PathBuf,
    pub platform_label: String,
    pub state: ServiceState,
}

/// Registration with one native supervisor.
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Conventional artifact location for `label`.
    fn artifact_path(&self, label: &str) -> PathBuf;

    /// Pure artifact generation; no filesystem or supervisor access.
    fn render(&self, descriptor: &ServiceDescriptor) -> Result<Artifact>;

    /// Write the artifact and register it. Safe to repeat.
    fn install(&self, descriptor: &ServiceDescriptor) -> Result<InstallReport>;

    /// Unregister, then delete the artifact. No-op when nothing is installed.
    fn uninstall(&self, label: &str) -> Result<()>;

    /// Read-only supervisor query. Never fails; failures become `Unknown`.
    fn query(&self, label: &str) -> SupervisorView;

    fn restart(&self, label: &str) -> Result<()>;

    /// Filesystem check only.
    fn is_installed(&self, label: &str) -> bool {
        self.artifact_path(label).is_file()
    }

    fn status(&self, label: &str) -> ServiceStatus {
        let installed = self.is_installed(label);
        let view = self.query(label);
        let active = view.is_running();
        let state = ServiceState::from_parts(installed, view);
        match &state {
            ServiceState::Orphaned => warn!(
                "{label} is still registered with {} but {} is missing",
                self.platform(),
                self.artifact_path(label).display()
            ),
            ServiceState::Unknown(reason) => {
                warn!("could not query {} for {label}: {reason}", self.platform())
            }
            _ => {}
        }
        ServiceStatus {
            label: label.to_string(),
            installed,
            active,
            artifact_path: self.artifact_path(label),
            platform_label: self.platform().label().to_string(),
            state,
        }
    }

    fn is_active(&self, label: &str) -> bool {
        self.query(label).is_running()
    }
}

/// Build the adapter for `platform` rooted at the current user's directories.
pub fn adapter_for(
    platform: Platform,
    runner: Arc<dyn CommandRunner>,
) -> Result<Box<dyn PlatformAdapter>> {
    let adapter: Box<dyn PlatformAdapter> = match platform {
        Platform::MacOs => Box::new(macos::LaunchdAdapter::for_current_user(runner)?),
        Platform::Linux => Box::new(linux::SystemdAdapter::for_current_user(runner)?),
        Platform::Windows => Box::new(windows::StartupFolderAdapter::for_current_user(runner)?),
    };
    Ok(adapter)
}

/// Render and check preconditions. Nothing is written and the supervisor is
/// not contacted, so validation failures leave no trace.
pub(crate) fn prepare_install(
    adapter: &dyn PlatformAdapter,
    descriptor: &ServiceDescriptor,
) -> Result<Artifact> {
    let artifact = adapter.render(descriptor)?;
    if !descriptor.working_directory.is_dir() {
        return Err(ServiceError::Validation(format!(
            "working directory {} does not exist",
            descriptor.working_directory.display()
        )));
    }
    for warning in &artifact.warnings {
        warn!("{}: {warning}", descriptor.label);
    }
    Ok(artifact)
}

/// Create log and artifact directories, then stage the artifact atomically.
pub(crate) fn write_artifact(
    adapter: &dyn PlatformAdapter,
    descriptor: &ServiceDescriptor,
    artifact: &Artifact,
) -> Result<(ArtifactChange, PathBuf)> {
    file_ops::ensure_parent(&descriptor.log_paths.stdout)?;
    file_ops::ensure_parent(&descriptor.log_paths.stderr)?;

    let path = adapter.artifact_path(&descriptor.label);
    let change = file_ops::stage_artifact(&path, &artifact.content)?;
    info!("{} artifact {:?} at {}", descriptor.label, change, path.display());
    Ok((change, path))
}

pub(crate) fn home_relative(components: &[&str]) -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ServiceError::Config("could not determine home directory".into()))?;
    Ok(components.iter().fold(home, |p, c| p.join(c)))
}

pub(crate) fn path_string(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| ServiceError::Validation(format!("{} is not valid UTF-8", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_distinguishes_registration_from_activity() {
        use SupervisorView::*;
        assert_eq!(ServiceState::from_parts(false, NotLoaded), ServiceState::NotInstalled);
        assert_eq!(
            ServiceState::from_parts(true, NotLoaded),
            ServiceState::InstalledNotLoaded
        );
        assert_eq!(
            ServiceState::from_parts(true, Loaded { running: false, pid: None }),
            ServiceState::LoadedInactive
        );
        assert_eq!(
            ServiceState::from_parts(true, Loaded { running: true, pid: Some(42) }),
            ServiceState::Active { pid: Some(42) }
        );
        assert_eq!(
            ServiceState::from_parts(false, Loaded { running: true, pid: None }),
            ServiceState::Orphaned
        );
        assert!(matches!(
            ServiceState::from_parts(true, Unknown("boom".into())),
            ServiceState::Unknown(_)
        ));
    }

    #[test]
    fn platform_detection_is_stable() {
        assert_eq!(Platform::current(), Platform::current());
        #[cfg(target_os = "linux")]
        assert_eq!(Platform::current(), Some(Platform::Linux));
    }
}
