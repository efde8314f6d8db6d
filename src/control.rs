//! Service lifecycle control - delegates to OS-native supervisors
//!
//! [`ServiceController`] is the single entry point callers use:
//! - macOS: launchd (launchctl)
//! - Linux: systemd user manager (systemctl --user)
//! - Windows: Startup folder script (no supervisor)

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::command::{CommandRunner, SystemRunner};
use crate::descriptor::{ServiceDescriptor, validate_label};
use crate::error::{Result, ServiceError};
use crate::platform::{self, Artifact, InstallReport, Platform, PlatformAdapter, ServiceStatus};

/// Pause before the single retry of `install`/`uninstall`.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Lifecycle operations for one label on the host platform.
pub struct ServiceController {
    label: String,
    /// `None` on hosts without a supported supervisor.
    adapter: Option<Box<dyn PlatformAdapter>>,
    retry_delay: Duration,
}

impl ServiceController {
    /// Controller for the detected platform, running real commands.
    pub fn new(label: impl Into<String>) -> Result<Self> {
        Self::with_runner(label, Arc::new(SystemRunner::default()), DEFAULT_RETRY_DELAY)
    }

    pub fn with_runner(
        label: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
        retry_delay: Duration,
    ) -> Result<Self> {
        let label = label.into();
        validate_label(&label)?;
        let adapter = match Platform::current() {
            Some(p) => Some(platform::adapter_for(p, runner)?),
            None => None,
        };
        Ok(Self {
            label,
            adapter,
            retry_delay,
        })
    }

    /// Controller over an explicit adapter.
    pub fn with_adapter(
        label: impl Into<String>,
        adapter: Box<dyn PlatformAdapter>,
        retry_delay: Duration,
    ) -> Result<Self> {
        let label = label.into();
        validate_label(&label)?;
        Ok(Self {
            label,
            adapter: Some(adapter),
            retry_delay,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn adapter(&self) -> Result<&dyn PlatformAdapter> {
        self.adapter
            .as_deref()
            .ok_or_else(|| ServiceError::UnsupportedPlatform(std::env::consts::OS.to_string()))
    }

    pub fn platform(&self) -> Result<Platform> {
        Ok(self.adapter()?.platform())
    }

    pub fn artifact_path(&self) -> Result<PathBuf> {
        Ok(self.adapter()?.artifact_path(&self.label))
    }

    /// Generate the artifact without touching the filesystem or supervisor.
    pub fn render(&self, descriptor: &ServiceDescriptor) -> Result<Artifact> {
        self.check_label(descriptor)?;
        self.adapter()?.render(descriptor)
    }

    /// Write the artifact and register it with the supervisor.
    pub fn install(&self, descriptor: &ServiceDescriptor) -> Result<InstallReport> {
        self.check_label(descriptor)?;
        let adapter = self.adapter()?;
        let report = self.retry_once("install", || adapter.install(descriptor))?;
        info!(
            "{} installed ({:?}) at {}",
            self.label,
            report.outcome,
            report.artifact_path.display()
        );
        Ok(report)
    }

    /// Unregister and delete the artifact. Succeeds when nothing is installed.
    pub fn uninstall(&self) -> Result<()> {
        let adapter = self.adapter()?;
        self.retry_once("uninstall", || adapter.uninstall(&self.label))
    }

    pub fn is_installed(&self) -> Result<bool> {
        Ok(self.adapter()?.is_installed(&self.label))
    }

    /// Query failures read as inactive.
    pub fn is_active(&self) -> Result<bool> {
        Ok(self.adapter()?.is_active(&self.label))
    }

    pub fn restart(&self) -> Result<()> {
        self.adapter()?.restart(&self.label)
    }

    pub fn status(&self) -> Result<ServiceStatus> {
        Ok(self.adapter()?.status(&self.label))
    }

    fn check_label(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        if descriptor.label != self.label {
            return Err(ServiceError::Validation(format!(
                "descriptor label {:?} does not match controller label {:?}",
                descriptor.label, self.label
            )));
        }
        Ok(())
    }

    /// Retry once, after `retry_delay`, when the failure may be lock
    /// contention with the supervisor.
    fn retry_once<T>(&self, op: &str, f: impl Fn() -> Result<T>) -> Result<T> {
        match f() {
            Err(e) if e.is_transient() => {
                warn!(
                    "{op} {} failed: {e}; retrying in {:?}",
                    self.label, self.retry_delay
                );
                thread::sleep(self.retry_delay);
                f()
            }
            other => other,
        }
    }
}
