//! Platform-neutral description of the process to register with the supervisor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServiceError};

/// Relaunch and startup behavior requested from the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub keep_alive: bool,
    pub run_at_load: bool,
    /// Minimum seconds between restarts.
    pub throttle_seconds: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            keep_alive: true,
            run_at_load: true,
            throttle_seconds: 10,
        }
    }
}

/// Advisory ceilings. `None` and `Some(0)` both mean "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub soft_file_limit: Option<u64>,
    pub hard_file_limit: Option<u64>,
    pub soft_process_limit: Option<u64>,
    pub hard_process_limit: Option<u64>,
}

impl ResourceLimits {
    pub fn soft_files(&self) -> Option<u64> {
        nonzero(self.soft_file_limit)
    }

    pub fn hard_files(&self) -> Option<u64> {
        nonzero(self.hard_file_limit)
    }

    pub fn soft_processes(&self) -> Option<u64> {
        nonzero(self.soft_process_limit)
    }

    pub fn hard_processes(&self) -> Option<u64> {
        nonzero(self.hard_process_limit)
    }

    pub fn is_empty(&self) -> bool {
        self.soft_files().is_none()
            && self.hard_files().is_none()
            && self.soft_processes().is_none()
            && self.hard_processes().is_none()
    }
}

fn nonzero(v: Option<u64>) -> Option<u64> {
    v.filter(|n| *n > 0)
}

/// Files the supervisor appends the process output to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// Everything an artifact generator needs to know about the managed process.
///
/// Built fresh for every install; the only durable trace is the generated
/// artifact and the supervisor's own registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Reverse-DNS identifier, also the artifact file stem.
    pub label: String,
    pub description: Option<String>,
    pub executable_path: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    /// Sorted so generated artifacts are byte-stable.
    pub environment: BTreeMap<String, String>,
    pub restart_policy: RestartPolicy,
    pub resource_limits: ResourceLimits,
    pub log_paths: LogPaths,
}

impl ServiceDescriptor {
    pub fn new(
        label: impl Into<String>,
        executable_path: impl Into<PathBuf>,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        let label = label.into();
        let working_directory = working_directory.into();
        let log_paths = LogPaths {
            stdout: working_directory.join(format!("{label}.out.log")),
            stderr: working_directory.join(format!("{label}.err.log")),
        };
        Self {
            label,
            description: None,
            executable_path: executable_path.into(),
            arguments: Vec::new(),
            working_directory,
            environment: BTreeMap::new(),
            restart_policy: RestartPolicy::default(),
            resource_limits: ResourceLimits::default(),
            log_paths,
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.restart_policy.keep_alive = keep_alive;
        self
    }

    pub fn run_at_load(mut self, run_at_load: bool) -> Self {
        self.restart_policy.run_at_load = run_at_load;
        self
    }

    pub fn throttle_seconds(mut self, seconds: u32) -> Self {
        self.restart_policy.throttle_seconds = seconds;
        self
    }

    pub fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn log_paths(mut self, stdout: impl Into<PathBuf>, stderr: impl Into<PathBuf>) -> Self {
        self.log_paths = LogPaths {
            stdout: stdout.into(),
            stderr: stderr.into(),
        };
        self
    }

    /// Human-readable description, falling back to the label.
    pub fn display_name(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.label)
    }

    /// Field checks shared by every artifact generator. No filesystem access.
    pub fn validate(&self) -> Result<()> {
        validate_label(&self.label)?;
        for (what, path) in [
            ("executable", &self.executable_path),
            ("working directory", &self.working_directory),
            ("stdout log", &self.log_paths.stdout),
            ("stderr log", &self.log_paths.stderr),
        ] {
            require_absolute(what, path)?;
        }
        for key in self.environment.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(ServiceError::Validation(format!(
                    "invalid environment variable name {key:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Supervisors resolve relative paths against a directory the caller does
/// not control, so every path in an artifact is absolute.
fn require_absolute(what: &str, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(ServiceError::Validation(format!(
            "{what} path must not be empty"
        )));
    }
    if !is_absolute(path) {
        return Err(ServiceError::Validation(format!(
            "{what} path {} must be absolute",
            path.display()
        )));
    }
    Ok(())
}

/// Absolute on this host, or a drive-letter/UNC path as Windows writes it
/// (artifacts for every platform can be rendered anywhere).
fn is_absolute(path: &Path) -> bool {
    if path.is_absolute() {
        return true;
    }
    let Some(text) = path.to_str() else {
        return false;
    };
    match text.as_bytes() {
        [b'\\', b'\\', ..] => true,
        [drive, b':', b'\\' | b'/', ..] => drive.is_ascii_alphabetic(),
        _ => false,
    }
}

/// Labels become file names, so only a conservative character set is allowed.
pub fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(ServiceError::Validation("label must not be empty".into()));
    }
    if label.starts_with('.') || label.starts_with('-') {
        return Err(ServiceError::Validation(format!(
            "label {label:?} must not start with '.' or '-'"
        )));
    }
    if let Some(c) = label
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(ServiceError::Validation(format!(
            "label {label:?} contains unsupported character {c:?}"
        )));
    }
    Ok(())
}

/// Path as UTF-8 text for embedding in an artifact.
pub(crate) fn path_text<'a>(what: &str, path: &'a Path) -> Result<&'a str> {
    path.to_str()
        .ok_or_else(|| ServiceError::Validation(format!("{what} path is not valid UTF-8")))
}

/// Artifact formats are line-oriented; embedded line breaks cannot be carried.
pub(crate) fn reject_line_breaks(what: &str, value: &str) -> Result<()> {
    if value.contains(['\n', '\r', '\0']) {
        return Err(ServiceError::Validation(format!(
            "{what} must not contain line breaks or NUL"
        )));
    }
    Ok(())
}
