use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::descriptor::{LogPaths, ResourceLimits, RestartPolicy, ServiceDescriptor};
use crate::error::{Result, ServiceError};
use crate::file_ops;

/// Top‑level configuration: the managed service plus manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub service: ServiceConfig,
    #[serde(default)]
    pub manager: ManagerSettings,
}

fn default_true() -> bool {
    true
}

fn default_throttle() -> u32 {
    RestartPolicy::default().throttle_seconds
}

/// On‑disk TOML description of the managed service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub label: String,
    pub description: Option<String>,
    /// Absolute path, or a bare program name resolved against `PATH`.
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Defaults to the home directory.
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Variables copied from the invoking environment at install time.
    #[serde(default)]
    pub inherit_environment: Vec<String>,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    #[serde(default = "default_true")]
    pub run_at_load: bool,
    #[serde(default = "default_throttle")]
    pub throttle_seconds: u32,
    #[serde(default)]
    pub limits: ResourceLimits,
    pub stdout_log: Option<String>,
    pub stderr_log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerSettings {
    #[serde(default = "ManagerSettings::default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "ManagerSettings::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl ManagerSettings {
    fn default_command_timeout_secs() -> u64 {
        10
    }

    fn default_retry_delay_ms() -> u64 {
        500
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            command_timeout_secs: Self::default_command_timeout_secs(),
            retry_delay_ms: Self::default_retry_delay_ms(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                label: "local.daemonctl.agent".into(),
                description: Some("Background agent managed by daemonctl".into()),
                executable: "agent".into(),
                arguments: vec![],
                working_directory: None,
                environment: BTreeMap::new(),
                inherit_environment: vec!["PATH".into()],
                keep_alive: true,
                run_at_load: true,
                throttle_seconds: default_throttle(),
                limits: ResourceLimits::default(),
                stdout_log: None,
                stderr_log: None,
            },
            manager: ManagerSettings::default(),
        }
    }
}

/// `<config dir>/daemonctl/daemonctl.toml`
pub fn default_path() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| ServiceError::Config("could not determine config directory".into()))?;
    Ok(dir.join("daemonctl").join("daemonctl.toml"))
}

/// `<local data dir>/daemonctl/logs`
pub fn default_log_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("daemonctl").join("logs"))
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| ServiceError::fs(path, e))?;
        toml::from_str(&text)
            .map_err(|e| ServiceError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Load `path`, writing the default configuration there first if absent.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(
                "Config not found at {}, creating default configuration",
                path.display()
            );
            let default_toml = toml::to_string_pretty(&Self::default())
                .map_err(|e| ServiceError::Config(format!("failed to serialize default config: {e}")))?;
            file_ops::ensure_parent(path)?;
            file_ops::write_file_atomic(path, &default_toml)?;
            info!("Created default configuration at {}", path.display());
        }
        Self::load(path)
    }
}

impl ServiceConfig {
    /// Build the descriptor, resolving the executable and collecting
    /// inherited environment variables from the current process.
    pub fn to_descriptor(&self) -> Result<ServiceDescriptor> {
        self.to_descriptor_with(|name| std::env::var(name).ok())
    }

    pub(crate) fn to_descriptor_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<ServiceDescriptor> {
        let executable = resolve_executable(&self.executable)?;
        let working_directory = match &self.working_directory {
            Some(dir) => expand_home(dir),
            None => dirs::home_dir().ok_or_else(|| {
                ServiceError::Config("could not determine home directory".into())
            })?,
        };

        let mut d = ServiceDescriptor::new(&self.label, executable, working_directory)
            .args(self.arguments.iter().cloned())
            .keep_alive(self.keep_alive)
            .run_at_load(self.run_at_load)
            .throttle_seconds(self.throttle_seconds)
            .resource_limits(self.limits.clone());
        if let Some(description) = &self.description {
            d = d.description(description);
        }

        // Explicit entries win over inherited ones.
        for name in &self.inherit_environment {
            if let Some(value) = lookup(name) {
                d.environment.insert(name.clone(), value);
            }
        }
        d.environment.extend(self.environment.clone());

        let default_dir = default_log_dir();
        let default_log = |suffix: &str, fallback: &PathBuf| match &default_dir {
            Some(dir) => dir.join(format!("{}.{suffix}.log", self.label)),
            None => fallback.clone(),
        };
        d.log_paths = LogPaths {
            stdout: self
                .stdout_log
                .as_deref()
                .map(expand_home)
                .unwrap_or_else(|| default_log("out", &d.log_paths.stdout)),
            stderr: self
                .stderr_log
                .as_deref()
                .map(expand_home)
                .unwrap_or_else(|| default_log("err", &d.log_paths.stderr)),
        };
        Ok(d)
    }
}

/// Bare names are looked up on `PATH`; anything with a separator is a path.
fn resolve_executable(executable: &str) -> Result<PathBuf> {
    if executable.is_empty() {
        return Err(ServiceError::Config("service.executable must not be empty".into()));
    }
    let path = expand_home(executable);
    if path.components().count() > 1 || path.is_absolute() {
        return Ok(path);
    }
    which::which(executable)
        .map_err(|e| ServiceError::Config(format!("could not find {executable} on PATH: {e}")))
}

fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/").zip(dirs::home_dir()) {
        Some((rest, home)) => home.join(rest),
        None => PathBuf::from(value),
    }
}
