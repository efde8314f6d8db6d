//! Error taxonomy for service lifecycle operations.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Failure of a lifecycle operation.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Descriptor is missing a required field or carries a value the target
    /// artifact format cannot represent.
    #[error("invalid service descriptor: {0}")]
    Validation(String),

    #[error("filesystem operation failed on {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// External supervisor command could not be spawned or exited non-zero.
    #[error("`{command}` failed{}: {}", exit_suffix(.status), .stderr.trim())]
    SupervisorCommand {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("service {0} is not installed")]
    NotInstalled(String),

    #[error("configuration error: {0}")]
    Config(String),
}

fn exit_suffix(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!(" with exit code {code}"),
        None => String::new(),
    }
}

impl ServiceError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Whether `install`/`uninstall` may retry once after this failure.
    ///
    /// Timeouts are excluded: a hung supervisor is not lock contention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Filesystem { .. } | Self::SupervisorCommand { .. }
        )
    }
}

/// Result alias used throughout the library.
pub type Result<T, E = ServiceError> = std::result::Result<T, E>;

/// Degraded capability: the operation succeeded but the platform cannot honor
/// part of the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Warning {
    /// No supervisor exists to relaunch the process after it exits.
    KeepAliveUnsupported,
    /// The login sequence always launches the script; it cannot be registered
    /// without also running at the next login.
    RunAtLoadUnsupported,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeepAliveUnsupported => f.write_str(
                "keep-alive requested but this platform has no restart supervisor; \
                 the process will not be relaunched after it exits",
            ),
            Self::RunAtLoadUnsupported => f.write_str(
                "run-at-load disabled but login startup scripts always run at the next login",
            ),
        }
    }
}
