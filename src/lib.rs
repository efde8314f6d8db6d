//! Register a long-running process with the host's native supervisor.
//!
//! A [`ServiceDescriptor`] is turned into the platform artifact (launchd
//! property list, systemd user unit, or Windows startup script), written
//! atomically to its conventional location, and registered through the
//! supervisor's own command-line tools.

pub mod command;
pub mod config;
pub mod control;
pub mod descriptor;
pub mod error;
pub mod file_ops;
pub mod platform;

#[cfg(test)]
mod test_support;

pub use control::ServiceController;
pub use descriptor::{LogPaths, ResourceLimits, RestartPolicy, ServiceDescriptor};
pub use error::{Result, ServiceError, Warning};
pub use platform::{InstallOutcome, InstallReport, Platform, ServiceState, ServiceStatus};
