mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::error;

use daemonctl::command::SystemRunner;
use daemonctl::config::{self, DaemonConfig};
use daemonctl::control::ServiceController;
use daemonctl::platform::{InstallOutcome, ServiceState};

fn main() {
    let args = cli::Args::parse();

    // Initialize logger with custom format
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();

    match real_main(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

fn real_main(args: cli::Args) -> Result<i32> {
    let cfg_path = match args.config {
        Some(path) => path,
        None => config::default_path()?,
    };
    let cfg = load_config(&args.sub, &cfg_path)?;
    log::debug!("Using config from: {}", cfg_path.display());

    let runner = Arc::new(SystemRunner::new(cfg.manager.command_timeout()));
    let controller =
        ServiceController::with_runner(&cfg.service.label, runner, cfg.manager.retry_delay())
            .context("Failed to initialize service controller")?;

    match args.sub {
        cli::Cmd::Install => handle_install(&controller, &cfg),
        cli::Cmd::Uninstall => handle_uninstall(&controller),
        cli::Cmd::Restart => handle_restart(&controller),
        cli::Cmd::Status { json } => handle_status(&controller, json),
        cli::Cmd::Render => handle_render(&controller, &cfg),
    }
}

/// Read-only commands never write a default config.
fn load_config(sub: &cli::Cmd, path: &Path) -> Result<DaemonConfig> {
    let loaded = match sub {
        cli::Cmd::Status { .. } | cli::Cmd::Render => DaemonConfig::load(path),
        _ => DaemonConfig::load_or_create(path),
    };
    loaded.with_context(|| format!("Failed to load config from {}", path.display()))
}

/// Handle install command - write artifact and register it
fn handle_install(controller: &ServiceController, cfg: &DaemonConfig) -> Result<i32> {
    let descriptor = cfg
        .service
        .to_descriptor()
        .context("Failed to build service descriptor")?;
    let report = controller
        .install(&descriptor)
        .with_context(|| format!("Failed to install {}", controller.label()))?;

    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    let verb = match report.outcome {
        InstallOutcome::Created => "installed",
        InstallOutcome::Updated => "updated",
        InstallOutcome::Registered => "registered",
        InstallOutcome::Unchanged => "already installed",
    };
    println!(
        "{} {verb} ({})",
        controller.label(),
        report.artifact_path.display()
    );
    Ok(0)
}

/// Handle uninstall command - unregister and remove the artifact
fn handle_uninstall(controller: &ServiceController) -> Result<i32> {
    controller
        .uninstall()
        .with_context(|| format!("Failed to uninstall {}", controller.label()))?;
    println!("{} uninstalled", controller.label());
    Ok(0)
}

/// Handle restart command - restart via the native supervisor
fn handle_restart(controller: &ServiceController) -> Result<i32> {
    controller
        .restart()
        .with_context(|| format!("Failed to restart {}", controller.label()))?;
    println!("{} restarted successfully", controller.label());
    Ok(0)
}

/// Handle status command - exit 0 only when the service is running
fn handle_status(controller: &ServiceController, json: bool) -> Result<i32> {
    let status = controller.status()?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("Failed to serialize status")?
        );
    } else {
        let state = match &status.state {
            ServiceState::NotInstalled => "not installed".to_string(),
            ServiceState::InstalledNotLoaded => "installed, not loaded".to_string(),
            ServiceState::LoadedInactive => "loaded, not running".to_string(),
            ServiceState::Active { pid: Some(pid) } => format!("running (pid {pid})"),
            ServiceState::Active { pid: None } => "running".to_string(),
            ServiceState::Orphaned => "registered but artifact missing".to_string(),
            ServiceState::Unknown(reason) => format!("unknown ({reason})"),
        };
        println!("{} is {state}", status.label);
        println!("  platform:  {}", status.platform_label);
        println!("  artifact:  {}", status.artifact_path.display());
        println!("  installed: {}", status.installed);
        println!("  active:    {}", status.active);
    }
    Ok(if status.active { 0 } else { 1 })
}

/// Handle render command - print the artifact without touching anything
fn handle_render(controller: &ServiceController, cfg: &DaemonConfig) -> Result<i32> {
    let descriptor = cfg
        .service
        .to_descriptor()
        .context("Failed to build service descriptor")?;
    let artifact = controller.render(&descriptor)?;
    for warning in &artifact.warnings {
        eprintln!("warning: {warning}");
    }
    eprintln!("# {}", controller.artifact_path()?.display());
    print!("{}", artifact.content);
    Ok(0)
}
