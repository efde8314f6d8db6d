//! Systemd user unit generation.
//!
//! Every free-text value is written either as a quoted word (C-style escapes
//! plus `%`/`$` doubling) or, for path-valued settings, with `%` doubled so
//! specifier expansion cannot change its meaning.

use std::fmt::Write;

use crate::descriptor::{ServiceDescriptor, path_text, reject_line_breaks};
use crate::error::Result;

/// Generate the `.service` file content for the descriptor.
pub fn generate_unit(d: &ServiceDescriptor) -> Result<String> {
    d.validate()?;

    let executable = path_text("executable", &d.executable_path)?;
    let working_dir = path_text("working directory", &d.working_directory)?;
    let stdout = path_text("stdout log", &d.log_paths.stdout)?;
    let stderr = path_text("stderr log", &d.log_paths.stderr)?;

    for (what, value) in [
        ("description", d.display_name()),
        ("executable", executable),
        ("working directory", working_dir),
        ("stdout log", stdout),
        ("stderr log", stderr),
    ] {
        reject_line_breaks(what, value)?;
    }
    for arg in &d.arguments {
        reject_line_breaks("argument", arg)?;
    }
    for (key, value) in &d.environment {
        reject_line_breaks("environment variable", key)?;
        reject_line_breaks("environment value", value)?;
    }

    let mut content = String::with_capacity(1024);

    // [Unit] section
    content.push_str("[Unit]\n");
    let _ = writeln!(content, "Description={}", escape_specifiers(d.display_name()));
    content.push('\n');

    // [Service] section
    content.push_str("[Service]\n");
    content.push_str("Type=simple\n");
    let _ = writeln!(content, "WorkingDirectory={}", escape_specifiers(working_dir));

    let mut exec_start = quote_exec_word(executable);
    for arg in &d.arguments {
        exec_start.push(' ');
        exec_start.push_str(&quote_exec_word(arg));
    }
    let _ = writeln!(content, "ExecStart={exec_start}");

    for (key, value) in &d.environment {
        let _ = writeln!(
            content,
            "Environment={}",
            quote_word(&format!("{key}={value}"), false)
        );
    }

    // Restart configuration: on-failure so a clean exit at logout stays down
    let policy = &d.restart_policy;
    if policy.keep_alive {
        content.push_str("Restart=on-failure\n");
        let _ = writeln!(content, "RestartSec={}", policy.throttle_seconds);
    } else {
        content.push_str("Restart=no\n");
    }

    // Resource limits
    let limits = &d.resource_limits;
    write_limit(&mut content, "LimitNOFILE", limits.soft_files(), limits.hard_files());
    write_limit(&mut content, "LimitNPROC", limits.soft_processes(), limits.hard_processes());

    // Logging: append so restarts never truncate
    let _ = writeln!(content, "StandardOutput=append:{}", escape_specifiers(stdout));
    let _ = writeln!(content, "StandardError=append:{}", escape_specifiers(stderr));
    content.push('\n');

    // [Install] section; the marker keeps a run-at-load change visible as a
    // content change even though enablement lives outside the file
    content.push_str("[Install]\n");
    if !policy.run_at_load {
        content.push_str("# Not enabled at login; start with `systemctl --user start`\n");
    }
    content.push_str("WantedBy=default.target\n");

    Ok(content)
}

fn write_limit(content: &mut String, key: &str, soft: Option<u64>, hard: Option<u64>) {
    match (soft, hard) {
        (Some(soft), Some(hard)) => {
            let _ = writeln!(content, "{key}={soft}:{hard}");
        }
        (Some(n), None) | (None, Some(n)) => {
            let _ = writeln!(content, "{key}={n}");
        }
        (None, None) => {}
    }
}

/// `%` introduces a unit specifier everywhere in a unit file.
fn escape_specifiers(value: &str) -> String {
    value.replace('%', "%%")
}

/// ExecStart words additionally undergo `$VAR` substitution.
fn quote_exec_word(value: &str) -> String {
    quote_word(value, true)
}

fn quote_word(value: &str, escape_dollar: bool) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\t' => out.push_str("\\t"),
            '%' => out.push_str("%%"),
            '$' if escape_dollar => out.push_str("$$"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
