//! VBScript startup script generation for the per-user Startup folder.
//!
//! The script sets the environment and working directory, then launches the
//! program hidden and detached through `WScript.Shell.Run`. `cmd.exe` sits in
//! between only to append stdout/stderr to the log files, so every argument
//! is quoted twice: CommandLineToArgvW rules for the program, then caret
//! escapes so `cmd.exe` passes it through untouched.

use std::fmt::Write;

use crate::descriptor::{ServiceDescriptor, path_text, reject_line_breaks};
use crate::error::{Result, ServiceError, Warning};
use crate::platform::Artifact;

const LINE_END: &str = "\r\n";

/// Header lines that identify the launched process on later queries.
const EXECUTABLE_HEADER: &str = "' Executable: ";
const MATCH_HEADER: &str = "' Match: ";

/// Characters `cmd.exe` would interpret outside quotes.
const CMD_SPECIAL: &[char] = &[
    '(', ')', '[', ']', '%', '!', '^', '"', '`', '<', '>', '&', '|', ';', ',', ' ', '*', '?',
];

/// How to recognise the process a startup script launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub executable: String,
    /// First argument, required to appear in the command line when present.
    pub first_argument: Option<String>,
}

/// Generate the startup script and its degraded-capability warnings.
pub fn generate_startup_script(d: &ServiceDescriptor) -> Result<Artifact> {
    d.validate()?;

    let executable = cmd_safe_path("executable", &d.executable_path)?;
    let working_dir = cmd_safe_path("working directory", &d.working_directory)?;
    let stdout = cmd_safe_path("stdout log", &d.log_paths.stdout)?;
    let stderr = cmd_safe_path("stderr log", &d.log_paths.stderr)?;
    reject_line_breaks("description", d.display_name())?;
    for arg in &d.arguments {
        reject_line_breaks("argument", arg)?;
    }
    for (key, value) in &d.environment {
        reject_line_breaks("environment variable", key)?;
        reject_line_breaks("environment value", value)?;
    }

    let mut warnings = Vec::new();
    if d.restart_policy.keep_alive {
        warnings.push(Warning::KeepAliveUnsupported);
    }
    if !d.restart_policy.run_at_load {
        warnings.push(Warning::RunAtLoadUnsupported);
    }

    let mut lines = vec![
        format!("' Description: {}", d.display_name()),
        format!("' Label: {}", d.label),
        format!("{EXECUTABLE_HEADER}{executable}"),
    ];
    if let Some(first) = d.arguments.first() {
        lines.push(format!("{MATCH_HEADER}{first}"));
    }
    if d.restart_policy.keep_alive {
        lines.push("' KeepAlive: not supported, the process is not relaunched after it exits".into());
    }
    lines.extend([
        "Option Explicit".to_string(),
        "Dim shell, env".to_string(),
        "Set shell = CreateObject(\"WScript.Shell\")".to_string(),
        "Set env = shell.Environment(\"Process\")".to_string(),
    ]);
    for (key, value) in &d.environment {
        lines.push(format!("env({}) = {}", vbs_literal(key), vbs_literal(value)));
    }
    lines.push(format!("shell.CurrentDirectory = {}", vbs_literal(working_dir)));

    let command_line = launch_command_line(executable, &d.arguments, stdout, stderr);
    // 0: hidden window, False: do not wait
    lines.push(format!("shell.Run {}, 0, False", vbs_literal(&command_line)));

    let mut content = String::new();
    for line in lines {
        let _ = write!(content, "{line}{LINE_END}");
    }

    Ok(Artifact { content, warnings })
}

/// Read back the identity headers of a generated script.
pub fn parse_identity(script: &str) -> Option<ProcessIdentity> {
    let mut executable = None;
    let mut first_argument = None;
    for line in script.lines() {
        if let Some(exe) = line.strip_prefix(EXECUTABLE_HEADER) {
            executable = Some(exe.to_string());
        } else if let Some(arg) = line.strip_prefix(MATCH_HEADER) {
            first_argument = Some(arg.to_string());
        } else if !line.starts_with('\'') {
            break;
        }
    }
    Some(ProcessIdentity {
        executable: executable?,
        first_argument,
    })
}

/// Paths are embedded inside plain double quotes on the `cmd.exe` line,
/// where neither `"` nor `%` can be escaped.
fn cmd_safe_path<'a>(what: &str, path: &'a std::path::Path) -> Result<&'a str> {
    let text = path_text(what, path)?;
    reject_line_breaks(what, text)?;
    if text.contains(['"', '%']) {
        return Err(ServiceError::Validation(format!(
            "{what} path {text:?} cannot contain '\"' or '%' in a startup script"
        )));
    }
    Ok(text)
}

fn launch_command_line(executable: &str, args: &[String], stdout: &str, stderr: &str) -> String {
    let mut inner = format!("\"{executable}\"");
    for arg in args {
        inner.push(' ');
        inner.push_str(&caret_escape(&argv_quote(arg)));
    }
    let _ = write!(inner, " 1>>\"{stdout}\" 2>>\"{stderr}\"");
    // /s: strip exactly the outer quotes; /d: skip AutoRun commands
    format!("cmd.exe /d /s /c \"{inner}\"")
}

/// Quote one argument so CommandLineToArgvW yields it back unchanged.
fn argv_quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    let mut backslashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat_n('\\', backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            c => {
                out.extend(std::iter::repeat_n('\\', backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    // Trailing backslashes would otherwise escape the closing quote
    out.extend(std::iter::repeat_n('\\', backslashes * 2));
    out.push('"');
    out
}

fn caret_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 2);
    for c in value.chars() {
        if CMD_SPECIAL.contains(&c) {
            out.push('^');
        }
        out.push(c);
    }
    out
}

/// VBScript string expression. Non-ASCII and control characters are spelled
/// with `ChrW` so the script stays ASCII regardless of the ANSI code page.
fn vbs_literal(value: &str) -> String {
    let mut out = String::from("\"");
    let mut in_string = true;
    for c in value.chars() {
        if c.is_ascii() && !c.is_ascii_control() {
            if !in_string {
                out.push_str(" & \"");
                in_string = true;
            }
            if c == '"' {
                out.push_str("\"\"");
            } else {
                out.push(c);
            }
        } else {
            if in_string {
                out.push('"');
                in_string = false;
            }
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                let _ = write!(out, " & ChrW({unit})");
            }
        }
    }
    if in_string {
        out.push('"');
    }
    out
}
