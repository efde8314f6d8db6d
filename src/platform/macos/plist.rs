//! launchd plist file generation for macOS agents.

use plist::{Dictionary, Value};

use crate::descriptor::{ResourceLimits, ServiceDescriptor, path_text};
use crate::error::{Result, ServiceError};

/// Generate a launchd property list for the descriptor.
///
/// Keys are inserted in a fixed order and the environment is already sorted,
/// so identical descriptors always produce identical bytes.
pub fn generate_plist(d: &ServiceDescriptor) -> Result<String> {
    d.validate()?;

    let executable = path_text("executable", &d.executable_path)?;
    let working_dir = path_text("working directory", &d.working_directory)?;
    let stdout = path_text("stdout log", &d.log_paths.stdout)?;
    let stderr = path_text("stderr log", &d.log_paths.stderr)?;

    let mut plist = Dictionary::new();
    plist.insert("Label".to_string(), xml_string("label", &d.label)?);

    // Program and arguments, one node each
    let mut program_args = vec![xml_string("executable", executable)?];
    for arg in &d.arguments {
        program_args.push(xml_string("argument", arg)?);
    }
    plist.insert("ProgramArguments".to_string(), Value::Array(program_args));
    plist.insert(
        "WorkingDirectory".to_string(),
        xml_string("working directory", working_dir)?,
    );

    if !d.environment.is_empty() {
        let mut env = Dictionary::new();
        for (key, value) in &d.environment {
            check_xml_text("environment variable name", key)?;
            env.insert(key.clone(), xml_string("environment value", value)?);
        }
        plist.insert("EnvironmentVariables".to_string(), Value::Dictionary(env));
    }

    let policy = &d.restart_policy;
    plist.insert("RunAtLoad".to_string(), Value::Boolean(policy.run_at_load));
    plist.insert("KeepAlive".to_string(), Value::Boolean(policy.keep_alive));
    plist.insert(
        "ThrottleInterval".to_string(),
        Value::Integer(u64::from(policy.throttle_seconds).into()),
    );

    let (soft, hard) = resource_limits(&d.resource_limits);
    if let Some(soft) = soft {
        plist.insert("SoftResourceLimits".to_string(), Value::Dictionary(soft));
    }
    if let Some(hard) = hard {
        plist.insert("HardResourceLimits".to_string(), Value::Dictionary(hard));
    }

    plist.insert("StandardOutPath".to_string(), xml_string("stdout log", stdout)?);
    plist.insert("StandardErrorPath".to_string(), xml_string("stderr log", stderr)?);
    plist.insert("ProcessType".to_string(), Value::String("Background".to_string()));

    let mut buf = Vec::new();
    Value::Dictionary(plist)
        .to_writer_xml(&mut buf)
        .map_err(|e| ServiceError::Validation(format!("failed to generate plist: {e}")))?;
    buf.push(b'\n');

    String::from_utf8(buf)
        .map_err(|e| ServiceError::Validation(format!("plist contains invalid UTF-8: {e}")))
}

/// Zero-valued limits are omitted: launchd would apply them literally.
fn resource_limits(limits: &ResourceLimits) -> (Option<Dictionary>, Option<Dictionary>) {
    fn dict(files: Option<u64>, procs: Option<u64>) -> Option<Dictionary> {
        let mut d = Dictionary::new();
        if let Some(n) = files {
            d.insert("NumberOfFiles".to_string(), Value::Integer(n.into()));
        }
        if let Some(n) = procs {
            d.insert("NumberOfProcesses".to_string(), Value::Integer(n.into()));
        }
        (!d.is_empty()).then_some(d)
    }

    (
        dict(limits.soft_files(), limits.soft_processes()),
        dict(limits.hard_files(), limits.hard_processes()),
    )
}

fn xml_string(what: &str, value: &str) -> Result<Value> {
    check_xml_text(what, value)?;
    Ok(Value::String(value.to_string()))
}

/// XML 1.0 cannot carry most control characters, escaped or not.
fn check_xml_text(what: &str, value: &str) -> Result<()> {
    match value
        .chars()
        .find(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
    {
        Some(c) => Err(ServiceError::Validation(format!(
            "{what} contains control character {c:?}"
        ))),
        None => Ok(()),
    }
}
