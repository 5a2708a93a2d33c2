//! Argument builders and output parsers for the container-management CLI.
//!
//! Kept free of I/O so the flag mappings and output parsers can be tested
//! on their own.

use crate::bundle::OciBundle;
use crate::config::ManagedConfig;
use crate::constants::ANNOTATION_NET_ALIASES;
use crate::error::{Error, ErrorKind, Result};
use crate::request::NetAlias;
use crate::runtime::{ContainerStatus, Signal};
use crate::runtimes::{bundle_cores, bundle_memory_mib};
use std::time::Duration;

/// Feature flags derived from requested namespaces.
///
/// Returns `(unprivileged, features)`: a user namespace makes the guest
/// unprivileged and needs `keyctl`; a cgroup namespace needs `nesting`.
pub fn feature_flags(bundle: &OciBundle) -> (bool, Vec<&'static str>) {
    let spec = bundle.spec();
    let unprivileged = spec.has_namespace("user");
    let mut features = Vec::new();
    if unprivileged {
        features.push("keyctl=1");
    }
    if spec.has_namespace("cgroup") {
        features.push("nesting=1");
    }
    (unprivileged, features)
}

/// Network arguments from the bundle's alias annotation.
///
/// `eth0:vmbr0,eth1:vmbr1` becomes `--net0 name=eth0,bridge=vmbr0,ip=dhcp
/// --net1 name=eth1,bridge=vmbr1,ip=dhcp`.
pub fn net_args(bundle: &OciBundle) -> Result<Vec<String>> {
    let Some(encoded) = bundle.spec().annotation(ANNOTATION_NET_ALIASES) else {
        return Ok(Vec::new());
    };

    let mut args = Vec::new();
    for (index, pair) in encoded.split(',').filter(|p| !p.is_empty()).enumerate() {
        let alias: NetAlias = pair.parse()?;
        args.push(format!("--net{index}"));
        args.push(format!("name={},bridge={},ip=dhcp", alias.name, alias.bridge));
    }
    Ok(args)
}

/// Template reference for an image.
pub fn template_for(config: &ManagedConfig, image: &str) -> String {
    let name = image.rsplit('/').next().unwrap_or(image);
    config.template.replace("{image}", name)
}

/// Arguments after the program name for `create`.
pub fn create_args(config: &ManagedConfig, guest: u32, bundle: &OciBundle) -> Result<Vec<String>> {
    let image = bundle.image().ok_or_else(|| Error::InvalidBundle {
        path: bundle.path().to_path_buf(),
        reason: "bundle carries no image annotation".to_string(),
    })?;

    let mut args = vec![
        "create".to_string(),
        guest.to_string(),
        template_for(config, image),
        "--hostname".to_string(),
        bundle.spec().hostname.clone(),
        "--storage".to_string(),
        config.storage.clone(),
    ];

    if let Some(mib) = bundle_memory_mib(bundle) {
        args.push("--memory".to_string());
        args.push(mib.to_string());
    }
    if let Some(cores) = bundle_cores(bundle) {
        args.push("--cores".to_string());
        args.push(cores.to_string());
    }

    let (unprivileged, features) = feature_flags(bundle);
    if unprivileged {
        args.push("--unprivileged".to_string());
        args.push("1".to_string());
    }
    if !features.is_empty() {
        args.push("--features".to_string());
        args.push(features.join(","));
    }

    args.extend(net_args(bundle)?);
    Ok(args)
}

/// Arguments after the program name that deliver `signal` to a guest.
///
/// TERM is a graceful `shutdown` bounded by `grace`; KILL is a hard `stop`;
/// anything else is delivered to the guest's init through `exec`.
pub fn signal_args(guest: u32, signal: Signal, grace: Duration) -> Vec<String> {
    let guest = guest.to_string();
    match signal {
        Signal::Term => vec![
            "shutdown".to_string(),
            guest,
            "--timeout".to_string(),
            grace.as_secs().max(1).to_string(),
        ],
        Signal::Kill => vec!["stop".to_string(), guest],
        other => vec![
            "exec".to_string(),
            guest,
            "--".to_string(),
            "kill".to_string(),
            format!("-{}", other.short_name()),
            "1".to_string(),
        ],
    }
}

/// True when `args` run a command inside the guest rather than a host
/// lifecycle subcommand.
pub fn is_guest_exec(args: &[String]) -> bool {
    args.first().is_some_and(|a| a == "exec")
}

/// Parses `status: <word>` output.
pub fn parse_status(output: &str) -> Result<ContainerStatus> {
    let word = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("status:"))
        .map(str::trim)
        .ok_or_else(|| unparsable("status", output))?;

    match word {
        "running" => Ok(ContainerStatus::Running),
        "stopped" => Ok(ContainerStatus::Stopped),
        _ => Err(unparsable("status", output)),
    }
}

/// Parses a `PID: <n>` line from the pid probe.
pub fn parse_pid(output: &str) -> Option<u32> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("PID:"))
        .and_then(|rest| rest.trim().parse::<u32>().ok())
        .filter(|pid| *pid != 0)
}

/// Pid probe argv with `{guest}` substituted.
pub fn pid_probe_argv(config: &ManagedConfig, guest: u32) -> Vec<String> {
    let guest = guest.to_string();
    config
        .pid_probe
        .iter()
        .map(|arg| arg.replace("{guest}", &guest))
        .collect()
}

fn unparsable(what: &str, output: &str) -> Error {
    Error::Driver {
        runtime: "managed-container".to_string(),
        operation: format!("parse {what}"),
        id: String::new(),
        kind: ErrorKind::Unknown,
        reason: format!("unexpected output: {}", output.trim()),
    }
}

/// Rounds a byte count up to MiB.
pub fn mib(bytes: u64) -> u64 {
    bytes.div_ceil(1024 * 1024)
}
