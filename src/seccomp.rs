//! Seccomp profile generation from recorded syscalls
//!
//! The broker records the syscalls each pod was observed making. A profile
//! denies everything by default (`SCMP_ACT_ERRNO`) and allows exactly the
//! recorded set, which mirrors how the network policies treat traffic.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default action applied to syscalls outside the recorded set
pub const DEFAULT_ACTION: &str = "SCMP_ACT_ERRNO";

/// Action applied to the recorded syscalls
pub const ALLOW_ACTION: &str = "SCMP_ACT_ALLOW";

/// Syscall row as stored by the broker: names are comma-separated
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PodSyscalls {
    /// Pod the syscalls were recorded for
    #[serde(default)]
    pub pod_name: String,
    /// Namespace of that pod
    #[serde(default)]
    pub pod_namespace: String,
    /// Comma-separated syscall names
    #[serde(default)]
    pub syscalls: String,
    /// Node architecture the syscalls were recorded on
    #[serde(default)]
    pub arch: String,
}

/// A seccomp security profile
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeccompProfile {
    /// Action for syscalls not matched by any rule
    pub default_action: String,
    /// Architectures the profile applies to
    pub architectures: Vec<String>,
    /// Syscall rules
    pub syscalls: Vec<SyscallRule>,
}

/// One seccomp rule: a set of syscall names and the action for them
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SyscallRule {
    /// Syscall names the rule matches
    pub names: Vec<String>,
    /// Action taken for matched syscalls
    pub action: String,
}

/// Build a profile allowing exactly the recorded syscalls
///
/// Names are deduplicated and sorted so repeated generation for the same pod
/// produces byte-identical profiles.
pub fn build_profile(record: &PodSyscalls) -> SeccompProfile {
    let names: BTreeSet<String> = record
        .syscalls
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();

    SeccompProfile {
        default_action: DEFAULT_ACTION.to_string(),
        architectures: architectures_for(&record.arch),
        syscalls: vec![SyscallRule {
            names: names.into_iter().collect(),
            action: ALLOW_ACTION.to_string(),
        }],
    }
}

/// Map a recorded node architecture to seccomp architecture tokens
fn architectures_for(arch: &str) -> Vec<String> {
    match arch.trim().to_ascii_lowercase().as_str() {
        "x86_64" | "amd64" => vec!["SCMP_ARCH_X86_64".to_string()],
        "arm64" | "aarch64" => vec!["SCMP_ARCH_ARM64".to_string()],
        other => {
            warn!(arch = %other, "unknown architecture, emitting profile without architectures");
            Vec::new()
        }
    }
}

/// Serialize a profile the way runtimes expect it on disk
pub fn to_json(profile: &SeccompProfile) -> crate::Result<String> {
    serde_json::to_string_pretty(profile)
        .map_err(|err| crate::Error::serialization(err.to_string()))
}
