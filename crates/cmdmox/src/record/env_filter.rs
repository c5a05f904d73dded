// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Environment subset filtering for fixture recordings.
//!
//! Fixtures capture only a meaningful slice of the process environment:
//! system paths and identity variables are dropped, secret-bearing keys are
//! never persisted, and CmdMox's own variables are excluded so fixtures stay
//! portable across runs.

use std::collections::BTreeMap;

use cmdmox_proto::is_sensitive_env_key;

/// System-specific keys excluded by default.
pub const EXCLUDED_SYSTEM_KEYS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "SSH_AUTH_SOCK",
    "GPG_AGENT_INFO",
];

const INTERNAL_PREFIX: &str = "CMDMOX_";

// Known command-specific prefixes: command name -> env var prefix.
const COMMAND_ENV_PREFIXES: &[(&str, &str)] = &[
    ("git", "GIT_"),
    ("aws", "AWS_"),
    ("docker", "DOCKER_"),
    ("npm", "NPM_"),
    ("pip", "PIP_"),
    ("cargo", "CARGO_"),
    ("go", "GO"),
    ("rustc", "RUSTC_"),
];

/// Return the subset of *env* suitable for fixture persistence.
///
/// Keys in *allowlist* always pass through; everything else is subject to
/// the exclusion rules above.
pub fn filter_env_subset(
    env: &BTreeMap<String, String>,
    command: &str,
    allowlist: &[String],
) -> BTreeMap<String, String> {
    let command_prefix = COMMAND_ENV_PREFIXES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(command))
        .map(|(_, prefix)| *prefix);

    let mut result = BTreeMap::new();
    for (key, value) in env {
        if allowlist.iter().any(|allowed| allowed == key) {
            result.insert(key.clone(), value.clone());
            continue;
        }
        if key.starts_with(INTERNAL_PREFIX) {
            continue;
        }
        if EXCLUDED_SYSTEM_KEYS.contains(&key.as_str()) {
            continue;
        }
        if is_sensitive_env_key(key) {
            continue;
        }
        if let Some(prefix) = command_prefix {
            if key.starts_with(prefix) {
                result.insert(key.clone(), value.clone());
                continue;
            }
        }
        result.insert(key.clone(), value.clone());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn system_internal_and_secret_keys_are_dropped() {
        let filtered = filter_env_subset(
            &env(&[
                ("PATH", "/usr/bin"),
                ("HOME", "/home/u"),
                ("CMDMOX_IPC_SOCKET", "/tmp/ipc.sock"),
                ("API_TOKEN", "secret"),
                ("LANG", "C.UTF-8"),
            ]),
            "git",
            &[],
        );
        assert_eq!(filtered, env(&[("LANG", "C.UTF-8")]));
    }

    #[test]
    fn allowlist_overrides_exclusions() {
        let filtered = filter_env_subset(
            &env(&[("HOME", "/home/u")]),
            "",
            &["HOME".to_string()],
        );
        assert_eq!(filtered, env(&[("HOME", "/home/u")]));
    }

    #[test]
    fn command_prefix_keys_are_kept() {
        let filtered = filter_env_subset(
            &env(&[("GIT_AUTHOR_NAME", "dev"), ("LC_ALL", "C")]),
            "git",
            &[],
        );
        assert!(filtered.contains_key("GIT_AUTHOR_NAME"));
        assert!(filtered.contains_key("LC_ALL"));
    }
}
