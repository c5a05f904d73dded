// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Scoped process-environment and temp-directory management.
//!
//! The environment manager is the only component that touches process
//! globals (environment variables and PATH). It records exactly what it
//! changed and undoes exactly that on every exit path; everything else in
//! the crate treats the environment as read-only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::platform::normalize_path_entry;

pub use cmdmox_proto::{
    CMDMOX_IPC_SOCKET_ENV, CMDMOX_IPC_TIMEOUT_ENV, CMDMOX_REAL_COMMAND_ENV_PREFIX,
};

/// Optional worker qualifier mixed into temp-directory names so parallel
/// test processes never collide.
pub const CMDMOX_WORKER_ID_ENV: &str = "CMDMOX_WORKER_ID";

const REMOVE_ATTEMPTS: u32 = 4;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(100);

// The process environment is a singleton, so at most one manager may be
// active per process regardless of thread.
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Manage temporary environment modifications for CmdMox.
///
/// Not re-entrant: entering a second manager while one is active fails with
/// a lifecycle error. This keeps the restore logic simple and prevents
/// environment leakage between controllers.
pub struct EnvironmentManager {
    prefix: String,
    orig_env: Option<HashMap<String, String>>,
    shim_dir: Option<PathBuf>,
    socket_path: Option<PathBuf>,
    ipc_timeout: Option<f64>,
    created_dir: Option<PathBuf>,
}

impl Default for EnvironmentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentManager {
    pub fn new() -> Self {
        Self::with_prefix("cmdmox")
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            orig_env: None,
            shim_dir: None,
            socket_path: None,
            ipc_timeout: None,
            created_dir: None,
        }
    }

    /// Whether this manager currently owns the process environment.
    pub fn is_active(&self) -> bool {
        self.orig_env.is_some()
    }

    pub fn shim_dir(&self) -> Option<&Path> {
        self.shim_dir.as_deref()
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// The PATH value observed before `enter()` mutated it.
    pub fn original_path(&self) -> String {
        self.orig_env
            .as_ref()
            .and_then(|env| env.get("PATH").cloned())
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_default()
    }

    /// Snapshot the environment, create the shim directory, and mutate PATH.
    pub fn enter(&mut self) -> Result<()> {
        if self.is_active() {
            return Err(Error::Lifecycle(
                "environment manager cannot be nested".to_string(),
            ));
        }
        if ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Lifecycle(
                "another environment manager is already active in this process".to_string(),
            ));
        }

        match self.enter_inner() {
            Ok(()) => Ok(()),
            Err(err) => {
                ACTIVE.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn enter_inner(&mut self) -> Result<()> {
        let snapshot: HashMap<String, String> = std::env::vars().collect();

        let dir = tempfile::Builder::new()
            .prefix(&self.temp_dir_prefix())
            .tempdir()?
            .into_path();
        debug!(dir = %dir.display(), "created shim directory");

        let new_path = prepend_to_search_path(&dir, snapshot.get("PATH").map(String::as_str));
        self.orig_env = Some(snapshot);
        std::env::set_var("PATH", new_path);

        #[cfg(windows)]
        {
            ensure_cmd_pathext();
            if dir.as_os_str().len() > 240 {
                warn!(dir = %dir.display(), "shim directory approaches MAX_PATH; \
                      consider a shorter temp root");
            }
        }

        self.socket_path = Some(dir.join("ipc.sock"));
        self.shim_dir = Some(dir.clone());
        self.created_dir = Some(dir);
        self.export_ipc_environment(None)?;
        Ok(())
    }

    fn temp_dir_prefix(&self) -> String {
        let worker = std::env::var(CMDMOX_WORKER_ID_ENV).unwrap_or_else(|_| "main".to_string());
        format!("{}-{}-{}-", self.prefix, worker, std::process::id())
    }

    /// Expose the IPC configuration variables for active launchers.
    ///
    /// A `timeout` of `None` re-exports the previously configured value, or
    /// clears the variable when none has been set yet.
    pub fn export_ipc_environment(&mut self, timeout: Option<f64>) -> Result<()> {
        let socket_path = self.socket_path.as_ref().ok_or_else(|| {
            Error::Lifecycle("cannot export IPC settings before entering the environment".into())
        })?;
        std::env::set_var(CMDMOX_IPC_SOCKET_ENV, socket_path);

        let effective = match timeout {
            Some(value) => {
                if !(value > 0.0 && value.is_finite()) {
                    return Err(Error::Configuration(format!(
                        "IPC timeout must be a positive finite number, got {value}"
                    )));
                }
                self.ipc_timeout = Some(value);
                Some(value)
            }
            None => self.ipc_timeout,
        };

        match effective {
            Some(value) => std::env::set_var(CMDMOX_IPC_TIMEOUT_ENV, value.to_string()),
            None => std::env::remove_var(CMDMOX_IPC_TIMEOUT_ENV),
        }
        Ok(())
    }

    /// Restore the snapshot and remove the temp directory.
    ///
    /// Every cleanup action is attempted; failures are collected, logged,
    /// and reported once at the end rather than aborting the teardown.
    pub fn exit(&mut self) -> Result<()> {
        let mut cleanup_errors: Vec<String> = Vec::new();

        if let Some(snapshot) = self.orig_env.take() {
            restore_environment(&snapshot);
        }
        ACTIVE.store(false, Ordering::SeqCst);

        if let Some(dir) = self.created_dir.take() {
            if dir.exists() {
                if let Err(err) = robust_remove_dir(&dir) {
                    cleanup_errors.push(format!("directory cleanup failed: {err}"));
                }
            }
        }

        self.shim_dir = None;
        self.socket_path = None;
        self.ipc_timeout = None;

        if cleanup_errors.is_empty() {
            Ok(())
        } else {
            let joined = cleanup_errors.join("; ");
            warn!(%joined, "environment teardown encountered errors");
            Err(Error::Environment(joined))
        }
    }
}

impl Drop for EnvironmentManager {
    fn drop(&mut self) {
        if self.is_active() {
            let _ = self.exit();
        }
    }
}

/// Build the replacement PATH with *dir* prepended.
///
/// Existing entries are trimmed, empty segments dropped, duplicates removed
/// under host case semantics, and any pre-existing occurrence of *dir*
/// filtered out so the shim directory appears exactly once, first.
pub fn prepend_to_search_path(dir: &Path, current: Option<&str>) -> String {
    let sep = path_separator();
    let dir_str = dir.to_string_lossy().to_string();
    let dir_norm = normalize_path_entry(&dir_str);

    let mut entries = vec![dir_str];
    let mut seen = vec![dir_norm];
    for entry in current.unwrap_or_default().split(sep) {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let normalized = normalize_path_entry(trimmed);
        if seen.contains(&normalized) {
            continue;
        }
        seen.push(normalized);
        entries.push(trimmed.to_string());
    }
    entries.join(&sep.to_string())
}

/// Remove *dir* from a PATH-like string, de-duplicating the rest.
pub fn strip_from_search_path(dir: &Path, path: &str) -> String {
    let sep = path_separator();
    let dir_norm = normalize_path_entry(&dir.to_string_lossy());

    let mut entries: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    for entry in path.split(sep) {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let normalized = normalize_path_entry(trimmed);
        if normalized == dir_norm || seen.contains(&normalized) {
            continue;
        }
        seen.push(normalized);
        entries.push(trimmed.to_string());
    }
    entries.join(&sep.to_string())
}

pub(crate) fn path_separator() -> char {
    if cfg!(windows) {
        ';'
    } else {
        ':'
    }
}

fn restore_environment(snapshot: &HashMap<String, String>) {
    let current: HashMap<String, String> = std::env::vars().collect();
    for (key, value) in snapshot {
        if current.get(key) != Some(value) {
            std::env::set_var(key, value);
        }
    }
    for key in current.keys() {
        if !snapshot.contains_key(key) {
            std::env::remove_var(key);
        }
    }
}

#[cfg(windows)]
fn ensure_cmd_pathext() {
    let pathext = std::env::var("PATHEXT").unwrap_or_default();
    let has_cmd = pathext
        .split(';')
        .any(|ext| ext.trim().eq_ignore_ascii_case(".cmd"));
    if !has_cmd {
        let updated = if pathext.trim().is_empty() {
            ".CMD".to_string()
        } else {
            format!("{pathext};.CMD")
        };
        std::env::set_var("PATHEXT", updated);
    }
}

/// Remove a directory tree, retrying transient failures.
fn robust_remove_dir(path: &Path) -> std::io::Result<()> {
    let mut last_err = None;
    for attempt in 0..REMOVE_ATTEMPTS {
        match std::fs::remove_dir_all(path) {
            Ok(()) => {
                debug!(dir = %path.display(), "removed shim directory");
                return Ok(());
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                debug!(
                    attempt = attempt + 1,
                    dir = %path.display(),
                    %err,
                    "removal attempt failed"
                );
                last_err = Some(err);
                if attempt + 1 < REMOVE_ATTEMPTS {
                    std::thread::sleep(REMOVE_RETRY_DELAY);
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("directory removal failed")))
}
