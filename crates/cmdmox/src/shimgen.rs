// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shim generation: one filesystem entry per registered command, each
//! resolving to the single universal launcher binary.
//!
//! POSIX entries are symlinks named exactly as the command; Windows entries
//! are `<command>.cmd` batch launchers. Re-generation is idempotent and
//! repairs broken or missing entries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::{Error, Result};
use crate::platform::is_case_insensitive_host;

/// Explicit launcher override, used by test harnesses that build the shim
/// binary under a nonstandard name or location.
pub const CMDMOX_SHIM_BIN_ENV: &str = "CMDMOX_SHIM_BIN";

const LAUNCHER_BIN_NAME: &str = "cmdmox-shim";

/// Create shims for *commands* inside *directory*.
///
/// Returns the mapping from command name to created entry. Healthy entries
/// are recreated in place, so calling this repeatedly (including for late
/// registrations during replay) is safe.
pub fn create_shims<'a, I>(directory: &Path, commands: I) -> Result<BTreeMap<String, PathBuf>>
where
    I: IntoIterator<Item = &'a str>,
{
    if !directory.is_dir() {
        return Err(Error::MissingEnvironment(format!(
            "{} is not a directory",
            directory.display()
        )));
    }

    let names: Vec<&str> = commands.into_iter().collect();
    for name in &names {
        validate_command_name(name)?;
    }
    reject_case_conflicts(&names)?;

    let launcher = locate_launcher()?;
    ensure_executable(&launcher)?;

    let mut mapping = BTreeMap::new();
    for name in names {
        let entry = create_entry(directory, name, &launcher)?;
        debug!(command = name, entry = %entry.display(), "created shim");
        mapping.insert(name.to_string(), entry);
    }
    Ok(mapping)
}

/// Find the universal launcher binary.
///
/// Resolution order: the `CMDMOX_SHIM_BIN` override, then the directory of
/// the current executable (and its parent, covering `target/<profile>/deps`),
/// then PATH.
pub fn locate_launcher() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(CMDMOX_SHIM_BIN_ENV) {
        let path = PathBuf::from(override_path);
        if path.is_file() {
            return Ok(path);
        }
        return Err(Error::Configuration(format!(
            "{CMDMOX_SHIM_BIN_ENV} points at {} which does not exist",
            path.display()
        )));
    }

    let bin_name = launcher_file_name();
    if let Ok(current) = std::env::current_exe() {
        let mut dirs: Vec<&Path> = Vec::new();
        if let Some(dir) = current.parent() {
            dirs.push(dir);
            if let Some(parent) = dir.parent() {
                dirs.push(parent);
            }
        }
        for dir in dirs {
            let candidate = dir.join(&bin_name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    which::which(LAUNCHER_BIN_NAME).map_err(|_| {
        Error::Configuration(format!(
            "launcher binary '{LAUNCHER_BIN_NAME}' not found; build it or set {CMDMOX_SHIM_BIN_ENV}"
        ))
    })
}

fn launcher_file_name() -> String {
    if cfg!(windows) {
        format!("{LAUNCHER_BIN_NAME}.exe")
    } else {
        LAUNCHER_BIN_NAME.to_string()
    }
}

fn validate_command_name(name: &str) -> Result<()> {
    let malformed = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if malformed {
        return Err(Error::Configuration(format!(
            "invalid command name: {name:?}"
        )));
    }
    Ok(())
}

fn reject_case_conflicts(names: &[&str]) -> Result<()> {
    if !is_case_insensitive_host() {
        return Ok(());
    }
    let mut seen: BTreeMap<String, &str> = BTreeMap::new();
    for name in names {
        if let Some(existing) = seen.insert(name.to_lowercase(), name) {
            if existing != *name {
                return Err(Error::Configuration(format!(
                    "command names {existing:?} and {name:?} conflict on a \
                     case-insensitive filesystem"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn ensure_executable(launcher: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(launcher)?;
    let mode = metadata.permissions().mode();
    if mode & 0o111 == 0 {
        let mut perms = metadata.permissions();
        perms.set_mode(mode | 0o111);
        std::fs::set_permissions(launcher, perms)?;
    }
    Ok(())
}

#[cfg(windows)]
fn ensure_executable(_launcher: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_entry(directory: &Path, name: &str, launcher: &Path) -> Result<PathBuf> {
    let link = directory.join(name);
    match std::fs::symlink_metadata(&link) {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            std::fs::remove_file(&link)?;
        }
        Ok(_) => {
            return Err(Error::Configuration(format!(
                "{} already exists and is not a symlink",
                link.display()
            )));
        }
        Err(_) => {}
    }
    std::os::unix::fs::symlink(launcher, &link)?;
    Ok(link)
}

#[cfg(windows)]
fn create_entry(directory: &Path, name: &str, launcher: &Path) -> Result<PathBuf> {
    let entry = directory.join(format!("{name}.cmd"));
    if entry.exists() && !entry.is_file() {
        return Err(Error::Configuration(format!(
            "{} already exists and is not a file",
            entry.display()
        )));
    }
    std::fs::write(&entry, format_batch_launcher(launcher))?;
    Ok(entry)
}

/// Batch launcher contents: CRLF line endings, `%` and `^` escaped in the
/// launcher path, all arguments forwarded.
#[cfg_attr(unix, allow(dead_code))]
fn format_batch_launcher(launcher: &Path) -> String {
    let escaped = launcher
        .to_string_lossy()
        .replace('%', "%%")
        .replace('^', "^^");
    format!("@echo off\r\nsetlocal ENABLEDELAYEDEXPANSION\r\n\"{escaped}\" %*\r\n")
}
