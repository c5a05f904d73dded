// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Platform helpers shared across CmdMox modules.
//!
//! Case semantics for PATH entries and shim names live here so the
//! environment manager, shim generator, and launcher-path filtering agree on
//! a single answer.

/// Advisory platform override honored by diagnostics and case semantics.
/// Set it to `windows`, `macos`, or `linux` to emulate another platform in
/// tests without spawning a different OS.
pub const PLATFORM_OVERRIDE_ENV: &str = "CMDMOX_PLATFORM_OVERRIDE";

/// The effective platform name (`linux`, `macos`, `windows`, ...).
pub fn current_platform() -> String {
    match std::env::var(PLATFORM_OVERRIDE_ENV) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_lowercase(),
        _ => std::env::consts::OS.to_string(),
    }
}

/// Whether the effective host resolves filenames case-insensitively.
///
/// Windows and macOS both ship case-insensitive filesystems by default;
/// PATH de-duplication and shim-name conflict checks key off this.
pub fn is_case_insensitive_host() -> bool {
    matches!(current_platform().as_str(), "windows" | "macos")
}

/// Normalize a PATH entry for duplicate detection on the effective host.
pub fn normalize_path_entry(entry: &str) -> String {
    let trimmed = entry.trim();
    if is_case_insensitive_host() {
        trimmed.to_lowercase()
    } else {
        trimmed.to_string()
    }
}
