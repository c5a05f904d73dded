// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logical transport endpoint shared by both platforms.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Prefix for derived Windows pipe names.
pub const PIPE_NAME_PREFIX: &str = r"\\.\pipe\cmdmox-";

/// The IPC rendezvous point.
///
/// The logical path (the socket file inside the shim directory) is what gets
/// exported to launchers on every platform; Windows launchers hash it into a
/// pipe name with [`derive_pipe_name`], so their PATH-filtering logic needs
/// no platform branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    path: PathBuf,
}

impl Endpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The logical socket path exported in the environment.
    pub fn logical_path(&self) -> &Path {
        &self.path
    }

    /// The named-pipe rendition of this endpoint.
    pub fn pipe_name(&self) -> String {
        derive_pipe_name(&self.path)
    }
}

/// Return a deterministic named-pipe name for *path*.
///
/// Windows caps pipe names at 256 characters; a 32-character digest leaves
/// ample headroom for the prefix while staying collision-resistant per shim
/// directory.
pub fn derive_pipe_name(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{PIPE_NAME_PREFIX}{}", &hex[..32])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_name_is_deterministic() {
        let a = derive_pipe_name(Path::new("/tmp/cmdmox-1/ipc.sock"));
        let b = derive_pipe_name(Path::new("/tmp/cmdmox-1/ipc.sock"));
        assert_eq!(a, b);
        assert!(a.starts_with(PIPE_NAME_PREFIX));
    }

    #[test]
    fn pipe_name_differs_per_directory() {
        let a = derive_pipe_name(Path::new("/tmp/cmdmox-1/ipc.sock"));
        let b = derive_pipe_name(Path::new("/tmp/cmdmox-2/ipc.sock"));
        assert_ne!(a, b);
    }

    #[test]
    fn pipe_name_stays_within_windows_limit() {
        let long = "x".repeat(4096);
        let name = derive_pipe_name(Path::new(&long));
        assert!(name.len() < 256);
    }
}
