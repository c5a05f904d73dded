// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Endpoint hygiene: stale-socket cleanup before bind and readiness polling
//! after server start.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::{Endpoint, Result, TransportError};

const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Remove a pre-existing socket file when no server is listening.
///
/// A live listener on the endpoint is an error: two controllers must never
/// share a rendezvous point.
pub fn cleanup_stale_socket(endpoint: &Endpoint) -> Result<()> {
    #[cfg(unix)]
    {
        let path = endpoint.logical_path();
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            return Err(TransportError::AddressInUse(path.to_path_buf()));
        }
        if path.exists() {
            if let Err(err) = std::fs::remove_file(path) {
                warn!(path = %path.display(), %err, "could not unlink stale socket");
            }
        }
    }
    #[cfg(windows)]
    {
        // Pipe instances disappear with their creating process; a busy name
        // is detected at bind time instead.
        let _ = endpoint;
    }
    Ok(())
}

/// Poll until the endpoint accepts connections, with exponential backoff.
pub fn wait_for_endpoint(endpoint: &Endpoint, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut interval = INITIAL_POLL_INTERVAL;
    while Instant::now() < deadline {
        if probe(endpoint) {
            return Ok(());
        }
        std::thread::sleep(interval);
        interval = (interval * 3 / 2).min(MAX_POLL_INTERVAL);
    }
    Err(TransportError::NotReady(format!(
        "{} not accepting connections within {:?}",
        endpoint.logical_path().display(),
        timeout
    )))
}

#[cfg(unix)]
fn probe(endpoint: &Endpoint) -> bool {
    let path = endpoint.logical_path();
    path.exists() && std::os::unix::net::UnixStream::connect(path).is_ok()
}

#[cfg(windows)]
fn probe(endpoint: &Endpoint) -> bool {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(endpoint.pipe_name())
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_times_out_on_missing_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::new(dir.path().join("absent.sock"));
        let err = wait_for_endpoint(&endpoint, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, TransportError::NotReady(_)));
    }

    #[cfg(unix)]
    #[test]
    fn stale_socket_file_is_unlinked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        std::fs::write(&path, b"").unwrap();
        let endpoint = Endpoint::new(&path);
        cleanup_stale_socket(&endpoint).unwrap();
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn live_listener_is_reported_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let endpoint = Endpoint::new(&path);
        let err = cleanup_stale_socket(&endpoint).unwrap_err();
        assert!(matches!(err, TransportError::AddressInUse(_)));
    }
}
