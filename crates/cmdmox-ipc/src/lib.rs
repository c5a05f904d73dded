// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! CmdMox IPC transport.
//!
//! One logical endpoint path serves both platforms: a Unix domain socket
//! file on POSIX, and a named pipe whose name is derived by hashing the same
//! logical path on Windows. The server side is a tokio accept loop owned by
//! a dedicated background thread so the controller's public API stays
//! synchronous; the client side is a short-lived blocking connection, one
//! round trip per request, as used by the launcher.

mod client;
mod endpoint;
mod server;
mod socket_utils;

use std::path::PathBuf;
use std::time::Duration;

pub use client::{invoke_server, report_passthrough_result, RetryConfig};
pub use endpoint::{derive_pipe_name, Endpoint};
pub use server::{IpcHandlers, IpcServer};
pub use socket_utils::{cleanup_stale_socket, wait_for_endpoint};

/// Default per-operation client timeout.
pub const DEFAULT_IPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IPC I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("IPC operation timed out after {0:.1?}")]
    Timeout(Duration),

    #[error(transparent)]
    Protocol(#[from] cmdmox_proto::ProtocolError),

    #[error("IPC endpoint {0} is still in use")]
    AddressInUse(PathBuf),

    #[error("IPC endpoint not ready: {0}")]
    NotReady(String),

    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

pub(crate) fn validate_timeout(timeout: Duration) -> Result<()> {
    if timeout.is_zero() {
        return Err(TransportError::InvalidConfig(
            "timeout must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
