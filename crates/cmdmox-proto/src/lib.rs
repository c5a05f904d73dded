// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! CmdMox Protocol — line-delimited JSON messages exchanged between the
//! controller's IPC server and the per-command launcher.
//!
//! Every message on the wire is a single UTF-8 JSON object terminated by a
//! newline and discriminated by its `kind` field. Stdio captured at the
//! boundary is always decoded with UTF-8 replacement; binary payloads are
//! not supported.

pub mod messages;
pub mod redact;

pub use messages::{
    format_args_tuple, Invocation, PassthroughRequest, PassthroughResult, Response, WireRequest,
    WireResponse,
};
pub use redact::{is_sensitive_env_key, redacted_env, REDACTED_PLACEHOLDER};

// Environment variables published to launchers. They live here because both
// the controller (exporting) and the launcher (reading) speak this contract.

/// Logical endpoint path (socket file on POSIX, hashed into a pipe name on
/// Windows).
pub const CMDMOX_IPC_SOCKET_ENV: &str = "CMDMOX_IPC_SOCKET";
/// Client-side per-operation timeout in seconds (positive finite float).
pub const CMDMOX_IPC_TIMEOUT_ENV: &str = "CMDMOX_IPC_TIMEOUT";
/// Per-command absolute-path override for passthrough real binaries.
pub const CMDMOX_REAL_COMMAND_ENV_PREFIX: &str = "CMDMOX_REAL_COMMAND_";

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed JSON on IPC channel: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Encode *message* as a single newline-terminated JSON line.
pub fn encode_line<T: serde::Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(message)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Decode one JSON line into *T*, replacing invalid UTF-8 first.
///
/// The replacement step means a launcher that captured undecodable bytes
/// still produces a well-formed (if lossy) message rather than a protocol
/// failure.
pub fn decode_line<T: serde::de::DeserializeOwned>(line: &[u8]) -> Result<T, ProtocolError> {
    let text = String::from_utf8_lossy(line);
    Ok(serde_json::from_str(text.trim_end_matches(['\r', '\n']))?)
}
