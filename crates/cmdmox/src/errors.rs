// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the CmdMox framework.

use std::fmt;

use thiserror::Error;

/// Result type alias for CmdMox operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the record/replay/verify lifecycle.
#[derive(Debug, Error)]
pub enum Error {
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    #[error("replay environment is not ready: {0}")]
    MissingEnvironment(String),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Transport(#[from] cmdmox_ipc::TransportError),

    #[error(transparent)]
    Protocol(#[from] cmdmox_proto::ProtocolError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("environment cleanup failed: {0}")]
    Environment(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single discrepancy found by one of the verifiers.
#[derive(Debug, Error)]
pub enum VerificationFailure {
    #[error("unexpected command invocation: {0}")]
    Unexpected(String),

    #[error("unfulfilled expectation: {0}")]
    Unfulfilled(String),

    #[error("out-of-order invocations: {0}")]
    OutOfOrder(String),

    #[error("surplus invocations: {0}")]
    TooManyCalls(String),
}

/// Aggregated verification outcome covering every discrepancy found.
///
/// All three verifiers run to completion before this is raised, so a single
/// failed `verify()` reports the whole picture instead of the first problem.
#[derive(Debug, Default)]
pub struct VerificationError {
    pub failures: Vec<VerificationFailure>,
}

impl VerificationError {
    pub fn new(failures: Vec<VerificationFailure>) -> Self {
        Self { failures }
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "verification failed with {} problem(s):",
            self.failures.len()
        )?;
        for (index, failure) in self.failures.iter().enumerate() {
            writeln!(f, "  {}) {}", index + 1, failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for VerificationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_error_lists_every_failure() {
        let err = VerificationError::new(vec![
            VerificationFailure::Unexpected("git('commit')".to_string()),
            VerificationFailure::Unfulfilled("expected curl once, got 0".to_string()),
        ]);
        let text = err.to_string();
        assert!(text.contains("2 problem(s)"));
        assert!(text.contains("1) unexpected command invocation: git('commit')"));
        assert!(text.contains("2) unfulfilled expectation: expected curl once, got 0"));
    }
}
