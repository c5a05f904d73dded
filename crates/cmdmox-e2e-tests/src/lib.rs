// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Helpers shared by the end-to-end tests.

use std::io::Write;
use std::process::{Command, Output, Stdio};

/// Invoke *command* the way code under test would: resolved via PATH, with
/// the current (replay-mutated) environment inherited.
pub fn run_shimmed(command: &str, args: &[&str], stdin: Option<&str>) -> std::io::Result<Output> {
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(payload) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(payload.as_bytes())?;
        }
    } else {
        drop(child.stdin.take());
    }

    child.wait_with_output()
}

/// Stdout of *output* decoded with replacement.
pub fn stdout_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Stderr of *output* decoded with replacement.
pub fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}
