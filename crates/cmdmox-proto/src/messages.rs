// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Message types for the controller/launcher protocol.
//!
//! Requests flow launcher → server and are discriminated by `kind`
//! (`invocation`, `passthrough-result`). The server always answers with a
//! `response` message, which either carries literal stdio to emit or a
//! passthrough directive instructing the launcher to run the real binary.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::redact::{is_sensitive_env_key, REDACTED_PLACEHOLDER};

const DEBUG_FIELD_LIMIT: usize = 256;

/// Request union sent by a launcher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WireRequest {
    /// A freshly captured command invocation awaiting scripted behavior.
    Invocation(Invocation),
    /// The observed outcome of a real command run on the server's behalf.
    PassthroughResult(PassthroughResult),
}

/// Response union sent by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WireResponse {
    Response(Response),
}

/// A single observed command call.
///
/// `stdout`, `stderr`, and `exit_code` are empty at capture time and are
/// filled in by the controller once the response is determined, so the same
/// record serves as both the wire payload and the journal entry.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub command: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub invocation_id: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    /// Capture timestamp, assigned controller-side; never on the wire.
    #[serde(skip)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Invocation {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        stdin: impl Into<String>,
        env: BTreeMap<String, String>,
        invocation_id: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            stdin: stdin.into(),
            env,
            invocation_id: invocation_id.into(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            timestamp: None,
        }
    }

    /// Copy stdout/stderr/exit code from *response* (env is not copied).
    pub fn apply(&mut self, response: &Response) {
        self.stdout = response.stdout.clone();
        self.stderr = response.stderr.clone();
        self.exit_code = response.exit_code;
    }

    /// Render args the way diagnostics print them: `('a', 'b')`.
    pub fn format_args(&self) -> String {
        format_args_tuple(&self.args)
    }
}

/// Render an argument list with a tuple-like representation.
pub fn format_args_tuple(args: &[String]) -> String {
    let quoted: Vec<String> = args.iter().map(|a| format!("'{a}'")).collect();
    format!("({})", quoted.join(", "))
}

fn shorten(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let head: String = text.chars().take(limit.saturating_sub(1)).collect();
    format!("{head}…")
}

// Hand-written so journal dumps never leak secret env values.
impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let safe_env: BTreeMap<&str, &str> = self
            .env
            .iter()
            .map(|(key, value)| {
                let shown = if is_sensitive_env_key(key) {
                    REDACTED_PLACEHOLDER
                } else {
                    value.as_str()
                };
                (key.as_str(), shown)
            })
            .collect();
        f.debug_struct("Invocation")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("stdin", &shorten(&self.stdin, DEBUG_FIELD_LIMIT))
            .field("stdout", &shorten(&self.stdout, DEBUG_FIELD_LIMIT))
            .field("stderr", &shorten(&self.stderr, DEBUG_FIELD_LIMIT))
            .field("exit_code", &self.exit_code)
            .field("env", &safe_env)
            .field("invocation_id", &self.invocation_id)
            .finish()
    }
}

/// Instruction for a launcher to execute the real command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PassthroughRequest {
    pub invocation_id: String,
    /// PATH-like string to search for the real binary (shim dir excluded).
    pub lookup_path: String,
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
    /// Real-execution budget in seconds.
    #[serde(default = "default_passthrough_timeout")]
    pub timeout: f64,
}

fn default_passthrough_timeout() -> f64 {
    30.0
}

/// Outcome reported by a launcher after a passthrough execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PassthroughResult {
    pub invocation_id: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
}

/// Scripted behavior returned to a launcher.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    /// Variables the launcher merges into its own process environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passthrough: Option<PassthroughRequest>,
}

impl Response {
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failure(stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code,
            ..Self::default()
        }
    }
}

// Handler-return conveniences: user handlers may produce a bare stdout
// string, raw bytes (decoded with replacement), a (stdout, stderr, exit)
// tuple, or a full Response.

impl From<(String, String, i32)> for Response {
    fn from((stdout, stderr, exit_code): (String, String, i32)) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
            ..Self::default()
        }
    }
}

impl From<(&str, &str, i32)> for Response {
    fn from((stdout, stderr, exit_code): (&str, &str, i32)) -> Self {
        (stdout.to_string(), stderr.to_string(), exit_code).into()
    }
}

impl From<&str> for Response {
    fn from(stdout: &str) -> Self {
        Self::with_stdout(stdout)
    }
}

impl From<String> for Response {
    fn from(stdout: String) -> Self {
        Self::with_stdout(stdout)
    }
}

impl From<Vec<u8>> for Response {
    fn from(stdout: Vec<u8>) -> Self {
        Self::with_stdout(String::from_utf8_lossy(&stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_invocation() -> Invocation {
        Invocation::new(
            "git",
            vec!["status".to_string()],
            "",
            BTreeMap::from([("HOME".to_string(), "/home/u".to_string())]),
            "abc123",
        )
    }

    #[test]
    fn invocation_round_trips_with_kind_tag() {
        let wire = WireRequest::Invocation(sample_invocation());
        let line = crate::encode_line(&wire).unwrap();
        let text = String::from_utf8(line.clone()).unwrap();
        assert!(text.contains("\"kind\":\"invocation\""));
        assert!(text.ends_with('\n'));

        let back: WireRequest = crate::decode_line(&line).unwrap();
        assert_eq!(back, wire);
    }

    #[test]
    fn passthrough_result_uses_kebab_kind() {
        let wire = WireRequest::PassthroughResult(PassthroughResult {
            invocation_id: "abc".to_string(),
            stdout: "out".to_string(),
            stderr: String::new(),
            exit_code: 3,
        });
        let text = serde_json::to_string(&wire).unwrap();
        assert!(text.contains("\"kind\":\"passthrough-result\""));
    }

    #[test]
    fn response_omits_absent_passthrough() {
        let text = serde_json::to_string(&WireResponse::Response(Response::default())).unwrap();
        assert!(!text.contains("passthrough"));
        assert!(text.contains("\"kind\":\"response\""));
    }

    #[test]
    fn apply_copies_result_fields_only() {
        let mut inv = sample_invocation();
        let resp = Response {
            stdout: "so".to_string(),
            stderr: "se".to_string(),
            exit_code: 7,
            env: BTreeMap::from([("X".to_string(), "1".to_string())]),
            passthrough: None,
        };
        inv.apply(&resp);
        assert_eq!(inv.stdout, "so");
        assert_eq!(inv.stderr, "se");
        assert_eq!(inv.exit_code, 7);
        assert!(!inv.env.contains_key("X"));
    }

    #[test]
    fn decode_replaces_invalid_utf8() {
        let mut raw = serde_json::to_vec(&WireResponse::Response(Response::default())).unwrap();
        raw.push(b'\n');
        // Splice invalid bytes into trailing whitespace to prove lossy decode.
        raw.extend_from_slice(&[0xff, 0xfe]);
        let err = crate::decode_line::<WireResponse>(&raw);
        // Replacement characters after the JSON object are a parse error, but
        // the decoder must not panic on them.
        assert!(err.is_err());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let mut inv = sample_invocation();
        inv.env
            .insert("API_KEY".to_string(), "leaked".to_string());
        let dump = format!("{inv:?}");
        assert!(dump.contains("***"));
        assert!(!dump.contains("leaked"));
    }

    #[test]
    fn published_request_lines_parse() {
        let line =
            br#"{"kind":"invocation","invocation_id":"i1","command":"git","args":["st"],"stdin":"","env":{}}"#;
        let WireRequest::Invocation(inv) = crate::decode_line::<WireRequest>(line).unwrap() else {
            panic!("wrong kind");
        };
        assert_eq!(inv.command, "git");
        assert_eq!(inv.args, vec!["st".to_string()]);
        assert_eq!(inv.invocation_id, "i1");

        let line = br#"{"kind":"passthrough-result","invocation_id":"i1","stdout":"o","stderr":"e","exit_code":2}"#;
        let WireRequest::PassthroughResult(result) =
            crate::decode_line::<WireRequest>(line).unwrap()
        else {
            panic!("wrong kind");
        };
        assert_eq!(result.exit_code, 2);
    }

    #[test]
    fn published_response_lines_parse() {
        let line = br#"{"kind":"response","stdout":"out","stderr":"","exit_code":0,"env":{"A":"1"}}"#;
        let WireResponse::Response(response) = crate::decode_line::<WireResponse>(line).unwrap();
        assert_eq!(response.stdout, "out");
        assert_eq!(response.env.get("A").map(String::as_str), Some("1"));
        assert!(response.passthrough.is_none());

        let line = br#"{"kind":"response","stdout":"","stderr":"","exit_code":0,"env":{},"passthrough":{"invocation_id":"i1","lookup_path":"/usr/bin","extra_env":{},"timeout":30.0}}"#;
        let WireResponse::Response(response) = crate::decode_line::<WireResponse>(line).unwrap();
        let directive = response.passthrough.unwrap();
        assert_eq!(directive.invocation_id, "i1");
        assert_eq!(directive.lookup_path, "/usr/bin");
        assert!((directive.timeout - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn format_args_is_tuple_like() {
        let inv = Invocation::new(
            "git",
            vec!["clone".to_string(), "repo".to_string()],
            "",
            BTreeMap::new(),
            "id",
        );
        assert_eq!(inv.format_args(), "('clone', 'repo')");
    }
}
