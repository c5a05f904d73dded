// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Redaction of secret-bearing environment values in diagnostics.
//!
//! Any diagnostic that prints an environment mapping (verifier reports,
//! mismatch explanations, invocation debug output) must pass it through
//! [`redacted_env`] first so captured secrets never reach test logs.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Replacement string substituted for sensitive values.
pub const REDACTED_PLACEHOLDER: &str = "***";

/// Substrings that mark an environment key as sensitive wherever they occur.
pub const SENSITIVE_ENV_KEY_TOKENS: &[&str] =
    &["key", "token", "secret", "password", "credential"];

// Segment-anchored pattern for short markers (PASS, PWD, ...) that would be
// too noisy as bare substrings ("compass", "bypass").
static SECRET_ENV_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(^|[_-])(KEY|TOKEN|SECRET|PASSWORD|CREDENTIALS?|PASS(?:WORD)?|PWD)([_-]|\d|$)")
        .expect("secret key pattern is valid")
});

/// Return `true` when *key* names a value that must never be printed.
pub fn is_sensitive_env_key(key: &str) -> bool {
    let folded = key.to_lowercase();
    SENSITIVE_ENV_KEY_TOKENS.iter().any(|tok| folded.contains(tok))
        || SECRET_ENV_KEY_RE.is_match(key)
}

/// Return a copy of *env* with sensitive values replaced by `***`.
pub fn redacted_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(key, value)| {
            let shown = if is_sensitive_env_key(key) {
                REDACTED_PLACEHOLDER.to_string()
            } else {
                value.clone()
            };
            (key.clone(), shown)
        })
        .collect()
}
