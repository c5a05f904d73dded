// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Expectation matching for command doubles.

use std::collections::BTreeMap;
use std::fmt;

use cmdmox_proto::{format_args_tuple, is_sensitive_env_key, Invocation, REDACTED_PLACEHOLDER};

use crate::comparators::{ArgMatcher, StdinMatcher};

/// Constraint on the argument vector.
#[derive(Clone, Debug, Default)]
pub enum ArgsSpec {
    /// No constraint on arguments.
    #[default]
    Unconstrained,
    /// Arguments must equal this list exactly.
    Exact(Vec<String>),
    /// One comparator per argv element, matched positionally.
    Matchers(Vec<ArgMatcher>),
}

/// Declaration of how a command should be invoked.
#[derive(Clone, Debug)]
pub struct Expectation {
    pub(crate) name: String,
    pub(crate) args: ArgsSpec,
    pub(crate) stdin: Option<StdinMatcher>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) count: u32,
    pub(crate) count_explicit: bool,
    pub(crate) ordered: bool,
}

impl Expectation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: ArgsSpec::Unconstrained,
            stdin: None,
            env: BTreeMap::new(),
            count: 1,
            count_explicit: false,
            ordered: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    pub fn env_overrides(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub(crate) fn set_args(&mut self, args: Vec<String>) {
        self.args = ArgsSpec::Exact(args);
    }

    pub(crate) fn set_matchers(&mut self, matchers: Vec<ArgMatcher>) {
        self.args = ArgsSpec::Matchers(matchers);
    }

    pub(crate) fn set_stdin(&mut self, matcher: StdinMatcher) {
        self.stdin = Some(matcher);
    }

    pub(crate) fn set_env(&mut self, env: BTreeMap<String, String>) {
        self.env = env;
    }

    pub(crate) fn set_count(&mut self, count: u32) {
        self.count = count;
        self.count_explicit = true;
    }

    /// Return `true` when *invocation* satisfies this expectation.
    pub fn matches(&self, invocation: &Invocation) -> bool {
        self.matches_command(invocation)
            && self.matches_args(invocation)
            && self.matches_stdin(invocation)
            && self.matches_env(invocation)
    }

    fn matches_command(&self, invocation: &Invocation) -> bool {
        invocation.command == self.name
    }

    fn matches_args(&self, invocation: &Invocation) -> bool {
        match &self.args {
            ArgsSpec::Unconstrained => true,
            ArgsSpec::Exact(expected) => &invocation.args == expected,
            ArgsSpec::Matchers(matchers) => {
                invocation.args.len() == matchers.len()
                    && invocation
                        .args
                        .iter()
                        .zip(matchers)
                        .all(|(arg, matcher)| matcher.matches(arg))
            }
        }
    }

    fn matches_stdin(&self, invocation: &Invocation) -> bool {
        match &self.stdin {
            None => true,
            Some(matcher) => matcher.matches(&invocation.stdin),
        }
    }

    // Env overrides are a subset match: every declared key must be present
    // with the declared value; extra invocation vars are fine.
    fn matches_env(&self, invocation: &Invocation) -> bool {
        self.env
            .iter()
            .all(|(key, value)| invocation.env.get(key) == Some(value))
    }

    /// Explain why *invocation* failed to match, checking in the same order
    /// as [`Expectation::matches`] and redacting sensitive env values.
    pub fn explain_mismatch(&self, invocation: &Invocation) -> String {
        if !self.matches_command(invocation) {
            return format!(
                "command {:?} != {:?}",
                invocation.command, self.name
            );
        }
        if let Some(reason) = self.explain_args_mismatch(invocation) {
            return reason;
        }
        if let Some(matcher) = &self.stdin {
            if !matcher.matches(&invocation.stdin) {
                return format!("stdin {:?} failed {matcher}", invocation.stdin);
            }
        }
        if let Some(reason) = self.explain_env_mismatch(invocation) {
            return reason;
        }
        "args or stdin mismatch".to_string()
    }

    fn explain_args_mismatch(&self, invocation: &Invocation) -> Option<String> {
        match &self.args {
            ArgsSpec::Unconstrained => None,
            ArgsSpec::Exact(expected) => {
                if &invocation.args == expected {
                    None
                } else {
                    Some(format!(
                        "arguments {} != {}",
                        format_args_tuple(&invocation.args),
                        format_args_tuple(expected)
                    ))
                }
            }
            ArgsSpec::Matchers(matchers) => {
                if invocation.args.len() != matchers.len() {
                    return Some(format!(
                        "expected {} args but got {}",
                        matchers.len(),
                        invocation.args.len()
                    ));
                }
                for (index, (arg, matcher)) in
                    invocation.args.iter().zip(matchers).enumerate()
                {
                    if !matcher.matches(arg) {
                        return Some(format!("arg[{index}]={arg:?} failed {matcher}"));
                    }
                }
                None
            }
        }
    }

    fn explain_env_mismatch(&self, invocation: &Invocation) -> Option<String> {
        for (key, value) in &self.env {
            let actual = invocation.env.get(key);
            if actual.map(String::as_str) != Some(value.as_str()) {
                let shown_expected = redact_value(key, Some(value));
                let shown_actual = redact_value(key, actual.map(String::as_str));
                return Some(format!(
                    "env[{key:?}]={shown_actual} != {shown_expected}"
                ));
            }
        }
        None
    }

    /// Human-readable description used in verifier diagnostics, e.g.
    /// `git('clone', 'repo') with env {API_KEY='***'}`.
    pub fn describe(&self) -> String {
        let args = match &self.args {
            ArgsSpec::Unconstrained => "(<any args>)".to_string(),
            ArgsSpec::Exact(expected) => format_args_tuple(expected),
            ArgsSpec::Matchers(matchers) => {
                let reprs: Vec<String> = matchers.iter().map(ToString::to_string).collect();
                format!("({})", reprs.join(", "))
            }
        };
        let mut description = format!("{}{args}", self.name);
        if let Some(matcher) = &self.stdin {
            description.push_str(&format!(" with stdin {matcher}"));
        }
        if !self.env.is_empty() {
            let pairs: Vec<String> = self
                .env
                .iter()
                .map(|(key, value)| {
                    let shown = if is_sensitive_env_key(key) {
                        REDACTED_PLACEHOLDER
                    } else {
                        value.as_str()
                    };
                    format!("{key}='{shown}'")
                })
                .collect();
            description.push_str(&format!(" with env {{{}}}", pairs.join(", ")));
        }
        description
    }
}

fn redact_value(key: &str, value: Option<&str>) -> String {
    match value {
        None => "<unset>".to_string(),
        Some(_) if is_sensitive_env_key(key) => format!("'{REDACTED_PLACEHOLDER}'"),
        Some(value) => format!("'{value}'"),
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}
