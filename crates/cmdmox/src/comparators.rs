// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Argument comparators used by expectation matching.
//!
//! The display representation of each comparator is part of the contract:
//! mismatch diagnostics print them verbatim so a failing test names the
//! predicate that rejected the argument.

use std::fmt;
use std::sync::Arc;

use crate::errors::{Error, Result};

/// Boxed user predicate over a single argument.
pub type PredicateFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Value families accepted by [`ArgMatcher::IsA`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Integer,
    Float,
    Bool,
}

impl ValueKind {
    fn parses(self, value: &str) -> bool {
        match self {
            ValueKind::Integer => value.parse::<i64>().is_ok(),
            ValueKind::Float => value.parse::<f64>().is_ok(),
            ValueKind::Bool => matches!(
                value.to_ascii_lowercase().as_str(),
                "true" | "false" | "1" | "0"
            ),
        }
    }

    fn name(self) -> &'static str {
        match self {
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::Bool => "bool",
        }
    }
}

/// A predicate applied to one argv element.
#[derive(Clone)]
pub enum ArgMatcher {
    /// Match any value.
    Any,
    /// Match values parseable as the given kind.
    IsA(ValueKind),
    /// Match when the pattern is found anywhere in the value.
    Regex(regex::Regex),
    /// Match when the substring occurs in the value.
    Contains(String),
    /// Match when the value begins with the prefix.
    StartsWith(String),
    /// Match via a user-supplied predicate.
    Predicate(PredicateFn),
}

impl ArgMatcher {
    /// Compile *pattern* into a regex matcher.
    pub fn regex(pattern: &str) -> Result<Self> {
        let compiled = regex::Regex::new(pattern)
            .map_err(|err| Error::Configuration(format!("invalid regex matcher: {err}")))?;
        Ok(ArgMatcher::Regex(compiled))
    }

    pub fn contains(substring: impl Into<String>) -> Self {
        ArgMatcher::Contains(substring.into())
    }

    pub fn starts_with(prefix: impl Into<String>) -> Self {
        ArgMatcher::StartsWith(prefix.into())
    }

    pub fn predicate<F>(func: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        ArgMatcher::Predicate(Arc::new(func))
    }

    /// Return `true` when *value* satisfies this comparator.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            ArgMatcher::Any => true,
            ArgMatcher::IsA(kind) => kind.parses(value),
            ArgMatcher::Regex(pattern) => pattern.is_match(value),
            ArgMatcher::Contains(substring) => value.contains(substring.as_str()),
            ArgMatcher::StartsWith(prefix) => value.starts_with(prefix.as_str()),
            ArgMatcher::Predicate(func) => func(value),
        }
    }
}

impl fmt::Display for ArgMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgMatcher::Any => write!(f, "Any()"),
            ArgMatcher::IsA(kind) => write!(f, "IsA({})", kind.name()),
            ArgMatcher::Regex(pattern) => write!(f, "Regex('{}')", pattern.as_str()),
            ArgMatcher::Contains(substring) => write!(f, "Contains('{substring}')"),
            ArgMatcher::StartsWith(prefix) => write!(f, "StartsWith('{prefix}')"),
            ArgMatcher::Predicate(_) => write!(f, "Predicate(<fn>)"),
        }
    }
}

impl fmt::Debug for ArgMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Matcher for the captured stdin of an invocation.
#[derive(Clone, Debug)]
pub enum StdinMatcher {
    /// Stdin must equal the string exactly.
    Exact(String),
    /// Stdin must satisfy the comparator.
    Matches(ArgMatcher),
}

impl StdinMatcher {
    pub fn matches(&self, stdin: &str) -> bool {
        match self {
            StdinMatcher::Exact(expected) => stdin == expected,
            StdinMatcher::Matches(matcher) => matcher.matches(stdin),
        }
    }
}

impl fmt::Display for StdinMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StdinMatcher::Exact(expected) => write!(f, "{expected:?}"),
            StdinMatcher::Matches(matcher) => fmt::Display::fmt(matcher, f),
        }
    }
}

impl From<&str> for StdinMatcher {
    fn from(value: &str) -> Self {
        StdinMatcher::Exact(value.to_string())
    }
}

impl From<String> for StdinMatcher {
    fn from(value: String) -> Self {
        StdinMatcher::Exact(value)
    }
}

impl From<ArgMatcher> for StdinMatcher {
    fn from(matcher: ArgMatcher) -> Self {
        StdinMatcher::Matches(matcher)
    }
}
