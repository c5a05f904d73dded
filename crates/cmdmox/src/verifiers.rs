// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Verification of the frozen journal against registered expectations.
//!
//! Three sub-verifiers run in order — unexpected, order, count — and their
//! findings are aggregated into a single [`VerificationError`] so one failed
//! `verify()` reports every discrepancy at once.

use cmdmox_proto::{format_args_tuple, is_sensitive_env_key, Invocation, REDACTED_PLACEHOLDER};

use crate::doubles::{DoubleKind, DoubleState, Registry};
use crate::errors::{VerificationError, VerificationFailure};

pub(crate) fn run_verifiers(
    journal: &[Invocation],
    registry: &Registry,
) -> Result<(), VerificationError> {
    let mut failures = Vec::new();
    check_unexpected(journal, registry, &mut failures);
    check_order(journal, registry, &mut failures);
    check_counts(registry, &mut failures);

    if failures.is_empty() {
        Ok(())
    } else {
        Err(VerificationError::new(failures))
    }
}

// ----------------------------------------------------------------------
// 1) Unexpected invocations
// ----------------------------------------------------------------------

fn check_unexpected(
    journal: &[Invocation],
    registry: &Registry,
    failures: &mut Vec<VerificationFailure>,
) {
    for invocation in journal {
        if registry.lookup(&invocation.command).is_none() {
            let registered = registry.command_names();
            let candidates = if registered.is_empty() {
                "no doubles registered".to_string()
            } else {
                format!("registered doubles: {}", registered.join(", "))
            };
            failures.push(VerificationFailure::Unexpected(format!(
                "{} with env {}; {candidates}",
                render_invocation(invocation),
                render_env_pairs(invocation),
            )));
        }
    }

    for entry in &registry.entries {
        if entry.kind == DoubleKind::Stub {
            continue;
        }
        for mismatch in &entry.mismatches {
            failures.push(VerificationFailure::Unexpected(format!(
                "{}; expected {}; {}",
                render_invocation(mismatch),
                entry.expectation.describe(),
                entry.expectation.explain_mismatch(mismatch),
            )));
        }
    }
}

// ----------------------------------------------------------------------
// 2) Ordered expectations
// ----------------------------------------------------------------------

fn check_order(
    journal: &[Invocation],
    registry: &Registry,
    failures: &mut Vec<VerificationFailure>,
) {
    // Each ordered expectation occupies `count` consecutive slots.
    let mut ordered_slots: Vec<&DoubleState> = Vec::new();
    for &index in &registry.ordered {
        let entry = &registry.entries[index];
        for _ in 0..entry.expectation.count() {
            ordered_slots.push(entry);
        }
    }
    if ordered_slots.is_empty() {
        return;
    }

    let mut cursor = 0;
    for invocation in journal {
        if cursor >= ordered_slots.len() {
            break;
        }
        if ordered_slots[cursor].expectation.matches(invocation) {
            cursor += 1;
        }
    }

    if cursor != ordered_slots.len() {
        let declared: Vec<String> = ordered_slots
            .iter()
            .map(|entry| entry.expectation.describe())
            .collect();
        let remaining: Vec<String> = ordered_slots[cursor..]
            .iter()
            .map(|entry| entry.name.clone())
            .collect();
        let observed: Vec<String> = journal
            .iter()
            .map(|invocation| format!("{}{}", invocation.command, invocation.format_args()))
            .collect();
        failures.push(VerificationFailure::OutOfOrder(format!(
            "expected commands not satisfied in order: [{}]; declared order: [{}]; \
             observed: [{}]",
            remaining.join(", "),
            declared.join(", "),
            observed.join(", "),
        )));
    }
}

// ----------------------------------------------------------------------
// 3) Invocation counts
// ----------------------------------------------------------------------

fn check_counts(registry: &Registry, failures: &mut Vec<VerificationFailure>) {
    for entry in &registry.entries {
        let counted = entry.is_expected() || entry.expectation.count_explicit;
        if !counted {
            continue;
        }
        let expected = entry.expectation.count() as usize;
        let actual = entry.call_count();
        if actual < expected {
            let observed: Vec<String> = entry
                .invocations
                .iter()
                .chain(&entry.mismatches)
                .map(render_invocation)
                .collect();
            let observed = if observed.is_empty() {
                "none".to_string()
            } else {
                observed.join(", ")
            };
            failures.push(VerificationFailure::Unfulfilled(format!(
                "expected {} to be called {expected} time(s) but got {actual}; \
                 observed invocations: {observed}",
                entry.expectation.describe(),
            )));
        } else if actual > expected {
            failures.push(VerificationFailure::TooManyCalls(format!(
                "{} called more than expected ({actual} > {expected})",
                entry.name,
            )));
        }
    }
}

/// Diagnostic rendering of an observed invocation. Env is limited to
/// secret-redacted values and stdin is shown only when present.
fn render_invocation(invocation: &Invocation) -> String {
    let mut rendered = format!(
        "{}{}",
        invocation.command,
        format_args_tuple(&invocation.args)
    );
    if !invocation.stdin.is_empty() {
        rendered.push_str(&format!(" with stdin {:?}", invocation.stdin));
    }
    rendered
}

/// Redacted `KEY='value'` rendering. Large environments (a launcher
/// snapshots the whole process env) collapse to a count.
fn render_env_pairs(invocation: &Invocation) -> String {
    const MAX_SHOWN: usize = 8;
    if invocation.env.len() > MAX_SHOWN {
        return format!("{{<{} vars>}}", invocation.env.len());
    }
    let pairs: Vec<String> = invocation
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
    format!("{{{}}}", pairs.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn invocation(command: &str, args: &[&str]) -> Invocation {
        Invocation::new(
            command,
            args.iter().map(|a| a.to_string()).collect(),
            "",
            BTreeMap::new(),
            "id",
        )
    }

    fn registry_with(kind: DoubleKind, name: &str) -> (Registry, usize) {
        let mut registry = Registry::default();
        let index = registry.get_or_create(name, kind);
        (registry, index)
    }

    #[test]
    fn clean_run_passes() {
        let (mut registry, index) = registry_with(DoubleKind::Mock, "git");
        registry.entries[index]
            .expectation
            .set_args(vec!["status".to_string()]);
        let inv = invocation("git", &["status"]);
        registry.entries[index].invocations.push(inv.clone());

        assert!(run_verifiers(&[inv], &registry).is_ok());
    }

    #[test]
    fn unknown_command_is_unexpected() {
        let registry = Registry::default();
        let err = run_verifiers(&[invocation("rogue", &["-x"])], &registry).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("rogue('-x')"));
        assert!(text.contains("no doubles registered"));
    }

    #[test]
    fn mock_mismatch_reports_expected_and_observed() {
        let (mut registry, index) = registry_with(DoubleKind::Mock, "git");
        registry.entries[index]
            .expectation
            .set_args(vec!["clone".to_string(), "repo".to_string()]);
        registry.entries[index]
            .mismatches
            .push(invocation("git", &["commit"]));

        let err = run_verifiers(&[invocation("git", &["commit"])], &registry).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("git('commit')"));
        assert!(text.contains("git('clone', 'repo')"));
    }

    #[test]
    fn stub_mismatches_are_tolerated() {
        let (mut registry, index) = registry_with(DoubleKind::Stub, "hi");
        registry.entries[index]
            .expectation
            .set_args(vec!["-v".to_string()]);
        registry.entries[index]
            .mismatches
            .push(invocation("hi", &[]));

        assert!(run_verifiers(&[invocation("hi", &[])], &registry).is_ok());
    }

    #[test]
    fn env_mismatch_diagnostic_redacts_secret_values() {
        let (mut registry, index) = registry_with(DoubleKind::Mock, "deploy");
        registry.entries[index]
            .expectation
            .set_args(vec!["--expected".to_string()]);
        registry.entries[index].expectation.set_env(BTreeMap::from([(
            "API_KEY".to_string(),
            "leaked-secret".to_string(),
        )]));
        registry.entries[index]
            .mismatches
            .push(invocation("deploy", &["--actual"]));

        let err =
            run_verifiers(&[invocation("deploy", &["--actual"])], &registry).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("API_KEY='***'"));
        assert!(!text.contains("leaked-secret"));
    }

    #[test]
    fn out_of_order_invocations_are_reported() {
        let mut registry = Registry::default();
        let first = registry.get_or_create("first", DoubleKind::Mock);
        let second = registry.get_or_create("second", DoubleKind::Mock);
        registry.entries[first]
            .expectation
            .set_args(vec!["a".to_string()]);
        registry.entries[second]
            .expectation
            .set_args(vec!["b".to_string()]);

        // Both called, wrong order.
        let journal = vec![invocation("second", &["b"]), invocation("first", &["a"])];
        registry.entries[first].invocations.push(journal[1].clone());
        registry.entries[second].invocations.push(journal[0].clone());

        let err = run_verifiers(&journal, &registry).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("out-of-order"));
        assert!(text.contains("second"));
        assert!(text.contains("observed"));
    }

    #[test]
    fn in_order_run_passes_order_check() {
        let mut registry = Registry::default();
        let first = registry.get_or_create("first", DoubleKind::Mock);
        let second = registry.get_or_create("second", DoubleKind::Mock);
        registry.entries[first]
            .expectation
            .set_args(vec!["a".to_string()]);
        registry.entries[second]
            .expectation
            .set_args(vec!["b".to_string()]);

        let journal = vec![invocation("first", &["a"]), invocation("second", &["b"])];
        registry.entries[first].invocations.push(journal[0].clone());
        registry.entries[second].invocations.push(journal[1].clone());

        assert!(run_verifiers(&journal, &registry).is_ok());
    }

    #[test]
    fn uncalled_mock_is_unfulfilled() {
        let (registry, _) = registry_with(DoubleKind::Mock, "curl");
        let err = run_verifiers(&[], &registry).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("unfulfilled"));
        assert!(text.contains("called 1 time(s) but got 0"));
    }

    #[test]
    fn overcalled_mock_is_reported() {
        let (mut registry, index) = registry_with(DoubleKind::Mock, "curl");
        registry.entries[index]
            .invocations
            .push(invocation("curl", &[]));
        registry.entries[index]
            .invocations
            .push(invocation("curl", &[]));

        let err = run_verifiers(&[], &registry).unwrap_err();
        assert!(err.to_string().contains("more than expected (2 > 1)"));
    }

    #[test]
    fn stub_without_explicit_count_never_fails_counts() {
        let (registry, _) = registry_with(DoubleKind::Stub, "hi");
        assert!(run_verifiers(&[], &registry).is_ok());
    }

    #[test]
    fn explicit_count_applies_to_spies() {
        let (mut registry, index) = registry_with(DoubleKind::Spy, "echo");
        registry.entries[index].expectation.set_count(2);
        registry.entries[index]
            .invocations
            .push(invocation("echo", &[]));

        let err = run_verifiers(&[], &registry).unwrap_err();
        assert!(err.to_string().contains("2 time(s) but got 1"));
    }

    #[test]
    fn failures_are_aggregated_across_verifiers() {
        let mut registry = Registry::default();
        let mock = registry.get_or_create("git", DoubleKind::Mock);
        registry.entries[mock]
            .expectation
            .set_args(vec!["status".to_string()]);

        let journal = vec![invocation("rogue", &[])];
        let err = run_verifiers(&journal, &registry).unwrap_err();
        // Unknown command + unfulfilled mock (and its order slot) at once.
        assert!(err.failures.len() >= 2);
    }
}
