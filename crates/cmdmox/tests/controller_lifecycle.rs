// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Controller lifecycle tests driving the live IPC server.
//!
//! These tests stand in for the launcher: they connect to the controller's
//! socket with the transport client and speak the wire protocol directly, so
//! the full matching/journal/verify pipeline is exercised without spawning
//! shim processes.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::time::Duration;

use serial_test::serial;

use cmdmox::{ArgMatcher, CmdMox, CmdMoxConfig, Error, Invocation, Phase, Response};
use cmdmox_ipc::{invoke_server, report_passthrough_result, Endpoint, RetryConfig};

// The shim binary itself is never executed by these tests (the IPC client
// below plays the launcher role), so any existing executable satisfies shim
// generation. The test binary is always available.
fn shim_override() {
    std::env::set_var(
        cmdmox::shimgen::CMDMOX_SHIM_BIN_ENV,
        std::env::current_exe().expect("current test executable"),
    );
}

fn new_mox() -> CmdMox {
    shim_override();
    CmdMox::new()
}

fn endpoint_of(mox: &CmdMox) -> Endpoint {
    Endpoint::new(
        mox.environment()
            .socket_path()
            .expect("socket path exists during replay"),
    )
}

fn call(mox: &CmdMox, command: &str, args: &[&str]) -> Response {
    call_with(mox, command, args, "", BTreeMap::new())
}

fn call_with(
    mox: &CmdMox,
    command: &str,
    args: &[&str],
    stdin: &str,
    env: BTreeMap<String, String>,
) -> Response {
    let invocation = Invocation::new(
        command,
        args.iter().map(|a| a.to_string()).collect(),
        stdin,
        env,
        uuid::Uuid::new_v4().simple().to_string(),
    );
    invoke_server(
        &endpoint_of(mox),
        &invocation,
        Duration::from_secs(5),
        &RetryConfig::default(),
    )
    .expect("IPC round trip")
}

#[test]
#[serial]
fn stubbed_call_returns_scripted_stdout() {
    let mut mox = new_mox();
    mox.stub("hi").returns("hello", "", 0);
    mox.replay().unwrap();

    let response = call(&mox, "hi", &[]);
    assert_eq!(response.stdout, "hello");
    assert_eq!(response.exit_code, 0);

    mox.verify().unwrap();
    let journal = mox.journal();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].command, "hi");
    assert_eq!(journal[0].stdout, "hello");
}

#[test]
#[serial]
fn replay_is_idempotent_and_verify_requires_replay() {
    let mut mox = new_mox();
    assert!(matches!(mox.verify(), Err(Error::Lifecycle(_))));

    mox.stub("noop").returns("", "", 0);
    mox.replay().unwrap();
    assert_eq!(mox.phase(), Phase::Replay);
    mox.replay().unwrap();
    assert_eq!(mox.phase(), Phase::Replay);

    mox.verify().unwrap();
    assert_eq!(mox.phase(), Phase::Verify);
    assert!(matches!(mox.replay(), Err(Error::Lifecycle(_))));
}

#[test]
#[serial]
fn mock_with_args_verifies_and_mismatch_fails() {
    let mut mox = new_mox();
    mox.mock("git").with_args(["clone", "repo"]).returns("", "", 0);
    mox.replay().unwrap();
    call(&mox, "git", &["clone", "repo"]);
    mox.verify().unwrap();

    let mut mox = new_mox();
    mox.mock("git").with_args(["clone", "repo"]).returns("", "", 0);
    mox.replay().unwrap();
    call(&mox, "git", &["commit"]);
    let err = mox.verify().unwrap_err();
    let text = err.to_string();
    assert!(text.contains("git('commit')"), "unexpected text: {text}");
    assert!(text.contains("git('clone', 'repo')"), "missing expected: {text}");
}

#[test]
#[serial]
fn unregistered_command_fails_verification() {
    let mut mox = new_mox();
    mox.stub("known").returns("", "", 0);
    mox.replay().unwrap();

    let response = call(&mox, "rogue", &["-x"]);
    assert_eq!(response.exit_code, 1);
    assert!(response.stderr.contains("unexpected command"));

    let err = mox.verify().unwrap_err();
    assert!(err.to_string().contains("rogue('-x')"));
}

#[test]
#[serial]
fn ordered_mocks_fail_when_reversed() {
    let mut mox = new_mox();
    mox.mock("first").with_args(["a"]).in_order().returns("", "", 0);
    mox.mock("second").with_args(["b"]).in_order().returns("", "", 0);
    mox.replay().unwrap();
    call(&mox, "second", &["b"]);
    call(&mox, "first", &["a"]);
    let err = mox.verify().unwrap_err();
    assert!(err.to_string().contains("out-of-order"));

    let mut mox = new_mox();
    mox.mock("first").with_args(["a"]).in_order().returns("", "", 0);
    mox.mock("second").with_args(["b"]).in_order().returns("", "", 0);
    mox.replay().unwrap();
    call(&mox, "first", &["a"]);
    call(&mox, "second", &["b"]);
    mox.verify().unwrap();
}

#[test]
#[serial]
fn any_order_mocks_accept_either_sequence() {
    let mut mox = new_mox();
    mox.mock("alpha").any_order().returns("", "", 0);
    mox.mock("beta").any_order().returns("", "", 0);
    mox.replay().unwrap();
    call(&mox, "beta", &[]);
    call(&mox, "alpha", &[]);
    mox.verify().unwrap();
}

#[test]
#[serial]
fn bounded_journal_evicts_oldest_entries() {
    shim_override();
    let mut mox = CmdMox::with_config(CmdMoxConfig {
        max_journal_entries: Some(2),
        ..CmdMoxConfig::default()
    })
    .unwrap();
    mox.stub("alpha").returns("", "", 0);
    mox.stub("beta").returns("", "", 0);
    mox.stub("gamma").returns("", "", 0);
    mox.replay().unwrap();
    call(&mox, "alpha", &[]);
    call(&mox, "beta", &[]);
    call(&mox, "gamma", &[]);
    mox.verify().unwrap();

    let commands: Vec<String> = mox.journal().iter().map(|i| i.command.clone()).collect();
    assert_eq!(commands, ["beta", "gamma"]);
}

#[test]
fn zero_journal_bound_is_rejected() {
    let err = CmdMox::with_config(CmdMoxConfig {
        max_journal_entries: Some(0),
        ..CmdMoxConfig::default()
    })
    .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[test]
#[serial]
fn matcher_predicates_apply_per_position() {
    let mut mox = new_mox();
    mox.mock("retry")
        .with_matching_args([ArgMatcher::starts_with("--"), ArgMatcher::Any])
        .returns("", "", 0);
    mox.replay().unwrap();
    call(&mox, "retry", &["--count", "3"]);
    mox.verify().unwrap();
}

#[test]
#[serial]
fn env_overrides_flow_to_response_and_journal() {
    let mut mox = new_mox();
    mox.stub("svc")
        .with_env([("SVC_MODE", "test")])
        .returns("ok", "", 0);
    mox.replay().unwrap();

    let response = call_with(
        &mox,
        "svc",
        &[],
        "",
        BTreeMap::from([("SVC_MODE".to_string(), "test".to_string())]),
    );
    assert_eq!(response.env.get("SVC_MODE").map(String::as_str), Some("test"));

    mox.verify().unwrap();
    let journal = mox.journal();
    assert_eq!(
        journal[0].env.get("SVC_MODE").map(String::as_str),
        Some("test")
    );
}

#[test]
#[serial]
fn handler_receives_invocation_and_builds_response() {
    let mut mox = new_mox();
    mox.stub("greet").runs(|invocation: &Invocation| {
        let name = invocation.args.first().cloned().unwrap_or_default();
        (format!("hello {name}"), String::new(), 0)
    });
    mox.replay().unwrap();

    let response = call(&mox, "greet", &["world"]);
    assert_eq!(response.stdout, "hello world");
    mox.verify().unwrap();
}

#[test]
#[serial]
fn handler_panic_is_converted_and_journaled() {
    let mut mox = new_mox();
    mox.stub("boom").runs(|_: &Invocation| -> Response {
        panic!("scripted failure");
    });
    mox.replay().unwrap();

    let response = call(&mox, "boom", &[]);
    assert_eq!(response.exit_code, 1);
    assert!(response.stderr.contains("scripted failure"));

    mox.verify().unwrap();
    let journal = mox.journal();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].exit_code, 1);
}

#[test]
#[serial]
fn stdin_expectation_matches_payload() {
    let mut mox = new_mox();
    mox.mock("tee").with_stdin("payload").returns("", "", 0);
    mox.replay().unwrap();
    call_with(&mox, "tee", &[], "payload", BTreeMap::new());
    mox.verify().unwrap();
}

#[test]
#[serial]
fn times_enforces_exact_counts() {
    let mut mox = new_mox();
    mox.mock("ping").times(2).returns("", "", 0);
    mox.replay().unwrap();
    call(&mox, "ping", &[]);
    let err = mox.verify().unwrap_err();
    assert!(err.to_string().contains("2 time(s) but got 1"));
}

#[test]
#[serial]
fn passthrough_round_trip_updates_spy_and_journal() {
    let mut mox = new_mox();
    mox.spy("echo").passthrough();
    mox.replay().unwrap();

    let invocation = Invocation::new(
        "echo",
        vec!["hello".to_string()],
        "",
        BTreeMap::new(),
        "pt-1",
    );
    let endpoint = endpoint_of(&mox);
    let first = invoke_server(
        &endpoint,
        &invocation,
        Duration::from_secs(5),
        &RetryConfig::default(),
    )
    .unwrap();
    let directive = first.passthrough.expect("passthrough directive");
    assert_eq!(directive.invocation_id, "pt-1");
    assert!(!directive.lookup_path.is_empty());
    assert_eq!(mox.pending_passthrough_count(), 1);

    // Pretend we ran the real binary.
    let result = cmdmox::PassthroughResult {
        invocation_id: "pt-1".to_string(),
        stdout: "hello\n".to_string(),
        stderr: String::new(),
        exit_code: 0,
    };
    let second = report_passthrough_result(
        &endpoint,
        &result,
        Duration::from_secs(5),
        &RetryConfig::default(),
    )
    .unwrap();
    assert_eq!(second.stdout, "hello\n");
    assert!(second.passthrough.is_none());

    assert_eq!(mox.spy("echo").call_count(), 1);
    mox.spy("echo").assert_called();
    mox.spy("echo").assert_called_with(&["hello"]);
    mox.verify().unwrap();

    let journal = mox.journal();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].stdout, "hello\n");
    assert_eq!(journal[0].exit_code, 0);
}

#[test]
#[serial]
fn teardown_restores_environment_on_failure_paths() {
    let path_before = std::env::var("PATH").unwrap_or_default();

    let mut mox = new_mox();
    mox.mock("never-called").returns("", "", 0);
    mox.replay().unwrap();
    let shim_dir = mox.environment().shim_dir().unwrap().to_path_buf();
    assert!(shim_dir.exists());

    assert!(mox.verify().is_err());
    assert_eq!(std::env::var("PATH").unwrap_or_default(), path_before);
    assert!(!shim_dir.exists());
}

#[test]
#[serial]
fn late_registration_during_replay_is_served() {
    let mut mox = new_mox();
    mox.stub("early").returns("", "", 0);
    mox.replay().unwrap();

    // Registered after the transport is already live.
    mox.stub("late").returns("better late", "", 0);
    let shim = mox.environment().shim_dir().unwrap().join("late");
    assert!(shim.symlink_metadata().is_ok(), "late shim missing");

    let response = call(&mox, "late", &[]);
    assert_eq!(response.stdout, "better late");
    mox.verify().unwrap();
}

#[test]
#[serial]
fn scoped_run_gives_body_error_precedence() {
    let mut mox = new_mox();
    mox.mock("required").returns("", "", 0);

    // Body fails AND the mock goes uncalled; the body's error must win,
    // with the environment still released.
    let path_before = std::env::var("PATH").unwrap_or_default();
    let err = mox
        .run(|_mox| -> Result<(), Error> {
            Err(Error::Configuration("body exploded".to_string()))
        })
        .unwrap_err();
    assert!(err.to_string().contains("body exploded"));
    assert_eq!(std::env::var("PATH").unwrap_or_default(), path_before);

    // A clean body surfaces the verification failure instead.
    let mut mox = new_mox();
    mox.mock("required").returns("", "", 0);
    let err = mox.run(|_mox| Ok::<(), Error>(())).unwrap_err();
    assert!(matches!(err, Error::Verification(_)));
}

#[test]
#[serial]
fn spy_assertions_report_uncalled_spies() {
    let mut mox = new_mox();
    mox.spy("probe").returns("", "", 0);
    mox.replay().unwrap();
    mox.spy("probe").assert_not_called();
    call(&mox, "probe", &["-v"]);
    mox.spy("probe").assert_called();
    mox.spy("probe").assert_called_with(&["-v"]);
    mox.verify().unwrap();
}
