// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Command doubles: stubs, mocks, and spies.
//!
//! A double is a single tagged record; the `kind` discriminates verification
//! semantics rather than the storage shape. The controller owns every
//! double; test code configures and inspects them through the borrowed
//! [`DoubleHandle`], which refers back to the controller by command name
//! instead of holding a cyclic reference.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use cmdmox_proto::{format_args_tuple, redacted_env, Invocation, Response};

use crate::comparators::{ArgMatcher, StdinMatcher};
use crate::controller::CmdMox;
use crate::expectations::Expectation;
use crate::record::RecordingSession;

/// Discriminates verification semantics for a [`DoubleState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoubleKind {
    /// Behavioral replacement; never required to be called.
    Stub,
    /// Required to be called, exactly matching.
    Mock,
    /// Records calls; may pass through to the real binary.
    Spy,
}

impl fmt::Display for DoubleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DoubleKind::Stub => "stub",
            DoubleKind::Mock => "mock",
            DoubleKind::Spy => "spy",
        })
    }
}

/// Dynamic behavior invoked per matched invocation.
///
/// Handlers run inside the controller's transport worker with full access to
/// captured test state; anything convertible into a [`Response`] works as a
/// return value.
pub trait Handler: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Response;
}

impl<F, R> Handler for F
where
    F: Fn(&Invocation) -> R + Send + Sync,
    R: Into<Response>,
{
    fn run(&self, invocation: &Invocation) -> Response {
        self(invocation).into()
    }
}

/// Controller-owned state for one command double.
pub(crate) struct DoubleState {
    pub(crate) name: String,
    pub(crate) kind: DoubleKind,
    pub(crate) expectation: Expectation,
    pub(crate) response: Response,
    pub(crate) handler: Option<Arc<dyn Handler>>,
    pub(crate) passthrough_mode: bool,
    pub(crate) recording: Option<Arc<RecordingSession>>,
    /// Invocations that matched this double's expectation.
    pub(crate) invocations: Vec<Invocation>,
    /// Invocations routed here that failed to match, kept with their
    /// pre-override env for faithful diagnostics.
    pub(crate) mismatches: Vec<Invocation>,
}

impl DoubleState {
    pub(crate) fn new(name: &str, kind: DoubleKind) -> Self {
        let mut expectation = Expectation::new(name);
        // Mocks participate in ordered verification unless opted out.
        expectation.ordered = kind == DoubleKind::Mock;
        Self {
            name: name.to_string(),
            kind,
            expectation,
            response: Response::default(),
            handler: None,
            passthrough_mode: false,
            recording: None,
            invocations: Vec::new(),
            mismatches: Vec::new(),
        }
    }

    /// Mocks must be called; stubs and spies are optional.
    pub(crate) fn is_expected(&self) -> bool {
        self.kind == DoubleKind::Mock
    }

    pub(crate) fn call_count(&self) -> usize {
        self.invocations.len()
    }
}

/// Registered doubles in declaration order, with ordered-expectation
/// enrollment tracked separately.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) entries: Vec<DoubleState>,
    pub(crate) by_name: HashMap<String, usize>,
    /// Indices enrolled for ordered verification, in enrollment order.
    pub(crate) ordered: Vec<usize>,
}

impl Registry {
    pub(crate) fn get_or_create(&mut self, name: &str, kind: DoubleKind) -> usize {
        if let Some(&index) = self.by_name.get(name) {
            let existing = &self.entries[index];
            assert!(
                existing.kind == kind,
                "{name:?} already registered as {}; cannot register as {kind}",
                existing.kind
            );
            return index;
        }
        let index = self.entries.len();
        self.entries.push(DoubleState::new(name, kind));
        self.by_name.insert(name.to_string(), index);
        if kind == DoubleKind::Mock {
            self.ordered.push(index);
        }
        index
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn command_names(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.name.clone()).collect()
    }

    pub(crate) fn enroll_ordered(&mut self, index: usize) {
        if !self.ordered.contains(&index) {
            self.ordered.push(index);
        }
        self.entries[index].expectation.ordered = true;
    }

    pub(crate) fn withdraw_ordered(&mut self, index: usize) {
        self.ordered.retain(|&enrolled| enrolled != index);
        self.entries[index].expectation.ordered = false;
    }
}

/// Fluent configuration and inspection handle for one double.
///
/// Obtained from [`CmdMox::stub`], [`CmdMox::mock`], or [`CmdMox::spy`];
/// repeated calls with the same name return a handle to the same double.
pub struct DoubleHandle<'mox> {
    mox: &'mox CmdMox,
    index: usize,
    name: String,
    kind: DoubleKind,
}

impl<'mox> DoubleHandle<'mox> {
    pub(crate) fn new(mox: &'mox CmdMox, index: usize, name: String, kind: DoubleKind) -> Self {
        Self {
            mox,
            index,
            name,
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DoubleKind {
        self.kind
    }

    fn configure(self, apply: impl FnOnce(&mut DoubleState)) -> Self {
        self.mox.with_double(self.index, apply);
        self
    }

    fn inspect<T>(&self, read: impl FnOnce(&DoubleState) -> T) -> T {
        self.mox.read_double(self.index, read)
    }

    // ------------------------------------------------------------------
    // Expectation configuration
    // ------------------------------------------------------------------

    /// Require the command be invoked with exactly these arguments.
    pub fn with_args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        self.configure(|double| double.expectation.set_args(args))
    }

    /// Validate arguments positionally with comparator predicates.
    pub fn with_matching_args<I>(self, matchers: I) -> Self
    where
        I: IntoIterator<Item = ArgMatcher>,
    {
        let matchers: Vec<ArgMatcher> = matchers.into_iter().collect();
        self.configure(|double| double.expectation.set_matchers(matchers))
    }

    /// Expect the given stdin content or matcher.
    pub fn with_stdin(self, matcher: impl Into<StdinMatcher>) -> Self {
        let matcher = matcher.into();
        self.configure(|double| double.expectation.set_stdin(matcher))
    }

    /// Declare environment overrides applied when the response is generated
    /// and recorded on the invocation.
    pub fn with_env<I, K, V>(self, mapping: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let env: BTreeMap<String, String> = mapping
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self.configure(|double| double.expectation.set_env(env))
    }

    /// Respond with static stdout/stderr/exit code.
    pub fn returns(
        self,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        exit_code: i32,
    ) -> Self {
        let response = Response {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            ..Response::default()
        };
        self.configure(|double| {
            double.response = response;
            double.handler = None;
        })
    }

    /// Generate responses dynamically with *handler*.
    pub fn runs<H>(self, handler: H) -> Self
    where
        H: Handler + 'static,
    {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        self.configure(|double| double.handler = Some(handler))
    }

    /// Require exactly *count* invocations.
    pub fn times(self, count: u32) -> Self {
        assert!(count > 0, "times() requires a positive count");
        self.configure(|double| double.expectation.set_count(count))
    }

    /// Alias for [`DoubleHandle::times`] matching the fluent DSL.
    pub fn times_called(self, count: u32) -> Self {
        self.times(count)
    }

    /// Enroll this expectation in ordered verification.
    pub fn in_order(self) -> Self {
        self.mox.enroll_ordered(self.index);
        self
    }

    /// Withdraw this expectation from ordered verification.
    pub fn any_order(self) -> Self {
        self.mox.withdraw_ordered(self.index);
        self
    }

    /// Execute the real command while still recording the invocation.
    /// Spies only.
    pub fn passthrough(self) -> Self {
        assert!(
            self.kind == DoubleKind::Spy,
            "passthrough() is only valid for spies"
        );
        self.configure(|double| double.passthrough_mode = true)
    }

    /// Attach a recording session persisting to *path*. Requires an enabled
    /// passthrough spy.
    pub fn record(self, path: impl AsRef<Path>) -> Self {
        let session = RecordingSession::new(path.as_ref());
        self.record_with(session)
    }

    /// Attach a preconfigured recording session (scrubber, allowlist, ...).
    pub fn record_with(self, session: RecordingSession) -> Self {
        assert!(
            self.kind == DoubleKind::Spy,
            "record() is only valid for spies"
        );
        let started = Arc::new(session);
        started
            .start()
            .unwrap_or_else(|err| panic!("recording session failed to start: {err}"));
        self.configure(|double| {
            assert!(
                double.passthrough_mode,
                "record() requires passthrough() to be enabled first"
            );
            double.recording = Some(started);
        })
    }

    // ------------------------------------------------------------------
    // Inspection and spy assertions
    // ------------------------------------------------------------------

    /// Number of matched invocations recorded so far.
    pub fn call_count(&self) -> usize {
        self.inspect(DoubleState::call_count)
    }

    /// Copies of the matched invocations, in completion order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.inspect(|double| double.invocations.clone())
    }

    /// The most recent matched invocation, if any.
    pub fn last_invocation(&self) -> Option<Invocation> {
        self.inspect(|double| double.invocations.last().cloned())
    }

    fn require_spy(&self, method: &str) {
        assert!(
            self.kind == DoubleKind::Spy,
            "{method}() is only valid for spies"
        );
    }

    /// Panic unless this spy was invoked at least once.
    pub fn assert_called(&self) {
        self.require_spy("assert_called");
        assert!(
            self.call_count() > 0,
            "expected {:?} to be called at least once but it was never called",
            self.name
        );
    }

    /// Panic if this spy was invoked.
    pub fn assert_not_called(&self) {
        self.require_spy("assert_not_called");
        if let Some(last) = self.last_invocation() {
            let count = self.call_count();
            panic!(
                "expected {:?} to be uncalled but it was called {count} time(s); \
                 last args={}, stdin={:?}, env={:?}",
                self.name,
                format_args_tuple(&last.args),
                last.stdin,
                redacted_env(&last.env),
            );
        }
    }

    /// Panic unless the most recent call used exactly *args*.
    pub fn assert_called_with(&self, args: &[&str]) {
        self.require_spy("assert_called_with");
        let last = self.last_invocation().unwrap_or_else(|| {
            panic!(
                "expected {:?} to be called but it was never called",
                self.name
            )
        });
        let expected: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        assert!(
            last.args == expected,
            "{:?} called with args {}, expected {}",
            self.name,
            format_args_tuple(&last.args),
            format_args_tuple(&expected),
        );
    }

    /// Panic unless the most recent call carried exactly *stdin*.
    pub fn assert_called_with_stdin(&self, args: &[&str], stdin: &str) {
        self.assert_called_with(args);
        let last = self.last_invocation().expect("checked by assert_called_with");
        assert!(
            last.stdin == stdin,
            "{:?} called with stdin {:?}, expected {stdin:?}",
            self.name,
            last.stdin,
        );
    }

    /// Panic unless the most recent call's env contains every given pair.
    pub fn assert_called_with_env(&self, args: &[&str], env: &[(&str, &str)]) {
        self.assert_called_with(args);
        let last = self.last_invocation().expect("checked by assert_called_with");
        for (key, value) in env {
            let actual = last.env.get(*key).map(String::as_str);
            assert!(
                actual == Some(*value),
                "{:?} called with env[{key:?}]={actual:?}, expected {value:?}",
                self.name,
            );
        }
    }
}

impl fmt::Debug for DoubleHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoubleHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("call_count", &self.call_count())
            .finish()
    }
}
