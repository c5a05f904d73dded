// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The CmdMox controller: a record → replay → verify state machine.
//!
//! `CmdMox::new()` starts in RECORD, accepting double registration with no
//! side effects. `replay()` acquires the environment, generates shims, and
//! starts the IPC server; if any step fails the partial state is torn down
//! before the error propagates. `verify()` stops the server, finalizes
//! recording sessions, runs the verifiers over the frozen journal, and
//! releases the environment on every path.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use cmdmox_ipc::{Endpoint, IpcHandlers, IpcServer};
use cmdmox_proto::{Invocation, PassthroughResult, Response};

use crate::doubles::{DoubleHandle, DoubleKind, DoubleState, Registry};
use crate::environment::EnvironmentManager;
use crate::errors::{Error, Result};
use crate::journal::Journal;
use crate::passthrough::PassthroughCoordinator;
use crate::shimgen::create_shims;
use crate::verifiers;

/// Lifecycle phases for [`CmdMox`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Record,
    Replay,
    Verify,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Record => "record",
            Phase::Replay => "replay",
            Phase::Verify => "verify",
        })
    }
}

/// Construction-time options for [`CmdMox`].
#[derive(Clone, Debug)]
pub struct CmdMoxConfig {
    /// Journal bound; oldest entries are evicted FIFO past this. `None`
    /// keeps the journal unbounded.
    pub max_journal_entries: Option<usize>,
    /// Per-operation IPC timeout exported to launchers.
    pub ipc_timeout: Duration,
    /// Budget for real executions requested by passthrough spies.
    pub passthrough_timeout: Duration,
    /// Temp-directory name prefix.
    pub environment_prefix: String,
}

impl Default for CmdMoxConfig {
    fn default() -> Self {
        Self {
            max_journal_entries: None,
            ipc_timeout: cmdmox_ipc::DEFAULT_IPC_TIMEOUT,
            passthrough_timeout: Duration::from_secs(30),
            environment_prefix: "cmdmox".to_string(),
        }
    }
}

struct ReplaySettings {
    /// Original PATH minus the shim directory, used by passthrough lookups.
    lookup_path: String,
}

/// State shared with the IPC server workers.
pub(crate) struct SharedState {
    registry: Mutex<Registry>,
    journal: Mutex<Journal>,
    coordinator: PassthroughCoordinator,
    replay: Mutex<Option<ReplaySettings>>,
    passthrough_timeout: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Central orchestrator implementing the record-replay-verify lifecycle.
pub struct CmdMox {
    config: CmdMoxConfig,
    phase: Phase,
    environment: EnvironmentManager,
    server: Option<IpcServer>,
    shared: Arc<SharedState>,
}

impl std::fmt::Debug for CmdMox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmdMox")
            .field("config", &self.config)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl CmdMox {
    pub fn new() -> Self {
        Self::with_config(CmdMoxConfig::default())
            .unwrap_or_else(|err| panic!("default configuration is valid: {err}"))
    }

    pub fn with_config(config: CmdMoxConfig) -> Result<Self> {
        if config.max_journal_entries == Some(0) {
            return Err(Error::Configuration(
                "max_journal_entries must be positive".to_string(),
            ));
        }
        if config.ipc_timeout.is_zero() || config.passthrough_timeout.is_zero() {
            return Err(Error::Configuration(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        let environment = EnvironmentManager::with_prefix(config.environment_prefix.clone());
        let shared = Arc::new(SharedState {
            registry: Mutex::new(Registry::default()),
            journal: Mutex::new(Journal::new(config.max_journal_entries)),
            coordinator: PassthroughCoordinator::default(),
            replay: Mutex::new(None),
            passthrough_timeout: config.passthrough_timeout,
        });
        Ok(Self {
            config,
            phase: Phase::Record,
            environment,
            server: None,
            shared,
        })
    }

    /// The current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    // ------------------------------------------------------------------
    // Double registration
    // ------------------------------------------------------------------

    /// Create or retrieve a stub for *command_name*.
    pub fn stub(&self, command_name: &str) -> DoubleHandle<'_> {
        self.double(command_name, DoubleKind::Stub)
    }

    /// Create or retrieve a mock for *command_name*.
    pub fn mock(&self, command_name: &str) -> DoubleHandle<'_> {
        self.double(command_name, DoubleKind::Mock)
    }

    /// Create or retrieve a spy for *command_name*.
    pub fn spy(&self, command_name: &str) -> DoubleHandle<'_> {
        self.double(command_name, DoubleKind::Spy)
    }

    fn double(&self, command_name: &str, kind: DoubleKind) -> DoubleHandle<'_> {
        let (index, created) = {
            let mut registry = lock(&self.shared.registry);
            let known = registry.lookup(command_name).is_some();
            assert!(
                known || self.phase != Phase::Verify,
                "cannot register {command_name:?} after verify()"
            );
            let index = registry.get_or_create(command_name, kind);
            (index, !known)
        };
        if created {
            self.ensure_shim_during_replay(command_name);
        }
        DoubleHandle::new(self, index, command_name.to_string(), kind)
    }

    // Late-registered doubles get their shim immediately so they work
    // without restarting the IPC server.
    fn ensure_shim_during_replay(&self, command_name: &str) {
        if self.phase != Phase::Replay {
            return;
        }
        let Some(shim_dir) = self.environment.shim_dir() else {
            return;
        };
        if let Err(err) = create_shims(shim_dir, [command_name]) {
            panic!("failed to create shim for {command_name:?} during replay: {err}");
        }
    }

    pub(crate) fn with_double(&self, index: usize, apply: impl FnOnce(&mut DoubleState)) {
        let mut registry = lock(&self.shared.registry);
        apply(&mut registry.entries[index]);
    }

    pub(crate) fn read_double<T>(&self, index: usize, read: impl FnOnce(&DoubleState) -> T) -> T {
        let registry = lock(&self.shared.registry);
        read(&registry.entries[index])
    }

    pub(crate) fn enroll_ordered(&self, index: usize) {
        lock(&self.shared.registry).enroll_ordered(index);
    }

    pub(crate) fn withdraw_ordered(&self, index: usize) {
        lock(&self.shared.registry).withdraw_ordered(index);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Transition to replay: acquire the environment, generate shims, and
    /// start the IPC server. Calling `replay()` while already replaying is a
    /// no-op.
    pub fn replay(&mut self) -> Result<()> {
        match self.phase {
            Phase::Replay => return Ok(()),
            Phase::Record => {}
            Phase::Verify => {
                return Err(Error::Lifecycle(
                    "cannot call replay(): controller already verified".to_string(),
                ));
            }
        }

        self.environment.enter()?;
        match self.start_replay() {
            Ok(()) => {
                self.phase = Phase::Replay;
                debug!("entered replay phase");
                Ok(())
            }
            Err(err) => {
                // Tear down partial state before propagating.
                if let Some(mut server) = self.server.take() {
                    server.stop();
                }
                if let Err(cleanup) = self.environment.exit() {
                    warn!(%cleanup, "environment teardown after failed replay start");
                }
                Err(err)
            }
        }
    }

    fn start_replay(&mut self) -> Result<()> {
        lock(&self.shared.journal).clear();

        let shim_dir = self
            .environment
            .shim_dir()
            .ok_or_else(|| Error::MissingEnvironment("shim directory".to_string()))?
            .to_path_buf();
        let socket_path = self
            .environment
            .socket_path()
            .ok_or_else(|| Error::MissingEnvironment("socket path".to_string()))?
            .to_path_buf();

        let commands = lock(&self.shared.registry).command_names();
        create_shims(&shim_dir, commands.iter().map(String::as_str))?;

        self.environment
            .export_ipc_environment(Some(self.config.ipc_timeout.as_secs_f64()))?;

        let lookup_path =
            crate::environment::strip_from_search_path(&shim_dir, &self.environment.original_path());
        *lock(&self.shared.replay) = Some(ReplaySettings { lookup_path });

        let bridge = Arc::new(ServerBridge(Arc::clone(&self.shared)));
        let server = IpcServer::start(
            Endpoint::new(socket_path),
            bridge,
            self.config.ipc_timeout,
        )?;
        self.server = Some(server);
        Ok(())
    }

    /// Finalize the verification phase: stop the server, run verifiers over
    /// the frozen journal, and release the environment. The environment is
    /// released on every path, including verification failure.
    pub fn verify(&mut self) -> Result<()> {
        if self.phase != Phase::Replay {
            return Err(Error::Lifecycle(format!(
                "cannot call verify(): not in 'replay' phase (current phase: {})",
                self.phase
            )));
        }

        if let Some(mut server) = self.server.take() {
            server.stop();
        }

        // Recording sessions persist before the environment disappears.
        let mut session_error: Option<Error> = None;
        {
            let registry = lock(&self.shared.registry);
            for entry in &registry.entries {
                if let Some(recording) = &entry.recording {
                    if let Err(err) = recording.finalize() {
                        warn!(command = %entry.name, %err, "recording finalize failed");
                        session_error.get_or_insert(err);
                    }
                }
            }
        }

        let verification = {
            let registry = lock(&self.shared.registry);
            let journal = lock(&self.shared.journal).snapshot();
            verifiers::run_verifiers(&journal, &registry)
        };

        let env_result = self.environment.exit();
        self.phase = Phase::Verify;

        verification.map_err(Error::Verification)?;
        if let Some(err) = session_error {
            return Err(err);
        }
        env_result
    }

    /// Replay, run *body*, then verify, releasing the environment on every
    /// path.
    ///
    /// When both the body and verification fail, the body's error takes
    /// precedence; verification is still executed so resources are released
    /// either way.
    pub fn run<T, E, F>(&mut self, body: F) -> std::result::Result<T, Error>
    where
        F: FnOnce(&mut Self) -> std::result::Result<T, E>,
        E: Into<Error>,
    {
        self.replay()?;
        let outcome = body(self);
        let verification = self.verify();
        match outcome {
            Ok(value) => verification.map(|()| value),
            Err(err) => Err(err.into()),
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Owned copy of the journal in completion order.
    pub fn journal(&self) -> Vec<Invocation> {
        lock(&self.shared.journal).snapshot()
    }

    /// The environment manager backing this controller.
    pub fn environment(&self) -> &EnvironmentManager {
        &self.environment
    }

    /// Outstanding passthrough executions (testing aid).
    pub fn pending_passthrough_count(&self) -> usize {
        self.shared.coordinator.pending_count()
    }
}

impl Default for CmdMox {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CmdMox {
    fn drop(&mut self) {
        if self.phase == Phase::Replay {
            if let Some(mut server) = self.server.take() {
                server.stop();
            }
            if let Err(err) = self.environment.exit() {
                warn!(%err, "environment teardown on drop");
            }
        }
    }
}

// ----------------------------------------------------------------------
// IPC bridge
// ----------------------------------------------------------------------

enum InvocationPlan {
    Unknown,
    Passthrough {
        index: usize,
        env_overrides: BTreeMap<String, String>,
    },
    Regular {
        index: usize,
        handler: Option<Arc<dyn crate::doubles::Handler>>,
        response: Response,
        env_overrides: BTreeMap<String, String>,
        matched: bool,
    },
}

struct ServerBridge(Arc<SharedState>);

impl IpcHandlers for ServerBridge {
    fn on_invocation(&self, mut invocation: Invocation) -> Response {
        invocation.timestamp = Some(Utc::now());
        let shared = &self.0;

        let plan = {
            let registry = lock(&shared.registry);
            match registry.lookup(&invocation.command) {
                None => InvocationPlan::Unknown,
                Some(index) => {
                    let double = &registry.entries[index];
                    let matched = double.expectation.matches(&invocation);
                    if double.passthrough_mode {
                        InvocationPlan::Passthrough {
                            index,
                            env_overrides: double.expectation.env_overrides().clone(),
                        }
                    } else {
                        InvocationPlan::Regular {
                            index,
                            handler: double.handler.clone(),
                            response: double.response.clone(),
                            env_overrides: double.expectation.env_overrides().clone(),
                            matched,
                        }
                    }
                }
            }
        };

        match plan {
            InvocationPlan::Unknown => {
                let response = Response::failure(
                    format!("cmdmox: unexpected command {:?}", invocation.command),
                    1,
                );
                invocation.apply(&response);
                lock(&shared.journal).push(invocation);
                response
            }
            InvocationPlan::Passthrough {
                index,
                env_overrides,
            } => {
                // Match bookkeeping happens at finalize time, against the
                // invocation as stored in the pending table.
                let lookup_path = lock(&shared.replay)
                    .as_ref()
                    .map(|settings| settings.lookup_path.clone())
                    .unwrap_or_default();
                // No journal entry yet: that happens when the result lands.
                shared.coordinator.prepare_request(
                    index,
                    &invocation,
                    &lookup_path,
                    &env_overrides,
                    shared.passthrough_timeout,
                )
            }
            InvocationPlan::Regular {
                index,
                handler,
                response,
                env_overrides,
                matched,
            } => {
                if !matched {
                    let mut registry = lock(&shared.registry);
                    registry.entries[index].mismatches.push(invocation.clone());
                }

                // Handlers see the invocation with expectation overrides
                // already applied; the host environment is never touched.
                let mut view = invocation.clone();
                view.env.extend(env_overrides.clone());

                let mut response = match handler {
                    Some(handler) => {
                        match catch_unwind(AssertUnwindSafe(|| handler.run(&view))) {
                            Ok(response) => response,
                            Err(payload) => {
                                let message = panic_text(payload);
                                warn!(%message, command = %invocation.command, "handler panicked");
                                Response::failure(message, 1)
                            }
                        }
                    }
                    None => response,
                };

                // Expectation overrides win over handler-supplied env.
                for (key, value) in &env_overrides {
                    response.env.insert(key.clone(), value.clone());
                }

                invocation.env.extend(env_overrides);
                invocation.apply(&response);

                if matched {
                    let mut registry = lock(&shared.registry);
                    registry.entries[index].invocations.push(invocation.clone());
                }
                lock(&shared.journal).push(invocation);
                response
            }
        }
    }

    fn on_passthrough_result(&self, result: PassthroughResult) -> Response {
        let shared = &self.0;

        let (index, mut invocation, mut response) =
            match shared.coordinator.finalize_result(&result) {
                Ok(parts) => parts,
                Err(message) => {
                    warn!(%message, "orphaned passthrough result");
                    return Response::failure(format!("cmdmox: {message}"), 1);
                }
            };

        {
            let mut registry = lock(&shared.registry);
            let double = &mut registry.entries[index];

            // Matching looks at the invocation as the launcher reported it,
            // before expectation overrides land on the recorded entry.
            let matched = double.expectation.matches(&invocation);

            let env_overrides = double.expectation.env_overrides().clone();
            for (key, value) in &env_overrides {
                response.env.insert(key.clone(), value.clone());
            }
            invocation.env.extend(env_overrides);

            if matched {
                double.invocations.push(invocation.clone());
            } else {
                double.mismatches.push(invocation.clone());
            }
            if let Some(recording) = &double.recording {
                if let Err(err) = recording.record(&invocation, &response) {
                    warn!(%err, command = %double.name, "recording append failed");
                }
            }
        }

        lock(&shared.journal).push(invocation);
        response
    }
}

pub(crate) fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}
