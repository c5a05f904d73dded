// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! CmdMox — test doubles for external command-line programs.
//!
//! Declare how `git`, `curl`, or any other executable should behave; CmdMox
//! intercepts every invocation made by the code under test through PATH
//! shims, supplies the scripted behavior over IPC, records the interaction,
//! and verifies the observed calls against the declared expectations. The
//! paradigm is strictly record → replay → verify.
//!
//! ```no_run
//! use cmdmox::CmdMox;
//!
//! # fn main() -> cmdmox::Result<()> {
//! let mut mox = CmdMox::new();
//! mox.mock("git").with_args(["clone", "repo"]).returns("", "", 0);
//! mox.replay()?;
//! // ... run the code under test, which invokes `git clone repo` ...
//! mox.verify()?;
//! # Ok(())
//! # }
//! ```

pub mod comparators;
mod controller;
mod doubles;
pub mod environment;
mod errors;
pub mod expectations;
mod journal;
mod passthrough;
pub mod platform;
pub mod record;
pub mod shimgen;
mod verifiers;

pub use comparators::{ArgMatcher, StdinMatcher, ValueKind};
pub use controller::{CmdMox, CmdMoxConfig, Phase};
pub use doubles::{DoubleHandle, DoubleKind, Handler};
pub use environment::{
    EnvironmentManager, CMDMOX_IPC_SOCKET_ENV, CMDMOX_IPC_TIMEOUT_ENV,
    CMDMOX_REAL_COMMAND_ENV_PREFIX,
};
pub use errors::{Error, Result, VerificationError, VerificationFailure};
pub use expectations::Expectation;
pub use journal::Journal;
pub use passthrough::PassthroughCoordinator;
pub use record::{FixtureFile, RecordedInvocation, RecordingSession, Scrubber};

// Wire types shared with the launcher.
pub use cmdmox_proto::{Invocation, PassthroughRequest, PassthroughResult, Response};
