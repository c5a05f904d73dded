// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Recording session lifecycle: `start()` → `record()`* → `finalize()`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::debug;

use cmdmox_proto::{Invocation, Response};

use super::env_filter::filter_env_subset;
use super::fixture::{FixtureFile, FixtureMetadata, RecordedInvocation, FIXTURE_SCHEMA_VERSION};
use super::scrubber::Scrubber;
use crate::errors::{Error, Result};

struct SessionState {
    recordings: Vec<RecordedInvocation>,
    started: bool,
    fixture: Option<FixtureFile>,
}

/// Captures passthrough invocations and persists them as a fixture file.
///
/// Sessions are shared between the controller (which finalizes them before
/// environment teardown) and the IPC worker that records completions, hence
/// the interior locking.
pub struct RecordingSession {
    fixture_path: PathBuf,
    scrubber: Option<Box<dyn Scrubber>>,
    env_allowlist: Vec<String>,
    command_filter: Option<Vec<String>>,
    state: Mutex<SessionState>,
}

impl RecordingSession {
    pub fn new(fixture_path: impl Into<PathBuf>) -> Self {
        Self {
            fixture_path: fixture_path.into(),
            scrubber: None,
            env_allowlist: Vec::new(),
            command_filter: None,
            state: Mutex::new(SessionState {
                recordings: Vec::new(),
                started: false,
                fixture: None,
            }),
        }
    }

    pub fn with_scrubber(mut self, scrubber: Box<dyn Scrubber>) -> Self {
        self.scrubber = Some(scrubber);
        self
    }

    pub fn with_env_allowlist(mut self, allowlist: Vec<String>) -> Self {
        self.env_allowlist = allowlist;
        self
    }

    /// Restrict recording to the given command names.
    pub fn with_command_filter(mut self, commands: Vec<String>) -> Self {
        self.command_filter = Some(commands);
        self
    }

    pub fn fixture_path(&self) -> &Path {
        &self.fixture_path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    /// Begin the session. Starting a finalized session is a lifecycle error.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock();
        if state.fixture.is_some() {
            return Err(Error::Lifecycle(
                "cannot start a finalized recording session".to_string(),
            ));
        }
        state.started = true;
        Ok(())
    }

    /// Record a single passthrough invocation.
    pub fn record(&self, invocation: &Invocation, response: &Response) -> Result<()> {
        if let Some(filter) = &self.command_filter {
            if !filter.iter().any(|name| name == &invocation.command) {
                return Ok(());
            }
        }

        let env_subset =
            filter_env_subset(&invocation.env, &invocation.command, &self.env_allowlist);
        let duration_ms = invocation
            .timestamp
            .map(|captured| {
                (Utc::now() - captured)
                    .num_milliseconds()
                    .max(0) as u64
            })
            .unwrap_or(0);

        // Sequence assignment and append are atomic so concurrent
        // passthrough completions produce gap-free sequence numbers.
        let mut state = self.lock();
        if !state.started {
            return Err(Error::Lifecycle(
                "recording session has not been started".to_string(),
            ));
        }
        if state.fixture.is_some() {
            return Err(Error::Lifecycle(
                "cannot record after the session has been finalized".to_string(),
            ));
        }

        let mut recording = RecordedInvocation {
            sequence: state.recordings.len(),
            command: invocation.command.clone(),
            args: invocation.args.clone(),
            stdin: invocation.stdin.clone(),
            env_subset,
            stdout: response.stdout.clone(),
            stderr: response.stderr.clone(),
            exit_code: response.exit_code,
            timestamp: Utc::now().to_rfc3339(),
            duration_ms,
        };
        if let Some(scrubber) = &self.scrubber {
            recording = scrubber.scrub(recording);
        }
        state.recordings.push(recording);
        Ok(())
    }

    /// Persist the fixture to disk. Idempotent: a second call returns the
    /// already-assembled fixture without re-writing the file.
    pub fn finalize(&self) -> Result<FixtureFile> {
        let mut state = self.lock();
        if let Some(fixture) = &state.fixture {
            return Ok(fixture.clone());
        }

        let fixture = FixtureFile {
            version: FIXTURE_SCHEMA_VERSION.to_string(),
            metadata: FixtureMetadata::create(),
            recordings: state.recordings.clone(),
            scrubbing_rules: Vec::new(),
        };
        fixture.save(&self.fixture_path)?;
        debug!(path = %self.fixture_path.display(), recordings = fixture.recordings.len(),
               "recording session finalized");
        state.fixture = Some(fixture.clone());
        Ok(fixture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn invocation(command: &str) -> Invocation {
        Invocation::new(
            command,
            vec!["-x".to_string()],
            "input",
            BTreeMap::from([("LANG".to_string(), "C".to_string())]),
            "inv-1",
        )
    }

    fn response() -> Response {
        Response {
            stdout: "out".to_string(),
            exit_code: 2,
            ..Response::default()
        }
    }

    #[test]
    fn record_before_start_is_rejected() {
        let session = RecordingSession::new("unused.json");
        assert!(session.record(&invocation("git"), &response()).is_err());
    }

    #[test]
    fn finalize_writes_fixture_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.json");
        let session = RecordingSession::new(&path);
        session.start().unwrap();
        session.record(&invocation("git"), &response()).unwrap();

        let first = session.finalize().unwrap();
        assert_eq!(first.recordings.len(), 1);
        assert_eq!(first.recordings[0].command, "git");
        assert_eq!(first.recordings[0].exit_code, 2);
        assert!(path.exists());

        let second = session.finalize().unwrap();
        assert_eq!(first, second);
        assert!(session.record(&invocation("git"), &response()).is_err());
    }

    #[test]
    fn command_filter_limits_captures() {
        let dir = tempfile::tempdir().unwrap();
        let session = RecordingSession::new(dir.path().join("f.json"))
            .with_command_filter(vec!["curl".to_string()]);
        session.start().unwrap();
        session.record(&invocation("git"), &response()).unwrap();
        session.record(&invocation("curl"), &response()).unwrap();

        let fixture = session.finalize().unwrap();
        assert_eq!(fixture.recordings.len(), 1);
        assert_eq!(fixture.recordings[0].command, "curl");
        assert_eq!(fixture.recordings[0].sequence, 0);
    }

    #[test]
    fn scrubber_is_applied_before_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let session = RecordingSession::new(dir.path().join("f.json")).with_scrubber(Box::new(
            |mut recording: RecordedInvocation| {
                recording.stdout = "<scrubbed>".to_string();
                recording
            },
        ));
        session.start().unwrap();
        session.record(&invocation("git"), &response()).unwrap();
        let fixture = session.finalize().unwrap();
        assert_eq!(fixture.recordings[0].stdout, "<scrubbed>");
    }
}
