// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Passthrough coordination for spy doubles.
//!
//! A passthrough response tells the launcher to run the real binary and
//! report back. Between those two messages the invocation is *pending*; the
//! coordinator owns that table and is the only path by which real-world
//! stdio and exit codes enter the journal.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use cmdmox_proto::{Invocation, PassthroughRequest, PassthroughResult, Response};

/// How long an unanswered passthrough entry survives before being swept.
pub const DEFAULT_CLEANUP_TTL: Duration = Duration::from_secs(300);

struct PendingEntry {
    double_index: usize,
    invocation: Invocation,
    deadline: Instant,
}

/// Pending-table owner for in-flight passthrough executions.
pub struct PassthroughCoordinator {
    pending: Mutex<HashMap<String, PendingEntry>>,
    cleanup_ttl: Duration,
}

impl Default for PassthroughCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_CLEANUP_TTL)
    }
}

impl PassthroughCoordinator {
    pub fn new(cleanup_ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            cleanup_ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn prune_expired(table: &mut HashMap<String, PendingEntry>) {
        let now = Instant::now();
        table.retain(|_, entry| entry.deadline > now);
    }

    /// Store the pending entry and build the response instructing the
    /// launcher to execute the real command.
    pub fn prepare_request(
        &self,
        double_index: usize,
        invocation: &Invocation,
        lookup_path: &str,
        extra_env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Response {
        let stored = Invocation {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            ..invocation.clone()
        };
        let ttl = timeout.max(self.cleanup_ttl);

        {
            let mut table = self.lock();
            Self::prune_expired(&mut table);
            table.insert(
                invocation.invocation_id.clone(),
                PendingEntry {
                    double_index,
                    invocation: stored,
                    deadline: Instant::now() + ttl,
                },
            );
        }

        Response {
            env: extra_env.clone(),
            passthrough: Some(PassthroughRequest {
                invocation_id: invocation.invocation_id.clone(),
                lookup_path: lookup_path.to_string(),
                extra_env: extra_env.clone(),
                timeout: timeout.as_secs_f64(),
            }),
            ..Response::default()
        }
    }

    /// Pop the pending entry and synthesize the final response from the
    /// launcher's captured stdio and exit code.
    ///
    /// Returns `(double_index, finalized_invocation, response)`, or an error
    /// message when the invocation id is unknown or expired. The response
    /// env starts empty; the controller layers expectation overrides on top.
    pub fn finalize_result(
        &self,
        result: &PassthroughResult,
    ) -> Result<(usize, Invocation, Response), String> {
        let entry = {
            let mut table = self.lock();
            Self::prune_expired(&mut table);
            table.remove(&result.invocation_id)
        };
        let Some(entry) = entry else {
            return Err(format!(
                "unexpected passthrough result for {}",
                result.invocation_id
            ));
        };

        let response = Response {
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            exit_code: result.exit_code,
            env: BTreeMap::new(),
            passthrough: None,
        };
        let mut invocation = entry.invocation;
        invocation.apply(&response);
        Ok((entry.double_index, invocation, response))
    }

    /// Whether *invocation_id* is awaiting a passthrough result.
    pub fn has_pending(&self, invocation_id: &str) -> bool {
        let mut table = self.lock();
        Self::prune_expired(&mut table);
        table.contains_key(invocation_id)
    }

    pub fn pending_count(&self) -> usize {
        let mut table = self.lock();
        Self::prune_expired(&mut table);
        table.len()
    }
}
