// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Pluggable scrubbing hook applied to recordings before persistence.

use super::fixture::RecordedInvocation;

/// Sanitizes a recording before it reaches disk.
///
/// No concrete scrubber ships with the core; recording sessions invoke an
/// implementation supplied by the caller, typically to strip credentials or
/// normalize machine-specific paths out of captured stdio.
pub trait Scrubber: Send + Sync {
    fn scrub(&self, recording: RecordedInvocation) -> RecordedInvocation;
}

impl<F> Scrubber for F
where
    F: Fn(RecordedInvocation) -> RecordedInvocation + Send + Sync,
{
    fn scrub(&self, recording: RecordedInvocation) -> RecordedInvocation {
        self(recording)
    }
}
