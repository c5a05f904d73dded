// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Recording of passthrough invocations to fixture files.
//!
//! A recording session collects `(invocation, response)` pairs from a
//! passthrough spy, filters the environment to a safe subset, optionally
//! scrubs them, and persists a versioned JSON fixture on finalize.

mod env_filter;
mod fixture;
mod scrubber;
mod session;

pub use env_filter::{filter_env_subset, EXCLUDED_SYSTEM_KEYS};
pub use fixture::{FixtureFile, FixtureMetadata, RecordedInvocation, FIXTURE_SCHEMA_VERSION};
pub use scrubber::Scrubber;
pub use session::RecordingSession;
