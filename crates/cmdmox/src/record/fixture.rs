// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fixture file schema (v1.0) and persistence.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::platform::current_platform;

pub const FIXTURE_SCHEMA_VERSION: &str = "1.0";

/// A single recorded command invocation within a fixture.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordedInvocation {
    pub sequence: usize,
    pub command: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub env_subset: BTreeMap<String, String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    pub timestamp: String,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Metadata captured alongside fixture recordings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixtureMetadata {
    pub created_at: String,
    pub cmdmox_version: String,
    pub platform: String,
}

impl FixtureMetadata {
    pub fn create() -> Self {
        Self {
            created_at: Utc::now().to_rfc3339(),
            cmdmox_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: current_platform(),
        }
    }
}

/// The persisted fixture document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixtureFile {
    pub version: String,
    pub metadata: FixtureMetadata,
    pub recordings: Vec<RecordedInvocation>,
    #[serde(default)]
    pub scrubbing_rules: Vec<String>,
}

impl FixtureFile {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let rendered = serde_json::to_string_pretty(self)
            .map_err(|err| Error::Configuration(format!("fixture serialization failed: {err}")))?;
        std::fs::write(path, rendered)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|err| Error::Configuration(format!("fixture parse failed: {err}")))
    }
}
