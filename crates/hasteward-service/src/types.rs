// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Operation outcome types.

use std::time::Duration;

use hasteward_archive::TagMap;
use hasteward_core::TriageResult;
use serde::Serialize;

/// Outcome of a backup (or escrow / diverged capture).
#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    pub snapshot_id: String,
    pub repository: String,
    pub size_bytes: u64,
    pub tags: TagMap,
    #[serde(skip)]
    pub duration: Duration,
}

/// Outcome of a repair run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairOutcome {
    pub healed_instances: Vec<String>,
    pub skipped_instances: Vec<String>,
    #[serde(skip)]
    pub duration: Duration,
    pub post_triage: Option<TriageResult>,
}

/// Outcome of a restore run.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub snapshot_id: String,
    #[serde(skip)]
    pub duration: Duration,
}
