// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration of a steward operation.

use std::time::Duration;

/// Options shared by the triage, repair, backup, and restore operations.
///
/// The CLI assembles this from flags and `HASTEWARD_`-prefixed environment
/// fallbacks; nothing in the library reads the environment itself.
#[derive(Debug, Clone)]
pub struct StewardConfig {
    /// Target instance ordinal for targeted repair and diverged restore.
    pub instance: Option<u32>,
    /// Override the split-brain and already-healthy gates (targeted repair
    /// only).
    pub force: bool,
    /// Skip the pre-repair escrow backup. Explicit opt-in; always logged as
    /// a warning.
    pub no_escrow: bool,
    /// Snapshot id for restore, or `"latest"`.
    pub snapshot: String,
    /// Bound on heal-completion waits.
    pub heal_timeout: Duration,
    /// Bound on pod-deletion waits (including the fenced-pod delete race).
    pub delete_timeout: Duration,
}

impl Default for StewardConfig {
    fn default() -> Self {
        Self {
            instance: None,
            force: false,
            no_escrow: false,
            snapshot: "latest".to_owned(),
            heal_timeout: Duration::from_secs(600),
            delete_timeout: Duration::from_secs(300),
        }
    }
}
