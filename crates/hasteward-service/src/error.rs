// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

use hasteward_archive::ArchiveError;
use hasteward_platform::PlatformError;

pub type EngineResult<T> = Result<T, EngineError>;

/// Failure taxonomy of the engines and the repair orchestrator.
///
/// `Validation` and `Precondition` fire before any mutation; `SafetyGate`
/// is a deliberate hard stop with remediation guidance; `Partial` failures
/// (diverged capture errors) are logged and never surfaced here.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("safety gate: {0}")]
    SafetyGate(String),

    #[error("{what} did not complete within {seconds}s")]
    Timeout { what: String, seconds: u64 },

    #[error("heal failed for {instance}: {detail}")]
    HealFailed { instance: String, detail: String },

    #[error("stream failed during {phase}: {detail}")]
    Stream { phase: String, detail: String },

    #[error("operation interrupted")]
    Interrupted,

    #[error(transparent)]
    Platform(PlatformError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// A platform call aborted by the cancellation handle surfaces as
/// [`EngineError::Interrupted`], so the engines' rescue paths treat
/// mid-call and between-call cancellation identically.
impl From<PlatformError> for EngineError {
    fn from(error: PlatformError) -> Self {
        match error {
            PlatformError::Cancelled => Self::Interrupted,
            other => Self::Platform(other),
        }
    }
}

impl EngineError {
    pub fn timeout(what: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            what: what.into(),
            seconds,
        }
    }

    pub fn heal_failed(instance: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::HealFailed {
            instance: instance.into(),
            detail: detail.into(),
        }
    }

    pub fn stream(phase: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Stream {
            phase: phase.into(),
            detail: detail.into(),
        }
    }
}
