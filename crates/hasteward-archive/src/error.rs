// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

pub type ArchiveResult<T> = Result<T, ArchiveError>;

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("failed to spawn archiver for {operation}: {source}")]
    Spawn {
        operation: String,
        source: std::io::Error,
    },

    #[error("archiver {operation} failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        operation: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("archiver backup exited cleanly but emitted no summary message")]
    MissingSummary,

    #[error("failed to parse archiver {operation} output: {source}")]
    Parse {
        operation: String,
        source: serde_json::Error,
    },

    #[error("stream error during {operation}: {source}")]
    Stream {
        operation: String,
        source: std::io::Error,
    },
}

impl ArchiveError {
    pub fn command_failed(operation: &str, code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self::CommandFailed {
            operation: operation.to_owned(),
            code,
            stderr: stderr.into(),
        }
    }
}
