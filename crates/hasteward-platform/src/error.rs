// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Failure taxonomy of the platform adapter.
///
/// The variants are the distinctions callers act on: `NotFound` may be
/// recovered locally when absence is semantically meaningful, `Timeout`
/// marks an expired bounded wait, `Cancelled` reports a cancellation
/// handle firing while the call was in flight, everything else propagates.
#[derive(thiserror::Error, Debug)]
pub enum PlatformError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("platform transport error: {0}")]
    Transport(String),

    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("platform call cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl PlatformError {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Maps a Kubernetes client error onto the platform taxonomy.
impl From<kube::Error> for PlatformError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) if response.code == 404 => Self::NotFound {
                kind: response.reason,
                name: response.message,
            },
            kube::Error::Api(response) if response.code == 403 => Self::Forbidden(response.message),
            other => Self::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_recoverable_marker() {
        let error = PlatformError::not_found("PersistentVolumeClaim", "storage-g-1");
        assert!(error.is_not_found());
        assert!(!PlatformError::Transport("boom".to_owned()).is_not_found());
    }

    #[test]
    fn api_codes_map_to_taxonomy() {
        let not_found = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_owned(),
            message: "pods \"db-1\" not found".to_owned(),
            reason: "NotFound".to_owned(),
            code: 404,
        });
        assert!(PlatformError::from(not_found).is_not_found());

        let forbidden = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_owned(),
            message: "no".to_owned(),
            reason: "Forbidden".to_owned(),
            code: 403,
        });
        assert!(matches!(
            PlatformError::from(forbidden),
            PlatformError::Forbidden(_)
        ));
    }
}
