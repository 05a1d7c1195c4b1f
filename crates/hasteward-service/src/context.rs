// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The explicit context threaded through every engine operation.

use std::{sync::Arc, time::Duration};

use hasteward_archive::Archive;
use hasteward_core::ClusterRef;
use hasteward_platform::Platform;
use tokio_util::sync::CancellationToken;

use crate::{
    config::StewardConfig,
    error::{EngineError, EngineResult},
};

/// Everything an engine needs to act on one cluster: the platform adapter,
/// the (optional) archive, the operation configuration, and the cancellation
/// handle. There is no process-global state; the CLI wires one context per
/// invocation.
#[derive(Clone)]
pub struct EngineContext {
    pub cluster: ClusterRef,
    pub platform: Arc<dyn Platform>,
    pub archive: Option<Arc<dyn Archive>>,
    pub config: StewardConfig,
    pub cancel: CancellationToken,
}

impl EngineContext {
    pub fn new(
        cluster: ClusterRef,
        platform: Arc<dyn Platform>,
        archive: Option<Arc<dyn Archive>>,
        config: StewardConfig,
    ) -> Self {
        Self {
            cluster,
            platform,
            archive,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.cluster.namespace
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster.cluster
    }

    /// The archive, or a validation error explaining how to provide one.
    pub fn archive(&self) -> EngineResult<&Arc<dyn Archive>> {
        self.archive.as_ref().ok_or_else(|| {
            EngineError::Validation(
                "an archive repository is required (--repository and the repository password), \
                 or pass --no-escrow to skip backups"
                    .to_owned(),
            )
        })
    }

    /// Sleeps for `duration`, honoring cancellation between waits.
    pub async fn sleep(&self, duration: Duration) -> EngineResult<()> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(EngineError::Interrupted),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Returns an error if cancellation has been requested.
    pub fn check_cancelled(&self) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Interrupted)
        } else {
            Ok(())
        }
    }
}
