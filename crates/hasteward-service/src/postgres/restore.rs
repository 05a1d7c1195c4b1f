// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Restore for Postgres: fence the replicas, stream the dump into the
//! primary, then release and recycle the replicas so they re-sync.

use hasteward_platform::{views::fence_patch, ResourceKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::EngineResult,
    pipeline::{self, require_running_ready},
    postgres::{restore_command, PostgresEngine},
    types::RestoreOutcome,
};

pub(crate) async fn restore(engine: &mut PostgresEngine) -> EngineResult<RestoreOutcome> {
    let started = std::time::Instant::now();
    let ctx = engine.ctx.clone();
    let namespace = ctx.namespace().to_owned();

    let primary = engine.require_primary()?;
    require_running_ready(&ctx, &primary).await?;

    let snapshot = ctx.config.snapshot.clone();
    // Diverged snapshots carry an ordinal-prefixed dump file.
    let virtual_path = match ctx.config.instance {
        Some(ordinal) => ctx.cluster.diverged_dump_path(ordinal),
        None => ctx.cluster.dump_path(),
    };
    let filter = pipeline::cluster_filter(&ctx);

    let replicas: Vec<String> = engine
        .view
        .instance_names
        .iter()
        .filter(|name| **name != primary)
        .cloned()
        .collect();

    // Fence every replica so nothing replays half-restored state.
    if !replicas.is_empty() {
        info!(replicas = %replicas.join(", "), "fencing replicas for the restore");
        ctx.platform
            .patch_merge(
                ResourceKind::PostgresCluster,
                &namespace,
                ctx.cluster_name(),
                fence_patch(&replicas),
                &ctx.cancel,
            )
            .await?;
    }

    let streamed = pipeline::stream_restore(
        &ctx,
        &primary,
        hasteward_core::EngineKind::Postgres.container(),
        restore_command(),
        &snapshot,
        &virtual_path,
        &filter,
    )
    .await;

    // The fence must come off on every exit path of the restore, including
    // a cancelled stream, so the patch uses a detached handle.
    if !replicas.is_empty() {
        let cleanup = CancellationToken::new();
        if let Err(error) = ctx
            .platform
            .patch_merge(
                ResourceKind::PostgresCluster,
                &namespace,
                ctx.cluster_name(),
                fence_patch(&[]),
                &cleanup,
            )
            .await
        {
            warn!(%error, "failed to unfence replicas after the restore");
        }
    }
    streamed?;

    // Recycle the replicas so they take a clean base from the restored
    // primary.
    for replica in &replicas {
        let _ = ctx.platform.delete_pod(&namespace, replica, &ctx.cancel).await;
    }
    if !replicas.is_empty() {
        info!("replicas unfenced and recycled; they will re-sync from the primary");
    }

    Ok(RestoreOutcome {
        snapshot_id: snapshot,
        duration: started.elapsed(),
    })
}
