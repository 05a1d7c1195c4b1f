// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The streaming dump/restore pipelines shared by both engines.
//!
//! Backup couples a remote-exec stdout stream to `backup --stdin`; restore
//! couples `dump` output to a remote-exec stdin. Both give single-error
//! semantics: the side that failed first is the error the caller sees, never
//! a generic closed-pipe artifact.

use chrono::{DateTime, Utc};
use hasteward_archive::{tags, TagMap};
use hasteward_platform::{views, ResourceKind};
use tracing::{debug, info};

use crate::{
    context::EngineContext,
    error::{EngineError, EngineResult},
    redact::redact,
    types::BackupOutcome,
};

/// Builds the mandatory tag set of a snapshot, merged with `extra_tags`.
pub fn snapshot_tags(ctx: &EngineContext, snapshot_type: &str, extra_tags: TagMap) -> TagMap {
    let mut map = TagMap::new();
    map.insert(tags::ENGINE.to_owned(), ctx.cluster.engine.as_str().to_owned());
    map.insert(tags::CLUSTER.to_owned(), ctx.cluster_name().to_owned());
    map.insert(tags::NAMESPACE.to_owned(), ctx.namespace().to_owned());
    map.insert(tags::TYPE.to_owned(), snapshot_type.to_owned());
    map.extend(extra_tags);
    map
}

/// The tag filter selecting this cluster's snapshots (any type).
pub fn cluster_filter(ctx: &EngineContext) -> TagMap {
    let mut map = TagMap::new();
    map.insert(tags::ENGINE.to_owned(), ctx.cluster.engine.as_str().to_owned());
    map.insert(tags::CLUSTER.to_owned(), ctx.cluster_name().to_owned());
    map.insert(tags::NAMESPACE.to_owned(), ctx.namespace().to_owned());
    map
}

/// Requires the pod to be running with a ready database container.
pub async fn require_running_ready(ctx: &EngineContext, pod: &str) -> EngineResult<()> {
    let value = ctx
        .platform
        .get_resource(ResourceKind::Pod, ctx.namespace(), pod, &ctx.cancel)
        .await
        .map_err(|error| {
            if error.is_not_found() {
                EngineError::Precondition(format!("pod {pod} not found"))
            } else {
                error.into()
            }
        })?;
    let observation = views::parse_pod(&value)
        .ok_or_else(|| EngineError::Precondition(format!("pod {pod} has no readable status")))?;
    if !observation.is_running_ready() {
        return Err(EngineError::Precondition(format!(
            "pod {pod} is not running and ready"
        )));
    }
    Ok(())
}

/// Streams a database dump out of `donor` into a new snapshot.
///
/// The remote command's stdout is piped straight into the archiver's stdin;
/// nothing touches local disk. The snapshot carries `job_start` as its
/// timestamp so that every snapshot of one job shares the same time.
#[allow(clippy::too_many_arguments)]
pub async fn stream_backup(
    ctx: &EngineContext,
    donor: &str,
    container: &str,
    command: Vec<String>,
    virtual_path: &str,
    snapshot_type: &str,
    extra_tags: TagMap,
    job_start: DateTime<Utc>,
) -> EngineResult<BackupOutcome> {
    let started = std::time::Instant::now();
    let archive = ctx.archive()?.clone();

    require_running_ready(ctx, donor).await?;
    archive.init().await?;

    debug!(
        donor,
        command = %redact(command.join(" ")),
        virtual_path,
        "starting streaming dump"
    );
    let (reader, waiter) = ctx
        .platform
        .exec_pipe_out(ctx.namespace(), donor, container, &command, &ctx.cancel)
        .await?;

    let tag_map = snapshot_tags(ctx, snapshot_type, extra_tags);
    let archive_result = archive
        .backup_stdin(reader, virtual_path, &tag_map, job_start)
        .await;
    let exec_result = waiter.wait().await;

    // Single-error precedence: if the dump command itself failed, that is
    // the root cause and the archiver error is only its echo.
    let summary = match (archive_result, exec_result) {
        (_, Err(exec_error)) => {
            return Err(EngineError::stream(
                "backup",
                format!("dump command failed on {donor}: {exec_error}"),
            ));
        }
        (Err(archive_error), Ok(())) => return Err(archive_error.into()),
        (Ok(summary), Ok(())) => summary,
    };

    info!(
        snapshot = %summary.snapshot_id,
        data_added = summary.data_added,
        total_size = summary.total_size,
        "snapshot written"
    );
    Ok(BackupOutcome {
        snapshot_id: summary.snapshot_id,
        repository: archive.location(),
        size_bytes: summary.total_size,
        tags: tag_map,
        duration: started.elapsed(),
    })
}

/// Streams a snapshot's dump file into a remote command's stdin.
pub async fn stream_restore(
    ctx: &EngineContext,
    target: &str,
    container: &str,
    command: Vec<String>,
    snapshot: &str,
    virtual_path: &str,
    filter: &TagMap,
) -> EngineResult<()> {
    let archive = ctx.archive()?.clone();

    debug!(
        target,
        snapshot,
        virtual_path,
        command = %redact(command.join(" ")),
        "starting streaming restore"
    );

    let (dump_side, exec_side) = tokio::io::duplex(64 * 1024);
    let dump = archive.dump(snapshot, virtual_path, Box::pin(dump_side), filter);
    let exec = ctx.platform.exec_streamed(
        ctx.namespace(),
        target,
        container,
        &command,
        Box::pin(exec_side),
        &ctx.cancel,
    );
    let (dump_result, exec_result) = tokio::join!(dump, exec);

    // The dump producer failing is the root cause; the consumer merely saw
    // its stream end early.
    if let Err(dump_error) = dump_result {
        return Err(dump_error.into());
    }
    exec_result.map_err(|exec_error| {
        EngineError::stream(
            "restore",
            format!("restore command failed on {target}: {exec_error}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mandatory_tags_are_always_present() {
        use hasteward_core::{ClusterRef, EngineKind};
        use std::sync::Arc;

        let ctx = EngineContext::new(
            ClusterRef::new(EngineKind::Galera, "prod", "gdb"),
            Arc::new(crate::test_utils::MockPlatform::default()),
            None,
            crate::config::StewardConfig::default(),
        );
        let mut extra = TagMap::new();
        extra.insert("job".to_owned(), "20240701T120000Z".to_owned());
        let tags = snapshot_tags(&ctx, "diverged", extra);

        assert_eq!(tags["engine"], "galera");
        assert_eq!(tags["cluster"], "gdb");
        assert_eq!(tags["namespace"], "prod");
        assert_eq!(tags["type"], "diverged");
        assert_eq!(tags["job"], "20240701T120000Z");
    }
}
