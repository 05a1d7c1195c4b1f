// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Replica heal for Postgres: fence, wipe, `pg_basebackup`, unfence.
//!
//! The fenced pod must release its volume claim before the heal pod can
//! bind it, so after the heal pod is created the fenced pod is deleted in a
//! 1 Hz loop until the heal pod leaves `Pending`. If the heal itself fails
//! the fence is deliberately left applied; the cluster operator must not
//! restart an instance whose data directory is half-wiped.

use std::time::Duration;

use chrono::Utc;
use hasteward_core::{
    cluster::{postgres_data_claim, PG_DATA_MOUNT},
    evidence::PodPhase,
};
use hasteward_platform::{
    views::{self, fence_patch},
    ResourceKind,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    context::EngineContext,
    error::{EngineError, EngineResult},
    helper_pod::{self, claim_volume, secret_volume, RunAs, ROLE_HEAL},
    pipeline::require_running_ready,
    postgres::PostgresEngine,
};

/// Cadence of the fenced-pod delete race.
const DELETE_RACE_INTERVAL: Duration = Duration::from_secs(1);
/// Cadence of the heal-pod completion poll.
const HEAL_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Cadence and rounds of the final instance-ready wait.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(10);
const READY_POLL_ROUNDS: u32 = 30;

/// The replication role used for `pg_basebackup` against the primary.
const REPLICATION_USER: &str = "streaming_replica";

/// The script run by the heal pod: wipe the data directory, stage the TLS
/// material, and take a fresh base backup from the primary. The mutated
/// paths are part of the contract and covered by regression tests.
pub fn heal_script(primary_ip: &str) -> String {
    format!(
        r#"set -e
echo "clearing pgdata"
rm -rf /var/lib/postgresql/data/pgdata/*
rm -rf /var/lib/postgresql/data/pgdata/.[!.]*
rm -rf /var/lib/postgresql/data/lost+found 2>/dev/null || true

echo "staging TLS certificates"
mkdir -p /tmp/certs
cp /certs/ca/ca.crt /tmp/certs/
cp /certs/replication/tls.crt /tmp/certs/
cp /certs/replication/tls.key /tmp/certs/
chmod 600 /tmp/certs/tls.key

echo "running pg_basebackup"
pg_basebackup -h {primary_ip} -p 5432 -U {REPLICATION_USER} \
  -D /var/lib/postgresql/data/pgdata \
  -Fp -Xs -P -R \
  --checkpoint=fast \
  -d "sslmode=verify-ca sslcert=/tmp/certs/tls.crt sslkey=/tmp/certs/tls.key sslrootcert=/tmp/certs/ca.crt"

echo "pg_basebackup complete"
"#
    )
}

/// Appends `pod` to the fence list, preserving other members.
pub(crate) async fn fence_instance(ctx: &EngineContext, pod: &str) -> EngineResult<()> {
    let mut fenced = current_fence_list(ctx).await?;
    if fenced.iter().any(|member| member == pod) {
        debug!(pod, "instance already fenced");
        return Ok(());
    }
    fenced.push(pod.to_owned());
    apply_fence_list(ctx, &fenced).await
}

/// Removes `pod` from the fence list, preserving other members; removing
/// the last member clears the annotation entirely.
pub(crate) async fn unfence_instance(ctx: &EngineContext, pod: &str) -> EngineResult<()> {
    let mut fenced = current_fence_list(ctx).await?;
    fenced.retain(|member| member != pod);
    apply_fence_list(ctx, &fenced).await
}

async fn current_fence_list(ctx: &EngineContext) -> EngineResult<Vec<String>> {
    let value = ctx
        .platform
        .get_resource(
            ResourceKind::PostgresCluster,
            ctx.namespace(),
            ctx.cluster_name(),
            &ctx.cancel,
        )
        .await?;
    Ok(views::PostgresClusterView::from_value(value).fenced_instances)
}

async fn apply_fence_list(ctx: &EngineContext, fenced: &[String]) -> EngineResult<()> {
    ctx.platform
        .patch_merge(
            ResourceKind::PostgresCluster,
            ctx.namespace(),
            ctx.cluster_name(),
            fence_patch(fenced),
            &ctx.cancel,
        )
        .await?;
    Ok(())
}

/// Heals one replica. On failure the heal pod is removed but the fence
/// stays applied, and the returned error says so.
pub(crate) async fn heal_instance(
    engine: &mut PostgresEngine,
    target: &str,
    ordinal: u32,
) -> EngineResult<()> {
    let ctx = engine.ctx.clone();
    let namespace = ctx.namespace().to_owned();
    let cluster = ctx.cluster_name().to_owned();
    let container = hasteward_core::EngineKind::Postgres.container();

    // Heal prerequisites discovered from the primary.
    let primary = engine.require_primary()?;
    require_running_ready(&ctx, &primary).await?;
    let primary_ip = ctx
        .platform
        .get_resource(ResourceKind::Pod, &namespace, &primary, &ctx.cancel)
        .await
        .ok()
        .and_then(|value| views::parse_pod(&value))
        .and_then(|pod| pod.pod_ip)
        .ok_or_else(|| {
            EngineError::Precondition(format!("primary {primary} has no pod IP"))
        })?;
    let (uid, gid) = discover_database_ids(&ctx, &primary, container).await;
    let image = engine.view.image_name.clone().ok_or_else(|| {
        EngineError::Precondition("cluster spec has no image name".to_owned())
    })?;

    let heal_pod_name = format!("{cluster}-heal-{ordinal}-{}", Utc::now().timestamp());
    let heal_pod = helper_pod::build_pod(
        &namespace,
        &heal_pod_name,
        ROLE_HEAL,
        &image,
        hasteward_platform::shell::sh_command(heal_script(&primary_ip)),
        Some(RunAs {
            user: uid,
            group: Some(gid),
            fs_group: Some(gid),
        }),
        None,
        vec![
            claim_volume("pgdata", &postgres_data_claim(target), PG_DATA_MOUNT, false),
            secret_volume("ca", &format!("{cluster}-ca"), &[("ca.crt", "ca.crt")], "/certs/ca"),
            secret_volume(
                "replication",
                &format!("{cluster}-replication"),
                &[("tls.crt", "tls.crt"), ("tls.key", "tls.key")],
                "/certs/replication",
            ),
        ],
    );

    info!(
        target,
        heal_pod = %heal_pod_name,
        primary_ip = %primary_ip,
        "healing replica: fence, wipe, pg_basebackup, unfence"
    );

    fence_instance(&ctx, target).await?;
    // Give the operator a moment to observe the fence before the races
    // below start deleting its pod.
    if let Err(error) = ctx.sleep(Duration::from_secs(3)).await {
        return Err(abort(&ctx, None, target, error).await);
    }

    if let Err(error) = ctx.platform.create_pod(&namespace, &heal_pod, &ctx.cancel).await {
        return Err(abort(&ctx, None, target, error.into()).await);
    }
    if let Err(error) = ctx.sleep(Duration::from_secs(2)).await {
        return Err(abort(&ctx, Some(&heal_pod_name), target, error).await);
    }

    // Delete race: release the claim for the heal pod at 1 Hz. Winning is
    // the heal pod leaving Pending; losing is the delete budget expiring,
    // which fails the repair with the fence still applied.
    let mut deletes = 0u32;
    let mut acquired = false;
    let race_rounds = ctx.config.delete_timeout.as_secs().max(1);
    for _ in 0..race_rounds {
        match ctx
            .platform
            .get_pod_phase(&namespace, &heal_pod_name, &ctx.cancel)
            .await
        {
            Ok(Some(PodPhase::Running | PodPhase::Succeeded)) => {
                acquired = true;
                break;
            }
            Ok(Some(PodPhase::Failed)) => {
                log_heal_pod_output(&ctx, &heal_pod_name).await;
                let error = EngineError::heal_failed(
                    target,
                    "heal pod failed before acquiring the volume claim",
                );
                return Err(abort(&ctx, Some(&heal_pod_name), target, error).await);
            }
            Ok(_) | Err(_) => {}
        }
        if ctx
            .platform
            .delete_pod(&namespace, target, &ctx.cancel)
            .await
            .is_ok()
        {
            deletes += 1;
        }
        if let Err(error) = ctx.sleep(DELETE_RACE_INTERVAL).await {
            return Err(abort(&ctx, Some(&heal_pod_name), target, error).await);
        }
    }
    if !acquired {
        log_heal_pod_output(&ctx, &heal_pod_name).await;
        let error = EngineError::timeout(
            format!("heal pod {heal_pod_name} acquiring the volume claim"),
            race_rounds,
        );
        return Err(abort(&ctx, Some(&heal_pod_name), target, error).await);
    }
    info!(deletes, "heal pod acquired the volume claim");

    // Wait for the base backup to finish.
    let mut succeeded = false;
    let poll_rounds = (ctx.config.heal_timeout.as_secs() / HEAL_POLL_INTERVAL.as_secs()).max(1);
    for round in 0..poll_rounds {
        if let Err(error) = ctx.sleep(HEAL_POLL_INTERVAL).await {
            return Err(abort(&ctx, Some(&heal_pod_name), target, error).await);
        }
        match ctx
            .platform
            .get_pod_phase(&namespace, &heal_pod_name, &ctx.cancel)
            .await
        {
            Ok(Some(PodPhase::Succeeded)) => {
                succeeded = true;
                break;
            }
            Ok(Some(PodPhase::Failed)) => {
                log_heal_pod_output(&ctx, &heal_pod_name).await;
                let error = EngineError::heal_failed(target, "heal pod failed");
                return Err(abort(&ctx, Some(&heal_pod_name), target, error).await);
            }
            _ => {
                if round > 0 && round % 6 == 0 {
                    info!(elapsed_secs = round * HEAL_POLL_INTERVAL.as_secs(), "base backup still running");
                }
            }
        }
    }
    if !succeeded {
        log_heal_pod_output(&ctx, &heal_pod_name).await;
        let error = EngineError::timeout(
            format!("heal pod {heal_pod_name}"),
            ctx.config.heal_timeout.as_secs(),
        );
        return Err(abort(&ctx, Some(&heal_pod_name), target, error).await);
    }

    log_heal_pod_output(&ctx, &heal_pod_name).await;
    // The heal pod must be removed even if cancellation has fired.
    let cleanup = CancellationToken::new();
    let _ = ctx
        .platform
        .delete_pod(&namespace, &heal_pod_name, &cleanup)
        .await;
    if ctx.sleep(Duration::from_secs(5)).await.is_err() {
        warn!(target, "interrupted before unfence; the fence remains applied");
        return Err(EngineError::Interrupted);
    }

    // Hand the instance back to the operator.
    if let Err(error) = unfence_instance(&ctx, target).await {
        warn!(target, %error, "failed to remove the fence");
    }
    // Delete the old pod so its crash-loop history does not survive the
    // heal.
    let _ = ctx.platform.delete_pod(&namespace, target, &ctx.cancel).await;
    let _ = ctx.sleep(Duration::from_secs(5)).await;

    info!(target, "waiting for the replica to come back online");
    for _ in 0..READY_POLL_ROUNDS {
        if ctx.sleep(READY_POLL_INTERVAL).await.is_err() {
            break;
        }
        let ready = ctx
            .platform
            .get_resource(ResourceKind::Pod, &namespace, target, &ctx.cancel)
            .await
            .ok()
            .and_then(|value| views::parse_pod(&value))
            .is_some_and(|pod| pod.is_running_ready());
        if ready {
            info!(target, "replica healed and ready");
            return Ok(());
        }
    }
    warn!(target, "replica did not become ready in time; the operator may still be reconciling");
    Ok(())
}

/// Queries the database uid/gid from the primary, falling back to the
/// image default.
async fn discover_database_ids(
    ctx: &EngineContext,
    primary: &str,
    container: &str,
) -> (i64, i64) {
    let mut ids = (26, 26);
    for (index, flag) in ["-u", "-g"].iter().enumerate() {
        let command = vec!["id".to_owned(), (*flag).to_owned(), "postgres".to_owned()];
        if let Ok(output) = ctx
            .platform
            .exec_capture(ctx.namespace(), primary, container, &command, &ctx.cancel)
            .await
        {
            if let Ok(id) = output.stdout.trim().parse::<i64>() {
                if index == 0 {
                    ids.0 = id;
                } else {
                    ids.1 = id;
                }
            }
        }
    }
    ids
}

/// Removes the heal pod (when created) and records that the fence stays.
/// Runs after cancellation too, so the deletion uses a detached handle.
async fn abort(
    ctx: &EngineContext,
    heal_pod: Option<&str>,
    target: &str,
    error: EngineError,
) -> EngineError {
    if let Some(heal_pod) = heal_pod {
        let cleanup = CancellationToken::new();
        let _ = ctx
            .platform
            .delete_pod(ctx.namespace(), heal_pod, &cleanup)
            .await;
    }
    warn!(
        target,
        cluster = ctx.cluster_name(),
        "heal failed; the fence is left in place so the operator does not restart a wiped \
         instance. Remove it manually once resolved (annotation {})",
        views::FENCE_ANNOTATION,
    );
    error
}

async fn log_heal_pod_output(ctx: &EngineContext, pod: &str) {
    // Diagnostics on failure paths, wanted even after cancellation.
    let cleanup = CancellationToken::new();
    if let Ok(logs) = ctx
        .platform
        .read_pod_logs(ctx.namespace(), pod, None, &cleanup)
        .await
    {
        if !logs.is_empty() {
            info!(pod, logs = %logs.trim_end(), "heal pod output");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hasteward_core::{ClusterRef, EngineKind};
    use serde_json::{json, Value};

    use super::*;
    use crate::{config::StewardConfig, test_utils::MockPlatform};

    fn fence_context(annotation: Option<&str>) -> (Arc<MockPlatform>, EngineContext) {
        let platform = Arc::new(MockPlatform::default());
        let annotations = match annotation {
            Some(value) => json!({ views::FENCE_ANNOTATION: value }),
            None => json!({}),
        };
        platform.insert_resource(
            ResourceKind::PostgresCluster,
            "prod",
            "c",
            json!({
                "metadata": { "annotations": annotations },
                "spec": { "instances": 3 },
                "status": {}
            }),
        );
        let ctx = EngineContext::new(
            ClusterRef::new(EngineKind::Postgres, "prod", "c"),
            platform.clone(),
            None,
            StewardConfig::default(),
        );
        (platform, ctx)
    }

    async fn fenced_now(ctx: &EngineContext) -> Vec<String> {
        let value = ctx
            .platform
            .get_resource(ResourceKind::PostgresCluster, "prod", "c", &ctx.cancel)
            .await
            .unwrap();
        views::PostgresClusterView::from_value(value).fenced_instances
    }

    #[tokio::test]
    async fn fence_appends_preserving_existing_members() {
        let (_platform, ctx) = fence_context(Some(r#"["c-2"]"#));

        fence_instance(&ctx, "c-1").await.unwrap();
        assert_eq!(fenced_now(&ctx).await, ["c-2", "c-1"]);

        // Fencing an already-fenced instance is a no-op.
        fence_instance(&ctx, "c-1").await.unwrap();
        assert_eq!(fenced_now(&ctx).await, ["c-2", "c-1"]);
    }

    #[tokio::test]
    async fn unfencing_the_last_member_clears_the_annotation() {
        let (platform, ctx) = fence_context(Some(r#"["c-1","c-2"]"#));

        unfence_instance(&ctx, "c-1").await.unwrap();
        assert_eq!(fenced_now(&ctx).await, ["c-2"]);

        unfence_instance(&ctx, "c-2").await.unwrap();
        assert!(fenced_now(&ctx).await.is_empty());
        // The annotation key itself is gone, not left as an empty list.
        let state = platform.state();
        let resource = state
            .resources
            .get(&(ResourceKind::PostgresCluster, "prod".to_owned(), "c".to_owned()))
            .unwrap();
        assert_eq!(
            resource.pointer(&format!(
                "/metadata/annotations/{}",
                views::FENCE_ANNOTATION.replace('/', "~1")
            )),
            None::<&Value>,
        );
    }

    #[test]
    fn heal_script_wipes_and_rebuilds_from_the_primary() {
        let script = heal_script("10.0.4.9");
        // The data directory wipe, including dotfiles, preserving the claim.
        assert!(script.contains("rm -rf /var/lib/postgresql/data/pgdata/*"));
        assert!(script.contains("rm -rf /var/lib/postgresql/data/pgdata/.[!.]*"));
        // The base backup runs against the primary with verified TLS.
        assert!(script.contains("pg_basebackup -h 10.0.4.9 -p 5432 -U streaming_replica"));
        assert!(script.contains("sslmode=verify-ca"));
        assert!(script.contains("--checkpoint=fast"));
        // Fails fast on any step.
        assert!(script.starts_with("set -e"));
    }
}
