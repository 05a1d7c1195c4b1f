// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Node heal for Galera: suspend, scale down, reset the replication state,
//! scale back, resume.
//!
//! The node's data files stay in place; only `grastate.dat` is reset (and
//! `galera.cache` set aside) so the node rejoins via a full state transfer
//! from a donor. Any failure after the suspend runs the rescue path: helper
//! pods deleted, original scale restored, the cluster resource resumed, and
//! the original error surfaced. The resource is never left suspended on a
//! handled error path.

use std::time::Duration;

use chrono::Utc;
use hasteward_core::{
    cluster::{galera_config_claim, galera_storage_claim, GALERA_CONFIG_MOUNT, GALERA_DATA_MOUNT},
    evidence::PodPhase,
};
use hasteward_platform::{shell::sh_command, views, ResourceKind};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    context::EngineContext,
    error::EngineResult,
    galera::{triage::BUSYBOX_IMAGE, GaleraEngine},
    helper_pod::{self, claim_volume, RunAs, ROLE_HEAL},
};

/// Cadence of the pod-termination wait after scaling down.
const TERMINATION_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Cadence of the final node-ready wait.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Upper bound on one helper-pod run.
const HELPER_TIMEOUT: Duration = Duration::from_secs(150);

/// Replica count to scale to while the target's volumes must be free.
///
/// StatefulSets scale down from the highest ordinal, so only the highest
/// ordinal can be released by a partial scale-down; any other target forces
/// a full stop.
pub(crate) fn scale_target(ordinal: u32, replicas: i64) -> i32 {
    if i64::from(ordinal) == replicas - 1 {
        ordinal as i32
    } else {
        0
    }
}

/// The script resetting the Galera state on the storage volume. It must
/// reset `grastate.dat` to the undetermined state and preserve the previous
/// state files under `.pre-heal` names.
pub(crate) fn storage_reset_script() -> String {
    r#"set -e
echo "current grastate.dat:"
cat /var/lib/mysql/grastate.dat 2>/dev/null || echo "not found"
cp /var/lib/mysql/grastate.dat /var/lib/mysql/grastate.dat.pre-heal 2>/dev/null || echo "nothing to preserve"
printf '%s\n' \
  '# GALERA saved state' \
  'version: 2.1' \
  'uuid:    00000000-0000-0000-0000-000000000000' \
  'seqno:   -1' \
  'safe_to_bootstrap: 0' \
  > /var/lib/mysql/grastate.dat
echo "new grastate.dat:"
cat /var/lib/mysql/grastate.dat
mv /var/lib/mysql/galera.cache /var/lib/mysql/galera.cache.pre-heal 2>/dev/null || echo "no galera.cache to preserve"
echo "done"
"#
    .to_owned()
}

/// The script removing a stale bootstrap marker from the config volume.
pub(crate) fn config_cleanup_script() -> String {
    r#"set -e
if [ -f /galera/1-bootstrap.cnf ]; then
  echo "removing 1-bootstrap.cnf"
  rm -f /galera/1-bootstrap.cnf
else
  echo "no 1-bootstrap.cnf found"
fi
echo "done"
"#
    .to_owned()
}

/// What the rescue path must undo.
struct RescueState {
    suspended: bool,
    scaled_down: bool,
    original_replicas: i32,
    helpers: Vec<String>,
}

/// Heals one node; on any failure after the suspend the rescue path runs
/// before the original error is returned.
pub(crate) async fn heal_node(
    engine: &mut GaleraEngine,
    target: &str,
    ordinal: u32,
) -> EngineResult<()> {
    let ctx = engine.ctx.clone();
    let mut state = RescueState {
        suspended: false,
        scaled_down: false,
        original_replicas: engine.view.replicas as i32,
        helpers: Vec::new(),
    };

    let result = heal_steps(engine, &ctx, target, ordinal, &mut state).await;
    if let Err(error) = &result {
        warn!(target, %error, "heal failed; running the rescue path");
        rescue(&ctx, &state).await;
    }
    result
}

async fn heal_steps(
    engine: &GaleraEngine,
    ctx: &EngineContext,
    target: &str,
    ordinal: u32,
    state: &mut RescueState,
) -> EngineResult<()> {
    let namespace = ctx.namespace().to_owned();
    let cluster = ctx.cluster_name().to_owned();
    let replicas = engine.view.replicas;

    let target_scale = scale_target(ordinal, replicas);
    let has_config_volume = match ctx
        .platform
        .get_resource(
            ResourceKind::PersistentVolumeClaim,
            &namespace,
            &galera_config_claim(target),
            &ctx.cancel,
        )
        .await
    {
        Ok(_) => true,
        Err(error) if error.is_not_found() => false,
        Err(error) => return Err(error.into()),
    };

    info!(
        target,
        strategy = if target_scale > 0 { "partial" } else { "full" },
        scale_to = target_scale,
        has_config_volume,
        "healing node: suspend, scale, reset replication state, resume"
    );

    // Step 1: suspend the cluster resource so the operator stops fighting
    // the scale change.
    set_suspended(ctx, true, &ctx.cancel).await?;
    state.suspended = true;
    ctx.sleep(Duration::from_secs(3)).await?;

    // Step 2: scale down far enough to release the target's volumes.
    ctx.platform
        .scale(
            ResourceKind::StatefulSet,
            &namespace,
            &cluster,
            target_scale,
            &ctx.cancel,
        )
        .await?;
    state.scaled_down = true;

    let termination_rounds =
        (ctx.config.delete_timeout.as_secs() / TERMINATION_POLL_INTERVAL.as_secs()).max(1);
    let mut terminated = false;
    for _ in 0..termination_rounds {
        if ctx
            .platform
            .get_pod_phase(&namespace, target, &ctx.cancel)
            .await
            .is_ok_and(|phase| phase.is_none())
        {
            terminated = true;
            break;
        }
        ctx.sleep(TERMINATION_POLL_INTERVAL).await?;
    }
    if terminated {
        info!(target, "pod terminated, volume claims released");
    } else {
        warn!(target, "pod still present after the scale-down wait; continuing");
    }

    // Step 3: reset the replication state on the storage volume.
    let timestamp = Utc::now().timestamp();
    let storage_helper = format!("{cluster}-heal-storage-{ordinal}-{timestamp}");
    state.helpers.push(storage_helper.clone());
    let storage_pod = helper_pod::build_pod(
        &namespace,
        &storage_helper,
        ROLE_HEAL,
        BUSYBOX_IMAGE,
        sh_command(storage_reset_script()),
        Some(RunAs::root()),
        None,
        vec![claim_volume(
            "storage",
            &galera_storage_claim(target),
            GALERA_DATA_MOUNT,
            false,
        )],
    );
    let logs = helper_pod::run_to_completion(ctx, &storage_pod, HELPER_TIMEOUT).await?;
    info!(helper = %storage_helper, logs = %logs.trim_end(), "replication state reset");

    // Step 4: drop a stale bootstrap marker from the config volume.
    if has_config_volume {
        let config_helper = format!("{cluster}-heal-config-{ordinal}-{timestamp}");
        state.helpers.push(config_helper.clone());
        let config_pod = helper_pod::build_pod(
            &namespace,
            &config_helper,
            ROLE_HEAL,
            BUSYBOX_IMAGE,
            sh_command(config_cleanup_script()),
            Some(RunAs::root()),
            None,
            vec![claim_volume(
                "config",
                &galera_config_claim(target),
                GALERA_CONFIG_MOUNT,
                false,
            )],
        );
        helper_pod::run_to_completion(ctx, &config_pod, HELPER_TIMEOUT).await?;
    }

    // Step 5: clear stale operator recovery pods, then hand control back.
    delete_recovery_pods(ctx, &ctx.cancel).await;
    ctx.sleep(Duration::from_secs(2)).await?;

    ctx.platform
        .scale(
            ResourceKind::StatefulSet,
            &namespace,
            &cluster,
            state.original_replicas,
            &ctx.cancel,
        )
        .await?;
    state.scaled_down = false;

    set_suspended(ctx, false, &ctx.cancel).await?;
    state.suspended = false;

    info!(target, "waiting for the node to rejoin via state transfer");
    let ready_rounds = (ctx.config.heal_timeout.as_secs() / READY_POLL_INTERVAL.as_secs()).max(1);
    let mut ready = false;
    for _ in 0..ready_rounds {
        ctx.sleep(READY_POLL_INTERVAL).await?;
        let observation = ctx
            .platform
            .get_resource(ResourceKind::Pod, &namespace, target, &ctx.cancel)
            .await
            .ok()
            .and_then(|value| views::parse_pod(&value));
        if observation
            .is_some_and(|pod| pod.phase == PodPhase::Running && pod.ready)
        {
            ready = true;
            break;
        }
    }
    if ready {
        info!(target, "node healed and ready");
    } else {
        warn!(target, "node not ready yet; the state transfer may still be in progress");
    }
    Ok(())
}

async fn set_suspended(
    ctx: &EngineContext,
    suspended: bool,
    cancel: &CancellationToken,
) -> EngineResult<()> {
    ctx.platform
        .patch_merge(
            ResourceKind::GaleraCluster,
            ctx.namespace(),
            ctx.cluster_name(),
            json!({ "spec": { "suspend": suspended } }),
            cancel,
        )
        .await?;
    Ok(())
}

/// Removes stale operator recovery pods so the resumed operator starts from
/// a clean slate.
async fn delete_recovery_pods(ctx: &EngineContext, cancel: &CancellationToken) {
    let selector = format!(
        "app.kubernetes.io/instance={},k8s.mariadb.com/recovery=true",
        ctx.cluster_name()
    );
    let Ok(values) = ctx
        .platform
        .list_resources(ResourceKind::Pod, ctx.namespace(), &selector, cancel)
        .await
    else {
        return;
    };
    for value in values {
        if let Some(pod) = views::parse_pod(&value) {
            let _ = ctx.platform.delete_pod(ctx.namespace(), &pod.name, cancel).await;
        }
    }
}

/// Unwinds a failed heal: helpers deleted, scale restored, resource
/// resumed. Runs on every handled error path, including cancellation —
/// hence a detached cancellation handle; the unwind must not itself be
/// cancelled, or the resource would stay suspended.
async fn rescue(ctx: &EngineContext, state: &RescueState) {
    let cleanup = CancellationToken::new();
    for helper in &state.helpers {
        let _ = ctx.platform.delete_pod(ctx.namespace(), helper, &cleanup).await;
    }
    if state.scaled_down {
        if let Err(error) = ctx
            .platform
            .scale(
                ResourceKind::StatefulSet,
                ctx.namespace(),
                ctx.cluster_name(),
                state.original_replicas,
                &cleanup,
            )
            .await
        {
            warn!(%error, "rescue: failed to restore the replica count");
        }
    }
    if state.suspended {
        if let Err(error) = set_suspended(ctx, false, &cleanup).await {
            warn!(%error, "rescue: failed to resume the cluster resource");
        } else {
            info!("rescue: cluster resource resumed and scale restored");
        }
    }
}
