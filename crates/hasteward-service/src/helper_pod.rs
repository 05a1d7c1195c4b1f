// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Ephemeral helper pods: offline triage probes and heal workers.
//!
//! Every helper created here is force-deleted on every exit path, including
//! timeout and cancellation; leaked helpers would hold the very volume
//! claims the repair needs released.

use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Container, KeyToPath, PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext, PodSpec,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use hasteward_core::evidence::PodPhase;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    context::EngineContext,
    error::{EngineError, EngineResult},
};

/// Label attached to every pod the steward creates.
pub const ROLE_LABEL: &str = "hasteward.io/role";
/// Role value of offline triage probes.
pub const ROLE_PROBE: &str = "triage-probe";
/// Role value of heal workers.
pub const ROLE_HEAL: &str = "heal-worker";

/// Poll cadence while waiting for a helper pod to reach a terminal phase.
const HELPER_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Pod-level security context of a helper.
#[derive(Debug, Clone, Copy)]
pub struct RunAs {
    pub user: i64,
    pub group: Option<i64>,
    pub fs_group: Option<i64>,
}

impl RunAs {
    pub fn root() -> Self {
        Self {
            user: 0,
            group: None,
            fs_group: None,
        }
    }
}

/// A volume-claim mount of a helper pod.
pub fn claim_volume(
    name: &str,
    claim: &str,
    mount_path: &str,
    read_only: bool,
) -> (Volume, VolumeMount) {
    (
        Volume {
            name: name.to_owned(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_owned(),
                read_only: None,
            }),
            ..Volume::default()
        },
        VolumeMount {
            name: name.to_owned(),
            mount_path: mount_path.to_owned(),
            read_only: Some(read_only),
            ..VolumeMount::default()
        },
    )
}

/// A secret mount of a helper pod, projecting the listed `(key, path)`
/// items.
pub fn secret_volume(
    name: &str,
    secret_name: &str,
    items: &[(&str, &str)],
    mount_path: &str,
) -> (Volume, VolumeMount) {
    (
        Volume {
            name: name.to_owned(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name.to_owned()),
                items: Some(
                    items
                        .iter()
                        .map(|(key, path)| KeyToPath {
                            key: (*key).to_owned(),
                            path: (*path).to_owned(),
                            mode: None,
                        })
                        .collect(),
                ),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        },
        VolumeMount {
            name: name.to_owned(),
            mount_path: mount_path.to_owned(),
            read_only: Some(true),
            ..VolumeMount::default()
        },
    )
}

/// Builds a single-container, restart-never helper pod.
pub fn build_pod(
    namespace: &str,
    name: &str,
    role: &str,
    image: &str,
    command: Vec<String>,
    run_as: Option<RunAs>,
    node_name: Option<&str>,
    volumes: Vec<(Volume, VolumeMount)>,
) -> Pod {
    let (volumes, mounts): (Vec<_>, Vec<_>) = volumes.into_iter().unzip();
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(
                [(ROLE_LABEL.to_owned(), role.to_owned())]
                    .into_iter()
                    .collect(),
            ),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_owned()),
            security_context: run_as.map(|run_as| PodSecurityContext {
                run_as_user: Some(run_as.user),
                run_as_group: run_as.group,
                fs_group: run_as.fs_group,
                ..PodSecurityContext::default()
            }),
            node_selector: node_name.map(|node| {
                [("kubernetes.io/hostname".to_owned(), node.to_owned())]
                    .into_iter()
                    .collect()
            }),
            containers: vec![Container {
                name: "helper".to_owned(),
                image: Some(image.to_owned()),
                command: Some(command),
                volume_mounts: Some(mounts),
                ..Container::default()
            }],
            volumes: Some(volumes),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

/// Creates a helper pod, waits (bounded) for it to finish, collects its
/// logs, and force-deletes it. Fails on a `Failed` phase or on timeout.
/// The deletion runs on every exit path, including cancellation, so it uses
/// a detached cancellation handle.
pub async fn run_to_completion(
    ctx: &EngineContext,
    pod: &Pod,
    timeout: Duration,
) -> EngineResult<String> {
    let namespace = ctx.namespace();
    let name = pod
        .metadata
        .name
        .clone()
        .expect("helper pods are always named");

    ctx.platform.create_pod(namespace, pod, &ctx.cancel).await?;
    let waited = wait_terminal(ctx, &name, timeout).await;
    let cleanup = CancellationToken::new();
    let logs = ctx
        .platform
        .read_pod_logs(namespace, &name, None, &cleanup)
        .await
        .unwrap_or_default();
    if let Err(error) = ctx.platform.delete_pod(namespace, &name, &cleanup).await {
        warn!(pod = %name, %error, "failed to delete helper pod");
    }

    match waited {
        Ok(PodPhase::Succeeded) => Ok(logs),
        Ok(phase) => {
            warn!(pod = %name, ?phase, logs = %logs, "helper pod failed");
            Err(EngineError::heal_failed(
                name,
                format!("helper pod ended in phase {phase:?}"),
            ))
        }
        Err(error) => Err(error),
    }
}

/// Creates a probe pod, waits (bounded, best effort) for it to finish,
/// collects its logs, and force-deletes it. Never fails: probes produce
/// evidence, and "no evidence" is itself evidence.
pub async fn run_probe(ctx: &EngineContext, pod: &Pod, timeout: Duration) -> Option<String> {
    let namespace = ctx.namespace();
    let name = pod.metadata.name.clone().expect("probe pods are always named");

    if let Err(error) = ctx.platform.create_pod(namespace, pod, &ctx.cancel).await {
        warn!(pod = %name, %error, "failed to create probe pod");
        return None;
    }
    if let Err(error) = wait_terminal(ctx, &name, timeout).await {
        debug!(pod = %name, %error, "probe pod did not reach a terminal phase");
    }
    // Cleanup must happen even when the wait above was cancelled.
    let cleanup = CancellationToken::new();
    let logs = ctx
        .platform
        .read_pod_logs(namespace, &name, None, &cleanup)
        .await
        .ok()
        .filter(|logs| !logs.is_empty());
    if let Err(error) = ctx.platform.delete_pod(namespace, &name, &cleanup).await {
        warn!(pod = %name, %error, "failed to delete probe pod");
    }
    logs
}

/// Polls a pod until it reaches a terminal phase. Transient read errors are
/// retried until the deadline.
async fn wait_terminal(
    ctx: &EngineContext,
    name: &str,
    timeout: Duration,
) -> EngineResult<PodPhase> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match ctx
            .platform
            .get_pod_phase(ctx.namespace(), name, &ctx.cancel)
            .await
        {
            Ok(Some(phase)) if phase.is_terminal() => return Ok(phase),
            Ok(_) => {}
            Err(error) => debug!(pod = %name, %error, "helper pod poll failed"),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(EngineError::timeout(
                format!("helper pod {name}"),
                timeout.as_secs(),
            ));
        }
        ctx.sleep(HELPER_POLL_INTERVAL).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_pod_shape() {
        let volumes = vec![
            claim_volume("data", "storage-g-1", "/var/lib/mysql", false),
            secret_volume("certs", "g-ca", &[("ca.crt", "ca.crt")], "/certs/ca"),
        ];
        let pod = build_pod(
            "prod",
            "g-heal-storage-1",
            ROLE_HEAL,
            "docker.io/library/busybox:latest",
            vec!["sh".to_owned(), "-c".to_owned(), "true".to_owned()],
            Some(RunAs::root()),
            Some("worker-2"),
            volumes,
        );

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            spec.node_selector.as_ref().unwrap()["kubernetes.io/hostname"],
            "worker-2"
        );
        assert_eq!(spec.containers.len(), 1);
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 2);
        assert_eq!(
            pod.metadata.labels.as_ref().unwrap()[ROLE_LABEL],
            ROLE_HEAL
        );
        assert_eq!(
            spec.security_context.as_ref().unwrap().run_as_user,
            Some(0)
        );
    }
}
