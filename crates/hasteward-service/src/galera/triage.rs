// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Evidence collection for Galera triage.

use std::time::Duration;

use hasteward_core::{
    cluster::{galera_config_claim, galera_storage_claim, GALERA_DATA_MOUNT},
    control::{detect_disk_full, parse_disk_percent, Grastate, StateSource, WsrepStatus},
    evidence::{CrashReason, GaleraEvidence, InstanceControl},
    triage::galera as analyzer,
    TriageResult,
};
use hasteward_platform::{views, ResourceKind};
use tracing::{debug, info, warn};

use crate::{
    error::{EngineError, EngineResult},
    galera::{wsrep_query_command, GaleraEngine},
    helper_pod::{self, claim_volume, RunAs, ROLE_PROBE},
};

/// Upper bound on one offline probe run.
const PROBE_TIMEOUT: Duration = Duration::from_secs(150);
/// Image used for probes and heal helpers; only shell built-ins are needed.
pub(crate) const BUSYBOX_IMAGE: &str = "docker.io/library/busybox:latest";

const GRASTATE_PATH: &str = "/var/lib/mysql/grastate.dat";

/// Collects evidence and runs the analyzer.
pub(crate) async fn run(engine: &mut GaleraEngine) -> EngineResult<TriageResult> {
    let evidence = collect(engine).await?;
    let result = analyzer::analyze(&engine.ctx.cluster, &evidence);

    info!(
        cluster = %engine.ctx.cluster,
        ready = result.ready_count,
        total = result.total_count,
        safe_to_heal = result.comparison.safe_to_heal,
        all_nodes_down = result.all_nodes_down,
        "triage complete"
    );
    for warning in &result.comparison.warnings {
        info!(message = %warning, "data freshness");
    }
    if !result.comparison.safe_to_heal {
        warn!(
            most_advanced = result.comparison.most_advanced.as_deref().unwrap_or("unknown"),
            "potential split brain: a node outside the primary component holds fresher data"
        );
    }
    if result.all_nodes_down {
        warn!(
            bootstrap_candidate = result.best_seqno_node.as_deref().unwrap_or("unknown"),
            "all nodes are down; the operator should recover the cluster from the freshest node"
        );
    }
    Ok(result)
}

async fn collect(engine: &GaleraEngine) -> EngineResult<GaleraEvidence> {
    let ctx = &engine.ctx;
    let namespace = ctx.namespace();
    let container = hasteward_core::EngineKind::Galera.container();

    let mut evidence = GaleraEvidence {
        replicas: engine.view.replicas,
        recovery: engine.view.recovery.clone(),
        ..GaleraEvidence::default()
    };
    evidence.expected_nodes = (0..engine.view.replicas.max(0))
        .map(|ordinal| format!("{}-{ordinal}", ctx.cluster_name()))
        .collect();

    let pod_values = ctx
        .platform
        .list_resources(ResourceKind::Pod, namespace, &engine.pod_selector(), &ctx.cancel)
        .await?;
    for value in &pod_values {
        if let Some(observation) = views::parse_pod(value) {
            evidence.pods.insert(observation.name.clone(), observation);
        }
    }

    // Volume claims: storage is mandatory, the config volume optional.
    let mut missing_storage = Vec::new();
    for node in &evidence.expected_nodes {
        let storage_bound = pvc_exists(engine, &galera_storage_claim(node)).await?;
        let config_bound = pvc_exists(engine, &galera_config_claim(node)).await?;
        if !storage_bound {
            missing_storage.push(node.clone());
        }
        evidence.storage_pvc_bound.insert(node.clone(), storage_bound);
        evidence.config_pvc_bound.insert(node.clone(), config_bound);
    }
    if !missing_storage.is_empty() {
        return Err(EngineError::Precondition(format!(
            "missing storage volume claims: {}; resolve before proceeding",
            missing_storage.join(", ")
        )));
    }

    // grastate.dat from serving nodes, crash-looping nodes, and offline
    // probes, in decreasing order of trust.
    let mut records: Vec<(String, StateSource, Grastate)> = Vec::new();
    let read_grastate = vec!["cat".to_owned(), GRASTATE_PATH.to_owned()];
    for (name, observation) in &evidence.pods {
        let source = if observation.is_running_ready() {
            StateSource::LiveExec
        } else if observation.is_crashloop() {
            StateSource::CrashloopExec
        } else {
            continue;
        };
        match ctx
            .platform
            .exec_capture(namespace, name, container, &read_grastate, &ctx.cancel)
            .await
        {
            Ok(output) => records.push((name.clone(), source, Grastate::parse(&output.stdout))),
            Err(error) => debug!(pod = %name, %error, "grastate read failed"),
        }
    }

    let probe_targets: Vec<String> = evidence
        .expected_nodes
        .iter()
        .filter(|node| !records.iter().any(|(name, _, _)| name == *node))
        .cloned()
        .collect();
    if !probe_targets.is_empty() {
        info!(nodes = %probe_targets.join(", "), "probing stranded storage volumes");
        for node in &probe_targets {
            if let Some(state) = probe_node(engine, node).await {
                records.push((node.clone(), StateSource::OfflineProbe, state));
            }
        }
    }

    for node in &evidence.expected_nodes {
        evidence.grastate.push(
            match records.iter().find(|(name, _, _)| name == node) {
                Some((_, source, state)) => InstanceControl {
                    pod: node.clone(),
                    source: *source,
                    record: Some(state.clone()),
                },
                None => InstanceControl::absent(node.clone()),
            },
        );
    }

    // Wsrep status from serving nodes.
    let wsrep_command = wsrep_query_command(&engine.root_password);
    for (name, observation) in &evidence.pods {
        if !observation.is_running_ready() {
            continue;
        }
        match ctx
            .platform
            .exec_capture(namespace, name, container, &wsrep_command, &ctx.cancel)
            .await
        {
            Ok(output) => {
                evidence
                    .wsrep
                    .insert(name.clone(), WsrepStatus::parse(&output.stdout));
            }
            Err(error) => {
                debug!(pod = %name, %error, "wsrep status query failed");
                evidence.wsrep_failed.insert(name.clone());
            }
        }
    }

    // Crash causes from the logs of crash-looping pods.
    for (name, observation) in &evidence.pods {
        if !observation.is_crashloop() {
            continue;
        }
        if let Ok(logs) = ctx
            .platform
            .read_pod_logs(namespace, name, Some(container), &ctx.cancel)
            .await
        {
            if detect_disk_full(&logs) {
                evidence.crash_reasons.insert(name.clone(), CrashReason::DiskFull);
            }
        }
    }

    // Disk usage on running nodes.
    for name in evidence.pods.keys() {
        let command = vec!["df".to_owned(), "-h".to_owned(), GALERA_DATA_MOUNT.to_owned()];
        if let Ok(output) = ctx
            .platform
            .exec_capture(namespace, name, container, &command, &ctx.cancel)
            .await
        {
            if let Some(percent) = parse_disk_percent(&output.stdout) {
                evidence.disk_usage.insert(name.clone(), percent);
            }
        }
    }

    Ok(evidence)
}

async fn pvc_exists(engine: &GaleraEngine, claim: &str) -> EngineResult<bool> {
    match engine
        .ctx
        .platform
        .get_resource(
            ResourceKind::PersistentVolumeClaim,
            engine.ctx.namespace(),
            claim,
            &engine.ctx.cancel,
        )
        .await
    {
        Ok(_) => Ok(true),
        Err(error) if error.is_not_found() => Ok(false),
        Err(error) => Err(error.into()),
    }
}

/// Reads `grastate.dat` from a stranded node's storage volume through an
/// ephemeral read-only probe pod.
async fn probe_node(engine: &GaleraEngine, node: &str) -> Option<Grastate> {
    let ctx = &engine.ctx;
    let node_name = ctx
        .platform
        .get_resource(ResourceKind::Pod, ctx.namespace(), node, &ctx.cancel)
        .await
        .ok()
        .and_then(|value| views::parse_pod(&value))
        .and_then(|pod| pod.node_name);

    let pod = helper_pod::build_pod(
        ctx.namespace(),
        &format!("{node}-triage-probe"),
        ROLE_PROBE,
        BUSYBOX_IMAGE,
        vec!["cat".to_owned(), GRASTATE_PATH.to_owned()],
        Some(RunAs::root()),
        node_name.as_deref(),
        vec![claim_volume(
            "storage",
            &galera_storage_claim(node),
            GALERA_DATA_MOUNT,
            true,
        )],
    );

    let logs = helper_pod::run_probe(ctx, &pod, PROBE_TIMEOUT).await?;
    Some(Grastate::parse(&logs))
}
