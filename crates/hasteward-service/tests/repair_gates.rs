// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Repair orchestration against the in-memory platform and archive:
//! safety gates, escrow and diverged captures, and the Galera heal and
//! rescue sequences.

use std::sync::Arc;

use hasteward_archive::{job_id, tags};
use hasteward_core::{ClusterRef, EngineKind};
use hasteward_platform::ResourceKind;
use hasteward_service::{
    test_utils::{pod_value, pvc_value, MockPlatform, RecordingArchive},
    Engine, EngineContext, EngineError, StewardConfig,
};
use hasteward_core::evidence::PodPhase;
use serde_json::json;

fn pg_controldata(timeline: u32, lsn: &str) -> String {
    format!(
        "Database cluster state:               in production\n\
         Latest checkpoint location:           {lsn}\n\
         Latest checkpoint's TimeLineID:       {timeline}\n"
    )
}

fn grastate(seqno: i64) -> String {
    format!(
        "# GALERA saved state\nversion: 2.1\n\
         uuid:    7acce8c4-9a2f-11ee-8b4d-7f3f2a6b8d21\n\
         seqno:   {seqno}\nsafe_to_bootstrap: 0\n"
    )
}

fn wsrep(cluster_status: &str, last_committed: i64, connected: &str) -> String {
    format!(
        "wsrep_cluster_size\t3\n\
         wsrep_cluster_state_uuid\t7acce8c4-9a2f-11ee-8b4d-7f3f2a6b8d21\n\
         wsrep_cluster_status\t{cluster_status}\n\
         wsrep_connected\t{connected}\n\
         wsrep_last_committed\t{last_committed}\n\
         wsrep_local_state\t4\n\
         wsrep_local_state_comment\tSynced\n\
         wsrep_ready\tON\n"
    )
}

/// A three-instance Postgres cluster with primary `c-0`; per-instance
/// timelines/LSNs come from `controls`.
fn postgres_platform(controls: &[(&str, u32, &str)]) -> Arc<MockPlatform> {
    let platform = MockPlatform::default();
    platform.insert_resource(
        ResourceKind::PostgresCluster,
        "prod",
        "c",
        json!({
            "metadata": {},
            "spec": { "instances": 3, "imageName": "ghcr.io/cloudnative-pg/postgresql:16.2" },
            "status": {
                "currentPrimary": "c-0",
                "targetPrimary": "c-0",
                "instanceNames": ["c-0", "c-1", "c-2"],
                "readyInstances": 3,
                "phase": "Cluster in healthy state",
            }
        }),
    );
    for (index, (pod, timeline, lsn)) in controls.iter().enumerate() {
        platform.insert_resource(
            ResourceKind::Pod,
            "prod",
            pod,
            pod_value(
                pod,
                &[("cnpg.io/cluster", "c")],
                "Running",
                true,
                Some(&format!("10.0.0.{index}")),
                Some("worker-1"),
            ),
        );
        platform.insert_resource(
            ResourceKind::PersistentVolumeClaim,
            "prod",
            pod,
            pvc_value(pod),
        );
        platform.add_exec(pod, "pg_controldata", Ok(&pg_controldata(*timeline, lsn)));
        platform.set_pipe(pod, b"-- pg_dumpall\n", None);
    }
    platform.add_exec("c-0", "pg_stat_replication", Ok(""));
    Arc::new(platform)
}

/// A three-node Galera cluster; per-node `(seqno, cluster_status)`.
fn galera_platform(nodes: &[(i64, &str, &str)]) -> Arc<MockPlatform> {
    let platform = MockPlatform::default();
    platform.insert_resource(
        ResourceKind::GaleraCluster,
        "prod",
        "g",
        json!({
            "metadata": {},
            "spec": {
                "replicas": 3,
                "image": "mariadb:11.4",
                "suspend": false,
                "rootPasswordSecretKeyRef": { "name": "g-root", "key": "password" },
            },
            "status": {
                "conditions": [
                    { "type": "Ready", "status": "True" },
                    { "type": "GaleraReady", "status": "True" },
                ],
            }
        }),
    );
    platform.set_secret("g-root", "password", b"rootpw");
    for (index, (seqno, cluster_status, connected)) in nodes.iter().enumerate() {
        let name = format!("g-{index}");
        platform.insert_resource(
            ResourceKind::Pod,
            "prod",
            &name,
            pod_value(
                &name,
                &[("app.kubernetes.io/instance", "g")],
                "Running",
                true,
                Some(&format!("10.0.1.{index}")),
                Some("worker-2"),
            ),
        );
        platform.insert_resource(
            ResourceKind::PersistentVolumeClaim,
            "prod",
            &format!("storage-g-{index}"),
            pvc_value(&format!("storage-g-{index}")),
        );
        platform.add_exec(&name, "grastate.dat", Ok(&grastate(*seqno)));
        platform.add_exec(
            &name,
            "GLOBAL_STATUS",
            Ok(&wsrep(cluster_status, *seqno, connected)),
        );
        platform.set_pipe(&name, b"-- mysqldump\n", None);
    }
    Arc::new(platform)
}

fn context(
    engine: EngineKind,
    cluster: &str,
    platform: Arc<MockPlatform>,
    archive: Option<Arc<RecordingArchive>>,
    config: StewardConfig,
) -> EngineContext {
    EngineContext::new(
        ClusterRef::new(engine, "prod", cluster),
        platform,
        archive.map(|archive| -> Arc<dyn hasteward_archive::Archive> { archive }),
        config,
    )
}

#[tokio::test]
async fn repairing_the_primary_fails_closed() {
    let platform = postgres_platform(&[("c-0", 5, "0/A0"), ("c-1", 5, "0/A0"), ("c-2", 5, "0/A0")]);
    let config = StewardConfig {
        instance: Some(0),
        no_escrow: true,
        ..StewardConfig::default()
    };
    let ctx = context(EngineKind::Postgres, "c", platform.clone(), None, config);

    let mut engine = Engine::connect(ctx).await.expect("cluster exists");
    let error = engine.repair().await.expect_err("healing the primary is forbidden");

    assert!(matches!(error, EngineError::SafetyGate(_)));
    assert!(error.to_string().contains("c-0"));

    // No fence, no scale, no pods: the gate fires before any mutation.
    let state = platform.state();
    assert!(state.patches.is_empty());
    assert!(state.scales.is_empty());
    assert!(state.created_pods.is_empty());
    assert!(state.deleted_pods.is_empty());
}

#[tokio::test]
async fn targeted_split_brain_requires_force() {
    // c-2 promoted itself to timeline 6: split brain.
    let platform = postgres_platform(&[("c-0", 5, "0/A0"), ("c-1", 5, "0/90"), ("c-2", 6, "0/50")]);
    let config = StewardConfig {
        instance: Some(2),
        no_escrow: true,
        ..StewardConfig::default()
    };
    let ctx = context(EngineKind::Postgres, "c", platform.clone(), None, config);

    let mut engine = Engine::connect(ctx).await.unwrap();
    let error = engine.repair().await.expect_err("split brain blocks targeted repair");

    assert!(matches!(error, EngineError::SafetyGate(_)));
    assert!(error.to_string().contains("--force"));
    assert!(platform.state().patches.is_empty());
}

#[tokio::test]
async fn healthy_target_is_skipped_without_force() {
    let platform = postgres_platform(&[("c-0", 5, "0/A0"), ("c-1", 5, "0/A0"), ("c-2", 5, "0/A0")]);
    let config = StewardConfig {
        instance: Some(1),
        no_escrow: true,
        ..StewardConfig::default()
    };
    let ctx = context(EngineKind::Postgres, "c", platform.clone(), None, config);

    let mut engine = Engine::connect(ctx).await.unwrap();
    let outcome = engine.repair().await.expect("skipping is not an error");

    assert!(outcome.healed_instances.is_empty());
    assert_eq!(outcome.skipped_instances, ["c-1"]);
    assert!(platform.state().patches.is_empty());
}

#[tokio::test]
async fn split_brain_repair_captures_escrow_and_diverged_snapshots() {
    // Primary component g-0/g-1 at seqno 100; g-2 isolated and ahead.
    let platform = galera_platform(&[
        (100, "Primary", "ON"),
        (100, "Primary", "ON"),
        (150, "non-Primary", "ON"),
    ]);
    let archive = Arc::new(RecordingArchive::default());
    let ctx = context(
        EngineKind::Galera,
        "g",
        platform.clone(),
        Some(archive.clone()),
        StewardConfig::default(),
    );

    let mut engine = Engine::connect(ctx).await.unwrap();
    // Untargeted repair in a split brain is a hard stop with no override,
    // but only after the forensic captures are taken.
    let error = engine.repair().await.expect_err("untargeted split brain is a hard stop");
    assert!(matches!(error, EngineError::SafetyGate(_)));
    assert!(error.to_string().contains("--instance"));

    let state = archive.state();
    assert_eq!(state.backups.len(), 4, "one escrow plus three diverged captures");

    let escrow = &state.backups[0];
    assert_eq!(escrow.tags["type"], tags::TYPE_BACKUP);
    assert_eq!(escrow.virtual_path, "prod/g/mysqldump.sql");

    let diverged: Vec<_> = state.backups[1..].iter().collect();
    let job = job_id(escrow.time);
    for (index, capture) in diverged.iter().enumerate() {
        assert_eq!(capture.tags["type"], tags::TYPE_DIVERGED);
        assert_eq!(capture.tags["job"], job, "all captures share the job id");
        assert_eq!(capture.time, escrow.time, "all snapshots carry the job-start time");
        assert_eq!(
            capture.virtual_path,
            format!("prod/g/{index}-mysqldump.sql")
        );
    }

    // Forensics only: the cluster itself was never touched.
    let platform_state = platform.state();
    assert!(platform_state.patches.is_empty());
    assert!(platform_state.scales.is_empty());
}

#[tokio::test]
async fn diverged_capture_failures_do_not_abort_the_repair() {
    let platform = galera_platform(&[
        (100, "Primary", "ON"),
        (100, "Primary", "ON"),
        (150, "non-Primary", "ON"),
    ]);
    let archive = Arc::new(RecordingArchive::default());
    // Capturing instance 1 fails; the repair must still reach its own gate.
    archive.state().fail_backups_containing = Some("1-mysqldump".to_owned());
    let ctx = context(
        EngineKind::Galera,
        "g",
        platform,
        Some(archive.clone()),
        StewardConfig::default(),
    );

    let mut engine = Engine::connect(ctx).await.unwrap();
    let error = engine.repair().await.expect_err("still a hard stop");
    assert!(matches!(error, EngineError::SafetyGate(_)));

    // Escrow plus the two captures that succeeded.
    assert_eq!(archive.state().backups.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn galera_heal_suspends_scales_and_resumes() {
    // g-1 is disconnected from the cluster and needs a rebuild.
    let platform = galera_platform(&[
        (100, "Primary", "ON"),
        (100, "Primary", "OFF"),
        (100, "Primary", "ON"),
    ]);
    // The scaled-down pod is observed gone immediately; the storage helper
    // succeeds.
    platform.set_pod_phases("g-1", vec![None]);
    platform.set_pod_phases("g-heal-storage-1-", vec![Some(PodPhase::Succeeded)]);

    let config = StewardConfig {
        instance: Some(1),
        no_escrow: true,
        ..StewardConfig::default()
    };
    let ctx = context(EngineKind::Galera, "g", platform.clone(), None, config);

    let mut engine = Engine::connect(ctx).await.unwrap();
    let outcome = engine.repair().await.expect("heal succeeds");
    assert_eq!(outcome.healed_instances, ["g-1"]);

    let state = platform.state();
    // Ordinal 1 of 3 cannot be released by a partial scale-down.
    assert_eq!(state.scales, [("g".to_owned(), 0), ("g".to_owned(), 3)]);
    // Suspended first, resumed last; never left suspended.
    let suspends: Vec<bool> = state
        .patches
        .iter()
        .filter_map(|(_, _, patch)| patch.pointer("/spec/suspend").and_then(|v| v.as_bool()))
        .collect();
    assert_eq!(suspends, [true, false]);
    // Exactly one storage helper was created and cleaned up again.
    let helpers: Vec<_> = state
        .created_pods
        .iter()
        .filter(|name| name.starts_with("g-heal-storage-1-"))
        .collect();
    assert_eq!(helpers.len(), 1);
    assert!(state.deleted_pods.contains(helpers[0]));
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_heal_runs_the_rescue_path() {
    let platform = galera_platform(&[
        (100, "Primary", "ON"),
        (100, "Primary", "OFF"),
        (100, "Primary", "ON"),
    ]);
    let config = StewardConfig {
        instance: Some(1),
        no_escrow: true,
        ..StewardConfig::default()
    };
    let ctx = context(EngineKind::Galera, "g", platform.clone(), None, config);
    // The signal fires right after the scale-down lands, while the heal is
    // mid-sequence; the next platform call must return promptly.
    platform.state().cancel_on_scale = Some(ctx.cancel.clone());

    let mut engine = Engine::connect(ctx).await.unwrap();
    let error = engine.repair().await.expect_err("cancelled mid-heal");
    assert!(matches!(error, EngineError::Interrupted));

    let state = platform.state();
    // Rescue still restored the replica count and resumed the resource.
    assert_eq!(state.scales, [("g".to_owned(), 0), ("g".to_owned(), 3)]);
    let suspends: Vec<bool> = state
        .patches
        .iter()
        .filter_map(|(_, _, patch)| patch.pointer("/spec/suspend").and_then(|v| v.as_bool()))
        .collect();
    assert_eq!(suspends, [true, false], "never left suspended");
}

#[tokio::test(start_paused = true)]
async fn galera_rescue_unwinds_on_helper_failure() {
    let platform = galera_platform(&[
        (100, "Primary", "ON"),
        (100, "Primary", "OFF"),
        (100, "Primary", "ON"),
    ]);
    platform.set_pod_phases("g-1", vec![None]);
    platform.set_pod_phases("g-heal-storage-1-", vec![Some(PodPhase::Failed)]);

    let config = StewardConfig {
        instance: Some(1),
        no_escrow: true,
        ..StewardConfig::default()
    };
    let ctx = context(EngineKind::Galera, "g", platform.clone(), None, config);

    let mut engine = Engine::connect(ctx).await.unwrap();
    let error = engine.repair().await.expect_err("the helper failure surfaces");
    assert!(matches!(error, EngineError::HealFailed { .. }));

    let state = platform.state();
    // Rescue restored the original replica count and resumed the resource.
    assert_eq!(state.scales, [("g".to_owned(), 0), ("g".to_owned(), 3)]);
    let last_suspend = state
        .patches
        .iter()
        .filter_map(|(_, _, patch)| patch.pointer("/spec/suspend").and_then(|v| v.as_bool()))
        .last();
    assert_eq!(last_suspend, Some(false), "never left suspended");
}
