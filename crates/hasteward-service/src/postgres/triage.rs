// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Evidence collection for Postgres triage.

use std::{collections::BTreeMap, time::Duration};

use hasteward_core::{
    cluster::{postgres_data_claim, PG_DATA_DIR, PG_DATA_MOUNT},
    control::{
        detect_disk_full, parse_disk_percent, PgControlData, ReplicationRow, ReplicationSlotRow,
        StateSource,
    },
    evidence::{CrashReason, InstanceControl, PostgresEvidence},
    triage::postgres as analyzer,
    TriageResult,
};
use hasteward_platform::{views, ResourceKind};
use tracing::{debug, info, warn};

use crate::{
    error::EngineResult,
    helper_pod::{self, claim_volume, RunAs, ROLE_PROBE},
    postgres::PostgresEngine,
};

/// Upper bound on one offline probe run.
const PROBE_TIMEOUT: Duration = Duration::from_secs(150);
/// CNPG images run the database as this uid when the primary cannot be
/// asked.
const DEFAULT_POSTGRES_UID: i64 = 26;

const REPLICATION_QUERY: &str = "SELECT client_addr, state, sent_lsn, write_lsn, flush_lsn, \
     replay_lsn, write_lag, flush_lag, replay_lag, application_name \
     FROM pg_stat_replication ORDER BY application_name";

const SLOTS_QUERY: &str = "SELECT slot_name, slot_type, active, restart_lsn, \
     confirmed_flush_lsn, \
     pg_wal_lsn_diff(pg_current_wal_lsn(), restart_lsn) AS bytes_behind \
     FROM pg_replication_slots ORDER BY slot_name";

const WAL_QUERY: &str = "SELECT pg_current_wal_lsn() AS current_lsn, \
     current_setting('max_slot_wal_keep_size') AS max_slot_wal_keep_size, \
     current_setting('wal_keep_size') AS wal_keep_size";

fn psql_command(query: &str) -> Vec<String> {
    [
        "psql", "-U", "postgres", "-d", "postgres", "-t", "-A", "-F", "|", "-c", query,
    ]
    .iter()
    .map(|arg| (*arg).to_owned())
    .collect()
}

/// Collects evidence and runs the analyzer.
pub(crate) async fn run(engine: &mut PostgresEngine) -> EngineResult<TriageResult> {
    let evidence = collect(engine).await?;
    let result = analyzer::analyze(&engine.ctx.cluster, &evidence);

    info!(
        cluster = %engine.ctx.cluster,
        phase = result.cluster_phase.as_deref().unwrap_or("unknown"),
        ready = result.ready_count,
        total = result.total_count,
        safe_to_heal = result.comparison.safe_to_heal,
        "triage complete"
    );
    for warning in &result.comparison.warnings {
        info!(message = %warning, "data freshness");
    }
    if !result.comparison.safe_to_heal {
        warn!(
            most_advanced = result.comparison.most_advanced.as_deref().unwrap_or("unknown"),
            "potential split brain: a non-primary instance holds fresher data than the primary"
        );
    }
    Ok(result)
}

async fn collect(engine: &PostgresEngine) -> EngineResult<PostgresEvidence> {
    let ctx = &engine.ctx;
    let namespace = ctx.namespace();
    let container = hasteward_core::EngineKind::Postgres.container();

    let mut evidence = PostgresEvidence {
        current_primary: engine.view.current_primary.clone(),
        cluster_phase: engine.view.phase.clone(),
        ready_instances: engine.view.ready_instances,
        total_instances: engine.view.instances,
        ..PostgresEvidence::default()
    };

    // Expected roster: the status list when available, else derived from
    // the instance count (CNPG ordinals start at 1).
    evidence.expected_instances = if engine.view.instance_names.is_empty() {
        (1..=engine.view.instances.max(0))
            .map(|ordinal| format!("{}-{ordinal}", ctx.cluster_name()))
            .collect()
    } else {
        engine.view.instance_names.clone()
    };

    let pod_values = ctx
        .platform
        .list_resources(ResourceKind::Pod, namespace, &engine.pod_selector(), &ctx.cancel)
        .await?;
    for value in &pod_values {
        if let Some(observation) = views::parse_pod(value) {
            evidence.pods.insert(observation.name.clone(), observation);
        }
    }

    for instance in &evidence.expected_instances {
        let claim = postgres_data_claim(instance);
        let phase = match ctx
            .platform
            .get_resource(ResourceKind::PersistentVolumeClaim, namespace, &claim, &ctx.cancel)
            .await
        {
            Ok(value) => views::pvc_phase(&value),
            Err(error) if error.is_not_found() => None,
            Err(error) => return Err(error.into()),
        };
        evidence.pvc_phases.insert(instance.clone(), phase);
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

    // Control state from live instances.
    let mut records: BTreeMap<String, (StateSource, PgControlData)> = BTreeMap::new();
    for (name, observation) in &evidence.pods {
        if !observation.is_running_ready() {
            continue;
        }
        let command = vec!["pg_controldata".to_owned(), PG_DATA_DIR.to_owned()];
        match ctx
            .platform
            .exec_capture(namespace, name, container, &command, &ctx.cancel)
            .await
        {
            Ok(output) => {
                records.insert(
                    name.clone(),
                    (StateSource::LiveExec, PgControlData::parse(&output.stdout)),
                );
            }
            Err(error) => debug!(pod = %name, %error, "pg_controldata exec failed"),
        }
    }

    // Offline probes for stranded instances with a bound claim.
    let probe_targets: Vec<String> = evidence
        .expected_instances
        .iter()
        .filter(|instance| {
            !records.contains_key(*instance)
                && evidence.pvc_phases.get(*instance) == Some(&Some("Bound".to_owned()))
        })
        .cloned()
        .collect();
    if !probe_targets.is_empty() {
        match engine.view.image_name.as_deref() {
            Some(image) => {
                info!(
                    instances = %probe_targets.join(", "),
                    "probing stranded data volumes"
                );
                for instance in &probe_targets {
                    if let Some(record) = probe_instance(engine, instance, image).await {
                        records.insert(instance.clone(), (StateSource::OfflineProbe, record));
                    }
                }
            }
            None => warn!("cluster spec has no image name; skipping offline probes"),
        }
    }

    for instance in &evidence.expected_instances {
        evidence.control.push(match records.remove(instance) {
            Some((source, record)) => InstanceControl {
                pod: instance.clone(),
                source,
                record: Some(record),
            },
            None => InstanceControl::absent(instance.clone()),
        });
    }

    // Replication status, slots, and WAL info from the primary.
    let primary_serving = evidence
        .current_primary
        .as_ref()
        .and_then(|primary| evidence.pods.get(primary))
        .is_some_and(|pod| pod.is_running_ready());
    if primary_serving {
        let primary = evidence.current_primary.clone().expect("checked above");
        collect_replication(engine, &primary, &mut evidence).await;
    } else {
        warn!("primary is not running; replication status unavailable");
    }

    // Disk usage on running instances.
    for name in evidence.pods.keys() {
        let command = vec!["df".to_owned(), "-h".to_owned(), PG_DATA_MOUNT.to_owned()];
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

async fn collect_replication(
    engine: &PostgresEngine,
    primary: &str,
    evidence: &mut PostgresEvidence,
) {
    let ctx = &engine.ctx;
    let namespace = ctx.namespace();
    let container = hasteward_core::EngineKind::Postgres.container();

    match ctx
        .platform
        .exec_capture(
            namespace,
            primary,
            container,
            &psql_command(REPLICATION_QUERY),
            &ctx.cancel,
        )
        .await
    {
        Ok(output) => {
            for line in output.stdout.lines().filter(|line| !line.is_empty()) {
                if let Some(row) = ReplicationRow::parse(line) {
                    if row.is_streaming() {
                        evidence
                            .streaming_replicas
                            .insert(row.application_name.clone());
                    }
                    evidence.replication.push(row);
                }
            }
        }
        Err(error) => warn!(%error, "could not query replication status"),
    }

    if let Ok(output) = ctx
        .platform
        .exec_capture(
            namespace,
            primary,
            container,
            &psql_command(SLOTS_QUERY),
            &ctx.cancel,
        )
        .await
    {
        evidence.slots = output
            .stdout
            .lines()
            .filter_map(ReplicationSlotRow::parse)
            .collect();
    }

    if let Ok(output) = ctx
        .platform
        .exec_capture(
            namespace,
            primary,
            container,
            &psql_command(WAL_QUERY),
            &ctx.cancel,
        )
        .await
    {
        let wal = output.stdout.trim();
        if !wal.is_empty() {
            evidence.wal_info = Some(wal.to_owned());
        }
    }
}

/// Reads `pg_controldata` from a stranded instance's volume through an
/// ephemeral read-only probe pod.
async fn probe_instance(
    engine: &PostgresEngine,
    instance: &str,
    image: &str,
) -> Option<PgControlData> {
    let ctx = &engine.ctx;
    let node = engine
        .ctx
        .platform
        .get_resource(ResourceKind::Pod, ctx.namespace(), instance, &ctx.cancel)
        .await
        .ok()
        .and_then(|value| views::parse_pod(&value))
        .and_then(|pod| pod.node_name);

    let pod = helper_pod::build_pod(
        ctx.namespace(),
        &format!("{instance}-triage-probe"),
        ROLE_PROBE,
        image,
        vec!["pg_controldata".to_owned(), PG_DATA_DIR.to_owned()],
        Some(RunAs {
            user: DEFAULT_POSTGRES_UID,
            group: Some(DEFAULT_POSTGRES_UID),
            fs_group: Some(DEFAULT_POSTGRES_UID),
        }),
        node.as_deref(),
        vec![claim_volume(
            "pgdata",
            &postgres_data_claim(instance),
            PG_DATA_MOUNT,
            true,
        )],
    );

    let logs = helper_pod::run_probe(ctx, &pod, PROBE_TIMEOUT).await?;
    Some(PgControlData::parse(&logs))
}
