// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Triage analysis for the Galera engine.

use std::collections::BTreeMap;

use crate::{
    cluster::{instance_ordinal, ClusterRef},
    control::WsrepStatus,
    evidence::{CrashReason, GaleraEvidence, PodPhase},
    triage::{
        effective_seqno, heal_hint, AssessmentDetail, ComparisonDetail, DataComparison,
        FreshnessSource, GaleraAssessment, InstanceAssessment, TriageResult, DISK_WARN_PCT,
    },
};

/// Analyzes Galera evidence into a [`TriageResult`].
pub fn analyze(cluster: &ClusterRef, evidence: &GaleraEvidence) -> TriageResult {
    let freshness = compute_freshness(evidence);
    let comparison = compare(evidence, &freshness);
    let assessments = assess(cluster, evidence, &comparison, &freshness);

    let best_seqno_node = freshness
        .iter()
        .max_by_key(|(pod, (value, _))| (*value, std::cmp::Reverse(pod.as_str())))
        .map(|(pod, _)| pod.clone());

    TriageResult {
        ready_count: comparison.primary_members().len() as i64,
        total_count: evidence.replicas,
        all_nodes_down: evidence.all_nodes_down(),
        best_seqno_node,
        assessments,
        comparison,
        cluster_phase: None,
    }
}

/// Effective freshness per node: the best commit position over the wsrep
/// status, the operator-reported recovery map, and `grastate.dat`.
fn compute_freshness(evidence: &GaleraEvidence) -> BTreeMap<String, (i64, FreshnessSource)> {
    evidence
        .grastate
        .iter()
        .map(|control| {
            let pod = &control.pod;
            let wsrep_committed = evidence
                .wsrep
                .get(pod)
                .map_or(-1, |status| status.last_committed);
            let grastate_seqno = control.record.as_ref().map_or(-1, |state| state.seqno);
            let best = effective_seqno(
                wsrep_committed,
                evidence.recovery.recovered_seqno(pod),
                evidence.recovery.state_seqno(pod),
                grastate_seqno,
            );
            (pod.clone(), best)
        })
        .collect()
}

/// Builds the cross-instance comparison.
///
/// Split-brain flags: multiple distinct cluster UUIDs across members, or a
/// node outside the primary component whose effective seqno exceeds the best
/// effective seqno inside it.
fn compare(
    evidence: &GaleraEvidence,
    freshness: &BTreeMap<String, (i64, FreshnessSource)>,
) -> DataComparison {
    let mut split_brain = Vec::new();

    let mut uuids: Vec<String> = evidence
        .grastate
        .iter()
        .filter_map(|control| control.record.as_ref())
        .filter(|state| state.has_known_uuid())
        .filter_map(|state| state.uuid.clone())
        .chain(
            evidence
                .wsrep
                .values()
                .filter_map(|status| status.cluster_state_uuid.clone()),
        )
        .collect();
    uuids.sort();
    uuids.dedup();
    if uuids.len() > 1 {
        split_brain.push(format!("multiple cluster UUIDs observed: {}", uuids.join(", ")));
    }

    let mut primary_members = evidence.primary_members();
    primary_members.sort();

    let mut best_primary_seqno = -1;
    let mut best_primary_pod = None;
    for member in &primary_members {
        let value = freshness.get(member).map_or(-1, |(value, _)| *value);
        if value > best_primary_seqno || best_primary_pod.is_none() {
            best_primary_seqno = value;
            best_primary_pod = Some(member.clone());
        }
    }

    if !primary_members.is_empty() {
        for (pod, (value, _)) in freshness {
            if primary_members.contains(pod) {
                continue;
            }
            if *value > best_primary_seqno && *value > 0 {
                split_brain.push(format!(
                    "{pod} has seqno {value} > primary best {best_primary_seqno} ({})",
                    best_primary_pod.as_deref().unwrap_or("none"),
                ));
            }
        }
    }

    let (best_node, best_value) = freshness
        .iter()
        .max_by_key(|(pod, (value, _))| (*value, std::cmp::Reverse(pod.as_str())))
        .map(|(pod, (value, _))| (Some(pod.clone()), *value))
        .unwrap_or((None, -1));

    let safe_to_heal = split_brain.is_empty();
    let warnings = if safe_to_heal {
        if primary_members.is_empty() {
            vec![format!(
                "no nodes in the primary component; most advanced: {} (seqno {best_value})",
                best_node.as_deref().unwrap_or("none"),
            )]
        } else {
            vec![format!(
                "primary component ({}) holds the most recent data (best seqno {best_primary_seqno})",
                primary_members.join(", "),
            )]
        }
    } else {
        split_brain
            .iter()
            .map(|flag| format!("split-brain risk: {flag}"))
            .collect()
    };

    DataComparison {
        most_advanced: best_node,
        most_advanced_value: best_value,
        safe_to_heal,
        warnings,
        split_brain,
        detail: ComparisonDetail::Galera {
            primary_members,
            best_primary_seqno,
        },
    }
}

/// Applies the per-node decision ladder; the first matching branch decides.
fn assess(
    cluster: &ClusterRef,
    evidence: &GaleraEvidence,
    comparison: &DataComparison,
    freshness: &BTreeMap<String, (i64, FreshnessSource)>,
) -> Vec<InstanceAssessment> {
    let best_primary_seqno = match &comparison.detail {
        ComparisonDetail::Galera {
            best_primary_seqno, ..
        } => *best_primary_seqno,
        ComparisonDetail::Postgres { .. } => -1,
    };
    let primary_members = comparison.primary_members();

    let mut assessments = Vec::with_capacity(evidence.grastate.len());

    for control in &evidence.grastate {
        let pod = &control.pod;
        let ordinal = instance_ordinal(pod);
        let observation = evidence.pods.get(pod);
        let is_missing = observation.is_none();
        let is_crashloop = observation.is_some_and(|obs| obs.is_crashloop());
        let is_running = observation.is_some_and(|obs| obs.phase == PodPhase::Running);
        let is_ready = observation.is_some_and(|obs| obs.ready);
        let is_serving = is_running && !is_crashloop;

        let wsrep = evidence.wsrep.get(pod);
        let wsrep_query_failed = evidence.wsrep_failed.contains(pod);
        let in_primary = primary_members.iter().any(|member| member == pod);
        let has_data = control.source.has_data();

        let (node_seqno, seqno_source) = freshness
            .get(pod)
            .copied()
            .unwrap_or((-1, FreshnessSource::None));
        let seqno_lag = if best_primary_seqno > 0 && node_seqno > 0 {
            best_primary_seqno - node_seqno
        } else {
            -1
        };
        let data_current = node_seqno > 0 && best_primary_seqno > 0 && node_seqno >= best_primary_seqno;

        let crash_reason = evidence.crash_reasons.get(pod).copied();
        let disk_full = crash_reason == Some(CrashReason::DiskFull);
        let disk_pct = evidence.disk_usage.get(pod).copied();
        let disk_low = disk_pct.is_some_and(|pct| pct >= DISK_WARN_PCT);

        let connected = wsrep.and_then(|status| status.connected);
        let ready_flag = wsrep.and_then(|status| status.ready);
        let local_state = wsrep.and_then(|status| status.local_state);
        let cluster_status = wsrep.and_then(|status| status.cluster_status.as_deref());

        let hint = heal_hint(cluster, ordinal);

        let mut notes = Vec::new();
        let mut needs_heal = false;
        let recommendation;

        if !comparison.safe_to_heal && !in_primary && node_seqno > best_primary_seqno && node_seqno > 0
        {
            notes.push(format!(
                "ahead of primary component (seqno {node_seqno} > {best_primary_seqno})"
            ));
            recommendation = "Manual review required: this node has data ahead of the primary \
                component. Do not heal it without understanding its data state."
                .to_owned();
        } else if is_serving && wsrep.is_some_and(WsrepStatus::is_synced) {
            if disk_full || disk_low {
                notes.push(format!("healthy but disk low ({}%)", disk_pct.unwrap_or(0)));
                recommendation =
                    "Synced and healthy but disk usage is high. Consider expanding the storage volume."
                        .to_owned();
            } else {
                notes.push("healthy (Synced, connected, ready)".to_owned());
                if seqno_lag > 0 {
                    notes.push(format!("seqno lag: {seqno_lag} behind best"));
                }
                recommendation = "No action needed.".to_owned();
            }
        } else if is_serving
            && local_state.is_some_and(|state| (1..=3).contains(&state))
            && connected == Some(true)
        {
            let comment = wsrep
                .and_then(|status| status.local_state_comment.clone())
                .unwrap_or_else(|| "transitional".to_owned());
            notes.push(format!("transitional ({comment}), catching up"));
            if seqno_lag > 0 {
                notes.push(format!("seqno lag: {seqno_lag}"));
            }
            recommendation = format!(
                "Node is in a transitional state ({comment}). Wait for Synced; if it stays stuck \
                 it needs a heal.\n\n  {hint}"
            );
        } else if is_serving && (connected == Some(false) || ready_flag == Some(false)) {
            needs_heal = true;
            notes.push(format!(
                "disconnected (connected={}, ready={})",
                flag_label(connected),
                flag_label(ready_flag),
            ));
            if disk_full {
                notes.push("disk full (possible cause of the disconnect)".to_owned());
            }
            if node_seqno > 0 {
                notes.push(format!("last known seqno: {node_seqno}"));
            }
            recommendation = format!(
                "Node is disconnected from the cluster. Needs heal (state reset + SST rejoin).\n\n  {hint}"
            );
        } else if is_serving && cluster_status.is_some_and(|status| status != "Primary") {
            needs_heal = true;
            notes.push(format!(
                "non-primary component ({})",
                cluster_status.unwrap_or("unknown"),
            ));
            recommendation = format!("Node is in a non-primary component. Needs heal.\n\n  {hint}");
        } else if is_serving && (wsrep.is_none() || wsrep_query_failed) {
            needs_heal = true;
            notes.push("running but the wsrep status query failed".to_owned());
            if node_seqno > 0 {
                notes.push(format!("last known seqno: {node_seqno}"));
            }
            recommendation = format!(
                "Could not query the wsrep status; the server may not be accepting connections. \
                 Needs heal.\n\n  {hint}"
            );
        } else if is_crashloop {
            notes.push("crash-looping".to_owned());
            if disk_full {
                needs_heal = true;
                notes.push("disk full (cause of the crash)".to_owned());
                recommendation = format!(
                    "Crash-looping due to a full disk. Needs heal or a storage expansion.\n\n  {hint}"
                );
            } else if data_current {
                notes.push(format!("data current (seqno {node_seqno})"));
                recommendation = format!(
                    "Data is current but the pod is crash-looping. Inspect the pod logs; it may \
                     recover on restart, otherwise it needs a heal.\n\n  {hint}"
                );
            } else {
                needs_heal = true;
                if node_seqno > 0 {
                    notes.push(format!("last known seqno: {node_seqno}"));
                }
                recommendation = format!("Crash-looping with stale data. Needs heal.\n\n  {hint}");
            }
        } else if is_missing && has_data {
            notes.push("no pod running".to_owned());
            if data_current {
                notes.push(format!("data current (seqno {node_seqno})"));
                recommendation = "Data is current. The operator should recreate the pod; if it \
                    does not, check the cluster resource status."
                    .to_owned();
            } else {
                needs_heal = true;
                if node_seqno > 0 {
                    notes.push(format!("last known seqno: {node_seqno}"));
                }
                recommendation = format!(
                    "Pod missing with stale data. The operator should recreate it; if that \
                     stalls, it needs a heal.\n\n  {hint}"
                );
            }
        } else if is_missing {
            notes.push("no data: no pod, and the volume could not be probed".to_owned());
            recommendation =
                "Could not determine the node state. Check whether the storage claim can be mounted."
                    .to_owned();
        } else {
            notes.push("unknown state".to_owned());
            recommendation = "Could not determine the node state. Check the node manually.".to_owned();
        }

        let grastate = control.record.as_ref();
        assessments.push(InstanceAssessment {
            pod: pod.clone(),
            ordinal,
            is_running,
            is_ready,
            needs_heal,
            notes,
            recommendation,
            disk_pct,
            crash_reason,
            detail: AssessmentDetail::Galera(GaleraAssessment {
                in_primary_component: in_primary,
                source: control.source,
                grastate_seqno: grastate.map_or(-1, |state| state.seqno),
                effective_seqno: node_seqno,
                seqno_source,
                seqno_lag,
                uuid: grastate.and_then(|state| state.uuid.clone()),
                safe_to_bootstrap: grastate.is_some_and(|state| state.safe_to_bootstrap),
                wsrep: wsrep.cloned(),
            }),
        });
    }

    assessments
}

fn flag_label(flag: Option<bool>) -> &'static str {
    match flag {
        Some(true) => "ON",
        Some(false) => "OFF",
        None => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use hasteward_test_utils::param_test;

    use super::*;
    use crate::{
        cluster::EngineKind,
        control::{Grastate, StateSource},
        evidence::{GaleraRecovery, InstanceControl, PodObservation},
    };

    fn cluster() -> ClusterRef {
        ClusterRef::new(EngineKind::Galera, "prod", "g")
    }

    fn running_pod(name: &str, ready: bool) -> (String, PodObservation) {
        (
            name.to_owned(),
            PodObservation {
                name: name.to_owned(),
                phase: PodPhase::Running,
                ready,
                restarts: 0,
                node_name: None,
                pod_ip: None,
            },
        )
    }

    fn grastate(pod: &str, uuid: &str, seqno: i64) -> InstanceControl<Grastate> {
        InstanceControl {
            pod: pod.to_owned(),
            source: StateSource::LiveExec,
            record: Some(Grastate {
                uuid: Some(uuid.to_owned()),
                seqno,
                safe_to_bootstrap: false,
            }),
        }
    }

    fn synced_wsrep(uuid: &str, last_committed: i64) -> WsrepStatus {
        WsrepStatus {
            local_state: Some(4),
            local_state_comment: Some("Synced".to_owned()),
            cluster_status: Some("Primary".to_owned()),
            cluster_size: Some(2),
            connected: Some(true),
            ready: Some(true),
            cluster_state_uuid: Some(uuid.to_owned()),
            last_committed,
            flow_control_paused: None,
        }
    }

    const UUID: &str = "7acce8c4-9a2f-11ee-8b4d-7f3f2a6b8d21";

    fn healthy_evidence() -> GaleraEvidence {
        let nodes = ["g-0", "g-1", "g-2"];
        GaleraEvidence {
            expected_nodes: nodes.iter().map(|n| (*n).to_owned()).collect(),
            replicas: 3,
            pods: nodes.iter().map(|n| running_pod(n, true)).collect(),
            storage_pvc_bound: nodes.iter().map(|n| ((*n).to_owned(), true)).collect(),
            grastate: nodes.iter().map(|n| grastate(n, UUID, 100)).collect(),
            wsrep: nodes
                .iter()
                .map(|n| ((*n).to_owned(), synced_wsrep(UUID, 100)))
                .collect(),
            recovery: GaleraRecovery::default(),
            ..GaleraEvidence::default()
        }
    }

    #[test]
    fn healthy_cluster_is_safe() {
        let result = analyze(&cluster(), &healthy_evidence());
        assert!(result.comparison.safe_to_heal);
        assert!(result.heal_targets().is_empty());
        assert_eq!(result.ready_count, 3);
        assert!(!result.all_nodes_down);
    }

    #[test]
    fn split_brain_when_non_primary_node_is_ahead() {
        // g-0 and g-1 form the primary component at seqno 100; g-2 sits in a
        // non-primary component with fresher data.
        let mut evidence = healthy_evidence();
        let mut isolated = synced_wsrep(UUID, 150);
        isolated.cluster_status = Some("non-Primary".to_owned());
        evidence.wsrep.insert("g-2".to_owned(), isolated);
        evidence.grastate[2] = grastate("g-2", UUID, 150);

        let result = analyze(&cluster(), &evidence);

        assert!(!result.comparison.safe_to_heal);
        assert!(result
            .comparison
            .split_brain
            .iter()
            .any(|flag| flag.contains("g-2 has seqno 150 > primary best 100")));
        assert_eq!(result.comparison.most_advanced.as_deref(), Some("g-2"));
        assert_eq!(result.comparison.most_advanced_value, 150);

        let ahead = result.assessment("g-2").unwrap();
        assert!(!ahead.needs_heal);
        assert!(ahead.recommendation.contains("Manual review"));
    }

    #[test]
    fn uuid_multiplicity_is_split_brain() {
        let mut evidence = healthy_evidence();
        evidence.grastate[2] = grastate("g-2", "11111111-2222-3333-4444-555555555555", 90);
        evidence.wsrep.remove("g-2");
        evidence.wsrep_failed.insert("g-2".to_owned());

        let result = analyze(&cluster(), &evidence);
        assert!(!result.comparison.safe_to_heal);
        assert!(result.comparison.split_brain[0].contains("multiple cluster UUIDs"));
    }

    #[test]
    fn stale_non_primary_member_does_not_trip_split_brain() {
        // A node in a non-primary component with *older* data needs heal but
        // does not make the cluster unsafe.
        let mut evidence = healthy_evidence();
        let mut isolated = synced_wsrep(UUID, 40);
        isolated.cluster_status = Some("non-Primary".to_owned());
        evidence.wsrep.insert("g-2".to_owned(), isolated);
        evidence.grastate[2] = grastate("g-2", UUID, 40);

        let result = analyze(&cluster(), &evidence);
        assert!(result.comparison.safe_to_heal);
        let node = result.assessment("g-2").unwrap();
        assert!(node.needs_heal);
        assert!(node.notes[0].contains("non-primary component"));
    }

    #[test]
    fn disconnected_node_needs_heal() {
        let mut evidence = healthy_evidence();
        let mut status = synced_wsrep(UUID, 100);
        status.connected = Some(false);
        evidence.wsrep.insert("g-1".to_owned(), status);

        let result = analyze(&cluster(), &evidence);
        let node = result.assessment("g-1").unwrap();
        assert!(node.needs_heal);
        assert!(node.notes[0].contains("connected=OFF"));
    }

    #[test]
    fn failed_wsrep_query_needs_heal() {
        let mut evidence = healthy_evidence();
        evidence.wsrep.remove("g-1");
        evidence.wsrep_failed.insert("g-1".to_owned());

        let result = analyze(&cluster(), &evidence);
        let node = result.assessment("g-1").unwrap();
        assert!(node.needs_heal);
        assert!(node.notes[0].contains("wsrep status query failed"));
    }

    #[test]
    fn transitional_node_waits() {
        let mut evidence = healthy_evidence();
        let mut status = synced_wsrep(UUID, 80);
        status.local_state = Some(2);
        status.local_state_comment = Some("Donor/Desynced".to_owned());
        evidence.wsrep.insert("g-1".to_owned(), status);

        let result = analyze(&cluster(), &evidence);
        let node = result.assessment("g-1").unwrap();
        assert!(!node.needs_heal);
        assert!(node.notes[0].contains("transitional"));
    }

    param_test! {
        crashloop_rules: [
            disk_full_heals: (Some(CrashReason::DiskFull), 100, true),
            current_data_waits: (None, 100, false),
            stale_data_heals: (None, 10, true),
        ]
    }
    fn crashloop_rules(crash: Option<CrashReason>, seqno: i64, expect_heal: bool) {
        let mut evidence = healthy_evidence();
        evidence.pods.insert("g-2".to_owned(), running_pod("g-2", false).1);
        evidence.wsrep.remove("g-2");
        evidence.grastate[2] = grastate("g-2", UUID, seqno);
        if let Some(reason) = crash {
            evidence.crash_reasons.insert("g-2".to_owned(), reason);
        }

        let result = analyze(&cluster(), &evidence);
        let node = result.assessment("g-2").unwrap();
        assert_eq!(node.needs_heal, expect_heal);
    }

    #[test]
    fn absent_node_with_current_data_is_not_healed() {
        let mut evidence = healthy_evidence();
        evidence.pods.remove("g-2");
        evidence.wsrep.remove("g-2");
        // Operator recovery reports the node at the primary's position even
        // though grastate is stale.
        evidence.grastate[2] = grastate("g-2", UUID, -1);
        evidence.recovery.recovered.insert("g-2".to_owned(), 100);

        let result = analyze(&cluster(), &evidence);
        let node = result.assessment("g-2").unwrap();
        assert!(!node.needs_heal);
        let AssessmentDetail::Galera(detail) = &node.detail else {
            panic!("expected galera detail");
        };
        assert_eq!(detail.effective_seqno, 100);
        assert_eq!(detail.seqno_source, FreshnessSource::OperatorRecovered);
    }

    #[test]
    fn all_nodes_down_reports_bootstrap_candidate() {
        let mut evidence = healthy_evidence();
        evidence.pods.clear();
        evidence.wsrep.clear();
        evidence.grastate = vec![
            grastate_with_source("g-0", 90, StateSource::OfflineProbe),
            grastate_with_source("g-1", 120, StateSource::OfflineProbe),
            grastate_with_source("g-2", 100, StateSource::OfflineProbe),
        ];

        let result = analyze(&cluster(), &evidence);
        assert!(result.all_nodes_down);
        assert_eq!(result.best_seqno_node.as_deref(), Some("g-1"));
        assert_eq!(result.comparison.most_advanced_value, 120);
    }

    fn grastate_with_source(pod: &str, seqno: i64, source: StateSource) -> InstanceControl<Grastate> {
        InstanceControl {
            pod: pod.to_owned(),
            source,
            record: Some(Grastate {
                uuid: Some(UUID.to_owned()),
                seqno,
                safe_to_bootstrap: false,
            }),
        }
    }

    #[test]
    fn freshness_map_uses_best_source() {
        let mut evidence = healthy_evidence();
        evidence.recovery.state.insert("g-0".to_owned(), 170);
        let freshness = compute_freshness(&evidence);
        assert_eq!(
            freshness.get("g-0"),
            Some(&(170, FreshnessSource::OperatorState))
        );
    }
}
