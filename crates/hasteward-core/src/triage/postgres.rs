// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Triage analysis for the Postgres engine.

use crate::{
    cluster::{instance_ordinal, ClusterRef},
    control::Lsn,
    evidence::{CrashReason, PodPhase, PostgresEvidence},
    triage::{
        heal_hint, AssessmentDetail, ComparisonDetail, DataComparison, InstanceAssessment,
        PgAssessment, TriageResult, DISK_WARN_PCT,
    },
};

/// Analyzes Postgres evidence into a [`TriageResult`].
pub fn analyze(cluster: &ClusterRef, evidence: &PostgresEvidence) -> TriageResult {
    let primary = evidence.current_primary.clone().unwrap_or_default();
    let comparison = compare(evidence, &primary);
    let assessments = assess(cluster, evidence, &comparison, &primary);

    TriageResult {
        assessments,
        comparison,
        cluster_phase: evidence.cluster_phase.clone(),
        ready_count: evidence.ready_instances,
        total_count: evidence.total_instances,
        all_nodes_down: false,
        best_seqno_node: None,
    }
}

/// Builds the cross-instance comparison.
///
/// The primary's `(timeline, checkpoint LSN)` is the reference. Any
/// non-primary instance on a higher timeline, or ahead in LSN on the same
/// timeline, is a split-brain flag. The most advanced instance is the one
/// with the largest `(timeline, LSN)` tuple under lexicographic order.
fn compare(evidence: &PostgresEvidence, primary: &str) -> DataComparison {
    let primary_record = evidence
        .control
        .iter()
        .find(|control| control.pod == primary)
        .and_then(|control| control.record.as_ref());
    let primary_timeline = primary_record.and_then(|record| record.timeline);
    let primary_lsn = primary_record.and_then(|record| record.checkpoint_lsn);

    let reference_timeline = primary_timeline.unwrap_or(0);
    let reference_lsn = Lsn::value(primary_lsn);

    let mut most_advanced = (primary.to_owned(), reference_timeline, primary_lsn);
    let mut split_brain = Vec::new();

    for control in &evidence.control {
        if control.pod == primary {
            continue;
        }
        let Some(record) = &control.record else {
            continue;
        };
        let Some(timeline) = record.timeline else {
            continue;
        };
        let lsn = record.checkpoint_lsn;

        if (timeline, Lsn::value(lsn)) > (most_advanced.1, Lsn::value(most_advanced.2)) {
            most_advanced = (control.pod.clone(), timeline, lsn);
        }

        if timeline > reference_timeline {
            split_brain.push(format!(
                "{} has timeline {timeline} > primary timeline {reference_timeline}",
                control.pod
            ));
        } else if timeline == reference_timeline && Lsn::value(lsn) > reference_lsn {
            split_brain.push(format!(
                "{} checkpoint LSN {} > primary {} on timeline {timeline}",
                control.pod,
                display_lsn(lsn),
                display_lsn(primary_lsn),
            ));
        }
    }

    let safe_to_heal = split_brain.is_empty();
    let warnings = if safe_to_heal {
        vec![format!(
            "primary {primary} holds the most recent data (timeline {reference_timeline}, LSN {})",
            display_lsn(primary_lsn),
        )]
    } else {
        split_brain
            .iter()
            .map(|flag| format!("split-brain risk: {flag}"))
            .collect()
    };

    DataComparison {
        most_advanced: Some(most_advanced.0),
        most_advanced_value: i64::from(most_advanced.1),
        safe_to_heal,
        warnings,
        split_brain,
        detail: ComparisonDetail::Postgres {
            checkpoint_lsn: most_advanced.2,
        },
    }
}

fn display_lsn(lsn: Option<Lsn>) -> String {
    lsn.map_or_else(|| "unknown".to_owned(), |lsn| lsn.to_string())
}

/// Applies the per-instance decision ladder; the first matching branch
/// decides.
fn assess(
    cluster: &ClusterRef,
    evidence: &PostgresEvidence,
    comparison: &DataComparison,
    primary: &str,
) -> Vec<InstanceAssessment> {
    let primary_record = evidence
        .control
        .iter()
        .find(|control| control.pod == primary)
        .and_then(|control| control.record.as_ref());
    let primary_timeline = primary_record.and_then(|record| record.timeline);
    let primary_lsn_value = Lsn::value(primary_record.and_then(|record| record.checkpoint_lsn));

    let mut assessments = Vec::with_capacity(evidence.control.len());

    for control in &evidence.control {
        let pod = &control.pod;
        let ordinal = instance_ordinal(pod);
        let observation = evidence.pods.get(pod);
        let is_missing = observation.is_none();
        let is_crashloop = observation.is_some_and(|obs| obs.is_crashloop());
        let is_running = observation.is_some_and(|obs| obs.phase == PodPhase::Running);
        let is_ready = observation.is_some_and(|obs| obs.ready);

        let is_primary = pod == primary;
        let is_streaming = evidence.streaming_replicas.contains(pod);
        let crash_reason = evidence.crash_reasons.get(pod).copied();
        let disk_full = crash_reason == Some(CrashReason::DiskFull);
        let disk_pct = evidence.disk_usage.get(pod).copied();
        let disk_low = disk_pct.is_some_and(|pct| pct >= DISK_WARN_PCT);
        let has_data = control.source.has_data();

        let timeline = control.record.as_ref().and_then(|record| record.timeline);
        let lsn = control.record.as_ref().and_then(|record| record.checkpoint_lsn);
        let lsn_value = Lsn::value(lsn);

        let timelines_known = timeline.is_some() && primary_timeline.is_some();
        let same_timeline = timelines_known && timeline == primary_timeline;
        let behind_timeline = timelines_known && timeline < primary_timeline;
        let ahead_timeline = timelines_known && timeline > primary_timeline;
        let behind_lsn = same_timeline && lsn_value < primary_lsn_value;
        let ahead_lsn = same_timeline && lsn_value > primary_lsn_value;

        let hint = heal_hint(cluster, ordinal);

        let mut notes = Vec::new();
        let mut needs_heal = false;
        let recommendation;

        if is_primary {
            if disk_full || disk_low {
                notes.push("primary, disk full/low".to_owned());
                recommendation =
                    "Primary disk is full or nearly full. Expand the data volume in the cluster spec."
                        .to_owned();
            } else {
                notes.push("primary, healthy".to_owned());
                recommendation = "No action needed.".to_owned();
            }
        } else if !comparison.safe_to_heal {
            // Split brain anywhere in the cluster freezes automatic verdicts.
            if ahead_timeline || ahead_lsn {
                notes.push("ahead of primary, potential split-brain".to_owned());
                recommendation = "Manual review required: this instance has data ahead of the \
                    primary. Do not heal it; consider promoting it or recovering its data first."
                    .to_owned();
            } else if !has_data {
                notes.push("no data, cannot assess during split-brain".to_owned());
                recommendation =
                    "Manual review required: instance state is unknown. Resolve the split-brain first."
                        .to_owned();
            } else {
                notes.push("behind primary, but split-brain detected elsewhere".to_owned());
                recommendation =
                    "Manual review required: resolve the split-brain before healing any replica."
                        .to_owned();
            }
        } else if !has_data {
            notes.push("no data, offline probe failed".to_owned());
            match evidence.pvc_phases.get(pod) {
                Some(Some(phase)) => {
                    notes.push(format!("PVC: {phase}"));
                    recommendation = "Could not probe the data volume. Check whether the pod can \
                        be scheduled and the claim can be mounted."
                        .to_owned();
                }
                _ => {
                    notes.push("PVC: missing".to_owned());
                    recommendation =
                        "The data volume claim is missing. Check the cluster operator logs.".to_owned();
                }
            }
        } else if behind_timeline {
            needs_heal = true;
            notes.push(format!(
                "behind: timeline {} < primary {}",
                timeline.unwrap_or(0),
                primary_timeline.unwrap_or(0),
            ));
            if disk_full {
                notes.push("disk full (WAL accumulation while stuck)".to_owned());
            }
            recommendation = format!(
                "Needs heal: streaming cannot reconcile divergent timelines.\n\n  {hint}"
            );
        } else if same_timeline && behind_lsn && is_streaming {
            notes.push("healthy (streaming; checkpoint LSN slightly behind is normal)".to_owned());
            if disk_low {
                notes.push(format!("disk low ({}%)", disk_pct.unwrap_or(0)));
                recommendation =
                    "Streaming is healthy but disk usage is high. Consider expanding the data volume."
                        .to_owned();
            } else {
                recommendation = "No action needed.".to_owned();
            }
        } else if same_timeline && behind_lsn {
            notes.push(format!(
                "same timeline, behind by LSN ({} < {}), not streaming",
                display_lsn(lsn),
                Lsn(primary_lsn_value),
            ));
            if disk_full {
                needs_heal = true;
                notes.push("disk full (WAL accumulation while stuck)".to_owned());
                recommendation = format!(
                    "Needs heal: same timeline but a full disk prevents catch-up.\n\n  {hint}"
                );
            } else if is_missing {
                notes.push("no pod running".to_owned());
                recommendation = "Data is on the current timeline but the pod is gone. The \
                    operator should recreate it; it may then catch up via streaming if WAL is \
                    still available."
                    .to_owned();
            } else if is_crashloop {
                notes.push("crash-looping".to_owned());
                recommendation = format!(
                    "Same timeline but crash-looping. Inspect the pod logs; if WAL is still \
                     available it may recover on restart, otherwise it needs a heal.\n\n  {hint}"
                );
            } else {
                needs_heal = true;
                recommendation = format!(
                    "Not streaming. Check the replication slots: if the slot has no restart LSN \
                     the WAL has been discarded and a heal is required.\n\n  {hint}"
                );
            }
        } else if same_timeline {
            if is_missing {
                notes.push("data current but no pod".to_owned());
                recommendation = "Data is current. The operator should recreate the pod; if it \
                    does not, check the cluster phase."
                    .to_owned();
            } else if is_crashloop {
                notes.push("data current but crash-looping".to_owned());
                recommendation =
                    "Data is current but the pod is crash-looping. Inspect the pod logs.".to_owned();
            } else if disk_low {
                notes.push(format!("healthy but disk low ({}%)", disk_pct.unwrap_or(0)));
                recommendation =
                    "Healthy but disk usage is high. Consider expanding the data volume.".to_owned();
            } else {
                notes.push("healthy".to_owned());
                recommendation = "No action needed.".to_owned();
            }
        } else {
            notes.push("timeline unknown".to_owned());
            recommendation = "Could not determine the timeline. Check the instance manually.".to_owned();
        }

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
            detail: AssessmentDetail::Postgres(PgAssessment {
                is_primary,
                source: control.source,
                timeline,
                checkpoint_lsn: lsn,
            }),
        });
    }

    assessments
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use hasteward_test_utils::param_test;

    use super::*;
    use crate::{
        cluster::EngineKind,
        control::{PgControlData, StateSource},
        evidence::{InstanceControl, PodObservation, PodPhase},
    };

    fn cluster() -> ClusterRef {
        ClusterRef::new(EngineKind::Postgres, "prod", "c")
    }

    fn running_pod(name: &str, ready: bool) -> (String, PodObservation) {
        (
            name.to_owned(),
            PodObservation {
                name: name.to_owned(),
                phase: PodPhase::Running,
                ready,
                restarts: 0,
                node_name: Some("node-a".to_owned()),
                pod_ip: Some("10.0.0.1".to_owned()),
            },
        )
    }

    fn control(pod: &str, timeline: u32, lsn: &str) -> InstanceControl<PgControlData> {
        InstanceControl {
            pod: pod.to_owned(),
            source: StateSource::LiveExec,
            record: Some(PgControlData {
                cluster_state: Some("in production".to_owned()),
                timeline: Some(timeline),
                checkpoint_lsn: Lsn::parse(lsn),
                checkpoint_time: None,
                min_recovery_end: None,
            }),
        }
    }

    fn evidence(controls: Vec<InstanceControl<PgControlData>>) -> PostgresEvidence {
        let pods: BTreeMap<_, _> = controls
            .iter()
            .map(|control| running_pod(&control.pod, true))
            .collect();
        PostgresEvidence {
            expected_instances: controls.iter().map(|control| control.pod.clone()).collect(),
            current_primary: Some("c-1".to_owned()),
            cluster_phase: Some("Cluster in healthy state".to_owned()),
            ready_instances: controls.len() as i64,
            total_instances: controls.len() as i64,
            pods,
            pvc_phases: controls
                .iter()
                .map(|control| (control.pod.clone(), Some("Bound".to_owned())))
                .collect(),
            control: controls,
            ..PostgresEvidence::default()
        }
    }

    #[test]
    fn split_brain_on_diverged_timeline() {
        // Primary c-1 on timeline 5; c-2 promoted itself to timeline 6.
        let evidence = evidence(vec![
            control("c-1", 5, "0/A0"),
            control("c-2", 6, "0/50"),
            control("c-3", 5, "0/99"),
        ]);
        let result = analyze(&cluster(), &evidence);

        assert!(!result.comparison.safe_to_heal);
        assert_eq!(result.comparison.most_advanced.as_deref(), Some("c-2"));
        assert_eq!(result.comparison.most_advanced_value, 6);
        assert!(result.comparison.split_brain[0].contains("timeline 6 > primary timeline 5"));

        // Nothing is auto-healable during a split brain.
        assert!(result.heal_targets().is_empty());
        let ahead = result.assessment("c-2").unwrap();
        assert!(ahead.recommendation.contains("promoting"));
    }

    #[test]
    fn split_brain_on_lsn_same_timeline() {
        let evidence = evidence(vec![control("c-1", 5, "0/A0"), control("c-2", 5, "0/B0")]);
        let result = analyze(&cluster(), &evidence);

        assert!(!result.comparison.safe_to_heal);
        assert_eq!(result.comparison.most_advanced.as_deref(), Some("c-2"));
        assert!(result.comparison.split_brain[0].contains("0/B0"));
    }

    #[test]
    fn behind_timeline_needs_heal() {
        let evidence = evidence(vec![control("c-1", 5, "0/A0"), control("c-2", 4, "0/90")]);
        let result = analyze(&cluster(), &evidence);

        assert!(result.comparison.safe_to_heal);
        let behind = result.assessment("c-2").unwrap();
        assert!(behind.needs_heal);
        assert!(behind.recommendation.contains("divergent timelines"));
        assert!(behind.recommendation.contains("--instance 2"));
    }

    #[test]
    fn streaming_replica_slightly_behind_is_healthy() {
        let mut evidence = evidence(vec![control("c-1", 5, "0/A0"), control("c-2", 5, "0/90")]);
        evidence.streaming_replicas.insert("c-2".to_owned());
        let result = analyze(&cluster(), &evidence);

        let replica = result.assessment("c-2").unwrap();
        assert!(!replica.needs_heal);
        assert!(replica.notes[0].contains("streaming"));
    }

    #[test]
    fn stalled_replica_behind_lsn_needs_heal() {
        let evidence = evidence(vec![control("c-1", 5, "0/A0"), control("c-2", 5, "0/90")]);
        let result = analyze(&cluster(), &evidence);

        let replica = result.assessment("c-2").unwrap();
        assert!(replica.needs_heal);
        assert!(replica.recommendation.contains("replication slots"));
    }

    #[test]
    fn disk_full_replica_needs_heal() {
        let mut evidence = evidence(vec![control("c-1", 5, "0/A0"), control("c-2", 5, "0/90")]);
        evidence
            .crash_reasons
            .insert("c-2".to_owned(), CrashReason::DiskFull);
        let result = analyze(&cluster(), &evidence);

        let replica = result.assessment("c-2").unwrap();
        assert!(replica.needs_heal);
        assert!(replica.notes.iter().any(|note| note.contains("disk full")));
    }

    #[test]
    fn missing_pod_with_current_data_is_not_healed() {
        let mut evidence = evidence(vec![control("c-1", 5, "0/A0"), control("c-2", 5, "0/A0")]);
        evidence.pods.remove("c-2");
        let result = analyze(&cluster(), &evidence);

        let missing = result.assessment("c-2").unwrap();
        assert!(!missing.needs_heal);
        assert!(missing.notes[0].contains("no pod"));
    }

    #[test]
    fn primary_with_full_disk_recommends_expansion() {
        let mut evidence = evidence(vec![control("c-1", 5, "0/A0"), control("c-2", 5, "0/A0")]);
        evidence.disk_usage.insert("c-1".to_owned(), 95);
        let result = analyze(&cluster(), &evidence);

        let primary = result.assessment("c-1").unwrap();
        assert!(!primary.needs_heal);
        assert!(primary.recommendation.contains("Expand"));
    }

    #[test]
    fn absent_instance_without_pvc() {
        let mut controls = vec![control("c-1", 5, "0/A0")];
        controls.push(InstanceControl::absent("c-2"));
        let mut evidence = evidence(controls);
        evidence.pods.remove("c-2");
        evidence.pvc_phases.insert("c-2".to_owned(), None);
        let result = analyze(&cluster(), &evidence);

        let absent = result.assessment("c-2").unwrap();
        assert!(!absent.needs_heal);
        assert!(absent.notes.iter().any(|note| note == "PVC: missing"));
        assert!(absent.recommendation.contains("claim is missing"));
    }

    param_test! {
        safe_iff_no_replica_ahead: [
            all_behind: (vec![("c-2", 5, "0/90"), ("c-3", 5, "0/80")], true),
            one_ahead_lsn: (vec![("c-2", 5, "0/B0"), ("c-3", 5, "0/80")], false),
            one_ahead_timeline: (vec![("c-2", 6, "0/10"), ("c-3", 5, "0/80")], false),
        ]
    }
    fn safe_iff_no_replica_ahead(replicas: Vec<(&str, u32, &str)>, expected_safe: bool) {
        let mut controls = vec![control("c-1", 5, "0/A0")];
        controls.extend(replicas.into_iter().map(|(pod, tl, lsn)| control(pod, tl, lsn)));
        let result = analyze(&cluster(), &evidence(controls));
        assert_eq!(result.comparison.safe_to_heal, expected_safe);
    }
}
