// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Triage analysis: per-instance assessments and the cross-instance
//! data-freshness comparison.
//!
//! The analyzers are pure functions over an evidence bundle. Their decision
//! ladders are deliberately explicit `if`/`else` chains so that every
//! verdict is reproducible from the rules, never a fuzzy heuristic.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    cluster::{ClusterRef, EngineKind},
    control::{Lsn, StateSource, WsrepStatus},
    evidence::CrashReason,
};

pub mod galera;
pub mod postgres;

/// Disk-usage percentage above which an otherwise healthy instance gets a
/// storage warning.
pub const DISK_WARN_PCT: u8 = 90;

/// The source that supplied the winning effective-freshness value of a
/// Galera node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessSource {
    WsrepLastCommitted,
    OperatorRecovered,
    OperatorState,
    Grastate,
    None,
}

impl fmt::Display for FreshnessSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::WsrepLastCommitted => "wsrep_last_committed",
            Self::OperatorRecovered => "operator_recovered",
            Self::OperatorState => "operator_state",
            Self::Grastate => "grastate",
            Self::None => "none",
        };
        f.write_str(label)
    }
}

/// Computes the effective freshness of a Galera node: the maximum over the
/// four candidate sources, with the winner recorded. Unknown candidates are
/// `-1`; a larger candidate strictly wins, so on ties the earlier (more
/// trusted) source keeps the credit.
pub fn effective_seqno(
    wsrep_last_committed: i64,
    operator_recovered: i64,
    operator_state: i64,
    grastate: i64,
) -> (i64, FreshnessSource) {
    let candidates = [
        (wsrep_last_committed, FreshnessSource::WsrepLastCommitted),
        (operator_recovered, FreshnessSource::OperatorRecovered),
        (operator_state, FreshnessSource::OperatorState),
        (grastate, FreshnessSource::Grastate),
    ];

    let mut best = (-1, FreshnessSource::None);
    for (value, source) in candidates {
        if value > best.0 {
            best = (value, source);
        }
    }
    best
}

/// Engine-specific evidence attached to an assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssessmentDetail {
    Postgres(PgAssessment),
    Galera(GaleraAssessment),
}

/// Postgres-specific assessment fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgAssessment {
    pub is_primary: bool,
    pub source: StateSource,
    pub timeline: Option<u32>,
    pub checkpoint_lsn: Option<Lsn>,
}

/// Galera-specific assessment fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaleraAssessment {
    pub in_primary_component: bool,
    pub source: StateSource,
    pub grastate_seqno: i64,
    pub effective_seqno: i64,
    pub seqno_source: FreshnessSource,
    /// Positions behind the primary component's best; `-1` when unknown.
    pub seqno_lag: i64,
    pub uuid: Option<String>,
    pub safe_to_bootstrap: bool,
    pub wsrep: Option<WsrepStatus>,
}

/// The triage verdict for a single instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceAssessment {
    pub pod: String,
    pub ordinal: Option<u32>,
    pub is_running: bool,
    pub is_ready: bool,
    pub needs_heal: bool,
    pub notes: Vec<String>,
    pub recommendation: String,
    pub disk_pct: Option<u8>,
    pub crash_reason: Option<CrashReason>,
    pub detail: AssessmentDetail,
}

impl InstanceAssessment {
    /// Whether this instance can serve as a dump donor.
    pub fn is_donor_candidate(&self) -> bool {
        self.is_running && self.is_ready
    }

    pub fn is_primary(&self) -> bool {
        match &self.detail {
            AssessmentDetail::Postgres(pg) => pg.is_primary,
            AssessmentDetail::Galera(galera) => galera.in_primary_component,
        }
    }
}

/// Engine-specific comparison fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ComparisonDetail {
    Postgres {
        /// Checkpoint LSN of the most advanced instance.
        checkpoint_lsn: Option<Lsn>,
    },
    Galera {
        primary_members: Vec<String>,
        /// Best effective seqno across primary-component members; `-1` when
        /// there are no members.
        best_primary_seqno: i64,
    },
}

/// Cross-instance data-freshness comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataComparison {
    pub most_advanced: Option<String>,
    /// Timeline (Postgres) or effective seqno (Galera) of the most advanced
    /// instance.
    pub most_advanced_value: i64,
    pub safe_to_heal: bool,
    pub warnings: Vec<String>,
    pub split_brain: Vec<String>,
    pub detail: ComparisonDetail,
}

impl DataComparison {
    pub fn primary_members(&self) -> &[String] {
        match &self.detail {
            ComparisonDetail::Galera { primary_members, .. } => primary_members,
            ComparisonDetail::Postgres { .. } => &[],
        }
    }
}

/// The complete triage output for a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageResult {
    pub assessments: Vec<InstanceAssessment>,
    pub comparison: DataComparison,
    pub cluster_phase: Option<String>,
    pub ready_count: i64,
    pub total_count: i64,
    /// Galera only: no node is running at all.
    pub all_nodes_down: bool,
    /// Galera only: the node holding the highest effective seqno.
    pub best_seqno_node: Option<String>,
}

impl TriageResult {
    pub fn assessment(&self, pod: &str) -> Option<&InstanceAssessment> {
        self.assessments.iter().find(|a| a.pod == pod)
    }

    /// Instances the analyzer marked as needing a heal.
    pub fn heal_targets(&self) -> Vec<&InstanceAssessment> {
        self.assessments.iter().filter(|a| a.needs_heal).collect()
    }

    /// Instances able to serve as dump donors.
    pub fn donor_candidates(&self) -> Vec<&InstanceAssessment> {
        self.assessments
            .iter()
            .filter(|a| a.is_donor_candidate())
            .collect()
    }
}

/// The repair command an operator would run against the given instance,
/// embedded in recommendations so triage output is directly actionable.
fn heal_hint(cluster: &ClusterRef, ordinal: Option<u32>) -> String {
    let engine = match cluster.engine {
        EngineKind::Postgres => "postgres",
        EngineKind::Galera => "galera",
    };
    let instance = ordinal.map_or_else(String::new, |n| format!(" --instance {n}"));
    format!(
        "hasteward repair --engine {engine} --cluster {} --namespace {}{instance}",
        cluster.cluster, cluster.namespace
    )
}

#[cfg(test)]
mod tests {
    use hasteward_test_utils::param_test;

    use super::*;

    param_test! {
        effective_seqno_picks_max: [
            wsrep_wins: (150, 100, 90, 80, 150, FreshnessSource::WsrepLastCommitted),
            recovered_wins: (-1, 42, 10, 7, 42, FreshnessSource::OperatorRecovered),
            state_wins: (-1, -1, 12, 3, 12, FreshnessSource::OperatorState),
            grastate_wins: (-1, -1, -1, 9, 9, FreshnessSource::Grastate),
            all_unknown: (-1, -1, -1, -1, -1, FreshnessSource::None),
            tie_prefers_earlier: (77, 77, 77, 77, 77, FreshnessSource::WsrepLastCommitted),
        ]
    }
    fn effective_seqno_picks_max(
        wsrep: i64,
        recovered: i64,
        state: i64,
        grastate: i64,
        expected: i64,
        source: FreshnessSource,
    ) {
        assert_eq!(effective_seqno(wsrep, recovered, state, grastate), (expected, source));
    }

    #[test]
    fn heal_hint_includes_instance() {
        let cluster = ClusterRef::new(EngineKind::Galera, "prod", "gdb");
        let hint = heal_hint(&cluster, Some(2));
        assert_eq!(
            hint,
            "hasteward repair --engine galera --cluster gdb --namespace prod --instance 2"
        );
    }
}
