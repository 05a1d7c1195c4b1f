// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Evidence bundles handed from the engines to the triage analyzer.
//!
//! The engines gather everything observable about a cluster through the
//! platform adapter and deposit it here; the analyzer never talks to the
//! platform itself. Absent instances and failed reads are recorded as data,
//! not errors.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::control::{
    Grastate, PgControlData, ReplicationRow, ReplicationSlotRow, StateSource, WsrepStatus,
};

/// Pod lifecycle phase as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// What was observed about one instance pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodObservation {
    pub name: String,
    pub phase: PodPhase,
    /// First-container readiness.
    pub ready: bool,
    pub restarts: i32,
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
}

impl PodObservation {
    /// Running with a ready database container.
    pub fn is_running_ready(&self) -> bool {
        self.phase == PodPhase::Running && self.ready
    }

    /// Running but the database container never becomes ready.
    pub fn is_crashloop(&self) -> bool {
        self.phase == PodPhase::Running && !self.ready
    }
}

/// Crash cause inferred from container logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashReason {
    DiskFull,
}

/// A control-state record together with its provenance, one per expected
/// instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceControl<T> {
    pub pod: String,
    pub source: StateSource,
    /// `None` exactly when `source` is [`StateSource::Absent`].
    pub record: Option<T>,
}

impl<T> InstanceControl<T> {
    pub fn absent(pod: impl Into<String>) -> Self {
        Self {
            pod: pod.into(),
            source: StateSource::Absent,
            record: None,
        }
    }
}

/// Evidence gathered for a Postgres cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostgresEvidence {
    pub expected_instances: Vec<String>,
    pub current_primary: Option<String>,
    pub cluster_phase: Option<String>,
    pub ready_instances: i64,
    pub total_instances: i64,
    /// Pods found by the cluster label selector; expected instances without
    /// a pod are absent from this map.
    pub pods: BTreeMap<String, PodObservation>,
    /// PVC phase per expected instance; `None` means the claim is missing.
    pub pvc_phases: BTreeMap<String, Option<String>>,
    pub control: Vec<InstanceControl<PgControlData>>,
    /// Application names with an active streaming replication row.
    pub streaming_replicas: BTreeSet<String>,
    pub replication: Vec<ReplicationRow>,
    pub slots: Vec<ReplicationSlotRow>,
    pub wal_info: Option<String>,
    pub disk_usage: BTreeMap<String, u8>,
    pub crash_reasons: BTreeMap<String, CrashReason>,
}

/// Operator-reported Galera recovery positions, keyed by pod name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GaleraRecovery {
    pub recovered: BTreeMap<String, i64>,
    pub state: BTreeMap<String, i64>,
}

impl GaleraRecovery {
    pub fn recovered_seqno(&self, pod: &str) -> i64 {
        self.recovered.get(pod).copied().unwrap_or(-1)
    }

    pub fn state_seqno(&self, pod: &str) -> i64 {
        self.state.get(pod).copied().unwrap_or(-1)
    }
}

/// Evidence gathered for a Galera cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GaleraEvidence {
    pub expected_nodes: Vec<String>,
    pub replicas: i64,
    pub pods: BTreeMap<String, PodObservation>,
    /// Whether the storage volume claim of each node is bound.
    pub storage_pvc_bound: BTreeMap<String, bool>,
    /// Whether the optional config volume claim of each node is bound.
    pub config_pvc_bound: BTreeMap<String, bool>,
    pub grastate: Vec<InstanceControl<Grastate>>,
    /// Wsrep status per node where the status query succeeded.
    pub wsrep: BTreeMap<String, WsrepStatus>,
    /// Running nodes whose status query failed.
    pub wsrep_failed: BTreeSet<String>,
    pub recovery: GaleraRecovery,
    pub disk_usage: BTreeMap<String, u8>,
    pub crash_reasons: BTreeMap<String, CrashReason>,
}

impl GaleraEvidence {
    /// Nodes reporting membership in the primary component.
    pub fn primary_members(&self) -> Vec<String> {
        self.wsrep
            .iter()
            .filter(|(_, status)| status.in_primary_component())
            .map(|(pod, _)| pod.clone())
            .collect()
    }

    /// Whether no node is running at all.
    pub fn all_nodes_down(&self) -> bool {
        !self.pods.values().any(|pod| pod.phase == PodPhase::Running)
    }
}
