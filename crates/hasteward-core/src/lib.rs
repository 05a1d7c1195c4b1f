// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Core data model and triage analysis for hasteward.
//!
//! This crate is platform-free: it defines the cluster/instance model, the
//! engine-specific control-state records together with their text parsers,
//! the evidence bundle gathered by the engines, and the pure triage analyzer
//! that turns evidence into per-instance assessments and a cross-instance
//! data-freshness comparison.

pub mod cluster;
pub mod control;
pub mod evidence;
pub mod triage;

pub use cluster::{ClusterRef, EngineKind};
pub use control::{Grastate, Lsn, PgControlData, StateSource, WsrepStatus};
pub use triage::{DataComparison, InstanceAssessment, TriageResult};
