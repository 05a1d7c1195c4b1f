// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Engine dispatch.
//!
//! The two engine families are a closed set, so dispatch is a tagged enum
//! rather than a registry; name-based lookup exists only at the CLI
//! boundary via [`hasteward_core::EngineKind`]'s `FromStr`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hasteward_archive::TagMap;
use hasteward_core::{ClusterRef, EngineKind, TriageResult};

use crate::{
    context::EngineContext,
    error::EngineResult,
    galera::GaleraEngine,
    orchestrator,
    postgres::PostgresEngine,
    types::{BackupOutcome, RepairOutcome, RestoreOutcome},
};

/// The engine-specific steps the repair orchestrator composes.
///
/// The orchestrator owns the phase sequence (triage, gates, escrow,
/// diverged captures, heal loop, stabilization); the engines supply the
/// cluster-flavored pieces behind this trait.
#[async_trait]
pub trait EngineOps: Send {
    fn kind(&self) -> EngineKind;
    fn cluster(&self) -> &ClusterRef;
    fn ctx(&self) -> &EngineContext;

    /// Re-reads the cluster resource into the engine's view.
    async fn refresh(&mut self) -> EngineResult<()>;

    /// Collects evidence and runs the triage analysis.
    async fn triage(&mut self) -> EngineResult<TriageResult>;

    /// Engine-specific repair preconditions, checked before any mutation:
    /// Postgres requires a running-ready primary, Galera at least one
    /// healthy donor.
    async fn repair_preflight(&mut self, triage: &TriageResult) -> EngineResult<()>;

    /// The donor for the pre-repair escrow backup, or `None` when no
    /// suitable donor exists (escrow is then skipped with a warning).
    fn escrow_donor(&self, triage: &TriageResult) -> Option<String>;

    /// Whether this pod must never be healed (the Postgres primary).
    fn is_protected(&self, pod: &str) -> bool;

    /// Verifies the target's data volumes exist before healing.
    async fn verify_heal_target(&self, pod: &str) -> EngineResult<()>;

    /// Streams a dump from `donor` into a snapshot.
    async fn backup_dump(
        &self,
        snapshot_type: &str,
        donor: &str,
        virtual_path: &str,
        job_start: DateTime<Utc>,
        extra_tags: TagMap,
    ) -> EngineResult<BackupOutcome>;

    /// Runs the engine's heal sequence against one instance.
    async fn heal_instance(&mut self, pod: &str, ordinal: u32) -> EngineResult<()>;

    /// Bounded wait for the whole cluster to report ready again.
    async fn await_all_ready(&self) -> EngineResult<()>;
}

/// A validated engine bound to one cluster.
pub enum Engine {
    Postgres(PostgresEngine),
    Galera(GaleraEngine),
}

impl Engine {
    /// Fetches the cluster resource and builds the matching engine.
    pub async fn connect(ctx: EngineContext) -> EngineResult<Self> {
        match ctx.cluster.engine {
            EngineKind::Postgres => Ok(Self::Postgres(PostgresEngine::connect(ctx).await?)),
            EngineKind::Galera => Ok(Self::Galera(GaleraEngine::connect(ctx).await?)),
        }
    }

    pub async fn triage(&mut self) -> EngineResult<TriageResult> {
        match self {
            Self::Postgres(engine) => engine.triage().await,
            Self::Galera(engine) => engine.triage().await,
        }
    }

    pub async fn repair(&mut self) -> EngineResult<RepairOutcome> {
        match self {
            Self::Postgres(engine) => orchestrator::run_repair(engine).await,
            Self::Galera(engine) => orchestrator::run_repair(engine).await,
        }
    }

    pub async fn backup(&mut self) -> EngineResult<BackupOutcome> {
        match self {
            Self::Postgres(engine) => engine.backup().await,
            Self::Galera(engine) => engine.backup().await,
        }
    }

    pub async fn restore(&mut self) -> EngineResult<RestoreOutcome> {
        match self {
            Self::Postgres(engine) => engine.restore().await,
            Self::Galera(engine) => engine.restore().await,
        }
    }
}
