// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The Postgres (CNPG-style) engine: primary plus streaming replicas, with
//! fenceable instances.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hasteward_archive::TagMap;
use hasteward_core::{
    cluster::postgres_data_claim, evidence::PodPhase, ClusterRef, EngineKind, TriageResult,
};
use hasteward_platform::{views, views::PostgresClusterView, ResourceKind};
use tracing::{debug, info, warn};

use crate::{
    context::EngineContext,
    engine::EngineOps,
    error::{EngineError, EngineResult},
    pipeline::{self, require_running_ready},
    types::{BackupOutcome, RestoreOutcome},
};

pub mod heal;
pub mod restore;
pub mod triage;

/// Poll cadence for cluster-wide readiness waits.
const READY_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
/// Rounds of the cluster-wide readiness wait.
const READY_POLL_ROUNDS: u32 = 30;

/// The dump command streamed out of the donor.
fn dump_command() -> Vec<String> {
    vec![
        "pg_dumpall".to_owned(),
        "-U".to_owned(),
        "postgres".to_owned(),
    ]
}

/// The restore command fed on the primary.
fn restore_command() -> Vec<String> {
    vec!["psql".to_owned(), "-U".to_owned(), "postgres".to_owned()]
}

pub struct PostgresEngine {
    pub(crate) ctx: EngineContext,
    pub(crate) view: PostgresClusterView,
}

impl PostgresEngine {
    /// Fetches the cluster resource and validates it exists.
    pub async fn connect(ctx: EngineContext) -> EngineResult<Self> {
        let view = Self::fetch_view(&ctx).await?;
        Ok(Self { ctx, view })
    }

    async fn fetch_view(ctx: &EngineContext) -> EngineResult<PostgresClusterView> {
        let value = ctx
            .platform
            .get_resource(
                ResourceKind::PostgresCluster,
                ctx.namespace(),
                ctx.cluster_name(),
                &ctx.cancel,
            )
            .await
            .map_err(|error| {
                if error.is_not_found() {
                    EngineError::Validation(format!(
                        "Postgres cluster {}/{} not found",
                        ctx.namespace(),
                        ctx.cluster_name()
                    ))
                } else {
                    error.into()
                }
            })?;
        Ok(PostgresClusterView::from_value(value))
    }

    fn container(&self) -> &'static str {
        EngineKind::Postgres.container()
    }

    fn pod_selector(&self) -> String {
        EngineKind::Postgres.pod_selector(self.ctx.cluster_name())
    }

    /// The current primary, required for donor-based operations.
    pub(crate) fn require_primary(&self) -> EngineResult<String> {
        self.view.current_primary.clone().ok_or_else(|| {
            EngineError::Precondition(
                "no current primary detected; fix the primary before continuing".to_owned(),
            )
        })
    }

    pub async fn backup(&mut self) -> EngineResult<BackupOutcome> {
        let primary = self.require_primary()?;
        pipeline::stream_backup(
            &self.ctx,
            &primary,
            self.container(),
            dump_command(),
            &self.ctx.cluster.dump_path(),
            hasteward_archive::tags::TYPE_BACKUP,
            TagMap::new(),
            Utc::now(),
        )
        .await
    }

    pub async fn restore(&mut self) -> EngineResult<RestoreOutcome> {
        restore::restore(self).await
    }
}

#[async_trait]
impl EngineOps for PostgresEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Postgres
    }

    fn cluster(&self) -> &ClusterRef {
        &self.ctx.cluster
    }

    fn ctx(&self) -> &EngineContext {
        &self.ctx
    }

    async fn refresh(&mut self) -> EngineResult<()> {
        self.view = Self::fetch_view(&self.ctx).await?;
        Ok(())
    }

    async fn triage(&mut self) -> EngineResult<TriageResult> {
        triage::run(self).await
    }

    async fn repair_preflight(&mut self, _triage: &TriageResult) -> EngineResult<()> {
        let primary = self.require_primary()?;
        require_running_ready(&self.ctx, &primary)
            .await
            .map_err(|error| {
                EngineError::Precondition(format!(
                    "primary {primary} must be running and ready before a repair: {error}"
                ))
            })
    }

    fn escrow_donor(&self, _triage: &TriageResult) -> Option<String> {
        self.view.current_primary.clone()
    }

    fn is_protected(&self, pod: &str) -> bool {
        self.view.current_primary.as_deref() == Some(pod)
    }

    async fn verify_heal_target(&self, pod: &str) -> EngineResult<()> {
        let claim = postgres_data_claim(pod);
        match self
            .ctx
            .platform
            .get_resource(
                ResourceKind::PersistentVolumeClaim,
                self.ctx.namespace(),
                &claim,
                &self.ctx.cancel,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if error.is_not_found() => Err(EngineError::Precondition(format!(
                "data volume claim {claim} not found"
            ))),
            Err(error) => Err(error.into()),
        }
    }

    async fn backup_dump(
        &self,
        snapshot_type: &str,
        donor: &str,
        virtual_path: &str,
        job_start: DateTime<Utc>,
        extra_tags: TagMap,
    ) -> EngineResult<BackupOutcome> {
        pipeline::stream_backup(
            &self.ctx,
            donor,
            self.container(),
            dump_command(),
            virtual_path,
            snapshot_type,
            extra_tags,
            job_start,
        )
        .await
    }

    async fn heal_instance(&mut self, pod: &str, ordinal: u32) -> EngineResult<()> {
        heal::heal_instance(self, pod, ordinal).await
    }

    async fn await_all_ready(&self) -> EngineResult<()> {
        let expected = self.view.instances;
        for _ in 0..READY_POLL_ROUNDS {
            match self
                .ctx
                .platform
                .list_resources(
                    ResourceKind::Pod,
                    self.ctx.namespace(),
                    &self.pod_selector(),
                    &self.ctx.cancel,
                )
                .await
            {
                Ok(values) => {
                    let ready = values
                        .iter()
                        .filter_map(|value| views::parse_pod(value))
                        .filter(|pod| pod.phase == PodPhase::Running && pod.ready)
                        .count() as i64;
                    if ready == expected {
                        info!(ready, "all instances are running and ready");
                        return Ok(());
                    }
                    debug!(ready, expected, "waiting for instances");
                }
                Err(error) => debug!(%error, "pod list failed while waiting for readiness"),
            }
            self.ctx.sleep(READY_POLL_INTERVAL).await?;
        }
        warn!("not all instances became ready within the wait budget");
        Ok(())
    }
}
