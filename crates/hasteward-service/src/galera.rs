// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The Galera (MariaDB operator) engine: N-node multi-master, quorum-based.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hasteward_archive::TagMap;
use hasteward_core::{
    cluster::galera_storage_claim, evidence::PodPhase, ClusterRef, EngineKind, TriageResult,
};
use hasteward_platform::{
    shell::{sh_command_with_env, single_quoted},
    views::{self, GaleraClusterView},
    ResourceKind,
};
use tracing::{debug, info, warn};

use crate::{
    context::EngineContext,
    engine::EngineOps,
    error::{EngineError, EngineResult},
    pipeline,
    redact::register_secret,
    types::{BackupOutcome, RestoreOutcome},
};

pub mod heal;
pub mod triage;

const READY_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
const READY_POLL_ROUNDS: u32 = 30;

/// The dump command. MariaDB 11+ ships the dumper as `mariadb-dump` while
/// older images only have `mysqldump`; resolve whichever exists at runtime.
/// The password travels via `MYSQL_PWD` inside the script, never via argv.
pub(crate) fn dump_command(password: &str) -> Vec<String> {
    sh_command_with_env(
        &[("MYSQL_PWD", password)],
        "DUMPCMD=$(command -v mariadb-dump 2>/dev/null || command -v mysqldump 2>/dev/null) && \
         $DUMPCMD -u root --all-databases --single-transaction --routines --triggers --events",
    )
}

/// The restore command fed on a healthy node.
pub(crate) fn restore_command(password: &str) -> Vec<String> {
    sh_command_with_env(&[("MYSQL_PWD", password)], "mysql -u root")
}

/// The batch query behind the wsrep status collection.
pub(crate) fn wsrep_query_command(password: &str) -> Vec<String> {
    const QUERY: &str = "SELECT VARIABLE_NAME, VARIABLE_VALUE \
         FROM information_schema.GLOBAL_STATUS \
         WHERE VARIABLE_NAME IN (\
         'wsrep_local_state', 'wsrep_local_state_comment', \
         'wsrep_cluster_status', 'wsrep_cluster_size', \
         'wsrep_connected', 'wsrep_ready', \
         'wsrep_cluster_state_uuid', 'wsrep_last_committed', \
         'wsrep_flow_control_paused') ORDER BY VARIABLE_NAME";
    sh_command_with_env(
        &[("MYSQL_PWD", password)],
        &format!("mariadb -u root --batch --skip-column-names -e {}", single_quoted(QUERY)),
    )
}

pub struct GaleraEngine {
    pub(crate) ctx: EngineContext,
    pub(crate) view: GaleraClusterView,
    pub(crate) root_password: String,
}

impl GaleraEngine {
    /// Fetches the cluster resource and the root password it references.
    pub async fn connect(ctx: EngineContext) -> EngineResult<Self> {
        let view = Self::fetch_view(&ctx).await?;
        let root_password = Self::fetch_root_password(&ctx, &view).await?;
        Ok(Self {
            ctx,
            view,
            root_password,
        })
    }

    async fn fetch_view(ctx: &EngineContext) -> EngineResult<GaleraClusterView> {
        let value = ctx
            .platform
            .get_resource(
                ResourceKind::GaleraCluster,
                ctx.namespace(),
                ctx.cluster_name(),
                &ctx.cancel,
            )
            .await
            .map_err(|error| {
                if error.is_not_found() {
                    EngineError::Validation(format!(
                        "MariaDB cluster {}/{} not found",
                        ctx.namespace(),
                        ctx.cluster_name()
                    ))
                } else {
                    error.into()
                }
            })?;
        Ok(GaleraClusterView::from_value(value))
    }

    async fn fetch_root_password(
        ctx: &EngineContext,
        view: &GaleraClusterView,
    ) -> EngineResult<String> {
        let secret_ref = view.root_password_secret.as_ref().ok_or_else(|| {
            EngineError::Validation(
                "the cluster resource has no root password secret reference".to_owned(),
            )
        })?;
        let bytes = ctx
            .platform
            .read_secret(ctx.namespace(), &secret_ref.name, &secret_ref.key, &ctx.cancel)
            .await?;
        let password = String::from_utf8_lossy(&bytes).into_owned();
        // Redacted from every log line from here on.
        register_secret(password.clone());
        Ok(password)
    }

    fn container(&self) -> &'static str {
        EngineKind::Galera.container()
    }

    fn pod_selector(&self) -> String {
        EngineKind::Galera.pod_selector(self.ctx.cluster_name())
    }

    /// The first running-ready node, used as dump donor and restore target.
    async fn find_healthy_pod(&self) -> EngineResult<String> {
        let values = self
            .ctx
            .platform
            .list_resources(
                ResourceKind::Pod,
                self.ctx.namespace(),
                &self.pod_selector(),
                &self.ctx.cancel,
            )
            .await?;
        let mut candidates: Vec<String> = values
            .iter()
            .filter_map(|value| views::parse_pod(value))
            .filter(|pod| pod.is_running_ready())
            .map(|pod| pod.name)
            .collect();
        candidates.sort();
        candidates.into_iter().next().ok_or_else(|| {
            EngineError::Precondition(format!(
                "no healthy running nodes found for {}",
                self.ctx.cluster
            ))
        })
    }

    pub async fn backup(&mut self) -> EngineResult<BackupOutcome> {
        let donor = self.find_healthy_pod().await?;
        pipeline::stream_backup(
            &self.ctx,
            &donor,
            self.container(),
            dump_command(&self.root_password),
            &self.ctx.cluster.dump_path(),
            hasteward_archive::tags::TYPE_BACKUP,
            TagMap::new(),
            Utc::now(),
        )
        .await
    }

    pub async fn restore(&mut self) -> EngineResult<RestoreOutcome> {
        let started = std::time::Instant::now();
        let target = self.find_healthy_pod().await?;
        let snapshot = self.ctx.config.snapshot.clone();
        let virtual_path = match self.ctx.config.instance {
            Some(ordinal) => self.ctx.cluster.diverged_dump_path(ordinal),
            None => self.ctx.cluster.dump_path(),
        };
        let filter = pipeline::cluster_filter(&self.ctx);

        pipeline::stream_restore(
            &self.ctx,
            &target,
            self.container(),
            restore_command(&self.root_password),
            &snapshot,
            &virtual_path,
            &filter,
        )
        .await?;

        info!("restore complete; replication will propagate the data to the other nodes");
        Ok(RestoreOutcome {
            snapshot_id: snapshot,
            duration: started.elapsed(),
        })
    }
}

#[async_trait]
impl EngineOps for GaleraEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Galera
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

    async fn repair_preflight(&mut self, triage: &TriageResult) -> EngineResult<()> {
        if triage.donor_candidates().is_empty() {
            return Err(EngineError::Precondition(
                "no healthy donor nodes found; a running node is required to provide the \
                 state transfer for a heal"
                    .to_owned(),
            ));
        }
        Ok(())
    }

    fn escrow_donor(&self, triage: &TriageResult) -> Option<String> {
        // Escrow wants consistent data, so the donor comes from the primary
        // component.
        triage.comparison.primary_members().first().cloned()
    }

    fn is_protected(&self, _pod: &str) -> bool {
        // Multi-master: any node may be rebuilt from its peers.
        false
    }

    async fn verify_heal_target(&self, pod: &str) -> EngineResult<()> {
        let claim = galera_storage_claim(pod);
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
                "storage volume claim {claim} not found"
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
            dump_command(&self.root_password),
            virtual_path,
            snapshot_type,
            extra_tags,
            job_start,
        )
        .await
    }

    async fn heal_instance(&mut self, pod: &str, ordinal: u32) -> EngineResult<()> {
        heal::heal_node(self, pod, ordinal).await
    }

    async fn await_all_ready(&self) -> EngineResult<()> {
        let expected = self.view.replicas;
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
                        info!(ready, "all nodes are running and ready");
                        return Ok(());
                    }
                    debug!(ready, expected, "waiting for nodes");
                }
                Err(error) => debug!(%error, "pod list failed while waiting for readiness"),
            }
            self.ctx.sleep(READY_POLL_INTERVAL).await?;
        }
        warn!("not all nodes became ready within the wait budget");
        Ok(())
    }
}
