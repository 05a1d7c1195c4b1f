// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The repair orchestrator: the phase sequence shared by both engines.
//!
//! Sequence: triage, engine preflight, escrow backup, per-instance diverged
//! captures (split-brain only), then the targeted/untargeted branch with its
//! safety gates, sequential heals, and post-repair stabilization. Diverged
//! capture failures are partial errors: logged, never fatal.

use std::time::Duration;

use chrono::Utc;
use hasteward_archive::{job_id, tags, TagMap};
use hasteward_core::TriageResult;
use tracing::{info, warn};

use crate::{
    engine::EngineOps,
    error::{EngineError, EngineResult},
    types::RepairOutcome,
};

/// Settle time granted to the operator before the post-repair ready poll.
const STABILIZE_WAIT: Duration = Duration::from_secs(30);

/// Runs the full repair sequence.
pub async fn run_repair<E: EngineOps>(engine: &mut E) -> EngineResult<RepairOutcome> {
    let started = Utc::now();
    let clock = std::time::Instant::now();

    info!(cluster = %engine.cluster(), "repair: phase 1, triage");
    let triage = engine.triage().await?;
    engine.repair_preflight(&triage).await?;

    let config = engine.ctx().config.clone();

    // Phase 2: escrow. Always type=backup, subject to normal retention;
    // skipping it is an explicit opt-in.
    if config.no_escrow {
        warn!("no-escrow requested: proceeding without a pre-repair backup");
    } else {
        engine.ctx().archive()?;
        match engine.escrow_donor(&triage) {
            Some(donor) => {
                let path = engine.cluster().dump_path();
                let escrow = engine
                    .backup_dump(tags::TYPE_BACKUP, &donor, &path, started, TagMap::new())
                    .await
                    .map_err(|error| {
                        EngineError::stream("escrow", format!("pre-repair backup failed: {error}"))
                    })?;
                info!(snapshot = %escrow.snapshot_id, donor, "escrow backup complete");
            }
            None => warn!("no escrow donor available; skipping pre-repair backup"),
        }
    }

    // Phase 3: per-instance diverged captures when the cluster is split.
    if !triage.comparison.safe_to_heal && !config.no_escrow {
        let job = job_id(started);
        warn!(job = %job, "split brain detected: capturing per-instance diverged snapshots");
        for assessment in &triage.assessments {
            if !assessment.is_donor_candidate() {
                warn!(pod = %assessment.pod, "skipping diverged capture (not running and ready)");
                continue;
            }
            let Some(ordinal) = assessment.ordinal else {
                warn!(pod = %assessment.pod, "skipping diverged capture (no ordinal)");
                continue;
            };
            let path = engine.cluster().diverged_dump_path(ordinal);
            let mut extra = TagMap::new();
            extra.insert(tags::JOB.to_owned(), job.clone());
            match engine
                .backup_dump(tags::TYPE_DIVERGED, &assessment.pod, &path, started, extra)
                .await
            {
                Ok(capture) => {
                    info!(pod = %assessment.pod, snapshot = %capture.snapshot_id, "diverged capture written");
                }
                // Partial failure: the repair still proceeds.
                Err(error) => {
                    warn!(pod = %assessment.pod, %error, "diverged capture failed; continuing");
                }
            }
        }
    }

    // Phase 4: heal, targeted or untargeted.
    let mut outcome = RepairOutcome::default();
    match config.instance {
        Some(ordinal) => repair_targeted(engine, &triage, ordinal, config.force, &mut outcome).await?,
        None => repair_untargeted(engine, &triage, &mut outcome).await?,
    }

    outcome.duration = clock.elapsed();
    Ok(outcome)
}

async fn repair_targeted<E: EngineOps>(
    engine: &mut E,
    triage: &TriageResult,
    ordinal: u32,
    force: bool,
    outcome: &mut RepairOutcome,
) -> EngineResult<()> {
    let pod = engine.cluster().instance_name(ordinal);

    if engine.is_protected(&pod) {
        return Err(EngineError::SafetyGate(format!(
            "{pod} is the current primary; the primary cannot be healed. Switch it over first."
        )));
    }

    let assessment = triage.assessment(&pod).ok_or_else(|| {
        EngineError::Validation(format!(
            "{pod} is not among the triaged instances; check the cluster name and instance number"
        ))
    })?;

    if !triage.comparison.safe_to_heal {
        if !force {
            return Err(EngineError::SafetyGate(format!(
                "split brain detected; healing {pod} may destroy diverged data. \
                 Re-run with --force to override."
            )));
        }
        warn!(pod = %pod, "force: proceeding despite split brain, local data will be destroyed");
    }

    if !assessment.needs_heal {
        if !force {
            info!(pod = %pod, "instance is healthy; nothing to do");
            outcome.skipped_instances.push(pod);
            return Ok(());
        }
        warn!(pod = %pod, "force: healing an instance that appears healthy");
    }

    engine.verify_heal_target(&pod).await?;
    engine.heal_instance(&pod, ordinal).await?;
    outcome.healed_instances.push(pod);
    Ok(())
}

async fn repair_untargeted<E: EngineOps>(
    engine: &mut E,
    triage: &TriageResult,
    outcome: &mut RepairOutcome,
) -> EngineResult<()> {
    // Untargeted plus split brain is a hard stop with no override: the
    // operator must pick instances one at a time.
    if !triage.comparison.safe_to_heal {
        return Err(EngineError::SafetyGate(
            "split brain detected; refusing to heal all instances automatically. \
             Review the triage output, then repair one instance at a time with --instance."
                .to_owned(),
        ));
    }

    let mut targets = Vec::new();
    for assessment in &triage.assessments {
        if assessment.needs_heal {
            targets.push((assessment.pod.clone(), assessment.ordinal));
        } else {
            outcome.skipped_instances.push(assessment.pod.clone());
        }
    }

    if targets.is_empty() {
        info!("all instances are healthy; nothing to heal");
        return Ok(());
    }
    info!(
        targets = %targets.iter().map(|(pod, _)| pod.as_str()).collect::<Vec<_>>().join(", "),
        "repair plan"
    );

    for (pod, ordinal) in targets {
        let ordinal = ordinal.ok_or_else(|| {
            EngineError::Validation(format!("cannot derive the instance ordinal from {pod}"))
        })?;
        engine.verify_heal_target(&pod).await?;
        engine.heal_instance(&pod, ordinal).await?;
        outcome.healed_instances.push(pod);
    }

    // Phase 5: stabilization and re-triage.
    info!("waiting for the operator to reconcile");
    engine.ctx().sleep(STABILIZE_WAIT).await?;
    engine.await_all_ready().await?;
    engine.refresh().await?;
    match engine.triage().await {
        Ok(post) => outcome.post_triage = Some(post),
        Err(error) => warn!(%error, "post-repair re-triage failed"),
    }
    Ok(())
}
