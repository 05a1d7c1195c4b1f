// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! hasteward command line entry point.
//!
//! All behavior lives in the library crates; this binary only parses flags,
//! wires the platform and archive clients into an [`EngineContext`], and
//! prints outcomes.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use chrono::Utc;
use hasteward_archive::{retention, tags, ArchiveClient, RetentionPolicy, TagMap};
use hasteward_core::{ClusterRef, EngineKind};
use hasteward_platform::kubernetes::KubePlatform;
use hasteward_service::{
    redact::register_secret, Engine, EngineContext, StewardConfig,
};
use tracing_subscriber::EnvFilter;

/// HASteward: triage, repair, backup, and restore for database clusters
/// run by the CNPG and MariaDB operators.
#[derive(Parser, Debug)]
#[command(name = "hasteward", version, rename_all = "kebab-case")]
struct Opts {
    /// Path to a kubeconfig file; defaults to standard resolution.
    #[arg(long, env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Verbose (debug) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct TargetArgs {
    /// Database engine: postgres or galera.
    #[arg(short, long, env = "HASTEWARD_ENGINE")]
    engine: EngineKind,

    /// Database cluster resource name.
    #[arg(short, long, env = "HASTEWARD_CLUSTER")]
    cluster: String,

    /// Namespace of the cluster.
    #[arg(short, long, env = "HASTEWARD_NAMESPACE")]
    namespace: String,
}

impl TargetArgs {
    fn cluster_ref(&self) -> ClusterRef {
        ClusterRef::new(self.engine, self.namespace.clone(), self.cluster.clone())
    }
}

#[derive(Args, Debug, Clone)]
struct RepoArgs {
    /// Archive repository path or URL.
    #[arg(long, env = "HASTEWARD_REPOSITORY")]
    repository: Option<String>,

    /// Repository encryption password.
    #[arg(long, env = "RESTIC_PASSWORD", hide_env_values = true)]
    repository_password: Option<String>,
}

impl RepoArgs {
    fn archive(&self) -> Option<Arc<dyn hasteward_archive::Archive>> {
        let repository = self.repository.clone()?;
        let password = self.repository_password.clone()?;
        register_secret(password.clone());
        Some(Arc::new(ArchiveClient::new(repository, password)))
    }

    fn require_archive(&self) -> anyhow::Result<ArchiveClient> {
        let repository = self
            .repository
            .clone()
            .context("--repository is required")?;
        let password = self
            .repository_password
            .clone()
            .context("the repository password is required (RESTIC_PASSWORD)")?;
        register_secret(password.clone());
        Ok(ArchiveClient::new(repository, password))
    }
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Target a single instance ordinal.
    #[arg(short, long, env = "HASTEWARD_INSTANCE")]
    instance: Option<u32>,

    /// Override the safety gates (targeted repair only).
    #[arg(short, long)]
    force: bool,

    /// Skip the pre-repair escrow backup.
    #[arg(long)]
    no_escrow: bool,

    /// Snapshot id, or "latest".
    #[arg(long, default_value = "latest")]
    snapshot: String,

    /// Heal wait budget in seconds.
    #[arg(long, default_value_t = 600)]
    heal_timeout: u64,

    /// Pod-deletion wait budget in seconds.
    #[arg(long, default_value_t = 300)]
    delete_timeout: u64,
}

impl RunArgs {
    fn config(&self) -> StewardConfig {
        StewardConfig {
            instance: self.instance,
            force: self.force,
            no_escrow: self.no_escrow,
            snapshot: self.snapshot.clone(),
            heal_timeout: Duration::from_secs(self.heal_timeout),
            delete_timeout: Duration::from_secs(self.delete_timeout),
        }
    }
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Read-only diagnostics for a cluster.
    Triage {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Heal unhealthy instances (escrow backup, safety gates, rebuild).
    Repair {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        run: RunArgs,
    },

    /// Stream a dump of the cluster into the archive repository.
    Backup {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        repo: RepoArgs,
    },

    /// Restore a cluster from an archived dump.
    Restore {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        run: RunArgs,
    },

    /// List archived snapshots for a cluster.
    Snapshots {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        repo: RepoArgs,
        /// Filter by snapshot type: backup, diverged, or all.
        #[arg(short = 't', long = "type", default_value = "all")]
        type_filter: String,
    },

    /// Extract an archived dump into a local file.
    Export {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        repo: RepoArgs,
        /// Snapshot id, or "latest".
        #[arg(long, default_value = "latest")]
        snapshot: String,
        /// Instance ordinal, for diverged snapshots.
        #[arg(short, long)]
        instance: Option<u32>,
        /// Output file path.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Repository maintenance: verify, unlock, or show statistics.
    Repo {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(subcommand)]
        action: RepoAction,
    },

    /// Apply the retention policy and remove old snapshots.
    Prune {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        repo: RepoArgs,
        /// Snapshot type to prune: backup, diverged, or all. Diverged
        /// snapshots are pruned group-aware: snapshots sharing one repair
        /// job are kept or removed as a unit.
        #[arg(short = 't', long = "type", default_value = "backup")]
        type_filter: String,
        #[arg(long, default_value_t = 7)]
        keep_last: u32,
        #[arg(long, default_value_t = 30)]
        keep_daily: u32,
        #[arg(long, default_value_t = 12)]
        keep_weekly: u32,
        #[arg(long, default_value_t = 24)]
        keep_monthly: u32,
    },
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum RepoAction {
    /// Verify repository integrity.
    Check,
    /// Remove stale repository locks.
    Unlock,
    /// Show repository statistics.
    Stats,
}

fn cluster_tags(target: &TargetArgs) -> TagMap {
    let mut map = TagMap::new();
    map.insert(tags::ENGINE.to_owned(), target.engine.as_str().to_owned());
    map.insert(tags::CLUSTER.to_owned(), target.cluster.clone());
    map.insert(tags::NAMESPACE.to_owned(), target.namespace.clone());
    map
}

async fn connect_engine(
    target: &TargetArgs,
    archive: Option<Arc<dyn hasteward_archive::Archive>>,
    config: StewardConfig,
    kubeconfig: Option<&PathBuf>,
) -> anyhow::Result<Engine> {
    let platform = KubePlatform::connect(kubeconfig.map(PathBuf::as_path))
        .await
        .context("failed to connect to the cluster platform")?;
    let ctx = EngineContext::new(
        target.cluster_ref(),
        Arc::new(platform),
        archive,
        config,
    );

    // Cancel the running operation on Ctrl-C; the engines run their rescue
    // paths before returning.
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling");
            cancel.cancel();
        }
    });

    Engine::connect(ctx).await.map_err(Into::into)
}

fn age(duration: chrono::Duration) -> String {
    let seconds = duration.num_seconds().max(0);
    match seconds {
        0..=119 => format!("{seconds}s"),
        120..=7199 => format!("{}m", seconds / 60),
        7200..=172_799 => format!("{}h", seconds / 3600),
        _ => format!("{}d", seconds / 86_400),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let default_level = if opts.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match opts.command {
        Command::Triage { target } => {
            let mut engine =
                connect_engine(&target, None, StewardConfig::default(), opts.kubeconfig.as_ref())
                    .await?;
            let result = engine.triage().await?;
            println!();
            for assessment in &result.assessments {
                let role = if assessment.is_primary() { " [primary]" } else { "" };
                println!("{}{}: {}", assessment.pod, role, assessment.notes.join(", "));
                println!("  >> {}", assessment.recommendation);
            }
            println!();
            if result.comparison.safe_to_heal {
                println!("safe to heal: yes");
            } else {
                println!("safe to heal: NO — split brain suspected; review before any repair");
            }
            Ok(())
        }

        Command::Repair { target, repo, run } => {
            let config = run.config();
            if !config.no_escrow && (repo.repository.is_none() || repo.repository_password.is_none())
            {
                anyhow::bail!(
                    "repair requires --repository and the repository password for the escrow \
                     backup (or --no-escrow to skip)"
                );
            }
            let mut engine =
                connect_engine(&target, repo.archive(), config, opts.kubeconfig.as_ref()).await?;
            let outcome = engine.repair().await?;
            println!(
                "repair complete: healed {} instance(s), skipped {} ({}s)",
                outcome.healed_instances.len(),
                outcome.skipped_instances.len(),
                outcome.duration.as_secs()
            );
            Ok(())
        }

        Command::Backup { target, repo } => {
            repo.require_archive()?;
            let mut engine = connect_engine(
                &target,
                repo.archive(),
                StewardConfig::default(),
                opts.kubeconfig.as_ref(),
            )
            .await?;
            let outcome = engine.backup().await?;
            println!(
                "backup complete: snapshot {} ({} bytes processed, {}s)",
                outcome.snapshot_id,
                outcome.size_bytes,
                outcome.duration.as_secs()
            );
            Ok(())
        }

        Command::Restore { target, repo, run } => {
            repo.require_archive()?;
            let mut engine =
                connect_engine(&target, repo.archive(), run.config(), opts.kubeconfig.as_ref())
                    .await?;
            let outcome = engine.restore().await?;
            println!(
                "restore complete: snapshot {} ({}s)",
                outcome.snapshot_id,
                outcome.duration.as_secs()
            );
            Ok(())
        }

        Command::Snapshots {
            target,
            repo,
            type_filter,
        } => {
            let archive = repo.require_archive()?;
            let mut filter = cluster_tags(&target);
            if type_filter != "all" {
                filter.insert(tags::TYPE.to_owned(), type_filter);
            }
            let snapshots = hasteward_archive::Archive::snapshots(&archive, &filter).await?;
            println!(
                "{:<12} {:<10} {:<10} {:<22} {:>6}  PATH",
                "SNAPSHOT", "TYPE", "JOB", "TIME", "AGE"
            );
            for snapshot in snapshots {
                let tag_map = snapshot.tag_map();
                println!(
                    "{:<12} {:<10} {:<10} {:<22} {:>6}  {}",
                    snapshot.short_id,
                    tag_map.get("type").map_or("-", String::as_str),
                    tag_map.get("job").map_or("-", String::as_str),
                    snapshot.time.format("%Y-%m-%d %H:%M:%S"),
                    age(Utc::now() - snapshot.time),
                    snapshot.paths.join(","),
                );
            }
            Ok(())
        }

        Command::Export {
            target,
            repo,
            snapshot,
            instance,
            output,
        } => {
            let archive = repo.require_archive()?;
            let cluster = target.cluster_ref();
            let virtual_path = match instance {
                Some(ordinal) => cluster.diverged_dump_path(ordinal),
                None => cluster.dump_path(),
            };
            let file = tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("failed to create {}", output.display()))?;
            hasteward_archive::Archive::dump(
                &archive,
                &snapshot,
                &virtual_path,
                Box::pin(file),
                &cluster_tags(&target),
            )
            .await?;
            println!("exported {virtual_path} from {snapshot} to {}", output.display());
            Ok(())
        }

        Command::Repo { repo, action } => {
            let archive = repo.require_archive()?;
            match action {
                RepoAction::Check => {
                    archive.check().await?;
                    println!("repository integrity verified");
                }
                RepoAction::Unlock => {
                    archive.unlock().await?;
                    println!("stale repository locks removed");
                }
                RepoAction::Stats => {
                    let stats = archive.stats().await?;
                    println!(
                        "repository holds {} file(s), {} bytes",
                        stats.total_file_count, stats.total_size
                    );
                }
            }
            Ok(())
        }

        Command::Prune {
            target,
            repo,
            type_filter,
            keep_last,
            keep_daily,
            keep_weekly,
            keep_monthly,
        } => {
            if !matches!(type_filter.as_str(), "backup" | "diverged" | "all") {
                anyhow::bail!("--type must be backup, diverged, or all (got {type_filter:?})");
            }
            let archive = repo.require_archive()?;
            let policy = RetentionPolicy::new(keep_last, keep_daily, keep_weekly, keep_monthly);
            let base = cluster_tags(&target);
            let mut kept = 0usize;
            let mut removed = 0usize;

            if type_filter == "backup" || type_filter == "all" {
                let mut filter: BTreeMap<String, String> = base.clone();
                filter.insert(tags::TYPE.to_owned(), tags::TYPE_BACKUP.to_owned());
                let groups = hasteward_archive::Archive::forget(
                    &archive,
                    &filter,
                    policy,
                    type_filter == "backup",
                )
                .await?;
                for group in groups {
                    kept += group.keep.len();
                    removed += group.remove.len();
                }
            }

            if type_filter == "diverged" || type_filter == "all" {
                let mut filter = base.clone();
                filter.insert(tags::TYPE.to_owned(), tags::TYPE_DIVERGED.to_owned());
                let outcome = retention::forget_grouped(&archive, &filter, policy, true).await?;
                kept += outcome.kept_snapshots;
                removed += outcome.removed_snapshots;
            }

            println!("pruned {removed} snapshot(s), kept {kept}");
            Ok(())
        }
    }
}
