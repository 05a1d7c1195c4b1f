// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Snapshot retention.
//!
//! The standard path delegates to the archiver's built-in keep-* handling;
//! the group-aware path implemented here treats all snapshots sharing a
//! `job` tag as one atomic unit, so "keep the last 3" means the last three
//! repair jobs regardless of how many instances each captured.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{snapshot::Snapshot, tags, Archive, ArchiveResult, TagMap};

/// How many snapshots (or job groups) to keep per dimension. A zero
/// dimension is inactive; the all-zero policy keeps everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_last: u32,
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
}

impl RetentionPolicy {
    pub fn new(keep_last: u32, keep_daily: u32, keep_weekly: u32, keep_monthly: u32) -> Self {
        Self {
            keep_last,
            keep_daily,
            keep_weekly,
            keep_monthly,
        }
    }

    /// All dimensions inactive: everything is kept.
    pub fn is_inactive(&self) -> bool {
        *self == Self::default()
    }
}

/// One tag group of the archiver's `forget --json` output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgetGroup {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub keep: Vec<Snapshot>,
    #[serde(default)]
    pub remove: Vec<Snapshot>,
}

/// A set of snapshots produced by one job (shared `job` tag). Snapshots
/// without a `job` tag each form a singleton group keyed by their short id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobGroup {
    pub job_id: String,
    /// Representative timestamp; all members share it by construction since
    /// every snapshot of a job carries the job-start time.
    pub time: DateTime<Utc>,
    pub snapshots: Vec<Snapshot>,
}

/// Partitions snapshots into job groups, sorted newest first.
pub fn group_by_job(snapshots: Vec<Snapshot>) -> Vec<JobGroup> {
    let mut groups: Vec<JobGroup> = Vec::new();
    for snapshot in snapshots {
        let job_id = snapshot
            .tag(tags::JOB)
            .unwrap_or_else(|| format!("adhoc-{}", snapshot.short_id));
        if let Some(group) = groups.iter_mut().find(|group| group.job_id == job_id) {
            group.snapshots.push(snapshot);
        } else {
            groups.push(JobGroup {
                job_id,
                time: snapshot.time,
                snapshots: vec![snapshot],
            });
        }
    }
    groups.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| a.job_id.cmp(&b.job_id)));
    groups
}

/// Applies the keep-* policy to job groups as atomic units.
///
/// Returns `(kept, removed)`. Keep-last marks the newest N groups; the
/// daily/weekly/monthly dimensions walk newest-first and mark the first
/// group per distinct UTC calendar date / ISO year-week / calendar month,
/// up to their budget. An inactive (all-zero) policy keeps everything.
pub fn apply_group_retention(
    groups: Vec<JobGroup>,
    policy: RetentionPolicy,
) -> (Vec<JobGroup>, Vec<JobGroup>) {
    if groups.is_empty() {
        return (Vec::new(), Vec::new());
    }
    if policy.is_inactive() {
        return (groups, Vec::new());
    }

    let mut keep: Vec<bool> = vec![false; groups.len()];

    for (index, _) in groups.iter().enumerate().take(policy.keep_last as usize) {
        keep[index] = true;
    }

    mark_first_per_window(&groups, &mut keep, policy.keep_daily, |time| {
        time.format("%Y-%m-%d").to_string()
    });
    mark_first_per_window(&groups, &mut keep, policy.keep_weekly, |time| {
        let week = time.iso_week();
        format!("{}-W{:02}", week.year(), week.week())
    });
    mark_first_per_window(&groups, &mut keep, policy.keep_monthly, |time| {
        time.format("%Y-%m").to_string()
    });

    let mut kept = Vec::new();
    let mut removed = Vec::new();
    for (group, keep) in groups.into_iter().zip(keep) {
        if keep {
            kept.push(group);
        } else {
            removed.push(group);
        }
    }
    (kept, removed)
}

/// Walks groups newest-first and marks the first group of each distinct
/// window, up to `budget` windows.
fn mark_first_per_window(
    groups: &[JobGroup],
    keep: &mut [bool],
    budget: u32,
    window: impl Fn(&DateTime<Utc>) -> String,
) {
    if budget == 0 {
        return;
    }
    let mut windows_seen = 0u32;
    let mut last_window: Option<String> = None;
    for (index, group) in groups.iter().enumerate() {
        let current = window(&group.time);
        if last_window.as_ref() == Some(&current) {
            continue;
        }
        last_window = Some(current);
        windows_seen += 1;
        if windows_seen > budget {
            break;
        }
        keep[index] = true;
    }
}

/// Outcome of a group-aware retention run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupRetentionOutcome {
    pub kept_snapshots: usize,
    pub removed_snapshots: usize,
}

/// Runs group-aware retention against the archive: lists the snapshots
/// matching `filter`, partitions them into job groups, applies the policy,
/// and removes every snapshot of every removed group (followed by an
/// optional prune).
pub async fn forget_grouped(
    archive: &dyn Archive,
    filter: &TagMap,
    policy: RetentionPolicy,
    prune: bool,
) -> ArchiveResult<GroupRetentionOutcome> {
    let snapshots = archive.snapshots(filter).await?;
    let groups = group_by_job(snapshots);
    let (kept, removed) = apply_group_retention(groups, policy);

    let mut outcome = GroupRetentionOutcome {
        kept_snapshots: kept.iter().map(|group| group.snapshots.len()).sum(),
        removed_snapshots: 0,
    };

    for group in &removed {
        info!(job = %group.job_id, snapshots = group.snapshots.len(), "removing job group");
        for snapshot in &group.snapshots {
            archive.forget_snapshot(&snapshot.id).await?;
            outcome.removed_snapshots += 1;
        }
    }

    if prune && outcome.removed_snapshots > 0 {
        archive.prune().await?;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use hasteward_test_utils::param_test;

    use super::*;

    fn snapshot(short_id: &str, time: DateTime<Utc>, job: Option<&str>) -> Snapshot {
        let mut tags = vec!["engine=postgres".to_owned(), "type=diverged".to_owned()];
        if let Some(job) = job {
            tags.push(format!("job={job}"));
        }
        Snapshot {
            id: format!("{short_id}ffffffff"),
            short_id: short_id.to_owned(),
            time,
            hostname: String::new(),
            tags,
            paths: Vec::new(),
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    /// Three jobs with two snapshots each, newest first J1 > J2 > J3.
    fn three_jobs() -> Vec<Snapshot> {
        vec![
            snapshot("a1", at(5, 12), Some("J1")),
            snapshot("a2", at(5, 12), Some("J1")),
            snapshot("b1", at(4, 12), Some("J2")),
            snapshot("b2", at(4, 12), Some("J2")),
            snapshot("c1", at(3, 12), Some("J3")),
            snapshot("c2", at(3, 12), Some("J3")),
        ]
    }

    #[test]
    fn keep_last_counts_jobs_not_snapshots() {
        let groups = group_by_job(three_jobs());
        let (kept, removed) = apply_group_retention(groups, RetentionPolicy::new(2, 0, 0, 0));

        let kept_ids: Vec<&str> = kept.iter().map(|group| group.job_id.as_str()).collect();
        assert_eq!(kept_ids, ["J1", "J2"]);
        assert_eq!(kept.iter().map(|g| g.snapshots.len()).sum::<usize>(), 4);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].job_id, "J3");
        assert_eq!(removed[0].snapshots.len(), 2);
    }

    #[test]
    fn keep_daily_marks_first_group_per_date() {
        // Two groups on Jan 1, then one each on Jan 2, 3, 4.
        let snapshots = vec![
            snapshot("e1", at(4, 8), Some("J5")),
            snapshot("d1", at(3, 8), Some("J4")),
            snapshot("c1", at(2, 8), Some("J3")),
            snapshot("b1", at(1, 14), Some("J2")),
            snapshot("a1", at(1, 8), Some("J1")),
        ];
        let groups = group_by_job(snapshots);
        let (kept, removed) = apply_group_retention(groups, RetentionPolicy::new(0, 2, 0, 0));

        // First-per-window: the newest group of Jan 4 and of Jan 3.
        let kept_ids: Vec<&str> = kept.iter().map(|group| group.job_id.as_str()).collect();
        assert_eq!(kept_ids, ["J5", "J4"]);
        assert_eq!(removed.len(), 3);
    }

    #[test]
    fn keep_weekly_uses_iso_weeks() {
        // 2024-01-05 is week 1; 2024-01-10 is week 2; 2024-01-17 week 3.
        let snapshots = vec![
            snapshot("c1", Utc.with_ymd_and_hms(2024, 1, 17, 9, 0, 0).unwrap(), Some("J3")),
            snapshot("b1", Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap(), Some("J2")),
            snapshot("a1", Utc.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).unwrap(), Some("J1")),
        ];
        let groups = group_by_job(snapshots);
        let (kept, _) = apply_group_retention(groups, RetentionPolicy::new(0, 0, 2, 0));
        let kept_ids: Vec<&str> = kept.iter().map(|group| group.job_id.as_str()).collect();
        assert_eq!(kept_ids, ["J3", "J2"]);
    }

    #[test]
    fn all_zero_policy_keeps_everything() {
        let groups = group_by_job(three_jobs());
        let (kept, removed) = apply_group_retention(groups, RetentionPolicy::default());
        assert_eq!(kept.len(), 3);
        assert!(removed.is_empty());
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let (kept, removed) = apply_group_retention(Vec::new(), RetentionPolicy::new(1, 0, 0, 0));
        assert!(kept.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn groups_are_atomic_under_every_policy() {
        let snapshots = three_jobs();
        for policy in [
            RetentionPolicy::new(1, 0, 0, 0),
            RetentionPolicy::new(0, 1, 0, 0),
            RetentionPolicy::new(0, 0, 1, 0),
            RetentionPolicy::new(0, 0, 0, 1),
            RetentionPolicy::new(2, 1, 1, 1),
        ] {
            let (kept, removed) = apply_group_retention(group_by_job(snapshots.clone()), policy);
            for group in kept.iter().chain(removed.iter()) {
                // Every snapshot of the original job stayed with its group.
                assert_eq!(group.snapshots.len(), 2, "policy {policy:?} split a group");
            }
        }
    }

    param_test! {
        increasing_a_dimension_never_shrinks_the_kept_set: [
            keep_last: (RetentionPolicy::new(1, 0, 0, 0), RetentionPolicy::new(2, 0, 0, 0)),
            keep_daily: (RetentionPolicy::new(0, 1, 0, 0), RetentionPolicy::new(0, 2, 0, 0)),
            keep_monthly: (RetentionPolicy::new(1, 1, 0, 0), RetentionPolicy::new(1, 1, 0, 1)),
        ]
    }
    fn increasing_a_dimension_never_shrinks_the_kept_set(
        narrow: RetentionPolicy,
        wide: RetentionPolicy,
    ) {
        let snapshots = vec![
            snapshot("e1", at(9, 8), Some("J5")),
            snapshot("d1", at(7, 8), Some("J4")),
            snapshot("c1", at(5, 8), Some("J3")),
            snapshot("b1", at(3, 8), Some("J2")),
            snapshot("a1", at(1, 8), Some("J1")),
        ];
        let (kept_narrow, _) = apply_group_retention(group_by_job(snapshots.clone()), narrow);
        let (kept_wide, _) = apply_group_retention(group_by_job(snapshots), wide);

        let narrow_ids: Vec<String> = kept_narrow.into_iter().map(|group| group.job_id).collect();
        let wide_ids: Vec<String> = kept_wide.into_iter().map(|group| group.job_id).collect();
        for id in &narrow_ids {
            assert!(wide_ids.contains(id), "{id} was dropped by the wider policy");
        }
    }

    #[test]
    fn untagged_snapshots_form_singleton_groups() {
        let snapshots = vec![
            snapshot("a1", at(5, 12), None),
            snapshot("b1", at(4, 12), None),
            snapshot("c1", at(4, 10), Some("J1")),
            snapshot("c2", at(4, 10), Some("J1")),
        ];
        let groups = group_by_job(snapshots);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].job_id, "adhoc-a1");
        assert_eq!(groups[0].snapshots.len(), 1);
        assert_eq!(groups[2].job_id, "J1");
        assert_eq!(groups[2].snapshots.len(), 2);
    }
}
