// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Client for the external content-defined-chunking archive tool and the
//! snapshot retention engine built on top of it.
//!
//! The archiver (restic protocol) is consumed as a subprocess: repository
//! location and encryption password travel via environment variables,
//! structured results come back as JSON on stdout. The [`Archive`] trait
//! captures the operation subset the engines depend on so they can be tested
//! against an in-memory double.

use std::{collections::BTreeMap, pin::Pin};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};

pub mod client;
pub mod error;
pub mod retention;
pub mod snapshot;

pub use client::{ArchiveClient, BackupSummary};
pub use error::{ArchiveError, ArchiveResult};
pub use retention::{ForgetGroup, JobGroup, RetentionPolicy};
pub use snapshot::Snapshot;

/// Tag keys and values shared across all snapshots the steward writes.
pub mod tags {
    pub const ENGINE: &str = "engine";
    pub const CLUSTER: &str = "cluster";
    pub const NAMESPACE: &str = "namespace";
    pub const TYPE: &str = "type";
    pub const JOB: &str = "job";

    pub const TYPE_BACKUP: &str = "backup";
    pub const TYPE_DIVERGED: &str = "diverged";
}

/// A snapshot tag set or tag filter; ordered so generated argv is stable.
pub type TagMap = BTreeMap<String, String>;

/// Streaming reader fed into `backup --stdin`.
pub type DumpReader = Pin<Box<dyn AsyncRead + Send>>;

/// Streaming writer receiving `dump` output.
pub type DumpWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Formats the job identifier carried in the `job` tag of diverged
/// snapshots: the job-start timestamp as `YYYYMMDDTHHMMSSZ`.
pub fn job_id(job_start: DateTime<Utc>) -> String {
    job_start.format("%Y%m%dT%H%M%SZ").to_string()
}

/// The archive operations the engines consume.
#[async_trait]
pub trait Archive: Send + Sync {
    /// Human-readable repository location, for reporting.
    fn location(&self) -> String;

    /// Creates the repository; succeeds if it already exists.
    async fn init(&self) -> ArchiveResult<()>;

    /// Lists snapshots whose tags contain every `key=value` pair of the
    /// filter (AND semantics).
    async fn snapshots(&self, filter: &TagMap) -> ArchiveResult<Vec<Snapshot>>;

    /// Streams `reader` into a new snapshot under the virtual path
    /// `stdin_filename`, tagged with `tags` and timestamped `time`.
    async fn backup_stdin(
        &self,
        reader: DumpReader,
        stdin_filename: &str,
        tags: &TagMap,
        time: DateTime<Utc>,
    ) -> ArchiveResult<BackupSummary>;

    /// Extracts one file from the snapshot (id or `"latest"`, scoped by the
    /// tag filter) into `writer`.
    async fn dump(
        &self,
        snapshot: &str,
        path: &str,
        writer: DumpWriter,
        filter: &TagMap,
    ) -> ArchiveResult<()>;

    /// Applies the archiver's built-in keep-* retention.
    async fn forget(
        &self,
        filter: &TagMap,
        policy: RetentionPolicy,
        prune: bool,
    ) -> ArchiveResult<Vec<ForgetGroup>>;

    /// Removes a single snapshot by exact id.
    async fn forget_snapshot(&self, id: &str) -> ArchiveResult<()>;

    /// Physically removes unreferenced data.
    async fn prune(&self) -> ArchiveResult<()>;
}
