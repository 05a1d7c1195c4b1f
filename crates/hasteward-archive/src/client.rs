// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Subprocess wrapper around the archiver binary.

use std::{collections::BTreeMap, process::Stdio};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::Command,
};
use tracing::{debug, trace};

use crate::{
    error::{ArchiveError, ArchiveResult},
    retention::{ForgetGroup, RetentionPolicy},
    snapshot::Snapshot,
    Archive, DumpReader, DumpWriter, TagMap,
};

/// Environment variable carrying the repository location.
const ENV_REPOSITORY: &str = "RESTIC_REPOSITORY";
/// Environment variable carrying the repository encryption password.
const ENV_PASSWORD: &str = "RESTIC_PASSWORD";

/// Result of a `backup --stdin` run, from the archiver's final summary
/// message.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BackupSummary {
    pub snapshot_id: String,
    #[serde(default)]
    pub files_new: u64,
    #[serde(default)]
    pub files_changed: u64,
    #[serde(default)]
    pub data_added: u64,
    #[serde(default, rename = "total_bytes_processed")]
    pub total_size: u64,
    #[serde(default)]
    pub total_duration: f64,
}

/// Client for the external chunking archiver.
#[derive(Debug, Clone)]
pub struct ArchiveClient {
    binary: String,
    repository: String,
    password: String,
    /// Additional environment, e.g. object-store credentials.
    extra_env: BTreeMap<String, String>,
}

impl ArchiveClient {
    pub fn new(repository: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            binary: "restic".to_owned(),
            repository: repository.into(),
            password: password.into(),
            extra_env: BTreeMap::new(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.extra_env = env;
        self
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .env(ENV_REPOSITORY, &self.repository)
            .env(ENV_PASSWORD, &self.password)
            .envs(&self.extra_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    /// Runs an archiver command to completion and returns its stdout.
    async fn run(&self, args: &[String]) -> ArchiveResult<Vec<u8>> {
        let operation = args.first().cloned().unwrap_or_default();
        debug!(binary = %self.binary, %operation, "running archiver command");
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|source| ArchiveError::Spawn {
                operation: operation.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ArchiveError::command_failed(
                &operation,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        Ok(output.stdout)
    }

    fn parse_json<T: serde::de::DeserializeOwned>(
        operation: &str,
        raw: &[u8],
    ) -> ArchiveResult<T> {
        serde_json::from_slice(raw).map_err(|source| ArchiveError::Parse {
            operation: operation.to_owned(),
            source,
        })
    }
}

/// One `--tag key=value` flag per pair, for writing snapshot tags.
pub fn tag_args(tags: &TagMap) -> Vec<String> {
    tags.iter()
        .flat_map(|(key, value)| ["--tag".to_owned(), format!("{key}={value}")])
        .collect()
}

/// A single comma-joined `--tag` flag, for AND-filtered reads.
pub fn tag_filter_args(tags: &TagMap) -> Vec<String> {
    if tags.is_empty() {
        return Vec::new();
    }
    let joined = tags
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",");
    vec!["--tag".to_owned(), joined]
}

/// The archiver's `--time` format (UTC, second precision).
fn archiver_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parses one line of `backup --json` output, returning the summary if this
/// line is the final summary message.
pub fn parse_summary_line(line: &str) -> Option<BackupSummary> {
    #[derive(Deserialize)]
    struct Envelope {
        message_type: String,
    }
    let envelope: Envelope = serde_json::from_str(line).ok()?;
    if envelope.message_type != "summary" {
        return None;
    }
    serde_json::from_str(line).ok()
}

#[async_trait]
impl Archive for ArchiveClient {
    fn location(&self) -> String {
        self.repository.clone()
    }

    async fn init(&self) -> ArchiveResult<()> {
        match self.run(&["init".to_owned()]).await {
            Ok(_) => Ok(()),
            // Idempotent: an existing repository is success.
            Err(ArchiveError::CommandFailed { stderr, .. })
                if stderr.contains("already initialized") || stderr.contains("already exists") =>
            {
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn snapshots(&self, filter: &TagMap) -> ArchiveResult<Vec<Snapshot>> {
        let mut args = vec!["snapshots".to_owned(), "--json".to_owned()];
        args.extend(tag_filter_args(filter));
        let raw = self.run(&args).await?;
        Self::parse_json("snapshots", &raw)
    }

    async fn backup_stdin(
        &self,
        mut reader: DumpReader,
        stdin_filename: &str,
        tags: &TagMap,
        time: DateTime<Utc>,
    ) -> ArchiveResult<BackupSummary> {
        let mut args = vec![
            "backup".to_owned(),
            "--stdin".to_owned(),
            "--stdin-filename".to_owned(),
            stdin_filename.to_owned(),
            "--json".to_owned(),
            "--time".to_owned(),
            archiver_time(time),
        ];
        args.extend(tag_args(tags));

        let mut command = self.command(&args);
        command.stdin(Stdio::piped());
        let mut child = command.spawn().map_err(|source| ArchiveError::Spawn {
            operation: "backup".to_owned(),
            source,
        })?;

        let mut child_stdin = child.stdin.take().expect("stdin was requested piped");
        let child_stdout = child.stdout.take().expect("stdout was requested piped");
        let mut child_stderr = child.stderr.take().expect("stderr was requested piped");

        // Feed the dump into the archiver. A write failure here usually
        // means the archiver died; its exit status is the better error, so
        // the copy result is only surfaced when the archiver looks healthy.
        let feed = async {
            let copied = tokio::io::copy(&mut reader, &mut child_stdin).await;
            let _ = child_stdin.shutdown().await;
            drop(child_stdin);
            copied
        };

        let scan_messages = async {
            let mut summary = None;
            let mut lines = BufReader::new(child_stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(parsed) = parse_summary_line(&line) {
                    summary = Some(parsed);
                } else {
                    trace!(message = %line, "archiver progress");
                }
            }
            summary
        };

        let drain_stderr = async {
            let mut buffer = Vec::new();
            let _ = child_stderr.read_to_end(&mut buffer).await;
            String::from_utf8_lossy(&buffer).into_owned()
        };

        let (fed, summary, stderr_text) = tokio::join!(feed, scan_messages, drain_stderr);

        let status = child.wait().await.map_err(|source| ArchiveError::Stream {
            operation: "backup".to_owned(),
            source,
        })?;
        if !status.success() {
            return Err(ArchiveError::command_failed(
                "backup",
                status.code(),
                stderr_text.trim(),
            ));
        }
        if let Err(source) = fed {
            return Err(ArchiveError::Stream {
                operation: "backup".to_owned(),
                source,
            });
        }
        summary.ok_or(ArchiveError::MissingSummary)
    }

    async fn dump(
        &self,
        snapshot: &str,
        path: &str,
        mut writer: DumpWriter,
        filter: &TagMap,
    ) -> ArchiveResult<()> {
        let mut args = vec!["dump".to_owned()];
        args.extend(tag_filter_args(filter));
        args.push(snapshot.to_owned());
        args.push(path.to_owned());

        let mut child = self
            .command(&args)
            .spawn()
            .map_err(|source| ArchiveError::Spawn {
                operation: "dump".to_owned(),
                source,
            })?;
        let mut child_stdout = child.stdout.take().expect("stdout was requested piped");
        let mut child_stderr = child.stderr.take().expect("stderr was requested piped");

        let relay = async {
            let copied = tokio::io::copy(&mut child_stdout, &mut writer).await;
            let _ = writer.shutdown().await;
            copied
        };
        let drain_stderr = async {
            let mut buffer = Vec::new();
            let _ = child_stderr.read_to_end(&mut buffer).await;
            String::from_utf8_lossy(&buffer).into_owned()
        };
        let (relayed, stderr_text) = tokio::join!(relay, drain_stderr);

        let status = child.wait().await.map_err(|source| ArchiveError::Stream {
            operation: "dump".to_owned(),
            source,
        })?;
        if !status.success() {
            return Err(ArchiveError::command_failed(
                "dump",
                status.code(),
                stderr_text.trim(),
            ));
        }
        relayed.map_err(|source| ArchiveError::Stream {
            operation: "dump".to_owned(),
            source,
        })?;
        Ok(())
    }

    async fn forget(
        &self,
        filter: &TagMap,
        policy: RetentionPolicy,
        prune: bool,
    ) -> ArchiveResult<Vec<ForgetGroup>> {
        let mut args = vec!["forget".to_owned(), "--json".to_owned()];
        for (flag, value) in [
            ("--keep-last", policy.keep_last),
            ("--keep-daily", policy.keep_daily),
            ("--keep-weekly", policy.keep_weekly),
            ("--keep-monthly", policy.keep_monthly),
        ] {
            if value > 0 {
                args.push(flag.to_owned());
                args.push(value.to_string());
            }
        }
        args.extend(tag_filter_args(filter));
        if prune {
            args.push("--prune".to_owned());
        }
        let raw = self.run(&args).await?;
        Self::parse_json("forget", &raw)
    }

    async fn forget_snapshot(&self, id: &str) -> ArchiveResult<()> {
        self.run(&["forget".to_owned(), id.to_owned()]).await?;
        Ok(())
    }

    async fn prune(&self) -> ArchiveResult<()> {
        self.run(&["prune".to_owned()]).await?;
        Ok(())
    }
}

/// Repository maintenance surface, outside the [`Archive`] trait because
/// only the CLI reaches for it.
impl ArchiveClient {
    /// Verifies repository integrity.
    pub async fn check(&self) -> ArchiveResult<()> {
        self.run(&["check".to_owned()]).await?;
        Ok(())
    }

    /// Removes stale repository locks.
    pub async fn unlock(&self) -> ArchiveResult<()> {
        self.run(&["unlock".to_owned()]).await?;
        Ok(())
    }

    /// Repository statistics.
    pub async fn stats(&self) -> ArchiveResult<RepoStats> {
        let raw = self.run(&["stats".to_owned(), "--json".to_owned()]).await?;
        Self::parse_json("stats", &raw)
    }
}

/// Repository statistics from `stats --json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoStats {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_file_count: u64,
}
