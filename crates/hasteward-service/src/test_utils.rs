// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! In-memory doubles of the platform and the archive for engine tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hasteward_archive::{
    Archive, ArchiveError, ArchiveResult, BackupSummary, DumpReader, DumpWriter, ForgetGroup,
    RetentionPolicy, Snapshot, TagMap,
};
use hasteward_core::evidence::PodPhase;
use hasteward_platform::{
    ExecOutput, ExecWaiter, OutputReader, Platform, PlatformError, PlatformResult, ResourceKind,
};
use k8s_openapi::api::core::v1::Pod;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// One scripted exec response: matches a pod plus a substring of the joined
/// command line.
pub struct ExecRule {
    pub pod: String,
    pub command_contains: String,
    pub result: Result<String, String>,
}

/// A scripted `exec_pipe_out` stream for one pod.
pub struct PipeRule {
    pub stdout: Vec<u8>,
    /// When set, the waiter reports this as the remote failure.
    pub error: Option<String>,
}

#[derive(Default)]
pub struct MockPlatformState {
    pub resources: HashMap<(ResourceKind, String, String), Value>,
    pub exec_rules: Vec<ExecRule>,
    pub pipe_rules: HashMap<String, PipeRule>,
    pub logs: HashMap<String, String>,
    pub secrets: HashMap<(String, String), Vec<u8>>,
    /// Scripted pod phases by pod-name prefix; the last entry repeats.
    pub pod_phases: Vec<(String, VecDeque<Option<PodPhase>>)>,
    /// Fired after the first `scale` call, to test cancellation landing in
    /// the middle of a mutation sequence.
    pub cancel_on_scale: Option<CancellationToken>,

    pub patches: Vec<(ResourceKind, String, Value)>,
    pub scales: Vec<(String, i32)>,
    pub created_pods: Vec<String>,
    pub deleted_pods: Vec<String>,
    pub streamed_stdins: Vec<(String, Vec<u8>)>,
}

/// An in-memory [`Platform`]: resources are JSON values, merge patches are
/// applied for real, and every mutation is recorded for assertions.
#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<MockPlatformState>,
}

impl MockPlatform {
    pub fn state(&self) -> MutexGuard<'_, MockPlatformState> {
        self.state.lock().expect("mock platform lock poisoned")
    }

    pub fn insert_resource(&self, kind: ResourceKind, namespace: &str, name: &str, value: Value) {
        self.state()
            .resources
            .insert((kind, namespace.to_owned(), name.to_owned()), value);
    }

    pub fn add_exec(&self, pod: &str, command_contains: &str, result: Result<&str, &str>) {
        self.state().exec_rules.push(ExecRule {
            pod: pod.to_owned(),
            command_contains: command_contains.to_owned(),
            result: result.map(str::to_owned).map_err(str::to_owned),
        });
    }

    pub fn set_pipe(&self, pod: &str, stdout: &[u8], error: Option<&str>) {
        self.state().pipe_rules.insert(
            pod.to_owned(),
            PipeRule {
                stdout: stdout.to_vec(),
                error: error.map(str::to_owned),
            },
        );
    }

    pub fn set_secret(&self, name: &str, key: &str, value: &[u8]) {
        self.state()
            .secrets
            .insert((name.to_owned(), key.to_owned()), value.to_vec());
    }

    /// Scripts the phases returned for pods whose name starts with
    /// `prefix`; the last phase repeats once the script is exhausted.
    pub fn set_pod_phases(&self, prefix: &str, phases: Vec<Option<PodPhase>>) {
        self.state()
            .pod_phases
            .push((prefix.to_owned(), phases.into_iter().collect()));
    }
}

/// Applies an RFC 7396 JSON merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Some(patch_map) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    let target_map = target.as_object_mut().expect("made an object above");
    for (key, value) in patch_map {
        if value.is_null() {
            target_map.remove(key);
        } else {
            merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

/// Mirrors the production behavior: a fired handle makes the call return
/// promptly instead of touching the mock state.
fn check_cancel(cancel: &CancellationToken) -> PlatformResult<()> {
    if cancel.is_cancelled() {
        Err(PlatformError::Cancelled)
    } else {
        Ok(())
    }
}

fn selector_matches(selector: &str, value: &Value) -> bool {
    if selector.is_empty() {
        return true;
    }
    let labels = value
        .pointer("/metadata/labels")
        .and_then(Value::as_object);
    selector.split(',').all(|pair| {
        let Some((key, expected)) = pair.split_once('=') else {
            return false;
        };
        labels
            .and_then(|labels| labels.get(key))
            .and_then(Value::as_str)
            == Some(expected)
    })
}

#[async_trait]
impl Platform for MockPlatform {
    async fn get_resource(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> PlatformResult<Value> {
        check_cancel(cancel)?;
        self.state()
            .resources
            .get(&(kind, namespace.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| PlatformError::not_found(kind.kind_name(), name))
    }

    async fn list_resources(
        &self,
        kind: ResourceKind,
        namespace: &str,
        label_selector: &str,
        cancel: &CancellationToken,
    ) -> PlatformResult<Vec<Value>> {
        check_cancel(cancel)?;
        Ok(self
            .state()
            .resources
            .iter()
            .filter(|((item_kind, item_ns, _), _)| *item_kind == kind && item_ns == namespace)
            .map(|(_, value)| value)
            .filter(|value| selector_matches(label_selector, value))
            .cloned()
            .collect())
    }

    async fn patch_merge(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: Value,
        cancel: &CancellationToken,
    ) -> PlatformResult<()> {
        check_cancel(cancel)?;
        let mut state = self.state();
        state
            .patches
            .push((kind, name.to_owned(), patch.clone()));
        let key = (kind, namespace.to_owned(), name.to_owned());
        match state.resources.get_mut(&key) {
            Some(target) => {
                merge_patch(target, &patch);
                Ok(())
            }
            None => Err(PlatformError::not_found(kind.kind_name(), name)),
        }
    }

    async fn scale(
        &self,
        _kind: ResourceKind,
        _namespace: &str,
        name: &str,
        replicas: i32,
        cancel: &CancellationToken,
    ) -> PlatformResult<()> {
        check_cancel(cancel)?;
        let mut state = self.state();
        state.scales.push((name.to_owned(), replicas));
        if let Some(token) = state.cancel_on_scale.take() {
            token.cancel();
        }
        Ok(())
    }

    async fn exec_capture(
        &self,
        _namespace: &str,
        pod: &str,
        _container: &str,
        command: &[String],
        cancel: &CancellationToken,
    ) -> PlatformResult<ExecOutput> {
        check_cancel(cancel)?;
        let joined = command.join(" ");
        let state = self.state();
        let rule = state
            .exec_rules
            .iter()
            .find(|rule| rule.pod == pod && joined.contains(&rule.command_contains));
        match rule {
            Some(rule) => match &rule.result {
                Ok(stdout) => Ok(ExecOutput {
                    stdout: stdout.clone(),
                    stderr: String::new(),
                }),
                Err(message) => Err(PlatformError::Transport(message.clone())),
            },
            None => Err(PlatformError::Transport(format!(
                "no exec rule for {pod}: {joined}"
            ))),
        }
    }

    async fn exec_streamed(
        &self,
        _namespace: &str,
        pod: &str,
        _container: &str,
        command: &[String],
        mut stdin: OutputReader,
        cancel: &CancellationToken,
    ) -> PlatformResult<()> {
        check_cancel(cancel)?;
        let mut received = Vec::new();
        stdin
            .read_to_end(&mut received)
            .await
            .map_err(|error| PlatformError::Transport(error.to_string()))?;
        let joined = command.join(" ");
        let mut state = self.state();
        state.streamed_stdins.push((pod.to_owned(), received));
        let failure = state
            .exec_rules
            .iter()
            .find(|rule| rule.pod == pod && joined.contains(&rule.command_contains))
            .and_then(|rule| rule.result.as_ref().err().cloned());
        match failure {
            Some(message) => Err(PlatformError::Transport(message)),
            None => Ok(()),
        }
    }

    async fn exec_pipe_out(
        &self,
        _namespace: &str,
        pod: &str,
        _container: &str,
        _command: &[String],
        cancel: &CancellationToken,
    ) -> PlatformResult<(OutputReader, ExecWaiter)> {
        check_cancel(cancel)?;
        let state = self.state();
        let rule = state
            .pipe_rules
            .get(pod)
            .ok_or_else(|| PlatformError::Transport(format!("no pipe rule for {pod}")))?;
        let reader: OutputReader = Box::pin(std::io::Cursor::new(rule.stdout.clone()));
        let waiter = match &rule.error {
            Some(message) => ExecWaiter::ready(Err(PlatformError::Transport(message.clone()))),
            None => ExecWaiter::ready(Ok(())),
        };
        Ok((reader, waiter))
    }

    async fn read_pod_logs(
        &self,
        _namespace: &str,
        pod: &str,
        _container: Option<&str>,
        cancel: &CancellationToken,
    ) -> PlatformResult<String> {
        check_cancel(cancel)?;
        Ok(self.state().logs.get(pod).cloned().unwrap_or_default())
    }

    async fn create_pod(
        &self,
        namespace: &str,
        pod: &Pod,
        cancel: &CancellationToken,
    ) -> PlatformResult<()> {
        check_cancel(cancel)?;
        let name = pod.metadata.name.clone().unwrap_or_default();
        let mut state = self.state();
        state.created_pods.push(name.clone());
        let value = serde_json::to_value(pod)
            .map_err(|error| PlatformError::Other(error.to_string()))?;
        state
            .resources
            .insert((ResourceKind::Pod, namespace.to_owned(), name), value);
        Ok(())
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> PlatformResult<()> {
        check_cancel(cancel)?;
        let mut state = self.state();
        state.deleted_pods.push(name.to_owned());
        state
            .resources
            .remove(&(ResourceKind::Pod, namespace.to_owned(), name.to_owned()));
        Ok(())
    }

    async fn get_pod_phase(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> PlatformResult<Option<PodPhase>> {
        check_cancel(cancel)?;
        let mut state = self.state();
        if let Some((_, phases)) = state
            .pod_phases
            .iter_mut()
            .find(|(prefix, _)| name.starts_with(prefix.as_str()))
        {
            let phase = if phases.len() > 1 {
                phases.pop_front().expect("length checked")
            } else {
                phases.front().cloned().unwrap_or(None)
            };
            return Ok(phase);
        }
        Ok(state
            .resources
            .get(&(ResourceKind::Pod, namespace.to_owned(), name.to_owned()))
            .and_then(|value| {
                value
                    .pointer("/status/phase")
                    .and_then(Value::as_str)
                    .map(PodPhase::parse)
            }))
    }

    async fn read_secret(
        &self,
        _namespace: &str,
        name: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> PlatformResult<Vec<u8>> {
        check_cancel(cancel)?;
        self.state()
            .secrets
            .get(&(name.to_owned(), key.to_owned()))
            .cloned()
            .ok_or_else(|| PlatformError::not_found("Secret", name))
    }
}

/// Builds a pod resource value for the mock.
pub fn pod_value(
    name: &str,
    labels: &[(&str, &str)],
    phase: &str,
    ready: bool,
    pod_ip: Option<&str>,
    node_name: Option<&str>,
) -> Value {
    let labels: serde_json::Map<String, Value> = labels
        .iter()
        .map(|(key, value)| ((*key).to_owned(), json!(value)))
        .collect();
    json!({
        "metadata": { "name": name, "labels": labels },
        "spec": { "nodeName": node_name },
        "status": {
            "phase": phase,
            "podIP": pod_ip,
            "containerStatuses": [ { "ready": ready, "restartCount": 0 } ],
        }
    })
}

/// Builds a bound volume-claim resource value for the mock.
pub fn pvc_value(name: &str) -> Value {
    json!({
        "metadata": { "name": name },
        "status": { "phase": "Bound" }
    })
}

/// One backup recorded by [`RecordingArchive`].
#[derive(Debug, Clone)]
pub struct RecordedBackup {
    pub virtual_path: String,
    pub tags: TagMap,
    pub time: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub struct RecordingArchiveState {
    pub init_calls: usize,
    pub backups: Vec<RecordedBackup>,
    pub snapshots: Vec<Snapshot>,
    pub forgotten: Vec<String>,
    pub prune_calls: usize,
    pub dumps: Vec<(String, String)>,
    /// Payload served by `dump`.
    pub dump_payload: Vec<u8>,
    /// Fail backups whose virtual path contains this substring.
    pub fail_backups_containing: Option<String>,
}

/// An in-memory [`Archive`] that records every backup it receives.
#[derive(Default)]
pub struct RecordingArchive {
    state: Mutex<RecordingArchiveState>,
}

impl RecordingArchive {
    pub fn state(&self) -> MutexGuard<'_, RecordingArchiveState> {
        self.state.lock().expect("recording archive lock poisoned")
    }
}

#[async_trait]
impl Archive for RecordingArchive {
    fn location(&self) -> String {
        "memory://recording".to_owned()
    }

    async fn init(&self) -> ArchiveResult<()> {
        self.state().init_calls += 1;
        Ok(())
    }

    async fn snapshots(&self, filter: &TagMap) -> ArchiveResult<Vec<Snapshot>> {
        Ok(self
            .state()
            .snapshots
            .iter()
            .filter(|snapshot| snapshot.matches(filter))
            .cloned()
            .collect())
    }

    async fn backup_stdin(
        &self,
        mut reader: DumpReader,
        stdin_filename: &str,
        tags: &TagMap,
        time: DateTime<Utc>,
    ) -> ArchiveResult<BackupSummary> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .await
            .map_err(|source| ArchiveError::Stream {
                operation: "backup".to_owned(),
                source,
            })?;

        let mut state = self.state();
        if let Some(marker) = &state.fail_backups_containing {
            if stdin_filename.contains(marker.as_str()) {
                return Err(ArchiveError::command_failed("backup", Some(1), "injected"));
            }
        }
        let total_size = bytes.len() as u64;
        state.backups.push(RecordedBackup {
            virtual_path: stdin_filename.to_owned(),
            tags: tags.clone(),
            time,
            bytes,
        });
        let id = format!("snap-{:04}", state.backups.len());
        Ok(BackupSummary {
            snapshot_id: id,
            files_new: 1,
            total_size,
            data_added: total_size,
            ..BackupSummary::default()
        })
    }

    async fn dump(
        &self,
        snapshot: &str,
        path: &str,
        mut writer: DumpWriter,
        _filter: &TagMap,
    ) -> ArchiveResult<()> {
        let payload = {
            let mut state = self.state();
            state.dumps.push((snapshot.to_owned(), path.to_owned()));
            state.dump_payload.clone()
        };
        writer
            .write_all(&payload)
            .await
            .map_err(|source| ArchiveError::Stream {
                operation: "dump".to_owned(),
                source,
            })?;
        writer
            .shutdown()
            .await
            .map_err(|source| ArchiveError::Stream {
                operation: "dump".to_owned(),
                source,
            })?;
        Ok(())
    }

    async fn forget(
        &self,
        _filter: &TagMap,
        _policy: RetentionPolicy,
        _prune: bool,
    ) -> ArchiveResult<Vec<ForgetGroup>> {
        Ok(Vec::new())
    }

    async fn forget_snapshot(&self, id: &str) -> ArchiveResult<()> {
        let mut state = self.state();
        state.forgotten.push(id.to_owned());
        state.snapshots.retain(|snapshot| snapshot.id != id);
        Ok(())
    }

    async fn prune(&self) -> ArchiveResult<()> {
        self.state().prune_calls += 1;
        Ok(())
    }
}
