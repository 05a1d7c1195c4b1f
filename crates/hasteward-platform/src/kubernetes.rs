// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes implementation of the [`Platform`] trait.

use std::{future::Future, path::Path};

use async_trait::async_trait;
use bytes::Bytes;
use hasteward_core::evidence::PodPhase;
use k8s_openapi::{
    api::{
        apps::v1::StatefulSet,
        core::v1::{Pod, Secret},
    },
    apimachinery::pkg::apis::meta::v1::Status,
};
use kube::{
    api::{Api, AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::DynamicObject,
    Client, Config,
};
use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, oneshot},
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::{io::StreamReader, sync::CancellationToken};

use crate::{
    error::{PlatformError, PlatformResult},
    resource::ResourceKind,
    ExecOutput, ExecWaiter, OutputReader, Platform,
};

/// Size of the chunks relayed from a remote stdout stream.
const STREAM_CHUNK_SIZE: usize = 32 * 1024;

/// Races an in-flight platform call against its cancellation handle. The
/// transport has no deadline of its own, so this is what makes every call
/// return promptly when the handle fires.
async fn with_cancel<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = PlatformResult<T>>,
) -> PlatformResult<T> {
    tokio::select! {
        () = cancel.cancelled() => Err(PlatformError::Cancelled),
        result = call => result,
    }
}

/// Platform adapter backed by a Kubernetes API server.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    /// Connects using the given kubeconfig file, or standard resolution
    /// (in-cluster, then `KUBECONFIG`, then the default location).
    pub async fn connect(kubeconfig: Option<&Path>) -> PlatformResult<Self> {
        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|error| {
                    PlatformError::Other(format!("failed to read kubeconfig: {error}"))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|error| {
                        PlatformError::Other(format!("failed to load kubeconfig: {error}"))
                    })?
            }
            None => Config::infer().await.map_err(|error| {
                PlatformError::Other(format!("failed to infer cluster config: {error}"))
            })?,
        };
        let client = Client::try_from(config)?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Interprets the V1Status delivered on the exec error channel.
fn check_exec_status(status: Option<Status>, stderr: &str) -> PlatformResult<()> {
    match status {
        None => Ok(()),
        Some(status) if status.status.as_deref() == Some("Success") => Ok(()),
        Some(status) => {
            let mut message = status
                .message
                .or(status.reason)
                .unwrap_or_else(|| "remote command failed".to_owned());
            if !stderr.is_empty() {
                message = format!("{message} (stderr: {})", stderr.trim());
            }
            Err(PlatformError::Transport(message))
        }
    }
}

#[async_trait]
impl Platform for KubePlatform {
    async fn get_resource(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> PlatformResult<Value> {
        let api = self.dynamic_api(kind, namespace);
        with_cancel(cancel, async {
            let object = api.get(name).await?;
            serde_json::to_value(&object)
                .map_err(|error| PlatformError::Other(format!("resource serialization: {error}")))
        })
        .await
    }

    async fn list_resources(
        &self,
        kind: ResourceKind,
        namespace: &str,
        label_selector: &str,
        cancel: &CancellationToken,
    ) -> PlatformResult<Vec<Value>> {
        let api = self.dynamic_api(kind, namespace);
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        with_cancel(cancel, async {
            let objects = api.list(&params).await?;
            objects
                .items
                .iter()
                .map(|object| {
                    serde_json::to_value(object).map_err(|error| {
                        PlatformError::Other(format!("resource serialization: {error}"))
                    })
                })
                .collect()
        })
        .await
    }

    async fn patch_merge(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: Value,
        cancel: &CancellationToken,
    ) -> PlatformResult<()> {
        let api = self.dynamic_api(kind, namespace);
        with_cancel(cancel, async {
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        })
        .await
    }

    async fn scale(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        replicas: i32,
        cancel: &CancellationToken,
    ) -> PlatformResult<()> {
        match kind {
            ResourceKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                with_cancel(cancel, async {
                    api.patch_scale(
                        name,
                        &PatchParams::default(),
                        &Patch::Merge(serde_json::json!({ "spec": { "replicas": replicas } })),
                    )
                    .await?;
                    Ok(())
                })
                .await
            }
            other => Err(PlatformError::Other(format!(
                "kind {other:?} is not a scalable workload"
            ))),
        }
    }

    async fn exec_capture(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        cancel: &CancellationToken,
    ) -> PlatformResult<ExecOutput> {
        let pods = self.pods(namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        with_cancel(cancel, async {
            let mut process = pods.exec(pod, command.to_vec(), &params).await?;

            let mut stdout = process
                .stdout()
                .ok_or_else(|| PlatformError::Other("exec stdout stream unavailable".to_owned()))?;
            let mut stderr = process
                .stderr()
                .ok_or_else(|| PlatformError::Other("exec stderr stream unavailable".to_owned()))?;
            let status = process.take_status();

            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (stdout_read, stderr_read) = tokio::join!(
                stdout.read_to_end(&mut stdout_buf),
                stderr.read_to_end(&mut stderr_buf),
            );
            stdout_read.map_err(|error| PlatformError::Transport(format!("exec read: {error}")))?;
            stderr_read.map_err(|error| PlatformError::Transport(format!("exec read: {error}")))?;

            let status = match status {
                Some(status) => status.await,
                None => None,
            };
            let output = ExecOutput {
                stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            };
            check_exec_status(status, &output.stderr)?;
            Ok(output)
        })
        .await
    }

    async fn exec_streamed(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        mut stdin: OutputReader,
        cancel: &CancellationToken,
    ) -> PlatformResult<()> {
        let pods = self.pods(namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(true)
            .stdout(true)
            .stderr(true);
        with_cancel(cancel, async {
            let mut process = pods.exec(pod, command.to_vec(), &params).await?;

            let mut remote_stdin = process
                .stdin()
                .ok_or_else(|| PlatformError::Other("exec stdin stream unavailable".to_owned()))?;
            let mut remote_stdout = process
                .stdout()
                .ok_or_else(|| PlatformError::Other("exec stdout stream unavailable".to_owned()))?;
            let mut remote_stderr = process
                .stderr()
                .ok_or_else(|| PlatformError::Other("exec stderr stream unavailable".to_owned()))?;
            let status = process.take_status();

            let feed = async {
                tokio::io::copy(&mut stdin, &mut remote_stdin).await?;
                remote_stdin.shutdown().await
            };
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (fed, stdout_read, stderr_read) = tokio::join!(
                feed,
                remote_stdout.read_to_end(&mut stdout_buf),
                remote_stderr.read_to_end(&mut stderr_buf),
            );
            fed.map_err(|error| PlatformError::Transport(format!("exec stdin: {error}")))?;
            stdout_read.map_err(|error| PlatformError::Transport(format!("exec read: {error}")))?;
            stderr_read.map_err(|error| PlatformError::Transport(format!("exec read: {error}")))?;

            if !stdout_buf.is_empty() {
                tracing::debug!(
                    bytes = stdout_buf.len(),
                    "remote command produced output during streamed exec"
                );
            }

            let status = match status {
                Some(status) => status.await,
                None => None,
            };
            check_exec_status(status, &String::from_utf8_lossy(&stderr_buf))
        })
        .await
    }

    async fn exec_pipe_out(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        cancel: &CancellationToken,
    ) -> PlatformResult<(OutputReader, ExecWaiter)> {
        let pods = self.pods(namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut process =
            with_cancel(cancel, async { Ok(pods.exec(pod, command.to_vec(), &params).await?) })
                .await?;

        let mut remote_stdout = process
            .stdout()
            .ok_or_else(|| PlatformError::Other("exec stdout stream unavailable".to_owned()))?;
        let remote_stderr = process.stderr();
        let status = process.take_status();

        let (chunk_tx, chunk_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
        let (done_tx, done_rx) = oneshot::channel::<PlatformResult<()>>();
        let relay_cancel = cancel.clone();

        tokio::spawn(async move {
            // Keep the attached process alive for the duration of the relay.
            let _process = process;
            let relay = async {
                let mut buffer = vec![0u8; STREAM_CHUNK_SIZE];
                loop {
                    let read = tokio::select! {
                        () = relay_cancel.cancelled() => {
                            return Err(PlatformError::Cancelled);
                        }
                        read = remote_stdout.read(&mut buffer) => read.map_err(|error| {
                            PlatformError::Transport(format!("exec stream read: {error}"))
                        })?,
                    };
                    if read == 0 {
                        break;
                    }
                    if chunk_tx
                        .send(Ok(Bytes::copy_from_slice(&buffer[..read])))
                        .await
                        .is_err()
                    {
                        // Consumer went away; keep draining so the remote
                        // process can finish and report a status.
                        break;
                    }
                }
                Ok::<_, PlatformError>(())
            };

            let drain_stderr = async {
                let mut buffer = Vec::new();
                if let Some(mut stderr) = remote_stderr {
                    let _ = stderr.read_to_end(&mut buffer).await;
                }
                String::from_utf8_lossy(&buffer).into_owned()
            };

            let (relayed, stderr_text) = tokio::join!(relay, drain_stderr);
            let result = match relayed {
                // Cancellation mid-stream: skip the status wait, which may
                // itself never resolve.
                Err(PlatformError::Cancelled) => Err(PlatformError::Cancelled),
                other => {
                    let status = match status {
                        Some(status) => status.await,
                        None => None,
                    };
                    other.and_then(|()| check_exec_status(status, &stderr_text))
                }
            };

            if let Err(error) = &result {
                let _ = chunk_tx
                    .send(Err(std::io::Error::other(error.to_string())))
                    .await;
            }
            drop(chunk_tx);
            let _ = done_tx.send(result);
        });

        let reader: OutputReader = Box::pin(StreamReader::new(ReceiverStream::new(chunk_rx)));
        let waiter = ExecWaiter::new(async move {
            done_rx
                .await
                .unwrap_or_else(|_| Err(PlatformError::Transport("exec relay task died".to_owned())))
        });
        Ok((reader, waiter))
    }

    async fn read_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        cancel: &CancellationToken,
    ) -> PlatformResult<String> {
        let pods = self.pods(namespace);
        let params = LogParams {
            container: container.map(str::to_owned),
            ..LogParams::default()
        };
        with_cancel(cancel, async { Ok(pods.logs(pod, &params).await?) }).await
    }

    async fn create_pod(
        &self,
        namespace: &str,
        pod: &Pod,
        cancel: &CancellationToken,
    ) -> PlatformResult<()> {
        let pods = self.pods(namespace);
        with_cancel(cancel, async {
            pods.create(&PostParams::default(), pod).await?;
            Ok(())
        })
        .await
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> PlatformResult<()> {
        let pods = self.pods(namespace);
        let params = DeleteParams::default().grace_period(0);
        with_cancel(cancel, async {
            match pods.delete(name, &params).await {
                Ok(_) => Ok(()),
                Err(error) => {
                    let error = PlatformError::from(error);
                    if error.is_not_found() {
                        Ok(())
                    } else {
                        Err(error)
                    }
                }
            }
        })
        .await
    }

    async fn get_pod_phase(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> PlatformResult<Option<PodPhase>> {
        let pods = self.pods(namespace);
        with_cancel(cancel, async {
            let pod = pods.get_opt(name).await?;
            Ok(pod.map(|pod| {
                pod.status
                    .and_then(|status| status.phase)
                    .map_or(PodPhase::Unknown, |phase| PodPhase::parse(&phase))
            }))
        })
        .await
    }

    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> PlatformResult<Vec<u8>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        with_cancel(cancel, async {
            let secret = secrets.get(name).await?;
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|bytes| bytes.0.clone())
                .ok_or_else(|| PlatformError::not_found("Secret key", format!("{name}/{key}")))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_status_interpretation() {
        assert!(check_exec_status(None, "").is_ok());
        assert!(check_exec_status(
            Some(Status {
                status: Some("Success".to_owned()),
                ..Status::default()
            }),
            "",
        )
        .is_ok());

        let failure = check_exec_status(
            Some(Status {
                status: Some("Failure".to_owned()),
                message: Some("command terminated with exit code 1".to_owned()),
                ..Status::default()
            }),
            "pg_dumpall: error: connection failed",
        );
        let message = failure.unwrap_err().to_string();
        assert!(message.contains("exit code 1"));
        assert!(message.contains("connection failed"));
    }

    #[tokio::test]
    async fn fired_handle_cancels_an_in_flight_call() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // A call that would otherwise never resolve returns promptly.
        let result = with_cancel::<()>(&cancel, std::future::pending()).await;
        assert!(matches!(result, Err(PlatformError::Cancelled)));
    }
}
