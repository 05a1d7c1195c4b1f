// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Platform adapter: the minimum container-platform capability set consumed
//! by the hasteward engines.
//!
//! The [`Platform`] trait is the seam between the engines and Kubernetes.
//! The production implementation is [`kubernetes::KubePlatform`]; tests use
//! an in-memory double. Custom resources cross the boundary as
//! [`serde_json::Value`] and are projected into the typed views of
//! [`views`], so the engines never navigate loose maps themselves.
//!
//! Every method takes a cancellation handle: a platform call may suspend
//! indefinitely on the transport, so when the handle fires mid-call the
//! implementation must return [`PlatformError::Cancelled`] promptly rather
//! than wait for the transport to resolve.

use async_trait::async_trait;
use futures::future::BoxFuture;
use hasteward_core::evidence::PodPhase;
use k8s_openapi::api::core::v1::Pod;
use serde_json::Value;
use std::{future::Future, pin::Pin};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

pub mod error;
pub mod kubernetes;
pub mod resource;
pub mod shell;
pub mod views;

pub use error::{PlatformError, PlatformResult};
pub use resource::ResourceKind;

/// Captured output of a remote command that exited with status zero.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A boxed streaming reader over a remote process's stdout.
pub type OutputReader = Pin<Box<dyn AsyncRead + Send>>;

/// Completion handle of a piped exec.
///
/// `wait` resolves only after the remote process has exited and the stream
/// has been fully delivered; callers must drain the reader to end-of-stream
/// before awaiting it. A remote failure both closes the reader with an error
/// and is reported here.
pub struct ExecWaiter(BoxFuture<'static, PlatformResult<()>>);

impl ExecWaiter {
    pub fn new(future: impl Future<Output = PlatformResult<()>> + Send + 'static) -> Self {
        Self(Box::pin(future))
    }

    /// Immediately-resolved waiter, for test doubles.
    pub fn ready(result: PlatformResult<()>) -> Self {
        Self::new(async move { result })
    }

    pub async fn wait(self) -> PlatformResult<()> {
        self.0.await
    }
}

impl std::fmt::Debug for ExecWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExecWaiter")
    }
}

/// The capability set the engines require from the container platform.
///
/// All resource payloads are JSON values addressed by [`ResourceKind`];
/// failures are mapped into the [`PlatformError`] taxonomy, and callers
/// recover locally only for `NotFound` where absence is data rather than an
/// error. The `cancel` handle aborts the call while it is in flight.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Reads a namespaced resource.
    async fn get_resource(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> PlatformResult<Value>;

    /// Lists namespaced resources matching a label selector.
    async fn list_resources(
        &self,
        kind: ResourceKind,
        namespace: &str,
        label_selector: &str,
        cancel: &CancellationToken,
    ) -> PlatformResult<Vec<Value>>;

    /// Applies a JSON merge patch to a resource.
    async fn patch_merge(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: Value,
        cancel: &CancellationToken,
    ) -> PlatformResult<()>;

    /// Adjusts the replica count of a scaled workload.
    async fn scale(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        replicas: i32,
        cancel: &CancellationToken,
    ) -> PlatformResult<()>;

    /// Runs a command in a container and captures its output. Returns an
    /// error (including stderr) on non-zero exit.
    async fn exec_capture(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        cancel: &CancellationToken,
    ) -> PlatformResult<ExecOutput>;

    /// Runs a command in a container, streaming `stdin` into it. Remote
    /// stdout/stderr are logged, not captured.
    async fn exec_streamed(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        stdin: OutputReader,
        cancel: &CancellationToken,
    ) -> PlatformResult<()>;

    /// Runs a command in a container, surfacing its stdout as a streaming
    /// reader. See [`ExecWaiter`] for the completion contract; cancellation
    /// closes the reader with an error and resolves the waiter.
    async fn exec_pipe_out(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
        cancel: &CancellationToken,
    ) -> PlatformResult<(OutputReader, ExecWaiter)>;

    /// Fetches the current logs of a pod container.
    async fn read_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        cancel: &CancellationToken,
    ) -> PlatformResult<String>;

    /// Creates an ephemeral pod.
    async fn create_pod(
        &self,
        namespace: &str,
        pod: &Pod,
        cancel: &CancellationToken,
    ) -> PlatformResult<()>;

    /// Force-deletes a pod (grace period zero). Deleting an already-absent
    /// pod is not an error.
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> PlatformResult<()>;

    /// Reads a pod's lifecycle phase; `None` if the pod does not exist.
    async fn get_pod_phase(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> PlatformResult<Option<PodPhase>>;

    /// Looks up one key of a secret, returning the raw (decoded) bytes.
    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> PlatformResult<Vec<u8>>;
}
