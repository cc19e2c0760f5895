//! Execution backend seam.
//!
//! The runtime only needs a handful of primitives to manage sandboxed
//! processes and their isolated networks. [`docker::DockerBackend`] provides
//! them on top of the Docker engine.

pub mod docker;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::pin::Pin;
use tokio::io::AsyncWrite;

use crate::error::BackendError;
use crate::naming::LABEL_ROOM_KEY;
use crate::protocol::WinSize;

pub type Labels = HashMap<String, String>;

pub type OutputStream = BoxStream<'static, Result<OutputFrame, BackendError>>;

pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// One chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFrame {
    /// Raw terminal bytes from a TTY process.
    Console(Vec<u8>),
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

impl OutputFrame {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            OutputFrame::Console(data) | OutputFrame::Stdout(data) | OutputFrame::Stderr(data) => {
                data
            }
        }
    }
}

/// Attached streams of a created process.
pub struct ProcessStdio {
    pub output: OutputStream,
    /// Present only when the process was attached with stdin.
    pub input: Option<InputSink>,
}

/// Backend-native resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessLimits {
    pub memory_bytes: i64,
    pub cpu_period_us: i64,
    pub cpu_quota_us: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub labels: Labels,
    pub tty: bool,
    /// Keep stdin open for an attached client.
    pub open_stdin: bool,
    /// Network to join; `None` means no networking at all.
    pub network: Option<String>,
    pub limits: ProcessLimits,
}

/// A network or process found by a label query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledResource {
    pub id: String,
    pub name: String,
    pub labels: Labels,
}

impl LabeledResource {
    pub fn room_key(&self) -> Option<&str> {
        self.labels.get(LABEL_ROOM_KEY).map(String::as_str)
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Create an internal-only network; returns its id.
    async fn create_network(&self, name: &str, labels: &Labels) -> Result<String, BackendError>;

    async fn remove_network(&self, id: &str) -> Result<(), BackendError>;

    /// Create (but do not start) a process; returns its id.
    async fn create_process(&self, spec: &ProcessSpec) -> Result<String, BackendError>;

    async fn attach_process(&self, id: &str, stdin: bool) -> Result<ProcessStdio, BackendError>;

    async fn start_process(&self, id: &str) -> Result<(), BackendError>;

    async fn resize_process(&self, id: &str, size: WinSize) -> Result<(), BackendError>;

    async fn kill_process(&self, id: &str) -> Result<(), BackendError>;

    /// Place a single file into `dir` inside the process filesystem.
    async fn copy_file(
        &self,
        id: &str,
        dir: &str,
        file_name: &str,
        content: &[u8],
    ) -> Result<(), BackendError>;

    /// Resolve once the process has exited and been removed.
    async fn wait_process(&self, id: &str) -> Result<(), BackendError>;

    async fn list_processes(&self, label: &str) -> Result<Vec<LabeledResource>, BackendError>;

    async fn list_networks(&self, label: &str) -> Result<Vec<LabeledResource>, BackendError>;
}
