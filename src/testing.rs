//! In-memory execution backend for tests.
//!
//! [`FakeBackend`] keeps networks and processes in a table, records every
//! call worth asserting on, and plays a scripted [`Behavior`] per process
//! role once a process is started. Killed or exited processes are removed
//! immediately, like Docker's auto-remove.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::BackendError;
use crate::naming::{RunType, LABEL_RUN_TYPE};
use crate::protocol::WinSize;
use crate::sandbox::{
    ExecutionBackend, InputSink, LabeledResource, Labels, OutputFrame, ProcessSpec, ProcessStdio,
};

/// What a started process does.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Emit `output`, then exit after `after`.
    Exit { output: Vec<OutputFrame>, after: Duration },
    /// Run until killed.
    Hang,
    /// Echo stdin back as console output until killed.
    Echo,
}

/// Backend call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateNetwork,
    CopyFile,
    Attach,
    Start,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedFile {
    pub process_id: String,
    pub dir: String,
    pub file_name: String,
    pub content: Vec<u8>,
}

struct FakeProcess {
    spec: ProcessSpec,
    output_tx: Option<mpsc::UnboundedSender<OutputFrame>>,
    output_rx: Option<mpsc::UnboundedReceiver<OutputFrame>>,
    exited: watch::Sender<bool>,
}

struct FakeNetwork {
    name: String,
    labels: Labels,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    networks: HashMap<String, FakeNetwork>,
    processes: HashMap<String, FakeProcess>,
    behaviors: HashMap<String, Behavior>,
    created: Vec<ProcessSpec>,
    killed: Vec<String>,
    removed_networks: Vec<String>,
    copied: Vec<CopiedFile>,
    resized: Vec<(String, WinSize)>,
    failures: HashMap<FailPoint, usize>,
}

impl Inner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn take_failure(&mut self, point: FailPoint) -> Result<(), BackendError> {
        match self.failures.get_mut(&point) {
            Some(pending) if *pending > 0 => {
                *pending -= 1;
                Err(BackendError::Other(format!("injected {:?} failure", point)))
            }
            _ => Ok(()),
        }
    }

    /// Process id for an id or a container name.
    fn resolve(&self, id_or_name: &str) -> Option<String> {
        if self.processes.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.processes
            .iter()
            .find(|(_, p)| p.spec.name == id_or_name)
            .map(|(id, _)| id.clone())
    }
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    inner: Arc<Mutex<Inner>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_behavior(&self, run_type: RunType, behavior: Behavior) {
        self.inner
            .lock()
            .await
            .behaviors
            .insert(run_type.to_string(), behavior);
    }

    /// Make the next call at `point` fail.
    pub async fn fail_next(&self, point: FailPoint) {
        *self.inner.lock().await.failures.entry(point).or_default() += 1;
    }

    /// Register a running process that nothing in this process owns.
    pub async fn seed_process(&self, name: &str, labels: Labels) -> String {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id("proc");
        let (exited, _) = watch::channel(false);
        let spec = ProcessSpec {
            name: name.to_string(),
            image: "seeded".to_string(),
            cmd: Vec::new(),
            env: Vec::new(),
            labels,
            tty: false,
            open_stdin: false,
            network: None,
            limits: Default::default(),
        };
        inner.processes.insert(
            id.clone(),
            FakeProcess {
                spec,
                output_tx: None,
                output_rx: None,
                exited,
            },
        );
        id
    }

    pub async fn seed_network(&self, name: &str, labels: Labels) -> String {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id("net");
        inner.networks.insert(
            id.clone(),
            FakeNetwork {
                name: name.to_string(),
                labels,
            },
        );
        id
    }

    /// Ids of processes that are still alive.
    pub async fn live_processes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().await.processes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn live_process_specs(&self) -> Vec<ProcessSpec> {
        self.inner
            .lock()
            .await
            .processes
            .values()
            .map(|p| p.spec.clone())
            .collect()
    }

    pub async fn live_networks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().await.networks.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn created(&self) -> Vec<ProcessSpec> {
        self.inner.lock().await.created.clone()
    }

    /// Every id or name a kill was requested for, including misses.
    pub async fn killed(&self) -> Vec<String> {
        self.inner.lock().await.killed.clone()
    }

    pub async fn removed_networks(&self) -> Vec<String> {
        self.inner.lock().await.removed_networks.clone()
    }

    pub async fn copied(&self) -> Vec<CopiedFile> {
        self.inner.lock().await.copied.clone()
    }

    pub async fn resized(&self) -> Vec<(String, WinSize)> {
        self.inner.lock().await.resized.clone()
    }

    /// Remove a process and notify its waiters.
    async fn finish(&self, id: &str) -> bool {
        let process = self.inner.lock().await.processes.remove(id);
        match process {
            Some(process) => {
                let _ = process.exited.send(true);
                true
            }
            None => false,
        }
    }

    async fn output_sender(&self, id: &str) -> Option<mpsc::UnboundedSender<OutputFrame>> {
        self.inner
            .lock()
            .await
            .processes
            .get(id)
            .and_then(|p| p.output_tx.clone())
    }

    async fn behavior_for(&self, id: &str) -> Behavior {
        let inner = self.inner.lock().await;
        inner
            .processes
            .get(id)
            .and_then(|p| p.spec.labels.get(LABEL_RUN_TYPE))
            .and_then(|run_type| inner.behaviors.get(run_type))
            .cloned()
            .unwrap_or(Behavior::Hang)
    }

    fn spawn_echo(&self, id: String) -> InputSink {
        let (writer, mut reader) = tokio::io::duplex(4096);
        let backend = self.clone();
        tokio::spawn(async move {
            let mut exited = match backend.inner.lock().await.processes.get(&id) {
                Some(process) => process.exited.subscribe(),
                None => return,
            };
            let mut buf = [0u8; 1024];
            loop {
                tokio::select! {
                    read = reader.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let Some(tx) = backend.output_sender(&id).await else { break };
                            let _ = tx.send(OutputFrame::Console(buf[..n].to_vec()));
                        }
                    },
                    _ = exited.changed() => break,
                }
            }
        });
        Box::pin(writer)
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    async fn create_network(&self, name: &str, labels: &Labels) -> Result<String, BackendError> {
        let mut inner = self.inner.lock().await;
        inner.take_failure(FailPoint::CreateNetwork)?;
        let id = inner.next_id("net");
        inner.networks.insert(
            id.clone(),
            FakeNetwork {
                name: name.to_string(),
                labels: labels.clone(),
            },
        );
        Ok(id)
    }

    async fn remove_network(&self, id: &str) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        match inner.networks.remove(id) {
            Some(_) => {
                inner.removed_networks.push(id.to_string());
                Ok(())
            }
            None => Err(BackendError::NotFound(id.to_string())),
        }
    }

    async fn create_process(&self, spec: &ProcessSpec) -> Result<String, BackendError> {
        let mut inner = self.inner.lock().await;
        if inner.resolve(&spec.name).is_some() {
            return Err(BackendError::Other(format!(
                "container name {} is already in use",
                spec.name
            )));
        }
        let id = inner.next_id("proc");
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exited, _) = watch::channel(false);
        inner.created.push(spec.clone());
        inner.processes.insert(
            id.clone(),
            FakeProcess {
                spec: spec.clone(),
                output_tx: Some(output_tx),
                output_rx: Some(output_rx),
                exited,
            },
        );
        Ok(id)
    }

    async fn attach_process(&self, id: &str, stdin: bool) -> Result<ProcessStdio, BackendError> {
        let rx = {
            let mut inner = self.inner.lock().await;
            inner.take_failure(FailPoint::Attach)?;
            let process = inner
                .processes
                .get_mut(id)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
            process
                .output_rx
                .take()
                .ok_or_else(|| BackendError::Other(format!("{} already attached", id)))?
        };
        let output = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (Ok(frame), rx))
        })
        .boxed();

        let input = if !stdin {
            None
        } else if matches!(self.behavior_for(id).await, Behavior::Echo) {
            Some(self.spawn_echo(id.to_string()))
        } else {
            Some(Box::pin(tokio::io::sink()) as InputSink)
        };
        Ok(ProcessStdio { output, input })
    }

    async fn start_process(&self, id: &str) -> Result<(), BackendError> {
        {
            let mut inner = self.inner.lock().await;
            if !inner.processes.contains_key(id) {
                return Err(BackendError::NotFound(id.to_string()));
            }
            inner.take_failure(FailPoint::Start)?;
        }
        if let Behavior::Exit { output, after } = self.behavior_for(id).await {
            let backend = self.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                if let Some(tx) = backend.output_sender(&id).await {
                    for frame in output {
                        let _ = tx.send(frame);
                    }
                }
                tokio::time::sleep(after).await;
                backend.finish(&id).await;
            });
        }
        Ok(())
    }

    async fn resize_process(&self, id: &str, size: WinSize) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        if !inner.processes.contains_key(id) {
            return Err(BackendError::NotFound(id.to_string()));
        }
        inner.resized.push((id.to_string(), size));
        Ok(())
    }

    async fn kill_process(&self, id: &str) -> Result<(), BackendError> {
        let resolved = {
            let mut inner = self.inner.lock().await;
            inner.killed.push(id.to_string());
            inner.resolve(id)
        };
        match resolved {
            Some(resolved) if self.finish(&resolved).await => Ok(()),
            _ => Err(BackendError::NotFound(id.to_string())),
        }
    }

    async fn copy_file(
        &self,
        id: &str,
        dir: &str,
        file_name: &str,
        content: &[u8],
    ) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().await;
        if !inner.processes.contains_key(id) {
            return Err(BackendError::NotFound(id.to_string()));
        }
        inner.take_failure(FailPoint::CopyFile)?;
        inner.copied.push(CopiedFile {
            process_id: id.to_string(),
            dir: dir.to_string(),
            file_name: file_name.to_string(),
            content: content.to_vec(),
        });
        Ok(())
    }

    async fn wait_process(&self, id: &str) -> Result<(), BackendError> {
        let mut exited = match self.inner.lock().await.processes.get(id) {
            Some(process) => process.exited.subscribe(),
            None => return Ok(()),
        };
        while !*exited.borrow_and_update() {
            if exited.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn list_processes(&self, label: &str) -> Result<Vec<LabeledResource>, BackendError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .processes
            .iter()
            .filter(|(_, p)| p.spec.labels.contains_key(label))
            .map(|(id, p)| LabeledResource {
                id: id.clone(),
                name: p.spec.name.clone(),
                labels: p.spec.labels.clone(),
            })
            .collect())
    }

    async fn list_networks(&self, label: &str) -> Result<Vec<LabeledResource>, BackendError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .networks
            .iter()
            .filter(|(_, n)| n.labels.contains_key(label))
            .map(|(id, n)| LabeledResource {
                id: id.clone(),
                name: n.name.clone(),
                labels: n.labels.clone(),
            })
            .collect())
    }
}
