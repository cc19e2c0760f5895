//! Docker implementation of the execution backend.

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{
    ContainerCreateBody, EndpointSettings, HostConfig, NetworkCreateRequest, NetworkingConfig,
};
use bollard::query_parameters::{
    AttachContainerOptions, CreateContainerOptions, KillContainerOptions,
    ListContainersOptions, ListNetworksOptions, RemoveContainerOptionsBuilder,
    ResizeContainerTTYOptionsBuilder, StartContainerOptions, UploadToContainerOptionsBuilder,
    WaitContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use super::{
    ExecutionBackend, LabeledResource, Labels, OutputFrame, ProcessSpec, ProcessStdio,
};
use crate::error::BackendError;
use crate::protocol::WinSize;

/// Owner recorded on files copied into a sandbox.
const SANDBOX_USER: &str = "ye";

pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    pub fn connect() -> Result<Self, BackendError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    fn label_filter(label: &str) -> HashMap<String, Vec<String>> {
        HashMap::from([("label".to_string(), vec![label.to_string()])])
    }
}

/// HTTP status of a Docker API error response.
fn status_of(e: &bollard::errors::Error) -> Option<u16> {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

impl From<LogOutput> for OutputFrame {
    fn from(output: LogOutput) -> Self {
        match output {
            LogOutput::StdOut { message } => OutputFrame::Stdout(message.to_vec()),
            LogOutput::StdErr { message } => OutputFrame::Stderr(message.to_vec()),
            LogOutput::Console { message } | LogOutput::StdIn { message } => {
                OutputFrame::Console(message.to_vec())
            }
        }
    }
}

/// Tar archive holding exactly one regular file.
pub fn single_file_archive(file_name: &str, content: &[u8]) -> Result<Vec<u8>, BackendError> {
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_username(SANDBOX_USER)?;
    header.set_groupname(SANDBOX_USER)?;

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, file_name, content)?;
    Ok(builder.into_inner()?)
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    async fn create_network(&self, name: &str, labels: &Labels) -> Result<String, BackendError> {
        let request = NetworkCreateRequest {
            name: name.to_string(),
            internal: Some(true),
            labels: Some(labels.clone()),
            ..Default::default()
        };
        let response = self.docker.create_network(request).await?;
        info!(network = name, id = %response.id, "Network created");
        Ok(response.id)
    }

    async fn remove_network(&self, id: &str) -> Result<(), BackendError> {
        self.docker.remove_network(id).await?;
        debug!(id, "Network removed");
        Ok(())
    }

    async fn create_process(&self, spec: &ProcessSpec) -> Result<String, BackendError> {
        let network_mode = spec.network.clone().unwrap_or_else(|| "none".to_string());
        let networking_config = spec.network.as_ref().map(|network| NetworkingConfig {
            endpoints_config: Some(HashMap::from([(
                network.clone(),
                EndpointSettings::default(),
            )])),
        });

        let options = Some(CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        });
        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            tty: Some(spec.tty),
            attach_stdin: Some(spec.open_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(spec.open_stdin),
            stdin_once: Some(spec.open_stdin),
            host_config: Some(HostConfig {
                network_mode: Some(network_mode),
                auto_remove: Some(true),
                memory: Some(spec.limits.memory_bytes),
                cpu_period: Some(spec.limits.cpu_period_us),
                cpu_quota: Some(spec.limits.cpu_quota_us),
                ..Default::default()
            }),
            networking_config,
            ..Default::default()
        };

        let container = self.docker.create_container(options, config).await?;
        debug!(name = %spec.name, id = %container.id, "Container created");
        Ok(container.id)
    }

    async fn attach_process(&self, id: &str, stdin: bool) -> Result<ProcessStdio, BackendError> {
        let options = AttachContainerOptions {
            stream: true,
            stdin,
            stdout: true,
            stderr: true,
            logs: false,
            ..Default::default()
        };
        let attached = self.docker.attach_container(id, Some(options)).await?;
        let output = attached
            .output
            .map(|item| item.map(OutputFrame::from).map_err(BackendError::from))
            .boxed();
        Ok(ProcessStdio {
            output,
            input: if stdin { Some(attached.input) } else { None },
        })
    }

    async fn start_process(&self, id: &str) -> Result<(), BackendError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;
        Ok(())
    }

    async fn resize_process(&self, id: &str, size: WinSize) -> Result<(), BackendError> {
        let options = ResizeContainerTTYOptionsBuilder::default()
            .h(i32::from(size.row))
            .w(i32::from(size.col))
            .build();
        self.docker.resize_container_tty(id, options).await?;
        Ok(())
    }

    async fn kill_process(&self, id: &str) -> Result<(), BackendError> {
        // Engine default signal is SIGKILL.
        match self
            .docker
            .kill_container(id, None::<KillContainerOptions>)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if status_of(&e) != Some(409) => return Err(e.into()),
            Err(e) => debug!(id, error = %e, "Container not running, removing it"),
        }

        // Never started, so auto-remove will not fire.
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Removal already in progress.
            Err(e) if status_of(&e) == Some(409) => Err(BackendError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn copy_file(
        &self,
        id: &str,
        dir: &str,
        file_name: &str,
        content: &[u8],
    ) -> Result<(), BackendError> {
        let archive = single_file_archive(file_name, content)?;
        let options = UploadToContainerOptionsBuilder::default().path(dir).build();
        self.docker
            .upload_to_container(id, Some(options), bollard::body_full(archive.into()))
            .await?;
        Ok(())
    }

    async fn wait_process(&self, id: &str) -> Result<(), BackendError> {
        let options = WaitContainerOptionsBuilder::default()
            .condition("removed")
            .build();
        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                debug!(id, code, "Container exited with non-zero status");
                Ok(())
            }
            Some(Err(e)) => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn list_processes(&self, label: &str) -> Result<Vec<LabeledResource>, BackendError> {
        let options = ListContainersOptions {
            all: true,
            filters: Some(Self::label_filter(label)),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(LabeledResource {
                    id: c.id?,
                    name: c
                        .names
                        .and_then(|names| names.into_iter().next())
                        .unwrap_or_default(),
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn list_networks(&self, label: &str) -> Result<Vec<LabeledResource>, BackendError> {
        let options = ListNetworksOptions {
            filters: Some(Self::label_filter(label)),
            ..Default::default()
        };
        let networks = self.docker.list_networks(Some(options)).await?;
        Ok(networks
            .into_iter()
            .filter_map(|n| {
                Some(LabeledResource {
                    id: n.id?,
                    name: n.name.unwrap_or_default(),
                    labels: n.labels.unwrap_or_default(),
                })
            })
            .collect())
    }
}
