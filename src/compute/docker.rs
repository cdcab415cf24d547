//! Docker implementation of the compute backend.
//!
//! Each session owns a persistent named volume. Files move through tar
//! archive streams via short-lived helper containers mounting that volume;
//! build/run commands execute in a run-to-completion container per
//! invocation, named deterministically so `stop_command` can find it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    CreateContainerOptions, DownloadFromContainerOptions, KillContainerOptions,
    ListContainersOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerCreateBody, HostConfig, ResourcesUlimits};
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{
    BackendConnector, ComputeBackend, ComputeError, ComputeFile, ComputeResult,
    ComputeSystemDescriptor, ProgressSink,
};

/// Budget for the optional delete command during resource teardown.
const DELETE_COMMAND_TIMEOUT: u64 = 10;

/// Host environment variables forwarded into the execution container.
const PROXY_ENV_NAMES: [&str; 6] = [
    "http_proxy",
    "https_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "no_proxy",
    "NO_PROXY",
];

/// Connector for the local Docker daemon variant.
pub struct DockerConnector;

#[async_trait]
impl BackendConnector for DockerConnector {
    async fn create(
        &self,
        descriptor: &ComputeSystemDescriptor,
    ) -> ComputeResult<Arc<dyn ComputeBackend>> {
        let backend = DockerBackend::connect(descriptor.clone())?;
        backend.create_resource().await?;
        Ok(Arc::new(backend))
    }

    async fn attach(
        &self,
        descriptor: &ComputeSystemDescriptor,
    ) -> ComputeResult<Arc<dyn ComputeBackend>> {
        let backend = DockerBackend::connect(descriptor.clone())?;
        backend.verify_volume().await?;
        Ok(Arc::new(backend))
    }
}

/// Docker daemon implementation of [`ComputeBackend`].
pub struct DockerBackend {
    client: Docker,
    descriptor: ComputeSystemDescriptor,
    volume_name: String,
}

impl DockerBackend {
    fn connect(descriptor: ComputeSystemDescriptor) -> ComputeResult<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| ComputeError::Unavailable(format!("cannot reach the Docker daemon: {e}")))?;
        let volume_name = format!("runforge-session-{}", descriptor.session_id);
        Ok(Self {
            client,
            descriptor,
            volume_name,
        })
    }

    fn container_name(&self) -> String {
        format!("runforge-session-container-{}", self.descriptor.session_id)
    }

    fn volume_bind(&self) -> String {
        format!("{}:{}", self.volume_name, self.descriptor.mount_dir)
    }

    async fn verify_volume(&self) -> ComputeResult<()> {
        self.client.inspect_volume(&self.volume_name).await.map_err(|e| {
            ComputeError::Unavailable(format!(
                "session volume '{}' cannot be opened: {e}",
                self.volume_name
            ))
        })?;
        Ok(())
    }

    /// Image names without a registry component refer to local images and
    /// are not pulled.
    async fn pull_image(&self) -> ComputeResult<()> {
        if !self.descriptor.image.contains('/') {
            debug!("using local image '{}'", self.descriptor.image);
            return Ok(());
        }
        debug!("pulling image '{}'", self.descriptor.image);
        let options = CreateImageOptions {
            from_image: self.descriptor.image.clone(),
            ..Default::default()
        };
        let mut pull = self.client.create_image(Some(options), None, None);
        while let Some(step) = pull.next().await {
            if let Err(e) = step {
                warn!("image pull warning: {e}");
            }
        }
        Ok(())
    }

    fn proxy_environment() -> Vec<String> {
        let mut environment = Vec::new();
        for name in PROXY_ENV_NAMES {
            if let Ok(value) = std::env::var(name) {
                debug!("forwarding '{name}' into the execution environment");
                environment.push(format!("{name}={value}"));
            }
        }
        environment
    }

    /// Builds the upload archive for one transfer batch.
    ///
    /// Every entry gets a permissive mode so that later container-side
    /// writes are not blocked by root-owned files. Parent directories are
    /// added exactly once per batch; re-adding them would reset their
    /// ownership inside the volume.
    fn build_archive(files: &[ComputeFile]) -> ComputeResult<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut added_directories: HashSet<PathBuf> = HashSet::new();

        for file in files {
            let metadata = std::fs::metadata(&file.source).map_err(|e| {
                ComputeError::FileTransfer(format!(
                    "cannot read '{}': {e}",
                    file.source.display()
                ))
            })?;
            // tar entries are relative to the extraction root ("/")
            let destination = file.destination.trim_start_matches('/').to_string();

            if metadata.is_dir() {
                if added_directories.insert(PathBuf::from(&destination)) {
                    Self::append_directory(&mut builder, &destination)?;
                }
                continue;
            }

            if let Some(parent) = Path::new(&destination)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
            {
                if added_directories.insert(parent.to_path_buf()) {
                    Self::append_directory(&mut builder, &parent.to_string_lossy())?;
                }
            }

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(metadata.len());
            header.set_mode(0o777);
            let mut content = std::fs::File::open(&file.source).map_err(|e| {
                ComputeError::FileTransfer(format!(
                    "cannot open '{}': {e}",
                    file.source.display()
                ))
            })?;
            builder
                .append_data(&mut header, &destination, &mut content)
                .map_err(|e| {
                    ComputeError::FileTransfer(format!(
                        "cannot archive '{}': {e}",
                        file.source.display()
                    ))
                })?;
        }

        builder
            .into_inner()
            .map_err(|e| ComputeError::FileTransfer(format!("archive could not be finished: {e}")))
    }

    fn append_directory(builder: &mut tar::Builder<Vec<u8>>, path: &str) -> ComputeResult<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o777);
        builder
            .append_data(&mut header, format!("{path}/"), std::io::empty())
            .map_err(|e| ComputeError::FileTransfer(format!("cannot archive directory '{path}': {e}")))
    }

    /// Creates a helper container mounting the session volume. Uploading
    /// into and downloading out of a created (never started) container is
    /// enough for the archive endpoints to reach the volume.
    async fn create_helper_container(&self) -> ComputeResult<String> {
        self.pull_image().await?;
        let name = format!("runforge-transfer-{}", self.descriptor.session_id);
        self.remove_container_quietly(&name).await;
        let config = ContainerCreateBody {
            image: Some(self.descriptor.image.clone()),
            host_config: Some(HostConfig {
                binds: Some(vec![self.volume_bind()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| {
                ComputeError::FileTransfer(format!("transfer container could not be created: {e}"))
            })?;
        Ok(name)
    }

    /// Copies a batch of files into the session volume.
    async fn copy_to_volume(&self, files: &[ComputeFile]) -> ComputeResult<()> {
        if files.is_empty() {
            return Ok(());
        }
        debug!("transferring {} file(s) into the session volume", files.len());
        let archive = Self::build_archive(files)?;
        let helper = self.create_helper_container().await?;
        let upload = self
            .client
            .upload_to_container(
                &helper,
                Some(UploadToContainerOptions {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                bollard::body_full(archive.into()),
            )
            .await
            .map_err(|e| ComputeError::FileTransfer(format!("archive upload failed: {e}")));
        self.remove_container_quietly(&helper).await;
        upload?;
        debug!("volume transfer finished");
        Ok(())
    }

    /// Copies one file out of the session volume into `destination_dir`.
    async fn copy_from_volume(&self, source: &str, destination_dir: &Path) -> ComputeResult<()> {
        let helper = self.create_helper_container().await?;
        let mut stream = self.client.download_from_container(
            &helper,
            Some(DownloadFromContainerOptions {
                path: source.to_string(),
            }),
        );
        let mut archive = Vec::new();
        let mut failure = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                Err(e) => {
                    failure = Some(ComputeError::FileTransfer(format!(
                        "cannot read '{source}' from the session volume: {e}"
                    )));
                    break;
                }
            }
        }
        self.remove_container_quietly(&helper).await;
        if let Some(failure) = failure {
            return Err(failure);
        }
        tokio::fs::create_dir_all(destination_dir)
            .await
            .map_err(|e| ComputeError::FileTransfer(format!("results directory: {e}")))?;
        tar::Archive::new(archive.as_slice())
            .unpack(destination_dir)
            .map_err(|e| {
                ComputeError::FileTransfer(format!("result archive could not be unpacked: {e}"))
            })?;
        Ok(())
    }

    /// Runs `command` to completion inside a fresh container on the session
    /// volume and returns the captured output.
    async fn execute_container(
        &self,
        command: &str,
        timeout: Option<u64>,
        progress: Option<ProgressSink>,
    ) -> ComputeResult<String> {
        info!("invoking '{command}'");
        self.pull_image().await?;
        let name = self.container_name();
        // clear leftovers of a previous attempt; the name must be free
        self.remove_container_quietly(&name).await;

        // A CPU-time ulimit approximates the requested budget. It is not a
        // wall-clock deadline: a sleeping command can outlive it.
        let ulimits = timeout.filter(|t| *t > 0).map(|t| {
            vec![ResourcesUlimits {
                name: Some("cpu".to_string()),
                soft: Some(t as i64),
                hard: Some(t as i64),
            }]
        });

        let environment = Self::proxy_environment();
        let config = ContainerCreateBody {
            image: Some(self.descriptor.image.clone()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            working_dir: Some(self.descriptor.work_dir.clone()),
            env: if environment.is_empty() {
                None
            } else {
                Some(environment)
            },
            host_config: Some(HostConfig {
                binds: Some(vec![self.volume_bind()]),
                ulimits,
                ..Default::default()
            }),
            ..Default::default()
        };

        self.client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| ComputeError::Resource(format!("container could not be created: {e}")))?;
        self.client
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ComputeError::Resource(format!("container could not be started: {e}")))?;

        if let Some(sink) = &progress {
            let options = LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            };
            let mut logs = self.client.logs(&name, Some(options));
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(output) => {
                        let _ = sink.send(output.to_string());
                    }
                    Err(e) => {
                        warn!("log stream interrupted: {e}");
                        break;
                    }
                }
            }
        }

        let mut wait = self
            .client
            .wait_container(&name, None::<WaitContainerOptions<String>>);
        let status = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => {
                self.remove_container_quietly(&name).await;
                return Err(ComputeError::Resource(format!(
                    "waiting for the container failed: {e}"
                )));
            }
            None => -1,
        };

        let output = self.collect_logs(&name).await;
        self.remove_container_quietly(&name).await;

        if status == 0 {
            info!("container execution finished");
            Ok(output)
        } else if timeout.is_some() && (status == 137 || status == 152) {
            // the CPU limit terminates the process with SIGXCPU/SIGKILL
            Err(ComputeError::Timeout(timeout.unwrap_or_default()))
        } else {
            Err(ComputeError::Execution { status, output })
        }
    }

    async fn collect_logs(&self, name: &str) -> String {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut logs = self.client.logs(name, Some(options));
        let mut output = String::new();
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(log) => output.push_str(&log.to_string()),
                Err(e) => {
                    warn!("log collection interrupted: {e}");
                    break;
                }
            }
        }
        output
    }

    /// Best-effort removal; a missing container is fine.
    async fn remove_container_quietly(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.client.remove_container(name, Some(options)).await {
            if !matches!(
                e,
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    ..
                }
            ) {
                debug!("container '{name}' not removed: {e}");
            }
        }
    }
}

#[async_trait]
impl ComputeBackend for DockerBackend {
    async fn create_resource(&self) -> ComputeResult<()> {
        let options = CreateVolumeOptions {
            name: self.volume_name.clone(),
            driver: "local".to_string(),
            ..Default::default()
        };
        self.client.create_volume(options).await.map_err(|e| {
            ComputeError::Resource(format!("session volume could not be created: {e}"))
        })?;
        debug!("created session volume '{}'", self.volume_name);
        self.copy_to_volume(&self.descriptor.files).await
    }

    async fn build_system(
        &self,
        files: &[ComputeFile],
        timeout: Option<u64>,
        progress: Option<ProgressSink>,
    ) -> ComputeResult<String> {
        let Some(command) = self.descriptor.build_command.clone() else {
            return Err(ComputeError::Resource(
                "the system declares no build command".to_string(),
            ));
        };
        self.copy_to_volume(files).await?;
        self.execute_container(&command, timeout, progress).await
    }

    async fn run_system(
        &self,
        files: &[ComputeFile],
        timeout: Option<u64>,
        progress: Option<ProgressSink>,
    ) -> ComputeResult<String> {
        let command = self.descriptor.run_command.clone();
        self.copy_to_volume(files).await?;
        self.execute_container(&command, timeout, progress).await
    }

    async fn stop_command(&self) -> ComputeResult<()> {
        let name = self.container_name();
        match self
            .client
            .stop_container(&name, None::<StopContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(ComputeError::Unavailable(format!(
                "no executing container '{name}' found to stop"
            ))),
            Err(e) => Err(ComputeError::Resource(format!(
                "container '{name}' could not be stopped: {e}"
            ))),
        }
    }

    async fn get_result(&self, path: &str) -> ComputeResult<PathBuf> {
        info!("copying result '{path}' out of the session volume");
        let source = format!(
            "{}/{}",
            self.descriptor.work_dir.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let file_name = Path::new(path).file_name().ok_or_else(|| {
            ComputeError::FileTransfer(format!("result path '{path}' has no file name"))
        })?;
        let results_dir = self.descriptor.local_dir.join("results");
        self.copy_from_volume(&source, &results_dir).await?;
        Ok(results_dir.join(file_name))
    }

    async fn remove_resource(&self) -> ComputeResult<()> {
        let mut filters = HashMap::new();
        filters.insert("volume".to_string(), vec![self.volume_name.clone()]);
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| {
                ComputeError::Unavailable(format!(
                    "containers using the session volume cannot be listed: {e}"
                ))
            })?;
        for container in containers {
            if let Some(id) = container.id {
                let _ = self
                    .client
                    .kill_container(&id, None::<KillContainerOptions<String>>)
                    .await;
                self.remove_container_quietly(&id).await;
            }
        }

        // the cleanup hook gets a bounded budget; a failing hook must not
        // leave the volume behind
        if let Some(delete) = self
            .descriptor
            .delete_command
            .clone()
            .filter(|c| !c.trim().is_empty())
        {
            if let Err(e) = self
                .execute_container(&delete, Some(DELETE_COMMAND_TIMEOUT), None)
                .await
            {
                warn!("delete command failed during teardown: {e}");
            }
        }

        self.client
            .remove_volume(&self.volume_name, None::<bollard::query_parameters::RemoveVolumeOptions>)
            .await
            .map_err(|e| {
                ComputeError::Unavailable(format!("session volume could not be removed: {e}"))
            })?;
        debug!("removed session volume '{}'", self.volume_name);
        Ok(())
    }
}
