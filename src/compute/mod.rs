//! Compute backend abstraction.
//!
//! A backend owns one isolated execution environment per session: it
//! provisions storage, stages files, runs the build/run commands and hands
//! result files back. Implementations form a closed set selected through
//! [`BackendKind`]. Live handles are never persisted: a session snapshot
//! stores the plain [`ComputeSystemDescriptor`], and the handle is
//! reconstructed on load through a [`BackendConnector`].

mod docker;

pub use docker::{DockerBackend, DockerConnector};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors any backend operation may surface.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// The backend is unreachable or the session's resource is gone.
    #[error("compute resource unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the credentials used to reach it.
    #[error("compute credentials rejected: {0}")]
    Credentials(String),

    /// A generic resource-level failure.
    #[error("compute resource error: {0}")]
    Resource(String),

    /// The build/run command finished with a non-zero exit status. A normal,
    /// user-visible outcome, not a fault of the backend.
    #[error("command execution failed with status {status}; output:\n{output}")]
    Execution { status: i64, output: String },

    /// The command exceeded its time budget.
    #[error("command exceeded its budget of {0} seconds of CPU time")]
    Timeout(u64),

    /// A file could not be moved into or out of the environment.
    #[error("file transfer failed: {0}")]
    FileTransfer(String),
}

pub type ComputeResult<T> = Result<T, ComputeError>;

/// Sink for streamed command output. Chunks sent here end up appended to
/// the session log by the single writer driving the execution.
pub type ProgressSink = mpsc::UnboundedSender<String>;

/// One file to transfer between the host and the execution environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeFile {
    /// Path readable on this host.
    pub source: PathBuf,
    /// Destination path in the perspective of the execution environment.
    pub destination: String,
}

/// Backend-facing projection of a system. Plain data, fully serializable;
/// built once at system resolution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeSystemDescriptor {
    /// Ties the backend resource to its session.
    pub session_id: String,
    /// Image reference; pulled when it names a registry.
    pub image: String,
    /// Host directory for session-local artifacts (staged inputs, results).
    pub local_dir: PathBuf,
    /// Mount point of the persistent session storage inside the environment.
    /// All destination paths are below it.
    pub mount_dir: String,
    /// Working directory for command execution, below `mount_dir`.
    pub work_dir: String,
    pub build_command: Option<String>,
    pub run_command: String,
    pub delete_command: Option<String>,
    /// Repository tree seeded into the environment at creation.
    pub files: Vec<ComputeFile>,
    /// Resource requirements, interpreted by the backend.
    pub requirements: BTreeMap<String, String>,
}

/// Lifecycle operations against one isolated execution environment.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Provisions the per-session storage and seeds it with the
    /// descriptor's file list.
    async fn create_resource(&self) -> ComputeResult<()>;

    /// Stages `files`, then executes the build command. Blocks until the
    /// command finishes; returns the captured output.
    async fn build_system(
        &self,
        files: &[ComputeFile],
        timeout: Option<u64>,
        progress: Option<ProgressSink>,
    ) -> ComputeResult<String>;

    /// Stages `files`, then executes the run command. Blocks until the
    /// command finishes; returns the captured output.
    async fn run_system(
        &self,
        files: &[ComputeFile],
        timeout: Option<u64>,
        progress: Option<ProgressSink>,
    ) -> ComputeResult<String>;

    /// Best-effort termination of whatever command is currently executing
    /// for this session.
    async fn stop_command(&self) -> ComputeResult<()>;

    /// Copies one file out of the environment into the session's results
    /// directory and returns its local path.
    async fn get_result(&self, path: &str) -> ComputeResult<PathBuf>;

    /// Tears down any still-running command, runs the optional delete
    /// command with a bounded budget and destroys the storage.
    async fn remove_resource(&self) -> ComputeResult<()>;
}

/// The closed set of supported backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Docker,
}

impl BackendKind {
    /// Resolves the configured variant to its connector.
    pub fn connector(&self) -> Arc<dyn BackendConnector> {
        match self {
            BackendKind::Docker => Arc::new(DockerConnector),
        }
    }
}

/// Builds backend handles for new and re-opened sessions.
///
/// `create` provisions the resource for a fresh session; `attach` is the
/// reconnect step performed after a snapshot load and verifies the resource
/// still exists.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn create(
        &self,
        descriptor: &ComputeSystemDescriptor,
    ) -> ComputeResult<Arc<dyn ComputeBackend>>;

    async fn attach(
        &self,
        descriptor: &ComputeSystemDescriptor,
    ) -> ComputeResult<Arc<dyn ComputeBackend>>;
}
