//! Runtime configuration and workspace constants.

use std::path::PathBuf;

use crate::compute::BackendKind;

/// Version of the runtime, recorded next to every session snapshot for
/// cross-version load warnings.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Mount point of the per-session storage inside the execution environment.
/// Every container-visible path is derived from it.
pub const CONTAINER_WORKDIR: &str = "/runforge";

/// Creator name a session falls back to when the create request has none.
pub const DEFAULT_CREATOR: &str = "default-user";

/// Snapshot file inside a session directory.
pub const SESSION_FILE: &str = "session.json";

/// Version marker file inside a session directory.
pub const VERSION_MARKER_FILE: &str = "version";

/// Process-level configuration of the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Base directory holding one sub-directory per session.
    pub sessions_dir: PathBuf,
    /// Compute backend variant sessions are connected to.
    pub backend: BackendKind,
    /// Port the REST transport binds to.
    pub port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let sessions_dir = std::env::var("RUNFORGE_SESSION_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::current_dir()
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .join("sessions")
            });
        let port = std::env::var("RUNFORGE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8000);
        Self {
            sessions_dir,
            backend: BackendKind::Docker,
            port,
        }
    }
}
