//! Concurrency-safe persistence, locking and execution orchestration for
//! sessions.
//!
//! Every session id maps to exactly one exclusive lock, owned by the store
//! and created on first use. Opening a session for mutation acquires that
//! lock with a bounded wait; read-only loads bypass it and get a
//! point-in-time view of the snapshot. Asynchronous executions keep the
//! exclusive guard for their entire lifetime, so the session log only ever
//! has one writer: streamed output arrives over a channel and is appended
//! by the executing task itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::compute::{BackendConnector, BackendKind, ComputeError, ProgressSink};
use crate::config::{RuntimeConfig, SESSION_FILE, VERSION, VERSION_MARKER_FILE};
use crate::error::SessionError;
use crate::formats::{CreateSessionRequest, State};
use crate::session::{Session, SessionDetails};
use crate::source::DefinitionSource;
use crate::system::{Command, System};

/// Bound on waiting for another opener to release a session.
const LOCK_WAIT: Duration = Duration::from_secs(1);

/// How an execute call is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteMode {
    /// The caller blocks until the backend call returns.
    Sync,
    /// A detached task owns the backend call; the caller gets an immediate
    /// acknowledgement.
    Async,
}

/// Outcome of an execute call.
#[derive(Debug)]
pub enum ExecuteOutcome {
    /// Full command output of a completed synchronous execution.
    Completed(String),
    /// Acknowledgement for a spawned asynchronous execution.
    Accepted(String),
}

/// Concurrency-safe persistence and retrieval of sessions.
pub struct SessionStore {
    sessions_dir: PathBuf,
    backend_kind: BackendKind,
    connector: Arc<dyn BackendConnector>,
    /// One exclusive lock per session id. Entries are created on first use
    /// and removed explicitly when the session is deleted; they are never
    /// garbage-collected while the id could still be referenced.
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl SessionStore {
    pub fn new(config: &RuntimeConfig, connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            sessions_dir: config.sessions_dir.clone(),
            backend_kind: config.backend,
            connector,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn session_dir(&self, id: Uuid) -> PathBuf {
        self.sessions_dir.join(id.to_string())
    }

    fn lock_for(&self, id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(id).or_default().clone()
    }

    fn drop_lock(&self, id: Uuid) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.remove(&id);
    }

    /// Creates a new session: materializes the system's file tree, resolves
    /// the system against the configuration, provisions the backend
    /// resource and persists the first snapshot.
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
        source: &dyn DefinitionSource,
    ) -> Result<Uuid, SessionError> {
        request.configuration.validate()?;
        let id = Uuid::new_v4();
        let dir = self.session_dir(id);
        let repo_dir = dir.join("repository");
        tokio::fs::create_dir_all(&repo_dir).await?;

        match self.build_session(id, &request, source, &dir, &repo_dir).await {
            Ok(()) => Ok(id),
            Err(e) => {
                // leave no half-created session behind
                let _ = tokio::fs::remove_dir_all(&dir).await;
                Err(e)
            }
        }
    }

    async fn build_session(
        &self,
        id: Uuid,
        request: &CreateSessionRequest,
        source: &dyn DefinitionSource,
        dir: &Path,
        repo_dir: &Path,
    ) -> Result<(), SessionError> {
        let identity = &request.configuration.system;
        let definition = source
            .fetch(&identity.name, &identity.version, repo_dir)
            .await?;
        let mut system = System::new(
            &id.to_string(),
            &definition,
            &request.configuration,
            dir,
            repo_dir,
            self.backend_kind,
        )?;
        let backend = self.connector.create(&system.descriptor).await?;
        system.attach_backend(backend);

        let session = Session::new(id, system, SessionDetails::from_request(request));
        self.write_snapshot(&session).await?;
        tokio::fs::write(dir.join(VERSION_MARKER_FILE), VERSION).await?;
        info!(
            "created session '{id}' for system '{}:{}'",
            identity.name, identity.version
        );
        Ok(())
    }

    async fn write_snapshot(&self, session: &Session) -> Result<(), SessionError> {
        let path = self.session_dir(session.session_id).join(SESSION_FILE);
        let rendered = serde_json::to_string_pretty(session)?;
        tokio::fs::write(&path, rendered).await?;
        Ok(())
    }

    async fn read_snapshot(&self, id: Uuid) -> Result<Session, SessionError> {
        let dir = self.session_dir(id);
        let path = dir.join(SESSION_FILE);
        if !path.is_file() {
            return Err(SessionError::InvalidSession {
                id,
                reason: "no session snapshot found".to_string(),
            });
        }

        // version skew only warns; the snapshot may still parse
        match tokio::fs::read_to_string(dir.join(VERSION_MARKER_FILE)).await {
            Ok(version) if version.trim() != VERSION => warn!(
                "session '{id}' was written by runtime version '{}' (running '{VERSION}'); \
                 loading anyway",
                version.trim()
            ),
            Err(_) => warn!("session '{id}' carries no version marker"),
            _ => {}
        }

        let raw = tokio::fs::read_to_string(&path).await?;
        let mut session: Session =
            serde_json::from_str(&raw).map_err(|e| SessionError::InvalidSession {
                id,
                reason: format!(
                    "snapshot cannot be parsed (possibly written by an incompatible \
                     version): {e}"
                ),
            })?;
        let backend = self
            .connector
            .attach(&session.system.descriptor)
            .await
            .map_err(|e| SessionError::InvalidSession {
                id,
                reason: format!("the compute resource cannot be opened: {e}"),
            })?;
        session.system.attach_backend(backend);
        Ok(session)
    }

    /// Opens a session exclusively. Fails with a locked condition when the
    /// lock cannot be acquired within the bounded wait.
    pub async fn open(self: &Arc<Self>, id: Uuid) -> Result<SessionGuard, SessionError> {
        let lock = self.lock_for(id);
        let permit = tokio::time::timeout(LOCK_WAIT, lock.lock_owned())
            .await
            .map_err(|_| {
                error!("session '{id}' is already opened exclusively");
                SessionError::Locked(id)
            })?;
        let session = self.read_snapshot(id).await?;
        Ok(SessionGuard {
            store: Arc::clone(self),
            session,
            _permit: permit,
        })
    }

    /// Loads a session without the exclusive lock.
    ///
    /// Deliberately relaxed: a concurrent writer may be mid-update, so
    /// callers get a point-in-time view and must not persist it.
    pub async fn open_read_only(&self, id: Uuid) -> Result<Session, SessionError> {
        self.read_snapshot(id).await
    }

    /// Ids of every session currently on disk.
    pub async fn list_sessions(&self) -> Result<Vec<Uuid>, SessionError> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.sessions_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(ids),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(id) = entry.file_name().to_string_lossy().parse::<Uuid>() {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Removes a session and all of its artifacts: backend resource, lock
    /// table entry and session directory.
    ///
    /// `force` skips the exclusive lock; a still-active writer would
    /// corrupt the session, so this is for cleanup only.
    pub async fn remove_session(self: &Arc<Self>, id: Uuid, force: bool) -> Result<(), SessionError> {
        if force {
            warn!("session '{id}' is removed without its exclusive lock");
            let session = self.open_read_only(id).await?;
            session.remove().await?;
        } else {
            let guard = self.open(id).await?;
            guard.session().remove().await?;
            drop(guard);
        }
        self.drop_lock(id);
        let dir = self.session_dir(id);
        if dir.is_dir() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        info!("removed session '{id}'");
        Ok(())
    }

    /// Stops the command currently executing for `id`.
    ///
    /// Needs no write access: the state stays untouched and the in-flight
    /// execution path performs the terminal transition once the backend
    /// call unwinds.
    pub async fn stop(&self, id: Uuid) -> Result<(), SessionError> {
        let session = self.open_read_only(id).await?;
        if !session.state.is_busy() {
            return Err(SessionError::UnexpectedState(format!(
                "cannot stop session '{id}' in state '{}': nothing is executing",
                session.state
            )));
        }
        session.stop().await
    }

    /// Runs `build` or `run` for a session.
    ///
    /// Synchronous mode blocks until the backend returns and yields the
    /// captured output; a failed execution surfaces as an error after the
    /// failure state is persisted. Asynchronous mode transitions the state,
    /// detaches a task owning the exclusive guard for its whole lifetime
    /// and acknowledges immediately; observers see the log grow through
    /// read-only loads while the task appends streamed output.
    pub async fn execute(
        self: &Arc<Self>,
        id: Uuid,
        command: Command,
        mode: ExecuteMode,
        timeout: Option<u64>,
    ) -> Result<ExecuteOutcome, SessionError> {
        let mut guard = self.open(id).await?;
        guard.session().check_execute_preconditions(command)?;
        guard.session_mut().push_log_entry(command);

        // a build without a build command is elided entirely
        if command == Command::Build && !guard.session().system.has_build {
            guard.session_mut().state = command.success_state();
            guard
                .session_mut()
                .append_to_last_log("No output generated by the build command.");
            guard.commit().await?;
            return Ok(ExecuteOutcome::Completed(String::new()));
        }

        let previous = guard.session().state;
        guard.session_mut().state = command.active_state();
        guard.persist().await?;

        match mode {
            ExecuteMode::Sync => {
                let result = guard
                    .session_mut()
                    .system
                    .execute(command, timeout, None)
                    .await;
                match result {
                    Ok(output) => {
                        guard.session_mut().state = command.success_state();
                        let text = if output.is_empty() {
                            format!("No output generated by the {command} command.")
                        } else {
                            output.clone()
                        };
                        guard.session_mut().append_to_last_log(&text);
                        guard.commit().await?;
                        Ok(ExecuteOutcome::Completed(output))
                    }
                    Err(e) => {
                        let message = e.to_string();
                        let terminal = is_terminal_failure(&e);
                        guard.session_mut().state = if terminal {
                            command.failure_state()
                        } else {
                            previous
                        };
                        guard.session_mut().append_to_last_log(&message);
                        guard.commit().await?;
                        if terminal {
                            Err(SessionError::UnexpectedState(message))
                        } else {
                            Err(e)
                        }
                    }
                }
            }
            ExecuteMode::Async => {
                let (sink, chunks) = mpsc::unbounded_channel();
                tokio::spawn(Self::drive_async(
                    guard, command, previous, timeout, sink, chunks,
                ));
                Ok(ExecuteOutcome::Accepted(format!(
                    "{command} command started asynchronously."
                )))
            }
        }
    }

    /// Body of an asynchronous execution. Owns the exclusive guard for the
    /// whole run: every log append and the terminal transition go through
    /// this single writer.
    async fn drive_async(
        mut guard: SessionGuard,
        command: Command,
        previous: State,
        timeout: Option<u64>,
        sink: ProgressSink,
        mut chunks: UnboundedReceiver<String>,
    ) {
        // stage inputs up front so the long-running backend call borrows
        // nothing from the session and the log can grow while it runs
        let files = match guard.session_mut().system.prepare(command).await {
            Ok(files) => files,
            Err(e) => {
                Self::finish_failed(&mut guard, command, previous, &e).await;
                return;
            }
        };
        let backend = match guard.session().system.backend_arc() {
            Ok(backend) => backend,
            Err(e) => {
                Self::finish_failed(&mut guard, command, previous, &e).await;
                return;
            }
        };

        let execution = async move {
            match command {
                Command::Build => backend.build_system(&files, timeout, Some(sink)).await,
                Command::Run => backend.run_system(&files, timeout, Some(sink)).await,
            }
        };
        tokio::pin!(execution);

        let mut chunks_open = true;
        let result = loop {
            tokio::select! {
                chunk = chunks.recv(), if chunks_open => {
                    match chunk {
                        Some(chunk) => {
                            guard.session_mut().append_to_last_log(&chunk);
                            if let Err(e) = guard.persist().await {
                                warn!("progress append could not be persisted: {e}");
                            }
                        }
                        None => chunks_open = false,
                    }
                }
                result = &mut execution => break result,
            }
        };
        // pick up whatever the stream delivered after the last poll
        while let Ok(chunk) = chunks.try_recv() {
            guard.session_mut().append_to_last_log(&chunk);
        }

        match result {
            Ok(output) => {
                if guard.session().last_log_is_bare_header() {
                    let text = if output.is_empty() {
                        format!("No output generated by the {command} command.")
                    } else {
                        output
                    };
                    guard.session_mut().append_to_last_log(&text);
                }
                guard.session_mut().system.mark_available(command);
                guard.session_mut().state = command.success_state();
            }
            Err(e) => {
                let error = SessionError::from(e);
                guard.session_mut().append_to_last_log(&error.to_string());
                guard.session_mut().state = if is_terminal_failure(&error) {
                    command.failure_state()
                } else {
                    previous
                };
            }
        }
        if let Err(e) = guard.commit().await {
            error!("session could not be persisted after {command}: {e}");
        }
    }

    async fn finish_failed(
        guard: &mut SessionGuard,
        command: Command,
        previous: State,
        failure: &SessionError,
    ) {
        guard.session_mut().append_to_last_log(&failure.to_string());
        guard.session_mut().state = if is_terminal_failure(failure) {
            command.failure_state()
        } else {
            previous
        };
        if let Err(e) = guard.persist().await {
            error!("session could not be persisted after a failed {command}: {e}");
        }
    }
}

/// Terminal command failures (non-zero exit, timeout) move the session to
/// the failure state. Infrastructure failures (staging, backend
/// unavailable, credentials, generic resource errors) leave the state
/// where it was: the attempt never reached the command and existing
/// resources are assumed intact.
fn is_terminal_failure(error: &SessionError) -> bool {
    matches!(
        error,
        SessionError::Compute(ComputeError::Execution { .. })
            | SessionError::Compute(ComputeError::Timeout(_))
    )
}

/// Exclusive access to one session.
///
/// Mutations live on the contained [`Session`]; nothing reaches the disk
/// until [`SessionGuard::persist`] or [`SessionGuard::commit`] is called.
/// Dropping the guard without committing releases the lock and discards
/// uncommitted changes.
pub struct SessionGuard {
    store: Arc<SessionStore>,
    session: Session,
    _permit: OwnedMutexGuard<()>,
}

impl SessionGuard {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Writes the current state back while keeping the lock.
    pub async fn persist(&self) -> Result<(), SessionError> {
        self.store.write_snapshot(&self.session).await
    }

    /// Persists and releases the session.
    pub async fn commit(self) -> Result<(), SessionError> {
        self.persist().await
    }
}
