//! Shared test harness: a scripted mock compute backend plus fixture
//! builders for system trees and stores.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use runforge::compute::{
    BackendConnector, ComputeBackend, ComputeError, ComputeFile, ComputeResult,
    ComputeSystemDescriptor, ProgressSink,
};
use runforge::config::RuntimeConfig;
use runforge::formats::CreateSessionRequest;
use runforge::session::SessionStore;
use runforge::source::DirectorySource;
use runforge::BackendKind;

/// Scripted outcome of a build/run call.
#[derive(Clone)]
pub enum Outcome {
    Succeed(String),
    /// Non-zero exit with the given output.
    Fail(String),
    /// The backend itself cannot be reached.
    Unavailable(String),
}

/// Shared, inspectable state of the mock backend.
pub struct MockState {
    pub calls: Mutex<Vec<String>>,
    pub build: Mutex<Outcome>,
    pub run: Mutex<Outcome>,
    /// Chunks emitted through the progress sink before completion.
    pub chunks: Mutex<Vec<String>>,
    /// Simulated execution duration.
    pub delay: Mutex<Option<Duration>>,
    /// Destinations of every transferred file.
    pub transferred: Mutex<Vec<String>>,
    pub last_timeout: Mutex<Option<u64>>,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            build: Mutex::new(Outcome::Succeed("build done\n".to_string())),
            run: Mutex::new(Outcome::Succeed("run done\n".to_string())),
            chunks: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
            transferred: Mutex::new(Vec::new()),
            last_timeout: Mutex::new(None),
        })
    }

    pub fn record(&self, call: &str) {
        self.calls.lock().expect("calls lock").push(call.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn set_run(&self, outcome: Outcome) {
        *self.run.lock().expect("run lock") = outcome;
    }

    pub fn set_build(&self, outcome: Outcome) {
        *self.build.lock().expect("build lock") = outcome;
    }

    pub fn set_chunks(&self, chunks: &[&str]) {
        *self.chunks.lock().expect("chunks lock") =
            chunks.iter().map(|c| c.to_string()).collect();
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("delay lock") = Some(delay);
    }

    pub fn transferred(&self) -> Vec<String> {
        self.transferred.lock().expect("transferred lock").clone()
    }
}

pub struct MockConnector {
    pub state: Arc<MockState>,
}

#[async_trait]
impl BackendConnector for MockConnector {
    async fn create(
        &self,
        descriptor: &ComputeSystemDescriptor,
    ) -> ComputeResult<Arc<dyn ComputeBackend>> {
        let backend = MockBackend {
            descriptor: descriptor.clone(),
            state: Arc::clone(&self.state),
        };
        backend.create_resource().await?;
        Ok(Arc::new(backend))
    }

    async fn attach(
        &self,
        descriptor: &ComputeSystemDescriptor,
    ) -> ComputeResult<Arc<dyn ComputeBackend>> {
        Ok(Arc::new(MockBackend {
            descriptor: descriptor.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct MockBackend {
    descriptor: ComputeSystemDescriptor,
    state: Arc<MockState>,
}

impl MockBackend {
    async fn execute(
        &self,
        call: &str,
        outcome: Outcome,
        files: &[ComputeFile],
        timeout: Option<u64>,
        progress: Option<ProgressSink>,
    ) -> ComputeResult<String> {
        self.state.record(call);
        *self.state.last_timeout.lock().expect("timeout lock") = timeout;
        {
            let mut transferred = self.state.transferred.lock().expect("transferred lock");
            transferred.extend(files.iter().map(|f| f.destination.clone()));
        }
        if let Some(sink) = &progress {
            for chunk in self.state.chunks.lock().expect("chunks lock").iter() {
                let _ = sink.send(chunk.clone());
            }
        }
        let delay = *self.state.delay.lock().expect("delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match outcome {
            Outcome::Succeed(output) => Ok(output),
            Outcome::Fail(output) => Err(ComputeError::Execution { status: 2, output }),
            Outcome::Unavailable(reason) => Err(ComputeError::Unavailable(reason)),
        }
    }
}

#[async_trait]
impl ComputeBackend for MockBackend {
    async fn create_resource(&self) -> ComputeResult<()> {
        self.state.record("create_resource");
        Ok(())
    }

    async fn build_system(
        &self,
        files: &[ComputeFile],
        timeout: Option<u64>,
        progress: Option<ProgressSink>,
    ) -> ComputeResult<String> {
        let outcome = self.state.build.lock().expect("build lock").clone();
        self.execute("build", outcome, files, timeout, progress).await
    }

    async fn run_system(
        &self,
        files: &[ComputeFile],
        timeout: Option<u64>,
        progress: Option<ProgressSink>,
    ) -> ComputeResult<String> {
        let outcome = self.state.run.lock().expect("run lock").clone();
        self.execute("run", outcome, files, timeout, progress).await
    }

    async fn stop_command(&self) -> ComputeResult<()> {
        self.state.record("stop");
        Ok(())
    }

    async fn get_result(&self, path: &str) -> ComputeResult<PathBuf> {
        self.state.record("get_result");
        let file_name = Path::new(path)
            .file_name()
            .ok_or_else(|| ComputeError::FileTransfer(format!("no file name in '{path}'")))?;
        let results_dir = self.descriptor.local_dir.join("results");
        std::fs::create_dir_all(&results_dir)
            .map_err(|e| ComputeError::FileTransfer(e.to_string()))?;
        let destination = results_dir.join(file_name);
        std::fs::write(&destination, b"result-content")
            .map_err(|e| ComputeError::FileTransfer(e.to_string()))?;
        Ok(destination)
    }

    async fn remove_resource(&self) -> ComputeResult<()> {
        self.state.record("remove");
        Ok(())
    }
}

/// A store wired to the mock backend plus the directories it lives in.
pub struct Fixture {
    pub store: Arc<SessionStore>,
    pub state: Arc<MockState>,
    pub source: DirectorySource,
    pub sessions: TempDir,
    pub systems: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let sessions = tempfile::tempdir().expect("sessions dir");
        let systems = tempfile::tempdir().expect("systems dir");
        let state = MockState::new();
        let config = RuntimeConfig {
            sessions_dir: sessions.path().to_path_buf(),
            backend: BackendKind::Docker,
            port: 0,
        };
        let store = Arc::new(SessionStore::new(
            &config,
            Arc::new(MockConnector {
                state: Arc::clone(&state),
            }),
        ));
        let source = DirectorySource::new(systems.path());
        Self {
            store,
            state,
            source,
            sessions,
            systems,
        }
    }

    /// Writes a system tree under `<systems>/<name>/<version>/`.
    pub fn write_system(&self, name: &str, version: &str, definition: &serde_json::Value) {
        let dir = self.systems.path().join(name).join(version);
        std::fs::create_dir_all(&dir).expect("system dir");
        std::fs::write(dir.join("definition.json"), definition.to_string())
            .expect("definition file");
        std::fs::write(dir.join("Makefile"), "all:\n\ttrue\n").expect("repo file");
    }
}

/// The reference definition used across suites: optional build command,
/// a boolean build parameter gating a trace result, and a run-side file
/// parameter.
pub fn demo_definition(with_build: bool) -> serde_json::Value {
    let mut definition = serde_json::json!({
        "format": "system-definition:1.0",
        "name": "demo",
        "version": "1.0",
        "image": "demo:latest",
        "run_command": "./run",
        "build_parameters": { "tracing": false },
        "run_parameters": {
            "steps": 100,
            "stimuli": {
                "default_value": "data/default.bin",
                "constraint": { "is_file": true }
            }
        },
        "results": {
            "log.txt": { "kind": "text", "path": "out/log.txt" },
            "trace.vcd": {
                "kind": "vcd",
                "path": "out/trace.vcd",
                "enabled_by": ["build/tracing"]
            }
        }
    });
    if with_build {
        definition["build_command"] = serde_json::json!("make");
    }
    definition
}

/// A create request for the demo system with the given override maps.
pub fn demo_request(overrides: serde_json::Value) -> CreateSessionRequest {
    let mut configuration = serde_json::json!({
        "format": "system-configuration:1.0",
        "system": { "name": "demo", "version": "1.0" }
    });
    if let Some(map) = overrides.as_object() {
        for (key, value) in map {
            configuration[key] = value.clone();
        }
    }
    serde_json::from_value(serde_json::json!({
        "configuration": configuration,
        "creator": "tester",
        "display_name": "demo session"
    }))
    .expect("request parses")
}
