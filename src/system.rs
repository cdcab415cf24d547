//! A resolved system instance.
//!
//! Merges a definition document and a configuration document into a
//! coherent parameter set per group, projects the result onto the compute
//! backend and drives file staging and command execution.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::compute::{
    BackendKind, ComputeBackend, ComputeError, ComputeFile, ComputeSystemDescriptor, ProgressSink,
};
use crate::config::CONTAINER_WORKDIR;
use crate::error::SessionError;
use crate::formats::{
    ConfigValue, DefinitionParameter, ParamValue, ParameterGroup, ResultSpec, State,
    SystemConfiguration, SystemDefinition, SystemIdentity, CONFIGURATION_FORMAT,
};
use crate::params::{FileState, Parameter};

/// The commands a session can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Build,
    Run,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Build => "build",
            Command::Run => "run",
        }
    }

    /// State while this command executes.
    pub fn active_state(&self) -> State {
        match self {
            Command::Build => State::Building,
            Command::Run => State::Running,
        }
    }

    pub fn success_state(&self) -> State {
        match self {
            Command::Build => State::Built,
            Command::Run => State::Ran,
        }
    }

    pub fn failure_state(&self) -> State {
        match self {
            Command::Build => State::FailedBuild,
            Command::Run => State::FailedRun,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container-side path of the rendered configuration document; appended as
/// an argument to every build/run/delete command.
fn config_container_path() -> String {
    format!("{CONTAINER_WORKDIR}/inputs/config.json")
}

/// Fixed storage for the three parameter groups, addressed by the group tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterSet {
    common: Vec<Parameter>,
    build: Vec<Parameter>,
    run: Vec<Parameter>,
}

impl ParameterSet {
    pub fn group(&self, group: ParameterGroup) -> &[Parameter] {
        match group {
            ParameterGroup::Common => &self.common,
            ParameterGroup::Build => &self.build,
            ParameterGroup::Run => &self.run,
        }
    }

    fn group_mut(&mut self, group: ParameterGroup) -> &mut Vec<Parameter> {
        match group {
            ParameterGroup::Common => &mut self.common,
            ParameterGroup::Build => &mut self.build,
            ParameterGroup::Run => &mut self.run,
        }
    }

    pub fn find(&self, group: ParameterGroup, name: &str) -> Option<&Parameter> {
        self.group(group).iter().find(|p| p.name == name)
    }

    pub fn find_mut(&mut self, group: ParameterGroup, name: &str) -> Option<&mut Parameter> {
        self.group_mut(group).iter_mut().find(|p| p.name == name)
    }
}

/// One session's resolved system.
#[derive(Serialize, Deserialize)]
pub struct System {
    pub session_id: String,
    pub identity: SystemIdentity,
    pub has_build: bool,
    pub parameters: ParameterSet,
    pub results: BTreeMap<String, ResultSpec>,
    pub descriptor: ComputeSystemDescriptor,
    pub backend_kind: BackendKind,
    /// Live backend handle; reconstructed through a connector after every
    /// snapshot load, never serialized.
    #[serde(skip)]
    backend: Option<Arc<dyn ComputeBackend>>,
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("session_id", &self.session_id)
            .field("identity", &self.identity)
            .field("has_build", &self.has_build)
            .field("parameters", &self.parameters)
            .field("results", &self.results)
            .field("descriptor", &self.descriptor)
            .field("backend_kind", &self.backend_kind)
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

impl System {
    /// Merges a validated definition and configuration into a resolved
    /// system and builds the backend descriptor. The backend handle is
    /// attached separately.
    ///
    /// `local_dir` is the session directory, `repo_dir` the materialized
    /// repository tree inside it.
    pub fn new(
        session_id: &str,
        definition: &SystemDefinition,
        configuration: &SystemConfiguration,
        local_dir: &Path,
        repo_dir: &Path,
        backend_kind: BackendKind,
    ) -> Result<Self, SessionError> {
        definition.validate()?;
        configuration.validate()?;
        if definition.name != configuration.system.name
            || definition.version != configuration.system.version
        {
            return Err(SessionError::Validation(format!(
                "configuration addresses '{}:{}' but the definition is '{}:{}'",
                configuration.system.name,
                configuration.system.version,
                definition.name,
                definition.version
            )));
        }
        info!("resolving system '{}:{}'", definition.name, definition.version);

        let mut parameters = ParameterSet::default();
        for group in ParameterGroup::ALL {
            *parameters.group_mut(group) = resolve_group(
                group,
                definition.parameters(group),
                configuration.parameters(group),
            )?;
        }

        let work_dir = format!("{CONTAINER_WORKDIR}/repository");
        let files = repository_files(repo_dir, &work_dir)?;
        let with_config = |command: &str| format!("{command} {}", config_container_path());

        let descriptor = ComputeSystemDescriptor {
            session_id: session_id.to_string(),
            image: definition.image.clone(),
            local_dir: local_dir.to_path_buf(),
            mount_dir: CONTAINER_WORKDIR.to_string(),
            work_dir,
            build_command: definition
                .build_command
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .map(with_config),
            run_command: with_config(&definition.run_command),
            delete_command: definition
                .delete_command
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .map(with_config),
            files,
            requirements: BTreeMap::new(),
        };

        Ok(Self {
            session_id: session_id.to_string(),
            identity: configuration.system.clone(),
            has_build: definition.has_build(),
            parameters,
            results: definition.results.clone().unwrap_or_default(),
            descriptor,
            backend_kind,
            backend: None,
        })
    }

    /// Hands the reconstructed backend handle to this system.
    pub fn attach_backend(&mut self, backend: Arc<dyn ComputeBackend>) {
        self.backend = Some(backend);
    }

    pub fn backend_arc(&self) -> Result<Arc<dyn ComputeBackend>, SessionError> {
        self.backend.clone().ok_or_else(|| {
            SessionError::Compute(ComputeError::Unavailable(
                "no compute backend attached to this system".to_string(),
            ))
        })
    }

    /// Re-renders the configuration document from live parameter state.
    /// File parameters render the path the running system reads them from.
    pub fn current_configuration(&self) -> SystemConfiguration {
        let render = |group: ParameterGroup| -> Option<BTreeMap<String, Option<ConfigValue>>> {
            let parameters = self.parameters.group(group);
            if parameters.is_empty() {
                return None;
            }
            Some(
                parameters
                    .iter()
                    .map(|parameter| {
                        let value = match &parameter.file {
                            Some(file) if file.container_path.is_some() => ParamValue::Text(
                                file.container_path.clone().unwrap_or_default(),
                            ),
                            _ => parameter.value.clone(),
                        };
                        (parameter.name.clone(), Some(ConfigValue::Value(value)))
                    })
                    .collect(),
            )
        };
        SystemConfiguration {
            format: CONFIGURATION_FORMAT.to_string(),
            system: self.identity.clone(),
            common_parameters: render(ParameterGroup::Common),
            build_parameters: render(ParameterGroup::Build),
            run_parameters: render(ParameterGroup::Run),
        }
    }

    /// Groups whose file parameters are staged for a command.
    fn staged_groups(command: Command) -> [ParameterGroup; 2] {
        match command {
            Command::Build => [ParameterGroup::Common, ParameterGroup::Build],
            Command::Run => [ParameterGroup::Common, ParameterGroup::Run],
        }
    }

    /// Stages every file parameter needed by `command` plus the rendered
    /// configuration document and returns the transfer list.
    pub async fn prepare(&mut self, command: Command) -> Result<Vec<ComputeFile>, SessionError> {
        let inputs_dir = self.descriptor.local_dir.join("inputs");
        let mut files = Vec::new();
        for group in Self::staged_groups(command) {
            for parameter in self.parameters.group_mut(group).iter_mut() {
                parameter.stage(&inputs_dir, group).await?;
                if let Some(file) = &parameter.file {
                    if file.state == FileState::Staged {
                        if let (Some(local), Some(container)) =
                            (&file.local_path, &file.container_path)
                        {
                            files.push(ComputeFile {
                                source: local.clone(),
                                destination: container.clone(),
                            });
                        }
                    }
                }
            }
        }
        files.push(self.render_configuration_file().await?);
        Ok(files)
    }

    /// Marks the staged groups' file parameters available in one batch.
    /// Call only after the backend confirmed the transfer.
    pub fn mark_available(&mut self, command: Command) {
        for group in Self::staged_groups(command) {
            for parameter in self.parameters.group_mut(group).iter_mut() {
                parameter.mark_available();
            }
        }
    }

    /// Stages inputs and executes `command` on the backend, blocking until
    /// it finishes. Building a system without a build command is a no-op.
    pub async fn execute(
        &mut self,
        command: Command,
        timeout: Option<u64>,
        progress: Option<ProgressSink>,
    ) -> Result<String, SessionError> {
        if command == Command::Build && !self.has_build {
            debug!("system has no build command; nothing to execute");
            return Ok(String::new());
        }
        let files = self.prepare(command).await?;
        let backend = self.backend_arc()?;
        let output = match command {
            Command::Build => backend.build_system(&files, timeout, progress).await?,
            Command::Run => backend.run_system(&files, timeout, progress).await?,
        };
        self.mark_available(command);
        Ok(output)
    }

    /// Asks the backend to terminate the command currently executing.
    pub async fn stop(&self) -> Result<(), SessionError> {
        Ok(self.backend_arc()?.stop_command().await?)
    }

    /// Releases the backend resource of this system.
    pub async fn remove(&self) -> Result<(), SessionError> {
        Ok(self.backend_arc()?.remove_resource().await?)
    }

    /// Fetches a result file from the backend; returns its local path.
    pub async fn get_result(&self, path: &str) -> Result<PathBuf, SessionError> {
        Ok(self.backend_arc()?.get_result(path).await?)
    }

    async fn render_configuration_file(&self) -> Result<ComputeFile, SessionError> {
        let inputs_dir = self.descriptor.local_dir.join("inputs");
        tokio::fs::create_dir_all(&inputs_dir).await?;
        let path = inputs_dir.join("config.json");
        let rendered = serde_json::to_string_pretty(&self.current_configuration())?;
        tokio::fs::write(&path, rendered).await?;
        Ok(ComputeFile {
            source: path,
            destination: config_container_path(),
        })
    }
}

/// Resolves one parameter group. Every configuration key must name a
/// definition parameter of the same group.
fn resolve_group(
    group: ParameterGroup,
    definition: Option<&BTreeMap<String, DefinitionParameter>>,
    overrides: Option<&BTreeMap<String, Option<ConfigValue>>>,
) -> Result<Vec<Parameter>, SessionError> {
    if let Some(overrides) = overrides {
        if definition.is_none() && !overrides.is_empty() {
            return Err(SessionError::Validation(format!(
                "configuration group '{group}' does not exist in the system definition"
            )));
        }
        for name in overrides.keys() {
            if !definition.is_some_and(|d| d.contains_key(name)) {
                return Err(SessionError::Validation(format!(
                    "configuration parameter '{name}' in group '{group}' does not exist \
                     in the system definition"
                )));
            }
        }
    }
    let Some(definition) = definition else {
        return Ok(Vec::new());
    };
    let mut resolved = Vec::with_capacity(definition.len());
    for (name, spec) in definition {
        let override_value = overrides.and_then(|o| o.get(name)).and_then(|v| v.as_ref());
        resolved.push(Parameter::resolve(name, spec, override_value)?);
    }
    Ok(resolved)
}

/// Enumerates the repository tree as transfer pairs for the backend.
fn repository_files(
    repo_dir: &Path,
    container_repo_dir: &str,
) -> Result<Vec<ComputeFile>, SessionError> {
    let mut files = Vec::new();
    if !repo_dir.is_dir() {
        return Ok(files);
    }
    for entry in WalkDir::new(repo_dir) {
        let entry = entry.map_err(|e| {
            SessionError::Validation(format!("repository tree cannot be enumerated: {e}"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(repo_dir) else {
            continue;
        };
        files.push(ComputeFile {
            source: entry.path().to_path_buf(),
            destination: format!("{container_repo_dir}/{}", relative.display()),
        });
    }
    Ok(files)
}
