//! Session entity: state machine, parameter operations and result
//! availability evaluation.

pub mod store;

pub use store::{ExecuteMode, ExecuteOutcome, SessionGuard, SessionStore};

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::DEFAULT_CREATOR;
use crate::error::SessionError;
use crate::formats::{
    parse_enabler, CreateSessionRequest, LogEntry, ParamValue, ParameterGroup, ResultInfo,
    SessionInfo, State, SESSION_INFO_FORMAT,
};
use crate::params::Parameter;
use crate::system::{Command, System};

/// Header line every execution log entry starts with; streamed output is
/// appended behind it.
pub(crate) const EXECUTION_HEADER: &str = "--- starting execution ---\n";

/// Metadata describing a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetails {
    pub display_name: String,
    pub description: String,
    pub creator_name: String,
    pub creation_date: DateTime<Utc>,
}

impl SessionDetails {
    /// Builds details from a create request, filling defaults.
    pub fn from_request(request: &CreateSessionRequest) -> Self {
        Self {
            display_name: request.display_name.clone().unwrap_or_default(),
            description: request.description.clone().unwrap_or_default(),
            creator_name: request
                .creator
                .clone()
                .unwrap_or_else(|| DEFAULT_CREATOR.to_string()),
            creation_date: Utc::now(),
        }
    }
}

/// One user-initiated attempt to build and run exactly one resolved system
/// configuration.
#[derive(Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub details: SessionDetails,
    pub state: State,
    /// Append-only, ordered log of execution output.
    pub log: Vec<LogEntry>,
    pub system: System,
}

impl Session {
    /// Creates a session around a freshly resolved system. Systems without
    /// a build command start in `built`: their build phase is elided.
    pub fn new(session_id: Uuid, system: System, details: SessionDetails) -> Self {
        let state = if system.has_build {
            State::Created
        } else {
            State::Built
        };
        Self {
            session_id,
            details,
            state,
            log: Vec::new(),
            system,
        }
    }

    pub fn status(&self) -> State {
        self.state
    }

    /// Checks that `command` may start in the current state. A run on a
    /// system with a build command requires an attempted build first.
    pub fn check_execute_preconditions(&self, command: Command) -> Result<(), SessionError> {
        if self.state.is_busy() {
            return Err(SessionError::UnexpectedState(format!(
                "cannot execute '{command}' while the session is '{}'",
                self.state
            )));
        }
        if command == Command::Run
            && self.system.has_build
            && !matches!(self.state, State::Built | State::Ran | State::FailedRun)
        {
            return Err(SessionError::UnexpectedState(format!(
                "cannot execute 'run' in state '{}': the system must be built first",
                self.state
            )));
        }
        Ok(())
    }

    /// Opens the log entry an execution appends its output to.
    pub fn push_log_entry(&mut self, command: Command) {
        self.log.push(LogEntry {
            timestamp: Utc::now(),
            producer: format!("container.{command}"),
            message: EXECUTION_HEADER.to_string(),
        });
    }

    pub fn append_to_last_log(&mut self, text: &str) {
        if let Some(entry) = self.log.last_mut() {
            entry.message.push_str(text);
        }
    }

    /// True while the last execution log entry carries nothing but its
    /// header, i.e. no streamed output arrived.
    pub fn last_log_is_bare_header(&self) -> bool {
        self.log
            .last()
            .is_some_and(|entry| entry.message == EXECUTION_HEADER)
    }

    /// Parameter mutations invalidate completed phases: common/build
    /// changes fall back behind the build, run changes behind the run.
    fn regress_after_mutation(&mut self, group: ParameterGroup) {
        let previous = self.state;
        match group {
            ParameterGroup::Common | ParameterGroup::Build => {
                if matches!(
                    self.state,
                    State::Built | State::FailedBuild | State::Ran | State::FailedRun
                ) {
                    self.state = if self.system.has_build {
                        State::Created
                    } else {
                        State::Built
                    };
                }
            }
            ParameterGroup::Run => {
                if matches!(self.state, State::Ran | State::FailedRun) {
                    self.state = State::Built;
                }
            }
        }
        if previous != self.state {
            info!(
                "parameter change moved session '{}' from '{previous}' back to '{}'",
                self.session_id, self.state
            );
        }
    }

    /// Mutations are forbidden outright while a command executes.
    fn ensure_mutable(&self) -> Result<(), SessionError> {
        if self.state.is_busy() {
            return Err(SessionError::Locked(self.session_id));
        }
        Ok(())
    }

    fn parameter_mut(
        &mut self,
        group: ParameterGroup,
        name: &str,
    ) -> Result<&mut Parameter, SessionError> {
        self.system.parameters.find_mut(group, name).ok_or_else(|| {
            SessionError::Validation(format!(
                "parameter '{name}' in group '{group}' is not part of the system definition"
            ))
        })
    }

    /// Updates a parameter value and regresses the state as needed.
    pub fn update_parameter(
        &mut self,
        group: ParameterGroup,
        name: &str,
        value: ParamValue,
    ) -> Result<(), SessionError> {
        self.ensure_mutable()?;
        self.parameter_mut(group, name)?.update(value);
        self.regress_after_mutation(group);
        Ok(())
    }

    /// Attaches uploaded content to a file parameter.
    pub async fn add_file(
        &mut self,
        group: ParameterGroup,
        name: &str,
        file_name: &str,
        content: &[u8],
    ) -> Result<(), SessionError> {
        self.ensure_mutable()?;
        info!("processing upload for file parameter '{name}' of group '{group}'");
        let inputs_dir = self.system.descriptor.local_dir.join("inputs");
        self.parameter_mut(group, name)?
            .add_file(&inputs_dir, group, file_name, content)
            .await?;
        self.regress_after_mutation(group);
        Ok(())
    }

    /// Resets a parameter to its recorded default.
    pub async fn reset_parameter(
        &mut self,
        group: ParameterGroup,
        name: &str,
    ) -> Result<(), SessionError> {
        self.ensure_mutable()?;
        info!("resetting parameter '{name}' of group '{group}'");
        self.parameter_mut(group, name)?.reset().await?;
        self.regress_after_mutation(group);
        Ok(())
    }

    /// Values of one group as the transport renders them: file parameters
    /// show the path the running system reads them from.
    pub fn parameter_values(&self, group: ParameterGroup) -> BTreeMap<String, ParamValue> {
        self.system
            .parameters
            .group(group)
            .iter()
            .map(|parameter| {
                let value = match &parameter.file {
                    Some(file) if file.container_path.is_some() => {
                        ParamValue::Text(file.container_path.clone().unwrap_or_default())
                    }
                    _ => parameter.value.clone(),
                };
                (parameter.name.clone(), value)
            })
            .collect()
    }

    /// Evaluates whether a declared result can be fetched right now.
    ///
    /// Results without enablers exist only after a completed run. Enabler
    /// references must point at boolean parameters that are currently true;
    /// additionally a `build` enabler requires at least an attempted build
    /// and a `run` enabler a completed run. The first failing condition
    /// short-circuits with its reason.
    pub fn result_availability(
        &self,
        name: &str,
    ) -> Result<(bool, Option<String>), SessionError> {
        let Some(spec) = self.system.results.get(name) else {
            return Err(SessionError::Validation(format!(
                "result '{name}' is not declared by the system definition"
            )));
        };
        let Some(enabled_by) = spec.enabled_by.as_ref().filter(|e| !e.is_empty()) else {
            if self.state != State::Ran {
                return Ok((
                    false,
                    Some(format!(
                        "result '{name}' is not available: session state is '{}' but at least \
                         '{}' is required",
                        self.state,
                        State::Ran
                    )),
                ));
            }
            return Ok((true, None));
        };

        for entry in enabled_by {
            let (group, parameter_name) = parse_enabler(entry)?;
            let Some(parameter) = self.system.parameters.find(group, parameter_name) else {
                return Ok((
                    false,
                    Some(format!(
                        "result '{name}' cannot be generated: enabling parameter '{entry}' does \
                         not exist; the system definition is invalid for this result"
                    )),
                ));
            };
            match &parameter.value {
                ParamValue::Bool(true) => {}
                ParamValue::Bool(false) => {
                    return Ok((
                        false,
                        Some(format!(
                            "result '{name}' is not available: required parameter \
                             '{parameter_name}' is not set to 'true'"
                        )),
                    ));
                }
                _ => {
                    return Ok((
                        false,
                        Some(format!(
                            "result '{name}' cannot be generated: required parameter \
                             '{parameter_name}' is not a boolean type; the system definition is \
                             invalid for this result"
                        )),
                    ));
                }
            }
            match group {
                ParameterGroup::Build
                    if !matches!(
                        self.state,
                        State::Built | State::Running | State::Ran | State::FailedRun
                    ) =>
                {
                    return Ok((
                        false,
                        Some(format!(
                            "result '{name}' is not available: session state is '{}' but at \
                             least '{}' is required",
                            self.state,
                            State::Built
                        )),
                    ));
                }
                ParameterGroup::Run if self.state != State::Ran => {
                    return Ok((
                        false,
                        Some(format!(
                            "result '{name}' is not available: session state is '{}' but at \
                             least '{}' is required",
                            self.state,
                            State::Ran
                        )),
                    ));
                }
                _ => {}
            }
        }
        Ok((true, None))
    }

    /// Availability of every declared result.
    pub fn result_infos(&self) -> Result<Vec<ResultInfo>, SessionError> {
        let mut infos = Vec::new();
        for (name, spec) in &self.system.results {
            let (available, message) = self.result_availability(name)?;
            infos.push(ResultInfo {
                name: name.clone(),
                kind: spec.kind,
                available,
                message,
            });
        }
        Ok(infos)
    }

    /// Fetches a result file into the session's results directory.
    pub async fn get_result(&self, name: &str) -> Result<PathBuf, SessionError> {
        let (available, message) = self.result_availability(name)?;
        if !available {
            return Err(SessionError::ResultNotAvailable(message.unwrap_or_else(
                || format!("result '{name}' is not available"),
            )));
        }
        let path = self
            .system
            .results
            .get(name)
            .map(|spec| spec.path.clone())
            .unwrap_or_default();
        self.system.get_result(&path).await
    }

    /// Asks the backend to terminate the executing command. The state is
    /// not touched here; the in-flight execution path performs the
    /// terminal transition once the backend call unwinds.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.system.stop().await
    }

    /// Releases the resources of this session.
    pub async fn remove(&self) -> Result<(), SessionError> {
        self.system.remove().await
    }

    /// Transport projection of this session.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            format: SESSION_INFO_FORMAT.to_string(),
            display_name: self.details.display_name.clone(),
            system_name: self.system.identity.name.clone(),
            system_version: self.system.identity.version.clone(),
            creator_name: self.details.creator_name.clone(),
            creation_date: self.details.creation_date,
            description: self.details.description.clone(),
            state: self.state,
            log: self.log.clone(),
            configuration: self.system.current_configuration(),
        }
    }
}
