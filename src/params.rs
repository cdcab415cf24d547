//! Parameter resolution and the file staging pipeline.
//!
//! A [`Parameter`] is constructed once when the system is resolved from its
//! definition and configuration, then mutated in place for the life of the
//! session. File-typed parameters own a small forward-only state machine
//! ([`FileState`]) that `reset` winds back to its starting point.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CONTAINER_WORKDIR;
use crate::error::SessionError;
use crate::formats::{ConfigValue, Constraint, DefinitionParameter, ParamValue, ParameterGroup};

/// States of a file-typed parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// The workspace already carries the file at its definition path;
    /// the staging pipeline never touches it.
    Default,
    /// An origin is configured but the content is not yet on this host.
    Pending,
    /// The content sits in the session's input tree, not yet transferred
    /// into the execution environment.
    Staged,
    /// The execution environment can read the file.
    Available,
}

/// File-specific state, owned exclusively by its [`Parameter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileData {
    /// Logical file name, once known.
    pub file_name: Option<String>,
    pub state: FileState,
    /// In-workspace path the definition declares as default content.
    pub default_path: String,
    /// Where the content comes from: a local path or a URL.
    pub origin: Option<String>,
    /// Staged copy inside the session's input tree.
    pub local_path: Option<PathBuf>,
    /// Path the running system reads the file from.
    pub container_path: Option<String>,
    /// Bearer token attached when fetching the origin URL.
    pub credentials: Option<String>,
}

/// One resolved parameter of a system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: ParamValue,
    pub default: ParamValue,
    /// Set once at resolution time when the configuration overrode the
    /// default; later updates never change it.
    pub overwritten: bool,
    pub constraint: Option<Constraint>,
    pub file: Option<FileData>,
}

/// Path of a staged input in the perspective of the execution environment.
fn container_input_path(group: ParameterGroup, parameter: &str, file_name: &str) -> String {
    format!("{CONTAINER_WORKDIR}/inputs/{group}/{parameter}/{file_name}")
}

fn is_remote_origin(origin: &str) -> bool {
    origin.starts_with("http://") || origin.starts_with("https://") || origin.starts_with("ftp://")
}

impl Parameter {
    /// Resolves one definition entry against its optional configuration
    /// override. `override_value` must already be non-null.
    pub fn resolve(
        name: &str,
        definition: &DefinitionParameter,
        override_value: Option<&ConfigValue>,
    ) -> Result<Self, SessionError> {
        let overwritten = override_value.is_some();
        let default = definition.default_value().clone();
        let constraint = match definition {
            DefinitionParameter::Complex(complex) => complex.constraint.clone(),
            DefinitionParameter::Primitive(_) => None,
        };

        let is_file = match &constraint {
            Some(Constraint::File { is_file: true }) => true,
            Some(Constraint::File { is_file: false }) => {
                // tolerated, but the marker has no effect
                info!("parameter '{name}': file marker set to false is ignored");
                false
            }
            _ => false,
        };

        if !is_file {
            let value = match override_value {
                Some(ConfigValue::Value(value)) => value.clone(),
                Some(ConfigValue::Url { .. }) => {
                    return Err(SessionError::Validation(format!(
                        "parameter '{name}' is not a file parameter and cannot take a URL override"
                    )));
                }
                None => default.clone(),
            };
            return Ok(Self {
                name: name.to_string(),
                value,
                default,
                overwritten,
                constraint,
                file: None,
            });
        }

        // file parameter; the default is its in-workspace path (validated as
        // text at definition-parse time)
        let default_path = match &default {
            ParamValue::Text(path) => path.clone(),
            other => other.to_string(),
        };
        let mut file = FileData {
            file_name: None,
            state: FileState::Default,
            default_path: default_path.clone(),
            origin: None,
            local_path: None,
            container_path: Some(default_path),
            credentials: None,
        };
        let value = match override_value {
            Some(ConfigValue::Url { url, credentials }) => {
                file.origin = Some(url.clone());
                file.credentials = credentials.clone();
                file.state = FileState::Pending;
                file.container_path = None;
                ParamValue::Text(url.clone())
            }
            Some(ConfigValue::Value(value)) => {
                file.origin = Some(value.to_string());
                file.state = FileState::Pending;
                file.container_path = None;
                value.clone()
            }
            None => default.clone(),
        };
        Ok(Self {
            name: name.to_string(),
            value,
            default,
            overwritten,
            constraint,
            file: Some(file),
        })
    }

    /// Replaces the current value. Boolean parameters accept the textual
    /// forms `true`/`false` for convenience.
    pub fn update(&mut self, new_value: ParamValue) {
        info!("updating parameter '{}' to '{new_value}'", self.name);
        let is_bool = matches!(self.value, ParamValue::Bool(_));
        self.value = match (is_bool, new_value) {
            (true, ParamValue::Text(text)) => {
                ParamValue::Bool(text.eq_ignore_ascii_case("true"))
            }
            (_, other) => other,
        };
    }

    /// Restores the parameter to its recorded default. For file parameters
    /// this discards origin, credentials and any locally staged copy.
    /// Idempotent.
    pub async fn reset(&mut self) -> Result<(), SessionError> {
        if let Some(file) = &mut self.file {
            if let Some(local) = file.local_path.take() {
                if tokio::fs::try_exists(&local).await.unwrap_or(false) {
                    tokio::fs::remove_file(&local).await?;
                }
            }
            file.container_path = Some(file.default_path.clone());
            file.state = FileState::Default;
            file.credentials = None;
            file.file_name = None;
            file.origin = None;
        } else {
            self.value = self.default.clone();
        }
        Ok(())
    }

    /// Writes uploaded content for this file parameter into the session's
    /// input tree and marks it staged, regardless of prior state.
    pub async fn add_file(
        &mut self,
        inputs_dir: &Path,
        group: ParameterGroup,
        file_name: &str,
        content: &[u8],
    ) -> Result<(), SessionError> {
        let name = self.name.clone();
        let Some(file) = &mut self.file else {
            return Err(SessionError::Validation(format!(
                "parameter '{name}' is not a file parameter and cannot take an upload"
            )));
        };
        if file.container_path.is_none() && file.origin.is_none() {
            return Err(SessionError::Validation(format!(
                "corrupted file parameter '{name}': neither a workspace path nor an origin"
            )));
        }
        let directory = inputs_dir.join(group.as_str()).join(&name);
        tokio::fs::create_dir_all(&directory).await?;
        let destination = directory.join(file_name);
        tokio::fs::write(&destination, content).await?;
        file.file_name = Some(file_name.to_string());
        file.container_path = Some(container_input_path(group, &name, file_name));
        file.local_path = Some(destination);
        file.state = FileState::Staged;
        debug!("stored uploaded file for parameter '{name}'");
        Ok(())
    }

    /// Makes a pending file physically present in the session's input tree.
    /// No-op for non-file parameters and for files already staged or still
    /// at their default.
    pub async fn stage(
        &mut self,
        inputs_dir: &Path,
        group: ParameterGroup,
    ) -> Result<(), SessionError> {
        let name = self.name.clone();
        let Some(file) = &mut self.file else {
            debug!("skipping non-file parameter '{name}' during staging");
            return Ok(());
        };
        match file.state {
            FileState::Pending => {}
            FileState::Staged => {
                info!("file parameter '{name}' is already staged");
                return Ok(());
            }
            FileState::Default | FileState::Available => return Ok(()),
        }

        let origin = file.origin.clone().unwrap_or_default();
        let directory = inputs_dir.join(group.as_str()).join(&name);

        if tokio::fs::metadata(&origin)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            info!("staging file parameter '{name}' from local path '{origin}'");
            let file_name = Path::new(&origin)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| name.clone());
            tokio::fs::create_dir_all(&directory).await?;
            let destination = directory.join(&file_name);
            tokio::fs::copy(&origin, &destination).await?;
            file.container_path = Some(container_input_path(group, &name, &file_name));
            file.local_path = Some(destination);
            file.file_name = Some(file_name);
            file.state = FileState::Staged;
        } else if is_remote_origin(&origin) {
            info!("staging file parameter '{name}' from URL '{origin}'");
            let client = reqwest::Client::new();
            let mut request = client.get(&origin);
            if let Some(token) = &file.credentials {
                request = request.bearer_auth(token);
            }
            let response = request.send().await.map_err(|e| SessionError::FileStaging {
                parameter: name.clone(),
                reason: format!("download from '{origin}' failed: {e}"),
            })?;
            if !response.status().is_success() {
                return Err(SessionError::FileStaging {
                    parameter: name.clone(),
                    reason: format!(
                        "download from '{origin}' failed with status {}",
                        response.status()
                    ),
                });
            }
            let content = response.bytes().await.map_err(|e| SessionError::FileStaging {
                parameter: name.clone(),
                reason: format!("download from '{origin}' was interrupted: {e}"),
            })?;
            // the file name is the last path segment of the URL
            let file_name = origin
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|segment| !segment.is_empty())
                .unwrap_or("download")
                .to_string();
            tokio::fs::create_dir_all(&directory).await?;
            let destination = directory.join(&file_name);
            tokio::fs::write(&destination, &content).await?;
            file.container_path = Some(container_input_path(group, &name, &file_name));
            file.local_path = Some(destination);
            file.file_name = Some(file_name);
            file.state = FileState::Staged;
        } else {
            return Err(SessionError::FileStaging {
                parameter: name.clone(),
                reason: format!(
                    "origin '{origin}' is neither an existing local file nor a supported URL; \
                     upload the file explicitly"
                ),
            });
        }
        Ok(())
    }

    /// Batch step after a successful transfer into the execution
    /// environment: staged content becomes readable by the running system.
    pub fn mark_available(&mut self) {
        if let Some(file) = &mut self.file {
            if file.state == FileState::Staged {
                file.state = FileState::Available;
            }
        }
    }
}
