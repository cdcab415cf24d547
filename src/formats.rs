//! Document formats exchanged with the runtime.
//!
//! System definitions and configurations arrive as already-deserialized,
//! typed documents; this module holds their types, the format version tags
//! and the parse-time validation rules. Constraint violations fail here,
//! never at use time.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Format tags this core understands. Documents carrying any other tag are
/// rejected during validation.
pub const DEFINITION_FORMAT: &str = "system-definition:1.0";
pub const CONFIGURATION_FORMAT: &str = "system-configuration:1.0";
pub const SESSION_INFO_FORMAT: &str = "session-info:1.0";

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Created,
    Building,
    Built,
    FailedBuild,
    Running,
    Ran,
    FailedRun,
}

impl State {
    /// True while a command is executing and the session must not be mutated.
    pub fn is_busy(&self) -> bool {
        matches!(self, State::Building | State::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Created => "created",
            State::Building => "building",
            State::Built => "built",
            State::FailedBuild => "failed_build",
            State::Running => "running",
            State::Ran => "ran",
            State::FailedRun => "failed_run",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three parameter groups, one per lifecycle phase that consumes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterGroup {
    Common,
    Build,
    Run,
}

impl ParameterGroup {
    pub const ALL: [ParameterGroup; 3] =
        [ParameterGroup::Common, ParameterGroup::Build, ParameterGroup::Run];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterGroup::Common => "common",
            ParameterGroup::Build => "build",
            ParameterGroup::Run => "run",
        }
    }
}

impl fmt::Display for ParameterGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A primitive parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Primitive kind name, used for constraint type checks and messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "boolean",
            ParamValue::Int(_) => "integer",
            ParamValue::Float(_) => "float",
            ParamValue::Text(_) => "text",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => f.write_str(v),
        }
    }
}

/// Constraint metadata a definition may attach to a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Constraint {
    /// The value must be a member of a fixed set.
    Enum { values: Vec<ParamValue> },
    /// The value must be numeric and inside `[lower, upper]`.
    Range { lower: f64, upper: f64 },
    /// The value is a path to a file inside the workspace.
    File { is_file: bool },
}

/// A parameter entry of the definition document: either a bare default or a
/// complex spec carrying constraint metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefinitionParameter {
    Complex(ComplexParameter),
    Primitive(ParamValue),
}

impl DefinitionParameter {
    pub fn default_value(&self) -> &ParamValue {
        match self {
            DefinitionParameter::Primitive(value) => value,
            DefinitionParameter::Complex(complex) => &complex.default_value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexParameter {
    pub default_value: ParamValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<Constraint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ComplexParameter {
    pub fn is_file(&self) -> bool {
        matches!(&self.constraint, Some(Constraint::File { is_file: true }))
    }

    /// Checks that the default is legal for the attached constraint.
    fn check_default(&self, name: &str) -> Result<(), SessionError> {
        match &self.constraint {
            Some(Constraint::Enum { values }) => {
                let Some(first) = values.first() else {
                    return Err(SessionError::Validation(format!(
                        "parameter '{name}': enum constraint declares no values"
                    )));
                };
                if self.default_value.kind() != first.kind() {
                    return Err(SessionError::Validation(format!(
                        "parameter '{name}': enum default has kind '{}' but the enum values are '{}'",
                        self.default_value.kind(),
                        first.kind()
                    )));
                }
                if !values.contains(&self.default_value) {
                    return Err(SessionError::Validation(format!(
                        "parameter '{name}': default '{}' is not a member of the enum values",
                        self.default_value
                    )));
                }
            }
            Some(Constraint::Range { lower, upper }) => {
                let Some(value) = self.default_value.as_f64() else {
                    return Err(SessionError::Validation(format!(
                        "parameter '{name}': range default '{}' is not numeric",
                        self.default_value
                    )));
                };
                if value < *lower || value > *upper {
                    return Err(SessionError::Validation(format!(
                        "parameter '{name}': default {value} lies outside [{lower}, {upper}]"
                    )));
                }
            }
            Some(Constraint::File { .. }) => {
                if !matches!(self.default_value, ParamValue::Text(_)) {
                    return Err(SessionError::Validation(format!(
                        "parameter '{name}': default of a file parameter must be a path string"
                    )));
                }
            }
            None => {}
        }
        Ok(())
    }
}

/// Artifact types a system may declare as results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Binary,
    Text,
    Vcd,
    Fst,
    Performance,
    SimulationSpeed,
    JunitXml,
    Gprof,
    ProfileCsv,
}

/// One declared result: an artifact the system may produce, optionally
/// gated by boolean enabling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSpec {
    pub kind: ResultKind,
    /// Path inside the execution workspace, relative to the work directory.
    pub path: String,
    /// `group/name` references to boolean parameters gating this result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_by: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Splits an `enabled_by` reference of the form `group/name`.
pub fn parse_enabler(entry: &str) -> Result<(ParameterGroup, &str), SessionError> {
    let invalid = || {
        SessionError::Validation(format!(
            "enabling reference '{entry}' must have the form '<group>/<parameter>'"
        ))
    };
    let (group, name) = entry.split_once('/').ok_or_else(invalid)?;
    if name.is_empty() {
        return Err(invalid());
    }
    let group = match group {
        "common" => ParameterGroup::Common,
        "build" => ParameterGroup::Build,
        "run" => ParameterGroup::Run,
        _ => return Err(invalid()),
    };
    Ok((group, name))
}

/// The immutable, versioned specification of a system: image, commands,
/// parameter schema and declared results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemDefinition {
    #[serde(default = "definition_format")]
    pub format: String,
    pub name: String,
    pub version: String,
    pub image: String,
    #[serde(default)]
    pub build_command: Option<String>,
    pub run_command: String,
    #[serde(default)]
    pub delete_command: Option<String>,
    #[serde(default)]
    pub common_parameters: Option<BTreeMap<String, DefinitionParameter>>,
    #[serde(default)]
    pub build_parameters: Option<BTreeMap<String, DefinitionParameter>>,
    #[serde(default)]
    pub run_parameters: Option<BTreeMap<String, DefinitionParameter>>,
    #[serde(default)]
    pub results: Option<BTreeMap<String, ResultSpec>>,
}

fn definition_format() -> String {
    DEFINITION_FORMAT.to_string()
}

impl SystemDefinition {
    /// Parameter map of one group, addressed by the group tag.
    pub fn parameters(&self, group: ParameterGroup) -> Option<&BTreeMap<String, DefinitionParameter>> {
        match group {
            ParameterGroup::Common => self.common_parameters.as_ref(),
            ParameterGroup::Build => self.build_parameters.as_ref(),
            ParameterGroup::Run => self.run_parameters.as_ref(),
        }
    }

    /// True when the definition declares a non-empty build command.
    pub fn has_build(&self) -> bool {
        self.build_command
            .as_deref()
            .is_some_and(|command| !command.trim().is_empty())
    }

    /// Full parse-time validation: format tag, commands, constraint
    /// defaults and result enabler references.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.format != DEFINITION_FORMAT {
            return Err(SessionError::Validation(format!(
                "unrecognized definition format tag '{}' (expected '{DEFINITION_FORMAT}')",
                self.format
            )));
        }
        if self.run_command.trim().is_empty() {
            return Err(SessionError::Validation(
                "no run command specified in the system definition".to_string(),
            ));
        }
        for group in ParameterGroup::ALL {
            if let Some(parameters) = self.parameters(group) {
                for (name, parameter) in parameters {
                    if let DefinitionParameter::Complex(complex) = parameter {
                        complex.check_default(name)?;
                    }
                }
            }
        }
        for (result_name, spec) in self.results.iter().flatten() {
            for entry in spec.enabled_by.iter().flatten() {
                let (group, name) = parse_enabler(entry)?;
                let Some(parameter) = self.parameters(group).and_then(|map| map.get(name)) else {
                    return Err(SessionError::Validation(format!(
                        "result '{result_name}': enabling parameter '{entry}' does not exist"
                    )));
                };
                if !matches!(parameter.default_value(), ParamValue::Bool(_)) {
                    return Err(SessionError::Validation(format!(
                        "result '{result_name}': enabling parameter '{entry}' must be boolean"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Name and version identifying one system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemIdentity {
    pub name: String,
    pub version: String,
}

/// A configuration-side override: a primitive value, or for file parameters
/// a URL with an optional credential token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Url {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<String>,
    },
    Value(ParamValue),
}

/// The user-supplied concrete parameter values for one system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfiguration {
    #[serde(default = "configuration_format")]
    pub format: String,
    pub system: SystemIdentity,
    #[serde(default)]
    pub common_parameters: Option<BTreeMap<String, Option<ConfigValue>>>,
    #[serde(default)]
    pub build_parameters: Option<BTreeMap<String, Option<ConfigValue>>>,
    #[serde(default)]
    pub run_parameters: Option<BTreeMap<String, Option<ConfigValue>>>,
}

fn configuration_format() -> String {
    CONFIGURATION_FORMAT.to_string()
}

impl SystemConfiguration {
    pub fn parameters(
        &self,
        group: ParameterGroup,
    ) -> Option<&BTreeMap<String, Option<ConfigValue>>> {
        match group {
            ParameterGroup::Common => self.common_parameters.as_ref(),
            ParameterGroup::Build => self.build_parameters.as_ref(),
            ParameterGroup::Run => self.run_parameters.as_ref(),
        }
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.format != CONFIGURATION_FORMAT {
            return Err(SessionError::Validation(format!(
                "unrecognized configuration format tag '{}' (expected '{CONFIGURATION_FORMAT}')",
                self.format
            )));
        }
        Ok(())
    }
}

/// One timestamped entry of the append-only session log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub producer: String,
    pub message: String,
}

/// Transport projection of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub format: String,
    pub display_name: String,
    pub system_name: String,
    pub system_version: String,
    pub creator_name: String,
    pub creation_date: DateTime<Utc>,
    pub description: String,
    pub state: State,
    pub log: Vec<LogEntry>,
    pub configuration: SystemConfiguration,
}

/// Availability of one declared result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultInfo {
    pub name: String,
    pub kind: ResultKind,
    pub available: bool,
    /// Why the result is unavailable; `None` when it is available.
    pub message: Option<String>,
}

/// Payload of a create-session request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub configuration: SystemConfiguration,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Payload of a parameter update request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateParameterRequest {
    pub name: String,
    pub value: ParamValue,
}
