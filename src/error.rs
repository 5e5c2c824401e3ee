use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a resource request cannot be satisfied by the machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error(
        "{required} cores per task are required but only {available} cores per node are available"
    )]
    InsufficientCores { required: usize, available: usize },
    #[error("at least {required} tasks are required but only {available} fit on the available cores")]
    InsufficientTasks { required: usize, available: usize },
    #[error("derived setting {setting}={value} exceeds the limit of {limit}")]
    IncompatibleDerivedSetting {
        setting: &'static str,
        value: usize,
        limit: usize,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    /// Bad configuration or suite definition, detected before anything runs.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// A step was requested or excluded that the test case does not contain.
    #[error("Step '{step}' was {action} but is not one of the steps in test case '{test_case}' ({known}){}",
        suggestion.as_ref().map(|s| format!("; did you mean '{s}'?")).unwrap_or_default())]
    UnknownStep {
        test_case: String,
        step: String,
        action: &'static str,
        known: String,
        suggestion: Option<String>,
    },
    #[error("Substep '{substep}' cannot be fitted: {source}")]
    Resource {
        substep: String,
        #[source]
        source: ResourceError,
    },
    #[error("Resources of substep '{0}' can no longer be configured after fitting")]
    ConfigurationTooLate(String),
    #[error("Substep '{0}' has not been fitted to the machine yet")]
    NotFitted(String),
    #[error("Input file(s) missing in step '{step}': {}", paths.join(", "))]
    MissingInputs { step: String, paths: Vec<String> },
    #[error("Output file(s) missing in step '{step}': {}", paths.join(", "))]
    MissingOutputs { step: String, paths: Vec<String> },
    #[error("Command `{command}` failed ({})",
        code.map(|c| format!("exit code {c}")).unwrap_or_else(|| "terminated by signal".into()))]
    ExternalProcess { command: String, code: Option<i32> },
    #[error("Failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("No callback registered under the name '{0}'")]
    UnknownCallback(String),
    #[error("Validation failed: {0}")]
    ValidationMismatch(String),
    #[error("Persisted state at {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },
    #[error("Template error: {0}")]
    Template(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Failure reported by an in-process callback, carried unchanged.
    #[error(transparent)]
    Work(#[from] anyhow::Error),
}

impl Error {
    pub fn resource(substep: impl Into<String>, source: ResourceError) -> Self {
        Error::Resource {
            substep: substep.into(),
            source,
        }
    }

    pub fn persistence(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Persistence {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
