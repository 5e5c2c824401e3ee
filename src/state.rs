//! Schema-versioned state written by `setup` and read back by `run`.
//!
//! A work directory holds one `<suite>.suite.json` at its root, a
//! `test_case.json` in every test case directory and a `step.json` in every
//! step directory, so `run` can be started from any of those levels.

use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    config::RunnerConfig,
    error::{Error, Result},
    suite::TestSuite,
    test_case::TestCase,
};

pub const SCHEMA_VERSION: u32 = 1;
pub const SUITE_SUFFIX: &str = ".suite.json";
pub const TEST_CASE_FILE: &str = "test_case.json";
pub const STEP_FILE: &str = "step.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistedState {
    pub schema_version: u32,
    pub config: RunnerConfig,
    pub state: StatePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatePayload {
    Suite { suite: TestSuite },
    TestCase { test_case: TestCase },
    /// A test case together with the one step this directory belongs to.
    Step { test_case: TestCase, step: String },
}

impl StatePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            StatePayload::Suite { .. } => "suite",
            StatePayload::TestCase { .. } => "test_case",
            StatePayload::Step { .. } => "step",
        }
    }
}

impl PersistedState {
    pub fn new(config: RunnerConfig, state: StatePayload) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            config,
            state,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|err| Error::persistence(path, err))?;
        fs::write(path, bytes).map_err(|err| Error::persistence(path, err))?;
        debug!(path = %path.display(), kind = self.state.kind(), "Wrote persisted state");
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = fs::read(path).map_err(|err| Error::persistence(path, err))?;
        let value: Value = serde_json::from_slice(&raw).map_err(|err| Error::persistence(path, err))?;
        let version = value.get("schema_version").and_then(Value::as_u64);
        if version != Some(u64::from(SCHEMA_VERSION)) {
            return Err(Error::persistence(
                path,
                format!(
                    "unsupported schema version {} (expected {SCHEMA_VERSION}); run setup again",
                    version.map_or_else(|| "none".to_string(), |v| v.to_string())
                ),
            ));
        }
        let state: Self = serde_json::from_value(value).map_err(|err| Error::persistence(path, err))?;
        state.config.validate().map_err(|err| Error::persistence(path, format!("{err:#}")))?;
        Ok(state)
    }
}

pub fn suite_file(work_dir: &Path, suite: &str) -> PathBuf {
    work_dir.join(format!("{suite}{SUITE_SUFFIX}"))
}

/// Suite names with a state file directly in `work_dir`, sorted.
pub fn find_suites(work_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(work_dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str()
            && let Some(suite) = name.strip_suffix(SUITE_SUFFIX)
            && entry.file_type()?.is_file()
        {
            names.push(suite.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Files written by [`setup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupSummary {
    pub suite_file: PathBuf,
    pub test_case_files: Vec<PathBuf>,
    pub step_files: Vec<PathBuf>,
}

/// Validates `suite` and writes the whole state tree below `work_dir`.
pub fn setup(work_dir: &Path, suite: &TestSuite, config: &RunnerConfig) -> Result<SetupSummary> {
    suite.check()?;
    config
        .validate()
        .map_err(|err| Error::Configuration(format!("{err:#}")))?;
    fs::create_dir_all(work_dir)?;

    let mut summary = SetupSummary {
        suite_file: suite_file(work_dir, &suite.name),
        ..SetupSummary::default()
    };
    PersistedState::new(
        config.clone(),
        StatePayload::Suite {
            suite: suite.clone(),
        },
    )
    .write(&summary.suite_file)?;

    for case in &suite.test_cases {
        let case_dir = work_dir.join(case.subdir());
        fs::create_dir_all(&case_dir)?;
        let case_file = case_dir.join(TEST_CASE_FILE);
        PersistedState::new(
            config.clone(),
            StatePayload::TestCase {
                test_case: case.clone(),
            },
        )
        .write(&case_file)?;
        summary.test_case_files.push(case_file);

        for step in &case.steps {
            let step_dir = case_dir.join(step.subdir());
            fs::create_dir_all(&step_dir)?;
            let step_file = step_dir.join(STEP_FILE);
            PersistedState::new(
                config.clone(),
                StatePayload::Step {
                    test_case: case.clone(),
                    step: step.name.clone(),
                },
            )
            .write(&step_file)?;
            summary.step_files.push(step_file);
        }
    }
    Ok(summary)
}

pub fn load_suite(path: &Path) -> Result<(RunnerConfig, TestSuite)> {
    let PersistedState { config, state, .. } = PersistedState::read(path)?;
    let mut suite = match state {
        StatePayload::Suite { suite } => suite,
        other => return Err(wrong_kind(path, "suite", &other)),
    };
    suite.check()?;
    let work_dir = path.parent().unwrap_or_else(|| Path::new("."));
    suite.attach(work_dir);
    Ok((config, suite))
}

pub fn load_test_case(case_dir: &Path) -> Result<(RunnerConfig, TestCase)> {
    let path = case_dir.join(TEST_CASE_FILE);
    let PersistedState { config, state, .. } = PersistedState::read(&path)?;
    let mut test_case = match state {
        StatePayload::TestCase { test_case } => test_case,
        other => return Err(wrong_kind(&path, "test_case", &other)),
    };
    test_case.check()?;
    test_case.attach(case_dir);
    Ok((config, test_case))
}

/// Loads the step persisted in `step_dir`, returning its test case and name.
pub fn load_step(step_dir: &Path) -> Result<(RunnerConfig, TestCase, String)> {
    let path = step_dir.join(STEP_FILE);
    let PersistedState { config, state, .. } = PersistedState::read(&path)?;
    let (mut test_case, step) = match state {
        StatePayload::Step { test_case, step } => (test_case, step),
        other => return Err(wrong_kind(&path, "step", &other)),
    };
    test_case.check()?;
    let subdir = test_case
        .step(&step)
        .map(|s| s.subdir().to_string())
        .ok_or_else(|| {
            Error::persistence(&path, format!("test case has no step named '{step}'"))
        })?;
    let case_dir = strip_subdir(step_dir, &subdir).ok_or_else(|| {
        Error::persistence(
            &path,
            format!("{} does not end with the step directory '{subdir}'", step_dir.display()),
        )
    })?;
    test_case.attach(case_dir);
    Ok((config, test_case, step))
}

fn strip_subdir(dir: &Path, subdir: &str) -> Option<PathBuf> {
    let mut base = dir.to_path_buf();
    for component in Path::new(subdir).components().rev() {
        match component {
            Component::Normal(name) if base.file_name() == Some(name) => {
                base.pop();
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(base)
}

fn wrong_kind(path: &Path, expected: &str, found: &StatePayload) -> Error {
    Error::persistence(
        path,
        format!("expected {expected} state but found {}", found.kind()),
    )
}
