use std::{
    fmt,
    path::{Path, PathBuf},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    environment::Environment,
    error::{Error, Result},
    logging::{LogContext, Propagation},
    step::StepContext,
    suite::TestSuite,
    test_case::{CaseRunOptions, TestCase, ValidationResult},
};

pub const CASE_OUTPUTS_DIR: &str = "case_outputs";

#[derive(Debug, Clone, Copy, Default)]
pub struct RunnerOptions {
    /// Keep step names and failures in the case logs instead of stdout.
    pub quiet: bool,
    pub print_substeps: bool,
}

/// Entry point a run was started through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Suite,
    TestCase,
    Step,
    Substep,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Suite => "suite",
            RunMode::TestCase => "test_case",
            RunMode::Step => "step",
            RunMode::Substep => "substep",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "suite" => Some(RunMode::Suite),
            "test_case" => Some(RunMode::TestCase),
            "step" => Some(RunMode::Step),
            "substep" => Some(RunMode::Substep),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Success,
    Error,
    Pass,
    Fail,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Success => "SUCCESS",
            Status::Error => "ERROR",
            Status::Pass => "PASS",
            Status::Fail => "FAIL",
        })
    }
}

fn pass_fail(value: Option<bool>) -> Option<Status> {
    value.map(|passed| if passed { Status::Pass } else { Status::Fail })
}

/// What happened to one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub name: String,
    pub run_status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_status: Option<Status>,
    pub elapsed_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl CaseRecord {
    pub fn passed(&self) -> bool {
        self.run_status == Status::Success
            && self.internal_status != Some(Status::Fail)
            && self.baseline_status != Some(Status::Fail)
    }

    /// The per-case block printed after each test case.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("  test execution:      {}", self.run_status)];
        if let Some(status) = self.internal_status {
            lines.push(format!("  test validation:     {status}"));
        }
        if let Some(status) = self.baseline_status {
            lines.push(format!("  baseline comparison: {status}"));
        }
        lines
    }
}

/// Aggregate of every test case run by one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub name: String,
    pub cases: Vec<CaseRecord>,
    pub elapsed_secs: f64,
}

impl SuiteReport {
    pub fn failures(&self) -> usize {
        self.cases.iter().filter(|case| !case.passed()).count()
    }

    pub fn passed(&self) -> bool {
        self.failures() == 0
    }

    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec!["Test Runtimes:".to_string()];
        for case in &self.cases {
            let verdict = if case.passed() { Status::Pass } else { Status::Fail };
            lines.push(format!(
                "{} {verdict} {}",
                minutes_seconds(case.elapsed_secs),
                case.name
            ));
        }
        lines.push(format!("Total runtime {}", minutes_seconds(self.elapsed_secs)));
        lines
    }

    pub fn verdict(&self) -> String {
        match self.failures() {
            0 => "PASS: All passed successfully!".to_string(),
            1 => "FAIL: 1 test failed, see above.".to_string(),
            n => format!("FAIL: {n} tests failed, see above."),
        }
    }

    pub fn log_summary(&self, log: &LogContext<'_>) {
        for line in self.summary_lines() {
            log.info(line);
        }
        if self.passed() {
            log.info(self.verdict());
        } else {
            log.error(self.verdict());
        }
    }
}

/// `mm:ss`, rounded to the nearest second.
pub fn minutes_seconds(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// Drives suites, single test cases and single steps.
pub struct Runner {
    env: Environment,
    options: RunnerOptions,
}

impl Runner {
    pub fn new(env: Environment, options: RunnerOptions) -> Self {
        Self { env, options }
    }

    /// Runs every test case of `suite` in order. A failing test case is
    /// recorded and the next one still runs.
    pub async fn run_suite(&self, suite: &mut TestSuite, log: &LogContext<'_>) -> Result<SuiteReport> {
        let outputs_dir = suite.work_dir()?.join(CASE_OUTPUTS_DIR);
        std::fs::create_dir_all(&outputs_dir)?;
        info!(suite = %suite.name, cases = suite.test_cases.len(), "Running suite");
        let start = Instant::now();
        let mut cases = Vec::with_capacity(suite.test_cases.len());
        for case in &mut suite.test_cases {
            log.info(&case.name);
            let log_file = outputs_dir.join(format!("{}.log", case.log_name()));
            let propagation = if self.options.quiet {
                Propagation::Quiet
            } else {
                Propagation::Verbose
            };
            let record = match log.child_file(case.name.as_str(), &log_file, propagation) {
                Ok(case_log) => self.run_case(case, None, &[], &case_log, false).await,
                Err(err) => CaseRecord {
                    name: case.name.clone(),
                    run_status: Status::Error,
                    internal_status: None,
                    baseline_status: None,
                    elapsed_secs: 0.0,
                    error: Some(err.to_string()),
                    log_file: None,
                },
            };
            self.log_case(&record, log);
            cases.push(record);
        }
        let report = SuiteReport {
            name: suite.name.clone(),
            cases,
            elapsed_secs: start.elapsed().as_secs_f64(),
        };
        report.log_summary(log);
        Ok(report)
    }

    /// Runs one test case on its own. Unknown step names fail before anything
    /// runs; everything else is recorded in the report.
    pub async fn run_test_case(
        &self,
        case: &mut TestCase,
        include: Option<&[String]>,
        exclude: &[String],
        log: &LogContext<'_>,
    ) -> Result<SuiteReport> {
        case.resolve_steps(include, exclude)?;
        let start = Instant::now();
        let case_log = log.child(case.name.as_str(), Propagation::Verbose);
        let record = self.run_case(case, include, exclude, &case_log, true).await;
        drop(case_log);
        self.log_case(&record, log);
        let report = SuiteReport {
            name: case.name.clone(),
            cases: vec![record],
            elapsed_secs: start.elapsed().as_secs_f64(),
        };
        report.log_summary(log);
        Ok(report)
    }

    /// Re-fits the test case, runs a single step in it and then validates the
    /// test case. A failed comparison fails the step.
    pub async fn run_step(&self, case: &mut TestCase, step: &str, log: &LogContext<'_>) -> Result<()> {
        let only = [step.to_string()];
        let capacity = self.env.capacity()?;
        case.prepare(
            capacity,
            &self.env.config().resources,
            Some(only.as_slice()),
            &[],
        )?;
        let options = CaseRunOptions {
            step_log_files: false,
            print_substeps: self.options.print_substeps,
        };
        case.run(&self.env, log, options).await?;

        let baseline = self.env.config().validation.baseline_dir.clone();
        let result = case.validate(baseline.as_deref(), self.env.registry(), log)?;
        if !result.passed() {
            return Err(Error::ValidationMismatch(format!(
                "test case '{}' failed validation after step '{step}'",
                case.name
            )));
        }
        Ok(())
    }

    /// Re-fits the test case and runs one substep of `step` in this process.
    pub async fn run_substep(
        &self,
        case: &mut TestCase,
        step: &str,
        substep: &str,
        log: &LogContext<'_>,
    ) -> Result<()> {
        let only = [step.to_string()];
        let capacity = self.env.capacity()?;
        case.prepare(
            capacity,
            &self.env.config().resources,
            Some(only.as_slice()),
            &[],
        )?;
        let target = case
            .step(step)
            .ok_or_else(|| Error::Configuration(format!("unknown step '{step}'")))?;
        let step_dir = case.step_dir(target)?;
        let allocations = case.allocations();
        let ctx = StepContext {
            env: &self.env,
            work_dir: &step_dir,
            log,
            capacity,
            allocations: &allocations,
            print_substeps: false,
        };
        target.run_substep(substep, &ctx).await
    }

    async fn run_case(
        &self,
        case: &mut TestCase,
        include: Option<&[String]>,
        exclude: &[String],
        log: &LogContext<'_>,
        step_log_files: bool,
    ) -> CaseRecord {
        let start = Instant::now();
        let options = CaseRunOptions {
            step_log_files,
            print_substeps: self.options.print_substeps && !self.options.quiet,
        };
        debug!(case = %case.name, "Preparing test case");
        let outcome = match self.env.capacity() {
            Ok(capacity) => match case.prepare(
                capacity,
                &self.env.config().resources,
                include,
                exclude,
            ) {
                Ok(()) => case.run(&self.env, log, options).await,
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        let mut record = CaseRecord {
            name: case.name.clone(),
            run_status: Status::Success,
            internal_status: None,
            baseline_status: None,
            elapsed_secs: 0.0,
            error: None,
            log_file: log.log_file().map(Path::to_path_buf),
        };
        match outcome {
            Ok(()) => {
                let baseline = self.env.config().validation.baseline_dir.clone();
                match case.validate(baseline.as_deref(), self.env.registry(), log) {
                    Ok(ValidationResult {
                        internal_pass,
                        baseline_pass,
                    }) => {
                        record.internal_status = pass_fail(internal_pass);
                        record.baseline_status = pass_fail(baseline_pass);
                    }
                    Err(err) => {
                        log.error(format!("Exception raised in validate(): {err}"));
                        record.run_status = Status::Error;
                        record.error = Some(err.to_string());
                    }
                }
            }
            Err(err) => {
                log.error(format!("Exception raised in run(): {err}"));
                record.run_status = Status::Error;
                record.error = Some(err.to_string());
            }
        }
        record.elapsed_secs = start.elapsed().as_secs_f64();
        debug!(case = %record.name, passed = record.passed(), "Finished test case");
        record
    }

    fn log_case(&self, record: &CaseRecord, log: &LogContext<'_>) {
        if record.passed() {
            for line in record.status_lines() {
                log.info(line);
            }
        } else {
            for line in record.status_lines() {
                log.error(line);
            }
            if let Some(error) = &record.error {
                log.error(format!("  error: {error}"));
            }
            if let Some(path) = &record.log_file {
                log.error(format!("  see: {}", path.display()));
            }
        }
        log.info(format!(
            "  test runtime:        {}",
            minutes_seconds(record.elapsed_secs)
        ));
    }
}
