mod tracing_setup;

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context as AnyhowContext, Result, anyhow, bail};
use clap::Parser;
use tracing::{error, info, warn};
use uuid::Uuid;

use testflow::{
    cli::{Cli, Commands, RunArgs, SetupArgs, StatusArgs},
    config::RunnerConfig,
    environment::Environment,
    history::{RunStatus, RunStore},
    logging::LogContext,
    registry::WorkRegistry,
    runner::{CaseRecord, RunMode, Runner, RunnerOptions},
    state::{self, STEP_FILE, SUITE_SUFFIX, TEST_CASE_FILE},
    status_export::{RunDetailExport, RunListExport},
    suite::TestSuite,
    test_case::TestCase,
};

use crate::tracing_setup::JsonLogFormat;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let run_id = match &cli.command {
        Commands::Run(_) => Some(new_run_id()),
        _ => None,
    };
    let json_format = if cli.pretty {
        JsonLogFormat::Pretty
    } else {
        JsonLogFormat::Compact
    };
    let _guard = tracing_setup::init(cli.verbose, cli.log_json, json_format, run_id.as_deref());

    let outcome = match cli.command {
        Commands::Setup(args) => setup_command(args).map(|()| true),
        Commands::Run(args) => run_command(args, run_id.unwrap_or_else(new_run_id)).await,
        Commands::Status(args) => status_command(args).map(|()| true),
    };
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("Command failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn setup_command(args: SetupArgs) -> Result<()> {
    let suite = TestSuite::from_path(&args.definition)?;
    let config = load_config(args.config.as_deref())?.unwrap_or_default();
    let work_dir = absolute(&args.work_dir)?;
    let summary = state::setup(&work_dir, &suite, &config)?;
    info!(
        suite = %suite.name,
        test_cases = summary.test_case_files.len(),
        steps = summary.step_files.len(),
        "Set up suite in {}",
        work_dir.display()
    );
    for case in &suite.test_cases {
        info!("  {}", case.subdir());
    }
    Ok(())
}

/// What `run` was pointed at, with the configuration stored next to it.
enum Target {
    Suite(RunnerConfig, TestSuite),
    TestCase {
        config: RunnerConfig,
        test_case: TestCase,
        include: Option<Vec<String>>,
        exclude: Vec<String>,
    },
    Step {
        config: RunnerConfig,
        test_case: TestCase,
        step: String,
        substep: Option<String>,
    },
}

impl Target {
    fn mode(&self) -> RunMode {
        match self {
            Target::Suite(..) => RunMode::Suite,
            Target::TestCase { .. } => RunMode::TestCase,
            Target::Step { substep: None, .. } => RunMode::Step,
            Target::Step { substep: Some(_), .. } => RunMode::Substep,
        }
    }

    fn name(&self) -> String {
        match self {
            Target::Suite(_, suite) => suite.name.clone(),
            Target::TestCase { test_case, .. } => test_case.name.clone(),
            Target::Step {
                test_case,
                step,
                substep,
                ..
            } => match substep {
                Some(substep) => format!("{}/{step}/{substep}", test_case.name),
                None => format!("{}/{step}", test_case.name),
            },
        }
    }

    fn config_mut(&mut self) -> &mut RunnerConfig {
        match self {
            Target::Suite(config, _) => config,
            Target::TestCase { config, .. } | Target::Step { config, .. } => config,
        }
    }
}

async fn run_command(args: RunArgs, run_id: String) -> Result<bool> {
    let work_dir = absolute(&args.work_dir)?;
    let mut target = detect_target(&args, &work_dir)?;
    if let Some(config) = load_config(args.config.as_deref())? {
        *target.config_mut() = config;
    }
    let mode = target.mode();
    let name = target.name();
    info!(run_id = %run_id, mode = mode.as_str(), target = %name, "Starting run");

    let history = if args.no_history {
        None
    } else {
        match RunStore::open(None) {
            Ok(store) => match store.begin(&run_id, mode, &name, &work_dir.to_string_lossy()) {
                Ok(()) => Some(store),
                Err(err) => {
                    warn!("Run history unavailable: {err:#}");
                    None
                }
            },
            Err(err) => {
                warn!("Run history unavailable: {err:#}");
                None
            }
        }
    };

    let options = RunnerOptions {
        quiet: args.quiet,
        print_substeps: args.print_substeps,
    };
    let outcome = execute(target, options).await;

    let (status, cases) = match &outcome {
        Ok((passed, cases)) => (
            if *passed {
                RunStatus::Passed
            } else {
                RunStatus::Failed
            },
            cases.as_slice(),
        ),
        Err(_) => (RunStatus::Failed, &[] as &[CaseRecord]),
    };
    if let Some(store) = &history
        && let Err(err) = store.finish(&run_id, status, cases)
    {
        warn!("Failed to record run {run_id}: {err:#}");
    }

    let (passed, _) = outcome?;
    Ok(passed)
}

async fn execute(target: Target, options: RunnerOptions) -> Result<(bool, Vec<CaseRecord>)> {
    let build = |config: RunnerConfig| -> Result<Runner> {
        let env = Environment::new(config, WorkRegistry::with_builtins())?;
        Ok(Runner::new(env, options))
    };
    match target {
        Target::Suite(config, mut suite) => {
            let runner = build(config)?;
            let log = LogContext::stdout(suite.name.clone());
            let report = runner.run_suite(&mut suite, &log).await?;
            Ok((report.passed(), report.cases))
        }
        Target::TestCase {
            config,
            mut test_case,
            include,
            exclude,
        } => {
            let runner = build(config)?;
            let log = LogContext::stdout(test_case.name.clone());
            let report = runner
                .run_test_case(&mut test_case, include.as_deref(), &exclude, &log)
                .await?;
            Ok((report.passed(), report.cases))
        }
        Target::Step {
            config,
            mut test_case,
            step,
            substep,
        } => {
            let runner = build(config)?;
            let log = LogContext::stdout(step.clone());
            match substep {
                Some(substep) => {
                    runner
                        .run_substep(&mut test_case, &step, &substep, &log)
                        .await?
                }
                None => runner.run_step(&mut test_case, &step, &log).await?,
            }
            Ok((true, Vec::new()))
        }
    }
}

/// Picks the entry point from the work directory: an explicit suite, then a
/// test case, then a step, then the only suite present.
fn detect_target(args: &RunArgs, work_dir: &Path) -> Result<Target> {
    let selects_steps = !args.steps.is_empty() || !args.no_steps.is_empty();

    let target = if let Some(suite) = &args.suite {
        let name = suite.strip_suffix(SUITE_SUFFIX).unwrap_or(suite);
        let (config, suite) = state::load_suite(&state::suite_file(work_dir, name))?;
        Target::Suite(config, suite)
    } else if work_dir.join(TEST_CASE_FILE).is_file() {
        let (config, test_case) = state::load_test_case(work_dir)?;
        Target::TestCase {
            config,
            test_case,
            include: (!args.steps.is_empty()).then(|| args.steps.clone()),
            exclude: args.no_steps.clone(),
        }
    } else if work_dir.join(STEP_FILE).is_file() {
        let (config, test_case, step) = state::load_step(work_dir)?;
        Target::Step {
            config,
            test_case,
            step,
            substep: args.substep.clone(),
        }
    } else {
        let suites = state::find_suites(work_dir)?;
        match suites.as_slice() {
            [name] => {
                let (config, suite) = state::load_suite(&state::suite_file(work_dir, name))?;
                Target::Suite(config, suite)
            }
            [] => bail!(
                "Nothing to run in {}: no suite, test case or step state found (run `testflow setup` first)",
                work_dir.display()
            ),
            several => bail!(
                "Several suites in {}: {}; name the one to run",
                work_dir.display(),
                several.join(", ")
            ),
        }
    };

    if selects_steps && !matches!(target, Target::TestCase { .. }) {
        bail!("--steps and --no-steps only apply when running a test case");
    }
    if args.substep.is_some() && !matches!(target, Target::Step { .. }) {
        bail!("--substep only applies when running a step");
    }
    Ok(target)
}

fn status_command(args: StatusArgs) -> Result<()> {
    let store = RunStore::open(None)?;
    if let Some(id) = args.run_id {
        let record = store.load(&id)?;
        if args.json {
            let detail = RunDetailExport::from_record(&record);
            println!("{}", serde_json::to_string_pretty(&detail)?);
        } else {
            println!("Run: {id}");
            println!("Status: {}", record.status.as_str());
            println!("Mode: {}", record.mode.as_str());
            println!("Target: {}", record.target);
            println!("Work dir: {}", record.work_dir);
            println!("Updated: {}", record.updated_at);
            for case in &record.cases {
                let verdict = if case.passed() { "PASS" } else { "FAIL" };
                println!("- {verdict} {}", case.name);
                if let Some(error) = &case.error {
                    println!("    {error}");
                }
            }
        }
    } else {
        let summaries = store.list(args.limit.max(1))?;
        if args.json {
            let payload = RunListExport::from_summaries(summaries);
            println!("{}", serde_json::to_string_pretty(&payload)?);
        } else if summaries.is_empty() {
            println!("No runs recorded yet.");
        } else {
            println!("Recent runs:");
            for summary in summaries {
                println!(
                    "- {} [{}] {}={} failures={} updated={}",
                    summary.run_id,
                    summary.status.as_str(),
                    summary.mode.as_str(),
                    summary.target,
                    summary.failures,
                    summary.updated_at
                );
            }
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Option<RunnerConfig>> {
    path.map(|path| {
        RunnerConfig::from_path(path)
            .with_context(|| format!("Failed to load config {}", path.display()))
    })
    .transpose()
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|err| anyhow!("Invalid work dir {}: {err}", path.display()))
}

fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}
