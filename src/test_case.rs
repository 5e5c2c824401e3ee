use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    environment::Environment,
    error::{Error, Result},
    logging::{LogContext, Propagation},
    parallel::Capacity,
    registry::WorkRegistry,
    resources::ResourceOverrides,
    step::{Step, StepContext, check_subdir},
};

/// Outcome of the comparisons run after a successful test case.
///
/// `None` means the comparison did not apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub internal_pass: Option<bool>,
    pub baseline_pass: Option<bool>,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.internal_pass != Some(false) && self.baseline_pass != Some(false)
    }

    pub fn merge(self, other: ValidationResult) -> ValidationResult {
        fn both(a: Option<bool>, b: Option<bool>) -> Option<bool> {
            match (a, b) {
                (Some(a), Some(b)) => Some(a && b),
                (a, None) => a,
                (None, b) => b,
            }
        }
        ValidationResult {
            internal_pass: both(self.internal_pass, other.internal_pass),
            baseline_pass: both(self.baseline_pass, other.baseline_pass),
        }
    }
}

/// Two files in the test case directory that must be identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileComparison {
    pub file: String,
    pub against: String,
}

/// Comparisons run after the steps succeed. Paths are relative to the test
/// case directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Validation {
    #[serde(default)]
    pub internal: Vec<FileComparison>,
    /// Files compared with the same path below the baseline test case directory.
    #[serde(default)]
    pub baseline: Vec<String>,
    /// Validators registered by name in the work registry.
    #[serde(default)]
    pub validators: Vec<String>,
}

impl Validation {
    pub fn is_empty(&self) -> bool {
        self.internal.is_empty() && self.baseline.is_empty() && self.validators.is_empty()
    }
}

/// How a test case routes its step output.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaseRunOptions {
    /// Give every step its own `<step>.log` in the test case directory.
    pub step_log_files: bool,
    pub print_substeps: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestCase {
    pub name: String,
    /// Directory below the suite work directory; defaults to the case name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Steps run when nothing else is requested; defaults to every step with
    /// `run_by_default`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps_to_run: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Validation::is_empty")]
    pub validation: Validation,
    #[serde(skip)]
    work_dir: Option<PathBuf>,
    #[serde(skip)]
    capacity: Option<Capacity>,
    #[serde(skip)]
    selected: Vec<String>,
    #[serde(skip)]
    pub validation_result: Option<ValidationResult>,
}

impl TestCase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subdir: None,
            steps: Vec::new(),
            steps_to_run: None,
            validation: Validation::default(),
            work_dir: None,
            capacity: None,
            selected: Vec::new(),
            validation_result: None,
        }
    }

    /// Appends a step; step names are unique within a test case.
    pub fn add_step(&mut self, step: Step) -> Result<()> {
        if self.step(&step.name).is_some() {
            return Err(Error::Configuration(format!(
                "test case '{}' already has a step named '{}'",
                self.name, step.name
            )));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn subdir(&self) -> &str {
        self.subdir.as_deref().unwrap_or(&self.name)
    }

    /// Name used for the test case's log file in a suite run.
    pub fn log_name(&self) -> String {
        self.subdir().replace('/', "_")
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|step| step.name == name)
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.name.clone()).collect()
    }

    pub fn default_steps(&self) -> Vec<String> {
        match &self.steps_to_run {
            Some(steps) => steps.clone(),
            None => self
                .steps
                .iter()
                .filter(|step| step.run_by_default)
                .map(|step| step.name.clone())
                .collect(),
        }
    }

    /// Steps selected by the last `prepare`.
    pub fn selected_steps(&self) -> &[String] {
        &self.selected
    }

    pub fn attach(&mut self, work_dir: impl Into<PathBuf>) {
        self.work_dir = Some(work_dir.into());
    }

    pub fn work_dir(&self) -> Result<&Path> {
        self.work_dir.as_deref().ok_or_else(|| {
            Error::Configuration(format!("test case '{}' has no work directory", self.name))
        })
    }

    /// Checks the structural rules a loaded test case must satisfy.
    pub fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration(
                "test case name must not be blank".into(),
            ));
        }
        check_subdir(&format!("test case '{}'", self.name), self.subdir())?;
        for (index, step) in self.steps.iter().enumerate() {
            if self.steps[..index].iter().any(|earlier| earlier.name == step.name) {
                return Err(Error::Configuration(format!(
                    "test case '{}' has more than one step named '{}'",
                    self.name, step.name
                )));
            }
            step.check()?;
            if let Some(earlier) = self.steps[..index]
                .iter()
                .find(|earlier| earlier.subdir() == step.subdir())
            {
                return Err(Error::Configuration(format!(
                    "steps '{}' and '{}' of test case '{}' share the directory '{}'",
                    earlier.name,
                    step.name,
                    self.name,
                    step.subdir()
                )));
            }
        }
        if let Some(steps) = &self.steps_to_run {
            for name in steps {
                self.ensure_known(name, "listed in steps_to_run")?;
            }
        }
        Ok(())
    }

    /// Works out which steps to run. `include` replaces the default list and
    /// `exclude` is removed from the result; every name must be a known step.
    pub fn resolve_steps(&self, include: Option<&[String]>, exclude: &[String]) -> Result<Vec<String>> {
        if let Some(include) = include {
            for name in include {
                self.ensure_known(name, "requested")?;
            }
        }
        for name in exclude {
            self.ensure_known(name, "excluded")?;
        }
        let base = match include {
            Some(include) => include.to_vec(),
            None => self.default_steps(),
        };
        let mut selected: Vec<String> = Vec::with_capacity(base.len());
        for name in base {
            self.ensure_known(&name, "listed in steps_to_run")?;
            if !exclude.contains(&name) && !selected.contains(&name) {
                selected.push(name);
            }
        }
        Ok(selected)
    }

    fn ensure_known(&self, name: &str, action: &'static str) -> Result<()> {
        if self.step(name).is_some() {
            return Ok(());
        }
        let suggestion = self
            .steps
            .iter()
            .map(|step| (strsim::jaro_winkler(name, &step.name), &step.name))
            .filter(|(score, _)| *score > 0.8)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, candidate)| candidate.clone());
        Err(Error::UnknownStep {
            test_case: self.name.clone(),
            step: name.to_string(),
            action,
            known: self.step_names().join(", "),
            suggestion,
        })
    }

    /// Selects the steps to run, applies resource overrides and fits every
    /// substep of every step against `capacity`, since templates may read
    /// allocations of steps that do not run.
    pub fn prepare(
        &mut self,
        capacity: Capacity,
        overrides: &BTreeMap<String, ResourceOverrides>,
        include: Option<&[String]>,
        exclude: &[String],
    ) -> Result<()> {
        self.selected = self.resolve_steps(include, exclude)?;
        self.configure(overrides)?;
        for step in &mut self.steps {
            step.fit(capacity)?;
        }
        self.capacity = Some(capacity);
        Ok(())
    }

    /// Applies the overrides keyed `<step>/<substep>`, then those keyed
    /// `<test case>/<step>/<substep>`. Keys naming other substeps are ignored.
    pub fn configure(&mut self, overrides: &BTreeMap<String, ResourceOverrides>) -> Result<()> {
        if overrides.is_empty() {
            return Ok(());
        }
        for step in &mut self.steps {
            for substep in &mut step.substeps {
                let general = format!("{}/{}", step.name, substep.name);
                let specific = format!("{}/{general}", self.name);
                for key in [&general, &specific] {
                    if let Some(update) = overrides.get(key) {
                        substep.configure(update)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Fitted allocations as `{step: {substep: allocation}}`.
    pub fn allocations(&self) -> Value {
        let mut steps = Map::new();
        for step in &self.steps {
            let mut substeps = Map::new();
            for substep in &step.substeps {
                if let Ok(allocation) = substep.allocation()
                    && let Ok(value) = serde_json::to_value(allocation)
                {
                    substeps.insert(substep.name.clone(), value);
                }
            }
            steps.insert(step.name.clone(), Value::Object(substeps));
        }
        Value::Object(steps)
    }

    pub(crate) fn capacity(&self) -> Result<Capacity> {
        self.capacity.ok_or_else(|| {
            Error::Configuration(format!(
                "test case '{}' must be prepared before it runs",
                self.name
            ))
        })
    }

    pub(crate) fn step_dir(&self, step: &Step) -> Result<PathBuf> {
        Ok(self.work_dir()?.join(step.subdir()))
    }

    /// Runs the selected steps in order; the first failure ends the test case.
    pub async fn run(
        &self,
        env: &Environment,
        log: &LogContext<'_>,
        options: CaseRunOptions,
    ) -> Result<()> {
        let capacity = self.capacity()?;
        let case_dir = self.work_dir()?;
        let allocations = self.allocations();
        log.info(format!("Running steps: {}", self.selected.join(", ")));
        for name in &self.selected {
            let step = self
                .step(name)
                .ok_or_else(|| Error::Configuration(format!("unknown step '{name}'")))?;
            if step.cached {
                log.announce(format!("  * Cached step: {name}"));
                continue;
            }
            log.announce(format!("  * step: {name}"));
            let step_dir = self.step_dir(step)?;
            fs::create_dir_all(&step_dir)?;
            let step_log = if options.step_log_files {
                log.child_file(
                    name.as_str(),
                    case_dir.join(format!("{name}.log")),
                    Propagation::Verbose,
                )?
            } else {
                log.child(name.as_str(), Propagation::Verbose)
            };
            let ctx = StepContext {
                env,
                work_dir: &step_dir,
                log: &step_log,
                capacity,
                allocations: &allocations,
                print_substeps: options.print_substeps,
            };
            if let Err(err) = step.run(&ctx).await {
                step_log.error(err.to_string());
                log.announce("      Failed");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Runs the declared comparisons and named validators.
    ///
    /// `baseline_root` is the work directory of a reference run; the test
    /// case's own subdirectory is appended to it.
    pub fn validate(
        &mut self,
        baseline_root: Option<&Path>,
        registry: &WorkRegistry,
        log: &LogContext<'_>,
    ) -> Result<ValidationResult> {
        let case_dir = self.work_dir()?.to_path_buf();
        let baseline_dir = baseline_root.map(|root| root.join(self.subdir()));
        let mut result = ValidationResult::default();

        if !self.validation.internal.is_empty() {
            let mut all_match = true;
            for comparison in &self.validation.internal {
                let left = case_dir.join(&comparison.file);
                let right = case_dir.join(&comparison.against);
                if !same_contents(&left, &right)? {
                    log.error(format!(
                        "{} and {} differ",
                        comparison.file, comparison.against
                    ));
                    all_match = false;
                }
            }
            result.internal_pass = Some(all_match);
        }

        if !self.validation.baseline.is_empty() {
            match &baseline_dir {
                Some(baseline) => {
                    let mut all_match = true;
                    for file in &self.validation.baseline {
                        if !same_contents(&case_dir.join(file), &baseline.join(file))? {
                            log.error(format!("{file} differs from the baseline"));
                            all_match = false;
                        }
                    }
                    result.baseline_pass = Some(all_match);
                }
                None => log.warn("No baseline configured; skipping baseline comparison"),
            }
        }

        for name in &self.validation.validators {
            let validator = registry.validator(name)?;
            let outcome = validator
                .validate(&case_dir, baseline_dir.as_deref())
                .map_err(|err| Error::ValidationMismatch(format!("{name}: {err:#}")))?;
            result = result.merge(outcome);
        }

        if result.internal_pass == Some(false) {
            log.error("Comparison failed between files within the test case.");
        }
        if result.baseline_pass == Some(false) {
            log.error("Comparison failed between the test case and the baseline.");
        }
        self.validation_result = Some(result);
        Ok(result)
    }
}

fn same_contents(left: &Path, right: &Path) -> Result<bool> {
    let read = |path: &Path| {
        fs::read(path).map_err(|err| {
            Error::ValidationMismatch(format!("cannot read {}: {err}", path.display()))
        })
    };
    Ok(read(left)? == read(right)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RunnerConfig,
        registry::{CaseValidator, SubstepWork, WorkContext},
        resources::ResourceRequest,
        substep::Substep,
    };
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    struct Recording(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl SubstepWork for Recording {
        async fn run(&self, ctx: &WorkContext<'_>) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(ctx.step.to_string());
            Ok(())
        }
    }

    fn case_with_steps(names: &[&str]) -> TestCase {
        let mut case = TestCase::new("default");
        for name in names {
            case.add_step(
                Step::new(*name)
                    .with_substep(Substep::callback("run", "record"))
                    .unwrap(),
            )
            .unwrap();
        }
        case
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn default_steps_follow_run_by_default() {
        let mut case = case_with_steps(&["mesh", "init", "forward", "analysis"]);
        case.step_mut("analysis").unwrap().run_by_default = false;
        assert_eq!(case.default_steps(), ["mesh", "init", "forward"]);

        case.steps_to_run = Some(names(&["init", "forward"]));
        assert_eq!(case.resolve_steps(None, &[]).unwrap(), ["init", "forward"]);
    }

    #[test]
    fn include_and_exclude_are_applied() {
        let case = case_with_steps(&["mesh", "init", "forward"]);
        let selected = case
            .resolve_steps(Some(names(&["init", "forward"]).as_slice()), &names(&["forward"]))
            .unwrap();
        assert_eq!(selected, ["init"]);
        let selected = case.resolve_steps(None, &names(&["mesh"])).unwrap();
        assert_eq!(selected, ["init", "forward"]);
    }

    #[test]
    fn unknown_step_names_suggest_the_closest_match() {
        let case = case_with_steps(&["mesh", "initial_state", "forward"]);
        let err = case
            .resolve_steps(Some(names(&["initial_stat"]).as_slice()), &[])
            .unwrap_err();
        match err {
            Error::UnknownStep {
                step,
                action,
                suggestion,
                ..
            } => {
                assert_eq!(step, "initial_stat");
                assert_eq!(action, "requested");
                assert_eq!(suggestion.as_deref(), Some("initial_state"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        let err = case.resolve_steps(None, &names(&["zzz"])).unwrap_err();
        assert!(err.to_string().contains("excluded"));
        assert!(!err.to_string().contains("did you mean"));
    }

    #[test]
    fn prepare_fits_steps_that_will_not_run() {
        let mut case = case_with_steps(&["mesh", "forward"]);
        case.step_mut("forward").unwrap().substeps[0].resources = ResourceRequest {
            tasks: 8,
            min_tasks: 2,
            ..ResourceRequest::default()
        };
        case.prepare(
            Capacity::new(4, 4),
            &BTreeMap::new(),
            Some(names(&["mesh"]).as_slice()),
            &[],
        )
            .unwrap();
        assert_eq!(case.selected_steps(), ["mesh"]);
        assert_eq!(case.allocations()["forward"]["run"]["tasks"], 4);
        assert_eq!(case.allocations()["forward"]["run"]["memory"], "1G");
    }

    #[test]
    fn prepare_reports_unfittable_substeps() {
        let mut case = case_with_steps(&["forward"]);
        case.steps[0].substeps[0].resources = ResourceRequest {
            tasks: 8,
            min_tasks: 8,
            ..ResourceRequest::default()
        };
        let err = case
            .prepare(Capacity::new(4, 4), &BTreeMap::new(), None, &[])
            .unwrap_err();
        assert!(matches!(err, Error::Resource { .. }));
    }

    #[test]
    fn overrides_change_the_fitted_allocation() {
        let mut case = case_with_steps(&["mesh", "forward"]);
        case.name = "channel".into();
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "forward/run".to_string(),
            ResourceOverrides {
                tasks: Some(8),
                min_tasks: Some(2),
                ..ResourceOverrides::default()
            },
        );
        overrides.insert(
            "channel/forward/run".to_string(),
            ResourceOverrides {
                cpus_per_task: Some(2),
                ..ResourceOverrides::default()
            },
        );
        overrides.insert(
            "other/mesh/run".to_string(),
            ResourceOverrides {
                tasks: Some(64),
                ..ResourceOverrides::default()
            },
        );

        case.prepare(Capacity::new(8, 4), &overrides, None, &[])
            .unwrap();
        let allocations = case.allocations();
        assert_eq!(allocations["forward"]["run"]["tasks"], 4);
        assert_eq!(allocations["forward"]["run"]["cpus_per_task"], 2);
        assert_eq!(allocations["mesh"]["run"]["tasks"], 1);

        let err = case
            .prepare(Capacity::new(8, 4), &overrides, None, &[])
            .unwrap_err();
        assert!(matches!(err, Error::ConfigurationTooLate(name) if name == "run"));
    }

    #[tokio::test]
    async fn runs_selected_steps_in_their_own_directories() {
        let temp = tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = WorkRegistry::new();
        registry.register("record", Recording(seen.clone()));
        let env = Environment::new(RunnerConfig::default(), registry).unwrap();
        let mut case = case_with_steps(&["mesh", "init", "forward"]);
        case.step_mut("init").unwrap().cached = true;
        case.attach(temp.path());
        case.prepare(Capacity::new(2, 2), &BTreeMap::new(), None, &[])
            .unwrap();

        let (log, lines) = LogContext::buffered("case");
        case.run(
            &env,
            &log,
            CaseRunOptions {
                step_log_files: true,
                print_substeps: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), ["mesh", "forward"]);
        assert!(temp.path().join("mesh").is_dir());
        assert!(temp.path().join("forward.log").exists());
        let lines = lines.lock().unwrap();
        assert!(lines.contains(&"  * step: mesh".to_string()));
        assert!(lines.contains(&"  * Cached step: init".to_string()));
    }

    #[tokio::test]
    async fn run_requires_prepare() {
        let env = Environment::new(RunnerConfig::default(), WorkRegistry::new()).unwrap();
        let mut case = case_with_steps(&["mesh"]);
        case.attach("/nonexistent");
        let (log, _) = LogContext::buffered("case");
        let err = case
            .run(&env, &log, CaseRunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.contains("prepared")));
    }

    #[test]
    fn internal_and_baseline_comparisons() {
        let temp = tempdir().unwrap();
        let case_dir = temp.path().join("work/default");
        let baseline_root = temp.path().join("baseline");
        fs::create_dir_all(case_dir.join("forward")).unwrap();
        fs::create_dir_all(baseline_root.join("default/forward")).unwrap();
        fs::write(case_dir.join("forward/output.nc"), "abc").unwrap();
        fs::write(case_dir.join("forward/restart.nc"), "abc").unwrap();
        fs::write(baseline_root.join("default/forward/output.nc"), "abd").unwrap();

        let mut case = TestCase::new("default");
        case.validation = Validation {
            internal: vec![FileComparison {
                file: "forward/output.nc".into(),
                against: "forward/restart.nc".into(),
            }],
            baseline: vec!["forward/output.nc".into()],
            validators: Vec::new(),
        };
        case.attach(&case_dir);
        let (log, lines) = LogContext::buffered("case");

        let result = case
            .validate(Some(baseline_root.as_path()), &WorkRegistry::new(), &log)
            .unwrap();
        assert_eq!(result.internal_pass, Some(true));
        assert_eq!(result.baseline_pass, Some(false));
        assert!(!result.passed());
        assert_eq!(case.validation_result, Some(result));
        assert!(
            lines
                .lock()
                .unwrap()
                .iter()
                .any(|line| line.starts_with("ERROR: forward/output.nc differs"))
        );

        let result = case.validate(None, &WorkRegistry::new(), &log).unwrap();
        assert_eq!(result.baseline_pass, None);
        assert!(result.passed());
        assert!(lines.lock().unwrap().contains(
            &"WARNING: No baseline configured; skipping baseline comparison".to_string()
        ));
    }

    #[test]
    fn missing_comparison_file_is_an_error() {
        let temp = tempdir().unwrap();
        let mut case = TestCase::new("default");
        case.validation.internal.push(FileComparison {
            file: "a.nc".into(),
            against: "b.nc".into(),
        });
        case.attach(temp.path());
        let (log, _) = LogContext::buffered("case");
        let err = case.validate(None, &WorkRegistry::new(), &log).unwrap_err();
        assert!(matches!(err, Error::ValidationMismatch(msg) if msg.contains("a.nc")));
    }

    struct AlwaysFails;

    impl CaseValidator for AlwaysFails {
        fn validate(&self, _: &Path, _: Option<&Path>) -> anyhow::Result<ValidationResult> {
            Ok(ValidationResult {
                internal_pass: Some(false),
                baseline_pass: None,
            })
        }
    }

    #[test]
    fn named_validators_merge_into_the_result() {
        let temp = tempdir().unwrap();
        let mut registry = WorkRegistry::new();
        registry.register_validator("timers", AlwaysFails);
        let mut case = TestCase::new("default");
        case.validation.validators.push("timers".into());
        case.attach(temp.path());
        let (log, _) = LogContext::buffered("case");
        let result = case.validate(None, &registry, &log).unwrap();
        assert_eq!(result.internal_pass, Some(false));
        assert_eq!(result.baseline_pass, None);
    }

    #[test]
    fn check_rejects_duplicate_steps_and_unknown_defaults() {
        let mut case = case_with_steps(&["mesh"]);
        case.steps.push(Step::new("mesh"));
        assert!(matches!(case.check(), Err(Error::Configuration(_))));

        let mut case = case_with_steps(&["mesh"]);
        case.steps_to_run = Some(names(&["mesh", "forwrd"]));
        assert!(matches!(case.check(), Err(Error::UnknownStep { .. })));
    }
}
