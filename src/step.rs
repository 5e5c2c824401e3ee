use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    environment::Environment,
    error::{Error, Result},
    logging::LogContext,
    parallel::Capacity,
    substep::Substep,
};

/// Ordered substeps with file-based pre and post conditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub name: String,
    /// Directory below the test case directory; defaults to the step name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,
    /// Paths, relative to the step directory, that must exist before running.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Paths, relative to the step directory, that must exist afterwards.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub cached: bool,
    #[serde(default = "default_true")]
    pub run_by_default: bool,
    #[serde(default)]
    pub run_substeps_as_commands: bool,
    #[serde(default)]
    pub substeps: Vec<Substep>,
    /// Substeps run by `run`, in this order; defaults to every substep in
    /// declaration order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substeps_to_run: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

/// Everything a step needs from its test case while it runs.
pub struct StepContext<'a> {
    pub env: &'a Environment,
    /// The step's own work directory.
    pub work_dir: &'a Path,
    pub log: &'a LogContext<'a>,
    pub capacity: Capacity,
    /// Fitted allocations of every substep in the test case, by step and substep.
    pub allocations: &'a Value,
    pub print_substeps: bool,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subdir: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            cached: false,
            run_by_default: true,
            run_substeps_as_commands: false,
            substeps: Vec::new(),
            substeps_to_run: None,
        }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    /// Appends a substep; names must be unique within the step.
    pub fn add_substep(&mut self, substep: Substep) -> Result<()> {
        if self.substep(&substep.name).is_some() {
            return Err(Error::Configuration(format!(
                "step '{}' already has a substep named '{}'",
                self.name, substep.name
            )));
        }
        self.substeps.push(substep);
        Ok(())
    }

    pub fn with_substep(mut self, substep: Substep) -> Result<Self> {
        self.add_substep(substep)?;
        Ok(self)
    }

    pub fn subdir(&self) -> &str {
        self.subdir.as_deref().unwrap_or(&self.name)
    }

    pub fn substep(&self, name: &str) -> Option<&Substep> {
        self.substeps.iter().find(|substep| substep.name == name)
    }

    /// The substeps `run` executes, in order.
    pub fn substeps_to_run(&self) -> Vec<&Substep> {
        match &self.substeps_to_run {
            Some(names) => names.iter().filter_map(|name| self.substep(name)).collect(),
            None => self.substeps.iter().collect(),
        }
    }

    /// Checks the structural rules a loaded step must satisfy.
    pub fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("step name must not be blank".into()));
        }
        check_subdir(&format!("step '{}'", self.name), self.subdir())?;
        for (index, substep) in self.substeps.iter().enumerate() {
            if self.substeps[..index]
                .iter()
                .any(|earlier| earlier.name == substep.name)
            {
                return Err(Error::Configuration(format!(
                    "step '{}' has more than one substep named '{}'",
                    self.name, substep.name
                )));
            }
            substep.resources.validate().map_err(|reason| {
                Error::Configuration(format!(
                    "substep '{}' of step '{}': {reason}",
                    substep.name, self.name
                ))
            })?;
        }
        if let Some(names) = &self.substeps_to_run {
            for (index, name) in names.iter().enumerate() {
                if self.substep(name).is_none() {
                    return Err(Error::Configuration(format!(
                        "step '{}' lists unknown substep '{name}' in substeps_to_run",
                        self.name
                    )));
                }
                if names[..index].contains(name) {
                    return Err(Error::Configuration(format!(
                        "step '{}' lists substep '{name}' twice in substeps_to_run",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Fits every substep; a failure leaves the remaining substeps unfitted.
    pub fn fit(&mut self, capacity: Capacity) -> Result<()> {
        for substep in &mut self.substeps {
            substep.fit(capacity)?;
        }
        Ok(())
    }

    /// Runs the substeps in order between the input and output gates.
    pub async fn run(&self, ctx: &StepContext<'_>) -> Result<()> {
        if self.cached {
            ctx.log.info(format!("Step '{}' is cached; skipping", self.name));
            return Ok(());
        }
        let missing = missing_files(ctx.work_dir, &self.inputs);
        if !missing.is_empty() {
            return Err(Error::MissingInputs {
                step: self.name.clone(),
                paths: missing,
            });
        }
        for substep in self.substeps_to_run() {
            substep.execute(self, ctx).await?;
        }
        let missing = missing_files(ctx.work_dir, &self.outputs);
        if !missing.is_empty() {
            return Err(Error::MissingOutputs {
                step: self.name.clone(),
                paths: missing,
            });
        }
        Ok(())
    }

    /// Runs one substep in this process without the file gates.
    pub async fn run_substep(&self, name: &str, ctx: &StepContext<'_>) -> Result<()> {
        let substep = self.substep(name).ok_or_else(|| {
            let known: Vec<&str> = self.substeps.iter().map(|s| s.name.as_str()).collect();
            Error::Configuration(format!(
                "step '{}' has no substep '{name}' (known: {})",
                self.name,
                known.join(", ")
            ))
        })?;
        substep.execute_standalone(self, ctx).await
    }
}

/// A work subdirectory must stay below its parent: relative, with only plain
/// path components.
pub(crate) fn check_subdir(owner: &str, subdir: &str) -> Result<()> {
    let path = Path::new(subdir);
    let plain = path.components().next().is_some()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if plain {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "{owner} has subdir '{subdir}', which must be a relative path without '.' or '..'"
        )))
    }
}

fn missing_files(dir: &Path, paths: &[String]) -> Vec<String> {
    paths
        .iter()
        .filter(|path| !dir.join(path).exists())
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RunnerConfig,
        registry::{SubstepWork, WorkContext, WorkRegistry},
        resources::ResourceRequest,
    };
    use async_trait::async_trait;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use tempfile::tempdir;

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl SubstepWork for Counting {
        async fn run(&self, _: &WorkContext<'_>) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Recording(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl SubstepWork for Recording {
        async fn run(&self, ctx: &WorkContext<'_>) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(ctx.substep.to_string());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl SubstepWork for Failing {
        async fn run(&self, _: &WorkContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("mesh generation blew up")
        }
    }

    fn environment(registry: WorkRegistry) -> Environment {
        Environment::new(RunnerConfig::default(), registry)
            .unwrap()
            .with_capacity(Capacity::new(4, 4))
    }

    fn fitted(mut step: Step) -> Step {
        step.fit(Capacity::new(4, 4)).unwrap();
        step
    }

    async fn run_step(step: &Step, env: &Environment, dir: &Path) -> Result<()> {
        let (log, _) = LogContext::buffered("step");
        let allocations = Value::Null;
        let ctx = StepContext {
            env,
            work_dir: dir,
            log: &log,
            capacity: Capacity::new(4, 4),
            allocations: &allocations,
            print_substeps: false,
        };
        step.run(&ctx).await
    }

    #[tokio::test]
    async fn missing_inputs_prevent_any_substep() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = WorkRegistry::new();
        registry.register("count", Counting(calls.clone()));
        let env = environment(registry);
        let temp = tempdir().unwrap();
        let step = fitted(
            Step::new("forward")
                .with_inputs(["init.nc", "graph.info"])
                .with_substep(Substep::callback("run", "count"))
                .unwrap(),
        );
        std::fs::write(temp.path().join("graph.info"), "").unwrap();

        let err = run_step(&step, &env, temp.path()).await.unwrap_err();
        assert!(
            matches!(&err, Error::MissingInputs { step, paths } if step == "forward" && paths == &["init.nc"])
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_outputs_fail_even_when_substeps_succeed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = WorkRegistry::with_builtins();
        registry.register("count", Counting(calls.clone()));
        let env = environment(registry);
        let temp = tempdir().unwrap();
        let step = fitted(
            Step::new("forward")
                .with_outputs(["output.nc"])
                .with_substep(Substep::callback("run", "count"))
                .unwrap(),
        );

        let err = run_step(&step, &env, temp.path()).await.unwrap_err();
        assert!(matches!(err, Error::MissingOutputs { paths, .. } if paths == ["output.nc"]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let step = fitted(
            Step::new("forward")
                .with_outputs(["output.nc"])
                .with_substep(Substep::callback("touch", "touch_outputs"))
                .unwrap(),
        );
        run_step(&step, &env, temp.path()).await.unwrap();
    }

    #[tokio::test]
    async fn substeps_run_in_declaration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = WorkRegistry::new();
        registry.register("record", Recording(seen.clone()));
        let env = environment(registry);
        let temp = tempdir().unwrap();
        let mut step = Step::new("init");
        for (name, tasks) in [("A", 4), ("B", 1), ("C", 2)] {
            step.add_substep(Substep::callback(name, "record").with_resources(ResourceRequest {
                tasks,
                ..ResourceRequest::default()
            }))
            .unwrap();
        }
        let step = fitted(step);

        run_step(&step, &env, temp.path()).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), ["A", "B", "C"]);
    }

    #[tokio::test]
    async fn substeps_to_run_picks_a_subset_in_its_own_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = WorkRegistry::new();
        registry.register("record", Recording(seen.clone()));
        let env = environment(registry);
        let temp = tempdir().unwrap();
        let mut step = Step::new("init");
        for name in ["A", "B", "C"] {
            step.add_substep(Substep::callback(name, "record")).unwrap();
        }
        step.substeps_to_run = Some(vec!["C".into(), "A".into()]);
        step.check().unwrap();
        let step = fitted(step);

        run_step(&step, &env, temp.path()).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), ["C", "A"]);
    }

    #[test]
    fn substeps_to_run_must_name_known_substeps_once() {
        let mut step = Step::new("init")
            .with_substep(Substep::callback("A", "record"))
            .unwrap();
        step.substeps_to_run = Some(vec!["B".into()]);
        let err = step.check().unwrap_err();
        assert!(err.to_string().contains("unknown substep 'B'"));

        step.substeps_to_run = Some(vec!["A".into(), "A".into()]);
        let err = step.check().unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[tokio::test]
    async fn first_failing_substep_stops_the_step() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = WorkRegistry::new();
        registry.register("record", Recording(seen.clone()));
        registry.register("fail", Failing);
        let env = environment(registry);
        let temp = tempdir().unwrap();
        let step = fitted(
            Step::new("mesh")
                .with_substep(Substep::callback("first", "record"))
                .unwrap()
                .with_substep(Substep::callback("boom", "fail"))
                .unwrap()
                .with_substep(Substep::callback("last", "record"))
                .unwrap(),
        );

        let err = run_step(&step, &env, temp.path()).await.unwrap_err();
        assert!(matches!(&err, Error::Work(inner) if inner.to_string() == "mesh generation blew up"));
        assert_eq!(*seen.lock().unwrap(), ["first"]);
    }

    #[tokio::test]
    async fn cached_step_is_a_no_op() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = WorkRegistry::new();
        registry.register("count", Counting(calls.clone()));
        let env = environment(registry);
        let temp = tempdir().unwrap();
        let mut step = Step::new("mesh")
            .with_inputs(["absent.nc"])
            .with_substep(Substep::callback("run", "count"))
            .unwrap();
        step.cached = true;

        run_step(&step, &env, temp.path()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unfitted_substep_cannot_execute() {
        let env = environment(WorkRegistry::with_builtins());
        let temp = tempdir().unwrap();
        let step = Step::new("mesh")
            .with_substep(Substep::callback("run", "touch_outputs"))
            .unwrap();

        let err = run_step(&step, &env, temp.path()).await.unwrap_err();
        assert!(matches!(err, Error::NotFitted(name) if name == "run"));
    }

    #[test]
    fn subdirs_must_stay_inside_the_test_case() {
        for subdir in ["../escape", "/tmp/forward", "mesh/../../x", "./", ""] {
            let mut step = Step::new("forward");
            step.subdir = Some(subdir.into());
            let err = step.check().unwrap_err();
            assert!(err.to_string().contains("must be a relative path"), "{subdir}");
        }
        let mut step = Step::new("forward");
        step.subdir = Some("ocean/forward".into());
        step.check().unwrap();
    }

    #[test]
    fn duplicate_substep_names_are_rejected() {
        let err = Step::new("mesh")
            .with_substep(Substep::callback("run", "touch_outputs"))
            .unwrap()
            .with_substep(Substep::callback("run", "copy_inputs"))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
