use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{
    error::{Error, Result},
    launcher::LaunchRequest,
    parallel::Capacity,
    registry::WorkContext,
    resources::{FittedAllocation, IoLayout, ResourceOverrides, ResourceRequest, fit},
    step::{Step, StepContext},
};

/// What a substep does when it executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubstepAction {
    /// In-process work looked up by name in the registry.
    Callback { name: String },
    /// Templated external command, optionally behind the parallel launcher.
    Command {
        args: Vec<String>,
        #[serde(default = "default_true")]
        launch: bool,
    },
    /// Partition the mesh graph, then run the configured model executable.
    Model {
        namelist: String,
        streams: String,
        #[serde(default = "default_graph_file")]
        graph_file: String,
        #[serde(default = "default_true")]
        partition: bool,
        #[serde(default)]
        io_tasks: Option<usize>,
    },
}

impl SubstepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            SubstepAction::Callback { .. } => "callback",
            SubstepAction::Command { .. } => "command",
            SubstepAction::Model { .. } => "model",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_graph_file() -> String {
    "graph.info".into()
}

/// Smallest schedulable unit, with its own resource request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Substep {
    pub name: String,
    #[serde(default)]
    pub resources: ResourceRequest,
    pub action: SubstepAction,
    #[serde(skip)]
    fitted: Option<FittedAllocation>,
}

impl Substep {
    pub fn new(name: impl Into<String>, action: SubstepAction) -> Self {
        Self {
            name: name.into(),
            resources: ResourceRequest::default(),
            action,
            fitted: None,
        }
    }

    pub fn callback(name: impl Into<String>, callback: impl Into<String>) -> Self {
        Self::new(
            name,
            SubstepAction::Callback {
                name: callback.into(),
            },
        )
    }

    pub fn command<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            SubstepAction::Command {
                args: args.into_iter().map(Into::into).collect(),
                launch: false,
            },
        )
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    /// Adjusts the resource request; only allowed before fitting.
    pub fn configure(&mut self, overrides: &ResourceOverrides) -> Result<()> {
        if self.fitted.is_some() {
            return Err(Error::ConfigurationTooLate(self.name.clone()));
        }
        let mut updated = self.resources;
        updated.apply(overrides);
        updated
            .validate()
            .map_err(|reason| Error::Configuration(format!("substep '{}': {reason}", self.name)))?;
        self.resources = updated;
        Ok(())
    }

    /// Fits the request to `capacity`. A substep that is already fitted keeps
    /// its allocation.
    pub fn fit(&mut self, capacity: Capacity) -> Result<FittedAllocation> {
        if let Some(fitted) = self.fitted {
            return Ok(fitted);
        }
        self.resources
            .validate()
            .map_err(|reason| Error::Configuration(format!("substep '{}': {reason}", self.name)))?;
        let fitted = fit(
            &self.resources,
            capacity.available_tasks,
            capacity.cpus_per_node,
        )
        .map_err(|source| Error::resource(&self.name, source))?;
        self.fitted = Some(fitted);
        Ok(fitted)
    }

    pub fn allocation(&self) -> Result<FittedAllocation> {
        self.fitted
            .ok_or_else(|| Error::NotFitted(self.name.clone()))
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    /// Runs the substep as part of `step`.
    ///
    /// Callbacks of a step marked `run_substeps_as_commands` are handed to a
    /// fresh `testflow run --substep` process behind the parallel launcher.
    pub async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<()> {
        self.run_action(step, ctx, step.run_substeps_as_commands).await
    }

    /// Runs the substep in this process, as `testflow run --substep` does.
    pub async fn execute_standalone(&self, step: &Step, ctx: &StepContext<'_>) -> Result<()> {
        self.run_action(step, ctx, false).await
    }

    async fn run_action(
        &self,
        step: &Step,
        ctx: &StepContext<'_>,
        as_command: bool,
    ) -> Result<()> {
        let allocation = self.allocation()?;
        if ctx.print_substeps {
            ctx.log.announce(format!("    * substep: {}", self.name));
        }
        match &self.action {
            SubstepAction::Callback { .. } if as_command => {
                let mut argv = ctx.env.launch_prefix(&allocation, ctx.capacity.cpus_per_node);
                argv.extend([
                    ctx.env.self_program().to_string(),
                    "run".into(),
                    "--substep".into(),
                    self.name.clone(),
                    "--no-history".into(),
                ]);
                self.dispatch(argv, allocation, ctx).await
            }
            SubstepAction::Callback { name } => {
                let work = ctx.env.registry().work(name)?;
                let work_ctx = WorkContext {
                    step: &step.name,
                    substep: &self.name,
                    work_dir: ctx.work_dir,
                    inputs: &step.inputs,
                    outputs: &step.outputs,
                    allocation,
                    log: ctx.log,
                };
                work.run(&work_ctx).await?;
                Ok(())
            }
            SubstepAction::Command { args, launch } => {
                let vars = self.template_vars(allocation, ctx);
                let mut argv = if *launch {
                    ctx.env.launch_prefix(&allocation, ctx.capacity.cpus_per_node)
                } else {
                    Vec::new()
                };
                for arg in args {
                    argv.push(ctx.env.render(arg, &vars)?);
                }
                self.dispatch(argv, allocation, ctx).await
            }
            SubstepAction::Model {
                namelist,
                streams,
                graph_file,
                partition,
                io_tasks,
            } => {
                let model = ctx.env.config().executables.model.clone().ok_or_else(|| {
                    Error::Configuration(format!(
                        "substep '{}' runs the model but executables.model is not set",
                        self.name
                    ))
                })?;
                let layout = IoLayout::derive(&allocation, ctx.capacity.cpus_per_node, *io_tasks)
                    .map_err(|source| Error::resource(&self.name, source))?;
                ctx.log.info(format!(
                    "I/O layout: {} I/O tasks with stride {}",
                    layout.io_tasks, layout.io_stride
                ));
                if *partition && allocation.tasks > 1 {
                    let argv = vec![
                        ctx.env.config().executables.partition.clone(),
                        graph_file.clone(),
                        allocation.tasks.to_string(),
                    ];
                    self.dispatch(argv, allocation, ctx).await?;
                }
                let mut argv = ctx.env.launch_prefix(&allocation, ctx.capacity.cpus_per_node);
                argv.extend([
                    model.to_string_lossy().into_owned(),
                    "-n".into(),
                    namelist.clone(),
                    "-s".into(),
                    streams.clone(),
                ]);
                self.dispatch(argv, allocation, ctx).await
            }
        }
    }

    async fn dispatch(
        &self,
        argv: Vec<String>,
        allocation: FittedAllocation,
        ctx: &StepContext<'_>,
    ) -> Result<()> {
        let request = LaunchRequest {
            argv,
            work_dir: ctx.work_dir.to_path_buf(),
            env: Vec::new(),
        };
        ctx.env
            .dispatch(request, allocation.threads, ctx.log)
            .await
            .map(|_| ())
    }

    fn template_vars(&self, allocation: FittedAllocation, ctx: &StepContext<'_>) -> Value {
        let mut vars = Map::new();
        vars.insert("tasks".into(), json!(allocation.tasks));
        vars.insert("cpus_per_task".into(), json!(allocation.cpus_per_task));
        vars.insert("threads".into(), json!(allocation.threads));
        vars.insert("memory".into(), json!(allocation.memory.to_string()));
        vars.insert("work_dir".into(), json!(ctx.work_dir.display().to_string()));
        // Only present when derivable; templates that need them fail to render otherwise.
        if let Ok(layout) = IoLayout::derive(&allocation, ctx.capacity.cpus_per_node, None) {
            vars.insert("io_tasks".into(), json!(layout.io_tasks));
            vars.insert("io_stride".into(), json!(layout.io_stride));
        }
        vars.insert("alloc".into(), ctx.allocations.clone());
        Value::Object(vars)
    }
}
