use std::sync::Arc;

use handlebars::Handlebars;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    config::RunnerConfig,
    error::{Error, Result},
    launcher::{LaunchOutput, LaunchRequest, ProcessLauncher, TokioLauncher},
    logging::LogContext,
    parallel::{Capacity, LauncherFlavor, THREADS_ENV_VAR, launch_prefix},
    registry::WorkRegistry,
    resources::FittedAllocation,
};

/// Services shared by every test case, step and substep of one invocation.
pub struct Environment {
    config: RunnerConfig,
    flavor: LauncherFlavor,
    launcher: Arc<dyn ProcessLauncher>,
    registry: Arc<WorkRegistry>,
    renderer: Handlebars<'static>,
    capacity: Option<Capacity>,
    self_program: String,
}

impl Environment {
    pub fn new(config: RunnerConfig, registry: WorkRegistry) -> Result<Self> {
        let flavor = config
            .parallel
            .launcher_flavor()
            .map_err(|err| Error::Configuration(err.to_string()))?;
        let mut renderer = Handlebars::new();
        renderer.set_strict_mode(true);
        renderer.register_escape_fn(handlebars::no_escape);
        let self_program = std::env::current_exe()
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string());
        Ok(Self {
            config,
            flavor,
            launcher: Arc::new(TokioLauncher),
            registry: Arc::new(registry),
            renderer,
            capacity: None,
            self_program,
        })
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Pins capacity instead of discovering it from the environment.
    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_self_program(mut self, program: impl Into<String>) -> Self {
        self.self_program = program.into();
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn registry(&self) -> &WorkRegistry {
        &self.registry
    }

    pub fn self_program(&self) -> &str {
        &self.self_program
    }

    /// Snapshot of the cores available right now.
    pub fn capacity(&self) -> Result<Capacity> {
        match self.capacity {
            Some(capacity) => Ok(capacity),
            None => Capacity::discover(&self.config.parallel),
        }
    }

    pub fn launch_prefix(&self, allocation: &FittedAllocation, cpus_per_node: usize) -> Vec<String> {
        launch_prefix(
            &self.config.parallel.launcher,
            self.flavor,
            allocation,
            cpus_per_node,
        )
    }

    pub fn render<T: Serialize>(&self, template: &str, vars: &T) -> Result<String> {
        self.renderer
            .render_template(template, vars)
            .map_err(|err| Error::Template(format!("'{template}': {err}")))
    }

    /// Runs one command to completion, logging its output to `log` line by
    /// line while it runs.
    ///
    /// The thread count is passed to this child alone.
    pub async fn dispatch(
        &self,
        mut request: LaunchRequest,
        threads: usize,
        log: &LogContext<'_>,
    ) -> Result<LaunchOutput> {
        request
            .env
            .push((THREADS_ENV_VAR.to_string(), threads.to_string()));
        log.info(format!("Running: {}", request.display()));
        let (lines, mut received) = mpsc::unbounded_channel();
        let drain = async {
            while let Some(line) = received.recv().await {
                log.info(line);
            }
        };
        let (output, ()) = tokio::join!(self.launcher.launch(&request, lines), drain);
        let output = output?;
        if !output.success() {
            return Err(Error::ExternalProcess {
                command: request.display(),
                code: output.code,
            });
        }
        Ok(output)
    }
}
