use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context as _, ensure};
use async_trait::async_trait;

use crate::{
    error::{Error, Result},
    logging::LogContext,
    resources::FittedAllocation,
    test_case::ValidationResult,
};

/// What an in-process substep sees while it runs.
pub struct WorkContext<'a> {
    pub step: &'a str,
    pub substep: &'a str,
    pub work_dir: &'a Path,
    pub inputs: &'a [String],
    pub outputs: &'a [String],
    pub allocation: FittedAllocation,
    pub log: &'a LogContext<'a>,
}

impl WorkContext<'_> {
    pub fn path(&self, relative: &str) -> PathBuf {
        self.work_dir.join(relative)
    }
}

/// In-process unit of work, looked up by name when a substep executes.
#[async_trait]
pub trait SubstepWork: Send + Sync {
    async fn run(&self, ctx: &WorkContext<'_>) -> anyhow::Result<()>;
}

/// Extra validation a test case can request by name.
pub trait CaseValidator: Send + Sync {
    fn validate(
        &self,
        case_dir: &Path,
        baseline_dir: Option<&Path>,
    ) -> anyhow::Result<ValidationResult>;
}

/// Named callbacks and validators available to persisted test cases.
#[derive(Default, Clone)]
pub struct WorkRegistry {
    work: BTreeMap<String, Arc<dyn SubstepWork>>,
    validators: BTreeMap<String, Arc<dyn CaseValidator>>,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the file-plumbing callbacks.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("touch_outputs", TouchOutputs);
        registry.register("copy_inputs", CopyInputs);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, work: impl SubstepWork + 'static) {
        self.work.insert(name.into(), Arc::new(work));
    }

    pub fn register_validator(
        &mut self,
        name: impl Into<String>,
        validator: impl CaseValidator + 'static,
    ) {
        self.validators.insert(name.into(), Arc::new(validator));
    }

    pub fn work(&self, name: &str) -> Result<Arc<dyn SubstepWork>> {
        self.work
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownCallback(name.to_string()))
    }

    pub fn validator(&self, name: &str) -> Result<Arc<dyn CaseValidator>> {
        self.validators
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownCallback(name.to_string()))
    }
}

/// Creates every declared output of the step as an empty file.
pub struct TouchOutputs;

#[async_trait]
impl SubstepWork for TouchOutputs {
    async fn run(&self, ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        for output in ctx.outputs {
            let path = ctx.path(output);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            ctx.log.info(format!("created {output}"));
        }
        Ok(())
    }
}

/// Copies input `i` to output `i`.
pub struct CopyInputs;

#[async_trait]
impl SubstepWork for CopyInputs {
    async fn run(&self, ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        ensure!(
            ctx.inputs.len() == ctx.outputs.len(),
            "copy_inputs needs as many outputs as inputs in step '{}' ({} vs {})",
            ctx.step,
            ctx.inputs.len(),
            ctx.outputs.len()
        );
        for (input, output) in ctx.inputs.iter().zip(ctx.outputs) {
            let target = ctx.path(output);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(ctx.path(input), &target)
                .await
                .with_context(|| format!("Failed to copy {input} to {output}"))?;
            ctx.log.info(format!("copied {input} -> {output}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Memory;
    use tempfile::tempdir;

    fn allocation() -> FittedAllocation {
        FittedAllocation {
            tasks: 1,
            cpus_per_task: 1,
            threads: 1,
            memory: Memory::default(),
        }
    }

    #[tokio::test]
    async fn builtins_create_and_copy_files() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("mesh.nc"), b"mesh").unwrap();
        let registry = WorkRegistry::with_builtins();
        let (log, _) = LogContext::buffered("step");
        let inputs = vec!["mesh.nc".to_string()];
        let outputs = vec!["out/culled.nc".to_string()];
        let ctx = WorkContext {
            step: "cull",
            substep: "default",
            work_dir: temp.path(),
            inputs: &inputs,
            outputs: &outputs,
            allocation: allocation(),
            log: &log,
        };

        registry.work("copy_inputs").unwrap().run(&ctx).await.unwrap();
        assert_eq!(
            std::fs::read(temp.path().join("out/culled.nc")).unwrap(),
            b"mesh"
        );

        let outputs = vec!["done.txt".to_string()];
        let ctx = WorkContext {
            outputs: &outputs,
            ..ctx
        };
        registry.work("touch_outputs").unwrap().run(&ctx).await.unwrap();
        assert!(temp.path().join("done.txt").exists());
    }

    #[test]
    fn unknown_callback_is_reported_by_name() {
        let registry = WorkRegistry::with_builtins();
        assert!(registry.work("touch_outputs").is_ok());
        let err = registry.work("mesh_generation").err().unwrap();
        assert!(matches!(err, Error::UnknownCallback(name) if name == "mesh_generation"));
    }
}
