use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result, anyhow, ensure};
use serde::{Deserialize, Serialize};

use crate::{parallel::LauncherFlavor, resources::ResourceOverrides};

pub const CONFIG_VERSION: u32 = 1;

/// Runner configuration: how to launch parallel work and where to find
/// executables and baselines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub parallel: ParallelConfig,
    #[serde(default)]
    pub executables: ExecutablesConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    /// Resource overrides keyed by `<step>/<substep>`, or by
    /// `<test case>/<step>/<substep>` for a single test case.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, ResourceOverrides>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            parallel: ParallelConfig::default(),
            executables: ExecutablesConfig::default(),
            validation: ValidationConfig::default(),
            resources: BTreeMap::new(),
        }
    }
}

impl RunnerConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)
            .with_context(|| format!("Failed to read config file at {}", path_ref.display()))?;
        let mut config = Self::from_yaml_str(&raw)
            .with_context(|| format!("Invalid configuration in {}", path_ref.display()))?;
        let base_dir = path_ref.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base_dir);
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Unable to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.version == CONFIG_VERSION,
            "Unsupported config version {} (expected {CONFIG_VERSION})",
            self.version
        );
        self.parallel.validate().context("Invalid parallel section")?;
        ensure!(
            !self.executables.partition.trim().is_empty(),
            "executables.partition must not be blank"
        );
        for key in self.resources.keys() {
            let segments: Vec<&str> = key.split('/').collect();
            ensure!(
                matches!(segments.len(), 2 | 3) && segments.iter().all(|s| !s.trim().is_empty()),
                "resources key '{key}' must be <step>/<substep> or <test case>/<step>/<substep>"
            );
        }
        Ok(())
    }

    /// Makes relative paths relative to the directory holding the config file.
    fn resolve_paths(&mut self, base_dir: &Path) {
        if let Some(model) = &self.executables.model
            && model.components().count() > 1
            && model.is_relative()
        {
            self.executables.model = Some(base_dir.join(model));
        }
        if let Some(baseline) = &self.validation.baseline_dir
            && baseline.is_relative()
        {
            self.validation.baseline_dir = Some(base_dir.join(baseline));
        }
    }
}

impl FromStr for RunnerConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_yaml_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelSystem {
    #[default]
    SingleNode,
    Slurm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelConfig {
    #[serde(default)]
    pub system: ParallelSystem,
    /// Parallel launcher command line, e.g. `mpirun` or `srun --mpi=pmi2`.
    #[serde(default = "default_launcher")]
    pub launcher: String,
    #[serde(default)]
    pub cores_per_node: Option<usize>,
    /// Total cores to use instead of what the machine reports.
    #[serde(default)]
    pub cores: Option<usize>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            system: ParallelSystem::default(),
            launcher: default_launcher(),
            cores_per_node: None,
            cores: None,
        }
    }
}

impl ParallelConfig {
    pub fn launcher_flavor(&self) -> Result<LauncherFlavor> {
        let program = self
            .launcher
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow!("parallel.launcher must not be blank"))?;
        LauncherFlavor::from_program(program)
            .ok_or_else(|| anyhow!("Unsupported parallel launcher '{program}' (use srun or mpirun)"))
    }

    fn validate(&self) -> Result<()> {
        self.launcher_flavor()?;
        if let Some(per_node) = self.cores_per_node {
            ensure!(per_node > 0, "parallel.cores_per_node must be > 0");
        }
        if let Some(cores) = self.cores {
            ensure!(cores > 0, "parallel.cores must be > 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutablesConfig {
    #[serde(default)]
    pub model: Option<PathBuf>,
    #[serde(default = "default_partition")]
    pub partition: String,
}

impl Default for ExecutablesConfig {
    fn default() -> Self {
        Self {
            model: None,
            partition: default_partition(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    /// Work directory of a reference run to compare outputs against.
    #[serde(default)]
    pub baseline_dir: Option<PathBuf>,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_launcher() -> String {
    "mpirun".into()
}

fn default_partition() -> String {
    "gpmetis".into()
}
