use crate::{
    config::{ParallelConfig, ParallelSystem},
    error::{Error, Result},
    resources::FittedAllocation,
};

/// Environment variable the launched model reads its thread count from.
pub const THREADS_ENV_VAR: &str = "OMP_NUM_THREADS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherFlavor {
    Srun,
    Mpirun,
}

impl LauncherFlavor {
    pub fn from_program(program: &str) -> Option<Self> {
        let base = program.rsplit('/').next().unwrap_or(program);
        match base {
            "srun" => Some(LauncherFlavor::Srun),
            "mpirun" | "mpiexec" => Some(LauncherFlavor::Mpirun),
            _ => None,
        }
    }
}

/// Cores available to this invocation, read once per `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub available_tasks: usize,
    pub cpus_per_node: usize,
}

impl Capacity {
    pub fn new(available_tasks: usize, cpus_per_node: usize) -> Self {
        Self {
            available_tasks,
            cpus_per_node,
        }
    }

    /// Discovers capacity from the surrounding scheduler environment.
    pub fn discover(config: &ParallelConfig) -> Result<Self> {
        Self::discover_with(config, |key| std::env::var(key).ok(), local_cores)
    }

    pub fn discover_with<F, L>(config: &ParallelConfig, env: F, local: L) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
        L: FnOnce() -> usize,
    {
        let capacity = match config.system {
            ParallelSystem::SingleNode => {
                let cores = config.cores.unwrap_or_else(local);
                let per_node = config.cores_per_node.unwrap_or(cores).min(cores);
                Capacity::new(cores, per_node)
            }
            ParallelSystem::Slurm => {
                let nodes = read_count(&env, "SLURM_JOB_NUM_NODES")?;
                let per_node = match config.cores_per_node {
                    Some(value) => value,
                    None => read_count(&env, "SLURM_CPUS_ON_NODE")?,
                };
                let cores = config.cores.unwrap_or(nodes * per_node);
                Capacity::new(cores, per_node)
            }
        };
        if capacity.available_tasks == 0 || capacity.cpus_per_node == 0 {
            return Err(Error::Configuration(format!(
                "no cores available ({} total, {} per node)",
                capacity.available_tasks, capacity.cpus_per_node
            )));
        }
        Ok(capacity)
    }
}

fn local_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn read_count<F>(env: &F, key: &str) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = env(key).ok_or_else(|| {
        Error::Configuration(format!(
            "{key} is not set; is this running inside a Slurm allocation?"
        ))
    })?;
    // SLURM_CPUS_ON_NODE may look like "36(x2)" on heterogeneous jobs.
    let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits
        .parse()
        .map_err(|_| Error::Configuration(format!("{key}='{raw}' is not a count")))
}

/// Builds `<launcher> <flags> -n <tasks> ...` for a fitted allocation; the
/// program and its arguments are appended by the caller.
pub fn launch_prefix(
    launcher: &str,
    flavor: LauncherFlavor,
    allocation: &FittedAllocation,
    cpus_per_node: usize,
) -> Vec<String> {
    let mut args: Vec<String> = launcher.split_whitespace().map(str::to_string).collect();
    match flavor {
        LauncherFlavor::Srun => {
            args.extend([
                "-c".into(),
                allocation.cpus_per_task.to_string(),
                "-N".into(),
                allocation.nodes(cpus_per_node).to_string(),
                "-n".into(),
                allocation.tasks.to_string(),
                "--mem".into(),
                allocation.memory.to_string(),
            ]);
        }
        LauncherFlavor::Mpirun => {
            args.extend(["-n".into(), allocation.tasks.to_string()]);
        }
    }
    args
}
