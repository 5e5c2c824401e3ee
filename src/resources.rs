use std::{fmt, str::FromStr, sync::OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ResourceError;

/// Memory budget of a substep, stored in mebibytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Memory(u64);

impl Memory {
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib)
    }

    pub const fn mib(self) -> u64 {
        self.0
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self(1024)
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 > 0 && self.0 % (1024 * 1024) == 0 {
            write!(f, "{}T", self.0 / (1024 * 1024))
        } else if self.0 > 0 && self.0 % 1024 == 0 {
            write!(f, "{}G", self.0 / 1024)
        } else {
            write!(f, "{}M", self.0)
        }
    }
}

fn memory_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*(\d+)\s*([kmgt]?)i?b?\s*$").expect("memory pattern is valid")
    })
}

impl FromStr for Memory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = memory_pattern()
            .captures(s)
            .ok_or_else(|| format!("'{s}' is not a memory amount such as 512M or 4G"))?;
        let value: u64 = caps[1]
            .parse()
            .map_err(|err| format!("invalid memory amount '{s}': {err}"))?;
        let mib = match caps[2].to_ascii_uppercase().as_str() {
            "K" => Some(value.div_ceil(1024)),
            "" | "M" => Some(value),
            "G" => value.checked_mul(1024),
            "T" => value.checked_mul(1024 * 1024),
            _ => unreachable!("pattern only admits K, M, G or T"),
        };
        mib.map(Self)
            .ok_or_else(|| format!("invalid memory amount '{s}': too large"))
    }
}

impl TryFrom<String> for Memory {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Memory> for String {
    fn from(value: Memory) -> Self {
        value.to_string()
    }
}

/// Desired and minimum parallel resources of a substep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceRequest {
    pub tasks: usize,
    pub min_tasks: usize,
    pub cpus_per_task: usize,
    pub min_cpus_per_task: usize,
    pub threads: usize,
    pub memory: Memory,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            tasks: 1,
            min_tasks: 1,
            cpus_per_task: 1,
            min_cpus_per_task: 1,
            threads: 1,
            memory: Memory::default(),
        }
    }
}

impl ResourceRequest {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("tasks", self.tasks),
            ("min_tasks", self.min_tasks),
            ("cpus_per_task", self.cpus_per_task),
            ("min_cpus_per_task", self.min_cpus_per_task),
            ("threads", self.threads),
        ] {
            if value == 0 {
                return Err(format!("{name} must be at least 1"));
            }
        }
        if self.min_tasks > self.tasks {
            return Err(format!(
                "min_tasks ({}) exceeds tasks ({})",
                self.min_tasks, self.tasks
            ));
        }
        if self.min_cpus_per_task > self.cpus_per_task {
            return Err(format!(
                "min_cpus_per_task ({}) exceeds cpus_per_task ({})",
                self.min_cpus_per_task, self.cpus_per_task
            ));
        }
        Ok(())
    }

    /// Applies every field that is set in `overrides`, leaving the rest untouched.
    pub fn apply(&mut self, overrides: &ResourceOverrides) {
        if let Some(tasks) = overrides.tasks {
            self.tasks = tasks;
        }
        if let Some(min_tasks) = overrides.min_tasks {
            self.min_tasks = min_tasks;
        }
        if let Some(cpus) = overrides.cpus_per_task {
            self.cpus_per_task = cpus;
        }
        if let Some(min_cpus) = overrides.min_cpus_per_task {
            self.min_cpus_per_task = min_cpus;
        }
        if let Some(threads) = overrides.threads {
            self.threads = threads;
        }
        if let Some(memory) = overrides.memory {
            self.memory = memory;
        }
    }
}

/// Partial update of a [`ResourceRequest`] during the configuration phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceOverrides {
    pub tasks: Option<usize>,
    pub min_tasks: Option<usize>,
    pub cpus_per_task: Option<usize>,
    pub min_cpus_per_task: Option<usize>,
    pub threads: Option<usize>,
    pub memory: Option<Memory>,
}

/// Concrete resources granted to a substep for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FittedAllocation {
    pub tasks: usize,
    pub cpus_per_task: usize,
    pub threads: usize,
    pub memory: Memory,
}

impl FittedAllocation {
    pub fn total_cores(&self) -> usize {
        self.tasks * self.cpus_per_task
    }

    /// Number of nodes needed to host every task.
    pub fn nodes(&self, cpus_per_node: usize) -> usize {
        self.total_cores().div_ceil(cpus_per_node.max(1)).max(1)
    }
}

/// Fits `request` into the machine capacity.
///
/// Cores per task shrink toward the per-node core count and tasks shrink toward
/// what the remaining cores can host; neither may drop below its minimum.
pub fn fit(
    request: &ResourceRequest,
    available_tasks: usize,
    available_cpus_per_node: usize,
) -> Result<FittedAllocation, ResourceError> {
    if request.min_cpus_per_task > available_cpus_per_node {
        return Err(ResourceError::InsufficientCores {
            required: request.min_cpus_per_task,
            available: available_cpus_per_node,
        });
    }
    let cpus_per_task = request.cpus_per_task.min(available_cpus_per_node);
    let tasks = (available_tasks / cpus_per_task).min(request.tasks);
    if tasks < request.min_tasks {
        return Err(ResourceError::InsufficientTasks {
            required: request.min_tasks,
            available: tasks,
        });
    }
    Ok(FittedAllocation {
        tasks,
        cpus_per_task,
        threads: request.threads,
        memory: request.memory,
    })
}

/// Parallel I/O layout derived from a fitted allocation.
///
/// By default there is one I/O task per node; a model may ask for a fixed
/// number of I/O tasks instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoLayout {
    pub io_tasks: usize,
    pub io_stride: usize,
}

impl IoLayout {
    /// Fails rather than clamping when the stride would span more than one node.
    pub fn derive(
        allocation: &FittedAllocation,
        cpus_per_node: usize,
        requested_io_tasks: Option<usize>,
    ) -> Result<Self, ResourceError> {
        let io_tasks = requested_io_tasks
            .unwrap_or_else(|| allocation.nodes(cpus_per_node))
            .clamp(1, allocation.tasks.max(1));
        let io_stride = allocation.tasks / io_tasks;
        if io_stride > cpus_per_node {
            return Err(ResourceError::IncompatibleDerivedSetting {
                setting: "io_stride",
                value: io_stride,
                limit: cpus_per_node,
            });
        }
        Ok(Self {
            io_tasks,
            io_stride: io_stride.max(1),
        })
    }
}
