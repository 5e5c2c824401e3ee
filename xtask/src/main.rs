use std::fs;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(author, version, about = "Workspace maintenance tasks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that lower layers of the crate do not reach into higher ones.
    CheckArchitecture,
}

/// Files that must not use the listed crate modules, grouped imports included.
const LAYERS: &[(&[&str], &[&str])] = &[
    (
        &["src/resources.rs", "src/parallel.rs", "src/config.rs", "src/error.rs"],
        &["environment", "step", "substep", "test_case", "suite", "runner"],
    ),
    (
        &["src/substep.rs", "src/step.rs", "src/test_case.rs", "src/suite.rs"],
        &["runner", "state", "history", "cli"],
    ),
    (&["src/runner.rs", "src/state.rs"], &["history", "cli"]),
];

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::CheckArchitecture => check_architecture(),
    }
}

fn check_architecture() -> Result<()> {
    let mut offenders = Vec::new();
    for (files, forbidden) in LAYERS {
        for file in *files {
            let content =
                fs::read_to_string(file).with_context(|| format!("Failed to read {file}"))?;
            for module in *forbidden {
                if uses_module(&content, module) {
                    offenders.push(format!("{file} uses crate module '{module}'"));
                }
            }
        }
    }
    offenders.extend(find_patterns_in_tree("src", &["set_current_dir"])?);

    if offenders.is_empty() {
        println!("Architecture checks passed");
        Ok(())
    } else {
        Err(anyhow!("Layering violations:\n  {}", offenders.join("\n  ")))
    }
}

/// True when `module::` appears as a whole path segment.
fn uses_module(content: &str, module: &str) -> bool {
    let needle = format!("{module}::");
    content.match_indices(&needle).any(|(at, _)| {
        content[..at]
            .chars()
            .next_back()
            .is_none_or(|c| !(c.is_alphanumeric() || c == '_'))
    })
}

fn find_patterns(path: &str, needles: &[&str]) -> Result<Vec<String>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
    Ok(needles
        .iter()
        .filter(|needle| content.contains(*needle))
        .map(|needle| format!("{path} references '{needle}'"))
        .collect())
}

/// The working directory is process-wide; children get theirs through `Command`.
fn find_patterns_in_tree(dir: &str, needles: &[&str]) -> Result<Vec<String>> {
    let mut offenders = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                offenders.push(format!("{dir} (walk error: {e})"));
                continue;
            }
        };
        if !entry.file_type().is_file()
            || entry.path().extension().and_then(|ext| ext.to_str()) != Some("rs")
        {
            continue;
        }
        let path = entry.path().display().to_string();
        offenders.extend(find_patterns(&path, needles)?);
    }
    Ok(offenders)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_uses_respect_segment_boundaries() {
        let content = "use crate::{\n    substep::Substep,\n    test_case::TestCase,\n};";
        assert!(uses_module(content, "substep"));
        assert!(uses_module(content, "test_case"));
        assert!(!uses_module(content, "step"));
        assert!(!uses_module(content, "case"));
    }
}
