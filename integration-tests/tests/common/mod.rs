#![allow(dead_code)]

use std::path::PathBuf;

use assert_cmd::Command;
use tempfile::TempDir;

pub const DEFINITION: &str = r#"
name: nightly
test_cases:
  - name: channel
    subdir: ocean/channel
    steps:
      - name: mesh
        outputs: [mesh.txt]
        substeps:
          - name: build
            action: { kind: command, args: ["sh", "-c", "echo tasks={{tasks}} > mesh.txt"], launch: false }
          - name: check
            action: { kind: command, args: ["test", "-s", "mesh.txt"], launch: false }
      - name: forward
        inputs: [../mesh/mesh.txt]
        outputs: [output.txt]
        substeps:
          - name: run
            resources: { tasks: 2, min_tasks: 1 }
            action: { kind: callback, name: copy_inputs }
  - name: broken
    steps:
      - name: forward
        inputs: [restart.nc]
        substeps:
          - name: run
            action: { kind: callback, name: touch_outputs }
  - name: dome
    steps:
      - name: forward
        outputs: [dome.nc]
        substeps:
          - name: run
            action: { kind: callback, name: touch_outputs }
"#;

pub const CONFIG: &str = "parallel:\n  cores: 2\n";

/// A scratch home plus a work directory set up from `definition`.
pub struct Workspace {
    pub home: TempDir,
    pub work_dir: PathBuf,
}

impl Workspace {
    pub fn new(definition: &str) -> Self {
        let home = TempDir::new().unwrap();
        let work_dir = home.path().join("scratch");
        let definition_path = home.path().join("suite.yaml");
        let config_path = home.path().join("config.yaml");
        std::fs::write(&definition_path, definition).unwrap();
        std::fs::write(&config_path, CONFIG).unwrap();

        let workspace = Self { home, work_dir };
        workspace
            .testflow()
            .arg("setup")
            .arg("--definition")
            .arg(&definition_path)
            .arg("--work-dir")
            .arg(&workspace.work_dir)
            .arg("--config")
            .arg(&config_path)
            .assert()
            .success();
        workspace
    }

    /// The CLI with this workspace's home, ready for arguments.
    pub fn testflow(&self) -> Command {
        let mut cmd = testflow();
        cmd.env("TESTFLOW_HOME", self.home.path()).env("NO_COLOR", "1");
        cmd
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.work_dir.join(relative)
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path(relative)).unwrap()
    }
}

pub fn testflow() -> Command {
    let mut cmd = Command::new("cargo");
    cmd.arg("run")
        .arg("--quiet")
        .arg("-p")
        .arg("testflow")
        .arg("--bin")
        .arg("testflow")
        .arg("--");
    cmd
}
