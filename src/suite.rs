use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    test_case::TestCase,
};

/// Named collection of test cases, run in definition order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestSuite {
    pub name: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(skip)]
    work_dir: Option<PathBuf>,
}

impl TestSuite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            test_cases: Vec::new(),
            work_dir: None,
        }
    }

    /// Reads a suite definition written in YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let suite: Self = serde_yaml::from_str(yaml)
            .map_err(|err| Error::Configuration(format!("invalid suite definition: {err}")))?;
        suite.check()?;
        Ok(suite)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            Error::Configuration(format!(
                "cannot read suite definition {}: {err}",
                path.display()
            ))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn add_test_case(&mut self, test_case: TestCase) -> Result<()> {
        if let Some(existing) = self.test_cases.iter().find(|case| {
            case.name == test_case.name
                || case.subdir() == test_case.subdir()
                || case.log_name() == test_case.log_name()
        }) {
            return Err(Error::Configuration(format!(
                "suite '{}' already has test case '{}' in {}",
                self.name,
                existing.name,
                existing.subdir()
            )));
        }
        self.test_cases.push(test_case);
        Ok(())
    }

    pub fn test_case(&self, name: &str) -> Option<&TestCase> {
        self.test_cases.iter().find(|case| case.name == name)
    }

    /// Checks names, directories and every test case.
    pub fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.name.contains(['/', '\\']) {
            return Err(Error::Configuration(format!(
                "'{}' is not a valid suite name",
                self.name
            )));
        }
        for (index, case) in self.test_cases.iter().enumerate() {
            case.check()?;
            if let Some(earlier) = self.test_cases[..index]
                .iter()
                .find(|earlier| earlier.name == case.name || earlier.subdir() == case.subdir())
            {
                return Err(Error::Configuration(format!(
                    "test cases '{}' and '{}' share a name or directory",
                    earlier.name, case.name
                )));
            }
            if let Some(earlier) = self.test_cases[..index]
                .iter()
                .find(|earlier| earlier.log_name() == case.log_name())
            {
                return Err(Error::Configuration(format!(
                    "test cases '{}' and '{}' would share the log file {}.log",
                    earlier.name,
                    case.name,
                    case.log_name()
                )));
            }
        }
        Ok(())
    }

    /// Places every test case below `work_dir`.
    pub fn attach(&mut self, work_dir: impl Into<PathBuf>) {
        let work_dir = work_dir.into();
        for case in &mut self.test_cases {
            case.attach(work_dir.join(case.subdir()));
        }
        self.work_dir = Some(work_dir);
    }

    pub fn work_dir(&self) -> Result<&Path> {
        self.work_dir.as_deref().ok_or_else(|| {
            Error::Configuration(format!("suite '{}' has no work directory", self.name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITION: &str = r#"
name: nightly
test_cases:
  - name: baroclinic_channel
    subdir: ocean/baroclinic_channel/10km/default
    steps:
      - name: initial_state
        outputs: [ocean.nc]
        substeps:
          - name: run
            action: { kind: callback, name: touch_outputs }
      - name: forward
        inputs: [../initial_state/ocean.nc]
        substeps:
          - name: run
            resources: { tasks: 4, min_tasks: 1 }
            action: { kind: command, args: ["true"], launch: false }
  - name: dome
    steps: []
"#;

    #[test]
    fn loads_definition_in_order() {
        let suite = TestSuite::from_yaml_str(DEFINITION).unwrap();
        assert_eq!(suite.name, "nightly");
        let names: Vec<&str> = suite.test_cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["baroclinic_channel", "dome"]);
        let channel = suite.test_case("baroclinic_channel").unwrap();
        assert_eq!(channel.log_name(), "ocean_baroclinic_channel_10km_default");
        assert_eq!(channel.steps[1].substeps[0].resources.tasks, 4);
    }

    #[test]
    fn attach_places_cases_below_the_work_dir() {
        let mut suite = TestSuite::from_yaml_str(DEFINITION).unwrap();
        suite.attach("/scratch/run");
        assert_eq!(
            suite.test_cases[1].work_dir().unwrap(),
            Path::new("/scratch/run/dome")
        );
    }

    #[test]
    fn rejects_duplicate_cases_and_bad_definitions() {
        let mut suite = TestSuite::new("nightly");
        suite.add_test_case(TestCase::new("dome")).unwrap();
        assert!(suite.add_test_case(TestCase::new("dome")).is_err());

        let err = TestSuite::from_yaml_str("name: nightly\nbogus: true\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let yaml = "name: nightly\ntest_cases:\n  - name: a\n    subdir: x\n  - name: b\n    subdir: x\n";
        assert!(TestSuite::from_yaml_str(yaml).is_err());

        let yaml = "name: nightly\ntest_cases:\n  - name: a\n    subdir: ocean/a\n  - name: b\n    subdir: ocean_a\n";
        let err = TestSuite::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("ocean_a.log"));

        let yaml = "name: nightly\ntest_cases:\n  - name: a\n    subdir: ../a\n";
        let err = TestSuite::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("must be a relative path"));

        let yaml = "name: nightly\ntest_cases:\n  - name: a\n    steps:\n      - name: s\n        subdir: /tmp/s\n";
        assert!(TestSuite::from_yaml_str(yaml).is_err());

        let yaml = "name: nightly\ntest_cases:\n  - name: a\n    steps:\n      - name: s\n        substeps:\n          - name: r\n            resources: { tasks: 1, min_tasks: 2 }\n            action: { kind: callback, name: touch_outputs }\n";
        assert!(TestSuite::from_yaml_str(yaml).is_err());
    }
}
