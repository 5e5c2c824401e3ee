use std::{
    fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context as AnyhowContext, Result, anyhow};
use rusqlite::{Connection, params};

use crate::{
    paths::data_dir,
    runner::{CaseRecord, RunMode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Passed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "passed" => Some(RunStatus::Passed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// One invocation of `testflow run`.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub mode: RunMode,
    pub target: String,
    pub work_dir: String,
    pub status: RunStatus,
    pub cases: Vec<CaseRecord>,
    pub started_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: RunMode,
    pub target: String,
    pub status: RunStatus,
    pub failures: usize,
    pub updated_at: i64,
}

/// SQLite-backed history of runs.
#[derive(Clone)]
pub struct RunStore {
    db_path: PathBuf,
}

impl RunStore {
    pub fn open(custom_root: Option<PathBuf>) -> Result<Self> {
        let base = custom_root.unwrap_or_else(data_dir);
        if !base.exists() {
            fs::create_dir_all(&base).with_context(|| {
                format!("Failed to create history directory {}", base.display())
            })?;
        }
        let store = Self {
            db_path: base.join("runs.sqlite3"),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Records the start of a run.
    pub fn begin(&self, run_id: &str, mode: RunMode, target: &str, work_dir: &str) -> Result<()> {
        let conn = self.connect()?;
        let now = timestamp();
        conn.execute(
            r#"
            INSERT INTO runs (run_id, mode, target, work_dir, status, cases_json, started_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, '[]', ?6, ?6)
            ON CONFLICT(run_id)
            DO UPDATE SET
                mode=excluded.mode,
                target=excluded.target,
                work_dir=excluded.work_dir,
                status=excluded.status,
                updated_at=excluded.updated_at
            "#,
            params![
                run_id,
                mode.as_str(),
                target,
                work_dir,
                RunStatus::Running.as_str(),
                now
            ],
        )?;
        Ok(())
    }

    pub fn finish(&self, run_id: &str, status: RunStatus, cases: &[CaseRecord]) -> Result<()> {
        let conn = self.connect()?;
        let cases_json = serde_json::to_string(cases)?;
        let updated = conn.execute(
            r#"
            UPDATE runs
            SET status = ?2, cases_json = ?3, updated_at = ?4
            WHERE run_id = ?1
            "#,
            params![run_id, status.as_str(), cases_json, timestamp()],
        )?;
        if updated == 0 {
            return Err(anyhow!("Run {run_id} was never started"));
        }
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<RunRecord> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                r#"
                SELECT mode, target, work_dir, status, cases_json, started_at, updated_at
                FROM runs
                WHERE run_id = ?1
                "#,
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .with_context(|| format!("Run {run_id} not found"))?;
        let (mode, target, work_dir, status, cases_json, started_at, updated_at) = row;
        Ok(RunRecord {
            run_id: run_id.to_string(),
            mode: parse_mode(&mode)?,
            target,
            work_dir,
            status: parse_status(&status)?,
            cases: serde_json::from_str(&cases_json)
                .with_context(|| format!("Corrupt case records for run {run_id}"))?,
            started_at,
            updated_at,
        })
    }

    /// Most recent runs first.
    pub fn list(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, mode, target, status, cases_json, updated_at
            FROM runs
            ORDER BY updated_at DESC, rowid DESC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (run_id, mode, target, status, cases_json, updated_at) = row?;
            let cases: Vec<CaseRecord> = serde_json::from_str(&cases_json).unwrap_or_default();
            summaries.push(RunSummary {
                run_id,
                mode: parse_mode(&mode)?,
                target,
                status: parse_status(&status)?,
                failures: cases.iter().filter(|case| !case.passed()).count(),
                updated_at,
            });
        }
        Ok(summaries)
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .with_context(|| format!("Failed to open run database {}", self.db_path.display()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                target TEXT NOT NULL,
                work_dir TEXT NOT NULL,
                status TEXT NOT NULL,
                cases_json TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

fn parse_mode(value: &str) -> Result<RunMode> {
    RunMode::parse(value).ok_or_else(|| anyhow!("Invalid mode '{value}' in store"))
}

fn parse_status(value: &str) -> Result<RunStatus> {
    RunStatus::from_str(value).ok_or_else(|| anyhow!("Invalid status '{value}' in store"))
}

fn timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::Status;
    use tempfile::tempdir;

    fn record(name: &str, run_status: Status) -> CaseRecord {
        CaseRecord {
            name: name.into(),
            run_status,
            internal_status: None,
            baseline_status: None,
            elapsed_secs: 1.5,
            error: None,
            log_file: None,
        }
    }

    #[test]
    fn records_and_lists_runs() {
        let temp = tempdir().unwrap();
        let store = RunStore::open(Some(temp.path().to_path_buf())).unwrap();
        store
            .begin("run-1", RunMode::Suite, "nightly", "/scratch")
            .expect("Started");
        assert_eq!(store.load("run-1").unwrap().status, RunStatus::Running);

        let cases = vec![record("one", Status::Success), record("two", Status::Error)];
        store
            .finish("run-1", RunStatus::Failed, &cases)
            .expect("Finished");

        let loaded = store.load("run-1").expect("Loaded");
        assert_eq!(loaded.mode, RunMode::Suite);
        assert_eq!(loaded.target, "nightly");
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.cases, cases);

        let list = store.list(10).expect("Listed");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].failures, 1);
    }

    #[test]
    fn finishing_an_unknown_run_fails() {
        let temp = tempdir().unwrap();
        let store = RunStore::open(Some(temp.path().to_path_buf())).unwrap();
        assert!(store.finish("missing", RunStatus::Passed, &[]).is_err());
        assert!(store.load("missing").is_err());
    }
}
