use serde::{Deserialize, Serialize};

use crate::{
    history::{RunRecord, RunSummary},
    runner::CaseRecord,
};

#[derive(Serialize, Deserialize, Clone)]
pub struct RunListExport {
    pub runs: Vec<RunSummaryExport>,
}

impl RunListExport {
    pub fn from_summaries(summaries: Vec<RunSummary>) -> Self {
        Self {
            runs: summaries.into_iter().map(RunSummaryExport::from).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
pub struct RunSummaryExport {
    pub run_id: String,
    pub mode: String,
    pub target: String,
    pub status: String,
    pub failures: usize,
    pub updated_at: i64,
}

impl From<RunSummary> for RunSummaryExport {
    fn from(value: RunSummary) -> Self {
        Self {
            run_id: value.run_id,
            mode: value.mode.as_str().to_string(),
            target: value.target,
            status: value.status.as_str().to_string(),
            failures: value.failures,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
pub struct RunDetailExport {
    pub run_id: String,
    pub mode: String,
    pub target: String,
    pub work_dir: String,
    pub status: String,
    pub started_at: i64,
    pub updated_at: i64,
    pub failures: usize,
    pub cases: Vec<CaseRecord>,
}

impl RunDetailExport {
    pub fn from_record(record: &RunRecord) -> Self {
        Self {
            run_id: record.run_id.clone(),
            mode: record.mode.as_str().to_string(),
            target: record.target.clone(),
            work_dir: record.work_dir.clone(),
            status: record.status.as_str().to_string(),
            started_at: record.started_at,
            updated_at: record.updated_at,
            failures: count_failures(&record.cases),
            cases: record.cases.clone(),
        }
    }
}

pub fn count_failures(cases: &[CaseRecord]) -> usize {
    cases.iter().filter(|case| !case.passed()).count()
}
