//! Run report: the ordered step results of one engine run

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::step::StepResult;

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Outcome {
    /// Every step ended skipped or succeeded
    Complete,
    /// All steps ran but at least one failed under `continue`
    Partial,
    /// A failure stopped the run early
    Aborted,
}

impl Outcome {
    /// Process exit code for this outcome
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Complete => 0,
            Outcome::Aborted => 1,
            Outcome::Partial => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub results: Vec<StepResult>,
    pub outcome: Outcome,
    /// Id of the step whose failure stopped the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<String>,
}

impl RunReport {
    /// Build a report from recorded results
    pub fn new(results: Vec<StepResult>, aborted_at: Option<String>) -> Self {
        let outcome = if aborted_at.is_some() {
            Outcome::Aborted
        } else if results.iter().all(StepResult::is_ok) {
            Outcome::Complete
        } else {
            Outcome::Partial
        };
        Self {
            results,
            outcome,
            aborted_at,
        }
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepResult> {
        self.results.iter().filter(|r| !r.is_ok())
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.results.iter().map(|r| r.duration_ms).sum()
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}
