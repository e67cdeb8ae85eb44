//! Step contract and result types
//!
//! A step is one idempotent provisioning action. The engine drives it
//! through a fixed protocol:
//!
//! 1. `check()` reports whether the desired state already holds
//! 2. if not, `apply()` tries to establish it and reports a [`StepResult`]
//!
//! `apply()` must be safe to call when the state already holds; the engine
//! relies on that when retrying.

use crate::command_runner::{CommandRunner, CommandSpec};
use crate::environment::EnvSnapshot;
use crate::error::ProvisionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use strum::{Display, EnumString};

/// Default per-command time limit
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Answer of a precondition check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Desired state already holds; `apply()` is not needed
    Satisfied,
    /// Desired state does not hold
    Unsatisfied,
    /// The check itself could not run; treated as unsatisfied
    Unknown(String),
}

/// What the engine does when a step ends `failed` or `timed-out`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop the run; no later step executes
    #[default]
    #[serde(rename = "abort-plan")]
    Abort,
    /// Record the failure and move on
    Continue,
    /// Re-apply up to n more times, then abort
    Retry(u32),
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => write!(f, "abort-plan"),
            Self::Continue => write!(f, "continue"),
            Self::Retry(n) => write!(f, "retry-{}-times", n),
        }
    }
}

/// Terminal status of one step
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StepStatus {
    /// Precondition was already satisfied
    Skipped,
    Succeeded,
    Failed,
    TimedOut,
}

impl StepStatus {
    /// Skipped and succeeded both leave the host in the desired state
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Skipped | Self::Succeeded)
    }
}

/// Recorded outcome of one step. Immutable once the engine stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    /// Captured output or error text
    pub detail: String,
    pub duration_ms: u64,
    /// Times `apply()` ran (0 when skipped by the precondition)
    pub attempts: u32,
    /// Manual recovery instructions, attached when the step did not succeed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl StepResult {
    fn new(step_id: &str, status: StepStatus, detail: impl Into<String>) -> Self {
        Self {
            step_id: step_id.to_string(),
            status,
            detail: detail.into(),
            duration_ms: 0,
            attempts: 0,
            hint: None,
        }
    }

    pub fn skipped(step_id: &str, detail: impl Into<String>) -> Self {
        Self::new(step_id, StepStatus::Skipped, detail)
    }

    pub fn succeeded(step_id: &str, detail: impl Into<String>) -> Self {
        Self::new(step_id, StepStatus::Succeeded, detail)
    }

    pub fn failed(step_id: &str, detail: impl Into<String>) -> Self {
        Self::new(step_id, StepStatus::Failed, detail)
    }

    /// Fold an error into a result: timeouts become `timed-out`, the rest `failed`
    pub fn from_error(step_id: &str, err: &ProvisionError) -> Self {
        let status = if err.is_timeout() {
            StepStatus::TimedOut
        } else {
            StepStatus::Failed
        };
        Self::new(step_id, status, err.to_string())
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Everything a step may touch while checking or applying
pub struct StepContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub env: &'a EnvSnapshot,
    /// Per-command time limit for this step
    pub timeout: Duration,
    /// Steps that write files must not do so when set
    pub dry_run: bool,
}

impl StepContext<'_> {
    /// Command spec with this context's PATH and timeout applied
    pub fn command<I, S>(&self, program: &str, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(program, args, self.timeout).with_path(self.env.path().clone())
    }
}

/// A provisioning action with a precondition and an apply action
pub trait Step {
    /// Unique name within a plan, e.g. `install-packages`
    fn id(&self) -> &str;

    /// One-line human description
    fn description(&self) -> String;

    fn check(&self, ctx: &StepContext<'_>) -> Precondition;

    fn apply(&self, ctx: &StepContext<'_>) -> StepResult;

    fn on_failure(&self) -> FailurePolicy {
        FailurePolicy::Abort
    }

    fn timeout(&self) -> Duration {
        DEFAULT_STEP_TIMEOUT
    }

    /// How to undo this step by hand. Informational only.
    fn rollback_hint(&self) -> Option<String> {
        None
    }

    /// What the user should do if the step cannot be completed automatically
    fn manual_hint(&self) -> Option<String> {
        None
    }

    /// Whether the engine must refresh the environment snapshot first
    fn needs_fresh_env(&self) -> bool {
        false
    }
}
