//! Plan execution engine
//!
//! The engine owns the run state machine and the environment snapshot. It
//! walks the plan strictly in order and always produces a [`RunReport`],
//! whatever the steps do.
//!
//! ```text
//! Pending -> Running -> Completed
//!                   \-> Aborted
//! ```

use std::fmt;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::command_runner::{CommandRunner, DryRunRunner};
use crate::environment::EnvSnapshot;
use crate::error::{ProvisionError, Result};
use crate::plan::Plan;
use crate::report::RunReport;
use crate::step::{FailurePolicy, Precondition, Step, StepContext, StepResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Pending,
    Running,
    Completed,
    Aborted,
}

impl EngineState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Aborted)
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineTransitionError {
    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: EngineState },

    #[error("Invalid transition from {from} to {to}")]
    Invalid { from: EngineState, to: EngineState },
}

impl From<EngineTransitionError> for ProvisionError {
    fn from(err: EngineTransitionError) -> Self {
        ProvisionError::state(err.to_string())
    }
}

/// Executes a [`Plan`] once
pub struct Engine<'a> {
    runner: &'a dyn CommandRunner,
    env: EnvSnapshot,
    dry_run: bool,
    state: EngineState,
}

impl<'a> Engine<'a> {
    pub fn new(runner: &'a dyn CommandRunner, env: EnvSnapshot) -> Self {
        Self {
            runner,
            env,
            dry_run: false,
            state: EngineState::Pending,
        }
    }

    /// Checks still query the host, but every `apply()` runs against a
    /// [`DryRunRunner`] and steps that write files only describe it.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn env(&self) -> &EnvSnapshot {
        &self.env
    }

    fn transition(&mut self, to: EngineState) -> std::result::Result<(), EngineTransitionError> {
        if self.state.is_terminal() {
            return Err(EngineTransitionError::FromTerminalState { from: self.state });
        }
        if !self.state.can_transition_to(to) {
            return Err(EngineTransitionError::Invalid {
                from: self.state,
                to,
            });
        }
        debug!(from = %self.state, to = %to, "engine state change");
        self.state = to;
        Ok(())
    }

    /// Run every step of `plan` in order.
    ///
    /// # Errors
    ///
    /// Only `State` when the engine has already run; step failures are
    /// reported in the returned [`RunReport`].
    pub fn run(&mut self, plan: &Plan) -> Result<RunReport> {
        self.transition(EngineState::Running)?;
        info!(steps = plan.len(), dry_run = self.dry_run, "starting provisioning run");

        let mut results = Vec::with_capacity(plan.len());
        let mut aborted_at = None;

        for step in plan.steps() {
            let result = self.execute(step.as_ref());
            let ok = result.is_ok();
            results.push(result);
            if ok {
                continue;
            }
            match step.on_failure() {
                FailurePolicy::Continue => {
                    warn!(step = step.id(), "step failed, continuing");
                }
                FailurePolicy::Abort | FailurePolicy::Retry(_) => {
                    error!(step = step.id(), "step failed, aborting run");
                    aborted_at = Some(step.id().to_string());
                    break;
                }
            }
        }

        let report = RunReport::new(results, aborted_at);
        let end = if report.aborted_at.is_some() {
            EngineState::Aborted
        } else {
            EngineState::Completed
        };
        self.transition(end)?;
        info!(outcome = %report.outcome, "provisioning run finished");
        Ok(report)
    }

    fn execute(&mut self, step: &dyn Step) -> StepResult {
        if step.needs_fresh_env() {
            self.env = self.env.refreshed();
        }
        let ctx = StepContext {
            runner: self.runner,
            env: &self.env,
            timeout: step.timeout(),
            dry_run: self.dry_run,
        };
        let started = Instant::now();
        info!(step = step.id(), "{}", step.description());

        let mut result = match step.check(&ctx) {
            Precondition::Satisfied => {
                debug!(step = step.id(), "precondition satisfied");
                StepResult::skipped(step.id(), "already satisfied")
            }
            precondition => {
                if let Precondition::Unknown(reason) = &precondition {
                    warn!(step = step.id(), %reason, "precondition unknown, applying");
                }
                if self.dry_run {
                    let dry = StepContext {
                        runner: &DryRunRunner,
                        ..ctx
                    };
                    self.apply_with_policy(step, &dry)
                } else {
                    self.apply_with_policy(step, &ctx)
                }
            }
        };

        result.step_id = step.id().to_string();
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if !result.is_ok() && result.hint.is_none() {
            result.hint = step.manual_hint();
        }

        if result.is_ok() {
            info!(step = step.id(), status = %result.status, "{}", result.detail);
        } else {
            error!(step = step.id(), status = %result.status, "{}", result.detail);
        }
        result
    }

    fn apply_with_policy(&self, step: &dyn Step, ctx: &StepContext<'_>) -> StepResult {
        let max_attempts = match step.on_failure() {
            FailurePolicy::Retry(n) => n.saturating_add(1),
            FailurePolicy::Abort | FailurePolicy::Continue => 1,
        };
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut result = step.apply(ctx);
            if result.is_ok() || attempts >= max_attempts {
                result.attempts = attempts;
                return result;
            }
            warn!(
                step = step.id(),
                attempt = attempts,
                max_attempts,
                detail = %result.detail,
                "step failed, retrying"
            );
        }
    }
}
