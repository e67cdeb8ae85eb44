//! botstrap library
//!
//! Declarative host provisioning: a plan of idempotent steps (runtime,
//! packages, env file, systemd service) executed in order with a
//! structured report.

pub mod cli;
pub mod command_runner;
pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod plan;
pub mod process_guard;
pub mod report;
pub mod reporter;
pub mod step;
pub mod steps;
pub mod unit_file;

// Re-export main types for convenience
pub use command_runner::{
    CommandOutput, CommandRunner, CommandSpec, DryRunRunner, SystemRunner,
};
#[cfg(any(test, feature = "test-support"))]
pub use command_runner::{Reply, ScriptedRunner};
pub use config::{Profile, ProvisionConfig};
pub use engine::{Engine, EngineState, EngineTransitionError};
pub use environment::EnvSnapshot;
pub use error::{ErrorKind, ProvisionError, Result};
pub use plan::Plan;
pub use process_guard::{ChildRegistry, CommandProcessGroup};
pub use report::{Outcome, RunReport};
pub use step::{FailurePolicy, Precondition, Step, StepContext, StepResult, StepStatus};
pub use unit_file::{RestartPolicy, UnitDefinition};
