//! Provisioning plan: the ordered list of steps for one run

use std::collections::HashSet;
use std::fmt;

use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result};
use crate::step::Step;
use crate::steps::{
    ActivateManagedService, CheckEnvFile, EnsureRuntimePresent, InstallPackageSet,
    StartManagedService, WriteManagedServiceDefinition,
};

/// Steps in execution order. Ids are unique; there is no dependency graph.
pub struct Plan {
    steps: Vec<Box<dyn Step>>,
}

impl Plan {
    /// Build a plan, rejecting duplicate or empty step ids
    pub fn new(steps: Vec<Box<dyn Step>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for step in &steps {
            let id = step.id();
            if id.trim().is_empty() {
                return Err(ProvisionError::validation("step id must not be empty"));
            }
            if !seen.insert(id.to_string()) {
                return Err(ProvisionError::validation(format!(
                    "duplicate step id '{}'",
                    id
                )));
            }
        }
        Ok(Self { steps })
    }

    /// Standard plan: runtime, packages, env file, unit file, enable, start.
    /// Sections missing from the configuration contribute no steps.
    pub fn from_config(config: &ProvisionConfig) -> Result<Self> {
        let mut steps: Vec<Box<dyn Step>> = vec![Box::new(EnsureRuntimePresent::new(
            config.runtime.clone(),
        ))];
        if let Some(packages) = &config.packages {
            steps.push(Box::new(InstallPackageSet::new(packages.clone())));
        }
        if let Some(env_file) = &config.env_file {
            steps.push(Box::new(CheckEnvFile::new(env_file.clone())));
        }
        if let Some(service) = &config.service {
            steps.push(Box::new(WriteManagedServiceDefinition::new(service)));
            steps.push(Box::new(ActivateManagedService::new(service)));
            steps.push(Box::new(StartManagedService::new(service)));
        }
        Self::new(steps)
    }

    pub fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id()).collect()
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan").field("steps", &self.ids()).finish()
    }
}

/// Plan listing for `botstrap plan`: one line per step with its policy,
/// timeout and rollback hint.
pub fn describe(plan: &Plan) -> String {
    let mut out = String::new();
    for (index, step) in plan.steps().iter().enumerate() {
        out.push_str(&format!(
            "{:>2}. {:<18} {}\n    on failure: {}, timeout: {}s\n",
            index + 1,
            step.id(),
            step.description(),
            step.on_failure(),
            step.timeout().as_secs()
        ));
        if let Some(rollback) = step.rollback_hint() {
            out.push_str(&format!("    undo: {}\n", rollback));
        }
    }
    out
}
