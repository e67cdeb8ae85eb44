//! Verify the bot's `.env` file is present and filled in

use std::path::Path;

use crate::config::EnvFileConfig;
use crate::error::{ProvisionError, Result};
use crate::step::{FailurePolicy, Precondition, Step, StepContext, StepResult};

pub const STEP_ID: &str = "check-env-file";

#[derive(Debug, Clone)]
pub struct CheckEnvFile {
    config: EnvFileConfig,
}

impl CheckEnvFile {
    pub fn new(config: EnvFileConfig) -> Self {
        Self { config }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Keys whose value is empty or still contains a placeholder
    pub fn unfilled_keys(&self, contents: &str) -> Vec<String> {
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .filter(|(_, value)| {
                let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
                value.is_empty()
                    || self
                        .config
                        .placeholders
                        .iter()
                        .any(|p| value.contains(p.as_str()))
            })
            .map(|(key, _)| key.trim().trim_start_matches("export ").trim().to_string())
            .collect()
    }

    fn read(&self) -> Result<String> {
        std::fs::read_to_string(&self.config.path)
            .map_err(|e| ProvisionError::from_io(e, &self.config.path.display().to_string()))
    }

    fn create_from_template(&self, template: &Path) -> Result<()> {
        if let Some(parent) = self.config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ProvisionError::from_io(e, &parent.display().to_string()))?;
            }
        }
        std::fs::copy(template, &self.config.path)
            .map_err(|e| ProvisionError::from_io(e, &template.display().to_string()))?;
        Ok(())
    }

    fn fill_in_hint(&self, keys: &[String]) -> String {
        format!(
            "Open {} and fill in: {}; then re-run botstrap",
            self.config.path.display(),
            keys.join(", ")
        )
    }
}

impl Step for CheckEnvFile {
    fn id(&self) -> &str {
        STEP_ID
    }

    fn description(&self) -> String {
        format!("Check {} is filled in", self.config.path.display())
    }

    fn check(&self, _ctx: &StepContext<'_>) -> Precondition {
        match self.read() {
            Ok(contents) if self.unfilled_keys(&contents).is_empty() => Precondition::Satisfied,
            Ok(_) => Precondition::Unsatisfied,
            Err(ProvisionError::NotFound(_)) => Precondition::Unsatisfied,
            Err(e) => Precondition::Unknown(e.to_string()),
        }
    }

    fn apply(&self, ctx: &StepContext<'_>) -> StepResult {
        let mut created = false;
        if !self.config.path.exists() {
            let Some(template) = &self.config.template else {
                return StepResult::failed(
                    STEP_ID,
                    format!(
                        "{} does not exist and no template is configured",
                        self.config.path.display()
                    ),
                );
            };
            if ctx.dry_run {
                return StepResult::succeeded(
                    STEP_ID,
                    format!(
                        "[dry-run] would copy {} to {}",
                        template.display(),
                        self.config.path.display()
                    ),
                );
            }
            if let Err(e) = self.create_from_template(template) {
                return StepResult::from_error(STEP_ID, &e);
            }
            created = true;
        }

        let contents = match self.read() {
            Ok(contents) => contents,
            Err(e) => return StepResult::from_error(STEP_ID, &e),
        };
        let unfilled = self.unfilled_keys(&contents);
        if unfilled.is_empty() {
            return if created {
                StepResult::succeeded(STEP_ID, "created from template")
            } else {
                StepResult::skipped(STEP_ID, "all values filled in")
            };
        }

        let mut result =
            StepResult::failed(STEP_ID, format!("unfilled values: {}", unfilled.join(", ")));
        result.hint = Some(self.fill_in_hint(&unfilled));
        result
    }

    fn on_failure(&self) -> FailurePolicy {
        self.config.on_failure
    }

    fn manual_hint(&self) -> Option<String> {
        Some(format!(
            "Create {} with the bot's tokens, then re-run botstrap",
            self.config.path.display()
        ))
    }
}
