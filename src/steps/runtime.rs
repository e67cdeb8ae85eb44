//! Ensure an interpreter runtime (Python) is installed.
//!
//! Detection is a version probe. Installation tries the configured primary
//! method (a package manager) and, if that is unavailable or fails, downloads
//! the vendor installer once and runs it with its silent-install flags.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::command_runner::CommandSpec;
use crate::config::{CommandLine, FallbackInstaller, RuntimeConfig};
use crate::error::{ErrorKind, ProvisionError, Result};
use crate::step::{FailurePolicy, Precondition, Step, StepContext, StepResult};

pub const STEP_ID: &str = "ensure-runtime";

#[derive(Debug, Clone)]
pub struct EnsureRuntimePresent {
    config: RuntimeConfig,
    download_dir: PathBuf,
}

impl EnsureRuntimePresent {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            download_dir: std::env::temp_dir(),
        }
    }

    /// Directory the fallback installer is downloaded into
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    fn spec(&self, ctx: &StepContext<'_>, line: &CommandLine) -> CommandSpec {
        ctx.command(&line.program, line.args.iter().cloned())
    }

    fn probe(&self, ctx: &StepContext<'_>) -> Result<String> {
        let out = ctx.runner.run(&self.spec(ctx, &self.config.probe))?;
        Ok(out.summary().to_string())
    }

    /// Probe again with a freshly captured PATH, as an installer has
    /// probably just changed it.
    fn verify(&self, ctx: &StepContext<'_>, method: &str) -> StepResult {
        let env = ctx.env.refreshed();
        let fresh = StepContext {
            runner: ctx.runner,
            env: &env,
            timeout: ctx.timeout,
            dry_run: ctx.dry_run,
        };
        match self.probe(&fresh) {
            Ok(version) => {
                StepResult::succeeded(STEP_ID, format!("installed via {}: {}", method, version))
            }
            Err(e) => StepResult::failed(
                STEP_ID,
                format!(
                    "{} finished but `{}` still fails: {}",
                    method, self.config.probe.program, e
                ),
            ),
        }
    }

    fn run_fallback(
        &self,
        ctx: &StepContext<'_>,
        fallback: &FallbackInstaller,
    ) -> Result<()> {
        let dest = self.download_dir.join(&fallback.file_name);
        let download = ctx.command(
            "curl",
            [
                "--fail".to_string(),
                "--silent".to_string(),
                "--show-error".to_string(),
                "--location".to_string(),
                "--output".to_string(),
                dest.display().to_string(),
                fallback.url.clone(),
            ],
        );
        info!(url = %fallback.url, dest = %dest.display(), "downloading runtime installer");
        ctx.runner.run(&download).map_err(|e| match e {
            ProvisionError::CommandFailed { stderr, .. } => ProvisionError::network(format!(
                "download of {} failed: {}",
                fallback.url,
                stderr.trim()
            )),
            other => other,
        })?;

        if !ctx.dry_run {
            make_executable(&dest)?;
        }

        let install = ctx.command(&dest.display().to_string(), fallback.args.iter().cloned());
        ctx.runner.run(&install)?;
        Ok(())
    }
}

#[cfg(unix)]
fn make_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if !path.exists() {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| ProvisionError::from_io(e, &path.display().to_string()))
}

#[cfg(not(unix))]
fn make_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

impl Step for EnsureRuntimePresent {
    fn id(&self) -> &str {
        STEP_ID
    }

    fn description(&self) -> String {
        format!("Ensure `{}` is available", self.config.probe)
    }

    fn check(&self, ctx: &StepContext<'_>) -> Precondition {
        match self.probe(ctx) {
            Ok(_) => Precondition::Satisfied,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::CommandFailed) => {
                Precondition::Unsatisfied
            }
            Err(e) => Precondition::Unknown(e.to_string()),
        }
    }

    fn apply(&self, ctx: &StepContext<'_>) -> StepResult {
        // the version check below would go through the dry-run runner and always pass
        if ctx.dry_run {
            return StepResult::succeeded(
                STEP_ID,
                format!("[dry-run] would run `{}`", self.config.primary_install),
            );
        }
        if let Ok(version) = self.probe(ctx) {
            return StepResult::skipped(STEP_ID, format!("already present: {}", version));
        }

        let primary = self.spec(ctx, &self.config.primary_install);
        let primary_err = match ctx.runner.run(&primary) {
            Ok(_) => return self.verify(ctx, &self.config.primary_install.program),
            Err(e) => e,
        };
        if !matches!(primary_err.kind(), ErrorKind::NotFound | ErrorKind::CommandFailed) {
            return StepResult::from_error(STEP_ID, &primary_err);
        }

        let Some(fallback) = &self.config.fallback else {
            return StepResult::failed(
                STEP_ID,
                format!("primary install failed: {}; no fallback configured", primary_err),
            );
        };

        warn!(error = %primary_err, "primary runtime install failed, trying installer download");
        match self.run_fallback(ctx, fallback) {
            Ok(()) => self.verify(ctx, &fallback.file_name),
            Err(fallback_err) => {
                let mut result = StepResult::from_error(STEP_ID, &fallback_err);
                result.detail = format!(
                    "primary install failed: {}; fallback installer failed: {}",
                    primary_err, fallback_err
                );
                result
            }
        }
    }

    fn on_failure(&self) -> FailurePolicy {
        self.config.on_failure
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    fn manual_hint(&self) -> Option<String> {
        Some(format!(
            "Install the runtime manually from {} (enable \"Add to PATH\"), then re-run botstrap",
            self.config.manual_url
        ))
    }

    fn needs_fresh_env(&self) -> bool {
        true
    }
}
