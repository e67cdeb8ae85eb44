//! Managed service steps: write the unit, enable it, start it.
//!
//! Enabling and starting are separate steps so that "enabled but failed to
//! start" shows up as exactly that in the report.

use std::path::PathBuf;
use std::time::Duration;

use crate::command_runner::CommandOutput;
use crate::config::ServiceConfig;
use crate::error::{ErrorKind, ProvisionError, Result};
use crate::step::{FailurePolicy, Precondition, Step, StepContext, StepResult};
use crate::unit_file::UnitDefinition;

pub const WRITE_UNIT_ID: &str = "write-unit";
pub const ACTIVATE_ID: &str = "activate-service";
pub const START_ID: &str = "start-service";

/// Map a `systemctl` query result: success means the state holds, a nonzero
/// exit means it does not, anything else means we could not tell.
fn query_state(result: Result<CommandOutput>) -> Precondition {
    match result {
        Ok(_) => Precondition::Satisfied,
        Err(e) if e.kind() == ErrorKind::CommandFailed => Precondition::Unsatisfied,
        Err(e) => Precondition::Unknown(e.to_string()),
    }
}

/// Write the unit file to its well-known path
#[derive(Debug, Clone)]
pub struct WriteManagedServiceDefinition {
    unit: UnitDefinition,
    path: PathBuf,
    on_failure: FailurePolicy,
}

impl WriteManagedServiceDefinition {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            path: config.unit_path(),
            unit: config.unit.clone(),
            on_failure: config.on_failure,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn current(&self) -> Result<String> {
        std::fs::read_to_string(&self.path)
            .map_err(|e| ProvisionError::from_io(e, &self.path.display().to_string()))
    }

    /// Write via a sibling temp file and rename, so a crash never leaves a
    /// half-written unit behind.
    fn write(&self, contents: &str) -> Result<()> {
        let display = self.path.display().to_string();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProvisionError::from_io(e, &parent.display().to_string()))?;
        }
        let tmp = self.path.with_extension("service.tmp");
        std::fs::write(&tmp, contents).map_err(|e| ProvisionError::from_io(e, &display))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            ProvisionError::from_io(e, &display)
        })
    }
}

impl Step for WriteManagedServiceDefinition {
    fn id(&self) -> &str {
        WRITE_UNIT_ID
    }

    fn description(&self) -> String {
        format!("Write {}", self.path.display())
    }

    fn check(&self, _ctx: &StepContext<'_>) -> Precondition {
        match self.current() {
            Ok(existing) if existing == self.unit.render() => Precondition::Satisfied,
            Ok(_) | Err(ProvisionError::NotFound(_)) => Precondition::Unsatisfied,
            Err(e) => Precondition::Unknown(e.to_string()),
        }
    }

    fn apply(&self, ctx: &StepContext<'_>) -> StepResult {
        let rendered = self.unit.render();
        if matches!(self.current(), Ok(existing) if existing == rendered) {
            return StepResult::skipped(WRITE_UNIT_ID, "unit file already up to date");
        }
        if ctx.dry_run {
            return StepResult::succeeded(
                WRITE_UNIT_ID,
                format!("[dry-run] would write {}", self.path.display()),
            );
        }
        match self.write(&rendered) {
            Ok(()) => {
                StepResult::succeeded(WRITE_UNIT_ID, format!("wrote {}", self.path.display()))
            }
            Err(e) => StepResult::from_error(WRITE_UNIT_ID, &e),
        }
    }

    fn on_failure(&self) -> FailurePolicy {
        self.on_failure
    }

    fn rollback_hint(&self) -> Option<String> {
        Some(format!("rm {} && systemctl daemon-reload", self.path.display()))
    }

    fn manual_hint(&self) -> Option<String> {
        Some("Unit files under /etc/systemd/system need root: re-run with sudo".to_string())
    }
}

/// Reload systemd and enable the unit at boot
#[derive(Debug, Clone)]
pub struct ActivateManagedService {
    unit_name: String,
    systemctl: String,
    on_failure: FailurePolicy,
    timeout: Duration,
}

impl ActivateManagedService {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            unit_name: config.unit.unit_name(),
            systemctl: config.systemctl.clone(),
            on_failure: config.on_failure,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn systemctl(&self, ctx: &StepContext<'_>, args: &[&str]) -> Result<CommandOutput> {
        ctx.runner.run(&ctx.command(&self.systemctl, args.iter().copied()))
    }

    /// systemd flags units whose file changed since the last daemon-reload
    fn needs_reload(&self, ctx: &StepContext<'_>) -> Result<bool> {
        let out = self.systemctl(
            ctx,
            &["show", "--property=NeedDaemonReload", "--value", &self.unit_name],
        )?;
        Ok(out.stdout.trim() == "yes")
    }
}

impl Step for ActivateManagedService {
    fn id(&self) -> &str {
        ACTIVATE_ID
    }

    fn description(&self) -> String {
        format!("Reload systemd and enable {}", self.unit_name)
    }

    fn check(&self, ctx: &StepContext<'_>) -> Precondition {
        match query_state(self.systemctl(ctx, &["is-enabled", "--quiet", &self.unit_name])) {
            Precondition::Satisfied => match self.needs_reload(ctx) {
                Ok(false) => Precondition::Satisfied,
                Ok(true) => Precondition::Unsatisfied,
                Err(e) => Precondition::Unknown(e.to_string()),
            },
            other => other,
        }
    }

    fn apply(&self, ctx: &StepContext<'_>) -> StepResult {
        if let Err(e) = self.systemctl(ctx, &["daemon-reload"]) {
            let mut result = StepResult::from_error(ACTIVATE_ID, &e);
            result.detail = format!("daemon-reload: {}", result.detail);
            return result;
        }
        match self.systemctl(ctx, &["enable", &self.unit_name]) {
            Ok(_) => {
                StepResult::succeeded(ACTIVATE_ID, format!("{} enabled at boot", self.unit_name))
            }
            Err(e) => {
                let mut result = StepResult::from_error(ACTIVATE_ID, &e);
                result.detail = format!("enable: {}", result.detail);
                result
            }
        }
    }

    fn on_failure(&self) -> FailurePolicy {
        self.on_failure
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn rollback_hint(&self) -> Option<String> {
        Some(format!("systemctl disable {}", self.unit_name))
    }

    fn manual_hint(&self) -> Option<String> {
        Some(format!(
            "Run `systemctl daemon-reload && systemctl enable {}` as root",
            self.unit_name
        ))
    }
}

/// Start the unit now
#[derive(Debug, Clone)]
pub struct StartManagedService {
    unit_name: String,
    systemctl: String,
    on_failure: FailurePolicy,
    timeout: Duration,
}

impl StartManagedService {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            unit_name: config.unit.unit_name(),
            systemctl: config.systemctl.clone(),
            on_failure: config.on_failure,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl Step for StartManagedService {
    fn id(&self) -> &str {
        START_ID
    }

    fn description(&self) -> String {
        format!("Start {}", self.unit_name)
    }

    fn check(&self, ctx: &StepContext<'_>) -> Precondition {
        let spec = ctx.command(&self.systemctl, ["is-active", "--quiet", self.unit_name.as_str()]);
        query_state(ctx.runner.run(&spec))
    }

    fn apply(&self, ctx: &StepContext<'_>) -> StepResult {
        let spec = ctx.command(&self.systemctl, ["start", self.unit_name.as_str()]);
        match ctx.runner.run(&spec) {
            Ok(_) => StepResult::succeeded(START_ID, format!("{} started", self.unit_name)),
            Err(e) => StepResult::from_error(START_ID, &e),
        }
    }

    fn on_failure(&self) -> FailurePolicy {
        self.on_failure
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn rollback_hint(&self) -> Option<String> {
        Some(format!("systemctl stop {}", self.unit_name))
    }

    fn manual_hint(&self) -> Option<String> {
        Some(format!(
            "Inspect the service with `systemctl status {0}` and `journalctl -u {0} -n 50`",
            self.unit_name
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::{Reply, ScriptedRunner};
    use crate::config::Profile;
    use crate::environment::EnvSnapshot;
    use crate::step::StepStatus;

    fn service_config(dir: &std::path::Path) -> ServiceConfig {
        let mut config = Profile::LinuxService.config().service.unwrap();
        config.unit_path = Some(dir.join("telegram-bot.service"));
        config
    }

    fn ctx<'a>(runner: &'a ScriptedRunner, env: &'a EnvSnapshot, dry_run: bool) -> StepContext<'a> {
        StepContext {
            runner,
            env,
            timeout: Duration::from_secs(5),
            dry_run,
        }
    }

    #[test]
    fn test_write_unit_then_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        let step = WriteManagedServiceDefinition::new(&service_config(dir.path()));
        let runner = ScriptedRunner::new();
        let env = EnvSnapshot::capture(&[]);

        assert_eq!(step.check(&ctx(&runner, &env, false)), Precondition::Unsatisfied);
        assert_eq!(step.apply(&ctx(&runner, &env, false)).status, StepStatus::Succeeded);
        assert_eq!(step.check(&ctx(&runner, &env, false)), Precondition::Satisfied);
        assert_eq!(step.apply(&ctx(&runner, &env, false)).status, StepStatus::Skipped);

        let written = std::fs::read_to_string(step.path()).unwrap();
        assert!(written.contains("Restart=always"));
        assert!(!dir.path().join("telegram-bot.service.tmp").exists());
    }

    #[test]
    fn test_write_unit_overwrites_stale_content() {
        let dir = tempfile::tempdir().unwrap();
        let step = WriteManagedServiceDefinition::new(&service_config(dir.path()));
        std::fs::write(step.path(), "[Unit]\nDescription=old\n").unwrap();
        let runner = ScriptedRunner::new();
        let env = EnvSnapshot::capture(&[]);

        assert_eq!(step.check(&ctx(&runner, &env, false)), Precondition::Unsatisfied);
        assert_eq!(step.apply(&ctx(&runner, &env, false)).status, StepStatus::Succeeded);
        assert!(!std::fs::read_to_string(step.path()).unwrap().contains("Description=old"));
    }

    #[test]
    fn test_write_unit_dry_run_leaves_disk_alone() {
        let dir = tempfile::tempdir().unwrap();
        let step = WriteManagedServiceDefinition::new(&service_config(dir.path()));
        let runner = ScriptedRunner::new();
        let env = EnvSnapshot::capture(&[]);

        let result = step.apply(&ctx(&runner, &env, true));
        assert_eq!(result.status, StepStatus::Succeeded);
        assert!(result.detail.contains("dry-run"));
        assert!(!step.path().exists());
    }

    #[test]
    fn test_activate_runs_reload_then_enable() {
        let dir = tempfile::tempdir().unwrap();
        let step = ActivateManagedService::new(&service_config(dir.path()));
        let runner = ScriptedRunner::new();
        let env = EnvSnapshot::capture(&[]);

        assert_eq!(step.apply(&ctx(&runner, &env, false)).status, StepStatus::Succeeded);
        let calls: Vec<String> = runner.calls().iter().map(|c| c.args.join(" ")).collect();
        assert_eq!(calls, ["daemon-reload", "enable telegram-bot.service"]);
    }

    #[test]
    fn test_activate_enable_failure_is_labelled() {
        let dir = tempfile::tempdir().unwrap();
        let step = ActivateManagedService::new(&service_config(dir.path()));
        let runner = ScriptedRunner::new()
            .reply("systemctl", Reply::Ok(String::new()))
            .reply("systemctl", Reply::Exit(1, "Failed to enable unit".into()));
        let env = EnvSnapshot::capture(&[]);

        let result = step.apply(&ctx(&runner, &env, false));
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.detail.starts_with("enable:"));
    }

    #[test]
    fn test_activate_check_needs_reload() {
        let dir = tempfile::tempdir().unwrap();
        let step = ActivateManagedService::new(&service_config(dir.path()));
        let env = EnvSnapshot::capture(&[]);

        let runner = ScriptedRunner::new()
            .reply("systemctl", Reply::Ok(String::new()))
            .reply("systemctl", Reply::Ok("no\n".into()));
        assert_eq!(step.check(&ctx(&runner, &env, false)), Precondition::Satisfied);

        let runner = ScriptedRunner::new()
            .reply("systemctl", Reply::Ok(String::new()))
            .reply("systemctl", Reply::Ok("yes\n".into()));
        assert_eq!(step.check(&ctx(&runner, &env, false)), Precondition::Unsatisfied);

        let runner = ScriptedRunner::new().reply("systemctl", Reply::Exit(1, "disabled".into()));
        assert_eq!(step.check(&ctx(&runner, &env, false)), Precondition::Unsatisfied);

        let runner = ScriptedRunner::new().reply("systemctl", Reply::NotFound);
        assert!(matches!(
            step.check(&ctx(&runner, &env, false)),
            Precondition::Unknown(_)
        ));
    }

    #[test]
    fn test_start_check_and_apply() {
        let dir = tempfile::tempdir().unwrap();
        let step = StartManagedService::new(&service_config(dir.path()));
        let env = EnvSnapshot::capture(&[]);

        let runner = ScriptedRunner::new().reply("systemctl", Reply::Exit(3, String::new()));
        assert_eq!(step.check(&ctx(&runner, &env, false)), Precondition::Unsatisfied);

        let runner = ScriptedRunner::new();
        let result = step.apply(&ctx(&runner, &env, false));
        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(runner.calls()[0].args, ["start", "telegram-bot.service"]);
        assert!(step.apply(&ctx(&runner, &env, false)).is_ok());
    }

    #[test]
    fn test_start_timeout_maps_to_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let step = StartManagedService::new(&service_config(dir.path()));
        let runner = ScriptedRunner::new().reply("systemctl", Reply::Timeout);
        let env = EnvSnapshot::capture(&[]);
        assert_eq!(step.apply(&ctx(&runner, &env, false)).status, StepStatus::TimedOut);
    }
}
