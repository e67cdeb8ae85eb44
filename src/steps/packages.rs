//! Install the bot's Python dependencies with pip

use std::collections::HashMap;
use std::time::Duration;

use crate::config::PackageSetConfig;
use crate::error::ErrorKind;
use crate::step::{FailurePolicy, Precondition, Step, StepContext, StepResult};

pub const STEP_ID: &str = "install-packages";

/// One pip requirement: a package name and an optional pinned version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub version: Option<String>,
}

impl Requirement {
    /// pip requirement specifier (`name` or `name==version`)
    pub fn specifier(&self) -> String {
        match &self.version {
            Some(version) => format!("{}=={}", self.name, version),
            None => self.name.clone(),
        }
    }

    fn is_met_by(&self, installed: &HashMap<String, String>) -> bool {
        match installed.get(&normalize_name(&self.name)) {
            Some(found) => self.version.as_ref().is_none_or(|want| want == found),
            None => false,
        }
    }
}

/// pip treats `-`, `_` and `.` as equivalent and ignores case
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .replace(['_', '.'], "-")
}

/// Parse `pip show` output into normalized name -> version
pub fn parse_pip_show(stdout: &str) -> HashMap<String, String> {
    let mut installed = HashMap::new();
    let mut name: Option<String> = None;
    for line in stdout.lines() {
        if let Some(value) = line.strip_prefix("Name:") {
            name = Some(normalize_name(value));
        } else if let Some(value) = line.strip_prefix("Version:") {
            if let Some(n) = name.take() {
                installed.insert(n, value.trim().to_string());
            }
        }
    }
    installed
}

#[derive(Debug, Clone)]
pub struct InstallPackageSet {
    python: String,
    requirements: Vec<Requirement>,
    extra_args: Vec<String>,
    on_failure: FailurePolicy,
    timeout: Duration,
}

impl InstallPackageSet {
    pub fn new(config: PackageSetConfig) -> Self {
        let requirements = config
            .packages
            .into_iter()
            .map(|(name, version)| Requirement { name, version })
            .collect();
        Self {
            python: config.python,
            requirements,
            extra_args: config.extra_args,
            on_failure: config.on_failure,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    fn pip_args(&self, subcommand: &str, rest: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut args = vec!["-m".to_string(), "pip".to_string(), subcommand.to_string()];
        args.extend(rest);
        args
    }
}

impl Step for InstallPackageSet {
    fn id(&self) -> &str {
        STEP_ID
    }

    fn description(&self) -> String {
        let specs: Vec<String> = self.requirements.iter().map(Requirement::specifier).collect();
        format!("pip install {}", specs.join(" "))
    }

    fn check(&self, ctx: &StepContext<'_>) -> Precondition {
        if self.requirements.is_empty() {
            return Precondition::Satisfied;
        }
        let names = self.requirements.iter().map(|r| r.name.clone());
        let spec = ctx.command(&self.python, self.pip_args("show", names));
        match ctx.runner.run(&spec) {
            Ok(out) => {
                let installed = parse_pip_show(&out.stdout);
                if self.requirements.iter().all(|r| r.is_met_by(&installed)) {
                    Precondition::Satisfied
                } else {
                    Precondition::Unsatisfied
                }
            }
            // pip show exits 1 when any package is missing
            Err(e) if e.kind() == ErrorKind::CommandFailed => Precondition::Unsatisfied,
            Err(e) => Precondition::Unknown(e.to_string()),
        }
    }

    fn apply(&self, ctx: &StepContext<'_>) -> StepResult {
        if self.requirements.is_empty() {
            return StepResult::skipped(STEP_ID, "no packages configured");
        }
        let specs = self.requirements.iter().map(Requirement::specifier);
        let args = self.pip_args("install", specs.chain(self.extra_args.iter().cloned()));
        match ctx.runner.run(&ctx.command(&self.python, args)) {
            Ok(out) => StepResult::succeeded(STEP_ID, out.summary()),
            Err(e) => StepResult::from_error(STEP_ID, &e),
        }
    }

    fn on_failure(&self) -> FailurePolicy {
        self.on_failure
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn rollback_hint(&self) -> Option<String> {
        let names: Vec<&str> = self.requirements.iter().map(|r| r.name.as_str()).collect();
        Some(format!("{} -m pip uninstall -y {}", self.python, names.join(" ")))
    }

    fn manual_hint(&self) -> Option<String> {
        Some(format!(
            "Run `{} -m pip install {}` by hand and check its output",
            self.python,
            self.requirements
                .iter()
                .map(Requirement::specifier)
                .collect::<Vec<_>>()
                .join(" ")
        ))
    }

    fn needs_fresh_env(&self) -> bool {
        true
    }
}
