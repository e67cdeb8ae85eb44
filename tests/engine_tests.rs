//! Tests for plan execution
//!
//! These tests verify:
//! - Failure policies (abort, continue, retry) and the resulting outcome
//! - Precondition short-circuiting
//! - The standard service plan against a scripted host
//! - Runtime fallback behaviour as seen in the final report

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;

use botstrap::command_runner::{Reply, ScriptedRunner};
use botstrap::config::Profile;
use botstrap::plan::Plan;
use botstrap::reporter;
use botstrap::steps::{
    ActivateManagedService, EnsureRuntimePresent, InstallPackageSet, StartManagedService,
    WriteManagedServiceDefinition,
};
use botstrap::{
    Engine, EngineState, EnvSnapshot, FailurePolicy, Outcome, Precondition, RunReport, Step,
    StepContext, StepResult, StepStatus,
};

// =============================================================================
// Scripted step
// =============================================================================

/// Step whose check answer and apply results are fixed up front
struct FakeStep {
    id: &'static str,
    check: Precondition,
    results: RefCell<VecDeque<StepStatus>>,
    policy: FailurePolicy,
    applied: Rc<Cell<u32>>,
    hint: Option<&'static str>,
}

impl FakeStep {
    fn new(id: &'static str, check: Precondition, results: &[StepStatus]) -> Self {
        Self {
            id,
            check,
            results: RefCell::new(results.iter().copied().collect()),
            policy: FailurePolicy::Abort,
            applied: Rc::new(Cell::new(0)),
            hint: None,
        }
    }

    fn ok(id: &'static str) -> Self {
        Self::new(id, Precondition::Unsatisfied, &[StepStatus::Succeeded])
    }

    fn failing(id: &'static str) -> Self {
        Self::new(id, Precondition::Unsatisfied, &[StepStatus::Failed])
    }

    fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn with_hint(mut self, hint: &'static str) -> Self {
        self.hint = Some(hint);
        self
    }

    /// Shared count of `apply()` calls, readable after the plan owns the step
    fn applied(&self) -> Rc<Cell<u32>> {
        Rc::clone(&self.applied)
    }
}

impl Step for FakeStep {
    fn id(&self) -> &str {
        self.id
    }

    fn description(&self) -> String {
        format!("fake {}", self.id)
    }

    fn check(&self, _ctx: &StepContext<'_>) -> Precondition {
        self.check.clone()
    }

    fn apply(&self, _ctx: &StepContext<'_>) -> StepResult {
        self.applied.set(self.applied.get() + 1);
        let mut results = self.results.borrow_mut();
        let status = if results.len() > 1 {
            results.pop_front()
        } else {
            results.front().copied()
        };
        match status.unwrap_or(StepStatus::Succeeded) {
            StepStatus::Failed => StepResult::failed(self.id, "boom"),
            StepStatus::TimedOut => {
                let mut result = StepResult::failed(self.id, "timed out");
                result.status = StepStatus::TimedOut;
                result
            }
            StepStatus::Skipped => StepResult::skipped(self.id, "no-op"),
            StepStatus::Succeeded => StepResult::succeeded(self.id, "done"),
        }
    }

    fn on_failure(&self) -> FailurePolicy {
        self.policy
    }

    fn manual_hint(&self) -> Option<String> {
        self.hint.map(str::to_string)
    }
}

fn plan_of(steps: Vec<FakeStep>) -> Plan {
    let boxed: Vec<Box<dyn Step>> = steps
        .into_iter()
        .map(|s| Box::new(s) as Box<dyn Step>)
        .collect();
    Plan::new(boxed).unwrap()
}

fn run(plan: &Plan, runner: &ScriptedRunner) -> RunReport {
    Engine::new(runner, EnvSnapshot::capture(&[]))
        .run(plan)
        .unwrap()
}

// =============================================================================
// Policy and outcome tests
// =============================================================================

#[test]
fn test_all_steps_succeed_is_complete() {
    let steps = ["a", "b", "c"].into_iter().map(FakeStep::ok).collect();
    let report = run(&plan_of(steps), &ScriptedRunner::new());

    assert_eq!(report.outcome, Outcome::Complete);
    assert_eq!(report.results.len(), 3);
    assert!(report.results.iter().all(|r| r.attempts == 1));
}

#[test]
fn test_abort_at_step_three_of_five() {
    let four = FakeStep::ok("four");
    let five = FakeStep::ok("five");
    let (four_applied, five_applied) = (four.applied(), five.applied());
    let plan = plan_of(vec![
        FakeStep::ok("one"),
        FakeStep::ok("two"),
        FakeStep::failing("three"),
        four,
        five,
    ]);
    let runner = ScriptedRunner::new();
    let mut engine = Engine::new(&runner, EnvSnapshot::capture(&[]));
    let report = engine.run(&plan).unwrap();

    assert_eq!(report.outcome, Outcome::Aborted);
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.aborted_at.as_deref(), Some("three"));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(engine.state(), EngineState::Aborted);
    assert_eq!(four_applied.get(), 0);
    assert_eq!(five_applied.get(), 0);
}

#[test]
fn test_continue_policy_gives_partial() {
    let plan = plan_of(vec![
        FakeStep::ok("one"),
        FakeStep::failing("two").with_policy(FailurePolicy::Continue),
        FakeStep::ok("three"),
    ]);
    let report = run(&plan, &ScriptedRunner::new());

    assert_eq!(report.outcome, Outcome::Partial);
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.results[1].status, StepStatus::Failed);
    assert_eq!(report.exit_code(), 2);
}

#[test]
fn test_timed_out_step_aborts() {
    let slow = FakeStep::new("slow", Precondition::Unsatisfied, &[StepStatus::TimedOut]);
    let after = FakeStep::ok("after");
    let after_applied = after.applied();
    let report = run(&plan_of(vec![slow, after]), &ScriptedRunner::new());

    assert_eq!(report.outcome, Outcome::Aborted);
    assert_eq!(report.results[0].status, StepStatus::TimedOut);
    assert_eq!(after_applied.get(), 0);
}

#[test]
fn test_retry_until_success() {
    let flaky = FakeStep::new(
        "flaky",
        Precondition::Unsatisfied,
        &[StepStatus::Failed, StepStatus::Failed, StepStatus::Succeeded],
    )
    .with_policy(FailurePolicy::Retry(2));
    let applied = flaky.applied();
    let report = run(&plan_of(vec![flaky]), &ScriptedRunner::new());

    assert_eq!(report.outcome, Outcome::Complete);
    assert_eq!(report.results[0].attempts, 3);
    assert_eq!(applied.get(), 3);
}

#[test]
fn test_retry_exhausted_aborts() {
    let broken = FakeStep::failing("broken").with_policy(FailurePolicy::Retry(1));
    let applied = broken.applied();
    let report = run(
        &plan_of(vec![broken, FakeStep::ok("after")]),
        &ScriptedRunner::new(),
    );

    assert_eq!(report.outcome, Outcome::Aborted);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].attempts, 2);
    assert_eq!(applied.get(), 2);
}

#[test]
fn test_satisfied_precondition_short_circuits() {
    let done = FakeStep::new("done", Precondition::Satisfied, &[StepStatus::Failed]);
    let applied = done.applied();
    let report = run(&plan_of(vec![done]), &ScriptedRunner::new());

    assert_eq!(applied.get(), 0);
    assert_eq!(report.results[0].status, StepStatus::Skipped);
    assert_eq!(report.results[0].attempts, 0);
}

#[test]
fn test_unknown_precondition_is_applied() {
    let unclear = FakeStep::new(
        "unclear",
        Precondition::Unknown("probe crashed".into()),
        &[StepStatus::Succeeded],
    );
    let applied = unclear.applied();
    let report = run(&plan_of(vec![unclear]), &ScriptedRunner::new());

    assert_eq!(applied.get(), 1);
    assert_eq!(report.results[0].status, StepStatus::Succeeded);
}

#[test]
fn test_manual_hint_attached_on_failure_only() {
    let plan = plan_of(vec![
        FakeStep::failing("bad")
            .with_policy(FailurePolicy::Continue)
            .with_hint("do it by hand"),
        FakeStep::ok("good").with_hint("never shown"),
    ]);
    let report = run(&plan, &ScriptedRunner::new());

    assert_eq!(report.results[0].hint.as_deref(), Some("do it by hand"));
    assert_eq!(report.results[1].hint, None);
}

// =============================================================================
// Standard plan against a scripted host
// =============================================================================

fn service_config(dir: &Path) -> botstrap::config::ServiceConfig {
    let mut service = Profile::LinuxService.config().service.unwrap();
    service.unit_path = Some(dir.join("telegram-bot.service"));
    service
}

#[test]
fn test_service_plan_complete_with_runtime_present() {
    let dir = tempfile::tempdir().unwrap();
    let config = Profile::LinuxService.config();
    let service = service_config(dir.path());
    let plan = Plan::new(vec![
        Box::new(EnsureRuntimePresent::new(config.runtime.clone())),
        Box::new(InstallPackageSet::new(config.packages.clone().unwrap())),
        Box::new(WriteManagedServiceDefinition::new(&service)),
        Box::new(ActivateManagedService::new(&service)),
        Box::new(StartManagedService::new(&service)),
    ])
    .unwrap();

    let runner = ScriptedRunner::new()
        .reply("python3", Reply::Ok("Python 3.11.2\n".into()))
        // is-enabled, daemon-reload, enable, is-active, start
        .reply("systemctl", Reply::Exit(1, "disabled".into()))
        .reply("systemctl", Reply::Ok(String::new()))
        .reply("systemctl", Reply::Ok(String::new()))
        .reply("systemctl", Reply::Exit(3, "inactive".into()))
        .reply("systemctl", Reply::Ok(String::new()));

    let report = run(&plan, &runner);

    assert_eq!(report.outcome, Outcome::Complete, "{}", reporter::render(&report));
    assert_eq!(report.results.len(), 5);
    assert_eq!(report.results[0].status, StepStatus::Skipped);
    assert!(report.results[1..].iter().all(|r| r.status == StepStatus::Succeeded));
    assert!(dir.path().join("telegram-bot.service").exists());
    assert_eq!(runner.count("systemctl", Some("daemon-reload")), 1);
    assert_eq!(runner.count("systemctl", Some("start")), 1);
}

#[test]
fn test_runtime_present_never_installs() {
    let config = Profile::WindowsRuntime.config();
    let step = EnsureRuntimePresent::new(config.runtime);
    let plan = Plan::new(vec![Box::new(step)]).unwrap();
    let runner = ScriptedRunner::new().reply("python", Reply::Ok("Python 3.12.0".into()));

    let report = run(&plan, &runner);

    assert_eq!(report.results[0].status, StepStatus::Skipped);
    assert_eq!(runner.count("winget", None), 0);
    assert_eq!(runner.count("curl", None), 0);
}

#[test]
fn test_runtime_total_failure_reports_manual_url() {
    let dir = tempfile::tempdir().unwrap();
    let config = Profile::WindowsRuntime.config();
    let runtime =
        EnsureRuntimePresent::new(config.runtime.clone()).with_download_dir(dir.path());
    let packages = InstallPackageSet::new(config.packages.clone().unwrap());
    let plan = Plan::new(vec![Box::new(runtime), Box::new(packages)]).unwrap();

    // Every program, including the downloaded installer, is missing
    let runner = ScriptedRunner::new().with_default(Reply::NotFound);
    let report = run(&plan, &runner);

    assert_eq!(report.outcome, Outcome::Aborted);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].status, StepStatus::Failed);
    assert_eq!(runner.count("winget", None), 1);
    assert_eq!(runner.count("curl", None), 1);

    let text = reporter::render(&report);
    assert!(text.contains("https://www.python.org/downloads/"), "{text}");
    assert!(text.contains("Aborted at ensure-runtime"));
}

#[test]
fn test_fallback_attempted_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = Profile::WindowsRuntime.config();
    let installer = dir.path().join("python-3.12.0-amd64.exe");
    assert_eq!(config.runtime.on_failure, FailurePolicy::Abort);
    let runtime = EnsureRuntimePresent::new(config.runtime.clone()).with_download_dir(dir.path());
    let plan = Plan::new(vec![Box::new(runtime)]).unwrap();

    let runner = ScriptedRunner::new()
        .reply("python", Reply::NotFound)
        .reply("winget", Reply::NotFound)
        .reply(&installer.display().to_string(), Reply::Exit(1603, "fatal".into()));
    let report = run(&plan, &runner);

    assert_eq!(report.outcome, Outcome::Aborted);
    assert_eq!(report.results[0].attempts, 1);
    assert_eq!(runner.count("curl", None), 1);
    assert_eq!(runner.count(&installer.display().to_string(), None), 1);
}

#[test]
fn test_dry_run_applies_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_config(dir.path());
    let runtime = EnsureRuntimePresent::new(Profile::WindowsRuntime.config().runtime)
        .with_download_dir(dir.path());
    let plan = Plan::new(vec![
        Box::new(runtime),
        Box::new(WriteManagedServiceDefinition::new(&service)),
        Box::new(ActivateManagedService::new(&service)),
        Box::new(StartManagedService::new(&service)),
    ])
    .unwrap();

    let runner = ScriptedRunner::new()
        .reply("python", Reply::NotFound)
        .reply("systemctl", Reply::Exit(1, String::new()));
    let report = Engine::new(&runner, EnvSnapshot::capture(&[]))
        .with_dry_run(true)
        .run(&plan)
        .unwrap();

    assert_eq!(report.outcome, Outcome::Complete);
    let runtime = &report.results[0];
    assert_eq!(runtime.step_id, "ensure-runtime");
    assert_ne!(runtime.status, StepStatus::Skipped);
    assert!(runtime.detail.contains("winget install"));
    assert_eq!(runner.count("winget", None), 0);
    assert_eq!(runner.count("curl", None), 0);
    assert!(!dir.path().join("telegram-bot.service").exists());
    assert!(runner.count("systemctl", Some("is-enabled")) > 0);
    assert_eq!(runner.count("systemctl", Some("enable")), 0);
    assert_eq!(runner.count("systemctl", Some("start")), 0);
}

#[test]
fn test_second_run_of_converged_host_skips_everything() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_config(dir.path());
    let write = WriteManagedServiceDefinition::new(&service);
    let plan = Plan::new(vec![Box::new(write)]).unwrap();
    let runner = ScriptedRunner::new();

    let first = run(&plan, &runner);
    let second = run(&plan, &runner);

    assert_eq!(first.results[0].status, StepStatus::Succeeded);
    assert_eq!(second.results[0].status, StepStatus::Skipped);
    assert_eq!(second.outcome, Outcome::Complete);
}
