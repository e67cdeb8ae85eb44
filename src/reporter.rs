//! Turn a [`RunReport`] into text for the user or JSON for tooling.
//!
//! Both renderers are pure: the binary decides where the output goes.

use std::fmt::Write as _;

use crate::error::Result;
use crate::report::{Outcome, RunReport};
use crate::step::StepStatus;

fn status_marker(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Skipped => "-",
        StepStatus::Succeeded => "✓",
        StepStatus::Failed => "✗",
        StepStatus::TimedOut => "⏱",
    }
}

fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

/// Human-readable report: one line per step, details and hints for
/// failures, and a closing summary line.
pub fn render(report: &RunReport) -> String {
    let mut out = String::new();
    for result in &report.results {
        let _ = write!(
            out,
            "{} {:<18} {:<10} {:>7}",
            status_marker(result.status),
            result.step_id,
            result.status.to_string(),
            format_duration(result.duration_ms)
        );
        if result.attempts > 1 {
            let _ = write!(out, "  ({} attempts)", result.attempts);
        }
        out.push('\n');

        if result.is_ok() {
            continue;
        }
        for line in result.detail.lines().filter(|l| !l.trim().is_empty()) {
            let _ = writeln!(out, "    {}", line);
        }
        if let Some(hint) = &result.hint {
            let _ = writeln!(out, "    hint: {}", hint);
        }
    }

    let total = format_duration(report.total_duration_ms());
    match report.outcome {
        Outcome::Complete => {
            let _ = writeln!(out, "\nComplete: {} steps in {}", report.results.len(), total);
        }
        Outcome::Partial => {
            let failed = report.failures().count();
            let _ = writeln!(
                out,
                "\nPartial: {} of {} steps failed ({})",
                failed,
                report.results.len(),
                total
            );
        }
        Outcome::Aborted => {
            let at = report.aborted_at.as_deref().unwrap_or("unknown step");
            let _ = writeln!(out, "\nAborted at {}: later steps were not run ({})", at, total);
        }
    }
    out
}

/// Pretty-printed JSON form of the report
pub fn render_json(report: &RunReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepResult;

    fn failed_with_hint() -> StepResult {
        let mut result =
            StepResult::failed("ensure-runtime", "winget: not found\ninstaller: not found");
        result.hint =
            Some("Install the runtime manually from https://www.python.org/downloads/".into());
        result.attempts = 1;
        result
    }

    #[test]
    fn test_complete_summary() {
        let mut ok = StepResult::succeeded("install-packages", "installed");
        ok.duration_ms = 1500;
        let report = RunReport::new(vec![StepResult::skipped("ensure-runtime", ""), ok], None);
        let text = render(&report);
        assert!(text.contains("- ensure-runtime"));
        assert!(text.contains("✓ install-packages"));
        assert!(text.contains("1.5s"));
        assert!(text.contains("Complete: 2 steps"));
    }

    #[test]
    fn test_failure_shows_detail_and_hint() {
        let report = RunReport::new(vec![failed_with_hint()], Some("ensure-runtime".into()));
        let text = render(&report);
        assert!(text.contains("    winget: not found"));
        assert!(text.contains("    installer: not found"));
        assert!(text.contains(
            "hint: Install the runtime manually from https://www.python.org/downloads/"
        ));
        assert!(text.contains("Aborted at ensure-runtime"));
    }

    #[test]
    fn test_partial_summary_and_retries() {
        let mut failed = StepResult::failed("check-env-file", "unfilled values: TOKEN");
        failed.attempts = 3;
        let report = RunReport::new(
            vec![StepResult::succeeded("ensure-runtime", ""), failed],
            None,
        );
        let text = render(&report);
        assert!(text.contains("(3 attempts)"));
        assert!(text.contains("Partial: 1 of 2 steps failed"));
    }

    #[test]
    fn test_success_detail_is_not_repeated() {
        let report = RunReport::new(
            vec![StepResult::succeeded("start-service", "noisy output")],
            None,
        );
        assert!(!render(&report).contains("noisy output"));
    }

    #[test]
    fn test_render_json() {
        let report = RunReport::new(vec![failed_with_hint()], Some("ensure-runtime".into()));
        let json = render_json(&report).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["outcome"], "aborted");
        assert!(value["results"][0]["hint"]
            .as_str()
            .unwrap()
            .contains("python.org"));
    }
}
