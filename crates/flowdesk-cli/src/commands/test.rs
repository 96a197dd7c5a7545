//! `flowdesk test` - replay a workflow against a test case file.

use console::style;

use flowdesk_core::models::test_run::{StepResultStatus, TestCase, TestRun, TestRunStatus};
use flowdesk_core::state::AppState;

/// Execute the test case and print the step trace and assertion results.
/// A run that does not pass is an error, so the process exits non-zero.
pub async fn run(state: &AppState, workflow_id: &str, case_file: &str) -> Result<TestRun, String> {
    let workflow = state
        .workflow_store
        .get(workflow_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Workflow {} not found", workflow_id))?;
    let case = TestCase::from_file(case_file).map_err(|e| e.to_string())?;

    println!(
        "🧪 Running '{}' against '{}' ({} assertion(s))",
        case.name,
        workflow.name,
        case.assertions.len()
    );

    let run = state
        .test_runs
        .run(&workflow, &case)
        .await
        .map_err(|e| e.to_string())?;

    let steps = state
        .test_runs
        .steps(&run.id)
        .await
        .map_err(|e| e.to_string())?;
    println!();
    for step in &steps {
        let mark = match step.status {
            StepResultStatus::Completed => style("✓").green(),
            StepResultStatus::Failed => style("✗").red(),
            StepResultStatus::Skipped => style("-").dim(),
            StepResultStatus::Running => style("…").yellow(),
        };
        match &step.error {
            Some(error) => println!("  {} {} ({})", mark, step.step_label, error),
            None => println!("  {} {}", mark, step.step_label),
        }
    }

    if !run.results.is_empty() {
        println!();
        for result in &run.results {
            let mark = if result.passed {
                style("PASS").green()
            } else {
                style("FAIL").red()
            };
            println!("  {} {}: {}", mark, result.name, result.message);
        }
    }

    println!();
    println!(
        "{} {} ({}/{} passed, {}ms)",
        style("Result:").bold(),
        run.status.as_str(),
        run.passed_assertions,
        run.total_assertions,
        run.duration_ms.unwrap_or(0)
    );

    if run.status == TestRunStatus::Passed {
        Ok(run)
    } else {
        Err(run
            .error
            .clone()
            .unwrap_or_else(|| format!("Test run {} {}", run.id, run.status.as_str())))
    }
}
