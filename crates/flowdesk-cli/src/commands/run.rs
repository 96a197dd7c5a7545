//! `flowdesk run` - execute a workflow with the local agent and review each
//! suspension from the terminal.

use std::sync::Arc;

use console::style;
use dialoguer::{Input, Select};
use tokio::sync::broadcast::error::RecvError;

use flowdesk_core::events::{UpdateKind, WorkflowEvent, WorkflowUpdate};
use flowdesk_core::models::review::{ReviewActionType, ReviewItem};
use flowdesk_core::review::ApprovalInput;
use flowdesk_core::state::AppState;

/// A reviewer's answer to one suspended step.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Approve,
    Reject(Option<String>),
    /// Record a message for the agent, then resume.
    Guidance(String),
}

/// Decides suspended steps. Called off the async runtime, so it may block.
pub trait Reviewer: Send + Sync {
    fn decide(&self, item: &ReviewItem) -> Result<Decision, String>;
}

/// Interactive terminal prompts.
pub struct PromptReviewer;

impl Reviewer for PromptReviewer {
    fn decide(&self, item: &ReviewItem) -> Result<Decision, String> {
        match item.action.action_type {
            ReviewActionType::GuidanceRequired => {
                let answer: String = Input::new()
                    .with_prompt("Your answer (empty to reject)")
                    .allow_empty(true)
                    .interact_text()
                    .map_err(|e| e.to_string())?;
                if answer.trim().is_empty() {
                    Ok(Decision::Reject(None))
                } else {
                    Ok(Decision::Guidance(answer))
                }
            }
            ReviewActionType::Error => {
                let choice = Select::new()
                    .with_prompt("The step failed")
                    .items(&["Retry", "Reject"])
                    .default(0)
                    .interact()
                    .map_err(|e| e.to_string())?;
                if choice == 0 {
                    Ok(Decision::Approve)
                } else {
                    Ok(Decision::Reject(prompt_notes()?))
                }
            }
            ReviewActionType::ApprovalRequired => {
                let choice = Select::new()
                    .with_prompt("Proceed?")
                    .items(&["Approve", "Reject", "Approve with guidance"])
                    .default(0)
                    .interact()
                    .map_err(|e| e.to_string())?;
                match choice {
                    0 => Ok(Decision::Approve),
                    1 => Ok(Decision::Reject(prompt_notes()?)),
                    _ => {
                        let message: String = Input::new()
                            .with_prompt("Guidance")
                            .interact_text()
                            .map_err(|e| e.to_string())?;
                        Ok(Decision::Guidance(message))
                    }
                }
            }
        }
    }
}

fn prompt_notes() -> Result<Option<String>, String> {
    let notes: String = Input::new()
        .with_prompt("Reason (optional)")
        .allow_empty(true)
        .interact_text()
        .map_err(|e| e.to_string())?;
    Ok((!notes.trim().is_empty()).then_some(notes))
}

/// Approves proposed actions and rejects everything that needs a person.
pub struct AutoApprove;

impl Reviewer for AutoApprove {
    fn decide(&self, item: &ReviewItem) -> Result<Decision, String> {
        Ok(match item.action.action_type {
            ReviewActionType::ApprovalRequired => Decision::Approve,
            ReviewActionType::Error => Decision::Reject(Some(
                "--auto-approve does not retry failed steps".to_string(),
            )),
            ReviewActionType::GuidanceRequired => Decision::Reject(Some(
                "guidance requested; rerun without --auto-approve".to_string(),
            )),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub execution_id: String,
    pub reviews: usize,
    pub duration_ms: i64,
}

pub async fn run(
    state: &AppState,
    workflow_id: &str,
    assignee: Option<String>,
    auto_approve: bool,
) -> Result<(), String> {
    let reviewer: Arc<dyn Reviewer> = if auto_approve {
        Arc::new(AutoApprove)
    } else {
        Arc::new(PromptReviewer)
    };
    let report = drive(state, workflow_id, assignee, reviewer).await?;
    println!(
        "\n🎉 Execution {} completed in {}ms ({} review(s))",
        report.execution_id, report.duration_ms, report.reviews
    );
    Ok(())
}

/// Start the workflow and follow its events until the execution ends,
/// handing every review to `reviewer`. Ctrl-C cancels the execution.
pub async fn drive(
    state: &AppState,
    workflow_id: &str,
    assignee: Option<String>,
    reviewer: Arc<dyn Reviewer>,
) -> Result<RunReport, String> {
    // Subscribe first so the first step's events are not missed.
    let mut events = state.event_bus.subscribe();
    let execution_id = state
        .orchestrator
        .start(workflow_id, assignee)
        .await
        .map_err(|e| e.to_string())?;
    println!("▶ Started execution {}", style(&execution_id).cyan());

    let mut reviews = 0;
    loop {
        let event = tokio::select! {
            received = events.recv() => match received {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("[CLI] Missed {} events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => return Err("Event bus closed".to_string()),
            },
            _ = tokio::signal::ctrl_c() => {
                state
                    .orchestrator
                    .cancel(workflow_id)
                    .await
                    .map_err(|e| e.to_string())?;
                return Err("Interrupted; execution cancelled".to_string());
            }
        };
        if event.workflow_id() != workflow_id {
            continue;
        }

        match event {
            WorkflowEvent::WorkflowUpdate(update) => {
                print_update(&update);
                if matches!(
                    update.kind,
                    UpdateKind::Failed | UpdateKind::Rejected | UpdateKind::Cancelled
                ) {
                    return Err(update.message);
                }
            }
            WorkflowEvent::ReviewNeeded(needed) => {
                print_review(&needed.review);
                reviews += 1;
                review(state, reviewer.clone(), needed.review).await?;
            }
            WorkflowEvent::Completed(done) if done.execution_id == execution_id => {
                return Ok(RunReport {
                    execution_id,
                    reviews,
                    duration_ms: done.duration_ms,
                });
            }
            WorkflowEvent::Completed(_) => {}
        }
    }
}

async fn review(
    state: &AppState,
    reviewer: Arc<dyn Reviewer>,
    item: ReviewItem,
) -> Result<(), String> {
    let decision = {
        let item = item.clone();
        tokio::task::spawn_blocking(move || reviewer.decide(&item))
            .await
            .map_err(|e| e.to_string())??
    };
    tracing::debug!("[CLI] Review {} decided: {:?}", item.id, decision);

    let gate = &state.review_gate;
    match decision {
        Decision::Approve => {
            gate.approve(&item.id, ApprovalInput::default())
                .await
                .map_err(|e| e.to_string())?;
        }
        Decision::Reject(notes) => {
            gate.reject(&item.id, notes)
                .await
                .map_err(|e| e.to_string())?;
        }
        Decision::Guidance(message) => {
            gate.provide_guidance(&item.workflow_id, &item.step_id, &message)
                .await
                .map_err(|e| e.to_string())?;
            gate.approve(&item.id, ApprovalInput::default())
                .await
                .map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

fn print_update(update: &WorkflowUpdate) {
    let worker = update
        .digital_worker_name
        .as_deref()
        .map(|w| format!("[{}] ", w))
        .unwrap_or_default();
    let line = format!("{}{}", worker, update.message);
    match update.kind {
        UpdateKind::StepCompleted => println!("  {} {}", style("✓").green(), line),
        UpdateKind::StepFailed => println!("  {} {}", style("✗").red(), line),
        UpdateKind::Failed | UpdateKind::Rejected | UpdateKind::Cancelled | UpdateKind::Blocker => {
            println!("{} {}", style("■").red().bold(), line)
        }
        _ => println!("  {} {}", style("·").dim(), line),
    }
}

fn print_review(item: &ReviewItem) {
    println!();
    println!(
        "{} '{}' needs review ({}), assigned to {}",
        style("⏸").yellow().bold(),
        item.step_label,
        item.action.action_type.as_str(),
        item.assignee
    );
    let payload = &item.action.payload;
    if let Some(message) = payload.get("message").and_then(|m| m.as_str()) {
        println!("  {}", message);
    }
    if let Some(question) = payload.get("question").and_then(|q| q.as_str()) {
        println!("  {} {}", style("?").cyan().bold(), question);
    }
    if let Some(error) = payload.get("error").and_then(|e| e.as_str()) {
        println!("  {} {}", style("error:").red(), error);
    }
    for action in payload
        .get("actions")
        .and_then(|a| a.as_array())
        .into_iter()
        .flatten()
    {
        let description = action
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or("?");
        let verdict = action
            .get("verdict")
            .and_then(|v| v.as_str())
            .unwrap_or("unlisted");
        let verdict = match verdict {
            "allowed" => style(verdict).green(),
            "forbidden" => style(verdict).red(),
            _ => style(verdict).yellow(),
        };
        println!("  - {} [{}]", description, verdict);
    }
}
