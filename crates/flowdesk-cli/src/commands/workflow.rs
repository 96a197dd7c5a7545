//! `flowdesk workflow` - import, inspect and toggle workflow definitions.

use console::style;

use flowdesk_core::models::workflow::{Workflow, WorkflowStatus};
use flowdesk_core::state::AppState;

use super::truncate;

/// Parse a workflow file and store it. Returns the workflow id.
pub async fn import(state: &AppState, workflow_file: &str) -> Result<String, String> {
    let workflow = Workflow::from_file(workflow_file).map_err(|e| e.to_string())?;
    state
        .workflow_store
        .save(&workflow)
        .await
        .map_err(|e| e.to_string())?;

    println!(
        "📄 Imported '{}' ({}) with {} step(s), status {}",
        workflow.name,
        style(&workflow.id).cyan(),
        workflow.steps.len(),
        workflow.status.as_str()
    );
    Ok(workflow.id)
}

pub async fn list(state: &AppState) -> Result<(), String> {
    let workflows = state
        .workflow_store
        .list()
        .await
        .map_err(|e| e.to_string())?;

    if workflows.is_empty() {
        println!("No workflows. Import one with `flowdesk workflow import <file>`.");
        return Ok(());
    }

    println!("┌──────────────────────────────────────┬──────────────────────┬────────┬───────┐");
    println!("│ ID                                   │ Name                 │ Status │ Steps │");
    println!("├──────────────────────────────────────┼──────────────────────┼────────┼───────┤");
    for wf in &workflows {
        println!(
            "│ {:<36} │ {:<20} │ {:<6} │ {:>5} │",
            truncate(&wf.id, 36),
            truncate(&wf.name, 20),
            wf.status.as_str(),
            wf.steps.len()
        );
    }
    println!("└──────────────────────────────────────┴──────────────────────┴────────┴───────┘");
    Ok(())
}

pub async fn activate(state: &AppState, workflow_id: &str) -> Result<(), String> {
    set_status(state, workflow_id, WorkflowStatus::Active).await
}

/// Pausing does not touch a running execution; it only blocks new starts.
pub async fn pause(state: &AppState, workflow_id: &str) -> Result<(), String> {
    set_status(state, workflow_id, WorkflowStatus::Paused).await
}

async fn set_status(
    state: &AppState,
    workflow_id: &str,
    status: WorkflowStatus,
) -> Result<(), String> {
    let updated = state
        .workflow_store
        .set_status(workflow_id, status)
        .await
        .map_err(|e| e.to_string())?;
    if !updated {
        return Err(format!("Workflow {} not found", workflow_id));
    }
    println!("✅ Workflow {} is now {}", workflow_id, status.as_str());
    Ok(())
}

/// Validate a workflow YAML file without storing it.
pub async fn validate(workflow_file: &str) -> Result<(), String> {
    let workflow = Workflow::from_file(workflow_file).map_err(|e| e.to_string())?;

    println!("✅ Workflow '{}' is valid", workflow.name);
    println!("   Status: {}", workflow.status.as_str());
    println!("   Steps: {}", workflow.steps.len());

    for (i, step) in workflow.ordered_steps().iter().enumerate() {
        let gate = match step.blueprint() {
            Some(bp) if !bp.is_empty() => format!(
                ", blueprint: {} allowed / {} forbidden",
                bp.green_list.len(),
                bp.red_list.len()
            ),
            _ => String::new(),
        };
        println!(
            "   {}. {} ({}, {}{})",
            i + 1,
            step.label,
            step.id,
            step.step_type.as_str(),
            gate
        );
    }

    Ok(())
}
