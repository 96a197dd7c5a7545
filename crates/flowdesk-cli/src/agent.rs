//! `LocalAgent` - an offline stand-in for the LLM-backed agent.
//!
//! It never calls out. On a blueprint step it proposes the first green-list
//! action the evaluator permits, so the review gate has something to show;
//! on a decision step it proposes the decision itself. Everything else
//! completes with a short summary.

use async_trait::async_trait;
use serde_json::json;

use flowdesk_core::executor::{
    AgentCapability, AgentError, AgentOutcome, AgentRequest, ProposedAction,
};
use flowdesk_core::models::workflow::{ChatRole, StepType};

#[derive(Debug, Clone, Default)]
pub struct LocalAgent;

impl LocalAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AgentCapability for LocalAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<AgentOutcome, AgentError> {
        let step = &request.step;

        // The most recent reviewer message, if any.
        let guidance = request
            .guidance_context
            .iter()
            .flat_map(|g| g.chat_history.iter())
            .filter(|m| m.role == ChatRole::User)
            .last()
            .map(|m| m.content.clone());

        let mut actions = Vec::new();
        if let Some(blueprint) = &request.blueprint {
            if let Some(action) = blueprint
                .green_list
                .iter()
                .find(|a| request.evaluator.is_permitted(a, blueprint))
            {
                actions.push(ProposedAction {
                    description: action.clone(),
                    details: json!({
                        "stepId": step.id,
                        "integrations": request.integrations,
                    }),
                });
            }
        } else if step.step_type == StepType::Decision {
            actions.push(ProposedAction::new(format!("decide '{}'", step.label)));
        }

        let mut message = match actions.first() {
            Some(a) => format!("Proposing to {} for '{}'", a.description, step.label),
            None => format!("Finished '{}'", step.label),
        };
        if let Some(g) = guidance {
            message.push_str(&format!(" (following guidance: {})", g));
        }

        Ok(AgentOutcome {
            actions,
            message,
            ..Default::default()
        })
    }
}
