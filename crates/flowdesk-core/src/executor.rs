//! Step Executor - runs one workflow step and classifies the outcome.
//!
//! The executor:
//! 1. Completes human-assigned steps without calling an agent
//! 2. Completes a step a reviewer already approved
//! 3. Otherwise calls the agent capability with the step's blueprint,
//!    accumulated guidance and the workflow's integrations
//! 4. Gates decision steps and blueprint steps with proposed actions behind
//!    a human review, annotating each action with its blueprint verdict

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::blueprint::{BlueprintEvaluator, BlueprintVerdict};
use crate::error::FlowError;
use crate::models::execution::GuidanceEntry;
use crate::models::workflow::{Blueprint, StepType, WorkflowStep};

// ─── Agent capability ─────────────────────────────────────────────────────

/// An action the agent wants to take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedAction {
    pub description: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl ProposedAction {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            details: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub step: WorkflowStep,
    pub blueprint: Option<Blueprint>,
    pub guidance_context: Vec<GuidanceEntry>,
    pub integrations: Vec<String>,
    /// Decides what the agent may attempt under the blueprint.
    pub evaluator: BlueprintEvaluator,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutcome {
    #[serde(default)]
    pub actions: Vec<ProposedAction>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub needs_guidance: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_question: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The agent cannot continue without a clarification.
    #[error("Guidance needed: {0}")]
    GuidanceNeeded(String),

    #[error("{0}")]
    Failed(String),
}

/// The LLM-backed agent that carries out AI steps.
#[async_trait]
pub trait AgentCapability: Send + Sync {
    async fn execute(&self, request: &AgentRequest) -> Result<AgentOutcome, AgentError>;
}

// ─── Executor ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub guidance_context: Vec<GuidanceEntry>,
    /// A reviewer approved this step's proposed actions.
    pub approved: bool,
    pub integrations: Vec<String>,
}

/// A proposed action together with its blueprint verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewedAction {
    pub description: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
    pub verdict: BlueprintVerdict,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepVerdict {
    Completed {
        message: String,
    },
    NeedsReview {
        actions: Vec<ReviewedAction>,
        message: String,
    },
    NeedsGuidance {
        question: String,
        message: String,
    },
}

impl StepVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::NeedsReview { .. } => "needs_review",
            Self::NeedsGuidance { .. } => "needs_guidance",
        }
    }
}

#[derive(Clone)]
pub struct StepExecutor {
    agent: Arc<dyn AgentCapability>,
    evaluator: BlueprintEvaluator,
}

impl StepExecutor {
    pub fn new(agent: Arc<dyn AgentCapability>, evaluator: BlueprintEvaluator) -> Self {
        Self { agent, evaluator }
    }

    pub fn evaluator(&self) -> BlueprintEvaluator {
        self.evaluator
    }

    pub async fn execute(
        &self,
        step: &WorkflowStep,
        ctx: &StepContext,
    ) -> Result<StepVerdict, FlowError> {
        if step.is_human() {
            return Ok(StepVerdict::Completed {
                message: format!("'{}' is assigned to a human and tracked only", step.label),
            });
        }
        if ctx.approved {
            return Ok(StepVerdict::Completed {
                message: format!("'{}' approved by reviewer", step.label),
            });
        }

        let blueprint = step.blueprint().cloned();
        let request = AgentRequest {
            step: step.clone(),
            blueprint: blueprint.clone(),
            guidance_context: ctx.guidance_context.clone(),
            integrations: ctx.integrations.clone(),
            evaluator: self.evaluator,
        };

        let outcome = match self.agent.execute(&request).await {
            Ok(outcome) => outcome,
            Err(AgentError::GuidanceNeeded(question)) => {
                return Ok(StepVerdict::NeedsGuidance {
                    message: format!("'{}' needs guidance", step.label),
                    question,
                });
            }
            Err(AgentError::Failed(reason)) => {
                return Err(FlowError::Execution(format!(
                    "Step '{}' failed: {}",
                    step.label, reason
                )));
            }
        };

        if outcome.needs_guidance {
            let question = outcome
                .guidance_question
                .clone()
                .filter(|q| !q.trim().is_empty())
                .unwrap_or_else(|| outcome.message.clone());
            return Ok(StepVerdict::NeedsGuidance {
                question,
                message: outcome.message,
            });
        }

        let gated = step.step_type == StepType::Decision
            || (blueprint.is_some() && !outcome.actions.is_empty());
        if gated {
            let actions = outcome
                .actions
                .into_iter()
                .map(|a| ReviewedAction {
                    verdict: match &blueprint {
                        Some(bp) => self.evaluator.evaluate(&a.description, bp),
                        None => BlueprintVerdict::Unlisted,
                    },
                    description: a.description,
                    details: a.details,
                })
                .collect();
            return Ok(StepVerdict::NeedsReview {
                actions,
                message: outcome.message,
            });
        }

        let message = if outcome.message.is_empty() {
            format!("'{}' completed", step.label)
        } else {
            outcome.message
        };
        Ok(StepVerdict::Completed { message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::DefaultPolicy;
    use crate::models::workflow::{AssigneeKind, Requirements, StepAssignee};
    use std::sync::Mutex;

    /// Returns a fixed outcome and records every request.
    struct ScriptedAgent {
        result: Mutex<Option<Result<AgentOutcome, AgentError>>>,
        calls: Mutex<Vec<AgentRequest>>,
    }

    impl ScriptedAgent {
        fn new(result: Result<AgentOutcome, AgentError>) -> Arc<Self> {
            Arc::new(Self {
                result: Mutex::new(Some(result)),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AgentCapability for ScriptedAgent {
        async fn execute(&self, request: &AgentRequest) -> Result<AgentOutcome, AgentError> {
            self.calls.lock().unwrap().push(request.clone());
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(AgentOutcome::default()))
        }
    }

    fn step(step_type: StepType, blueprint: Option<Blueprint>) -> WorkflowStep {
        WorkflowStep {
            id: "s1".to_string(),
            label: "Draft reply".to_string(),
            step_type,
            assignee: Some(StepAssignee {
                kind: AssigneeKind::Ai,
                agent_name: Some("Helper".to_string()),
            }),
            order: 0,
            requirements: blueprint.map(|b| Requirements {
                blueprint: Some(b),
                chat_history: vec![],
            }),
        }
    }

    fn blueprint() -> Blueprint {
        Blueprint {
            green_list: vec!["draft email".to_string()],
            red_list: vec!["send payment link".to_string()],
        }
    }

    fn executor(agent: Arc<ScriptedAgent>) -> StepExecutor {
        StepExecutor::new(agent, BlueprintEvaluator::new(DefaultPolicy::Deny))
    }

    #[tokio::test]
    async fn test_human_step_skips_agent() {
        let agent = ScriptedAgent::new(Err(AgentError::Failed("should not run".into())));
        let mut s = step(StepType::Action, None);
        s.assignee = Some(StepAssignee {
            kind: AssigneeKind::Human,
            agent_name: None,
        });
        let verdict = executor(agent.clone())
            .execute(&s, &StepContext::default())
            .await
            .unwrap();
        assert_eq!(verdict.as_str(), "completed");
        assert!(agent.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blueprint_actions_need_review_with_verdicts() {
        let agent = ScriptedAgent::new(Ok(AgentOutcome {
            actions: vec![
                ProposedAction::new("Draft email to client"),
                ProposedAction::new("send payment link"),
                ProposedAction::new("archive thread"),
            ],
            message: "Drafted".to_string(),
            ..Default::default()
        }));
        let ctx = StepContext {
            integrations: vec!["gmail".to_string()],
            ..Default::default()
        };
        let verdict = executor(agent.clone())
            .execute(&step(StepType::Action, Some(blueprint())), &ctx)
            .await
            .unwrap();

        match verdict {
            StepVerdict::NeedsReview { actions, .. } => {
                let verdicts: Vec<_> = actions.iter().map(|a| a.verdict).collect();
                assert_eq!(
                    verdicts,
                    vec![
                        BlueprintVerdict::Allowed,
                        BlueprintVerdict::Forbidden,
                        BlueprintVerdict::Unlisted
                    ]
                );
            }
            other => panic!("expected review, got {:?}", other),
        }
        let calls = agent.calls.lock().unwrap();
        assert_eq!(calls[0].integrations, vec!["gmail".to_string()]);
        assert_eq!(calls[0].blueprint, Some(blueprint()));
        assert_eq!(calls[0].evaluator.default_policy, DefaultPolicy::Deny);
    }

    #[tokio::test]
    async fn test_blueprint_without_actions_completes() {
        let agent = ScriptedAgent::new(Ok(AgentOutcome::default()));
        let verdict = executor(agent)
            .execute(&step(StepType::Action, Some(blueprint())), &StepContext::default())
            .await
            .unwrap();
        assert_eq!(
            verdict,
            StepVerdict::Completed {
                message: "'Draft reply' completed".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_decision_step_always_reviewed() {
        let agent = ScriptedAgent::new(Ok(AgentOutcome::default()));
        let verdict = executor(agent)
            .execute(&step(StepType::Decision, None), &StepContext::default())
            .await
            .unwrap();
        assert_eq!(verdict.as_str(), "needs_review");
    }

    #[tokio::test]
    async fn test_guidance_has_priority() {
        let agent = ScriptedAgent::new(Ok(AgentOutcome {
            actions: vec![ProposedAction::new("draft email")],
            message: "Which client?".to_string(),
            needs_guidance: true,
            guidance_question: None,
        }));
        let verdict = executor(agent)
            .execute(&step(StepType::Decision, Some(blueprint())), &StepContext::default())
            .await
            .unwrap();
        assert_eq!(
            verdict,
            StepVerdict::NeedsGuidance {
                question: "Which client?".to_string(),
                message: "Which client?".to_string()
            }
        );

        let raised = ScriptedAgent::new(Err(AgentError::GuidanceNeeded("Tone?".into())));
        let verdict = executor(raised)
            .execute(&step(StepType::Action, None), &StepContext::default())
            .await
            .unwrap();
        assert!(matches!(verdict, StepVerdict::NeedsGuidance { ref question, .. } if question == "Tone?"));
    }

    #[tokio::test]
    async fn test_failures_become_execution_errors() {
        let agent = ScriptedAgent::new(Err(AgentError::Failed("quota exceeded".into())));
        let err = executor(agent)
            .execute(&step(StepType::Action, None), &StepContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Execution(ref m) if m.contains("quota exceeded")));
    }

    #[tokio::test]
    async fn test_approved_step_completes_without_call() {
        let agent = ScriptedAgent::new(Ok(AgentOutcome::default()));
        let ctx = StepContext {
            approved: true,
            ..Default::default()
        };
        let verdict = executor(agent.clone())
            .execute(&step(StepType::Decision, Some(blueprint())), &ctx)
            .await
            .unwrap();
        assert_eq!(verdict.as_str(), "completed");
        assert!(agent.calls.lock().unwrap().is_empty());
    }
}
