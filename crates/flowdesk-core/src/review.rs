//! Review / Guidance Gate - the external-facing half of suspension.
//!
//! A suspended step leaves a pending [`ReviewItem`]. Reviewers answer it:
//!
//! - `approve` resumes the instance at its current index. An approved
//!   `approval_required` item lets the step complete; an `error` or
//!   `guidance_required` item is retried with the item's chat transcript
//!   added to the guidance context.
//! - `reject` ends the execution as failed. A new `start` is needed.
//! - `provide_guidance` adds a chat turn to the pending item without
//!   resuming anything.
//!
//! After the local state is updated, a [`ResumePayload`] goes to the
//! optional [`ResumeSignal`] (an external automation engine waiting on the
//! decision). Delivery failures are logged and never undo the decision.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::events::UpdateKind;
use crate::models::execution::GuidanceEntry;
use crate::models::review::{ResumePayload, ReviewActionType, ReviewItem, ReviewStatus};
use crate::models::workflow::ChatMessage;
use crate::orchestrator::{AdvanceOutcome, Orchestrator, ResumeRequest};
use crate::store::ReviewStore;

/// External system waiting on a review decision.
#[async_trait]
pub trait ResumeSignal: Send + Sync {
    async fn deliver(&self, payload: &ResumePayload) -> Result<(), String>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_notes: Option<String>,
    /// Edited data handed back to the waiting system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct ReviewGate {
    orchestrator: Orchestrator,
    reviews: ReviewStore,
    resume_signal: Option<Arc<dyn ResumeSignal>>,
}

impl ReviewGate {
    pub fn new(orchestrator: Orchestrator, reviews: ReviewStore) -> Self {
        Self {
            orchestrator,
            reviews,
            resume_signal: None,
        }
    }

    pub fn with_resume_signal(mut self, signal: Arc<dyn ResumeSignal>) -> Self {
        self.resume_signal = Some(signal);
        self
    }

    pub async fn pending(&self, workflow_id: Option<&str>) -> Result<Vec<ReviewItem>, FlowError> {
        self.reviews.list_pending(workflow_id).await
    }

    pub async fn get(&self, review_id: &str) -> Result<Option<ReviewItem>, FlowError> {
        self.reviews.get(review_id).await
    }

    async fn pending_item(&self, review_id: &str) -> Result<ReviewItem, FlowError> {
        let item = self
            .reviews
            .get(review_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("Review item {} not found", review_id)))?;
        if !item.is_pending() {
            return Err(FlowError::Conflict(format!(
                "Review item {} is already {}",
                review_id,
                item.status.as_str()
            )));
        }
        Ok(item)
    }

    // ─── Approve ────────────────────────────────────────────────────────

    /// Approve a pending item and resume its execution at the current step.
    pub async fn approve(
        &self,
        review_id: &str,
        input: ApprovalInput,
    ) -> Result<AdvanceOutcome, FlowError> {
        let item = self.pending_item(review_id).await?;

        let guidance = (!item.chat_history.is_empty()).then(|| GuidanceEntry {
            step_id: item.step_id.clone(),
            chat_history: item.chat_history.clone(),
            timestamp: Utc::now(),
        });
        let approved_step_id = (item.action.action_type == ReviewActionType::ApprovalRequired)
            .then(|| item.step_id.clone());

        self.orchestrator
            .resume(
                &item.workflow_id,
                &item.execution_id,
                ResumeRequest {
                    guidance,
                    approved_step_id,
                },
            )
            .await?;
        self.reviews
            .set_status(&item.id, ReviewStatus::Approved, input.reviewer_notes.clone())
            .await?;

        tracing::info!(
            "[ReviewGate] Approved {} review {} for step '{}'",
            item.action.action_type.as_str(),
            item.id,
            item.step_label
        );
        self.signal(ResumePayload {
            approved: true,
            review_id: item.id.clone(),
            reviewer_notes: input.reviewer_notes,
            response_data: input.response_data,
            reviewed_at: Utc::now(),
        })
        .await;

        self.orchestrator.advance(&item.workflow_id).await
    }

    // ─── Reject ─────────────────────────────────────────────────────────

    /// Reject a pending item. The execution ends as failed and is not
    /// resumed.
    pub async fn reject(&self, review_id: &str, notes: Option<String>) -> Result<(), FlowError> {
        let item = self.pending_item(review_id).await?;
        self.reviews
            .set_status(&item.id, ReviewStatus::Rejected, notes.clone())
            .await?;

        let reason = match &notes {
            Some(n) => format!("'{}' rejected: {}", item.step_label, n),
            None => format!("'{}' rejected", item.step_label),
        };
        self.orchestrator
            .fail(&item.workflow_id, &item.execution_id, UpdateKind::Rejected, reason)
            .await?;

        tracing::info!("[ReviewGate] Rejected review {}", item.id);
        self.signal(ResumePayload {
            approved: false,
            review_id: item.id,
            reviewer_notes: notes,
            response_data: None,
            reviewed_at: Utc::now(),
        })
        .await;
        Ok(())
    }

    // ─── Guidance ───────────────────────────────────────────────────────

    /// Add a reviewer message to the pending item of `step_id`. Resumption
    /// happens through `approve`.
    pub async fn provide_guidance(
        &self,
        workflow_id: &str,
        step_id: &str,
        message: &str,
    ) -> Result<ReviewItem, FlowError> {
        if message.trim().is_empty() {
            return Err(FlowError::BadRequest("Guidance message is empty".to_string()));
        }
        let item = self
            .reviews
            .list_pending(Some(workflow_id))
            .await?
            .into_iter()
            .find(|i| i.step_id == step_id)
            .ok_or_else(|| {
                FlowError::NotFound(format!(
                    "No pending review for step {} of workflow {}",
                    step_id, workflow_id
                ))
            })?;

        let item = self
            .reviews
            .append_chat(&item.id, &ChatMessage::user(message))
            .await?
            .ok_or_else(|| {
                FlowError::Conflict(format!("Review {} is already resolved", item.id))
            })?;
        tracing::debug!(
            "[ReviewGate] Guidance added to review {} ({} messages)",
            item.id,
            item.chat_history.len()
        );
        Ok(item)
    }

    async fn signal(&self, payload: ResumePayload) {
        let Some(signal) = &self.resume_signal else {
            return;
        };
        if let Err(e) = signal.deliver(&payload).await {
            tracing::warn!(
                "[ReviewGate] Resume signal for review {} failed: {}",
                payload.review_id,
                e
            );
        }
    }
}
