//! Event Bus - publish/subscribe channel for workflow state transitions.
//!
//! Consumers (dashboard, activity log) observe the orchestrator through
//! three closed event kinds: `workflow_update`, `review_needed` and
//! `completed`. Delivery is ordered within a workflow because every event is
//! emitted from the workflow's own step loop.
//!
//! Features:
//!   - Broadcast subscribers (`subscribe`, `stream`)
//!   - Named synchronous handlers, invoked in emission order
//!   - Per-workflow activity buffer drained by consumers that poll, capped
//!     at `history_limit` events (oldest dropped first)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::models::review::ReviewItem;

/// What a `workflow_update` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Started,
    StepStarted,
    StepCompleted,
    StepFailed,
    Resumed,
    Rejected,
    Failed,
    Cancelled,
    /// The workflow cannot run at all (e.g. it is not active).
    Blocker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowUpdate {
    pub workflow_id: String,
    pub kind: UpdateKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digital_worker_name: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewNeeded {
    pub workflow_id: String,
    pub step_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digital_worker_name: Option<String>,
    pub message: String,
    /// The suspended step, including the proposed action.
    pub review: ReviewItem,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowCompleted {
    pub workflow_id: String,
    pub execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digital_worker_name: Option<String>,
    pub message: String,
    pub duration_ms: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowUpdate(WorkflowUpdate),
    ReviewNeeded(ReviewNeeded),
    Completed(WorkflowCompleted),
}

impl WorkflowEvent {
    pub fn workflow_id(&self) -> &str {
        match self {
            Self::WorkflowUpdate(e) => &e.workflow_id,
            Self::ReviewNeeded(e) => &e.workflow_id,
            Self::Completed(e) => &e.workflow_id,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowUpdate(_) => "workflow_update",
            Self::ReviewNeeded(_) => "review_needed",
            Self::Completed(_) => "completed",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::WorkflowUpdate(e) => e.timestamp,
            Self::ReviewNeeded(e) => e.timestamp,
            Self::Completed(e) => e.timestamp,
        }
    }

    pub fn update(
        workflow_id: &str,
        kind: UpdateKind,
        step_id: Option<&str>,
        digital_worker_name: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self::WorkflowUpdate(WorkflowUpdate {
            workflow_id: workflow_id.to_string(),
            kind,
            step_id: step_id.map(|s| s.to_string()),
            digital_worker_name: digital_worker_name.map(|s| s.to_string()),
            message: message.into(),
            timestamp: Utc::now(),
        })
    }
}

type EventHandler = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

/// Inner state for the EventBus.
struct EventBusInner {
    handlers: HashMap<String, EventHandler>,
    pending_events: HashMap<String, VecDeque<WorkflowEvent>>,
    history_limit: usize,
}

/// Thread-safe event bus for workflow observers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<RwLock<EventBusInner>>,
    sender: broadcast::Sender<WorkflowEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_limits(256, 256)
    }

    /// `capacity` bounds the broadcast channel; `history_limit` bounds each
    /// workflow's activity buffer.
    pub fn with_limits(capacity: usize, history_limit: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(RwLock::new(EventBusInner {
                handlers: HashMap::new(),
                pending_events: HashMap::new(),
                history_limit: history_limit.max(1),
            })),
            sender,
        }
    }

    // ─── Direct handlers ────────────────────────────────────────────────

    /// Register a handler under `key`, replacing any previous one.
    pub async fn on<F>(&self, key: &str, handler: F)
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.write().await;
        inner.handlers.insert(key.to_string(), Arc::new(handler));
    }

    /// Unsubscribe a handler.
    pub async fn off(&self, key: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.handlers.remove(key).is_some()
    }

    // ─── Publish ────────────────────────────────────────────────────────

    /// Publish an event to handlers, broadcast subscribers and the
    /// workflow's activity buffer.
    pub async fn emit(&self, event: WorkflowEvent) {
        let handlers: Vec<EventHandler> = {
            let mut inner = self.inner.write().await;
            let limit = inner.history_limit;
            let buffer = inner
                .pending_events
                .entry(event.workflow_id().to_string())
                .or_default();
            while buffer.len() >= limit {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
            inner.handlers.values().cloned().collect()
        };

        tracing::debug!(
            "[EventBus] {} for workflow {}",
            event.as_str(),
            event.workflow_id()
        );

        for handler in handlers {
            handler(&event);
        }

        // No receivers is not an error: nobody is watching yet.
        let _ = self.sender.send(event);
    }

    // ─── Subscribers ────────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Events for one workflow. Lagged receivers skip what they missed.
    pub fn stream(&self, workflow_id: &str) -> impl Stream<Item = WorkflowEvent> + Send + 'static {
        let workflow_id = workflow_id.to_string();
        BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| match item {
            Ok(event) if event.workflow_id() == workflow_id => Some(event),
            _ => None,
        })
    }

    /// Drain the buffered activity for a workflow.
    pub async fn drain_pending(&self, workflow_id: &str) -> Vec<WorkflowEvent> {
        let mut inner = self.inner.write().await;
        inner
            .pending_events
            .remove(workflow_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Peek at the buffered activity without draining it.
    pub async fn history(&self, workflow_id: &str) -> Vec<WorkflowEvent> {
        let inner = self.inner.read().await;
        inner
            .pending_events
            .get(workflow_id)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }
}
