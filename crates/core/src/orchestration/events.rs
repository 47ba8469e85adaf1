//! # Run Events
//!
//! Progress notifications emitted by the coordinator. The server fans these
//! out over SSE; nothing in the engine depends on anyone listening.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Kind of run event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted,
    /// A stage transition was checkpointed
    StageEntered,
    /// Questions are pending; the run is suspended
    ClarificationRequested,
    AnswerRecorded,
    /// Answer for an unknown index or after termination
    AnswerIgnored,
    BranchStarted,
    BranchCompleted,
    BranchFailed,
    /// One search plan item finished (success or failure)
    SearchItemFinished,
    /// Deliverable produced without the side asset
    SideAssetOmitted,
    RunCompleted,
    RunFailed,
    RunAbandoned,
    /// Control loop stopped while awaiting answers; resumable
    RunSuspended,
}

/// An event of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub kind: RunEventKind,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl RunEvent {
    pub fn new(kind: RunEventKind, run_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            kind,
            data: None,
        }
    }

    /// Add data to the event
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Emits events of one run onto an optional channel
#[derive(Debug, Clone)]
pub struct EventSink {
    run_id: String,
    tx: Option<mpsc::Sender<RunEvent>>,
}

impl EventSink {
    pub fn new(run_id: &str, tx: Option<mpsc::Sender<RunEvent>>) -> Self {
        Self {
            run_id: run_id.to_string(),
            tx,
        }
    }

    /// Sink that drops everything
    pub fn disabled(run_id: &str) -> Self {
        Self::new(run_id, None)
    }

    pub async fn emit(&self, kind: RunEventKind, data: Option<serde_json::Value>) {
        if let Some(tx) = &self.tx {
            let mut event = RunEvent::new(kind, &self.run_id);
            event.data = data;
            let _ = tx.send(event).await;
        }
    }
}
