//! # Run Record
//!
//! The durable state of one research run. Saved after every completed
//! transition; reloading it is all a restart needs to continue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::{RunStage, StageFailure};
use crate::artifacts::{EnrichedQuery, FinalDeliverable, ReportArtifact, ResearchRequest, SideAsset};
use crate::clarification::ClarificationCollector;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: RunStage,
    pub to: RunStage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub stage: RunStage,
    pub request: ResearchRequest,
    pub use_clarifications: bool,
    #[serde(default)]
    pub clarification: ClarificationCollector,
    /// Answers that arrived before questions existed, in receipt order
    #[serde(default)]
    pub queued_answers: Vec<(usize, String)>,
    #[serde(default)]
    pub enriched: Option<EnrichedQuery>,
    #[serde(default)]
    pub report: Option<ReportArtifact>,
    #[serde(default)]
    pub side_asset: Option<SideAsset>,
    #[serde(default)]
    pub deliverable: Option<FinalDeliverable>,
    #[serde(default)]
    pub failure: Option<StageFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(request: ResearchRequest, use_clarifications: bool) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            stage: RunStage::Received,
            request,
            use_clarifications,
            clarification: ClarificationCollector::new(),
            queued_answers: Vec::new(),
            enriched: None,
            report: None,
            side_asset: None,
            deliverable: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to` if the transition table allows it
    pub fn advance(&mut self, to: RunStage) -> Result<(), IllegalTransition> {
        if !self.stage.can_transition_to(to) {
            return Err(IllegalTransition {
                from: self.stage,
                to,
            });
        }
        self.stage = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a fatal failure. No-op on a run that already ended.
    pub fn fail(&mut self, failure: StageFailure) {
        if self.stage.is_terminal() {
            return;
        }
        self.stage = RunStage::Failed;
        self.failure = Some(failure);
        self.updated_at = Utc::now();
    }

    /// Terminal outcome, if the run has ended
    pub fn outcome(&self) -> Option<RunOutcome> {
        match self.stage {
            RunStage::Completed => self.deliverable.clone().map(RunOutcome::Completed),
            RunStage::Failed => self.failure.clone().map(RunOutcome::Failed),
            RunStage::Abandoned => Some(RunOutcome::Abandoned),
            _ => None,
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            stage: self.stage,
            query: self.request.query.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// How a drive of the control loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(FinalDeliverable),
    Failed(StageFailure),
    /// End-session before triage
    Abandoned,
    /// Loop stopped while awaiting answers; the checkpoint is intact
    Suspended { stage: RunStage },
}

impl RunOutcome {
    pub fn stage(&self) -> RunStage {
        match self {
            RunOutcome::Completed(_) => RunStage::Completed,
            RunOutcome::Failed(_) => RunStage::Failed,
            RunOutcome::Abandoned => RunStage::Abandoned,
            RunOutcome::Suspended { stage } => *stage,
        }
    }
}

/// Row of the run registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub stage: RunStage,
    pub query: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
