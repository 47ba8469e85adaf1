//! # Run Stages
//!
//! Lifecycle states of a research run and the explicit transition table
//! between them.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    /// Request accepted, nothing executed yet
    Received,
    /// Classifying the raw query
    Triaging,
    /// Suspended until answers or end-session arrive
    AwaitingClarification,
    /// Folding answers into the research instruction
    Enriching,
    /// Research pipeline and side-asset branch running
    Forked,
    /// Branch results merged
    Joined,
    /// Writing the deliverable
    Finalizing,
    Completed,
    Failed,
    Abandoned,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Received => "received",
            RunStage::Triaging => "triaging",
            RunStage::AwaitingClarification => "awaiting_clarification",
            RunStage::Enriching => "enriching",
            RunStage::Forked => "forked",
            RunStage::Joined => "joined",
            RunStage::Finalizing => "finalizing",
            RunStage::Completed => "completed",
            RunStage::Failed => "failed",
            RunStage::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "received" => RunStage::Received,
            "triaging" => RunStage::Triaging,
            "awaiting_clarification" => RunStage::AwaitingClarification,
            "enriching" => RunStage::Enriching,
            "forked" => RunStage::Forked,
            "joined" => RunStage::Joined,
            "finalizing" => RunStage::Finalizing,
            "completed" => RunStage::Completed,
            "failed" => RunStage::Failed,
            "abandoned" => RunStage::Abandoned,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStage::Completed | RunStage::Failed | RunStage::Abandoned
        )
    }

    /// Whether `self -> to` is in the transition table
    pub fn can_transition_to(&self, to: RunStage) -> bool {
        use RunStage::*;
        matches!(
            (self, to),
            (Received, Triaging)
                | (Received, Enriching)
                | (Received, Abandoned)
                | (Triaging, AwaitingClarification)
                | (Triaging, Enriching)
                | (AwaitingClarification, AwaitingClarification)
                | (AwaitingClarification, Enriching)
                | (Enriching, Forked)
                | (Forked, Joined)
                | (Joined, Finalizing)
                | (Finalizing, Completed)
        ) || (to == Failed && !self.is_terminal())
    }
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the step a fatal failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Triage,
    Clarify,
    Enrich,
    Plan,
    Search,
    Write,
    Finalize,
    /// Checkpoint store unavailable
    Store,
    /// Best-effort branch; never fails a run
    SideAsset,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Triage => "triage",
            StageId::Clarify => "clarify",
            StageId::Enrich => "enrich",
            StageId::Plan => "plan",
            StageId::Search => "search",
            StageId::Write => "write",
            StageId::Finalize => "finalize",
            StageId::Store => "store",
            StageId::SideAsset => "side_asset",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal failure of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("stage '{stage}' failed: {reason} (last checkpoint: {last_checkpoint})")]
pub struct StageFailure {
    pub stage: StageId,
    pub reason: String,
    /// Last stage whose checkpoint completed before the failure
    pub last_checkpoint: RunStage,
}

impl StageFailure {
    pub fn new(stage: StageId, reason: impl Into<String>, last_checkpoint: RunStage) -> Self {
        Self {
            stage,
            reason: reason.into(),
            last_checkpoint,
        }
    }
}
