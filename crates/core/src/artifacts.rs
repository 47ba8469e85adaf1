//! # Research Artifacts
//!
//! Value types passed between stages of a research run. All of them are
//! plain data: stages hand them over by copy and never share them mutably.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Immutable input of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchRequest {
    /// Raw query text as typed by the user
    pub query: String,
    /// Answers known before the run started (question index -> answer)
    #[serde(default)]
    pub prior_answers: BTreeMap<usize, String>,
}

impl ResearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            prior_answers: BTreeMap::new(),
        }
    }

    pub fn with_prior_answer(mut self, index: usize, answer: impl Into<String>) -> Self {
        self.prior_answers.insert(index, answer.into());
        self
    }
}

/// A follow-up question; `index` is assigned once at generation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    pub index: usize,
    pub text: String,
}

impl ClarificationQuestion {
    /// Number generated questions in the order the clarifier returned them
    pub fn from_texts<I, S>(texts: I) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        texts
            .into_iter()
            .enumerate()
            .map(|(index, text)| Self {
                index,
                text: text.into(),
            })
            .collect()
    }
}

/// Original query plus resolved clarifications, folded into one instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedQuery {
    pub original_query: String,
    /// First-person research instruction handed to the research pipeline
    pub instructions: String,
    /// Answers that were folded in
    #[serde(default)]
    pub answers: BTreeMap<usize, String>,
}

impl EnrichedQuery {
    /// Enrichment that leaves the query untouched
    pub fn unmodified(query: &str) -> Self {
        Self {
            original_query: query.to_string(),
            instructions: query.to_string(),
            answers: BTreeMap::new(),
        }
    }

    /// Short description of the research topic for the side-asset branch
    pub fn topic(&self) -> String {
        let mut topic: String = self.instructions.chars().take(600).collect();
        if topic.trim().is_empty() {
            topic = self.original_query.clone();
        }
        topic
    }
}

/// One planned web search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPlanItem {
    pub query: String,
    pub reason: String,
}

/// Outcome of one plan item. Failures are kept, not dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Position of the originating item in the plan
    pub item_index: usize,
    pub query: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub sources: Vec<String>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl SearchResult {
    pub fn succeeded(
        item_index: usize,
        query: impl Into<String>,
        summary: impl Into<String>,
        sources: Vec<String>,
    ) -> Self {
        Self {
            item_index,
            query: query.into(),
            summary: summary.into(),
            sources,
            success: true,
            error: None,
        }
    }

    pub fn failed(item_index: usize, query: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            item_index,
            query: query.into(),
            summary: String::new(),
            sources: Vec::new(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// The written report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportArtifact {
    pub short_summary: String,
    pub markdown_report: String,
    #[serde(default)]
    pub follow_up_questions: Vec<String>,
}

/// Reference to a stored, content-addressed asset file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    /// Hex sha256 of the content
    pub hash: String,
    pub mime_type: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Why a side asset is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetFailureKind {
    /// Caption agent declined or failed
    Caption,
    QuotaExhausted,
    Ineligible,
    Serialization,
    /// Transient failures exhausted the retry budget
    RetriesExhausted,
    Rejected,
    TimedOut,
    Storage,
    Panicked,
}

/// Result of the side-asset branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideAsset {
    pub success: bool,
    /// Caption the asset was generated from
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reference: Option<AssetRef>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failure_kind: Option<AssetFailureKind>,
}

impl SideAsset {
    pub fn generated(description: impl Into<String>, reference: AssetRef) -> Self {
        Self {
            success: true,
            description: Some(description.into()),
            reference: Some(reference),
            error: None,
            failure_kind: None,
        }
    }

    pub fn failed(kind: AssetFailureKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            description: None,
            reference: None,
            error: Some(error.into()),
            failure_kind: Some(kind),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Whether the deliverable carries the side asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizationStatus {
    WithSideAsset,
    SideAssetOmitted,
}

/// Terminal output of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalDeliverable {
    pub report: ReportArtifact,
    #[serde(default)]
    pub side_asset: Option<SideAsset>,
    pub status: FinalizationStatus,
    /// Reason the side asset is absent, surfaced to the caller
    #[serde(default)]
    pub omission_reason: Option<String>,
    pub markdown_path: PathBuf,
    pub html_path: PathBuf,
    pub finalized_at: DateTime<Utc>,
}
