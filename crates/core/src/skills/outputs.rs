//! # Role Outputs
//!
//! Structured outputs the reasoning service returns for each agent role.
//! The derived JSON schema of each type is the role's output schema.

use radkit::macros::LLMOutput;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::artifacts::{ReportArtifact, SearchPlanItem};

/// How sure the triage agent is about its classification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, LLMOutput, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Triage classification of a raw query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageDecision {
    NeedsClarification,
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput, PartialEq)]
pub struct TriageOutput {
    pub needs_clarification: bool,
    #[serde(default)]
    pub confidence: Option<Confidence>,
    #[serde(default)]
    pub reason: String,
}

impl TriageOutput {
    /// Low-confidence verdicts count as ambiguous, and ambiguity means asking.
    pub fn decision(&self) -> TriageDecision {
        if self.needs_clarification || self.confidence == Some(Confidence::Low) {
            TriageDecision::NeedsClarification
        } else {
            TriageDecision::Direct
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput, PartialEq)]
pub struct ClarificationsOutput {
    pub questions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput, PartialEq)]
pub struct InstructionOutput {
    pub research_instructions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput, PartialEq)]
pub struct PlannedSearch {
    /// Search term to use for the web search
    pub query: String,
    /// Why this search is important to the query
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput, PartialEq)]
pub struct SearchPlanOutput {
    pub searches: Vec<PlannedSearch>,
}

impl SearchPlanOutput {
    pub fn into_items(self) -> Vec<SearchPlanItem> {
        self.searches
            .into_iter()
            .map(|s| SearchPlanItem {
                query: s.query,
                reason: s.reason,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput, PartialEq)]
pub struct SearchSummaryOutput {
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput, PartialEq)]
pub struct ReportOutput {
    /// A short 2-3 sentence summary of the findings
    pub short_summary: String,
    /// The final report in markdown
    pub markdown_report: String,
    /// Suggested topics to research further
    #[serde(default)]
    pub follow_up_questions: Vec<String>,
}

impl From<ReportOutput> for ReportArtifact {
    fn from(output: ReportOutput) -> Self {
        Self {
            short_summary: output.short_summary,
            markdown_report: output.markdown_report,
            follow_up_questions: output.follow_up_questions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput, PartialEq)]
pub struct ImageCaptionOutput {
    pub success: bool,
    #[serde(default)]
    pub image_description: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triage(needs: bool, confidence: Option<Confidence>) -> TriageOutput {
        TriageOutput {
            needs_clarification: needs,
            confidence,
            reason: String::new(),
        }
    }

    #[test]
    fn test_triage_decision_is_binary() {
        assert_eq!(triage(false, Some(Confidence::High)).decision(), TriageDecision::Direct);
        assert_eq!(triage(false, None).decision(), TriageDecision::Direct);
        assert_eq!(
            triage(true, Some(Confidence::High)).decision(),
            TriageDecision::NeedsClarification
        );
    }

    #[test]
    fn test_low_confidence_direct_means_ask() {
        assert_eq!(
            triage(false, Some(Confidence::Low)).decision(),
            TriageDecision::NeedsClarification
        );
    }

    #[test]
    fn test_triage_output_tolerates_missing_fields() {
        let parsed: TriageOutput = serde_json::from_str(r#"{"needs_clarification": false}"#).unwrap();
        assert_eq!(parsed.confidence, None);
        assert_eq!(parsed.decision(), TriageDecision::Direct);
    }
}
