//! # Clarification Collector
//!
//! Ordered pending questions plus the answers received so far. Owned by a
//! single run; every mutation goes through the coordinator's control loop.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::artifacts::ClarificationQuestion;

/// Rendered in place of a missing answer when enriching
pub const NO_PREFERENCE: &str = "No specific preference";

/// How the clarification session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationTermination {
    AllAnswered,
    AbandonedByUser,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClarificationError {
    #[error("cannot replace questions after {0} answer(s) were recorded")]
    AnswersPresent(usize),
    #[error("clarification session already terminated ({0:?})")]
    Terminated(ClarificationTermination),
}

/// Result of recording one answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Recorded { complete: bool },
    /// No question has this index; nothing changed
    UnknownIndex,
    /// Session is over; nothing changed
    Terminated,
}

/// A question as shown on the status surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub index: usize,
    pub text: String,
    pub answered: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationCollector {
    questions: Vec<ClarificationQuestion>,
    answers: BTreeMap<usize, String>,
    termination: Option<ClarificationTermination>,
}

impl ClarificationCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pending set. Rejected once any answer exists.
    pub fn add_questions(
        &mut self,
        questions: Vec<ClarificationQuestion>,
    ) -> Result<(), ClarificationError> {
        if let Some(termination) = self.termination {
            return Err(ClarificationError::Terminated(termination));
        }
        if !self.answers.is_empty() {
            return Err(ClarificationError::AnswersPresent(self.answers.len()));
        }
        self.questions = questions;
        Ok(())
    }

    /// Record an answer; last write wins for a repeated index.
    pub fn record_answer(&mut self, index: usize, text: impl Into<String>) -> AnswerOutcome {
        if self.termination.is_some() {
            return AnswerOutcome::Terminated;
        }
        if !self.questions.iter().any(|q| q.index == index) {
            return AnswerOutcome::UnknownIndex;
        }
        self.answers.insert(index, text.into());
        AnswerOutcome::Recorded {
            complete: self.is_complete(),
        }
    }

    /// True iff every known question has an answer
    pub fn is_complete(&self) -> bool {
        self.questions
            .iter()
            .all(|q| self.answers.contains_key(&q.index))
    }

    /// Mark the session over. The first termination wins.
    pub fn terminate(&mut self, reason: ClarificationTermination) -> ClarificationTermination {
        *self.termination.get_or_insert(reason)
    }

    pub fn termination(&self) -> Option<ClarificationTermination> {
        self.termination
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.is_some()
    }

    /// Immutable copy of the answers collected so far
    pub fn snapshot(&self) -> BTreeMap<usize, String> {
        self.answers.clone()
    }

    pub fn questions(&self) -> &[ClarificationQuestion] {
        &self.questions
    }

    pub fn answered_count(&self) -> usize {
        self.answers.len()
    }

    pub fn pending(&self) -> Vec<PendingQuestion> {
        self.questions
            .iter()
            .map(|q| PendingQuestion {
                index: q.index,
                text: q.text.clone(),
                answered: self.answers.contains_key(&q.index),
            })
            .collect()
    }

    /// Question/answer pairs in question order, unanswered ones as `NO_PREFERENCE`
    pub fn answered_pairs(&self) -> Vec<(String, String)> {
        self.questions
            .iter()
            .map(|q| {
                let answer = self
                    .answers
                    .get(&q.index)
                    .cloned()
                    .unwrap_or_else(|| NO_PREFERENCE.to_string());
                (q.text.clone(), answer)
            })
            .collect()
    }
}
