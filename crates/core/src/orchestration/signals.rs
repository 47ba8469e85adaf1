//! # External Signals
//!
//! The only way to touch a live run from outside: deliver answers, end the
//! clarification session, read the status surface. Commands are queued and
//! applied by the run's control loop in receipt order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::{mpsc, watch};

use super::run::RunRecord;
use super::stage::{RunStage, StageFailure};
use crate::artifacts::FinalDeliverable;
use crate::clarification::PendingQuestion;

/// Command delivered to a run's control loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunCommand {
    Answer { index: usize, text: String },
    EndSession,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("no such run: {0}")]
    UnknownRun(String),
    #[error("run is not collecting clarifications (stage: {0})")]
    NotAwaiting(RunStage),
    #[error("answer for question {0} is empty")]
    EmptyAnswer(usize),
    #[error("run already finished ({0})")]
    Terminal(RunStage),
    #[error("run control loop is not running")]
    ChannelClosed,
}

/// Status surface of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub stage: RunStage,
    pub pending_questions: Vec<PendingQuestion>,
    #[serde(default)]
    pub deliverable: Option<FinalDeliverable>,
    #[serde(default)]
    pub failure: Option<StageFailure>,
}

impl RunStatus {
    pub fn from_record(record: &RunRecord) -> Self {
        Self {
            run_id: record.id.clone(),
            stage: record.stage,
            pending_questions: record.clarification.pending(),
            deliverable: record.deliverable.clone(),
            failure: record.failure.clone(),
        }
    }
}

/// Caller-side handle of a running run
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: String,
    tx: mpsc::UnboundedSender<RunCommand>,
    status: watch::Receiver<RunStatus>,
}

impl RunHandle {
    pub fn new(
        run_id: impl Into<String>,
        tx: mpsc::UnboundedSender<RunCommand>,
        status: watch::Receiver<RunStatus>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            tx,
            status,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Latest published status
    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    /// Deliver one answer. Empty answers are rejected here and never queued.
    pub fn deliver_answer(&self, index: usize, text: impl Into<String>) -> Result<(), SignalError> {
        let text = text.into();
        let text = text.trim();
        if text.is_empty() {
            return Err(SignalError::EmptyAnswer(index));
        }
        self.ensure_collecting()?;
        self.send(RunCommand::Answer {
            index,
            text: text.to_string(),
        })
    }

    /// Deliver several answers, applied in ascending index order.
    pub fn deliver_answers(&self, answers: BTreeMap<usize, String>) -> Result<usize, SignalError> {
        if let Some((index, _)) = answers.iter().find(|(_, text)| text.trim().is_empty()) {
            return Err(SignalError::EmptyAnswer(*index));
        }
        self.ensure_collecting()?;
        let count = answers.len();
        for (index, text) in answers {
            self.send(RunCommand::Answer {
                index,
                text: text.trim().to_string(),
            })?;
        }
        Ok(count)
    }

    /// End the clarification session with whatever answers exist
    pub fn end_session(&self) -> Result<(), SignalError> {
        self.ensure_collecting()?;
        self.send(RunCommand::EndSession)
    }

    /// Wait until the published status satisfies `done`
    pub async fn wait_until<F>(&self, done: F) -> RunStatus
    where
        F: Fn(&RunStatus) -> bool,
    {
        let mut rx = self.status.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if done(&current) {
                    return current.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    fn ensure_collecting(&self) -> Result<(), SignalError> {
        let stage = self.status.borrow().stage;
        if stage.is_terminal() {
            return Err(SignalError::Terminal(stage));
        }
        match stage {
            RunStage::Received | RunStage::Triaging | RunStage::AwaitingClarification => Ok(()),
            other => Err(SignalError::NotAwaiting(other)),
        }
    }

    fn send(&self, command: RunCommand) -> Result<(), SignalError> {
        self.tx.send(command).map_err(|_| SignalError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ResearchRequest;

    fn handle_at(
        stage: RunStage,
    ) -> (
        RunHandle,
        mpsc::UnboundedReceiver<RunCommand>,
        watch::Sender<RunStatus>,
    ) {
        let mut record = RunRecord::new(ResearchRequest::new("travel tips"), true);
        record.stage = stage;
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RunStatus::from_record(&record));
        (RunHandle::new(record.id.clone(), tx, status_rx), rx, status_tx)
    }

    #[test]
    fn test_empty_answer_rejected_before_queueing() {
        let (handle, mut rx, _status) = handle_at(RunStage::AwaitingClarification);
        assert_eq!(handle.deliver_answer(0, "   "), Err(SignalError::EmptyAnswer(0)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_bulk_answers_sent_in_index_order() {
        let (handle, mut rx, _status) = handle_at(RunStage::AwaitingClarification);
        let answers = BTreeMap::from([
            (2, "March".to_string()),
            (0, "Japan".to_string()),
            (1, "$1000".to_string()),
        ]);
        assert_eq!(handle.deliver_answers(answers), Ok(3));

        let order: Vec<usize> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|cmd| match cmd {
                RunCommand::Answer { index, .. } => index,
                RunCommand::EndSession => usize::MAX,
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_bulk_with_one_empty_sends_nothing() {
        let (handle, mut rx, _status) = handle_at(RunStage::AwaitingClarification);
        let answers = BTreeMap::from([(0, "Japan".to_string()), (1, "".to_string())]);
        assert_eq!(handle.deliver_answers(answers), Err(SignalError::EmptyAnswer(1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_signals_rejected_after_clarification() {
        let (handle, _rx, _status) = handle_at(RunStage::Forked);
        assert_eq!(handle.end_session(), Err(SignalError::NotAwaiting(RunStage::Forked)));

        let (handle, _rx, _status) = handle_at(RunStage::Completed);
        assert_eq!(
            handle.deliver_answer(0, "x"),
            Err(SignalError::Terminal(RunStage::Completed))
        );
    }

    #[test]
    fn test_closed_loop_reports_channel_closed() {
        let (handle, rx, _status) = handle_at(RunStage::AwaitingClarification);
        drop(rx);
        assert_eq!(handle.end_session(), Err(SignalError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_wait_until_sees_later_status() {
        let (handle, _rx, status_tx) = handle_at(RunStage::Triaging);
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .wait_until(|s| s.stage == RunStage::AwaitingClarification)
                    .await
            })
        };

        let mut next = handle.status();
        next.stage = RunStage::AwaitingClarification;
        status_tx.send_replace(next);

        let seen = waiter.await.unwrap();
        assert_eq!(seen.stage, RunStage::AwaitingClarification);
    }
}
