//! End-to-end runs of the coordinator against in-process fakes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::coordinator::Coordinator;
use super::events::{RunEvent, RunEventKind};
use super::retry::RetryPolicy;
use super::run::{RunOutcome, RunRecord};
use super::signals::{RunHandle, SignalError};
use super::stage::{RunStage, StageId};
use crate::artifacts::{
    AssetFailureKind, EnrichedQuery, FinalDeliverable, FinalizationStatus, ResearchRequest,
    SearchPlanItem, SearchResult,
};
use crate::clarification::{ClarificationTermination, NO_PREFERENCE};
use crate::config::EngineConfig;
use crate::research::ResearchCheckpoint;
use crate::skills::{AgentError, AgentReply, AgentRole, ClarificationsOutput};
use crate::state::runs::branch;
use crate::state::{ResearchDb, RunStore};
use crate::testing::{
    triage_output, FakeImages, FakeSearch, MemoryDocumentWriter, ScriptedInvoker,
    SCRIPTED_INSTRUCTIONS, SCRIPTED_QUESTIONS,
};
use crate::tools::ImageError;

struct Harness {
    coordinator: Arc<Coordinator>,
    invoker: Arc<ScriptedInvoker>,
    search: Arc<FakeSearch>,
    writer: Arc<MemoryDocumentWriter>,
    db: Arc<ResearchDb>,
    events: mpsc::Receiver<RunEvent>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::build(FakeSearch::new(), FakeImages::succeeding(), MemoryDocumentWriter::new(), |_| {})
    }

    fn build(
        search: FakeSearch,
        images: FakeImages,
        writer: MemoryDocumentWriter,
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(ResearchDb::open_in_memory().unwrap());

        let mut config = EngineConfig::default();
        config.retry = RetryPolicy::immediate(3);
        config.output_dir = Some(dir.path().join("reports"));
        tweak(&mut config);

        let invoker = Arc::new(ScriptedInvoker::new());
        let search = Arc::new(search);
        let writer = Arc::new(writer);
        let (tx, events) = mpsc::channel(1024);

        let coordinator = Coordinator::new(config, db.clone())
            .with_invoker(invoker.clone())
            .with_search(search.clone())
            .with_image_generator(Arc::new(images))
            .with_document_writer(writer.clone())
            .with_artifact_root(dir.path().join("artifacts"))
            .with_event_channel(tx);

        Self {
            coordinator: Arc::new(coordinator),
            invoker,
            search,
            writer,
            db,
            events,
            _dir: dir,
        }
    }

    fn record(&self, run_id: &str) -> RunRecord {
        RunStore::new(&self.db).load(run_id).unwrap().unwrap()
    }

    fn drain_events(&mut self) -> Vec<RunEventKind> {
        std::iter::from_fn(|| self.events.try_recv().ok())
            .map(|e| e.kind)
            .collect()
    }
}

fn completed(outcome: RunOutcome) -> FinalDeliverable {
    match outcome {
        RunOutcome::Completed(deliverable) => deliverable,
        other => panic!("expected completion, got {:?}", other),
    }
}

async fn awaiting(handle: &RunHandle) {
    let status = handle
        .wait_until(|s| s.stage == RunStage::AwaitingClarification || s.stage.is_terminal())
        .await;
    assert_eq!(status.stage, RunStage::AwaitingClarification);
}

#[tokio::test]
async fn test_direct_mode_researches_raw_query() {
    let h = Harness::new();
    let (_handle, task) = h
        .coordinator
        .start(ResearchRequest::new("renewable energy for small businesses"), false)
        .unwrap();

    let deliverable = completed(task.await.unwrap());
    assert_eq!(deliverable.status, FinalizationStatus::WithSideAsset);
    assert_eq!(h.invoker.calls_for(AgentRole::Triage), 0);
    assert_eq!(h.invoker.calls_for(AgentRole::Clarifier), 0);
    assert_eq!(h.invoker.calls_for(AgentRole::Instruction), 0);
    assert!(h.invoker.prompts_for(AgentRole::Planner)[0]
        .contains("renewable energy for small businesses"));

    let html = String::from_utf8(h.writer.get(&deliverable.html_path).unwrap()).unwrap();
    assert!(html.contains("<div class=\"image-container\">"));
    assert!(html.contains("<table>"));
}

#[tokio::test]
async fn test_direct_run_checkpoints_every_transition() {
    let h = Harness::new();
    let (handle, task) = h.coordinator.start(ResearchRequest::new("q"), false).unwrap();
    completed(task.await.unwrap());

    let stages: Vec<RunStage> = RunStore::new(&h.db)
        .transitions(handle.run_id())
        .unwrap()
        .into_iter()
        .map(|t| t.stage)
        .collect();
    assert_eq!(
        stages,
        vec![
            RunStage::Received,
            RunStage::Enriching,
            RunStage::Forked,
            RunStage::Joined,
            RunStage::Finalizing,
            RunStage::Completed,
        ]
    );
}

#[tokio::test]
async fn test_triage_direct_verdict_skips_clarifier() {
    let h = Harness::new();
    let (_handle, task) = h
        .coordinator
        .start(ResearchRequest::new("Compare the 2024 EU AI Act risk tiers"), true)
        .unwrap();

    completed(task.await.unwrap());
    assert_eq!(h.invoker.calls_for(AgentRole::Triage), 1);
    assert_eq!(h.invoker.calls_for(AgentRole::Clarifier), 0);
    assert_eq!(h.invoker.calls_for(AgentRole::Instruction), 0);
}

#[tokio::test]
async fn test_full_clarification_enriches_query() {
    let h = Harness::new();
    h.invoker.push_reply(triage_output(true));

    let (handle, task) = h.coordinator.start(ResearchRequest::new("travel tips"), true).unwrap();
    awaiting(&handle).await;

    let pending = handle.status().pending_questions;
    assert_eq!(pending.len(), 3);
    assert_eq!(pending[0].text, SCRIPTED_QUESTIONS[0]);

    let answers = BTreeMap::from([
        (0, "Japan".to_string()),
        (1, "$1000".to_string()),
        (2, "March".to_string()),
    ]);
    handle.deliver_answers(answers).unwrap();

    completed(task.await.unwrap());

    let record = h.record(handle.run_id());
    assert_eq!(
        record.clarification.termination(),
        Some(ClarificationTermination::AllAnswered)
    );
    let enriched = record.enriched.unwrap();
    assert_eq!(enriched.instructions, SCRIPTED_INSTRUCTIONS);
    assert_eq!(enriched.answers.len(), 3);

    let prompt = &h.invoker.prompts_for(AgentRole::Instruction)[0];
    assert!(prompt.contains(&format!("- {}: Japan", SCRIPTED_QUESTIONS[0])));
    assert!(h.invoker.prompts_for(AgentRole::Planner)[0].contains(SCRIPTED_INSTRUCTIONS));
}

#[tokio::test]
async fn test_partial_answers_then_end_session() {
    let h = Harness::new();
    h.invoker.push_reply(triage_output(true));

    let (handle, task) = h.coordinator.start(ResearchRequest::new("travel tips"), true).unwrap();
    awaiting(&handle).await;
    handle.deliver_answer(0, "Japan").unwrap();
    handle.end_session().unwrap();

    completed(task.await.unwrap());

    let record = h.record(handle.run_id());
    assert_eq!(
        record.clarification.termination(),
        Some(ClarificationTermination::AbandonedByUser)
    );
    assert_eq!(record.enriched.unwrap().answers.len(), 1);

    let prompt = &h.invoker.prompts_for(AgentRole::Instruction)[0];
    assert!(prompt.contains(&format!("- {}: {}", SCRIPTED_QUESTIONS[1], NO_PREFERENCE)));
}

#[tokio::test]
async fn test_end_session_without_answers_uses_query() {
    let h = Harness::new();
    h.invoker.push_reply(triage_output(true));

    let (handle, task) = h.coordinator.start(ResearchRequest::new("travel tips"), true).unwrap();
    awaiting(&handle).await;
    handle.end_session().unwrap();

    completed(task.await.unwrap());

    assert_eq!(h.invoker.calls_for(AgentRole::Instruction), 0);
    let enriched = h.record(handle.run_id()).enriched.unwrap();
    assert_eq!(enriched, EnrichedQuery::unmodified("travel tips"));
}

#[tokio::test]
async fn test_end_session_before_triage_abandons() {
    let h = Harness::new();
    let (handle, task) = h.coordinator.start(ResearchRequest::new("travel tips"), true).unwrap();
    handle.end_session().unwrap();

    assert_eq!(task.await.unwrap(), RunOutcome::Abandoned);
    assert_eq!(h.invoker.total_calls(), 0);
    assert_eq!(
        handle.deliver_answer(0, "Japan"),
        Err(SignalError::Terminal(RunStage::Abandoned))
    );
}

#[tokio::test]
async fn test_answer_before_questions_is_applied() {
    let h = Harness::new();
    h.invoker.push_reply(triage_output(true));

    let (handle, task) = h.coordinator.start(ResearchRequest::new("travel tips"), true).unwrap();
    handle.deliver_answer(1, "$1000").unwrap();
    awaiting(&handle).await;

    let answered: Vec<usize> = handle
        .status()
        .pending_questions
        .iter()
        .filter(|q| q.answered)
        .map(|q| q.index)
        .collect();
    assert_eq!(answered, vec![1]);

    handle.deliver_answer(0, "Japan").unwrap();
    handle.deliver_answer(2, "March").unwrap();
    completed(task.await.unwrap());

    let answers = h.record(handle.run_id()).enriched.unwrap().answers;
    assert_eq!(answers.get(&1).map(String::as_str), Some("$1000"));
}

#[tokio::test]
async fn test_prior_answers_skip_waiting() {
    let h = Harness::new();
    h.invoker.push_reply(triage_output(true));

    let request = ResearchRequest::new("travel tips")
        .with_prior_answer(0, "Japan")
        .with_prior_answer(1, "$1000")
        .with_prior_answer(2, "March");
    let (handle, task) = h.coordinator.start(request, true).unwrap();

    completed(task.await.unwrap());
    let stages: Vec<RunStage> = RunStore::new(&h.db)
        .transitions(handle.run_id())
        .unwrap()
        .into_iter()
        .map(|t| t.stage)
        .collect();
    assert!(!stages.contains(&RunStage::AwaitingClarification));
    assert_eq!(h.invoker.calls_for(AgentRole::Instruction), 1);
}

#[tokio::test]
async fn test_unknown_answer_index_is_ignored() {
    let mut h = Harness::new();
    h.invoker.push_reply(triage_output(true));

    let (handle, task) = h.coordinator.start(ResearchRequest::new("travel tips"), true).unwrap();
    awaiting(&handle).await;
    handle.deliver_answer(7, "Mars").unwrap();
    handle
        .deliver_answers(BTreeMap::from([
            (0, "Japan".to_string()),
            (1, "$1000".to_string()),
            (2, "March".to_string()),
        ]))
        .unwrap();

    completed(task.await.unwrap());
    let record = h.record(handle.run_id());
    assert!(!record.clarification.snapshot().contains_key(&7));
    assert!(h.drain_events().contains(&RunEventKind::AnswerIgnored));
}

#[tokio::test]
async fn test_unusable_clarifier_output_falls_back_to_query() {
    let h = Harness::new();
    h.invoker.push_reply(triage_output(true));
    h.invoker.set_default(AgentReply::Clarifier(ClarificationsOutput {
        questions: vec!["Only one?".to_string()],
    }));

    let (handle, task) = h.coordinator.start(ResearchRequest::new("travel tips"), true).unwrap();
    completed(task.await.unwrap());

    assert_eq!(h.invoker.calls_for(AgentRole::Clarifier), 3);
    assert_eq!(
        h.record(handle.run_id()).enriched.unwrap(),
        EnrichedQuery::unmodified("travel tips")
    );
}

#[tokio::test]
async fn test_instruction_model_error_uses_clarified_query() {
    let h = Harness::new();
    h.invoker.push_reply(triage_output(true));
    h.invoker
        .set_default_error(AgentRole::Instruction, AgentError::Model("refused".to_string()));

    let request = ResearchRequest::new("travel tips")
        .with_prior_answer(0, "Japan")
        .with_prior_answer(1, "$1000")
        .with_prior_answer(2, "March");
    let (handle, task) = h.coordinator.start(request, true).unwrap();
    completed(task.await.unwrap());

    let enriched = h.record(handle.run_id()).enriched.unwrap();
    assert!(enriched
        .instructions
        .starts_with("Original query: travel tips\n\nAdditional context from clarifications:"));
    assert_eq!(h.invoker.calls_for(AgentRole::Instruction), 1);
}

#[tokio::test]
async fn test_transient_triage_exhaustion_fails_run() {
    let h = Harness::new();
    h.invoker
        .set_default_error(AgentRole::Triage, AgentError::Transient("503".to_string()));

    let (_handle, task) = h.coordinator.start(ResearchRequest::new("travel tips"), true).unwrap();
    match task.await.unwrap() {
        RunOutcome::Failed(failure) => {
            assert_eq!(failure.stage, StageId::Triage);
            assert_eq!(failure.last_checkpoint, RunStage::Triaging);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(h.invoker.calls_for(AgentRole::Triage), 3);
}

#[tokio::test]
async fn test_side_asset_failure_does_not_fail_run() {
    let mut h = Harness::build(
        FakeSearch::new(),
        FakeImages::failing(ImageError::QuotaExhausted("insufficient_quota".to_string())),
        MemoryDocumentWriter::new(),
        |_| {},
    );

    let (_handle, task) = h.coordinator.start(ResearchRequest::new("q"), false).unwrap();
    let deliverable = completed(task.await.unwrap());

    assert_eq!(deliverable.status, FinalizationStatus::SideAssetOmitted);
    assert!(deliverable.omission_reason.unwrap().contains("insufficient_quota"));
    assert_eq!(
        deliverable.side_asset.unwrap().failure_kind,
        Some(AssetFailureKind::QuotaExhausted)
    );
    assert!(h.drain_events().contains(&RunEventKind::SideAssetOmitted));
}

#[tokio::test]
async fn test_slow_side_asset_is_abandoned_at_join() {
    let h = Harness::build(
        FakeSearch::new(),
        FakeImages::succeeding().with_delay(Duration::from_secs(30)),
        MemoryDocumentWriter::new(),
        |config| config.side_asset_wait = Duration::from_millis(50),
    );

    let (_handle, task) = h.coordinator.start(ResearchRequest::new("q"), false).unwrap();
    let deliverable = completed(task.await.unwrap());

    assert_eq!(deliverable.status, FinalizationStatus::SideAssetOmitted);
    assert_eq!(
        deliverable.side_asset.unwrap().failure_kind,
        Some(AssetFailureKind::TimedOut)
    );
}

async fn run_with_image_delay(image_delay: Duration) -> (FinalDeliverable, Vec<u8>, Duration) {
    let h = Harness::build(
        FakeSearch::new().with_delay(Duration::from_millis(40)),
        FakeImages::succeeding().with_delay(image_delay),
        MemoryDocumentWriter::new(),
        |config| config.side_asset_wait = Duration::from_secs(5),
    );

    let started = tokio::time::Instant::now();
    let (_handle, task) = h.coordinator.start(ResearchRequest::new("travel tips"), false).unwrap();
    let deliverable = completed(task.await.unwrap());
    let elapsed = started.elapsed();
    let html = h.writer.get(&deliverable.html_path).unwrap();
    (deliverable, html, elapsed)
}

#[tokio::test]
async fn test_branch_completion_order_does_not_change_deliverable() {
    // Image ready long before research vs. well after it, inside the join bound
    let (early, early_html, _) = run_with_image_delay(Duration::from_millis(1)).await;
    let (late, late_html, late_elapsed) = run_with_image_delay(Duration::from_millis(400)).await;

    assert!(late_elapsed >= Duration::from_millis(400));
    assert_eq!(early.status, FinalizationStatus::WithSideAsset);
    assert_eq!(late.status, early.status);
    assert_eq!(late.report, early.report);
    assert_eq!(
        late.side_asset.as_ref().and_then(|a| a.description.clone()),
        early.side_asset.as_ref().and_then(|a| a.description.clone())
    );
    assert_eq!(late_html, early_html);
}

#[tokio::test]
async fn test_all_searches_failing_fails_run() {
    let h = Harness::build(
        FakeSearch::new().always_failing(),
        FakeImages::succeeding(),
        MemoryDocumentWriter::new(),
        |_| {},
    );

    let (handle, task) = h.coordinator.start(ResearchRequest::new("q"), false).unwrap();
    match task.await.unwrap() {
        RunOutcome::Failed(failure) => assert_eq!(failure.stage, StageId::Search),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(h.record(handle.run_id()).stage, RunStage::Failed);
    assert!(h.writer.paths().is_empty());
}

#[tokio::test]
async fn test_finalize_io_exhaustion_fails_run() {
    let h = Harness::build(
        FakeSearch::new(),
        FakeImages::succeeding(),
        MemoryDocumentWriter::new().failing_times(10),
        |_| {},
    );

    let (_handle, task) = h.coordinator.start(ResearchRequest::new("q"), false).unwrap();
    match task.await.unwrap() {
        RunOutcome::Failed(failure) => {
            assert_eq!(failure.stage, StageId::Finalize);
            assert_eq!(failure.last_checkpoint, RunStage::Finalizing);
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_suspended_run_resumes_without_repeating_triage() {
    let h = Harness::new();
    h.invoker.push_reply(triage_output(true));

    let (handle, task) = h.coordinator.start(ResearchRequest::new("travel tips"), true).unwrap();
    awaiting(&handle).await;
    let run_id = handle.run_id().to_string();
    drop(handle);

    assert_eq!(
        task.await.unwrap(),
        RunOutcome::Suspended {
            stage: RunStage::AwaitingClarification
        }
    );
    assert_eq!(h.coordinator.resumable_runs().unwrap(), vec![run_id.clone()]);

    let (handle, task) = h.coordinator.resume(&run_id).unwrap();
    assert_eq!(handle.status().pending_questions.len(), 3);
    handle
        .deliver_answers(BTreeMap::from([
            (0, "Japan".to_string()),
            (1, "$1000".to_string()),
            (2, "March".to_string()),
        ]))
        .unwrap();

    completed(task.await.unwrap());
    assert_eq!(h.invoker.calls_for(AgentRole::Triage), 1);
    assert_eq!(h.invoker.calls_for(AgentRole::Clarifier), 1);
}

#[tokio::test]
async fn test_resume_mid_research_skips_finished_searches() {
    let h = Harness::new();
    let store = RunStore::new(&h.db);

    let mut record = RunRecord::new(ResearchRequest::new("solar panels"), false);
    record.advance(RunStage::Enriching).unwrap();
    record.enriched = Some(EnrichedQuery::unmodified("solar panels"));
    record.advance(RunStage::Forked).unwrap();
    store.save(&record).unwrap();

    let plan: Vec<SearchPlanItem> = (0..6)
        .map(|i| SearchPlanItem {
            query: format!("search {}", i),
            reason: "r".to_string(),
        })
        .collect();
    let checkpoint = ResearchCheckpoint {
        plan: Some(plan),
        results: vec![
            SearchResult::succeeded(0, "search 0", "done", vec![]),
            SearchResult::succeeded(1, "search 1", "done", vec![]),
        ],
        report: None,
    };
    store.save_branch(&record.id, branch::RESEARCH, &checkpoint).unwrap();

    let (_handle, task) = h.coordinator.resume(&record.id).unwrap();
    completed(task.await.unwrap());

    assert_eq!(h.invoker.calls_for(AgentRole::Planner), 0);
    assert_eq!(h.search.queries().len(), 4);
}

#[tokio::test]
async fn test_resume_of_finished_run_returns_stored_outcome() {
    let h = Harness::new();
    let (handle, task) = h.coordinator.start(ResearchRequest::new("q"), false).unwrap();
    let first = completed(task.await.unwrap());
    let calls = h.invoker.total_calls();

    let (_again, task) = h.coordinator.resume(handle.run_id()).unwrap();
    assert_eq!(completed(task.await.unwrap()), first);
    assert_eq!(h.invoker.total_calls(), calls);

    let err = h.coordinator.resume("missing").unwrap_err();
    assert_eq!(
        err.downcast_ref::<SignalError>(),
        Some(&SignalError::UnknownRun("missing".to_string()))
    );
}

#[tokio::test]
async fn test_clarification_timeout_proceeds_with_partial_answers() {
    let h = Harness::build(
        FakeSearch::new(),
        FakeImages::succeeding(),
        MemoryDocumentWriter::new(),
        |config| config.clarification_timeout = Some(Duration::from_millis(300)),
    );
    h.invoker.push_reply(triage_output(true));

    let (handle, task) = h.coordinator.start(ResearchRequest::new("travel tips"), true).unwrap();
    awaiting(&handle).await;
    handle.deliver_answer(0, "Japan").unwrap();

    completed(task.await.unwrap());
    let record = h.record(handle.run_id());
    assert_eq!(
        record.clarification.termination(),
        Some(ClarificationTermination::TimedOut)
    );
    assert_eq!(record.enriched.unwrap().answers.len(), 1);
}

#[tokio::test]
async fn test_ignored_answers_do_not_extend_clarification_timeout() {
    let h = Harness::build(
        FakeSearch::new(),
        FakeImages::succeeding(),
        MemoryDocumentWriter::new(),
        |config| config.clarification_timeout = Some(Duration::from_millis(300)),
    );
    h.invoker.push_reply(triage_output(true));

    let (handle, task) = h.coordinator.start(ResearchRequest::new("travel tips"), true).unwrap();
    awaiting(&handle).await;

    let noisy = handle.clone();
    let noise = tokio::spawn(async move {
        while noisy.deliver_answer(99, "noise").is_ok() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    let outcome = tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("run stuck awaiting clarification")
        .unwrap();
    completed(outcome);
    noise.abort();

    let record = h.record(handle.run_id());
    assert_eq!(
        record.clarification.termination(),
        Some(ClarificationTermination::TimedOut)
    );
    assert!(record.enriched.unwrap().answers.is_empty());
}

#[tokio::test]
async fn test_transient_planner_error_is_retried() {
    let h = Harness::new();
    h.invoker.push_error(
        AgentRole::Planner,
        AgentError::Transient("HTTP 503: upstream overloaded".to_string()),
    );

    let (_handle, task) = h.coordinator.start(ResearchRequest::new("q"), false).unwrap();
    completed(task.await.unwrap());

    assert_eq!(h.invoker.calls_for(AgentRole::Planner), 2);
}
