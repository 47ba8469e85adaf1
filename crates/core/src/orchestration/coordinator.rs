//! # Research Coordinator
//!
//! Drives a run through its stages, one checkpointed transition at a time.
//!
//! ```text
//! Received → Triaging → AwaitingClarification ⟲ → Enriching → Forked → Joined → Finalizing → Completed
//!                └──────────── direct ─────────────┘      (research ∥ side asset)
//! ```
//!
//! Each drive of the control loop owns its `RunRecord`. Callers talk to it
//! only through a `RunHandle`; restarting from the store is `resume`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::events::{EventSink, RunEvent, RunEventKind};
use super::run::{RunOutcome, RunRecord, RunSummary};
use super::signals::{RunCommand, RunHandle, RunStatus, SignalError};
use super::stage::{RunStage, StageFailure, StageId};
use crate::artifacts::{
    AssetFailureKind, ClarificationQuestion, EnrichedQuery, FinalizationStatus, ResearchRequest,
    SideAsset,
};
use crate::assets::SideAssetBranch;
use crate::clarification::{AnswerOutcome, ClarificationCollector, ClarificationTermination};
use crate::config::EngineConfig;
use crate::finalize::{DocumentWriter, Finalizer, FsDocumentWriter};
use crate::research::{ResearchCheckpoint, ResearchPipeline};
use crate::skills::{
    invoke_as, AgentError, AgentInvoker, ClarificationsOutput, InstructionOutput, RadkitInvoker,
    TriageDecision, TriageOutput,
};
use crate::state::io::get_runtime_path;
use crate::state::runs::branch;
use crate::state::{ArtifactStore, ResearchDb, RunStore};
use crate::tools::{ImageGenerator, OpenAiImageGenerator, SearxngSearch, WebSearch};

/// Questions kept from the clarifier
const MAX_QUESTIONS: usize = 3;
const MIN_QUESTIONS: usize = 2;

/// What a stage handler asks the loop to do next
enum Step {
    /// Transition (possibly to the same stage) and checkpoint
    Advance(RunStage),
    /// Stop driving; the last checkpoint stays resumable
    Suspend,
}

enum SideTask {
    Restored(SideAsset),
    Running(JoinHandle<SideAsset>),
}

/// The research coordinator
pub struct Coordinator {
    config: EngineConfig,
    invoker: Arc<dyn AgentInvoker>,
    search: Arc<dyn WebSearch>,
    images: Arc<dyn ImageGenerator>,
    writer: Arc<dyn DocumentWriter>,
    db: Arc<ResearchDb>,
    artifacts: Arc<ArtifactStore>,
    event_tx: Option<mpsc::Sender<RunEvent>>,
}

impl Coordinator {
    pub fn new(config: EngineConfig, db: Arc<ResearchDb>) -> Self {
        let invoker = Arc::new(RadkitInvoker::from_config(&config));
        let search = Arc::new(SearxngSearch::new(config.searxng_url.as_deref()));
        let images = Arc::new(OpenAiImageGenerator::new(config.base_url.as_deref()));
        let artifacts = Arc::new(ArtifactStore::new(&db, get_runtime_path().join("artifacts")));

        Self {
            config,
            invoker,
            search,
            images,
            writer: Arc::new(FsDocumentWriter),
            db,
            artifacts,
            event_tx: None,
        }
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn AgentInvoker>) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn with_search(mut self, search: Arc<dyn WebSearch>) -> Self {
        self.search = search;
        self
    }

    pub fn with_image_generator(mut self, images: Arc<dyn ImageGenerator>) -> Self {
        self.images = images;
        self
    }

    pub fn with_document_writer(mut self, writer: Arc<dyn DocumentWriter>) -> Self {
        self.writer = writer;
        self
    }

    /// Set event channel for progress updates
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Store side assets under `root` instead of the runtime directory
    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifacts = Arc::new(ArtifactStore::new(&self.db, root));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Persist a new run and start driving it.
    pub fn start(
        self: &Arc<Self>,
        request: ResearchRequest,
        use_clarifications: bool,
    ) -> Result<(RunHandle, JoinHandle<RunOutcome>)> {
        if request.query.trim().is_empty() {
            anyhow::bail!("Research query must not be empty");
        }

        let record = RunRecord::new(request, use_clarifications);
        RunStore::new(&self.db)
            .save(&record)
            .context("Failed to persist new run")?;
        tracing::info!(run_id = %record.id, use_clarifications, "Run created");

        Ok(self.spawn(record))
    }

    /// Continue a run from its last checkpoint. A finished run yields its
    /// stored outcome without executing anything.
    pub fn resume(self: &Arc<Self>, run_id: &str) -> Result<(RunHandle, JoinHandle<RunOutcome>)> {
        let record = RunStore::new(&self.db)
            .load(run_id)?
            .ok_or_else(|| SignalError::UnknownRun(run_id.to_string()))?;

        tracing::info!(run_id, stage = %record.stage, "Resuming run");

        Ok(self.spawn(record))
    }

    /// Status of a stored run
    pub fn status(&self, run_id: &str) -> Result<Option<RunStatus>> {
        Ok(RunStore::new(&self.db)
            .load(run_id)?
            .map(|record| RunStatus::from_record(&record)))
    }

    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        RunStore::new(&self.db).list()
    }

    /// Ids of stored runs that have not reached a terminal stage
    pub fn resumable_runs(&self) -> Result<Vec<String>> {
        RunStore::new(&self.db).list_resumable()
    }

    fn spawn(self: &Arc<Self>, record: RunRecord) -> (RunHandle, JoinHandle<RunOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RunStatus::from_record(&record));
        let handle = RunHandle::new(record.id.clone(), tx, status_rx);

        let coordinator = Arc::clone(self);
        let task = tokio::spawn(async move { coordinator.drive(record, rx, status_tx).await });

        (handle, task)
    }

    #[tracing::instrument(skip_all, fields(run_id = %record.id, query_preview = %record.request.query.chars().take(50).collect::<String>()))]
    async fn drive(
        self: Arc<Self>,
        mut record: RunRecord,
        mut commands: mpsc::UnboundedReceiver<RunCommand>,
        status: watch::Sender<RunStatus>,
    ) -> RunOutcome {
        let events = EventSink::new(&record.id, self.event_tx.clone());
        events
            .emit(
                RunEventKind::RunStarted,
                Some(serde_json::json!({
                    "stage": record.stage,
                    "query": record.request.query,
                    "use_clarifications": record.use_clarifications,
                })),
            )
            .await;

        loop {
            if record.stage.is_terminal() {
                return self.finish(&record, &events).await;
            }

            let previous = record.stage;
            let step = match previous {
                RunStage::Received => self.on_received(&mut record, &mut commands),
                RunStage::Triaging => self.on_triaging(&mut record, &events).await,
                RunStage::AwaitingClarification => {
                    self.on_awaiting(&mut record, &mut commands, &events).await
                }
                RunStage::Enriching => self.on_enriching(&mut record).await,
                RunStage::Forked => self.on_forked(&mut record, &events).await,
                RunStage::Joined => Ok(Step::Advance(RunStage::Finalizing)),
                RunStage::Finalizing => self.on_finalizing(&mut record, &events).await,
                RunStage::Completed | RunStage::Failed | RunStage::Abandoned => continue,
            };

            match step {
                Ok(Step::Advance(next)) => match record.advance(next) {
                    Ok(()) if next != previous => {
                        tracing::debug!(from = %previous, to = %next, "Stage transition");
                        events
                            .emit(
                                RunEventKind::StageEntered,
                                Some(serde_json::json!({ "from": previous, "stage": next })),
                            )
                            .await;
                    }
                    Ok(()) => {}
                    Err(e) => record.fail(StageFailure::new(owning_stage(previous), e.to_string(), previous)),
                },
                Ok(Step::Suspend) => {
                    tracing::info!(stage = %record.stage, "Signal channel closed; run suspended");
                    events.emit(RunEventKind::RunSuspended, None).await;
                    status.send_replace(RunStatus::from_record(&record));
                    return RunOutcome::Suspended {
                        stage: record.stage,
                    };
                }
                Err(failure) => {
                    tracing::error!(stage = %failure.stage, reason = %failure.reason, "Stage failed");
                    record.fail(failure);
                }
            }

            if let Err(failure) = self.checkpoint(&record) {
                tracing::error!(reason = %failure.reason, "Failed to checkpoint run");
                record.fail(failure);
            }
            status.send_replace(RunStatus::from_record(&record));
        }
    }

    fn on_received(
        &self,
        record: &mut RunRecord,
        commands: &mut mpsc::UnboundedReceiver<RunCommand>,
    ) -> Result<Step, StageFailure> {
        while let Ok(command) = commands.try_recv() {
            match command {
                RunCommand::Answer { index, text } => record.queued_answers.push((index, text)),
                RunCommand::EndSession => {
                    tracing::info!("Session ended before triage");
                    return Ok(Step::Advance(RunStage::Abandoned));
                }
            }
        }

        if record.use_clarifications {
            Ok(Step::Advance(RunStage::Triaging))
        } else {
            tracing::info!("Direct mode: skipping triage and clarification");
            Ok(Step::Advance(RunStage::Enriching))
        }
    }

    async fn on_triaging(
        &self,
        record: &mut RunRecord,
        events: &EventSink,
    ) -> Result<Step, StageFailure> {
        let query = record.request.query.clone();

        let triage = self
            .config
            .retry
            .run("triage", || {
                invoke_as::<TriageOutput>(self.invoker.as_ref(), query.clone())
            })
            .await;

        let decision = match triage {
            Ok(output) => {
                tracing::info!(
                    needs_clarification = output.needs_clarification,
                    confidence = ?output.confidence,
                    reason = %output.reason,
                    "Triage verdict"
                );
                output.decision()
            }
            Err(e @ AgentError::Transient(_)) => {
                return Err(StageFailure::new(StageId::Triage, e.to_string(), RunStage::Triaging))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Triage failed; asking for clarification");
                TriageDecision::NeedsClarification
            }
        };

        if decision == TriageDecision::Direct {
            return Ok(Step::Advance(RunStage::Enriching));
        }

        let questions = self
            .config
            .retry
            .run_when(
                "clarify",
                |e: &AgentError| !matches!(e, AgentError::Model(_)),
                || async {
                    let output: ClarificationsOutput =
                        invoke_as(self.invoker.as_ref(), query.clone()).await?;
                    validate_questions(output.questions)
                },
            )
            .await;

        let questions = match questions {
            Ok(questions) => questions,
            Err(e @ AgentError::Transient(_)) => {
                return Err(StageFailure::new(StageId::Clarify, e.to_string(), RunStage::Triaging))
            }
            Err(e) => {
                tracing::warn!(error = %e, "No usable clarification questions; researching the query as given");
                return Ok(Step::Advance(RunStage::Enriching));
            }
        };

        record
            .clarification
            .add_questions(ClarificationQuestion::from_texts(questions))
            .map_err(|e| StageFailure::new(StageId::Clarify, e.to_string(), RunStage::Triaging))?;

        // Answers known before the questions existed, prior ones first
        let mut early: Vec<(usize, String)> = record
            .request
            .prior_answers
            .iter()
            .map(|(index, text)| (*index, text.clone()))
            .collect();
        early.append(&mut record.queued_answers);
        for (index, text) in early {
            apply_answer(&mut record.clarification, index, text, events).await;
        }

        if record.clarification.is_complete() {
            record.clarification.terminate(ClarificationTermination::AllAnswered);
            return Ok(Step::Advance(RunStage::Enriching));
        }

        tracing::info!(
            questions = record.clarification.questions().len(),
            answered = record.clarification.answered_count(),
            "Awaiting clarification"
        );
        events
            .emit(
                RunEventKind::ClarificationRequested,
                Some(serde_json::json!({ "questions": record.clarification.pending() })),
            )
            .await;

        Ok(Step::Advance(RunStage::AwaitingClarification))
    }

    async fn on_awaiting(
        &self,
        record: &mut RunRecord,
        commands: &mut mpsc::UnboundedReceiver<RunCommand>,
        events: &EventSink,
    ) -> Result<Step, StageFailure> {
        if record.clarification.is_complete() {
            record.clarification.terminate(ClarificationTermination::AllAnswered);
        }
        if record.clarification.is_terminated() {
            return Ok(Step::Advance(RunStage::Enriching));
        }

        // Idle deadline; only a recorded answer starts a fresh one
        let deadline = self
            .config
            .clarification_timeout
            .map(|limit| tokio::time::Instant::now() + limit);

        loop {
            let command = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, commands.recv()).await {
                    Ok(command) => command,
                    Err(_) => {
                        tracing::warn!(
                            answered = record.clarification.answered_count(),
                            "Clarification timed out; continuing with partial answers"
                        );
                        record.clarification.terminate(ClarificationTermination::TimedOut);
                        return Ok(Step::Advance(RunStage::Enriching));
                    }
                },
                None => commands.recv().await,
            };

            match command {
                None => return Ok(Step::Suspend),
                Some(RunCommand::EndSession) => {
                    tracing::info!(
                        answered = record.clarification.answered_count(),
                        "Clarification ended by user"
                    );
                    record.clarification.terminate(ClarificationTermination::AbandonedByUser);
                    return Ok(Step::Advance(RunStage::Enriching));
                }
                Some(RunCommand::Answer { index, text }) => {
                    match apply_answer(&mut record.clarification, index, text, events).await {
                        AnswerOutcome::Recorded { complete: true } => {
                            record.clarification.terminate(ClarificationTermination::AllAnswered);
                            return Ok(Step::Advance(RunStage::Enriching));
                        }
                        AnswerOutcome::Recorded { complete: false } => {
                            return Ok(Step::Advance(RunStage::AwaitingClarification));
                        }
                        AnswerOutcome::UnknownIndex | AnswerOutcome::Terminated => continue,
                    }
                }
            }
        }
    }

    async fn on_enriching(&self, record: &mut RunRecord) -> Result<Step, StageFailure> {
        let query = record.request.query.clone();

        let enriched = if record.clarification.answered_count() == 0 {
            EnrichedQuery::unmodified(&query)
        } else {
            self.enrich(&query, &record.clarification).await?
        };

        tracing::info!(
            answers = enriched.answers.len(),
            instructions_len = enriched.instructions.len(),
            "Query enriched"
        );
        record.enriched = Some(enriched);
        Ok(Step::Advance(RunStage::Forked))
    }

    async fn enrich(
        &self,
        query: &str,
        clarification: &ClarificationCollector,
    ) -> Result<EnrichedQuery, StageFailure> {
        let context = clarified_query(query, &clarification.answered_pairs());

        let result = self
            .config
            .retry
            .run("enrich", || {
                invoke_as::<InstructionOutput>(self.invoker.as_ref(), context.clone())
            })
            .await;

        let instructions = match result {
            Ok(output) if !output.research_instructions.trim().is_empty() => {
                output.research_instructions
            }
            Ok(_) => {
                tracing::warn!("Instruction agent returned nothing; using clarified query");
                context
            }
            Err(e @ AgentError::Transient(_)) => {
                return Err(StageFailure::new(StageId::Enrich, e.to_string(), RunStage::Enriching))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Instruction agent failed; using clarified query");
                context
            }
        };

        Ok(EnrichedQuery {
            original_query: query.to_string(),
            instructions,
            answers: clarification.snapshot(),
        })
    }

    async fn on_forked(
        &self,
        record: &mut RunRecord,
        events: &EventSink,
    ) -> Result<Step, StageFailure> {
        let enriched = record.enriched.clone().ok_or_else(|| {
            StageFailure::new(StageId::Enrich, "run forked without an enriched query", RunStage::Forked)
        })?;
        let store = RunStore::new(&self.db);
        let started = tokio::time::Instant::now();

        let side_task = self.spawn_side_asset(&record.id, &enriched, &store)?;
        for name in [branch::RESEARCH, branch::SIDE_ASSET] {
            events
                .emit(RunEventKind::BranchStarted, Some(serde_json::json!({ "branch": name })))
                .await;
        }

        let checkpoint: ResearchCheckpoint = store
            .load_branch(&record.id, branch::RESEARCH)
            .map_err(|e| store_failure(e, RunStage::Forked))?
            .unwrap_or_default();

        let pipeline = ResearchPipeline::new(
            self.invoker.clone(),
            self.search.clone(),
            &self.config,
            events.clone(),
        );
        let run_id = record.id.clone();
        let mut save = |checkpoint: &ResearchCheckpoint| {
            if let Err(e) = store.save_branch(&run_id, branch::RESEARCH, checkpoint) {
                tracing::warn!(error = %e, "Failed to checkpoint research branch");
            }
        };

        let report = match pipeline.run(&enriched, checkpoint, &mut save).await {
            Ok(report) => report,
            Err(failure) => {
                if let SideTask::Running(handle) = side_task {
                    handle.abort();
                }
                events
                    .emit(
                        RunEventKind::BranchFailed,
                        Some(serde_json::json!({ "branch": branch::RESEARCH, "failure": failure })),
                    )
                    .await;
                return Err(failure);
            }
        };
        events
            .emit(
                RunEventKind::BranchCompleted,
                Some(serde_json::json!({ "branch": branch::RESEARCH })),
            )
            .await;
        record.report = Some(report);

        let asset = match side_task {
            SideTask::Restored(asset) => asset,
            SideTask::Running(mut handle) => {
                let wait = self.config.side_asset_wait;
                let asset = match tokio::time::timeout_at(started + wait, &mut handle).await {
                    Ok(Ok(asset)) => asset,
                    Ok(Err(e)) => SideAsset::failed(AssetFailureKind::Panicked, e.to_string()),
                    Err(_) => {
                        handle.abort();
                        SideAsset::failed(
                            AssetFailureKind::TimedOut,
                            format!("side asset not ready within {}s", wait.as_secs()),
                        )
                    }
                };
                if matches!(
                    asset.failure_kind,
                    Some(AssetFailureKind::Panicked | AssetFailureKind::TimedOut)
                ) {
                    tracing::warn!(error = asset.error.as_deref().unwrap_or(""), "Side asset branch did not finish");
                    if let Err(e) = store.save_branch(&record.id, branch::SIDE_ASSET, &asset) {
                        tracing::warn!(error = %e, "Failed to checkpoint side asset branch");
                    }
                }
                asset
            }
        };

        let kind = if asset.success {
            RunEventKind::BranchCompleted
        } else {
            RunEventKind::BranchFailed
        };
        events
            .emit(
                kind,
                Some(serde_json::json!({ "branch": branch::SIDE_ASSET, "error": asset.error })),
            )
            .await;
        record.side_asset = Some(asset);

        Ok(Step::Advance(RunStage::Joined))
    }

    fn spawn_side_asset(
        &self,
        run_id: &str,
        enriched: &EnrichedQuery,
        store: &RunStore,
    ) -> Result<SideTask, StageFailure> {
        let restored: Option<SideAsset> = store
            .load_branch(run_id, branch::SIDE_ASSET)
            .map_err(|e| store_failure(e, RunStage::Forked))?;
        if let Some(asset) = restored {
            tracing::info!(success = asset.success, "Side asset restored from checkpoint");
            return Ok(SideTask::Restored(asset));
        }

        let side = SideAssetBranch::new(
            self.invoker.clone(),
            self.images.clone(),
            self.artifacts.clone(),
            &self.config,
        );
        let topic = enriched.topic();
        let store = RunStore::new(&self.db);
        let run_id = run_id.to_string();

        let handle = tokio::spawn(
            async move {
                let asset = side.run(&topic).await;
                if let Err(e) = store.save_branch(&run_id, branch::SIDE_ASSET, &asset) {
                    tracing::warn!(error = %e, "Failed to checkpoint side asset branch");
                }
                asset
            }
            .in_current_span(),
        );
        Ok(SideTask::Running(handle))
    }

    async fn on_finalizing(
        &self,
        record: &mut RunRecord,
        events: &EventSink,
    ) -> Result<Step, StageFailure> {
        let report = record.report.clone().ok_or_else(|| {
            StageFailure::new(StageId::Write, "run joined without a report", RunStage::Finalizing)
        })?;

        let finalizer = Finalizer::new(
            self.writer.clone(),
            self.artifacts.clone(),
            self.config.output_root(),
            self.config.retry.clone(),
        );
        let deliverable = finalizer
            .finalize(&record.id, &report, record.side_asset.as_ref())
            .await
            .map_err(|e| StageFailure::new(StageId::Finalize, e.to_string(), RunStage::Finalizing))?;

        if deliverable.status == FinalizationStatus::SideAssetOmitted {
            let reason = deliverable.omission_reason.clone().unwrap_or_default();
            tracing::warn!(reason = %reason, "Deliverable produced without side asset");
            events
                .emit(
                    RunEventKind::SideAssetOmitted,
                    Some(serde_json::json!({ "reason": reason })),
                )
                .await;
        }

        record.deliverable = Some(deliverable);
        Ok(Step::Advance(RunStage::Completed))
    }

    async fn finish(&self, record: &RunRecord, events: &EventSink) -> RunOutcome {
        let outcome = record.outcome().unwrap_or_else(|| {
            RunOutcome::Failed(StageFailure::new(
                StageId::Store,
                "terminal run record is incomplete",
                record.stage,
            ))
        });

        match &outcome {
            RunOutcome::Completed(deliverable) => {
                tracing::info!(
                    path = %deliverable.html_path.display(),
                    status = ?deliverable.status,
                    "Run completed"
                );
                events
                    .emit(
                        RunEventKind::RunCompleted,
                        Some(serde_json::json!({
                            "status": deliverable.status,
                            "markdown_path": deliverable.markdown_path,
                            "html_path": deliverable.html_path,
                            "omission_reason": deliverable.omission_reason,
                        })),
                    )
                    .await;
            }
            RunOutcome::Failed(failure) => {
                tracing::error!(stage = %failure.stage, reason = %failure.reason, "Run failed");
                events
                    .emit(RunEventKind::RunFailed, serde_json::to_value(failure).ok())
                    .await;
            }
            RunOutcome::Abandoned => {
                tracing::info!("Run abandoned");
                events.emit(RunEventKind::RunAbandoned, None).await;
            }
            RunOutcome::Suspended { .. } => {}
        }

        outcome
    }

    fn checkpoint(&self, record: &RunRecord) -> Result<(), StageFailure> {
        RunStore::new(&self.db)
            .save(record)
            .map_err(|e| store_failure(e, record.stage))
    }
}

async fn apply_answer(
    clarification: &mut ClarificationCollector,
    index: usize,
    text: String,
    events: &EventSink,
) -> AnswerOutcome {
    let outcome = clarification.record_answer(index, text);
    match outcome {
        AnswerOutcome::Recorded { complete } => {
            tracing::debug!(index, complete, "Answer recorded");
            events
                .emit(
                    RunEventKind::AnswerRecorded,
                    Some(serde_json::json!({ "index": index, "complete": complete })),
                )
                .await;
        }
        AnswerOutcome::UnknownIndex => {
            tracing::warn!(index, "Answer for unknown question ignored");
            events
                .emit(
                    RunEventKind::AnswerIgnored,
                    Some(serde_json::json!({ "index": index, "reason": "unknown question" })),
                )
                .await;
        }
        AnswerOutcome::Terminated => {
            tracing::debug!(index, "Answer after clarification ended ignored");
            events
                .emit(
                    RunEventKind::AnswerIgnored,
                    Some(serde_json::json!({ "index": index, "reason": "clarification ended" })),
                )
                .await;
        }
    }
    outcome
}

/// Keep at most three non-blank questions; fewer than two is a schema error.
pub fn validate_questions(questions: Vec<String>) -> Result<Vec<String>, AgentError> {
    let mut questions: Vec<String> = questions
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect();
    questions.truncate(MAX_QUESTIONS);

    if questions.len() < MIN_QUESTIONS {
        return Err(AgentError::Schema(format!(
            "clarifier produced {} usable questions, need at least {}",
            questions.len(),
            MIN_QUESTIONS
        )));
    }
    Ok(questions)
}

/// The query with every question and its answer appended
pub fn clarified_query(query: &str, pairs: &[(String, String)]) -> String {
    let mut text = format!("Original query: {}\n\nAdditional context from clarifications:", query);
    for (question, answer) in pairs {
        text.push_str(&format!("\n- {}: {}", question, answer));
    }
    text
}

fn store_failure(err: anyhow::Error, last_checkpoint: RunStage) -> StageFailure {
    StageFailure::new(StageId::Store, format!("{:#}", err), last_checkpoint)
}

fn owning_stage(stage: RunStage) -> StageId {
    match stage {
        RunStage::Received | RunStage::Triaging => StageId::Triage,
        RunStage::AwaitingClarification => StageId::Clarify,
        RunStage::Enriching => StageId::Enrich,
        RunStage::Forked => StageId::Search,
        _ => StageId::Finalize,
    }
}
