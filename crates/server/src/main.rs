//! Dossier Server
//!
//! Axum server and CLI around the research coordinator. The HTTP API is the
//! external signal surface: start runs, deliver clarification answers, end
//! sessions, read status and stream run events.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use dossier_core::artifacts::ResearchRequest;
use dossier_core::config::{EngineConfig, PersistedConfig};
use dossier_core::orchestration::{
    Coordinator, RunEvent, RunEventKind, RunHandle, RunOutcome, RunStage, RunStatus, SignalError,
};
use dossier_core::state::io::{ensure_runtime_dir, get_runtime_path};
use dossier_core::state::ResearchDb;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, RwLock},
};
use utoipa::{OpenApi, ToSchema};

/// Application state
struct AppState {
    coordinator: Arc<Coordinator>,
    /// Handles of runs driven by this process
    handles: RwLock<HashMap<String, RunHandle>>,
    event_tx: broadcast::Sender<RunEvent>,
}

type SharedState = Arc<AppState>;

#[derive(Parser, Clone)]
#[command(author, version, about = "Dossier - interactive research orchestration")]
struct Args {
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Start the HTTP server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
    /// Research a query from the terminal
    Run {
        /// The research query
        query: String,
        /// Skip triage and clarification
        #[arg(long)]
        direct: bool,
    },
    /// Continue a stored run from its last checkpoint
    Resume { run_id: String },
    /// Show the status of a stored run
    Status { run_id: String },
    /// List stored runs
    Runs,
}

// === API Types ===

#[derive(Serialize, ToSchema)]
struct ApiResponse {
    success: bool,
    message: String,
}

#[derive(Deserialize, ToSchema)]
struct StartRunRequest {
    query: String,
    /// Defaults to the configured mode
    use_clarifications: Option<bool>,
    /// Answers known up front (question index -> answer)
    #[serde(default)]
    prior_answers: BTreeMap<usize, String>,
}

#[derive(Serialize, ToSchema)]
struct StartRunResponse {
    run_id: String,
}

#[derive(Deserialize, ToSchema)]
struct AnswerRequest {
    index: Option<usize>,
    answer: Option<String>,
    /// Several answers at once (question index -> answer)
    #[serde(default)]
    answers: BTreeMap<usize, String>,
}

#[derive(Serialize, ToSchema)]
struct QuestionResponse {
    index: usize,
    text: String,
    answered: bool,
}

#[derive(Serialize, ToSchema)]
struct FailureResponse {
    stage: String,
    reason: String,
    last_checkpoint: String,
}

#[derive(Serialize, ToSchema)]
struct RunStatusResponse {
    run_id: String,
    stage: String,
    pending_questions: Vec<QuestionResponse>,
    markdown_path: Option<String>,
    html_path: Option<String>,
    side_asset_included: Option<bool>,
    omission_reason: Option<String>,
    failure: Option<FailureResponse>,
}

impl From<RunStatus> for RunStatusResponse {
    fn from(status: RunStatus) -> Self {
        let deliverable = status.deliverable.as_ref();
        Self {
            run_id: status.run_id.clone(),
            stage: status.stage.to_string(),
            pending_questions: status
                .pending_questions
                .iter()
                .map(|q| QuestionResponse {
                    index: q.index,
                    text: q.text.clone(),
                    answered: q.answered,
                })
                .collect(),
            markdown_path: deliverable.map(|d| d.markdown_path.display().to_string()),
            html_path: deliverable.map(|d| d.html_path.display().to_string()),
            side_asset_included: deliverable.map(|d| d.omission_reason.is_none()),
            omission_reason: deliverable.and_then(|d| d.omission_reason.clone()),
            failure: status.failure.map(|f| FailureResponse {
                stage: f.stage.to_string(),
                reason: f.reason,
                last_checkpoint: f.last_checkpoint.to_string(),
            }),
        }
    }
}

#[derive(Serialize, ToSchema)]
struct RunSummaryResponse {
    id: String,
    stage: String,
    query: String,
    created_at: String,
    updated_at: String,
}

#[derive(Serialize)]
struct ConfigResponse {
    /// Persisted overlay as stored on disk
    config: PersistedConfig,
    /// Effective configuration of this process
    effective: EngineConfig,
}

// === OpenAPI Definition ===

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Dossier API",
        version = "1.0.0",
        description = "Interactive research runs: clarification, parallel research, report delivery"
    ),
    paths(
        start_run,
        list_runs,
        get_run,
        answer_run,
        end_run,
        get_report,
        get_config,
        update_config
    ),
    components(
        schemas(
            ApiResponse,
            StartRunRequest,
            StartRunResponse,
            AnswerRequest,
            QuestionResponse,
            FailureResponse,
            RunStatusResponse,
            RunSummaryResponse
        )
    ),
    tags(
        (name = "runs", description = "Research run lifecycle and signals"),
        (name = "config", description = "Configuration management")
    )
)]
struct ApiDoc;

type ApiError = (StatusCode, Json<ApiResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ApiResponse {
            success: false,
            message: message.into(),
        }),
    )
}

fn signal_error(err: SignalError) -> ApiError {
    let status = match err {
        SignalError::UnknownRun(_) => StatusCode::NOT_FOUND,
        SignalError::EmptyAnswer(_) => StatusCode::BAD_REQUEST,
        SignalError::NotAwaiting(_) | SignalError::Terminal(_) => StatusCode::CONFLICT,
        SignalError::ChannelClosed => StatusCode::SERVICE_UNAVAILABLE,
    };
    api_error(status, err.to_string())
}

fn internal_error(err: anyhow::Error) -> ApiError {
    tracing::error!(error = %format!("{:#}", err), "Request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err))
}

/// Register a live run and drop its handle once the run stops
async fn track(state: &SharedState, handle: RunHandle, task: JoinHandle<RunOutcome>) {
    let run_id = handle.run_id().to_string();
    state.handles.write().await.insert(run_id.clone(), handle);

    let state = state.clone();
    tokio::spawn(async move {
        match task.await {
            Ok(outcome) => tracing::info!(run_id = %run_id, stage = %outcome.stage(), "Run stopped"),
            Err(e) => tracing::error!(run_id = %run_id, error = %e, "Run task aborted"),
        }
        state.handles.write().await.remove(&run_id);
    });
}

/// Handle of a live run, or the reason none exists
async fn live_handle(state: &SharedState, run_id: &str) -> Result<RunHandle, ApiError> {
    if let Some(handle) = state.handles.read().await.get(run_id) {
        return Ok(handle.clone());
    }
    match state.coordinator.status(run_id).map_err(internal_error)? {
        None => Err(signal_error(SignalError::UnknownRun(run_id.to_string()))),
        Some(status) if status.stage.is_terminal() => {
            Err(signal_error(SignalError::Terminal(status.stage)))
        }
        Some(_) => Err(signal_error(SignalError::ChannelClosed)),
    }
}

// === API Handlers ===

/// Start a research run
#[utoipa::path(
    post,
    path = "/api/v1/runs",
    tag = "runs",
    request_body = StartRunRequest,
    responses(
        (status = 200, description = "Run started", body = StartRunResponse),
        (status = 400, description = "Empty query", body = ApiResponse)
    )
)]
async fn start_run(
    State(state): State<SharedState>,
    Json(req): Json<StartRunRequest>,
) -> Result<Json<StartRunResponse>, ApiError> {
    if req.query.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "query must not be empty"));
    }

    let use_clarifications = req
        .use_clarifications
        .unwrap_or(state.coordinator.config().use_clarifications);
    let mut request = ResearchRequest::new(req.query);
    request.prior_answers = req.prior_answers;

    let (handle, task) = state
        .coordinator
        .start(request, use_clarifications)
        .map_err(internal_error)?;
    let run_id = handle.run_id().to_string();
    track(&state, handle, task).await;

    Ok(Json(StartRunResponse { run_id }))
}

/// List stored runs, newest first
#[utoipa::path(
    get,
    path = "/api/v1/runs",
    tag = "runs",
    responses(
        (status = 200, description = "Run summaries", body = Vec<RunSummaryResponse>)
    )
)]
async fn list_runs(
    State(state): State<SharedState>,
) -> Result<Json<Vec<RunSummaryResponse>>, ApiError> {
    let runs = state.coordinator.list_runs().map_err(internal_error)?;
    Ok(Json(
        runs.into_iter()
            .map(|r| RunSummaryResponse {
                id: r.id,
                stage: r.stage.to_string(),
                query: r.query,
                created_at: r.created_at.to_rfc3339(),
                updated_at: r.updated_at.to_rfc3339(),
            })
            .collect(),
    ))
}

/// Status of a run
#[utoipa::path(
    get,
    path = "/api/v1/runs/{id}",
    tag = "runs",
    params(("id" = String, Path, description = "Run id")),
    responses(
        (status = 200, description = "Run status", body = RunStatusResponse),
        (status = 404, description = "No such run", body = ApiResponse)
    )
)]
async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<RunStatusResponse>, ApiError> {
    if let Some(handle) = state.handles.read().await.get(&id) {
        return Ok(Json(handle.status().into()));
    }
    match state.coordinator.status(&id).map_err(internal_error)? {
        Some(status) => Ok(Json(status.into())),
        None => Err(signal_error(SignalError::UnknownRun(id))),
    }
}

/// Deliver one or several clarification answers
#[utoipa::path(
    post,
    path = "/api/v1/runs/{id}/answers",
    tag = "runs",
    params(("id" = String, Path, description = "Run id")),
    request_body = AnswerRequest,
    responses(
        (status = 200, description = "Answers queued", body = ApiResponse),
        (status = 400, description = "Empty answer", body = ApiResponse),
        (status = 409, description = "Run is not collecting answers", body = ApiResponse)
    )
)]
async fn answer_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<ApiResponse>, ApiError> {
    let handle = live_handle(&state, &id).await?;

    let count = if !req.answers.is_empty() {
        handle.deliver_answers(req.answers).map_err(signal_error)?
    } else {
        match (req.index, req.answer) {
            (Some(index), Some(answer)) => {
                handle.deliver_answer(index, answer).map_err(signal_error)?;
                1
            }
            _ => {
                return Err(api_error(
                    StatusCode::BAD_REQUEST,
                    "expected `index` and `answer`, or a non-empty `answers` map",
                ))
            }
        }
    };

    Ok(Json(ApiResponse {
        success: true,
        message: format!("{} answer(s) queued", count),
    }))
}

/// End the clarification session with the answers given so far
#[utoipa::path(
    post,
    path = "/api/v1/runs/{id}/end",
    tag = "runs",
    params(("id" = String, Path, description = "Run id")),
    responses(
        (status = 200, description = "Session ended", body = ApiResponse),
        (status = 409, description = "Run is not collecting answers", body = ApiResponse)
    )
)]
async fn end_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse>, ApiError> {
    let handle = live_handle(&state, &id).await?;
    handle.end_session().map_err(signal_error)?;
    Ok(Json(ApiResponse {
        success: true,
        message: "Clarification session ended".to_string(),
    }))
}

/// Markdown report of a completed run
#[utoipa::path(
    get,
    path = "/api/v1/runs/{id}/report",
    tag = "runs",
    params(("id" = String, Path, description = "Run id")),
    responses(
        (status = 200, description = "Markdown report", content_type = "text/markdown", body = String),
        (status = 409, description = "Run has not completed", body = ApiResponse)
    )
)]
async fn get_report(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let status = state
        .coordinator
        .status(&id)
        .map_err(internal_error)?
        .ok_or_else(|| signal_error(SignalError::UnknownRun(id.clone())))?;

    let deliverable = status.deliverable.ok_or_else(|| {
        api_error(
            StatusCode::CONFLICT,
            format!("run {} has no report (stage: {})", id, status.stage),
        )
    })?;

    let markdown = tokio::fs::read_to_string(&deliverable.markdown_path)
        .await
        .unwrap_or(deliverable.report.markdown_report);

    Ok(([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], markdown).into_response())
}

/// SSE endpoint for run events with heartbeat
async fn events(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();

    let stream = stream::unfold(rx, |mut rx| async move {
        let next = tokio::time::timeout(std::time::Duration::from_secs(15), rx.recv()).await;

        match next {
            Ok(Ok(event)) => {
                let json = serde_json::to_string(&event).unwrap_or_default();
                Some((Ok(Event::default().data(json)), rx))
            }
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => Some((
                Ok(Event::default().comment(format!("lagged {}", skipped))),
                rx,
            )),
            Ok(Err(broadcast::error::RecvError::Closed)) => None,
            Err(_) => Some((Ok(Event::default().comment("heartbeat")), rx)),
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Get current configuration
#[utoipa::path(
    get,
    path = "/api/v1/config",
    tag = "config",
    responses(
        (status = 200, description = "Persisted overlay and effective configuration")
    )
)]
async fn get_config(State(state): State<SharedState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        config: PersistedConfig::load().await,
        effective: state.coordinator.config().clone(),
    })
}

/// Update configuration (partial merge, applied on next start)
#[utoipa::path(
    patch,
    path = "/api/v1/config",
    tag = "config",
    request_body = Object,
    responses(
        (status = 200, description = "Updated configuration"),
        (status = 500, description = "Config could not be saved", body = ApiResponse)
    )
)]
async fn update_config(
    State(state): State<SharedState>,
    Json(updates): Json<PersistedConfig>,
) -> Result<Json<ConfigResponse>, ApiError> {
    let mut config = PersistedConfig::load().await;
    config.merge(updates);
    config.save().await.map_err(internal_error)?;

    Ok(Json(ConfigResponse {
        config,
        effective: state.coordinator.config().clone(),
    }))
}

async fn serve_openapi() -> impl IntoResponse {
    let doc = ApiDoc::openapi().to_json().unwrap_or_default();
    ([(header::CONTENT_TYPE, "application/json")], doc)
}

// === Entry ===

async fn build_coordinator(event_tx: Option<mpsc::Sender<RunEvent>>) -> anyhow::Result<Arc<Coordinator>> {
    ensure_runtime_dir().await?;
    let config = EngineConfig::load().await;
    let db = Arc::new(ResearchDb::open()?);

    let mut coordinator = Coordinator::new(config, db);
    if let Some(tx) = event_tx {
        coordinator = coordinator.with_event_channel(tx);
    }
    Ok(Arc::new(coordinator))
}

pub async fn run_server(port: u16) -> anyhow::Result<()> {
    let (event_tx, _) = broadcast::channel::<RunEvent>(256);
    let (run_tx, mut run_rx) = mpsc::channel::<RunEvent>(256);

    let fanout = event_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = run_rx.recv().await {
            let _ = fanout.send(event);
        }
    });

    let coordinator = build_coordinator(Some(run_tx)).await?;
    let state: SharedState = Arc::new(AppState {
        coordinator,
        handles: RwLock::new(HashMap::new()),
        event_tx,
    });

    let resumable = state.coordinator.resumable_runs()?;
    for run_id in &resumable {
        match state.coordinator.resume(run_id) {
            Ok((handle, task)) => track(&state, handle, task).await,
            Err(e) => tracing::error!(run_id = %run_id, error = %format!("{:#}", e), "Failed to resume run"),
        }
    }
    if !resumable.is_empty() {
        println!("♻️  Resumed {} unfinished run(s)", resumable.len());
    }

    let run_routes = Router::new()
        .route("/", get(list_runs).post(start_run))
        .route("/:id", get(get_run))
        .route("/:id/answers", post(answer_run))
        .route("/:id/end", post(end_run))
        .route("/:id/report", get(get_report));

    let app = Router::new()
        .nest("/api/v1/runs", run_routes)
        .route("/api/v1/events", get(events))
        .route("/api/v1/config", get(get_config).patch(update_config))
        .route("/api/v1/openapi.json", get(serve_openapi))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    println!("🚀 Dossier Server running at http://{}", addr);
    println!("   API v1 Routes:");
    println!("   Runs:    /api/v1/runs, /:id, /:id/answers, /:id/end, /:id/report");
    println!("   Events:  /api/v1/events (SSE)");
    println!("   Config:  /api/v1/config (GET, PATCH)");
    println!("   Runtime: {}", get_runtime_path().display());

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Print stage transitions of CLI runs
fn spawn_progress_printer(mut rx: mpsc::Receiver<RunEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event.kind {
                RunEventKind::StageEntered => {
                    let stage = event
                        .data
                        .as_ref()
                        .and_then(|d| d.get("stage"))
                        .and_then(|s| s.as_str())
                        .unwrap_or("?");
                    println!("   → {}", stage);
                }
                RunEventKind::SearchItemFinished => {
                    let data = event.data.unwrap_or_default();
                    let ok = data.get("success").and_then(|s| s.as_bool()).unwrap_or(false);
                    let query = data.get("query").and_then(|q| q.as_str()).unwrap_or("");
                    println!("     {} {}", if ok { "✓" } else { "✗" }, query);
                }
                RunEventKind::SideAssetOmitted => println!("   ⚠️  Continuing without image"),
                _ => {}
            }
        }
    });
}

/// Answer pending questions from stdin, then wait for the outcome
async fn follow_run(handle: RunHandle, task: JoinHandle<RunOutcome>) -> anyhow::Result<()> {
    let status = handle
        .wait_until(|s| {
            !matches!(s.stage, RunStage::Received | RunStage::Triaging)
        })
        .await;

    if status.stage == RunStage::AwaitingClarification {
        println!("\n❓ A few questions to focus the research (empty line to skip the rest):");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        for question in status.pending_questions.iter().filter(|q| !q.answered) {
            println!("\n{}. {}", question.index + 1, question.text);
            let line = lines.next_line().await?.unwrap_or_default();
            if line.trim().is_empty() {
                if let Err(e) = handle.end_session() {
                    tracing::debug!(error = %e, "End session not delivered");
                }
                break;
            }
            if let Err(e) = handle.deliver_answer(question.index, line) {
                eprintln!("⚠️  {}", e);
                break;
            }
        }
        println!();
    }

    match task.await? {
        RunOutcome::Completed(deliverable) => {
            println!("\n✅ Report ready");
            println!("   Markdown: {}", deliverable.markdown_path.display());
            println!("   HTML:     {}", deliverable.html_path.display());
            if let Some(reason) = &deliverable.omission_reason {
                println!("   Image omitted: {}", reason);
            }
            println!("\n{}", deliverable.report.short_summary);
            Ok(())
        }
        RunOutcome::Failed(failure) => {
            anyhow::bail!("run failed at {}: {}", failure.stage, failure.reason)
        }
        RunOutcome::Abandoned => {
            println!("🛑 Run abandoned");
            Ok(())
        }
        RunOutcome::Suspended { stage } => {
            println!(
                "⏸  Run suspended at {}; continue with `dossier resume {}`",
                stage,
                handle.run_id()
            );
            Ok(())
        }
    }
}

fn print_status(status: &RunStatus) {
    println!("Run:   {}", status.run_id);
    println!("Stage: {}", status.stage);
    for q in &status.pending_questions {
        println!("  [{}] {}. {}", if q.answered { "x" } else { " " }, q.index + 1, q.text);
    }
    if let Some(d) = &status.deliverable {
        println!("Report: {}", d.html_path.display());
        if let Some(reason) = &d.omission_reason {
            println!("Image omitted: {}", reason);
        }
    }
    if let Some(f) = &status.failure {
        println!("Failed at {}: {}", f.stage, f.reason);
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("dossier=info,dossier_core=info"))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keys in the runtime dir win over the working directory's .env
    let _ = dotenvy::from_path(get_runtime_path().join(".env"));
    let _ = dotenvy::dotenv();
    init_tracing();

    let args = Args::parse();

    match args.command.unwrap_or(CliCommand::Serve { port: 8080 }) {
        CliCommand::Serve { port } => run_server(port).await,
        CliCommand::Run { query, direct } => {
            let (tx, rx) = mpsc::channel(256);
            spawn_progress_printer(rx);
            let coordinator = build_coordinator(Some(tx)).await?;

            let (handle, task) = coordinator.start(ResearchRequest::new(query), !direct)?;
            println!("🔎 Run {}", handle.run_id());
            follow_run(handle, task).await
        }
        CliCommand::Resume { run_id } => {
            let (tx, rx) = mpsc::channel(256);
            spawn_progress_printer(rx);
            let coordinator = build_coordinator(Some(tx)).await?;

            let (handle, task) = coordinator.resume(&run_id)?;
            println!("♻️  Resuming run {} at {}", run_id, handle.status().stage);
            follow_run(handle, task).await
        }
        CliCommand::Status { run_id } => {
            let coordinator = build_coordinator(None).await?;
            match coordinator.status(&run_id)? {
                Some(status) => print_status(&status),
                None => eprintln!("❌ No such run: {}", run_id),
            }
            Ok(())
        }
        CliCommand::Runs => {
            let coordinator = build_coordinator(None).await?;
            for run in coordinator.list_runs()? {
                println!(
                    "{}  {:<22}  {}  {}",
                    run.id,
                    run.stage,
                    run.updated_at.format("%Y-%m-%d %H:%M"),
                    run.query.chars().take(60).collect::<String>()
                );
            }
            Ok(())
        }
    }
}
