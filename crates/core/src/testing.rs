//! In-process fakes for the external collaborators, shared by unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::ImageStyle;
use crate::finalize::{DocumentWriter, FinalizeError};
use crate::skills::{
    AgentError, AgentInvoker, AgentReply, AgentRequest, AgentRole, ClarificationsOutput,
    Confidence, ImageCaptionOutput, InstructionOutput, PlannedSearch, ReportOutput,
    SearchPlanOutput, SearchSummaryOutput, TriageOutput,
};
use crate::tools::{GeneratedImage, ImageError, ImageGenerator, SearchError, WebHit, WebSearch};

pub const SCRIPTED_QUESTIONS: [&str; 3] = [
    "Which destination are you considering?",
    "What is your budget?",
    "When are you planning to travel?",
];

pub const SCRIPTED_INSTRUCTIONS: &str =
    "I want a report on travel tips for my trip, covering the points I specified.";

/// A plan with `n` searches
pub fn plan_output(n: usize) -> AgentReply {
    AgentReply::Planner(SearchPlanOutput {
        searches: (0..n)
            .map(|i| PlannedSearch {
                query: format!("search {}", i),
                reason: format!("covers aspect {}", i),
            })
            .collect(),
    })
}

pub fn report_output(body: &str, summary: &str) -> AgentReply {
    AgentReply::Writer(ReportOutput {
        short_summary: summary.to_string(),
        markdown_report: body.to_string(),
        follow_up_questions: vec!["What changed last year?".to_string()],
    })
}

pub fn triage_output(needs_clarification: bool) -> AgentReply {
    AgentReply::Triage(TriageOutput {
        needs_clarification,
        confidence: Some(Confidence::High),
        reason: "scripted".to_string(),
    })
}

fn default_reply(role: AgentRole) -> AgentReply {
    match role {
        AgentRole::Triage => triage_output(false),
        AgentRole::Clarifier => AgentReply::Clarifier(ClarificationsOutput {
            questions: SCRIPTED_QUESTIONS.iter().map(|q| q.to_string()).collect(),
        }),
        AgentRole::Instruction => AgentReply::Instruction(InstructionOutput {
            research_instructions: SCRIPTED_INSTRUCTIONS.to_string(),
        }),
        AgentRole::Planner => plan_output(6),
        AgentRole::Searcher => AgentReply::Searcher(SearchSummaryOutput {
            summary: "Scripted summary of the search results.".to_string(),
        }),
        AgentRole::Writer => report_output(
            "# Scripted Report\n\nScripted findings.\n\n## Details\n\n| a | b |\n|---|---|\n| 1 | 2 |",
            "Scripted findings.",
        ),
        AgentRole::ImageGen => AgentReply::ImageGen(ImageCaptionOutput {
            success: true,
            image_description: "A scripted illustration of the topic".to_string(),
            notes: String::new(),
            error_message: None,
        }),
    }
}

/// Agent invoker answering from per-role queues, then per-role defaults
#[derive(Default)]
pub struct ScriptedInvoker {
    queued: Mutex<HashMap<AgentRole, VecDeque<Result<AgentReply, AgentError>>>>,
    defaults: Mutex<HashMap<AgentRole, Result<AgentReply, AgentError>>>,
    calls: Mutex<Vec<AgentRequest>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot reply for the reply's role
    pub fn push_reply(&self, reply: AgentReply) {
        self.push(reply.role(), Ok(reply));
    }

    pub fn push_error(&self, role: AgentRole, error: AgentError) {
        self.push(role, Err(error));
    }

    /// Replace the reply used once the role's queue is empty
    pub fn set_default(&self, reply: AgentReply) {
        self.defaults.lock().unwrap().insert(reply.role(), Ok(reply));
    }

    pub fn set_default_error(&self, role: AgentRole, error: AgentError) {
        self.defaults.lock().unwrap().insert(role, Err(error));
    }

    pub fn calls_for(&self, role: AgentRole) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.role == role).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn prompts_for(&self, role: AgentRole) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.role == role)
            .map(|c| c.prompt.clone())
            .collect()
    }

    fn push(&self, role: AgentRole, entry: Result<AgentReply, AgentError>) {
        self.queued
            .lock()
            .unwrap()
            .entry(role)
            .or_default()
            .push_back(entry);
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentReply, AgentError> {
        let role = request.role;
        self.calls.lock().unwrap().push(request);

        if let Some(entry) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&role)
            .and_then(|queue| queue.pop_front())
        {
            return entry;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(&role)
            .cloned()
            .unwrap_or_else(|| Ok(default_reply(role)))
    }
}

/// Web search returning canned hits, with per-query failures
#[derive(Default)]
pub struct FakeSearch {
    failing: HashSet<String>,
    empty: HashSet<String>,
    always_fail: bool,
    delay: Option<Duration>,
    queries: Mutex<Vec<String>>,
}

impl FakeSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, query: &str) -> Self {
        self.failing.insert(query.to_string());
        self
    }

    pub fn empty(mut self, query: &str) -> Self {
        self.empty.insert(query.to_string());
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Delay every search call by `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebSearch for FakeSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<WebHit>, SearchError> {
        self.queries.lock().unwrap().push(query.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.always_fail || self.failing.contains(query) {
            return Err(SearchError::Failed(format!("no backend answered for '{}'", query)));
        }
        if self.empty.contains(query) {
            return Ok(Vec::new());
        }

        let slug = query.replace(' ', "-");
        Ok((0..max_results.min(2))
            .map(|i| WebHit {
                title: format!("{} result {}", query, i),
                url: format!("https://example.com/{}/{}", slug, i),
                snippet: format!("Snippet {} about {}", i, query),
            })
            .collect())
    }
}

pub const PNG_BYTES: [u8; 12] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 1, 2, 3, 4];

/// Image generator with a fixed outcome
pub struct FakeImages {
    result: Result<GeneratedImage, ImageError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeImages {
    pub fn succeeding() -> Self {
        Self {
            result: Ok(GeneratedImage {
                bytes: PNG_BYTES.to_vec(),
                mime_type: "image/png".to_string(),
            }),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: ImageError) -> Self {
        Self {
            result: Err(error),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageGenerator for FakeImages {
    async fn generate(&self, _prompt: &str, _style: &ImageStyle) -> Result<GeneratedImage, ImageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone()
    }
}

/// Document writer keeping everything in memory
#[derive(Default)]
pub struct MemoryDocumentWriter {
    documents: Mutex<HashMap<PathBuf, Vec<u8>>>,
    failures_left: AtomicUsize,
}

impl MemoryDocumentWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes with an I/O error
    pub fn failing_times(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn get(&self, path: &Path) -> Option<Vec<u8>> {
        self.documents.lock().unwrap().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.documents.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl DocumentWriter for MemoryDocumentWriter {
    async fn write_document(&self, path: &Path, content: &[u8]) -> Result<(), FinalizeError> {
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(FinalizeError::Io("disk full".to_string()));
        }
        self.documents
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), content.to_vec());
        Ok(())
    }
}
