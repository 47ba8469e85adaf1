//! # Research Pipeline
//!
//! Plan -> search fan-out -> write, producing a `ReportArtifact` from an
//! `EnrichedQuery`.
//!
//! ```text
//! plan ──► [item 0] ─┐
//!          [item 1] ─┼─► results (by plan index) ──► write
//!          [item n] ─┘
//! ```
//!
//! Each fan-out item ends as a tagged `SearchResult`; a failed item never
//! aborts its siblings. Progress is reported through a checkpoint callback
//! so a resumed run skips work that already finished.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::artifacts::{EnrichedQuery, ReportArtifact, SearchPlanItem, SearchResult};
use crate::config::EngineConfig;
use crate::orchestration::events::{EventSink, RunEventKind};
use crate::orchestration::retry::RetryPolicy;
use crate::orchestration::stage::{RunStage, StageFailure, StageId};
use crate::skills::{invoke_as, AgentError, AgentInvoker, ReportOutput, SearchPlanOutput, SearchSummaryOutput};
use crate::tools::{WebHit, WebSearch};

/// Web hits requested per plan item
const HITS_PER_SEARCH: usize = 5;

/// Durable progress of the research branch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchCheckpoint {
    #[serde(default)]
    pub plan: Option<Vec<SearchPlanItem>>,
    /// Finished items, in completion order
    #[serde(default)]
    pub results: Vec<SearchResult>,
    #[serde(default)]
    pub report: Option<ReportArtifact>,
}

pub struct ResearchPipeline {
    invoker: Arc<dyn AgentInvoker>,
    search: Arc<dyn WebSearch>,
    retry: RetryPolicy,
    plan_min_items: usize,
    plan_max_items: usize,
    summary_max_words: usize,
    max_concurrent: usize,
    events: EventSink,
}

impl ResearchPipeline {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        search: Arc<dyn WebSearch>,
        config: &EngineConfig,
        events: EventSink,
    ) -> Self {
        Self {
            invoker,
            search,
            retry: config.retry.clone(),
            plan_min_items: config.plan_min_items,
            plan_max_items: config.plan_max_items.max(config.plan_min_items),
            summary_max_words: config.summary_max_words,
            max_concurrent: config.max_concurrent_searches.max(1),
            events,
        }
    }

    /// Run the remaining stages, starting from `checkpoint`.
    pub async fn run(
        &self,
        enriched: &EnrichedQuery,
        mut checkpoint: ResearchCheckpoint,
        on_checkpoint: &mut (dyn FnMut(&ResearchCheckpoint) + Send),
    ) -> Result<ReportArtifact, StageFailure> {
        if let Some(report) = &checkpoint.report {
            tracing::info!("Research report restored from checkpoint");
            return Ok(report.clone());
        }

        let plan = match checkpoint.plan.clone() {
            Some(plan) => plan,
            None => {
                let plan = self.plan(enriched).await?;
                checkpoint.plan = Some(plan.clone());
                on_checkpoint(&checkpoint);
                plan
            }
        };

        let results = self
            .search_all(&plan, &mut checkpoint, on_checkpoint)
            .await?;

        let report = self.write(enriched, &results).await?;
        checkpoint.report = Some(report.clone());
        on_checkpoint(&checkpoint);

        Ok(report)
    }

    /// Produce a validated search plan
    pub async fn plan(&self, enriched: &EnrichedQuery) -> Result<Vec<SearchPlanItem>, StageFailure> {
        let prompt = format!(
            "Research instructions:\n{}\n\nReturn between {} and {} searches.",
            enriched.instructions, self.plan_min_items, self.plan_max_items
        );

        let plan = self
            .retry
            .run_when(
                "plan",
                |e: &AgentError| !matches!(e, AgentError::Model(_)),
                || async {
                    let output: SearchPlanOutput =
                        invoke_as(self.invoker.as_ref(), prompt.clone()).await?;
                    validate_plan(output.into_items(), self.plan_min_items, self.plan_max_items)
                },
            )
            .await
            .map_err(|e| StageFailure::new(StageId::Plan, e.to_string(), RunStage::Forked))?;

        tracing::info!(items = plan.len(), "Search plan ready");
        Ok(plan)
    }

    /// Execute every plan item not already in the checkpoint
    pub async fn search_all(
        &self,
        plan: &[SearchPlanItem],
        checkpoint: &mut ResearchCheckpoint,
        on_checkpoint: &mut (dyn FnMut(&ResearchCheckpoint) + Send),
    ) -> Result<Vec<SearchResult>, StageFailure> {
        let done: HashSet<usize> = checkpoint.results.iter().map(|r| r.item_index).collect();
        let pending: Vec<(usize, &SearchPlanItem)> = plan
            .iter()
            .enumerate()
            .filter(|(index, _)| !done.contains(index))
            .collect();

        if !done.is_empty() {
            tracing::info!(restored = done.len(), pending = pending.len(), "Resuming search fan-out");
        }

        let searches: Vec<_> = pending
            .into_iter()
            .map(|(index, item)| self.search_one(index, item))
            .collect();
        let mut in_flight = stream::iter(searches).buffer_unordered(self.max_concurrent);

        while let Some(result) = in_flight.next().await {
            self.events
                .emit(
                    RunEventKind::SearchItemFinished,
                    Some(serde_json::json!({
                        "item": result.item_index,
                        "query": result.query,
                        "success": result.success,
                    })),
                )
                .await;
            checkpoint.results.push(result);
            on_checkpoint(checkpoint);
        }

        let mut results = checkpoint.results.clone();
        results.sort_by_key(|r| r.item_index);
        results.dedup_by_key(|r| r.item_index);

        let succeeded = results.iter().filter(|r| r.success).count();
        tracing::info!(succeeded, failed = results.len() - succeeded, "Search fan-out finished");

        if succeeded == 0 {
            return Err(StageFailure::new(
                StageId::Search,
                format!("all {} searches failed", results.len()),
                RunStage::Forked,
            ));
        }
        Ok(results)
    }

    async fn search_one(&self, index: usize, item: &SearchPlanItem) -> SearchResult {
        let hits = self
            .retry
            .run("search", || self.search.search(&item.query, HITS_PER_SEARCH))
            .await;

        let hits = match hits {
            Ok(hits) if !hits.is_empty() => hits,
            Ok(_) => {
                tracing::warn!(item = index, query = %item.query, "Search returned no results");
                return SearchResult::failed(index, &item.query, "no web results");
            }
            Err(e) => {
                tracing::warn!(item = index, query = %item.query, error = %e, "Search failed");
                return SearchResult::failed(index, &item.query, e.to_string());
            }
        };

        let prompt = render_search_prompt(item, &hits, self.summary_max_words);
        let summary = self
            .retry
            .run("summarize", || {
                invoke_as::<SearchSummaryOutput>(self.invoker.as_ref(), prompt.clone())
            })
            .await;

        match summary {
            Ok(output) => {
                let summary = bound_words(&output.summary, self.summary_max_words);
                if summary.is_empty() {
                    tracing::warn!(item = index, "Searcher returned an empty summary");
                    return SearchResult::failed(index, &item.query, "empty summary");
                }
                let sources = hits.into_iter().map(|h| h.url).filter(|u| !u.is_empty()).collect();
                SearchResult::succeeded(index, &item.query, summary, sources)
            }
            Err(e) => {
                tracing::warn!(item = index, error = %e, "Summarizing search results failed");
                SearchResult::failed(index, &item.query, e.to_string())
            }
        }
    }

    /// Write the report from every result, failed ones included
    pub async fn write(
        &self,
        enriched: &EnrichedQuery,
        results: &[SearchResult],
    ) -> Result<ReportArtifact, StageFailure> {
        let prompt = render_writer_prompt(enriched, results);

        let output: ReportOutput = self
            .retry
            .run_when(
                "write",
                |e: &AgentError| !matches!(e, AgentError::Model(_)),
                || invoke_as::<ReportOutput>(self.invoker.as_ref(), prompt.clone()),
            )
            .await
            .map_err(|e| StageFailure::new(StageId::Write, e.to_string(), RunStage::Forked))?;

        let mut report: ReportArtifact = output.into();
        if report.markdown_report.trim().is_empty() {
            return Err(StageFailure::new(
                StageId::Write,
                "writer returned an empty report body",
                RunStage::Forked,
            ));
        }
        if report.short_summary.trim().is_empty() {
            report.short_summary = lead_paragraph(&report.markdown_report);
        }

        tracing::info!(
            words = report.markdown_report.split_whitespace().count(),
            "Report written"
        );
        Ok(report)
    }
}

/// Drop blank items and cap the plan; fewer than `min` usable items is a schema error.
pub fn validate_plan(
    items: Vec<SearchPlanItem>,
    min: usize,
    max: usize,
) -> Result<Vec<SearchPlanItem>, AgentError> {
    let mut items: Vec<SearchPlanItem> = items
        .into_iter()
        .filter(|item| !item.query.trim().is_empty())
        .collect();

    if items.len() > max {
        tracing::debug!(returned = items.len(), max, "Truncating search plan");
        items.truncate(max);
    }
    if items.len() < min {
        return Err(AgentError::Schema(format!(
            "plan has {} usable searches, need at least {}",
            items.len(),
            min
        )));
    }
    Ok(items)
}

/// Keep at most `max_words` words
pub fn bound_words(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_search_prompt(item: &SearchPlanItem, hits: &[WebHit], max_words: usize) -> String {
    let mut prompt = format!(
        "Search term: {}\nReason for searching: {}\nSummarize in under {} words.\n\nResults:\n",
        item.query, item.reason, max_words
    );
    for (i, hit) in hits.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] {}\n{}\n{}\n\n",
            i + 1,
            hit.title,
            hit.url,
            hit.snippet
        ));
    }
    prompt
}

fn render_writer_prompt(enriched: &EnrichedQuery, results: &[SearchResult]) -> String {
    let mut prompt = format!(
        "Original query: {}\n\nResearch instructions:\n{}\n\nSearch results:\n",
        enriched.original_query, enriched.instructions
    );
    for result in results {
        if result.success {
            prompt.push_str(&format!(
                "\n## {} (search {})\n{}\nSources: {}\n",
                result.query,
                result.item_index + 1,
                result.summary,
                result.sources.join(", ")
            ));
        } else {
            prompt.push_str(&format!(
                "\n## {} (search {}) FAILED: {}\n",
                result.query,
                result.item_index + 1,
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }
    prompt
}

fn lead_paragraph(markdown: &str) -> String {
    let paragraph = markdown
        .split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty() && !p.starts_with('#'))
        .unwrap_or_else(|| markdown.trim());
    bound_words(paragraph, 60)
}
