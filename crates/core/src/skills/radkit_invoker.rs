//! # Radkit Invoker
//!
//! `AgentInvoker` backed by radkit `LlmFunction`s, one model config per role.

use async_trait::async_trait;
use std::collections::HashMap;

use super::invoker::{AgentError, AgentInvoker, AgentReply, AgentRequest, AgentRole};
use super::outputs::{
    ClarificationsOutput, ImageCaptionOutput, InstructionOutput, ReportOutput, SearchPlanOutput,
    SearchSummaryOutput, TriageOutput,
};
use super::prompts;
use crate::config::EngineConfig;
use crate::models::ModelConfig;
use crate::run_llm_function;

/// Calls the configured LLM provider for every role
pub struct RadkitInvoker {
    models: HashMap<AgentRole, ModelConfig>,
}

impl RadkitInvoker {
    pub fn from_config(config: &EngineConfig) -> Self {
        let models = AgentRole::all()
            .into_iter()
            .map(|role| (role, config.model_for(role)))
            .collect();
        Self { models }
    }

    pub fn model_for(&self, role: AgentRole) -> ModelConfig {
        self.models.get(&role).cloned().unwrap_or_default()
    }

    async fn call(&self, request: AgentRequest) -> anyhow::Result<AgentReply> {
        let config = self.model_for(request.role);
        let input = request.prompt;

        let reply = match request.role {
            AgentRole::Triage => AgentReply::Triage(run_llm_function!(
                &config,
                TriageOutput,
                prompts::TRIAGE,
                input
            )?),
            AgentRole::Clarifier => AgentReply::Clarifier(run_llm_function!(
                &config,
                ClarificationsOutput,
                prompts::CLARIFIER,
                input
            )?),
            AgentRole::Instruction => AgentReply::Instruction(run_llm_function!(
                &config,
                InstructionOutput,
                prompts::INSTRUCTION,
                input
            )?),
            AgentRole::Planner => AgentReply::Planner(run_llm_function!(
                &config,
                SearchPlanOutput,
                prompts::PLANNER,
                input
            )?),
            AgentRole::Searcher => AgentReply::Searcher(run_llm_function!(
                &config,
                SearchSummaryOutput,
                prompts::SEARCHER,
                input
            )?),
            AgentRole::Writer => AgentReply::Writer(run_llm_function!(
                &config,
                ReportOutput,
                prompts::WRITER,
                input
            )?),
            AgentRole::ImageGen => AgentReply::ImageGen(run_llm_function!(
                &config,
                ImageCaptionOutput,
                prompts::IMAGEGEN,
                input
            )?),
        };
        Ok(reply)
    }
}

#[async_trait]
impl AgentInvoker for RadkitInvoker {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentReply, AgentError> {
        let role = request.role;
        let model = self.model_for(role);
        tracing::debug!(role = %role, provider = model.provider.display_name(), model = %model.model, "Invoking agent");

        self.call(request).await.map_err(|e| {
            let classified = AgentError::classify(&e);
            tracing::warn!(role = %role, error = %classified, "Agent call failed");
            classified
        })
    }
}
