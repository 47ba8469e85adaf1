//! # Agent Invocation Adapter
//!
//! Uniform call contract to the reasoning service: a role and a prompt go in;
//! the role's typed reply or a classified failure comes out.
//!
//! ```rust,ignore
//! let triage: TriageOutput = invoke_as(invoker.as_ref(), query).await?;
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::outputs::{
    ClarificationsOutput, ImageCaptionOutput, InstructionOutput, ReportOutput, SearchPlanOutput,
    SearchSummaryOutput, TriageOutput,
};
use crate::orchestration::retry::Retryable;

/// Agent roles known to the engine. Each role has one prompt and one output schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Triage,
    Clarifier,
    Instruction,
    Planner,
    Searcher,
    Writer,
    ImageGen,
}

impl AgentRole {
    pub fn all() -> [AgentRole; 7] {
        [
            AgentRole::Triage,
            AgentRole::Clarifier,
            AgentRole::Instruction,
            AgentRole::Planner,
            AgentRole::Searcher,
            AgentRole::Writer,
            AgentRole::ImageGen,
        ]
    }

    /// Stable id used in config files and logs
    pub fn id(&self) -> &'static str {
        match self {
            AgentRole::Triage => "triage",
            AgentRole::Clarifier => "clarifier",
            AgentRole::Instruction => "instruction",
            AgentRole::Planner => "planner",
            AgentRole::Searcher => "searcher",
            AgentRole::Writer => "writer",
            AgentRole::ImageGen => "imagegen",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::all().into_iter().find(|role| role.id() == id)
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Classified failure of an agent call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    /// Network, timeout, rate limit. Retried by the host.
    #[error("transient agent failure: {0}")]
    Transient(String),
    /// The model refused or the call cannot succeed as issued.
    #[error("model error: {0}")]
    Model(String),
    /// The reply did not match the role's output schema.
    #[error("schema error: {0}")]
    Schema(String),
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_))
    }

    /// Map an untyped provider error onto the taxonomy by its message.
    pub fn classify(err: &anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        let lower = message.to_lowercase();

        const TRANSIENT: [&str; 7] = [
            "timeout",
            "timed out",
            "connection",
            "connect error",
            "temporarily",
            "rate limit",
            "too many requests",
        ];
        const TRANSIENT_STATUS: [u16; 4] = [429, 502, 503, 504];
        const SCHEMA: [&str; 6] = [
            "failed to parse",
            "parse error",
            "deserializ",
            "missing field",
            "invalid type",
            "expected value",
        ];

        let words: Vec<&str> = lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let transient_status = words.windows(2).any(|pair| {
            matches!(pair[0], "http" | "status" | "code")
                && pair[1]
                    .parse::<u16>()
                    .map(|code| TRANSIENT_STATUS.contains(&code))
                    .unwrap_or(false)
        });
        let schema_word = words.iter().any(|w| *w == "schema");

        if transient_status
            || lower.contains("overloaded")
            || TRANSIENT.iter().any(|needle| lower.contains(needle))
        {
            AgentError::Transient(message)
        } else if schema_word || SCHEMA.iter().any(|needle| lower.contains(needle)) {
            AgentError::Schema(message)
        } else {
            AgentError::Model(message)
        }
    }
}

impl Retryable for AgentError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    fn timed_out(after: Duration) -> Self {
        AgentError::Transient(format!("agent call exceeded {:?}", after))
    }
}

/// A single agent call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub role: AgentRole,
    pub prompt: String,
}

impl AgentRequest {
    pub fn new(role: AgentRole, prompt: impl Into<String>) -> Self {
        Self {
            role,
            prompt: prompt.into(),
        }
    }
}

/// Typed reply, tagged by the role that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", content = "output", rename_all = "snake_case")]
pub enum AgentReply {
    Triage(TriageOutput),
    Clarifier(ClarificationsOutput),
    Instruction(InstructionOutput),
    Planner(SearchPlanOutput),
    Searcher(SearchSummaryOutput),
    Writer(ReportOutput),
    ImageGen(ImageCaptionOutput),
}

impl AgentReply {
    pub fn role(&self) -> AgentRole {
        match self {
            AgentReply::Triage(_) => AgentRole::Triage,
            AgentReply::Clarifier(_) => AgentRole::Clarifier,
            AgentReply::Instruction(_) => AgentRole::Instruction,
            AgentReply::Planner(_) => AgentRole::Planner,
            AgentReply::Searcher(_) => AgentRole::Searcher,
            AgentReply::Writer(_) => AgentRole::Writer,
            AgentReply::ImageGen(_) => AgentRole::ImageGen,
        }
    }
}

/// Output types that can be extracted from a reply of their role
pub trait FromReply: Sized {
    const ROLE: AgentRole;

    fn from_reply(reply: AgentReply) -> Option<Self>;
}

macro_rules! impl_from_reply {
    ($($variant:ident => $output:ty),* $(,)?) => {
        $(
            impl FromReply for $output {
                const ROLE: AgentRole = AgentRole::$variant;

                fn from_reply(reply: AgentReply) -> Option<Self> {
                    match reply {
                        AgentReply::$variant(output) => Some(output),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_from_reply!(
    Triage => TriageOutput,
    Clarifier => ClarificationsOutput,
    Instruction => InstructionOutput,
    Planner => SearchPlanOutput,
    Searcher => SearchSummaryOutput,
    Writer => ReportOutput,
    ImageGen => ImageCaptionOutput,
);

/// The reasoning service, seen from the engine.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentReply, AgentError>;
}

/// Invoke the role that produces `T` and extract the typed output.
pub async fn invoke_as<T: FromReply>(
    invoker: &dyn AgentInvoker,
    prompt: impl Into<String>,
) -> Result<T, AgentError> {
    let reply = invoker.invoke(AgentRequest::new(T::ROLE, prompt)).await?;
    let got = reply.role();
    T::from_reply(reply).ok_or_else(|| {
        AgentError::Schema(format!("expected {} output, got {} output", T::ROLE, got))
    })
}
