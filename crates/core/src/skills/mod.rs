//! # Agent Skills
//!
//! The engine's view of the external reasoning service.
//!
//! ```text
//! Coordinator / ResearchPipeline / SideAssetBranch
//!   └── AgentInvoker (role + prompt -> typed reply | AgentError)
//!         └── RadkitInvoker (LlmFunction per role, provider from config)
//! ```
//!
//! - `invoker` - the call contract, roles and error taxonomy
//! - `outputs` - structured output type per role
//! - `prompts` - bundled system prompts
//! - `radkit_invoker` - production adapter on top of radkit

pub mod invoker;
pub mod llm_helpers;
pub mod outputs;
pub mod prompts;
pub mod radkit_invoker;

pub use invoker::{invoke_as, AgentError, AgentInvoker, AgentReply, AgentRequest, AgentRole, FromReply};
pub use outputs::{
    ClarificationsOutput, Confidence, ImageCaptionOutput, InstructionOutput, PlannedSearch,
    ReportOutput, SearchPlanOutput, SearchSummaryOutput, TriageDecision, TriageOutput,
};
pub use radkit_invoker::RadkitInvoker;
