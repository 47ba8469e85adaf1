//! # Run Orchestration
//!
//! Stage machine, checkpoints, retries and the external signal surface of a
//! research run.
//!
//! ## Run Flow
//!
//! ```text
//! Query → Triage → Clarify (suspend for answers) → Enrich → Research ∥ Side Asset → Finalize
//! ```

pub mod coordinator;
pub mod events;
pub mod retry;
pub mod run;
pub mod signals;
pub mod stage;

#[cfg(test)]
mod scenarios;

pub use coordinator::Coordinator;
pub use events::{EventSink, RunEvent, RunEventKind};
pub use retry::{RetryPolicy, Retryable};
pub use run::{IllegalTransition, RunOutcome, RunRecord, RunSummary};
pub use signals::{RunCommand, RunHandle, RunStatus, SignalError};
pub use stage::{RunStage, StageFailure, StageId};
