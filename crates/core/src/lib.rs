//! # Dossier Core
//!
//! Research orchestration engine: takes a natural-language query, optionally
//! asks clarifying questions, researches the web in parallel and produces a
//! formatted report with a best-effort hero image.
//!
//! ## Architecture
//!
//! - `orchestration/` - Run stage machine, coordinator, signals and retries
//! - `clarification` - Question/answer collection for a suspended run
//! - `research/` - Plan, search fan-out and report writing
//! - `assets` - Side-asset branch (image caption + generation)
//! - `finalize` - Markdown/HTML deliverable rendering
//! - `skills/` - Agent invocation adapter and role prompts
//! - `tools/` - Web search and image generation clients
//! - `state/` - SQLite run store and content-addressed artifacts
//! - `models` / `config` - Provider selection and engine configuration
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dossier_core::artifacts::ResearchRequest;
//! use dossier_core::config::EngineConfig;
//! use dossier_core::orchestration::Coordinator;
//! use dossier_core::state::ResearchDb;
//!
//! let db = Arc::new(ResearchDb::open()?);
//! let coordinator = Arc::new(Coordinator::new(EngineConfig::load().await, db));
//! let (handle, task) = coordinator.start(ResearchRequest::new("Best travel tips"), true)?;
//! handle.deliver_answer(0, "Japan")?;
//! let outcome = task.await?;
//! ```

pub mod artifacts;
pub mod assets;
pub mod clarification;
pub mod config;
pub mod finalize;
pub mod models;
pub mod orchestration;
pub mod research;
pub mod skills;
pub mod state;
pub mod tools;

#[cfg(test)]
mod testing;
