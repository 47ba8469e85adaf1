//! # Durable State
//!
//! The checkpoint store behind run resumption:
//!
//! - `db` - SQLite database and migrations
//! - `runs` - run checkpoints, transition history, branch progress
//! - `artifacts` - content-addressed asset files
//! - `io` - runtime directory and atomic file writes

pub mod artifacts;
pub mod db;
pub mod io;
pub mod runs;

pub use artifacts::ArtifactStore;
pub use db::ResearchDb;
pub use runs::{RunStore, Transition};
