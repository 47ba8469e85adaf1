//! # External Collaborators
//!
//! Thin clients for the services the engine calls but does not own.
//!
//! - `web_search` - search execution (SearXNG)
//! - `image_api` - image generation (OpenAI images API)

pub mod image_api;
pub mod web_search;

pub use image_api::{GeneratedImage, ImageError, ImageGenerator, OpenAiImageGenerator};
pub use web_search::{SearchError, SearxngSearch, WebHit, WebSearch};
