//! # Finalization
//!
//! Merges the report and the optional side asset into the deliverable:
//! `<out>/<run_id>/report.md` and a self-contained `report.html` with the
//! image embedded directly under the title. Writes go through an atomic
//! replace, so re-running finalization after a crash is harmless.

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use pulldown_cmark::{html, CowStr, Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::artifacts::{FinalDeliverable, FinalizationStatus, ReportArtifact, SideAsset};
use crate::orchestration::retry::{RetryPolicy, Retryable};
use crate::state::io::write_atomic;
use crate::state::ArtifactStore;

const DEFAULT_TITLE: &str = "Research Report";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FinalizeError {
    #[error("document write failed: {0}")]
    Io(String),
}

impl Retryable for FinalizeError {
    fn is_retryable(&self) -> bool {
        matches!(self, FinalizeError::Io(_))
    }

    fn timed_out(after: Duration) -> Self {
        FinalizeError::Io(format!("document write exceeded {:?}", after))
    }
}

/// Document-writing collaborator. Must be safely re-invocable.
#[async_trait]
pub trait DocumentWriter: Send + Sync {
    async fn write_document(&self, path: &Path, content: &[u8]) -> Result<(), FinalizeError>;
}

/// Writes documents to the local filesystem with temp-then-rename
pub struct FsDocumentWriter;

#[async_trait]
impl DocumentWriter for FsDocumentWriter {
    async fn write_document(&self, path: &Path, content: &[u8]) -> Result<(), FinalizeError> {
        write_atomic(path, content)
            .await
            .map_err(|e| FinalizeError::Io(format!("{:#}", e)))
    }
}

/// Image embedded in the HTML deliverable
#[derive(Debug, Clone)]
pub struct HeroImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub caption: String,
    pub path: PathBuf,
}

pub struct Finalizer {
    writer: Arc<dyn DocumentWriter>,
    artifacts: Arc<ArtifactStore>,
    output_root: PathBuf,
    retry: RetryPolicy,
}

impl Finalizer {
    pub fn new(
        writer: Arc<dyn DocumentWriter>,
        artifacts: Arc<ArtifactStore>,
        output_root: PathBuf,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            writer,
            artifacts,
            output_root,
            retry,
        }
    }

    pub async fn finalize(
        &self,
        run_id: &str,
        report: &ReportArtifact,
        side_asset: Option<&SideAsset>,
    ) -> Result<FinalDeliverable, FinalizeError> {
        let (hero, omission_reason) = self.load_hero(side_asset).await;

        let markdown = render_markdown(report, hero.as_ref());
        let html = render_html(report, hero.as_ref());

        let dir = self.output_root.join(run_id);
        let markdown_path = dir.join("report.md");
        let html_path = dir.join("report.html");

        self.write(&markdown_path, markdown.as_bytes()).await?;
        self.write(&html_path, html.as_bytes()).await?;

        let status = if hero.is_some() {
            FinalizationStatus::WithSideAsset
        } else {
            FinalizationStatus::SideAssetOmitted
        };

        tracing::info!(
            run_id,
            path = %html_path.display(),
            side_asset = hero.is_some(),
            "Deliverable written"
        );

        Ok(FinalDeliverable {
            report: report.clone(),
            side_asset: side_asset.cloned(),
            status,
            omission_reason,
            markdown_path,
            html_path,
            finalized_at: Utc::now(),
        })
    }

    async fn write(&self, path: &Path, content: &[u8]) -> Result<(), FinalizeError> {
        self.retry
            .run("write_document", || self.writer.write_document(path, content))
            .await
    }

    async fn load_hero(&self, side_asset: Option<&SideAsset>) -> (Option<HeroImage>, Option<String>) {
        let asset = match side_asset {
            None => return (None, Some("side asset branch did not finish".to_string())),
            Some(asset) => asset,
        };

        let reference = match (&asset.reference, asset.success) {
            (Some(reference), true) => reference,
            _ => {
                let reason = asset
                    .error
                    .clone()
                    .unwrap_or_else(|| "side asset not generated".to_string());
                return (None, Some(reason));
            }
        };

        match self.artifacts.read(reference).await {
            Ok(bytes) => (
                Some(HeroImage {
                    bytes,
                    mime_type: reference.mime_type.clone(),
                    caption: asset.description.clone().unwrap_or_default(),
                    path: reference.path.clone(),
                }),
                None,
            ),
            Err(e) => {
                tracing::warn!(hash = %reference.hash, error = %e, "Stored side asset unreadable");
                (None, Some(format!("stored side asset unreadable: {:#}", e)))
            }
        }
    }
}

fn markdown_options() -> Options {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options
}

/// Byte range and plain text of the first level-one heading
fn first_title(markdown: &str) -> Option<(Range<usize>, String)> {
    let mut inside = false;
    let mut text = String::new();
    for (event, range) in Parser::new_ext(markdown, markdown_options()).into_offset_iter() {
        match event {
            Event::Start(Tag::Heading {
                level: HeadingLevel::H1,
                ..
            }) => inside = true,
            Event::End(TagEnd::Heading(HeadingLevel::H1)) => {
                return Some((range, text.trim().to_string()))
            }
            Event::Text(t) | Event::Code(t) if inside => text.push_str(&t),
            _ => {}
        }
    }
    None
}

/// Title from the first level-one heading of the report
pub fn report_title(markdown: &str) -> String {
    first_title(markdown)
        .map(|(_, title)| title)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_TITLE.to_string())
}

/// Escape text for use inside a markdown image's alt brackets
fn escape_alt(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '[' | ']') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Report body plus follow-up section
fn report_body(report: &ReportArtifact) -> String {
    let mut body = report.markdown_report.trim_end().to_string();
    if !report.follow_up_questions.is_empty() {
        body.push_str("\n\n## Follow-up questions\n\n");
        for question in &report.follow_up_questions {
            body.push_str(&format!("- {}\n", question));
        }
    }
    body
}

/// Markdown deliverable; the image link sits directly under the title.
pub fn render_markdown(report: &ReportArtifact, hero: Option<&HeroImage>) -> String {
    let body = report_body(report);
    let Some(hero) = hero else {
        return body;
    };

    let image = format!("![{}]({})", escape_alt(&hero.caption), hero.path.display());
    match first_title(&body) {
        Some((range, _)) => {
            let (head, tail) = body.split_at(range.end);
            let tail = tail.trim_start_matches(['\r', '\n']);
            if tail.is_empty() {
                format!("{}\n\n{}\n", head.trim_end(), image)
            } else {
                format!("{}\n\n{}\n\n{}", head.trim_end(), image, tail)
            }
        }
        None => format!("# {}\n\n{}\n\n{}", DEFAULT_TITLE, image, body),
    }
}

/// Self-contained HTML deliverable with the image as a data URI under the `<h1>`.
pub fn render_html(report: &ReportArtifact, hero: Option<&HeroImage>) -> String {
    let markdown = report_body(report);
    let title = report_title(&markdown);

    let figure = hero.map(hero_block).unwrap_or_default();
    let mut placed = false;
    let events = Parser::new_ext(&markdown, markdown_options()).flat_map(|event| {
        let after_title = !placed && matches!(event, Event::End(TagEnd::Heading(HeadingLevel::H1)));
        placed |= after_title;
        let extra = after_title.then(|| Event::Html(CowStr::from(format!("\n{}", figure))));
        std::iter::once(event).chain(extra)
    });
    let mut body = String::new();
    html::push_html(&mut body, events);

    if !placed {
        body = format!("<h1>{}</h1>\n{}{}", escape_html(&title), figure, body);
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
<style>
body {{ font-family: Georgia, 'Times New Roman', serif; line-height: 1.6; max-width: 800px; margin: 2em auto; padding: 0 1em; color: #222; }}
h1, h2, h3 {{ font-family: Helvetica, Arial, sans-serif; color: #1a1a2e; }}
h1 {{ border-bottom: 2px solid #1a1a2e; padding-bottom: 0.3em; }}
.image-container {{ text-align: center; margin: 1.5em 0; }}
.image-container img {{ max-width: 100%; border-radius: 6px; box-shadow: 0 2px 8px rgba(0,0,0,0.15); }}
.image-caption {{ font-size: 0.9em; color: #555; font-style: italic; }}
table {{ border-collapse: collapse; width: 100%; margin: 1em 0; }}
th, td {{ border: 1px solid #ccc; padding: 0.4em 0.6em; text-align: left; }}
th {{ background: #f2f2f2; }}
code {{ background: #f5f5f5; padding: 0.1em 0.3em; border-radius: 3px; }}
</style>
</head>
<body>
{body}
</body>
</html>
"#,
        title = escape_html(&title),
        body = body
    )
}

fn hero_block(hero: &HeroImage) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(&hero.bytes);
    let caption = escape_html(&hero.caption);
    let mut block = format!(
        "<div class=\"image-container\">\n<img src=\"data:{};base64,{}\" alt=\"{}\">\n",
        hero.mime_type, encoded, caption
    );
    if !caption.is_empty() {
        block.push_str(&format!("<p class=\"image-caption\">{}</p>\n", caption));
    }
    block.push_str("</div>\n");
    block
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
