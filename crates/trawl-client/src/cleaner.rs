use std::sync::Arc;

use htmd::HtmlToMarkdown;
use trawl_core::AppError;

/// Turns a job description's HTML fragment into Markdown.
///
/// Boards wrap descriptions in tracking scripts, share widgets and "apply"
/// forms; those tags are dropped before conversion.
#[derive(Clone)]
pub struct DescriptionCleaner {
    converter: Arc<HtmlToMarkdown>,
}

impl DescriptionCleaner {
    pub fn new() -> Self {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(vec![
                "script", "style", "noscript", "iframe", "svg", "form", "button", "nav",
            ])
            .build();

        Self {
            converter: Arc::new(converter),
        }
    }

    pub fn clean(&self, html: &str) -> Result<String, AppError> {
        let markdown = self
            .converter
            .convert(html)
            .map_err(|e| AppError::Parsing(format!("Failed to convert description: {e}")))?;
        Ok(collapse_blank_lines(markdown.trim()))
    }
}

impl Default for DescriptionCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DescriptionCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptionCleaner").finish_non_exhaustive()
    }
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out.truncate(out.trim_end().len());
    out
}
