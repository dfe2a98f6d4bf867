use anyhow::Result;

use super::conversation_service::BoxFuture;
use crate::models::conversation::DEFAULT_TITLE;

/// Outcome of a title-generation request.
#[derive(Clone, Debug)]
pub struct GeneratedTitle {
    pub title: String,
    /// True when the backend could not produce a real title and fell back to
    /// a canned one.
    pub used_fallback: bool,
}

/// Backend title generation, treated as a black box.
///
/// The single-flight guard lives in the controller; implementations only have
/// to answer one request per call.
pub trait TitleGenerator: Send + Sync + 'static {
    fn generate_title(&self, conversation_id: &str)
    -> BoxFuture<'static, Result<GeneratedTitle>>;
}

/// Clean and validate a generated title before it is stored.
pub fn clean_title(raw_title: &str) -> String {
    let cleaned = raw_title
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .lines()
        .next()
        .unwrap_or(DEFAULT_TITLE)
        .to_string();

    if cleaned.chars().count() > 100 {
        let head: String = cleaned.chars().take(97).collect();
        format!("{}...", head)
    } else if cleaned.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        cleaned
    }
}
