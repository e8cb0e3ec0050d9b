//! Utterance extraction: turn "I put my keys on the table" into a placement.
//!
//! [`extract`] is a pure function over an ordered pattern table. The first
//! pattern that matches wins, so more specific phrasings are listed first.
//! [`UtteranceSource`] abstracts where sentences come from (speech
//! recognition, a terminal, a test script).

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use crate::types::CreateItemInput;

/// Shown when no pattern matches.
pub const NOT_UNDERSTOOD: &str =
    "I couldn't understand where you put the item. Try saying 'I put my keys on the table'";

const PREPOSITIONS: &str = "on|in|at|under|behind|inside|near|by|next to";
const DETERMINERS: &str = "my |the |a ";

/// Ordered phrase patterns. Group 1 is the name, group 2 the location.
static PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        format!(
            r"\b(?:i )?(?:put|placed|left|stored|kept) (?:{DETERMINERS})?(.+?) (?:{PREPOSITIONS}) ((?:the |my |a )?.+)"
        ),
        format!(r"(?:{DETERMINERS})?(.+?) (?:is|are) (?:{PREPOSITIONS}) ((?:the |my |a )?.+)"),
        format!(r"(.+?) (?:goes|go) (?:{PREPOSITIONS}) ((?:the |my |a )?.+)"),
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("utterance pattern must compile"))
    .collect()
});

/// A named object and where it was put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub name: String,
    pub location: String,
}

impl From<Placement> for CreateItemInput {
    fn from(p: Placement) -> Self {
        CreateItemInput::new(p.name, p.location)
    }
}

/// Extract a placement from a spoken or typed sentence.
///
/// The input is lower-cased before matching. Returns `None` when no pattern
/// matches or a capture is blank after trimming.
pub fn extract(text: &str) -> Option<Placement> {
    let lower = text.to_lowercase();
    PATTERNS.iter().find_map(|pattern| {
        let caps = pattern.captures(&lower)?;
        let name = caps.get(1)?.as_str().trim();
        let location = caps.get(2)?.as_str().trim();
        if name.is_empty() || location.is_empty() {
            return None;
        }
        Some(Placement {
            name: name.to_string(),
            location: location.to_string(),
        })
    })
}

/// Spoken confirmation for a recorded placement.
pub fn confirmation(placement: &Placement) -> String {
    format!(
        "Got it! I'll remember that your {} is {}.",
        placement.name, placement.location
    )
}

// ============================================================================
// UtteranceSource
// ============================================================================

/// Producer of sentences to extract placements from.
#[async_trait]
pub trait UtteranceSource: Send {
    /// Next non-blank utterance, or `None` when the source is exhausted.
    async fn next_utterance(&mut self) -> Option<String>;
}

/// Newline-delimited utterances from any async reader, e.g. stdin.
pub struct LineSource<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin + Send> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> UtteranceSource for LineSource<R> {
    async fn next_utterance(&mut self) -> Option<String> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Some(line.trim().to_string()),
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(error = %e, "utterance source failed");
                    return None;
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
