//! Reply filters
//!
//! Filters run in order over the raw completion. A filter that fails is
//! logged and skipped; the text it was given passes on unchanged.

use thiserror::Error;

use crate::config::PersonaProfile;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("filter would leave an empty reply")]
    EmptyResult,

    #[error("{0}")]
    Invalid(String),
}

pub trait ReplyFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, text: &str) -> Result<String, FilterError>;
}

/// Result of running a filter chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filtered {
    pub text: String,
    /// Filters that errored and were skipped
    pub skipped: Vec<&'static str>,
}

pub fn run_filters(filters: &[Box<dyn ReplyFilter>], raw: &str) -> Filtered {
    let mut text = raw.to_string();
    let mut skipped = Vec::new();

    for filter in filters {
        match filter.apply(&text) {
            Ok(next) if next.trim().is_empty() => {
                tracing::warn!(filter = filter.name(), "Reply filter emptied the reply, skipping");
                skipped.push(filter.name());
            }
            Ok(next) => text = next,
            Err(e) => {
                tracing::warn!(filter = filter.name(), error = %e, "Reply filter failed, skipping");
                skipped.push(filter.name());
            }
        }
    }

    Filtered { text, skipped }
}

/// The filter chain for a persona's style rules
pub fn filters_for(persona: &PersonaProfile) -> Vec<Box<dyn ReplyFilter>> {
    let mut filters: Vec<Box<dyn ReplyFilter>> = Vec::new();
    let style = &persona.style;

    if style.strip_speaker_prefix {
        filters.push(Box::new(SpeakerPrefix::new([
            persona.character_name.clone(),
            "Assistant".to_string(),
        ])));
    }
    if !style.replacements.is_empty() {
        filters.push(Box::new(PhraseReplacements::new(
            style
                .replacements
                .iter()
                .map(|(from, to)| (from.clone(), to.clone()))
                .collect(),
        )));
    }
    filters.push(Box::new(Whitespace));
    if let Some(max_chars) = style.max_reply_chars {
        filters.push(Box::new(LengthCap { max_chars }));
    }

    filters
}

/// Drops a leading `Name:` the model echoes from chat formatting
pub struct SpeakerPrefix {
    names: Vec<String>,
}

impl SpeakerPrefix {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            names: names.into_iter().map(|n| n.to_lowercase()).collect(),
        }
    }
}

impl ReplyFilter for SpeakerPrefix {
    fn name(&self) -> &'static str {
        "speaker_prefix"
    }

    fn apply(&self, text: &str) -> Result<String, FilterError> {
        let trimmed = text.trim_start();
        let Some((head, rest)) = trimmed.split_once(':') else {
            return Ok(text.to_string());
        };

        let head = head.trim().trim_matches('*').to_lowercase();
        if self.names.iter().any(|n| *n == head) {
            Ok(rest.trim_start().to_string())
        } else {
            Ok(text.to_string())
        }
    }
}

pub struct PhraseReplacements {
    pairs: Vec<(String, String)>,
}

impl PhraseReplacements {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }
}

impl ReplyFilter for PhraseReplacements {
    fn name(&self) -> &'static str {
        "phrase_replacements"
    }

    fn apply(&self, text: &str) -> Result<String, FilterError> {
        let mut out = text.to_string();
        for (from, to) in &self.pairs {
            if from.is_empty() {
                return Err(FilterError::Invalid("empty replacement pattern".to_string()));
            }
            out = out.replace(from.as_str(), to);
        }
        Ok(out)
    }
}

/// Trims the reply, strips trailing spaces and collapses blank-line runs
pub struct Whitespace;

impl ReplyFilter for Whitespace {
    fn name(&self) -> &'static str {
        "whitespace"
    }

    fn apply(&self, text: &str) -> Result<String, FilterError> {
        let mut lines: Vec<&str> = Vec::new();
        let mut blank_run = 0;
        for line in text.trim().lines() {
            let line = line.trim_end();
            if line.is_empty() {
                blank_run += 1;
                if blank_run > 1 {
                    continue;
                }
            } else {
                blank_run = 0;
            }
            lines.push(line);
        }

        let out = lines.join("\n");
        if out.is_empty() {
            return Err(FilterError::EmptyResult);
        }
        Ok(out)
    }
}

/// Cuts replies longer than `max_chars`, preferring a sentence boundary
pub struct LengthCap {
    pub max_chars: usize,
}

impl ReplyFilter for LengthCap {
    fn name(&self) -> &'static str {
        "length_cap"
    }

    fn apply(&self, text: &str) -> Result<String, FilterError> {
        if self.max_chars == 0 {
            return Err(FilterError::Invalid("max_chars must be positive".to_string()));
        }
        if text.chars().count() <= self.max_chars {
            return Ok(text.to_string());
        }

        let cut: String = text.chars().take(self.max_chars).collect();
        let boundary = cut
            .char_indices()
            .filter(|(_, c)| matches!(c, '.' | '!' | '?'))
            .map(|(i, c)| i + c.len_utf8())
            .last()
            .filter(|end| *end >= cut.len() / 2);

        Ok(match boundary {
            Some(end) => cut[..end].to_string(),
            None => cut.trim_end().to_string(),
        })
    }
}
