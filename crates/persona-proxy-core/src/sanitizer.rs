//! Output sanitizer: turns raw backend text into an on-persona reply.
//!
//! Steps, in order: empty -> fallback, trim, drop any persona prefix the backend already
//! wrote, optional sentence cap, banned-vocabulary removal, re-prefix, length cap.
//! In substring mode vocabulary removal is blunt ("AI" also eats the "ai" in "explain").

use crate::config::{PersonaConfig, VocabularyMode, ELLIPSIS};
use once_cell::sync::Lazy;
use regex::Regex;

static SPACE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]{2,}").expect("space pattern compiles"));

pub struct Sanitizer {
    prefix: String,
    leading_prefix: Option<Regex>,
    vocabulary: Option<Regex>,
    empty_reply: String,
    max_sentences: Option<usize>,
    max_chars: usize,
}

impl Sanitizer {
    pub fn new(persona: &PersonaConfig, banned_vocabulary: &[String]) -> Self {
        let name = regex::escape(persona.name.trim());
        Self {
            prefix: persona.prefix(),
            leading_prefix: Regex::new(&format!(r"(?i)^\s*{}\s*:\s*", name)).ok(),
            vocabulary: vocabulary_pattern(banned_vocabulary, persona.vocabulary_mode),
            empty_reply: persona.empty_reply.trim().to_string(),
            max_sentences: persona.max_sentences,
            max_chars: persona.max_reply_chars,
        }
    }

    /// Always non-empty, always starts with the prefix, never longer than `max_reply_chars`.
    pub fn sanitize(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        let mut body = if trimmed.is_empty() {
            self.empty_reply.clone()
        } else {
            trimmed.to_string()
        };

        body = self.strip_leading_prefix(&body);

        if let Some(limit) = self.max_sentences {
            body = first_sentences(&body, limit).to_string();
        }

        if let Some(pattern) = &self.vocabulary {
            body = pattern.replace_all(&body, "").into_owned();
            body = SPACE_RUNS.replace_all(&body, " ").trim().to_string();
        }

        if body.is_empty() {
            body = self.empty_reply.clone();
        }

        let out = format!("{}{}", self.prefix, body);
        truncate_chars(&out, self.max_chars)
    }

    /// Backends often echo "Clippy:" (sometimes twice); remove every leading copy.
    fn strip_leading_prefix(&self, text: &str) -> String {
        let Some(pattern) = &self.leading_prefix else {
            return text.to_string();
        };
        let mut rest = text;
        while let Some(m) = pattern.find(rest) {
            if m.end() == 0 {
                break;
            }
            rest = &rest[m.end()..];
        }
        rest.trim().to_string()
    }
}

/// Longest terms first so "language model" wins over "model".
fn vocabulary_pattern(terms: &[String], mode: VocabularyMode) -> Option<Regex> {
    let mut terms: Vec<String> = terms
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if terms.is_empty() {
        return None;
    }
    terms.sort_by(|a, b| b.len().cmp(&a.len()));
    let alternation = terms.iter().map(|t| regex::escape(t)).collect::<Vec<_>>().join("|");
    let pattern = match mode {
        VocabularyMode::Substring => format!(r"(?i)(?:{})", alternation),
        VocabularyMode::WordBoundary => format!(r"(?i)\b(?:{})\b", alternation),
    };
    Regex::new(&pattern).ok()
}

/// Keep the first `limit` sentences. A boundary is `.`, `!` or `?` followed by whitespace.
pub fn first_sentences(text: &str, limit: usize) -> &str {
    let mut seen = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(_, next)) = chars.peek() {
                if next.is_whitespace() {
                    seen += 1;
                    if seen >= limit {
                        return &text[..idx + c.len_utf8()];
                    }
                }
            }
        }
    }
    text
}

/// Cut to at most `max` chars, ending in the ellipsis marker when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(ELLIPSIS.len());
    let mut out: String = text.chars().take(keep).collect();
    out.truncate(out.trim_end().len());
    out.push_str(ELLIPSIS);
    out
}
