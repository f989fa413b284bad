//! Deterministic interceptors that can answer a message without the backend.
//!
//! Run in a fixed order, first match wins:
//! 1. jailbreak phrases (before anything that could echo user text back)
//! 2. "remember/learn [that] X is Y"
//! 3. "who is X"
//! 4. domain keyword lookup
//!
//! Matching is shallow on purpose. The "X is Y" split takes the first " is " after the
//! verb, so "remember that the sky is blue is a song" stores "the sky" -> "blue is a song".

use crate::config::{KeywordEntry, KnowledgeConfig, PersonaConfig};
use crate::error::StoreError;
use crate::facts::{normalize_subject, FactStore};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;

pub const CONFIDENCE_JAILBREAK: f32 = 1.0;
pub const CONFIDENCE_LEARNED: f32 = 1.0;
pub const CONFIDENCE_SELF_IDENTITY: f32 = 1.0;
pub const CONFIDENCE_ENTITY_QUERY: f32 = 0.9;
pub const CONFIDENCE_KEYWORD: f32 = 0.95;

static LEARN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:remember|learn) (?:that )?(.+?) is (.+)").expect("learn pattern compiles")
});

static QUERY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)who is (.+)").expect("query pattern compiles"));

static TEMPLATE_SLOT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(subject|fact)\}").expect("template slot pattern compiles"));

/// Which interceptor answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterceptKind {
    Jailbreak,
    Learned,
    SelfIdentity,
    FactRecalled,
    KnownEntity,
    UnknownEntity,
    Keyword,
}

/// A complete reply produced without calling the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Interception {
    pub kind: InterceptKind,
    pub reply: String,
    pub confidence: f32,
}

/// True when the message contains any banned phrase, case-insensitively, anywhere.
pub fn detect_jailbreak(message: &str, banned_phrases: &[String]) -> bool {
    let lower = message.to_lowercase();
    banned_phrases
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .any(|p| lower.contains(&p))
}

/// "remember that pluto is a dwarf planet." -> ("pluto", "a dwarf planet"), both trimmed,
/// case kept, trailing periods dropped from the fact.
pub fn extract_learning(message: &str) -> Option<(String, String)> {
    let caps = LEARN_PATTERN.captures(message)?;
    let subject = caps.get(1)?.as_str().trim();
    let fact = caps.get(2)?.as_str().trim().trim_end_matches('.').trim_end();
    if subject.is_empty() || fact.is_empty() {
        return None;
    }
    Some((subject.to_string(), fact.to_string()))
}

/// Fill `{subject}` and `{fact}` in one pass; placeholder text inside the values stays as typed.
pub fn fill_learned_template(template: &str, subject: &str, fact: &str) -> String {
    TEMPLATE_SLOT
        .replace_all(template, |caps: &regex::Captures| match &caps[1] {
            "subject" => subject.to_string(),
            _ => fact.to_string(),
        })
        .into_owned()
}

/// "Who is Pluto?" -> "pluto".
pub fn extract_query(message: &str) -> Option<String> {
    let caps = QUERY_PATTERN.captures(message)?;
    let subject = caps
        .get(1)?
        .as_str()
        .trim()
        .trim_end_matches(&['?', '!', '.'][..])
        .trim();
    if subject.is_empty() {
        return None;
    }
    Some(normalize_subject(subject))
}

/// First keyword (in table order) contained in the message, case-insensitively.
pub fn match_keyword<'a>(message: &str, keywords: &'a [KeywordEntry]) -> Option<&'a KeywordEntry> {
    let lower = message.to_lowercase();
    keywords.iter().find(|entry| {
        let key = entry.key.trim().to_lowercase();
        !key.is_empty() && lower.contains(&key)
    })
}

/// Capitalize the first letter of every word: "ada lovelace" -> "Ada Lovelace".
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

/// The interceptor chain. Holds the static tables and the session fact store.
pub struct Interceptor {
    persona: PersonaConfig,
    knowledge: KnowledgeConfig,
    facts: Arc<dyn FactStore>,
}

impl Interceptor {
    pub fn new(persona: PersonaConfig, knowledge: KnowledgeConfig, facts: Arc<dyn FactStore>) -> Self {
        Self {
            persona,
            knowledge,
            facts,
        }
    }

    /// Run the chain. `Ok(None)` means the message goes to the backend.
    /// Only the learning interceptor mutates state, and only once its reply is ready.
    pub fn intercept(&self, session: &str, message: &str) -> Result<Option<Interception>, StoreError> {
        if detect_jailbreak(message, &self.knowledge.banned_phrases) {
            tracing::info!(target: "persona_proxy::intercept", session = %session, "jailbreak phrase deflected");
            return Ok(Some(Interception {
                kind: InterceptKind::Jailbreak,
                reply: self.persona.voice(&self.persona.deflection_reply),
                confidence: CONFIDENCE_JAILBREAK,
            }));
        }

        if let Some((subject, fact)) = extract_learning(message) {
            let reply = self
                .persona
                .voice(&fill_learned_template(&self.persona.learned_template, &subject, &fact));
            self.facts.learn(session, &subject, &fact)?;
            tracing::info!(target: "persona_proxy::intercept", session = %session, subject = %normalize_subject(&subject), "fact learned");
            return Ok(Some(Interception {
                kind: InterceptKind::Learned,
                reply,
                confidence: CONFIDENCE_LEARNED,
            }));
        }

        if let Some(subject) = extract_query(message) {
            return self.answer_query(session, &subject).map(Some);
        }

        if let Some(entry) = match_keyword(message, &self.knowledge.keywords) {
            tracing::debug!(target: "persona_proxy::intercept", key = %entry.key, "keyword answered");
            return Ok(Some(Interception {
                kind: InterceptKind::Keyword,
                reply: self.persona.voice(&entry.text),
                confidence: CONFIDENCE_KEYWORD,
            }));
        }

        Ok(None)
    }

    /// Self-identity, then the session's facts, then the static entity table.
    fn answer_query(&self, session: &str, subject: &str) -> Result<Interception, StoreError> {
        if subject == normalize_subject(&self.persona.name) {
            return Ok(Interception {
                kind: InterceptKind::SelfIdentity,
                reply: self.persona.voice(&self.persona.self_identity_reply),
                confidence: CONFIDENCE_SELF_IDENTITY,
            });
        }

        if let Some(fact) = self.facts.lookup(session, subject)? {
            return Ok(Interception {
                kind: InterceptKind::FactRecalled,
                reply: self.describe(subject, &fact),
                confidence: CONFIDENCE_ENTITY_QUERY,
            });
        }

        let known = self
            .knowledge
            .known_entities
            .iter()
            .find(|e| normalize_subject(&e.name) == subject);
        if let Some(entity) = known {
            return Ok(Interception {
                kind: InterceptKind::KnownEntity,
                reply: self.describe(subject, &entity.fact),
                confidence: CONFIDENCE_ENTITY_QUERY,
            });
        }

        Ok(Interception {
            kind: InterceptKind::UnknownEntity,
            reply: self.persona.voice(&self.persona.not_found_reply),
            confidence: CONFIDENCE_ENTITY_QUERY,
        })
    }

    fn describe(&self, subject: &str, fact: &str) -> String {
        self.persona.voice(&format!(
            "{} is {}.",
            title_case(subject),
            fact.trim_end_matches('.')
        ))
    }
}
