//! Cheap per-request signals reported alongside generated replies.
//! Heuristics, not measurements: word lists and a fixed token ratio.

use serde::Serialize;

const CONCERNED_WORDS: &[&str] = &["sad", "upset", "angry"];
const HAPPY_WORDS: &[&str] = &["happy", "great"];

/// Rough tokens-per-word ratio for English text.
const TOKENS_PER_WORD: f64 = 1.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Concerned,
    Happy,
    Neutral,
}

impl Emotion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Concerned => "concerned",
            Emotion::Happy => "happy",
            Emotion::Neutral => "neutral",
        }
    }
}

/// Concern wins over happiness when both word lists hit.
pub fn detect_emotion(message: &str) -> Emotion {
    let lower = message.to_lowercase();
    if CONCERNED_WORDS.iter().any(|w| lower.contains(w)) {
        Emotion::Concerned
    } else if HAPPY_WORDS.iter().any(|w| lower.contains(w)) {
        Emotion::Happy
    } else {
        Emotion::Neutral
    }
}

/// Whitespace word count x 1.3, rounded down.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.split_whitespace().count() as f64 * TOKENS_PER_WORD).floor() as u32
}

/// Local wall clock as `HH:MM:SS`.
pub fn system_time() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}
