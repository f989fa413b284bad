//! Prompt builder: persona block, optional situation line, transcript, then the assistant cue.
//!
//! The persona block is the only thing keeping the backend in character; the sanitizer
//! only trims and scrubs afterwards.

use crate::session::{Role, Turn};

const USER_LABEL: &str = "User";

/// Renders single-string prompts for completion-style backends.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    instructions: String,
    assistant_label: String,
}

impl PromptBuilder {
    pub fn new(instructions: impl Into<String>, assistant_name: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            assistant_label: assistant_name.into().trim().to_string(),
        }
    }

    fn label(&self, role: Role) -> &str {
        match role {
            Role::User => USER_LABEL,
            Role::Assistant => &self.assistant_label,
        }
    }

    /// Stored assistant turns already carry the persona prefix; render it once.
    fn strip_label<'a>(&self, turn: &'a Turn) -> &'a str {
        let content = turn.content.trim();
        if turn.role == Role::Assistant {
            if let Some(rest) = content
                .strip_prefix(self.assistant_label.as_str())
                .and_then(|r| r.strip_prefix(':'))
            {
                return rest.trim_start();
            }
        }
        content
    }

    /// `history` is rendered oldest first, one `"<Label>: <content>"` line per turn.
    pub fn build(&self, history: &[Turn], context: Option<&str>) -> String {
        let mut prompt = String::new();
        prompt.push_str(self.instructions.trim());
        prompt.push_str("\n\n");

        if let Some(ctx) = context.map(str::trim).filter(|c| !c.is_empty()) {
            prompt.push_str(&format!(
                "Situation: {}. Acknowledge it naturally when it is relevant.\n\n",
                ctx.trim_end_matches('.')
            ));
        }

        prompt.push_str("Conversation:\n");
        for turn in history {
            prompt.push_str(self.label(turn.role));
            prompt.push_str(": ");
            prompt.push_str(self.strip_label(turn));
            prompt.push('\n');
        }

        prompt.push('\n');
        prompt.push_str(&self.assistant_label);
        prompt.push(':');
        prompt
    }
}
