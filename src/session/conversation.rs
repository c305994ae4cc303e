//! Conversation history for one session.
//!
//! The history is append-only: turns are never removed or reordered. When a
//! context window is configured, only the request sent to the language model
//! is bounded (system seed plus the most recent turns); the recorded history
//! itself keeps growing for the lifetime of the session.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One role-tagged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, text: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, text: text.into() }
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    turns: Vec<Turn>,
    max_context_turns: Option<usize>,
}

impl Conversation {
    /// Start a conversation seeded with one system turn.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::system(system_prompt)],
            max_context_turns: None,
        }
    }

    /// Bound the number of non-system turns sent to the language model.
    pub fn with_context_window(mut self, max_context_turns: Option<usize>) -> Self {
        self.max_context_turns = max_context_turns;
        self
    }

    /// Full ordered history, seed included.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Turns to send with the next completion request.
    pub fn context(&self) -> Vec<Turn> {
        let Some(limit) = self.max_context_turns else {
            return self.turns.clone();
        };

        let (seed, rest) = self.turns.split_at(1);
        let mut start = rest.len().saturating_sub(limit);
        // Never open the window on an assistant reply without its question.
        while start < rest.len() && rest[start].role == Role::Assistant {
            start += 1;
        }

        seed.iter().chain(rest[start..].iter()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }
}
