//! Conversation state: full transcript plus the bounded model context window.
//!
//! The context window is always a trailing suffix of `messages` and never
//! exceeds [`MAX_CONTEXT_MESSAGES`]. One orchestrator instance owns the state
//! for the lifetime of a conversation; persistence belongs to a collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Most recent N messages sent to the model as context.
pub const MAX_CONTEXT_MESSAGES: usize = 20;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Ai,
}

impl Role {
    /// Role string expected by the generation endpoint.
    pub fn wire_role(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Ai => "model",
        }
    }
}

/// One utterance in the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Wire shape of a single message part for the generation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePart {
    pub text: String,
}

/// Wire shape of one context message: `{role, parts:[{text}]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub parts: Vec<WirePart>,
}

impl WireMessage {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            parts: vec![WirePart { text: text.into() }],
        }
    }

    /// All part texts joined with a space (used for hashing and token counts).
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Full transcript plus the bounded context window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    pub messages: Vec<ConversationMessage>,
    pub context_window: Vec<ConversationMessage>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and advance the context window.
    pub fn add_message(&mut self, role: Role, text: impl Into<String>) -> &ConversationMessage {
        let message = ConversationMessage {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
        };
        self.messages.push(message.clone());
        self.context_window.push(message);
        let overflow = self.context_window.len().saturating_sub(MAX_CONTEXT_MESSAGES);
        if overflow > 0 {
            self.context_window.drain(..overflow);
        }
        self.messages.last().unwrap_or_else(|| unreachable!())
    }

    /// Context window rendered in the generation endpoint's wire shape.
    pub fn context_for_model(&self) -> Vec<WireMessage> {
        self.context_window
            .iter()
            .map(|msg| WireMessage::new(msg.role.wire_role(), msg.text.clone()))
            .collect()
    }

    /// Most recent user utterance, if any.
    pub fn last_user_message(&self) -> Option<&ConversationMessage> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_window_is_bounded_suffix() {
        let mut state = ConversationState::new();
        for i in 0..30 {
            let role = if i % 2 == 0 { Role::User } else { Role::Ai };
            state.add_message(role, format!("message {i}"));
        }
        assert_eq!(state.messages.len(), 30);
        assert_eq!(state.context_window.len(), MAX_CONTEXT_MESSAGES);

        let suffix = &state.messages[state.messages.len() - MAX_CONTEXT_MESSAGES..];
        for (window_msg, tail_msg) in state.context_window.iter().zip(suffix) {
            assert_eq!(window_msg.id, tail_msg.id);
        }
    }

    #[test]
    fn wire_roles_map_user_and_model() {
        let mut state = ConversationState::new();
        state.add_message(Role::User, "hello");
        state.add_message(Role::Ai, "hi there");
        let wire = state.context_for_model();
        assert_eq!(wire[0].role, "user");
        assert_eq!(wire[1].role, "model");
        assert_eq!(wire[1].parts[0].text, "hi there");
    }

    #[test]
    fn last_user_message_skips_ai_turns() {
        let mut state = ConversationState::new();
        state.add_message(Role::User, "first");
        state.add_message(Role::Ai, "reply");
        assert_eq!(state.last_user_message().unwrap().text, "first");
    }
}
