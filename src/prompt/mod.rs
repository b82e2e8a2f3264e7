//! Conversation data model and prompt rendering
//!
//! A [`Conversation`] is an ordered list of turns; each turn holds text and
//! image references in insertion order. [`render`] turns it into the Gemma
//! turn format consumed by the inference runtimes.

mod formatter;
mod image;

pub use formatter::{
    check_image_refs, render, FormatError, RenderOptions, END_OF_TURN, MODEL_TURN, START_OF_TURN,
};
pub use image::{ImageError, ImagePayload, MAX_IMAGE_PIXELS};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Speaker of a conversation turn
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

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" | "model" => Ok(Role::Assistant),
            other => Err(FormatError::MalformedRole(other.to_string())),
        }
    }
}

/// One piece of turn content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    /// Index into the request's image list
    Image(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl ConversationTurn {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::Text(text.into())],
        }
    }

    /// Text parts joined by newlines, image references skipped
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => Some(text.as_str()),
                ContentPart::Image(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn image_refs(&self) -> impl Iterator<Item = usize> + '_ {
        self.content.iter().filter_map(|part| match part {
            ContentPart::Image(index) => Some(*index),
            ContentPart::Text(_) => None,
        })
    }
}

/// Chronologically ordered turns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    pub turns: Vec<ConversationTurn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn with_turn(mut self, role: Role, text: impl Into<String>) -> Self {
        self.push(ConversationTurn::text(role, text));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn image_ref_count(&self) -> usize {
        self.turns.iter().map(|t| t.image_refs().count()).sum()
    }

    /// Remove every image reference, keeping text in order
    pub fn strip_images(&mut self) {
        for turn in &mut self.turns {
            turn.content
                .retain(|part| matches!(part, ContentPart::Text(_)));
        }
    }
}
