//! Gemma chat-template rendering

use thiserror::Error;

use super::{Conversation, Role};

pub const START_OF_TURN: &str = "<start_of_turn>";
pub const END_OF_TURN: &str = "<end_of_turn>";
/// Open block that marks the generation point
pub const MODEL_TURN: &str = "<start_of_turn>model\n";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("unsupported message role '{0}'")]
    MalformedRole(String),

    #[error("conversation has no turns")]
    EmptyConversation,

    #[error("message references image #{index} but only {available} image(s) were supplied")]
    ImageCountMismatch { index: usize, available: usize },

    #[error("chat template failed: {0}")]
    Template(String),
}

/// Backend-specific knobs for [`render`]
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions<'a> {
    /// Number of images attached to the request
    pub image_count: usize,
    /// Inline token the runtime expands into image embeddings.
    /// `None` means the backend takes no inline images and they are dropped.
    pub image_placeholder: Option<&'a str>,
}

/// Every image reference must point into the request's `image_count` images.
pub fn check_image_refs(conversation: &Conversation, image_count: usize) -> Result<(), FormatError> {
    match conversation
        .turns
        .iter()
        .flat_map(|turn| turn.image_refs())
        .find(|index| *index >= image_count)
    {
        Some(index) => Err(FormatError::ImageCountMismatch {
            index,
            available: image_count,
        }),
        None => Ok(()),
    }
}

/// Render a conversation into a single Gemma prompt string.
///
/// System turns are rendered as user blocks since Gemma has no system role.
/// All image placeholders go in one run at the start of the first user turn.
pub fn render(conversation: &Conversation, options: RenderOptions<'_>) -> Result<String, FormatError> {
    if conversation.is_empty() {
        return Err(FormatError::EmptyConversation);
    }

    let placeholders = match options.image_placeholder {
        Some(token) => {
            check_image_refs(conversation, options.image_count)?;
            token.repeat(options.image_count)
        }
        None => String::new(),
    };

    let first_user = conversation
        .turns
        .iter()
        .position(|turn| turn.role == Role::User);

    let mut blocks = Vec::with_capacity(conversation.turns.len() + 1);
    for (i, turn) in conversation.turns.iter().enumerate() {
        let role = match turn.role {
            Role::Assistant => "model",
            Role::User | Role::System => "user",
        };
        let prefix = if Some(i) == first_user {
            placeholders.as_str()
        } else {
            ""
        };
        blocks.push(format!(
            "{START_OF_TURN}{role}\n{prefix}{}{END_OF_TURN}",
            turn.joined_text()
        ));
    }
    blocks.push(MODEL_TURN.to_string());

    let rendered = blocks.join("\n");
    if first_user.is_none() && !placeholders.is_empty() {
        Ok(format!("{placeholders}{rendered}"))
    } else {
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{ContentPart, ConversationTurn};

    const IMG: &str = "<start_of_image>";

    fn system_user() -> Conversation {
        Conversation::new()
            .with_turn(Role::System, "S")
            .with_turn(Role::User, "U")
    }

    #[test]
    fn test_text_only_render() {
        let prompt = render(&system_user(), RenderOptions::default()).unwrap();
        assert_eq!(
            prompt,
            "<start_of_turn>user\nS<end_of_turn>\n\
             <start_of_turn>user\nU<end_of_turn>\n\
             <start_of_turn>model\n"
        );
        assert!(prompt.ends_with(MODEL_TURN));
        assert!(!prompt.contains(IMG));
    }

    #[test]
    fn test_two_images_precede_first_user_text() {
        let prompt = render(
            &system_user(),
            RenderOptions {
                image_count: 2,
                image_placeholder: Some(IMG),
            },
        )
        .unwrap();

        assert_eq!(prompt.matches(IMG).count(), 2);
        assert!(prompt.contains(&format!("<start_of_turn>user\n{IMG}{IMG}U<end_of_turn>")));
        // The system block stays untouched.
        assert!(prompt.starts_with("<start_of_turn>user\nS<end_of_turn>"));
    }

    #[test]
    fn test_images_dropped_without_placeholder() {
        let prompt = render(
            &system_user(),
            RenderOptions {
                image_count: 2,
                image_placeholder: None,
            },
        )
        .unwrap();
        assert_eq!(prompt, render(&system_user(), RenderOptions::default()).unwrap());
    }

    #[test]
    fn test_assistant_turns_render_as_model() {
        let conversation = Conversation::new()
            .with_turn(Role::User, "hi")
            .with_turn(Role::Assistant, "hello")
            .with_turn(Role::User, "bye");
        let prompt = render(&conversation, RenderOptions::default()).unwrap();
        let model_pos = prompt.find("<start_of_turn>model\nhello<end_of_turn>").unwrap();
        let bye_pos = prompt.find("bye").unwrap();
        assert!(model_pos < bye_pos);
    }

    #[test]
    fn test_placeholders_prepended_without_user_turn() {
        let conversation = Conversation::new().with_turn(Role::System, "S");
        let prompt = render(
            &conversation,
            RenderOptions {
                image_count: 1,
                image_placeholder: Some(IMG),
            },
        )
        .unwrap();
        assert!(prompt.starts_with(&format!("{IMG}<start_of_turn>user\nS")));
    }

    #[test]
    fn test_dangling_image_reference() {
        let mut conversation = Conversation::new();
        conversation.push(ConversationTurn {
            role: Role::User,
            content: vec![ContentPart::Image(3), ContentPart::Text("x".into())],
        });
        let err = render(
            &conversation,
            RenderOptions {
                image_count: 1,
                image_placeholder: Some(IMG),
            },
        )
        .unwrap_err();
        assert_eq!(err, FormatError::ImageCountMismatch { index: 3, available: 1 });
    }

    #[test]
    fn test_empty_conversation() {
        assert_eq!(
            render(&Conversation::new(), RenderOptions::default()),
            Err(FormatError::EmptyConversation)
        );
    }

    #[test]
    fn test_image_refs_checked_without_rendering() {
        let mut conversation = Conversation::new();
        conversation.push(ConversationTurn {
            role: Role::User,
            content: vec![ContentPart::Image(0), ContentPart::Image(1)],
        });
        assert_eq!(check_image_refs(&conversation, 2), Ok(()));
        assert_eq!(
            check_image_refs(&conversation, 0),
            Err(FormatError::ImageCountMismatch { index: 0, available: 0 })
        );
    }
}
