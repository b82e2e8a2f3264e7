//! Request bodies and boundary validation
//!
//! Everything here runs before the engine is touched: size caps, role
//! parsing, image decoding and placeholder bookkeeping.

use serde::Deserialize;

use super::error::ApiError;
use crate::config::{GenerationConfig, RequestLimits};
use crate::model::ModelDescriptor;
use crate::prompt::{ContentPart, Conversation, ConversationTurn, ImageError, ImagePayload, Role};

pub const DEFAULT_ANALYZE_PROMPT: &str = "Analyze this medical image and provide clinical findings.";

/// `POST /api/chat` body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, alias = "max_tokens")]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// Absent: the configured clinical prompt. Empty: no system turn.
    #[serde(default, alias = "system_prompt")]
    pub system_prompt: Option<String>,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
    #[serde(default, alias = "image_data")]
    pub image_data: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentItem>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text { text: String },
    Image,
}

/// Multipart fields of `POST /api/analyze`
#[derive(Debug, Default)]
pub struct AnalyzeForm {
    pub image: Option<Vec<u8>>,
    pub prompt: Option<String>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
}

/// A validated request, ready for the engine
#[derive(Debug)]
pub struct PreparedRequest {
    pub conversation: Conversation,
    pub images: Vec<ImagePayload>,
    pub params: GenerationConfig,
    pub stream: bool,
}

pub struct Validator<'a> {
    pub limits: &'a RequestLimits,
    pub defaults: &'a GenerationConfig,
    pub model: &'a ModelDescriptor,
}

impl Validator<'_> {
    pub fn chat(&self, request: ChatRequest) -> Result<PreparedRequest, ApiError> {
        let limits = self.limits;
        if request.messages.is_empty() {
            return Err(ApiError::bad_request("At least one message is required."));
        }
        if request.messages.len() > limits.max_history_messages {
            return Err(ApiError::bad_request(format!(
                "Too many messages. Maximum allowed is {}.",
                limits.max_history_messages
            )));
        }

        let mut conversation = Conversation::new();
        let system_prompt = request
            .system_prompt
            .unwrap_or_else(|| self.defaults.system_prompt.clone());
        if text_len(&system_prompt) > limits.max_text_length {
            return Err(ApiError::bad_request(format!(
                "System prompt too long. Maximum allowed is {} characters.",
                limits.max_text_length
            )));
        }
        if !system_prompt.is_empty() {
            conversation.push(ConversationTurn::text(Role::System, system_prompt));
        }

        let mut images = Vec::new();
        let mut total_pixels = 0u64;
        let mut next_image = 0;
        for message in request.messages {
            let role: Role = message
                .role
                .parse()
                .map_err(|e: crate::prompt::FormatError| ApiError::bad_request(e.to_string()))?;

            let mut parts = match message.content {
                MessageContent::Text(text) => vec![ContentItem::Text { text }],
                MessageContent::Parts(items) => items,
            };
            for item in &parts {
                if let ContentItem::Text { text } = item {
                    if text_len(text) > limits.max_text_length {
                        return Err(ApiError::bad_request(format!(
                            "Message content too long. Maximum allowed is {} characters.",
                            limits.max_text_length
                        )));
                    }
                }
            }

            if message.image_data.len() > limits.max_image_count {
                return Err(ApiError::bad_request(format!(
                    "Too many images in a single message. Maximum allowed is {}.",
                    limits.max_image_count
                )));
            }

            if !message.image_data.is_empty() {
                if self.model.supports_images {
                    for data in &message.image_data {
                        let payload = ImagePayload::from_base64(data, limits.max_image_bytes)
                            .inspect_err(|e| tracing::warn!("Rejected image: {e}"))?;
                        total_pixels += payload.pixel_count();
                        if total_pixels > limits.max_total_image_pixels {
                            return Err(ApiError::bad_request(format!(
                                "Images too large in total. Maximum is {} pixels per request.",
                                limits.max_total_image_pixels
                            )));
                        }
                        images.push(payload);
                    }
                    let present = parts
                        .iter()
                        .filter(|p| matches!(p, ContentItem::Image))
                        .count();
                    let missing = message.image_data.len().saturating_sub(present);
                    let mut with_placeholders: Vec<ContentItem> =
                        std::iter::repeat_with(|| ContentItem::Image).take(missing).collect();
                    with_placeholders.append(&mut parts);
                    parts = with_placeholders;
                } else {
                    tracing::warn!(
                        "{} does not support images; ignoring {} attached image(s)",
                        self.model.display_name,
                        message.image_data.len()
                    );
                }
            }

            conversation.push(ConversationTurn {
                role,
                content: number_images(parts, &mut next_image),
            });
        }

        Ok(PreparedRequest {
            conversation,
            images,
            params: self.params(request.max_tokens, request.temperature)?,
            stream: request.stream,
        })
    }

    pub fn analyze(&self, form: AnalyzeForm) -> Result<PreparedRequest, ApiError> {
        let limits = self.limits;
        if !self.model.supports_images {
            return Err(ApiError::bad_request(format!(
                "Model {} does not support images.",
                self.model.display_name
            )));
        }

        let prompt = form
            .prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ANALYZE_PROMPT.to_string());
        if text_len(&prompt) > limits.max_text_length {
            return Err(ApiError::bad_request(format!(
                "Prompt too long. Maximum allowed is {} characters.",
                limits.max_text_length
            )));
        }

        let bytes = form
            .image
            .ok_or_else(|| ApiError::bad_request("An image file is required."))?;
        let image = ImagePayload::from_bytes(bytes, limits.max_image_bytes).map_err(|e| match e {
            ImageError::Empty => ApiError::bad_request("Empty image file."),
            ImageError::TooLarge { max, .. } | ImageError::EncodedTooLarge { max, .. } => {
                ApiError::bad_request(format!("Image too large. Max {}MB.", max / (1024 * 1024)))
            }
            ImageError::Dimensions { width, height, .. } => {
                ApiError::bad_request(format!("Image dimensions too large ({width}x{height})."))
            }
            _ => ApiError::bad_request("Invalid image format."),
        })?;

        let mut conversation = Conversation::new();
        if !self.defaults.system_prompt.is_empty() {
            conversation.push(ConversationTurn::text(
                Role::System,
                self.defaults.system_prompt.clone(),
            ));
        }
        conversation.push(ConversationTurn {
            role: Role::User,
            content: vec![ContentPart::Image(0), ContentPart::Text(prompt)],
        });

        Ok(PreparedRequest {
            conversation,
            images: vec![image],
            params: self.params(form.max_tokens, form.temperature)?,
            stream: true,
        })
    }

    fn params(
        &self,
        max_tokens: Option<usize>,
        temperature: Option<f32>,
    ) -> Result<GenerationConfig, ApiError> {
        if max_tokens == Some(0) {
            return Err(ApiError::bad_request("maxTokens must be at least 1."));
        }
        if temperature.is_some_and(|t| !t.is_finite() || t < 0.0) {
            return Err(ApiError::bad_request("temperature must be a non-negative number."));
        }
        Ok(self.defaults.with_request(max_tokens, temperature))
    }
}

fn text_len(text: &str) -> usize {
    text.chars().count()
}

/// Convert items to content parts, numbering images from `next`
fn number_images(items: Vec<ContentItem>, next: &mut usize) -> Vec<ContentPart> {
    items
        .into_iter()
        .map(|item| match item {
            ContentItem::Text { text } => ContentPart::Text(text),
            ContentItem::Image => {
                let index = *next;
                *next += 1;
                ContentPart::Image(index)
            }
        })
        .collect()
}
