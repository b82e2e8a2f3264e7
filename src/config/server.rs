//! Server configuration settings

use serde::{Deserialize, Serialize};

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Enable CORS (wide open, for LAN access)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_port() -> u16 {
    8000
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_body_size() -> usize {
    // Ten max-size images, base64-inflated, plus text.
    300 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            cors_enabled: true,
            max_body_size: default_max_body_size(),
        }
    }
}

impl ServerConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Request validation caps enforced before the engine is invoked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLimits {
    /// Maximum number of messages in one chat request
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,

    /// Maximum characters per message, system prompt, or analyze prompt
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,

    /// Maximum images attached to a single message
    #[serde(default = "default_max_image_count")]
    pub max_image_count: usize,

    /// Maximum decoded size of one image in bytes
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,

    /// Maximum decoded pixels summed over every image in one request
    #[serde(default = "default_max_total_image_pixels")]
    pub max_total_image_pixels: u64,
}

fn default_max_history_messages() -> usize {
    100
}

fn default_max_text_length() -> usize {
    50_000
}

fn default_max_image_count() -> usize {
    10
}

fn default_max_image_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_max_total_image_pixels() -> u64 {
    2 * crate::prompt::MAX_IMAGE_PIXELS
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_history_messages: default_max_history_messages(),
            max_text_length: default_max_text_length(),
            max_image_count: default_max_image_count(),
            max_image_bytes: default_max_image_bytes(),
            max_total_image_pixels: default_max_total_image_pixels(),
        }
    }
}
