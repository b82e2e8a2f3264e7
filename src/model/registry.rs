//! Static catalog of servable MedGemma variants

use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};

/// Input modality of a model variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Multimodal,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Text => f.write_str("text"),
            Modality::Multimodal => f.write_str("multimodal"),
        }
    }
}

/// Immutable description of one servable model variant
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    /// CLI / API key (e.g. "4", "27", "27t")
    pub key: &'static str,
    /// Identifier handed to the inference runtime (HuggingFace repo id)
    pub backend_model_id: &'static str,
    pub display_name: &'static str,
    pub param_billions: f32,
    pub modality: Modality,
    pub min_vram_gb: u32,
    pub max_context_tokens: usize,
    pub supports_images: bool,
    pub description: &'static str,
    pub recommended_gpus: &'static [&'static str],
}

const MODELS: &[ModelDescriptor] = &[
    ModelDescriptor {
        key: "4",
        backend_model_id: "google/medgemma-1.5-4b-it",
        display_name: "MedGemma 1.5 4B",
        param_billions: 4.0,
        modality: Modality::Multimodal,
        min_vram_gb: 16,
        max_context_tokens: 8192,
        supports_images: true,
        description: "Latest MedGemma 1.5 4B multimodal model with improved support for CT, \
                      MRI, histopathology, chest X-ray, and 2D medical images. Best balance \
                      of quality and hardware accessibility.",
        recommended_gpus: &["RTX 4090", "RTX A5000", "A100", "L4"],
    },
    ModelDescriptor {
        key: "27",
        backend_model_id: "google/medgemma-27b-it",
        display_name: "MedGemma 27B Multimodal",
        param_billions: 27.0,
        modality: Modality::Multimodal,
        min_vram_gb: 32,
        max_context_tokens: 8192,
        supports_images: true,
        description: "Full 27B multimodal model. Highest quality for complex medical imaging \
                      analysis combined with clinical text reasoning. Supports EHR \
                      interpretation and longitudinal studies.",
        recommended_gpus: &["A100", "A6000", "H100"],
    },
    ModelDescriptor {
        key: "27t",
        backend_model_id: "google/medgemma-27b-text-it",
        display_name: "MedGemma 27B Text",
        param_billions: 27.0,
        modality: Modality::Text,
        min_vram_gb: 32,
        max_context_tokens: 8192,
        supports_images: false,
        description: "Text-only 27B model with the best pure clinical reasoning performance. \
                      Optimized for medical Q&A, differential diagnosis, clinical \
                      summarization, and triage without image processing overhead.",
        recommended_gpus: &["A100", "A6000", "H100"],
    },
];

/// All registered variants, in catalog order
pub fn all() -> &'static [ModelDescriptor] {
    MODELS
}

/// Look up a variant by key
pub fn lookup(key: &str) -> Result<&'static ModelDescriptor> {
    MODELS
        .iter()
        .find(|m| m.key == key)
        .ok_or_else(|| Error::UnknownModel {
            key: key.to_string(),
            valid: MODELS
                .iter()
                .map(|m| format!("-m {} ({})", m.key, m.display_name))
                .collect::<Vec<_>>()
                .join(", "),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_every_registered_key() {
        for model in all() {
            let found = lookup(model.key).unwrap();
            assert_eq!(found, model);
            assert!(!found.backend_model_id.is_empty());
            assert!(found.max_context_tokens > 0);
        }
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let a = lookup("27t").unwrap();
        let b = lookup("27t").unwrap();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn test_unknown_key() {
        let err = lookup("7").unwrap_err();
        match err {
            Error::UnknownModel { key, valid } => {
                assert_eq!(key, "7");
                assert!(valid.contains("-m 4"));
                assert!(valid.contains("-m 27t"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_images_only_on_multimodal_models() {
        for model in all() {
            assert_eq!(model.supports_images, model.modality == Modality::Multimodal);
        }
    }
}
