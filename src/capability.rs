use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::GenerationRequest;
use crate::{EaselError, Result};

/// Static description of what one provider accepts. Looked up once when a
/// request is accepted and never mutated at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityProfile {
    /// 1 means the provider has no native batching.
    pub max_batch_size: u32,
    pub prompt_limit: usize,
    pub valid_sizes: Vec<String>,
    pub default_size: String,
    pub qualities: Vec<String>,
    pub styles: Vec<String>,
    pub backgrounds: Vec<String>,
    pub output_formats: Vec<String>,
    pub supports_style: bool,
    pub supports_background: bool,
    pub supports_output_format: bool,
}

impl CapabilityProfile {
    /// Rejects a request before any item is created. This is the only fully
    /// synchronous failure path in the scheduler.
    pub fn validate(&self, request: &GenerationRequest) -> Result<()> {
        if request.count < 1 {
            return Err(EaselError::Validation("count must be at least 1".into()));
        }
        if self.max_batch_size > 1 && request.count > self.max_batch_size {
            return Err(EaselError::Validation(format!(
                "count {} exceeds provider batch size {}",
                request.count, self.max_batch_size
            )));
        }
        let prompt_chars = request.prompt.chars().count();
        if prompt_chars > self.prompt_limit {
            return Err(EaselError::Validation(format!(
                "prompt is {} characters, provider limit is {}",
                prompt_chars, self.prompt_limit
            )));
        }

        let options = &request.options;
        if let Some(size) = options.size.as_deref() {
            if !self.valid_sizes.iter().any(|s| s == size) {
                return Err(EaselError::Validation(format!(
                    "size {size:?} is not supported (valid: {})",
                    self.valid_sizes.join(", ")
                )));
            }
        }
        if let Some(quality) = options.quality.as_deref() {
            if !self.qualities.iter().any(|q| q == quality) {
                return Err(EaselError::Validation(format!(
                    "quality {quality:?} is not supported"
                )));
            }
        }
        if let Some(style) = options.style.as_deref() {
            if !self.supports_style {
                return Err(EaselError::Validation(
                    "provider does not support a style option".into(),
                ));
            }
            if !self.styles.iter().any(|s| s == style) {
                return Err(EaselError::Validation(format!(
                    "style {style:?} is not supported"
                )));
            }
        }
        if let Some(background) = options.background.as_deref() {
            if !self.supports_background {
                return Err(EaselError::Validation(
                    "provider does not support a background option".into(),
                ));
            }
            if !self.backgrounds.iter().any(|b| b == background) {
                return Err(EaselError::Validation(format!(
                    "background {background:?} is not supported"
                )));
            }
        }
        if let Some(format) = options.output_format.as_deref() {
            if !self.supports_output_format {
                return Err(EaselError::Validation(
                    "provider does not support an output format option".into(),
                ));
            }
            if !self.output_formats.iter().any(|f| f == format) {
                return Err(EaselError::Validation(format!(
                    "output format {format:?} is not supported"
                )));
            }
        }
        Ok(())
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Built-in capability table. A scheduler may extend or override entries at
/// construction time; nothing here is a process-wide global.
pub fn builtin_profiles() -> HashMap<String, CapabilityProfile> {
    let mut profiles = HashMap::new();

    profiles.insert(
        "gpt-image-1".to_string(),
        CapabilityProfile {
            max_batch_size: 10,
            prompt_limit: 32_000,
            valid_sizes: strings(&["1024x1024", "1536x1024", "1024x1536", "auto"]),
            default_size: "1024x1024".to_string(),
            qualities: strings(&["low", "medium", "high", "auto"]),
            styles: Vec::new(),
            backgrounds: strings(&["transparent", "opaque", "auto"]),
            output_formats: strings(&["png", "jpeg", "webp"]),
            supports_style: false,
            supports_background: true,
            supports_output_format: true,
        },
    );

    profiles.insert(
        "dall-e-3".to_string(),
        CapabilityProfile {
            max_batch_size: 1,
            prompt_limit: 4_000,
            valid_sizes: strings(&["1024x1024", "1792x1024", "1024x1792"]),
            default_size: "1024x1024".to_string(),
            qualities: strings(&["standard", "hd"]),
            styles: strings(&["vivid", "natural"]),
            backgrounds: Vec::new(),
            output_formats: Vec::new(),
            supports_style: true,
            supports_background: false,
            supports_output_format: false,
        },
    );

    profiles.insert(
        "gemini-image".to_string(),
        CapabilityProfile {
            max_batch_size: 1,
            prompt_limit: 8_000,
            valid_sizes: strings(&["1024x1024"]),
            default_size: "1024x1024".to_string(),
            qualities: Vec::new(),
            styles: Vec::new(),
            backgrounds: Vec::new(),
            output_formats: Vec::new(),
            supports_style: false,
            supports_background: false,
            supports_output_format: false,
        },
    );

    profiles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageOptions;

    fn profile() -> CapabilityProfile {
        builtin_profiles()
            .remove("gpt-image-1")
            .expect("builtin profile")
    }

    #[test]
    fn accepts_request_within_profile() {
        let request = GenerationRequest::new("gpt-image-1", "a cat")
            .with_count(3)
            .with_options(ImageOptions {
                size: Some("1024x1024".into()),
                quality: Some("high".into()),
                ..ImageOptions::default()
            });
        assert!(profile().validate(&request).is_ok());
    }

    #[test]
    fn rejects_count_beyond_batch_size() {
        let request = GenerationRequest::new("gpt-image-1", "a cat").with_count(11);
        let err = profile().validate(&request).expect_err("over batch size");
        assert!(matches!(err, EaselError::Validation(_)));
    }

    #[test]
    fn rejects_unknown_size_and_unsupported_style() {
        let bad_size = GenerationRequest::new("gpt-image-1", "a cat").with_options(ImageOptions {
            size: Some("640x480".into()),
            ..ImageOptions::default()
        });
        assert!(profile().validate(&bad_size).is_err());

        let style = GenerationRequest::new("gpt-image-1", "a cat").with_options(ImageOptions {
            style: Some("vivid".into()),
            ..ImageOptions::default()
        });
        assert!(profile().validate(&style).is_err());
    }

    #[test]
    fn rejects_overlong_prompt() {
        let mut profile = profile();
        profile.prompt_limit = 5;
        let request = GenerationRequest::new("gpt-image-1", "much too long");
        assert!(profile.validate(&request).is_err());
    }
}
