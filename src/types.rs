use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::lifecycle::TransientHandle;

/// One logical request for `count` images from a single provider.
/// Immutable once accepted by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub provider_id: String,
    pub count: u32,
    #[serde(default)]
    pub options: ImageOptions,
}

impl GenerationRequest {
    pub fn new(provider_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            provider_id: provider_id.into(),
            count: 1,
            options: ImageOptions::default(),
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_options(mut self, options: ImageOptions) -> Self {
        self.options = options;
        self
    }
}

/// Canonical knob set across all providers. Which knobs are honored is
/// decided centrally against the provider's capability profile, not by the
/// presence or absence of fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImageOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

/// Exactly one payload variant at a time. `TransientRef` supersedes
/// `InlineData` once the lifecycle manager has interned the payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ImagePayload {
    RemoteUrl(String),
    InlineData { data: Bytes, mime_hint: String },
    TransientRef(TransientHandle),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageResult {
    pub payload: ImagePayload,
    pub revised_prompt: Option<String>,
}

impl ImageResult {
    pub fn remote_url(url: impl Into<String>) -> Self {
        Self {
            payload: ImagePayload::RemoteUrl(url.into()),
            revised_prompt: None,
        }
    }

    pub fn inline(data: Bytes, mime_hint: impl Into<String>) -> Self {
        Self {
            payload: ImagePayload::InlineData {
                data,
                mime_hint: mime_hint.into(),
            },
            revised_prompt: None,
        }
    }

    pub fn with_revised_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.revised_prompt = Some(prompt.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Loading,
    Success,
    Error,
    Cancelled,
}

impl GenerationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

/// The only stable handle a caller may reference. `id` is assigned once per
/// scheduler session and never reused; exactly one of `result`/`error` is
/// set once the status is terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationItem {
    pub id: u64,
    pub status: GenerationStatus,
    pub result: Option<ImageResult>,
    pub error: Option<String>,
}

impl GenerationItem {
    pub(crate) fn pending(id: u64) -> Self {
        Self {
            id,
            status: GenerationStatus::Pending,
            result: None,
            error: None,
        }
    }
}
