use std::sync::LazyLock;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::adapter::ImageAdapter;
use crate::capability::CapabilityProfile;
use crate::types::{GenerationRequest, ImageResult};
use crate::utils::http::{RetryPolicy, send_checked_json_with_retry};
use crate::{EaselError, Result};

static DATA_URI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"data:(image/[a-zA-Z0-9.+-]+);base64,([A-Za-z0-9+/=]+)")
        .expect("data uri pattern compiles")
});

static IMAGE_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s<>"')]+\.(?:png|jpe?g|gif|webp)(?:\?[^\s<>"')]*)?"#)
        .expect("image url pattern compiles")
});

/// Adapter for providers that return images through a chat-completions
/// endpoint. The response is unstructured; images are extracted by three
/// ordered strategies:
///
/// 1. a dedicated `message.images` list,
/// 2. data-URI or bare image-URL patterns inside free-text content,
/// 3. a structured content-block array.
///
/// Zero images across all three is a hard [`EaselError::NoImageData`]
/// failure, never an empty success.
#[derive(Clone)]
pub struct ChatImages {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    provider_id: String,
    model: String,
    retry: RetryPolicy,
}

impl ChatImages {
    pub fn new(provider_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .expect("reqwest client build should not fail");

        let provider_id = provider_id.into();
        let api_key = api_key.into();
        Self {
            http,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: (!api_key.trim().is_empty()).then_some(api_key),
            model: provider_id.clone(),
            provider_id,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn chat_completions_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key.as_deref() {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    images: Option<Vec<Value>>,
}

/// Turns a URL-shaped string into a result: data URIs are stripped of their
/// prefix and decoded to inline bytes, anything else is kept as a remote
/// reference. Malformed base64 is skipped, not fatal; the caller decides
/// whether the overall scan found anything.
fn image_from_url_str(url: &str) -> Option<ImageResult> {
    if url.starts_with("data:") {
        let captures = DATA_URI_RE.captures(url)?;
        return decode_inline(&captures[1], &captures[2]);
    }
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(ImageResult::remote_url(trimmed))
}

fn decode_inline(mime: &str, data: &str) -> Option<ImageResult> {
    match BASE64.decode(data) {
        Ok(decoded) => Some(ImageResult::inline(Bytes::from(decoded), mime)),
        Err(err) => {
            tracing::warn!(%mime, error = %err, "skipping undecodable base64 image payload");
            None
        }
    }
}

/// Strategy 1: the dedicated image list on the response message.
fn images_from_list(entries: &[Value]) -> Vec<ImageResult> {
    let mut out = Vec::new();
    for entry in entries {
        match entry {
            Value::String(url) => out.extend(image_from_url_str(url)),
            Value::Object(obj) => {
                if let Some(url) = obj
                    .get("image_url")
                    .and_then(|v| v.get("url"))
                    .and_then(Value::as_str)
                {
                    out.extend(image_from_url_str(url));
                } else if let Some(url) = obj.get("url").and_then(Value::as_str) {
                    out.extend(image_from_url_str(url));
                } else if let Some(data) = obj.get("b64_json").and_then(Value::as_str) {
                    out.extend(decode_inline("image/png", data));
                }
            }
            _ => {}
        }
    }
    out
}

/// Strategy 2: data URIs first, then bare image URLs, scanned out of
/// free-form text.
fn images_from_text(text: &str) -> Vec<ImageResult> {
    let mut out = Vec::new();
    for captures in DATA_URI_RE.captures_iter(text) {
        out.extend(decode_inline(&captures[1], &captures[2]));
    }
    for found in IMAGE_URL_RE.find_iter(text) {
        out.push(ImageResult::remote_url(found.as_str()));
    }
    out
}

/// Strategy 3: structured content blocks (`image_url`, `image`, or
/// camel/snake-case `inline_data` shapes).
fn images_from_blocks(blocks: &[Value]) -> Vec<ImageResult> {
    let mut out = Vec::new();
    for block in blocks {
        let Some(obj) = block.as_object() else {
            continue;
        };
        if let Some(url) = obj
            .get("image_url")
            .and_then(|v| v.get("url"))
            .and_then(Value::as_str)
        {
            out.extend(image_from_url_str(url));
            continue;
        }
        if let Some(image) = obj.get("image").and_then(Value::as_object) {
            if let Some(url) = image.get("url").and_then(Value::as_str) {
                out.extend(image_from_url_str(url));
            } else if let Some(data) = image.get("b64_json").and_then(Value::as_str) {
                out.extend(decode_inline("image/png", data));
            }
            continue;
        }
        if let Some(inline) = inline_data_block(obj) {
            out.push(inline);
        }
    }
    out
}

fn inline_data_block(obj: &Map<String, Value>) -> Option<ImageResult> {
    let inline = obj
        .get("inline_data")
        .or_else(|| obj.get("inlineData"))
        .and_then(Value::as_object)?;
    let mime = inline
        .get("mime_type")
        .or_else(|| inline.get("mimeType"))
        .and_then(Value::as_str)
        .unwrap_or("image/png");
    let data = inline.get("data").and_then(Value::as_str)?;
    decode_inline(mime, data)
}

fn extract_images(parsed: &ChatCompletionsResponse) -> Vec<ImageResult> {
    let mut out = Vec::new();
    for choice in &parsed.choices {
        let Some(message) = choice.message.as_ref() else {
            continue;
        };
        if let Some(entries) = message.images.as_deref() {
            out.extend(images_from_list(entries));
        }
        match message.content.as_ref() {
            Some(Value::String(text)) => out.extend(images_from_text(text)),
            Some(Value::Array(blocks)) => out.extend(images_from_blocks(blocks)),
            _ => {}
        }
    }
    out
}

#[async_trait]
impl ImageAdapter for ChatImages {
    fn provider(&self) -> &str {
        self.provider_id.as_str()
    }

    async fn invoke(
        &self,
        request: &GenerationRequest,
        _profile: &CapabilityProfile,
        _count: u32,
    ) -> Result<Vec<ImageResult>> {
        // One conversational turn requesting image-capable output; chat
        // providers have no native batching, so `count` is always 1 here.
        let mut body = Map::<String, Value>::new();
        body.insert("model".to_string(), Value::String(self.model.clone()));
        body.insert(
            "messages".to_string(),
            serde_json::json!([{ "role": "user", "content": request.prompt }]),
        );
        body.insert(
            "modalities".to_string(),
            serde_json::json!(["image", "text"]),
        );

        let req = self
            .apply_auth(self.http.post(self.chat_completions_url()))
            .json(&body);
        let parsed: ChatCompletionsResponse =
            send_checked_json_with_retry(req, &self.retry).await?;

        let images = extract_images(&parsed);
        if images.is_empty() {
            return Err(EaselError::NoImageData);
        }
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use httpmock::{Method::POST, MockServer};

    use super::*;
    use crate::capability::builtin_profiles;
    use crate::types::ImagePayload;

    fn profile() -> CapabilityProfile {
        builtin_profiles()
            .remove("gemini-image")
            .expect("builtin profile")
    }

    #[test]
    fn text_scan_strips_data_uri_prefix() {
        let images = images_from_text("here you go: data:image/png;base64,AQID done");
        assert_eq!(images.len(), 1);
        match &images[0].payload {
            ImagePayload::InlineData { data, mime_hint } => {
                assert_eq!(data.as_ref(), &[1, 2, 3]);
                assert_eq!(mime_hint, "image/png");
            }
            other => panic!("expected inline data, got {other:?}"),
        }
    }

    #[test]
    fn text_scan_finds_bare_image_urls() {
        let images =
            images_from_text("rendered at https://cdn.example/out/7.png?sig=abc (see above)");
        assert_eq!(images.len(), 1);
        assert_eq!(
            images[0].payload,
            ImagePayload::RemoteUrl("https://cdn.example/out/7.png?sig=abc".to_string())
        );
    }

    #[test]
    fn block_scan_handles_inline_data_shapes() {
        let blocks = vec![
            serde_json::json!({ "type": "text", "text": "sure" }),
            serde_json::json!({ "inlineData": { "mimeType": "image/webp", "data": "AQID" } }),
            serde_json::json!({ "type": "image_url", "image_url": { "url": "https://img.example/a.png" } }),
        ];
        let images = images_from_blocks(&blocks);
        assert_eq!(images.len(), 2);
        assert!(matches!(
            &images[0].payload,
            ImagePayload::InlineData { mime_hint, .. } if mime_hint == "image/webp"
        ));
        assert!(matches!(&images[1].payload, ImagePayload::RemoteUrl(_)));
    }

    #[tokio::test]
    async fn dedicated_image_list_takes_priority_order() -> Result<()> {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .body_includes("\"model\":\"gemini-image\"")
                    .body_includes("\"modalities\":[\"image\",\"text\"]");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(
                        serde_json::json!({
                            "choices": [{
                                "message": {
                                    "content": "also inline: data:image/png;base64,AQID",
                                    "images": [
                                        { "type": "image_url", "image_url": { "url": "https://img.example/first.png" } }
                                    ]
                                }
                            }]
                        })
                        .to_string(),
                    );
            })
            .await;

        let adapter = ChatImages::new("gemini-image", "").with_base_url(server.url("/v1"));
        let request = GenerationRequest::new("gemini-image", "a cat");
        let images = adapter.invoke(&request, &profile(), 1).await?;

        mock.assert_async().await;
        assert_eq!(images.len(), 2);
        // The dedicated list is scanned before free-text content.
        assert_eq!(
            images[0].payload,
            ImagePayload::RemoteUrl("https://img.example/first.png".to_string())
        );
        assert!(matches!(&images[1].payload, ImagePayload::InlineData { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn response_without_any_image_is_no_image_data() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(
                        serde_json::json!({
                            "choices": [{
                                "message": {
                                    "content": [
                                        { "type": "text", "text": "I cannot draw that." }
                                    ]
                                }
                            }]
                        })
                        .to_string(),
                    );
            })
            .await;

        let adapter = ChatImages::new("gemini-image", "").with_base_url(server.url("/v1"));
        let request = GenerationRequest::new("gemini-image", "a cat");
        let err = adapter
            .invoke(&request, &profile(), 1)
            .await
            .expect_err("no image anywhere");
        assert!(matches!(err, EaselError::NoImageData));
    }
}
